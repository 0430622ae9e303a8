use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use hemo_proto::GeoPoint;

use crate::geo::haversine_m;

/// Circular exclusion zone. Read-only once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoFlyZone {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub radius_m: f64,
}

impl NoFlyZone {
    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }

    pub fn contains(&self, p: GeoPoint) -> bool {
        haversine_m(self.lat, self.lon, p.lat, p.lon) <= self.radius_m
    }
}

/// Every zone whose radius reaches `point` (boundary inclusive).
pub fn violating_zones<'a>(point: GeoPoint, zones: &'a [NoFlyZone]) -> Vec<&'a NoFlyZone> {
    zones.iter().filter(|z| z.contains(point)).collect()
}

// Zone file entries carry the radius in kilometres.
#[derive(Debug, Deserialize)]
struct ZoneFileEntry {
    name: String,
    lat: f64,
    lon: f64,
    radius: f64,
}

/// Load a JSON array of `{name, lat, lon, radius}` (radius in km).
pub fn load_zone_file(path: impl AsRef<Path>) -> Result<Vec<NoFlyZone>> {
    let path = path.as_ref();
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read no-fly zone file {}", path.display()))?;
    let entries: Vec<ZoneFileEntry> = serde_json::from_str(&s)
        .with_context(|| format!("parse no-fly zone file {}", path.display()))?;
    let zones: Vec<NoFlyZone> = entries
        .into_iter()
        .map(|e| NoFlyZone { name: e.name, lat: e.lat, lon: e.lon, radius_m: e.radius * 1000.0 })
        .collect();
    info!("loaded {} no-fly zones from {}", zones.len(), path.display());
    Ok(zones)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{destination_point, distance_m};
    use std::io::Write;

    fn zone(name: &str, lat: f64, lon: f64, radius_m: f64) -> NoFlyZone {
        NoFlyZone { name: name.into(), lat, lon, radius_m }
    }

    #[test]
    fn point_inside_radius_is_reported() {
        let zones = vec![zone("airport", 0.0, 1.0, 2_000.0)];
        for (bearing, dist) in [(0.0, 0.0), (90.0, 500.0), (200.0, 1_999.0)] {
            let p = destination_point(zones[0].center(), bearing, dist);
            let hits = violating_zones(p, &zones);
            assert_eq!(hits.len(), 1, "bearing {} dist {}", bearing, dist);
            assert_eq!(hits[0].name, "airport");
        }
    }

    #[test]
    fn point_outside_every_zone_is_clear() {
        let zones = vec![zone("a", 0.0, 0.0, 1_000.0), zone("b", 0.5, 0.5, 300.0)];
        let p = destination_point(GeoPoint::new(0.0, 0.0), 10.0, 1_001.0);
        assert!(violating_zones(p, &zones).is_empty());
        assert!(violating_zones(GeoPoint::new(10.0, 10.0), &zones).is_empty());
    }

    #[test]
    fn boundary_counts_as_violation() {
        let center = GeoPoint::new(51.5, -0.12);
        let p = destination_point(center, 33.0, 750.0);
        let exact = distance_m(center, p);
        let zones = vec![zone("edge", center.lat, center.lon, exact)];
        assert_eq!(violating_zones(p, &zones).len(), 1);
    }

    #[test]
    fn overlapping_zones_all_reported_and_input_untouched() {
        let zones = vec![
            zone("outer", 0.0, 0.0, 5_000.0),
            zone("inner", 0.0, 0.0, 1_000.0),
            zone("far", 3.0, 3.0, 1_000.0),
        ];
        let before = zones.clone();
        let names: Vec<_> = violating_zones(GeoPoint::new(0.0, 0.001), &zones)
            .into_iter()
            .map(|z| z.name.as_str())
            .collect();
        assert_eq!(names, vec!["outer", "inner"]);
        assert_eq!(zones, before);
    }

    #[test]
    fn empty_zone_list_never_violates() {
        assert!(violating_zones(GeoPoint::new(0.0, 0.0), &[]).is_empty());
    }

    #[test]
    fn zone_file_radius_is_km() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"[{{"name":"stadium","lat":40.0,"lon":-74.0,"radius":1.5}}]"#).unwrap();
        let zones = load_zone_file(f.path()).unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].radius_m, 1_500.0);
    }

    #[test]
    fn malformed_zone_file_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"[{{"name":"x","lat":"north"}}]"#).unwrap();
        assert!(load_zone_file(f.path()).is_err());
    }
}

use anyhow::Result;
use std::collections::HashSet;

use hemo_proto::GeoPoint;

use crate::geofence::NoFlyZone;
use crate::safety::SafetyLimits;

pub fn check_safety_limits(l: &SafetyLimits) -> Result<()> {
    anyhow::ensure!(
        l.abort_battery > 0.0 && l.abort_battery < 1.0,
        "safety.abort_battery must be within (0, 1)"
    );
    anyhow::ensure!(
        l.reserve_per_km >= 0.0 && l.reserve_per_km < 1.0,
        "safety.reserve_per_km must be within [0, 1)"
    );
    anyhow::ensure!(l.min_satellites >= 4, "safety.min_satellites too low");
    if let Some(w) = l.max_wind_kmh {
        anyhow::ensure!(w.is_finite() && w > 0.0, "safety.max_wind_kmh must be > 0");
    }
    if let Some(v) = l.min_visibility_m {
        anyhow::ensure!(v.is_finite() && v >= 0.0, "safety.min_visibility_m must be >= 0");
    }
    Ok(())
}

pub fn check_home(home: GeoPoint) -> Result<()> {
    anyhow::ensure!(home.is_valid(), "home coordinates invalid: {}", home);
    Ok(())
}

/// A malformed zone list fails startup.
pub fn check_zones(zones: &[NoFlyZone]) -> Result<()> {
    let mut names = HashSet::new();
    for z in zones {
        anyhow::ensure!(!z.name.trim().is_empty(), "no-fly zone with empty name");
        anyhow::ensure!(names.insert(z.name.as_str()), "duplicate no-fly zone name '{}'", z.name);
        anyhow::ensure!(z.center().is_valid(), "no-fly zone '{}' has invalid center", z.name);
        anyhow::ensure!(
            z.radius_m.is_finite() && z.radius_m > 0.0,
            "no-fly zone '{}' radius must be > 0 (got {})",
            z.name,
            z.radius_m
        );
    }
    Ok(())
}

pub fn check_altitudes(default_alt_m: f32, min_alt_m: f32, max_alt_m: f32) -> Result<()> {
    anyhow::ensure!(min_alt_m > 0.0 && min_alt_m < max_alt_m, "mission altitude bounds invalid");
    anyhow::ensure!(
        default_alt_m >= min_alt_m && default_alt_m <= max_alt_m,
        "mission.cruise_alt_m {} outside [{}, {}]",
        default_alt_m,
        min_alt_m,
        max_alt_m
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(name: &str, radius_m: f64) -> NoFlyZone {
        NoFlyZone { name: name.into(), lat: 1.0, lon: 2.0, radius_m }
    }

    #[test]
    fn good_zone_list_passes() {
        assert!(check_zones(&[zone("a", 10.0), zone("b", 2_000.0)]).is_ok());
        assert!(check_zones(&[]).is_ok());
    }

    #[test]
    fn malformed_zones_fail() {
        assert!(check_zones(&[zone("a", 0.0)]).is_err());
        assert!(check_zones(&[zone("a", f64::NAN)]).is_err());
        assert!(check_zones(&[zone(" ", 5.0)]).is_err());
        assert!(check_zones(&[zone("a", 5.0), zone("a", 6.0)]).is_err());
        let mut z = zone("bad", 5.0);
        z.lat = 91.0;
        assert!(check_zones(&[z]).is_err());
    }

    #[test]
    fn zones_parse_from_toml_table_array() {
        #[derive(serde::Deserialize)]
        struct Doc {
            no_fly_zones: Vec<NoFlyZone>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[no_fly_zones]]
            name = "heliport"
            lat = 40.1
            lon = -74.2
            radius_m = 800.0
            "#,
        )
        .unwrap();
        assert!(check_zones(&doc.no_fly_zones).is_ok());
        assert_eq!(doc.no_fly_zones[0].name, "heliport");
    }

    #[test]
    fn limits_and_altitudes() {
        assert!(check_safety_limits(&SafetyLimits::default()).is_ok());
        let bad = SafetyLimits { abort_battery: 1.2, ..SafetyLimits::default() };
        assert!(check_safety_limits(&bad).is_err());
        let calm_only = SafetyLimits { max_wind_kmh: Some(0.0), ..SafetyLimits::default() };
        assert!(check_safety_limits(&calm_only).is_err());
        let gated = SafetyLimits {
            max_wind_kmh: Some(25.0),
            min_visibility_m: Some(5_000.0),
            ..SafetyLimits::default()
        };
        assert!(check_safety_limits(&gated).is_ok());
        assert!(check_altitudes(50.0, 30.0, 120.0).is_ok());
        assert!(check_altitudes(20.0, 30.0, 120.0).is_err());
        assert!(check_home(GeoPoint::new(0.0, 200.0)).is_err());
    }
}

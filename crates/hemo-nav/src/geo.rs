use hemo_proto::GeoPoint;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

pub fn distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    haversine_m(a.lat, a.lon, b.lat, b.lon)
}

/// Sum of great-circle legs along `points`.
pub fn path_length_m(points: &[GeoPoint]) -> f64 {
    points.windows(2).map(|w| distance_m(w[0], w[1])).sum()
}

/// Point reached by travelling `distance_m` from `origin` on `bearing_deg` (0 = north).
pub fn destination_point(origin: GeoPoint, bearing_deg: f64, distance_m: f64) -> GeoPoint {
    let d = distance_m / EARTH_RADIUS_M;
    let brg = bearing_deg.to_radians();
    let lat1 = origin.lat.to_radians();
    let lon1 = origin.lon.to_radians();
    let lat2 = (lat1.sin() * d.cos() + lat1.cos() * d.sin() * brg.cos()).asin();
    let lon2 = lon1 + (brg.sin() * d.sin() * lat1.cos()).atan2(d.cos() - lat1.sin() * lat2.sin());
    GeoPoint::new(lat2.to_degrees(), lon2.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_degree_of_longitude_on_equator() {
        let d = distance_m(GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 1.0));
        assert!((d - 111_195.0).abs() < 1.0, "got {}", d);
    }

    #[test]
    fn zero_distance() {
        let p = GeoPoint::new(39.9042, 116.4074);
        assert_eq!(distance_m(p, p), 0.0);
    }

    #[test]
    fn destination_point_round_trips_distance() {
        let origin = GeoPoint::new(40.7128, -74.0060);
        let p = destination_point(origin, 45.0, 2_500.0);
        assert!((distance_m(origin, p) - 2_500.0).abs() < 0.01);
    }

    #[test]
    fn path_length_sums_legs() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 1.0);
        let total = path_length_m(&[a, b, a]);
        assert!((total - 2.0 * distance_m(a, b)).abs() < 1e-6);
        assert_eq!(path_length_m(&[a]), 0.0);
    }
}

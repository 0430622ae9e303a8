use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use hemo_proto::mission::{SafetyReason, WeatherReport};
use hemo_proto::vehicle::{FixType, LinkState, VehicleTelemetry};
use hemo_proto::GeoPoint;

use crate::geo::{distance_m, path_length_m};
use crate::geofence::{violating_zones, NoFlyZone};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SafetyConfig {
    /// Abort when battery fraction is not above this plus the RTL reserve. Default 0.20.
    pub abort_battery: Option<f32>,
    /// Battery fraction needed per km of flight back home. Default 0.02.
    pub reserve_per_km: Option<f32>,
    /// Minimum acceptable fix. Default 3D.
    pub min_fix: Option<FixType>,
    /// Default 6.
    pub min_satellites: Option<u8>,
    /// Safety polling cadence while a mission is active. Default 1000 ms.
    pub poll_interval_ms: Option<u64>,
    /// Pre-flight weather gate. Unset disables the check; once set, a request
    /// without a weather report is refused.
    pub max_wind_kmh: Option<f32>,
    pub min_visibility_m: Option<f32>,
}

impl SafetyConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms.unwrap_or(1_000).max(50))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyLimits {
    pub abort_battery: f32,
    pub reserve_per_km: f32,
    pub min_fix: FixType,
    pub min_satellites: u8,
    pub max_wind_kmh: Option<f32>,
    pub min_visibility_m: Option<f32>,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            abort_battery: 0.20,
            reserve_per_km: 0.02,
            min_fix: FixType::Fix3d,
            min_satellites: 6,
            max_wind_kmh: None,
            min_visibility_m: None,
        }
    }
}

impl From<&SafetyConfig> for SafetyLimits {
    fn from(c: &SafetyConfig) -> Self {
        let d = SafetyLimits::default();
        Self {
            abort_battery: c.abort_battery.unwrap_or(d.abort_battery),
            reserve_per_km: c.reserve_per_km.unwrap_or(d.reserve_per_km),
            min_fix: c.min_fix.unwrap_or(d.min_fix),
            min_satellites: c.min_satellites.unwrap_or(d.min_satellites),
            max_wind_kmh: c.max_wind_kmh,
            min_visibility_m: c.min_visibility_m,
        }
    }
}

/// Everything one evaluation looks at. Built fresh for every evaluation.
#[derive(Debug, Clone, Copy)]
pub struct SafetyInput<'a> {
    pub link: LinkState,
    /// Heartbeat received within the link timeout.
    pub heartbeat_fresh: bool,
    pub telemetry: &'a VehicleTelemetry,
    pub next_waypoint: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SafetyVerdict {
    pub admit: bool,
    pub reasons: BTreeSet<SafetyReason>,
    pub details: Vec<String>,
    pub zones: Vec<String>,
}

impl SafetyVerdict {
    fn new() -> Self {
        Self { admit: true, ..Default::default() }
    }

    fn fail(&mut self, reason: SafetyReason, detail: String) {
        self.admit = false;
        self.reasons.insert(reason);
        self.details.push(detail);
    }

    /// Same decision and same reason set; details may differ.
    pub fn same_decision(&self, other: &SafetyVerdict) -> bool {
        self.admit == other.admit && self.reasons == other.reasons
    }

    pub fn summary(&self) -> String {
        if self.admit {
            "admit".to_string()
        } else {
            self.details.join("; ")
        }
    }
}

/// Turns link health, telemetry and the geofence into one admit/abort decision.
#[derive(Debug, Clone)]
pub struct SafetyMonitor {
    limits: SafetyLimits,
    zones: Arc<[NoFlyZone]>,
    home: GeoPoint,
}

impl SafetyMonitor {
    pub fn new(limits: SafetyLimits, zones: Vec<NoFlyZone>, home: GeoPoint) -> Self {
        Self { limits, zones: zones.into(), home }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    pub fn zones(&self) -> &[NoFlyZone] {
        &self.zones
    }

    pub fn home(&self) -> GeoPoint {
        self.home
    }

    /// In-flight evaluation: all four checks, every failure collected.
    pub fn evaluate(&self, input: &SafetyInput<'_>) -> SafetyVerdict {
        let mut v = SafetyVerdict::new();
        self.check_link(input, &mut v);

        let t = input.telemetry;
        match t.position {
            Some(pos) => {
                let reserve_km = distance_m(pos, self.home) / 1000.0;
                self.check_battery(t.battery, reserve_km, &mut v);
            }
            None => {
                v.fail(SafetyReason::BatteryMargin, "battery reserve unknown: no position".into())
            }
        }

        self.check_gps(t, &mut v);

        let mut points = Vec::with_capacity(2);
        if let Some(p) = t.position {
            points.push(("position", p));
        }
        if let Some(wp) = input.next_waypoint {
            points.push(("next waypoint", wp));
        }
        self.check_geofence(&points, &mut v);
        v
    }

    /// Pre-flight evaluation for a mission visiting `route` in order.
    ///
    /// Battery must cover the whole trip from the current position through the route
    /// and back home, and every route point is checked against the geofence. With
    /// weather limits configured the request's report must be inside them.
    pub fn preflight(
        &self,
        input: &SafetyInput<'_>,
        route: &[GeoPoint],
        weather: Option<&WeatherReport>,
    ) -> SafetyVerdict {
        let mut v = SafetyVerdict::new();
        self.check_link(input, &mut v);

        let t = input.telemetry;
        let start = t.position.unwrap_or(self.home);
        let mut trip = Vec::with_capacity(route.len() + 2);
        trip.push(start);
        trip.extend_from_slice(route);
        trip.push(self.home);
        let trip_km = path_length_m(&trip) / 1000.0;
        self.check_battery(t.battery, trip_km, &mut v);

        self.check_gps(t, &mut v);

        let mut points: Vec<(&str, GeoPoint)> = Vec::with_capacity(route.len() + 1);
        if let Some(p) = t.position {
            points.push(("position", p));
        }
        points.extend(route.iter().map(|p| ("waypoint", *p)));
        self.check_geofence(&points, &mut v);
        self.check_weather(weather, &mut v);
        v
    }

    fn check_link(&self, input: &SafetyInput<'_>, v: &mut SafetyVerdict) {
        if input.link != LinkState::Connected {
            v.fail(SafetyReason::LinkHealth, format!("link {}", input.link));
        } else if !input.heartbeat_fresh {
            v.fail(SafetyReason::LinkHealth, "heartbeat stale".into());
        }
    }

    fn check_battery(&self, battery: Option<f32>, km: f64, v: &mut SafetyVerdict) {
        let reserve = (km as f32) * self.limits.reserve_per_km;
        let required = self.limits.abort_battery + reserve;
        match battery {
            Some(b) if b > required => {}
            Some(b) => v.fail(
                SafetyReason::BatteryMargin,
                format!(
                    "battery {:.0}% <= {:.0}% threshold + {:.0}% reserve",
                    b * 100.0,
                    self.limits.abort_battery * 100.0,
                    reserve * 100.0
                ),
            ),
            None => v.fail(SafetyReason::BatteryMargin, "battery unknown".into()),
        }
    }

    fn check_gps(&self, t: &VehicleTelemetry, v: &mut SafetyVerdict) {
        let l = &self.limits;
        match t.gps {
            Some(fix) if fix.fix_type >= l.min_fix && fix.satellites >= l.min_satellites => {}
            Some(fix) => v.fail(
                SafetyReason::GpsQuality,
                format!(
                    "gps {:?} with {} sats (need {:?}, {})",
                    fix.fix_type, fix.satellites, l.min_fix, l.min_satellites
                ),
            ),
            None => v.fail(SafetyReason::GpsQuality, "gps fix unknown".into()),
        }
        if t.position.is_none() {
            v.fail(SafetyReason::GpsQuality, "position unknown".into());
        }
    }

    fn check_weather(&self, weather: Option<&WeatherReport>, v: &mut SafetyVerdict) {
        let (max_wind, min_vis) = (self.limits.max_wind_kmh, self.limits.min_visibility_m);
        if max_wind.is_none() && min_vis.is_none() {
            return;
        }
        let Some(w) = weather else {
            v.fail(SafetyReason::Weather, "weather unknown".into());
            return;
        };
        if let Some(max) = max_wind {
            if !w.wind_kmh.is_finite() || w.wind_kmh > max {
                let msg = format!("wind {} km/h above {} km/h", w.wind_kmh, max);
                v.fail(SafetyReason::Weather, msg);
            }
        }
        if let Some(min) = min_vis {
            if !w.visibility_m.is_finite() || w.visibility_m < min {
                let msg = format!("visibility {} m below {} m", w.visibility_m, min);
                v.fail(SafetyReason::Weather, msg);
            }
        }
    }

    fn check_geofence(&self, points: &[(&str, GeoPoint)], v: &mut SafetyVerdict) {
        for (what, p) in points {
            for z in violating_zones(*p, &self.zones) {
                let msg = format!("{} {} inside no-fly zone '{}'", what, p, z.name);
                v.fail(SafetyReason::Geofence, msg);
                if !v.zones.contains(&z.name) {
                    v.zones.push(z.name.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::destination_point;
    use hemo_proto::vehicle::GpsFix;

    fn nominal(pos: GeoPoint, battery: f32) -> VehicleTelemetry {
        VehicleTelemetry {
            position: Some(pos),
            relative_alt_m: Some(0.0),
            battery: Some(battery),
            gps: Some(GpsFix { fix_type: FixType::Fix3d, satellites: 12 }),
            ..Default::default()
        }
    }

    fn input(t: &VehicleTelemetry) -> SafetyInput<'_> {
        SafetyInput {
            link: LinkState::Connected,
            heartbeat_fresh: true,
            telemetry: t,
            next_waypoint: None,
        }
    }

    #[test]
    fn nominal_is_admitted() {
        let home = GeoPoint::new(0.0, 0.0);
        let m = SafetyMonitor::new(SafetyLimits::default(), vec![], home);
        let t = nominal(home, 0.9);
        let v = m.evaluate(&input(&t));
        assert!(v.admit, "{}", v.summary());
        assert!(v.reasons.is_empty());
    }

    #[test]
    fn battery_must_exceed_threshold_plus_rtl_reserve() {
        let home = GeoPoint::new(0.0, 0.0);
        let m = SafetyMonitor::new(SafetyLimits::default(), vec![], home);
        // 4 km out at 2 %/km -> 8 % reserve, 28 % required.
        let t = nominal(destination_point(home, 90.0, 4_000.0), 0.25);
        let v = m.evaluate(&input(&t));
        assert!(!v.admit);
        assert_eq!(v.reasons, BTreeSet::from([SafetyReason::BatteryMargin]));

        let t = nominal(destination_point(home, 90.0, 4_000.0), 0.30);
        assert!(m.evaluate(&input(&t)).admit);
    }

    #[test]
    fn battery_exactly_at_threshold_fails() {
        let home = GeoPoint::new(0.0, 0.0);
        let m = SafetyMonitor::new(SafetyLimits::default(), vec![], home);
        let t = nominal(home, 0.20);
        assert!(m.evaluate(&input(&t)).reasons.contains(&SafetyReason::BatteryMargin));
    }

    #[test]
    fn every_failing_check_is_collected() {
        let home = GeoPoint::new(0.0, 0.0);
        let zones = vec![NoFlyZone { name: "base".into(), lat: 0.0, lon: 0.0, radius_m: 100.0 }];
        let m = SafetyMonitor::new(SafetyLimits::default(), zones, home);
        let mut t = nominal(home, 0.1);
        t.gps = Some(GpsFix { fix_type: FixType::Fix2d, satellites: 3 });
        let v = m.evaluate(&SafetyInput {
            link: LinkState::Lost,
            heartbeat_fresh: false,
            telemetry: &t,
            next_waypoint: None,
        });
        assert!(!v.admit);
        assert_eq!(
            v.reasons,
            BTreeSet::from([
                SafetyReason::LinkHealth,
                SafetyReason::BatteryMargin,
                SafetyReason::GpsQuality,
                SafetyReason::Geofence,
            ])
        );
        assert_eq!(v.zones, vec!["base".to_string()]);
    }

    #[test]
    fn unknown_telemetry_is_unsafe() {
        let m = SafetyMonitor::new(SafetyLimits::default(), vec![], GeoPoint::new(0.0, 0.0));
        let t = VehicleTelemetry::default();
        let v = m.evaluate(&input(&t));
        assert!(v.reasons.contains(&SafetyReason::BatteryMargin));
        assert!(v.reasons.contains(&SafetyReason::GpsQuality));
    }

    #[test]
    fn stale_heartbeat_fails_link_health() {
        let home = GeoPoint::new(0.0, 0.0);
        let m = SafetyMonitor::new(SafetyLimits::default(), vec![], home);
        let t = nominal(home, 0.9);
        let mut i = input(&t);
        i.heartbeat_fresh = false;
        assert_eq!(m.evaluate(&i).reasons, BTreeSet::from([SafetyReason::LinkHealth]));
    }

    #[test]
    fn next_waypoint_inside_zone_is_vetoed() {
        let home = GeoPoint::new(0.0, 0.0);
        let zones = vec![NoFlyZone { name: "prison".into(), lat: 0.0, lon: 0.5, radius_m: 500.0 }];
        let m = SafetyMonitor::new(SafetyLimits::default(), zones, home);
        let t = nominal(home, 0.9);
        let mut i = input(&t);
        i.next_waypoint = Some(GeoPoint::new(0.0, 0.5));
        let v = m.evaluate(&i);
        assert_eq!(v.reasons, BTreeSet::from([SafetyReason::Geofence]));
    }

    #[test]
    fn preflight_checks_destination_against_zones() {
        let limits = SafetyLimits { reserve_per_km: 0.0, ..SafetyLimits::default() };
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 1.0);
        let zones = vec![NoFlyZone {
            name: "b-zone".into(),
            lat: b.lat,
            lon: b.lon,
            radius_m: 2_000.0,
        }];
        let m = SafetyMonitor::new(limits, zones, a);
        let t = nominal(a, 0.9);
        let v = m.preflight(&input(&t), &[a, b], None);
        assert!(!v.admit);
        assert_eq!(v.reasons, BTreeSet::from([SafetyReason::Geofence]));
        assert_eq!(v.zones, vec!["b-zone".to_string()]);
    }

    #[test]
    fn preflight_battery_covers_whole_route() {
        let home = GeoPoint::new(0.0, 0.0);
        let m = SafetyMonitor::new(SafetyLimits::default(), vec![], home);
        let src = destination_point(home, 0.0, 5_000.0);
        let dst = destination_point(home, 90.0, 5_000.0);
        // ~17 km round trip -> ~34 % reserve + 20 %.
        let t = nominal(home, 0.5);
        let v = m.preflight(&input(&t), &[src, dst], None);
        assert_eq!(v.reasons, BTreeSet::from([SafetyReason::BatteryMargin]));
        let t = nominal(home, 0.6);
        assert!(m.preflight(&input(&t), &[src, dst], None).admit);
    }

    #[test]
    fn weather_gate_is_off_by_default() {
        let home = GeoPoint::new(0.0, 0.0);
        let m = SafetyMonitor::new(SafetyLimits::default(), vec![], home);
        let t = nominal(home, 0.9);
        let storm = WeatherReport { wind_kmh: 80.0, visibility_m: 100.0 };
        assert!(m.preflight(&input(&t), &[home], Some(&storm)).admit);
        assert!(m.preflight(&input(&t), &[home], None).admit);
    }

    #[test]
    fn preflight_rejects_wind_and_poor_visibility() {
        let home = GeoPoint::new(0.0, 0.0);
        let limits = SafetyLimits {
            max_wind_kmh: Some(25.0),
            min_visibility_m: Some(5_000.0),
            ..SafetyLimits::default()
        };
        let m = SafetyMonitor::new(limits, vec![], home);
        let t = nominal(home, 0.9);

        let calm = WeatherReport { wind_kmh: 25.0, visibility_m: 5_000.0 };
        assert!(m.preflight(&input(&t), &[home], Some(&calm)).admit);

        let windy = WeatherReport { wind_kmh: 30.0, visibility_m: 9_000.0 };
        let v = m.preflight(&input(&t), &[home], Some(&windy));
        assert_eq!(v.reasons, BTreeSet::from([SafetyReason::Weather]));
        assert_eq!(v.details.len(), 1);

        let foggy = WeatherReport { wind_kmh: 30.0, visibility_m: 800.0 };
        let v = m.preflight(&input(&t), &[home], Some(&foggy));
        assert_eq!(v.reasons, BTreeSet::from([SafetyReason::Weather]));
        assert_eq!(v.details.len(), 2);
    }

    #[test]
    fn missing_weather_report_is_unsafe_when_gated() {
        let home = GeoPoint::new(0.0, 0.0);
        let limits = SafetyLimits { max_wind_kmh: Some(25.0), ..SafetyLimits::default() };
        let m = SafetyMonitor::new(limits, vec![], home);
        let t = nominal(home, 0.9);
        let v = m.preflight(&input(&t), &[home], None);
        assert!(!v.admit);
        assert_eq!(v.reasons, BTreeSet::from([SafetyReason::Weather]));
        // in-flight evaluation never looks at weather
        assert!(m.evaluate(&input(&t)).admit);
    }

    #[test]
    fn limits_from_config_fill_defaults() {
        let cfg = SafetyConfig { abort_battery: Some(0.3), ..Default::default() };
        let l = SafetyLimits::from(&cfg);
        assert_eq!(l.abort_battery, 0.3);
        assert_eq!(l.reserve_per_km, 0.02);
        assert_eq!(l.min_satellites, 6);
        assert_eq!(l.max_wind_kmh, None);

        let cfg = SafetyConfig {
            max_wind_kmh: Some(25.0),
            min_visibility_m: Some(5_000.0),
            ..Default::default()
        };
        let l = SafetyLimits::from(&cfg);
        assert_eq!((l.max_wind_kmh, l.min_visibility_m), (Some(25.0), Some(5_000.0)));
    }
}

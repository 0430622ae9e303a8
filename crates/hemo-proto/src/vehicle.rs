use serde::{Deserialize, Serialize};
use std::fmt;

use crate::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Lost => "lost",
        };
        f.write_str(s)
    }
}

/// GPS fix type as reported by GPS_RAW_INT. Ordered so that `>=` means "at least as good".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FixType {
    NoGps,
    NoFix,
    Fix2d,
    Fix3d,
    Dgps,
    RtkFloat,
    RtkFixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpsFix {
    pub fix_type: FixType,
    pub satellites: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LandedState {
    OnGround,
    InAir,
    Takeoff,
    Landing,
}

/// ArduCopter custom flight modes (HEARTBEAT.custom_mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlightMode {
    Stabilize,
    AltHold,
    Auto,
    Guided,
    Loiter,
    Rtl,
    Land,
    PosHold,
    Brake,
    SmartRtl,
    Other(u32),
}

impl FlightMode {
    pub fn from_custom_mode(mode: u32) -> Self {
        match mode {
            0 => FlightMode::Stabilize,
            2 => FlightMode::AltHold,
            3 => FlightMode::Auto,
            4 => FlightMode::Guided,
            5 => FlightMode::Loiter,
            6 => FlightMode::Rtl,
            9 => FlightMode::Land,
            16 => FlightMode::PosHold,
            17 => FlightMode::Brake,
            21 => FlightMode::SmartRtl,
            other => FlightMode::Other(other),
        }
    }

    pub fn custom_mode(self) -> u32 {
        match self {
            FlightMode::Stabilize => 0,
            FlightMode::AltHold => 2,
            FlightMode::Auto => 3,
            FlightMode::Guided => 4,
            FlightMode::Loiter => 5,
            FlightMode::Rtl => 6,
            FlightMode::Land => 9,
            FlightMode::PosHold => 16,
            FlightMode::Brake => 17,
            FlightMode::SmartRtl => 21,
            FlightMode::Other(m) => m,
        }
    }
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlightMode::Stabilize => f.write_str("STABILIZE"),
            FlightMode::AltHold => f.write_str("ALT_HOLD"),
            FlightMode::Auto => f.write_str("AUTO"),
            FlightMode::Guided => f.write_str("GUIDED"),
            FlightMode::Loiter => f.write_str("LOITER"),
            FlightMode::Rtl => f.write_str("RTL"),
            FlightMode::Land => f.write_str("LAND"),
            FlightMode::PosHold => f.write_str("POSHOLD"),
            FlightMode::Brake => f.write_str("BRAKE"),
            FlightMode::SmartRtl => f.write_str("SMART_RTL"),
            FlightMode::Other(m) => write!(f, "MODE({})", m),
        }
    }
}

/// Immutable snapshot of everything the vehicle has told us.
///
/// Fields stay `None` until the vehicle reports them; consumers must treat an
/// unknown value as unsafe. Snapshots are replaced wholesale, never patched in place
/// by readers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehicleTelemetry {
    pub position: Option<GeoPoint>,
    /// Altitude above home, metres.
    pub relative_alt_m: Option<f32>,
    pub ground_speed_mps: Option<f32>,
    pub heading_deg: Option<f32>,
    /// Battery remaining, 0.0..=1.0.
    pub battery: Option<f32>,
    pub gps: Option<GpsFix>,
    pub armed: bool,
    pub mode: Option<FlightMode>,
    pub landed: Option<LandedState>,
    pub updated_unix_ms: i64,
}

impl VehicleTelemetry {
    /// True when the vehicle says it is on the ground. Falls back to relative altitude
    /// when the autopilot does not send EXTENDED_SYS_STATE.
    pub fn on_ground(&self, landed_altitude_m: f32) -> bool {
        match self.landed {
            Some(state) => state == LandedState::OnGround,
            None => self.relative_alt_m.map(|a| a <= landed_altitude_m).unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_type_ordering() {
        assert!(FixType::Fix3d > FixType::Fix2d);
        assert!(FixType::RtkFixed >= FixType::Fix3d);
        assert!(FixType::NoFix < FixType::Fix3d);
    }

    #[test]
    fn flight_mode_custom_mode_mapping() {
        for m in [0u32, 3, 4, 6, 9, 21, 42] {
            assert_eq!(FlightMode::from_custom_mode(m).custom_mode(), m);
        }
        assert_eq!(FlightMode::from_custom_mode(4), FlightMode::Guided);
        assert_eq!(FlightMode::Rtl.to_string(), "RTL");
    }

    #[test]
    fn on_ground_prefers_landed_state() {
        let mut t = VehicleTelemetry {
            relative_alt_m: Some(0.1),
            landed: Some(LandedState::InAir),
            ..Default::default()
        };
        assert!(!t.on_ground(0.5));
        t.landed = None;
        assert!(t.on_ground(0.5));
        t.relative_alt_m = None;
        assert!(!t.on_ground(0.5));
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::GeoPoint;

pub type MissionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MissionPhase {
    Pending,
    Armed,
    TakingOff,
    EnRouteToSource,
    EnRouteToDestination,
    ReturningToLaunch,
    Landed,
    Completed,
    Aborted,
    Failed,
}

impl MissionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, MissionPhase::Completed | MissionPhase::Aborted | MissionPhase::Failed)
    }
}

impl fmt::Display for MissionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A named safety check that can veto a flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SafetyReason {
    LinkHealth,
    BatteryMargin,
    GpsQuality,
    Geofence,
    Weather,
}

impl fmt::Display for SafetyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the request layer hands us.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionRequest {
    pub source: GeoPoint,
    pub destination: GeoPoint,
    /// Cruise altitude above home in metres; the configured default applies when absent.
    #[serde(default)]
    pub altitude_m: Option<f32>,
    /// Conditions reported by the request layer at submission time.
    #[serde(default)]
    pub weather: Option<WeatherReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub wind_kmh: f32,
    pub visibility_m: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissionOutcome {
    Completed,
    Aborted,
    Failed,
}

impl MissionOutcome {
    pub fn from_phase(phase: MissionPhase) -> Option<Self> {
        match phase {
            MissionPhase::Completed => Some(MissionOutcome::Completed),
            MissionPhase::Aborted => Some(MissionOutcome::Aborted),
            MissionPhase::Failed => Some(MissionOutcome::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseChange {
    pub ts_unix_ms: i64,
    pub from: MissionPhase,
    pub to: MissionPhase,
}

/// Archived result of one mission, handed back to the request layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionRecord {
    pub id: MissionId,
    pub request: MissionRequest,
    pub outcome: MissionOutcome,
    /// Human-readable reason for Aborted/Failed.
    pub reason: Option<String>,
    pub abort_reasons: Vec<SafetyReason>,
    pub history: Vec<PhaseChange>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases() {
        assert!(MissionPhase::Completed.is_terminal());
        assert!(MissionPhase::Aborted.is_terminal());
        assert!(MissionPhase::Failed.is_terminal());
        assert!(!MissionPhase::Landed.is_terminal());
        assert_eq!(MissionOutcome::from_phase(MissionPhase::Pending), None);
        let outcome = MissionOutcome::from_phase(MissionPhase::Aborted);
        assert_eq!(outcome, Some(MissionOutcome::Aborted));
    }

    #[test]
    fn request_altitude_is_optional() {
        let req: MissionRequest = serde_json::from_str(
            r#"{"source":{"lat":0.0,"lon":0.0},"destination":{"lat":0.0,"lon":1.0}}"#,
        )
        .unwrap();
        assert_eq!(req.altitude_m, None);
        assert_eq!(req.weather, None);
        assert_eq!(req.destination, GeoPoint::new(0.0, 1.0));
    }

    #[test]
    fn request_carries_weather() {
        let req: MissionRequest = serde_json::from_str(
            r#"{"source":{"lat":0.0,"lon":0.0},"destination":{"lat":0.0,"lon":1.0},
                "weather":{"wind_kmh":12.5,"visibility_m":8000}}"#,
        )
        .unwrap();
        assert_eq!(req.weather, Some(WeatherReport { wind_kmh: 12.5, visibility_m: 8_000.0 }));
    }
}

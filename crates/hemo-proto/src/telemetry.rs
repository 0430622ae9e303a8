use serde::{Deserialize, Serialize};

use crate::mission::{MissionId, MissionOutcome, MissionPhase, SafetyReason};
use crate::vehicle::{LinkState, VehicleTelemetry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Status,
    Phase,
    Abort,
    Verdict,
    Outcome,
}

/// One record on the outbound event stream (dashboard / logs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub ts_unix_ms: i64,
    pub kind: EventKind,
    pub connection: LinkState,
    pub flight_mode: Option<String>,
    pub armed: bool,
    pub battery_percent: Option<u8>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt_m: Option<f32>,
    pub heading_deg: Option<f32>,
    pub ground_speed_mps: Option<f32>,
    pub mission_id: Option<MissionId>,
    pub mission_phase: Option<MissionPhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<SafetyReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<MissionOutcome>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
}

impl TelemetryEvent {
    pub fn status(
        ts_unix_ms: i64,
        link: LinkState,
        t: &VehicleTelemetry,
        mission: Option<(MissionId, MissionPhase)>,
    ) -> Self {
        Self {
            ts_unix_ms,
            kind: EventKind::Status,
            connection: link,
            flight_mode: t.mode.map(|m| m.to_string()),
            armed: t.armed,
            battery_percent: t.battery.map(|b| (b.clamp(0.0, 1.0) * 100.0).round() as u8),
            lat: t.position.map(|p| p.lat),
            lon: t.position.map(|p| p.lon),
            alt_m: t.relative_alt_m,
            heading_deg: t.heading_deg,
            ground_speed_mps: t.ground_speed_mps,
            mission_id: mission.map(|(id, _)| id),
            mission_phase: mission.map(|(_, p)| p),
            reasons: Vec::new(),
            outcome: None,
            msg: String::new(),
        }
    }

    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_reasons(mut self, reasons: impl IntoIterator<Item = SafetyReason>) -> Self {
        self.reasons = reasons.into_iter().collect();
        self
    }

    pub fn with_outcome(mut self, outcome: MissionOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GeoPoint;

    #[test]
    fn status_event_carries_snapshot() {
        let t = VehicleTelemetry {
            position: Some(GeoPoint::new(1.5, 2.5)),
            battery: Some(0.734),
            heading_deg: Some(90.0),
            ..Default::default()
        };
        let ev = TelemetryEvent::status(10, LinkState::Connected, &t, None);
        assert_eq!(ev.battery_percent, Some(73));
        assert_eq!(ev.lat, Some(1.5));
        assert_eq!(ev.mission_phase, None);

        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"connection\":\"Connected\""));
        assert!(!json.contains("reasons"));
    }
}

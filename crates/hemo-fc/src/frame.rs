//! Protocol frames exchanged between the link and a transport.
//!
//! Transports (MAVLink, simulator) translate these to and from their own wire
//! format; everything above the link only ever sees these types.

use std::fmt;

use hemo_proto::vehicle::{FlightMode, GpsFix, LandedState};
use hemo_proto::GeoPoint;

/// MAVLink command ids, used to correlate acknowledgments.
pub mod cmd_id {
    pub const NAV_RETURN_TO_LAUNCH: u16 = 20;
    pub const NAV_TAKEOFF: u16 = 22;
    pub const DO_SET_MODE: u16 = 176;
    pub const DO_REPOSITION: u16 = 192;
    pub const COMPONENT_ARM_DISARM: u16 = 400;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Arm,
    Disarm,
    SetMode,
    Takeoff,
    Waypoint,
    ReturnToLaunch,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Arm,
    Disarm,
    SetMode(FlightMode),
    Takeoff { alt_m: f32 },
    Waypoint { target: GeoPoint, alt_m: f32 },
    ReturnToLaunch,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Arm => CommandKind::Arm,
            Command::Disarm => CommandKind::Disarm,
            Command::SetMode(_) => CommandKind::SetMode,
            Command::Takeoff { .. } => CommandKind::Takeoff,
            Command::Waypoint { .. } => CommandKind::Waypoint,
            Command::ReturnToLaunch => CommandKind::ReturnToLaunch,
        }
    }

    /// Command id the flight controller echoes back in its acknowledgment.
    pub fn wire_id(&self) -> u16 {
        match self {
            Command::Arm | Command::Disarm => cmd_id::COMPONENT_ARM_DISARM,
            Command::SetMode(_) => cmd_id::DO_SET_MODE,
            Command::Takeoff { .. } => cmd_id::NAV_TAKEOFF,
            Command::Waypoint { .. } => cmd_id::DO_REPOSITION,
            Command::ReturnToLaunch => cmd_id::NAV_RETURN_TO_LAUNCH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckResult {
    Accepted,
    TemporarilyRejected,
    Denied,
    Unsupported,
    Failed,
    InProgress,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    pub kind: CommandKind,
    pub result: AckResult,
}

impl CommandAck {
    pub fn accepted(&self) -> bool {
        self.result == AckResult::Accepted
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Heartbeat { armed: bool, custom_mode: u32 },
    Position {
        position: GeoPoint,
        relative_alt_m: f32,
        ground_speed_mps: f32,
        heading_deg: Option<f32>,
    },
    Battery { remaining: Option<f32> },
    Gps(GpsFix),
    Landed(LandedState),
    Ack { command: u16, result: AckResult },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Companion-computer heartbeat.
    Heartbeat,
    RequestStreams { rate_hz: u16 },
    Command(Command),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_and_disarm_share_wire_id() {
        assert_eq!(Command::Arm.wire_id(), Command::Disarm.wire_id());
        assert_ne!(Command::Arm.kind(), Command::Disarm.kind());
        assert_eq!(Command::ReturnToLaunch.wire_id(), 20);
    }
}

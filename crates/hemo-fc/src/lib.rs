pub mod autodetect;
pub mod frame;
pub mod link;
pub mod mav;
pub mod sim;
pub mod state;

use serde::Deserialize;
use std::time::Duration;

pub use frame::{AckResult, Command, CommandAck, CommandKind, Inbound, Outbound};
pub use link::{Connector, Link, LinkError, LinkIo};
pub use mav::{MavConnector, MavIds};
pub use sim::{SimConfig, SimConnector, SimHandle};
pub use state::{Connection, Endpoint, Heartbeat, LinkStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct FcConfig {
    /// Link endpoint: serial device (`/dev/ttyACM0`), `serial:<dev>:<baud>`,
    /// a MAVLink URL (`udpin:0.0.0.0:14550`, `tcpout:127.0.0.1:5760`) or `sim`.
    /// Ignored when `autodetect` is true.
    pub endpoint: Option<String>,

    /// Baud used when `endpoint` is a bare device path.
    pub baud: Option<u32>,

    /// If true, probe candidate serial ports/bauds and pick the first
    /// that yields a MAVLink HEARTBEAT.
    #[serde(default)]
    pub autodetect: bool,

    /// Autodetect candidates (paths).
    pub candidate_devs: Option<Vec<String>>,

    /// Autodetect candidate baud rates (common ArduPilot telemetry values).
    pub candidate_bauds: Option<Vec<u32>>,

    /// MAVLink ids we use (companion side)
    pub sys_id: u8,
    pub comp_id: u8,

    /// target system/component (FC side). 1/1 is common for ArduPilot.
    pub target_sys: u8,
    pub target_comp: u8,

    /// Startup window for the first heartbeat. Default 5000.
    pub startup_timeout_ms: Option<u64>,
    /// Link is Lost after this long without a heartbeat. Default 3000.
    pub heartbeat_timeout_ms: Option<u64>,
    /// Per-command acknowledgment timeout. Default 2000.
    pub command_timeout_ms: Option<u64>,
    /// Reconnect backoff start / ceiling. Defaults 1000 / 10000.
    pub reconnect_initial_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,

    /// Companion heartbeat rate. Default 1 Hz.
    pub send_heartbeat_hz: Option<f32>,
    /// Requested telemetry stream rate. Default 4 Hz.
    pub stream_rate_hz: Option<u16>,
}

/// Resolved link timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkTiming {
    pub startup_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub command_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub send_heartbeat_interval: Duration,
    pub stream_rate_hz: u16,
    /// How often the supervisor polls the heartbeat.
    pub supervise_interval: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_secs(2),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(10),
            send_heartbeat_interval: Duration::from_secs(1),
            stream_rate_hz: 4,
            supervise_interval: Duration::from_millis(250),
        }
    }
}

impl FcConfig {
    pub fn timing(&self) -> LinkTiming {
        let d = LinkTiming::default();
        let ms = |v: Option<u64>, dflt: Duration| v.map(Duration::from_millis).unwrap_or(dflt);
        LinkTiming {
            startup_timeout: ms(self.startup_timeout_ms, d.startup_timeout),
            heartbeat_timeout: ms(self.heartbeat_timeout_ms, d.heartbeat_timeout),
            command_timeout: ms(self.command_timeout_ms, d.command_timeout),
            reconnect_initial: ms(self.reconnect_initial_ms, d.reconnect_initial),
            reconnect_max: ms(self.reconnect_max_ms, d.reconnect_max),
            send_heartbeat_interval: Duration::from_secs_f32(
                1.0 / self.send_heartbeat_hz.unwrap_or(1.0).max(0.2),
            ),
            stream_rate_hz: self.stream_rate_hz.unwrap_or(d.stream_rate_hz),
            supervise_interval: d.supervise_interval,
        }
    }

    pub fn default_baud(&self) -> u32 {
        self.baud.unwrap_or(115_200)
    }

    pub fn mav_ids(&self) -> MavIds {
        MavIds {
            sys_id: self.sys_id,
            comp_id: self.comp_id,
            target_sys: self.target_sys,
            target_comp: self.target_comp,
        }
    }

    pub fn candidates(&self) -> (Vec<String>, Vec<u32>) {
        (
            self.candidate_devs.clone().unwrap_or_else(autodetect::default_candidate_devs),
            self.candidate_bauds.clone().unwrap_or_else(autodetect::default_candidate_bauds),
        )
    }
}

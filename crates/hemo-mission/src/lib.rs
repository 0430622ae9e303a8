pub mod audit;
pub mod mission;
pub mod monitor;
pub mod orchestrator;
pub mod phase;
pub mod publisher;
pub mod runner;

use serde::Deserialize;
use std::time::Duration;

pub use audit::{Audit, AuditEntry, AuditRecord};
pub use mission::{InvalidMission, Mission};
pub use orchestrator::{Orchestrator, SubmitError};
pub use publisher::{Publisher, Subscription};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MissionConfig {
    /// Cruise altitude above home when a request does not name one. Default 40 m.
    pub cruise_alt_m: Option<f32>,
    /// Legal altitude window. Defaults 30 / 120 m.
    pub min_altitude_m: Option<f32>,
    pub max_altitude_m: Option<f32>,
    /// Longest allowed source to destination hop. Unlimited when absent.
    pub max_mission_distance_m: Option<f64>,
    /// Waypoint convergence radius. Default 5 m.
    pub arrival_tolerance_m: Option<f64>,
    /// Relative altitude counted as on-ground when the autopilot does not
    /// report landed state. Default 0.5 m.
    pub landed_altitude_m: Option<f32>,
    /// Attempts per command before the mission fails. Default 3.
    pub command_retries: Option<u32>,
    /// Bound on every convergence wait. Default 3600 s.
    pub leg_timeout_s: Option<u64>,
    /// How long an abort waits for a lost link to come back. Default 30 s.
    pub link_recovery_timeout_s: Option<u64>,
    /// Fraction of the cruise altitude that counts as "took off". Default 0.95.
    pub takeoff_alt_fraction: Option<f32>,
}

/// Resolved mission parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MissionSettings {
    pub cruise_alt_m: f32,
    pub min_altitude_m: f32,
    pub max_altitude_m: f32,
    pub max_mission_distance_m: Option<f64>,
    pub arrival_tolerance_m: f64,
    pub landed_altitude_m: f32,
    pub command_retries: u32,
    pub leg_timeout: Duration,
    pub link_recovery_timeout: Duration,
    pub takeoff_alt_fraction: f32,
}

impl Default for MissionSettings {
    fn default() -> Self {
        Self {
            cruise_alt_m: 40.0,
            min_altitude_m: 30.0,
            max_altitude_m: 120.0,
            max_mission_distance_m: None,
            arrival_tolerance_m: 5.0,
            landed_altitude_m: 0.5,
            command_retries: 3,
            leg_timeout: Duration::from_secs(3_600),
            link_recovery_timeout: Duration::from_secs(30),
            takeoff_alt_fraction: 0.95,
        }
    }
}

impl From<&MissionConfig> for MissionSettings {
    fn from(c: &MissionConfig) -> Self {
        let d = MissionSettings::default();
        Self {
            cruise_alt_m: c.cruise_alt_m.unwrap_or(d.cruise_alt_m),
            min_altitude_m: c.min_altitude_m.unwrap_or(d.min_altitude_m),
            max_altitude_m: c.max_altitude_m.unwrap_or(d.max_altitude_m),
            max_mission_distance_m: c.max_mission_distance_m,
            arrival_tolerance_m: c.arrival_tolerance_m.unwrap_or(d.arrival_tolerance_m),
            landed_altitude_m: c.landed_altitude_m.unwrap_or(d.landed_altitude_m),
            command_retries: c.command_retries.unwrap_or(d.command_retries).max(1),
            leg_timeout: c.leg_timeout_s.map(Duration::from_secs).unwrap_or(d.leg_timeout),
            link_recovery_timeout: c
                .link_recovery_timeout_s
                .map(Duration::from_secs)
                .unwrap_or(d.link_recovery_timeout),
            takeoff_alt_fraction: c
                .takeoff_alt_fraction
                .unwrap_or(d.takeoff_alt_fraction)
                .clamp(0.5, 1.0),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Status sample rate. Default 2 Hz.
    pub rate_hz: Option<f32>,
    /// Per-observer queue depth. Default 64.
    pub queue: Option<usize>,
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.rate_hz.unwrap_or(2.0).clamp(0.1, 50.0))
    }

    pub fn queue(&self) -> usize {
        self.queue.unwrap_or(64).max(1)
    }
}

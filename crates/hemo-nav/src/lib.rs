pub mod doctor;
pub mod geo;
pub mod geofence;
pub mod safety;

pub use geofence::{violating_zones, NoFlyZone};
pub use safety::{SafetyConfig, SafetyInput, SafetyLimits, SafetyMonitor, SafetyVerdict};

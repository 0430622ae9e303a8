use thiserror::Error;
use uuid::Uuid;

use hemo_nav::geo::distance_m;
use hemo_proto::mission::{MissionId, MissionRequest};
use hemo_proto::GeoPoint;

use crate::MissionSettings;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvalidMission {
    #[error("source and destination are the same point {0}")]
    SameEndpoints(GeoPoint),
    #[error("invalid coordinates {0}")]
    BadCoordinates(GeoPoint),
    #[error("altitude {alt_m} m outside [{min_m}, {max_m}]")]
    Altitude { alt_m: f32, min_m: f32, max_m: f32 },
    #[error("distance {distance_m:.0} m exceeds limit {max_m:.0} m")]
    TooFar { distance_m: f64, max_m: f64 },
}

/// A validated delivery: pick up at `source`, drop off at `destination`, return home.
#[derive(Debug, Clone, PartialEq)]
pub struct Mission {
    pub id: MissionId,
    pub request: MissionRequest,
    pub altitude_m: f32,
}

impl Mission {
    pub fn validate(
        request: MissionRequest,
        settings: &MissionSettings,
    ) -> Result<Self, InvalidMission> {
        for p in [request.source, request.destination] {
            if !p.is_valid() {
                return Err(InvalidMission::BadCoordinates(p));
            }
        }
        if request.source == request.destination {
            return Err(InvalidMission::SameEndpoints(request.source));
        }

        let altitude_m = request.altitude_m.unwrap_or(settings.cruise_alt_m);
        if !(altitude_m >= settings.min_altitude_m && altitude_m <= settings.max_altitude_m) {
            return Err(InvalidMission::Altitude {
                alt_m: altitude_m,
                min_m: settings.min_altitude_m,
                max_m: settings.max_altitude_m,
            });
        }

        if let Some(max_m) = settings.max_mission_distance_m {
            let d = distance_m(request.source, request.destination);
            if d > max_m {
                return Err(InvalidMission::TooFar { distance_m: d, max_m });
            }
        }

        Ok(Self { id: Uuid::new_v4(), request, altitude_m })
    }

    pub fn source(&self) -> GeoPoint {
        self.request.source
    }

    pub fn destination(&self) -> GeoPoint {
        self.request.destination
    }

    /// Waypoints in visiting order.
    pub fn route(&self) -> [GeoPoint; 2] {
        [self.request.source, self.request.destination]
    }
}

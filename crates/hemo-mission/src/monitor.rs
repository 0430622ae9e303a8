use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use hemo_fc::Link;
use hemo_nav::{SafetyInput, SafetyMonitor, SafetyVerdict};
use hemo_proto::mission::{MissionId, WeatherReport};
use hemo_proto::telemetry::EventKind;
use hemo_proto::GeoPoint;

use crate::audit::{Audit, AuditEntry};
use crate::publisher::Publisher;

/// In-flight evaluation against the freshest link and telemetry state.
pub fn evaluate_now(
    monitor: &SafetyMonitor,
    link: &Link,
    next_waypoint: Option<GeoPoint>,
) -> SafetyVerdict {
    let telemetry = link.telemetry();
    monitor.evaluate(&SafetyInput {
        link: link.state(),
        heartbeat_fresh: link.heartbeat_fresh(),
        telemetry: &telemetry,
        next_waypoint,
    })
}

/// Pre-flight evaluation of a whole route and the weather reported with the request.
pub fn evaluate_preflight(
    monitor: &SafetyMonitor,
    link: &Link,
    route: &[GeoPoint],
    weather: Option<&WeatherReport>,
) -> SafetyVerdict {
    let telemetry = link.telemetry();
    monitor.preflight(
        &SafetyInput {
            link: link.state(),
            heartbeat_fresh: link.heartbeat_fresh(),
            telemetry: &telemetry,
            next_waypoint: route.first().copied(),
        },
        route,
        weather,
    )
}

/// Periodic safety evaluation for one mission.
pub struct SafetyLoop {
    pub monitor: Arc<SafetyMonitor>,
    pub link: Link,
    pub next_waypoint: watch::Receiver<Option<GeoPoint>>,
    pub interval: Duration,
    pub audit: Audit,
    pub publisher: Publisher,
    pub mission_id: MissionId,
}

impl SafetyLoop {
    /// Start polling. Every evaluation lands in `verdicts`; changes of decision are
    /// audited and published. The loop ends when the handle is aborted or every
    /// verdict receiver is gone.
    pub fn spawn(self, verdicts: watch::Sender<Option<SafetyVerdict>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last: Option<SafetyVerdict> = None;
            loop {
                tick.tick().await;
                if verdicts.is_closed() {
                    break;
                }
                let wp = *self.next_waypoint.borrow();
                let v = evaluate_now(&self.monitor, &self.link, wp);
                let changed = last.as_ref().map(|l| !l.same_decision(&v)).unwrap_or(true);
                if changed {
                    self.report(&v);
                }
                last = Some(v.clone());
                verdicts.send_replace(Some(v));
            }
        })
    }

    fn report(&self, v: &SafetyVerdict) {
        if v.admit {
            info!(mission = %self.mission_id, "safety verdict: admit");
        } else {
            let id = self.mission_id;
            warn!(mission = %id, reasons = ?v.reasons, "safety verdict: {}", v.summary());
        }
        self.audit.record(
            Some(self.mission_id),
            AuditEntry::VerdictChanged {
                admit: v.admit,
                reasons: v.reasons.iter().copied().collect(),
                details: v.details.clone(),
            },
        );
        let ev = self
            .publisher
            .snapshot()
            .with_kind(EventKind::Verdict)
            .with_reasons(v.reasons.iter().copied())
            .with_msg(v.summary());
        self.publisher.publish(ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hemo_fc::{Endpoint, LinkTiming, SimConfig, SimConnector, SimHandle};
    use hemo_nav::{NoFlyZone, SafetyLimits};
    use hemo_proto::mission::SafetyReason;

    #[tokio::test(start_paused = true)]
    async fn verdict_changes_are_audited_once() {
        let home = GeoPoint::new(0.0, 0.0);
        let sim = SimHandle::new(home, &SimConfig::default());
        let link = Link::new(Arc::new(SimConnector::new(sim.clone())), LinkTiming::default());
        link.connect(&Endpoint::Sim).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let monitor = Arc::new(SafetyMonitor::new(SafetyLimits::default(), Vec::new(), home));
        let (_phase_tx, phase_rx) = watch::channel(None);
        let publisher = Publisher::new(link.clone(), phase_rx, 8);
        let audit = Audit::memory();
        let (_wp_tx, wp_rx) = watch::channel(None);
        let (v_tx, mut v_rx) = watch::channel(None);
        let handle = SafetyLoop {
            monitor,
            link: link.clone(),
            next_waypoint: wp_rx,
            interval: Duration::from_secs(1),
            audit: audit.clone(),
            publisher,
            mission_id: uuid::Uuid::new_v4(),
        }
        .spawn(v_tx);

        v_rx.wait_for(|v| v.as_ref().map(|v| v.admit).unwrap_or(false)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        sim.set_battery(Some(0.1));
        v_rx.wait_for(|v| v.as_ref().map(|v| !v.admit).unwrap_or(false)).await.unwrap();
        let v = v_rx.borrow().clone().unwrap();
        assert!(v.reasons.contains(&SafetyReason::BatteryMargin));
        handle.abort();

        let changes = audit
            .records()
            .into_iter()
            .filter(|r| matches!(r.entry, AuditEntry::VerdictChanged { .. }))
            .count();
        assert_eq!(changes, 2, "admit once, then the veto");
    }

    #[test]
    fn preflight_flags_destination_inside_zone() {
        let home = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 0.05);
        let zones = vec![NoFlyZone { name: "B".into(), lat: b.lat, lon: b.lon, radius_m: 2_000.0 }];
        let monitor = SafetyMonitor::new(SafetyLimits::default(), zones, home);
        let sim = SimHandle::new(home, &SimConfig::default());
        let link = Link::new(Arc::new(SimConnector::new(sim)), LinkTiming::default());
        let v = evaluate_preflight(&monitor, &link, &[home, b], None);
        assert!(!v.admit);
        assert!(v.reasons.contains(&SafetyReason::Geofence));
        assert_eq!(v.zones, vec!["B".to_string()]);
    }
}

//! Status fan-out to dashboards and other observers.
//!
//! Every observer gets its own bounded queue. Samples are offered with
//! `try_send`; a slow observer loses samples instead of stalling the flight
//! loops, and an observer whose receiver is gone is dropped from the list.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use hemo_fc::Link;
use hemo_proto::mission::{MissionId, MissionPhase};
use hemo_proto::telemetry::TelemetryEvent;

pub type PhaseCell = watch::Receiver<Option<(MissionId, MissionPhase)>>;

struct Observers {
    list: Mutex<Vec<(u64, mpsc::Sender<TelemetryEvent>)>>,
    next_id: AtomicU64,
}

impl Observers {
    fn lock(&self) -> MutexGuard<'_, Vec<(u64, mpsc::Sender<TelemetryEvent>)>> {
        self.list.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct Publisher {
    observers: Arc<Observers>,
    link: Link,
    phase: PhaseCell,
    queue: usize,
}

/// Receiving end of one observer. Dropping it unregisters the observer.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<TelemetryEvent>,
    observers: Weak<Observers>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<TelemetryEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TelemetryEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(obs) = self.observers.upgrade() {
            obs.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

impl Publisher {
    pub fn new(link: Link, phase: PhaseCell, queue: usize) -> Self {
        Self {
            observers: Arc::new(Observers {
                list: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
            link,
            phase,
            queue: queue.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue);
        let id = self.observers.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, tx));
        debug!(observer = id, "telemetry observer registered");
        Subscription { id, rx, observers: Arc::downgrade(&self.observers) }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Status event built from the current telemetry, link and phase cells.
    pub fn snapshot(&self) -> TelemetryEvent {
        let t = self.link.telemetry();
        let phase = *self.phase.borrow();
        TelemetryEvent::status(hemo_proto::now_unix_ms(), self.link.state(), &t, phase)
    }

    /// Offer one event to every observer without waiting.
    pub fn publish(&self, ev: TelemetryEvent) {
        let mut list = self.observers.lock();
        list.retain(|(id, tx)| match tx.try_send(ev.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(observer = id, "observer queue full, sample dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(observer = id, "observer gone");
                false
            }
        });
    }

    /// Periodic status sampling until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tick.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            let ev = self.snapshot();
            debug!(
                link = %ev.connection,
                mode = ev.flight_mode.as_deref().unwrap_or("-"),
                battery = ?ev.battery_percent,
                phase = ?ev.mission_phase,
                "status"
            );
            self.publish(ev);
        }
        info!("telemetry publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hemo_fc::{LinkTiming, SimConfig, SimConnector, SimHandle};
    use hemo_proto::telemetry::EventKind;
    use hemo_proto::GeoPoint;

    fn publisher(queue: usize) -> (Publisher, watch::Sender<Option<(MissionId, MissionPhase)>>) {
        let sim = SimHandle::new(GeoPoint::new(0.0, 0.0), &SimConfig::default());
        let link = Link::new(Arc::new(SimConnector::new(sim)), LinkTiming::default());
        let (phase_tx, phase_rx) = watch::channel(None);
        (Publisher::new(link, phase_rx, queue), phase_tx)
    }

    #[tokio::test]
    async fn fans_out_to_every_observer() {
        let (p, _phase) = publisher(4);
        let mut a = p.subscribe();
        let mut b = p.subscribe();
        p.publish(p.snapshot().with_kind(EventKind::Abort).with_msg("operator"));
        assert_eq!(a.recv().await.unwrap().msg, "operator");
        assert_eq!(b.recv().await.unwrap().msg, "operator");
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let (p, _phase) = publisher(2);
        let mut slow = p.subscribe();
        for i in 0..5 {
            p.publish(p.snapshot().with_msg(i.to_string()));
        }
        assert_eq!(slow.try_recv().unwrap().msg, "0");
        assert_eq!(slow.try_recv().unwrap().msg, "1");
        assert!(slow.try_recv().is_none());
        assert_eq!(p.observer_count(), 1);
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters() {
        let (p, _phase) = publisher(2);
        let a = p.subscribe();
        let _b = p.subscribe();
        assert_eq!(p.observer_count(), 2);
        drop(a);
        assert_eq!(p.observer_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn samples_at_configured_rate_with_phase() {
        let (p, phase) = publisher(16);
        let id = uuid::Uuid::new_v4();
        phase.send_replace(Some((id, MissionPhase::TakingOff)));
        let mut sub = p.subscribe();

        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = p.clone();
        let every = Duration::from_millis(500);
        let task = tokio::spawn(async move { runner.run(every, stop_rx).await });

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        stop_tx.send_replace(true);
        task.await.unwrap();

        let mut n = 0;
        while let Some(ev) = sub.try_recv() {
            assert_eq!(ev.mission_phase, Some(MissionPhase::TakingOff));
            assert_eq!(ev.mission_id, Some(id));
            n += 1;
        }
        // ticks at 0, 500 and 1000 ms
        assert_eq!(n, 3);
    }
}

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use hemo_fc::Link;
use hemo_nav::SafetyMonitor;
use hemo_proto::mission::{MissionId, MissionPhase, MissionRecord, MissionRequest};
use hemo_proto::telemetry::EventKind;

use crate::audit::{Audit, AuditEntry};
use crate::mission::{InvalidMission, Mission};
use crate::publisher::Publisher;
use crate::runner::Runner;
use crate::MissionSettings;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubmitError {
    #[error("mission {0} still in progress")]
    MissionInProgress(MissionId),
    #[error("invalid mission: {0}")]
    InvalidMission(#[from] InvalidMission),
}

struct Active {
    id: MissionId,
    abort_tx: mpsc::Sender<String>,
}

struct Inner {
    link: Link,
    safety: Arc<SafetyMonitor>,
    settings: MissionSettings,
    poll_interval: Duration,
    audit: Audit,
    publisher: Publisher,
    phase_tx: Arc<watch::Sender<Option<(MissionId, MissionPhase)>>>,
    active: Mutex<Option<Active>>,
    history: watch::Sender<Vec<MissionRecord>>,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Accepts delivery requests and runs them one at a time.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        link: Link,
        safety: Arc<SafetyMonitor>,
        settings: MissionSettings,
        poll_interval: Duration,
        audit: Audit,
        telemetry_queue: usize,
    ) -> Self {
        let (phase_tx, phase_rx) = watch::channel(None);
        let publisher = Publisher::new(link.clone(), phase_rx, telemetry_queue);
        let (history, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner {
                link,
                safety,
                settings,
                poll_interval,
                audit,
                publisher,
                phase_tx: Arc::new(phase_tx),
                active: Mutex::new(None),
                history,
            }),
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.inner.publisher
    }

    pub fn link(&self) -> &Link {
        &self.inner.link
    }

    /// Current mission and its phase, if one is running.
    pub fn current(&self) -> Option<(MissionId, MissionPhase)> {
        *self.inner.phase_tx.borrow()
    }

    pub fn history(&self) -> Vec<MissionRecord> {
        self.inner.history.borrow().clone()
    }

    /// Validate `request` and start flying it. Must be called inside a tokio runtime.
    pub fn submit_mission(&self, request: MissionRequest) -> Result<MissionId, SubmitError> {
        let inner = &self.inner;
        let mut active = inner.active();
        if let Some(a) = active.as_ref() {
            warn!(active = %a.id, "mission rejected: another mission in progress");
            return Err(SubmitError::MissionInProgress(a.id));
        }

        let mission = match Mission::validate(request, &inner.settings) {
            Ok(m) => m,
            Err(e) => {
                warn!("mission rejected: {}", e);
                inner.audit.record(None, AuditEntry::MissionRejected { error: e.to_string() });
                return Err(e.into());
            }
        };
        let id = mission.id;
        inner.audit.record(
            Some(id),
            AuditEntry::MissionAccepted {
                source: mission.source().to_string(),
                destination: mission.destination().to_string(),
                altitude_m: mission.altitude_m,
            },
        );

        let (abort_tx, abort_rx) = mpsc::channel(4);
        *active = Some(Active { id, abort_tx });
        drop(active);

        let runner = Runner::new(
            mission,
            inner.link.clone(),
            inner.safety.clone(),
            inner.settings,
            inner.poll_interval,
            inner.audit.clone(),
            inner.publisher.clone(),
            inner.phase_tx.clone(),
            abort_rx,
        );
        let this = self.clone();
        tokio::spawn(async move {
            let record = runner.run().await;
            this.complete(record);
        });
        info!(mission = %id, "mission accepted");
        Ok(id)
    }

    /// Release the slot, then announce. Nobody woken by the history entry or the
    /// outcome event can observe the finished mission as still active.
    fn complete(&self, record: MissionRecord) {
        let inner = &self.inner;
        let ev = inner
            .publisher
            .snapshot()
            .with_kind(EventKind::Outcome)
            .with_outcome(record.outcome)
            .with_reasons(record.abort_reasons.iter().copied())
            .with_msg(record.reason.clone().unwrap_or_default());

        {
            let mut active = inner.active();
            *active = None;
            inner.phase_tx.send_replace(None);
            // under the slot lock so `wait_for` sees the mission active or archived
            inner.history.send_modify(|h| h.push(record));
        }
        inner.publisher.publish(ev);
    }

    /// Operator abort of the active mission. False when nothing is running.
    pub fn abort(&self, reason: &str) -> bool {
        let active = self.inner.active();
        match active.as_ref() {
            Some(a) => {
                info!(mission = %a.id, "operator abort requested: {}", reason);
                if a.abort_tx.try_send(reason.to_string()).is_err() {
                    warn!(mission = %a.id, "abort already pending");
                }
                true
            }
            None => false,
        }
    }

    /// Resolves once `id` has finished. `None` for an unknown mission.
    pub async fn wait_for(&self, id: MissionId) -> Option<MissionRecord> {
        let mut rx = self.inner.history.subscribe();
        {
            let active = self.inner.active();
            let running = active.as_ref().map(|a| a.id == id).unwrap_or(false);
            if !running && !rx.borrow().iter().any(|r| r.id == id) {
                return None;
            }
        }
        let h = rx.wait_for(|h| h.iter().any(|r| r.id == id)).await.ok()?;
        h.iter().find(|r| r.id == id).cloned()
    }
}

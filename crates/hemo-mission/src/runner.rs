//! Drives one mission from `Pending` to a terminal phase.
//!
//! The runner is the only writer of the mission phase. It talks to the vehicle
//! exclusively through [`Link::send_command`] and reads telemetry, link state and
//! safety verdicts from their `watch` cells. Every wait is bounded: command
//! acknowledgments by the link's command timeout, convergence by the leg
//! timeout and an abort's link recovery by the recovery window.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

use hemo_fc::{Command, CommandAck, Link, LinkError};
use hemo_nav::geo::distance_m;
use hemo_nav::{SafetyMonitor, SafetyVerdict};
use hemo_proto::mission::{MissionOutcome, MissionPhase, MissionRecord, PhaseChange, SafetyReason};
use hemo_proto::telemetry::EventKind;
use hemo_proto::vehicle::{FlightMode, LinkState, VehicleTelemetry};
use hemo_proto::GeoPoint;

use crate::audit::{Audit, AuditEntry};
use crate::mission::Mission;
use crate::monitor::{evaluate_now, evaluate_preflight, SafetyLoop};
use crate::phase::{airborne, can_transition};
use crate::publisher::Publisher;
use crate::MissionSettings;

type PhaseTx = Arc<watch::Sender<Option<(hemo_proto::mission::MissionId, MissionPhase)>>>;

/// Why the nominal sequence stopped.
#[derive(Debug)]
enum Stop {
    Abort { reasons: BTreeSet<SafetyReason>, why: String },
    Fail(String),
}

impl Stop {
    fn operator(reason: &str) -> Self {
        Stop::Abort { reasons: BTreeSet::new(), why: format!("operator abort: {}", reason) }
    }

    fn link_lost() -> Self {
        Stop::Abort { reasons: BTreeSet::from([SafetyReason::LinkHealth]), why: "link lost".into() }
    }

    fn veto(v: &SafetyVerdict) -> Self {
        Stop::Abort { reasons: v.reasons.clone(), why: format!("safety veto: {}", v.summary()) }
    }
}

pub struct Runner {
    mission: Mission,
    link: Link,
    safety: Arc<SafetyMonitor>,
    settings: MissionSettings,
    poll_interval: Duration,
    audit: Audit,
    publisher: Publisher,
    phase_tx: PhaseTx,
    aborts: mpsc::Receiver<String>,

    phase: MissionPhase,
    history: Vec<PhaseChange>,
    next_wp: watch::Sender<Option<GeoPoint>>,
    verdict_tx: Option<watch::Sender<Option<SafetyVerdict>>>,
    verdicts: watch::Receiver<Option<SafetyVerdict>>,
    arm_acked: bool,
    /// A takeoff has been sent; the vehicle may be climbing whatever its ack said.
    takeoff_sent: bool,
    takeoff_acked: bool,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mission: Mission,
        link: Link,
        safety: Arc<SafetyMonitor>,
        settings: MissionSettings,
        poll_interval: Duration,
        audit: Audit,
        publisher: Publisher,
        phase_tx: PhaseTx,
        aborts: mpsc::Receiver<String>,
    ) -> Self {
        let (next_wp, _) = watch::channel(None);
        let (verdict_tx, verdicts) = watch::channel(None);
        Self {
            mission,
            link,
            safety,
            settings,
            poll_interval,
            audit,
            publisher,
            phase_tx,
            aborts,
            phase: MissionPhase::Pending,
            history: Vec::new(),
            next_wp,
            verdict_tx: Some(verdict_tx),
            verdicts,
            arm_acked: false,
            takeoff_sent: false,
            takeoff_acked: false,
        }
    }

    pub async fn run(mut self) -> MissionRecord {
        let id = self.mission.id;
        info!(
            mission = %id,
            source = %self.mission.source(),
            destination = %self.mission.destination(),
            alt_m = self.mission.altitude_m,
            "mission start"
        );
        self.phase_tx.send_replace(Some((id, MissionPhase::Pending)));

        let weather = self.mission.request.weather;
        let route = self.mission.route();
        let pre = evaluate_preflight(&self.safety, &self.link, &route, weather.as_ref());
        self.audit(AuditEntry::VerdictChanged {
            admit: pre.admit,
            reasons: pre.reasons.iter().copied().collect(),
            details: pre.details.clone(),
        });
        if !pre.admit {
            warn!(mission = %id, "pre-flight veto: {}", pre.summary());
            let why = format!("pre-flight veto: {}", pre.summary());
            return self.finish(MissionPhase::Aborted, pre.reasons, Some(why));
        }

        let monitor = SafetyLoop {
            monitor: self.safety.clone(),
            link: self.link.clone(),
            next_waypoint: self.next_wp.subscribe(),
            interval: self.poll_interval,
            audit: self.audit.clone(),
            publisher: self.publisher.clone(),
            mission_id: id,
        };
        let monitor = self.verdict_tx.take().map(|tx| monitor.spawn(tx));

        let (to, reasons, why) = match self.fly().await {
            Ok(()) => (MissionPhase::Completed, BTreeSet::new(), None),
            Err(Stop::Abort { reasons, why }) => {
                warn!(mission = %id, phase = %self.phase, "abort: {}", why);
                self.publisher.publish(
                    self.publisher
                        .snapshot()
                        .with_kind(EventKind::Abort)
                        .with_reasons(reasons.iter().copied())
                        .with_msg(why.clone()),
                );
                if self.make_safe().await {
                    (MissionPhase::Aborted, reasons, Some(why))
                } else {
                    let why = format!("{}; return-to-launch could not be delivered", why);
                    (MissionPhase::Failed, reasons, Some(why))
                }
            }
            Err(Stop::Fail(why)) => {
                error!(mission = %id, phase = %self.phase, "mission failed: {}", why);
                self.make_safe().await;
                (MissionPhase::Failed, BTreeSet::new(), Some(why))
            }
        };
        if let Some(h) = monitor {
            h.abort();
        }
        self.finish(to, reasons, why)
    }

    async fn fly(&mut self) -> Result<(), Stop> {
        self.check_abort()?;
        let alt_m = self.mission.altitude_m;
        let (source, destination) = (self.mission.source(), self.mission.destination());

        self.command(Command::SetMode(FlightMode::Guided)).await?;
        self.command(Command::Arm).await?;
        self.arm_acked = true;
        self.advance(MissionPhase::Armed)?;

        self.takeoff_sent = true;
        self.command(Command::Takeoff { alt_m }).await?;
        self.takeoff_acked = true;
        self.advance(MissionPhase::TakingOff)?;
        let climb_to = alt_m * self.settings.takeoff_alt_fraction;
        self.wait_until("takeoff altitude", |t| {
            t.relative_alt_m.map(|a| a >= climb_to).unwrap_or(false)
        })
        .await?;

        self.goto(source).await?;
        self.advance(MissionPhase::EnRouteToSource)?;
        self.wait_arrival(source).await?;

        self.advance(MissionPhase::EnRouteToDestination)?;
        self.goto(destination).await?;
        self.wait_arrival(destination).await?;

        self.next_wp.send_replace(Some(self.safety.home()));
        self.command(Command::ReturnToLaunch).await?;
        self.advance(MissionPhase::ReturningToLaunch)?;
        let landed_alt = self.settings.landed_altitude_m;
        self.wait_until("landing", |t| t.on_ground(landed_alt)).await?;
        self.advance(MissionPhase::Landed)?;

        self.wait_until("disarm", |t| !t.armed).await?;
        Ok(())
    }

    /// Forward transition. Phases that take the vehicle further out get one
    /// synchronous safety evaluation first.
    fn advance(&mut self, to: MissionPhase) -> Result<(), Stop> {
        if matches!(
            to,
            MissionPhase::Armed
                | MissionPhase::TakingOff
                | MissionPhase::EnRouteToSource
                | MissionPhase::EnRouteToDestination
        ) {
            let wp = *self.next_wp.borrow();
            let v = evaluate_now(&self.safety, &self.link, wp);
            if !v.admit {
                return Err(Stop::veto(&v));
            }
        }
        self.transition(to, &BTreeSet::new());
        Ok(())
    }

    fn transition(&mut self, to: MissionPhase, reasons: &BTreeSet<SafetyReason>) {
        let from = self.phase;
        if !can_transition(from, to) {
            error!(mission = %self.mission.id, %from, %to, "illegal phase transition ignored");
            return;
        }
        self.phase = to;
        self.history.push(PhaseChange { ts_unix_ms: hemo_proto::now_unix_ms(), from, to });
        self.phase_tx.send_replace(Some((self.mission.id, to)));
        info!(mission = %self.mission.id, %from, %to, reasons = ?reasons, "phase");
        self.audit(AuditEntry::PhaseTransition {
            from,
            to,
            reasons: reasons.iter().copied().collect(),
        });
        self.publisher.publish(
            self.publisher
                .snapshot()
                .with_kind(EventKind::Phase)
                .with_reasons(reasons.iter().copied())
                .with_msg(format!("{} -> {}", from, to)),
        );
    }

    fn finish(
        mut self,
        to: MissionPhase,
        reasons: BTreeSet<SafetyReason>,
        why: Option<String>,
    ) -> MissionRecord {
        self.transition(to, &reasons);
        let outcome = MissionOutcome::from_phase(self.phase).unwrap_or(MissionOutcome::Failed);
        self.audit(AuditEntry::MissionFinished { outcome, reason: why.clone() });
        info!(mission = %self.mission.id, ?outcome, "mission finished");
        MissionRecord {
            id: self.mission.id,
            request: self.mission.request.clone(),
            outcome,
            reason: why,
            abort_reasons: reasons.into_iter().collect(),
            history: std::mem::take(&mut self.history),
        }
    }

    fn audit(&self, entry: AuditEntry) {
        self.audit.record(Some(self.mission.id), entry);
    }

    /// Pending abort conditions, checked whenever a wait resolves.
    fn check_abort(&mut self) -> Result<(), Stop> {
        if let Ok(reason) = self.aborts.try_recv() {
            return Err(Stop::operator(&reason));
        }
        if self.link.state() == LinkState::Lost {
            return Err(Stop::link_lost());
        }
        if let Some(v) = self.verdicts.borrow().as_ref() {
            if !v.admit {
                return Err(Stop::veto(v));
            }
        }
        Ok(())
    }

    /// Issue one command with bounded retries. Every attempt is audited with
    /// exactly one resolution.
    async fn command(&mut self, cmd: Command) -> Result<CommandAck, Stop> {
        let kind = cmd.kind();
        let retries = self.settings.command_retries;
        let mut last = String::new();
        for attempt in 1..=retries {
            self.audit(AuditEntry::CommandIssued {
                command: kind.to_string(),
                detail: format!("{:?}", cmd),
                attempt,
            });
            match self.link.send_command(cmd).await {
                Ok(ack) => {
                    self.audit(AuditEntry::CommandAcked {
                        command: kind.to_string(),
                        result: format!("{:?}", ack.result),
                    });
                    if ack.accepted() {
                        self.check_abort()?;
                        return Ok(ack);
                    }
                    last = format!("{:?}", ack.result);
                }
                Err(LinkError::CommandTimeout(_)) => {
                    self.audit(AuditEntry::CommandTimedOut { command: kind.to_string() });
                    last = "timeout".into();
                }
                Err(e @ (LinkError::LinkLost | LinkError::NotConnected)) => {
                    self.audit(AuditEntry::CommandFailed {
                        command: kind.to_string(),
                        error: e.to_string(),
                    });
                    return Err(Stop::link_lost());
                }
                Err(e) => {
                    self.audit(AuditEntry::CommandFailed {
                        command: kind.to_string(),
                        error: e.to_string(),
                    });
                    last = e.to_string();
                }
            }
            warn!(mission = %self.mission.id, %kind, attempt, "command not accepted: {}", last);
            self.check_abort()?;
        }
        Err(Stop::Fail(format!("{} not accepted after {} attempts ({})", kind, retries, last)))
    }

    async fn goto(&mut self, target: GeoPoint) -> Result<(), Stop> {
        self.next_wp.send_replace(Some(target));
        self.command(Command::Waypoint { target, alt_m: self.mission.altitude_m }).await?;
        Ok(())
    }

    async fn wait_arrival(&mut self, target: GeoPoint) -> Result<(), Stop> {
        let tol = self.settings.arrival_tolerance_m;
        self.wait_until("waypoint", |t| {
            t.position.map(|p| distance_m(p, target) <= tol).unwrap_or(false)
        })
        .await
    }

    /// Wait for `reached` on fresh telemetry, bounded by the leg timeout and
    /// interrupted by any abort condition.
    async fn wait_until(
        &mut self,
        what: &str,
        reached: impl Fn(&VehicleTelemetry) -> bool,
    ) -> Result<(), Stop> {
        let deadline = Instant::now() + self.settings.leg_timeout;
        let mut telemetry = self.link.subscribe_telemetry();
        let mut state = self.link.subscribe_state();
        let mut verdicts = self.verdicts.clone();
        loop {
            if reached(&telemetry.borrow_and_update()) {
                return Ok(());
            }
            self.check_abort()?;
            tokio::select! {
                _ = telemetry.changed() => {}
                _ = state.changed() => {}
                _ = verdicts.changed() => {}
                Some(reason) = self.aborts.recv() => {
                    return Err(Stop::operator(&reason));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let limit = self.settings.leg_timeout;
                    return Err(Stop::Fail(format!("{} not reached within {:?}", what, limit)));
                }
            }
        }
    }

    /// Bring the vehicle to a safe state after the nominal sequence stopped.
    /// Possibly airborne: one return-to-launch sequence. On the ground: disarm if
    /// armed. Returns false when the vehicle could not be commanded.
    async fn make_safe(&mut self) -> bool {
        if self.phase == MissionPhase::Landed {
            return true;
        }
        let t = self.link.telemetry();
        if self.possibly_airborne(&t) {
            return self.deliver(Command::ReturnToLaunch).await;
        }
        if self.arm_acked || t.armed {
            return self.deliver(Command::Disarm).await;
        }
        true
    }

    /// The phase lags the vehicle while a takeoff ack is outstanding or lost, so
    /// anything past a sent takeoff trusts telemetry, and unknown counts as flying.
    fn possibly_airborne(&self, t: &VehicleTelemetry) -> bool {
        airborne(self.phase)
            || self.takeoff_acked
            || (self.takeoff_sent && !t.on_ground(self.settings.landed_altitude_m))
    }

    /// Safety command delivery: bounded retries, waiting out a lost link for up
    /// to the recovery window. Aborts are not re-checked here.
    async fn deliver(&mut self, cmd: Command) -> bool {
        let kind = cmd.kind();
        if matches!(cmd, Command::ReturnToLaunch) {
            self.next_wp.send_replace(Some(self.safety.home()));
        }
        for attempt in 1..=self.settings.command_retries {
            if self.link.state() != LinkState::Connected {
                warn!(mission = %self.mission.id, %kind, "waiting for link before safety command");
                let mut st = self.link.subscribe_state();
                let window = self.settings.link_recovery_timeout;
                let back = timeout(window, st.wait_for(|s| *s == LinkState::Connected))
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);
                if !back {
                    let id = self.mission.id;
                    error!(mission = %id, %kind, "link did not recover within {:?}", window);
                    return false;
                }
            }
            self.audit(AuditEntry::CommandIssued {
                command: kind.to_string(),
                detail: format!("{:?}", cmd),
                attempt,
            });
            match self.link.send_command(cmd).await {
                Ok(ack) => {
                    self.audit(AuditEntry::CommandAcked {
                        command: kind.to_string(),
                        result: format!("{:?}", ack.result),
                    });
                    if ack.accepted() {
                        info!(mission = %self.mission.id, %kind, "safety command accepted");
                        return true;
                    }
                }
                Err(LinkError::CommandTimeout(_)) => {
                    self.audit(AuditEntry::CommandTimedOut { command: kind.to_string() });
                }
                Err(e) => {
                    self.audit(AuditEntry::CommandFailed {
                        command: kind.to_string(),
                        error: e.to_string(),
                    });
                }
            }
            warn!(mission = %self.mission.id, %kind, attempt, "safety command not accepted");
        }
        false
    }
}

//! Connection lifecycle, heartbeat supervision and command correlation.
//!
//! A [`Link`] owns at most one transport at a time. The per-connection receive
//! loop is the only writer of the telemetry and heartbeat cells; everyone else
//! reads snapshots through `watch` receivers. Commands are strictly one at a time:
//! the pending slot holds a correlation id and a oneshot that the receive loop
//! completes when the matching acknowledgment arrives.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use hemo_proto::vehicle::{FlightMode, LinkState, VehicleTelemetry};

use crate::frame::{AckResult, Command, CommandAck, CommandKind, Inbound, Outbound};
use crate::state::{Connection, Endpoint, Heartbeat, LinkStatus};
use crate::LinkTiming;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("{0} command not acknowledged in time")]
    CommandTimeout(CommandKind),
    #[error("another command is still outstanding")]
    CommandBusy,
    #[error("link lost")]
    LinkLost,
    #[error("not connected")]
    NotConnected,
}

/// Async halves of an opened transport.
pub struct LinkIo {
    pub tx: mpsc::Sender<Outbound>,
    pub rx: mpsc::Receiver<Inbound>,
}

/// Opens transports. Called from a blocking thread.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, endpoint: &Endpoint) -> anyhow::Result<LinkIo>;
}

struct Pending {
    corr: u64,
    wire_id: u16,
    kind: CommandKind,
    done: oneshot::Sender<Result<CommandAck, LinkError>>,
}

#[derive(Default)]
struct Inner {
    conn: Option<Connection>,
    out: Option<mpsc::Sender<Outbound>>,
    pending: Option<Pending>,
    next_corr: u64,
    generation: u64,
    opens: u64,
}

struct Shared {
    connector: Arc<dyn Connector>,
    timing: LinkTiming,
    inner: Mutex<Inner>,
    connect_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<LinkState>,
    telemetry_tx: watch::Sender<VehicleTelemetry>,
    heartbeat_tx: watch::Sender<Heartbeat>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: LinkState) {
        let changed = self.state_tx.send_if_modified(|s| {
            if *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
        if changed {
            info!(state = %next, "fc link state");
        }
    }

    fn current_generation(&self) -> u64 {
        self.lock().generation
    }

    /// Drop the transport, fail any outstanding command and report Lost.
    fn mark_lost(&self, why: &str) {
        let pending = {
            let mut inner = self.lock();
            if !matches!(self.state(), LinkState::Connected | LinkState::Connecting) {
                return;
            }
            inner.conn = None;
            inner.out = None;
            inner.generation += 1;
            inner.pending.take()
        };
        warn!("fc link lost: {}", why);
        if let Some(p) = pending {
            let _ = p.done.send(Err(LinkError::LinkLost));
        }
        self.set_state(LinkState::Lost);
    }

    fn update_telemetry(&self, f: impl FnOnce(&mut VehicleTelemetry)) {
        let mut next = self.telemetry_tx.borrow().clone();
        f(&mut next);
        next.updated_unix_ms = hemo_proto::now_unix_ms();
        self.telemetry_tx.send_replace(next);
    }

    fn apply(&self, frame: Inbound) {
        match frame {
            Inbound::Heartbeat { armed, custom_mode } => {
                self.heartbeat_tx.send_modify(|h| {
                    h.last = Some(Instant::now());
                    h.count += 1;
                });
                self.update_telemetry(|t| {
                    t.armed = armed;
                    t.mode = Some(FlightMode::from_custom_mode(custom_mode));
                });
            }
            Inbound::Position { position, relative_alt_m, ground_speed_mps, heading_deg } => {
                self.update_telemetry(|t| {
                    t.position = Some(position);
                    t.relative_alt_m = Some(relative_alt_m);
                    t.ground_speed_mps = Some(ground_speed_mps);
                    if heading_deg.is_some() {
                        t.heading_deg = heading_deg;
                    }
                });
            }
            Inbound::Battery { remaining } => self.update_telemetry(|t| t.battery = remaining),
            Inbound::Gps(fix) => self.update_telemetry(|t| t.gps = Some(fix)),
            Inbound::Landed(state) => self.update_telemetry(|t| t.landed = Some(state)),
            Inbound::Ack { command, result } => self.resolve_ack(command, result),
        }
    }

    fn resolve_ack(&self, command: u16, result: AckResult) {
        if result == AckResult::InProgress {
            debug!(command, "fc command in progress");
            return;
        }
        let pending = {
            let mut inner = self.lock();
            match &inner.pending {
                Some(p) if p.wire_id == command => inner.pending.take(),
                _ => None,
            }
        };
        match pending {
            Some(p) => {
                debug!(corr = p.corr, kind = %p.kind, ?result, "fc command ack");
                let _ = p.done.send(Ok(CommandAck { kind: p.kind, result }));
            }
            None => warn!(command, ?result, "fc ack with no matching command"),
        }
    }
}

async fn receive_loop(shared: Arc<Shared>, generation: u64, mut rx: mpsc::Receiver<Inbound>) {
    while let Some(frame) = rx.recv().await {
        if shared.current_generation() != generation {
            return;
        }
        shared.apply(frame);
    }
    if shared.current_generation() == generation {
        shared.mark_lost("transport closed");
    }
}

/// Clears the pending slot if the command it belongs to is abandoned.
struct PendingGuard<'a> {
    shared: &'a Shared,
    corr: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        if inner.pending.as_ref().map(|p| p.corr) == Some(self.corr) {
            inner.pending = None;
        }
    }
}

#[derive(Clone)]
pub struct Link {
    shared: Arc<Shared>,
}

impl Link {
    pub fn new(connector: Arc<dyn Connector>, timing: LinkTiming) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let (telemetry_tx, _) = watch::channel(VehicleTelemetry::default());
        let (heartbeat_tx, _) = watch::channel(Heartbeat::default());
        Self {
            shared: Arc::new(Shared {
                connector,
                timing,
                inner: Mutex::new(Inner::default()),
                connect_lock: tokio::sync::Mutex::new(()),
                state_tx,
                telemetry_tx,
                heartbeat_tx,
            }),
        }
    }

    pub fn timing(&self) -> &LinkTiming {
        &self.shared.timing
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe_telemetry(&self) -> watch::Receiver<VehicleTelemetry> {
        self.shared.telemetry_tx.subscribe()
    }

    pub fn telemetry(&self) -> VehicleTelemetry {
        self.shared.telemetry_tx.borrow().clone()
    }

    pub fn heartbeat(&self) -> Heartbeat {
        *self.shared.heartbeat_tx.borrow()
    }

    pub fn heartbeat_fresh(&self) -> bool {
        self.heartbeat().is_fresh(self.shared.timing.heartbeat_timeout)
    }

    pub fn status(&self) -> LinkStatus {
        let inner = self.shared.lock();
        LinkStatus {
            state: self.shared.state(),
            connection: inner.conn.clone(),
            heartbeat: self.heartbeat(),
            opens: inner.opens,
        }
    }

    /// Open `endpoint` and wait for the first heartbeat.
    ///
    /// Returns the existing connection untouched when already connected.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<Connection, LinkError> {
        let _serial = self.shared.connect_lock.lock().await;

        let prev = self.shared.state();
        if prev == LinkState::Connected {
            let inner = self.shared.lock();
            if let Some(conn) = &inner.conn {
                if &conn.endpoint == endpoint {
                    return Ok(conn.clone());
                }
                let msg = format!("already connected to {}", conn.endpoint);
                return Err(LinkError::Connection(msg));
            }
        }
        let fallback = if prev == LinkState::Connecting { LinkState::Disconnected } else { prev };

        self.shared.set_state(LinkState::Connecting);
        let connector = self.shared.connector.clone();
        let ep = endpoint.clone();
        let opened = tokio::task::spawn_blocking(move || connector.open(&ep)).await;
        let io = match opened {
            Ok(Ok(io)) => io,
            Ok(Err(e)) => {
                self.shared.set_state(fallback);
                return Err(LinkError::Connection(format!("open {}: {:#}", endpoint, e)));
            }
            Err(e) => {
                self.shared.set_state(fallback);
                return Err(LinkError::Connection(format!("open {}: {}", endpoint, e)));
            }
        };

        let generation = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            inner.opens += 1;
            inner.conn = None;
            inner.out = Some(io.tx.clone());
            inner.generation
        };
        self.shared.heartbeat_tx.send_replace(Heartbeat::default());
        tokio::spawn(receive_loop(self.shared.clone(), generation, io.rx));

        let _ = io.tx.send(Outbound::Heartbeat).await;
        let streams = Outbound::RequestStreams { rate_hz: self.shared.timing.stream_rate_hz };
        let _ = io.tx.send(streams).await;

        let mut hb = self.shared.heartbeat_tx.subscribe();
        let seen = matches!(
            timeout(self.shared.timing.startup_timeout, hb.wait_for(|h| h.last.is_some())).await,
            Ok(Ok(_))
        );

        let mut inner = self.shared.lock();
        if !seen || inner.generation != generation {
            if inner.generation == generation {
                inner.out = None;
                inner.generation += 1;
            }
            drop(inner);
            self.shared.set_state(fallback);
            return Err(LinkError::Connection(format!(
                "no heartbeat from {} within {:?}",
                endpoint, self.shared.timing.startup_timeout
            )));
        }
        let conn = Connection { endpoint: endpoint.clone(), generation, opened_at: Instant::now() };
        inner.conn = Some(conn.clone());
        drop(inner);
        self.shared.set_state(LinkState::Connected);
        info!(endpoint = %endpoint, generation, "fc connected");
        Ok(conn)
    }

    /// Close the transport without treating it as a loss.
    pub fn disconnect(&self) {
        let pending = {
            let mut inner = self.shared.lock();
            inner.conn = None;
            inner.out = None;
            inner.generation += 1;
            inner.pending.take()
        };
        if let Some(p) = pending {
            let _ = p.done.send(Err(LinkError::NotConnected));
        }
        self.shared.set_state(LinkState::Disconnected);
    }

    /// Send one command and wait for its acknowledgment.
    pub async fn send_command(&self, cmd: Command) -> Result<CommandAck, LinkError> {
        let (done, rx) = oneshot::channel();
        let (corr, out) = {
            let mut inner = self.shared.lock();
            match self.shared.state() {
                LinkState::Connected => {}
                LinkState::Lost => return Err(LinkError::LinkLost),
                _ => return Err(LinkError::NotConnected),
            }
            if inner.pending.is_some() {
                return Err(LinkError::CommandBusy);
            }
            let out = inner.out.clone().ok_or(LinkError::LinkLost)?;
            inner.next_corr += 1;
            let corr = inner.next_corr;
            inner.pending = Some(Pending { corr, wire_id: cmd.wire_id(), kind: cmd.kind(), done });
            (corr, out)
        };
        let _guard = PendingGuard { shared: &self.shared, corr };

        debug!(corr, ?cmd, "fc command");
        if out.send(Outbound::Command(cmd)).await.is_err() {
            return Err(LinkError::LinkLost);
        }
        match timeout(self.shared.timing.command_timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(LinkError::LinkLost),
            Err(_) => {
                warn!(corr, kind = %cmd.kind(), "fc command timed out");
                Err(LinkError::CommandTimeout(cmd.kind()))
            }
        }
    }

    /// Check heartbeat age; a gap beyond the timeout moves the link to Lost.
    pub fn poll_heartbeat(&self) -> LinkState {
        if self.shared.state() == LinkState::Connected && !self.heartbeat_fresh() {
            let age = self.heartbeat().age();
            self.shared.mark_lost(&format!("no heartbeat for {:?}", age));
        }
        self.shared.state()
    }

    /// Best-effort frame that bypasses command correlation.
    fn send_raw(&self, frame: Outbound) {
        let out = self.shared.lock().out.clone();
        if let Some(out) = out {
            if out.try_send(frame).is_err() {
                debug!("fc outbound queue full, frame dropped");
            }
        }
    }

    /// Heartbeat polling, companion heartbeat and reconnection until shutdown.
    pub async fn supervise(&self, endpoint: Endpoint, mut shutdown: watch::Receiver<bool>) {
        let timing = self.shared.timing;
        let mut tick = tokio::time::interval(timing.supervise_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_hb_send = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tick.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            match self.poll_heartbeat() {
                LinkState::Connected => {
                    if last_hb_send.elapsed() >= timing.send_heartbeat_interval {
                        self.send_raw(Outbound::Heartbeat);
                        last_hb_send = Instant::now();
                    }
                }
                LinkState::Lost | LinkState::Disconnected => {
                    if !self.reconnect(&endpoint, &mut shutdown).await {
                        break;
                    }
                }
                LinkState::Connecting => {}
            }
        }
        info!("fc supervisor stopped");
    }

    /// Retry `connect` on a doubling backoff. False if shutdown came first.
    async fn reconnect(&self, endpoint: &Endpoint, shutdown: &mut watch::Receiver<bool>) -> bool {
        let timing = self.shared.timing;
        let mut delay = timing.reconnect_initial;
        let mut attempt = 0u32;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
            match self.connect(endpoint).await {
                Ok(conn) => {
                    info!(attempt, generation = conn.generation, "fc reconnected");
                    return true;
                }
                Err(e) => {
                    warn!(attempt, ?delay, "fc reconnect failed: {}", e);
                    delay = next_backoff(delay, timing.reconnect_max);
                }
            }
        }
    }
}

pub fn next_backoff(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}

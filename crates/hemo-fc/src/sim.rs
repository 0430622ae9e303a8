//! In-process simulated multicopter.
//!
//! [`SimConnector`] opens transports to a single shared vehicle. The vehicle
//! keeps flying between transports, so a dropped link behaves like a radio
//! outage rather than a crash. [`SimHandle`] exposes fault knobs for tests and
//! bench runs: battery level, GPS quality, heartbeat suppression, lost acks,
//! denied commands and forced transport closure.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use hemo_nav::geo::distance_m;
use hemo_proto::vehicle::{FixType, FlightMode, GpsFix, LandedState};
use hemo_proto::GeoPoint;

use crate::frame::{AckResult, Command, CommandKind, Inbound, Outbound};
use crate::link::{Connector, LinkIo};
use crate::state::Endpoint;

const PHYSICS_TICK: Duration = Duration::from_millis(100);
const TELEMETRY_TICK: Duration = Duration::from_millis(250);
const HEARTBEAT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimConfig {
    /// Horizontal cruise speed. Default 15 m/s.
    pub speed_mps: Option<f32>,
    /// Climb and descent rate. Default 3 m/s.
    pub climb_mps: Option<f32>,
    /// Battery fraction consumed per armed second. Default 0.0005.
    pub drain_per_s: Option<f32>,
    /// Initial battery fraction. Default 1.0.
    pub battery: Option<f32>,
    pub satellites: Option<u8>,
}

#[derive(Debug, Clone)]
struct Vehicle {
    position: GeoPoint,
    alt_m: f32,
    ground_speed_mps: f32,
    heading_deg: f32,
    armed: bool,
    mode: FlightMode,
    landed: LandedState,
    battery: Option<f32>,
    gps: GpsFix,
    target: Option<GeoPoint>,
    target_alt_m: f32,
}

struct World {
    home: GeoPoint,
    speed_mps: f32,
    climb_mps: f32,
    drain_per_s: f32,
    vehicle: Vehicle,

    heartbeats: bool,
    acks: bool,
    fail_open: bool,
    denied: HashSet<CommandKind>,
    unacked: HashSet<CommandKind>,
    commands: Vec<Command>,

    /// Bumped to close every open transport.
    epoch: u64,
    opens: u64,
    physics_running: bool,
}

/// Shared access to the simulated vehicle and its fault knobs.
#[derive(Clone)]
pub struct SimHandle {
    world: Arc<Mutex<World>>,
}

impl SimHandle {
    /// A disarmed vehicle sitting at `home`.
    pub fn new(home: GeoPoint, cfg: &SimConfig) -> Self {
        let vehicle = Vehicle {
            position: home,
            alt_m: 0.0,
            ground_speed_mps: 0.0,
            heading_deg: 0.0,
            armed: false,
            mode: FlightMode::Stabilize,
            landed: LandedState::OnGround,
            battery: Some(cfg.battery.unwrap_or(1.0)),
            gps: GpsFix { fix_type: FixType::Fix3d, satellites: cfg.satellites.unwrap_or(12) },
            target: None,
            target_alt_m: 0.0,
        };
        Self {
            world: Arc::new(Mutex::new(World {
                home,
                speed_mps: cfg.speed_mps.unwrap_or(15.0),
                climb_mps: cfg.climb_mps.unwrap_or(3.0),
                drain_per_s: cfg.drain_per_s.unwrap_or(0.0005),
                vehicle,
                heartbeats: true,
                acks: true,
                fail_open: false,
                denied: HashSet::new(),
                unacked: HashSet::new(),
                commands: Vec::new(),
                epoch: 0,
                opens: 0,
                physics_running: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_battery(&self, remaining: Option<f32>) {
        self.lock().vehicle.battery = remaining.map(|b| b.clamp(0.0, 1.0));
    }

    pub fn set_gps(&self, fix: GpsFix) {
        self.lock().vehicle.gps = fix;
    }

    /// Stop or resume autopilot heartbeats. Other telemetry keeps flowing.
    pub fn set_heartbeats(&self, on: bool) {
        self.lock().heartbeats = on;
    }

    /// Silently swallow command acknowledgments (commands still execute).
    pub fn set_acks(&self, on: bool) {
        self.lock().acks = on;
    }

    pub fn set_fail_open(&self, on: bool) {
        self.lock().fail_open = on;
    }

    /// Swallow acknowledgments for one command kind only.
    pub fn drop_acks(&self, kind: CommandKind) {
        self.lock().unacked.insert(kind);
    }

    pub fn deny(&self, kind: CommandKind) {
        self.lock().denied.insert(kind);
    }

    pub fn allow(&self, kind: CommandKind) {
        self.lock().denied.remove(&kind);
    }

    /// Close every open transport as if the radio went away.
    pub fn drop_transport(&self) {
        self.lock().epoch += 1;
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.lock().commands.clone()
    }

    pub fn opens(&self) -> u64 {
        self.lock().opens
    }

    pub fn position(&self) -> GeoPoint {
        self.lock().vehicle.position
    }

    pub fn altitude_m(&self) -> f32 {
        self.lock().vehicle.alt_m
    }

    pub fn armed(&self) -> bool {
        self.lock().vehicle.armed
    }

    pub fn mode(&self) -> FlightMode {
        self.lock().vehicle.mode
    }

    /// Put the vehicle somewhere else on the ground, e.g. at a pickup site.
    pub fn place(&self, position: GeoPoint) {
        let mut w = self.lock();
        w.vehicle.position = position;
        w.vehicle.target = None;
    }
}

pub struct SimConnector {
    handle: SimHandle,
}

impl SimConnector {
    pub fn new(handle: SimHandle) -> Self {
        Self { handle }
    }
}

impl Connector for SimConnector {
    fn open(&self, endpoint: &Endpoint) -> anyhow::Result<LinkIo> {
        let epoch = {
            let mut w = self.handle.lock();
            if w.fail_open {
                anyhow::bail!("simulated open failure for {}", endpoint);
            }
            w.opens += 1;
            if !w.physics_running {
                w.physics_running = true;
                tokio::spawn(physics(Arc::downgrade(&self.handle.world)));
            }
            w.epoch
        };
        let (out_tx, out_rx) = mpsc::channel(32);
        let (in_tx, in_rx) = mpsc::channel(256);
        tokio::spawn(transport(self.handle.clone(), epoch, out_rx, in_tx));
        info!("sim transport open ({})", endpoint);
        Ok(LinkIo { tx: out_tx, rx: in_rx })
    }
}

async fn physics(world: Weak<Mutex<World>>) {
    let mut tick = tokio::time::interval(PHYSICS_TICK);
    loop {
        tick.tick().await;
        let Some(world) = world.upgrade() else { break };
        let mut w = world.lock().unwrap_or_else(|e| e.into_inner());
        step(&mut w, PHYSICS_TICK.as_secs_f32());
    }
}

fn step(w: &mut World, dt: f32) {
    let home = w.home;
    let (speed, climb, drain) = (w.speed_mps, w.climb_mps, w.drain_per_s);
    let v = &mut w.vehicle;

    if !v.armed {
        v.ground_speed_mps = 0.0;
        return;
    }
    if let Some(b) = v.battery.as_mut() {
        *b = (*b - drain * dt).max(0.0);
    }
    if v.landed == LandedState::OnGround {
        return;
    }

    // horizontal
    v.ground_speed_mps = 0.0;
    if let Some(target) = v.target {
        let dist = distance_m(v.position, target) as f32;
        let stride = speed * dt;
        if dist <= stride || dist < 0.01 {
            v.position = target;
        } else {
            let frac = (stride / dist) as f64;
            let dlat = target.lat - v.position.lat;
            let dlon = target.lon - v.position.lon;
            let east = dlon * v.position.lat.to_radians().cos();
            v.heading_deg = east.atan2(dlat).to_degrees().rem_euclid(360.0) as f32;
            v.position = GeoPoint::new(v.position.lat + dlat * frac, v.position.lon + dlon * frac);
            v.ground_speed_mps = speed;
        }
    }

    // vertical
    let descending = match v.mode {
        FlightMode::Land => true,
        FlightMode::Rtl => distance_m(v.position, home) < 1.0,
        _ => false,
    };
    if descending {
        v.landed = LandedState::Landing;
        v.alt_m = (v.alt_m - climb * dt).max(0.0);
        if v.alt_m <= 0.0 {
            info!("sim vehicle touched down, disarming");
            v.landed = LandedState::OnGround;
            v.armed = false;
            v.target = None;
            v.ground_speed_mps = 0.0;
        }
    } else if v.alt_m < v.target_alt_m {
        v.alt_m = (v.alt_m + climb * dt).min(v.target_alt_m);
        if v.alt_m >= v.target_alt_m {
            v.landed = LandedState::InAir;
        }
    } else if v.alt_m > v.target_alt_m {
        v.alt_m = (v.alt_m - climb * dt).max(v.target_alt_m);
    }
}

fn execute(w: &mut World, cmd: Command) -> AckResult {
    w.commands.push(cmd);
    if w.denied.contains(&cmd.kind()) {
        return AckResult::Denied;
    }
    let home = w.home;
    let v = &mut w.vehicle;
    let flying = v.landed != LandedState::OnGround;
    match cmd {
        Command::Arm => {
            if v.gps.fix_type < FixType::Fix3d {
                return AckResult::Failed;
            }
            v.armed = true;
        }
        Command::Disarm => {
            if flying {
                return AckResult::Denied;
            }
            v.armed = false;
        }
        Command::SetMode(mode) => {
            v.mode = mode;
            if mode == FlightMode::Rtl && flying {
                v.target = Some(home);
            }
        }
        Command::Takeoff { alt_m } => {
            if !v.armed || v.mode != FlightMode::Guided || flying {
                return AckResult::Failed;
            }
            v.target_alt_m = alt_m;
            v.landed = LandedState::Takeoff;
        }
        Command::Waypoint { target, alt_m } => {
            if !v.armed || !flying {
                return AckResult::Failed;
            }
            v.mode = FlightMode::Guided;
            v.target = Some(target);
            v.target_alt_m = alt_m;
        }
        Command::ReturnToLaunch => {
            if !flying {
                return AckResult::Failed;
            }
            v.mode = FlightMode::Rtl;
            v.target = Some(home);
        }
    }
    AckResult::Accepted
}

fn telemetry(v: &Vehicle) -> [Inbound; 4] {
    [
        Inbound::Position {
            position: v.position,
            relative_alt_m: v.alt_m,
            ground_speed_mps: v.ground_speed_mps,
            heading_deg: Some(v.heading_deg),
        },
        Inbound::Battery { remaining: v.battery },
        Inbound::Gps(v.gps),
        Inbound::Landed(v.landed),
    ]
}

async fn transport(
    sim: SimHandle,
    epoch: u64,
    mut out_rx: mpsc::Receiver<Outbound>,
    in_tx: mpsc::Sender<Inbound>,
) {
    let mut telem_tick = tokio::time::interval(TELEMETRY_TICK);
    let mut hb_tick = tokio::time::interval(HEARTBEAT_TICK);

    loop {
        let mut frames = Vec::new();
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                let mut w = sim.lock();
                if let Outbound::Command(cmd) = frame {
                    let result = execute(&mut w, cmd);
                    debug!(?cmd, ?result, "sim command");
                    if w.acks && !w.unacked.contains(&cmd.kind()) {
                        frames.push(Inbound::Ack { command: cmd.wire_id(), result });
                    }
                }
            }
            _ = telem_tick.tick() => {
                frames.extend(telemetry(&sim.lock().vehicle));
            }
            _ = hb_tick.tick() => {
                let w = sim.lock();
                if w.heartbeats {
                    frames.push(Inbound::Heartbeat {
                        armed: w.vehicle.armed,
                        custom_mode: w.vehicle.mode.custom_mode(),
                    });
                }
            }
        }
        if sim.lock().epoch != epoch {
            break;
        }
        for f in frames {
            if in_tx.send(f).await.is_err() {
                debug!("sim transport closed by link");
                return;
            }
        }
    }
    debug!("sim transport closed");
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use hemo_fc::autodetect::{autodetect_fc, AutodetectResult};
use hemo_fc::{
    Connector, Endpoint, FcConfig, Link, MavConnector, SimConfig, SimConnector, SimHandle,
};
use hemo_mission::{Audit, MissionConfig, MissionSettings, Orchestrator, TelemetryConfig};
use hemo_nav::doctor as nav_doctor;
use hemo_nav::geofence::load_zone_file;
use hemo_nav::{NoFlyZone, SafetyConfig, SafetyLimits, SafetyMonitor};
use hemo_proto::mission::{MissionOutcome, MissionRecord, MissionRequest, WeatherReport};
use hemo_proto::telemetry::{EventKind, TelemetryEvent};
use hemo_proto::GeoPoint;

#[derive(Debug, Parser)]
#[command(
    name = "hemo",
    version,
    about = "HEMOflight - blood delivery mission & safety controller"
)]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate configuration and zone data.
    Doctor,
    Fc {
        #[command(subcommand)]
        cmd: FcCmd,
    },
    /// Fly a single delivery and print its record.
    Fly {
        /// Pickup hospital as "lat,lon".
        #[arg(long)]
        from: String,
        /// Drop-off hospital as "lat,lon".
        #[arg(long)]
        to: String,
        /// Cruise altitude in metres (defaults to mission.cruise_alt_m).
        #[arg(long)]
        alt: Option<f32>,
        /// Reported surface wind in km/h, checked against safety.max_wind_kmh.
        #[arg(long, requires = "visibility_m")]
        wind_kmh: Option<f32>,
        /// Reported visibility in metres, checked against safety.min_visibility_m.
        #[arg(long, requires = "wind_kmh")]
        visibility_m: Option<f32>,
        #[arg(long, value_enum, default_value = "text")]
        events: EventFormat,
    },
    /// Serve JSON-lines mission requests from stdin, stream events to stdout.
    Run {
        #[arg(long, value_enum, default_value = "json")]
        events: EventFormat,
    },
}

#[derive(Debug, Subcommand)]
enum FcCmd {
    /// Probe serial ports/bauds for MAVLink heartbeats.
    Autodetect,
    /// Connect once and print link status and the latest telemetry.
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EventFormat {
    Json,
    Text,
    None,
}

#[derive(Debug, Deserialize)]
struct Config {
    fc: FcConfig,
    home: GeoPoint,
    #[serde(default)]
    safety: SafetyConfig,
    #[serde(default)]
    mission: MissionConfig,
    #[serde(default)]
    telemetry: TelemetryConfig,
    #[serde(default)]
    no_fly_zones: Vec<NoFlyZone>,
    /// Extra zones from a JSON file (radius in km).
    no_fly_zones_path: Option<String>,
    audit: Option<AuditCfg>,
    #[serde(default)]
    sim: SimConfig,
}

#[derive(Debug, Deserialize)]
struct AuditCfg {
    path: String,
}

/// One line on stdin for `hemo run`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Request {
    Abort { abort: String },
    Mission(MissionRequest),
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

fn zones(cfg: &Config) -> Result<Vec<NoFlyZone>> {
    let mut zones = cfg.no_fly_zones.clone();
    if let Some(p) = &cfg.no_fly_zones_path {
        zones.extend(load_zone_file(p)?);
    }
    nav_doctor::check_zones(&zones)?;
    Ok(zones)
}

/// Static checks shared by `doctor` and controller start-up. Returns the merged zones.
fn validate(cfg: &Config) -> Result<Vec<NoFlyZone>> {
    nav_doctor::check_home(cfg.home)?;
    nav_doctor::check_safety_limits(&SafetyLimits::from(&cfg.safety))?;
    let m = MissionSettings::from(&cfg.mission);
    nav_doctor::check_altitudes(m.cruise_alt_m, m.min_altitude_m, m.max_altitude_m)?;
    zones(cfg)
}

fn parse_point(s: &str) -> Result<GeoPoint> {
    let (lat, lon) = s.split_once(',').context("expected \"lat,lon\"")?;
    let p = GeoPoint::new(
        lat.trim().parse().with_context(|| format!("bad latitude in '{}'", s))?,
        lon.trim().parse().with_context(|| format!("bad longitude in '{}'", s))?,
    );
    anyhow::ensure!(p.is_valid(), "coordinates out of range: {}", s);
    Ok(p)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg).await?,
        Command::Fc { cmd } => fc_cmd(&cfg, cmd).await?,
        Command::Fly { from, to, alt, wind_kmh, visibility_m, events } => {
            let weather = match (wind_kmh, visibility_m) {
                (Some(wind_kmh), Some(visibility_m)) => {
                    Some(WeatherReport { wind_kmh, visibility_m })
                }
                _ => None,
            };
            let req = MissionRequest {
                source: parse_point(&from)?,
                destination: parse_point(&to)?,
                altitude_m: alt,
                weather,
            };
            let rec = fly(&cfg, req, events).await?;
            println!("{}", serde_json::to_string(&rec)?);
            anyhow::ensure!(rec.outcome == MissionOutcome::Completed, "mission {:?}", rec.outcome);
        }
        Command::Run { events } => run(&cfg, events).await?,
    }
    Ok(())
}

async fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    let zones = validate(cfg)?;
    info!("doctor: {} no-fly zone(s)", zones.len());

    let fc = &cfg.fc;
    if fc.autodetect {
        info!("doctor: fc autodetect enabled (OK)");
    } else {
        let ep = fc.endpoint.as_deref().context("fc.endpoint missing (autodetect=false)")?;
        let ep = Endpoint::parse(ep, fc.default_baud())?;
        info!("doctor: fc endpoint {}", ep);
    }
    anyhow::ensure!(fc.default_baud() > 0, "fc.baud invalid");

    if let Some(a) = &cfg.audit {
        Audit::open(&a.path).context("audit log not writable")?;
    }

    info!("doctor: OK");
    Ok(())
}

fn mav_connector(fc: &FcConfig) -> Arc<dyn Connector> {
    Arc::new(MavConnector::new(fc.mav_ids()))
}

async fn run_fc_autodetect(fc: &FcConfig) -> AutodetectResult {
    let (devs, bauds) = fc.candidates();
    autodetect_fc(mav_connector(fc), fc.timing(), &devs, &bauds).await
}

/// Pick the endpoint and a connector that can open it.
async fn resolve_fc(cfg: &Config) -> Result<(Endpoint, Arc<dyn Connector>, Option<SimHandle>)> {
    let fc = &cfg.fc;
    let endpoint = if fc.autodetect {
        run_fc_autodetect(fc).await.chosen.context("fc autodetect failed: no heartbeat found")?
    } else {
        let ep = fc.endpoint.as_deref().context("fc.endpoint missing (autodetect=false)")?;
        Endpoint::parse(ep, fc.default_baud())?
    };
    if endpoint == Endpoint::Sim {
        let sim = SimHandle::new(cfg.home, &cfg.sim);
        let connector: Arc<dyn Connector> = Arc::new(SimConnector::new(sim.clone()));
        return Ok((endpoint, connector, Some(sim)));
    }
    Ok((endpoint, mav_connector(fc), None))
}

async fn fc_cmd(cfg: &Config, cmd: FcCmd) -> Result<()> {
    match cmd {
        FcCmd::Autodetect => {
            let res = run_fc_autodetect(&cfg.fc).await;
            match &res.chosen {
                Some(ep) => println!("CHOSEN: {}", ep),
                None => println!("CHOSEN: none"),
            }
            for p in res.probes {
                println!(
                    "probe dev={} baud={} hb={} {}ms note={}",
                    p.dev, p.baud, p.hb_seen, p.elapsed_ms, p.note
                );
            }
            Ok(())
        }
        FcCmd::Status => {
            let (endpoint, connector, _sim) = resolve_fc(cfg).await?;
            let link = Link::new(connector, cfg.fc.timing());
            if let Err(e) = link.connect(&endpoint).await {
                println!("state={} endpoint={} error={}", link.state(), endpoint, e);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            let st = link.status();
            let t = link.telemetry();
            println!("state={}", st.state);
            if let Some(c) = &st.connection {
                println!("endpoint={} generation={}", c.endpoint, c.generation);
            }
            println!("heartbeats={} last_heartbeat_age={:?}", st.heartbeat.count, st.hb_age());
            println!(
                "mode={} armed={} battery={:?} gps={:?} position={:?} alt_m={:?}",
                t.mode.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
                t.armed,
                t.battery,
                t.gps,
                t.position,
                t.relative_alt_m
            );
            link.disconnect();
            Ok(())
        }
    }
}

/// Running controller: link with its supervisor, orchestrator and publisher loop.
struct Controller {
    orch: Orchestrator,
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Controller {
    async fn start(cfg: &Config) -> Result<Self> {
        let zones = validate(cfg).context("invalid configuration")?;
        let (endpoint, connector, _sim) = resolve_fc(cfg).await?;
        let link = Link::new(connector, cfg.fc.timing());
        link.connect(&endpoint).await.with_context(|| format!("fc connect {}", endpoint))?;

        let mut telemetry = link.subscribe_telemetry();
        let ready = tokio::time::timeout(
            Duration::from_secs(5),
            telemetry.wait_for(|t| t.position.is_some() && t.battery.is_some() && t.gps.is_some()),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
        if !ready {
            warn!("fc telemetry incomplete after 5s; missing values fail pre-flight checks");
        }

        let audit = match &cfg.audit {
            Some(a) => Audit::open(&a.path)?,
            None => Audit::off(),
        };
        let safety = Arc::new(SafetyMonitor::new(SafetyLimits::from(&cfg.safety), zones, cfg.home));
        let orch = Orchestrator::new(
            link.clone(),
            safety,
            MissionSettings::from(&cfg.mission),
            cfg.safety.poll_interval(),
            audit,
            cfg.telemetry.queue(),
        );

        let (shutdown, stop_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let sup = link.clone();
        let rx = stop_rx.clone();
        tasks.push(tokio::spawn(async move { sup.supervise(endpoint, rx).await }));
        let publisher = orch.publisher().clone();
        let interval = cfg.telemetry.interval();
        tasks.push(tokio::spawn(async move { publisher.run(interval, stop_rx).await }));

        Ok(Self { orch, shutdown, tasks })
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        for t in self.tasks {
            let _ = t.await;
        }
        self.orch.link().disconnect();
    }
}

fn print_event(ev: &TelemetryEvent, format: EventFormat) {
    match format {
        EventFormat::Json => match serde_json::to_string(ev) {
            Ok(s) => println!("{}", s),
            Err(e) => warn!("event encode failed: {}", e),
        },
        EventFormat::Text => {
            let pos = match (ev.lat, ev.lon) {
                (Some(lat), Some(lon)) => format!("{:.6},{:.6}", lat, lon),
                _ => "-".into(),
            };
            println!(
                "{:?} link={} mode={} armed={} batt={} pos={} alt={} phase={} {}",
                ev.kind,
                ev.connection,
                ev.flight_mode.as_deref().unwrap_or("-"),
                ev.armed,
                ev.battery_percent.map(|b| format!("{}%", b)).unwrap_or_else(|| "-".into()),
                pos,
                ev.alt_m.map(|a| format!("{:.1}", a)).unwrap_or_else(|| "-".into()),
                ev.mission_phase.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                ev.msg
            );
        }
        EventFormat::None => {}
    }
}

async fn fly(cfg: &Config, req: MissionRequest, events: EventFormat) -> Result<MissionRecord> {
    let ctl = Controller::start(cfg).await?;
    let mut sub = ctl.orch.publisher().subscribe();
    let id = ctl.orch.submit_mission(req)?;

    let orch = ctl.orch.clone();
    let mut done = Box::pin(async move { orch.wait_for(id).await });
    let rec = loop {
        tokio::select! {
            rec = &mut done => break rec,
            Some(ev) = sub.recv() => print_event(&ev, events),
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt: aborting mission");
                ctl.orch.abort("operator interrupt");
            }
        }
    };
    while let Some(ev) = sub.try_recv() {
        print_event(&ev, events);
    }
    ctl.stop().await;
    rec.context("mission record missing")
}

async fn run(cfg: &Config, events: EventFormat) -> Result<()> {
    info!("run: starting");
    let ctl = Controller::start(cfg).await?;
    let mut sub = ctl.orch.publisher().subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line.context("read stdin")? {
                Some(line) => handle_request(&ctl.orch, &line),
                None => {
                    info!("run: stdin closed, finishing active mission");
                    stdin_open = false;
                }
            },
            Some(ev) = sub.recv() => {
                let finished = matches!(ev.kind, EventKind::Outcome);
                print_event(&ev, events);
                if finished && !stdin_open {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if ctl.orch.abort("operator interrupt") {
                    warn!("interrupt: aborting active mission");
                } else {
                    break;
                }
            }
        }
        if !stdin_open && ctl.orch.current().is_none() {
            break;
        }
    }

    ctl.stop().await;
    info!("run: stopped");
    Ok(())
}

fn handle_request(orch: &Orchestrator, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let reply = match serde_json::from_str::<Request>(line) {
        Ok(Request::Abort { abort }) => {
            serde_json::json!({ "abort": abort, "active": orch.abort(&abort) })
        }
        Ok(Request::Mission(req)) => match orch.submit_mission(req) {
            Ok(id) => serde_json::json!({ "accepted": id }),
            Err(e) => serde_json::json!({ "rejected": e.to_string() }),
        },
        Err(e) => {
            warn!("run: bad request line: {}", e);
            serde_json::json!({ "error": format!("bad request: {}", e) })
        }
    };
    println!("{}", reply);
}

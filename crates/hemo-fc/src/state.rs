use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use hemo_proto::vehicle::LinkState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Serial { dev: String, baud: u32 },
    /// MAVLink connection URL (`udpin:`, `udpout:`, `tcpin:`, `tcpout:` ...).
    Url(String),
    /// In-process simulated vehicle.
    Sim,
}

impl Endpoint {
    /// Parse a configured endpoint. Bare device paths use `default_baud`.
    pub fn parse(s: &str, default_baud: u32) -> anyhow::Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("sim") {
            return Ok(Endpoint::Sim);
        }
        if let Some(rest) = s.strip_prefix("serial:") {
            let numeric = |b: &str| !b.is_empty() && b.bytes().all(|c| c.is_ascii_digit());
            return match rest.rsplit_once(':') {
                Some((dev, baud)) if numeric(baud) => {
                    Ok(Endpoint::Serial { dev: dev.to_string(), baud: baud.parse()? })
                }
                _ => Ok(Endpoint::Serial { dev: rest.to_string(), baud: default_baud }),
            };
        }
        if s.starts_with('/') || s.to_ascii_uppercase().starts_with("COM") {
            return Ok(Endpoint::Serial { dev: s.to_string(), baud: default_baud });
        }
        // dronekit-style "udp:" means listen
        if let Some(rest) = s.strip_prefix("udp:") {
            return Ok(Endpoint::Url(format!("udpin:{}", rest)));
        }
        const SCHEMES: [&str; 5] = ["udpin:", "udpout:", "udpbcast:", "tcpin:", "tcpout:"];
        if SCHEMES.iter().any(|p| s.starts_with(p)) {
            return Ok(Endpoint::Url(s.to_string()));
        }
        anyhow::bail!("unrecognised fc endpoint '{}'", s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial { dev, baud } => write!(f, "serial:{}:{}", dev, baud),
            Endpoint::Url(u) => f.write_str(u),
            Endpoint::Sim => f.write_str("sim"),
        }
    }
}

/// One opened transport. A reconnect produces a new generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub endpoint: Endpoint,
    pub generation: u64,
    pub opened_at: Instant,
}

/// Liveness record; only a received heartbeat moves it forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Heartbeat {
    pub last: Option<Instant>,
    pub count: u64,
}

impl Heartbeat {
    pub fn age(&self) -> Option<Duration> {
        self.last.map(|t| t.elapsed())
    }

    pub fn is_fresh(&self, timeout: Duration) -> bool {
        self.age().map(|a| a <= timeout).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub state: LinkState,
    pub connection: Option<Connection>,
    pub heartbeat: Heartbeat,
    /// Transports opened since start.
    pub opens: u64,
}

impl LinkStatus {
    pub fn hb_age(&self) -> Option<Duration> {
        self.heartbeat.age()
    }
}

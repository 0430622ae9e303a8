use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::link::{Connector, Link};
use crate::state::Endpoint;
use crate::LinkTiming;

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub dev: String,
    pub baud: u32,
    pub hb_seen: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct AutodetectResult {
    pub chosen: Option<Endpoint>,
    pub probes: Vec<ProbeResult>,
}

pub fn default_candidate_devs() -> Vec<String> {
    vec![
        "/dev/serial0".into(),
        "/dev/ttyAMA0".into(),
        "/dev/ttyUSB0".into(),
        "/dev/ttyUSB1".into(),
        "/dev/ttyACM0".into(),
        "/dev/ttyACM1".into(),
        "/dev/tty.usbmodem1".into(),
        "/dev/tty.usbserial-0001".into(),
    ]
}

pub fn default_candidate_bauds() -> Vec<u32> {
    vec![57600, 115200, 230400, 921600]
}

/// Probe every device/baud pair in order and return the first one that
/// produces an autopilot heartbeat within the startup window.
///
/// Each probe uses a throwaway link, so nothing stays open afterwards.
pub async fn autodetect_fc(
    connector: Arc<dyn Connector>,
    timing: LinkTiming,
    candidate_devs: &[String],
    candidate_bauds: &[u32],
) -> AutodetectResult {
    let mut probes = Vec::new();

    for dev in candidate_devs {
        for &baud in candidate_bauds {
            let start = Instant::now();
            let endpoint = Endpoint::Serial { dev: dev.clone(), baud };
            let link = Link::new(connector.clone(), timing);
            let res = link.connect(&endpoint).await;
            link.disconnect();
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match res {
                Ok(_) => {
                    info!("fc autodetect: OK {} @ {}", dev, baud);
                    probes.push(ProbeResult {
                        dev: dev.clone(),
                        baud,
                        hb_seen: true,
                        elapsed_ms,
                        note: "heartbeat".into(),
                    });
                    return AutodetectResult { chosen: Some(endpoint), probes };
                }
                Err(e) => {
                    warn!("fc autodetect probe failed dev={} baud={} err={}", dev, baud, e);
                    probes.push(ProbeResult {
                        dev: dev.clone(),
                        baud,
                        hb_seen: false,
                        elapsed_ms,
                        note: e.to_string(),
                    });
                }
            }
        }
    }

    AutodetectResult { chosen: None, probes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Inbound, Outbound};
    use crate::link::LinkIo;
    use tokio::sync::mpsc;

    /// Only `/dev/ttyACM0` at 115200 answers with heartbeats.
    struct OneGoodPort;

    impl Connector for OneGoodPort {
        fn open(&self, endpoint: &Endpoint) -> anyhow::Result<LinkIo> {
            let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(16);
            let (in_tx, in_rx) = mpsc::channel(16);
            let answers = *endpoint == good();
            let missing = matches!(endpoint, Endpoint::Serial { dev, .. } if dev == "/dev/missing");
            if !answers && missing {
                anyhow::bail!("no such device");
            }
            tokio::spawn(async move {
                while out_rx.recv().await.is_some() {
                    if answers {
                        let hb = Inbound::Heartbeat { armed: false, custom_mode: 0 };
                        let _ = in_tx.send(hb).await;
                    }
                }
            });
            Ok(LinkIo { tx: out_tx, rx: in_rx })
        }
    }

    fn good() -> Endpoint {
        Endpoint::Serial { dev: "/dev/ttyACM0".into(), baud: 115_200 }
    }

    #[tokio::test(start_paused = true)]
    async fn picks_first_port_with_heartbeat() {
        let devs: Vec<String> = ["/dev/missing", "/dev/ttyUSB0", "/dev/ttyACM0"]
            .iter()
            .map(|d| d.to_string())
            .collect();
        let bauds = vec![57_600, 115_200];
        let res = autodetect_fc(Arc::new(OneGoodPort), LinkTiming::default(), &devs, &bauds).await;

        assert_eq!(res.chosen, Some(good()));
        assert_eq!(res.probes.len(), 6);
        assert!(res.probes[..5].iter().all(|p| !p.hb_seen));
        assert!(res.probes[5].hb_seen);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_none_when_nothing_answers() {
        let devs = vec!["/dev/ttyUSB0".to_string()];
        let res =
            autodetect_fc(Arc::new(OneGoodPort), LinkTiming::default(), &devs, &[57_600]).await;
        assert!(res.chosen.is_none());
        assert_eq!(res.probes.len(), 1);
        assert!(res.probes[0].elapsed_ms >= 5_000);
    }
}

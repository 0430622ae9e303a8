//! Append-only audit trail, one JSON object per line.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;

use hemo_proto::mission::{MissionId, MissionOutcome, MissionPhase, SafetyReason};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuditEntry {
    MissionAccepted { source: String, destination: String, altitude_m: f32 },
    MissionRejected { error: String },
    CommandIssued { command: String, detail: String, attempt: u32 },
    CommandAcked { command: String, result: String },
    CommandTimedOut { command: String },
    CommandFailed { command: String, error: String },
    VerdictChanged { admit: bool, reasons: Vec<SafetyReason>, details: Vec<String> },
    PhaseTransition { from: MissionPhase, to: MissionPhase, reasons: Vec<SafetyReason> },
    MissionFinished { outcome: MissionOutcome, reason: Option<String> },
}

impl AuditEntry {
    /// One of the three ways an issued command can resolve.
    pub fn is_command_resolution(&self) -> bool {
        matches!(
            self,
            AuditEntry::CommandAcked { .. }
                | AuditEntry::CommandTimedOut { .. }
                | AuditEntry::CommandFailed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts_unix_ms: i64,
    pub mission_id: Option<MissionId>,
    #[serde(flatten)]
    pub entry: AuditEntry,
}

enum Sink {
    File(File),
    Memory(Vec<AuditRecord>),
    Off,
}

#[derive(Clone)]
pub struct Audit {
    sink: Arc<Mutex<Sink>>,
}

impl Audit {
    /// Append to `path`, creating it (and its directory) when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create audit dir {}", dir.display()))?;
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        Ok(Self { sink: Arc::new(Mutex::new(Sink::File(f))) })
    }

    /// Keep records in memory (tests, dry runs).
    pub fn memory() -> Self {
        Self { sink: Arc::new(Mutex::new(Sink::Memory(Vec::new()))) }
    }

    pub fn off() -> Self {
        Self { sink: Arc::new(Mutex::new(Sink::Off)) }
    }

    pub fn record(&self, mission_id: Option<MissionId>, entry: AuditEntry) {
        let rec = AuditRecord { ts_unix_ms: hemo_proto::now_unix_ms(), mission_id, entry };
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *sink {
            Sink::File(f) => {
                let res = serde_json::to_string(&rec)
                    .map_err(anyhow::Error::from)
                    .and_then(|line| writeln!(f, "{}", line).map_err(anyhow::Error::from));
                if let Err(e) = res {
                    warn!("audit write failed: {:#}", e);
                }
            }
            Sink::Memory(v) => v.push(rec),
            Sink::Off => {}
        }
    }

    /// Records held by a memory sink; empty for the other sinks.
    pub fn records(&self) -> Vec<AuditRecord> {
        match &*self.sink.lock().unwrap_or_else(|e| e.into_inner()) {
            Sink::Memory(v) => v.clone(),
            _ => Vec::new(),
        }
    }
}

/// Read a JSON-lines audit file back.
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>> {
    let s = std::fs::read_to_string(path.as_ref()).context("read audit log")?;
    s.lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, l)| serde_json::from_str(l).with_context(|| format!("audit line {}", i + 1)))
        .collect()
}

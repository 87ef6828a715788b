//! Per-agent health records and their on-disk snapshots.

use std::fmt;
use std::fs;
use std::io;

use serde::{Deserialize, Serialize};
use tracing::warn;

use hephaestus_core::store::{atomic_write, unix_millis};
use hephaestus_core::{AgentIdentity, Result, WorkPaths};

/// Health state machine position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Healthy,
    /// Missed at least one probe.
    Suspect,
    Unhealthy,
    Restarting,
    /// Recovery exhausted.
    Failed,
}

impl HealthState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Suspect => "suspect",
            Self::Unhealthy => "unhealthy",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the last probe or signal went wrong.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[default]
    None,
    /// PID gone.
    Crashed,
    RateLimited,
    TimedOut,
    /// PID alive but the log has gone quiet.
    Unresponsive,
}

impl ErrorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Crashed => "crashed",
            Self::RateLimited => "rate_limited",
            Self::TimedOut => "timed_out",
            Self::Unresponsive => "unresponsive",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most error entries kept per agent; older ones are dropped first.
pub const HISTORY_LIMIT: usize = 50;

/// One failure observed for an agent, kept for diagnosis after the fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub kind: ErrorKind,
    /// Milliseconds since the epoch.
    pub at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Recovery attempts made so far when the error was seen.
    pub recovery_attempts: u32,
}

/// Health of one agent. Written only by the health monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub identity: AgentIdentity,
    pub state: HealthState,
    /// Milliseconds since the epoch of the last successful probe.
    pub last_seen_at: Option<i64>,
    pub consecutive_failures: u32,
    pub last_error_kind: ErrorKind,
    pub recovery_attempts: u32,
    /// In-progress task released when the agent was given up on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<String>,
    /// Probing is suspended until this time (rate-limit backoff).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: i64,
    /// Oldest first, at most [`HISTORY_LIMIT`] entries. Survives recovery.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ErrorEntry>,
}

impl HealthRecord {
    pub fn new(identity: AgentIdentity) -> Self {
        Self {
            identity,
            state: HealthState::Healthy,
            last_seen_at: None,
            consecutive_failures: 0,
            last_error_kind: ErrorKind::None,
            recovery_attempts: 0,
            last_task: None,
            last_checkpoint: None,
            backoff_until: None,
            last_error: None,
            updated_at: unix_millis(),
            history: Vec::new(),
        }
    }

    pub fn in_backoff(&self, now: i64) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }

    /// Successful probe: back to Healthy with the failure streak cleared.
    pub fn observe_healthy(&mut self, now: i64) {
        self.state = HealthState::Healthy;
        self.last_seen_at = Some(now);
        self.consecutive_failures = 0;
        self.last_error_kind = ErrorKind::None;
        self.recovery_attempts = 0;
        self.backoff_until = None;
        self.last_error = None;
        self.updated_at = now;
    }

    /// Failed probe or error signal. Returns the new state.
    ///
    /// `Crashed` and `RateLimited` are Unhealthy straight away; anything else
    /// is Suspect until `threshold` consecutive failures.
    pub fn observe_failure(&mut self, kind: ErrorKind, detail: Option<String>, threshold: u32, now: i64) -> HealthState {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error_kind = kind;
        self.note_error(kind, detail.clone(), now);
        if detail.is_some() {
            self.last_error = detail;
        }
        self.state = match kind {
            ErrorKind::Crashed | ErrorKind::RateLimited => HealthState::Unhealthy,
            _ if self.consecutive_failures >= threshold => HealthState::Unhealthy,
            _ => HealthState::Suspect,
        };
        self.updated_at = now;
        self.state
    }

    /// Append to the error history, dropping the oldest entries past
    /// [`HISTORY_LIMIT`].
    pub fn note_error(&mut self, kind: ErrorKind, detail: Option<String>, now: i64) {
        self.history.push(ErrorEntry {
            kind,
            at: now,
            detail,
            recovery_attempts: self.recovery_attempts,
        });
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
        self.updated_at = now;
    }
}

/// Reads and writes `cache/health/<identity>.json`.
#[derive(Debug, Clone)]
pub struct HealthStore {
    paths: WorkPaths,
}

impl HealthStore {
    pub const fn new(paths: WorkPaths) -> Self {
        Self { paths }
    }

    pub fn load(&self, identity: AgentIdentity) -> Result<Option<HealthRecord>> {
        match fs::read_to_string(self.paths.health_file(identity)) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every snapshot for `roster`, skipping unreadable ones.
    pub fn load_all(&self, roster: &[AgentIdentity]) -> Vec<HealthRecord> {
        roster
            .iter()
            .filter_map(|id| match self.load(*id) {
                Ok(record) => record,
                Err(e) => {
                    warn!(agent = %id, error = %e, "Ignoring unreadable health snapshot");
                    None
                }
            })
            .collect()
    }

    pub fn save(&self, record: &HealthRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        atomic_write(&self.paths.health_file(record.identity), &json)
    }
}

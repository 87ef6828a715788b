//! Persisted session state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use hephaestus_core::AgentIdentity;
use hephaestus_core::store::unix_millis;

use super::types::{ProcessRecord, SessionMode};

/// Retired process records kept for `stop` idempotence and diagnostics.
const HISTORY_LIMIT: usize = 64;

/// The single orchestration session of a work directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    pub mode: SessionMode,
    pub created_at: i64,
    pub worker_count: u32,
    /// Live (non-retired) processes.
    pub processes: BTreeMap<AgentIdentity, ProcessRecord>,
    #[serde(default)]
    pub history: Vec<ProcessRecord>,
}

impl SessionState {
    pub fn new(mode: SessionMode, worker_count: u32) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            mode,
            created_at: unix_millis(),
            worker_count,
            processes: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Records whose status is not Stopped or Failed.
    pub fn active(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.processes.values().filter(|p| p.status.is_active())
    }

    /// Move a record out of the live set into history.
    pub fn retire(&mut self, record: ProcessRecord) {
        self.processes.remove(&record.identity);
        self.history.push(record);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }

    /// Most recent retired record for `identity`.
    pub fn last_retired(&self, identity: AgentIdentity) -> Option<&ProcessRecord> {
        self.history.iter().rev().find(|p| p.identity == identity)
    }

    /// Live record, or the most recent retired one.
    pub fn latest(&self, identity: AgentIdentity) -> Option<&ProcessRecord> {
        self.processes
            .get(&identity)
            .or_else(|| self.last_retired(identity))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::session::types::ProcessStatus;

    fn record(identity: AgentIdentity, pid: u32, status: ProcessStatus) -> ProcessRecord {
        ProcessRecord {
            identity,
            pid,
            started_at: 0,
            command: vec!["sleep".into()],
            log_path: PathBuf::from("/tmp/x.log"),
            status,
            restart_count: 0,
            pane_id: None,
        }
    }

    #[test]
    fn retire_moves_to_history_and_caps_it() {
        let mut state = SessionState::new(SessionMode::Fallback, 1);
        let w1 = AgentIdentity::worker(1).unwrap();
        for pid in 0..100 {
            state.processes.insert(w1, record(w1, pid, ProcessStatus::Running));
            state.retire(record(w1, pid, ProcessStatus::Stopped));
        }
        assert!(state.processes.is_empty());
        assert_eq!(state.history.len(), HISTORY_LIMIT);
        assert_eq!(state.last_retired(w1).unwrap().pid, 99);
        assert_eq!(state.latest(w1).unwrap().status, ProcessStatus::Stopped);
    }

    #[test]
    fn json_uses_identity_keys() {
        let mut state = SessionState::new(SessionMode::Presentation, 3);
        let c = AgentIdentity::coordinator();
        state.processes.insert(c, record(c, 10, ProcessStatus::Running));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["mode"], "presentation");
        assert_eq!(json["workerCount"], 3);
        assert_eq!(json["processes"]["coordinator"]["pid"], 10);
        let back: SessionState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}

//! Session registry persistence.
//!
//! Only the supervisor writes `state/session.json`; everything else reads.

use std::fs;
use std::io;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use hephaestus_core::store::{atomic_write, unix_millis};
use hephaestus_core::{AgentIdentity, Result, WorkPaths};

use super::state::SessionState;
use super::types::SessionMode;

/// Summary of a torn-down session, written by `kill`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSession {
    pub session_id: String,
    pub mode: SessionMode,
    pub worker_count: u32,
    pub created_at: i64,
    pub terminated_at: i64,
    pub agents: Vec<AgentIdentity>,
}

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    paths: WorkPaths,
}

impl SessionRegistry {
    pub const fn new(paths: WorkPaths) -> Self {
        Self { paths }
    }

    pub const fn paths(&self) -> &WorkPaths {
        &self.paths
    }

    /// The persisted session, if any.
    pub fn load(&self) -> Result<Option<SessionState>> {
        let text = match fs::read_to_string(self.paths.session_file()) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    pub fn save(&self, state: &SessionState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        atomic_write(&self.paths.session_file(), &json)?;
        debug!(session_id = %state.session_id, processes = state.processes.len(), "Session state saved");
        Ok(())
    }

    /// Delete the session file. Missing is fine.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(self.paths.session_file()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `cache/last_session_state.json` for `state`.
    pub fn save_last_session(&self, state: &SessionState) -> Result<LastSession> {
        let mut agents: Vec<AgentIdentity> = state
            .processes
            .keys()
            .copied()
            .chain(state.history.iter().map(|p| p.identity))
            .collect();
        agents.sort();
        agents.dedup();
        let last = LastSession {
            session_id: state.session_id.clone(),
            mode: state.mode,
            worker_count: state.worker_count,
            created_at: state.created_at,
            terminated_at: unix_millis(),
            agents,
        };
        let dir = self.paths.cache_dir();
        fs::create_dir_all(&dir)?;
        atomic_write(&self.paths.last_session_file(), &serde_json::to_vec_pretty(&last)?)?;
        info!(session_id = %last.session_id, "Saved last session summary");
        Ok(last)
    }

    pub fn load_last_session(&self) -> Result<Option<LastSession>> {
        let text = match fs::read_to_string(self.paths.last_session_file()) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, SessionRegistry) {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = WorkPaths::for_project(dir.path());
        paths.init().unwrap();
        (dir, SessionRegistry::new(paths))
    }

    #[test]
    fn save_load_remove() {
        let (_dir, registry) = registry();
        assert!(registry.load().unwrap().is_none());
        let state = SessionState::new(SessionMode::Fallback, 2);
        registry.save(&state).unwrap();
        assert_eq!(registry.load().unwrap().unwrap(), state);
        registry.remove().unwrap();
        registry.remove().unwrap();
        assert!(registry.load().unwrap().is_none());
    }

    #[test]
    fn last_session_summary() {
        let (_dir, registry) = registry();
        let state = SessionState::new(SessionMode::Presentation, 3);
        let saved = registry.save_last_session(&state).unwrap();
        let loaded = registry.load_last_session().unwrap().unwrap();
        assert_eq!(saved, loaded);
        assert_eq!(loaded.worker_count, 3);
        assert!(loaded.terminated_at >= loaded.created_at);
    }
}

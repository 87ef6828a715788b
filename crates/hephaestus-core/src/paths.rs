//! Layout of the shared work directory.
//!
//! ```text
//! hephaestus-work/
//! ├── config.toml
//! ├── state/session.json
//! ├── tasks/{pending,in_progress,completed,failed}/<taskId>.md
//! ├── messages/<to-identity>/<timestamp>-<id>.md
//! ├── logs/<identity>.log, logs/communication.log
//! ├── cache/health/<identity>.json, cache/last_session_state.json
//! └── checkpoints/
//! ```

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Error, Result};
use crate::identity::AgentIdentity;
use crate::task::TaskState;

/// Default name of the work directory inside a project.
pub const WORK_DIR_NAME: &str = "hephaestus-work";

/// Resolved paths inside one work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPaths {
    root: PathBuf,
}

impl WorkPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<project>/hephaestus-work`.
    pub fn for_project(project_dir: &Path) -> Self {
        Self::new(project_dir.join(WORK_DIR_NAME))
    }

    /// Create the full directory tree. Existing directories are left alone.
    pub fn init(&self) -> Result<()> {
        let dirs = [
            self.root.clone(),
            self.state_dir(),
            self.task_dir(TaskState::Pending),
            self.task_dir(TaskState::InProgress),
            self.task_dir(TaskState::Completed),
            self.task_dir(TaskState::Failed),
            self.messages_dir(),
            self.logs_dir(),
            self.health_dir(),
            self.checkpoints_dir(),
        ];
        for dir in &dirs {
            ensure_private_dir(dir)?;
        }
        info!(root = %self.root.display(), "Created work directory structure");
        Ok(())
    }

    /// Whether `init` has run here.
    pub fn is_initialized(&self) -> bool {
        self.config_file().is_file() && self.root.join("tasks").is_dir()
    }

    /// Fail with [`Error::NotInitialized`] unless `init` has run here.
    pub fn require_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized(self.root.clone()))
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn session_file(&self) -> PathBuf {
        self.state_dir().join("session.json")
    }

    pub fn task_dir(&self, state: TaskState) -> PathBuf {
        self.root.join("tasks").join(state.dir_name())
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.root.join("messages")
    }

    pub fn inbox_dir(&self, identity: AgentIdentity) -> PathBuf {
        self.messages_dir().join(identity.display_name())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn agent_log(&self, identity: AgentIdentity) -> PathBuf {
        self.logs_dir().join(format!("{identity}.log"))
    }

    pub fn communication_log(&self) -> PathBuf {
        self.logs_dir().join("communication.log")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn health_dir(&self) -> PathBuf {
        self.cache_dir().join("health")
    }

    pub fn health_file(&self, identity: AgentIdentity) -> PathBuf {
        self.health_dir().join(format!("{identity}.json"))
    }

    /// Checkpoint references written by agents, named `<identity>-*`.
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn last_session_file(&self) -> PathBuf {
        self.cache_dir().join("last_session_state.json")
    }
}

#[cfg(unix)]
fn ensure_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(dir).map_err(|e| Error::write(dir, e))?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| Error::write(dir, e))
}

#[cfg(not(unix))]
fn ensure_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| Error::write(dir, e))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_layout_but_config_marks_initialized() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = WorkPaths::for_project(dir.path());
        paths.init().unwrap();
        assert!(paths.task_dir(TaskState::InProgress).is_dir());
        assert!(paths.health_dir().is_dir());
        assert!(!paths.is_initialized());

        std::fs::write(paths.config_file(), "").unwrap();
        assert!(paths.is_initialized());
        assert!(paths.require_initialized().is_ok());
    }

    #[test]
    fn uninitialized_dir_reports_not_initialized() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = WorkPaths::for_project(dir.path());
        assert!(matches!(
            paths.require_initialized(),
            Err(Error::NotInitialized(_))
        ));
    }

    #[test]
    fn per_agent_paths() {
        let paths = WorkPaths::new("/w");
        let w2 = AgentIdentity::worker(2).unwrap();
        assert_eq!(paths.agent_log(w2), Path::new("/w/logs/worker-2.log"));
        assert_eq!(paths.inbox_dir(w2), Path::new("/w/messages/worker-2"));
        assert_eq!(
            paths.health_file(AgentIdentity::coordinator()),
            Path::new("/w/cache/health/coordinator.json")
        );
    }
}

//! Resolved work directory plus loaded configuration, shared by every
//! subcommand.

use std::path::PathBuf;

use hephaestus_core::config::load_config;
use hephaestus_core::paths::WORK_DIR_NAME;
use hephaestus_core::{Config, DirLedger, MessageStore, WorkPaths};
use hephaestus_daemon::Supervisor;

/// Everything a subcommand needs to reach the work directory.
#[derive(Debug, Clone)]
pub struct Context {
    pub paths: WorkPaths,
    pub config: Config,
}

impl Context {
    /// `work_dir` if given, otherwise `./hephaestus-work`.
    pub fn resolve_paths(work_dir: Option<PathBuf>) -> anyhow::Result<WorkPaths> {
        match work_dir {
            Some(dir) => Ok(WorkPaths::new(dir)),
            None => Ok(WorkPaths::new(std::env::current_dir()?.join(WORK_DIR_NAME))),
        }
    }

    /// Load `config.toml` (defaults when absent) with environment overrides.
    pub fn load(paths: WorkPaths) -> hephaestus_core::Result<Self> {
        let config = load_config(&paths)?;
        Ok(Self { paths, config })
    }

    pub fn require_initialized(&self) -> hephaestus_core::Result<()> {
        self.paths.require_initialized()
    }

    pub fn ledger(&self) -> DirLedger {
        DirLedger::new(self.paths.clone(), self.config.tasks.max_retries)
    }

    pub fn messages(&self) -> MessageStore {
        MessageStore::new(self.paths.clone())
    }

    pub fn supervisor(&self) -> Supervisor {
        Supervisor::new(self.paths.clone(), self.config.clone())
    }
}

//! Agent process supervisor.
//!
//! Owns every [`ProcessRecord`] and is the only writer of the session file.
//! Other components read snapshots and request status changes through the
//! methods here.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hephaestus_core::store::unix_millis;
use hephaestus_core::{AgentIdentity, Config, TaskLedger, WorkPaths};

use super::host::{
    BackgroundHost, HostError, LaunchSpec, Launched, TmuxHost, pid_alive, resolve_binary,
    signal_process,
};
use crate::session::{
    ProcessRecord, ProcessStatus, ReconcileReport, SessionMode, SessionRegistry, SessionState,
    reconcile,
};

/// Poll period while waiting for a process without a child handle to exit.
const EXIT_POLL: Duration = Duration::from_millis(100);

/// Upper bound on reaping a child after SIGKILL.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn {identity}: {reason}")]
    Spawn {
        identity: AgentIdentity,
        reason: String,
    },

    #[error("Restart limit exceeded for {identity}: {limit} restarts within {window_secs}s")]
    RestartLimitExceeded {
        identity: AgentIdentity,
        limit: u32,
        window_secs: u64,
    },

    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentIdentity),

    #[error("No active session in {}", .0.display())]
    SessionNotFound(PathBuf),

    #[error("Work directory not initialized: {} (run `hephaestus init`)", .0.display())]
    NotInitialized(PathBuf),

    #[error(transparent)]
    Core(hephaestus_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Errors that mean "nothing to do" rather than "something is broken".
    pub const fn is_nothing_to_do(&self) -> bool {
        matches!(self, Self::SessionNotFound(_))
    }
}

impl From<hephaestus_core::Error> for SupervisorError {
    fn from(err: hephaestus_core::Error) -> Self {
        match err {
            hephaestus_core::Error::NotInitialized(path) => Self::NotInitialized(path),
            other => Self::Core(other),
        }
    }
}

type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Default)]
struct Inner {
    state: Option<SessionState>,
    children: HashMap<AgentIdentity, Child>,
    restarts: HashMap<AgentIdentity, VecDeque<Instant>>,
}

/// Supervises the coordinator and worker processes of one work directory.
pub struct Supervisor {
    paths: WorkPaths,
    config: Config,
    registry: SessionRegistry,
    tmux: Option<TmuxHost>,
    inner: Mutex<Inner>,
}

impl Supervisor {
    pub fn new(paths: WorkPaths, config: Config) -> Self {
        let tmux = config.multiplexer.enabled.then(|| {
            TmuxHost::new(
                config.multiplexer.binary.clone(),
                config.multiplexer.session_name.clone(),
                config.supervisor.startup_timeout(),
            )
        });
        Self {
            registry: SessionRegistry::new(paths.clone()),
            paths,
            config,
            tmux,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub const fn paths(&self) -> &WorkPaths {
        &self.paths
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn tmux(&self) -> Option<&TmuxHost> {
        self.tmux.as_ref()
    }

    /// Configured argv for `identity`.
    pub fn command_for(&self, identity: AgentIdentity) -> Vec<String> {
        if identity.is_coordinator() {
            self.config.agents.coordinator.command.clone()
        } else {
            self.config.agents.workers.command.clone()
        }
    }

    fn require_initialized(&self) -> Result<()> {
        if self.paths.is_initialized() {
            Ok(())
        } else {
            Err(SupervisorError::NotInitialized(self.paths.root().to_path_buf()))
        }
    }

    fn session_not_found(&self) -> SupervisorError {
        SupervisorError::SessionNotFound(self.paths.root().to_path_buf())
    }

    fn new_session(&self) -> SessionState {
        let mode = if self.tmux.is_some() {
            SessionMode::Presentation
        } else {
            SessionMode::Fallback
        };
        SessionState::new(mode, self.config.agents.workers.count)
    }

    fn persist(&self, state: &SessionState) -> Result<()> {
        self.registry.save(state)?;
        Ok(())
    }

    /// Load the persisted session into memory if none is held yet. Returns
    /// whether a session exists.
    async fn load_state(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_none() {
            inner.state = self.registry.load()?;
        }
        Ok(inner.state.is_some())
    }

    async fn reconcile_loaded(&self, ledger: &dyn TaskLedger) -> Result<Option<ReconcileReport>> {
        let mut inner = self.inner.lock().await;
        inner.children.retain(|identity, child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(agent = %identity, ?status, "Reaped exited child");
                false
            }
            _ => true,
        });
        let Some(state) = inner.state.as_mut() else {
            return Ok(None);
        };
        let report = reconcile(state, ledger, pid_alive)?;
        let snapshot = state.clone();
        drop(inner);
        if !report.is_noop() {
            info!(
                purged = report.purged.len(),
                kept = report.kept.len(),
                reassigned = report.reassigned.len(),
                "Session reconciled"
            );
        }
        self.persist(&snapshot)?;
        Ok(Some(report))
    }

    /// Pick up the persisted session and reconcile it against running
    /// processes. `None` when no session exists.
    pub async fn rediscover(&self, ledger: &dyn TaskLedger) -> Result<Option<ReconcileReport>> {
        self.require_initialized()?;
        if !self.load_state().await? {
            return Ok(None);
        }
        self.reconcile_loaded(ledger).await
    }

    /// Start `command` for `identity`.
    ///
    /// Tries the multiplexer first when the session is in presentation mode;
    /// a connectivity failure switches the session to fallback mode and the
    /// agent is started in the background instead.
    pub async fn spawn(&self, identity: AgentIdentity, command: Vec<String>) -> Result<ProcessRecord> {
        self.spawn_with(identity, command, 0).await
    }

    async fn spawn_with(
        &self,
        identity: AgentIdentity,
        command: Vec<String>,
        restart_count: u32,
    ) -> Result<ProcessRecord> {
        self.require_initialized()?;
        let program = command.first().ok_or_else(|| SupervisorError::Spawn {
            identity,
            reason: "empty command".into(),
        })?;
        if resolve_binary(program).is_none() {
            return Err(SupervisorError::Spawn {
                identity,
                reason: format!("binary not found: {program}"),
            });
        }

        let mut inner = self.inner.lock().await;
        if inner.state.is_none() {
            inner.state = Some(self.registry.load()?.unwrap_or_else(|| self.new_session()));
        }
        let mode = match inner.state.as_ref() {
            Some(state) => {
                if let Some(existing) = state.processes.get(&identity)
                    && existing.status.is_active()
                    && pid_alive(existing.pid)
                {
                    return Err(SupervisorError::Spawn {
                        identity,
                        reason: format!("already running as pid {}", existing.pid),
                    });
                }
                state.mode
            }
            None => return Err(self.session_not_found()),
        };

        let spec = LaunchSpec {
            identity,
            command: command.clone(),
            cwd: self.paths.root().to_path_buf(),
            log_path: self.paths.agent_log(identity),
            env: vec![
                ("HEPHAESTUS_AGENT".into(), identity.display_name()),
                (
                    "HEPHAESTUS_WORK_DIR".into(),
                    self.paths.root().display().to_string(),
                ),
            ],
        };
        let (launched, actual_mode) = self.launch(mode, &spec).await?;

        let record = ProcessRecord {
            identity,
            pid: launched.pid,
            started_at: unix_millis(),
            command,
            log_path: spec.log_path,
            status: ProcessStatus::Starting,
            restart_count,
            pane_id: launched.pane_id,
        };
        let snapshot = {
            let Some(state) = inner.state.as_mut() else {
                return Err(self.session_not_found());
            };
            if state.mode != actual_mode {
                warn!(from = %state.mode, to = %actual_mode, "Session mode changed");
                state.mode = actual_mode;
            }
            state.processes.insert(identity, record.clone());
            state.clone()
        };
        match launched.child {
            Some(child) => {
                inner.children.insert(identity, child);
            }
            None => {
                inner.children.remove(&identity);
            }
        }
        drop(inner);

        self.persist(&snapshot)?;
        info!(agent = %identity, pid = record.pid, mode = %actual_mode, restart_count, "Agent spawned");
        Ok(record)
    }

    async fn launch(
        &self,
        mode: SessionMode,
        spec: &LaunchSpec,
    ) -> Result<(Launched, SessionMode)> {
        if mode == SessionMode::Presentation
            && let Some(tmux) = &self.tmux
        {
            match tmux.launch(spec).await {
                Ok(launched) => return Ok((launched, SessionMode::Presentation)),
                Err(HostError::Unavailable(reason)) => {
                    warn!(
                        agent = %spec.identity,
                        %reason,
                        "Multiplexer unavailable, falling back to background processes"
                    );
                }
                Err(HostError::Failed(reason)) => {
                    return Err(SupervisorError::Spawn {
                        identity: spec.identity,
                        reason,
                    });
                }
            }
        }
        let launched = BackgroundHost
            .launch(spec)
            .map_err(|e| SupervisorError::Spawn {
                identity: spec.identity,
                reason: e.to_string(),
            })?;
        Ok((launched, SessionMode::Fallback))
    }

    /// Stop `identity`: SIGTERM, then SIGKILL after the grace period (or
    /// SIGKILL straight away when `graceful` is false).
    ///
    /// Stopping an agent that is already stopped returns its terminal record
    /// again without error.
    pub async fn stop(&self, identity: AgentIdentity, graceful: bool) -> Result<ProcessRecord> {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.state.as_mut() else {
            return Err(self.session_not_found());
        };
        let Some(mut record) = state.processes.get(&identity).cloned() else {
            return state
                .last_retired(identity)
                .cloned()
                .ok_or(SupervisorError::UnknownAgent(identity));
        };
        record.status = ProcessStatus::Stopped;
        state.retire(record.clone());
        let snapshot = state.clone();
        let child = inner.children.remove(&identity);
        drop(inner);

        self.persist(&snapshot)?;
        self.terminate(&record, child, graceful).await;
        info!(agent = %identity, pid = record.pid, graceful, "Agent stopped");
        Ok(record)
    }

    async fn terminate(&self, record: &ProcessRecord, mut child: Option<Child>, graceful: bool) {
        let pid = record.pid;
        let grace = self.config.supervisor.grace_period();
        let exited = graceful
            && signal_process(pid, Signal::SIGTERM)
            && wait_exit(pid, child.as_mut(), grace).await;
        if !exited {
            if graceful && pid_alive(pid) {
                warn!(agent = %record.identity, pid, "Timeout waiting for graceful shutdown, killing");
            }
            signal_process(pid, Signal::SIGKILL);
            if let Some(child) = child.as_mut() {
                let _ = tokio::time::timeout(REAP_TIMEOUT, child.wait()).await;
            }
        }
        if let (Some(pane), Some(tmux)) = (&record.pane_id, &self.tmux) {
            tmux.kill_pane(pane).await;
        }
    }

    /// Stop then start `identity` with its previous command.
    ///
    /// Fails with [`SupervisorError::RestartLimitExceeded`] once
    /// `restart_limit` restarts have been attempted within the rolling
    /// `restart_window`.
    pub async fn restart(&self, identity: AgentIdentity) -> Result<ProcessRecord> {
        let (command, restart_count, snapshot) = {
            let mut inner = self.inner.lock().await;
            let inner = &mut *inner;
            let Some(state) = inner.state.as_mut() else {
                return Err(self.session_not_found());
            };
            let latest = state
                .latest(identity)
                .cloned()
                .ok_or(SupervisorError::UnknownAgent(identity))?;

            let limit = self.config.supervisor.restart_limit;
            let window = self.config.supervisor.restart_window();
            let now = Instant::now();
            let attempts = inner.restarts.entry(identity).or_default();
            while attempts
                .front()
                .is_some_and(|at| now.duration_since(*at) > window)
            {
                attempts.pop_front();
            }
            if attempts.len() >= limit as usize {
                return Err(SupervisorError::RestartLimitExceeded {
                    identity,
                    limit,
                    window_secs: window.as_secs(),
                });
            }
            attempts.push_back(now);

            let snapshot = if let Some(live) = state.processes.get_mut(&identity) {
                live.status = ProcessStatus::Restarting;
                Some(state.clone())
            } else {
                None
            };
            (latest.command, latest.restart_count + 1, snapshot)
        };
        if let Some(snapshot) = snapshot {
            self.persist(&snapshot)?;
        }

        self.stop(identity, true).await?;
        info!(agent = %identity, restart_count, "Restarting agent");
        self.spawn_with(identity, command, restart_count).await
    }

    /// Snapshot of all processes that are neither Stopped nor Failed.
    pub async fn list_active(&self) -> Vec<ProcessRecord> {
        let inner = self.inner.lock().await;
        inner
            .state
            .as_ref()
            .map(|s| s.active().cloned().collect())
            .unwrap_or_default()
    }

    /// Live record for `identity`, or its most recent retired record.
    pub async fn get(&self, identity: AgentIdentity) -> Option<ProcessRecord> {
        let inner = self.inner.lock().await;
        inner.state.as_ref()?.latest(identity).cloned()
    }

    pub async fn session(&self) -> Option<SessionState> {
        self.inner.lock().await.state.clone()
    }

    /// Whether the process for `identity` is still running.
    pub async fn is_alive(&self, identity: AgentIdentity) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(child) = inner.children.get_mut(&identity) {
            match child.try_wait() {
                Ok(None) => return true,
                Ok(Some(status)) => {
                    debug!(agent = %identity, ?status, "Child exited");
                    inner.children.remove(&identity);
                    return false;
                }
                Err(e) => debug!(agent = %identity, error = %e, "try_wait failed"),
            }
        }
        inner
            .state
            .as_ref()
            .and_then(|s| s.processes.get(&identity))
            .is_some_and(|p| p.status.is_active() && pid_alive(p.pid))
    }

    /// Record a status transition requested by the health monitor.
    pub async fn set_status(&self, identity: AgentIdentity, status: ProcessStatus) -> Result<()> {
        let snapshot = {
            let mut inner = self.inner.lock().await;
            let Some(state) = inner.state.as_mut() else {
                return Err(self.session_not_found());
            };
            match state.processes.get_mut(&identity) {
                Some(record) if record.status != status => {
                    debug!(agent = %identity, from = %record.status, to = %status, "Process status changed");
                    record.status = status;
                    state.clone()
                }
                Some(_) => return Ok(()),
                None => return Err(SupervisorError::UnknownAgent(identity)),
            }
        };
        self.persist(&snapshot)
    }

    /// Give up on `identity`: kill anything left and retire it as Failed.
    pub async fn mark_failed(&self, identity: AgentIdentity) -> Result<ProcessRecord> {
        let (record, child, snapshot) = {
            let mut inner = self.inner.lock().await;
            let inner = &mut *inner;
            let Some(state) = inner.state.as_mut() else {
                return Err(self.session_not_found());
            };
            let record = if let Some(mut live) = state.processes.get(&identity).cloned() {
                live.status = ProcessStatus::Failed;
                state.retire(live.clone());
                live
            } else {
                let retired = state
                    .history
                    .iter_mut()
                    .rev()
                    .find(|p| p.identity == identity)
                    .ok_or(SupervisorError::UnknownAgent(identity))?;
                retired.status = ProcessStatus::Failed;
                retired.clone()
            };
            (record, inner.children.remove(&identity), state.clone())
        };
        self.persist(&snapshot)?;
        if pid_alive(record.pid) || child.is_some() {
            self.terminate(&record, child, false).await;
        }
        warn!(agent = %identity, pid = record.pid, "Agent marked failed");
        Ok(record)
    }

    /// Whether the session this supervisor holds is still the registered
    /// one. False after another process ran `kill`.
    pub async fn is_registered(&self) -> bool {
        let held = self
            .inner
            .lock()
            .await
            .state
            .as_ref()
            .map(|s| s.session_id.clone());
        match (held, self.registry.load()) {
            (Some(held), Ok(Some(stored))) => stored.session_id == held,
            _ => false,
        }
    }

    /// Start the coordinator and the configured number of workers.
    ///
    /// An existing session is picked up: workers above the configured count
    /// are stopped, dead agents are purged (their tasks released) and only
    /// missing agents are spawned.
    pub async fn start_session(&self, ledger: &dyn TaskLedger) -> Result<SessionState> {
        self.require_initialized()?;
        let worker_count = self.config.agents.workers.count;

        if self.load_state().await? {
            let extra: Vec<AgentIdentity> = self
                .list_active()
                .await
                .into_iter()
                .map(|p| p.identity)
                .filter(|id| !id.is_coordinator() && id.index() > worker_count)
                .collect();
            for identity in extra {
                info!(agent = %identity, worker_count, "Stopping worker beyond configured count");
                self.stop(identity, true).await?;
            }
        }
        let snapshot = {
            let mut inner = self.inner.lock().await;
            let state = inner.state.get_or_insert_with(|| self.new_session());
            state.worker_count = worker_count;
            state.clone()
        };
        self.persist(&snapshot)?;
        self.reconcile_loaded(ledger).await?;

        for identity in AgentIdentity::roster(worker_count) {
            if self.is_alive(identity).await {
                debug!(agent = %identity, "Agent already running");
                continue;
            }
            self.spawn(identity, self.command_for(identity)).await?;
        }

        let session = self.session().await.ok_or_else(|| self.session_not_found())?;
        info!(
            session_id = %session.session_id,
            mode = %session.mode,
            agents = session.processes.len(),
            "Session started"
        );
        Ok(session)
    }

    /// Stop every agent, tear down the multiplexer session, save the
    /// last-session summary and remove the session file.
    pub async fn shutdown(&self, graceful: bool) -> Result<SessionState> {
        self.require_initialized()?;
        if !self.load_state().await? {
            return Err(self.session_not_found());
        }
        for record in self.list_active().await {
            if let Err(e) = self.stop(record.identity, graceful).await {
                warn!(agent = %record.identity, error = %e, "Failed to stop agent");
            }
        }

        let state = {
            let mut inner = self.inner.lock().await;
            inner.children.clear();
            inner.state.take()
        }
        .ok_or_else(|| self.session_not_found())?;

        if state.mode == SessionMode::Presentation
            && let Some(tmux) = &self.tmux
        {
            tmux.kill_session().await;
        }
        self.registry.save_last_session(&state)?;
        self.registry.remove()?;
        info!(session_id = %state.session_id, "Session terminated");
        Ok(state)
    }
}

/// Wait up to `grace` for `pid` to exit.
async fn wait_exit(pid: u32, child: Option<&mut Child>, grace: Duration) -> bool {
    if let Some(child) = child {
        return tokio::time::timeout(grace, child.wait()).await.is_ok();
    }
    let deadline = Instant::now() + grace;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use hephaestus_core::DirLedger;

    use super::*;

    fn setup(configure: impl FnOnce(&mut Config)) -> (tempfile::TempDir, Supervisor) {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = WorkPaths::for_project(dir.path());
        paths.init().unwrap();
        let mut config = Config::default();
        config.multiplexer.enabled = false;
        config.agents.coordinator.command = vec!["sleep".into(), "600".into()];
        config.agents.workers.command = vec!["sleep".into(), "600".into()];
        config.agents.workers.count = 2;
        config.supervisor.grace_period_secs = 2;
        configure(&mut config);
        std::fs::write(paths.config_file(), config.to_toml().unwrap()).unwrap();
        (dir, Supervisor::new(paths, config))
    }

    fn w(n: u32) -> AgentIdentity {
        AgentIdentity::worker(n).unwrap()
    }

    #[tokio::test]
    async fn spawn_requires_initialized_work_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let supervisor = Supervisor::new(WorkPaths::for_project(dir.path()), Config::default());
        let err = supervisor
            .spawn(w(1), vec!["sleep".into(), "1".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn spawn_unresolvable_binary_is_spawn_error() {
        let (_dir, supervisor) = setup(|_| {});
        let err = supervisor
            .spawn(w(1), vec!["no-such-agent-binary-xyz".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(supervisor.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn spawn_persists_record_and_stop_is_idempotent() {
        let (_dir, supervisor) = setup(|_| {});
        let record = supervisor
            .spawn(w(1), vec!["sleep".into(), "600".into()])
            .await
            .unwrap();
        assert_eq!(record.status, ProcessStatus::Starting);
        assert!(supervisor.is_alive(w(1)).await);

        let stored = SessionRegistry::new(supervisor.paths().clone())
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(stored.processes[&w(1)].pid, record.pid);
        assert_eq!(stored.mode, SessionMode::Fallback);

        let first = supervisor.stop(w(1), true).await.unwrap();
        let second = supervisor.stop(w(1), true).await.unwrap();
        assert_eq!(first.status, ProcessStatus::Stopped);
        assert_eq!(first, second);
        assert!(!pid_alive(record.pid));
        assert!(supervisor.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn stop_escalates_to_kill_when_term_is_ignored() {
        let (_dir, supervisor) = setup(|c| c.supervisor.grace_period_secs = 1);
        let record = supervisor
            .spawn(
                w(1),
                vec!["sh".into(), "-c".into(), "trap '' TERM; sleep 600".into()],
            )
            .await
            .unwrap();
        let started = Instant::now();
        supervisor.stop(w(1), true).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(!pid_alive(record.pid));
    }

    #[tokio::test]
    async fn restart_counts_and_enforces_window_limit() {
        let (_dir, supervisor) = setup(|c| c.supervisor.restart_limit = 1);
        let first = supervisor
            .spawn(w(1), vec!["sleep".into(), "600".into()])
            .await
            .unwrap();
        let second = supervisor.restart(w(1)).await.unwrap();
        assert_ne!(first.pid, second.pid);
        assert_eq!(second.restart_count, 1);
        assert!(!pid_alive(first.pid));

        let err = supervisor.restart(w(1)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::RestartLimitExceeded { limit: 1, .. }));
        supervisor.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn restart_unknown_agent() {
        let (_dir, supervisor) = setup(|_| {});
        supervisor
            .spawn(w(1), vec!["sleep".into(), "600".into()])
            .await
            .unwrap();
        assert!(matches!(
            supervisor.restart(w(2)).await,
            Err(SupervisorError::UnknownAgent(_))
        ));
        supervisor.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn start_session_then_shutdown() {
        let (_dir, supervisor) = setup(|_| {});
        let ledger = DirLedger::new(supervisor.paths().clone(), 3);
        let session = supervisor.start_session(&ledger).await.unwrap();
        assert_eq!(session.processes.len(), 3);
        assert_eq!(session.worker_count, 2);
        assert_eq!(supervisor.list_active().await.len(), 3);
        assert!(supervisor.is_registered().await);

        // Starting again spawns nothing new.
        let again = supervisor.start_session(&ledger).await.unwrap();
        assert_eq!(again.session_id, session.session_id);
        assert_eq!(
            again.processes[&w(1)].pid,
            session.processes[&w(1)].pid
        );

        let pids: Vec<u32> = session.processes.values().map(|p| p.pid).collect();
        let ended = supervisor.shutdown(true).await.unwrap();
        assert_eq!(ended.session_id, session.session_id);
        assert!(pids.iter().all(|pid| !pid_alive(*pid)));

        let registry = SessionRegistry::new(supervisor.paths().clone());
        assert!(registry.load().unwrap().is_none());
        assert_eq!(
            registry.load_last_session().unwrap().unwrap().session_id,
            session.session_id
        );
        assert!(matches!(
            supervisor.shutdown(true).await,
            Err(SupervisorError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn mark_failed_retires_and_kills() {
        let (_dir, supervisor) = setup(|_| {});
        let record = supervisor
            .spawn(w(2), vec!["sleep".into(), "600".into()])
            .await
            .unwrap();
        let failed = supervisor.mark_failed(w(2)).await.unwrap();
        assert_eq!(failed.status, ProcessStatus::Failed);
        assert!(!pid_alive(record.pid));
        assert!(supervisor.list_active().await.is_empty());
        assert_eq!(
            supervisor.get(w(2)).await.unwrap().status,
            ProcessStatus::Failed
        );
    }

    #[test]
    fn session_not_found_is_nothing_to_do() {
        assert!(SupervisorError::SessionNotFound(PathBuf::from("/w")).is_nothing_to_do());
        assert!(!SupervisorError::NotInitialized(PathBuf::from("/w")).is_nothing_to_do());
    }
}

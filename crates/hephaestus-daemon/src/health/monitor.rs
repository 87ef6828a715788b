//! The health monitor control loop.
//!
//! Each cycle reads new error signals from the coordinator inbox, probes
//! every active agent concurrently (each probe bounded by `probe_timeout`)
//! and advances the per-agent health state machine. Agents that become
//! Unhealthy are recovered on their own task, so a slow recovery never holds
//! up probing of the others; an agent is not probed again until its recovery
//! has finished. Process state is only ever changed through the
//! [`Supervisor`].

use std::collections::{HashMap, HashSet};
use std::fs;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use hephaestus_core::config::MonitoringConfig;
use hephaestus_core::store::{unix_micros, unix_millis};
use hephaestus_core::{
    AgentIdentity, MessageEnvelope, MessageStore, MessageType, Priority, TaskLedger, WorkPaths,
};

use super::classify::classify_signal;
use super::record::{ErrorKind, HealthRecord, HealthState, HealthStore};
use crate::session::{ProcessRecord, ProcessStatus};
use crate::subprocess::{Supervisor, SupervisorError};

/// What one cycle did. Recoveries are reported by the cycle that sees them
/// finish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub probed: Vec<AgentIdentity>,
    pub recovered: Vec<AgentIdentity>,
    pub failed: Vec<AgentIdentity>,
    /// The session was torn down by someone else; the loop should end.
    pub session_ended: bool,
}

impl CycleReport {
    fn tally(&mut self, joined: Result<(AgentIdentity, Recovery), JoinError>) {
        match joined {
            Ok((identity, Recovery::Recovered)) => self.recovered.push(identity),
            Ok((identity, Recovery::Failed)) => self.failed.push(identity),
            Ok((_, Recovery::Abandoned)) => {}
            Err(e) => warn!(error = %e, "Recovery task failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Alive,
    Dead,
    Silent(Duration),
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Recovered,
    Failed,
    /// Shutdown arrived first.
    Abandoned,
}

struct MonitorState {
    records: HashMap<AgentIdentity, HealthRecord>,
    /// Newest coordinator-inbox timestamp already scanned for signals.
    watermark: i64,
    /// Agents with a recovery in flight.
    recovering: HashSet<AgentIdentity>,
}

/// Probes supervised agents and drives recovery.
pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    ledger: Arc<dyn TaskLedger>,
    messages: MessageStore,
    store: HealthStore,
    config: MonitoringConfig,
    state: Mutex<MonitorState>,
    recoveries: Mutex<JoinSet<(AgentIdentity, Recovery)>>,
    shutdown: watch::Receiver<bool>,
}

impl HealthMonitor {
    /// Builds a monitor and reloads persisted health snapshots.
    pub fn new(
        supervisor: Arc<Supervisor>,
        ledger: Arc<dyn TaskLedger>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let paths = supervisor.paths().clone();
        let config = supervisor.config().monitoring.clone();
        let store = HealthStore::new(paths.clone());
        let roster = AgentIdentity::roster(supervisor.config().agents.workers.count);
        let records = store
            .load_all(&roster)
            .into_iter()
            .map(|r| (r.identity, r))
            .collect();
        Self {
            messages: MessageStore::new(paths),
            store,
            config,
            state: Mutex::new(MonitorState {
                records,
                watermark: unix_micros(),
                recovering: HashSet::new(),
            }),
            recoveries: Mutex::new(JoinSet::new()),
            supervisor,
            ledger,
            shutdown,
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Snapshot of the current health records.
    pub async fn records(&self) -> Vec<HealthRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state.records.values().cloned().collect();
        records.sort_by_key(|r| r.identity);
        records
    }

    /// Persist `record` and make it the monitor's current view.
    async fn commit(&self, record: &HealthRecord) {
        if let Err(e) = self.store.save(record) {
            warn!(agent = %record.identity, error = %e, "Failed to persist health record");
        }
        self.state
            .lock()
            .await
            .records
            .insert(record.identity, record.clone());
    }

    /// One probe-classify cycle. Agents that turn Unhealthy get a recovery
    /// task; this call does not wait for it.
    pub async fn run_once(self: &Arc<Self>) -> CycleReport {
        let mut report = CycleReport::default();
        {
            let mut recoveries = self.recoveries.lock().await;
            while let Some(joined) = recoveries.try_join_next() {
                report.tally(joined);
            }
        }
        if self.stopping() {
            return report;
        }
        if !self.supervisor.is_registered().await {
            report.session_ended = true;
            return report;
        }

        let (signals, skip) = {
            let mut state = self.state.lock().await;
            let signals = self.collect_signals(&mut state);
            let now = unix_millis();
            let mut skip = state.recovering.clone();
            skip.extend(
                state
                    .records
                    .values()
                    .filter(|r| r.in_backoff(now))
                    .map(|r| r.identity),
            );
            (signals, skip)
        };
        let outcomes = self.probe_all(&skip).await;

        let now = unix_millis();
        let threshold = self.config.failure_threshold;
        let mut status_updates = Vec::new();
        let mut to_recover = Vec::new();
        {
            let mut state = self.state.lock().await;
            for (identity, probe) in outcomes {
                if self.stopping() {
                    return report;
                }
                report.probed.push(identity);
                let record = state
                    .records
                    .entry(identity)
                    .or_insert_with(|| HealthRecord::new(identity));

                let failure = match (probe, signals.get(&identity)) {
                    (Probe::Dead, _) => Some((ErrorKind::Crashed, "process exited".to_string())),
                    (_, Some((kind, detail))) => Some((*kind, detail.clone())),
                    (Probe::Silent(quiet), None) => Some((
                        ErrorKind::Unresponsive,
                        format!("no log output for {}s", quiet.as_secs()),
                    )),
                    (Probe::TimedOut, None) => {
                        Some((ErrorKind::TimedOut, "health probe timed out".to_string()))
                    }
                    (Probe::Alive, None) => None,
                };

                let Some((kind, detail)) = failure else {
                    if record.state != HealthState::Healthy {
                        info!(agent = %identity, from = %record.state, "Agent healthy again");
                    }
                    record.observe_healthy(now);
                    self.save(record);
                    status_updates.push((identity, ProcessStatus::Running));
                    continue;
                };

                let next = record.observe_failure(kind, Some(detail), threshold, now);
                warn!(
                    agent = %identity,
                    kind = %kind,
                    state = %next,
                    failures = record.consecutive_failures,
                    "Health check failed"
                );
                if kind == ErrorKind::RateLimited {
                    let backoff = self.config.retry_delay().saturating_mul(2);
                    record.backoff_until = Some(
                        now.saturating_add(i64::try_from(backoff.as_millis()).unwrap_or(i64::MAX)),
                    );
                    info!(agent = %identity, backoff_secs = backoff.as_secs(), "Rate limited, backing off");
                } else if next == HealthState::Unhealthy {
                    to_recover.push(identity);
                }
                self.save(record);
                if next == HealthState::Unhealthy {
                    status_updates.push((identity, ProcessStatus::Unhealthy));
                }
            }
            state.recovering.extend(to_recover.iter().copied());
        }

        for (identity, status) in status_updates {
            self.request_status(identity, status).await;
        }
        if !to_recover.is_empty() {
            let mut recoveries = self.recoveries.lock().await;
            for identity in to_recover {
                let monitor = Arc::clone(self);
                recoveries.spawn(async move {
                    let outcome = monitor.recover(identity).await;
                    monitor.state.lock().await.recovering.remove(&identity);
                    (identity, outcome)
                });
            }
        }
        report
    }

    /// Wait for every recovery in flight and report how they ended.
    pub async fn drain_recoveries(&self) -> CycleReport {
        let mut pending = std::mem::take(&mut *self.recoveries.lock().await);
        let mut report = CycleReport::default();
        while let Some(joined) = pending.join_next().await {
            report.tally(joined);
        }
        report
    }

    fn save(&self, record: &HealthRecord) {
        if let Err(e) = self.store.save(record) {
            warn!(agent = %record.identity, error = %e, "Failed to persist health record");
        }
    }

    async fn request_status(&self, identity: AgentIdentity, status: ProcessStatus) {
        match self.supervisor.set_status(identity, status).await {
            Ok(()) | Err(SupervisorError::UnknownAgent(_)) => {}
            Err(e) => debug!(agent = %identity, error = %e, "Status update rejected"),
        }
    }

    /// Error envelopes sent to the coordinator since the last cycle,
    /// classified by sender. The newest signal per sender wins.
    fn collect_signals(&self, state: &mut MonitorState) -> HashMap<AgentIdentity, (ErrorKind, String)> {
        let mut signals = HashMap::new();
        let mut sub = match self
            .messages
            .subscribe(AgentIdentity::coordinator(), state.watermark)
        {
            Ok(sub) => sub,
            Err(e) => {
                warn!(error = %e, "Failed to read coordinator inbox");
                return signals;
            }
        };
        for envelope in sub.by_ref() {
            if envelope.kind != MessageType::Error {
                continue;
            }
            if let Some(kind) = classify_signal(&envelope.body) {
                let detail = envelope.body.lines().next().unwrap_or_default().to_string();
                debug!(agent = %envelope.from, kind = %kind, "Error signal received");
                signals.insert(envelope.from, (kind, detail));
            }
        }
        state.watermark = sub.watermark();
        signals
    }

    /// Probe every active agent not in `skip`, concurrently.
    async fn probe_all(&self, skip: &HashSet<AgentIdentity>) -> Vec<(AgentIdentity, Probe)> {
        let stale_after = self.config.stale_after();
        let probe_timeout = self.config.probe_timeout();

        let mut probes = JoinSet::new();
        for process in self.supervisor.list_active().await {
            let identity = process.identity;
            if skip.contains(&identity) {
                debug!(agent = %identity, "Backing off or recovering, skipping probe");
                continue;
            }
            let supervisor = Arc::clone(&self.supervisor);
            probes.spawn(async move {
                let outcome =
                    bounded(probe_timeout, probe(&supervisor, &process, stale_after)).await;
                (identity, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "Probe task failed"),
            }
        }
        outcomes.sort_by_key(|(identity, _)| *identity);
        outcomes
    }

    async fn snapshot(&self, identity: AgentIdentity) -> HealthRecord {
        self.state
            .lock()
            .await
            .records
            .get(&identity)
            .cloned()
            .unwrap_or_else(|| HealthRecord::new(identity))
    }

    /// Restart `identity` up to `retry_attempts` times, escalating to Failed
    /// when attempts run out.
    async fn recover(&self, identity: AgentIdentity) -> Recovery {
        let mut record = self.snapshot(identity).await;
        let attempts = self.config.retry_attempts;
        record.state = HealthState::Restarting;
        self.commit(&record).await;

        for attempt in 1..=attempts {
            if self.stopping() {
                return Recovery::Abandoned;
            }
            record.recovery_attempts = attempt;
            self.commit(&record).await;
            info!(agent = %identity, attempt, attempts, "Attempting restart");

            let (detail, limited) = match self.supervisor.restart(identity).await {
                Ok(process) => {
                    if self.supervisor.is_alive(identity).await {
                        info!(agent = %identity, pid = process.pid, attempt, "Agent recovered");
                        record.observe_healthy(unix_millis());
                        self.commit(&record).await;
                        return Recovery::Recovered;
                    }
                    warn!(agent = %identity, pid = process.pid, attempt, "Restarted agent exited immediately");
                    (format!("pid {} exited right after restart", process.pid), false)
                }
                Err(e) => {
                    warn!(agent = %identity, attempt, error = %e, "Restart failed");
                    let limited = matches!(e, SupervisorError::RestartLimitExceeded { .. });
                    (e.to_string(), limited)
                }
            };
            record.note_error(record.last_error_kind, Some(detail.clone()), unix_millis());
            record.last_error = Some(detail);
            self.commit(&record).await;
            if limited {
                break;
            }

            if attempt < attempts && !self.wait_retry_delay().await {
                return Recovery::Abandoned;
            }
        }

        if self.stopping() {
            return Recovery::Abandoned;
        }
        self.escalate(&mut record).await;
        Recovery::Failed
    }

    /// Sleep `retry_delay`; false if shutdown was requested meanwhile.
    async fn wait_retry_delay(&self) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            () = tokio::time::sleep(self.config.retry_delay()) => !self.stopping(),
            _ = shutdown.changed() => false,
        }
    }

    /// Give up on an agent: retire its process, release its tasks, record
    /// the context and tell the coordinator.
    async fn escalate(&self, record: &mut HealthRecord) {
        let identity = record.identity;
        error!(
            agent = %identity,
            attempts = record.recovery_attempts,
            kind = %record.last_error_kind,
            "Recovery exhausted, marking agent failed"
        );
        if let Err(e) = self.supervisor.mark_failed(identity).await {
            warn!(agent = %identity, error = %e, "Failed to retire agent process");
        }

        let mut released = Vec::new();
        match self.ledger.in_progress_for(identity) {
            Ok(held) => {
                for task in held {
                    match self.ledger.reassign(&task.task_id) {
                        Ok(moved) => {
                            info!(task_id = %moved.task_id, agent = %identity, state = %moved.state, "Released task of failed agent");
                            released.push(moved.task_id);
                        }
                        Err(e) if e.is_noop() => {
                            debug!(task_id = %task.task_id, "Task already moved");
                        }
                        Err(e) => {
                            error!(task_id = %task.task_id, error = %e, "Failed to release task");
                        }
                    }
                }
            }
            Err(e) => error!(agent = %identity, error = %e, "Failed to list in-progress tasks"),
        }

        if let Some(task_id) = released.last() {
            record.last_task = Some(task_id.clone());
        }
        record.last_checkpoint = latest_checkpoint(self.supervisor.paths(), identity);
        record.state = HealthState::Failed;
        record.updated_at = unix_millis();
        self.commit(record).await;

        let mut body = format!(
            "Agent {identity} failed after {} restart attempts ({}).\n",
            record.recovery_attempts, record.last_error_kind
        );
        if let Some(err) = &record.last_error {
            body.push_str(&format!("Last error: {err}\n"));
        }
        if released.is_empty() {
            body.push_str("No in-progress tasks were held.\n");
        } else {
            body.push_str(&format!("Released tasks: {}\n", released.join(", ")));
        }
        if let Some(checkpoint) = &record.last_checkpoint {
            body.push_str(&format!("Last checkpoint: {checkpoint}\n"));
        }
        let envelope = MessageEnvelope::status(identity, AgentIdentity::coordinator(), body)
            .with_priority(Priority::High);
        if let Err(e) = self.messages.publish(envelope) {
            error!(agent = %identity, error = %e, "Failed to notify coordinator");
        }
    }

    /// Run [`run_once`](Self::run_once) every `health_check_interval` until
    /// shutdown is signalled or the session disappears. Recoveries in flight
    /// at that point are waited for; after shutdown they take no further
    /// actions.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.config.interval());
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await; // Skip first immediate tick

            info!(interval_secs = self.config.interval().as_secs(), "Health monitor started");
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let report = self.run_once().await;
                        if !report.recovered.is_empty() || !report.failed.is_empty() {
                            info!(
                                probed = report.probed.len(),
                                recovered = report.recovered.len(),
                                failed = report.failed.len(),
                                "Health cycle complete"
                            );
                        }
                        if report.session_ended {
                            info!("Session no longer registered, health monitor stopping");
                            break;
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
            self.drain_recoveries().await;
        })
    }
}

/// Run a probe, reporting [`Probe::TimedOut`] if it takes longer than
/// `limit`.
async fn bounded(limit: Duration, probe: impl Future<Output = Probe>) -> Probe {
    tokio::time::timeout(limit, probe)
        .await
        .unwrap_or(Probe::TimedOut)
}

async fn probe(supervisor: &Supervisor, process: &ProcessRecord, stale_after: Duration) -> Probe {
    if !supervisor.is_alive(process.identity).await {
        return Probe::Dead;
    }
    let modified = tokio::fs::metadata(&process.log_path)
        .await
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
    let last_activity = modified.max(process.started_at);
    let quiet = unix_millis().saturating_sub(last_activity);
    let quiet = Duration::from_millis(u64::try_from(quiet).unwrap_or(0));
    if quiet > stale_after {
        Probe::Silent(quiet)
    } else {
        Probe::Alive
    }
}

/// File name of the newest checkpoint belonging to `identity`: files in
/// `checkpoints/` named `<identity>` or `<identity>-…`/`<identity>.…`.
fn latest_checkpoint(paths: &WorkPaths, identity: AgentIdentity) -> Option<String> {
    let prefix = identity.to_string();
    fs::read_dir(paths.checkpoints_dir())
        .ok()?
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let rest = name.strip_prefix(&prefix)?;
            if !(rest.is_empty() || rest.starts_with(['-', '.', '_'])) {
                return None;
            }
            let modified = entry.metadata().ok()?.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, name))
        })
        .max()
        .map(|(_, name)| name)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use hephaestus_core::{Config, DirLedger, TaskState};

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        supervisor: Arc<Supervisor>,
        ledger: Arc<DirLedger>,
        monitor: Arc<HealthMonitor>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn fixture(configure: impl FnOnce(&mut Config)) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = WorkPaths::for_project(dir.path());
        paths.init().unwrap();
        let mut config = Config::default();
        config.multiplexer.enabled = false;
        config.agents.workers.count = 1;
        config.agents.coordinator.command = vec!["sleep".into(), "600".into()];
        config.agents.workers.command = vec!["sleep".into(), "600".into()];
        config.monitoring.retry_attempts = 1;
        config.monitoring.retry_delay_secs = 1;
        config.monitoring.stale_after_intervals = 1000;
        config.supervisor.grace_period_secs = 1;
        configure(&mut config);
        std::fs::write(paths.config_file(), config.to_toml().unwrap()).unwrap();

        let supervisor = Arc::new(Supervisor::new(paths.clone(), config));
        let ledger = Arc::new(DirLedger::new(paths, 3));
        let (tx, rx) = watch::channel(false);
        let monitor = Arc::new(HealthMonitor::new(Arc::clone(&supervisor), ledger.clone(), rx));
        Fixture {
            _dir: dir,
            supervisor,
            ledger,
            monitor,
            shutdown_tx: tx,
        }
    }

    fn w1() -> AgentIdentity {
        AgentIdentity::worker(1).unwrap()
    }

    #[tokio::test]
    async fn healthy_agents_stay_healthy() {
        let f = fixture(|_| {});
        f.supervisor.start_session(f.ledger.as_ref()).await.unwrap();
        let report = f.monitor.run_once().await;
        assert_eq!(report.probed.len(), 2);
        assert!(report.failed.is_empty());
        let records = f.monitor.records().await;
        assert!(records.iter().all(|r| r.state == HealthState::Healthy));
        assert_eq!(
            f.supervisor.get(w1()).await.unwrap().status,
            ProcessStatus::Running
        );
        f.supervisor.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn crashed_agent_is_restarted() {
        let f = fixture(|_| {});
        f.supervisor.start_session(f.ledger.as_ref()).await.unwrap();
        let before = f.supervisor.get(w1()).await.unwrap();
        crate::subprocess::host::signal_process(before.pid, nix::sys::signal::Signal::SIGKILL);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = f.monitor.run_once().await;
        assert_eq!(report.probed, [AgentIdentity::coordinator(), w1()]);
        assert!(report.recovered.is_empty());
        let report = f.monitor.drain_recoveries().await;
        assert_eq!(report.recovered, [w1()]);
        let after = f.supervisor.get(w1()).await.unwrap();
        assert_ne!(after.pid, before.pid);
        assert_eq!(after.restart_count, 1);
        let record = f.monitor.store.load(w1()).unwrap().unwrap();
        assert_eq!(record.state, HealthState::Healthy);
        f.supervisor.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn rate_limit_signal_backs_off_without_restart() {
        let f = fixture(|c| c.monitoring.retry_delay_secs = 30);
        f.supervisor.start_session(f.ledger.as_ref()).await.unwrap();
        let pid = f.supervisor.get(w1()).await.unwrap().pid;
        f.monitor
            .messages
            .publish(MessageEnvelope::error(
                w1(),
                AgentIdentity::coordinator(),
                "API error: 429 Too Many Requests",
            ))
            .unwrap();

        let report = f.monitor.run_once().await;
        assert!(report.recovered.is_empty());
        let record = f.monitor.store.load(w1()).unwrap().unwrap();
        assert_eq!(record.last_error_kind, ErrorKind::RateLimited);
        assert_eq!(record.state, HealthState::Unhealthy);
        assert!(record.in_backoff(unix_millis()));
        assert_eq!(f.supervisor.get(w1()).await.unwrap().pid, pid);

        // Still backing off: not probed at all.
        let report = f.monitor.run_once().await;
        assert!(!report.probed.contains(&w1()));
        f.supervisor.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_recovery_fails_agent_and_releases_task() {
        let f = fixture(|_| {});
        let script = f.supervisor.paths().root().join("agent.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 600\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let record = f
            .supervisor
            .spawn(w1(), vec![script.display().to_string()])
            .await
            .unwrap();
        let task = f.ledger.enqueue("build it", Priority::High).unwrap();
        f.ledger.assign(&task.task_id, w1()).unwrap();
        std::fs::write(f.supervisor.paths().checkpoints_dir().join("worker-1-step3.json"), "{}").unwrap();

        std::fs::remove_file(&script).unwrap();
        crate::subprocess::host::signal_process(record.pid, nix::sys::signal::Signal::SIGKILL);
        tokio::time::sleep(Duration::from_millis(200)).await;

        f.monitor.run_once().await;
        let report = f.monitor.drain_recoveries().await;
        assert_eq!(report.failed, [w1()]);

        let health = f.monitor.store.load(w1()).unwrap().unwrap();
        assert_eq!(health.state, HealthState::Failed);
        assert_eq!(health.last_error_kind, ErrorKind::Crashed);
        assert_eq!(health.last_task.as_deref(), Some(task.task_id.as_str()));
        assert_eq!(health.last_checkpoint.as_deref(), Some("worker-1-step3.json"));

        let released = f.ledger.get(&task.task_id).unwrap().unwrap();
        assert_eq!(released.state, TaskState::Pending);
        assert_eq!(released.retry_count, 1);

        let notices: Vec<_> = f
            .monitor
            .messages
            .subscribe(AgentIdentity::coordinator(), 0)
            .unwrap()
            .filter(|m| m.kind == MessageType::Status)
            .collect();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].from, w1());
        assert_eq!(notices[0].priority, Priority::High);
        assert_eq!(
            f.supervisor.get(w1()).await.unwrap().status,
            ProcessStatus::Failed
        );
    }

    #[tokio::test]
    async fn slow_recovery_does_not_hold_up_other_agents() {
        let f = fixture(|c| {
            c.agents.workers.count = 2;
            c.monitoring.retry_attempts = 3;
            c.monitoring.retry_delay_secs = 30;
        });
        let w2 = AgentIdentity::worker(2).unwrap();
        let script = f.supervisor.paths().root().join("agent.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 600\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let stuck = f
            .supervisor
            .spawn(w1(), vec![script.display().to_string()])
            .await
            .unwrap();
        let other = f
            .supervisor
            .spawn(w2, vec!["sleep".into(), "600".into()])
            .await
            .unwrap();

        // worker-1 cannot come back: its restarts fail and wait out the delay.
        std::fs::remove_file(&script).unwrap();
        crate::subprocess::host::signal_process(stuck.pid, nix::sys::signal::Signal::SIGKILL);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let report = f.monitor.run_once().await;
        assert_eq!(report.probed, [w1(), w2]);

        crate::subprocess::host::signal_process(other.pid, nix::sys::signal::Signal::SIGKILL);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let report = tokio::time::timeout(Duration::from_secs(5), f.monitor.run_once())
            .await
            .unwrap();
        assert_eq!(report.probed, [w2]);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let current = f.supervisor.get(w2).await.unwrap();
            if current.restart_count == 1 && f.supervisor.is_alive(w2).await {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "worker-2 was never restarted");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let records = f.monitor.records().await;
        let stuck_record = records.iter().find(|r| r.identity == w1()).unwrap();
        assert_eq!(stuck_record.state, HealthState::Restarting);
        assert_eq!(stuck_record.history.len(), 2);

        f.shutdown_tx.send(true).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), f.monitor.drain_recoveries())
            .await
            .unwrap();
        assert_eq!(report.recovered, [w2]);
        assert!(report.failed.is_empty());
        f.supervisor.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn silent_agent_turns_suspect_then_is_restarted() {
        let f = fixture(|c| {
            c.monitoring.health_check_interval_secs = 1;
            c.monitoring.stale_after_intervals = 1;
            c.monitoring.failure_threshold = 2;
        });
        f.supervisor.start_session(f.ledger.as_ref()).await.unwrap();
        let before = f.supervisor.get(w1()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let report = f.monitor.run_once().await;
        assert!(report.probed.contains(&w1()));
        assert!(f.monitor.drain_recoveries().await.recovered.is_empty());
        let record = f.monitor.store.load(w1()).unwrap().unwrap();
        assert_eq!(record.state, HealthState::Suspect);
        assert_eq!(record.last_error_kind, ErrorKind::Unresponsive);
        assert_eq!(f.supervisor.get(w1()).await.unwrap().pid, before.pid);

        f.monitor.run_once().await;
        let report = f.monitor.drain_recoveries().await;
        assert!(report.recovered.contains(&w1()));
        let after = f.supervisor.get(w1()).await.unwrap();
        assert_ne!(after.pid, before.pid);
        assert_eq!(after.restart_count, 1);

        let record = f.monitor.store.load(w1()).unwrap().unwrap();
        assert_eq!(record.state, HealthState::Healthy);
        assert_eq!(record.history.len(), 2);
        assert!(record.history.iter().all(|e| e.kind == ErrorKind::Unresponsive));
        f.supervisor.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn hung_liveness_check_counts_as_timed_out() {
        let hung = bounded(Duration::from_millis(20), std::future::pending()).await;
        assert_eq!(hung, Probe::TimedOut);
        let quick = bounded(Duration::from_secs(1), async { Probe::Alive }).await;
        assert_eq!(quick, Probe::Alive);
    }

    #[tokio::test]
    async fn stopped_monitor_takes_no_action() {
        let f = fixture(|_| {});
        f.supervisor.start_session(f.ledger.as_ref()).await.unwrap();
        let before = f.supervisor.get(w1()).await.unwrap();
        crate::subprocess::host::signal_process(before.pid, nix::sys::signal::Signal::SIGKILL);
        f.shutdown_tx.send(true).unwrap();

        let report = f.monitor.run_once().await;
        assert_eq!(report, CycleReport::default());
        assert_eq!(f.supervisor.get(w1()).await.unwrap().pid, before.pid);
        f.supervisor.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn session_killed_elsewhere_ends_monitoring() {
        let f = fixture(|_| {});
        f.supervisor.start_session(f.ledger.as_ref()).await.unwrap();
        let other = Supervisor::new(f.supervisor.paths().clone(), f.supervisor.config().clone());
        other.shutdown(false).await.unwrap();

        let report = f.monitor.run_once().await;
        assert!(report.session_ended);
    }

    #[test]
    fn checkpoint_prefix_does_not_match_longer_index() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = WorkPaths::for_project(dir.path());
        paths.init().unwrap();
        std::fs::write(paths.checkpoints_dir().join("worker-10-a.json"), "").unwrap();
        assert_eq!(latest_checkpoint(&paths, w1()), None);
        std::fs::write(paths.checkpoints_dir().join("worker-1.json"), "").unwrap();
        assert_eq!(latest_checkpoint(&paths, w1()).as_deref(), Some("worker-1.json"));
    }
}

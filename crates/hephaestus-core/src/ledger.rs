//! Durable task queue.
//!
//! [`DirLedger`] stores each task as one document in the directory of its
//! current state. Every transition is a `rename` between state directories,
//! which is the linearization point: of several racing callers exactly one
//! rename succeeds and the rest see `ENOENT`.
//!
//! Metadata is rewritten only while the record sits where the writer owns it
//! exclusively: after winning the rename into `in_progress`, `completed` or
//! `failed`, and before the rename back into `pending`. An in-progress record
//! belongs to its assignee, so `reassign` must only be called once that
//! assignee has stopped.
//!
//! A crash between a rename and the metadata write that follows it can leave
//! an in-progress record with no owner. [`TaskLedger::stranded`] finds those
//! once they have been left untouched long enough to rule out a live writer.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::document;
use crate::error::{Error, Result};
use crate::identity::AgentIdentity;
use crate::message::Priority;
use crate::paths::WorkPaths;
use crate::store::{atomic_write, document_file, list_document_stems, unix_millis};
use crate::task::{TaskMeta, TaskRecord, TaskState, priority_from_id};

/// Default ceiling for `reassign` before a task is failed permanently.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Task counts for status readers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub by_state: BTreeMap<String, usize>,
    pub pending_by_priority: BTreeMap<String, usize>,
}

impl TaskStats {
    pub fn count(&self, state: TaskState) -> usize {
        self.by_state.get(state.as_str()).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.by_state.values().sum()
    }
}

/// Task queue contract. The directory layout is one implementation; a
/// transactional store could back the same interface.
pub trait TaskLedger: Send + Sync {
    /// Create a new Pending task.
    fn enqueue(&self, payload: &str, priority: Priority) -> Result<TaskRecord>;

    /// Pending -> InProgress, owned by `identity`.
    ///
    /// Fails with [`Error::AlreadyAssigned`] if the task is not Pending.
    fn assign(&self, task_id: &str, identity: AgentIdentity) -> Result<TaskRecord>;

    /// InProgress -> Completed (`success`) or Failed.
    ///
    /// Fails with [`Error::NotInProgress`] unless `identity` holds the task.
    fn complete(&self, task_id: &str, identity: AgentIdentity, success: bool)
    -> Result<TaskRecord>;

    /// InProgress -> Pending with `retry_count + 1`, or -> Failed once the
    /// retry ceiling is exceeded.
    fn reassign(&self, task_id: &str) -> Result<TaskRecord>;

    /// Pending -> Failed without running.
    fn cancel(&self, task_id: &str) -> Result<TaskRecord>;

    /// Look a task up in whichever state it is in.
    fn get(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    /// All readable records in `state`, in offer order.
    fn list(&self, state: TaskState) -> Result<Vec<TaskRecord>>;

    /// Delete terminal records finished more than `older_than` ago.
    fn purge_terminal(&self, older_than: Duration) -> Result<usize>;

    fn stats(&self) -> Result<TaskStats>;

    /// InProgress records with no owner that nobody has touched for
    /// `settled_for`.
    fn stranded(&self, settled_for: Duration) -> Result<Vec<TaskRecord>>;

    /// Assign the first Pending task that is still available.
    fn claim_next(&self, identity: AgentIdentity) -> Result<Option<TaskRecord>> {
        for candidate in self.list(TaskState::Pending)? {
            match self.assign(&candidate.task_id, identity) {
                Ok(record) => return Ok(Some(record)),
                Err(e) if e.is_noop() || matches!(e, Error::TaskNotFound(_)) => {
                    debug!(task_id = %candidate.task_id, "Lost claim race, trying next");
                }
                Err(e @ Error::CorruptMessage { .. }) => {
                    warn!(task_id = %candidate.task_id, error = %e, "Skipping unreadable task");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// InProgress tasks held by `identity`.
    fn in_progress_for(&self, identity: AgentIdentity) -> Result<Vec<TaskRecord>> {
        Ok(self
            .list(TaskState::InProgress)?
            .into_iter()
            .filter(|t| t.assigned_to == Some(identity))
            .collect())
    }
}

/// Directory-per-state ledger under `<work>/tasks`.
#[derive(Debug, Clone)]
pub struct DirLedger {
    paths: WorkPaths,
    max_retries: u32,
}

impl DirLedger {
    pub const fn new(paths: WorkPaths, max_retries: u32) -> Self {
        Self { paths, max_retries }
    }

    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn file(&self, state: TaskState, task_id: &str) -> PathBuf {
        document_file(&self.paths.task_dir(state), task_id)
    }

    fn read(&self, state: TaskState, task_id: &str) -> Result<Option<TaskRecord>> {
        let path = self.file(state, task_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let doc = document::parse::<TaskMeta>(&path, &text)?;
        Ok(Some(TaskRecord::from_parts(doc.meta, state, doc.body)))
    }

    fn write(&self, record: &TaskRecord) -> Result<()> {
        let (text, _) = document::render(&record.meta(), &record.payload)?;
        atomic_write(&self.file(record.state, &record.task_id), text.as_bytes())
    }

    /// Rename between state directories. `Ok(false)` means the source was
    /// gone, i.e. another caller won.
    fn transition(&self, task_id: &str, from: TaskState, to: TaskState) -> Result<bool> {
        let dest = self.file(to, task_id);
        match fs::rename(self.file(from, task_id), &dest) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::write(dest, e)),
        }
    }

    fn locate(&self, task_id: &str) -> Option<TaskState> {
        // A record can move between our probes; scan twice before giving up.
        (0..2)
            .flat_map(|_| TaskState::ALL)
            .find(|state| self.file(*state, task_id).exists())
    }

    fn not_pending(&self, task_id: &str) -> Error {
        if self.locate(task_id).is_some() {
            Error::AlreadyAssigned {
                task_id: task_id.to_string(),
            }
        } else {
            Error::TaskNotFound(task_id.to_string())
        }
    }

    /// Park an unreadable record we just took ownership of in `failed` so it
    /// neither blocks `in_progress` nor returns to the queue.
    fn quarantine(&self, task_id: &str) {
        match self.transition(task_id, TaskState::InProgress, TaskState::Failed) {
            Ok(true) => {
                warn!(task_id, "Unreadable task moved to failed, needs manual intervention");
            }
            Ok(false) => {}
            Err(e) => warn!(task_id, error = %e, "Failed to move unreadable task aside"),
        }
    }

    fn not_in_progress(task_id: &str) -> Error {
        Error::NotInProgress {
            task_id: task_id.to_string(),
        }
    }
}

impl TaskLedger for DirLedger {
    fn enqueue(&self, payload: &str, priority: Priority) -> Result<TaskRecord> {
        let record = TaskRecord::new(payload, priority, unix_millis());
        self.write(&record)?;
        info!(task_id = %record.task_id, priority = %priority, "Task enqueued");
        Ok(record)
    }

    fn assign(&self, task_id: &str, identity: AgentIdentity) -> Result<TaskRecord> {
        if !self.transition(task_id, TaskState::Pending, TaskState::InProgress)? {
            return Err(self.not_pending(task_id));
        }
        let mut record = match self.read(TaskState::InProgress, task_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(Error::AlreadyAssigned {
                    task_id: task_id.to_string(),
                });
            }
            Err(e @ Error::CorruptMessage { .. }) => {
                self.quarantine(task_id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        record.state = TaskState::InProgress;
        record.assigned_to = Some(identity);
        record.started_at = Some(unix_millis());
        record.finished_at = None;
        self.write(&record)?;
        info!(task_id, agent = %identity, "Task assigned");
        Ok(record)
    }

    fn complete(
        &self,
        task_id: &str,
        identity: AgentIdentity,
        success: bool,
    ) -> Result<TaskRecord> {
        let Some(mut record) = self.read(TaskState::InProgress, task_id)? else {
            return Err(Self::not_in_progress(task_id));
        };
        if record.assigned_to != Some(identity) {
            return Err(Self::not_in_progress(task_id));
        }
        let target = if success {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        if !self.transition(task_id, TaskState::InProgress, target)? {
            return Err(Self::not_in_progress(task_id));
        }
        record.state = target;
        record.finished_at = Some(unix_millis());
        self.write(&record)?;
        info!(task_id, agent = %identity, state = %target, "Task finished");
        Ok(record)
    }

    fn reassign(&self, task_id: &str) -> Result<TaskRecord> {
        let Some(mut record) = self.read(TaskState::InProgress, task_id)? else {
            return Err(Self::not_in_progress(task_id));
        };
        let previous = record.assigned_to;
        record.retry_count += 1;
        record.assigned_to = None;
        record.started_at = None;

        if record.retry_count > self.max_retries {
            if !self.transition(task_id, TaskState::InProgress, TaskState::Failed)? {
                return Err(Self::not_in_progress(task_id));
            }
            record.state = TaskState::Failed;
            record.finished_at = Some(unix_millis());
            self.write(&record)?;
            warn!(
                task_id,
                retries = record.retry_count,
                "Task exceeded retry ceiling, marked failed"
            );
            return Ok(record);
        }

        // Content first, in place, then publish to pending.
        self.write(&record)?;
        if !self.transition(task_id, TaskState::InProgress, TaskState::Pending)? {
            return Err(Self::not_in_progress(task_id));
        }
        record.state = TaskState::Pending;
        info!(
            task_id,
            from = ?previous.map(|a| a.display_name()),
            retries = record.retry_count,
            "Task returned to pending"
        );
        Ok(record)
    }

    fn cancel(&self, task_id: &str) -> Result<TaskRecord> {
        if !self.transition(task_id, TaskState::Pending, TaskState::Failed)? {
            return Err(self.not_pending(task_id));
        }
        let Some(mut record) = self.read(TaskState::Failed, task_id)? else {
            return Err(Error::TaskNotFound(task_id.to_string()));
        };
        record.state = TaskState::Failed;
        record.finished_at = Some(unix_millis());
        self.write(&record)?;
        info!(task_id, "Task cancelled");
        Ok(record)
    }

    fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        // A record can move between our probes; scan twice before giving up.
        for _ in 0..2 {
            for state in TaskState::ALL {
                if let Some(record) = self.read(state, task_id)? {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    fn list(&self, state: TaskState) -> Result<Vec<TaskRecord>> {
        let mut records = Vec::new();
        for stem in list_document_stems(&self.paths.task_dir(state))? {
            match self.read(state, &stem) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e @ Error::CorruptMessage { .. }) => {
                    warn!(task_id = %stem, error = %e, "Skipping unreadable task record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    fn purge_terminal(&self, older_than: Duration) -> Result<usize> {
        let cutoff =
            unix_millis() - i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX / 2);
        let mut removed = 0;
        for state in [TaskState::Completed, TaskState::Failed] {
            for record in self.list(state)? {
                if record.finished_at.unwrap_or(record.created_at) < cutoff {
                    match fs::remove_file(self.file(state, &record.task_id)) {
                        Ok(()) => removed += 1,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        if removed > 0 {
            info!(removed, "Purged terminal task records");
        }
        Ok(removed)
    }

    fn stats(&self) -> Result<TaskStats> {
        let mut stats = TaskStats::default();
        for state in TaskState::ALL {
            let stems = list_document_stems(&self.paths.task_dir(state))?;
            if state == TaskState::Pending {
                for stem in &stems {
                    let priority = priority_from_id(stem).unwrap_or_default();
                    *stats
                        .pending_by_priority
                        .entry(priority.as_str().to_string())
                        .or_default() += 1;
                }
            }
            stats.by_state.insert(state.as_str().to_string(), stems.len());
        }
        Ok(stats)
    }

    fn stranded(&self, settled_for: Duration) -> Result<Vec<TaskRecord>> {
        let now = SystemTime::now();
        let mut stranded = Vec::new();
        for record in self.list(TaskState::InProgress)? {
            if record.assigned_to.is_some() {
                continue;
            }
            let touched = fs::metadata(self.file(TaskState::InProgress, &record.task_id))
                .and_then(|m| m.modified());
            let Ok(touched) = touched else {
                continue;
            };
            if now.duration_since(touched).unwrap_or_default() >= settled_for {
                stranded.push(record);
            }
        }
        Ok(stranded)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn ledger(max_retries: u32) -> (TempDir, DirLedger) {
        let dir = TempDir::new().unwrap();
        let paths = WorkPaths::for_project(dir.path());
        paths.init().unwrap();
        (dir, DirLedger::new(paths, max_retries))
    }

    fn w(n: u32) -> AgentIdentity {
        AgentIdentity::worker(n).unwrap()
    }

    #[test]
    fn enqueue_assign_complete() {
        let (_dir, ledger) = ledger(3);
        let task = ledger.enqueue("build it", Priority::Medium).unwrap();
        assert_eq!(task.state, TaskState::Pending);

        let assigned = ledger.assign(&task.task_id, w(1)).unwrap();
        assert_eq!(assigned.state, TaskState::InProgress);
        assert_eq!(assigned.assigned_to, Some(w(1)));
        assert!(assigned.started_at.is_some());

        let done = ledger.complete(&task.task_id, w(1), true).unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert!(done.finished_at.is_some());

        let stored = ledger.get(&task.task_id).unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Completed);
        assert_eq!(stored.payload, "build it");
        assert_eq!(stored.assigned_to, Some(w(1)));
    }

    #[test]
    fn second_assign_is_already_assigned() {
        let (_dir, ledger) = ledger(3);
        let task = ledger.enqueue("x", Priority::Medium).unwrap();
        ledger.assign(&task.task_id, w(1)).unwrap();
        let err = ledger.assign(&task.task_id, w(2)).unwrap_err();
        assert!(matches!(err, Error::AlreadyAssigned { .. }));
        assert!(err.is_noop());
    }

    #[test]
    fn assign_unknown_task_is_not_found() {
        let (_dir, ledger) = ledger(3);
        let err = ledger.assign("task-1nope", w(1)).unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));
    }

    #[test]
    fn complete_by_non_owner_is_not_in_progress() {
        let (_dir, ledger) = ledger(3);
        let task = ledger.enqueue("x", Priority::Medium).unwrap();
        ledger.assign(&task.task_id, w(1)).unwrap();
        let err = ledger.complete(&task.task_id, w(2), true).unwrap_err();
        assert!(matches!(err, Error::NotInProgress { .. }));
        let still = ledger.get(&task.task_id).unwrap().unwrap();
        assert_eq!(still.state, TaskState::InProgress);
    }

    #[test]
    fn complete_pending_task_is_not_in_progress() {
        let (_dir, ledger) = ledger(3);
        let task = ledger.enqueue("x", Priority::Medium).unwrap();
        let err = ledger.complete(&task.task_id, w(1), false).unwrap_err();
        assert!(matches!(err, Error::NotInProgress { .. }));
    }

    #[test]
    fn failed_completion_lands_in_failed() {
        let (_dir, ledger) = ledger(3);
        let task = ledger.enqueue("x", Priority::Medium).unwrap();
        ledger.assign(&task.task_id, w(3)).unwrap();
        ledger.complete(&task.task_id, w(3), false).unwrap();
        assert_eq!(ledger.list(TaskState::Failed).unwrap().len(), 1);
    }

    #[test]
    fn reassign_returns_to_pending_then_fails_past_ceiling() {
        let (_dir, ledger) = ledger(2);
        let task = ledger.enqueue("flaky", Priority::Medium).unwrap();

        for expected in 1..=2 {
            ledger.assign(&task.task_id, w(1)).unwrap();
            let back = ledger.reassign(&task.task_id).unwrap();
            assert_eq!(back.state, TaskState::Pending);
            assert_eq!(back.retry_count, expected);
            assert!(back.assigned_to.is_none());
            let stored = ledger.get(&task.task_id).unwrap().unwrap();
            assert_eq!(stored.retry_count, expected);
            assert_eq!(stored.state, TaskState::Pending);
        }

        ledger.assign(&task.task_id, w(1)).unwrap();
        let dead = ledger.reassign(&task.task_id).unwrap();
        assert_eq!(dead.state, TaskState::Failed);
        assert_eq!(dead.retry_count, 3);
        assert!(ledger.list(TaskState::Pending).unwrap().is_empty());
    }

    #[test]
    fn reassign_of_pending_task_is_not_in_progress() {
        let (_dir, ledger) = ledger(3);
        let task = ledger.enqueue("x", Priority::Medium).unwrap();
        assert!(matches!(
            ledger.reassign(&task.task_id),
            Err(Error::NotInProgress { .. })
        ));
    }

    #[test]
    fn claim_next_honours_priority_then_fifo() {
        let (_dir, ledger) = ledger(3);
        let first_medium = ledger.enqueue("m1", Priority::Medium).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let low = ledger.enqueue("l", Priority::Low).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let high = ledger.enqueue("h", Priority::High).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second_medium = ledger.enqueue("m2", Priority::Medium).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| ledger.claim_next(w(1)).unwrap())
            .map(|t| t.task_id)
            .collect();
        assert_eq!(
            order,
            [
                high.task_id,
                first_medium.task_id,
                second_medium.task_id,
                low.task_id
            ]
        );
    }

    #[test]
    fn cancel_moves_pending_to_failed() {
        let (_dir, ledger) = ledger(3);
        let task = ledger.enqueue("x", Priority::Low).unwrap();
        let cancelled = ledger.cancel(&task.task_id).unwrap();
        assert_eq!(cancelled.state, TaskState::Failed);
        assert_eq!(cancelled.payload, "x");
        assert!(ledger.cancel(&task.task_id).unwrap_err().is_noop());
    }

    #[test]
    fn stats_counts_states_and_pending_priorities() {
        let (_dir, ledger) = ledger(3);
        ledger.enqueue("a", Priority::High).unwrap();
        ledger.enqueue("b", Priority::Low).unwrap();
        let c = ledger.enqueue("c", Priority::Low).unwrap();
        ledger.assign(&c.task_id, w(1)).unwrap();

        let stats = ledger.stats().unwrap();
        assert_eq!(stats.count(TaskState::Pending), 2);
        assert_eq!(stats.count(TaskState::InProgress), 1);
        assert_eq!(stats.count(TaskState::Completed), 0);
        assert_eq!(stats.total(), 3);
        assert_eq!(stats.pending_by_priority.get("high"), Some(&1));
        assert_eq!(stats.pending_by_priority.get("low"), Some(&1));
    }

    #[test]
    fn in_progress_for_filters_by_owner() {
        let (_dir, ledger) = ledger(3);
        let a = ledger.enqueue("a", Priority::Medium).unwrap();
        let b = ledger.enqueue("b", Priority::Medium).unwrap();
        ledger.assign(&a.task_id, w(1)).unwrap();
        ledger.assign(&b.task_id, w(2)).unwrap();
        let mine = ledger.in_progress_for(w(2)).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].task_id, b.task_id);
    }

    #[test]
    fn purge_terminal_removes_only_old_records() {
        let (_dir, ledger) = ledger(3);
        let task = ledger.enqueue("x", Priority::Medium).unwrap();
        ledger.assign(&task.task_id, w(1)).unwrap();
        ledger.complete(&task.task_id, w(1), true).unwrap();
        ledger.enqueue("keep", Priority::Medium).unwrap();

        assert_eq!(ledger.purge_terminal(Duration::from_secs(3600)).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(ledger.purge_terminal(Duration::ZERO).unwrap(), 1);
        assert!(ledger.get(&task.task_id).unwrap().is_none());
        assert_eq!(ledger.list(TaskState::Pending).unwrap().len(), 1);
    }

    /// Leave `task_id` in `in_progress` without an owner, as a crash right
    /// after a rename would, and age the file by `age`.
    fn strand(ledger: &DirLedger, task_id: &str, age: Duration) {
        let dest = ledger.file(TaskState::InProgress, task_id);
        fs::rename(ledger.file(TaskState::Pending, task_id), &dest).unwrap();
        let file = fs::File::options().write(true).open(&dest).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn stranded_lists_only_settled_ownerless_records() {
        let (_dir, ledger) = ledger(3);
        let old = ledger.enqueue("old", Priority::Medium).unwrap();
        let fresh = ledger.enqueue("fresh", Priority::Medium).unwrap();
        let owned = ledger.enqueue("owned", Priority::Medium).unwrap();
        strand(&ledger, &old.task_id, Duration::from_secs(60));
        strand(&ledger, &fresh.task_id, Duration::ZERO);
        ledger.assign(&owned.task_id, w(1)).unwrap();

        let stranded = ledger.stranded(Duration::from_secs(10)).unwrap();
        assert_eq!(stranded.len(), 1);
        assert_eq!(stranded[0].task_id, old.task_id);

        let back = ledger.reassign(&old.task_id).unwrap();
        assert_eq!(back.state, TaskState::Pending);
        assert_eq!(back.retry_count, 1);
    }

    #[test]
    fn unreadable_task_is_moved_to_failed_on_assign() {
        let (_dir, ledger) = ledger(3);
        let bad = ledger.enqueue("x", Priority::High).unwrap();
        let good = ledger.enqueue("y", Priority::Medium).unwrap();
        let path = ledger.file(TaskState::Pending, &bad.task_id);
        let text = fs::read_to_string(&path).unwrap().replace("\nx\n", "\nz\n");
        fs::write(&path, text).unwrap();

        let err = ledger.assign(&bad.task_id, w(1)).unwrap_err();
        assert!(matches!(err, Error::CorruptMessage { .. }));
        assert!(!ledger.file(TaskState::InProgress, &bad.task_id).exists());
        assert!(ledger.file(TaskState::Failed, &bad.task_id).exists());

        let claimed = ledger.claim_next(w(1)).unwrap().unwrap();
        assert_eq!(claimed.task_id, good.task_id);
    }

    #[test]
    fn corrupt_record_is_skipped_by_list() {
        let (_dir, ledger) = ledger(3);
        let task = ledger.enqueue("x", Priority::Medium).unwrap();
        ledger.enqueue("y", Priority::Medium).unwrap();
        let path = ledger.file(TaskState::Pending, &task.task_id);
        let text = fs::read_to_string(&path).unwrap().replace("\nx\n", "\nz\n");
        fs::write(&path, text).unwrap();
        let pending = ledger.list(TaskState::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, "y");
    }
}

//! Task records and their lifecycle states.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::AgentIdentity;
use crate::message::Priority;

/// Lifecycle state of a task. Each state is one directory under `tasks/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskState {
    pub const ALL: [Self; 4] = [
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
    ];

    pub const fn as_str(&self) -> &'static str {
        self.dir_name()
    }

    /// Directory name under `tasks/`.
    pub const fn dir_name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.replace('-', "_").to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Config(format!("unknown task state: {other}"))),
        }
    }
}

/// A durable unit of work.
///
/// `state` always reflects the directory the record was read from; the copy
/// stored in the metadata block is informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub state: TaskState,
    pub assigned_to: Option<AgentIdentity>,
    pub priority: Priority,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub retry_count: u32,
    #[serde(skip)]
    pub payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TaskMeta {
    task_id: String,
    state: TaskState,
    assigned_to: Option<AgentIdentity>,
    priority: Priority,
    created_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    retry_count: u32,
}

impl TaskRecord {
    /// A fresh pending record with a generated id.
    pub fn new(payload: impl Into<String>, priority: Priority, created_at: i64) -> Self {
        Self {
            task_id: generate_task_id(priority, created_at),
            state: TaskState::Pending,
            assigned_to: None,
            priority,
            created_at,
            started_at: None,
            finished_at: None,
            retry_count: 0,
            payload: payload.into(),
        }
    }

    pub(crate) fn meta(&self) -> TaskMeta {
        TaskMeta {
            task_id: self.task_id.clone(),
            state: self.state,
            assigned_to: self.assigned_to,
            priority: self.priority,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            retry_count: self.retry_count,
        }
    }

    pub(crate) fn from_parts(meta: TaskMeta, state: TaskState, payload: String) -> Self {
        Self {
            task_id: meta.task_id,
            state,
            assigned_to: meta.assigned_to,
            priority: meta.priority,
            created_at: meta.created_at,
            started_at: meta.started_at,
            finished_at: meta.finished_at,
            retry_count: meta.retry_count,
            payload,
        }
    }
}

/// `task-<rank><millis>-<8 hex>`.
///
/// The rank digit and zero-padded creation time make lexicographic order of
/// ids equal to priority-then-FIFO order, so the pending directory listing is
/// already the offer order.
pub fn generate_task_id(priority: Priority, created_at: i64) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "task-{}{:016}-{}",
        priority.rank(),
        created_at.max(0),
        &nonce[..8]
    )
}

/// Priority encoded in a generated task id.
pub fn priority_from_id(task_id: &str) -> Option<Priority> {
    let rank = task_id.strip_prefix("task-")?.bytes().next()?;
    Priority::from_rank(rank.checked_sub(b'0')?)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_by_priority_then_creation() {
        let low_early = generate_task_id(Priority::Low, 1_000);
        let high_late = generate_task_id(Priority::High, 9_000);
        let medium_a = generate_task_id(Priority::Medium, 5_000);
        let medium_b = generate_task_id(Priority::Medium, 5_001);
        let mut ids = vec![
            low_early.clone(),
            medium_b.clone(),
            high_late.clone(),
            medium_a.clone(),
        ];
        ids.sort();
        assert_eq!(ids, [high_late, medium_a, medium_b, low_early]);
    }

    #[test]
    fn priority_is_recoverable_from_id() {
        let id = generate_task_id(Priority::Low, 42);
        assert_eq!(priority_from_id(&id), Some(Priority::Low));
        assert_eq!(priority_from_id("task-x"), None);
        assert_eq!(priority_from_id("random"), None);
    }

    #[test]
    fn state_parse_accepts_dashes() {
        assert_eq!(
            "in-progress".parse::<TaskState>().unwrap(),
            TaskState::InProgress
        );
        assert!("done".parse::<TaskState>().is_err());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
    }

    #[test]
    fn new_record_is_pending_and_unowned() {
        let rec = TaskRecord::new("payload", Priority::High, 7);
        assert_eq!(rec.state, TaskState::Pending);
        assert!(rec.assigned_to.is_none());
        assert!(rec.task_id.starts_with("task-0"));
    }
}

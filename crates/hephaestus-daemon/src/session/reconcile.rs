//! Reconciliation of a persisted session against the running system.
//!
//! Run whenever a supervisor picks up an existing session: dead PIDs are
//! purged from the live set, and in-progress tasks whose owner is not among
//! the surviving processes go back to the ledger's pending queue.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{info, warn};

use hephaestus_core::{AgentIdentity, Result, TaskLedger, TaskState};

use super::state::SessionState;
use super::types::ProcessStatus;

/// How long an ownerless in-progress record must sit untouched before it is
/// treated as left behind by a crashed writer.
pub const STRANDED_AFTER: Duration = Duration::from_secs(30);

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Agents whose PID was gone.
    pub purged: Vec<AgentIdentity>,
    /// Agents still running.
    pub kept: Vec<AgentIdentity>,
    /// Task ids returned to pending (or failed past their retry ceiling).
    pub reassigned: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.purged.is_empty() && self.reassigned.is_empty()
    }
}

/// Purge dead processes from `state` and release their tasks.
///
/// Tasks held by workers numbered above `state.worker_count` are released
/// too, since no process for that identity will be started again, and so
/// are ownerless records stranded by a crash mid-transition.
pub fn reconcile(
    state: &mut SessionState,
    ledger: &dyn TaskLedger,
    is_alive: impl Fn(u32) -> bool,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    let dead: Vec<_> = state
        .processes
        .values()
        .filter(|p| !p.status.is_active() || !is_alive(p.pid))
        .cloned()
        .collect();
    for mut record in dead {
        info!(agent = %record.identity, pid = record.pid, "Purging dead process from session");
        if record.status.is_active() {
            record.status = ProcessStatus::Failed;
        }
        report.purged.push(record.identity);
        state.retire(record);
    }
    report.kept = state.processes.keys().copied().collect();

    let live: BTreeSet<AgentIdentity> = report.kept.iter().copied().collect();
    let stranded: BTreeSet<String> = ledger
        .stranded(STRANDED_AFTER)?
        .into_iter()
        .map(|t| t.task_id)
        .collect();
    for task in ledger.list(TaskState::InProgress)? {
        let orphaned = match task.assigned_to {
            Some(owner) => {
                let removed = !owner.is_coordinator() && owner.index() > state.worker_count;
                removed || !live.contains(&owner)
            }
            None => stranded.contains(&task.task_id),
        };
        if !orphaned {
            continue;
        }
        match ledger.reassign(&task.task_id) {
            Ok(record) => {
                info!(
                    task_id = %task.task_id,
                    owner = ?task.assigned_to.map(|a| a.display_name()),
                    state = %record.state,
                    "Released task held by a stopped agent"
                );
                report.reassigned.push(task.task_id);
            }
            Err(e) if e.is_noop() => {}
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Failed to release orphaned task");
            }
        }
    }

    Ok(report)
}

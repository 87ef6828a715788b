//! CLI task subcommands.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Read, Write};
use std::time::Duration;

use clap::Subcommand;

use hephaestus_core::store::unix_millis;
use hephaestus_core::{AgentIdentity, Priority, TaskLedger, TaskRecord, TaskState};

use crate::context::Context;
use crate::output::{age, preview};

/// Task subcommand actions.
#[derive(Subcommand, Debug)]
pub enum TaskAction {
    /// Queue a new task (payload `-` reads stdin)
    Add {
        payload: String,
        #[arg(short, long, default_value = "medium")]
        priority: Priority,
    },
    /// List tasks in one state, or all states
    List {
        #[arg(short, long)]
        state: Option<TaskState>,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one task with its payload
    Show { task_id: String },
    /// Move a pending task to in-progress for an agent
    Assign { task_id: String, agent: AgentIdentity },
    /// Assign the highest-priority pending task to an agent
    Claim { agent: AgentIdentity },
    /// Finish an in-progress task
    Complete {
        task_id: String,
        agent: AgentIdentity,
        /// Record the task as failed instead of completed
        #[arg(long)]
        failed: bool,
    },
    /// Return an in-progress task to pending (its agent must be stopped)
    Reassign { task_id: String },
    /// Withdraw a pending task
    Cancel { task_id: String },
    /// Delete completed/failed tasks older than the given age
    Purge {
        #[arg(long, default_value_t = 7)]
        older_than_days: u64,
    },
}

/// Execute a task subcommand.
pub fn run(ctx: &Context, action: TaskAction, out: &mut impl Write) -> anyhow::Result<()> {
    ctx.require_initialized()?;
    let ledger = ctx.ledger();
    match action {
        TaskAction::Add { payload, priority } => {
            let payload = if payload == "-" {
                let mut buf = String::new();
                io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                payload
            };
            if payload.trim().is_empty() {
                anyhow::bail!("task payload is empty");
            }
            let task = ledger.enqueue(&payload, priority)?;
            writeln!(out, "Queued {} ({})", task.task_id, task.priority)?;
        }
        TaskAction::List { state, json } => {
            let states = state.map_or_else(|| TaskState::ALL.to_vec(), |s| vec![s]);
            let mut tasks = Vec::new();
            for state in states {
                tasks.extend(ledger.list(state)?);
            }
            if json {
                serde_json::to_writer_pretty(&mut *out, &tasks)?;
                writeln!(out)?;
            } else {
                write_table(out, &tasks)?;
            }
        }
        TaskAction::Show { task_id } => {
            let task = ledger
                .get(&task_id)?
                .ok_or_else(|| hephaestus_core::Error::TaskNotFound(task_id.clone()))?;
            write_detail(out, &task)?;
        }
        TaskAction::Assign { task_id, agent } => {
            let task = ledger.assign(&task_id, agent)?;
            writeln!(out, "Assigned {} to {agent}", task.task_id)?;
        }
        TaskAction::Claim { agent } => match ledger.claim_next(agent)? {
            Some(task) => {
                writeln!(out, "Assigned {} to {agent}", task.task_id)?;
                writeln!(out, "{}", task.payload)?;
            }
            None => writeln!(out, "No pending tasks.")?,
        },
        TaskAction::Complete {
            task_id,
            agent,
            failed,
        } => {
            let task = ledger.complete(&task_id, agent, !failed)?;
            writeln!(out, "Task {} {}", task.task_id, task.state)?;
        }
        TaskAction::Reassign { task_id } => {
            let task = ledger.reassign(&task_id)?;
            writeln!(
                out,
                "Task {} now {} (retry {})",
                task.task_id, task.state, task.retry_count
            )?;
        }
        TaskAction::Cancel { task_id } => {
            let task = ledger.cancel(&task_id)?;
            writeln!(out, "Task {} cancelled", task.task_id)?;
        }
        TaskAction::Purge { older_than_days } => {
            let removed =
                ledger.purge_terminal(Duration::from_secs(older_than_days.saturating_mul(86_400)))?;
            writeln!(out, "Removed {removed} finished task(s).")?;
        }
    }
    Ok(())
}

fn write_table(out: &mut impl Write, tasks: &[TaskRecord]) -> io::Result<()> {
    if tasks.is_empty() {
        return writeln!(out, "No tasks found.");
    }
    let now = unix_millis();
    writeln!(
        out,
        "{:<36}  {:<11}  {:<6}  {:<13}  {:>5}  {:>5}  PAYLOAD",
        "ID", "STATE", "PRIO", "AGENT", "RETRY", "AGE"
    )?;
    for task in tasks {
        let agent = task.assigned_to.map(|a| a.to_string()).unwrap_or_default();
        writeln!(
            out,
            "{:<36}  {:<11}  {:<6}  {:<13}  {:>5}  {:>5}  {}",
            task.task_id,
            task.state,
            task.priority,
            agent,
            task.retry_count,
            age(now, task.created_at),
            preview(&task.payload, 40),
        )?;
    }
    writeln!(out, "\n{} task(s)", tasks.len())
}

fn write_detail(out: &mut impl Write, task: &TaskRecord) -> io::Result<()> {
    writeln!(out, "  ID:        {}", task.task_id)?;
    writeln!(out, "  State:     {}", task.state)?;
    writeln!(out, "  Priority:  {}", task.priority)?;
    if let Some(agent) = task.assigned_to {
        writeln!(out, "  Assigned:  {agent}")?;
    }
    writeln!(out, "  Retries:   {}", task.retry_count)?;
    writeln!(out, "  Created:   {} (unix ms)", task.created_at)?;
    if let Some(started) = task.started_at {
        writeln!(out, "  Started:   {started} (unix ms)")?;
    }
    if let Some(finished) = task.finished_at {
        writeln!(out, "  Finished:  {finished} (unix ms)")?;
    }
    writeln!(out, "\n{}", task.payload)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::test_support::{initialized, output};

    fn w(n: u32) -> AgentIdentity {
        AgentIdentity::worker(n).unwrap()
    }

    fn run_ok(ctx: &Context, action: TaskAction) -> String {
        let mut buf = Vec::new();
        run(ctx, action, &mut buf).unwrap();
        output(buf)
    }

    #[test]
    fn add_claim_complete_flow() {
        let (_dir, ctx) = initialized();
        let added = run_ok(
            &ctx,
            TaskAction::Add {
                payload: "write the parser\nwith tests".into(),
                priority: Priority::High,
            },
        );
        assert!(added.starts_with("Queued task-0"));
        let task_id = added.split_whitespace().nth(1).unwrap().to_string();

        let claimed = run_ok(&ctx, TaskAction::Claim { agent: w(1) });
        assert!(claimed.contains(&format!("Assigned {task_id} to worker-1")));
        assert!(claimed.contains("write the parser"));

        let done = run_ok(
            &ctx,
            TaskAction::Complete {
                task_id: task_id.clone(),
                agent: w(1),
                failed: false,
            },
        );
        assert_eq!(done.trim(), format!("Task {task_id} completed"));

        let listed = run_ok(
            &ctx,
            TaskAction::List {
                state: Some(TaskState::Completed),
                json: false,
            },
        );
        assert!(listed.contains(&task_id));
        assert!(listed.contains("write the parser"));
        assert!(listed.contains("1 task(s)"));
    }

    #[test]
    fn list_json_is_parseable() {
        let (_dir, ctx) = initialized();
        run_ok(
            &ctx,
            TaskAction::Add {
                payload: "a".into(),
                priority: Priority::Low,
            },
        );
        let json = run_ok(
            &ctx,
            TaskAction::List {
                state: None,
                json: true,
            },
        );
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 1);
        assert_eq!(value[0]["state"], "pending");
        assert_eq!(value[0]["priority"], "low");
    }

    #[test]
    fn double_assign_surfaces_noop_error() {
        let (_dir, ctx) = initialized();
        let task = ctx.ledger().enqueue("x", Priority::Medium).unwrap();
        run_ok(
            &ctx,
            TaskAction::Assign {
                task_id: task.task_id.clone(),
                agent: w(1),
            },
        );
        let err = run(
            &ctx,
            TaskAction::Assign {
                task_id: task.task_id,
                agent: w(2),
            },
            &mut Vec::new(),
        )
        .unwrap_err();
        let core = err.downcast_ref::<hephaestus_core::Error>().unwrap();
        assert!(core.is_noop());
    }

    #[test]
    fn claim_on_empty_queue() {
        let (_dir, ctx) = initialized();
        assert_eq!(
            run_ok(&ctx, TaskAction::Claim { agent: w(1) }).trim(),
            "No pending tasks."
        );
    }

    #[test]
    fn show_unknown_task_is_not_found() {
        let (_dir, ctx) = initialized();
        let err = run(
            &ctx,
            TaskAction::Show {
                task_id: "task-nope".into(),
            },
            &mut Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<hephaestus_core::Error>(),
            Some(hephaestus_core::Error::TaskNotFound(_))
        ));
    }

    #[test]
    fn uninitialized_dir_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = Context::load(hephaestus_core::WorkPaths::for_project(dir.path())).unwrap();
        let err = run(&ctx, TaskAction::Claim { agent: w(1) }, &mut Vec::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<hephaestus_core::Error>(),
            Some(hephaestus_core::Error::NotInitialized(_))
        ));
    }
}

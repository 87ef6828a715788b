//! `status`: read-only snapshot of session, processes, tasks, health and
//! recent communication.

use std::io::Write;

use serde_json::json;

use hephaestus_core::store::unix_millis;
use hephaestus_core::{AgentIdentity, Priority, TaskLedger, TaskState};
use hephaestus_daemon::health::HealthStore;
use hephaestus_daemon::session::LastSession;
use hephaestus_daemon::subprocess::pid_alive;
use hephaestus_daemon::SessionRegistry;

use crate::context::Context;
use crate::output::{age, truncate};

/// Print the status report. Never mutates the work directory.
pub fn run(ctx: &Context, json: bool, lines: usize, out: &mut impl Write) -> anyhow::Result<()> {
    ctx.require_initialized()?;
    let registry = SessionRegistry::new(ctx.paths.clone());
    let session = registry.load()?;
    let last = if session.is_none() {
        registry.load_last_session()?
    } else {
        None
    };
    let stats = ctx.ledger().stats()?;
    let health = HealthStore::new(ctx.paths.clone())
        .load_all(&AgentIdentity::roster(ctx.config.agents.workers.count));
    let recent = ctx.messages().recent_log(lines)?;

    if json {
        let value = json!({
            "workDir": ctx.paths.root(),
            "session": session,
            "lastSession": last,
            "tasks": stats,
            "health": health,
            "recent": recent,
        });
        serde_json::to_writer_pretty(&mut *out, &value)?;
        writeln!(out)?;
        return Ok(());
    }

    let now = unix_millis();
    writeln!(out, "Work directory: {}", ctx.paths.root().display())?;
    match &session {
        Some(session) => {
            writeln!(
                out,
                "Session {} ({} mode, {} workers, up {})",
                truncate(&session.session_id, 8),
                session.mode,
                session.worker_count,
                age(now, session.created_at)
            )?;
            writeln!(out)?;
            writeln!(
                out,
                "{:<13}  {:>8}  {:<10}  {:>8}  {:>6}  ALIVE",
                "AGENT", "PID", "STATUS", "RESTARTS", "UP"
            )?;
            for process in session.processes.values() {
                writeln!(
                    out,
                    "{:<13}  {:>8}  {:<10}  {:>8}  {:>6}  {}",
                    process.identity.to_string(),
                    process.pid,
                    process.status.to_string(),
                    process.restart_count,
                    age(now, process.started_at),
                    if pid_alive(process.pid) { "yes" } else { "no" },
                )?;
            }
        }
        None => {
            writeln!(out, "No active session.")?;
            if let Some(last) = &last {
                write_last_session(out, last, now)?;
            }
        }
    }

    writeln!(out)?;
    write!(out, "Tasks:")?;
    for state in TaskState::ALL {
        write!(out, "  {} {}", state, stats.count(state))?;
    }
    writeln!(out)?;
    let pending: Vec<String> = Priority::ALL
        .iter()
        .filter_map(|p| {
            let n = stats.pending_by_priority.get(p.as_str()).copied().unwrap_or(0);
            (n > 0).then(|| format!("{p} {n}"))
        })
        .collect();
    if !pending.is_empty() {
        writeln!(out, "Pending by priority: {}", pending.join(", "))?;
    }

    if !health.is_empty() {
        writeln!(out)?;
        writeln!(out, "{:<13}  {:<10}  {:<12}  {:>8}  SEEN", "AGENT", "HEALTH", "LAST ERROR", "FAILURES")?;
        for record in &health {
            writeln!(
                out,
                "{:<13}  {:<10}  {:<12}  {:>8}  {}",
                record.identity.to_string(),
                record.state.to_string(),
                record.last_error_kind.to_string(),
                record.consecutive_failures,
                record
                    .last_seen_at
                    .map_or_else(|| "-".to_string(), |seen| format!("{} ago", age(now, seen))),
            )?;
        }
    }

    if !recent.is_empty() {
        writeln!(out)?;
        writeln!(out, "Recent messages:")?;
        for line in &recent {
            writeln!(out, "  {line}")?;
        }
    }
    Ok(())
}

fn write_last_session(out: &mut impl Write, last: &LastSession, now: i64) -> std::io::Result<()> {
    writeln!(
        out,
        "Last session {} ({} mode, {} workers) ended {} ago",
        truncate(&last.session_id, 8),
        last.mode,
        last.worker_count,
        age(now, last.terminated_at)
    )
}

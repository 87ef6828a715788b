//! Session lifecycle subcommands: `init`, `start`, `monitor`, `attach`,
//! `kill`.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::Write;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use hephaestus_core::store::atomic_write;
use hephaestus_core::{Config, TaskLedger, WorkPaths};
use hephaestus_daemon::subprocess::TmuxHost;
use hephaestus_daemon::{
    HealthMonitor, SessionMode, SessionRegistry, SessionState, Supervisor, SupervisorError,
};

use crate::context::Context;

/// Options for `init`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub workers: Option<u32>,
    pub no_tmux: bool,
    pub force: bool,
}

/// Create the work directory and a starter `config.toml`.
pub fn init(paths: &WorkPaths, opts: &InitOptions, out: &mut impl Write) -> anyhow::Result<()> {
    if paths.is_initialized() && !opts.force {
        writeln!(
            out,
            "Already initialized at {} (use --force to rewrite config.toml).",
            paths.root().display()
        )?;
        return Ok(());
    }
    paths.init()?;

    let mut config = Config::default();
    if let Some(workers) = opts.workers {
        config.agents.workers.count = workers;
    }
    if opts.no_tmux {
        config.multiplexer.enabled = false;
    }
    config.validate()?;
    atomic_write(&paths.config_file(), config.to_toml()?.as_bytes())?;
    info!(root = %paths.root().display(), workers = config.agents.workers.count, "Work directory initialized");

    writeln!(out, "Initialized {}", paths.root().display())?;
    writeln!(out, "  workers:     {}", config.agents.workers.count)?;
    writeln!(
        out,
        "  multiplexer: {}",
        if config.multiplexer.enabled {
            config.multiplexer.binary.as_str()
        } else {
            "disabled"
        }
    )?;
    writeln!(out, "Run `hephaestus start` to launch the agents.")?;
    Ok(())
}

/// Launch (or resume) the session. With `monitor`, keep running the health
/// monitor in the foreground until interrupted.
pub async fn start(ctx: &Context, monitor: bool, out: &mut impl Write) -> anyhow::Result<()> {
    ctx.require_initialized()?;
    let supervisor = Arc::new(ctx.supervisor());
    let ledger: Arc<dyn TaskLedger> = Arc::new(ctx.ledger());
    let session = supervisor.start_session(ledger.as_ref()).await?;
    write_session(out, &session)?;
    if session.mode == SessionMode::Presentation {
        writeln!(out, "Attach with `hephaestus attach`.")?;
    }
    out.flush()?;

    if monitor {
        run_monitor(supervisor, ledger).await?;
    }
    Ok(())
}

/// Monitor an already running session in the foreground.
pub async fn monitor(ctx: &Context) -> anyhow::Result<()> {
    ctx.require_initialized()?;
    let supervisor = Arc::new(ctx.supervisor());
    let ledger: Arc<dyn TaskLedger> = Arc::new(ctx.ledger());
    if supervisor.rediscover(ledger.as_ref()).await?.is_none() {
        return Err(SupervisorError::SessionNotFound(ctx.paths.root().to_path_buf()).into());
    }
    run_monitor(supervisor, ledger).await
}

/// Run the health monitor until Ctrl+C, SIGTERM, or the session is killed
/// from elsewhere.
async fn run_monitor(supervisor: Arc<Supervisor>, ledger: Arc<dyn TaskLedger>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = Arc::new(HealthMonitor::new(supervisor, ledger, shutdown_rx));
    let mut handle = Arc::clone(&monitor).spawn();

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = &mut handle => {
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping monitor");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM, stopping monitor");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
    info!("Monitor stopped; agents keep running (use `hephaestus kill` to stop them)");
    Ok(())
}

/// Attach the terminal to the multiplexer session, or list the background
/// agents in fallback mode.
pub fn attach(ctx: &Context, out: &mut impl Write) -> anyhow::Result<()> {
    ctx.require_initialized()?;
    let session = SessionRegistry::new(ctx.paths.clone())
        .load()?
        .ok_or_else(|| SupervisorError::SessionNotFound(ctx.paths.root().to_path_buf()))?;

    if session.mode == SessionMode::Presentation && ctx.config.multiplexer.enabled {
        let tmux = TmuxHost::new(
            ctx.config.multiplexer.binary.clone(),
            ctx.config.multiplexer.session_name.clone(),
            ctx.config.supervisor.startup_timeout(),
        );
        return exec_attach(&tmux.attach_command());
    }

    writeln!(out, "Session runs in fallback mode; agents are background processes.")?;
    write_session(out, &session)?;
    writeln!(out, "Logs: {}", ctx.paths.logs_dir().display())?;
    Ok(())
}

#[cfg(unix)]
fn exec_attach(argv: &[String]) -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;

    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty attach command"))?;
    let err = std::process::Command::new(program).args(args).exec();
    Err(anyhow::anyhow!("failed to exec {program}: {err}"))
}

#[cfg(not(unix))]
fn exec_attach(argv: &[String]) -> anyhow::Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty attach command"))?;
    let status = std::process::Command::new(program).args(args).status()?;
    anyhow::ensure!(status.success(), "{program} exited with {status}");
    Ok(())
}

/// Stop every agent and tear the session down.
pub async fn kill(ctx: &Context, force: bool, out: &mut impl Write) -> anyhow::Result<()> {
    ctx.require_initialized()?;
    let supervisor = ctx.supervisor();
    let ended = supervisor.shutdown(!force).await?;
    writeln!(
        out,
        "Session {} terminated ({} workers).",
        ended.session_id, ended.worker_count
    )?;
    Ok(())
}

fn write_session(out: &mut impl Write, session: &SessionState) -> std::io::Result<()> {
    writeln!(
        out,
        "Session {} ({} mode)",
        session.session_id, session.mode
    )?;
    for process in session.processes.values() {
        writeln!(
            out,
            "  {:<13}  pid {:>8}  {}",
            process.identity.to_string(),
            process.pid,
            process.status
        )?;
    }
    Ok(())
}

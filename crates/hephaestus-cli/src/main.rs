//! Hephaestus CLI
//!
//! Launches and supervises a coordinator plus N worker agents that share a
//! file-based task ledger and message store.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::debug;

use hephaestus_cli::context::Context;
use hephaestus_cli::session_cmd::{self, InitOptions};
use hephaestus_cli::task_cmd::TaskAction;
use hephaestus_cli::{message_cmd, status_cmd, task_cmd};
use hephaestus_core::tracing_init::{default_filter, init_tracing};
use hephaestus_core::{AgentIdentity, MessageType, Priority};
use hephaestus_daemon::SupervisorError;

#[derive(Parser, Debug)]
#[command(name = "hephaestus")]
#[command(version, about = "Agent orchestration: one coordinator, N workers, one shared work directory")]
struct Cli {
    /// Work directory (defaults to ./hephaestus-work)
    #[arg(long, global = true, env = "HEPHAESTUS_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Emit JSON log lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the work directory and config.toml
    Init {
        /// Number of worker agents
        #[arg(short, long)]
        workers: Option<u32>,
        /// Run agents as background processes instead of tmux windows
        #[arg(long)]
        no_tmux: bool,
        /// Rewrite config.toml if the directory already exists
        #[arg(long)]
        force: bool,
    },
    /// Start the coordinator and workers (picks up a running session)
    Start {
        /// Keep running the health monitor in the foreground
        #[arg(long)]
        monitor: bool,
    },
    /// Run the health monitor against the running session
    Monitor,
    /// Attach to the multiplexer session
    Attach,
    /// Stop all agents and end the session
    Kill {
        /// Kill immediately instead of waiting for a graceful exit
        #[arg(long)]
        force: bool,
    },
    /// Show session, processes, tasks, health and recent messages
    Status {
        #[arg(long)]
        json: bool,
        /// Recent communication lines to show
        #[arg(short = 'n', long, default_value_t = 10)]
        lines: usize,
    },
    /// Manage the task ledger
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Publish a message envelope
    Send {
        from: AgentIdentity,
        to: AgentIdentity,
        /// Message body (`-` reads stdin)
        body: String,
        #[arg(short = 't', long = "type", default_value = "task")]
        kind: MessageType,
        #[arg(short, long)]
        priority: Option<Priority>,
    },
    /// Read messages addressed to an agent
    Inbox {
        agent: AgentIdentity,
        /// Only messages newer than this timestamp (microseconds)
        #[arg(long, default_value_t = 0)]
        since: i64,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Print full bodies
        #[arg(long)]
        full: bool,
    },
}

impl Commands {
    /// Long-running commands log at the configured level; one-shot commands
    /// only surface warnings.
    const fn is_long_running(&self) -> bool {
        matches!(self, Self::Start { monitor: true } | Self::Monitor)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(&e),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let paths = Context::resolve_paths(cli.work_dir)?;
    let loaded = Context::load(paths.clone());
    let (level, json) = match &loaded {
        Ok(ctx) if cli.command.is_long_running() => {
            (ctx.config.logging.level.clone(), ctx.config.logging.json)
        }
        Ok(ctx) => ("warn".to_string(), ctx.config.logging.json),
        Err(_) => ("warn".to_string(), false),
    };
    init_tracing(&default_filter(&level), json || cli.log_json);
    debug!(version = env!("CARGO_PKG_VERSION"), work_dir = %paths.root().display(), "Starting hephaestus");

    let mut out = io::stdout();
    if let Commands::Init {
        workers,
        no_tmux,
        force,
    } = cli.command
    {
        let opts = InitOptions {
            workers,
            no_tmux,
            force,
        };
        return session_cmd::init(&paths, &opts, &mut out);
    }

    let ctx = loaded?;
    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Start { monitor } => session_cmd::start(&ctx, monitor, &mut out).await,
        Commands::Monitor => session_cmd::monitor(&ctx).await,
        Commands::Attach => session_cmd::attach(&ctx, &mut out),
        Commands::Kill { force } => session_cmd::kill(&ctx, force, &mut out).await,
        Commands::Status { json, lines } => status_cmd::run(&ctx, json, lines, &mut out),
        Commands::Task { action } => task_cmd::run(&ctx, action, &mut out),
        Commands::Send {
            from,
            to,
            body,
            kind,
            priority,
        } => message_cmd::send(&ctx, from, to, kind, priority, body, &mut out),
        Commands::Inbox {
            agent,
            since,
            limit,
            full,
        } => message_cmd::inbox(&ctx, agent, since, limit, full, &mut out),
    }
}

/// Render an error for the user. "Nothing to do" conditions exit 0;
/// everything else exits 1.
fn report(err: &anyhow::Error) -> ExitCode {
    let mut stderr = io::stderr();
    if let Some(sup) = err.downcast_ref::<SupervisorError>() {
        match sup {
            SupervisorError::SessionNotFound(root) => {
                let _ = writeln!(stderr, "No active session in {}; nothing to do.", root.display());
                return ExitCode::SUCCESS;
            }
            SupervisorError::NotInitialized(root) => {
                let _ = writeln!(
                    stderr,
                    "{} is not initialized. Run `hephaestus init` first.",
                    root.display()
                );
                return ExitCode::FAILURE;
            }
            _ => {}
        }
    }
    if let Some(core) = err.downcast_ref::<hephaestus_core::Error>() {
        if core.is_noop() {
            let _ = writeln!(stderr, "{core}; nothing to do.");
            return ExitCode::SUCCESS;
        }
        if let hephaestus_core::Error::NotInitialized(root) = core {
            let _ = writeln!(
                stderr,
                "{} is not initialized. Run `hephaestus init` first.",
                root.display()
            );
            return ExitCode::FAILURE;
        }
    }
    let _ = writeln!(stderr, "Error: {err:#}");
    ExitCode::FAILURE
}

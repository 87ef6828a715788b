//! Process hosts: the terminal multiplexer and the detached-background
//! fallback.
//!
//! Both produce a PID for the agent itself. Under tmux the pane command is
//! `exec`'d, so the pane PID is the agent PID and signals reach it directly.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use hephaestus_core::AgentIdentity;

/// Errors from a process host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The multiplexer cannot be used at all (missing binary, socket cannot
    /// be created or reached). Triggers fallback mode.
    #[error("Multiplexer unavailable: {0}")]
    Unavailable(String),

    #[error("Launch failed: {0}")]
    Failed(String),
}

/// Everything needed to start one agent.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub identity: AgentIdentity,
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub log_path: PathBuf,
    pub env: Vec<(String, String)>,
}

/// A started agent.
#[derive(Debug)]
pub struct Launched {
    pub pid: u32,
    pub pane_id: Option<String>,
    /// Present for background processes started by this supervisor.
    pub child: Option<Child>,
}

/// Whether `pid` names a live, non-zombie process.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // Field 3 of /proc/<pid>/stat, after the parenthesised command name.
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(") ")
                .and_then(|(_, rest)| rest.chars().next())
        })
        .is_some_and(|state| state == 'Z')
}

#[cfg(not(target_os = "linux"))]
const fn is_zombie(_pid: u32) -> bool {
    false
}

/// Send `signal` to the process group led by `pid`, falling back to the
/// process alone when it does not lead a group.
pub fn signal_process(pid: u32, signal: Signal) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let target = Pid::from_raw(raw);
    match killpg(target, signal) {
        Ok(()) => true,
        Err(_) => match kill(target, signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                warn!(pid, signal = ?signal, error = %e, "Failed to signal process");
                false
            }
        },
    }
}

/// Resolve `program` the way `execvp` would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn resolve_binary(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// Quote one argument for `/bin/sh`.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Shell command a multiplexer pane runs for `spec`.
fn pane_command(spec: &LaunchSpec) -> String {
    let mut parts = vec!["exec".to_string(), "env".to_string()];
    parts.extend(
        spec.env
            .iter()
            .map(|(k, v)| shell_quote(&format!("{k}={v}"))),
    );
    parts.extend(spec.command.iter().map(|a| shell_quote(a)));
    parts.join(" ")
}

/// Pane command that blocks on a tmux channel until the pane log is
/// attached, then execs the agent in the same shell.
fn gated_pane_command(tmux: &str, channel: &str, spec: &LaunchSpec) -> String {
    format!(
        "{} wait-for {}; {}",
        shell_quote(tmux),
        shell_quote(channel),
        pane_command(spec)
    )
}

/// Hosts agents as windows of one tmux session.
#[derive(Debug, Clone)]
pub struct TmuxHost {
    binary: String,
    session_name: String,
    command_timeout: Duration,
}

/// stderr fragments tmux prints when its server socket is unusable.
const CONNECTIVITY_FAILURES: &[&str] = &[
    "error creating",
    "couldn't create",
    "error connecting",
    "server exited unexpectedly",
    "open terminal failed",
    "permission denied",
];

impl TmuxHost {
    pub fn new(binary: impl Into<String>, session_name: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            session_name: session_name.into(),
            command_timeout,
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    async fn run(&self, args: &[String]) -> Result<String, HostError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.command_timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(match e.kind() {
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                        HostError::Unavailable(format!("{}: {e}", self.binary))
                    }
                    _ => HostError::Failed(format!("{}: {e}", self.binary)),
                });
            }
            Err(_) => {
                return Err(HostError::Unavailable(format!(
                    "{} did not respond within {:?}",
                    self.binary, self.command_timeout
                )));
            }
        };
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let lowered = stderr.to_ascii_lowercase();
        if CONNECTIVITY_FAILURES.iter().any(|f| lowered.contains(f)) {
            Err(HostError::Unavailable(stderr))
        } else {
            Err(HostError::Failed(stderr))
        }
    }

    async fn has_session(&self) -> bool {
        self.run(&["has-session".into(), "-t".into(), format!("={}", self.session_name)])
            .await
            .is_ok()
    }

    /// Open a window running `spec` and pipe its output to the log file.
    ///
    /// The agent is held on a `wait-for` channel until `pipe-pane` is in
    /// place, so the log sees its first line of output.
    pub async fn launch(&self, spec: &LaunchSpec) -> Result<Launched, HostError> {
        let window = spec.identity.display_name();
        let channel = format!("{}-{window}-start", self.session_name);
        let mut args: Vec<String> = if self.has_session().await {
            vec![
                "new-window".into(),
                "-d".into(),
                "-t".into(),
                format!("={}:", self.session_name),
            ]
        } else {
            vec![
                "new-session".into(),
                "-d".into(),
                "-s".into(),
                self.session_name.clone(),
            ]
        };
        args.extend([
            "-n".into(),
            window,
            "-c".into(),
            spec.cwd.display().to_string(),
            "-P".into(),
            "-F".into(),
            "#{pane_pid} #{pane_id}".into(),
            gated_pane_command(&self.binary, &channel, spec),
        ]);

        let printed = self.run(&args).await?;
        let (pid, pane_id) = printed
            .trim()
            .split_once(' ')
            .and_then(|(pid, pane)| Some((pid.parse::<u32>().ok()?, pane.to_string())))
            .ok_or_else(|| HostError::Failed(format!("unexpected tmux output: {printed:?}")))?;

        let pipe = format!("cat >> {}", shell_quote(&spec.log_path.display().to_string()));
        if let Err(e) = self
            .run(&["pipe-pane".into(), "-o".into(), "-t".into(), pane_id.clone(), pipe])
            .await
        {
            warn!(agent = %spec.identity, error = %e, "Failed to attach pane log");
        }
        if let Err(e) = self
            .run(&["wait-for".into(), "-S".into(), channel])
            .await
        {
            self.kill_pane(&pane_id).await;
            return Err(HostError::Failed(format!("releasing {}: {e}", spec.identity)));
        }

        info!(agent = %spec.identity, pid, pane = %pane_id, "Agent started in multiplexer");
        Ok(Launched {
            pid,
            pane_id: Some(pane_id),
            child: None,
        })
    }

    /// Close a pane. Already-closed panes are ignored.
    pub async fn kill_pane(&self, pane_id: &str) {
        if let Err(e) = self
            .run(&["kill-pane".into(), "-t".into(), pane_id.to_string()])
            .await
        {
            debug!(pane = %pane_id, error = %e, "kill-pane failed");
        }
    }

    /// Tear down the whole tmux session. Missing sessions are ignored.
    pub async fn kill_session(&self) {
        if let Err(e) = self
            .run(&["kill-session".into(), "-t".into(), format!("={}", self.session_name)])
            .await
        {
            debug!(session = %self.session_name, error = %e, "kill-session failed");
        }
    }

    /// Argv that attaches a terminal to the session.
    pub fn attach_command(&self) -> Vec<String> {
        vec![
            self.binary.clone(),
            "attach-session".into(),
            "-t".into(),
            self.session_name.clone(),
        ]
    }
}

/// Hosts agents as detached background processes with output appended to
/// their log file.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackgroundHost;

impl BackgroundHost {
    pub fn launch(self, spec: &LaunchSpec) -> Result<Launched, HostError> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| HostError::Failed("empty command".into()))?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .map_err(|e| HostError::Failed(format!("{}: {e}", spec.log_path.display())))?;
        let log_err = log
            .try_clone()
            .map_err(|e| HostError::Failed(format!("{}: {e}", spec.log_path.display())))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| HostError::Failed(format!("{program}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| HostError::Failed(format!("{program} exited before reporting a pid")))?;
        info!(agent = %spec.identity, pid, "Agent started in background");
        Ok(Launched {
            pid,
            pane_id: None,
            child: Some(child),
        })
    }
}

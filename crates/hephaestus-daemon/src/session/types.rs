//! Process and session record types.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use hephaestus_core::AgentIdentity;

/// Lifecycle status of a supervised agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Unhealthy,
    Restarting,
    Stopped,
    Failed,
}

impl ProcessStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Unhealthy => "unhealthy",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Anything but Stopped and Failed.
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How agents are hosted for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// One terminal multiplexer window per agent.
    Presentation,
    /// Detached background processes.
    Fallback,
}

impl SessionMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Presentation => "presentation",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One supervised agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub identity: AgentIdentity,
    pub pid: u32,
    /// Milliseconds since the epoch.
    pub started_at: i64,
    pub command: Vec<String>,
    pub log_path: PathBuf,
    pub status: ProcessStatus,
    #[serde(default)]
    pub restart_count: u32,
    /// Multiplexer pane hosting the process, presentation mode only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
}

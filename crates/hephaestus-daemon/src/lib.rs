//! Hephaestus Supervisor Library
//!
//! Runtime side of the orchestration core:
//! - Process supervision for the coordinator and worker agents
//!   (tmux windows, or detached background processes as fallback)
//! - Session registry with startup reconciliation
//! - Health monitoring with restart and escalation

pub mod health;
pub mod session;
pub mod subprocess;

pub use health::{HealthMonitor, HealthRecord, HealthState};
pub use session::{ProcessRecord, ProcessStatus, SessionMode, SessionRegistry, SessionState};
pub use subprocess::{Supervisor, SupervisorError};

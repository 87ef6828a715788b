//! Agent process hosting and supervision.

pub mod host;
pub mod supervisor;

pub use host::{BackgroundHost, HostError, LaunchSpec, Launched, TmuxHost, pid_alive};
pub use supervisor::{Supervisor, SupervisorError};

//! Health monitoring: probes, failure classification and recovery.

pub mod classify;
pub mod monitor;
pub mod record;

pub use classify::classify_signal;
pub use monitor::{CycleReport, HealthMonitor};
pub use record::{ErrorEntry, ErrorKind, HealthRecord, HealthState, HealthStore};

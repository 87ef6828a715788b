//! Session registry: the persisted record of the active orchestration
//! session and the startup reconciliation pass.

pub mod reconcile;
pub mod registry;
pub mod state;
pub mod types;

pub use reconcile::{ReconcileReport, reconcile};
pub use registry::{LastSession, SessionRegistry};
pub use state::SessionState;
pub use types::{ProcessRecord, ProcessStatus, SessionMode};

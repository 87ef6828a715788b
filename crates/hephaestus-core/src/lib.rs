//! Hephaestus Core Library
//!
//! Shared data model and storage for the orchestration components:
//! - Agent identities, task records and message envelopes
//! - The directory-backed task ledger and message store
//! - Work directory layout and configuration
//! - Common error types

pub mod config;
pub mod document;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod message;
pub mod message_store;
pub mod paths;
pub mod store;
pub mod task;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use identity::{AgentIdentity, AgentRole};
pub use ledger::{DirLedger, TaskLedger, TaskStats};
pub use message::{MessageEnvelope, MessageType, Priority};
pub use message_store::{MessageStore, Subscription};
pub use paths::WorkPaths;
pub use task::{TaskRecord, TaskState};

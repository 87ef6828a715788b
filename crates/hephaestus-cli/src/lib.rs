//! Hephaestus CLI Library
//!
//! Subcommand implementations for the `hephaestus` binary. Every command
//! writes its report to the writer it is given so it can be exercised
//! without a terminal.

pub mod context;
pub mod message_cmd;
pub mod output;
pub mod session_cmd;
pub mod status_cmd;
pub mod task_cmd;

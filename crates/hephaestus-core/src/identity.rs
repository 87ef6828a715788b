//! Agent addressing.
//!
//! An [`AgentIdentity`] is the key used everywhere an agent is named: process
//! records, task ownership, message routing and file names. It serializes as
//! its display name (`coordinator`, `worker-2`) so it can be used directly as
//! a JSON map key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Role of a supervised agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgentRole {
    Coordinator,
    Worker,
}

impl AgentRole {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable identity of one agent: the coordinator (index 0) or a worker
/// (index 1..=N).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentIdentity {
    role: AgentRole,
    index: u32,
}

impl AgentIdentity {
    /// The single coordinator.
    pub const fn coordinator() -> Self {
        Self {
            role: AgentRole::Coordinator,
            index: 0,
        }
    }

    /// Worker `index`. Workers are numbered from 1; index 0 is rejected.
    pub fn worker(index: u32) -> Result<Self, Error> {
        if index == 0 {
            return Err(Error::Config("worker index starts at 1".into()));
        }
        Ok(Self {
            role: AgentRole::Worker,
            index,
        })
    }

    /// The coordinator followed by workers `1..=count`.
    pub fn roster(count: u32) -> Vec<Self> {
        std::iter::once(Self::coordinator())
            .chain((1..=count).map(|index| Self {
                role: AgentRole::Worker,
                index,
            }))
            .collect()
    }

    pub const fn role(&self) -> AgentRole {
        self.role
    }

    pub const fn index(&self) -> u32 {
        self.index
    }

    pub const fn is_coordinator(&self) -> bool {
        matches!(self.role, AgentRole::Coordinator)
    }

    /// Display name, e.g. `worker-2`. Also the file stem used on disk.
    pub fn display_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            AgentRole::Coordinator => f.write_str("coordinator"),
            AgentRole::Worker => write!(f, "worker-{}", self.index),
        }
    }
}

impl FromStr for AgentIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // "master" is the name older work directories used for the coordinator.
        if s == "coordinator" || s == "master" {
            return Ok(Self::coordinator());
        }
        let index = s
            .strip_prefix("worker-")
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| Error::Config(format!("invalid agent identity: {s:?}")))?;
        Self::worker(index)
    }
}

impl TryFrom<String> for AgentIdentity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AgentIdentity> for String {
    fn from(value: AgentIdentity) -> Self {
        value.to_string()
    }
}

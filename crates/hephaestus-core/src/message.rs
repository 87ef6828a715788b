//! Inter-agent message envelopes.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::document;
use crate::error::{Error, Result};
use crate::identity::AgentIdentity;
use crate::store::unix_micros;

/// Delivery priority of an envelope or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Self; 3] = [Self::High, Self::Medium, Self::Low];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Sort rank, lower first.
    pub const fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }

    pub const fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(Self::High),
            1 => Some(Self::Medium),
            2 => Some(Self::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(Error::Config(format!("unknown priority: {other}"))),
        }
    }
}

/// Kind of envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Task,
    Status,
    Result,
    Error,
}

impl MessageType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Status => "status",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "task" => Ok(Self::Task),
            "status" => Ok(Self::Status),
            "result" => Ok(Self::Result),
            "error" => Ok(Self::Error),
            other => Err(Error::Config(format!("unknown message type: {other}"))),
        }
    }
}

/// An addressed, checksummed unit of inter-agent communication.
///
/// Immutable once published. `timestamp` is microseconds since the epoch
/// and, like `checksum`, is stamped by the store on publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub id: String,
    pub kind: MessageType,
    pub from: AgentIdentity,
    pub to: AgentIdentity,
    pub timestamp: i64,
    pub priority: Priority,
    pub body: String,
    pub checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeMeta {
    id: String,
    #[serde(rename = "type")]
    kind: MessageType,
    from: AgentIdentity,
    to: AgentIdentity,
    timestamp: i64,
    priority: Priority,
}

impl MessageEnvelope {
    /// New unsent envelope with a fresh id and the current timestamp.
    pub fn new(
        kind: MessageType,
        from: AgentIdentity,
        to: AgentIdentity,
        priority: Priority,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            from,
            to,
            timestamp: unix_micros(),
            priority,
            body: body.into(),
            checksum: String::new(),
        }
    }

    pub fn task(from: AgentIdentity, to: AgentIdentity, body: impl Into<String>) -> Self {
        Self::new(MessageType::Task, from, to, Priority::Medium, body)
    }

    pub fn status(from: AgentIdentity, to: AgentIdentity, body: impl Into<String>) -> Self {
        Self::new(MessageType::Status, from, to, Priority::Low, body)
    }

    pub fn result(from: AgentIdentity, to: AgentIdentity, body: impl Into<String>) -> Self {
        Self::new(MessageType::Result, from, to, Priority::Medium, body)
    }

    pub fn error(from: AgentIdentity, to: AgentIdentity, body: impl Into<String>) -> Self {
        Self::new(MessageType::Error, from, to, Priority::High, body)
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Stem of the stored file: zero-padded timestamp then id, so a
    /// lexicographic directory listing is timestamp order.
    pub fn file_stem(&self) -> String {
        format!("{:020}-{}", self.timestamp, self.id)
    }

    fn meta(&self) -> EnvelopeMeta {
        EnvelopeMeta {
            id: self.id.clone(),
            kind: self.kind,
            from: self.from,
            to: self.to,
            timestamp: self.timestamp,
            priority: self.priority,
        }
    }

    /// Render to document text, stamping `checksum`.
    pub fn encode(&mut self) -> Result<String> {
        let (text, checksum) = document::render(&self.meta(), &self.body)?;
        self.checksum = checksum;
        Ok(text)
    }

    /// Parse and verify a stored envelope. Any failure is
    /// [`Error::CorruptMessage`].
    pub fn decode(path: &Path, text: &str) -> Result<Self> {
        let doc = document::parse::<EnvelopeMeta>(path, text)?;
        Ok(Self {
            id: doc.meta.id,
            kind: doc.meta.kind,
            from: doc.meta.from,
            to: doc.meta.to,
            timestamp: doc.meta.timestamp,
            priority: doc.meta.priority,
            body: doc.body,
            checksum: doc.checksum,
        })
    }

    /// One-line summary for the communication log.
    pub fn summary(&self) -> String {
        let first = self.body.lines().next().unwrap_or_default();
        let mut preview: String = first.chars().take(80).collect();
        if preview.len() < first.len() {
            preview.push_str("...");
        }
        format!(
            "{} -> {} ({}/{}) {}: {}",
            self.from, self.to, self.kind, self.priority, self.id, preview
        )
    }
}

/// Parse the timestamp prefix of a stored envelope's file stem.
pub fn stem_timestamp(stem: &str) -> Option<i64> {
    stem.split_once('-').and_then(|(ts, _)| ts.parse().ok())
}

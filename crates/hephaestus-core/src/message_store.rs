//! Checksum-verified envelope storage.
//!
//! Envelopes live at `messages/<to>/<timestamp>-<id>.md` and are never
//! modified or deleted after publishing. Every publish also appends one
//! summary line to `logs/communication.log`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identity::AgentIdentity;
use crate::message::{MessageEnvelope, stem_timestamp};
use crate::paths::WorkPaths;
use crate::store::{
    append_line, atomic_write, document_file, list_document_stems, unix_micros, unix_millis,
};

/// Envelope store rooted at a work directory.
#[derive(Debug, Clone)]
pub struct MessageStore {
    paths: WorkPaths,
}

impl MessageStore {
    pub const fn new(paths: WorkPaths) -> Self {
        Self { paths }
    }

    /// Stamp the timestamp and checksum, write the envelope into the
    /// recipient's inbox and log a summary line. Returns the stamped
    /// envelope.
    ///
    /// The timestamp is taken here rather than when the envelope was built,
    /// so a subscriber's watermark never passes an envelope that is not yet
    /// on disk.
    pub fn publish(&self, mut envelope: MessageEnvelope) -> Result<MessageEnvelope> {
        envelope.timestamp = unix_micros();
        self.write_envelope(envelope)
    }

    fn write_envelope(&self, mut envelope: MessageEnvelope) -> Result<MessageEnvelope> {
        let inbox = self.paths.inbox_dir(envelope.to);
        match fs::create_dir(&inbox) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(Error::write(inbox, e)),
        }

        let text = envelope.encode()?;
        let path = document_file(&inbox, &envelope.file_stem());
        atomic_write(&path, text.as_bytes())?;
        append_line(&self.paths.communication_log(), &log_line(&envelope))?;

        debug!(
            id = %envelope.id,
            from = %envelope.from,
            to = %envelope.to,
            kind = %envelope.kind,
            "Message published"
        );
        Ok(envelope)
    }

    /// Messages addressed to `identity` with `timestamp > since`, oldest
    /// first.
    ///
    /// The directory is listed once; files are read and verified lazily as
    /// the iterator advances. Corrupt envelopes are skipped and logged.
    pub fn subscribe(&self, identity: AgentIdentity, since: i64) -> Result<Subscription> {
        let inbox = self.paths.inbox_dir(identity);
        let stems = list_document_stems(&inbox)?
            .into_iter()
            .filter(|stem| stem_timestamp(stem).is_some_and(|ts| ts > since))
            .collect::<Vec<_>>();
        Ok(Subscription {
            inbox,
            stems: stems.into_iter(),
            watermark: since,
            skipped: Vec::new(),
        })
    }

    /// Number of envelopes ever delivered to `identity`.
    pub fn count(&self, identity: AgentIdentity) -> Result<usize> {
        Ok(list_document_stems(&self.paths.inbox_dir(identity))?.len())
    }

    /// Last `n` lines of the communication log.
    pub fn recent_log(&self, n: usize) -> Result<Vec<String>> {
        let text = match fs::read_to_string(self.paths.communication_log()) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].iter().map(|l| (*l).to_string()).collect())
    }
}

fn log_line(envelope: &MessageEnvelope) -> String {
    let now = unix_millis();
    format!(
        "[{}.{:03}] {}",
        now / 1000,
        now % 1000,
        envelope.summary()
    )
}

/// One pass over an inbox. Finite; resume with [`Subscription::watermark`]
/// as the next call's `since`.
#[derive(Debug)]
pub struct Subscription {
    inbox: PathBuf,
    stems: std::vec::IntoIter<String>,
    watermark: i64,
    skipped: Vec<PathBuf>,
}

impl Subscription {
    /// Timestamp of the newest envelope yielded so far, or the starting
    /// `since` if nothing was yielded.
    pub const fn watermark(&self) -> i64 {
        self.watermark
    }

    /// Files skipped as corrupt during this pass.
    pub fn skipped(&self) -> &[PathBuf] {
        &self.skipped
    }

    fn load(path: &Path) -> Result<MessageEnvelope> {
        let text = fs::read_to_string(path).map_err(|e| Error::corrupt(path, e.to_string()))?;
        MessageEnvelope::decode(path, &text)
    }
}

impl Iterator for Subscription {
    type Item = MessageEnvelope;

    fn next(&mut self) -> Option<Self::Item> {
        for stem in self.stems.by_ref() {
            let path = document_file(&self.inbox, &stem);
            match Self::load(&path) {
                Ok(envelope) => {
                    self.watermark = self.watermark.max(envelope.timestamp);
                    return Some(envelope);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "CorruptMessage: skipping envelope");
                    self.skipped.push(path);
                }
            }
        }
        None
    }
}

//! Front-matter document codec shared by task records and message envelopes.
//!
//! On-disk shape:
//!
//! ```text
//! ---
//! id: "6f1c..."
//! priority: "high"
//! ---
//! <body, byte for byte>
//! ---
//! checksum: <hex sha256>
//! ```
//!
//! Metadata values are single-line JSON. The checksum footer is located from
//! the end of the file, so bodies may contain `---` lines of their own. The
//! digest covers the metadata block as stored plus the body; any mutated byte
//! in either fails verification.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const FENCE: &str = "---\n";
const FOOTER: &str = "\n---\nchecksum: ";

/// A decoded document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document<M> {
    pub meta: M,
    pub body: String,
    pub checksum: String,
}

/// SHA-256 over a rendered metadata block and a body, hex-encoded.
pub fn digest(header: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(header.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

fn render_header<M: Serialize>(meta: &M) -> Result<String> {
    let serde_json::Value::Object(fields) = serde_json::to_value(meta)? else {
        return Err(Error::Config("document metadata must be a struct".into()));
    };
    let mut header = String::new();
    for (key, value) in fields {
        header.push_str(&key);
        header.push_str(": ");
        header.push_str(&serde_json::to_string(&value)?);
        header.push('\n');
    }
    Ok(header)
}

/// Render `meta` and `body` into document text. Returns `(text, checksum)`.
pub fn render<M: Serialize>(meta: &M, body: &str) -> Result<(String, String)> {
    let header = render_header(meta)?;
    let checksum = digest(&header, body);
    let text = format!("{FENCE}{header}{FENCE}{body}{FOOTER}{checksum}\n");
    Ok((text, checksum))
}

/// Parse and verify document text read from `path`.
///
/// Structural problems and checksum mismatches both surface as
/// [`Error::CorruptMessage`].
pub fn parse<M: DeserializeOwned>(path: &Path, text: &str) -> Result<Document<M>> {
    let rest = text
        .strip_prefix(FENCE)
        .ok_or_else(|| Error::corrupt(path, "missing opening fence"))?;
    let header_end = rest
        .find("\n---\n")
        .ok_or_else(|| Error::corrupt(path, "unterminated metadata block"))?;
    let header = &rest[..=header_end];
    let after = &rest[header_end + 1 + FENCE.len()..];

    let footer_at = after
        .rfind(FOOTER)
        .ok_or_else(|| Error::corrupt(path, "missing checksum footer"))?;
    let body = &after[..footer_at];
    let checksum = after[footer_at + FOOTER.len()..].trim_end_matches('\n');

    if digest(header, body) != checksum {
        return Err(Error::corrupt(path, "checksum mismatch"));
    }

    let mut fields = serde_json::Map::new();
    for line in header.lines() {
        let (key, raw) = line
            .split_once(": ")
            .ok_or_else(|| Error::corrupt(path, format!("malformed metadata line {line:?}")))?;
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| Error::corrupt(path, format!("metadata {key}: {e}")))?;
        fields.insert(key.to_string(), value);
    }
    let meta = serde_json::from_value(serde_json::Value::Object(fields))
        .map_err(|e| Error::corrupt(path, format!("metadata: {e}")))?;

    Ok(Document {
        meta,
        body: body.to_string(),
        checksum: checksum.to_string(),
    })
}

/// Read and parse a document file.
pub fn read<M: DeserializeOwned>(path: &Path) -> Result<Document<M>> {
    let text = std::fs::read_to_string(path)?;
    parse(path, &text)
}

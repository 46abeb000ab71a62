//! Parsed fragments and the header fields the pipeline inspects.

use serde_json::Value;
use std::fmt;
use std::time::Instant;

/// Top-level (legacy) and header-nested sequence field.
pub const SEQ_FIELD: &str = "seq";
/// Header object carrying `seq` and `frame_id`.
pub const HEADER_FIELD: &str = "header";
/// Header field tagging the logical stream.
pub const FRAME_ID_FIELD: &str = "frame_id";
/// Stream key used when a fragment carries no `header.frame_id`.
pub const DEFAULT_STREAM: &str = "default";

/// One JSON document received in a single datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Parsed document
    pub document: Value,
    /// Monotonic arrival time
    pub received_at: Instant,
}

impl RawMessage {
    /// Wrap a document stamped with the current time.
    pub fn new(document: Value) -> Self {
        Self::at(document, Instant::now())
    }

    /// Wrap a document with an explicit arrival time.
    pub fn at(document: Value, received_at: Instant) -> Self {
        Self {
            document,
            received_at,
        }
    }

    /// Sequence number: `seq` at top level first, then `header.seq`.
    ///
    /// Values that are not non-negative integers are treated as absent.
    pub fn sequence(&self) -> Option<u64> {
        self.document
            .get(SEQ_FIELD)
            .or_else(|| self.header().and_then(|h| h.get(SEQ_FIELD)))
            .and_then(Value::as_u64)
    }

    /// Logical stream this fragment belongs to.
    pub fn stream_key(&self) -> StreamKey {
        self.header()
            .and_then(|h| h.get(FRAME_ID_FIELD))
            .and_then(Value::as_str)
            .map(StreamKey::new)
            .unwrap_or_default()
    }

    fn header(&self) -> Option<&Value> {
        self.document.get(HEADER_FIELD)
    }
}

/// Identifier of an independent sequence space on one port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey(String);

impl StreamKey {
    /// Create a key from a frame identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Key as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the untagged stream.
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_STREAM
    }
}

impl Default for StreamKey {
    fn default() -> Self {
        Self(DEFAULT_STREAM.to_string())
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize fragments one compact JSON document per line.
pub fn bundle_to_string(fragments: &[RawMessage]) -> String {
    fragments
        .iter()
        .map(|m| m.document.to_string())
        .fold(String::new(), |mut acc, line| {
            acc.push_str(&line);
            acc.push('\n');
            acc
        })
}

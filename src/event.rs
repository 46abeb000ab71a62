//! Runtime events surfaced to collaborators.
//!
//! Every non-fatal condition the pipeline encounters becomes an [`IngestEvent`]
//! delivered to an [`EventSink`]. The embedding layer decides what is shown to
//! the user; the pipeline only classifies by [`Severity`].

use std::fmt;
use std::sync::Arc;

/// Severity level for ingestion events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Degraded operation, self-healing
    Warning = 1,
    /// Data was lost or could not be interpreted
    Error = 2,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// A non-fatal condition raised by the listener or the reassembler.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    /// Datagram text was not valid JSON after sanitization.
    Parse {
        /// Sanitized datagram text
        raw: String,
        /// Parser diagnostic
        diagnostic: String,
    },
    /// `recv` failed with something other than a timeout.
    Socket {
        /// OS error code, when the platform reports one
        code: Option<i32>,
        /// OS error description
        description: String,
    },
    /// Neither `seq` nor `header.seq` was present.
    MissingSequence,
    /// Pending bundles exceed the backlog threshold.
    Backlog {
        /// Number of pending bundles
        pending: usize,
        /// Configured fragments per bundle
        bundle_size: usize,
    },
    /// An incomplete bundle outlived the staleness lifetime.
    BundleExpired {
        /// Sequence number of the evicted bundle
        seq: u64,
        /// Serialized fragments, one JSON document per line
        contents: String,
    },
    /// The inbound queue was full and oldest documents were discarded.
    QueueOverflow {
        /// Documents discarded since the last drain
        dropped: u64,
    },
    /// A bundle was delivered but its payload did not match the expected layout.
    Protocol(String),
}

impl IngestEvent {
    /// Classify the event.
    pub fn severity(&self) -> Severity {
        match self {
            IngestEvent::Parse { .. }
            | IngestEvent::Socket { .. }
            | IngestEvent::MissingSequence
            | IngestEvent::QueueOverflow { .. } => Severity::Error,
            IngestEvent::Backlog { .. }
            | IngestEvent::BundleExpired { .. }
            | IngestEvent::Protocol(_) => Severity::Warning,
        }
    }
}

impl fmt::Display for IngestEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestEvent::Parse { raw, diagnostic } => {
                write!(f, "Error while parsing JSON ({raw}): {diagnostic}")
            }
            IngestEvent::Socket { code, description } => match code {
                Some(code) => write!(f, "Socket error ({code}) occurred: {description}"),
                None => write!(f, "Socket error occurred: {description}"),
            },
            IngestEvent::MissingSequence => {
                write!(f, "Bad json formatting: can't locate 'seq' field")
            }
            IngestEvent::Backlog {
                pending,
                bundle_size,
            } => write!(
                f,
                "Incoming message queue is too large - {pending} (data is received, but not \
                 processed). Check message bundle size (current bundle size is {bundle_size}; \
                 was the protocol updated?)"
            ),
            IngestEvent::BundleExpired { seq, contents } => write!(
                f,
                "Cleaning up old unprocessed message bundle (id {seq}). This normally should \
                 not happen, check incoming messages bundle length. Deleted: {contents}"
            ),
            IngestEvent::QueueOverflow { dropped } => {
                write!(f, "Inbound queue overflow: {dropped} documents discarded")
            }
            IngestEvent::Protocol(msg) => write!(f, "{msg}"),
        }
    }
}

/// Callback receiving every event. Invoked from both the listener thread and
/// the polling thread, so it must be cheap and thread-safe.
pub type EventSink = Arc<dyn Fn(&IngestEvent) + Send + Sync>;

/// An [`EventSink`] that ignores everything.
///
/// Components already log each condition where it is detected, so this is a
/// sensible default when nothing else needs to react.
pub fn discard_sink() -> EventSink {
    Arc::new(|_: &IngestEvent| {})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Error > Severity::Warning);
        assert_eq!(IngestEvent::MissingSequence.severity(), Severity::Error);
        assert_eq!(
            IngestEvent::Backlog {
                pending: 500,
                bundle_size: 3
            }
            .severity(),
            Severity::Warning
        );
    }

    #[test]
    fn backlog_message_names_sizes() {
        let msg = IngestEvent::Backlog {
            pending: 512,
            bundle_size: 4,
        }
        .to_string();
        assert!(msg.contains("512"));
        assert!(msg.contains("current bundle size is 4"));
    }

    #[test]
    fn socket_message_without_code() {
        let msg = IngestEvent::Socket {
            code: None,
            description: "connection refused".into(),
        }
        .to_string();
        assert_eq!(msg, "Socket error occurred: connection refused");
    }
}

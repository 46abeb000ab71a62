//! Custom error types for the ingestion pipeline.
//!
//! This module defines the primary error type, `IngestError`, for the crate.
//! Using the `thiserror` crate, it provides one consistent way to report the
//! failures that are fatal to a single call: binding the socket, starting the
//! listener twice, loading configuration, or looking up an extractor.
//!
//! ## What is *not* an error
//!
//! Conditions that happen while the pipeline is running (malformed JSON, a
//! failed `recv`, a missing `seq` field, backlog growth, an evicted bundle) are
//! never returned as `Err`. They are converted to [`IngestEvent`] values and
//! delivered through the event sink, so nothing propagates across the
//! listener/consumer boundary.
//!
//! [`IngestEvent`]: crate::event::IngestEvent

use std::net::SocketAddr;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors that are fatal to the call that produced them.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The UDP socket could not be bound.
    ///
    /// Fatal to listener construction. Usually the port is already taken by
    /// another process or the address is not local.
    #[error("Socket bind failure on {addr}: {source}")]
    Bind {
        /// Address the bind was attempted on
        addr: SocketAddr,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Socket options (receive timeout) could not be applied.
    #[error("Socket setup error: {0}")]
    SocketSetup(#[source] std::io::Error),

    /// `start()` was called while the receive loop was already active.
    ///
    /// Only the offending call fails; the running loop is unaffected.
    #[error("Socket reader on port {port} is already running")]
    AlreadyRunning {
        /// Port of the running listener
        port: u16,
    },

    /// The listener thread could not be spawned.
    #[error("Failed to spawn listener thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// The listener thread panicked and could not be joined cleanly.
    #[error("Listener thread for port {port} panicked")]
    ListenerPanicked {
        /// Port of the listener whose thread panicked
        port: u16,
    },

    /// Configuration sources could not be parsed or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// No extractor factory is registered under the requested subtype.
    #[error("Extractor '{0}' not found")]
    UnknownExtractor(String),
}

impl From<figment::Error> for IngestError {
    fn from(value: figment::Error) -> Self {
        IngestError::Config(Box::new(value))
    }
}

impl IngestError {
    /// Whether retrying the same call later can succeed without a config change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::AlreadyRunning { .. } | IngestError::ThreadSpawn(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_names_address() {
        let addr: SocketAddr = "0.0.0.0:21235".parse().unwrap();
        let err = IngestError::Bind {
            addr,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.0.0.0:21235"));
        assert!(!err.is_transient());
    }

    #[test]
    fn already_running_is_transient() {
        let err = IngestError::AlreadyRunning { port: 21234 };
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "Socket reader on port 21234 is already running");
    }
}

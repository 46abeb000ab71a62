//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `FRAME_INGEST_`, sections split on `__`)
//!
//! Every field has a default, so an empty file (or no file) yields a working
//! configuration for the analysis feed on port 21235.
//!
//! # Example
//! ```no_run
//! use frame_ingest::config::IngestConfig;
//!
//! let config = IngestConfig::load_from("config/ingest.toml")?;
//! config.validate()?;
//! println!("Listening on port {}", config.listener.port);
//! # Ok::<(), frame_ingest::IngestError>(())
//! ```

use crate::error::{IngestError, Result};
use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65507;
/// Default port of the tracking (heartbeat/world) feed.
pub const TRACKING_PORT: u16 = 21234;
/// Default port of the analysis feed.
pub const ANALYSIS_PORT: u16 = 21235;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    /// Socket settings
    pub listener: ListenerConfig,
    /// Reassembly settings
    pub bundle: BundleConfig,
    /// Inbound queue settings
    pub queue: QueueConfig,
    /// No-data and blank-run detection
    pub liveness: LivenessConfig,
    /// Log output
    pub logging: LoggingSettings,
}

/// UDP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Local address to bind
    pub bind_address: IpAddr,
    /// UDP port
    pub port: u16,
    /// Receive timeout; bounds how long `stop()` waits for the loop to notice
    #[serde(with = "humantime_serde")]
    pub recv_timeout: Duration,
    /// Receive buffer size in bytes
    pub buffer_size: usize,
}

/// Bundle reassembly configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BundleConfig {
    /// Fragments expected per sequence number
    pub size: usize,
    /// Maximum age of an incomplete bundle
    #[serde(with = "humantime_serde")]
    pub lifetime: Duration,
    /// Pending bundle count that triggers a backlog warning (0 disables)
    pub backlog_threshold: usize,
}

/// Inbound queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued documents before the oldest are discarded
    pub max_len: usize,
}

/// Liveness configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LivenessConfig {
    /// Silence after which the feed is considered stopped
    #[serde(with = "humantime_serde")]
    pub no_data_threshold: Duration,
    /// Consecutive empty polls before a blank-run trigger
    pub blank_run_threshold: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: OutputFormat,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: ANALYSIS_PORT,
            recv_timeout: Duration::from_secs(1),
            buffer_size: MAX_DATAGRAM,
        }
    }
}

impl ListenerConfig {
    /// Address the socket binds to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            size: 1,
            lifetime: Duration::from_millis(2000),
            backlog_threshold: 500,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_len: 10_000 }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            no_data_threshold: Duration::from_millis(1000),
            blank_run_threshold: 60,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

impl IngestConfig {
    /// Environment variable prefix
    pub const ENV_PREFIX: &'static str = "FRAME_INGEST_";

    /// Load configuration from defaults and environment variables only
    pub fn load() -> Result<Self> {
        Self::figment().extract().map_err(IngestError::from)
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables override file values, e.g.
    /// `FRAME_INGEST_LISTENER__PORT=21234`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"))
            .extract()
            .map_err(IngestError::from)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(IngestError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.listener.port == 0 {
            return Err(IngestError::Configuration(
                "listener.port must be non-zero".into(),
            ));
        }

        if self.listener.buffer_size == 0 || self.listener.buffer_size > MAX_DATAGRAM {
            return Err(IngestError::Configuration(format!(
                "listener.buffer_size {} must be within 1..={MAX_DATAGRAM}",
                self.listener.buffer_size
            )));
        }

        if self.listener.recv_timeout.is_zero() {
            // a zero timeout means "block forever" to the OS, and stop() would hang
            return Err(IngestError::Configuration(
                "listener.recv_timeout must be non-zero".into(),
            ));
        }

        if self.bundle.size == 0 {
            return Err(IngestError::Configuration(
                "bundle.size must be at least 1".into(),
            ));
        }

        if self.bundle.lifetime.is_zero() {
            return Err(IngestError::Configuration(
                "bundle.lifetime must be non-zero".into(),
            ));
        }

        if self.queue.max_len == 0 {
            return Err(IngestError::Configuration(
                "queue.max_len must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

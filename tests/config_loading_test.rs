//! Configuration loading from files and environment.

use frame_ingest::config::{IngestConfig, ANALYSIS_PORT};
use frame_ingest::logging::{self, LoggingConfig, OutputFormat};
use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
#[serial]
fn loads_full_file() {
    let file = write_config(
        r#"
        [listener]
        bind_address = "127.0.0.1"
        port = 21234
        recv_timeout = "500ms"

        [bundle]
        size = 5
        lifetime = "3s"
        backlog_threshold = 100

        [queue]
        max_len = 256

        [liveness]
        no_data_threshold = "2s"
        blank_run_threshold = 30

        [logging]
        level = "debug"
        format = "json"
        "#,
    );

    let config = IngestConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.listener.port, 21234);
    assert_eq!(config.listener.recv_timeout, Duration::from_millis(500));
    assert_eq!(config.bundle.size, 5);
    assert_eq!(config.bundle.lifetime, Duration::from_secs(3));
    assert_eq!(config.queue.max_len, 256);
    assert_eq!(config.liveness.blank_run_threshold, 30);
    assert_eq!(config.logging.format, OutputFormat::Json);
}

#[test]
#[serial]
fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = IngestConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, IngestConfig::default());
    assert_eq!(config.listener.port, ANALYSIS_PORT);
}

#[test]
#[serial]
fn environment_overrides_file() {
    let file = write_config("[bundle]\nsize = 2\n");

    std::env::set_var("FRAME_INGEST_BUNDLE__SIZE", "4");
    std::env::set_var("FRAME_INGEST_LISTENER__PORT", "30000");
    let result = IngestConfig::load_from(file.path());
    std::env::remove_var("FRAME_INGEST_BUNDLE__SIZE");
    std::env::remove_var("FRAME_INGEST_LISTENER__PORT");

    let config = result.unwrap();
    assert_eq!(config.bundle.size, 4);
    assert_eq!(config.listener.port, 30000);
}

#[test]
#[serial]
fn malformed_file_is_a_config_error() {
    let file = write_config("[bundle\nsize = ");
    let err = IngestConfig::load_from(file.path()).unwrap_err();
    assert!(err.to_string().starts_with("Configuration error"));
}

#[test]
#[serial]
fn invalid_values_fail_validation() {
    let file = write_config("[bundle]\nsize = 0\n");
    let config = IngestConfig::load_from(file.path()).unwrap();
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("bundle.size"));
}

#[test]
fn logging_init_is_idempotent() {
    let config = LoggingConfig::new(tracing::Level::WARN).with_ansi(false);
    assert!(logging::init(config.clone()).is_ok());
    assert!(logging::init(config).is_ok());
}

#[test]
#[serial]
fn shipped_config_matches_defaults() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/ingest.toml");
    let config = IngestConfig::load_from(path).unwrap();
    assert_eq!(config, IngestConfig::default());
}

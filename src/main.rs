//! CLI entry point for frame-ingest
//!
//! Provides command-line interface for:
//! - Monitoring a live fragment feed (bundles, events, heartbeat summary)
//! - Checking a configuration file
//!
//! # Usage
//!
//! Watch the analysis feed for ten seconds:
//! ```bash
//! frame-ingest monitor --port 21235 --bundle-size 3 --duration 10s
//! ```
//!
//! Validate a configuration file:
//! ```bash
//! frame-ingest check-config config/ingest.toml
//! ```

// Global allocator: mimalloc for the many small JSON allocations on the hot path
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use frame_ingest::event::{EventSink, IngestEvent, Severity};
use frame_ingest::extract::ExtractorRegistry;
use frame_ingest::logging::{self, LoggingConfig};
use frame_ingest::{registry, FrameAssembler, IngestConfig};
use humantime_serde::re::humantime;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "frame-ingest")]
#[command(about = "UDP JSON fragment ingestion and bundle reassembly", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to a port and log every completed bundle
    Monitor {
        /// Configuration file (TOML format)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `listener.port`
        #[arg(long)]
        port: Option<u16>,

        /// Override `bundle.size`
        #[arg(long)]
        bundle_size: Option<usize>,

        /// Poll rate in Hz
        #[arg(long, default_value = "60")]
        rate: f64,

        /// Stop after this long (e.g. "30s", "5m"); runs until killed if omitted
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        /// Annotate log lines with source file and line
        #[arg(long)]
        log_locations: bool,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Path to TOML file
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Monitor {
            config,
            port,
            bundle_size,
            rate,
            duration,
            log_locations,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.listener.port = port;
            }
            if let Some(size) = bundle_size {
                config.bundle.size = size;
            }
            config.validate()?;
            logging::init(
                LoggingConfig::from_settings(&config.logging)?.with_file_and_line(log_locations),
            )?;
            monitor(&config, rate, duration)
        }
        Commands::CheckConfig { file } => check_config(&file),
    }
}

fn load_config(path: Option<&Path>) -> Result<IngestConfig> {
    match path {
        Some(path) => IngestConfig::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => IngestConfig::load().context("Failed to load configuration from environment"),
    }
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(Some(path))?;
    config.validate()?;
    println!("{}: ok", path.display());
    println!(
        "  listener {} (timeout {:?}, buffer {} bytes)",
        config.listener.socket_addr(),
        config.listener.recv_timeout,
        config.listener.buffer_size
    );
    println!(
        "  bundle size {}, lifetime {:?}, backlog threshold {}",
        config.bundle.size, config.bundle.lifetime, config.bundle.backlog_threshold
    );
    Ok(())
}

#[derive(Default)]
struct EventCounters {
    warnings: AtomicU64,
    errors: AtomicU64,
}

fn counting_sink(counters: Arc<EventCounters>) -> EventSink {
    Arc::new(move |event: &IngestEvent| match event.severity() {
        Severity::Warning => {
            counters.warnings.fetch_add(1, Ordering::Relaxed);
            debug!(%event, "warning");
        }
        Severity::Error => {
            counters.errors.fetch_add(1, Ordering::Relaxed);
            debug!(%event, "error");
        }
    })
}

fn monitor(config: &IngestConfig, rate: f64, duration: Option<Duration>) -> Result<()> {
    if !(rate.is_finite() && rate > 0.0) {
        anyhow::bail!("--rate must be a positive number, got {rate}");
    }
    let period = Duration::from_secs_f64(1.0 / rate);

    let counters = Arc::new(EventCounters::default());
    let assembler = Arc::new(FrameAssembler::with_sink(
        config,
        counting_sink(Arc::clone(&counters)),
    ));
    let attachment = registry::attach(&config.listener, assembler.clone())?;
    let mut heartbeat = ExtractorRegistry::new()
        .create("heartbeat", &toml::Value::Table(Default::default()))?;

    info!(
        port = attachment.port(),
        bundle_size = config.bundle.size,
        rate,
        "Monitoring"
    );

    let started = Instant::now();
    let mut last_report = started;
    let mut delivered = 0u64;

    while duration.map_or(true, |d| started.elapsed() < d) {
        let tick = Instant::now();

        assembler.poll(|bundle| {
            delivered += 1;
            info!(
                seq = bundle.seq,
                stream = %bundle.stream,
                fragments = bundle.fragments.len(),
                "Bundle"
            );
            for warning in heartbeat.extract(&bundle.fragments).warnings {
                warn!(%warning, "Heartbeat");
            }
        });

        if last_report.elapsed() >= Duration::from_secs(1) {
            let summary = heartbeat.extract(&[]);
            info!(
                delivered,
                dropped = assembler.dropped_total(),
                pending = assembler.pending_len(),
                no_data = assembler.no_data(),
                blank = assembler.is_blank(),
                heartbeats = summary.value("heartbeat").unwrap_or_default(),
                max_id = summary.value("maxId").unwrap_or_default(),
                warnings = counters.warnings.load(Ordering::Relaxed),
                errors = counters.errors.load(Ordering::Relaxed),
                "Summary"
            );
            last_report = Instant::now();
        }

        if !attachment.listener().is_running() {
            error!("Listener stopped unexpectedly");
            break;
        }

        thread::sleep(period.saturating_sub(tick.elapsed()));
    }

    drop(attachment);
    info!(delivered, elapsed = ?started.elapsed(), "Monitor finished");
    Ok(())
}

//! # Frame Ingest
//!
//! Receives JSON message fragments over UDP, reassembles them into complete
//! per-sequence bundles and hands each bundle, in order and at most once, to
//! the embedding application. Packet loss, reordering and malformed payloads
//! are tolerated; they surface as [`IngestEvent`]s instead of errors.
//!
//! ## Crate Structure
//!
//! - **`listener`**: `SocketListener`, one UDP socket and its receive thread.
//! - **`subscriber`**: the `Receiver` trait and the thread-safe fan-out set.
//! - **`registry`**: process-wide table sharing one listener per port.
//! - **`queue`**: bounded FIFO between the listener thread and the poller.
//! - **`reassembler`**: sequence-keyed bundling, watermarks and eviction.
//! - **`liveness`**: the sticky no-data flag.
//! - **`assembler`**: `FrameAssembler`, the receiver that ties the above together.
//! - **`extract`**: subtype extractors, created by name.
//! - **`codec`**: datagram decoding and `NaN` sanitization.
//! - **`config`** / **`logging`** / **`error`** / **`event`**: ambient plumbing.
//!
//! ## Example
//!
//! ```no_run
//! use frame_ingest::{registry, FrameAssembler, IngestConfig};
//! use std::sync::Arc;
//!
//! let config = IngestConfig::load_from("ingest.toml")?;
//! let assembler = Arc::new(FrameAssembler::new(&config));
//! let _attachment = registry::attach(&config.listener, assembler.clone())?;
//!
//! loop {
//!     assembler.poll(|bundle| {
//!         println!("seq {}: {} fragments", bundle.seq, bundle.fragments.len());
//!     });
//!     std::thread::sleep(std::time::Duration::from_millis(16));
//! }
//! # Ok::<(), frame_ingest::IngestError>(())
//! ```

pub mod assembler;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod extract;
pub mod listener;
pub mod liveness;
pub mod logging;
pub mod message;
pub mod queue;
pub mod reassembler;
pub mod registry;
pub mod subscriber;

pub use assembler::{FrameAssembler, PollOutcome};
pub use config::IngestConfig;
pub use error::{IngestError, Result};
pub use event::{EventSink, IngestEvent, Severity};
pub use listener::SocketListener;
pub use message::{RawMessage, StreamKey};
pub use reassembler::CompletedBundle;
pub use subscriber::{Receiver, SubscriberId};

//! Process-wide port registry.
//!
//! Several receivers may share one UDP port. The registry keeps one
//! [`SocketListener`] per port, created and started on the first
//! [`attach`] and stopped when the last [`Attachment`] for that port is
//! dropped.
//!
//! ```no_run
//! use frame_ingest::{registry, config::ListenerConfig, FrameAssembler};
//! use std::sync::Arc;
//!
//! let assembler = Arc::new(FrameAssembler::new(&Default::default()));
//! let attachment = registry::attach(&ListenerConfig::default(), assembler.clone())?;
//! assert_eq!(registry::subscriber_count(attachment.port()), 1);
//! drop(attachment); // last one on the port: listener stops
//! # Ok::<(), frame_ingest::IngestError>(())
//! ```

use crate::config::ListenerConfig;
use crate::error::Result;
use crate::listener::SocketListener;
use crate::subscriber::{Receiver, SubscriberId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

struct PortEntry {
    listener: Arc<SocketListener>,
    attachments: usize,
}

static LISTENERS: OnceLock<Mutex<HashMap<u16, PortEntry>>> = OnceLock::new();

fn port_table() -> &'static Mutex<HashMap<u16, PortEntry>> {
    LISTENERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A receiver's registration on a shared port. Dropping it detaches.
#[must_use = "dropping the attachment unregisters the receiver immediately"]
pub struct Attachment {
    port: u16,
    id: SubscriberId,
    listener: Arc<SocketListener>,
}

impl Attachment {
    /// Port the receiver is attached to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The shared listener, e.g. for `is_running()` or `reset()`.
    pub fn listener(&self) -> &Arc<SocketListener> {
        &self.listener
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("port", &self.port)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.listener.unregister_receiver(self.id);

        let last = {
            let mut table = port_table().lock();
            match table.get_mut(&self.port) {
                Some(entry) if Arc::ptr_eq(&entry.listener, &self.listener) => {
                    entry.attachments = entry.attachments.saturating_sub(1);
                    if entry.attachments == 0 {
                        table.remove(&self.port);
                        true
                    } else {
                        false
                    }
                }
                // entry already torn down by shutdown_all()
                _ => false,
            }
        };

        if last {
            tracing::info!(port = self.port, "Last receiver detached, stopping listener");
            if let Err(e) = self.listener.stop() {
                tracing::error!(port = self.port, "Error stopping listener: {}", e);
            }
        }
    }
}

/// Attach `receiver` to the listener for `config.port`, binding and starting
/// it if this is the first attachment.
///
/// An existing listener is reused as-is; the other fields of `config` only
/// apply when the socket is created. Port 0 always binds a fresh ephemeral
/// port.
pub fn attach(config: &ListenerConfig, receiver: Arc<dyn Receiver>) -> Result<Attachment> {
    let listener = {
        let mut table = port_table().lock();
        let existing = if config.port == 0 {
            None
        } else {
            table.get_mut(&config.port)
        };

        match existing {
            Some(entry) => {
                entry.attachments += 1;
                tracing::debug!(port = config.port, "Reusing shared listener");
                Arc::clone(&entry.listener)
            }
            None => {
                let listener = Arc::new(SocketListener::bind(config)?);
                listener.start()?;
                table.insert(
                    listener.port(),
                    PortEntry {
                        listener: Arc::clone(&listener),
                        attachments: 1,
                    },
                );
                tracing::info!(port = listener.port(), "Registered new shared listener");
                listener
            }
        }
    };

    let id = listener.register_receiver(receiver);
    Ok(Attachment {
        port: listener.port(),
        id,
        listener,
    })
}

/// Number of ports with a live listener.
pub fn listener_count() -> usize {
    LISTENERS.get().map_or(0, |t| t.lock().len())
}

/// Receivers attached to `port`, or 0 if no listener exists for it.
pub fn subscriber_count(port: u16) -> usize {
    let listener = LISTENERS
        .get()
        .and_then(|t| t.lock().get(&port).map(|e| Arc::clone(&e.listener)));
    listener.map_or(0, |l| l.receiver_count())
}

/// Stop every listener and clear the table (for cleanup/testing).
///
/// Outstanding attachments stay valid; dropping them afterwards is a no-op
/// apart from unregistering from their (stopped) listener.
pub fn shutdown_all() {
    let drained: Vec<_> = match LISTENERS.get() {
        Some(table) => table.lock().drain().map(|(_, e)| e.listener).collect(),
        None => return,
    };

    let count = drained.len();
    for listener in drained {
        if let Err(e) = listener.stop() {
            tracing::error!(port = listener.port(), "Error stopping listener: {}", e);
        }
    }
    tracing::info!(count, "Stopped all shared listeners");
}

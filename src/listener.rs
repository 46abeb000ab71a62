//! Background UDP receive loop.
//!
//! A [`SocketListener`] owns one bound socket and at most one receive thread.
//! The socket carries a read timeout, which is the only way the thread notices
//! a stop request: `stop()` clears the running flag and joins, so it returns
//! within roughly one timeout period.

use crate::codec;
use crate::config::ListenerConfig;
use crate::error::{IngestError, Result};
use crate::event::IngestEvent;
use crate::message::RawMessage;
use crate::subscriber::{Receiver, SubscriberId, SubscriberSet};
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One UDP socket plus its receive thread and subscriber set.
pub struct SocketListener {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    buffer_size: usize,
    subscribers: Arc<SubscriberSet>,
    worker: Mutex<Option<Worker>>,
}

/// A spawned receive thread and the flag that keeps it looping.
///
/// Each start gets a fresh flag, so a loop that was only signalled (stopped
/// from its own thread) can never be revived by a later start.
struct Worker {
    handle: JoinHandle<()>,
    running: Arc<AtomicBool>,
}

impl Worker {
    fn is_live(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl SocketListener {
    /// Bind the socket described by `config`.
    ///
    /// Port 0 asks the OS for an ephemeral port; use [`port`](Self::port) to
    /// learn which one was assigned.
    pub fn bind(config: &ListenerConfig) -> Result<Self> {
        let addr = config.socket_addr();
        let socket = UdpSocket::bind(addr).map_err(|source| IngestError::Bind { addr, source })?;
        socket
            .set_read_timeout(Some(config.recv_timeout.max(Duration::from_millis(1))))
            .map_err(IngestError::SocketSetup)?;
        let local_addr = socket.local_addr().map_err(IngestError::SocketSetup)?;

        debug!(%local_addr, "Bound UDP socket");
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            buffer_size: config.buffer_size.max(1),
            subscribers: Arc::new(SubscriberSet::new()),
            worker: Mutex::new(None),
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Start the receive loop on a dedicated thread.
    ///
    /// Fails with [`IngestError::AlreadyRunning`] if the loop is active; the
    /// running loop is not affected. A loop that died (a receiver panicked)
    /// counts as stopped and is replaced.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(Worker::is_live) {
            return Err(IngestError::AlreadyRunning { port: self.port() });
        }

        // the previous loop has exited or is about to
        if let Some(stale) = worker.take() {
            if stale.handle.join().is_err() {
                warn!(port = self.port(), "Previous receive loop panicked");
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let receive_loop = ReceiveLoop {
            socket: Arc::clone(&self.socket),
            subscribers: Arc::clone(&self.subscribers),
            running: Arc::clone(&running),
            buffer: vec![0u8; self.buffer_size],
        };

        let handle = thread::Builder::new()
            .name(format!("udp-listener-{}", self.port()))
            .spawn(move || receive_loop.run())
            .map_err(IngestError::ThreadSpawn)?;

        *worker = Some(Worker { handle, running });
        info!(addr = %self.local_addr, "Started socket listener");
        Ok(())
    }

    /// Signal the loop to exit and wait for the thread.
    ///
    /// A no-op when not running. Called from the listener thread itself (for
    /// instance by a receiver dropping the last attachment) it only signals,
    /// since a thread cannot join itself.
    pub fn stop(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };
        let was_running = worker.running.swap(false, Ordering::SeqCst);

        if worker.handle.thread().id() == thread::current().id() {
            debug!(port = self.port(), "Stop requested from listener thread");
            return Ok(());
        }

        worker
            .handle
            .join()
            .map_err(|_| IngestError::ListenerPanicked { port: self.port() })?;

        if was_running {
            info!(addr = %self.local_addr, "Stopped socket listener");
        }
        Ok(())
    }

    /// Whether the receive loop is active.
    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(Worker::is_live)
    }

    /// Add a receiver; safe while the loop runs.
    pub fn register_receiver(&self, receiver: Arc<dyn Receiver>) -> SubscriberId {
        self.subscribers.register(receiver)
    }

    /// Remove a receiver; safe while the loop runs, also from its own callback.
    pub fn unregister_receiver(&self, id: SubscriberId) -> bool {
        self.subscribers.unregister(id)
    }

    /// Number of registered receivers.
    pub fn receiver_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Notify every receiver with `on_will_reset`, then drop them all.
    pub fn reset(&self) {
        debug!(port = self.port(), "Resetting socket listener receivers");
        self.subscribers.reset();
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Error stopping socket listener on drop: {}", e);
        }
    }
}

struct ReceiveLoop {
    socket: Arc<UdpSocket>,
    subscribers: Arc<SubscriberSet>,
    running: Arc<AtomicBool>,
    buffer: Vec<u8>,
}

/// Clears the running flag when the loop ends, including by unwinding out of
/// a receiver callback.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if self.0.swap(false, Ordering::SeqCst) && thread::panicking() {
            error!("Receive loop terminated by a panicking receiver");
        }
    }
}

impl ReceiveLoop {
    fn run(mut self) {
        let _guard = RunningGuard(Arc::clone(&self.running));

        while self.running.load(Ordering::SeqCst) {
            self.buffer.fill(0);

            match self.socket.recv_from(&mut self.buffer) {
                Ok((len, _peer)) => match codec::decode(&self.buffer[..len]) {
                    Ok(Some(document)) => {
                        self.subscribers.notify_message(&RawMessage::new(document));
                    }
                    Ok(None) => {}
                    Err(event) => {
                        warn!(%event, "Dropping malformed datagram");
                        self.subscribers.notify_error(&event);
                    }
                },
                Err(e) if is_timeout(&e) => {}
                Err(e) => {
                    let event = IngestEvent::Socket {
                        code: e.raw_os_error(),
                        description: e.to_string(),
                    };
                    warn!(%event, "Receive failed");
                    self.subscribers.notify_error(&event);
                }
            }
        }

        debug!("Receive loop exiting");
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::mpsc;

    fn loopback() -> ListenerConfig {
        ListenerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            recv_timeout: Duration::from_millis(50),
            ..ListenerConfig::default()
        }
    }

    struct Forward(Mutex<mpsc::Sender<std::result::Result<u64, String>>>);

    impl Receiver for Forward {
        fn on_message(&self, message: &RawMessage) {
            let _ = self.0.lock().send(Ok(message.sequence().unwrap_or_default()));
        }
        fn on_error(&self, event: &IngestEvent) {
            let _ = self.0.lock().send(Err(event.to_string()));
        }
    }

    #[test]
    fn double_start_fails_without_disturbing_loop() {
        let listener = SocketListener::bind(&loopback()).unwrap();
        listener.start().unwrap();

        let err = listener.start().unwrap_err();
        assert!(matches!(err, IngestError::AlreadyRunning { .. }));
        assert!(listener.is_running());

        listener.stop().unwrap();
        assert!(!listener.is_running());
    }

    #[test]
    fn stop_is_idempotent() {
        let listener = SocketListener::bind(&loopback()).unwrap();
        listener.stop().unwrap();
        listener.start().unwrap();
        listener.stop().unwrap();
        listener.stop().unwrap();
    }

    #[test]
    fn restart_after_stop() {
        let listener = SocketListener::bind(&loopback()).unwrap();
        listener.start().unwrap();
        listener.stop().unwrap();
        listener.start().unwrap();
        assert!(listener.is_running());
    }

    #[test]
    fn delivers_parsed_datagrams_and_errors() {
        let listener = SocketListener::bind(&loopback()).unwrap();
        let (tx, rx) = mpsc::channel();
        listener.register_receiver(Arc::new(Forward(Mutex::new(tx))));
        listener.start().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(br#"{"seq": 4}"#, listener.local_addr())
            .unwrap();
        sender.send_to(b"{not json", listener.local_addr()).unwrap();
        sender
            .send_to(br#"{"seq": 5}"#, listener.local_addr())
            .unwrap();

        let timeout = Duration::from_secs(2);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), Ok(4));
        assert!(rx.recv_timeout(timeout).unwrap().is_err());
        assert_eq!(rx.recv_timeout(timeout).unwrap(), Ok(5));
    }

    struct Explode;

    impl Receiver for Explode {
        fn on_message(&self, _message: &RawMessage) {
            panic!("receiver failure");
        }
        fn on_error(&self, _event: &IngestEvent) {}
    }

    fn wait_until_stopped(listener: &SocketListener) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if !listener.is_running() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn panicking_receiver_marks_loop_stopped() {
        let listener = SocketListener::bind(&loopback()).unwrap();
        let id = listener.register_receiver(Arc::new(Explode));
        listener.start().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(br#"{"seq": 1}"#, listener.local_addr())
            .unwrap();
        assert!(wait_until_stopped(&listener));

        listener.unregister_receiver(id);
        let (tx, rx) = mpsc::channel();
        listener.register_receiver(Arc::new(Forward(Mutex::new(tx))));
        listener.start().unwrap();
        assert!(listener.is_running());

        sender
            .send_to(br#"{"seq": 2}"#, listener.local_addr())
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Ok(2));
    }

    #[test]
    fn drop_joins_the_receive_thread() {
        let (tx, rx) = mpsc::channel();
        let listener = SocketListener::bind(&loopback()).unwrap();
        let addr = listener.local_addr();
        listener.register_receiver(Arc::new(Forward(Mutex::new(tx))));
        listener.start().unwrap();
        drop(listener);

        // joining released the receive loop and with it the receiver
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)),
            Err(mpsc::RecvTimeoutError::Disconnected)
        );
        assert!(UdpSocket::bind(addr).is_ok());
    }

    #[test]
    fn bind_conflict_reports_address() {
        let first = SocketListener::bind(&loopback()).unwrap();
        let taken = ListenerConfig {
            port: first.port(),
            ..loopback()
        };
        let err = SocketListener::bind(&taken).err().unwrap();
        assert!(matches!(err, IngestError::Bind { .. }));
    }
}

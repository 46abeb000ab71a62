//! Inbound document queue between the listener thread and the polling thread.

use crate::message::RawMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Bounded single-producer, single-consumer FIFO of parsed documents.
///
/// On overflow the oldest document is discarded; the count of discarded
/// documents is kept until the consumer collects it with
/// [`take_overflowed`](Self::take_overflowed).
pub struct InboundQueue {
    inner: Mutex<VecDeque<RawMessage>>,
    busy: AtomicBool,
    max_len: usize,
    overflowed: AtomicU64,
}

impl InboundQueue {
    /// Create a queue holding at most `max_len` documents.
    pub fn new(max_len: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            busy: AtomicBool::new(false),
            max_len: max_len.max(1),
            overflowed: AtomicU64::new(0),
        }
    }

    /// Append a document. Called by the listener thread.
    pub fn enqueue(&self, message: RawMessage) {
        let mut queue = self.inner.lock();
        self.busy.store(true, Ordering::Release);
        if queue.len() >= self.max_len {
            queue.pop_front();
            self.overflowed.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(message);
        self.busy.store(false, Ordering::Release);
    }

    /// Hand every queued document to `visitor`, oldest first.
    ///
    /// The queue lock is held only while the documents are taken, not while
    /// they are visited. Returns the number of documents visited.
    pub fn drain_all(&self, mut visitor: impl FnMut(RawMessage)) -> usize {
        let drained = std::mem::take(&mut *self.inner.lock());
        let count = drained.len();
        drained.into_iter().for_each(&mut visitor);
        count
    }

    /// Whether the producer is inside its enqueue critical section.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Hold the busy flag as if an enqueue were in progress.
    #[cfg(test)]
    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    /// Number of queued documents.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Documents discarded since the last call, resetting the count.
    pub fn take_overflowed(&self) -> u64 {
        self.overflowed.swap(0, Ordering::Relaxed)
    }

    /// Discard everything queued.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

//! Thread-safe receiver registry with synchronous fan-out.
//!
//! Receivers are invoked on the listener thread, in registration order, while
//! the registry lock is held for the whole pass. They must copy what they need
//! and return quickly: the next `recv` does not start until every receiver has
//! returned.
//!
//! # Re-entrancy
//!
//! A receiver may register or unregister receivers (itself included) from
//! inside its own callback. Such changes are recorded in the membership table
//! immediately, so `len()` and `contains()` reflect them at once, and applied
//! to the iteration list when the pass finishes. A receiver removed mid-pass is
//! skipped for the rest of that pass; a receiver added mid-pass first sees the
//! next event. A `reset()` from inside a callback empties the set at once and
//! delivers `on_will_reset` when the pass finishes.

use crate::event::IngestEvent;
use crate::message::RawMessage;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Capability of anything that consumes listener output.
pub trait Receiver: Send + Sync {
    /// A datagram parsed successfully.
    fn on_message(&self, message: &RawMessage);

    /// A parse or transport error occurred.
    fn on_error(&self, event: &IngestEvent);

    /// The listener is about to drop every receiver.
    fn on_will_reset(&self) {}
}

/// Handle returned by [`SubscriberSet::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

struct Entry {
    id: SubscriberId,
    receiver: Arc<dyn Receiver>,
}

#[derive(Default)]
struct Membership {
    live: HashSet<SubscriberId>,
    deferred_adds: Vec<Entry>,
    deferred_reset: Option<HashSet<SubscriberId>>,
}

impl Membership {
    fn apply(&mut self, entries: &mut Vec<Entry>) {
        entries.append(&mut self.deferred_adds);
        entries.retain(|e| self.live.contains(&e.id));
    }
}

/// Ordered set of receivers.
pub struct SubscriberSet {
    // Lock order: entries, then membership, then notifier.
    entries: Mutex<Vec<Entry>>,
    membership: Mutex<Membership>,
    notifier: Mutex<Option<ThreadId>>,
    next_id: AtomicU64,
}

impl Default for SubscriberSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            membership: Mutex::new(Membership::default()),
            notifier: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a receiver at the end of the notification order.
    pub fn register(&self, receiver: Arc<dyn Receiver>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry { id, receiver };

        if self.on_notifying_thread() {
            let mut membership = self.membership.lock();
            membership.live.insert(id);
            membership.deferred_adds.push(entry);
        } else {
            let mut entries = self.entries.lock();
            let mut membership = self.membership.lock();
            membership.apply(&mut entries);
            membership.live.insert(id);
            entries.push(entry);
        }

        tracing::debug!(%id, "Registered receiver");
        id
    }

    /// Remove a receiver. Returns `false` if it was not registered.
    ///
    /// When called from another thread during a notification pass this blocks
    /// until the pass completes; it never removes a receiver mid-iteration.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = if self.on_notifying_thread() {
            self.membership.lock().live.remove(&id)
        } else {
            let mut entries = self.entries.lock();
            let mut membership = self.membership.lock();
            let removed = membership.live.remove(&id);
            membership.apply(&mut entries);
            removed
        };

        if removed {
            tracing::debug!(%id, "Unregistered receiver");
        }
        removed
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.membership.lock().live.contains(&id)
    }

    /// Number of registered receivers.
    pub fn len(&self) -> usize {
        self.membership.lock().live.len()
    }

    /// Whether no receiver is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a parsed document to every receiver.
    pub fn notify_message(&self, message: &RawMessage) {
        self.fan_out(|r| r.on_message(message));
    }

    /// Deliver an error event to every receiver.
    pub fn notify_error(&self, event: &IngestEvent) {
        self.fan_out(|r| r.on_error(event));
    }

    /// Tell every receiver it is about to be dropped, then clear the set.
    pub fn reset(&self) {
        if self.on_notifying_thread() {
            let mut membership = self.membership.lock();
            let doomed = std::mem::take(&mut membership.live);
            membership
                .deferred_reset
                .get_or_insert_with(HashSet::new)
                .extend(doomed);
            tracing::debug!("Deferred receiver reset to end of pass");
            return;
        }

        self.fan_out(|r| r.on_will_reset());

        let mut entries = self.entries.lock();
        let mut membership = self.membership.lock();
        membership.live.clear();
        membership.apply(&mut entries);
        tracing::debug!("Cleared all receivers");
    }

    fn fan_out(&self, notify: impl FnMut(&dyn Receiver)) {
        let mut entries = self.entries.lock();
        self.membership.lock().apply(&mut entries);

        self.visit(
            &entries,
            |id| self.membership.lock().live.contains(&id),
            notify,
        );

        while let Some(doomed) = self.take_deferred_reset(&mut entries) {
            self.visit(&entries, |id| doomed.contains(&id), |r| r.on_will_reset());
            tracing::debug!("Cleared all receivers");
        }

        self.membership.lock().apply(&mut entries);
    }

    /// Pull a reset requested mid-pass, moving deferred adds into `entries`
    /// so receivers registered before the reset are told about it too.
    fn take_deferred_reset(&self, entries: &mut Vec<Entry>) -> Option<HashSet<SubscriberId>> {
        let mut membership = self.membership.lock();
        let doomed = membership.deferred_reset.take()?;
        entries.append(&mut membership.deferred_adds);
        Some(doomed)
    }

    fn visit(
        &self,
        entries: &[Entry],
        include: impl Fn(SubscriberId) -> bool,
        mut notify: impl FnMut(&dyn Receiver),
    ) {
        let _guard = NotifyingGuard::enter(&self.notifier);
        for entry in entries {
            if include(entry.id) {
                notify(entry.receiver.as_ref());
            }
        }
    }

    fn on_notifying_thread(&self) -> bool {
        *self.notifier.lock() == Some(thread::current().id())
    }
}

/// Marks the current thread as notifying; cleared on drop, also on unwind.
struct NotifyingGuard<'a> {
    notifier: &'a Mutex<Option<ThreadId>>,
}

impl<'a> NotifyingGuard<'a> {
    fn enter(notifier: &'a Mutex<Option<ThreadId>>) -> Self {
        *notifier.lock() = Some(thread::current().id());
        Self { notifier }
    }
}

impl Drop for NotifyingGuard<'_> {
    fn drop(&mut self) {
        *self.notifier.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::OnceLock;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<u64>>,
        errors: Mutex<Vec<String>>,
        resets: AtomicU64,
    }

    impl Receiver for Recorder {
        fn on_message(&self, message: &RawMessage) {
            self.messages
                .lock()
                .push(message.sequence().unwrap_or_default());
        }

        fn on_error(&self, event: &IngestEvent) {
            self.errors.lock().push(event.to_string());
        }

        fn on_will_reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn msg(seq: u64) -> RawMessage {
        RawMessage::new(json!({ "seq": seq }))
    }

    #[test]
    fn register_then_unregister_leaves_set_empty() {
        let set = SubscriberSet::new();
        let recorder = Arc::new(Recorder::default());
        let id = set.register(recorder.clone());
        assert_eq!(set.len(), 1);

        assert!(set.unregister(id));
        assert!(set.is_empty());
        assert!(!set.unregister(id));

        set.notify_message(&msg(1));
        assert!(recorder.messages.lock().is_empty());
    }

    #[test]
    fn notifies_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Tagged(&'static str, Arc<Mutex<Vec<&'static str>>>);
        impl Receiver for Tagged {
            fn on_message(&self, _: &RawMessage) {
                self.1.lock().push(self.0);
            }
            fn on_error(&self, _: &IngestEvent) {}
        }

        let set = SubscriberSet::new();
        set.register(Arc::new(Tagged("a", order.clone())));
        set.register(Arc::new(Tagged("b", order.clone())));
        set.register(Arc::new(Tagged("c", order.clone())));
        set.notify_message(&msg(1));

        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn errors_reach_error_channel_only() {
        let set = SubscriberSet::new();
        let recorder = Arc::new(Recorder::default());
        set.register(recorder.clone());

        set.notify_error(&IngestEvent::MissingSequence);
        assert_eq!(recorder.errors.lock().len(), 1);
        assert!(recorder.messages.lock().is_empty());
    }

    struct SelfRemoving {
        set: Arc<SubscriberSet>,
        id: OnceLock<SubscriberId>,
        calls: AtomicU64,
    }

    impl Receiver for SelfRemoving {
        fn on_message(&self, _: &RawMessage) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = self.id.get() {
                self.set.unregister(*id);
            }
        }
        fn on_error(&self, _: &IngestEvent) {}
    }

    #[test]
    fn self_unregister_from_callback_does_not_deadlock() {
        let set = Arc::new(SubscriberSet::new());
        let receiver = Arc::new(SelfRemoving {
            set: set.clone(),
            id: OnceLock::new(),
            calls: AtomicU64::new(0),
        });
        let id = set.register(receiver.clone());
        receiver.id.set(id).unwrap();
        let other = Arc::new(Recorder::default());
        set.register(other.clone());

        set.notify_message(&msg(1));
        assert_eq!(set.len(), 1);
        assert!(!set.contains(id));

        set.notify_message(&msg(2));
        assert_eq!(receiver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*other.messages.lock(), vec![1, 2]);
    }

    struct Adder {
        set: Arc<SubscriberSet>,
        late: Arc<Recorder>,
        added: AtomicU64,
    }

    impl Receiver for Adder {
        fn on_message(&self, _: &RawMessage) {
            if self.added.fetch_add(1, Ordering::SeqCst) == 0 {
                self.set.register(self.late.clone());
            }
        }
        fn on_error(&self, _: &IngestEvent) {}
    }

    #[test]
    fn receiver_added_mid_pass_sees_next_event() {
        let set = Arc::new(SubscriberSet::new());
        let late = Arc::new(Recorder::default());
        set.register(Arc::new(Adder {
            set: set.clone(),
            late: late.clone(),
            added: AtomicU64::new(0),
        }));

        set.notify_message(&msg(1));
        assert_eq!(set.len(), 2);
        assert!(late.messages.lock().is_empty());

        set.notify_message(&msg(2));
        assert_eq!(*late.messages.lock(), vec![2]);
    }

    #[test]
    fn reset_notifies_then_clears() {
        let set = SubscriberSet::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        set.register(a.clone());
        set.register(b.clone());

        set.reset();
        assert!(set.is_empty());
        assert_eq!(a.resets.load(Ordering::SeqCst), 1);
        assert_eq!(b.resets.load(Ordering::SeqCst), 1);

        set.notify_message(&msg(3));
        assert!(a.messages.lock().is_empty());
    }

    struct ResettingReceiver {
        set: Arc<SubscriberSet>,
        resets: AtomicU64,
    }

    impl Receiver for ResettingReceiver {
        fn on_message(&self, _: &RawMessage) {
            self.set.reset();
            assert!(self.set.is_empty());
        }
        fn on_error(&self, _: &IngestEvent) {}
        fn on_will_reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn reset_from_callback_is_deferred_to_end_of_pass() {
        let set = Arc::new(SubscriberSet::new());
        let resetter = Arc::new(ResettingReceiver {
            set: set.clone(),
            resets: AtomicU64::new(0),
        });
        let other = Arc::new(Recorder::default());
        set.register(resetter.clone());
        set.register(other.clone());

        set.notify_message(&msg(1));
        assert!(set.is_empty());
        assert_eq!(resetter.resets.load(Ordering::SeqCst), 1);
        assert_eq!(other.resets.load(Ordering::SeqCst), 1);
        // skipped for the rest of the pass once the reset was requested
        assert!(other.messages.lock().is_empty());

        set.notify_message(&msg(2));
        assert!(other.messages.lock().is_empty());
    }

    #[test]
    fn concurrent_register_during_fan_out() {
        let set = Arc::new(SubscriberSet::new());
        let recorder = Arc::new(Recorder::default());
        set.register(recorder.clone());

        let producer = {
            let set = set.clone();
            thread::spawn(move || {
                for seq in 0..200 {
                    set.notify_message(&msg(seq));
                }
            })
        };
        let ids: Vec<_> = (0..50)
            .map(|_| set.register(Arc::new(Recorder::default())))
            .collect();
        for id in ids {
            assert!(set.unregister(id));
        }
        producer.join().unwrap();

        assert_eq!(set.len(), 1);
        assert_eq!(recorder.messages.lock().len(), 200);
    }
}

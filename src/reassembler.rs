//! Sequence-keyed bundle reassembly.
//!
//! Fragments sharing a sequence number accumulate in a pending [`Bundle`]
//! until the configured fragment count is reached. Each sequence number moves
//! through one lifecycle:
//!
//! ```text
//! absent -> collecting -> dispatched
//!                      -> stale (complete, but below the stream watermark)
//!                      -> expired (incomplete past the staleness lifetime)
//! ```
//!
//! Every terminal transition removes the entry and retires the sequence
//! number. Fragments for a retired sequence are discarded on arrival, so no
//! sequence is collected twice. Bundles are visited in ascending sequence
//! order, so within one dispatch pass a stream is delivered in order even when
//! several of its bundles complete together.
//!
//! Watermarks are kept per [`StreamKey`] and never decrease. A complete bundle
//! with `seq >= watermark` is dispatched; anything lower is dropped and counted.

use crate::config::BundleConfig;
use crate::event::IngestEvent;
use crate::message::{bundle_to_string, RawMessage, StreamKey};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Fragments collected for one sequence number.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// When the first fragment arrived
    pub arrived_at: Instant,
    /// Fragments in arrival order
    pub fragments: Vec<RawMessage>,
}

impl Bundle {
    fn new(arrived_at: Instant) -> Self {
        Self {
            arrived_at,
            fragments: Vec::new(),
        }
    }
}

/// A complete, in-order bundle handed to the completion handler.
#[derive(Debug, Clone)]
pub struct CompletedBundle {
    /// Sequence number shared by every fragment
    pub seq: u64,
    /// Stream resolved from the first fragment
    pub stream: StreamKey,
    /// Fragments in arrival order
    pub fragments: Vec<RawMessage>,
}

/// Counts from one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Bundles handed to the handler
    pub delivered: usize,
    /// Complete bundles dropped for being below their watermark
    pub dropped_stale: usize,
    /// Incomplete bundles evicted for age
    pub expired: usize,
    /// Whether the pass was skipped because the producer was mid-enqueue
    pub skipped: bool,
}

/// Upper bound on remembered retired sequence numbers.
pub const RETIRED_CAPACITY: usize = 4096;

#[derive(Default)]
struct BundleState {
    pending: BTreeMap<u64, Bundle>,
    // keyed by `header.frame_id` from the wire; one entry per distinct stream
    // a sender has used, cleared only by `clear()`
    watermarks: HashMap<StreamKey, u64>,
    // sequence -> when it left `collecting`
    retired: BTreeMap<u64, Instant>,
    dropped_total: u64,
}

impl BundleState {
    fn retire(&mut self, seq: u64, now: Instant) {
        self.retired.insert(seq, now);
    }

    /// Forget retired sequences below every watermark once they are older
    /// than `lifetime`, then enforce [`RETIRED_CAPACITY`].
    fn prune_retired(&mut self, now: Instant, lifetime: Duration) {
        if let Some(floor) = self.watermarks.values().copied().min() {
            self.retired.retain(|&seq, &mut at| {
                seq >= floor || now.saturating_duration_since(at) < lifetime
            });
        }
        while self.retired.len() > RETIRED_CAPACITY {
            self.retired.pop_first();
        }
    }
}

/// Groups fragments by sequence number and dispatches complete bundles.
pub struct Reassembler {
    bundle_size: usize,
    lifetime: Duration,
    backlog_threshold: usize,
    state: Mutex<BundleState>,
}

impl Reassembler {
    /// Create a reassembler from bundle settings.
    pub fn new(config: &BundleConfig) -> Self {
        Self {
            bundle_size: config.size.max(1),
            lifetime: config.lifetime,
            backlog_threshold: config.backlog_threshold,
            state: Mutex::new(BundleState::default()),
        }
    }

    /// Fragments required for a bundle to be complete.
    pub fn bundle_size(&self) -> usize {
        self.bundle_size
    }

    /// Add fragments to their pending bundles. Never dispatches.
    ///
    /// Fragments without a resolvable sequence number are discarded with a
    /// [`IngestEvent::MissingSequence`] event. Fragments for a sequence that
    /// was already dispatched, dropped or expired are discarded silently. If the pending set reaches the
    /// backlog threshold a single [`IngestEvent::Backlog`] warning is emitted
    /// for the call.
    pub fn ingest(
        &self,
        fragments: impl IntoIterator<Item = RawMessage>,
        now: Instant,
        events: &mut Vec<IngestEvent>,
    ) {
        let mut state = self.state.lock();
        let mut peak = 0;

        for fragment in fragments {
            let Some(seq) = fragment.sequence() else {
                events.push(IngestEvent::MissingSequence);
                continue;
            };
            if state.retired.contains_key(&seq) {
                tracing::debug!(seq, "Discarding fragment for retired sequence");
                continue;
            }

            state
                .pending
                .entry(seq)
                .or_insert_with(|| Bundle::new(now))
                .fragments
                .push(fragment);
            peak = peak.max(state.pending.len());
        }

        if self.backlog_threshold > 0 && peak >= self.backlog_threshold {
            tracing::warn!(
                pending = peak,
                bundle_size = self.bundle_size,
                "Pending bundle backlog over threshold"
            );
            events.push(IngestEvent::Backlog {
                pending: peak,
                bundle_size: self.bundle_size,
            });
        }
    }

    /// Run one dispatch pass over every pending bundle.
    ///
    /// Complete bundles at or above their stream watermark are passed to
    /// `handler` in ascending sequence order; the handler runs after the
    /// bundle lock is released. Expiry warnings are appended to `events`.
    pub fn dispatch(
        &self,
        now: Instant,
        events: &mut Vec<IngestEvent>,
        mut handler: impl FnMut(CompletedBundle),
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut ready = Vec::new();

        {
            let mut state = self.state.lock();
            let pending = std::mem::take(&mut state.pending);

            for (seq, bundle) in pending {
                if bundle.fragments.len() >= self.bundle_size {
                    let stream = bundle
                        .fragments
                        .first()
                        .map(RawMessage::stream_key)
                        .unwrap_or_default();
                    state.retire(seq, now);

                    let watermark = state.watermarks.get(&stream).copied().unwrap_or(0);

                    if seq < watermark {
                        tracing::debug!(seq, watermark, %stream, "Dropping out-of-order bundle");
                        report.dropped_stale += 1;
                        state.dropped_total += 1;
                    } else {
                        state.watermarks.insert(stream.clone(), seq);
                        ready.push(CompletedBundle {
                            seq,
                            stream,
                            fragments: bundle.fragments,
                        });
                    }
                } else if now.saturating_duration_since(bundle.arrived_at) >= self.lifetime {
                    tracing::warn!(
                        seq,
                        fragments = bundle.fragments.len(),
                        expected = self.bundle_size,
                        "Evicting incomplete bundle"
                    );
                    state.retire(seq, now);
                    report.expired += 1;
                    events.push(IngestEvent::BundleExpired {
                        seq,
                        contents: bundle_to_string(&bundle.fragments),
                    });
                } else {
                    state.pending.insert(seq, bundle);
                }
            }
            state.prune_retired(now, self.lifetime);
        }

        for bundle in ready {
            tracing::trace!(seq = bundle.seq, stream = %bundle.stream, "Dispatching bundle");
            report.delivered += 1;
            handler(bundle);
        }

        report
    }

    /// Highest dispatched sequence for `stream`, if any bundle was dispatched.
    pub fn watermark(&self, stream: &StreamKey) -> Option<u64> {
        self.state.lock().watermarks.get(stream).copied()
    }

    /// Number of bundles still collecting.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Fragments collected so far for `seq`.
    pub fn pending_fragments(&self, seq: u64) -> usize {
        self.state
            .lock()
            .pending
            .get(&seq)
            .map_or(0, |b| b.fragments.len())
    }

    /// Complete bundles dropped as stale over the reassembler's lifetime.
    pub fn dropped_total(&self) -> u64 {
        self.state.lock().dropped_total
    }

    /// Whether fragments for `seq` are currently being discarded.
    pub fn is_retired(&self, seq: u64) -> bool {
        self.state.lock().retired.contains_key(&seq)
    }

    /// Forget pending bundles, watermarks and retired sequences.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.watermarks.clear();
        state.retired.clear();
    }
}

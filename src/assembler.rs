//! Consumer-side pipeline: queue, reassembler and liveness behind one receiver.
//!
//! A [`FrameAssembler`] is registered with a listener (directly or through
//! [`registry::attach`](crate::registry::attach)). The listener thread only
//! copies documents into its queue. The embedding application calls
//! [`poll`](FrameAssembler::poll) once per work cycle, which drains the queue,
//! dispatches every complete bundle and updates the no-data and blank-run
//! indicators. `poll` never blocks on the network.

use crate::config::IngestConfig;
use crate::event::{discard_sink, EventSink, IngestEvent};
use crate::liveness::LivenessTracker;
use crate::message::{RawMessage, StreamKey};
use crate::queue::InboundQueue;
use crate::reassembler::{CompletedBundle, DispatchReport, Reassembler};
use crate::subscriber::Receiver;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Counts from one [`poll`](FrameAssembler::poll).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Documents taken from the queue
    pub drained: usize,
    /// Bundles handed to the handler
    pub delivered: usize,
    /// Complete bundles dropped below their watermark
    pub dropped_stale: usize,
    /// Incomplete bundles evicted for age
    pub expired: usize,
    /// Dispatch did not run because the listener was mid-enqueue
    pub skipped: bool,
}

struct CycleState {
    liveness: LivenessTracker,
    blank_runs: u32,
    blank: bool,
    last_seq: Option<u64>,
    last_dropped: usize,
}

/// Receiver that turns a fragment stream into in-order bundles.
pub struct FrameAssembler {
    queue: InboundQueue,
    reassembler: Reassembler,
    blank_run_threshold: u32,
    sink: EventSink,
    state: Mutex<CycleState>,
}

impl FrameAssembler {
    /// Create an assembler whose events are only logged.
    pub fn new(config: &IngestConfig) -> Self {
        Self::with_sink(config, discard_sink())
    }

    /// Create an assembler that forwards every event to `sink`.
    ///
    /// The sink is called from the listener thread for parse and socket
    /// errors, and from the polling thread for everything else.
    pub fn with_sink(config: &IngestConfig, sink: EventSink) -> Self {
        Self {
            queue: InboundQueue::new(config.queue.max_len),
            reassembler: Reassembler::new(&config.bundle),
            blank_run_threshold: config.liveness.blank_run_threshold,
            sink,
            state: Mutex::new(CycleState {
                liveness: LivenessTracker::new(config.liveness.no_data_threshold, Instant::now()),
                blank_runs: 0,
                blank: false,
                last_seq: None,
                last_dropped: 0,
            }),
        }
    }

    /// Drain the queue and dispatch complete bundles.
    pub fn poll(&self, handler: impl FnMut(CompletedBundle)) -> PollOutcome {
        self.poll_at(Instant::now(), handler)
    }

    /// [`poll`](Self::poll) with an explicit clock.
    pub fn poll_at(&self, now: Instant, handler: impl FnMut(CompletedBundle)) -> PollOutcome {
        let drained = self.process_queue_at(now);
        let report = self.process_bundle_at(now, handler);
        PollOutcome {
            drained,
            delivered: report.delivered,
            dropped_stale: report.dropped_stale,
            expired: report.expired,
            skipped: report.skipped,
        }
    }

    /// Move queued documents into pending bundles. Never dispatches.
    ///
    /// Returns the number of documents drained.
    pub fn process_queue_at(&self, now: Instant) -> usize {
        let queued = self.queue.len();
        self.state.lock().liveness.observe(now, queued);

        let mut drained = Vec::with_capacity(queued);
        let count = self.queue.drain_all(|m| drained.push(m));

        let mut events = Vec::new();
        self.reassembler.ingest(drained, now, &mut events);

        let dropped = self.queue.take_overflowed();
        if dropped > 0 {
            warn!(dropped, "Inbound queue overflowed");
            events.push(IngestEvent::QueueOverflow { dropped });
        }

        self.emit(&events);
        count
    }

    /// Dispatch every complete bundle and evict stale ones.
    ///
    /// Skipped, with `skipped` set in the report, while the listener is inside
    /// its enqueue critical section.
    pub fn process_bundle_at(
        &self,
        now: Instant,
        mut handler: impl FnMut(CompletedBundle),
    ) -> DispatchReport {
        if self.queue.is_busy() {
            trace!("Producer busy, skipping dispatch");
            return DispatchReport {
                skipped: true,
                ..DispatchReport::default()
            };
        }

        let mut events = Vec::new();
        let mut last = None;
        let report = self.reassembler.dispatch(now, &mut events, |bundle| {
            last = Some(bundle.seq);
            handler(bundle);
        });

        {
            let mut state = self.state.lock();
            state.last_dropped = report.dropped_stale;
            if report.dropped_stale > 0 {
                debug!(dropped = report.dropped_stale, "Dropped out-of-order bundles");
            }

            if let Some(seq) = last {
                state.last_seq = Some(seq);
                state.liveness.bundle_delivered(now);
                if state.blank {
                    info!(after = state.blank_runs, "Blank run ended");
                }
                state.blank_runs = 0;
                state.blank = false;
            } else {
                state.blank_runs = state.blank_runs.saturating_add(1);
                if !state.blank
                    && self.blank_run_threshold > 0
                    && state.blank_runs >= self.blank_run_threshold
                {
                    state.blank = true;
                    info!(polls = state.blank_runs, "Blank run");
                }
            }
        }

        self.emit(&events);
        report
    }

    /// Whether the feed has been silent past the no-data threshold.
    pub fn no_data(&self) -> bool {
        self.state.lock().liveness.no_data()
    }

    /// Whether the blank-run threshold was reached since the last delivery.
    pub fn is_blank(&self) -> bool {
        self.state.lock().blank
    }

    /// Consecutive polls without a delivery.
    pub fn blank_runs(&self) -> u32 {
        self.state.lock().blank_runs
    }

    /// Sequence of the most recently delivered bundle.
    pub fn last_seq(&self) -> Option<u64> {
        self.state.lock().last_seq
    }

    /// Stale bundles dropped by the most recent dispatch pass.
    pub fn dropped_count(&self) -> usize {
        self.state.lock().last_dropped
    }

    /// Stale bundles dropped since creation.
    pub fn dropped_total(&self) -> u64 {
        self.reassembler.dropped_total()
    }

    /// Time since the last delivered bundle.
    pub fn since_last_bundle(&self, now: Instant) -> Option<Duration> {
        self.state.lock().liveness.since_last_bundle(now)
    }

    /// Highest delivered sequence for `stream`.
    pub fn watermark(&self, stream: &StreamKey) -> Option<u64> {
        self.reassembler.watermark(stream)
    }

    /// Documents waiting in the inbound queue.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Bundles still collecting fragments.
    pub fn pending_len(&self) -> usize {
        self.reassembler.pending_len()
    }

    /// Expected fragments per bundle.
    pub fn bundle_size(&self) -> usize {
        self.reassembler.bundle_size()
    }

    /// Forget queued documents, pending bundles and watermarks.
    pub fn clear(&self) {
        self.queue.clear();
        self.reassembler.clear();
        let mut state = self.state.lock();
        state.blank_runs = 0;
        state.blank = false;
        state.last_seq = None;
        state.last_dropped = 0;
    }

    fn emit(&self, events: &[IngestEvent]) {
        for event in events {
            (self.sink)(event);
        }
    }
}

impl Receiver for FrameAssembler {
    fn on_message(&self, message: &RawMessage) {
        self.queue.enqueue(message.clone());
    }

    fn on_error(&self, event: &IngestEvent) {
        (self.sink)(event);
    }

    fn on_will_reset(&self) {
        debug!("Listener reset, clearing assembler state");
        self.clear();
    }
}

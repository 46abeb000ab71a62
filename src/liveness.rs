//! Transport liveness ("no data") tracking.
//!
//! Answers "is the feed alive", not "did this tick produce a frame". The flag
//! is raised when nothing was drained for longer than the threshold and the
//! inbound queue is empty; it is cleared by the first check that sees queued
//! data again.

use std::time::{Duration, Instant};

/// Sticky no-data detector.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    threshold: Duration,
    last_data_at: Instant,
    last_bundle_at: Option<Instant>,
    no_data: bool,
}

impl LivenessTracker {
    /// Start tracking from `now`.
    pub fn new(threshold: Duration, now: Instant) -> Self {
        Self {
            threshold,
            last_data_at: now,
            last_bundle_at: None,
            no_data: false,
        }
    }

    /// Record a liveness check against the current queue depth.
    ///
    /// Call once per poll, before draining. Returns the updated flag.
    pub fn observe(&mut self, now: Instant, queued: usize) -> bool {
        if now.saturating_duration_since(self.last_data_at) > self.threshold {
            self.no_data = queued == 0;
        }
        if queued > 0 {
            self.last_data_at = now;
            if self.no_data {
                tracing::info!("Feed resumed");
            }
            self.no_data = false;
        } else if self.no_data {
            tracing::trace!(silent_for = ?now.saturating_duration_since(self.last_data_at), "No data");
        }
        self.no_data
    }

    /// Record a successful bundle delivery.
    pub fn bundle_delivered(&mut self, now: Instant) {
        self.last_bundle_at = Some(now);
    }

    /// Current flag value.
    pub fn no_data(&self) -> bool {
        self.no_data
    }

    /// Time since the last non-empty drain.
    pub fn since_last_data(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_data_at)
    }

    /// Time since the last delivered bundle, if any was delivered.
    pub fn since_last_bundle(&self, now: Instant) -> Option<Duration> {
        self.last_bundle_at
            .map(|at| now.saturating_duration_since(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_millis(1000);

    #[test]
    fn quiet_feed_raises_flag_after_threshold() {
        let start = Instant::now();
        let mut tracker = LivenessTracker::new(THRESHOLD, start);

        assert!(!tracker.observe(start + Duration::from_millis(500), 0));
        assert!(tracker.observe(start + Duration::from_millis(1500), 0));
        // sticky
        assert!(tracker.observe(start + Duration::from_millis(1600), 0));
    }

    #[test]
    fn datagram_clears_flag_on_next_check() {
        let start = Instant::now();
        let mut tracker = LivenessTracker::new(THRESHOLD, start);
        assert!(tracker.observe(start + Duration::from_millis(2000), 0));

        assert!(!tracker.observe(start + Duration::from_millis(2100), 1));
        assert!(!tracker.no_data());
        assert_eq!(
            tracker.since_last_data(start + Duration::from_millis(2600)),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn steady_traffic_never_raises_flag() {
        let start = Instant::now();
        let mut tracker = LivenessTracker::new(THRESHOLD, start);
        for tick in 1..50 {
            assert!(!tracker.observe(start + Duration::from_millis(tick * 100), 2));
        }
    }

    #[test]
    fn bundle_age_tracked_separately() {
        let start = Instant::now();
        let mut tracker = LivenessTracker::new(THRESHOLD, start);
        assert_eq!(tracker.since_last_bundle(start), None);

        tracker.bundle_delivered(start);
        assert_eq!(
            tracker.since_last_bundle(start + Duration::from_millis(40)),
            Some(Duration::from_millis(40))
        );
    }
}

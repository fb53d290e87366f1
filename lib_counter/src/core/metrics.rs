//! # Process Metrics Sink
//!
//! Process-wide counters fed by the bus connector's delivery loops: how many
//! messages were processed, how many failed, and how many arrived during the
//! last second.
//!
//! ## Core Functionality:
//!
//! - **Injected, not global**: the connector receives an `Arc<dyn MetricsSink>`
//!   at construction. Services share one `CounterSink` between the connector
//!   and the monitor endpoint; tests pass a `NoopSink` or their own recorder.
//!
//! - **Atomic Accounting**: totals are `AtomicU64`s updated with `Relaxed`
//!   ordering. Nothing else is synchronized through them; only the eventual
//!   value of each counter matters.
//!
//! - **Rolling Rate**: `RateCounter` keeps the arrival instants of the last
//!   window and prunes older ones on every touch, so the rate reflects
//!   exactly the trailing second.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Receiver of delivery-loop events.
pub trait MetricsSink: Send + Sync {
    /// A delivery was handed to its handler.
    fn record_processed(&self);
    /// A handler reported failure and the delivery was requeued.
    fn record_error(&self);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record_processed(&self) {}
    fn record_error(&self) {}
}

/// # Rate Counter
///
/// Counts hits within a trailing window.
#[derive(Debug)]
pub struct RateCounter {
    window: Duration,
    hits: Mutex<VecDeque<Instant>>,
}

impl RateCounter {
    /// Creates a counter over `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            hits: Mutex::new(VecDeque::new()),
        }
    }

    /// Records one hit now.
    pub fn incr(&self) {
        self.incr_at(Instant::now());
    }

    /// Hits within the window ending now.
    pub fn rate(&self) -> u64 {
        self.rate_at(Instant::now())
    }

    fn incr_at(&self, now: Instant) {
        let mut hits = self.hits.lock().expect("Rate counter lock poisoned");
        Self::prune(&mut hits, now, self.window);
        hits.push_back(now);
    }

    fn rate_at(&self, now: Instant) -> u64 {
        let mut hits = self.hits.lock().expect("Rate counter lock poisoned");
        Self::prune(&mut hits, now, self.window);
        hits.len() as u64
    }

    fn prune(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while hits.front().map_or(false, |&t| now.duration_since(t) >= window) {
            hits.pop_front();
        }
    }
}

/// Point-in-time view of a `CounterSink`, in the shape served at
/// `/debug/vars`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Deliveries handed to a handler since process start.
    pub total_processed: u64,
    /// Deliveries whose handler failed since process start.
    pub worker_errors: u64,
    /// Deliveries within the last second.
    pub hits_per_second: u64,
}

/// # Counter Sink
///
/// The production sink: lifetime totals plus a one-second rate. Created once
/// at startup and never reset.
#[derive(Debug)]
pub struct CounterSink {
    total_processed: AtomicU64,
    worker_errors: AtomicU64,
    hits_per_second: RateCounter,
}

impl Default for CounterSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSink {
    /// Creates a sink with zeroed counters.
    pub fn new() -> Self {
        Self {
            total_processed: AtomicU64::new(0),
            worker_errors: AtomicU64::new(0),
            hits_per_second: RateCounter::new(Duration::from_secs(1)),
        }
    }

    /// Deliveries handed to a handler.
    pub fn total_processed(&self) -> u64 {
        self.total_processed.load(Ordering::Relaxed)
    }

    /// Failed deliveries.
    pub fn worker_errors(&self) -> u64 {
        self.worker_errors.load(Ordering::Relaxed)
    }

    /// Failed deliveries as a fraction of processed ones.
    pub fn error_rate(&self) -> f64 {
        let processed = self.total_processed();
        if processed == 0 {
            0.0
        } else {
            self.worker_errors() as f64 / processed as f64
        }
    }

    /// Reads all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_processed: self.total_processed(),
            worker_errors: self.worker_errors(),
            hits_per_second: self.hits_per_second.rate(),
        }
    }
}

impl MetricsSink for CounterSink {
    fn record_processed(&self) {
        self.hits_per_second.incr();
        self.total_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.worker_errors.fetch_add(1, Ordering::Relaxed);
    }
}

//! # Rollup Engine
//!
//! Counts actions into fixed-length buckets (one UTC day by default) and merges
//! each completed run of `period_buckets` consecutive buckets (fifteen by
//! default, half a month) into one summary set.
//!
//! ## Key Derivation
//!
//! All boundaries are whole multiples of the bucket length counted from the
//! Unix epoch, so they never depend on the local UTC offset:
//!
//! - bucket start = `floor(t / bucket_secs) * bucket_secs`
//! - period start = `floor(bucket_index / period_buckets) * period_buckets`
//!   buckets after the epoch
//!
//! A timestamp exactly on a boundary belongs to the later bucket.
//!
//! ## Idempotence
//!
//! The summary key is derived from the period start only, and the merge
//! replaces the destination instead of adding to it. Running `rollup` twice for
//! the same reference time rewrites the same summary with the same values.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::connections::bucket_store::BucketStore;
use crate::error::CounterError;
use crate::model::{MetricEntry, SummarySet};

/// Seconds in one UTC day.
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Shape of the buckets and periods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupOptions {
    /// Namespace for every key the engine writes.
    pub key_prefix: String,
    /// Bucket length in seconds.
    pub bucket_secs: i64,
    /// Buckets per rollup period (`W`).
    pub period_buckets: i64,
}

impl Default for RollupOptions {
    fn default() -> Self {
        Self {
            key_prefix: "distinct".to_string(),
            bucket_secs: SECONDS_PER_DAY,
            period_buckets: 15,
        }
    }
}

/// The last fully closed period relative to some reference time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupPeriod {
    /// Unix seconds of the first bucket.
    pub start: i64,
    /// The `W` constituent bucket keys, oldest first.
    pub bucket_keys: Vec<String>,
    /// Destination of the merge.
    pub summary_key: String,
}

/// # Rollup Engine
///
/// Stateless apart from its options: the buckets and summaries live in the
/// injected store.
pub struct RollupEngine {
    store: Arc<dyn BucketStore>,
    options: RollupOptions,
}

impl RollupEngine {
    /// Creates an engine over `store`.
    ///
    /// Non-positive lengths in `options` are raised to 1. `period_buckets` is
    /// lowered until a whole period still fits in an `i64` of seconds.
    pub fn new(store: Arc<dyn BucketStore>, mut options: RollupOptions) -> Self {
        options.bucket_secs = options.bucket_secs.max(1);
        options.period_buckets = options.period_buckets.clamp(1, i64::MAX / options.bucket_secs);
        Self { store, options }
    }

    /// The engine's bucket and period shape.
    pub fn options(&self) -> &RollupOptions {
        &self.options
    }

    /// Length of one period in seconds.
    pub fn period_secs(&self) -> i64 {
        self.options.period_buckets * self.options.bucket_secs
    }

    /// Unix seconds of the start of the bucket containing `ts`.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.options.bucket_secs) * self.options.bucket_secs
    }

    /// The bucket start of `ts` as a UTC instant.
    pub fn bucket_start_time(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        Utc.timestamp_opt(self.bucket_start(ts), 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Unix seconds of the start of the period containing the bucket that
    /// starts at `bucket_start`.
    pub fn period_start(&self, bucket_start: i64) -> i64 {
        let bucket_index = bucket_start.div_euclid(self.options.bucket_secs);
        let period_index = bucket_index.div_euclid(self.options.period_buckets);
        period_index * self.period_secs()
    }

    /// True when `ts` falls in a period older than the last completed period
    /// at `reference`. Scheduled rollups no longer revisit such a period.
    pub fn predates_completed_period(&self, ts: DateTime<Utc>, reference: DateTime<Utc>) -> bool {
        let current = self.period_start(self.bucket_start(reference));
        self.period_start(self.bucket_start(ts)) < current.saturating_sub(self.period_secs())
    }

    /// Key of the ordered set holding the bucket that starts at `bucket_start`.
    pub fn bucket_key(&self, bucket_start: i64) -> String {
        format!("{}:bucket:{}", self.options.key_prefix, bucket_start)
    }

    /// Key of the summary set of the period that starts at `period_start`.
    pub fn summary_key(&self, period_start: i64) -> String {
        format!("{}:summary:{}", self.options.key_prefix, period_start)
    }

    /// Adds `entry.count` to `entry.action` in the bucket of
    /// `entry.timestamp`, returning the new score. One atomic store call.
    ///
    /// # Errors
    /// `StoreUnavailable` when the store call fails; nothing was applied.
    pub async fn ingest(&self, entry: &MetricEntry) -> Result<i64, CounterError> {
        let bucket = self.bucket_start(entry.timestamp);
        let key = self.bucket_key(bucket);
        if self.predates_completed_period(entry.timestamp, Utc::now()) {
            log::debug!(
                "Late entry for '{}' lands in period {}, which is already rolled up; rerun rollup to refresh {}",
                entry.action,
                self.period_start(bucket),
                self.summary_key(self.period_start(bucket))
            );
        }
        let score = self.store.increment_member(&key, &entry.action, entry.count).await?;
        log::trace!("{} += {} for '{}' -> {}", key, entry.count, entry.action, score);
        Ok(score)
    }

    /// The period ending strictly before the period that contains `reference`.
    ///
    /// # Errors
    /// `NoCompletedPeriod` when `reference` predates the epoch or falls in the
    /// first period after it.
    pub fn completed_period(&self, reference: DateTime<Utc>) -> Result<RollupPeriod, CounterError> {
        let t = reference.timestamp();
        if t < 0 {
            return Err(CounterError::NoCompletedPeriod(t));
        }

        let period_secs = self.period_secs();
        let current = self.period_start(self.bucket_start(reference));
        let start = current - period_secs;
        if start < 0 {
            return Err(CounterError::NoCompletedPeriod(t));
        }

        let bucket_keys = (0..self.options.period_buckets)
            .map(|i| self.bucket_key(start + i * self.options.bucket_secs))
            .collect();

        Ok(RollupPeriod {
            start,
            bucket_keys,
            summary_key: self.summary_key(start),
        })
    }

    /// Merges the last completed period before `reference` into its summary
    /// set and returns the summary key.
    ///
    /// # Errors
    /// `NoCompletedPeriod` as for `completed_period`; `StoreUnavailable` when
    /// the merge fails.
    pub async fn rollup(&self, reference: DateTime<Utc>) -> Result<String, CounterError> {
        let period = self.completed_period(reference)?;
        self.store.merge_sum(&period.summary_key, &period.bucket_keys).await?;
        log::info!(
            "Rolled up {} buckets starting at unix {} into {}",
            period.bucket_keys.len(),
            period.start,
            period.summary_key
        );
        Ok(period.summary_key)
    }

    /// Reads a summary set.
    pub async fn summary(&self, summary_key: &str) -> Result<SummarySet, CounterError> {
        Ok(self.store.range_with_scores(summary_key).await?.into_iter().collect())
    }
}

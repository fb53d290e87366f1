//! # Metric Model
//!
//! The JSON document producers publish on the bus, and the summary shape the
//! rollup engine returns.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CounterError;

/// Per-period mapping from action to its accumulated count.
pub type SummarySet = BTreeMap<String, i64>;

fn default_count() -> i64 {
    1
}

/// # Metric Entry
///
/// One observed event: `actor` performed `action` at `timestamp`.
///
/// Only `action` is an aggregation dimension. `actor` is carried for
/// provenance and never read by the rollup path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricEntry {
    /// Originating subject.
    #[serde(alias = "username")]
    pub actor: String,
    /// Weight contributed by this event, usually 1.
    #[serde(default = "default_count")]
    pub count: i64,
    /// The counted dimension.
    #[serde(alias = "metric")]
    pub action: String,
    /// Logical event time, used for bucket placement.
    #[serde(alias = "time")]
    pub timestamp: DateTime<Utc>,
}

impl MetricEntry {
    /// Builds an entry.
    pub fn new(actor: impl Into<String>, count: i64, action: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            actor: actor.into(),
            count,
            action: action.into(),
            timestamp,
        }
    }

    /// Parses a bus payload.
    ///
    /// # Errors
    /// `DecodeError` when the payload is not a JSON entry or when `actor` or
    /// `action` is empty.
    pub fn decode(payload: &[u8]) -> Result<Self, CounterError> {
        let entry: MetricEntry = serde_json::from_slice(payload)
            .map_err(|e: serde_json::Error| CounterError::DecodeError(e.to_string()))?;

        if entry.actor.trim().is_empty() {
            return Err(CounterError::DecodeError("actor must not be empty".to_string()));
        }
        if entry.action.trim().is_empty() {
            return Err(CounterError::DecodeError("action must not be empty".to_string()));
        }
        Ok(entry)
    }

    /// Serializes the entry for publishing.
    pub fn encode(&self) -> Vec<u8> {
        // A struct of strings, an integer and a timestamp always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

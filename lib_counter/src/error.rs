//! # Counter Errors
//!
//! A single error taxonomy for the ingest path, the rollup path and the bus
//! connector.

use thiserror::Error;

/// Errors surfaced by the bucket store, the transport, the rollup engine and
/// the bus connector.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CounterError {
    /// The bucket store could not execute the command. Transient: the message
    /// that triggered it should be requeued.
    #[error("Bucket store unavailable: {0}")]
    StoreUnavailable(String),

    /// The message transport refused or lost the connection. Recovered by
    /// the reconnect supervisor, only ever returned for the immediate call.
    #[error("Message transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A payload could not be parsed into a `MetricEntry`.
    #[error("Failed to decode metric entry: {0}")]
    DecodeError(String),

    /// Rollup was requested for a reference time with no fully closed period
    /// behind it. Carries the reference time in Unix seconds.
    #[error("No completed rollup period before unix time {0}")]
    NoCompletedPeriod(i64),

    /// A subscription with this name is already registered.
    #[error("Subscription '{0}' is already registered")]
    DuplicateRegistration(String),

    /// The connector has been closed.
    #[error("Connector is closed")]
    Closed,
}

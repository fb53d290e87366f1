//! # lib_counter
//!
//! Ingestion and aggregation core of the distinct action counter. Events of the
//! form "an actor performed an action at a time" arrive over a message bus,
//! are counted into daily buckets and periodically rolled up into per-period
//! summary sets.
//!
//! ## Layout
//!
//! - **`model`**: the `MetricEntry` wire document and summary types.
//! - **`error`**: the `CounterError` taxonomy shared by every component.
//! - **`connections`**: contracts for the external collaborators (bucket
//!   store, message transport) plus in-memory and Redis-backed
//!   implementations. The Redis ones require the `connections` feature.
//! - **`core`**: the rollup engine, the bus connector with its reconnect
//!   supervisor, and the metrics sink.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod connections;
pub mod core;
pub mod error;
pub mod model;

// Re-export the types a service wires together.
pub use crate::core::connector::{BusConnector, ConnectorOptions, Disposition, MessageHandler};
pub use crate::core::metrics::{CounterSink, MetricsSink, MetricsSnapshot, NoopSink};
pub use crate::core::rollup::{RollupEngine, RollupOptions, RollupPeriod};
pub use crate::core::supervisor::ConnectorState;
pub use error::CounterError;
pub use model::{MetricEntry, SummarySet};

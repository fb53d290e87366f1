//! # Core Engine Module
//!
//! The counting and delivery machinery of `lib_counter`, independent of any
//! concrete broker or store.
//!
//! ## Core Components:
//!
//! - **`connector`**: The bus connector. It owns one broker channel at a time,
//!   runs one delivery loop per registered subscription and turns handler
//!   results into acknowledgments.
//!
//! - **`registry`**: The ordered list of subscriptions the connector must keep
//!   alive. It is replayed, in order, on every reconnect.
//!
//! - **`supervisor`**: The recovery loop. It watches the active channel's loss
//!   notification and reconnects on a fixed interval, moving the connector
//!   through its `ConnectorState`s.
//!
//! - **`rollup`**: Time bucketing and the periodic merge of completed periods
//!   into summary sets.
//!
//! - **`metrics`**: Process counters fed by the delivery loops.

/// Bus connector and delivery loops.
pub mod connector;
/// Process-wide processing counters.
pub mod metrics;
/// Ordered subscription list replayed on reconnect.
pub mod registry;
/// Time bucketing and periodic rollup.
pub mod rollup;
/// Reconnect loop and connector lifecycle states.
pub mod supervisor;

// --- Public API Re-exports ---
pub use connector::{BusConnector, ConnectorOptions, Disposition, MessageHandler};
pub use metrics::{CounterSink, MetricsSink, MetricsSnapshot, NoopSink};
pub use registry::{Registration, Registry};
pub use rollup::{RollupEngine, RollupOptions, RollupPeriod};
pub use supervisor::ConnectorState;

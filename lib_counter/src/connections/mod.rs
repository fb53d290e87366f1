//! # Connections Module
//!
//! This module handles the external collaborators of the counter: the ordered
//! key/value store holding buckets and summaries, and the message transport
//! events arrive on. Each collaborator is a trait with an in-memory
//! implementation, and a Redis implementation behind the `connections`
//! feature.

/// Contract for the ordered-set store and its in-memory implementation.
pub mod bucket_store;

/// Contract for the publish/subscribe transport with acknowledgment.
pub mod transport;

/// In-process fanout broker used for tests and local runs.
pub mod broker_memory;

/// Module for Redis sorted-set bucket storage.
#[cfg(feature = "connections")]
pub mod cache_redis;

/// Module for the Redis Streams message transport.
#[cfg(feature = "connections")]
pub mod stream_redis;

pub use bucket_store::{BucketStore, MemoryBucketStore};
pub use broker_memory::MemoryBroker;
pub use transport::{AckDecision, Acker, Channel, Delivery, DeliveryStream, Transport};

#[cfg(feature = "connections")]
pub use cache_redis::RedisBucketStore;
#[cfg(feature = "connections")]
pub use stream_redis::{RedisStreamOptions, RedisStreamTransport};

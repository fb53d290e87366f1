//! # Redis Bucket Store
//!
//! Sorted-set implementation of the bucket store. Buckets and summaries are
//! plain Redis sorted sets, so every operation is one atomic round trip.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};

use crate::connections::bucket_store::BucketStore;
use crate::error::CounterError;

fn store_error(e: RedisError) -> CounterError {
    CounterError::StoreUnavailable(e.to_string())
}

/// A handler for Redis bucket storage.
#[derive(Clone)]
pub struct RedisBucketStore {
    /// Reconnecting multiplexed connection shared by every clone.
    manager: ConnectionManager,
}

impl RedisBucketStore {
    /// Opens the store from a connection string.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    pub async fn new(url: &str) -> Result<Self, CounterError> {
        let client = Client::open(url).map_err(store_error)?;
        let manager = client.get_connection_manager().await.map_err(store_error)?;
        log::info!("Bucket store connected");
        Ok(Self { manager })
    }

    /// Checks the store by issuing a PING.
    pub async fn ping(&self) -> Result<(), CounterError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(store_error)?;
        Ok(())
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn increment_member(&self, set_key: &str, member: &str, delta: i64) -> Result<i64, CounterError> {
        let mut conn = self.manager.clone();
        let score: f64 = redis::cmd("ZINCRBY")
            .arg(set_key)
            .arg(delta)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(score.round() as i64)
    }

    async fn merge_sum(&self, dest_key: &str, source_keys: &[String]) -> Result<(), CounterError> {
        if source_keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        // Overwrites dest_key.
        let _: i64 = redis::cmd("ZUNIONSTORE")
            .arg(dest_key)
            .arg(source_keys.len())
            .arg(source_keys)
            .arg("AGGREGATE")
            .arg("SUM")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn range_with_scores(&self, key: &str) -> Result<Vec<(String, i64)>, CounterError> {
        let mut conn = self.manager.clone();
        let members: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(members
            .into_iter()
            .map(|(member, score)| (member, score.round() as i64))
            .collect())
    }
}

//! # Redis Streams Transport
//!
//! Maps the bus contract onto Redis Streams consumer groups:
//!
//! - a topic is a stream key; publishing is `XADD`;
//! - a subscription is a consumer group on that stream. Every group sees
//!   every entry, which gives fanout between subscriptions;
//! - acknowledgment is `XACK`. An entry that is not acknowledged stays in the
//!   group's pending list and is read again by this consumer, which is how
//!   requeue and redelivery after a disconnect work;
//! - nack without requeue acknowledges the entry and copies its payload to
//!   `<topic>:dead-letter`.
//! - prefetch is the `COUNT` of each `XREADGROUP`, so no more than `prefetch`
//!   entries of a group are claimed and unacknowledged at once. Entries of a
//!   batch are handed out one at a time, each after the previous one settled.
//!
//! Each subscription reads on its own connection since `XREADGROUP ... BLOCK`
//! parks the connection. Any read failure, a failed heartbeat `PING`, or an
//! I/O error on a publish trips the channel's loss notification.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadReply};
use redis::{Client, RedisError, RedisResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connections::transport::{AckDecision, Channel, Delivery, DeliveryStream, Transport};
use crate::error::CounterError;

/// Field holding the message body inside a stream entry.
const PAYLOAD_FIELD: &str = "payload";

/// Tuning for the Redis Streams transport.
#[derive(Debug, Clone)]
pub struct RedisStreamOptions {
    /// Consumer name inside each group. Keep it stable across restarts so
    /// entries pending from a previous run are replayed.
    pub consumer: String,
    /// How long one `XREADGROUP` waits for new entries.
    pub block: Duration,
    /// Pause before re-reading entries that were nacked with requeue.
    pub requeue_delay: Duration,
    /// Interval between liveness `PING`s.
    pub heartbeat: Duration,
    /// Approximate stream length cap applied on publish.
    pub max_len: Option<usize>,
}

impl Default for RedisStreamOptions {
    fn default() -> Self {
        Self {
            consumer: "worker".to_string(),
            block: Duration::from_millis(250),
            requeue_delay: Duration::from_secs(1),
            heartbeat: Duration::from_secs(5),
            max_len: None,
        }
    }
}

fn transport_error(e: RedisError) -> CounterError {
    CounterError::TransportUnavailable(e.to_string())
}

/// # Redis Stream Transport
pub struct RedisStreamTransport {
    client: Client,
    options: RedisStreamOptions,
}

impl RedisStreamTransport {
    /// Creates a transport from a connection string. Nothing is dialed until
    /// `connect`.
    pub fn new(url: &str, options: RedisStreamOptions) -> Result<Self, CounterError> {
        let client = Client::open(url).map_err(transport_error)?;
        Ok(Self { client, options })
    }

    /// Builds the connection string from its parts. Empty credentials are
    /// omitted.
    pub fn url(host: &str, port: u16, user: &str, password: &str) -> String {
        match (user.is_empty(), password.is_empty()) {
            (true, true) => format!("redis://{}:{}/", host, port),
            (true, false) => format!("redis://:{}@{}:{}/", password, host, port),
            _ => format!("redis://{}:{}@{}:{}/", user, password, host, port),
        }
    }
}

#[async_trait]
impl Transport for RedisStreamTransport {
    async fn connect(&self) -> Result<Arc<dyn Channel>, CounterError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(transport_error)?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(transport_error)?;

        let closed = CancellationToken::new();
        tokio::spawn(heartbeat(conn.clone(), self.options.heartbeat, closed.clone()));
        log::info!("Connected to Redis stream broker");

        Ok(Arc::new(RedisStreamChannel {
            client: self.client.clone(),
            conn,
            options: self.options.clone(),
            prefetch: AtomicUsize::new(1),
            closed,
        }))
    }
}

async fn heartbeat(mut conn: MultiplexedConnection, every: Duration, closed: CancellationToken) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        let pong: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        if let Err(e) = pong {
            log::error!("Redis stream broker heartbeat failed: {}", e);
            closed.cancel();
            return;
        }
    }
}

struct RedisStreamChannel {
    client: Client,
    conn: MultiplexedConnection,
    options: RedisStreamOptions,
    prefetch: AtomicUsize,
    closed: CancellationToken,
}

impl RedisStreamChannel {
    fn check_open(&self) -> Result<(), CounterError> {
        if self.closed.is_cancelled() {
            Err(CounterError::TransportUnavailable("channel closed".to_string()))
        } else {
            Ok(())
        }
    }

    /// Maps a command error, tripping the loss notification when the
    /// connection itself failed.
    fn fail(&self, e: RedisError) -> CounterError {
        if e.is_io_error() || e.is_connection_dropped() {
            self.closed.cancel();
        }
        transport_error(e)
    }
}

#[async_trait]
impl Channel for RedisStreamChannel {
    async fn declare_topic(&self, topic: &str) -> Result<(), CounterError> {
        // Streams come into existence with their first group (MKSTREAM).
        self.check_open()?;
        log::debug!("Using stream '{}' as topic", topic);
        Ok(())
    }

    async fn set_prefetch(&self, limit: usize) -> Result<(), CounterError> {
        self.check_open()?;
        self.prefetch.store(limit.max(1), Ordering::SeqCst);
        Ok(())
    }

    async fn declare_subscription(&self, topic: &str, name: &str) -> Result<(), CounterError> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        let created: RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(name)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => {
                log::info!("Created consumer group '{}' on stream '{}'", name, topic);
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn consume(&self, topic: &str, name: &str) -> Result<DeliveryStream, CounterError> {
        self.check_open()?;
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| self.fail(e))?;

        let prefetch = self.prefetch.load(Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(prefetch);
        let reader = GroupReader {
            conn,
            topic: topic.to_string(),
            group: name.to_string(),
            consumer: self.options.consumer.clone(),
            prefetch,
            block: self.options.block,
            requeue_delay: self.options.requeue_delay,
            closed: self.closed.clone(),
        };
        tokio::spawn(reader.run(tx));
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), CounterError> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(topic);
        if let Some(max_len) = self.options.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*").arg(PAYLOAD_FIELD).arg(payload);
        let added: RedisResult<String> = cmd.query_async(&mut conn).await;
        added.map(|_| ()).map_err(|e| self.fail(e))
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), CounterError> {
        self.closed.cancel();
        Ok(())
    }
}

/// Reads one consumer group and feeds its delivery stream.
struct GroupReader {
    conn: MultiplexedConnection,
    topic: String,
    group: String,
    consumer: String,
    prefetch: usize,
    block: Duration,
    requeue_delay: Duration,
    closed: CancellationToken,
}

impl GroupReader {
    async fn run(mut self, tx: mpsc::Sender<Delivery>) {
        // Start with our own pending entries: whatever was unsettled when the
        // previous connection dropped.
        let mut backlog = true;
        let closed = self.closed.clone();

        loop {
            let read = tokio::select! {
                _ = closed.cancelled() => break,
                read = self.read(backlog) => read,
            };
            let entries = match read {
                Ok(entries) => entries,
                Err(e) => {
                    log::error!("XREADGROUP on '{}' for group '{}' failed: {}", self.topic, self.group, e);
                    closed.cancel();
                    break;
                }
            };

            if backlog && entries.is_empty() {
                backlog = false;
                continue;
            }

            let mut requeued = false;
            for entry in entries {
                let Some(payload) = entry.get::<Vec<u8>>(PAYLOAD_FIELD) else {
                    // Trimmed or foreign entry: nothing to deliver.
                    log::warn!("Entry {} on '{}' has no payload, acknowledging", entry.id, self.topic);
                    if let Err(e) = self.ack(&entry).await {
                        log::error!("XACK failed: {}", e);
                        closed.cancel();
                        return;
                    }
                    continue;
                };

                let (delivery, decision) = Delivery::new(payload.clone());
                if tx.send(delivery).await.is_err() {
                    log::debug!("Delivery stream for '{}' dropped", self.group);
                    return;
                }
                let outcome = tokio::select! {
                    _ = closed.cancelled() => return,
                    decision = decision => decision.ok(),
                };

                let settled = match outcome {
                    Some(AckDecision::Ack) => self.ack(&entry).await,
                    Some(AckDecision::Nack { requeue: false }) => self.dead_letter(&entry, &payload).await,
                    Some(AckDecision::Nack { requeue: true }) | None => {
                        requeued = true;
                        Ok(())
                    }
                };
                if let Err(e) = settled {
                    log::error!("Settling entry {} on '{}' failed: {}", entry.id, self.topic, e);
                    closed.cancel();
                    return;
                }
                if requeued {
                    // The rest of the batch stays pending and is re-read in order.
                    break;
                }
            }

            if requeued {
                backlog = true;
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = tokio::time::sleep(self.requeue_delay) => {}
                }
            }
        }
        log::debug!("Stopped reading group '{}' on '{}'", self.group, self.topic);
    }

    async fn read(&mut self, backlog: bool) -> RedisResult<Vec<StreamId>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.prefetch);
        if !backlog {
            cmd.arg("BLOCK").arg(self.block.as_millis() as u64);
        }
        cmd.arg("STREAMS")
            .arg(&self.topic)
            .arg(if backlog { "0" } else { ">" });

        let reply: Option<StreamReadReply> = cmd.query_async(&mut self.conn).await?;
        Ok(reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default())
    }

    async fn ack(&mut self, entry: &StreamId) -> RedisResult<()> {
        let _: i64 = redis::cmd("XACK")
            .arg(&self.topic)
            .arg(&self.group)
            .arg(&entry.id)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(&mut self, entry: &StreamId, payload: &[u8]) -> RedisResult<()> {
        let _: String = redis::cmd("XADD")
            .arg(format!("{}:dead-letter", self.topic))
            .arg("*")
            .arg("group")
            .arg(&self.group)
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut self.conn)
            .await?;
        self.ack(entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_omits_empty_credentials() {
        assert_eq!(RedisStreamTransport::url("localhost", 6379, "", ""), "redis://localhost:6379/");
        assert_eq!(RedisStreamTransport::url("localhost", 6379, "", "pw"), "redis://:pw@localhost:6379/");
        assert_eq!(
            RedisStreamTransport::url("mq", 6380, "guest", "guest"),
            "redis://guest:guest@mq:6380/"
        );
    }
}

//! # In-Process Fanout Broker
//!
//! A broker living in process memory with the delivery semantics the bus
//! connector relies on:
//!
//! - every subscription bound to a topic receives its own copy of each
//!   published message;
//! - a delivery nacked with requeue, dropped without a decision, or still
//!   unsettled when its channel goes away is put back at the head of its
//!   queue;
//! - a delivery nacked without requeue is moved to the dead-letter list;
//! - at most `prefetch` deliveries per stream are unsettled at any time.
//!
//! Fault injection (`sever_connections`, `fail_next_connects`,
//! `set_reachable`) drives the reconnect tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::connections::transport::{AckDecision, Channel, Delivery, DeliveryStream, Transport};
use crate::error::CounterError;

/// One subscription queue.
#[derive(Default)]
struct Queue {
    ready: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    acked: AtomicU64,
}

impl Queue {
    fn push_back(&self, payload: Vec<u8>) {
        self.ready.lock().expect("Queue lock poisoned").push_back(payload);
        self.notify.notify_waiters();
    }

    fn push_front(&self, payload: Vec<u8>) {
        self.ready.lock().expect("Queue lock poisoned").push_front(payload);
        self.notify.notify_waiters();
    }

    /// Waits for the next ready message.
    async fn next(&self) -> Vec<u8> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a publish in between is not missed.
            notified.as_mut().enable();
            if let Some(payload) = self.ready.lock().expect("Queue lock poisoned").pop_front() {
                return payload;
            }
            notified.await;
        }
    }

    fn take_in_flight(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn depth(&self) -> usize {
        self.ready.lock().expect("Queue lock poisoned").len() + self.in_flight.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct BrokerState {
    /// topic -> bound subscription names, in bind order.
    topics: HashMap<String, Vec<String>>,
    queues: HashMap<String, Arc<Queue>>,
    /// Loss notifications of live channels.
    channels: Vec<CancellationToken>,
    /// Subscription name of every `consume` call, in call order.
    consume_log: Vec<String>,
    dead_letters: Vec<(String, Vec<u8>)>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    reachable: AtomicBool,
    failing_connects: AtomicUsize,
    connects: AtomicUsize,
}

/// # Memory Broker
///
/// Cheap to clone; every clone is the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates a reachable broker with no topics.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                reachable: AtomicBool::new(true),
                failing_connects: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    /// While unreachable every `connect` fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Makes the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Drops every live channel, firing their loss notifications. Unsettled
    /// deliveries go back to their queues.
    pub fn sever_connections(&self) {
        let channels = std::mem::take(&mut self.state().channels);
        log::debug!("Severing {} broker channel(s)", channels.len());
        for closed in channels {
            closed.cancel();
        }
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Subscription names in the order `consume` was called for them.
    pub fn consume_log(&self) -> Vec<String> {
        self.state().consume_log.clone()
    }

    /// Messages queued or in flight for `subscription`.
    pub fn pending(&self, subscription: &str) -> usize {
        self.state().queues.get(subscription).map(|q| q.depth()).unwrap_or(0)
    }

    /// Deliveries of `subscription` handed out and not yet settled.
    pub fn in_flight(&self, subscription: &str) -> usize {
        self.queue_stat(subscription, |q| q.in_flight.load(Ordering::SeqCst))
    }

    /// Highest `in_flight` value `subscription` has reached.
    pub fn peak_in_flight(&self, subscription: &str) -> usize {
        self.queue_stat(subscription, |q| q.peak_in_flight.load(Ordering::SeqCst))
    }

    fn queue_stat(&self, subscription: &str, stat: impl Fn(&Queue) -> usize) -> usize {
        self.state().queues.get(subscription).map(|q| stat(q)).unwrap_or(0)
    }

    /// Messages acknowledged on `subscription`.
    pub fn acked(&self, subscription: &str) -> u64 {
        self.state()
            .queues
            .get(subscription)
            .map(|q| q.acked.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Messages nacked without requeue, with their subscription.
    pub fn dead_letters(&self) -> Vec<(String, Vec<u8>)> {
        self.state().dead_letters.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.inner.state.lock().expect("Broker lock poisoned")
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Channel>, CounterError> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(CounterError::TransportUnavailable("broker unreachable".to_string()));
        }
        let failing = self.inner.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(CounterError::TransportUnavailable("connection refused".to_string()));
        }

        let closed = CancellationToken::new();
        self.state().channels.push(closed.clone());
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            closed,
            prefetch: AtomicUsize::new(1),
        }))
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    closed: CancellationToken,
    prefetch: AtomicUsize,
}

impl MemoryChannel {
    fn check_open(&self) -> Result<(), CounterError> {
        if self.closed.is_cancelled() {
            Err(CounterError::TransportUnavailable("channel closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_topic(&self, topic: &str) -> Result<(), CounterError> {
        self.check_open()?;
        self.broker.state().topics.entry(topic.to_string()).or_default();
        Ok(())
    }

    async fn set_prefetch(&self, limit: usize) -> Result<(), CounterError> {
        self.check_open()?;
        self.prefetch.store(limit.max(1), Ordering::SeqCst);
        Ok(())
    }

    async fn declare_subscription(&self, topic: &str, name: &str) -> Result<(), CounterError> {
        self.check_open()?;
        let mut state = self.broker.state();
        state.queues.entry(name.to_string()).or_default();
        let bound = state.topics.entry(topic.to_string()).or_default();
        if !bound.iter().any(|n| n == name) {
            bound.push(name.to_string());
        }
        Ok(())
    }

    async fn consume(&self, _topic: &str, name: &str) -> Result<DeliveryStream, CounterError> {
        self.check_open()?;
        let queue = {
            let mut state = self.broker.state();
            let queue = state
                .queues
                .get(name)
                .cloned()
                .ok_or_else(|| CounterError::TransportUnavailable(format!("subscription '{}' not declared", name)))?;
            state.consume_log.push(name.to_string());
            queue
        };

        let prefetch = self.prefetch.load(Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(prefetch);
        let permits = Arc::new(Semaphore::new(prefetch));
        let closed = self.closed.clone();
        let broker = self.broker.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    biased;
                    _ = closed.cancelled() => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let payload = tokio::select! {
                    biased;
                    _ = closed.cancelled() => break,
                    payload = queue.next() => payload,
                };
                queue.take_in_flight();

                let (delivery, decision) = Delivery::new(payload.clone());
                let sent = tokio::select! {
                    biased;
                    _ = closed.cancelled() => false,
                    sent = tx.send(delivery) => sent.is_ok(),
                };
                if !sent {
                    queue.in_flight.fetch_sub(1, Ordering::SeqCst);
                    queue.push_front(payload);
                    break;
                }
                tokio::spawn(settle(
                    queue.clone(),
                    broker.clone(),
                    name.clone(),
                    payload,
                    decision,
                    closed.clone(),
                    permit,
                ));
            }
            log::debug!("Memory broker stopped streaming '{}'", name);
        });

        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), CounterError> {
        self.check_open()?;
        let state = self.broker.state();
        if let Some(bound) = state.topics.get(topic) {
            for name in bound {
                if let Some(queue) = state.queues.get(name) {
                    queue.push_back(payload.to_vec());
                }
            }
        }
        Ok(())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), CounterError> {
        self.closed.cancel();
        let mut state = self.broker.state();
        state.channels.retain(|token| !token.is_cancelled());
        Ok(())
    }
}

/// Waits for the consumer's decision on one delivery and applies it. The
/// permit is released once the delivery is settled.
async fn settle(
    queue: Arc<Queue>,
    broker: MemoryBroker,
    name: String,
    payload: Vec<u8>,
    decision: oneshot::Receiver<AckDecision>,
    closed: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let outcome = tokio::select! {
        _ = closed.cancelled() => None,
        decision = decision => decision.ok(),
    };
    queue.in_flight.fetch_sub(1, Ordering::SeqCst);

    match outcome {
        Some(AckDecision::Ack) => {
            queue.acked.fetch_add(1, Ordering::SeqCst);
        }
        Some(AckDecision::Nack { requeue: false }) => {
            broker.state().dead_letters.push((name, payload));
        }
        Some(AckDecision::Nack { requeue: true }) | None => {
            queue.push_front(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn open(broker: &MemoryBroker, subs: &[&str]) -> (Arc<dyn Channel>, Vec<DeliveryStream>) {
        let channel = broker.connect().await.unwrap();
        channel.declare_topic("metrics").await.unwrap();
        let mut streams = Vec::new();
        for name in subs {
            channel.declare_subscription("metrics", name).await.unwrap();
            streams.push(channel.consume("metrics", name).await.unwrap());
        }
        (channel, streams)
    }

    #[tokio::test]
    async fn test_fanout_copies_to_every_subscription() {
        let broker = MemoryBroker::new();
        let (channel, mut streams) = open(&broker, &["a", "b"]).await;

        channel.publish("metrics", b"hello").await.unwrap();

        for stream in streams.iter_mut() {
            let delivery = timeout(Duration::from_secs(1), stream.recv()).await.unwrap().unwrap();
            assert_eq!(delivery.payload(), b"hello");
            delivery.ack().unwrap();
        }
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers_and_dead_letter_drops() {
        let broker = MemoryBroker::new();
        let (channel, mut streams) = open(&broker, &["a"]).await;
        let stream = &mut streams[0];

        channel.publish("metrics", b"one").await.unwrap();

        let first = timeout(Duration::from_secs(1), stream.recv()).await.unwrap().unwrap();
        first.nack(true).unwrap();
        let again = timeout(Duration::from_secs(1), stream.recv()).await.unwrap().unwrap();
        assert_eq!(again.payload(), b"one");
        again.nack(false).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.dead_letters(), vec![("a".to_string(), b"one".to_vec())]);
        assert_eq!(broker.pending("a"), 0);
    }

    #[tokio::test]
    async fn test_sever_requeues_unsettled_delivery_and_ends_stream() {
        let broker = MemoryBroker::new();
        let (channel, mut streams) = open(&broker, &["a"]).await;
        let closed = channel.closed();

        channel.publish("metrics", b"inflight").await.unwrap();
        let delivery = timeout(Duration::from_secs(1), streams[0].recv()).await.unwrap().unwrap();

        broker.sever_connections();
        assert!(closed.is_cancelled());
        assert!(timeout(Duration::from_secs(1), streams[0].recv()).await.unwrap().is_none());
        assert!(delivery.ack().is_err());
        assert_eq!(broker.pending("a"), 1);
        assert!(channel.publish("metrics", b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unsettled_deliveries() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        channel.declare_topic("metrics").await.unwrap();
        channel.set_prefetch(2).await.unwrap();
        channel.declare_subscription("metrics", "a").await.unwrap();
        let mut stream = channel.consume("metrics", "a").await.unwrap();

        for payload in [b"1", b"2", b"3"] {
            channel.publish("metrics", payload).await.unwrap();
        }

        let first = timeout(Duration::from_secs(1), stream.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(1), stream.recv()).await.unwrap().unwrap();
        assert!(timeout(Duration::from_millis(50), stream.recv()).await.is_err());
        assert_eq!(broker.in_flight("a"), 2);

        first.ack().unwrap();
        let third = timeout(Duration::from_secs(1), stream.recv()).await.unwrap().unwrap();
        assert_eq!(third.payload(), b"3");
        second.ack().unwrap();
        third.ack().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.acked("a"), 3);
        assert_eq!(broker.peak_in_flight("a"), 2);
        assert_eq!(broker.pending("a"), 0);
    }

    #[tokio::test]
    async fn test_connect_failures_are_injected() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());

        broker.set_reachable(false);
        assert!(broker.connect().await.is_err());
        assert_eq!(broker.connects(), 1);
    }
}

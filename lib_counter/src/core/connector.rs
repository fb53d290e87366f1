//! # Bus Connector
//!
//! Keeps a set of named subscriptions consuming from one fanout topic for as
//! long as the process runs, across any number of broker outages.
//!
//! ## Core Functionality:
//!
//! - **Registration**: `register` pairs a subscription name with a
//!   `MessageHandler`. The pair is remembered whether or not the connector is
//!   connected, and realized immediately when it is.
//!
//! - **Delivery Loops**: each realized subscription gets its own task that
//!   feeds deliveries to the handler one at a time and settles them from the
//!   returned `Disposition`: acknowledge on success, requeue on failure. The
//!   transport may hand out up to `prefetch` deliveries ahead of their
//!   settlement; the loop stops taking them once its channel is lost.
//!
//! - **Recovery**: a single supervisor task (see `supervisor`) watches the
//!   active channel. After a loss it reconnects on `retry_interval` and
//!   replays every registration in order on the fresh channel. The channel is
//!   replaced, never patched: loops bound to the dead channel end when their
//!   delivery streams do.
//!
//! - **Shutdown**: `close` stops the supervisor, closes the channel and waits
//!   for every delivery loop to drain.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connections::transport::{Channel, DeliveryStream, Transport};
use crate::core::metrics::MetricsSink;
use crate::core::registry::{Registration, Registry};
use crate::core::supervisor::{self, ConnectorState};
use crate::error::CounterError;

/// Handler verdict for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove the message from the subscription.
    Acknowledge,
    /// Failed; put the message back for redelivery.
    Requeue,
}

/// Processes one message body.
///
/// Implemented for every `Fn(Vec<u8>) -> impl Future<Output = Disposition>`,
/// so plain async closures can be registered.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, payload: Vec<u8>) -> BoxFuture<'static, Disposition>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Disposition> + Send + 'static,
{
    fn handle(&self, payload: Vec<u8>) -> BoxFuture<'static, Disposition> {
        (self)(payload).boxed()
    }
}

/// Floor applied to `ConnectorOptions::retry_interval`.
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Connector settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorOptions {
    /// Fanout topic every subscription binds to and `publish` sends to.
    pub topic: String,
    /// Unacknowledged deliveries allowed per subscription.
    pub prefetch: usize,
    /// Delay between reconnect attempts.
    pub retry_interval: Duration,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            topic: "metrics".to_string(),
            prefetch: 1,
            retry_interval: Duration::from_secs(5),
        }
    }
}

pub(crate) struct ConnectorInner {
    transport: Arc<dyn Transport>,
    pub(crate) options: ConnectorOptions,
    metrics: Arc<dyn MetricsSink>,
    registry: Registry,
    /// Replaced wholesale by `open`, cleared by the supervisor on loss.
    channel: RwLock<Option<Arc<dyn Channel>>>,
    state: watch::Sender<ConnectorState>,
    pub(crate) shutdown: CancellationToken,
    loops: TaskTracker,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectorInner {
    pub(crate) fn set_state(&self, state: ConnectorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("Bus connector: {:?} -> {:?}", previous, state);
        }
    }

    pub(crate) fn clear_channel(&self) {
        if let Ok(mut channel) = self.channel.write() {
            channel.take();
        }
    }

    /// The active channel, unless its loss has already been signalled.
    fn live_channel(&self) -> Option<Arc<dyn Channel>> {
        let channel = self.channel.read().ok()?.clone()?;
        if channel.closed().is_cancelled() {
            None
        } else {
            Some(channel)
        }
    }

    /// Opens a fresh channel, declares the topic and replays every
    /// registration in order. On success the channel becomes the active one.
    ///
    /// Holds the registry for the whole attempt, so a concurrent `register`
    /// lands either before the replay (and is part of it) or after the swap
    /// (and binds on the new channel).
    pub(crate) async fn open(&self) -> Result<Arc<dyn Channel>, CounterError> {
        let registrations = self.registry.lock().await;
        let channel = self.transport.connect().await?;

        if self.shutdown.is_cancelled() {
            let _ = channel.close().await;
            return Err(CounterError::Closed);
        }

        let replayed: Result<(), CounterError> = async {
            channel.declare_topic(&self.options.topic).await?;
            channel.set_prefetch(self.options.prefetch).await?;
            for registration in registrations.iter() {
                self.bind(&channel, registration).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = replayed {
            let _ = channel.close().await;
            return Err(e);
        }

        if let Ok(mut active) = self.channel.write() {
            *active = Some(channel.clone());
        }
        log::info!(
            "Connected to the bus on topic '{}' with {} subscription(s)",
            self.options.topic,
            registrations.len()
        );
        Ok(channel)
    }

    /// Declares, binds and starts consuming one subscription on `channel`.
    async fn bind(&self, channel: &Arc<dyn Channel>, registration: &Registration) -> Result<(), CounterError> {
        channel
            .declare_subscription(&self.options.topic, &registration.name)
            .await?;
        let deliveries = channel.consume(&self.options.topic, &registration.name).await?;

        self.loops.spawn(delivery_loop(
            registration.name.clone(),
            deliveries,
            channel.closed(),
            registration.handler.clone(),
            self.metrics.clone(),
        ));
        log::debug!("Consuming subscription '{}'", registration.name);
        Ok(())
    }
}

/// Feeds one subscription's deliveries to its handler until the stream ends.
async fn delivery_loop(
    name: String,
    mut deliveries: DeliveryStream,
    lost: CancellationToken,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<dyn MetricsSink>,
) {
    loop {
        // Deliveries still buffered on a lost channel are requeued by the
        // broker and must not reach the handler.
        let delivery = tokio::select! {
            biased;
            _ = lost.cancelled() => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        metrics.record_processed();
        let (payload, acker) = delivery.into_parts();

        let settled = match handler.handle(payload).await {
            Disposition::Acknowledge => acker.ack(),
            Disposition::Requeue => {
                log::warn!("Error processing an element on '{}': requeueing", name);
                metrics.record_error();
                acker.nack(true)
            }
        };
        if let Err(e) = settled {
            log::warn!("Could not settle delivery on '{}': {}", name, e);
        }
    }
    log::info!("Deliveries channel closed for '{}'", name);
}

/// # Bus Connector
///
/// Cheap to clone; clones share the same connection, registrations and
/// supervisor.
#[derive(Clone)]
pub struct BusConnector {
    inner: Arc<ConnectorInner>,
}

impl BusConnector {
    /// Creates a disconnected connector. Nothing touches the broker until
    /// `connect`.
    ///
    /// `retry_interval` is raised to `MIN_RETRY_INTERVAL` and `prefetch` to 1.
    pub fn new(transport: Arc<dyn Transport>, mut options: ConnectorOptions, metrics: Arc<dyn MetricsSink>) -> Self {
        options.retry_interval = options.retry_interval.max(MIN_RETRY_INTERVAL);
        options.prefetch = options.prefetch.max(1);
        let (state, _) = watch::channel(ConnectorState::Disconnected);
        Self {
            inner: Arc::new(ConnectorInner {
                transport,
                options,
                metrics,
                registry: Registry::new(),
                channel: RwLock::new(None),
                state,
                shutdown: CancellationToken::new(),
                loops: TaskTracker::new(),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// The connector's settings.
    pub fn options(&self) -> &ConnectorOptions {
        &self.inner.options
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectorState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectorState> {
        self.inner.state.subscribe()
    }

    /// Registered subscription names, in registration order.
    pub async fn registrations(&self) -> Vec<String> {
        self.inner.registry.names().await
    }

    /// Opens the first channel, realizes every registration made so far and
    /// starts the reconnect supervisor.
    ///
    /// Once this has succeeded, recovery belongs to the supervisor and later
    /// calls return `Ok(())` without touching the broker.
    ///
    /// # Errors
    /// `TransportUnavailable` when the broker cannot be reached; the
    /// connector stays `Disconnected` and `connect` may be retried.
    /// `Closed` after `close`.
    pub async fn connect(&self) -> Result<(), CounterError> {
        let mut running = self.inner.supervisor.lock().await;
        if self.inner.shutdown.is_cancelled() {
            return Err(CounterError::Closed);
        }
        if running.is_some() {
            return Ok(());
        }

        self.inner.set_state(ConnectorState::Connecting);
        match self.inner.open().await {
            Ok(channel) => {
                self.inner.set_state(ConnectorState::Connected);
                *running = Some(tokio::spawn(supervisor::supervise(
                    self.inner.clone(),
                    channel.closed(),
                )));
                Ok(())
            }
            Err(CounterError::Closed) => Err(CounterError::Closed),
            Err(e) => {
                log::error!("Cannot connect to the bus: {}", e);
                self.inner.set_state(ConnectorState::Disconnected);
                Err(e)
            }
        }
    }

    /// Registers `handler` for subscription `name`.
    ///
    /// When connected the subscription is declared, bound and consumed
    /// before this returns. When not, it is only recorded and realized by
    /// the next successful connect or recovery. Either way it is replayed
    /// after every reconnect.
    ///
    /// # Errors
    /// `DuplicateRegistration` when `name` is already registered.
    /// `TransportUnavailable` when binding on a live channel fails; nothing
    /// is recorded. `Closed` after `close`.
    pub async fn register<H: MessageHandler>(&self, name: &str, handler: H) -> Result<(), CounterError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CounterError::Closed);
        }

        let mut registry = self.inner.registry.lock().await;
        if registry.contains(name) {
            return Err(CounterError::DuplicateRegistration(name.to_string()));
        }

        let registration = Registration::new(name, Arc::new(handler));
        if let Some(channel) = self.inner.live_channel() {
            if let Err(e) = self.inner.bind(&channel, &registration).await {
                if !channel.closed().is_cancelled() {
                    return Err(e);
                }
                // The channel died mid-bind; recovery will replay it.
                log::warn!("Connection lost while registering '{}', deferring to recovery", name);
            }
        }

        registry.push(registration);
        log::info!("Registered subscription '{}'", name);
        Ok(())
    }

    /// Publishes `payload` to the topic through the active channel.
    ///
    /// # Errors
    /// `TransportUnavailable` while not connected or when the send fails.
    pub async fn publish(&self, payload: &[u8]) -> Result<(), CounterError> {
        let channel = self
            .inner
            .live_channel()
            .ok_or_else(|| CounterError::TransportUnavailable("not connected".to_string()))?;
        channel.publish(&self.inner.options.topic, payload).await
    }

    /// Stops the supervisor, closes the channel and waits for every delivery
    /// loop to finish. Idempotent.
    pub async fn close(&self) -> Result<(), CounterError> {
        self.inner.shutdown.cancel();

        let supervisor = self.inner.supervisor.lock().await.take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                log::error!("Bus supervisor ended abnormally: {}", e);
            }
        }

        let channel = self.inner.channel.write().ok().and_then(|mut c| c.take());
        let closed = match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        };

        self.inner.loops.close();
        self.inner.loops.wait().await;
        self.inner.set_state(ConnectorState::Closed);
        log::info!("Bus connector shutdown OK");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::broker_memory::MemoryBroker;
    use crate::core::metrics::NoopSink;

    fn connector(broker: &MemoryBroker) -> BusConnector {
        BusConnector::new(
            Arc::new(broker.clone()),
            ConnectorOptions {
                retry_interval: Duration::from_millis(20),
                ..ConnectorOptions::default()
            },
            Arc::new(NoopSink),
        )
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let broker = MemoryBroker::new();
        let bus = connector(&broker);

        bus.register("a", |_p: Vec<u8>| async { Disposition::Acknowledge }).await.unwrap();
        let err = bus
            .register("a", |_p: Vec<u8>| async { Disposition::Acknowledge })
            .await
            .unwrap_err();
        assert_eq!(err, CounterError::DuplicateRegistration("a".to_string()));
        assert_eq!(bus.registrations().await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected_and_retryable() {
        let broker = MemoryBroker::new();
        let bus = connector(&broker);
        broker.fail_next_connects(1);

        assert!(matches!(bus.connect().await, Err(CounterError::TransportUnavailable(_))));
        assert_eq!(bus.state(), ConnectorState::Disconnected);

        bus.connect().await.unwrap();
        assert_eq!(bus.state(), ConnectorState::Connected);
        // Second connect is a no-op.
        bus.connect().await.unwrap();
        assert_eq!(broker.connects(), 1);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_final() {
        let broker = MemoryBroker::new();
        let bus = connector(&broker);
        bus.connect().await.unwrap();
        bus.close().await.unwrap();

        assert_eq!(bus.state(), ConnectorState::Closed);
        assert_eq!(bus.connect().await, Err(CounterError::Closed));
        assert_eq!(
            bus.register("late", |_p: Vec<u8>| async { Disposition::Acknowledge }).await,
            Err(CounterError::Closed)
        );
        assert!(bus.publish(b"x").await.is_err());
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_retry_interval_still_recovers() {
        let broker = MemoryBroker::new();
        let bus = BusConnector::new(
            Arc::new(broker.clone()),
            ConnectorOptions {
                retry_interval: Duration::ZERO,
                prefetch: 0,
                ..ConnectorOptions::default()
            },
            Arc::new(NoopSink),
        );
        assert_eq!(bus.options().retry_interval, MIN_RETRY_INTERVAL);
        assert_eq!(bus.options().prefetch, 1);

        bus.connect().await.unwrap();
        for round in 2..=3 {
            broker.sever_connections();
            tokio::time::timeout(Duration::from_secs(1), async {
                while broker.connects() < round || bus.state() != ConnectorState::Connected {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
        }
        bus.close().await.unwrap();
    }
}

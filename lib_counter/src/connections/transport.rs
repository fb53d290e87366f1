//! # Message Transport Contract
//!
//! The bus connector sees the broker only through these traits: a
//! `Transport` that opens channels, and a `Channel` that declares topics and
//! subscriptions, publishes, and streams deliveries. Each `Delivery` carries
//! its payload and a one-shot acknowledgment handle; the transport decides
//! what ack and nack mean on the wire.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::CounterError;

/// Stream of deliveries for one subscription. It ends when the channel that
/// produced it is closed or lost.
pub type DeliveryStream = mpsc::Receiver<Delivery>;

/// What the consumer decided about one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Processed; remove from the subscription.
    Ack,
    /// Not processed. `requeue` asks the transport to redeliver it,
    /// otherwise it is dead-lettered.
    Nack { requeue: bool },
}

/// Opens channels to the broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establishes a new connection and returns its channel.
    async fn connect(&self) -> Result<Arc<dyn Channel>, CounterError>;
}

/// One live connection to the broker.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declares the fanout topic messages are published to.
    async fn declare_topic(&self, topic: &str) -> Result<(), CounterError>;

    /// Bounds the number of unacknowledged deliveries per subscription.
    async fn set_prefetch(&self, limit: usize) -> Result<(), CounterError>;

    /// Declares subscription `name` and binds it to `topic`. Idempotent.
    async fn declare_subscription(&self, topic: &str, name: &str) -> Result<(), CounterError>;

    /// Starts streaming deliveries of subscription `name`.
    async fn consume(&self, topic: &str, name: &str) -> Result<DeliveryStream, CounterError>;

    /// Sends `payload` to every subscription bound to `topic`.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), CounterError>;

    /// Connection-loss notification. Cancelled once the connection is lost
    /// or closed; never reset.
    fn closed(&self) -> CancellationToken;

    /// Tears the connection down. Every stream from `consume` ends.
    async fn close(&self) -> Result<(), CounterError>;
}

/// Acknowledgment handle for one delivery.
#[derive(Debug)]
pub struct Acker {
    reply: oneshot::Sender<AckDecision>,
}

impl Acker {
    /// Acknowledges the delivery.
    pub fn ack(self) -> Result<(), CounterError> {
        self.settle(AckDecision::Ack)
    }

    /// Negatively acknowledges the delivery.
    pub fn nack(self, requeue: bool) -> Result<(), CounterError> {
        self.settle(AckDecision::Nack { requeue })
    }

    fn settle(self, decision: AckDecision) -> Result<(), CounterError> {
        self.reply
            .send(decision)
            .map_err(|_| CounterError::TransportUnavailable("channel closed before acknowledgment".to_string()))
    }
}

/// A message received from a subscription.
#[derive(Debug)]
pub struct Delivery {
    payload: Vec<u8>,
    acker: Acker,
}

impl Delivery {
    /// Creates a delivery and the receiver its transport waits on for the
    /// consumer's decision. A dropped `Delivery` closes the receiver.
    pub fn new(payload: Vec<u8>) -> (Self, oneshot::Receiver<AckDecision>) {
        let (reply, decision) = oneshot::channel();
        (
            Self {
                payload,
                acker: Acker { reply },
            },
            decision,
        )
    }

    /// The raw message body.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Splits the delivery into its body and acknowledgment handle.
    pub fn into_parts(self) -> (Vec<u8>, Acker) {
        (self.payload, self.acker)
    }

    /// Acknowledges the delivery.
    pub fn ack(self) -> Result<(), CounterError> {
        self.acker.ack()
    }

    /// Negatively acknowledges the delivery.
    pub fn nack(self, requeue: bool) -> Result<(), CounterError> {
        self.acker.nack(requeue)
    }
}

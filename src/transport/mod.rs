//! Broker transport for order events
//!
//! The pipeline talks to the broker through two traits: `BrokerConnector`
//! opens sessions and `BrokerSession` is one connection plus one channel.
//! `amqp` implements them on lapin; `testing::mocks` implements them in memory.
//! Everything above the traits (connection manager, publisher, consumer loop)
//! is broker-agnostic.

use crate::protocol::ProcessingOutcome;
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub mod amqp;
pub mod connection;
pub mod profile;
pub mod publisher;
pub mod retry;

pub use amqp::AmqpConnector;
pub use connection::{ConnectionManager, OpenError, QueueDescriptor};
pub use profile::{AddressError, BrokerAddress, BrokerEnvironment, ConnectionProfile};
pub use publisher::OrderPublisher;
pub use retry::{Backoff, RetryDecision, RetryError, RetryPolicy, retry_with_backoff};

/// Broker I/O errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("Queue declaration failed for '{queue}': {reason}")]
    DeclareFailed { queue: String, reason: String },
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Publisher confirm not received within {0:?}")]
    ConfirmTimeout(Duration),
    #[error("Settlement of delivery {delivery_tag} failed: {reason}")]
    AckFailed { delivery_tag: u64, reason: String },
    #[error("Delivery stream closed by broker")]
    StreamClosed,
    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Connection-level failures that a fresh session may cure
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed(_)
                | TransportError::Channel(_)
                | TransportError::StreamClosed
                | TransportError::Timeout(_)
        )
    }
}

/// Broker verdict on a confirmed publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Acked and routed to at least one queue
    Ack,
    /// Mandatory message returned as unroutable
    Returned,
    /// Negatively acknowledged
    Nack,
}

/// A message about to be sent on the default exchange
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub payload: Vec<u8>,
    pub content_type: String,
    /// Delivery mode 2
    pub persistent: bool,
    pub mandatory: bool,
}

impl OutgoingMessage {
    /// Persistent, mandatory JSON message
    pub fn persistent_json(payload: Vec<u8>) -> Self {
        Self {
            payload,
            content_type: crate::protocol::ORDER_EVENT_CONTENT_TYPE.to_string(),
            persistent: true,
            mandatory: true,
        }
    }
}

/// Opens broker sessions
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open one connection and one channel, honouring the profile's
    /// per-open attempt count and socket timeout
    async fn connect(
        &self,
        address: &BrokerAddress,
        profile: &ConnectionProfile,
    ) -> Result<Box<dyn BrokerSession>, TransportError>;
}

/// One connection plus one channel, owned by whoever opened it
#[async_trait::async_trait]
pub trait BrokerSession: Send + Sync {
    /// Idempotent declaration; identical parameters on every call
    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<(), TransportError>;

    /// Limit unacknowledged deliveries on this channel
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Switch the channel into publisher-confirm mode
    async fn enable_confirms(&self) -> Result<(), TransportError>;

    /// Publish on the default exchange with routing key = queue name and wait
    /// for the broker's confirmation
    async fn publish(
        &self,
        queue: &QueueDescriptor,
        message: &OutgoingMessage,
    ) -> Result<Confirmation, TransportError>;

    /// Register a manual-ack consumer
    async fn consume(
        &self,
        queue: &QueueDescriptor,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError>;

    /// Close channel and connection. Errors are logged, never returned.
    async fn close(&self);
}

/// Stream of deliveries for one registered consumer
pub type DeliveryStream =
    Pin<Box<dyn Stream<Item = Result<IncomingDelivery, TransportError>> + Send>>;

/// Settles a delivery with the broker
#[async_trait::async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;
}

/// One delivery awaiting settlement
///
/// `settle` consumes the delivery, so a delivery tag can be acked or nacked
/// at most once.
pub struct IncomingDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    acker: Box<dyn DeliveryAcker>,
}

impl IncomingDelivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        payload: Vec<u8>,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            payload,
            acker,
        }
    }

    /// Apply the processing outcome: ack, nack without requeue, or nack with requeue
    pub async fn settle(self, outcome: ProcessingOutcome) -> Result<(), TransportError> {
        match outcome {
            ProcessingOutcome::Ack => self.acker.ack(self.delivery_tag).await,
            ProcessingOutcome::NackDiscard => self.acker.nack(self.delivery_tag, false).await,
            ProcessingOutcome::NackRequeue => self.acker.nack(self.delivery_tag, true).await,
        }
    }
}

impl fmt::Debug for IncomingDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

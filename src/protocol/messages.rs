//! Order event payloads and delivery/processing outcomes
//!
//! `OrderEvent` is the producer-side payload: it can only be built through a
//! validating constructor and is immutable afterwards. `ReceivedOrder` is the
//! consumer-side view of the same envelope, lenient about missing fields.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Content type attached to every published order event
pub const ORDER_EVENT_CONTENT_TYPE: &str = "application/json";

/// Placeholder used for text fields absent from a received envelope
pub const UNKNOWN_FIELD: &str = "unknown";

/// Order event validation errors
#[derive(Debug, Error, PartialEq)]
pub enum EventError {
    #[error("order_id must not be empty")]
    MissingOrderId,
    #[error("customer_id must not be empty")]
    MissingCustomerId,
    #[error("total_amount must be a positive number, got {0}")]
    NonPositiveTotal(f64),
    #[error("an order needs at least one product")]
    NoProducts,
    #[error("timestamp '{0}' is not ISO-8601")]
    InvalidTimestamp(String),
}

/// Validated input of the order-creation flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub customer_id: String,
    pub products: Vec<String>,
    pub total_amount: f64,
}

impl OrderDraft {
    pub fn validate(&self) -> Result<(), EventError> {
        if self.customer_id.trim().is_empty() {
            return Err(EventError::MissingCustomerId);
        }
        if self.products.is_empty() {
            return Err(EventError::NoProducts);
        }
        if !(self.total_amount.is_finite() && self.total_amount > 0.0) {
            return Err(EventError::NonPositiveTotal(self.total_amount));
        }
        Ok(())
    }
}

/// Order-created event as it travels over the broker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderEvent {
    order_id: String,
    customer_id: String,
    total_amount: f64,
    products: Vec<String>,
    timestamp: String,
}

impl OrderEvent {
    /// Build the event for a freshly persisted order
    pub fn for_created_order(
        order_id: impl Into<String>,
        draft: &OrderDraft,
        created_at: DateTime<Utc>,
    ) -> Result<Self, EventError> {
        Self::new(
            order_id,
            draft.customer_id.clone(),
            draft.total_amount,
            draft.products.clone(),
            created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        )
    }

    pub fn new(
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        total_amount: f64,
        products: Vec<String>,
        timestamp: impl Into<String>,
    ) -> Result<Self, EventError> {
        let order_id = order_id.into();
        if order_id.trim().is_empty() {
            return Err(EventError::MissingOrderId);
        }

        let draft = OrderDraft {
            customer_id: customer_id.into(),
            products,
            total_amount,
        };
        draft.validate()?;

        let timestamp = timestamp.into();
        if !is_iso8601(&timestamp) {
            return Err(EventError::InvalidTimestamp(timestamp));
        }

        Ok(Self {
            order_id,
            customer_id: draft.customer_id,
            total_amount: draft.total_amount,
            products: draft.products,
            timestamp,
        })
    }

    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn total_amount(&self) -> f64 {
        self.total_amount
    }

    pub fn products(&self) -> &[String] {
        &self.products
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Serialize to the JSON wire envelope
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Accepts both offset-qualified (RFC 3339) and naive local timestamps
fn is_iso8601(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}

/// Consumer-side view of an order envelope
///
/// Missing fields fall back to defaults so that a partially filled envelope
/// is still processed; an explicit `null` counts as missing. Fields present
/// with the wrong JSON type make the whole envelope malformed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReceivedOrder {
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    customer_id: Option<String>,
    #[serde(default)]
    total_amount: Option<f64>,
    #[serde(default)]
    products: Option<Vec<String>>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl ReceivedOrder {
    /// Decode a raw delivery body
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        let text = std::str::from_utf8(payload).map_err(|e| DecodeError::NotUtf8(e.to_string()))?;
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))
    }

    /// Order id when the envelope carried one
    pub fn known_order_id(&self) -> Option<&str> {
        self.order_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn order_id(&self) -> &str {
        self.known_order_id().unwrap_or(UNKNOWN_FIELD)
    }

    pub fn customer_id(&self) -> &str {
        self.customer_id.as_deref().unwrap_or(UNKNOWN_FIELD)
    }

    pub fn total_amount(&self) -> f64 {
        self.total_amount.unwrap_or_default()
    }

    pub fn products(&self) -> &[String] {
        self.products.as_deref().unwrap_or_default()
    }

    /// Product list for log lines: at most three names, then an ellipsis
    pub fn products_summary(&self) -> String {
        let products = self.products();
        if products.len() <= 3 {
            products.join(", ")
        } else {
            format!("{}, ...", products[..3].join(", "))
        }
    }
}

/// Reasons a delivery body cannot be decoded
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("payload is not UTF-8: {0}")]
    NotUtf8(String),
    #[error("payload is not an order envelope: {0}")]
    Malformed(String),
}

/// Result of one publish attempt
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Broker acknowledged and routed the message
    Confirmed,
    /// Broker returned the mandatory message: no queue bound to the routing key
    Unroutable,
    /// Broker negatively acknowledged the message
    Rejected,
    /// Connection, channel or confirm wait failed
    TransportError(String),
}

impl DeliveryOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, DeliveryOutcome::Confirmed)
    }

    /// Every non-confirmed outcome may be transient
    pub fn is_retryable(&self) -> bool {
        !self.is_confirmed()
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Confirmed => write!(f, "confirmed"),
            DeliveryOutcome::Unroutable => write!(f, "unroutable"),
            DeliveryOutcome::Rejected => write!(f, "rejected"),
            DeliveryOutcome::TransportError(cause) => write!(f, "transport error: {cause}"),
        }
    }
}

/// Terminal settlement decision for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Ack,
    /// Malformed message, dropped without requeue
    NackDiscard,
    /// Transient fault, handed back to the broker for redelivery
    NackRequeue,
}

impl fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingOutcome::Ack => write!(f, "ack"),
            ProcessingOutcome::NackDiscard => write!(f, "nack-discard"),
            ProcessingOutcome::NackRequeue => write!(f, "nack-requeue"),
        }
    }
}

/// What the order-creation flow gets back from the notification step
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReport {
    pub order_id: String,
    pub outcome: DeliveryOutcome,
    pub attempts: u32,
}

impl PublishReport {
    /// The order exists but consumers were not told about it
    pub fn is_degraded(&self) -> bool {
        !self.outcome.is_confirmed()
    }
}

//! Confirmed publishing of order events
//!
//! Every publish attempt runs on a private session: open, enable confirms,
//! send persistent + mandatory, wait for the broker's verdict, close. A
//! non-confirmed attempt is retried with linear backoff.

use super::connection::ConnectionManager;
use super::retry::{RetryDecision, RetryPolicy, retry_with_backoff};
use super::{BrokerSession, Confirmation, OutgoingMessage, TransportError};
use crate::error::sanitize_error_message;
use crate::observability::metrics;
use crate::protocol::{DeliveryOutcome, EventError, OrderDraft, OrderEvent, PublishReport};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{Instrument, info, warn};

/// Default total publish attempts
pub const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;

/// Linear backoff step between publish attempts
pub const PUBLISH_BACKOFF_STEP: Duration = Duration::from_millis(100);

/// Publishes order events with broker confirmation
#[derive(Clone)]
pub struct OrderPublisher {
    manager: ConnectionManager,
    policy: RetryPolicy,
}

impl OrderPublisher {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            policy: RetryPolicy::linear(DEFAULT_PUBLISH_ATTEMPTS, PUBLISH_BACKOFF_STEP),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Publish one event; the returned outcome is final
    pub async fn publish(&self, event: &OrderEvent) -> DeliveryOutcome {
        self.publish_with_attempts(event).await.0
    }

    /// Publish one event and report how many attempts it took
    pub async fn publish_with_attempts(&self, event: &OrderEvent) -> (DeliveryOutcome, u32) {
        let span = crate::publish_span!(order_id = event.order_id());

        async {
            let payload = match event.to_json_bytes() {
                Ok(payload) => payload,
                Err(e) => {
                    let outcome =
                        DeliveryOutcome::TransportError(TransportError::Serialization(e).to_string());
                    warn!(outcome = %outcome, "Order event could not be serialized");
                    return (outcome, 0);
                }
            };
            let message = OutgoingMessage::persistent_json(payload);

            let result = retry_with_backoff(
                &self.policy,
                "publish_order_event",
                DeliveryOutcome::is_retryable,
                |attempt| {
                    let message = &message;
                    async move {
                        let outcome = self.attempt(message).await;
                        if outcome.is_confirmed() {
                            info!(attempt, "Order event confirmed by broker");
                            Ok(attempt)
                        } else {
                            warn!(attempt, outcome = %outcome, "Order event not confirmed");
                            Err(outcome)
                        }
                    }
                },
            )
            .await;

            match result {
                Ok(attempts) => (DeliveryOutcome::Confirmed, attempts),
                Err(e) => (e.last_error, e.attempts),
            }
        }
        .instrument(span)
        .await
    }

    /// Publish several events over one session per attempt
    ///
    /// Events confirmed in an earlier attempt are not re-sent.
    pub async fn publish_batch(&self, events: &[OrderEvent]) -> Vec<DeliveryOutcome> {
        let mut outcomes: Vec<DeliveryOutcome> = events
            .iter()
            .map(|_| DeliveryOutcome::TransportError("not attempted".to_string()))
            .collect();
        let mut messages = Vec::with_capacity(events.len());
        for (index, event) in events.iter().enumerate() {
            match event.to_json_bytes() {
                Ok(payload) => messages.push(Some(OutgoingMessage::persistent_json(payload))),
                Err(e) => {
                    outcomes[index] =
                        DeliveryOutcome::TransportError(TransportError::Serialization(e).to_string());
                    messages.push(None);
                }
            }
        }

        let mut attempt = 1;
        loop {
            self.batch_attempt(&messages, &mut outcomes).await;

            let pending = outcomes
                .iter()
                .zip(&messages)
                .filter(|(outcome, message)| message.is_some() && !outcome.is_confirmed())
                .count();
            if pending == 0 {
                break;
            }

            match self.policy.decide(attempt, true) {
                RetryDecision::Proceed {
                    attempt: next,
                    delay,
                } => {
                    warn!(
                        attempt,
                        pending,
                        delay_ms = delay.as_millis() as u64,
                        "Batch attempt left events unconfirmed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                _ => {
                    warn!(attempts = attempt, pending, "Giving up on unconfirmed batch events");
                    break;
                }
            }
        }

        outcomes
    }

    /// Notification step of the order-creation flow
    ///
    /// The order is already persisted; a failed publish only degrades the
    /// notification and is reported, never rolled back.
    pub async fn publish_order_created(
        &self,
        order_id: &str,
        draft: &OrderDraft,
        created_at: DateTime<Utc>,
    ) -> Result<PublishReport, EventError> {
        let event = OrderEvent::for_created_order(order_id, draft, created_at)?;
        let (outcome, attempts) = self.publish_with_attempts(&event).await;

        let report = PublishReport {
            order_id: order_id.to_string(),
            outcome,
            attempts,
        };
        if report.is_degraded() {
            warn!(
                order_id,
                attempts,
                outcome = %report.outcome,
                "Order created but its event could not be published"
            );
        }
        Ok(report)
    }

    async fn attempt(&self, message: &OutgoingMessage) -> DeliveryOutcome {
        metrics().record_publish_attempt();

        let session = match self.open_publishing_session().await {
            Ok(session) => session,
            Err(e) => return transport_outcome(e),
        };
        let outcome = self.send(session.as_ref(), message).await;
        session.close().await;

        metrics().record_publish_outcome(&outcome);
        outcome
    }

    async fn batch_attempt(
        &self,
        messages: &[Option<OutgoingMessage>],
        outcomes: &mut [DeliveryOutcome],
    ) {
        metrics().record_publish_attempt();

        let session = match self.open_publishing_session().await {
            Ok(session) => session,
            Err(e) => {
                let outcome = transport_outcome(e);
                for (slot, message) in outcomes.iter_mut().zip(messages) {
                    if message.is_some() && !slot.is_confirmed() {
                        *slot = outcome.clone();
                    }
                }
                return;
            }
        };

        for (slot, message) in outcomes.iter_mut().zip(messages) {
            let Some(message) = message else { continue };
            if slot.is_confirmed() {
                continue;
            }
            *slot = self.send(session.as_ref(), message).await;
            metrics().record_publish_outcome(slot);
        }
        session.close().await;
    }

    async fn open_publishing_session(&self) -> Result<Box<dyn BrokerSession>, TransportError> {
        let session = self.manager.open_once().await?;
        if let Err(e) = session.enable_confirms().await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Send and wait for the confirm, bounded by the blocked-connection timeout
    async fn send(&self, session: &dyn BrokerSession, message: &OutgoingMessage) -> DeliveryOutcome {
        let bound = self.manager.profile().blocked_connection_timeout;
        match timeout(bound, session.publish(self.manager.queue(), message)).await {
            Ok(Ok(Confirmation::Ack)) => DeliveryOutcome::Confirmed,
            Ok(Ok(Confirmation::Returned)) => DeliveryOutcome::Unroutable,
            Ok(Ok(Confirmation::Nack)) => DeliveryOutcome::Rejected,
            Ok(Err(e)) => transport_outcome(e),
            Err(_) => transport_outcome(TransportError::ConfirmTimeout(bound)),
        }
    }
}

fn transport_outcome(error: TransportError) -> DeliveryOutcome {
    DeliveryOutcome::TransportError(sanitize_error_message(&error.to_string()))
}

//! Per-delivery processing
//!
//! Decodes one order event, logs its summary, runs the status callback and
//! decides how the delivery is settled.

use crate::notify::StatusNotifier;
use crate::observability::metrics;
use crate::protocol::{ProcessingOutcome, ReceivedOrder};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Decides ack / discard / requeue for each delivery
#[derive(Clone)]
pub struct MessageHandler {
    notifier: Arc<dyn StatusNotifier>,
    notify_timeout: Duration,
}

impl MessageHandler {
    pub fn new(notifier: Arc<dyn StatusNotifier>, notify_timeout: Duration) -> Self {
        Self {
            notifier,
            notify_timeout,
        }
    }

    /// Process one raw delivery body
    ///
    /// - undecodable body: `NackDiscard`, the callback is never invoked
    /// - callback success or failure: `Ack`
    /// - panic while processing: `NackRequeue`
    pub async fn handle(&self, payload: &[u8]) -> ProcessingOutcome {
        let order = match ReceivedOrder::decode(payload) {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, payload_len = payload.len(), "Discarding malformed order event");
                return ProcessingOutcome::NackDiscard;
            }
        };

        match AssertUnwindSafe(self.process(&order)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(
                    order_id = order.order_id(),
                    panic = %panic_message(panic.as_ref()),
                    "Order event processing panicked, requeueing"
                );
                ProcessingOutcome::NackRequeue
            }
        }
    }

    async fn process(&self, order: &ReceivedOrder) -> ProcessingOutcome {
        info!(
            order_id = order.order_id(),
            customer_id = order.customer_id(),
            products = %order.products_summary(),
            total_amount = order.total_amount(),
            "Order event received"
        );

        let Some(order_id) = order.known_order_id() else {
            warn!("Order event has no order_id, skipping status callback");
            metrics().callback_skipped();
            return ProcessingOutcome::Ack;
        };

        match timeout(self.notify_timeout, self.notifier.mark_notified(order_id)).await {
            Ok(Ok(())) => {
                metrics().callback_finished(true);
                info!(order_id, "Order marked as notified");
            }
            Ok(Err(e)) => {
                metrics().callback_finished(false);
                warn!(order_id, error = %e, "Status callback failed, acknowledging anyway");
            }
            Err(_) => {
                metrics().callback_finished(false);
                warn!(
                    order_id,
                    timeout_ms = self.notify_timeout.as_millis() as u64,
                    "Status callback timed out, acknowledging anyway"
                );
            }
        }

        ProcessingOutcome::Ack
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

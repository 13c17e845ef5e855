//! Self-healing order event consumer
//!
//! One long-lived session per cycle, prefetch 1, manual acknowledgment.
//! Any channel error, stream end or settlement failure ends the cycle; the
//! session is torn down and a new one opened after a cool-down. Only the
//! stop signal ends the loop.

use crate::observability::metrics;
use crate::transport::{BrokerSession, ConnectionManager, OpenError, TransportError};
use futures::StreamExt;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, warn};

pub mod handler;
pub mod state;

pub use handler::MessageHandler;
pub use state::{ConsumerEvent, ConsumerState, ConsumerSupervisor, ReconnectSchedule};

/// Default consumer tag
pub const DEFAULT_CONSUMER_TAG: &str = "orderbus-consumer";

/// How a consume cycle ended
#[derive(Debug, PartialEq)]
enum CycleEnd {
    /// Stop signal observed between deliveries
    Stopped,
    /// `registered` is true when the consumer reached the consuming state
    Failed {
        reason: String,
        registered: bool,
        settled: u64,
    },
}

/// Drives deliveries from the broker through the message handler
pub struct ConsumerLoop {
    manager: ConnectionManager,
    handler: MessageHandler,
    schedule: ReconnectSchedule,
    consumer_tag: String,
    state_tx: watch::Sender<ConsumerState>,
}

impl ConsumerLoop {
    pub fn new(manager: ConnectionManager, handler: MessageHandler) -> Self {
        let (state_tx, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            manager,
            handler,
            schedule: ReconnectSchedule::default(),
            consumer_tag: DEFAULT_CONSUMER_TAG.to_string(),
            state_tx,
        }
    }

    pub fn with_reconnect_schedule(mut self, schedule: ReconnectSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConsumerState {
        self.state_tx.borrow().clone()
    }

    /// Watch lifecycle state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, event: ConsumerEvent) -> ConsumerState {
        let current = self.state();
        let next = ConsumerSupervisor::next_state(&current, &event);
        if next != current {
            ConsumerSupervisor::log_state_transition(&current, &next, &event);
            self.state_tx.send_replace(next.clone());
        }
        next
    }

    /// Run until `shutdown_rx` turns true
    ///
    /// Returns an error only when the very first session open exhausts its
    /// retries. Later open failures are failed cycles and are retried.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), OpenError> {
        let span = crate::lifecycle_span!(
            queue = self.manager.queue().name(),
            consumer_tag = %self.consumer_tag
        );

        async {
            let mut consecutive_failures: u32 = 0;
            let mut opened_once = false;

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                self.transition(ConsumerEvent::ConnectRequested);
                let opened = tokio::select! {
                    result = self.manager.open() => Some(result),
                    _ = wait_for_stop(&mut shutdown_rx) => None,
                };
                let Some(opened) = opened else { break };

                let cycle = match opened {
                    Ok(session) => {
                        opened_once = true;
                        let end = self.consume_cycle(session.as_ref(), &mut shutdown_rx).await;
                        session.close().await;
                        end
                    }
                    Err(e) if !opened_once => {
                        self.transition(ConsumerEvent::SessionFailed(e.to_string()));
                        error!(
                            attempts = e.attempts(),
                            "Could not open a broker session at startup, giving up"
                        );
                        return Err(e);
                    }
                    Err(e) => CycleEnd::Failed {
                        reason: e.to_string(),
                        registered: false,
                        settled: 0,
                    },
                };

                match cycle {
                    CycleEnd::Stopped => break,
                    CycleEnd::Failed {
                        reason,
                        registered,
                        settled,
                    } => {
                        metrics().cycle_failed();
                        if registered {
                            consecutive_failures = 0;
                        }
                        consecutive_failures += 1;
                        self.transition(ConsumerEvent::SessionFailed(
                            crate::error::sanitize_error_message(&reason),
                        ));

                        let cooldown = self.schedule.cooldown_for(consecutive_failures);
                        warn!(
                            consecutive_failures,
                            settled,
                            cooldown_secs = cooldown.as_secs_f64(),
                            "Consume cycle failed, reconnecting after cool-down"
                        );
                        metrics().reconnect_scheduled();

                        if !interruptible_sleep(&mut shutdown_rx, cooldown).await {
                            break;
                        }
                    }
                }
            }

            self.transition(ConsumerEvent::StopRequested);
            metrics().consumer_stopped();
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Consume on one session until failure or stop
    async fn consume_cycle(
        &self,
        session: &dyn BrokerSession,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> CycleEnd {
        let mut deliveries = match session
            .consume(self.manager.queue(), &self.consumer_tag)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(e) => {
                return CycleEnd::Failed {
                    reason: e.to_string(),
                    registered: false,
                    settled: 0,
                };
            }
        };

        self.transition(ConsumerEvent::SessionReady);
        metrics().session_opened();
        let mut settled: u64 = 0;

        loop {
            // Only the wait for the next delivery is interruptible; a delivery
            // already taken is always handled and settled.
            let next = tokio::select! {
                biased;
                _ = wait_for_stop(shutdown_rx) => return CycleEnd::Stopped,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    return CycleEnd::Failed {
                        reason: e.to_string(),
                        registered: true,
                        settled,
                    };
                }
                None => {
                    return CycleEnd::Failed {
                        reason: TransportError::StreamClosed.to_string(),
                        registered: true,
                        settled,
                    };
                }
            };

            let delivery_tag = delivery.delivery_tag;
            let span = crate::delivery_span!(delivery_tag, redelivered = delivery.redelivered);
            let started = Instant::now();
            metrics().message_received(delivery.redelivered);

            let outcome = self
                .handler
                .handle(&delivery.payload)
                .instrument(span.clone())
                .await;

            match delivery.settle(outcome).await {
                Ok(()) => {
                    settled += 1;
                    metrics().record_settlement(outcome, started.elapsed());
                    span.in_scope(|| debug!(outcome = %outcome, "Delivery settled"));
                }
                Err(e) => {
                    metrics().settlement_failed();
                    span.in_scope(|| warn!(error = %e, outcome = %outcome, "Delivery settlement failed"));
                    return CycleEnd::Failed {
                        reason: e.to_string(),
                        registered: true,
                        settled,
                    };
                }
            }
        }
    }
}

/// Resolve once the stop signal is true; pending forever if the sender is gone
pub async fn wait_for_stop(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleep that the stop signal can cut short; false when interrupted
pub async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = wait_for_stop(shutdown_rx) => {
            info!("Stop signal received during reconnect cool-down");
            false
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(interruptible_sleep(&mut rx, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (tx, mut rx) = watch::channel(false);
        let sleeper =
            tokio::spawn(async move { interruptible_sleep(&mut rx, Duration::from_secs(60)).await });

        tx.send(true).unwrap();

        let completed = tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(!completed);
    }

    #[tokio::test]
    async fn test_wait_for_stop_returns_when_already_stopped() {
        let (_tx, mut rx) = watch::channel(true);
        tokio::time::timeout(Duration::from_millis(100), wait_for_stop(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_stop_pends_after_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let waited = tokio::time::timeout(Duration::from_millis(50), wait_for_stop(&mut rx)).await;
        assert!(waited.is_err());
    }
}

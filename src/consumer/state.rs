//! Pure consumer state machine and reconnect schedule
//!
//! No I/O here: the consumer loop feeds events in and acts on the states
//! and cool-downs that come out.

use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Lifecycle state of the consumer loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    /// No session; waiting out a cool-down or about to connect
    Disconnected,
    Connecting,
    /// Session open, consumer registered with manual ack and prefetch 1
    Consuming,
    /// Terminal; reached only through the stop signal
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Events that drive state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    ConnectRequested,
    SessionReady,
    /// Open failed, or the consume cycle ended with an error
    SessionFailed(String),
    StopRequested,
}

/// Pure transition logic for the consumer loop
pub struct ConsumerSupervisor;

impl ConsumerSupervisor {
    /// Next state after an event (pure function)
    ///
    /// `Stopped` is absorbing. Events that make no sense in the current
    /// state leave it unchanged.
    pub fn next_state(current: &ConsumerState, event: &ConsumerEvent) -> ConsumerState {
        use ConsumerEvent as E;
        use ConsumerState as S;

        match (current, event) {
            (S::Stopped, _) => S::Stopped,
            (_, E::StopRequested) => S::Stopped,
            (S::Disconnected, E::ConnectRequested) => S::Connecting,
            (S::Connecting, E::SessionReady) => S::Consuming,
            (S::Connecting | S::Consuming, E::SessionFailed(_)) => S::Disconnected,
            (state, _) => state.clone(),
        }
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: &ConsumerState, to: &ConsumerState, event: &ConsumerEvent) {
        match (from, to, event) {
            (ConsumerState::Connecting, ConsumerState::Consuming, _) => {
                info!("Consumer registered, waiting for order events");
            }
            (
                ConsumerState::Consuming,
                ConsumerState::Disconnected,
                ConsumerEvent::SessionFailed(reason),
            ) => {
                warn!(reason = %reason, "Consumer session lost");
            }
            (
                ConsumerState::Connecting,
                ConsumerState::Disconnected,
                ConsumerEvent::SessionFailed(reason),
            ) => {
                error!(reason = %reason, "Consumer session could not be opened");
            }
            (_, ConsumerState::Stopped, _) => {
                info!(from = %from, "Consumer stopped");
            }
            _ => {
                info!(from = %from, to = %to, "Consumer state changed");
            }
        }
    }
}

/// Cool-down between failed consume cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectSchedule {
    pub base: Duration,
    pub escalated: Duration,
    /// Consecutive failures at which `escalated` applies
    pub escalate_after: u32,
}

impl Default for ReconnectSchedule {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(15),
            escalated: Duration::from_secs(30),
            escalate_after: 3,
        }
    }
}

impl ReconnectSchedule {
    /// Cool-down after `consecutive_failures` failed cycles (pure function)
    pub fn cooldown_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures >= self.escalate_after {
            self.escalated
        } else {
            self.base
        }
    }
}

//! Mock implementations for testing
//!
//! `MockBroker` is an in-memory broker behind the `BrokerConnector` seam: one
//! durable queue, prefetch-1 delivery, manual acknowledgment, requeue of
//! unacknowledged messages when a session dies, and scriptable failures.
//! `RecordingNotifier` and `PanickingNotifier` stand in for the orders service.

use crate::notify::{NotifyError, StatusNotifier};
use crate::protocol::ProcessingOutcome;
use crate::transport::{
    BrokerAddress, BrokerConnector, BrokerSession, Confirmation, ConnectionProfile,
    DeliveryAcker, DeliveryStream, IncomingDelivery, OutgoingMessage, QueueDescriptor,
    TransportError,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How often an idle mock consumer looks for new messages
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Scripted broker reaction to one publish
#[derive(Debug, Clone, PartialEq)]
pub enum PublishBehavior {
    /// Route the message and ack it
    Ack,
    /// Negatively acknowledge; the message is dropped
    Nack,
    /// Return the mandatory message as unroutable
    Return,
    /// Fail the publish with a transport error
    Fail(String),
    /// Never confirm
    Hang,
}

/// One delivery handed to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub payload: Vec<u8>,
}

/// One settlement received from a consumer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settlement {
    pub delivery_tag: u64,
    pub outcome: ProcessingOutcome,
}

/// One queue declaration: name, durable, exclusive, auto-delete
pub type Declaration = (String, bool, bool, bool);

#[derive(Debug, Clone)]
struct QueuedMessage {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    connect_failures_remaining: u32,
    declare_failures_remaining: u32,
    ack_failures_remaining: u32,
    connect_times: Vec<Instant>,
    declarations: Vec<Declaration>,
    prefetch_settings: Vec<u16>,
    confirm_selects: u32,
    publish_script: VecDeque<PublishBehavior>,
    published: Vec<OutgoingMessage>,
    ready: VecDeque<QueuedMessage>,
    unacked: HashMap<u64, (u64, QueuedMessage)>,
    deliveries: Vec<DeliveryRecord>,
    settlements: Vec<Settlement>,
    rejected_settlements: u32,
    open_sessions: HashSet<u64>,
    next_session_id: u64,
    next_delivery_tag: u64,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            connect_failures_remaining: 0,
            declare_failures_remaining: 0,
            ack_failures_remaining: 0,
            connect_times: Vec::new(),
            declarations: Vec::new(),
            prefetch_settings: Vec::new(),
            confirm_selects: 0,
            publish_script: VecDeque::new(),
            published: Vec::new(),
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            deliveries: Vec::new(),
            settlements: Vec::new(),
            rejected_settlements: 0,
            open_sessions: HashSet::new(),
            next_session_id: 1,
            next_delivery_tag: 1,
        }
    }
}

impl BrokerState {
    /// Put a session's unacknowledged messages back at the head of the queue
    fn requeue_unacked(&mut self, session_filter: impl Fn(u64) -> bool) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (session, _))| session_filter(*session))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some((_, mut message)) = self.unacked.remove(&tag) {
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
    }

    fn session_has_unacked(&self, session_id: u64) -> bool {
        self.unacked.values().any(|(session, _)| *session == session_id)
    }
}

/// In-memory broker
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock_state(&self.state)
    }

    /// Make every connect fail (`false`) or succeed (`true`)
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.lock().connect_failures_remaining = count;
    }

    pub fn fail_next_declares(&self, count: u32) {
        self.lock().declare_failures_remaining = count;
    }

    pub fn fail_next_acks(&self, count: u32) {
        self.lock().ack_failures_remaining = count;
    }

    /// Reactions for the next publishes; `Ack` once the script runs out
    pub fn script_publishes(&self, behaviors: impl IntoIterator<Item = PublishBehavior>) {
        self.lock().publish_script.extend(behaviors);
    }

    /// Put a raw message on the queue, bypassing the publish path
    pub fn enqueue(&self, payload: impl Into<Vec<u8>>) {
        self.lock().ready.push_back(QueuedMessage {
            payload: payload.into(),
            redelivered: false,
        });
    }

    /// Drop every open connection, as a broker restart would
    ///
    /// Unacknowledged messages return to the queue marked redelivered.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        state.open_sessions.clear();
        state.requeue_unacked(|_| true);
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_times.len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.lock().connect_times.clone()
    }

    pub fn declarations(&self) -> Vec<Declaration> {
        self.lock().declarations.clone()
    }

    /// Distinct declared queue names
    pub fn declared_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (name, ..) in self.lock().declarations.iter() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    pub fn prefetch_settings(&self) -> Vec<u16> {
        self.lock().prefetch_settings.clone()
    }

    pub fn confirm_selects(&self) -> u32 {
        self.lock().confirm_selects
    }

    pub fn published_messages(&self) -> Vec<OutgoingMessage> {
        self.lock().published.clone()
    }

    /// Messages waiting in the queue (not delivered, or requeued)
    pub fn queued_messages(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn unacked_messages(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.lock().deliveries.clone()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.lock().settlements.clone()
    }

    /// Settlements refused because the tag was unknown or the session dead
    pub fn rejected_settlements(&self) -> u32 {
        self.lock().rejected_settlements
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions.len()
    }
}

fn lock_state(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn connect(
        &self,
        _address: &BrokerAddress,
        _profile: &ConnectionProfile,
    ) -> Result<Box<dyn BrokerSession>, TransportError> {
        let mut state = self.lock();
        state.connect_times.push(Instant::now());

        if !state.reachable {
            return Err(TransportError::ConnectionFailed(
                "connection refused".to_string(),
            ));
        }
        if state.connect_failures_remaining > 0 {
            state.connect_failures_remaining -= 1;
            return Err(TransportError::ConnectionFailed(
                "connection reset by peer".to_string(),
            ));
        }

        let id = state.next_session_id;
        state.next_session_id += 1;
        state.open_sessions.insert(id);

        Ok(Box::new(MockSession {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Session on the mock broker
#[derive(Debug)]
pub struct MockSession {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl MockSession {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        let state = lock_state(&self.state);
        if state.open_sessions.contains(&self.id) {
            Ok(state)
        } else {
            Err(TransportError::Channel("channel closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        if state.declare_failures_remaining > 0 {
            state.declare_failures_remaining -= 1;
            return Err(TransportError::DeclareFailed {
                queue: queue.name().to_string(),
                reason: "PRECONDITION_FAILED".to_string(),
            });
        }
        state.declarations.push((
            queue.name().to_string(),
            queue.durable_flag(),
            queue.exclusive(),
            queue.auto_delete(),
        ));
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.open_state()?.prefetch_settings.push(count);
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<(), TransportError> {
        self.open_state()?.confirm_selects += 1;
        Ok(())
    }

    async fn publish(
        &self,
        _queue: &QueueDescriptor,
        message: &OutgoingMessage,
    ) -> Result<Confirmation, TransportError> {
        let behavior = {
            let mut state = self.open_state()?;
            state.published.push(message.clone());
            let behavior = state
                .publish_script
                .pop_front()
                .unwrap_or(PublishBehavior::Ack);
            if behavior == PublishBehavior::Ack {
                state.ready.push_back(QueuedMessage {
                    payload: message.payload.clone(),
                    redelivered: false,
                });
            }
            behavior
        };

        match behavior {
            PublishBehavior::Ack => Ok(Confirmation::Ack),
            PublishBehavior::Nack => Ok(Confirmation::Nack),
            PublishBehavior::Return => Ok(Confirmation::Returned),
            PublishBehavior::Fail(reason) => Err(TransportError::PublishFailed(reason)),
            PublishBehavior::Hang => std::future::pending().await,
        }
    }

    async fn consume(
        &self,
        _queue: &QueueDescriptor,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        drop(self.open_state()?);

        let state = Arc::clone(&self.state);
        let session_id = self.id;
        let stream = futures::stream::unfold((), move |()| {
            let state = Arc::clone(&state);
            async move {
                loop {
                    {
                        let mut guard = lock_state(&state);
                        if !guard.open_sessions.contains(&session_id) {
                            return None;
                        }
                        if !guard.session_has_unacked(session_id) {
                            if let Some(message) = guard.ready.pop_front() {
                                let delivery_tag = guard.next_delivery_tag;
                                guard.next_delivery_tag += 1;
                                guard.deliveries.push(DeliveryRecord {
                                    delivery_tag,
                                    redelivered: message.redelivered,
                                    payload: message.payload.clone(),
                                });
                                guard
                                    .unacked
                                    .insert(delivery_tag, (session_id, message.clone()));

                                let acker = MockAcker {
                                    session_id,
                                    state: Arc::clone(&state),
                                };
                                let delivery = IncomingDelivery::new(
                                    delivery_tag,
                                    message.redelivered,
                                    message.payload,
                                    Box::new(acker),
                                );
                                return Some((Ok(delivery), ()));
                            }
                        }
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) {
        let mut state = lock_state(&self.state);
        if state.open_sessions.remove(&self.id) {
            let id = self.id;
            state.requeue_unacked(|session| session == id);
        }
    }
}

/// Settles deliveries against the mock broker's unacked table
struct MockAcker {
    session_id: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl MockAcker {
    fn settle(&self, delivery_tag: u64, outcome: ProcessingOutcome) -> Result<(), TransportError> {
        let mut state = lock_state(&self.state);

        let refused = |reason: &str| TransportError::AckFailed {
            delivery_tag,
            reason: reason.to_string(),
        };

        if !state.open_sessions.contains(&self.session_id) {
            state.rejected_settlements += 1;
            return Err(refused("channel closed"));
        }
        if state.ack_failures_remaining > 0 {
            state.ack_failures_remaining -= 1;
            return Err(refused("simulated ack failure"));
        }
        let Some((_, mut message)) = state.unacked.remove(&delivery_tag) else {
            state.rejected_settlements += 1;
            return Err(refused("unknown delivery tag"));
        };

        if outcome == ProcessingOutcome::NackRequeue {
            message.redelivered = true;
            state.ready.push_front(message);
        }
        state.settlements.push(Settlement {
            delivery_tag,
            outcome,
        });
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for MockAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.settle(delivery_tag, ProcessingOutcome::Ack)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let outcome = if requeue {
            ProcessingOutcome::NackRequeue
        } else {
            ProcessingOutcome::NackDiscard
        };
        self.settle(delivery_tag, outcome)
    }
}

/// Notifier that records every call
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    calls: Arc<Mutex<Vec<String>>>,
    should_fail: bool,
    delay: Option<Duration>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with a 503
    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    /// Every call takes `delay` before succeeding
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Order ids in call order; a call is recorded when it starts
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }
}

#[async_trait]
impl StatusNotifier for RecordingNotifier {
    async fn mark_notified(&self, order_id: &str) -> Result<(), NotifyError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(order_id.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.should_fail {
            return Err(NotifyError::UnexpectedStatus { status: 503 });
        }
        Ok(())
    }
}

/// Notifier that panics, standing in for an unexpected processing fault
#[derive(Debug, Clone, Copy, Default)]
pub struct PanickingNotifier;

#[async_trait]
impl StatusNotifier for PanickingNotifier {
    async fn mark_notified(&self, order_id: &str) -> Result<(), NotifyError> {
        panic!("status callback exploded for order {order_id}");
    }
}

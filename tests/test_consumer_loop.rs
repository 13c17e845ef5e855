//! Consumer loop lifecycle tests
//!
//! Run the real consumer loop against the in-memory broker and check what
//! the broker observes: settlements, redeliveries, reconnect spacing and
//! how the loop ends.


use orderbus::consumer::{ConsumerLoop, ConsumerState, MessageHandler, ReconnectSchedule};
use orderbus::protocol::ProcessingOutcome;
use orderbus::testing::mocks::{MockBroker, RecordingNotifier};
use orderbus::transport::OpenError;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{eventually, fast_schedule, mock_manager, order_payload};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(3);

struct Running {
    broker: MockBroker,
    notifier: RecordingNotifier,
    state_rx: watch::Receiver<ConsumerState>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<(), OpenError>>,
}

impl Running {
    async fn stop(self) -> Result<(), OpenError> {
        self.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("consumer should stop promptly")
            .unwrap()
    }
}

fn start(broker: MockBroker, notifier: RecordingNotifier, open_attempts: u32) -> Running {
    let handler = MessageHandler::new(Arc::new(notifier.clone()), Duration::from_millis(200));
    let consumer = ConsumerLoop::new(mock_manager(&broker, open_attempts), handler)
        .with_reconnect_schedule(fast_schedule())
        .with_consumer_tag("test-consumer");
    let state_rx = consumer.subscribe_state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    Running {
        broker,
        notifier,
        state_rx,
        shutdown_tx,
        handle,
    }
}

#[tokio::test]
async fn test_valid_events_are_acked_in_order() {
    // Arrange
    let broker = MockBroker::new();
    broker.enqueue(order_payload("A"));
    broker.enqueue(order_payload("B"));
    let running = start(broker.clone(), RecordingNotifier::new(), 3);

    // Act
    let settled = eventually(WAIT, || broker.settlements().len() == 2).await;

    // Assert
    assert!(settled);
    assert!(broker
        .settlements()
        .iter()
        .all(|s| s.outcome == ProcessingOutcome::Ack));
    assert_eq!(running.notifier.calls(), vec!["A".to_string(), "B".to_string()]);
    assert_eq!(broker.prefetch_settings(), vec![1]);
    assert_eq!(broker.queued_messages(), 0);
    assert_eq!(broker.unacked_messages(), 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_event_is_discarded_and_consumption_continues() {
    let broker = MockBroker::new();
    broker.enqueue(b"not json".to_vec());
    broker.enqueue(order_payload("B"));
    let running = start(broker.clone(), RecordingNotifier::new(), 3);

    assert!(eventually(WAIT, || broker.settlements().len() == 2).await);

    let outcomes: Vec<ProcessingOutcome> =
        broker.settlements().iter().map(|s| s.outcome).collect();
    assert_eq!(
        outcomes,
        vec![ProcessingOutcome::NackDiscard, ProcessingOutcome::Ack]
    );
    assert_eq!(running.notifier.calls(), vec!["B".to_string()]);
    assert_eq!(broker.queued_messages(), 0, "discarded events are not requeued");

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_failing_callback_still_acks() {
    let broker = MockBroker::new();
    broker.enqueue(order_payload("A"));
    let running = start(broker.clone(), RecordingNotifier::failing(), 3);

    assert!(eventually(WAIT, || broker.settlements().len() == 1).await);

    assert_eq!(broker.settlements()[0].outcome, ProcessingOutcome::Ack);
    assert_eq!(running.notifier.call_count(), 1);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_consumer_reaches_consuming_and_ends_stopped() {
    let broker = MockBroker::new();
    let mut running = start(broker.clone(), RecordingNotifier::new(), 3);

    tokio::time::timeout(
        WAIT,
        running
            .state_rx
            .wait_for(|state| *state == ConsumerState::Consuming),
    )
    .await
    .expect("consumer should start consuming")
    .unwrap();

    let state_rx = running.state_rx.clone();
    running.stop().await.unwrap();

    assert_eq!(*state_rx.borrow(), ConsumerState::Stopped);
    assert_eq!(broker.open_sessions(), 0, "session is closed on stop");
}

#[tokio::test]
async fn test_startup_gives_up_after_open_attempts_exhausted() {
    let broker = MockBroker::new();
    broker.set_reachable(false);
    let running = start(broker.clone(), RecordingNotifier::new(), 3);

    let result = tokio::time::timeout(WAIT, running.handle)
        .await
        .expect("startup failure should end the loop")
        .unwrap();

    let err = result.unwrap_err();
    assert_eq!(err.attempts(), 3);
    assert_eq!(broker.connect_attempts(), 3);
}

#[tokio::test]
async fn test_startup_recovers_when_broker_comes_up_within_attempts() {
    let broker = MockBroker::new();
    broker.fail_next_connects(2);
    broker.enqueue(order_payload("A"));
    let running = start(broker.clone(), RecordingNotifier::new(), 3);

    assert!(eventually(WAIT, || broker.settlements().len() == 1).await);
    assert_eq!(broker.connect_attempts(), 3);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_connection_loss_reconnects_and_redelivers_unacked() {
    // Arrange: the callback is slow enough to drop the connection mid-handling
    let broker = MockBroker::new();
    broker.enqueue(order_payload("A"));
    let notifier = RecordingNotifier::with_delay(Duration::from_millis(100));
    let running = start(broker.clone(), notifier, 3);
    assert!(eventually(WAIT, || broker.deliveries().len() == 1).await);

    // Act
    broker.disconnect_all();

    // Assert: the stale settlement is refused, the event comes back redelivered
    // on a new session and is acked there
    assert!(eventually(WAIT, || broker.settlements().len() == 1).await);
    let deliveries = broker.deliveries();
    assert!(deliveries.len() >= 2);
    assert!(!deliveries[0].redelivered);
    assert!(deliveries[1].redelivered);
    assert_eq!(deliveries[1].payload, order_payload("A"));
    assert_eq!(broker.settlements()[0].outcome, ProcessingOutcome::Ack);
    assert!(broker.rejected_settlements() >= 1);
    assert!(broker.connect_attempts() >= 2);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_waits_out_cool_down() {
    let broker = MockBroker::new();
    let running = start(broker.clone(), RecordingNotifier::new(), 3);
    assert!(eventually(WAIT, || broker.open_sessions() == 1).await);

    broker.disconnect_all();
    assert!(eventually(WAIT, || broker.connect_attempts() >= 2).await);

    let times = broker.connect_times();
    let gap = times[1].duration_since(times[0]);
    assert!(
        gap >= fast_schedule().base,
        "reconnect came after {gap:?}, before the cool-down"
    );

    running.stop().await.unwrap();
}

fn start_with_schedule(broker: &MockBroker, open_attempts: u32, schedule: ReconnectSchedule) -> Running {
    let notifier = RecordingNotifier::new();
    let handler = MessageHandler::new(Arc::new(notifier.clone()), Duration::from_millis(200));
    let consumer = ConsumerLoop::new(mock_manager(broker, open_attempts), handler)
        .with_reconnect_schedule(schedule);
    let state_rx = consumer.subscribe_state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    Running {
        broker: broker.clone(),
        notifier,
        state_rx,
        shutdown_tx,
        handle,
    }
}

fn slow_escalation() -> ReconnectSchedule {
    ReconnectSchedule {
        base: Duration::from_millis(20),
        escalated: Duration::from_millis(500),
        escalate_after: 3,
    }
}

fn reconnect_gaps(broker: &MockBroker) -> Vec<Duration> {
    broker
        .connect_times()
        .windows(2)
        .map(|pair| pair[1].duration_since(pair[0]))
        .collect()
}

#[tokio::test]
async fn test_idle_sessions_lost_repeatedly_keep_base_cool_down() {
    // Arrange
    let broker = MockBroker::new();
    let running = start_with_schedule(&broker, 3, slow_escalation());
    assert!(eventually(WAIT, || broker.open_sessions() == 1).await);

    // Act: three healthy sessions with no traffic, each dropped by the broker
    for reconnects in 1..=3 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.disconnect_all();
        let reopened = eventually(WAIT, || {
            broker.connect_attempts() > reconnects && broker.open_sessions() == 1
        })
        .await;
        assert!(reopened);
    }

    // Assert
    let gaps = reconnect_gaps(&broker);
    assert_eq!(gaps.len(), 3);
    assert!(
        gaps.iter().all(|gap| *gap < Duration::from_millis(400)),
        "sessions that reached consuming must not escalate, gaps were {gaps:?}"
    );

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_repeated_open_failures_escalate_cool_down() {
    // Arrange: consume once, then keep the broker away
    let broker = MockBroker::new();
    let running = start_with_schedule(&broker, 1, slow_escalation());
    assert!(eventually(WAIT, || broker.open_sessions() == 1).await);
    broker.set_reachable(false);
    broker.disconnect_all();

    // Act: lost session, then two failed opens, then the escalated wait
    assert!(eventually(WAIT, || broker.connect_attempts() >= 4).await);

    // Assert
    let gaps = reconnect_gaps(&broker);
    assert!(gaps[1] < Duration::from_millis(400), "gaps were {gaps:?}");
    assert!(gaps[2] >= Duration::from_millis(500), "gaps were {gaps:?}");

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_later_open_failures_keep_retrying() {
    // Arrange: consume once, then take the broker away
    let broker = MockBroker::new();
    let running = start(broker.clone(), RecordingNotifier::new(), 2);
    assert!(eventually(WAIT, || broker.open_sessions() == 1).await);
    broker.set_reachable(false);
    broker.disconnect_all();

    // Act: several failed opens go by
    assert!(eventually(WAIT, || broker.connect_attempts() >= 6).await);
    assert!(!running.handle.is_finished(), "loop survives exhausted reopens");

    // Assert: the broker comes back and a new session is opened
    broker.set_reachable(true);
    assert!(eventually(WAIT, || broker.open_sessions() == 1).await);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_during_cool_down_ends_loop() {
    let broker = MockBroker::new();
    let handler = MessageHandler::new(Arc::new(RecordingNotifier::new()), Duration::from_millis(200));
    let consumer = ConsumerLoop::new(mock_manager(&broker, 2), handler).with_reconnect_schedule(
        orderbus::consumer::ReconnectSchedule {
            base: Duration::from_secs(60),
            escalated: Duration::from_secs(60),
            escalate_after: 3,
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { consumer.run(shutdown_rx).await });
    assert!(eventually(WAIT, || broker.open_sessions() == 1).await);

    broker.disconnect_all();
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();

    let result = tokio::time::timeout(WAIT, handle)
        .await
        .expect("stop must interrupt the cool-down")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
async fn test_in_flight_delivery_is_settled_before_stop() {
    let broker = MockBroker::new();
    broker.enqueue(order_payload("A"));
    let notifier = RecordingNotifier::with_delay(Duration::from_millis(100));
    let running = start(broker.clone(), notifier, 3);
    assert!(eventually(WAIT, || running.notifier.call_count() == 1).await);

    let broker_after = running.broker.clone();
    running.stop().await.unwrap();

    assert_eq!(broker_after.settlements().len(), 1);
    assert_eq!(broker_after.settlements()[0].outcome, ProcessingOutcome::Ack);
    assert_eq!(broker_after.queued_messages(), 0);
}

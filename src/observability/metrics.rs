//! Process-wide debug counters
//!
//! Atomic counters for deliveries, settlements, publish attempts and
//! reconnects, plus a small window of handling times. Nothing reads these
//! for correctness; they exist for logs and `orderbus` diagnostics.

use crate::protocol::{DeliveryOutcome, ProcessingOutcome};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Handling-time samples kept for percentiles
const MAX_TIMING_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe counters using atomics
pub struct MetricsCollector {
    // Consumer side
    messages_received: AtomicU64,
    messages_redelivered: AtomicU64,
    messages_acked: AtomicU64,
    messages_discarded: AtomicU64,
    messages_requeued: AtomicU64,
    settlement_failures: AtomicU64,
    callbacks_succeeded: AtomicU64,
    callbacks_failed: AtomicU64,
    callbacks_skipped: AtomicU64,

    // Session lifecycle
    consuming: AtomicBool,
    sessions_opened: AtomicU64,
    cycles_failed: AtomicU64,
    reconnects: AtomicU64,

    // Publisher side
    publish_attempts: AtomicU64,
    publish_confirmed: AtomicU64,
    publish_unroutable: AtomicU64,
    publish_rejected: AtomicU64,
    publish_transport_errors: AtomicU64,

    handling_times: Mutex<Vec<u64>>,
    started_at: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_redelivered: AtomicU64::new(0),
            messages_acked: AtomicU64::new(0),
            messages_discarded: AtomicU64::new(0),
            messages_requeued: AtomicU64::new(0),
            settlement_failures: AtomicU64::new(0),
            callbacks_succeeded: AtomicU64::new(0),
            callbacks_failed: AtomicU64::new(0),
            callbacks_skipped: AtomicU64::new(0),
            consuming: AtomicBool::new(false),
            sessions_opened: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            publish_attempts: AtomicU64::new(0),
            publish_confirmed: AtomicU64::new(0),
            publish_unroutable: AtomicU64::new(0),
            publish_rejected: AtomicU64::new(0),
            publish_transport_errors: AtomicU64::new(0),
            handling_times: Mutex::new(Vec::new()),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    // Consumer metrics
    pub fn message_received(&self, redelivered: bool) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        if redelivered {
            self.messages_redelivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_settlement(&self, outcome: ProcessingOutcome, handling_time: Duration) {
        let counter = match outcome {
            ProcessingOutcome::Ack => &self.messages_acked,
            ProcessingOutcome::NackDiscard => &self.messages_discarded,
            ProcessingOutcome::NackRequeue => &self.messages_requeued,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.record_handling_time(handling_time);
    }

    pub fn settlement_failed(&self) {
        self.settlement_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callback_finished(&self, success: bool) {
        if success {
            self.callbacks_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.callbacks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn callback_skipped(&self) {
        self.callbacks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_handling_time(&self, duration: Duration) {
        if let Ok(mut times) = self.handling_times.lock() {
            times.push(duration.as_millis() as u64);
            if times.len() > MAX_TIMING_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Session lifecycle metrics
    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.consuming.store(true, Ordering::Relaxed);
    }

    pub fn cycle_failed(&self) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
        self.consuming.store(false, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_stopped(&self) {
        self.consuming.store(false, Ordering::Relaxed);
    }

    // Publisher metrics
    pub fn record_publish_attempt(&self) {
        self.publish_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_outcome(&self, outcome: &DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Confirmed => &self.publish_confirmed,
            DeliveryOutcome::Unroutable => &self.publish_unroutable,
            DeliveryOutcome::Rejected => &self.publish_rejected,
            DeliveryOutcome::TransportError(_) => &self.publish_transport_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.messages_received,
            &self.messages_redelivered,
            &self.messages_acked,
            &self.messages_discarded,
            &self.messages_requeued,
            &self.settlement_failures,
            &self.callbacks_succeeded,
            &self.callbacks_failed,
            &self.callbacks_skipped,
            &self.sessions_opened,
            &self.cycles_failed,
            &self.reconnects,
            &self.publish_attempts,
            &self.publish_confirmed,
            &self.publish_unroutable,
            &self.publish_rejected,
            &self.publish_transport_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.consuming.store(false, Ordering::Relaxed);
        if let Ok(mut times) = self.handling_times.lock() {
            times.clear();
        }
        self.started_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Average and p95 handling time in milliseconds (pure over the sample window)
    fn handling_time_statistics(&self) -> (f64, f64) {
        let Ok(times) = self.handling_times.lock() else {
            return (0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0);
        }
        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 95.0))
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_handling_time_ms, handling_time_p95_ms) = self.handling_time_statistics();

        MetricsSnapshot {
            consumer: ConsumerMetrics {
                consuming: self.consuming.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_redelivered: self.messages_redelivered.load(Ordering::Relaxed),
                messages_acked: self.messages_acked.load(Ordering::Relaxed),
                messages_discarded: self.messages_discarded.load(Ordering::Relaxed),
                messages_requeued: self.messages_requeued.load(Ordering::Relaxed),
                settlement_failures: self.settlement_failures.load(Ordering::Relaxed),
                callbacks_succeeded: self.callbacks_succeeded.load(Ordering::Relaxed),
                callbacks_failed: self.callbacks_failed.load(Ordering::Relaxed),
                callbacks_skipped: self.callbacks_skipped.load(Ordering::Relaxed),
                sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
                cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                avg_handling_time_ms,
                handling_time_p95_ms,
            },
            publisher: PublisherMetrics {
                attempts: self.publish_attempts.load(Ordering::Relaxed),
                confirmed: self.publish_confirmed.load(Ordering::Relaxed),
                unroutable: self.publish_unroutable.load(Ordering::Relaxed),
                rejected: self.publish_rejected.load(Ordering::Relaxed),
                transport_errors: self.publish_transport_errors.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub consumer: ConsumerMetrics,
    pub publisher: PublisherMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerMetrics {
    pub consuming: bool,
    pub messages_received: u64,
    pub messages_redelivered: u64,
    pub messages_acked: u64,
    pub messages_discarded: u64,
    pub messages_requeued: u64,
    pub settlement_failures: u64,
    pub callbacks_succeeded: u64,
    pub callbacks_failed: u64,
    pub callbacks_skipped: u64,
    pub sessions_opened: u64,
    pub cycles_failed: u64,
    pub reconnects: u64,
    pub avg_handling_time_ms: f64,
    pub handling_time_p95_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublisherMetrics {
    pub attempts: u64,
    pub confirmed: u64,
    pub unroutable: u64,
    pub rejected: u64,
    pub transport_errors: u64,
}

fn percentile(sorted_values: &[u64], percentile: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }
    let index = (percentile / 100.0 * (sorted_values.len() - 1) as f64).round() as usize;
    sorted_values[index.min(sorted_values.len() - 1)] as f64
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settlement_counters() {
        let collector = MetricsCollector::new();

        collector.message_received(false);
        collector.message_received(true);
        collector.record_settlement(ProcessingOutcome::Ack, Duration::from_millis(10));
        collector.record_settlement(ProcessingOutcome::NackDiscard, Duration::from_millis(2));
        collector.record_settlement(ProcessingOutcome::NackRequeue, Duration::from_millis(4));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.consumer.messages_received, 2);
        assert_eq!(snapshot.consumer.messages_redelivered, 1);
        assert_eq!(snapshot.consumer.messages_acked, 1);
        assert_eq!(snapshot.consumer.messages_discarded, 1);
        assert_eq!(snapshot.consumer.messages_requeued, 1);
        assert!(snapshot.consumer.avg_handling_time_ms > 0.0);
    }

    #[test]
    fn test_publish_counters() {
        let collector = MetricsCollector::new();

        collector.record_publish_attempt();
        collector.record_publish_outcome(&DeliveryOutcome::Rejected);
        collector.record_publish_attempt();
        collector.record_publish_outcome(&DeliveryOutcome::Confirmed);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.publisher.attempts, 2);
        assert_eq!(snapshot.publisher.rejected, 1);
        assert_eq!(snapshot.publisher.confirmed, 1);
    }

    #[test]
    fn test_session_lifecycle_flags() {
        let collector = MetricsCollector::new();

        collector.session_opened();
        assert!(collector.snapshot().consumer.consuming);

        collector.cycle_failed();
        collector.reconnect_scheduled();
        let snapshot = collector.snapshot();
        assert!(!snapshot.consumer.consuming);
        assert_eq!(snapshot.consumer.cycles_failed, 1);
        assert_eq!(snapshot.consumer.reconnects, 1);
    }

    #[test]
    fn test_reset_clears_counters() {
        let collector = MetricsCollector::new();
        collector.message_received(false);
        collector.record_publish_attempt();

        collector.reset();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.consumer.messages_received, 0);
        assert_eq!(snapshot.publisher.attempts, 0);
    }

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], 50.0), 6.0);
        assert_eq!(percentile(&[7], 95.0), 7.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsCollector::new().snapshot()).unwrap();
        assert!(json["consumer"]["messages_received"].is_u64());
        assert!(json["publisher"]["attempts"].is_u64());
    }
}

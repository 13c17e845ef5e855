//! Observability for the order event pipeline
//!
//! Structured logging with span macros, and process-wide debug counters.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{LogFormat, init_logging, init_logging_with_verbosity};
pub use metrics::{MetricsCollector, MetricsSnapshot, metrics};

// Span macros for structured logging
pub use logging::{broker_span, delivery_span, lifecycle_span, publish_span};

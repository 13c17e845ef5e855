//! Testing utilities and mock implementations
//!
//! Lets the pipeline run end to end without a RabbitMQ broker or the orders
//! service.

pub mod mocks;

pub use mocks::*;

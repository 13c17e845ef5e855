//! Order event wire types
//!
//! The envelope published for every created order, plus the outcome enums
//! that drive publish retries and delivery settlement.

pub mod messages;

pub use messages::*;

//! Infrastructure message broker implementations.
//!
//! The `MessageBroker` abstraction lives in `marketflow-events`. This module
//! provides broker-backed implementations (AMQP).

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;

//! Infrastructure layer: AMQP broker, Redis dedup store and cache, environment config.
//!
//! The broker, dedup-store and cache abstractions live in `marketflow-events` as pure
//! mechanics. This crate provides the networked implementations behind
//! feature flags, plus environment configuration.

pub mod cache;
pub mod config;
pub mod dedup;
pub mod event_bus;
#[cfg(feature = "redis")]
mod redis_link;

pub use config::{BrokerConfig, Config, ConfigError, DedupConfig, RedisConfig};

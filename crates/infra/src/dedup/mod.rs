//! Shared dedup stores.
//!
//! `DedupFilter` in `marketflow-events` works against any `DedupStore`; the
//! Redis-backed store here is what lets several consumer processes agree on
//! which payloads were already seen.

#[cfg(feature = "redis")]
pub mod redis_store;

#[cfg(feature = "redis")]
pub use redis_store::RedisDedupStore;

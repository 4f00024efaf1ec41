//! Shared key/value caches.
//!
//! Services cache carts and product reads through `KeyValueCache` from
//! `marketflow-events`; the Redis implementation lets every instance of a
//! service see the same entries.

#[cfg(feature = "redis")]
pub mod redis_cache;

#[cfg(feature = "redis")]
pub use redis_cache::RedisCache;

//! Redis-backed key/value cache: `GET`, `SET key value PX <ttl>`, `DEL`.

use std::time::Duration;

use tracing::{info, instrument};

use marketflow_events::{CacheError, KeyValueCache};

use crate::config::RedisConfig;
use crate::redis_link::{LinkError, RedisLink, expiry_millis};

#[derive(Debug)]
pub struct RedisCache {
    link: RedisLink,
}

impl From<LinkError> for CacheError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Unavailable(msg) => CacheError::Unavailable(msg),
            LinkError::Command(msg) => CacheError::Command(msg),
        }
    }
}

impl RedisCache {
    pub fn open(config: &RedisConfig) -> Result<Self, CacheError> {
        Ok(Self {
            link: RedisLink::open(config)?,
        })
    }

    /// Open a client and verify reachability with `PING`.
    #[instrument(skip(config), fields(host = %config.host, port = config.port), err)]
    pub fn connect(config: &RedisConfig) -> Result<Self, CacheError> {
        let cache = Self::open(config)?;
        cache.link.ping()?;
        info!("cache connected to redis");
        Ok(cache)
    }
}

impl KeyValueCache for RedisCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .link
            .with_connection(|conn| redis::cmd("GET").arg(key).query(conn))?)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        Ok(self.link.with_connection(|conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(expiry_millis(ttl))
                .query::<()>(conn)
        })?)
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        Ok(self
            .link
            .with_connection(|conn| redis::cmd("DEL").arg(key).query::<()>(conn))?)
    }
}

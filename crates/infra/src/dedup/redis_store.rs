//! Redis-backed dedup store.
//!
//! One `SET key 1 NX PX <ttl>` per message. Connecting and every command are
//! bounded by the configured timeout so an outage surfaces quickly as an error
//! and the filter fails open.

use std::time::Duration;

use tracing::{info, instrument};

use marketflow_events::{DedupStore, DedupStoreError};

use crate::config::RedisConfig;
use crate::redis_link::{LinkError, RedisLink, expiry_millis};

#[derive(Debug)]
pub struct RedisDedupStore {
    link: RedisLink,
}

impl From<LinkError> for DedupStoreError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Unavailable(msg) => DedupStoreError::Unavailable(msg),
            LinkError::Command(msg) => DedupStoreError::Command(msg),
        }
    }
}

impl RedisDedupStore {
    /// Open a client without touching the network.
    pub fn open(config: &RedisConfig) -> Result<Self, DedupStoreError> {
        Ok(Self {
            link: RedisLink::open(config)?,
        })
    }

    /// Open a client and verify reachability with `PING`.
    #[instrument(skip(config), fields(host = %config.host, port = config.port), err)]
    pub fn connect(config: &RedisConfig) -> Result<Self, DedupStoreError> {
        let store = Self::open(config)?;
        store.ping()?;
        info!("connected to redis");
        Ok(store)
    }

    pub fn ping(&self) -> Result<(), DedupStoreError> {
        Ok(self.link.ping()?)
    }
}

impl DedupStore for RedisDedupStore {
    fn set_if_absent_with_expiry(&self, key: &str, ttl: Duration) -> Result<bool, DedupStoreError> {
        // `SET .. NX` replies OK when the key was written and nil when it existed.
        let reply: Option<String> = self.link.with_connection(|conn| {
            redis::cmd("SET")
                .arg(key)
                .arg("1")
                .arg("NX")
                .arg("PX")
                .arg(expiry_millis(ttl))
                .query(conn)
        })?;
        Ok(reply.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_server_reports_unavailable() {
        let config = RedisConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            timeout: Duration::from_millis(100),
        };
        let store = RedisDedupStore::open(&config).unwrap();

        let err = store
            .set_if_absent_with_expiry("dedup:test:00", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, DedupStoreError::Unavailable(_)));
        assert!(RedisDedupStore::connect(&config).is_err());
    }
}

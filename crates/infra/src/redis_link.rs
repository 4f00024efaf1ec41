//! One lazily dialled, reused Redis connection with bounded I/O.
//!
//! Shared by the Redis dedup store and the Redis cache. The connection is
//! dropped after any error and re-dialled on the next command.

use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::config::RedisConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkError {
    /// Connecting or I/O failed; the server may be down.
    Unavailable(String),
    /// The server answered with an error.
    Command(String),
}

pub(crate) struct RedisLink {
    client: redis::Client,
    timeout: Duration,
    connection: Mutex<Option<redis::Connection>>,
}

impl core::fmt::Debug for RedisLink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisLink")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisLink {
    /// Open a client without touching the network.
    pub(crate) fn open(config: &RedisConfig) -> Result<Self, LinkError> {
        let client =
            redis::Client::open(config.url()).map_err(|e| LinkError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            timeout: config.timeout,
            connection: Mutex::new(None),
        })
    }

    pub(crate) fn ping(&self) -> Result<(), LinkError> {
        self.with_connection(|conn| redis::cmd("PING").query::<String>(conn))
            .map(|_| ())
    }

    fn dial(&self) -> Result<redis::Connection, LinkError> {
        let conn = self
            .client
            .get_connection_with_timeout(self.timeout)
            .map_err(|e| LinkError::Unavailable(e.to_string()))?;
        conn.set_read_timeout(Some(self.timeout))
            .and_then(|_| conn.set_write_timeout(Some(self.timeout)))
            .map_err(|e| LinkError::Unavailable(e.to_string()))?;
        Ok(conn)
    }

    pub(crate) fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, LinkError> {
        let mut slot = self
            .connection
            .lock()
            .map_err(|_| LinkError::Unavailable("connection lock poisoned".to_string()))?;

        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.dial()?,
        };

        match f(&mut conn) {
            Ok(value) => {
                *slot = Some(conn);
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "dropping redis connection after error");
                if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() {
                    Err(LinkError::Unavailable(e.to_string()))
                } else {
                    Err(LinkError::Command(e.to_string()))
                }
            }
        }
    }
}

/// Milliseconds for `PX`, at least 1 since Redis rejects a zero expiry.
pub(crate) fn expiry_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

//! Consumer-side duplicate suppression.
//!
//! A dedup record is keyed by `dedup:<event>:<sha256(raw payload)>` and lives in
//! a store shared by every consumer process. Records expire on their own after
//! the retention window and are never deleted explicitly.
//!
//! The fingerprint covers the exact bytes received, so two publishes of the
//! same fact with different timestamps are *not* duplicates; a transport
//! redelivery of the same bytes is.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::warn;

/// Default retention window for dedup records.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DedupStoreError {
    #[error("dedup store unavailable: {0}")]
    Unavailable(String),

    #[error("dedup store command failed: {0}")]
    Command(String),
}

/// Shared store with a single atomic primitive.
///
/// This is the only cross-process synchronisation point of the backbone.
pub trait DedupStore: Send + Sync {
    /// Atomically create `key` with `ttl` unless it already exists.
    ///
    /// Returns `true` when the key was newly set.
    fn set_if_absent_with_expiry(&self, key: &str, ttl: Duration) -> Result<bool, DedupStoreError>;
}

impl<S> DedupStore for Arc<S>
where
    S: DedupStore + ?Sized,
{
    fn set_if_absent_with_expiry(&self, key: &str, ttl: Duration) -> Result<bool, DedupStoreError> {
        (**self).set_if_absent_with_expiry(key, ttl)
    }
}

/// Build the store key for a received payload.
pub fn dedup_key(event: &str, payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    format!("dedup:{}:{:x}", event, digest)
}

/// Fail-open duplicate filter.
#[derive(Clone)]
pub struct DedupFilter {
    store: Arc<dyn DedupStore>,
    ttl: Duration,
}

impl core::fmt::Debug for DedupFilter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DedupFilter").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl DedupFilter {
    /// Filter with the default 24h retention window.
    pub fn new(store: Arc<dyn DedupStore>) -> Self {
        Self::with_ttl(store, DEFAULT_DEDUP_TTL)
    }

    pub fn with_ttl(store: Arc<dyn DedupStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `true` if this exact payload was already seen for `event` within the window.
    ///
    /// Store failures are logged and reported as "not a duplicate".
    pub fn is_duplicate(&self, event: &str, payload: &[u8]) -> bool {
        let key = dedup_key(event, payload);
        match self.store.set_if_absent_with_expiry(&key, self.ttl) {
            Ok(newly_set) => !newly_set,
            Err(err) => {
                warn!(event, error = %err, "dedup check failed; treating message as unique");
                false
            }
        }
    }
}

/// Process-local dedup store for tests/dev.
///
/// Expired records are purged lazily on access. A TTL too large to represent
/// as an `Instant` never expires.
#[derive(Debug, Default)]
pub struct InMemoryDedupStore {
    records: Mutex<HashMap<String, Option<Instant>>>,
}

fn is_live(expires_at: &Option<Instant>, now: Instant) -> bool {
    expires_at.is_none_or(|at| at > now)
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        match self.records.lock() {
            Ok(records) => records.values().filter(|exp| is_live(exp, now)).count(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DedupStore for InMemoryDedupStore {
    fn set_if_absent_with_expiry(&self, key: &str, ttl: Duration) -> Result<bool, DedupStoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| DedupStoreError::Unavailable("store lock poisoned".into()))?;

        let now = Instant::now();
        records.retain(|_, expires_at| is_live(expires_at, now));

        if records.contains_key(key) {
            return Ok(false);
        }
        records.insert(key.to_string(), now.checked_add(ttl));
        Ok(true)
    }
}

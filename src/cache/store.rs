//! Token cache storage keyed by user object identifier.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::claims::user_fingerprint;
use crate::config::CacheConfig;
use crate::error::CacheError;

/// Serialized token cache of one user. Empty means "no cache yet".
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TokenCacheBlob(Vec<u8>);

impl TokenCacheBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Empty-cache sentinel returned for unknown users.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for TokenCacheBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenCacheBlob({} bytes)", self.0.len())
    }
}

/// Process-wide store of per-user token cache blobs.
///
/// Every operation is keyed strictly by user object identifier. `write`
/// replaces the previous blob for that user; there is no merge, so concurrent
/// writes for the same user are last-write-wins.
pub trait TokenCacheStore: Send + Sync {
    /// Blob for `user_id`, or [`TokenCacheBlob::empty`] when there is none.
    fn read(&self, user_id: &str) -> Result<TokenCacheBlob, CacheError>;

    fn write(&self, user_id: &str, blob: &TokenCacheBlob) -> Result<(), CacheError>;

    fn remove(&self, user_id: &str) -> Result<(), CacheError>;
}

#[derive(Debug)]
struct MemoryEntry {
    blob: TokenCacheBlob,
    last_access: DateTime<Utc>,
}

/// In-memory store with an optional sliding lifetime per entry.
#[derive(Debug, Default)]
pub struct MemoryTokenCacheStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    ttl: Option<Duration>,
}

impl MemoryTokenCacheStore {
    /// Create a store whose entries never expire.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose entries expire after `ttl` without access.
    pub fn with_ttl(ttl: StdDuration) -> Self {
        Self {
            entries: Mutex::default(),
            ttl: Duration::from_std(ttl).ok(),
        }
    }

    /// Create a store with the configured lifetime; `ttl_secs = 0` never expires.
    pub fn from_config(config: &CacheConfig) -> Self {
        match config.ttl() {
            Some(ttl) => Self::with_ttl(ttl),
            None => Self::new(),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.purge_expired_at(Utc::now());
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries whose lifetime ran out.
    pub fn purge_expired(&self) {
        self.purge_expired_at(Utc::now());
    }

    fn purge_expired_at(&self, now: DateTime<Utc>) {
        if self.ttl.is_some() {
            self.lock().retain(|_, entry| !self.is_expired(entry, now));
        }
    }

    fn read_at(&self, user_id: &str, now: DateTime<Utc>) -> TokenCacheBlob {
        let mut entries = self.lock();

        let expired = match entries.get_mut(user_id) {
            Some(entry) if !self.is_expired(entry, now) => {
                entry.last_access = now;
                return entry.blob.clone();
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            debug!("Token cache entry for {} expired", user_fingerprint(user_id));
            entries.remove(user_id);
        }
        TokenCacheBlob::empty()
    }

    fn write_at(&self, user_id: &str, blob: &TokenCacheBlob, now: DateTime<Utc>) {
        self.lock().insert(
            user_id.to_string(),
            MemoryEntry {
                blob: blob.clone(),
                last_access: now,
            },
        );
    }

    fn is_expired(&self, entry: &MemoryEntry, now: DateTime<Utc>) -> bool {
        self.ttl
            .map(|ttl| now - entry.last_access >= ttl)
            .unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TokenCacheStore for MemoryTokenCacheStore {
    fn read(&self, user_id: &str) -> Result<TokenCacheBlob, CacheError> {
        Ok(self.read_at(user_id, Utc::now()))
    }

    fn write(&self, user_id: &str, blob: &TokenCacheBlob) -> Result<(), CacheError> {
        self.write_at(user_id, blob, Utc::now());
        Ok(())
    }

    fn remove(&self, user_id: &str) -> Result<(), CacheError> {
        self.lock().remove(user_id);
        Ok(())
    }
}

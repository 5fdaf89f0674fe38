//! The confidential client's per-user multi-token cache.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::store::{TokenCacheBlob, TokenCacheStore};
use crate::claims::user_fingerprint;
use crate::config::RESERVED_SCOPES;
use crate::error::CacheError;
use crate::secure::SecureString;

/// Serialization format version of [`TokenCacheData`].
const CACHE_FORMAT_VERSION: u32 = 1;

/// Account the cached tokens belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAccount {
    /// `uid.utid` from client info, or `oid.tid` when the provider sent none.
    pub home_account_id: String,
    pub object_id: String,
    pub tenant_id: String,
}

/// An access token with the scopes it was granted for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAccessToken {
    pub secret: SecureString,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub cached_at: DateTime<Utc>,
}

impl CachedAccessToken {
    /// Whether this token was granted every non-reserved scope in `requested`.
    pub fn covers(&self, requested: &[String]) -> bool {
        requested
            .iter()
            .filter(|scope| !is_reserved_scope(scope))
            .all(|scope| self.scopes.iter().any(|s| s.eq_ignore_ascii_case(scope)))
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expires_at > now + skew
    }

    fn overlaps(&self, scopes: &[String]) -> bool {
        scopes
            .iter()
            .filter(|scope| !is_reserved_scope(scope))
            .any(|scope| self.scopes.iter().any(|s| s.eq_ignore_ascii_case(scope)))
    }
}

/// Everything cached for one user. Serialized wholesale into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCacheData {
    pub version: u32,
    pub account: Option<CachedAccount>,
    #[serde(default)]
    pub access_tokens: Vec<CachedAccessToken>,
    pub id_token: Option<SecureString>,
    pub refresh_token: Option<SecureString>,
}

impl Default for TokenCacheData {
    fn default() -> Self {
        Self {
            version: CACHE_FORMAT_VERSION,
            account: None,
            access_tokens: Vec::new(),
            id_token: None,
            refresh_token: None,
        }
    }
}

impl TokenCacheData {
    pub fn is_empty(&self) -> bool {
        self.account.is_none() && self.access_tokens.is_empty() && self.refresh_token.is_none()
    }

    /// A cached access token covering `scopes` that is still valid after `skew`.
    pub fn find_access_token(
        &self,
        scopes: &[String],
        now: DateTime<Utc>,
        skew: Duration,
    ) -> Option<&CachedAccessToken> {
        self.access_tokens
            .iter()
            .filter(|token| token.covers(scopes) && token.is_valid_at(now, skew))
            .max_by_key(|token| token.expires_at)
    }

    /// Record a token response. Access tokens sharing a scope with the new one
    /// are replaced; refresh and ID tokens are only replaced when a new one came back.
    pub fn store_tokens(
        &mut self,
        account: CachedAccount,
        access_token: CachedAccessToken,
        id_token: Option<SecureString>,
        refresh_token: Option<SecureString>,
    ) {
        let other_account = self
            .account
            .as_ref()
            .is_some_and(|a| a.home_account_id != account.home_account_id);
        if other_account {
            // Different account behind the same key: nothing old is reusable
            *self = Self::default();
        }

        self.access_tokens
            .retain(|existing| !existing.overlaps(&access_token.scopes));
        self.access_tokens.push(access_token);
        self.account = Some(account);

        if id_token.is_some() {
            self.id_token = id_token;
        }
        if refresh_token.is_some() {
            self.refresh_token = refresh_token;
        }
    }

    fn from_blob(blob: &TokenCacheBlob) -> Result<Self, CacheError> {
        if blob.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(blob.as_bytes())?)
    }

    fn to_blob(&self) -> Result<TokenCacheBlob, CacheError> {
        Ok(TokenCacheBlob::new(serde_json::to_vec(self)?))
    }
}

/// A user's token cache bound to the backing store.
///
/// Loading reads the user's blob (before-access); every change is serialized
/// and written back in full (after-access).
pub struct UserTokenCache {
    user_id: String,
    store: Arc<dyn TokenCacheStore>,
    data: TokenCacheData,
}

impl UserTokenCache {
    pub fn load(store: Arc<dyn TokenCacheStore>, user_id: &str) -> Result<Self, CacheError> {
        let blob = store.read(user_id)?;
        let data = match TokenCacheData::from_blob(&blob) {
            Ok(data) if data.version == CACHE_FORMAT_VERSION => data,
            Ok(data) => {
                warn!(
                    "Token cache format {} for {} is not supported, starting fresh",
                    data.version,
                    user_fingerprint(user_id)
                );
                TokenCacheData::default()
            }
            Err(e) => {
                warn!(
                    "Failed to parse token cache for {}: {}, starting fresh",
                    user_fingerprint(user_id),
                    e
                );
                TokenCacheData::default()
            }
        };

        Ok(Self {
            user_id: user_id.to_string(),
            store,
            data,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn data(&self) -> &TokenCacheData {
        &self.data
    }

    /// Apply `change` and write the whole cache back to the store.
    pub fn update(&mut self, change: impl FnOnce(&mut TokenCacheData)) -> Result<(), CacheError> {
        let mut next = self.data.clone();
        change(&mut next);

        self.store.write(&self.user_id, &next.to_blob()?)?;
        self.data = next;

        debug!("Persisted token cache for {}", user_fingerprint(&self.user_id));
        Ok(())
    }

    /// Forget everything cached for this user.
    pub fn clear(&mut self) -> Result<(), CacheError> {
        self.store.remove(&self.user_id)?;
        self.data = TokenCacheData::default();
        Ok(())
    }
}

impl std::fmt::Debug for UserTokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserTokenCache")
            .field("user", &user_fingerprint(&self.user_id))
            .field("access_tokens", &self.data.access_tokens.len())
            .finish()
    }
}

fn is_reserved_scope(scope: &str) -> bool {
    RESERVED_SCOPES.iter().any(|r| r.eq_ignore_ascii_case(scope)) || scope == "email"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryTokenCacheStore;

    fn scopes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn token(secret: &str, granted: &[&str], lifetime_secs: i64) -> CachedAccessToken {
        let now = Utc::now();
        CachedAccessToken {
            secret: SecureString::new(secret),
            scopes: scopes(granted),
            expires_at: now + Duration::seconds(lifetime_secs),
            cached_at: now,
        }
    }

    fn account(id: &str) -> CachedAccount {
        CachedAccount {
            home_account_id: format!("{}.tenant", id),
            object_id: id.into(),
            tenant_id: "tenant".into(),
        }
    }

    #[test]
    fn test_load_missing_is_fresh_cache() {
        let store = Arc::new(MemoryTokenCacheStore::new());
        let cache = UserTokenCache::load(store.clone(), "u1").unwrap();
        assert!(cache.data().is_empty());
        // Loading alone never writes
        assert!(store.read("u1").unwrap().is_empty());
    }

    #[test]
    fn test_update_persists_whole_cache() {
        let store: Arc<dyn TokenCacheStore> = Arc::new(MemoryTokenCacheStore::new());
        let mut cache = UserTokenCache::load(store.clone(), "u1").unwrap();

        cache
            .update(|data| {
                data.store_tokens(
                    account("u1"),
                    token("at-1", &["User.Read"], 3600),
                    Some(SecureString::new("id-1")),
                    Some(SecureString::new("rt-1")),
                )
            })
            .unwrap();

        let reloaded = UserTokenCache::load(store, "u1").unwrap();
        let data = reloaded.data();
        assert_eq!(data.access_tokens.len(), 1);
        assert_eq!(data.refresh_token.as_ref().unwrap().expose(), "rt-1");
        assert_eq!(data.account, Some(account("u1")));
    }

    #[test]
    fn test_corrupt_blob_starts_fresh() {
        let store: Arc<dyn TokenCacheStore> = Arc::new(MemoryTokenCacheStore::new());
        store.write("u1", &TokenCacheBlob::new(b"not json".to_vec())).unwrap();

        let cache = UserTokenCache::load(store, "u1").unwrap();
        assert!(cache.data().is_empty());
    }

    #[test]
    fn test_store_tokens_replaces_overlapping_scopes() {
        let mut data = TokenCacheData::default();
        data.store_tokens(account("u1"), token("a", &["User.Read"], 3600), None, None);
        data.store_tokens(account("u1"), token("b", &["Mail.Read"], 3600), None, None);
        data.store_tokens(
            account("u1"),
            token("c", &["user.read", "Group.Read.All"], 3600),
            None,
            Some(SecureString::new("rt")),
        );

        let secrets: Vec<&str> = data.access_tokens.iter().map(|t| t.secret.expose()).collect();
        assert_eq!(secrets, vec!["b", "c"]);
        assert!(data.refresh_token.is_some());

        // No refresh token in the next response keeps the old one
        data.store_tokens(account("u1"), token("d", &["Mail.Read"], 3600), None, None);
        assert_eq!(data.refresh_token.as_ref().unwrap().expose(), "rt");
    }

    #[test]
    fn test_store_tokens_for_other_account_resets() {
        let mut data = TokenCacheData::default();
        data.store_tokens(
            account("u1"),
            token("a", &["User.Read"], 3600),
            None,
            Some(SecureString::new("rt")),
        );
        data.store_tokens(account("u2"), token("b", &["Mail.Read"], 3600), None, None);

        assert_eq!(data.access_tokens.len(), 1);
        assert!(data.refresh_token.is_none());
    }

    #[test]
    fn test_find_access_token() {
        let mut data = TokenCacheData::default();
        let fresh = token("fresh", &["User.Read", "Group.Read.All"], 3600);
        data.store_tokens(account("u1"), fresh, None, None);
        data.store_tokens(account("u1"), token("stale", &["Mail.Read"], 60), None, None);

        let now = Utc::now();
        let skew = Duration::minutes(5);

        let found = data.find_access_token(&scopes(&["openid", "user.read"]), now, skew);
        assert_eq!(found.map(|t| t.secret.expose()), Some("fresh"));

        // Expires inside the skew window
        assert!(data.find_access_token(&scopes(&["Mail.Read"]), now, skew).is_none());
        assert!(data.find_access_token(&scopes(&["Files.Read"]), now, skew).is_none());
    }
}

//! Code-for-token exchange bound to one user's token cache.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::cache::{CachedAccessToken, CachedAccount, TokenCacheStore, UserTokenCache};
use crate::claims::{user_fingerprint, PrincipalClaims};
use crate::client::{CodeRedemption, ConfidentialClient, TokenResponse};
use crate::error::{AuthError, CacheError, ExchangeFailure};
use crate::secure::SecureString;

/// Cached access tokens expiring sooner than this are not handed out.
const TOKEN_EXPIRY_SKEW_SECS: i64 = 300;

/// Error code for a silent call with no cached account.
pub const NO_ACCOUNT_ERROR: &str = "user_null";

/// Tokens produced by a successful code exchange.
#[derive(Debug, Clone)]
pub struct ExchangeResult {
    pub access_token: SecureString,
    pub id_token: SecureString,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    /// The principal signed in with a personal Microsoft account.
    pub is_personal_account: bool,
}

/// Inputs of one code exchange.
#[derive(Debug, Clone)]
pub struct ExchangeRequest<'a> {
    pub code: &'a str,
    pub redirect_uri: &'a str,
    pub scopes: &'a [String],
    pub principal: &'a PrincipalClaims,
}

/// Wraps a [`ConfidentialClient`] around one user's token cache.
///
/// Tokens acquired through the exchanger are written back to the store
/// before the call returns.
pub struct ConfidentialClientExchanger {
    client: Arc<dyn ConfidentialClient>,
    cache: UserTokenCache,
}

impl ConfidentialClientExchanger {
    /// Bind to the token cache of `user_id`.
    pub fn for_user(
        client: Arc<dyn ConfidentialClient>,
        store: Arc<dyn TokenCacheStore>,
        user_id: &str,
    ) -> Result<Self, CacheError> {
        let cache = UserTokenCache::load(store, user_id)?;
        Ok(Self { client, cache })
    }

    pub fn user_id(&self) -> &str {
        self.cache.user_id()
    }

    pub fn cache(&self) -> &UserTokenCache {
        &self.cache
    }

    /// Redeem an authorization code. Exactly one token endpoint call, no retry.
    pub async fn exchange(
        &mut self,
        request: ExchangeRequest<'_>,
    ) -> Result<ExchangeResult, ExchangeFailure> {
        if request.principal.object_id != self.cache.user_id() {
            return Err(ExchangeFailure::AccountMismatch);
        }

        debug!(
            "Exchanging authorization code for {}",
            user_fingerprint(self.cache.user_id())
        );

        let response = self
            .client
            .acquire_by_code(&CodeRedemption {
                code: request.code,
                redirect_uri: request.redirect_uri,
                scopes: request.scopes,
            })
            .await?;

        let id_token = response
            .id_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ExchangeFailure::MalformedResponse("missing id_token".to_string()))?;

        let access_token = self.record(&response, request.scopes, request.principal)?;

        info!(
            "Token cache updated for {} ({} scopes)",
            user_fingerprint(self.cache.user_id()),
            access_token.scopes.len()
        );

        Ok(ExchangeResult {
            access_token: access_token.secret,
            id_token,
            expires_at: access_token.expires_at,
            scopes: access_token.scopes,
            is_personal_account: request.principal.is_personal_account(),
        })
    }

    /// Access token for `scopes` without user interaction.
    ///
    /// Serves an unexpired cached token when one covers the scopes; otherwise
    /// redeems the cached refresh token once. Fails with
    /// [`AuthError::SilentAcquisition`] when the user has to sign in or consent again.
    pub async fn acquire_token_silent(
        &mut self,
        scopes: &[String],
    ) -> Result<CachedAccessToken, AuthError> {
        let now = Utc::now();
        let skew = Duration::seconds(TOKEN_EXPIRY_SKEW_SECS);

        if let Some(token) = self.cache.data().find_access_token(scopes, now, skew) {
            debug!("Serving cached access token");
            return Ok(token.clone());
        }

        let data = self.cache.data();
        let (account, refresh_token) = match (&data.account, &data.refresh_token) {
            (Some(account), Some(refresh_token)) => (account.clone(), refresh_token.clone()),
            _ => {
                return Err(AuthError::SilentAcquisition {
                    code: NO_ACCOUNT_ERROR.to_string(),
                    message: "No cached account found; the user must sign in".to_string(),
                })
            }
        };

        let response = match self
            .client
            .acquire_by_refresh_token(&refresh_token, scopes)
            .await
        {
            Ok(response) => response,
            Err(ExchangeFailure::Provider { error, .. }) => {
                return Err(AuthError::SilentAcquisition {
                    message: error.to_string(),
                    code: error.error,
                })
            }
            Err(other) => return Err(AuthError::Exchange(other)),
        };

        let principal = PrincipalClaims::new(account.object_id, account.tenant_id);
        let token = self.record(&response, scopes, &principal)?;
        Ok(token)
    }

    /// Drop everything cached for this user.
    pub fn sign_out(&mut self) -> Result<(), CacheError> {
        info!("Clearing token cache for {}", user_fingerprint(self.cache.user_id()));
        self.cache.clear()
    }

    fn record(
        &mut self,
        response: &TokenResponse,
        requested: &[String],
        principal: &PrincipalClaims,
    ) -> Result<CachedAccessToken, CacheError> {
        let now = Utc::now();
        let expires_in = i64::try_from(response.expires_in).unwrap_or(i64::MAX);
        let access_token = CachedAccessToken {
            secret: response.access_token.clone(),
            scopes: response.granted_scopes(requested),
            expires_at: now + Duration::seconds(expires_in.min(i64::from(u32::MAX))),
            cached_at: now,
        };

        let account = CachedAccount {
            home_account_id: response
                .client_info()
                .map(|info| info.home_account_id())
                .unwrap_or_else(|| principal.home_account_id()),
            object_id: principal.object_id.clone(),
            tenant_id: principal.tenant_id.clone(),
        };

        let cached = access_token.clone();
        self.cache.update(|data| {
            data.store_tokens(
                account,
                access_token,
                response.id_token.clone(),
                response.refresh_token.clone(),
            )
        })?;

        Ok(cached)
    }
}

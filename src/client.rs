//! Confidential OAuth2 client for the Azure AD v2.0 token endpoint.
//!
//! [`ConfidentialClient`] is the seam to the identity provider: one call per
//! grant, one network round trip per call, no retries. [`HttpConfidentialClient`]
//! is the reqwest implementation; tests and other ecosystems plug in their own.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::config::{AzureAdOptions, HttpConfig, RESERVED_SCOPES};
use crate::error::{ExchangeFailure, ProviderError};
use crate::secure::SecureString;

/// Code redemption request.
#[derive(Debug, Clone)]
pub struct CodeRedemption<'a> {
    pub code: &'a str,
    pub redirect_uri: &'a str,
    pub scopes: &'a [String],
}

/// Token response from Azure AD.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: SecureString,
    #[serde(default)]
    pub token_type: String,
    pub expires_in: u64,
    #[serde(default)]
    pub refresh_token: Option<SecureString>,
    #[serde(default)]
    pub id_token: Option<SecureString>,
    #[serde(default)]
    pub scope: String,
    /// Base64url JSON with the account's `uid` and `utid`.
    #[serde(default)]
    pub client_info: Option<String>,
}

impl TokenResponse {
    /// Granted scopes; falls back to `requested` when the provider echoed none.
    pub fn granted_scopes(&self, requested: &[String]) -> Vec<String> {
        let granted: Vec<String> = self.scope.split_whitespace().map(str::to_string).collect();
        if granted.is_empty() {
            requested.to_vec()
        } else {
            granted
        }
    }

    /// Decoded `client_info`, when present and well formed.
    pub fn client_info(&self) -> Option<ClientInfo> {
        let raw = self.client_info.as_deref()?;
        let bytes = URL_SAFE_NO_PAD.decode(raw.trim_end_matches('=')).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

/// Account identifiers the provider returns alongside tokens.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientInfo {
    pub uid: String,
    pub utid: String,
}

impl ClientInfo {
    pub fn home_account_id(&self) -> String {
        format!("{}.{}", self.uid, self.utid)
    }
}

/// Provider-side grants used by the exchanger.
#[async_trait]
pub trait ConfidentialClient: Send + Sync {
    /// Redeem an authorization code.
    async fn acquire_by_code(
        &self,
        request: &CodeRedemption<'_>,
    ) -> Result<TokenResponse, ExchangeFailure>;

    /// Redeem a refresh token for `scopes`.
    async fn acquire_by_refresh_token(
        &self,
        refresh_token: &SecureString,
        scopes: &[String],
    ) -> Result<TokenResponse, ExchangeFailure>;
}

/// Confidential client that posts form-encoded grants to the token endpoint.
pub struct HttpConfidentialClient {
    client_id: String,
    client_secret: SecureString,
    token_endpoint: String,
    http_client: reqwest::Client,
}

impl HttpConfidentialClient {
    /// Create a new client from the app registration.
    pub fn new(options: &AzureAdOptions, http: &HttpConfig) -> Result<Self, ExchangeFailure> {
        Self::with_token_endpoint(options, http, options.token_endpoint())
    }

    /// Create a client that talks to a specific token endpoint.
    pub fn with_token_endpoint(
        options: &AzureAdOptions,
        http: &HttpConfig,
        token_endpoint: impl Into<String>,
    ) -> Result<Self, ExchangeFailure> {
        let http_client = reqwest::Client::builder()
            .timeout(http.timeout())
            .connect_timeout(http.connect_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ExchangeFailure::Network(e.to_string()))?;

        Ok(Self {
            client_id: options.client_id.clone(),
            client_secret: SecureString::new(options.client_secret.clone()),
            token_endpoint: token_endpoint.into(),
            http_client,
        })
    }

    async fn post_grant(&self, params: &[(&str, &str)]) -> Result<TokenResponse, ExchangeFailure> {
        let mut form = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose()),
            // Ask for uid/utid so the cache can key the home account
            ("client_info", "1"),
        ];
        form.extend_from_slice(params);

        let response = self
            .http_client
            .post(&self.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(transport_failure)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ProviderError>(&body) {
                Ok(error) => {
                    // Provider error codes and trace ids are safe to log
                    error!(
                        "Token endpoint rejected grant: HTTP {} - {} (trace {})",
                        status,
                        error.error,
                        error.trace_id.as_deref().unwrap_or("-")
                    );
                    ExchangeFailure::Provider {
                        status: status.as_u16(),
                        error,
                    }
                }
                Err(_) => {
                    error!("Token endpoint failed: HTTP {}", status);
                    ExchangeFailure::Status(status.as_u16())
                }
            });
        }

        let bytes = response.bytes().await.map_err(transport_failure)?;
        let token_response: TokenResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ExchangeFailure::MalformedResponse(e.to_string()))?;

        if token_response.access_token.is_empty() {
            return Err(ExchangeFailure::MalformedResponse(
                "empty access_token".to_string(),
            ));
        }

        Ok(token_response)
    }
}

#[async_trait]
impl ConfidentialClient for HttpConfidentialClient {
    async fn acquire_by_code(
        &self,
        request: &CodeRedemption<'_>,
    ) -> Result<TokenResponse, ExchangeFailure> {
        let scope = request_scope(request.scopes);
        debug!("Redeeming authorization code for scopes: {}", scope);

        let response = self
            .post_grant(&[
                ("grant_type", "authorization_code"),
                ("code", request.code),
                ("redirect_uri", request.redirect_uri),
                ("scope", scope.as_str()),
            ])
            .await?;

        info!("Authorization code redeemed, token expires in {}s", response.expires_in);
        Ok(response)
    }

    async fn acquire_by_refresh_token(
        &self,
        refresh_token: &SecureString,
        scopes: &[String],
    ) -> Result<TokenResponse, ExchangeFailure> {
        let scope = request_scope(scopes);
        debug!("Redeeming refresh token for scopes: {}", scope);

        let response = self
            .post_grant(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose()),
                ("scope", scope.as_str()),
            ])
            .await?;

        info!("Refresh token redeemed, token expires in {}s", response.expires_in);
        Ok(response)
    }
}

/// Requested scopes plus the reserved OpenID scopes, space separated.
fn request_scope(scopes: &[String]) -> String {
    let mut all: Vec<&str> = scopes.iter().map(String::as_str).collect();
    for reserved in RESERVED_SCOPES {
        if !all.iter().any(|s| s.eq_ignore_ascii_case(reserved)) {
            all.push(reserved);
        }
    }
    all.join(" ")
}

fn transport_failure(e: reqwest::Error) -> ExchangeFailure {
    if e.is_timeout() {
        error!("Token endpoint request timed out");
        ExchangeFailure::Timeout
    } else {
        error!("Token endpoint request failed: {}", e);
        ExchangeFailure::Network(e.to_string())
    }
}

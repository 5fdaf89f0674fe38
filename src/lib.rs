//! Sign-in core for the group manager web app.
//!
//! Handles the server side of the Azure AD OpenID Connect authorization-code
//! flow for a multitenant, confidential web application:
//!
//! - redeem the authorization code for tokens and persist them in a per-user
//!   token cache ([`exchange`], [`cache`])
//! - turn authentication failures into redirects ([`classify`])
//! - drive the callback handshake ([`pipeline`])
//! - buffer PII-free diagnostics for support pages ([`diagnostics`])
//!
//! Tokens can also be kept on disk with
//! [`FileTokenCacheStore::in_default_location`].
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use groupmanager_auth::{
//!     Config, DiagnosticsLog, HttpConfidentialClient, MemoryTokenCacheStore, OidcEventPipeline,
//! };
//!
//! let config = Config::load()?;
//! let diagnostics = DiagnosticsLog::with_max_lines(config.diagnostics.max_lines);
//! groupmanager_auth::telemetry::init_logging(Some(diagnostics.clone()))?;
//!
//! let client = HttpConfidentialClient::new(&config.azure_ad, &config.http)?;
//! let pipeline = OidcEventPipeline::new(
//!     Arc::new(config.azure_ad.clone()),
//!     Arc::new(client),
//!     Arc::new(MemoryTokenCacheStore::from_config(&config.cache)),
//!     config.issuer_validator(),
//!     diagnostics,
//! );
//! # let _ = pipeline;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]

pub mod cache;
pub mod claims;
pub mod classify;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod exchange;
pub mod issuer;
pub mod pipeline;
pub mod secure;
pub mod telemetry;

pub use cache::{FileTokenCacheStore, MemoryTokenCacheStore, TokenCacheBlob, TokenCacheStore};
pub use claims::{ClaimMap, ClaimsPrincipal, PrincipalClaims};
pub use classify::{AuthErrorClassifier, ClassifiedFailure, FailureKind};
pub use client::{ConfidentialClient, HttpConfidentialClient, TokenResponse};
pub use config::{AzureAdOptions, Config};
pub use diagnostics::DiagnosticsLog;
pub use error::{AuthError, CacheError, ExchangeFailure, ProviderError};
pub use exchange::{ConfidentialClientExchanger, ExchangeRequest, ExchangeResult};
pub use issuer::{AnyTenant, IssuerValidator, TenantAllowList};
pub use pipeline::{
    AuthenticationOutcome, AuthenticationTicket, CodeReceivedContext, Handshake, HandshakeState,
    HttpRedirect, NoopTicketHook, OidcEventPipeline, TicketHook,
};
pub use secure::SecureString;

//! OpenID Connect sign-in event pipeline.
//!
//! The framework adapter creates one [`Handshake`] per login callback and
//! invokes its transitions at the matching points of the protocol:
//!
//! - [`Handshake::on_authorization_code_received`] redeems the code and
//!   produces the [`AuthenticationTicket`] with tokens attached.
//! - [`Handshake::on_ticket_received`] runs the [`TicketHook`] for user
//!   provisioning and completes the sign-in.
//! - [`Handshake::on_authentication_failed`] classifies any failure and
//!   returns the redirect to issue. The failure is always marked handled.
//!
//! [`Handshake::complete`] drives all three and always ends in
//! [`HandshakeState::Authenticated`] or [`HandshakeState::Redirected`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn, Level};
use uuid::Uuid;

use crate::cache::TokenCacheStore;
use crate::claims::{ClaimMap, ClaimsPrincipal, PrincipalClaims};
use crate::classify::AuthErrorClassifier;
use crate::client::ConfidentialClient;
use crate::config::AzureAdOptions;
use crate::diagnostics::{with_correlation_id, with_correlation_id_sync, DiagnosticsLog};
use crate::error::AuthError;
use crate::exchange::{ConfidentialClientExchanger, ExchangeRequest};
use crate::issuer::IssuerValidator;
use crate::secure::SecureString;

/// Protocol message data available when the authorization code arrives.
#[derive(Debug, Clone)]
pub struct CodeReceivedContext {
    pub code: SecureString,
    pub principal: ClaimsPrincipal,
}

/// Completed sign-in, handed back to the framework to issue its cookie.
#[derive(Debug, Clone)]
pub struct AuthenticationTicket {
    pub claims: PrincipalClaims,
    pub access_token: SecureString,
    pub id_token: SecureString,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub is_personal_account: bool,
    /// Key under which downstream calls find the user's cached tokens.
    pub cache_key: String,
}

/// Redirect to issue instead of rethrowing the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRedirect {
    pub location: String,
    /// The failure is consumed here and must not propagate further.
    pub handled: bool,
}

impl HttpRedirect {
    pub const STATUS: u16 = 302;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingCode,
    /// Tokens acquired; the ticket hook has not completed yet.
    CodeRedeemed,
    Authenticated,
    Redirected { location: String },
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Redirected { .. })
    }
}

#[derive(Debug, Clone)]
pub enum AuthenticationOutcome {
    Authenticated(AuthenticationTicket),
    Redirected(HttpRedirect),
}

/// Extension point run once a ticket exists, e.g. to provision the user.
#[async_trait]
pub trait TicketHook: Send + Sync {
    async fn on_ticket_received(&self, _ticket: &AuthenticationTicket) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Default hook: completes immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTicketHook;

impl TicketHook for NoopTicketHook {}

/// Shared, per-process collaborators of the sign-in handshake.
pub struct OidcEventPipeline {
    options: Arc<AzureAdOptions>,
    client: Arc<dyn ConfidentialClient>,
    store: Arc<dyn TokenCacheStore>,
    issuer_validator: Arc<dyn IssuerValidator>,
    diagnostics: DiagnosticsLog,
    claim_map: ClaimMap,
    classifier: AuthErrorClassifier,
    ticket_hook: Arc<dyn TicketHook>,
}

impl OidcEventPipeline {
    pub fn new(
        options: Arc<AzureAdOptions>,
        client: Arc<dyn ConfidentialClient>,
        store: Arc<dyn TokenCacheStore>,
        issuer_validator: Arc<dyn IssuerValidator>,
        diagnostics: DiagnosticsLog,
    ) -> Self {
        Self {
            options,
            client,
            store,
            issuer_validator,
            diagnostics,
            claim_map: ClaimMap::azure_ad(),
            classifier: AuthErrorClassifier::new(),
            ticket_hook: Arc::new(NoopTicketHook),
        }
    }

    pub fn with_claim_map(mut self, claim_map: ClaimMap) -> Self {
        self.claim_map = claim_map;
        self
    }

    pub fn with_ticket_hook(mut self, hook: Arc<dyn TicketHook>) -> Self {
        self.ticket_hook = hook;
        self
    }

    pub fn diagnostics(&self) -> &DiagnosticsLog {
        &self.diagnostics
    }

    /// Start a handshake for one login callback.
    pub fn begin_handshake(&self) -> Handshake<'_> {
        Handshake {
            pipeline: self,
            correlation_id: Uuid::new_v4(),
            state: HandshakeState::AwaitingCode,
        }
    }

    /// Exchanger for a user's cached tokens, for downstream API calls.
    pub fn exchanger_for(&self, user_id: &str) -> Result<ConfidentialClientExchanger, AuthError> {
        Ok(ConfidentialClientExchanger::for_user(
            Arc::clone(&self.client),
            Arc::clone(&self.store),
            user_id,
        )?)
    }
}

/// State of one login handshake.
pub struct Handshake<'a> {
    pipeline: &'a OidcEventPipeline,
    correlation_id: Uuid,
    state: HandshakeState,
}

impl Handshake<'_> {
    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Redeem the authorization code for the signed-in principal.
    pub async fn on_authorization_code_received(
        &mut self,
        context: CodeReceivedContext,
    ) -> Result<AuthenticationTicket, AuthError> {
        if self.state != HandshakeState::AwaitingCode {
            return Err(AuthError::InvalidState("authorization code already handled"));
        }

        let correlation_id = self.correlation_id.to_string();
        let ticket = with_correlation_id(correlation_id, self.redeem(context)).await?;
        self.state = HandshakeState::CodeRedeemed;
        Ok(ticket)
    }

    async fn redeem(&self, context: CodeReceivedContext) -> Result<AuthenticationTicket, AuthError> {
        let pipeline = self.pipeline;
        let diagnostics = &pipeline.diagnostics;

        let claims = pipeline.claim_map.extract(&context.principal)?;
        pipeline.issuer_validator.validate(&claims)?;
        diagnostics.log(
            Level::INFO,
            &format!("Authorization code received for tenant {}", claims.tenant_id),
            true,
        );

        let redirect_uri = pipeline.options.redirect_uri();
        let scopes = pipeline.options.graph_scopes();

        let mut exchanger = pipeline.exchanger_for(&claims.object_id)?;
        diagnostics.log(Level::INFO, "Redeeming authorization code", false);

        let result = exchanger
            .exchange(ExchangeRequest {
                code: context.code.expose(),
                redirect_uri: &redirect_uri,
                scopes: &scopes,
                principal: &claims,
            })
            .await?;

        diagnostics.log(
            Level::INFO,
            &format!("Token acquired for scopes: {}", result.scopes.join(" ")),
            false,
        );

        if result.is_personal_account {
            // Directory operations are unavailable to personal accounts
            info!("Personal Microsoft account signed in for {}", claims.fingerprint());
        }

        Ok(AuthenticationTicket {
            cache_key: claims.object_id.clone(),
            claims,
            access_token: result.access_token,
            id_token: result.id_token,
            expires_at: result.expires_at,
            scopes: result.scopes,
            is_personal_account: result.is_personal_account,
        })
    }

    /// Post-authentication extension point. Completes the sign-in when the hook succeeds.
    pub async fn on_ticket_received(
        &mut self,
        ticket: &AuthenticationTicket,
    ) -> Result<(), AuthError> {
        if self.state != HandshakeState::CodeRedeemed {
            return Err(AuthError::InvalidState("no redeemed code awaiting its ticket"));
        }

        let hook = Arc::clone(&self.pipeline.ticket_hook);
        with_correlation_id(self.correlation_id.to_string(), hook.on_ticket_received(ticket))
            .await?;
        self.state = HandshakeState::Authenticated;
        Ok(())
    }

    /// Classify `error` and produce the redirect. The failure is marked handled.
    ///
    /// Fails with [`AuthError::InvalidState`] once the handshake has finished.
    pub fn on_authentication_failed(
        &mut self,
        error: &AuthError,
    ) -> Result<HttpRedirect, AuthError> {
        if self.state.is_terminal() {
            return Err(AuthError::InvalidState("handshake already finished"));
        }
        Ok(self.redirect(error))
    }

    fn redirect(&mut self, error: &AuthError) -> HttpRedirect {
        let pipeline = self.pipeline;

        with_correlation_id_sync(self.correlation_id.to_string(), || {
            let failure = pipeline.classifier.classify(error);
            let location = failure.redirect_location();

            // Error messages can name the user or tenant
            warn!(
                pii = true,
                "Sign-in failed ({}), redirecting to {}: {}",
                failure.kind,
                location,
                failure.message
            );
            pipeline.diagnostics.log(
                Level::WARN,
                &format!("Authentication failed ({}): {}", failure.kind, error.label()),
                false,
            );

            self.state = HandshakeState::Redirected {
                location: location.clone(),
            };

            HttpRedirect {
                location,
                handled: true,
            }
        })
    }

    /// Run the whole handshake; failures end in a redirect, never an error.
    pub async fn complete(mut self, context: CodeReceivedContext) -> AuthenticationOutcome {
        let result = match self.on_authorization_code_received(context).await {
            Ok(ticket) => self.on_ticket_received(&ticket).await.map(|()| ticket),
            Err(e) => Err(e),
        };

        match result {
            Ok(ticket) => AuthenticationOutcome::Authenticated(ticket),
            Err(e) => AuthenticationOutcome::Redirected(self.redirect(&e)),
        }
    }
}

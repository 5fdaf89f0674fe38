//! Issuer validation for multitenant sign-in.
//!
//! Per-issuer strict validation is off at the protocol layer because any
//! tenant can issue tokens for a multitenant app. The policy lives here
//! instead and runs before the authorization code is redeemed.

use std::collections::HashSet;

use tracing::warn;

use crate::claims::PrincipalClaims;
use crate::error::AuthError;

/// Decides whether a signed-in principal's tenant is accepted.
pub trait IssuerValidator: Send + Sync {
    fn validate(&self, claims: &PrincipalClaims) -> Result<(), AuthError>;
}

/// Accepts only the listed tenant ids (case-insensitive).
#[derive(Debug, Clone, Default)]
pub struct TenantAllowList {
    tenants: HashSet<String>,
}

impl TenantAllowList {
    pub fn new<I, S>(tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tenants: tenants
                .into_iter()
                .map(|t| t.as_ref().trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }
}

impl IssuerValidator for TenantAllowList {
    fn validate(&self, claims: &PrincipalClaims) -> Result<(), AuthError> {
        if self.tenants.contains(&claims.tenant_id.to_ascii_lowercase()) {
            Ok(())
        } else {
            warn!("Rejected sign-in from tenant outside the allow-list");
            Err(AuthError::IssuerRejected(claims.tenant_id.clone()))
        }
    }
}

/// Accepts every tenant. Must be chosen explicitly.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyTenant;

impl IssuerValidator for AnyTenant {
    fn validate(&self, _claims: &PrincipalClaims) -> Result<(), AuthError> {
        Ok(())
    }
}

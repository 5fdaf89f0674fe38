//! Typed extraction of the identity claims the sign-in core needs.
//!
//! The framework adapter hands over the signed-in principal as a bag of
//! claim name/value pairs. [`ClaimMap`] is the mapping table from claim names
//! to [`PrincipalClaims`] fields; it is validated once when it is built, so
//! per-request extraction only looks values up.
//!
//! | Field       | Claim names (first match wins)                                     |
//! |-------------|--------------------------------------------------------------------|
//! | `object_id` | `http://schemas.microsoft.com/identity/claims/objectidentifier`, `oid` |
//! | `tenant_id` | `http://schemas.microsoft.com/identity/claims/tenantid`, `tid`        |

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

use crate::error::AuthError;

/// Object identifier claim type as issued through the framework's claim mapping.
pub const OBJECT_ID_CLAIM: &str = "http://schemas.microsoft.com/identity/claims/objectidentifier";

/// Tenant identifier claim type as issued through the framework's claim mapping.
pub const TENANT_ID_CLAIM: &str = "http://schemas.microsoft.com/identity/claims/tenantid";

/// Tenant of personal Microsoft accounts (MSA).
pub const MSA_TENANT_ID: &str = "9188040d-6c67-4c5b-b112-36a304b66dad";

static AZURE_AD_CLAIM_MAP: Lazy<ClaimMap> = Lazy::new(|| ClaimMap {
    object_id: vec![OBJECT_ID_CLAIM.to_string(), "oid".to_string()],
    tenant_id: vec![TENANT_ID_CLAIM.to_string(), "tid".to_string()],
});

/// Claims of the signed-in principal as supplied by the framework.
#[derive(Debug, Clone, Default)]
pub struct ClaimsPrincipal {
    claims: Vec<(String, String)>,
}

impl ClaimsPrincipal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_claim(name, value);
        self
    }

    pub fn add_claim(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.claims.push((name.into(), value.into()));
    }

    /// First value of the named claim.
    pub fn find_first(&self, name: &str) -> Option<&str> {
        self.claims
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for ClaimsPrincipal {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            claims: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

/// Identity claims used by the sign-in core. Request scoped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalClaims {
    /// Stable per-user key; also the token cache key.
    pub object_id: String,
    pub tenant_id: String,
}

impl PrincipalClaims {
    pub fn new(object_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            tenant_id: tenant_id.into(),
        }
    }

    /// Whether the user signed in with a personal Microsoft account.
    pub fn is_personal_account(&self) -> bool {
        self.tenant_id.eq_ignore_ascii_case(MSA_TENANT_ID)
    }

    /// Account identifier in `oid.tid` form.
    pub fn home_account_id(&self) -> String {
        format!("{}.{}", self.object_id, self.tenant_id)
    }

    /// Short non-reversible tag for log lines.
    pub fn fingerprint(&self) -> String {
        user_fingerprint(&self.object_id)
    }
}

/// Short SHA-256 based tag for a user identifier, safe to log.
pub fn user_fingerprint(user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    digest[..6].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Mapping table from claim names to [`PrincipalClaims`] fields.
#[derive(Debug, Clone)]
pub struct ClaimMap {
    object_id: Vec<String>,
    tenant_id: Vec<String>,
}

impl ClaimMap {
    /// Build and validate a custom mapping. Names are tried in order.
    pub fn new(object_id: Vec<String>, tenant_id: Vec<String>) -> Result<Self> {
        if object_id.is_empty() || tenant_id.is_empty() {
            bail!("Claim map must name at least one claim for each field");
        }
        if object_id.iter().chain(&tenant_id).any(|n| n.trim().is_empty()) {
            bail!("Claim map contains an empty claim name");
        }
        if let Some(shared) = object_id.iter().find(|n| tenant_id.contains(n)) {
            bail!("Claim {} is mapped to both object_id and tenant_id", shared);
        }
        Ok(Self {
            object_id,
            tenant_id,
        })
    }

    /// The mapping used for Azure AD v2.0 tokens.
    pub fn azure_ad() -> Self {
        AZURE_AD_CLAIM_MAP.clone()
    }

    pub fn extract(&self, principal: &ClaimsPrincipal) -> Result<PrincipalClaims, AuthError> {
        let object_id =
            lookup(principal, &self.object_id).ok_or(AuthError::MissingClaim("object_id"))?;
        let tenant_id =
            lookup(principal, &self.tenant_id).ok_or(AuthError::MissingClaim("tenant_id"))?;
        Ok(PrincipalClaims::new(object_id, tenant_id))
    }
}

impl Default for ClaimMap {
    fn default() -> Self {
        Self::azure_ad()
    }
}

fn lookup<'a>(principal: &'a ClaimsPrincipal, names: &[String]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|name| principal.find_first(name))
        .map(str::trim)
        .find(|value| !value.is_empty())
}

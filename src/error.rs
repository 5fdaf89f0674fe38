//! Error types for the sign-in core.
//!
//! Uses `thiserror` for library-style errors with automatic `Display` and `Error` implementations.

use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Top-level authentication error, the input to failure classification.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Token exchange failed: {0}")]
    Exchange(#[from] ExchangeFailure),

    #[error("{message}")]
    ProviderService { code: String, message: String },

    #[error("{message}")]
    SilentAcquisition { code: String, message: String },

    #[error("Principal is missing the {0} claim")]
    MissingClaim(&'static str),

    #[error("Issuer not accepted for tenant {0}")]
    IssuerRejected(String),

    #[error("Token cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Invalid handshake state: {0}")]
    InvalidState(&'static str),

    #[error("{0}")]
    Other(String),
}

impl AuthError {
    /// The provider error code carried by this error, if any.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::Exchange(failure) => failure.provider_error().map(|e| e.error.as_str()),
            Self::ProviderService { code, .. } | Self::SilentAcquisition { code, .. } => {
                Some(code.as_str())
            }
            _ => None,
        }
    }

    /// Short tag naming the failure without any user or tenant data.
    pub fn label(&self) -> &str {
        if let Some(code) = self.error_code() {
            return code;
        }
        match self {
            Self::Exchange(failure) => failure.label(),
            Self::ProviderService { .. } | Self::SilentAcquisition { .. } => "provider_error",
            Self::MissingClaim(_) => "missing_claim",
            Self::IssuerRejected(_) => "issuer_rejected",
            Self::Cache(_) => "cache_error",
            Self::InvalidState(_) => "invalid_state",
            Self::Other(_) => "other",
        }
    }
}

/// Failure of a code-for-token (or refresh-token) redemption.
#[derive(Error, Debug)]
pub enum ExchangeFailure {
    #[error("network error: {0}")]
    Network(String),

    #[error("request to the token endpoint timed out")]
    Timeout,

    #[error("HTTP {status}: {error}")]
    Provider { status: u16, error: ProviderError },

    #[error("HTTP {0}")]
    Status(u16),

    #[error("malformed token response: {0}")]
    MalformedResponse(String),

    #[error("token response belongs to a different account")]
    AccountMismatch,

    #[error("token cache error: {0}")]
    Cache(#[from] CacheError),
}

impl ExchangeFailure {
    /// The structured provider error, when the token endpoint returned one.
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Provider { error, .. } => Some(error),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::Timeout => "timeout",
            Self::Provider { .. } => "provider_error",
            Self::Status(_) => "http_error",
            Self::MalformedResponse(_) => "malformed_response",
            Self::AccountMismatch => "account_mismatch",
            Self::Cache(_) => "cache_error",
        }
    }
}

/// OAuth2 error response body from the token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderError {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error_codes: Vec<u32>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl ProviderError {
    pub fn new(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_description: Some(description.into()),
            error_codes: Vec::new(),
            correlation_id: None,
            trace_id: None,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_description {
            Some(description) => write!(f, "{}: {}", self.error, description),
            None => f.write_str(&self.error),
        }
    }
}

/// Token cache storage errors.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize token cache: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Token cache storage unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_from_exchange() {
        let err = AuthError::Exchange(ExchangeFailure::Provider {
            status: 400,
            error: ProviderError::new("invalid_grant", "AADSTS65001: consent required"),
        });
        assert_eq!(err.error_code(), Some("invalid_grant"));

        let err = AuthError::Exchange(ExchangeFailure::Timeout);
        assert_eq!(err.error_code(), None);
    }

    #[test]
    fn test_error_code_from_provider_errors() {
        let err = AuthError::SilentAcquisition {
            code: "interaction_required".into(),
            message: "MFA needed".into(),
        };
        assert_eq!(err.error_code(), Some("interaction_required"));
        assert_eq!(err.to_string(), "MFA needed");

        assert_eq!(AuthError::MissingClaim("oid").error_code(), None);
    }

    #[test]
    fn test_label_carries_no_identifiers() {
        let err = AuthError::IssuerRejected("tenant-secret".into());
        assert_eq!(err.label(), "issuer_rejected");
        assert!(err.to_string().contains("tenant-secret"));

        let err = AuthError::Exchange(ExchangeFailure::Provider {
            status: 400,
            error: ProviderError::new("invalid_grant", "AADSTS50020: user jane@contoso.com"),
        });
        assert_eq!(err.label(), "invalid_grant");

        assert_eq!(AuthError::Exchange(ExchangeFailure::Status(503)).label(), "http_error");
    }

    #[test]
    fn test_provider_error_display() {
        let body = r#"{"error":"invalid_grant","error_description":"AADSTS70000: bad code","error_codes":[70000]}"#;
        let error: ProviderError = serde_json::from_str(body).unwrap();
        assert_eq!(error.error_codes, vec![70000]);
        assert_eq!(error.to_string(), "invalid_grant: AADSTS70000: bad code");

        let bare: ProviderError = serde_json::from_str(r#"{"error":"server_error"}"#).unwrap();
        assert_eq!(bare.to_string(), "server_error");
    }
}

//! Maps authentication failures to redirect targets.

use std::fmt;

use crate::error::AuthError;

/// Provider error code meaning the requested scopes need (re-)consent.
pub const INVALID_GRANT: &str = "invalid_grant";

/// Where consent-type failures are sent. Carries no error detail.
pub const PERMISSIONS_REQUIRED_PATH: &str = "/Account/PermissionsRequired";

/// Generic error view; the message goes in the `msg` query parameter,
/// form encoded (space as `+`).
pub const ERROR_PATH: &str = "/Home/Error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The user or an admin must consent to the requested scopes again.
    PermissionsRequired,
    GenericError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionsRequired => f.write_str("PermissionsRequired"),
            Self::GenericError => f.write_str("GenericError"),
        }
    }
}

/// Classification of one failure. Request scoped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ClassifiedFailure {
    /// Relative redirect URL for this failure.
    pub fn redirect_location(&self) -> String {
        match self.kind {
            FailureKind::PermissionsRequired => PERMISSIONS_REQUIRED_PATH.to_string(),
            FailureKind::GenericError => {
                format!("{}?msg={}", ERROR_PATH, form_encode(&self.message))
            }
        }
    }
}

fn form_encode(value: &str) -> String {
    value
        .split(' ')
        .map(urlencoding::encode)
        .collect::<Vec<_>>()
        .join("+")
}

/// Stateless classifier: only the provider error code matters, not which
/// kind of error carried it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthErrorClassifier;

impl AuthErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, error: &AuthError) -> ClassifiedFailure {
        let kind = match error.error_code() {
            Some(INVALID_GRANT) => FailureKind::PermissionsRequired,
            _ => FailureKind::GenericError,
        };

        ClassifiedFailure {
            kind,
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExchangeFailure, ProviderError};

    fn service_error(code: &str) -> AuthError {
        AuthError::ProviderService {
            code: code.into(),
            message: format!("{} happened", code),
        }
    }

    fn silent_error(code: &str) -> AuthError {
        AuthError::SilentAcquisition {
            code: code.into(),
            message: format!("{} happened", code),
        }
    }

    #[test]
    fn test_invalid_grant_requires_permissions() {
        let classifier = AuthErrorClassifier::new();

        for error in [service_error("invalid_grant"), silent_error("invalid_grant")] {
            let failure = classifier.classify(&error);
            assert_eq!(failure.kind, FailureKind::PermissionsRequired);
            assert_eq!(failure.redirect_location(), "/Account/PermissionsRequired");
        }
    }

    #[test]
    fn test_invalid_grant_from_code_exchange() {
        let error = AuthError::Exchange(ExchangeFailure::Provider {
            status: 400,
            error: ProviderError::new("invalid_grant", "AADSTS65001"),
        });
        let failure = AuthErrorClassifier::new().classify(&error);
        assert_eq!(failure.kind, FailureKind::PermissionsRequired);
    }

    #[test]
    fn test_other_codes_are_generic() {
        let classifier = AuthErrorClassifier::new();

        let failure = classifier.classify(&silent_error("interaction_required"));
        assert_eq!(failure.kind, FailureKind::GenericError);
        assert_eq!(failure.message, "interaction_required happened");
        assert_eq!(
            failure.redirect_location(),
            "/Home/Error?msg=interaction_required+happened"
        );

        let failure = classifier.classify(&AuthError::Exchange(ExchangeFailure::Timeout));
        assert_eq!(failure.kind, FailureKind::GenericError);

        // Code comparison is exact
        let failure = classifier.classify(&service_error("INVALID_GRANT"));
        assert_eq!(failure.kind, FailureKind::GenericError);
    }

    #[test]
    fn test_classification_is_pure() {
        let classifier = AuthErrorClassifier::new();
        let error = service_error("invalid_client");

        let first = classifier.classify(&error);
        classifier.classify(&service_error("invalid_grant"));
        let second = classifier.classify(&error);
        assert_eq!(first, second);
    }

    #[test]
    fn test_message_is_url_encoded() {
        let failure = ClassifiedFailure {
            kind: FailureKind::GenericError,
            message: "a&b=c/d?e".into(),
        };
        let location = failure.redirect_location();
        assert_eq!(location, "/Home/Error?msg=a%26b%3Dc%2Fd%3Fe");
        let encoded = location.trim_start_matches("/Home/Error?msg=");
        assert_eq!(urlencoding::decode(encoded).unwrap(), "a&b=c/d?e");
    }

    #[test]
    fn test_spaces_are_form_encoded() {
        let failure = ClassifiedFailure {
            kind: FailureKind::GenericError,
            message: "consent  needed + 100% sure".into(),
        };
        let location = failure.redirect_location();
        assert_eq!(location, "/Home/Error?msg=consent++needed+%2B+100%25+sure");

        let query = url::Url::parse(&format!("https://localhost{}", location)).unwrap();
        let (_, msg) = query.query_pairs().next().unwrap();
        assert_eq!(msg, "consent  needed + 100% sure");
    }
}

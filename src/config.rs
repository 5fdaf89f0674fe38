//! Configuration loading and management.
//!
//! Loads configuration from embedded config.toml with environment variable overrides.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::issuer::{AnyTenant, IssuerValidator, TenantAllowList};

/// Embedded configuration file content.
const CONFIG_TOML: &str = include_str!("../config.toml");

/// Scopes the token endpoint always gets alongside the requested ones.
pub const RESERVED_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub azure_ad: AzureAdOptions,
    pub issuer: IssuerConfig,
    pub http: HttpConfig,
    pub cache: CacheConfig,
    pub diagnostics: DiagnosticsConfig,
}

/// Azure AD application registration. Immutable once loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct AzureAdOptions {
    pub client_id: String,
    pub client_secret: String,
    /// Issuer instance, e.g. `https://login.microsoftonline.com/`.
    pub instance: String,
    pub tenant_id: String,
    pub callback_path: String,
    pub base_url: String,
    /// Space-delimited application (sign-in) scopes.
    pub scopes: String,
    /// Space-delimited downstream directory API scopes.
    pub graph_scopes: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssuerConfig {
    #[serde(default)]
    pub allow_any_tenant: bool,
    #[serde(default)]
    pub allowed_tenants: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Sliding lifetime of memory-cache entries; 0 disables expiry.
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosticsConfig {
    pub max_lines: usize,
}

/// Protocol settings the framework adapter applies to its OpenID Connect handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSettings {
    pub authority: String,
    pub client_id: String,
    pub callback_path: String,
    pub response_type: &'static str,
    pub scopes: Vec<String>,
    pub use_token_lifetime: bool,
    pub require_https_metadata: bool,
    /// Always false: multitenant issuers are checked by an [`IssuerValidator`] instead.
    pub validate_issuer: bool,
}

impl Config {
    /// Load configuration from embedded config.toml with environment variable overrides.
    pub fn load() -> Result<Self> {
        // .env is optional
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("Failed to load .env file: {}", e);
            }
        }

        let mut config = Self::from_toml_str(CONFIG_TOML)
            .context("Failed to parse embedded config.toml")?;

        config.apply_overrides(|key| env::var(key).ok());

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration without applying overrides or validating.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid configuration")
    }

    /// Apply `AZUREAD_*` overrides from the given lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let ad = &mut self.azure_ad;
        let string_overrides: [(&str, &mut String); 6] = [
            ("AZUREAD_CLIENT_ID", &mut ad.client_id),
            ("AZUREAD_CLIENT_SECRET", &mut ad.client_secret),
            ("AZUREAD_TENANT_ID", &mut ad.tenant_id),
            ("AZUREAD_INSTANCE", &mut ad.instance),
            ("AZUREAD_BASE_URL", &mut ad.base_url),
            ("AZUREAD_CALLBACK_PATH", &mut ad.callback_path),
        ];
        for (key, field) in string_overrides {
            if let Some(value) = lookup(key) {
                *field = value;
            }
        }

        if let Some(value) = lookup("AZUREAD_ALLOW_ANY_TENANT") {
            self.issuer.allow_any_tenant = matches!(value.trim(), "1" | "true" | "TRUE" | "True");
        }

        if let Some(value) = lookup("AZUREAD_ALLOWED_TENANTS") {
            self.issuer.allowed_tenants = value
                .split([',', ' '])
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    /// Validate that required configuration is present.
    pub fn validate(&self) -> Result<()> {
        let ad = &self.azure_ad;

        if ad.client_id.is_empty() || ad.client_id == "YOUR_AZURE_AD_CLIENT_ID" {
            bail!(
                "Azure AD client_id not configured. Set AZUREAD_CLIENT_ID environment variable \
                 or update config.toml"
            );
        }

        if ad.client_secret.is_empty() || ad.client_secret == "YOUR_AZURE_AD_CLIENT_SECRET" {
            bail!("Azure AD client_secret not configured. Set AZUREAD_CLIENT_SECRET");
        }

        if ad.tenant_id.is_empty() || ad.tenant_id == "YOUR_TENANT_ID" {
            bail!(
                "Azure AD tenant not configured. Set AZUREAD_TENANT_ID environment variable \
                 or update config.toml"
            );
        }

        let instance = Url::parse(&ad.instance).context("Azure AD instance is not a valid URL")?;
        if !ad.instance.ends_with('/') || instance.cannot_be_a_base() {
            bail!("Azure AD instance must be an absolute URL ending in '/'");
        }

        Url::parse(&ad.base_url).context("Base URL is not a valid URL")?;

        if !ad.callback_path.starts_with('/') {
            bail!("Callback path must start with '/'");
        }

        if ad.graph_scopes().is_empty() {
            bail!("At least one graph scope is required for the code exchange");
        }

        if !self.issuer.allow_any_tenant && self.issuer.allowed_tenants.is_empty() {
            bail!(
                "No issuer policy configured. List accepted tenants in AZUREAD_ALLOWED_TENANTS \
                 or set AZUREAD_ALLOW_ANY_TENANT=true to accept every tenant"
            );
        }

        Ok(())
    }

    /// Issuer validator for the configured policy.
    pub fn issuer_validator(&self) -> Arc<dyn IssuerValidator> {
        if self.issuer.allow_any_tenant {
            Arc::new(AnyTenant)
        } else {
            Arc::new(TenantAllowList::new(self.issuer.allowed_tenants.iter()))
        }
    }
}

impl AzureAdOptions {
    /// Issuer authority: `instance + tenant + "/v2.0"`.
    pub fn authority(&self) -> String {
        format!("{}{}/v2.0", self.instance, self.tenant_id)
    }

    /// Get the token URL for Azure AD.
    pub fn token_endpoint(&self) -> String {
        format!("{}{}/oauth2/v2.0/token", self.instance, self.tenant_id)
    }

    /// Redirect URI registered for the code exchange.
    pub fn redirect_uri(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.callback_path)
    }

    pub fn scopes(&self) -> Vec<String> {
        split_scopes(&self.scopes)
    }

    pub fn graph_scopes(&self) -> Vec<String> {
        split_scopes(&self.graph_scopes)
    }

    /// Sign-in scopes followed by graph scopes, without duplicates.
    pub fn all_scopes(&self) -> Vec<String> {
        let mut all = self.scopes();
        for scope in self.graph_scopes() {
            if !all.iter().any(|s| s.eq_ignore_ascii_case(&scope)) {
                all.push(scope);
            }
        }
        all
    }

    pub fn protocol_settings(&self) -> ProtocolSettings {
        ProtocolSettings {
            authority: self.authority(),
            client_id: self.client_id.clone(),
            callback_path: self.callback_path.clone(),
            response_type: "code id_token",
            scopes: self.all_scopes(),
            use_token_lifetime: true,
            require_https_metadata: false,
            validate_issuer: false,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then_some(Duration::from_secs(self.ttl_secs))
    }
}

fn split_scopes(scopes: &str) -> Vec<String> {
    scopes.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_config() -> Config {
        let mut config = Config::from_toml_str(CONFIG_TOML).unwrap();
        let vars: HashMap<&str, &str> = [
            ("AZUREAD_CLIENT_ID", "test-client"),
            ("AZUREAD_CLIENT_SECRET", "test-secret"),
            ("AZUREAD_ALLOWED_TENANTS", "tenant-a, tenant-b"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        config
    }

    #[test]
    fn test_config_parsing() {
        // Placeholders fail validation, but parsing should work
        let result = Config::from_toml_str(CONFIG_TOML);
        assert!(result.is_ok(), "Config parsing failed: {:?}", result.err());
        assert!(result.unwrap().validate().is_err());
    }

    #[test]
    fn test_overrides_and_validation() {
        let config = test_config();
        assert_eq!(config.azure_ad.client_id, "test-client");
        assert_eq!(config.issuer.allowed_tenants, vec!["tenant-a", "tenant-b"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_issuer_policy_required() {
        let mut config = test_config();
        config.issuer.allowed_tenants.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("issuer policy"));

        config.apply_overrides(|key| (key == "AZUREAD_ALLOW_ANY_TENANT").then(|| "true".into()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_callback_path() {
        let mut config = test_config();
        config.azure_ad.callback_path = "signin-oidc".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_urls() {
        let config = test_config();
        let ad = &config.azure_ad;

        assert_eq!(ad.authority(), "https://login.microsoftonline.com/common/v2.0");
        assert_eq!(
            ad.token_endpoint(),
            "https://login.microsoftonline.com/common/oauth2/v2.0/token"
        );
        assert_eq!(ad.redirect_uri(), "https://localhost:44334/signin-oidc");
    }

    #[test]
    fn test_scopes() {
        let mut config = test_config();
        config.azure_ad.scopes = "openid  profile User.Read".into();
        config.azure_ad.graph_scopes = " User.Read Group.ReadWrite.All ".into();

        assert_eq!(config.azure_ad.graph_scopes(), vec!["User.Read", "Group.ReadWrite.All"]);
        assert_eq!(
            config.azure_ad.all_scopes(),
            vec!["openid", "profile", "User.Read", "Group.ReadWrite.All"]
        );
    }

    #[test]
    fn test_protocol_settings() {
        let settings = test_config().azure_ad.protocol_settings();
        assert_eq!(settings.response_type, "code id_token");
        assert!(!settings.validate_issuer);
        assert!(settings.use_token_lifetime);
        assert!(settings.scopes.contains(&"offline_access".to_string()));
    }
}

//! Upstream identity providers: builds the URL the user is redirected to,
//! and — after they come back — exchanges the upstream authorization code
//! for upstream tokens and a normalized profile.
//!
//! The provider set is closed and known at compile time, so this is a
//! small enum rather than a trait object: adding a provider means adding a
//! variant, not touching the coordinator.

mod google;
mod microsoft;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Microsoft,
}

impl Provider {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "google" => Some(Provider::Google),
            "microsoft" => Some(Provider::Microsoft),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Google => write!(f, "google"),
            Provider::Microsoft => write!(f, "microsoft"),
        }
    }
}

/// Per-provider wire configuration, supplied at startup (§6 configuration).
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub scopes: Vec<String>,
}

/// A normalized profile, regardless of which provider issued it.
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub picture: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpstreamTokenResult {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub user_info: UserInfo,
}

/// Holds whatever providers were configured at startup and dispatches to
/// the right wire implementation.
pub struct UpstreamProviders {
    http: reqwest::Client,
    configs: HashMap<Provider, ProviderConfig>,
}

impl UpstreamProviders {
    pub fn new(timeout: Duration, configs: HashMap<Provider, ProviderConfig>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, configs })
    }

    pub fn is_supported(&self, name: &str) -> bool {
        Provider::parse(name).is_some_and(|p| self.configs.contains_key(&p))
    }

    fn config(&self, provider: Provider) -> Option<&ProviderConfig> {
        self.configs.get(&provider)
    }

    /// Builds the upstream authorize URL. Returns `None` if the provider
    /// has no configured credentials (a deployment misconfiguration, mapped
    /// by the caller to `server_error`).
    pub fn authorization_url(
        &self,
        provider: Provider,
        state: &str,
        code_challenge: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Option<Url> {
        let config = self.config(provider)?;
        Some(match provider {
            Provider::Google => google::authorization_url(config, state, code_challenge, redirect_uri, scopes),
            Provider::Microsoft => {
                microsoft::authorization_url(config, state, code_challenge, redirect_uri, scopes)
            }
        })
    }

    /// Exchanges the upstream authorization code for tokens and fetches
    /// the user's profile. Returns `None` (never an `Err`) on any upstream
    /// failure — the caller maps that to `invalid_grant`.
    pub async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Option<UpstreamTokenResult> {
        let config = self.config(provider)?;
        let result = match provider {
            Provider::Google => google::exchange_code(&self.http, config, code, verifier, redirect_uri).await,
            Provider::Microsoft => {
                microsoft::exchange_code(&self.http, config, code, verifier, redirect_uri).await
            }
        };
        match result {
            Ok(result) => Some(result),
            Err(error) => {
                tracing::warn!(%provider, %error, "upstream code exchange failed");
                None
            }
        }
    }
}

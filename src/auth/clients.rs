//! Registered OAuth clients: static validation plus dynamic registration
//! (RFC 7591). Backed by the same `PersistedCache` as session state, so
//! registrations survive a restart.

use crate::cache::{PersistedCache, PersistedCacheExt};
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use url::Url;

/// Clients never expire once registered; stored with a generous TTL so the
/// cache's uniform `set`/`expire` machinery still applies.
const CLIENT_RECORD_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    ClientSecretPost,
    ClientSecretBasic,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredClient {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub client_name: Option<String>,
    pub redirect_uris: HashSet<String>,
    pub grant_types: Vec<GrantType>,
    pub scopes: Vec<String>,
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ClientRegistrationRequest {
    pub client_name: Option<String>,
    pub redirect_uris: Option<Vec<String>>,
    pub grant_types: Option<Vec<GrantType>>,
    pub scope: Option<String>,
    pub token_endpoint_auth_method: Option<TokenEndpointAuthMethod>,
}

#[derive(Debug, Serialize)]
pub struct ClientRegistrationResponse {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub client_id_issued_at: i64,
    pub client_secret_expires_at: i64,
    pub client_name: Option<String>,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<GrantType>,
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,
}

pub struct ClientRegistry {
    cache: Arc<dyn PersistedCache>,
    dynamic_registration_enabled: bool,
}

impl ClientRegistry {
    pub fn new(cache: Arc<dyn PersistedCache>, dynamic_registration_enabled: bool) -> Self {
        Self {
            cache,
            dynamic_registration_enabled,
        }
    }

    fn key(client_id: &str) -> String {
        format!("oauth_client_{client_id}")
    }

    pub async fn lookup(&self, client_id: &str) -> anyhow::Result<Option<RegisteredClient>> {
        self.cache.get_json(&Self::key(client_id)).await
    }

    async fn put(&self, client: &RegisteredClient) -> anyhow::Result<()> {
        self.cache
            .set_json(&Self::key(&client.client_id), client, CLIENT_RECORD_TTL)
            .await
    }

    /// Registers a client directly, bypassing dynamic registration. Used
    /// to seed well-known/static clients at startup.
    pub async fn register_static(&self, client: RegisteredClient) -> anyhow::Result<()> {
        self.put(&client).await
    }

    /// Resolves a client without requiring a secret (the public-client
    /// path used when validating a redirect_uri at `/oauth/authorize`).
    pub async fn validate(&self, client_id: &str) -> Result<RegisteredClient> {
        self.lookup(client_id)
            .await
            .map_err(|e| BrokerError::ServerError(e.to_string()))?
            .ok_or_else(|| BrokerError::InvalidClient("unknown client_id".into()))
    }

    /// Authenticates a client presenting credentials at `/oauth/token`.
    pub async fn validate_with_secret(
        &self,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> Result<RegisteredClient> {
        let client = self.validate(client_id).await?;
        match (&client.client_secret, client_secret) {
            (None, _) => Ok(client), // `none` auth method: no secret required
            (Some(expected), Some(presented)) => {
                let matches: bool = expected.as_bytes().ct_eq(presented.as_bytes()).into();
                if matches {
                    Ok(client)
                } else {
                    Err(BrokerError::InvalidClient("client authentication failed".into()))
                }
            }
            (Some(_), None) => Err(BrokerError::InvalidClient(
                "client_secret required for this client".into(),
            )),
        }
    }

    /// Exact match against the client's registered redirect URIs. Host and
    /// scheme compare case-insensitively; path and query compare exactly.
    pub fn redirect_uri_matches(client: &RegisteredClient, presented: &str) -> bool {
        client
            .redirect_uris
            .iter()
            .any(|registered| uris_equivalent(registered, presented))
    }

    /// Compares two redirect URIs using the same case-insensitive
    /// scheme/host, exact path/query rule as `redirect_uri_matches`, for
    /// callers that already have a single stored URI rather than a full
    /// registered set (e.g. comparing an authorization code's recorded
    /// `redirect_uri` against the one presented at `/oauth/token`).
    pub fn redirect_uris_equivalent(a: &str, b: &str) -> bool {
        uris_equivalent(a, b)
    }

    pub async fn validate_redirect_uri(&self, client_id: &str, redirect_uri: &str) -> Result<()> {
        let client = self.validate(client_id).await?;
        if Self::redirect_uri_matches(&client, redirect_uri) {
            Ok(())
        } else {
            Err(BrokerError::InvalidRequest("Invalid redirect_uri".into()))
        }
    }

    pub async fn register(
        &self,
        request: ClientRegistrationRequest,
    ) -> Result<ClientRegistrationResponse> {
        if !self.dynamic_registration_enabled {
            return Err(BrokerError::RegistrationNotSupported(
                "dynamic client registration is disabled".into(),
            ));
        }

        let redirect_uris = request
            .redirect_uris
            .filter(|uris| !uris.is_empty())
            .ok_or_else(|| BrokerError::InvalidRequest("redirect_uris is required".into()))?;

        for uri in &redirect_uris {
            let parsed = Url::parse(uri)
                .map_err(|_| BrokerError::InvalidRequest(format!("invalid redirect_uri: {uri}")))?;
            if parsed.cannot_be_a_base() || parsed.host_str().is_none() {
                return Err(BrokerError::InvalidRequest(format!(
                    "redirect_uri must be absolute: {uri}"
                )));
            }
        }

        let grant_types = request
            .grant_types
            .unwrap_or_else(|| vec![GrantType::AuthorizationCode]);

        let auth_method = request
            .token_endpoint_auth_method
            .unwrap_or(TokenEndpointAuthMethod::ClientSecretPost);

        let client_id = format!("mcp-{}", random_url_safe(16));
        let client_secret = match auth_method {
            TokenEndpointAuthMethod::None => None,
            _ => Some(random_url_safe(32)),
        };

        let scopes = request
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let client = RegisteredClient {
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            client_name: request.client_name.clone(),
            redirect_uris: redirect_uris.iter().cloned().collect(),
            grant_types: grant_types.clone(),
            scopes,
            token_endpoint_auth_method: auth_method,
            created_at: Utc::now(),
        };

        self.put(&client)
            .await
            .map_err(|e| BrokerError::ServerError(e.to_string()))?;

        tracing::info!(client_id = %client_id, "registered new OAuth client");

        Ok(ClientRegistrationResponse {
            client_id,
            client_secret,
            client_id_issued_at: client.created_at.timestamp(),
            client_secret_expires_at: 0,
            client_name: request.client_name,
            redirect_uris,
            grant_types,
            token_endpoint_auth_method: auth_method,
        })
    }
}

fn uris_equivalent(registered: &str, presented: &str) -> bool {
    let (Ok(reg), Ok(pres)) = (Url::parse(registered), Url::parse(presented)) else {
        return registered == presented;
    };
    reg.scheme().eq_ignore_ascii_case(pres.scheme())
        && reg
            .host_str()
            .zip(pres.host_str())
            .is_some_and(|(a, b)| a.eq_ignore_ascii_case(b))
        && reg.port_or_known_default() == pres.port_or_known_default()
        && reg.path() == pres.path()
        && reg.query() == pres.query()
}

fn random_url_safe(num_bytes: usize) -> String {
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    let mut bytes = vec![0u8; num_bytes];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

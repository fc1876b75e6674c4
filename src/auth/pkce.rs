//! PKCE (S256 only, as OAuth 2.1 requires) and the session bundle staged
//! between `/oauth/authorize` and `/oauth/callback/{provider}`.

use crate::cache::{PersistedCache, PersistedCacheExt};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;

fn random_url_safe(num_bytes: usize) -> String {
    let mut bytes = vec![0u8; num_bytes];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// The PKCE bundle staged under the downstream client's `state` while the
/// user authenticates at the upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkceSession {
    pub upstream_verifier: String,
    pub client_code_challenge: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

/// Decouples the broker-generated `upstream_state` (sent to the IdP) from
/// the downstream client's own `state`, for CSRF isolation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMapping {
    pub client_state: String,
}

pub struct PkceService {
    cache: Arc<dyn PersistedCache>,
    session_ttl: Duration,
}

impl PkceService {
    pub fn new(cache: Arc<dyn PersistedCache>, session_ttl: Duration) -> Self {
        Self { cache, session_ttl }
    }

    /// 32 cryptographically-random bytes, base64url-encoded, and its S256
    /// challenge.
    pub fn generate_code_challenge_pair(&self) -> (String, String) {
        let verifier = random_url_safe(32);
        let challenge = Self::challenge_for(&verifier);
        (verifier, challenge)
    }

    /// 32 random bytes, base64url-encoded. Used for both the upstream
    /// `state` and broker-issued authorization codes / refresh tokens.
    pub fn generate_state(&self) -> String {
        random_url_safe(32)
    }

    fn challenge_for(verifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Constant-time comparison of `base64url(sha256(verifier))` against
    /// the stored challenge.
    pub fn validate_code_verifier(verifier: &str, expected_challenge: &str) -> bool {
        let computed = Self::challenge_for(verifier);
        computed.as_bytes().ct_eq(expected_challenge.as_bytes()).into()
    }

    pub async fn store_pkce_data(
        &self,
        client_state: &str,
        session: &PkceSession,
    ) -> anyhow::Result<()> {
        self.cache
            .set_json(&pkce_key(client_state), session, self.session_ttl)
            .await
    }

    pub async fn get_pkce_data(&self, client_state: &str) -> anyhow::Result<Option<PkceSession>> {
        self.cache.get_json(&pkce_key(client_state)).await
    }

    pub async fn remove_pkce_data(&self, client_state: &str) -> anyhow::Result<Option<PkceSession>> {
        self.cache.consume_json(&pkce_key(client_state)).await
    }

    pub async fn store_state_mapping(
        &self,
        upstream_state: &str,
        client_state: &str,
    ) -> anyhow::Result<()> {
        self.cache
            .set_json(
                &state_key(upstream_state),
                &StateMapping {
                    client_state: client_state.to_string(),
                },
                self.session_ttl,
            )
            .await
    }

    /// Atomically removes and returns the `StateMapping` for an upstream
    /// `state`, so a replayed callback can never resolve it twice.
    pub async fn take_state_mapping(&self, upstream_state: &str) -> anyhow::Result<Option<StateMapping>> {
        self.cache.consume_json(&state_key(upstream_state)).await
    }
}

fn pkce_key(client_state: &str) -> String {
    format!("oauth_pkce_{client_state}")
}

fn state_key(upstream_state: &str) -> String {
    format!("oauth_upstream_state_{upstream_state}")
}

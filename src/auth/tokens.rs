//! Mints and refreshes the broker's own access/refresh token pairs. Access
//! tokens are signed JWTs; refresh tokens are opaque random strings bound,
//! via the cache, to the upstream tokens and claims they were issued
//! alongside.

use crate::cache::{PersistedCache, PersistedCacheExt};
use crate::claims::ClaimSet;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{EncodingKey, Header, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

fn random_url_safe(num_bytes: usize) -> String {
    let mut bytes = vec![0u8; num_bytes];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// The claims embedded in a broker-issued access token JWT.
#[derive(Debug, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    client_id: String,
    scope: String,
    iss: String,
    iat: i64,
    exp: i64,
    claims: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub refresh_token: String,
    pub scope: String,
}

/// What a refresh token is bound to: the upstream credentials and identity
/// resolved at the original authorization, so a refresh cycle can mint a
/// fresh broker access token without re-running the whole flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RefreshBinding {
    claims: ClaimSet,
    upstream_access_token: String,
    upstream_refresh_token: Option<String>,
    scopes: Vec<String>,
    client_id: String,
}

pub struct TokenService {
    cache: Arc<dyn PersistedCache>,
    jwt_secret: String,
    pub(crate) issuer: String,
    token_lifetime: Duration,
    refresh_lifetime: Duration,
}

impl TokenService {
    pub fn new(
        cache: Arc<dyn PersistedCache>,
        jwt_secret: String,
        issuer: String,
        token_lifetime: Duration,
        refresh_lifetime: Duration,
    ) -> Self {
        Self {
            cache,
            jwt_secret,
            issuer,
            token_lifetime,
            refresh_lifetime,
        }
    }

    fn refresh_key(refresh_token: &str) -> String {
        format!("oauth_refresh_{refresh_token}")
    }

    fn sign_access_token(&self, claims: &ClaimSet, client_id: &str, scope: &str) -> anyhow::Result<String> {
        let now = chrono::Utc::now().timestamp();
        let sub = claims
            .get(crate::claims::NAME_IDENTIFIER)
            .unwrap_or_default()
            .to_string();
        let jwt_claims = AccessTokenClaims {
            sub,
            client_id: client_id.to_string(),
            scope: scope.to_string(),
            iss: self.issuer.clone(),
            iat: now,
            exp: now + self.token_lifetime.as_secs() as i64,
            claims: claims.0.iter().map(|c| (c.claim_type.clone(), c.value.clone())).collect(),
        };
        let token = encode(
            &Header::default(),
            &jwt_claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )?;
        Ok(token)
    }

    /// Mints a fresh access/refresh pair and persists the `RefreshBinding`
    /// so a later `refresh` call can rotate it.
    pub async fn generate_access_token(
        &self,
        claims: &ClaimSet,
        upstream_access_token: &str,
        upstream_refresh_token: Option<&str>,
        scopes: &[String],
        client_id: &str,
    ) -> anyhow::Result<TokenResponse> {
        let scope = scopes.join(" ");
        let access_token = self.sign_access_token(claims, client_id, &scope)?;
        let refresh_token = random_url_safe(32);

        let binding = RefreshBinding {
            claims: claims.clone(),
            upstream_access_token: upstream_access_token.to_string(),
            upstream_refresh_token: upstream_refresh_token.map(str::to_string),
            scopes: scopes.to_vec(),
            client_id: client_id.to_string(),
        };
        self.cache
            .set_json(&Self::refresh_key(&refresh_token), &binding, self.refresh_lifetime)
            .await?;

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer",
            expires_in: self.token_lifetime.as_secs(),
            refresh_token,
            scope,
        })
    }

    /// Atomically consumes `refresh_token` and, if it was bound to
    /// `client_id`, mints a new token pair. Returns `None` for an
    /// unknown/expired/already-used/mismatched-client token.
    pub async fn refresh(&self, refresh_token: &str, client_id: &str) -> anyhow::Result<Option<TokenResponse>> {
        let Some(binding) = self
            .cache
            .consume_json::<RefreshBinding>(&Self::refresh_key(refresh_token))
            .await?
        else {
            return Ok(None);
        };

        if binding.client_id != client_id {
            // The binding is already consumed; a mismatched client_id does
            // not get it back, matching invalid_grant for any other
            // unredeemable refresh token.
            tracing::warn!(client_id, "refresh_token presented by a different client than it was issued to");
            return Ok(None);
        }

        let response = self
            .generate_access_token(
                &binding.claims,
                &binding.upstream_access_token,
                binding.upstream_refresh_token.as_deref(),
                &binding.scopes,
                &binding.client_id,
            )
            .await?;
        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::claims::{EMAIL, NAME_IDENTIFIER};

    fn service() -> TokenService {
        TokenService::new(
            Arc::new(MemoryCache::new()),
            "test-secret-at-least-this-long".into(),
            "https://broker.example".into(),
            Duration::from_secs(3600),
            Duration::from_secs(2_592_000),
        )
    }

    fn claims() -> ClaimSet {
        let mut c = ClaimSet::new();
        c.push(NAME_IDENTIFIER, "42");
        c.push(EMAIL, "alice@example.com");
        c
    }

    #[tokio::test]
    async fn generates_distinct_refresh_tokens() {
        let svc = service();
        let first = svc
            .generate_access_token(&claims(), "upstream-at", None, &["openid".into()], "client-1")
            .await
            .unwrap();
        let second = svc
            .generate_access_token(&claims(), "upstream-at", None, &["openid".into()], "client-1")
            .await
            .unwrap();
        assert_ne!(first.refresh_token, second.refresh_token);
        assert_ne!(first.access_token, second.access_token);
    }

    #[tokio::test]
    async fn refresh_rotates_and_invalidates_old_token() {
        let svc = service();
        let issued = svc
            .generate_access_token(&claims(), "upstream-at", Some("upstream-rt"), &["openid".into()], "client-1")
            .await
            .unwrap();

        let refreshed = svc
            .refresh(&issued.refresh_token, "client-1")
            .await
            .unwrap()
            .expect("refresh should succeed");
        assert_ne!(refreshed.refresh_token, issued.refresh_token);

        let replay = svc.refresh(&issued.refresh_token, "client-1").await.unwrap();
        assert!(replay.is_none());
    }

    #[tokio::test]
    async fn refresh_rejects_wrong_client() {
        let svc = service();
        let issued = svc
            .generate_access_token(&claims(), "upstream-at", None, &["openid".into()], "client-1")
            .await
            .unwrap();

        let result = svc.refresh(&issued.refresh_token, "client-2").await.unwrap();
        assert!(result.is_none());

        // the binding was consumed even though the client check failed, so
        // the legitimate client can't reuse it either.
        let retry = svc.refresh(&issued.refresh_token, "client-1").await.unwrap();
        assert!(retry.is_none());
    }
}

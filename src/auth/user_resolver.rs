//! Maps an upstream identity to a local, numeric user id, auto-provisioning
//! a new account the first time an email is seen. Stands in for the
//! application database this broker ultimately sits in front of.

use crate::cache::{PersistedCache, PersistedCacheExt};
use crate::claims::{self, ClaimSet};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const USER_RECORD_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);
const NEXT_ID_KEY: &str = "oauth_user_next_id";

#[async_trait]
pub trait UserResolver: Send + Sync {
    /// Resolves `email` to a local numeric user id, auto-provisioning a
    /// new account from `claims` (and, for implementations that sync
    /// against the upstream provider on provisioning, `upstream_access_token`)
    /// if none exists yet. Returns `None` only on infrastructure failure —
    /// never to indicate "no such user", since an absent user is
    /// auto-provisioned rather than rejected.
    async fn resolve(&self, email: &str, upstream_access_token: &str, claims: &ClaimSet) -> Option<u64>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    id: u64,
    email: String,
    display_name: Option<String>,
}

/// A `PersistedCache`-backed email -> user-id index. Uses a long-lived TTL
/// rather than "forever" because the underlying cache abstraction only
/// speaks in TTLs; in practice these records outlive any realistic broker
/// uptime.
pub struct InMemoryUserResolver {
    cache: Arc<dyn PersistedCache>,
    // Guards the read-then-write id allocation so two concurrent
    // first-sightings of the same new email can't race onto the same id.
    allocation_lock: Mutex<()>,
}

impl InMemoryUserResolver {
    pub fn new(cache: Arc<dyn PersistedCache>) -> Self {
        Self {
            cache,
            allocation_lock: Mutex::new(()),
        }
    }

    fn email_key(email: &str) -> String {
        format!("oauth_user_email_{}", email.to_ascii_lowercase())
    }

    async fn next_id(&self) -> anyhow::Result<u64> {
        let current: Option<u64> = self.cache.get_json(NEXT_ID_KEY).await?;
        let next = current.unwrap_or(0) + 1;
        self.cache.set_json(NEXT_ID_KEY, &next, USER_RECORD_TTL).await?;
        Ok(next)
    }

    async fn resolve_fallible(&self, email: &str, claims: &ClaimSet) -> anyhow::Result<u64> {
        let key = Self::email_key(email);
        if let Some(existing) = self.cache.get_json::<UserRecord>(&key).await? {
            return Ok(existing.id);
        }

        let _guard = self.allocation_lock.lock().await;
        // re-check: another caller may have provisioned this email while
        // we waited for the lock.
        if let Some(existing) = self.cache.get_json::<UserRecord>(&key).await? {
            return Ok(existing.id);
        }

        let id = self.next_id().await?;
        let record = UserRecord {
            id,
            email: email.to_string(),
            display_name: claims.get(claims::NAME).map(str::to_string),
        };
        self.cache.set_json(&key, &record, USER_RECORD_TTL).await?;
        tracing::info!(user_id = id, email, "auto-provisioned new user");
        Ok(id)
    }
}

#[async_trait]
impl UserResolver for InMemoryUserResolver {
    /// `upstream_access_token` isn't used by this stand-in implementation —
    /// it exists in the trait for implementations that sync a freshly
    /// provisioned account against the upstream provider's own API before
    /// returning (e.g. pulling additional profile fields at provisioning
    /// time rather than relying solely on the ID token claims).
    async fn resolve(&self, email: &str, _upstream_access_token: &str, claims: &ClaimSet) -> Option<u64> {
        match self.resolve_fallible(email, claims).await {
            Ok(id) => Some(id),
            Err(error) => {
                tracing::error!(%error, email, "user resolution failed");
                None
            }
        }
    }
}

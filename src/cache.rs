//! `PersistedCache`: the one piece of mutable shared state the broker
//! relies on. Everything that crosses an HTTP request boundary — PKCE
//! sessions, state mappings, authorization codes, refresh-token bindings,
//! the client registry, the email -> user-id index — lives here, TTL'd and
//! safe for concurrent access.
//!
//! Two implementations are provided: `SledCache`, a durable embedded store
//! that survives a process restart, and `MemoryCache`, a plain in-memory
//! store used by tests and by deployments that don't need durability.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[async_trait]
pub trait PersistedCache: Send + Sync {
    /// Stores `value` under `key`, expiring it after `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> anyhow::Result<()>;

    /// Reads `key` if present and not expired. Does not consume it.
    async fn try_get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Removes `key` unconditionally, returning its value if it existed
    /// and had not yet expired.
    async fn remove(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Atomic compare-and-delete: reads and removes `key` as a single
    /// operation. Under concurrent callers racing the same key, exactly
    /// one sees `Some`, the rest see `None`. This is what gives
    /// authorization codes and refresh tokens their one-shot semantics.
    async fn try_consume(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Convenience helpers layered on `PersistedCache` for JSON-valued entries,
/// which is every entry this broker stores. Not object-safe (generic
/// methods), so it's a plain trait with native `async fn` rather than
/// `#[async_trait]`.
pub trait PersistedCacheExt: PersistedCache {
    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes, ttl).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.try_get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn consume_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.try_consume(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<C: PersistedCache + ?Sized> PersistedCacheExt for C {}

#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct Envelope {
    expires_at_unix_ms: i128,
    payload: Vec<u8>,
}

impl Envelope {
    fn new(payload: Vec<u8>, ttl: Duration) -> Self {
        let expires_at_unix_ms = now_unix_ms() + ttl.as_millis() as i128;
        Self {
            expires_at_unix_ms,
            payload,
        }
    }

    fn is_expired(&self) -> bool {
        now_unix_ms() >= self.expires_at_unix_ms
    }
}

fn now_unix_ms() -> i128 {
    chrono::Utc::now().timestamp_millis() as i128
}

/// Durable cache backed by an embedded `sled` database. A background task
/// is not required for expiry: entries are checked lazily on read and
/// removed on the spot, matching "expired lookups behave identically to
/// missing lookups" from the spec.
pub struct SledCache {
    db: sled::Db,
}

impl SledCache {
    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    #[cfg(test)]
    pub fn temporary() -> anyhow::Result<Self> {
        let config = sled::Config::new().temporary(true);
        Ok(Self { db: config.open()? })
    }
}

#[async_trait]
impl PersistedCache for SledCache {
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> anyhow::Result<()> {
        let envelope = Envelope::new(value.to_vec(), ttl);
        let encoded = serde_json::to_vec(&envelope)?;
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || db.insert(key.as_bytes(), encoded)).await??;
        Ok(())
    }

    async fn try_get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let db = self.db.clone();
        let key_owned = key.to_string();
        let raw = tokio::task::spawn_blocking(move || db.get(key_owned.as_bytes())).await??;
        decode_live(&self.db, key, raw).await
    }

    async fn remove(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let db = self.db.clone();
        let key_owned = key.to_string();
        let raw = tokio::task::spawn_blocking(move || db.remove(key_owned.as_bytes())).await??;
        match raw {
            Some(ivec) => Ok(live_payload(&ivec)),
            None => Ok(None),
        }
    }

    async fn try_consume(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        // sled::Tree::remove is itself an atomic compare-and-delete against
        // the key: only the caller that actually removes a present value
        // gets it back, so this doubles as our one-shot primitive.
        self.remove(key).await
    }
}

async fn decode_live(
    db: &sled::Db,
    key: &str,
    raw: Option<sled::IVec>,
) -> anyhow::Result<Option<Vec<u8>>> {
    let Some(ivec) = raw else {
        return Ok(None);
    };
    let envelope: Envelope = serde_json::from_slice(&ivec)?;
    if envelope.is_expired() {
        let db = db.clone();
        let key = key.to_string();
        let _ = tokio::task::spawn_blocking(move || db.remove(key.as_bytes())).await;
        return Ok(None);
    }
    Ok(Some(envelope.payload))
}

fn live_payload(ivec: &sled::IVec) -> Option<Vec<u8>> {
    let envelope: Envelope = serde_json::from_slice(ivec).ok()?;
    if envelope.is_expired() {
        None
    } else {
        Some(envelope.payload)
    }
}

/// Pure in-memory cache for tests and for `--no-persistence` runs. A single
/// mutex is enough: the broker's request volume through this cache is
/// nowhere near the point where that would be a bottleneck, and it keeps
/// `try_consume` trivially atomic.
#[derive(Default, Clone)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Envelope>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistedCache for MemoryCache {
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), Envelope::new(value.to_vec(), ttl));
        Ok(())
    }

    async fn try_get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(envelope) if envelope.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(envelope) => Ok(Some(envelope.payload.clone())),
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some(envelope) if !envelope.is_expired() => Ok(Some(envelope.payload)),
            _ => Ok(None),
        }
    }

    async fn try_consume(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.remove(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip<C: PersistedCache>(cache: C) {
        cache.set("k", b"v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.try_get("k").await.unwrap(), Some(b"v".to_vec()));

        // try_consume removes it for everyone else
        assert_eq!(cache.try_consume("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(cache.try_consume("k").await.unwrap(), None);
        assert_eq!(cache.try_get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_cache_roundtrip() {
        roundtrip(MemoryCache::new()).await;
    }

    #[tokio::test]
    async fn sled_cache_roundtrip() {
        roundtrip(SledCache::temporary().unwrap()).await;
    }

    #[tokio::test]
    async fn expired_entries_behave_as_missing() {
        let cache = MemoryCache::new();
        cache
            .set("k", b"v", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.try_get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_consume_exactly_one_winner() {
        let cache = Arc::new(MemoryCache::new());
        cache
            .set("code", b"payload", Duration::from_secs(60))
            .await
            .unwrap();

        let a = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.try_consume("code").await.unwrap() })
        };
        let b = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.try_consume("code").await.unwrap() })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        let winners = [a, b].into_iter().filter(Option::is_some).count();
        assert_eq!(winners, 1);
    }
}

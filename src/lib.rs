pub mod auth;
pub mod cache;
pub mod claims;
pub mod config;
pub mod error;
pub mod server;

use std::sync::Arc;

/// Builds the durable or in-memory `PersistedCache` named by `Args`, and
/// the `AppState` wired on top of it. Split out of `main` so integration
/// tests can build the same state without going through the CLI.
pub fn build_app_state(args: &config::Args) -> anyhow::Result<auth::AppState> {
    let cache: Arc<dyn cache::PersistedCache> = match &args.cache_path {
        Some(path) => Arc::new(cache::SledCache::open(path)?),
        None => Arc::new(cache::MemoryCache::new()),
    };
    auth::AppState::build(args, cache)
}

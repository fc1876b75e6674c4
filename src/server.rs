//! Router assembly: the broker's full externally-reachable HTTP surface.
//!
//! `/oauth/token` and `/oauth/register` sit behind a stricter rate limit
//! than the rest of the OAuth surface, mirroring the split between
//! session-establishing and session-consuming endpoints.

use crate::auth::{self, AppState};
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::GovernorLayer;
use tower_http::trace::TraceLayer;

pub struct RateLimitConfig {
    pub per_second: u64,
    pub burst: u32,
}

pub fn build_router(state: AppState, rate_limit: &RateLimitConfig) -> Router {
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(rate_limit.per_second)
            .burst_size(rate_limit.burst)
            .finish()
            .expect("rate limiter config is valid"),
    );
    let standard_rate_limit = GovernorLayer::new(governor_conf);

    // Half the rate, a third of the burst: token/register redeem secrets
    // and mint credentials, so they get tighter headroom than a redirect.
    let strict_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second((rate_limit.per_second / 2).max(1))
            .burst_size((rate_limit.burst / 3).max(1))
            .finish()
            .expect("rate limiter config is valid"),
    );
    let strict_rate_limit = GovernorLayer::new(strict_governor_conf);

    let token_and_registration_routes = Router::new()
        .route("/oauth/token", post(auth::token_handler))
        .route("/oauth/register", post(auth::register_handler))
        .layer(strict_rate_limit)
        .with_state(state.clone());

    let oauth_routes = Router::new()
        .route("/oauth/authorize", get(auth::authorize_handler))
        .route("/oauth/callback/{provider}", get(auth::callback_handler))
        .route(
            "/.well-known/oauth-authorization-server",
            get(auth::authorization_server_metadata_handler),
        )
        .route(
            "/.well-known/openid-configuration",
            get(auth::authorization_server_metadata_handler),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(auth::protected_resource_metadata_handler),
        )
        .layer(standard_rate_limit)
        .with_state(state);

    oauth_routes
        .merge(token_and_registration_routes)
        .layer(TraceLayer::new_for_http())
}

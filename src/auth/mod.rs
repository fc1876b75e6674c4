//! Wires the individual auth components into a single `AppState` and
//! exposes the axum handler functions that `server.rs` mounts as routes.

pub mod clients;
pub mod flow;
pub mod metadata;
pub mod pkce;
pub mod tokens;
pub mod upstream;
pub mod user_resolver;

use crate::cache::PersistedCache;
use crate::config::Args;
use crate::error::Result;
use axum::Json;
use axum::extract::{Form, Path, Query, State};
use axum::response::Response;
use clients::{ClientRegistrationRequest, ClientRegistrationResponse, ClientRegistry};
use flow::{AuthFlowCoordinator, AuthorizeQuery, CallbackQuery, TokenForm};
use metadata::{AuthorizationServerMetadata, MetadataPublisher, ProtectedResourceMetadata};
use std::collections::HashMap;
use std::sync::Arc;
use tokens::{TokenResponse, TokenService};
use upstream::{Provider, ProviderConfig, UpstreamProviders};
use user_resolver::InMemoryUserResolver;

/// Everything an axum handler needs, cloned cheaply per request (every
/// field is an `Arc` or a plain value).
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<AuthFlowCoordinator>,
    pub metadata: Arc<MetadataPublisher>,
}

impl AppState {
    pub fn build(args: &Args, cache: Arc<dyn PersistedCache>) -> anyhow::Result<Self> {
        let clients = ClientRegistry::new(cache.clone(), args.enable_dynamic_client_registration);

        let mut provider_configs = HashMap::new();
        if let (Some(client_id), Some(client_secret)) =
            (&args.google.google_client_id, &args.google.google_client_secret)
        {
            provider_configs.insert(
                Provider::Google,
                ProviderConfig {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    authorize_url: args.google.google_authorize_url.clone(),
                    token_url: args.google.google_token_url.clone(),
                    userinfo_url: args.google.google_userinfo_url.clone(),
                    scopes: vec!["openid".into(), "email".into(), "profile".into()],
                },
            );
        }
        if let (Some(client_id), Some(client_secret)) = (
            &args.microsoft.microsoft_client_id,
            &args.microsoft.microsoft_client_secret,
        ) {
            provider_configs.insert(
                Provider::Microsoft,
                ProviderConfig {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    authorize_url: args.microsoft.microsoft_authorize_url.clone(),
                    token_url: args.microsoft.microsoft_token_url.clone(),
                    userinfo_url: args.microsoft.microsoft_userinfo_url.clone(),
                    scopes: vec!["openid".into(), "email".into(), "offline_access".into()],
                },
            );
        }

        let upstream = UpstreamProviders::new(args.upstream_timeout, provider_configs)?;
        let users = Arc::new(InMemoryUserResolver::new(cache.clone()));
        let tokens = TokenService::new(
            cache.clone(),
            args.jwt_secret.clone(),
            args.issuer(),
            args.token_lifetime,
            args.refresh_lifetime,
        );

        let coordinator = Arc::new(AuthFlowCoordinator {
            cache: cache.clone(),
            pkce: pkce::PkceService::new(cache.clone(), args.pkce_session_ttl),
            clients,
            upstream,
            users,
            tokens,
            default_scopes: args.scopes_supported.clone(),
            auth_code_ttl: args.auth_code_ttl,
        });

        let metadata = Arc::new(MetadataPublisher::new(
            args.issuer(),
            args.scopes_supported.clone(),
            args.enable_dynamic_client_registration,
            args.client_id_metadata_document_supported,
        ));

        Ok(Self { coordinator, metadata })
    }
}

pub async fn authorize_handler(
    State(state): State<AppState>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response> {
    state.coordinator.authorize(query).await
}

pub async fn callback_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response> {
    state.coordinator.callback(provider, query).await
}

pub async fn token_handler(
    State(state): State<AppState>,
    Form(form): Form<TokenForm>,
) -> Result<Json<TokenResponse>> {
    state.coordinator.token(form).await
}

pub async fn register_handler(
    State(state): State<AppState>,
    Json(request): Json<ClientRegistrationRequest>,
) -> Result<(axum::http::StatusCode, Json<ClientRegistrationResponse>)> {
    let response = state.coordinator.clients.register(request).await?;
    Ok((axum::http::StatusCode::CREATED, Json(response)))
}

pub async fn authorization_server_metadata_handler(
    State(state): State<AppState>,
) -> Json<AuthorizationServerMetadata> {
    Json(state.metadata.authorization_server_metadata())
}

pub async fn protected_resource_metadata_handler(
    State(state): State<AppState>,
) -> Json<ProtectedResourceMetadata> {
    Json(state.metadata.protected_resource_metadata())
}

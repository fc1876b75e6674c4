//! Layered configuration: CLI flags, falling back to environment
//! variables, falling back to a `.env` file loaded before `Args::parse()`
//! runs (see `main.rs`). Mirrors the flag/env/default layering of the
//! server this broker's conventions were drawn from.

use clap::Parser;
use std::time::Duration;

fn parse_duration_secs(s: &str) -> Result<Duration, String> {
    let secs: u64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a whole number of seconds"))?;
    Ok(Duration::from_secs(secs))
}

#[derive(Parser, Debug, Clone)]
#[command(name = "oauth-broker")]
#[command(about = "OAuth 2.1 identity broker fronting an MCP service")]
pub struct Args {
    /// Host to bind to
    #[arg(long, env = "BROKER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind to
    #[arg(short, long, env = "BROKER_PORT", default_value = "8089")]
    pub port: u16,

    /// Public issuer URL advertised in metadata and used to build redirect
    /// targets. Its trailing slash is stripped at load time.
    #[arg(long, env = "BROKER_SERVER_URL")]
    pub server_url: String,

    /// Secret used to sign broker-issued JWT access tokens (HS256).
    #[arg(long, env = "BROKER_JWT_SECRET")]
    pub jwt_secret: String,

    /// Directory for the durable sled cache. Omit to run purely in-memory
    /// (session state does not survive a restart).
    #[arg(long, env = "BROKER_CACHE_PATH")]
    pub cache_path: Option<String>,

    /// Default scopes advertised and granted when a client doesn't ask for
    /// a narrower set.
    #[arg(
        long,
        env = "BROKER_SCOPES_SUPPORTED",
        value_delimiter = ',',
        default_value = "openid,profile,email,mcp:tools"
    )]
    pub scopes_supported: Vec<String>,

    /// Whether POST /oauth/register (RFC 7591) is enabled.
    #[arg(
        long,
        env = "BROKER_ENABLE_DYNAMIC_CLIENT_REGISTRATION",
        action = clap::ArgAction::Set,
        default_value_t = true
    )]
    pub enable_dynamic_client_registration: bool,

    /// Advertise client-id-metadata-document support in discovery metadata.
    #[arg(
        long,
        env = "BROKER_CLIENT_ID_METADATA_DOCUMENT_SUPPORTED",
        action = clap::ArgAction::Set,
        default_value_t = false
    )]
    pub client_id_metadata_document_supported: bool,

    /// Broker access token lifetime, in seconds.
    #[arg(long, env = "BROKER_TOKEN_LIFETIME", value_parser = parse_duration_secs, default_value = "3600")]
    pub token_lifetime: Duration,

    /// Broker refresh token lifetime, in seconds.
    #[arg(long, env = "BROKER_REFRESH_LIFETIME", value_parser = parse_duration_secs, default_value = "2592000")]
    pub refresh_lifetime: Duration,

    /// Authorization code TTL, in seconds.
    #[arg(long, env = "BROKER_AUTH_CODE_TTL", value_parser = parse_duration_secs, default_value = "300")]
    pub auth_code_ttl: Duration,

    /// PKCE / state-mapping session TTL, in seconds.
    #[arg(long, env = "BROKER_PKCE_SESSION_TTL", value_parser = parse_duration_secs, default_value = "600")]
    pub pkce_session_ttl: Duration,

    /// Upstream HTTP request timeout, in seconds.
    #[arg(long, env = "BROKER_UPSTREAM_TIMEOUT", value_parser = parse_duration_secs, default_value = "10")]
    pub upstream_timeout: Duration,

    /// Rate limit: requests per second per IP on the OAuth surface.
    #[arg(long, env = "RATE_LIMIT_PER_SECOND", default_value = "10")]
    pub rate_limit_per_second: u64,

    /// Rate limit: burst size before limiting kicks in.
    #[arg(long, env = "RATE_LIMIT_BURST", default_value = "100")]
    pub rate_limit_burst: u32,

    #[command(flatten)]
    pub google: GoogleArgs,

    #[command(flatten)]
    pub microsoft: MicrosoftArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct GoogleArgs {
    #[arg(long = "google-client-id", env = "GOOGLE_CLIENT_ID")]
    pub google_client_id: Option<String>,
    #[arg(long = "google-client-secret", env = "GOOGLE_CLIENT_SECRET")]
    pub google_client_secret: Option<String>,
    /// Override for tests and non-standard deployments; defaults to
    /// Google's real authorize endpoint.
    #[arg(
        long = "google-authorize-url",
        env = "GOOGLE_AUTHORIZE_URL",
        default_value = "https://accounts.google.com/o/oauth2/v2/auth"
    )]
    pub google_authorize_url: String,
    #[arg(
        long = "google-token-url",
        env = "GOOGLE_TOKEN_URL",
        default_value = "https://oauth2.googleapis.com/token"
    )]
    pub google_token_url: String,
    #[arg(
        long = "google-userinfo-url",
        env = "GOOGLE_USERINFO_URL",
        default_value = "https://openidconnect.googleapis.com/v1/userinfo"
    )]
    pub google_userinfo_url: String,
}

#[derive(Parser, Debug, Clone)]
pub struct MicrosoftArgs {
    #[arg(long = "microsoft-client-id", env = "MICROSOFT_CLIENT_ID")]
    pub microsoft_client_id: Option<String>,
    #[arg(long = "microsoft-client-secret", env = "MICROSOFT_CLIENT_SECRET")]
    pub microsoft_client_secret: Option<String>,
    #[arg(
        long = "microsoft-authorize-url",
        env = "MICROSOFT_AUTHORIZE_URL",
        default_value = "https://login.microsoftonline.com/common/oauth2/v2.0/authorize"
    )]
    pub microsoft_authorize_url: String,
    #[arg(
        long = "microsoft-token-url",
        env = "MICROSOFT_TOKEN_URL",
        default_value = "https://login.microsoftonline.com/common/oauth2/v2.0/token"
    )]
    pub microsoft_token_url: String,
    #[arg(
        long = "microsoft-userinfo-url",
        env = "MICROSOFT_USERINFO_URL",
        default_value = "https://graph.microsoft.com/v1.0/me"
    )]
    pub microsoft_userinfo_url: String,
}

impl Args {
    /// `server_url` with any trailing slash removed, per spec.
    pub fn issuer(&self) -> String {
        self.server_url.trim_end_matches('/').to_string()
    }
}

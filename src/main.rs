use clap::Parser;
use oauth_broker::config::Args;
use oauth_broker::server::RateLimitConfig;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oauth_broker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!(issuer = %args.issuer(), "starting oauth-broker");
    if args.cache_path.is_none() {
        tracing::warn!("BROKER_CACHE_PATH not set; session state will not survive a restart");
    }

    let state = oauth_broker::build_app_state(&args)?;

    let rate_limit = RateLimitConfig {
        per_second: args.rate_limit_per_second,
        burst: args.rate_limit_burst,
    };
    let app = oauth_broker::server::build_router(state, &rate_limit);

    let bind_addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on {bind_addr}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

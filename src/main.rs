use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use url::Url;

use order_sync::api;
use order_sync::client::availability::SharedAvailability;
use order_sync::client::http::HttpOrderApi;
use order_sync::client::token::StaticTokenProvider;
use order_sync::config::Config;
use order_sync::engine::sync::{run_sync_engine, Collaborators, SyncEngine};
use order_sync::engine::transport::WsConnector;
use order_sync::error::AppError;
use order_sync::models::driver::DriverAvailability;
use order_sync::observability::metrics::Metrics;
use order_sync::state::AppState;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let endpoint = Url::parse(&config.ws_url)
        .map_err(|err| AppError::Internal(format!("invalid WS_URL {}: {err}", config.ws_url)))?;

    let tokens = Arc::new(StaticTokenProvider::new(config.auth_token.clone()));
    let availability = Arc::new(SharedAvailability::new(DriverAvailability::on_duty()));
    let order_api = HttpOrderApi::new(
        config.api_base_url.clone(),
        tokens.clone(),
        config.sync.request_timeout,
    )
    .map_err(|err| AppError::Internal(format!("failed to build order api: {err}")))?;

    let metrics = Metrics::new();
    let (engine, sync) = SyncEngine::new(
        config.sync.clone(),
        Collaborators {
            connector: Arc::new(WsConnector),
            tokens: tokens.clone(),
            api: Arc::new(order_api),
            availability: availability.clone(),
            endpoint,
        },
        metrics.clone(),
        config.event_buffer_size,
        config.command_buffer_size,
    );

    tokio::spawn(run_sync_engine(engine));

    sync.start()
        .await
        .map_err(|err| AppError::Internal(format!("failed to start sync engine: {err}")))?;

    let shared_state = Arc::new(AppState::new(sync.clone(), availability, tokens, metrics));
    let app = api::rest::router(shared_state);

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "control api started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    if let Err(err) = sync.stop().await {
        tracing::warn!(error = %err, "sync engine already stopped");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

mod api;
mod broadcast;
mod core;
mod engine;
mod ingest;
mod instruments;
mod reset;
mod snapshot;

use crate::core::{AppConfig, AppError, AppState};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env()?;
    let addr: std::net::SocketAddr = config
        .server_addr
        .parse()
        .map_err(|e| AppError::InvalidEnv("SERVER_ADDR", format!("{e}")))?;

    let state = AppState::new(config);

    if let Some(path) = state.config.instrument_csv_path.clone() {
        instruments::auto_subscribe(&state, &path).await?;
    }

    // Seed last_reset_date before restoring, so restore's IST-midnight
    // filter and the scheduler's idempotency token agree on "today".
    reset::check_once(&state).await;
    snapshot::restore_all(&state).await;

    tokio::spawn(ingest::session::run(state.clone()));
    tokio::spawn(ingest::oi_poller::run(state.clone()));
    tokio::spawn(snapshot::run(state.clone()));
    tokio::spawn(reset::run(state.clone()));

    let app = api::router(state);
    tracing::info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|e| AppError::Upstream(e.to_string()))?;

    Ok(())
}

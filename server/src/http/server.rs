use anyhow::Result;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use super::{handlers, state::AppState};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Keystore configs
        .route(
            "/keystores",
            get(handlers::find_keystores).post(handlers::insert_keystore),
        )
        .route(
            "/keystores/:id",
            get(handlers::get_keystore).post(handlers::update_keystore),
        )
        // Metering
        .route("/meters/:meter_id/usage", get(handlers::get_storage_usage))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn start_server(state: AppState, bind_address: SocketAddr) -> Result<()> {
    let app = build_router(state);

    info!("Server listening on {}", bind_address);

    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

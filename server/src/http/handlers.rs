use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use shared_types::{KeystoreConfig, KeystoreRecord, StorageUsage};
use tracing::{info, instrument};

use super::{
    dto::{FindKeystoresParams, FindKeystoresResponse, GetKeystoreParams, UpdateKeystoreResponse},
    error::{ApiError, ApiResult},
    state::AppState,
};
use crate::error::KeystoreError;
use crate::usage::UsageRequest;

/// POST /keystores
/// Create a keystore config at sequence 0
#[instrument(skip(state, config), fields(id = %config.id))]
pub async fn insert_keystore(
    State(state): State<AppState>,
    Json(config): Json<KeystoreConfig>,
) -> ApiResult<(StatusCode, Json<KeystoreRecord>)> {
    let record = state.keystores.insert(config).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /keystores?controller=...
/// Find the keystore configs of one controller
#[instrument(skip(state))]
pub async fn find_keystores(
    State(state): State<AppState>,
    Query(params): Query<FindKeystoresParams>,
) -> ApiResult<Json<FindKeystoresResponse>> {
    let records = state
        .keystores
        .find(&params.controller, &params.query(), &params.options())
        .await?;
    Ok(Json(FindKeystoresResponse { records }))
}

/// GET /keystores/:id
/// Get a keystore config, from the cache unless `fresh=true`
#[instrument(skip(state))]
pub async fn get_keystore(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<GetKeystoreParams>,
) -> ApiResult<Json<KeystoreRecord>> {
    let record = state.keystores.get(&id, params.fresh).await?;
    Ok(Json(record))
}

/// POST /keystores/:id
/// Update a keystore config; `sequence` must be one past the stored sequence
#[instrument(skip(state, config), fields(sequence = config.sequence))]
pub async fn update_keystore(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<KeystoreConfig>,
) -> ApiResult<Json<UpdateKeystoreResponse>> {
    if config.id != id {
        return Err(ApiError(KeystoreError::Data(format!(
            "Keystore id in path ({id}) does not match config id ({}).",
            config.id
        ))));
    }

    let success = state.keystores.update(&config).await?;
    info!("Keystore {} updated to sequence {}", id, config.sequence);
    Ok(Json(UpdateKeystoreResponse { success }))
}

/// GET /meters/:meter_id/usage
/// Metered storage of every keystore under a meter
#[instrument(skip(state))]
pub async fn get_storage_usage(
    State(state): State<AppState>,
    Path(meter_id): Path<String>,
) -> ApiResult<Json<StorageUsage>> {
    let request = UsageRequest::new(&meter_id, state.modules.as_ref());
    let usage = state.keystores.get_storage_usage(request).await?;
    Ok(Json(usage))
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "keystore-server",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

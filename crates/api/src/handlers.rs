use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use liveswap_models::{
    CancelResponse, ErrorShape, HistoryResponse, InstalledRelease, TriggerOutcome, TriggerRequest,
    UpdateError, UpdateStatus,
};
use std::collections::HashMap;
use tracing::{error, info, instrument, warn};

use crate::AppState;

const DEFAULT_HISTORY_LIMIT: u32 = 50;

type ApiError = (StatusCode, Json<ErrorShape>);

fn api_error(e: UpdateError) -> ApiError {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(e.to_error_shape()))
}

#[instrument(skip(state, body))]
pub async fn trigger_update(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<TriggerOutcome>), ApiError> {
    let request: TriggerRequest = if body.iter().all(u8::is_ascii_whitespace) {
        TriggerRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            api_error(UpdateError::InvalidRequest {
                reason: format!("invalid trigger body: {e}"),
            })
        })?
    };

    let result = match request.manifest {
        Some(manifest) => {
            info!("Update to {} requested", manifest.version);
            state.orchestrator.trigger_update(manifest).await
        }
        None => {
            info!("Update from feed requested");
            state.orchestrator.trigger_from_feed().await
        }
    };

    match result {
        Ok(outcome) => {
            let status = match outcome {
                TriggerOutcome::Started { .. } | TriggerOutcome::Queued { .. } => {
                    StatusCode::ACCEPTED
                }
                _ => StatusCode::OK,
            };
            Ok((status, Json(outcome)))
        }
        Err(e) => {
            error!("Failed to trigger update: {}", e);
            Err(api_error(e))
        }
    }
}

pub async fn get_status(State(state): State<AppState>) -> Json<UpdateStatus> {
    Json(state.orchestrator.status())
}

#[instrument(skip(state))]
pub async fn rollback(State(state): State<AppState>) -> Result<Json<InstalledRelease>, ApiError> {
    match state.orchestrator.rollback().await {
        Ok(release) => Ok(Json(release)),
        Err(e) => {
            warn!("Rollback refused: {}", e);
            Err(api_error(e))
        }
    }
}

#[instrument(skip(state))]
pub async fn cancel(State(state): State<AppState>) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state.orchestrator.cancel().await.map_err(api_error)?;
    Ok(Json(CancelResponse { cancelled }))
}

#[instrument(skip(state))]
pub async fn resume(State(state): State<AppState>) -> Result<Json<UpdateStatus>, ApiError> {
    state.orchestrator.resume().await.map(Json).map_err(|e| {
        warn!("Resume refused: {}", e);
        api_error(e)
    })
}

#[instrument(skip(state))]
pub async fn history(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let limit = match params.get("limit") {
        Some(raw) => raw.parse::<u32>().map_err(|_| {
            api_error(UpdateError::InvalidRequest {
                reason: format!("limit must be a positive integer, got {raw}"),
            })
        })?,
        None => DEFAULT_HISTORY_LIMIT,
    };

    let records = state.orchestrator.history(limit).await.map_err(|e| {
        error!("Failed to read history: {}", e);
        api_error(e)
    })?;
    Ok(Json(HistoryResponse { records }))
}

pub async fn health_check(State(_state): State<AppState>) -> Result<&'static str, StatusCode> {
    Ok("OK")
}

#[instrument(skip(state))]
pub async fn metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    match state.metrics.get_prometheus_metrics() {
        Ok(metrics) => Ok(metrics),
        Err(e) => {
            error!("Failed to get metrics: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

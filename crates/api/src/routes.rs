use axum::{
    routing::{get, post},
    Router,
};

use crate::{handlers::*, AppState};

pub fn create_router() -> Router<AppState> {
    Router::new()
        // Update lifecycle
        .route("/admin/update", post(trigger_update))
        .route("/admin/update/status", get(get_status))
        .route("/admin/update/rollback", post(rollback))
        .route("/admin/update/cancel", post(cancel))
        .route("/admin/update/resume", post(resume))
        .route("/admin/update/history", get(history))
        // Health and metrics
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics))
}

pub fn build_router(state: AppState) -> Router {
    create_router().with_state(state)
}

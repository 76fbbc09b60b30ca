use crate::AppState;
use crate::services::cleanup::CleanupSnapshot;
use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Absolute path of the managed temp directory
    pub temp_dir: String,
    pub transcode_slots: usize,
    pub transcode_slots_free: usize,
    pub cleanup: CleanupSnapshot,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "System health status", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let optimizer = &state.optimizer;
    let temp_dir = optimizer.storage().root();

    let status = if tokio::fs::metadata(temp_dir).await.is_ok_and(|m| m.is_dir()) {
        "ok"
    } else {
        // Allocation recreates the directory, so requests still succeed
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        temp_dir: temp_dir.display().to_string(),
        transcode_slots: optimizer.pool().capacity(),
        transcode_slots_free: optimizer.pool().available(),
        cleanup: optimizer.cleanup().stats(),
    })
}

use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::refresh_tasks::RefreshTask;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{Value, json};

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn healthz(State(state): State<AppState>) -> AppResult<Json<Value>> {
    sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .map_err(|e| {
            AppError::new(StatusCode::SERVICE_UNAVAILABLE, "database_unavailable", e.to_string())
                .with_type("server_error")
        })?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
pub struct QuotaRefreshRequest {
    #[serde(default)]
    pub auth_keys: Vec<String>,
}

pub async fn start_quota_refresh(
    State(state): State<AppState>,
    Json(req): Json<QuotaRefreshRequest>,
) -> AppResult<(StatusCode, Json<RefreshTask>)> {
    if req.auth_keys.iter().all(|k| k.trim().is_empty()) {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "auth_keys_required",
            "auth_keys must contain at least one key",
        ));
    }
    let task = state
        .refresh_tasks
        .start_batch(state.quota_poller.clone(), req.auth_keys);
    tracing::info!(task_id = %task.id, total = task.total, "quota refresh batch started");
    Ok((StatusCode::ACCEPTED, Json(task)))
}

pub async fn get_quota_refresh(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<RefreshTask>> {
    state.refresh_tasks.get(&task_id).map(Json).ok_or_else(|| {
        AppError::new(StatusCode::NOT_FOUND, "task_not_found", "refresh task not found")
            .with_type("not_found_error")
    })
}

pub async fn refresh_auth_quota(
    State(state): State<AppState>,
    Path(auth_key): Path<String>,
) -> AppResult<Json<Value>> {
    state.quota_poller.refresh_by_auth_key(&auth_key).await?;
    Ok(Json(json!({ "auth_key": auth_key, "refreshed": true })))
}

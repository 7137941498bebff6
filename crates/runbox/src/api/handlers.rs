//! REST handlers for the compiler endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use log::info;
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Largest accepted source submission, in bytes.
const MAX_CODE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub session_id: String,
    pub language: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub languages: Vec<String>,
}

/// POST /compiler/execute
///
/// Accepts the request and starts the run; output flows over the session's
/// stream channel. Replies 202 before the program produces anything.
pub async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> ApiResult<(StatusCode, Json<AckResponse>)> {
    if req.session_id.trim().is_empty() {
        return Err(ApiError::bad_request("sessionId must not be empty"));
    }
    if req.code.len() > MAX_CODE_BYTES {
        return Err(ApiError::bad_request(format!(
            "code exceeds the {} byte limit",
            MAX_CODE_BYTES
        )));
    }

    info!(
        "Execute request: session {} language {}",
        req.session_id, req.language
    );
    state
        .controller
        .execute(&req.session_id, &req.language, &req.code)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(AckResponse { success: true })))
}

/// POST /compiler/{session_id}/end
///
/// Idempotent teardown: ending an unknown or already ended session still
/// replies 200.
pub async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<AckResponse>> {
    info!("End request for session {}", session_id);
    state.sessions.end(&session_id).await;
    Ok(Json(AckResponse { success: true }))
}

/// GET /healthz
pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        languages: state
            .registry
            .language_ids()
            .into_iter()
            .map(String::from)
            .collect(),
    })
}

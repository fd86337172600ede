use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;

use coderun_core::{
    AdmissionError, CancelError, RegistryError, RunRequest, Session, SessionId, SessionSummary,
};

use super::AppState;

/// JSON error body: `{"error": <code>, "message": <text>}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.code, "message": self.message }));
        (self.status, body).into_response()
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        let status = match e {
            AdmissionError::Busy { .. } => StatusCode::CONFLICT,
            AdmissionError::InvalidLanguage(_) | AdmissionError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            AdmissionError::SandboxUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<CancelError> for ApiError {
    fn from(e: CancelError) -> Self {
        let status = match e {
            CancelError::NotFound(_) => StatusCode::NOT_FOUND,
            CancelError::AlreadyTerminal { .. } => StatusCode::CONFLICT,
        };
        Self {
            status,
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: e.to_string(),
        }
    }
}

pub fn parse_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid session id: {}", raw)))
}

pub async fn submit_run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let id = state.registry.submit(request)?;
    Ok((StatusCode::CREATED, Json(json!({ "sessionId": id }))))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub workspace: Option<String>,
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Vec<SessionSummary>> {
    Json(state.registry.list(params.workspace.as_deref()))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.registry.get(id)?))
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&id)?;
    state.registry.cancel(id)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Serialize)]
pub struct LanguageInfo {
    pub language: String,
    pub toolchain: String,
    pub binary: String,
    pub available: bool,
}

pub async fn list_languages(State(state): State<AppState>) -> Json<Vec<LanguageInfo>> {
    let languages = state
        .registry
        .runner()
        .availability()
        .await
        .into_iter()
        .map(|(language, toolchain, available)| LanguageInfo {
            language: language.to_string(),
            toolchain: toolchain.name().to_string(),
            binary: toolchain.binary_path().display().to_string(),
            available,
        })
        .collect();
    Json(languages)
}

use axum::extract::{Path, State};
use axum::response::Json;

use coderun_core::Problem;

use super::runs::{parse_id, ApiError};
use super::AppState;

pub async fn run_problems(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Problem>>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.registry.problems(id)?))
}

pub async fn workspace_problems(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
) -> Json<Vec<Problem>> {
    Json(state.registry.workspace_problems(&workspace))
}

mod problems;
mod runs;
mod sse;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use coderun_core::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    /// Flips to `true` when the server starts shutting down; open event
    /// streams end when it does
    pub shutdown: watch::Receiver<bool>,
}

pub fn create_router(registry: SessionRegistry, shutdown: watch::Receiver<bool>) -> Router {
    let state = AppState { registry, shutdown };

    Router::new()
        .route("/api/runs", post(runs::submit_run).get(runs::list_runs))
        .route("/api/runs/live", get(sse::live_updates))
        .route("/api/runs/{id}", get(runs::get_run))
        .route("/api/runs/{id}/cancel", post(runs::cancel_run))
        .route("/api/runs/{id}/events", get(sse::run_events))
        .route("/api/runs/{id}/problems", get(problems::run_problems))
        .route("/api/workspaces/{id}/problems", get(problems::workspace_problems))
        .route("/api/languages", get(runs::list_languages))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

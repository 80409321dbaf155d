//! # REST API Endpoints
//!
//! Read-only view of the edge state for operators and health checks.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Domains currently served by a connected agent, sorted.
    pub domains: Vec<String>,
}

/// `GET /_status`
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        domains: state.registrar.domains(),
    })
}

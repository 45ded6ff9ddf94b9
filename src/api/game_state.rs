//! Pull-style query surface for the committed game state.
//!
//! Serves the same shape the WebSocket pushes, so clients can poll or
//! subscribe interchangeably.

use axum::{extract::State, http::StatusCode, response::Json};

use crate::models::GameSnapshot;
use crate::AppState;

/// GET /api/game-state
///
/// Snapshot of the last fully committed round. 503 only during the brief
/// window before the engine's first initialization commits.
pub async fn get_game_state(
    State(state): State<AppState>,
) -> Result<Json<GameSnapshot>, StatusCode> {
    match state.engine.state() {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

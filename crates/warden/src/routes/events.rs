//! Platform event ingress.

use axum::{Json, extract::State, http::StatusCode};

use crate::gateway::PlatformEvent;
use crate::state::AppState;

/// Accept one platform event and hand it to its pipeline. The ingress
/// answers immediately; event processing is fire-and-forget with its own
/// error logging.
pub async fn ingest(State(state): State<AppState>, Json(event): Json<PlatformEvent>) -> StatusCode {
    state.dispatch(event);
    StatusCode::ACCEPTED
}

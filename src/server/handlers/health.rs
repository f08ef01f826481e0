use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tracing::warn;

use super::ApiError;
use crate::server::AppState;

/// Engine name and backend reachability. Fails with 503 when the backend
/// cannot be reached.
pub async fn health_check(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    if let Err(e) = state.engine.ping().await {
        warn!(error = %e, "health check failed");
        return Err(e.into());
    }
    Ok(Json(json!({
        "status": "ok",
        "engine": state.engine.name(),
        "index_prefix": state.config.search_engine.index_prefix,
    })))
}

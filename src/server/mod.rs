pub mod handlers;
pub mod routes;

use std::sync::Arc;

use crate::config::Config;
use crate::engine::SearchEngine;

/// Shared state injected into handlers via axum's State extractor.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn SearchEngine>,
    pub config: Arc<Config>,
}

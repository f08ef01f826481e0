use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use sift::config::Config;
use sift::engine::EngineRegistry;
use sift::server::routes::build_router;
use sift::server::AppState;

#[tokio::main]
async fn main() {
    // Load .env
    let _ = dotenvy::dotenv();

    // Load config first (needed for logging setup)
    let config = Config::load(None).expect("failed to load config");

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .init();
        }
    }

    tracing::info!("sift starting");
    sift::metrics::init();

    let registry = EngineRegistry::with_builtin_engines();
    let engine = registry
        .build(&config)
        .await
        .expect("failed to initialise search engine");

    if let Err(e) = engine.ping().await {
        tracing::warn!(error = %e, engine = engine.name(), "search backend not reachable yet");
    }

    let state = AppState {
        engine: engine.clone(),
        config: Arc::new(config.clone()),
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(addr = %addr, "listening");

    let listener = TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .expect("server error");

    if let Err(e) = engine.close().await {
        tracing::warn!(error = %e, "failed to close search engine");
    }
}

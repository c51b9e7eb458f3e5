//! Gateway entry point.
//!
//! Wires configuration, the SQLite store, the secret provider, the
//! dispatcher, and the async log writer into the axum router, then serves
//! until SIGINT/SIGTERM and drains the log queue on the way out.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use llm_gateway::api::{
    admin_router, chat_completions, claude_messages, create_http_client,
    gemini_generate_content, health_handler, AppState,
};
use llm_gateway::core::middleware::{admin_auth_middleware, rate_limit_middleware};
use llm_gateway::core::{
    init_tracing, load_or_create_secret_key, AppConfig, AsyncRequestLogger, Database,
    IpRateLimiter,
};
use llm_gateway::services::{
    AesGcmSecretProvider, Dispatcher, KeyHealthStore, NoopSecretProvider, SecretProvider,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before reading any environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env();
    init_tracing(&config);

    let db = Database::connect(&config.database_path)
        .await
        .with_context(|| format!("failed to open database at {}", config.database_path))?;

    if let Some(initial_key) = db.seed_defaults().await? {
        // Printed exactly once, on first boot
        println!("Initial admin key: {}", initial_key);
        tracing::info!("generated initial admin key");
    }

    let secrets: Arc<dyn SecretProvider> = match &config.secret_file {
        Some(path) => {
            let hex = load_or_create_secret_key(path)
                .with_context(|| format!("failed to load secret key from {}", path))?;
            tracing::info!(path, "credential encryption enabled");
            Arc::new(AesGcmSecretProvider::from_hex_key(&hex)?)
        }
        None => Arc::new(NoopSecretProvider),
    };

    let key_health = Arc::new(KeyHealthStore::new());
    let dispatcher = Arc::new(Dispatcher::new(db.clone(), secrets, key_health));
    let groups = dispatcher.refresh().await?;
    tracing::info!(groups, "initial routing snapshot loaded");

    let request_logger = Arc::new(AsyncRequestLogger::new(db.clone(), config.log_retention));

    let port = match config.port {
        Some(port) => port,
        None => db.load_settings().await?.port as u16,
    };

    let state = Arc::new(AppState {
        config,
        db,
        dispatcher,
        request_logger: request_logger.clone(),
        rate_limiter: IpRateLimiter::new(),
        http_client: create_http_client(),
    });

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("starting LLM gateway on {}", addr);
    tracing::info!("OpenAI API:  POST /v1/chat/completions");
    tracing::info!("Claude API:  POST /v1/messages");
    tracing::info!("Gemini API:  POST /v1beta/models/:model");
    tracing::info!("Admin API:   /admin/*");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain and flush pending request logs before exiting
    tracing::info!("shutting down, draining request logs");
    request_logger.close().await;

    Ok(())
}

/// Assemble the router: proxy endpoints behind rate limiting + admin-key
/// auth, admin surface behind auth only, health open.
fn build_router(state: Arc<AppState>) -> Router {
    let proxy_routes = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(claude_messages))
        .route("/v1beta/models/:model", post(gemini_generate_content))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    let admin_routes = admin_router().layer(middleware::from_fn_with_state(
        state.clone(),
        admin_auth_middleware,
    ));

    Router::new()
        .merge(proxy_routes)
        .nest("/admin", admin_routes)
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

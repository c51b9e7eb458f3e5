//! Application state and the client-facing chat-completions handler.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::api::models::ChatCompletionRequest;
use crate::api::proxy::{dispatch_chat, outcome_into_response, DispatchContext};
use crate::core::config::AppConfig;
use crate::core::database::Database;
use crate::core::middleware::{client_ip, user_agent, IpRateLimiter};
use crate::core::request_logger::{AsyncRequestLogger, RequestLog};
use crate::core::AppError;
use crate::services::dispatcher::Dispatcher;

/// Shared application state.
pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub dispatcher: Arc<Dispatcher>,
    pub request_logger: Arc<AsyncRequestLogger>,
    pub rate_limiter: IpRateLimiter,
    pub http_client: reqwest::Client,
}

/// Shared upstream HTTP client: one instance, large idle pool, HTTP/2.
/// No global timeout; per-request deadlines come from the model config and
/// streaming relies on transport idle limits.
pub fn create_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .tcp_keepalive(std::time::Duration::from_secs(60))
        .http2_keep_alive_interval(std::time::Duration::from_secs(30))
        .http2_keep_alive_timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("failed to build HTTP client")
}

/// `POST /v1/chat/completions` — the OpenAI-compatible entry point.
///
/// The `model` field carries the routing token. The body is parsed manually
/// so malformed JSON surfaces as the OpenAI-shaped 400 envelope.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let err = AppError::InvalidRequest(format!("invalid request body: {}", e));
            submit_log(&state, &headers, "/v1/chat/completions", started, 400, None);
            return err.into_response();
        }
    };

    tracing::info!(
        model = %request.model,
        stream = request.stream,
        ip = %client_ip(&headers),
        "chat completion request"
    );

    let mut ctx = DispatchContext::default();
    let result = dispatch_chat(&state, &request, &mut ctx).await;

    let (status, response) = match result {
        Ok(outcome) => {
            let response = outcome_into_response(outcome);
            (ctx.status, response)
        }
        Err(err) => {
            let response = err.into_response();
            (response.status().as_u16(), response)
        }
    };

    submit_log(
        &state,
        &headers,
        "/v1/chat/completions",
        started,
        status,
        Some(&ctx),
    );
    response
}

/// Build and enqueue the request log record.
pub fn submit_log(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
    started: Instant,
    status: u16,
    ctx: Option<&DispatchContext>,
) {
    let mut record = RequestLog {
        path: path.to_string(),
        status_code: status,
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        client_ip: client_ip(headers),
        user_agent: user_agent(headers),
        ..Default::default()
    };
    if let Some(ctx) = ctx {
        record.group_id = ctx.group_id.clone();
        record.provider = ctx.provider.clone();
        record.upstream_model = ctx.upstream_model.clone();
        record.model_config_id = ctx.model_config_id;
        if let Some(error) = &ctx.error {
            record = record.with_error(error);
        }
    }
    state.request_logger.log(record);
}

/// `GET /health` — liveness plus a routing-table summary.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.dispatcher.snapshot();
    Json(json!({
        "status": "ok",
        "groups": snapshot.len(),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

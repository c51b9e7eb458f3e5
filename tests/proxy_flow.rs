//! End-to-end dispatch tests against mocked upstreams.
//!
//! These exercise the full proxy path (routing, retry, adapter translation,
//! logging) with wiremock standing in for the upstream providers.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::post,
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llm_gateway::api::{
    chat_completions, claude_messages, create_http_client, gemini_generate_content, AppState,
};
use llm_gateway::core::{AppConfig, AsyncRequestLogger, Database, IpRateLimiter};
use llm_gateway::services::{Dispatcher, KeyHealthStore, NoopSecretProvider};

// ============================================================================
// Harness
// ============================================================================

async fn test_state() -> Arc<AppState> {
    let db = Database::connect_in_memory().await.unwrap();
    db.seed_defaults().await.unwrap();

    let key_health = Arc::new(KeyHealthStore::new());
    let dispatcher = Arc::new(Dispatcher::new(
        db.clone(),
        Arc::new(NoopSecretProvider),
        key_health,
    ));
    let request_logger = Arc::new(AsyncRequestLogger::new(db.clone(), 100));

    Arc::new(AppState {
        config: AppConfig::default(),
        db,
        dispatcher,
        request_logger,
        rate_limiter: IpRateLimiter::new(),
        http_client: create_http_client(),
    })
}

fn test_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(claude_messages))
        .route("/v1beta/models/:model", post(gemini_generate_content))
        .with_state(state)
}

/// Seed one group; returns the db ids of its models in order.
async fn seed_group(
    state: &AppState,
    group_id: &str,
    strategy: &str,
    models: &[(&str, &str, &[&str])],
) -> Vec<i64> {
    let group = state.db.create_group(group_id, strategy).await.unwrap();
    let mut ids = Vec::new();
    for (provider, url, keys) in models {
        let model = state
            .db
            .create_model(group.id, provider, url, "upstream-model", 30)
            .await
            .unwrap();
        for key in *keys {
            state.db.create_api_key(model.id, key).await.unwrap();
        }
        ids.push(model.id);
    }
    state.dispatcher.refresh().await.unwrap();
    ids
}

fn chat_body(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "hello"}],
        "stream": stream,
    })
}

async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

fn openai_success_body() -> Value {
    json!({
        "id": "chatcmpl-up",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "upstream-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "pong"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
    })
}

// ============================================================================
// S1: happy path with stats and logs
// ============================================================================

#[tokio::test]
async fn s1_happy_path_records_stats_and_logs() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body()))
        .expect(1)
        .mount(&upstream)
        .await;

    let state = test_state().await;
    let base = format!("{}/v1", upstream.uri());
    let model_ids = seed_group(&state, "G", "round_robin", &[("openai", &base, &["sk-K1"])]).await;

    let (status, body) = post_json(
        test_app(state.clone()),
        "/v1/chat/completions",
        chat_body("G", false),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["choices"][0]["message"]["content"], "pong");

    // Flush the async writer, then check persisted stats and logs
    state.request_logger.close().await;

    let stats = state.db.stats_for_group(
        state.db.get_group("G").await.unwrap().unwrap().id,
    )
    .await
    .unwrap();
    let row = stats[0].1.as_ref().expect("stats row exists");
    assert_eq!(row.model_config_id, model_ids[0]);
    assert_eq!(row.success, 1);
    assert_eq!(row.error, 0);
    assert_eq!(row.request_count, 1);

    let logs = state.db.list_request_logs(10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status_code, 200);
    assert_eq!(logs[0].group_id.as_deref(), Some("G"));
}

// ============================================================================
// S3: 429 on the first model fails over to the second
// ============================================================================

#[tokio::test]
async fn s3_rate_limited_model_fails_over() {
    let m1 = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({"error": "slow down"})))
        .expect(1)
        .mount(&m1)
        .await;

    let m2 = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body()))
        .expect(1)
        .mount(&m2)
        .await;

    let state = test_state().await;
    let b1 = format!("{}/v1", m1.uri());
    let b2 = format!("{}/v1", m2.uri());
    seed_group(
        &state,
        "G",
        "round_robin",
        &[("openai", &b1, &["sk-K1"]), ("openai", &b2, &["sk-K2"])],
    )
    .await;

    let (status, body) = post_json(
        test_app(state.clone()),
        "/v1/chat/completions",
        chat_body("G", false),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["choices"][0]["message"]["content"], "pong");

    // The 429 put K1 into cooldown
    assert!(!state.dispatcher.key_health().is_available("sk-K1"));
    assert!(state.dispatcher.key_health().is_available("sk-K2"));
}

// ============================================================================
// S4: hard error skips the model without cooling its key
// ============================================================================

#[tokio::test]
async fn s4_hard_error_skips_model_without_cooldown() {
    let m1 = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "no such model"})))
        .expect(1)
        .mount(&m1)
        .await;

    let m2 = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body()))
        .expect(1)
        .mount(&m2)
        .await;

    let state = test_state().await;
    let b1 = format!("{}/v1", m1.uri());
    let b2 = format!("{}/v1", m2.uri());
    seed_group(
        &state,
        "G",
        "round_robin",
        &[("openai", &b1, &["sk-K1"]), ("openai", &b2, &["sk-K2"])],
    )
    .await;

    let (status, _) = post_json(
        test_app(state.clone()),
        "/v1/chat/completions",
        chat_body("G", false),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // 404 is a config error: no health action against the key
    assert!(state.dispatcher.key_health().is_available("sk-K1"));
}

// ============================================================================
// S5: pinned routing never touches other models
// ============================================================================

#[tokio::test]
async fn s5_pinned_routing_confined_to_target_model() {
    let m1 = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body()))
        .expect(0)
        .mount(&m1)
        .await;

    let m2 = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "boom"})))
        .expect(1)
        .mount(&m2)
        .await;

    let state = test_state().await;
    let b1 = format!("{}/v1", m1.uri());
    let b2 = format!("{}/v1", m2.uri());
    seed_group(
        &state,
        "G",
        "round_robin",
        &[("openai", &b1, &["sk-K1"]), ("openai", &b2, &["sk-K2"])],
    )
    .await;

    let (status, body) = post_json(
        test_app(state.clone()),
        "/v1/chat/completions",
        chat_body("G$2", false),
    )
    .await;

    // Exhausting the pinned model forwards the last upstream status
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"], "boom");
}

// ============================================================================
// S6: Gemini stream translated to OpenAI frames
// ============================================================================

#[tokio::test]
async fn s6_gemini_stream_translation() {
    let upstream = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello\"}]},\"index\":0}]}\n\n",
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" World\"}]},\"finishReason\":\"STOP\",\"index\":0}]}\n\n",
    );
    Mock::given(method("POST"))
        .and(query_param("alt", "sse"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let state = test_state().await;
    let base = format!("{}/v1beta/models/gemini-pro:generateContent", upstream.uri());
    seed_group(&state, "G", "round_robin", &[("gemini", &base, &["sk-G1"])]).await;

    let (status, body) = post_json(
        test_app(state.clone()),
        "/v1/chat/completions",
        chat_body("G", true),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body).unwrap();
    let frames: Vec<&str> = text
        .split("\n\n")
        .filter(|f| !f.trim().is_empty())
        .collect();

    // Terminated by the canonical [DONE]
    assert_eq!(*frames.last().unwrap(), "data: [DONE]");

    // First frame carries the role delta; reassembled content is preserved
    let mut reassembled = String::new();
    let mut saw_role = false;
    for frame in &frames[..frames.len() - 1] {
        let payload = frame.strip_prefix("data: ").unwrap();
        let chunk: Value = serde_json::from_str(payload).unwrap();
        let delta = &chunk["choices"][0]["delta"];
        if delta["role"] == "assistant" {
            saw_role = true;
        }
        if let Some(content) = delta["content"].as_str() {
            reassembled.push_str(content);
        }
    }
    assert!(saw_role);
    assert_eq!(reassembled, "Hello World");
}

// ============================================================================
// Error surface
// ============================================================================

#[tokio::test]
async fn malformed_json_yields_openai_error_envelope() {
    let state = test_state().await;
    let app = test_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let parsed: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(parsed["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn unknown_group_yields_404() {
    let state = test_state().await;
    let (status, body) = post_json(
        test_app(state),
        "/v1/chat/completions",
        chat_body("ghost", false),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn group_without_keys_yields_503() {
    let state = test_state().await;
    seed_group(&state, "empty", "fallback", &[("openai", "https://up.example/v1", &[])]).await;

    let (status, body) = post_json(
        test_app(state),
        "/v1/chat/completions",
        chat_body("empty", false),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["type"], "service_unavailable");
}

#[tokio::test]
async fn out_of_bounds_pin_yields_400() {
    let state = test_state().await;
    seed_group(&state, "G", "fallback", &[("openai", "https://up.example/v1", &["k"])]).await;

    let (status, _) = post_json(
        test_app(state),
        "/v1/chat/completions",
        chat_body("G$7", false),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// Native inbound endpoints
// ============================================================================

#[tokio::test]
async fn claude_native_request_roundtrip() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body()))
        .expect(1)
        .mount(&upstream)
        .await;

    let state = test_state().await;
    let base = format!("{}/v1", upstream.uri());
    seed_group(&state, "G", "round_robin", &[("openai", &base, &["sk-K1"])]).await;

    let (status, body) = post_json(
        test_app(state),
        "/v1/messages",
        json!({
            "model": "G",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hello"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["type"], "message");
    assert_eq!(parsed["role"], "assistant");
    assert_eq!(parsed["content"][0]["text"], "pong");
    assert_eq!(parsed["stop_reason"], "end_turn");
    assert_eq!(parsed["usage"]["input_tokens"], 3);
}

#[tokio::test]
async fn gemini_native_request_roundtrip() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body()))
        .expect(1)
        .mount(&upstream)
        .await;

    let state = test_state().await;
    let base = format!("{}/v1", upstream.uri());
    seed_group(&state, "G", "round_robin", &[("openai", &base, &["sk-K1"])]).await;

    let (status, body) = post_json(
        test_app(state),
        "/v1beta/models/G:generateContent",
        json!({
            "contents": [{"role": "user", "parts": [{"text": "hello"}]}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        parsed["candidates"][0]["content"]["parts"][0]["text"],
        "pong"
    );
    assert_eq!(parsed["candidates"][0]["finishReason"], "STOP");
    assert_eq!(parsed["usageMetadata"]["totalTokenCount"], 4);
}

// ============================================================================
// Upstream request shaping
// ============================================================================

#[tokio::test]
async fn upstream_model_name_rewritten_and_bearer_set() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(wiremock::matchers::header("authorization", "Bearer sk-K1"))
        .and(wiremock::matchers::body_partial_json(
            json!({"model": "upstream-model"}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body()))
        .expect(1)
        .mount(&upstream)
        .await;

    let state = test_state().await;
    let base = format!("{}/v1", upstream.uri());
    seed_group(&state, "G", "round_robin", &[("openai", &base, &["sk-K1"])]).await;

    let (status, _) = post_json(
        test_app(state),
        "/v1/chat/completions",
        chat_body("G", false),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

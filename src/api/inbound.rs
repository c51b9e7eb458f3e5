//! Native-protocol inbound endpoints.
//!
//! `POST /v1/messages` accepts Claude's Messages shape and
//! `POST /v1beta/models/:model` accepts Gemini's generateContent shape. Both
//! run the reverse translation around the OpenAI-shaped dispatch path:
//! native-in → OpenAI-shaped → dispatch → OpenAI-shaped upstream-out →
//! response translated back into the client's native shape, streaming
//! included.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use futures::{Stream, StreamExt};

use crate::adapter::claude::ClaudeRequest;
use crate::adapter::gemini::GeminiRequest;
use crate::adapter::sse::{data_lines, SseFrameBuffer};
use crate::api::handlers::{submit_log, AppState};
use crate::api::models::ChatCompletionResponse;
use crate::api::proxy::{dispatch_chat, sse_response, DispatchContext, DispatchOutcome};
use crate::core::AppError;
use crate::mapper::{
    claude_request_to_openai, claude_stream_done_events, gemini_request_to_openai,
    openai_chunk_to_claude_events, openai_response_to_claude, openai_response_to_gemini,
    ClaudeStreamState,
};

type SseBody = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// Re-frame an OpenAI-shaped SSE stream, mapping each `data:` payload into
/// native bytes. The mapper receives `None` once for the `[DONE]` terminator.
fn map_openai_stream<F>(body: SseBody, mut map: F) -> SseBody
where
    F: FnMut(Option<&ChatCompletionResponse>) -> Vec<u8> + Send + 'static,
{
    struct Pump {
        upstream: SseBody,
        frames: SseFrameBuffer,
        done: bool,
    }

    let pump = Pump {
        upstream: body,
        frames: SseFrameBuffer::new(),
        done: false,
    };

    let stream = futures::stream::unfold((pump, map), |(mut pump, mut map)| async move {
        if pump.done {
            return None;
        }
        loop {
            match pump.upstream.next().await {
                Some(Ok(bytes)) => {
                    let mut out = Vec::new();
                    for frame in pump.frames.push(&bytes) {
                        for payload in data_lines(&frame) {
                            if payload.trim() == "[DONE]" {
                                out.extend(map(None));
                                pump.done = true;
                                break;
                            }
                            if let Ok(chunk) =
                                serde_json::from_str::<ChatCompletionResponse>(payload)
                            {
                                out.extend(map(Some(&chunk)));
                            }
                        }
                        if pump.done {
                            break;
                        }
                    }
                    if out.is_empty() && !pump.done {
                        continue;
                    }
                    return Some((Ok::<Bytes, io::Error>(Bytes::from(out)), (pump, map)));
                }
                Some(Err(e)) => {
                    tracing::error!("inbound stream mapping error: {}", e);
                    pump.done = true;
                    let out = map(None);
                    return Some((Ok(Bytes::from(out)), (pump, map)));
                }
                None => {
                    pump.done = true;
                    let out = map(None);
                    if out.is_empty() {
                        return None;
                    }
                    return Some((Ok(Bytes::from(out)), (pump, map)));
                }
            }
        }
    });

    Box::pin(stream)
}

// ============================================================================
// Claude-native: POST /v1/messages
// ============================================================================

pub async fn claude_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let claude_request: ClaudeRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let err = AppError::InvalidRequest(format!("invalid claude request: {}", e));
            submit_log(&state, &headers, "/v1/messages", started, 400, None);
            return err.into_response();
        }
    };
    let openai_request = match claude_request_to_openai(&claude_request) {
        Ok(request) => request,
        Err(e) => {
            submit_log(&state, &headers, "/v1/messages", started, 400, None);
            return e.into_response();
        }
    };

    let mut ctx = DispatchContext::default();
    let result = dispatch_chat(&state, &openai_request, &mut ctx).await;

    let (status, response) = match result {
        Ok(DispatchOutcome::Json {
            status,
            headers: upstream_headers,
            body,
        }) => {
            if status.as_u16() != 200 {
                // Upstream error envelope is forwarded untouched
                let mut builder = Response::builder().status(status);
                if let Some(map) = builder.headers_mut() {
                    *map = upstream_headers;
                }
                (
                    status.as_u16(),
                    builder.body(Body::from(body)).expect("response build"),
                )
            } else {
                match serde_json::from_slice::<ChatCompletionResponse>(&body) {
                    Ok(openai) => {
                        let claude = openai_response_to_claude(&openai);
                        (200, Json(claude).into_response())
                    }
                    Err(e) => {
                        let err =
                            AppError::Internal(format!("failed to parse upstream response: {}", e));
                        (500, err.into_response())
                    }
                }
            }
        }
        Ok(DispatchOutcome::Stream { body }) => {
            let mut stream_state = ClaudeStreamState::default();
            let native = map_openai_stream(body, move |chunk| match chunk {
                Some(chunk) => openai_chunk_to_claude_events(chunk, &mut stream_state)
                    .concat()
                    .into_bytes(),
                None => claude_stream_done_events(&mut stream_state)
                    .concat()
                    .into_bytes(),
            });
            (200, sse_response(Body::from_stream(native)))
        }
        Err(err) => {
            let response = err.into_response();
            (response.status().as_u16(), response)
        }
    };

    submit_log(&state, &headers, "/v1/messages", started, status, Some(&ctx));
    response
}

// ============================================================================
// Gemini-native: POST /v1beta/models/:model
// ============================================================================

pub async fn gemini_generate_content(
    State(state): State<Arc<AppState>>,
    Path(model_and_action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let path = "/v1beta/models";

    // Path parameter carries `<model>:generateContent` or
    // `<model>:streamGenerateContent`
    let (model, action) = match model_and_action.split_once(':') {
        Some((model, action)) => (model.to_string(), action.to_string()),
        None => (model_and_action.clone(), "generateContent".to_string()),
    };
    let stream = action.contains("streamGenerateContent");

    let gemini_request: GeminiRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let err = AppError::InvalidRequest(format!("invalid gemini request: {}", e));
            submit_log(&state, &headers, path, started, 400, None);
            return err.into_response();
        }
    };

    let openai_request = match gemini_request_to_openai(&gemini_request, &model, stream) {
        Ok(request) => request,
        Err(e) => {
            submit_log(&state, &headers, path, started, 400, None);
            return e.into_response();
        }
    };

    let mut ctx = DispatchContext::default();
    let result = dispatch_chat(&state, &openai_request, &mut ctx).await;

    let (status, response) = match result {
        Ok(DispatchOutcome::Json {
            status,
            headers: upstream_headers,
            body,
        }) => {
            if status.as_u16() != 200 {
                let mut builder = Response::builder().status(status);
                if let Some(map) = builder.headers_mut() {
                    *map = upstream_headers;
                }
                (
                    status.as_u16(),
                    builder.body(Body::from(body)).expect("response build"),
                )
            } else {
                match serde_json::from_slice::<ChatCompletionResponse>(&body) {
                    Ok(openai) => {
                        let gemini = openai_response_to_gemini(&openai);
                        (200, Json(gemini).into_response())
                    }
                    Err(e) => {
                        let err =
                            AppError::Internal(format!("failed to parse upstream response: {}", e));
                        (500, err.into_response())
                    }
                }
            }
        }
        Ok(DispatchOutcome::Stream { body }) => {
            let native = map_openai_stream(body, move |chunk| match chunk {
                Some(chunk) => {
                    let gemini = openai_response_to_gemini(chunk);
                    match serde_json::to_string(&gemini) {
                        Ok(payload) => format!("data: {}\n\n", payload).into_bytes(),
                        Err(_) => Vec::new(),
                    }
                }
                // Gemini streams simply end; no terminator frame
                None => Vec::new(),
            });
            (200, sse_response(Body::from_stream(native)))
        }
        Err(err) => {
            let response = err.into_response();
            (response.status().as_u16(), response)
        }
    };

    submit_log(&state, &headers, path, started, status, Some(&ctx));
    response
}

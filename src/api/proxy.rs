//! The proxy engine: retry loop, upstream calls, and response plumbing.
//!
//! [`dispatch_chat`] drives the dispatcher's retry state machine for one
//! OpenAI-shaped request: for each attempt it selects `(model, credential)`,
//! invokes the provider adapter, classifies the outcome, and feeds it back
//! into the credential health store and the retry cursor. Success returns
//! either a translated JSON body or a translated SSE stream; terminal
//! failure forwards the last upstream status verbatim (headers sanitized) or
//! produces a 502 when only network failures occurred.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::adapter::sse::SseFrameBuffer;
use crate::adapter::{adapter_for, StreamTranslator, UpstreamContext};
use crate::api::handlers::AppState;
use crate::api::models::ChatCompletionRequest;
use crate::core::error::AppError;
use crate::core::mask_key;
use crate::services::dispatcher::{classify_status, classify_transport, FailureClass};

/// Outcome of a successful (or upstream-terminal) dispatch.
pub enum DispatchOutcome {
    /// A complete body: a translated 200 response or a verbatim upstream
    /// error with sanitized headers.
    Json {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    /// A 200 streaming response translated into OpenAI-shaped SSE frames.
    Stream {
        body: Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>,
    },
}

/// What the dispatch learned about the request, for the log record.
#[derive(Debug, Default)]
pub struct DispatchContext {
    pub group_id: Option<String>,
    pub provider: Option<String>,
    pub upstream_model: Option<String>,
    pub model_config_id: Option<i64>,
    pub status: u16,
    pub error: Option<String>,
}

/// Response headers that must not be forwarded from upstream.
const DROPPED_HEADERS: &[&str] = &[
    "content-length",
    "content-encoding",
    "transfer-encoding",
    "connection",
    "access-control-allow-origin",
    "access-control-allow-methods",
    "access-control-allow-headers",
    "access-control-allow-credentials",
    "date",
    "server",
];

/// Armed while an upstream attempt is in flight.
///
/// When the client disconnects mid-attempt ("broken pipe" / "connection
/// reset" on the write side), hyper drops the request future; this guard's
/// `Drop` then runs before any upstream outcome was observed. The aborted
/// attempt is recorded as a client disconnect — distinct from an upstream
/// failure — and no credential health feedback fires, so a disconnect never
/// cools down or kills a key. A completed `send()` disarms the guard on both
/// arms before classification.
struct AttemptGuard {
    model: String,
    key: String,
    armed: bool,
}

impl AttemptGuard {
    fn new(model: &str, key: &str) -> Self {
        Self {
            model: model.to_string(),
            key: mask_key(key),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::info!(
                model = %self.model,
                key = %self.key,
                "client disconnected mid-attempt, upstream call aborted; credential not penalized"
            );
        }
    }
}

/// Stream wrapper that detects client disconnects on streaming responses.
///
/// The translated stream ends only after the `data: [DONE]` terminator, so a
/// drop before the inner stream ran to completion means the client stopped
/// consuming. Dropping the wrapper drops the upstream body stream with it,
/// aborting the upstream call; the disconnect is logged as such rather than
/// as an upstream failure.
pub struct DisconnectStream<S> {
    inner: S,
    model: String,
    completed: bool,
}

impl<S> DisconnectStream<S> {
    pub fn new(inner: S, model: String) -> Self {
        Self {
            inner,
            model,
            completed: false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

impl<S> Stream for DisconnectStream<S>
where
    S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
{
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(None) = polled {
            self.completed = true;
        }
        polled
    }
}

impl<S> Drop for DisconnectStream<S> {
    fn drop(&mut self) {
        if !self.completed {
            tracing::info!(
                model = %self.model,
                "client disconnected mid-stream, upstream call aborted"
            );
        }
    }
}

fn sanitize_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if DROPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Ok(name) = HeaderName::from_bytes(name.as_str().as_bytes()) {
            headers.append(name, value.clone());
        }
    }
    headers
}

/// Drive the full retry loop for one OpenAI-shaped request.
pub async fn dispatch_chat(
    state: &AppState,
    request: &ChatCompletionRequest,
    ctx: &mut DispatchContext,
) -> Result<DispatchOutcome, AppError> {
    let dispatcher = &state.dispatcher;
    let routing = dispatcher.parse_routing(&request.model);
    ctx.group_id = Some(routing.group_id.clone());

    let mut plan = dispatcher.plan(&routing)?;
    let health = dispatcher.key_health().clone();

    // Last upstream-reported failure, forwarded verbatim on exhaustion
    let mut last_upstream: Option<(StatusCode, HeaderMap, Bytes)> = None;
    let mut last_network_error: Option<String> = None;
    let mut attempts = 0usize;

    while attempts < plan.max_attempts {
        let Some(attempt) = plan.next_attempt(&health) else {
            break;
        };
        attempts += 1;

        let model = plan.model(attempt.model_index).clone();
        ctx.provider = Some(model.provider.as_str().to_string());
        ctx.upstream_model = Some(model.upstream_model.clone());
        ctx.model_config_id = Some(model.id);

        let adapter = adapter_for(model.provider);
        let upstream_ctx = UpstreamContext {
            api_key: attempt.key.clone(),
            base_url: model.upstream_url.clone(),
            upstream_model: model.upstream_model.clone(),
            stream: request.stream,
        };

        tracing::info!(
            attempt = attempts,
            max = plan.max_attempts,
            model = %model.upstream_model,
            key = %mask_key(&attempt.key),
            "dispatching upstream attempt"
        );

        let builder = match adapter.build_request(&state.http_client, &upstream_ctx, request) {
            Ok(builder) => builder,
            Err(e) => {
                tracing::warn!("adapter conversion failed: {}", e);
                ctx.error = Some(e.to_string());
                if !plan.apply_failure(FailureClass::OtherClient) {
                    break;
                }
                continue;
            }
        };

        // Streaming requests rely on transport idle limits instead of a
        // wall-clock deadline
        let builder = if request.stream {
            builder
        } else {
            builder.timeout(Duration::from_secs(model.timeout_secs))
        };

        let mut guard = AttemptGuard::new(&model.upstream_model, &attempt.key);
        match builder.send().await {
            Ok(response) => {
                guard.disarm();
                let status = response.status();
                if status.as_u16() == 200 {
                    ctx.status = 200;
                    ctx.error = None;
                    return finish_success(adapter, &upstream_ctx, response, request.stream).await;
                }

                let headers = sanitize_headers(response.headers());
                let body = response.bytes().await.unwrap_or_default();
                let class = classify_status(status.as_u16());
                dispatcher.report_failure(&attempt.key, class);

                ctx.status = status.as_u16();
                ctx.error = Some(String::from_utf8_lossy(&body).into_owned());
                tracing::warn!(
                    attempt = attempts,
                    status = status.as_u16(),
                    class = ?class,
                    "upstream attempt failed"
                );

                last_upstream = Some((status, headers, body));
                if !plan.apply_failure(class) {
                    break;
                }
            }
            Err(e) => {
                guard.disarm();
                let class = classify_transport(&e);
                dispatcher.report_failure(&attempt.key, class);
                ctx.error = Some(e.to_string());
                tracing::warn!(attempt = attempts, class = ?class, "network error: {}", e);

                last_network_error = Some(e.to_string());
                if !plan.apply_failure(class) {
                    break;
                }
            }
        }
    }

    // Terminal failure: forward the last upstream response when one exists
    if let Some((status, headers, body)) = last_upstream {
        ctx.status = status.as_u16();
        return Ok(DispatchOutcome::Json {
            status,
            headers,
            body,
        });
    }

    if last_network_error.is_some() {
        ctx.status = 502;
        return Err(AppError::AllAttemptsFailed { attempts });
    }

    // No attempt ever reached the network: every credential was cooling
    // down or dead
    ctx.status = 503;
    Err(AppError::AllKeysUnavailable(routing.group_id))
}

/// Turn a 200 upstream response into the dispatch outcome.
async fn finish_success(
    adapter: &'static dyn crate::adapter::ProviderAdapter,
    upstream_ctx: &UpstreamContext,
    response: reqwest::Response,
    stream: bool,
) -> Result<DispatchOutcome, AppError> {
    let headers = sanitize_headers(response.headers());

    if stream {
        let translator = adapter.stream_translator();
        let body = translated_sse_stream(response, translator);
        let body = Box::pin(DisconnectStream::new(
            body,
            upstream_ctx.upstream_model.clone(),
        ));
        return Ok(DispatchOutcome::Stream { body });
    }

    let raw = response.bytes().await?;
    // A 200 body the adapter cannot translate is an upstream defect, not a
    // client error
    let translated = adapter
        .translate_body(&raw, upstream_ctx)
        .map_err(|e| AppError::AdapterConversionFailed(e.to_string()))?;
    Ok(DispatchOutcome::Json {
        status: StatusCode::OK,
        headers,
        body: Bytes::from(translated),
    })
}

/// Pump the upstream SSE stream through a per-family translator.
///
/// Frames are split on blank lines with partial tails held across reads; the
/// translator guarantees a terminating `data: [DONE]` frame.
pub fn translated_sse_stream(
    response: reqwest::Response,
    translator: Box<dyn StreamTranslator>,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>> {
    struct Pump {
        upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
        frames: SseFrameBuffer,
        translator: Box<dyn StreamTranslator>,
        finished: bool,
    }

    let pump = Pump {
        upstream: Box::pin(response.bytes_stream()),
        frames: SseFrameBuffer::new(),
        translator,
        finished: false,
    };

    let stream = futures::stream::unfold(pump, |mut pump| async move {
        if pump.finished {
            return None;
        }
        loop {
            match pump.upstream.next().await {
                Some(Ok(bytes)) => {
                    let mut out = Vec::new();
                    for frame in pump.frames.push(&bytes) {
                        let piece = pump.translator.on_frame(&frame);
                        out.extend(piece.bytes);
                        if piece.done {
                            pump.finished = true;
                            break;
                        }
                    }
                    if out.is_empty() && !pump.finished {
                        // Frame still incomplete; keep reading
                        continue;
                    }
                    return Some((Ok::<Bytes, io::Error>(Bytes::from(out)), pump));
                }
                Some(Err(e)) => {
                    tracing::error!("upstream stream error: {}", e);
                    pump.finished = true;
                    // Close the outbound stream cleanly for the client
                    let out = pump.translator.finish();
                    return Some((Ok(Bytes::from(out)), pump));
                }
                None => {
                    pump.finished = true;
                    let mut out = Vec::new();
                    if let Some(rest) = pump.frames.take_remaining() {
                        let piece = pump.translator.on_frame(&rest);
                        out.extend(piece.bytes);
                    }
                    out.extend(pump.translator.finish());
                    if out.is_empty() {
                        return None;
                    }
                    return Some((Ok(Bytes::from(out)), pump));
                }
            }
        }
    });

    Box::pin(stream)
}

/// Convert a dispatch outcome into the client-facing axum response.
pub fn outcome_into_response(outcome: DispatchOutcome) -> Response {
    match outcome {
        DispatchOutcome::Json {
            status,
            headers,
            body,
        } => {
            let mut builder = Response::builder().status(status);
            if let Some(map) = builder.headers_mut() {
                *map = headers;
                // Upstream content-type survives sanitization; default to
                // JSON when the upstream never set one
                if !map.contains_key("content-type") {
                    map.insert(
                        "content-type",
                        "application/json".parse().expect("static header value"),
                    );
                }
            }
            builder.body(Body::from(body)).expect("response build")
        }
        DispatchOutcome::Stream { body } => sse_response(Body::from_stream(body)),
    }
}

/// Standard SSE response headers.
pub fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .expect("response build")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_attempt_guard_disarm() {
        let mut guard = AttemptGuard::new("gpt-4o", "sk-12345678abcd");
        assert!(guard.armed);
        // Masked form only; the plaintext never reaches the log fields
        assert!(!guard.key.contains("12345678"));
        guard.disarm();
        assert!(!guard.armed);
    }

    #[tokio::test]
    async fn test_disconnect_stream_tracks_completion() {
        let frames: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[]}\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let mut wrapped =
            DisconnectStream::new(Box::pin(futures::stream::iter(frames)), "m".to_string());

        assert!(wrapped.next().await.is_some());
        assert!(!wrapped.is_completed());
        assert!(wrapped.next().await.is_some());
        // Completion is only observed once the inner stream ends
        assert!(!wrapped.is_completed());
        assert!(wrapped.next().await.is_none());
        assert!(wrapped.is_completed());
    }

    #[tokio::test]
    async fn test_disconnect_stream_incomplete_on_early_drop() {
        let frames: Vec<Result<Bytes, io::Error>> =
            vec![Ok(Bytes::from_static(b"data: {\"choices\":[]}\n\n"))];
        let mut wrapped =
            DisconnectStream::new(Box::pin(futures::stream::iter(frames)), "m".to_string());
        assert!(wrapped.next().await.is_some());
        // Dropped before the terminator: reads as a client disconnect
        assert!(!wrapped.is_completed());
        drop(wrapped);
    }

    #[test]
    fn test_header_sanitization() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-length", HeaderValue::from_static("42"));
        upstream.insert("content-encoding", HeaderValue::from_static("gzip"));
        upstream.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        upstream.insert("connection", HeaderValue::from_static("close"));
        upstream.insert("date", HeaderValue::from_static("today"));
        upstream.insert("server", HeaderValue::from_static("nginx"));
        upstream.insert(
            "access-control-allow-origin",
            HeaderValue::from_static("*"),
        );
        upstream.insert("x-request-id", HeaderValue::from_static("abc"));
        upstream.insert("content-type", HeaderValue::from_static("application/json"));

        let sanitized = sanitize_headers(&upstream);
        assert_eq!(sanitized.len(), 2);
        assert!(sanitized.contains_key("x-request-id"));
        assert!(sanitized.contains_key("content-type"));
    }
}

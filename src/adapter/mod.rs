//! Per-provider-family protocol adapters.
//!
//! Each upstream family implements [`ProviderAdapter`]: rewrite the
//! OpenAI-shaped request into the family's wire format (auth headers, URL
//! shaping, body translation), translate 200 responses back into the OpenAI
//! shape, and provide a [`StreamTranslator`] that turns the family's SSE
//! stream into OpenAI-shaped `data:` frames terminated by `data: [DONE]`.
//! Non-200 upstream responses are passed through by the proxy handler and
//! never reach the adapter.

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod sse;

use crate::api::models::ChatCompletionRequest;
use crate::core::error::AppError;
use crate::services::dispatcher::ProviderFamily;

pub use claude::ClaudeAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;
pub use sse::{data_lines, event_name, format_data_frame, SseFrameBuffer, DONE_FRAME};

/// Everything an adapter needs to address one upstream attempt.
#[derive(Debug, Clone)]
pub struct UpstreamContext {
    pub api_key: String,
    pub base_url: String,
    pub upstream_model: String,
    pub stream: bool,
}

/// Output of feeding one SSE frame to a stream translator.
#[derive(Debug, Default)]
pub struct TranslatorOutput {
    /// Outbound OpenAI-shaped SSE bytes (may be empty)
    pub bytes: Vec<u8>,
    /// The source signalled end-of-stream; the terminator has been emitted
    pub done: bool,
}

/// Per-family streaming state machine. One instance per response stream.
pub trait StreamTranslator: Send {
    /// Feed one complete upstream SSE frame (separator stripped).
    fn on_frame(&mut self, frame: &str) -> TranslatorOutput;

    /// The upstream stream ended; emit whatever closes the outbound stream
    /// (at minimum the `data: [DONE]` terminator if not already sent).
    fn finish(&mut self) -> Vec<u8>;
}

/// Uniform per-family adapter contract.
pub trait ProviderAdapter: Send + Sync {
    fn family(&self) -> ProviderFamily;

    /// Build the upstream HTTP request: translated body, auth header(s), and
    /// family-specific URL/query shaping.
    fn build_request(
        &self,
        client: &reqwest::Client,
        ctx: &UpstreamContext,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::RequestBuilder, AppError>;

    /// Translate a 200 non-streaming upstream body into the OpenAI response
    /// shape.
    fn translate_body(&self, body: &[u8], ctx: &UpstreamContext) -> Result<Vec<u8>, AppError>;

    /// Fresh translator for a 200 streaming response.
    fn stream_translator(&self) -> Box<dyn StreamTranslator>;
}

/// Resolve the adapter for a provider family.
pub fn adapter_for(family: ProviderFamily) -> &'static dyn ProviderAdapter {
    static OPENAI: OpenAiAdapter = OpenAiAdapter;
    static GEMINI: GeminiAdapter = GeminiAdapter;
    static CLAUDE: ClaudeAdapter = ClaudeAdapter;
    match family {
        ProviderFamily::OpenAi => &OPENAI,
        ProviderFamily::Gemini => &GEMINI,
        ProviderFamily::Claude => &CLAUDE,
    }
}

//! OpenAI-compatible adapter (passthrough family).
//!
//! The request body already has the right shape; only the `model` field is
//! rewritten to the upstream name. Responses pass through unchanged except
//! for an in-stream rewrite that surfaces `reasoning_content` deltas as a
//! blockquoted thinking prefix for clients that do not know the field.

use reqwest::Url;

use crate::adapter::sse::{data_lines, format_data_frame, DONE_FRAME};
use crate::adapter::{
    ProviderAdapter, StreamTranslator, TranslatorOutput, UpstreamContext,
};
use crate::api::models::{ChatCompletionRequest, ChatCompletionResponse, MessageContent};
use crate::core::error::AppError;
use crate::services::dispatcher::ProviderFamily;

pub struct OpenAiAdapter;

/// Endpoint suffixes that mark the configured URL as already complete.
const KNOWN_ENDPOINTS: &[&str] = &["/chat/completions", "/images/", "/audio/", "/embeddings"];

/// Append `/chat/completions` iff the configured base URL has no recognized
/// endpoint path of its own.
fn shape_url(base_url: &str) -> Result<Url, AppError> {
    let mut url = Url::parse(base_url)
        .map_err(|e| AppError::AdapterConversionFailed(format!("invalid upstream url: {}", e)))?;

    let path = url.path().to_string();
    let already_complete = KNOWN_ENDPOINTS.iter().any(|suffix| path.contains(suffix));
    if !already_complete
        && (path.is_empty() || path == "/" || path.ends_with("/v1") || path.ends_with("/v1/"))
    {
        let base = path.trim_end_matches('/');
        url.set_path(&format!("{}/chat/completions", base));
    }
    Ok(url)
}

impl ProviderAdapter for OpenAiAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAi
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        ctx: &UpstreamContext,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::RequestBuilder, AppError> {
        let mut outgoing = request.clone();
        outgoing.model = ctx.upstream_model.clone();

        let url = shape_url(&ctx.base_url)?;
        Ok(client
            .post(url)
            .header("Authorization", format!("Bearer {}", ctx.api_key))
            .header("Content-Type", "application/json")
            .header("User-Agent", "llm-gateway/0.3")
            .json(&outgoing))
    }

    fn translate_body(&self, body: &[u8], _ctx: &UpstreamContext) -> Result<Vec<u8>, AppError> {
        // Already OpenAI-shaped
        Ok(body.to_vec())
    }

    fn stream_translator(&self) -> Box<dyn StreamTranslator> {
        Box::new(OpenAiStreamTranslator::default())
    }
}

/// Passthrough stream translator with the reasoning-content rewrite.
#[derive(Default)]
pub struct OpenAiStreamTranslator {
    first_reasoning: bool,
    in_reasoning_block: bool,
    done: bool,
}

impl OpenAiStreamTranslator {
    fn rewrite_chunk(&mut self, payload: &str) -> Option<String> {
        let mut chunk: ChatCompletionResponse = serde_json::from_str(payload).ok()?;

        let delta = chunk.choices.first_mut()?.delta.as_mut()?;
        let reasoning = delta.reasoning_content.clone().unwrap_or_default();
        let content = delta
            .content
            .as_ref()
            .map(|c| c.as_text())
            .unwrap_or_default();

        if !reasoning.is_empty() {
            // Surface the thinking stream as a blockquote on `content`
            let prefix = if !self.first_reasoning {
                self.first_reasoning = true;
                self.in_reasoning_block = true;
                "> **Thinking:**\n> "
            } else {
                ""
            };
            let formatted = reasoning.replace('\n', "\n> ");
            delta.content = Some(MessageContent::Text(format!("{}{}", prefix, formatted)));
        } else if !content.is_empty() && self.in_reasoning_block {
            // Visible content begins: close the blockquote with a separator
            self.in_reasoning_block = false;
            delta.content = Some(MessageContent::Text(format!("\n\n{}", content)));
        } else {
            return None;
        }

        serde_json::to_string(&chunk).ok()
    }
}

impl StreamTranslator for OpenAiStreamTranslator {
    fn on_frame(&mut self, frame: &str) -> TranslatorOutput {
        let mut out = TranslatorOutput::default();

        let payloads = data_lines(frame);
        if payloads.is_empty() {
            // Comment / event lines pass through untouched
            out.bytes = format!("{}\n\n", frame).into_bytes();
            return out;
        }

        for payload in payloads {
            if payload.trim() == "[DONE]" {
                out.bytes.extend_from_slice(DONE_FRAME.as_bytes());
                self.done = true;
                out.done = true;
                return out;
            }

            match self.rewrite_chunk(payload) {
                Some(rewritten) => out.bytes.extend(format_data_frame(&rewritten)),
                // Unparseable or untouched chunks are forwarded verbatim
                None => out.bytes.extend(format_data_frame(payload)),
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<u8> {
        if self.done {
            Vec::new()
        } else {
            self.done = true;
            DONE_FRAME.as_bytes().to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shape_url_appends_endpoint() {
        let cases = [
            ("https://api.example.com", "/chat/completions"),
            ("https://api.example.com/", "/chat/completions"),
            ("https://api.example.com/v1", "/v1/chat/completions"),
            ("https://api.example.com/v1/", "/v1/chat/completions"),
        ];
        for (input, want) in cases {
            assert_eq!(shape_url(input).unwrap().path(), want);
        }
    }

    #[test]
    fn test_shape_url_respects_existing_endpoint() {
        let keep = [
            "https://api.example.com/v1/chat/completions",
            "https://api.example.com/v1/images/generations",
            "https://api.example.com/v1/embeddings",
            "https://api.example.com/openai/deployments/x", // unusual path left alone
        ];
        for input in keep {
            let parsed = Url::parse(input).unwrap();
            assert_eq!(shape_url(input).unwrap().path(), parsed.path());
        }
    }

    fn frame(payload: serde_json::Value) -> String {
        format!("data: {}", payload)
    }

    #[test]
    fn test_reasoning_rewrite_blockquotes_and_separates() {
        let mut translator = OpenAiStreamTranslator::default();

        let out = translator.on_frame(&frame(json!({
            "choices": [{"index": 0, "delta": {"reasoning_content": "step one\nstep two"}}]
        })));
        let text = String::from_utf8(out.bytes).unwrap();
        assert!(text.contains("> **Thinking:**"));
        assert!(text.contains("step one\\n> step two"));

        // Second reasoning delta gets no new prefix
        let out = translator.on_frame(&frame(json!({
            "choices": [{"index": 0, "delta": {"reasoning_content": "more"}}]
        })));
        let text = String::from_utf8(out.bytes).unwrap();
        assert!(!text.contains("Thinking"));

        // First visible content emits the separator and ends the rewrite
        let out = translator.on_frame(&frame(json!({
            "choices": [{"index": 0, "delta": {"content": "answer"}}]
        })));
        let text = String::from_utf8(out.bytes).unwrap();
        assert!(text.contains("\\n\\nanswer"));

        // Subsequent content is untouched
        let out = translator.on_frame(&frame(json!({
            "choices": [{"index": 0, "delta": {"content": " more"}}]
        })));
        let text = String::from_utf8(out.bytes).unwrap();
        assert!(text.contains("\"content\":\" more\""));
    }

    #[test]
    fn test_done_passthrough_and_finish_idempotent() {
        let mut translator = OpenAiStreamTranslator::default();
        let out = translator.on_frame("data: [DONE]");
        assert!(out.done);
        assert_eq!(out.bytes, DONE_FRAME.as_bytes());
        assert!(translator.finish().is_empty());

        let mut translator = OpenAiStreamTranslator::default();
        assert_eq!(translator.finish(), DONE_FRAME.as_bytes());
    }

    #[test]
    fn test_plain_chunks_forwarded() {
        let mut translator = OpenAiStreamTranslator::default();
        let payload = json!({"choices": [{"index": 0, "delta": {"content": "hi"}}]});
        let out = translator.on_frame(&frame(payload.clone()));
        let text = String::from_utf8(out.bytes).unwrap();
        let reparsed: serde_json::Value =
            serde_json::from_str(text.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(reparsed["choices"][0]["delta"]["content"], "hi");
    }
}

//! Anthropic Claude adapter.
//!
//! Translates between the OpenAI chat-completion shape and Claude's Messages
//! API, including the event-based streaming protocol.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::adapter::sse::{data_lines, event_name, format_data_frame, DONE_FRAME};
use crate::adapter::{
    ProviderAdapter, StreamTranslator, TranslatorOutput, UpstreamContext,
};
use crate::api::models::{
    parse_data_url, ChatCompletionRequest, ChatCompletionResponse, ContentPart, MessageContent,
};
use crate::core::error::AppError;
use crate::services::dispatcher::ProviderFamily;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClaudeRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ClaudeMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default)]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ClaudeTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeMessage {
    pub role: String,
    pub content: Value,
}

/// A typed content block. Unused fields stay `None` so one struct covers
/// text, image, tool_use, and tool_result blocks like the wire format does.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClaudeContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ClaudeImageSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClaudeResponse {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub response_type: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Vec<ClaudeContentBlock>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    #[serde(default)]
    pub usage: ClaudeUsage,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ClaudeUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

/// One event of Claude's SSE stream.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClaudeStreamEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub message: Option<ClaudeResponse>,
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub content_block: Option<ClaudeContentBlock>,
    #[serde(default)]
    pub delta: Option<ClaudeStreamDelta>,
    #[serde(default)]
    pub usage: Option<ClaudeUsage>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClaudeStreamDelta {
    #[serde(rename = "type", default)]
    pub delta_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub partial_json: Option<String>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

// ============================================================================
// Finish-reason mapping
// ============================================================================

pub fn stop_reason_to_finish(reason: &str) -> &str {
    match reason {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    }
}

pub fn finish_to_stop_reason(finish: &str) -> &'static str {
    match finish {
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        _ => "end_turn",
    }
}

// ============================================================================
// Request translation
// ============================================================================

fn content_blocks(message: &crate::api::models::ChatMessage) -> Vec<ClaudeContentBlock> {
    let mut blocks = Vec::new();

    match &message.content {
        Some(MessageContent::Text(text)) if !text.is_empty() => {
            blocks.push(ClaudeContentBlock {
                block_type: "text".into(),
                text: Some(text.clone()),
                ..Default::default()
            });
        }
        Some(MessageContent::Parts(parts)) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => blocks.push(ClaudeContentBlock {
                        block_type: "text".into(),
                        text: Some(text.clone()),
                        ..Default::default()
                    }),
                    ContentPart::ImageUrl { image_url } => {
                        if let Some((media_type, data)) = parse_data_url(&image_url.url) {
                            blocks.push(ClaudeContentBlock {
                                block_type: "image".into(),
                                source: Some(ClaudeImageSource {
                                    source_type: "base64".into(),
                                    media_type,
                                    data,
                                }),
                                ..Default::default()
                            });
                        }
                    }
                }
            }
        }
        _ => {}
    }

    for call in &message.tool_calls {
        let input: Value =
            serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
        blocks.push(ClaudeContentBlock {
            block_type: "tool_use".into(),
            id: call.id.clone(),
            name: call.function.name.clone(),
            input: Some(input),
            ..Default::default()
        });
    }

    blocks
}

/// Translate an OpenAI-shaped request into Claude's Messages format.
pub fn to_claude_request(
    request: &ChatCompletionRequest,
    upstream_model: &str,
) -> ClaudeRequest {
    let mut claude = ClaudeRequest {
        model: upstream_model.to_string(),
        stream: request.stream,
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        stop_sequences: request.stop.as_ref().map(|s| s.to_vec()).unwrap_or_default(),
        ..Default::default()
    };

    // System messages concatenate into the top-level system string
    let system: Vec<String> = request
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.string_content())
        .filter(|s| !s.is_empty())
        .collect();
    if !system.is_empty() {
        claude.system = Some(system.join("\n"));
    }

    for message in &request.messages {
        if message.role == "system" {
            continue;
        }

        let blocks = if message.role == "tool" {
            // Tool results ride in a user message as tool_result blocks
            vec![ClaudeContentBlock {
                block_type: "tool_result".into(),
                tool_use_id: message.tool_call_id.clone(),
                content: Some(Value::String(message.string_content())),
                ..Default::default()
            }]
        } else {
            content_blocks(message)
        };

        if blocks.is_empty() {
            continue;
        }

        let role = if message.role == "assistant" {
            "assistant"
        } else {
            "user"
        };
        claude.messages.push(ClaudeMessage {
            role: role.to_string(),
            content: serde_json::to_value(blocks).unwrap_or(Value::Null),
        });
    }

    for tool in &request.tools {
        if tool.tool_type != "function" {
            continue;
        }
        claude.tools.push(ClaudeTool {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            input_schema: tool
                .function
                .parameters
                .clone()
                .unwrap_or_else(|| json!({"type": "object"})),
        });
    }

    claude
}

// ============================================================================
// Response translation
// ============================================================================

/// Translate a Claude non-streaming response into the OpenAI shape.
pub fn to_openai_response(claude: &ClaudeResponse) -> ChatCompletionResponse {
    use crate::api::models::{ChatCompletionChoice, ChatMessage, ToolCall, ToolCallFunction, Usage};

    let mut content = String::new();
    let mut tool_calls = Vec::new();

    for block in &claude.content {
        match block.block_type.as_str() {
            "text" => {
                if let Some(text) = &block.text {
                    content.push_str(text);
                }
            }
            "tool_use" => {
                tool_calls.push(ToolCall {
                    index: None,
                    id: block.id.clone(),
                    call_type: Some("function".to_string()),
                    function: ToolCallFunction {
                        name: block.name.clone(),
                        arguments: block
                            .input
                            .as_ref()
                            .map(|i| i.to_string())
                            .unwrap_or_else(|| "{}".to_string()),
                    },
                });
            }
            _ => {}
        }
    }

    let finish_reason = claude
        .stop_reason
        .as_deref()
        .map(|r| stop_reason_to_finish(r).to_string());

    ChatCompletionResponse {
        id: claude.id.clone(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: claude.model.clone(),
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: Some(ChatMessage {
                role: "assistant".to_string(),
                content: Some(MessageContent::Text(content)),
                tool_calls,
                ..Default::default()
            }),
            finish_reason,
            ..Default::default()
        }],
        usage: Some(Usage {
            prompt_tokens: claude.usage.input_tokens,
            completion_tokens: claude.usage.output_tokens,
            total_tokens: claude.usage.input_tokens + claude.usage.output_tokens,
        }),
        ..Default::default()
    }
}

// ============================================================================
// Adapter
// ============================================================================

pub struct ClaudeAdapter;

impl ProviderAdapter for ClaudeAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Claude
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        ctx: &UpstreamContext,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::RequestBuilder, AppError> {
        let body = to_claude_request(request, &ctx.upstream_model);
        let url = format!("{}/messages", ctx.base_url.trim_end_matches('/'));

        Ok(client
            .post(url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &ctx.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body))
    }

    fn translate_body(&self, body: &[u8], _ctx: &UpstreamContext) -> Result<Vec<u8>, AppError> {
        let claude: ClaudeResponse = serde_json::from_slice(body)?;
        let openai = to_openai_response(&claude);
        Ok(serde_json::to_vec(&openai)?)
    }

    fn stream_translator(&self) -> Box<dyn StreamTranslator> {
        Box::new(ClaudeStreamTranslator::new())
    }
}

// ============================================================================
// Stream translation
// ============================================================================

/// Claude event stream → OpenAI chunk translator.
pub struct ClaudeStreamTranslator {
    request_id: String,
    model: String,
    created: i64,
    done: bool,
}

impl ClaudeStreamTranslator {
    pub fn new() -> Self {
        Self {
            request_id: String::new(),
            model: String::new(),
            created: chrono::Utc::now().timestamp(),
            done: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>, usage: Option<Value>) -> Vec<u8> {
        let mut body = json!({
            "id": self.request_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if let Some(usage) = usage {
            body["usage"] = usage;
        }
        format_data_frame(&body.to_string())
    }

    fn translate_event(&mut self, event_type: &str, payload: &str) -> TranslatorOutput {
        let mut out = TranslatorOutput::default();
        let Ok(event) = serde_json::from_str::<ClaudeStreamEvent>(payload) else {
            return out;
        };
        // The payload's type field wins when the event: line is absent
        let event_type = if event_type.is_empty() {
            event.event_type.as_str()
        } else {
            event_type
        };

        match event_type {
            "message_start" => {
                if let Some(message) = &event.message {
                    self.request_id = message.id.clone();
                    self.model = message.model.clone();
                }
                out.bytes = self.chunk(json!({"role": "assistant"}), None, None);
            }
            "content_block_start" => {
                if let Some(block) = &event.content_block {
                    if block.block_type == "tool_use" {
                        out.bytes = self.chunk(
                            json!({"tool_calls": [{
                                "index": event.index,
                                "id": block.id,
                                "type": "function",
                                "function": {"name": block.name, "arguments": ""}
                            }]}),
                            None,
                            None,
                        );
                    }
                }
            }
            "content_block_delta" => {
                if let Some(delta) = &event.delta {
                    match delta.delta_type.as_str() {
                        "text_delta" => {
                            if let Some(text) = &delta.text {
                                out.bytes = self.chunk(json!({"content": text}), None, None);
                            }
                        }
                        "input_json_delta" => {
                            if let Some(partial) = &delta.partial_json {
                                out.bytes = self.chunk(
                                    json!({"tool_calls": [{
                                        "index": event.index,
                                        "function": {"arguments": partial}
                                    }]}),
                                    None,
                                    None,
                                );
                            }
                        }
                        _ => {}
                    }
                }
            }
            "message_delta" => {
                let finish = event
                    .delta
                    .as_ref()
                    .and_then(|d| d.stop_reason.as_deref())
                    .map(stop_reason_to_finish);
                let usage = event.usage.map(|u| {
                    json!({
                        "prompt_tokens": u.input_tokens,
                        "completion_tokens": u.output_tokens,
                        "total_tokens": u.input_tokens + u.output_tokens,
                    })
                });
                if finish.is_some() || usage.is_some() {
                    out.bytes = self.chunk(json!({}), finish, usage);
                }
            }
            "message_stop" => {
                out.bytes = DONE_FRAME.as_bytes().to_vec();
                self.done = true;
                out.done = true;
            }
            // ping and unknown events are dropped
            _ => {}
        }

        out
    }
}

impl Default for ClaudeStreamTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTranslator for ClaudeStreamTranslator {
    fn on_frame(&mut self, frame: &str) -> TranslatorOutput {
        let mut out = TranslatorOutput::default();
        let event_type = event_name(frame).unwrap_or("");

        for payload in data_lines(frame) {
            let piece = self.translate_event(event_type, payload);
            out.bytes.extend(piece.bytes);
            if piece.done {
                out.done = true;
                return out;
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
    use crate::api::models::{ChatMessage, ToolCall, ToolCallFunction};

    #[test]
    fn test_system_concatenation_and_max_tokens_default() {
        let request = ChatCompletionRequest {
            model: "c".into(),
            messages: vec![
                ChatMessage::text("system", "one"),
                ChatMessage::text("system", "two"),
                ChatMessage::text("user", "hi"),
            ],
            ..Default::default()
        };

        let claude = to_claude_request(&request, "claude-sonnet");
        assert_eq!(claude.system.as_deref(), Some("one\ntwo"));
        assert_eq!(claude.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(claude.messages.len(), 1);
    }

    #[test]
    fn test_tool_result_rides_as_user_block() {
        let request = ChatCompletionRequest {
            model: "c".into(),
            messages: vec![ChatMessage {
                role: "tool".into(),
                content: Some(MessageContent::Text("result".into())),
                tool_call_id: Some("toolu_1".into()),
                ..Default::default()
            }],
            ..Default::default()
        };

        let claude = to_claude_request(&request, "claude-sonnet");
        assert_eq!(claude.messages[0].role, "user");
        let blocks = claude.messages[0].content.as_array().unwrap();
        assert_eq!(blocks[0]["type"], "tool_result");
        assert_eq!(blocks[0]["tool_use_id"], "toolu_1");
        assert_eq!(blocks[0]["content"], "result");
    }

    #[test]
    fn test_assistant_tool_calls_become_tool_use() {
        let request = ChatCompletionRequest {
            model: "c".into(),
            messages: vec![ChatMessage {
                role: "assistant".into(),
                tool_calls: vec![ToolCall {
                    id: Some("call_9".into()),
                    call_type: Some("function".into()),
                    function: ToolCallFunction {
                        name: Some("search".into()),
                        arguments: "{\"q\":\"rust\"}".into(),
                    },
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        let claude = to_claude_request(&request, "claude-sonnet");
        let blocks = claude.messages[0].content.as_array().unwrap();
        assert_eq!(blocks[0]["type"], "tool_use");
        assert_eq!(blocks[0]["id"], "call_9");
        assert_eq!(blocks[0]["input"]["q"], "rust");
    }

    #[test]
    fn test_stop_reason_mapping_roundtrip() {
        assert_eq!(stop_reason_to_finish("end_turn"), "stop");
        assert_eq!(stop_reason_to_finish("max_tokens"), "length");
        assert_eq!(stop_reason_to_finish("tool_use"), "tool_calls");
        assert_eq!(finish_to_stop_reason("stop"), "end_turn");
        assert_eq!(finish_to_stop_reason("length"), "max_tokens");
        assert_eq!(finish_to_stop_reason("tool_calls"), "tool_use");
    }

    #[test]
    fn test_response_translation_preserves_usage() {
        let claude: ClaudeResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet",
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "tool_use", "id": "toolu_2", "name": "calc", "input": {"a": 1}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 11, "output_tokens": 4}
        }))
        .unwrap();

        let openai = to_openai_response(&claude);
        assert_eq!(openai.id, "msg_1");
        let choice = &openai.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        let message = choice.message.as_ref().unwrap();
        assert_eq!(message.string_content(), "Hello");
        assert_eq!(message.tool_calls[0].id.as_deref(), Some("toolu_2"));
        assert_eq!(openai.usage.unwrap().total_tokens, 15);
    }

    fn feed(translator: &mut ClaudeStreamTranslator, event: &str, data: Value) -> String {
        let frame = format!("event: {}\ndata: {}", event, data);
        String::from_utf8(translator.on_frame(&frame).bytes).unwrap()
    }

    #[test]
    fn test_stream_event_sequence() {
        let mut translator = ClaudeStreamTranslator::new();

        let start = feed(
            &mut translator,
            "message_start",
            json!({"type": "message_start",
                    "message": {"id": "msg_s", "model": "claude-sonnet", "content": []}}),
        );
        assert!(start.contains("\"role\":\"assistant\""));
        assert!(start.contains("msg_s"));

        let text = feed(
            &mut translator,
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0,
                    "delta": {"type": "text_delta", "text": "Hi"}}),
        );
        assert!(text.contains("\"content\":\"Hi\""));

        let tool_start = feed(
            &mut translator,
            "content_block_start",
            json!({"type": "content_block_start", "index": 1,
                    "content_block": {"type": "tool_use", "id": "toolu_3", "name": "calc"}}),
        );
        assert!(tool_start.contains("\"name\":\"calc\""));

        let tool_args = feed(
            &mut translator,
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 1,
                    "delta": {"type": "input_json_delta", "partial_json": "{\"a\":"}}),
        );
        assert!(tool_args.contains("{\\\"a\\\":"));

        let finish = feed(
            &mut translator,
            "message_delta",
            json!({"type": "message_delta",
                    "delta": {"stop_reason": "end_turn"},
                    "usage": {"input_tokens": 3, "output_tokens": 5}}),
        );
        assert!(finish.contains("\"finish_reason\":\"stop\""));
        assert!(finish.contains("\"total_tokens\":8"));

        let stop = translator.on_frame(
            "event: message_stop\ndata: {\"type\": \"message_stop\"}",
        );
        assert!(stop.done);
        assert_eq!(stop.bytes, DONE_FRAME.as_bytes());
        assert!(translator.finish().is_empty());
    }

    #[test]
    fn test_ping_events_dropped() {
        let mut translator = ClaudeStreamTranslator::new();
        let out = translator.on_frame("event: ping\ndata: {\"type\": \"ping\"}");
        assert!(out.bytes.is_empty());
        assert!(!out.done);
    }
}

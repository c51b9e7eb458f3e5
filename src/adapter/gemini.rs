//! Google Gemini adapter.
//!
//! Translates between the OpenAI chat-completion shape and Gemini's
//! generateContent wire format, including streaming SSE translation, tool
//! declaration sanitization, and native search grounding.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::adapter::sse::{data_lines, format_data_frame, DONE_FRAME};
use crate::adapter::{
    ProviderAdapter, StreamTranslator, TranslatorOutput, UpstreamContext,
};
use crate::api::models::{
    parse_data_url, ChatCompletionRequest, ChatCompletionResponse, ContentPart, MessageContent,
};
use crate::core::error::AppError;
use crate::services::dispatcher::ProviderFamily;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GeminiGenerationConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<GeminiTool>,
    #[serde(rename = "toolConfig", skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "inline_data", default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<GeminiInlineData>,
    #[serde(rename = "functionCall", default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<GeminiFunctionCall>,
    #[serde(
        rename = "functionResponse",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub function_response: Option<GeminiFunctionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiInlineData {
    #[serde(rename = "mime_type")]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionResponse {
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(rename = "topP", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(rename = "stopSequences", default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeminiTool {
    #[serde(
        rename = "functionDeclarations",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub function_declarations: Vec<GeminiFunctionDeclaration>,
    #[serde(rename = "googleSearch", default, skip_serializing_if = "Option::is_none")]
    pub google_search: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata", default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeminiCandidate {
    #[serde(default)]
    pub content: GeminiContent,
    #[serde(rename = "finishReason", default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: u32,
    #[serde(
        rename = "groundingMetadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub grounding_metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    pub prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    pub candidates_token_count: u32,
    #[serde(rename = "totalTokenCount", default)]
    pub total_token_count: u32,
}

// ============================================================================
// Schema sanitization
// ============================================================================

const UNSUPPORTED_SCHEMA_FIELDS: &[&str] = &[
    "default",
    "minLength",
    "maxLength",
    "additionalProperties",
    "title",
    "examples",
    "$schema",
];

/// Recursively strip JSON-schema fields Gemini rejects and collapse
/// array-valued `type` (e.g. `["string","null"]`) to its first non-null
/// scalar.
pub fn sanitize_json_schema(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    for field in UNSUPPORTED_SCHEMA_FIELDS {
        obj.remove(*field);
    }

    if let Some(type_value) = obj.get("type") {
        if let Some(types) = type_value.as_array() {
            let scalar = types
                .iter()
                .filter_map(|t| t.as_str())
                .find(|t| *t != "null")
                .map(|t| t.to_string());
            if let Some(scalar) = scalar {
                obj.insert("type".to_string(), Value::String(scalar));
            }
        }
    }

    if let Some(props) = obj.get_mut("properties").and_then(|p| p.as_object_mut()) {
        for (_, child) in props.iter_mut() {
            sanitize_json_schema(child);
        }
    }
    if let Some(items) = obj.get_mut("items") {
        sanitize_json_schema(items);
    }
}

// ============================================================================
// Request translation
// ============================================================================

fn message_parts(message: &crate::api::models::ChatMessage) -> Vec<GeminiPart> {
    let mut parts = Vec::new();

    match &message.content {
        Some(MessageContent::Text(text)) if !text.is_empty() => {
            parts.push(GeminiPart {
                text: Some(text.clone()),
                ..Default::default()
            });
        }
        Some(MessageContent::Parts(content_parts)) => {
            for part in content_parts {
                match part {
                    ContentPart::Text { text } => parts.push(GeminiPart {
                        text: Some(text.clone()),
                        ..Default::default()
                    }),
                    ContentPart::ImageUrl { image_url } => {
                        match parse_data_url(&image_url.url) {
                            Some((mime_type, data)) => parts.push(GeminiPart {
                                inline_data: Some(GeminiInlineData { mime_type, data }),
                                ..Default::default()
                            }),
                            // Remote image URLs are not supported on this path
                            None => {
                                tracing::debug!(
                                    url = %image_url.url,
                                    "skipping non-data image url in gemini request"
                                );
                            }
                        }
                    }
                }
            }
        }
        _ => {}
    }

    for call in &message.tool_calls {
        let args: Value =
            serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
        parts.push(GeminiPart {
            function_call: Some(GeminiFunctionCall {
                name: call.function.name.clone().unwrap_or_default(),
                args,
            }),
            ..Default::default()
        });
    }

    parts
}

/// Translate an OpenAI-shaped request into Gemini's wire format.
pub fn to_gemini_request(request: &ChatCompletionRequest, _upstream_model: &str) -> GeminiRequest {
    let mut gemini = GeminiRequest::default();

    // System messages collapse into systemInstruction parts
    let system_text: Vec<String> = request
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.string_content())
        .filter(|s| !s.is_empty())
        .collect();
    if !system_text.is_empty() {
        gemini.system_instruction = Some(GeminiContent {
            role: None,
            parts: system_text
                .into_iter()
                .map(|text| GeminiPart {
                    text: Some(text),
                    ..Default::default()
                })
                .collect(),
        });
    }

    for message in &request.messages {
        if message.role == "system" {
            continue;
        }

        let role = match message.role.as_str() {
            "assistant" => "model",
            "tool" => "function",
            _ => "user",
        };

        let parts = if message.role == "tool" {
            // Tool results become a functionResponse part
            vec![GeminiPart {
                function_response: Some(GeminiFunctionResponse {
                    name: message.name.clone().unwrap_or_default(),
                    response: json!({ "result": message.string_content() }),
                }),
                ..Default::default()
            }]
        } else {
            message_parts(message)
        };

        if parts.is_empty() {
            continue;
        }
        gemini.contents.push(GeminiContent {
            role: Some(role.to_string()),
            parts,
        });
    }

    // Tools: recognized search functions toggle native grounding when no
    // other declarations are present
    let mut has_google_search = false;
    let mut declarations = Vec::new();
    for tool in &request.tools {
        if tool.tool_type != "function" {
            continue;
        }
        let name = tool.function.name.as_str();
        if name == "web_search" || name == "google_search" {
            has_google_search = true;
            continue;
        }
        let parameters = tool.function.parameters.clone().map(|mut schema| {
            sanitize_json_schema(&mut schema);
            schema
        });
        declarations.push(GeminiFunctionDeclaration {
            name: name.to_string(),
            description: tool.function.description.clone(),
            parameters,
        });
    }

    if !declarations.is_empty() {
        gemini.tools = vec![GeminiTool {
            function_declarations: declarations,
            google_search: None,
        }];
        gemini.tool_config = Some(json!({"functionCallingConfig": {"mode": "AUTO"}}));
    } else if has_google_search {
        gemini.tools = vec![GeminiTool {
            function_declarations: Vec::new(),
            google_search: Some(json!({})),
        }];
        gemini.tool_config = Some(json!({"functionCallingConfig": {"mode": "AUTO"}}));
    }

    gemini.generation_config = Some(GeminiGenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_tokens,
        stop_sequences: request.stop.as_ref().map(|s| s.to_vec()).unwrap_or_default(),
    });

    gemini
}

// ============================================================================
// Response translation
// ============================================================================

/// Append grounding source links to the response text, when present.
fn grounding_sources(metadata: &Value) -> String {
    let Some(chunks) = metadata.get("groundingChunks").and_then(|c| c.as_array()) else {
        return String::new();
    };
    let mut out = String::new();
    for chunk in chunks {
        if let Some(web) = chunk.get("web") {
            let title = web.get("title").and_then(|t| t.as_str()).unwrap_or("");
            let uri = web.get("uri").and_then(|u| u.as_str()).unwrap_or("");
            if !uri.is_empty() {
                out.push_str(&format!("- [{}]({})\n", title, uri));
            }
        }
    }
    if out.is_empty() {
        String::new()
    } else {
        format!("\n\nSources:\n{}", out)
    }
}

fn synthesized_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

fn map_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> String {
    if has_tool_calls {
        return "tool_calls".to_string();
    }
    match reason {
        Some("MAX_TOKENS") => "length".to_string(),
        _ => "stop".to_string(),
    }
}

/// Translate a Gemini non-streaming response into the OpenAI shape.
pub fn to_openai_response(gemini: &GeminiResponse, model: &str) -> ChatCompletionResponse {
    use crate::api::models::{ChatCompletionChoice, ChatMessage, ToolCall, ToolCallFunction, Usage};

    let mut response = ChatCompletionResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        ..Default::default()
    };

    if let Some(candidate) = gemini.candidates.first() {
        let mut content = String::new();
        let mut tool_calls = Vec::new();

        for part in &candidate.content.parts {
            if let Some(text) = &part.text {
                content.push_str(text);
            }
            if let Some(call) = &part.function_call {
                tool_calls.push(ToolCall {
                    index: None,
                    id: Some(synthesized_call_id()),
                    call_type: Some("function".to_string()),
                    function: ToolCallFunction {
                        name: Some(call.name.clone()),
                        arguments: call.args.to_string(),
                    },
                });
            }
        }

        if let Some(metadata) = &candidate.grounding_metadata {
            content.push_str(&grounding_sources(metadata));
        }

        let finish_reason =
            map_finish_reason(candidate.finish_reason.as_deref(), !tool_calls.is_empty());

        response.choices.push(ChatCompletionChoice {
            index: 0,
            message: Some(ChatMessage {
                role: "assistant".to_string(),
                content: Some(MessageContent::Text(content)),
                tool_calls,
                ..Default::default()
            }),
            finish_reason: Some(finish_reason),
            ..Default::default()
        });
    }

    if let Some(usage) = &gemini.usage_metadata {
        response.usage = Some(Usage {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
        });
    }

    response
}

// ============================================================================
// Adapter
// ============================================================================

pub struct GeminiAdapter;

impl ProviderAdapter for GeminiAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Gemini
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        ctx: &UpstreamContext,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::RequestBuilder, AppError> {
        let body = to_gemini_request(request, &ctx.upstream_model);

        let mut url = Url::parse(&ctx.base_url).map_err(|e| {
            AppError::AdapterConversionFailed(format!("invalid upstream url: {}", e))
        })?;

        if ctx.stream {
            let path = url.path().to_string();
            if path.ends_with(":generateContent") {
                let rewritten = path.replacen(":generateContent", ":streamGenerateContent", 1);
                url.set_path(&rewritten);
            }
        }

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("key", &ctx.api_key);
            if ctx.stream {
                query.append_pair("alt", "sse");
            }
        }

        Ok(client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&body))
    }

    fn translate_body(&self, body: &[u8], ctx: &UpstreamContext) -> Result<Vec<u8>, AppError> {
        let gemini: GeminiResponse = serde_json::from_slice(body)?;
        let openai = to_openai_response(&gemini, &ctx.upstream_model);
        Ok(serde_json::to_vec(&openai)?)
    }

    fn stream_translator(&self) -> Box<dyn StreamTranslator> {
        Box::new(GeminiStreamTranslator::new())
    }
}

// ============================================================================
// Stream translation
// ============================================================================

/// Gemini SSE → OpenAI chunk translator.
///
/// Emits an initial frame carrying `delta.role = assistant`, then per-chunk
/// content/tool deltas; usage arrives as a trailing chunk with empty choices.
pub struct GeminiStreamTranslator {
    request_id: String,
    created: i64,
    role_sent: bool,
    done: bool,
}

impl GeminiStreamTranslator {
    pub fn new() -> Self {
        Self {
            request_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            role_sent: false,
            done: false,
        }
    }

    fn chunk_skeleton(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("id".into(), json!(self.request_id));
        map.insert("object".into(), json!("chat.completion.chunk"));
        map.insert("created".into(), json!(self.created));
        map.insert("model".into(), json!("gemini"));
        map
    }

    fn translate_payload(&mut self, payload: &str) -> Vec<u8> {
        let Ok(gemini) = serde_json::from_str::<GeminiResponse>(payload) else {
            return Vec::new();
        };

        let mut out = Vec::new();

        if let Some(candidate) = gemini.candidates.first() {
            let mut content = String::new();
            let mut tool_calls = Vec::new();

            for part in &candidate.content.parts {
                if let Some(text) = &part.text {
                    content.push_str(text);
                }
                if let Some(call) = &part.function_call {
                    tool_calls.push(json!({
                        "index": tool_calls.len(),
                        "id": synthesized_call_id(),
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.args.to_string()}
                    }));
                }
            }
            if let Some(metadata) = &candidate.grounding_metadata {
                content.push_str(&grounding_sources(metadata));
            }

            if !content.is_empty() || !tool_calls.is_empty() || candidate.finish_reason.is_some() {
                let mut delta = Map::new();
                if !self.role_sent {
                    delta.insert("role".into(), json!("assistant"));
                    self.role_sent = true;
                }
                if !content.is_empty() {
                    delta.insert("content".into(), json!(content));
                }
                if !tool_calls.is_empty() {
                    delta.insert("tool_calls".into(), Value::Array(tool_calls.clone()));
                }

                let finish_reason = candidate.finish_reason.as_deref().map(|reason| {
                    map_finish_reason(Some(reason), !tool_calls.is_empty())
                });

                let mut chunk = self.chunk_skeleton();
                chunk.insert(
                    "choices".into(),
                    json!([{
                        "index": 0,
                        "delta": Value::Object(delta),
                        "finish_reason": finish_reason,
                    }]),
                );
                out.extend(format_data_frame(&Value::Object(chunk).to_string()));
            }
        }

        // Usage arrives on the final upstream chunk; forward it as a separate
        // chunk with empty choices
        if let Some(usage) = &gemini.usage_metadata {
            let mut chunk = self.chunk_skeleton();
            chunk.insert("choices".into(), json!([]));
            chunk.insert(
                "usage".into(),
                json!({
                    "prompt_tokens": usage.prompt_token_count,
                    "completion_tokens": usage.candidates_token_count,
                    "total_tokens": usage.total_token_count,
                }),
            );
            out.extend(format_data_frame(&Value::Object(chunk).to_string()));
        }

        out
    }
}

impl Default for GeminiStreamTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTranslator for GeminiStreamTranslator {
    fn on_frame(&mut self, frame: &str) -> TranslatorOutput {
        let mut out = TranslatorOutput::default();
        for payload in data_lines(frame) {
            if payload.trim() == "[DONE]" {
                out.bytes.extend_from_slice(DONE_FRAME.as_bytes());
                self.done = true;
                out.done = true;
                return out;
            }
            out.bytes.extend(self.translate_payload(payload));
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

//! Claude-native inbound mapping.
//!
//! Converts an incoming Claude Messages request into the OpenAI shape for
//! dispatch, and the OpenAI-shaped result (body or stream chunks) back into
//! Claude's native response/event format.

use serde_json::{json, Value};

use crate::adapter::claude::{
    finish_to_stop_reason, ClaudeContentBlock, ClaudeRequest, ClaudeResponse, ClaudeUsage,
};
use crate::api::models::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatTool, ContentPart, ImageUrl,
    MessageContent, StopSequence, ToolCall, ToolCallFunction, ToolFunction,
};
use crate::core::error::AppError;

// ============================================================================
// Request: Claude → OpenAI
// ============================================================================

fn block_to_part(block: &Value) -> Option<ContentPart> {
    match block.get("type").and_then(|t| t.as_str())? {
        "text" => Some(ContentPart::Text {
            text: block.get("text")?.as_str()?.to_string(),
        }),
        "image" => {
            let source = block.get("source")?;
            let media_type = source.get("media_type")?.as_str()?;
            let data = source.get("data")?.as_str()?;
            Some(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{}", media_type, data),
                    detail: None,
                },
            })
        }
        _ => None,
    }
}

fn tool_result_text(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Convert an incoming Claude Messages request to the OpenAI dispatch shape.
///
/// The routing token rides in `model` unchanged.
pub fn claude_request_to_openai(claude: &ClaudeRequest) -> Result<ChatCompletionRequest, AppError> {
    let mut request = ChatCompletionRequest {
        model: claude.model.clone(),
        stream: claude.stream,
        temperature: claude.temperature,
        top_p: claude.top_p,
        max_tokens: if claude.max_tokens > 0 {
            Some(claude.max_tokens)
        } else {
            None
        },
        stop: if claude.stop_sequences.is_empty() {
            None
        } else {
            Some(StopSequence::Many(claude.stop_sequences.clone()))
        },
        ..Default::default()
    };

    if let Some(system) = &claude.system {
        if !system.is_empty() {
            request.messages.push(ChatMessage::text("system", system));
        }
    }

    for message in &claude.messages {
        match &message.content {
            Value::String(text) => {
                request
                    .messages
                    .push(ChatMessage::text(&message.role, text.clone()));
            }
            Value::Array(blocks) => {
                let mut parts = Vec::new();
                let mut tool_calls = Vec::new();

                for block in blocks {
                    match block.get("type").and_then(|t| t.as_str()) {
                        Some("tool_use") => {
                            tool_calls.push(ToolCall {
                                index: None,
                                id: block
                                    .get("id")
                                    .and_then(|i| i.as_str())
                                    .map(|i| i.to_string()),
                                call_type: Some("function".to_string()),
                                function: ToolCallFunction {
                                    name: block
                                        .get("name")
                                        .and_then(|n| n.as_str())
                                        .map(|n| n.to_string()),
                                    arguments: block
                                        .get("input")
                                        .map(|i| i.to_string())
                                        .unwrap_or_else(|| "{}".to_string()),
                                },
                            });
                        }
                        Some("tool_result") => {
                            // Tool output becomes its own OpenAI tool message
                            request.messages.push(ChatMessage {
                                role: "tool".to_string(),
                                content: Some(MessageContent::Text(tool_result_text(block))),
                                tool_call_id: block
                                    .get("tool_use_id")
                                    .and_then(|i| i.as_str())
                                    .map(|i| i.to_string()),
                                ..Default::default()
                            });
                        }
                        _ => {
                            if let Some(part) = block_to_part(block) {
                                parts.push(part);
                            }
                        }
                    }
                }

                if !parts.is_empty() || !tool_calls.is_empty() {
                    let only_text = parts.len() == 1
                        && matches!(parts.first(), Some(ContentPart::Text { .. }));
                    let content = if parts.is_empty() {
                        None
                    } else if only_text {
                        match parts.into_iter().next() {
                            Some(ContentPart::Text { text }) => Some(MessageContent::Text(text)),
                            _ => unreachable!(),
                        }
                    } else {
                        Some(MessageContent::Parts(parts))
                    };

                    request.messages.push(ChatMessage {
                        role: message.role.clone(),
                        content,
                        tool_calls,
                        ..Default::default()
                    });
                }
            }
            _ => {
                return Err(AppError::InvalidRequest(
                    "claude message content must be a string or block array".into(),
                ));
            }
        }
    }

    for tool in &claude.tools {
        request.tools.push(ChatTool {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: Some(tool.input_schema.clone()),
                strict: None,
            },
        });
    }

    Ok(request)
}

// ============================================================================
// Response: OpenAI → Claude
// ============================================================================

/// Convert an OpenAI-shaped response back into Claude's Messages shape.
pub fn openai_response_to_claude(openai: &ChatCompletionResponse) -> ClaudeResponse {
    let mut claude = ClaudeResponse {
        id: openai.id.clone(),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        model: openai.model.clone(),
        usage: ClaudeUsage {
            input_tokens: openai.usage.map(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens: openai.usage.map(|u| u.completion_tokens).unwrap_or(0),
        },
        ..Default::default()
    };

    if let Some(choice) = openai.choices.first() {
        claude.stop_reason = Some(
            finish_to_stop_reason(choice.finish_reason.as_deref().unwrap_or("stop")).to_string(),
        );

        if let Some(message) = &choice.message {
            let text = message.string_content();
            if !text.is_empty() {
                claude.content.push(ClaudeContentBlock {
                    block_type: "text".to_string(),
                    text: Some(text),
                    ..Default::default()
                });
            }
            for call in &message.tool_calls {
                let input: Value = serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| json!({}));
                claude.content.push(ClaudeContentBlock {
                    block_type: "tool_use".to_string(),
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    input: Some(input),
                    ..Default::default()
                });
            }
        }
    }

    claude
}

// ============================================================================
// Stream: OpenAI chunks → Claude events
// ============================================================================

/// State carried across one OpenAI-shaped stream being re-emitted as Claude
/// events.
#[derive(Debug, Default)]
pub struct ClaudeStreamState {
    message_started: bool,
    text_block_open: bool,
}

fn sse_event(name: &str, payload: Value) -> String {
    format!("event: {}\ndata: {}\n\n", name, payload)
}

/// Translate one OpenAI chunk into zero or more Claude SSE events.
///
/// On `[DONE]` the caller emits `message_stop` via
/// [`claude_stream_done_events`].
pub fn openai_chunk_to_claude_events(
    chunk: &ChatCompletionResponse,
    state: &mut ClaudeStreamState,
) -> Vec<String> {
    let mut events = Vec::new();

    let Some(choice) = chunk.choices.first() else {
        return events;
    };
    let Some(delta) = choice.delta.as_ref().or(choice.message.as_ref()) else {
        return events;
    };

    if !state.message_started {
        state.message_started = true;
        events.push(sse_event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": chunk.id,
                    "type": "message",
                    "role": "assistant",
                    "model": chunk.model,
                    "content": [],
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        ));
    }

    let text = delta.string_content();
    if !text.is_empty() {
        if !state.text_block_open {
            state.text_block_open = true;
            events.push(sse_event(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": {"type": "text", "text": ""}
                }),
            ));
        }
        events.push(sse_event(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": text}
            }),
        ));
    }

    if choice.finish_reason.is_some() || chunk.usage.is_some() {
        if state.text_block_open {
            state.text_block_open = false;
            events.push(sse_event(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": 0}),
            ));
        }

        let stop_reason = choice
            .finish_reason
            .as_deref()
            .map(finish_to_stop_reason)
            .unwrap_or("end_turn");
        let output_tokens = chunk.usage.map(|u| u.completion_tokens).unwrap_or(0);
        events.push(sse_event(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {"output_tokens": output_tokens}
            }),
        ));
    }

    events
}

/// Events closing the Claude stream once the OpenAI side sent `[DONE]`.
pub fn claude_stream_done_events(state: &mut ClaudeStreamState) -> Vec<String> {
    let mut events = Vec::new();
    if state.text_block_open {
        state.text_block_open = false;
        events.push(sse_event(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": 0}),
        ));
    }
    events.push(sse_event("message_stop", json!({"type": "message_stop"})));
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{ChatCompletionChoice, Usage};

    #[test]
    fn test_request_mapping_with_blocks() {
        let claude: ClaudeRequest = serde_json::from_value(json!({
            "model": "grp",
            "max_tokens": 512,
            "system": "be helpful",
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "describe"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "QUJD"}}
                ]},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "lookup", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "found"}
                ]}
            ],
            "tools": [{"name": "lookup", "input_schema": {"type": "object"}}]
        }))
        .unwrap();

        let openai = claude_request_to_openai(&claude).unwrap();
        assert_eq!(openai.model, "grp");
        assert_eq!(openai.max_tokens, Some(512));
        assert_eq!(openai.messages[0].role, "system");

        // Multimodal user message keeps the parts array
        let user = &openai.messages[1];
        assert!(matches!(user.content, Some(MessageContent::Parts(_))));

        // tool_use becomes assistant tool_calls
        let assistant = &openai.messages[2];
        assert_eq!(
            assistant.tool_calls[0].function.name.as_deref(),
            Some("lookup")
        );

        // tool_result becomes a role=tool message
        let tool = &openai.messages[3];
        assert_eq!(tool.role, "tool");
        assert_eq!(tool.tool_call_id.as_deref(), Some("toolu_1"));
        assert_eq!(tool.string_content(), "found");

        assert_eq!(openai.tools[0].function.name, "lookup");
    }

    #[test]
    fn test_response_mapping_roundtrip() {
        let openai = ChatCompletionResponse {
            id: "chatcmpl-1".into(),
            model: "grp".into(),
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: Some(ChatMessage::text("assistant", "hello there")),
                finish_reason: Some("stop".into()),
                ..Default::default()
            }],
            usage: Some(Usage {
                prompt_tokens: 9,
                completion_tokens: 2,
                total_tokens: 11,
            }),
            ..Default::default()
        };

        let claude = openai_response_to_claude(&openai);
        assert_eq!(claude.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(claude.content[0].text.as_deref(), Some("hello there"));
        assert_eq!(claude.usage.input_tokens, 9);
        assert_eq!(claude.usage.output_tokens, 2);
    }

    fn chunk(delta: ChatMessage, finish: Option<&str>) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: "chatcmpl-s".into(),
            object: "chat.completion.chunk".into(),
            model: "grp".into(),
            choices: vec![ChatCompletionChoice {
                index: 0,
                delta: Some(delta),
                finish_reason: finish.map(|f| f.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_stream_event_shape() {
        let mut state = ClaudeStreamState::default();

        let first = openai_chunk_to_claude_events(
            &chunk(ChatMessage::text("assistant", "Hel"), None),
            &mut state,
        );
        // message_start + content_block_start + first delta
        assert_eq!(first.len(), 3);
        assert!(first[0].starts_with("event: message_start\n"));
        assert!(first[1].starts_with("event: content_block_start\n"));
        assert!(first[2].contains("text_delta"));

        let middle = openai_chunk_to_claude_events(
            &chunk(ChatMessage::text("assistant", "lo"), None),
            &mut state,
        );
        assert_eq!(middle.len(), 1);

        let last = openai_chunk_to_claude_events(
            &chunk(ChatMessage::default(), Some("stop")),
            &mut state,
        );
        assert!(last.iter().any(|e| e.contains("content_block_stop")));
        assert!(last.iter().any(|e| e.contains("\"stop_reason\":\"end_turn\"")));

        let done = claude_stream_done_events(&mut state);
        assert!(done.iter().any(|e| e.contains("message_stop")));
    }
}

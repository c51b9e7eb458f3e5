//! Gemini-native inbound mapping.
//!
//! Converts an incoming generateContent request into the OpenAI shape for
//! dispatch and OpenAI-shaped results (bodies or stream chunks) back into
//! Gemini responses. The same response mapper serves both the non-streaming
//! body and each stream chunk, mirroring Gemini's chunked response format.

use serde_json::json;

use crate::adapter::gemini::{
    GeminiCandidate, GeminiContent, GeminiFunctionCall, GeminiPart, GeminiRequest, GeminiResponse,
    GeminiUsage,
};
use crate::api::models::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatTool, ContentPart, ImageUrl,
    MessageContent, StopSequence, ToolFunction,
};
use crate::core::error::AppError;

// ============================================================================
// Request: Gemini → OpenAI
// ============================================================================

/// Convert an incoming Gemini request to the OpenAI dispatch shape.
///
/// `model` comes from the URL path (`<model>:generateContent`); it carries
/// the routing token. `stream` reflects whether the path named
/// `:streamGenerateContent`.
pub fn gemini_request_to_openai(
    gemini: &GeminiRequest,
    model: &str,
    stream: bool,
) -> Result<ChatCompletionRequest, AppError> {
    let mut request = ChatCompletionRequest {
        model: model.to_string(),
        stream,
        ..Default::default()
    };

    if let Some(system) = &gemini.system_instruction {
        let text: String = system
            .parts
            .iter()
            .filter_map(|p| p.text.clone())
            .collect();
        if !text.is_empty() {
            request.messages.push(ChatMessage::text("system", text));
        }
    }

    for content in &gemini.contents {
        let role = match content.role.as_deref() {
            Some("model") => "assistant",
            Some("function") => "tool",
            _ => "user",
        };

        // functionResponse parts force the tool role and its own message
        if let Some(response_part) = content
            .parts
            .iter()
            .find_map(|p| p.function_response.as_ref())
        {
            request.messages.push(ChatMessage {
                role: "tool".to_string(),
                content: Some(MessageContent::Text(response_part.response.to_string())),
                name: Some(response_part.name.clone()),
                tool_call_id: Some(format!("call_{}", response_part.name)),
                ..Default::default()
            });
            continue;
        }

        let mut parts = Vec::new();
        for part in &content.parts {
            if let Some(text) = &part.text {
                parts.push(ContentPart::Text { text: text.clone() });
            }
            if let Some(inline) = &part.inline_data {
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{};base64,{}", inline.mime_type, inline.data),
                        detail: None,
                    },
                });
            }
        }

        if parts.is_empty() {
            continue;
        }

        let only_text = parts.len() == 1 && matches!(parts[0], ContentPart::Text { .. });
        let content_value = if only_text {
            match parts.into_iter().next() {
                Some(ContentPart::Text { text }) => MessageContent::Text(text),
                _ => unreachable!(),
            }
        } else {
            MessageContent::Parts(parts)
        };

        request.messages.push(ChatMessage {
            role: role.to_string(),
            content: Some(content_value),
            ..Default::default()
        });
    }

    if let Some(config) = &gemini.generation_config {
        request.temperature = config.temperature;
        request.top_p = config.top_p;
        request.max_tokens = config.max_output_tokens;
        if !config.stop_sequences.is_empty() {
            request.stop = Some(StopSequence::Many(config.stop_sequences.clone()));
        }
    }

    for tool in &gemini.tools {
        for declaration in &tool.function_declarations {
            request.tools.push(ChatTool {
                tool_type: "function".to_string(),
                function: ToolFunction {
                    name: declaration.name.clone(),
                    description: declaration.description.clone(),
                    parameters: declaration.parameters.clone(),
                    strict: None,
                },
            });
        }
    }

    Ok(request)
}

// ============================================================================
// Response: OpenAI → Gemini
// ============================================================================

/// Convert an OpenAI-shaped response (or stream chunk) into Gemini's shape.
pub fn openai_response_to_gemini(openai: &ChatCompletionResponse) -> GeminiResponse {
    let mut gemini = GeminiResponse::default();

    if let Some(usage) = &openai.usage {
        gemini.usage_metadata = Some(GeminiUsage {
            prompt_token_count: usage.prompt_tokens,
            candidates_token_count: usage.completion_tokens,
            total_token_count: usage.total_tokens,
        });
    }

    if let Some(choice) = openai.choices.first() {
        let message = choice.delta.as_ref().or(choice.message.as_ref());

        let mut parts = Vec::new();
        if let Some(message) = message {
            let text = message.string_content();
            if !text.is_empty() {
                parts.push(GeminiPart {
                    text: Some(text),
                    ..Default::default()
                });
            }
            for call in &message.tool_calls {
                let args = serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| json!({}));
                parts.push(GeminiPart {
                    function_call: Some(GeminiFunctionCall {
                        name: call.function.name.clone().unwrap_or_default(),
                        args,
                    }),
                    ..Default::default()
                });
            }
        }

        let finish_reason = choice.finish_reason.as_deref().map(|reason| {
            match reason {
                "length" => "MAX_TOKENS",
                // Gemini reports STOP for tool calls as well
                _ => "STOP",
            }
            .to_string()
        });

        gemini.candidates.push(GeminiCandidate {
            index: 0,
            content: GeminiContent {
                role: Some("model".to_string()),
                parts,
            },
            finish_reason,
            grounding_metadata: None,
        });
    }

    gemini
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{ChatCompletionChoice, ToolCall, ToolCallFunction, Usage};

    #[test]
    fn test_request_mapping() {
        let gemini: GeminiRequest = serde_json::from_value(json!({
            "systemInstruction": {"parts": [{"text": "short answers"}]},
            "contents": [
                {"role": "user", "parts": [{"text": "hello"}]},
                {"role": "model", "parts": [{"text": "hi"}]},
                {"role": "user", "parts": [
                    {"text": "what is this"},
                    {"inline_data": {"mime_type": "image/png", "data": "QUJD"}}
                ]},
                {"role": "function", "parts": [
                    {"functionResponse": {"name": "calc", "response": {"result": 4}}}
                ]}
            ],
            "generationConfig": {"temperature": 0.5, "maxOutputTokens": 100,
                                  "stopSequences": ["END"]},
            "tools": [{"functionDeclarations": [{"name": "calc"}]}]
        }))
        .unwrap();

        let openai = gemini_request_to_openai(&gemini, "grp", true).unwrap();
        assert!(openai.stream);
        assert_eq!(openai.messages[0].role, "system");
        assert_eq!(openai.messages[1].role, "user");
        assert_eq!(openai.messages[2].role, "assistant");
        assert!(matches!(
            openai.messages[3].content,
            Some(MessageContent::Parts(_))
        ));
        let tool = &openai.messages[4];
        assert_eq!(tool.role, "tool");
        assert_eq!(tool.name.as_deref(), Some("calc"));

        assert_eq!(openai.temperature, Some(0.5));
        assert_eq!(openai.max_tokens, Some(100));
        assert_eq!(openai.tools[0].function.name, "calc");
    }

    #[test]
    fn test_response_mapping_with_tool_call() {
        let openai = ChatCompletionResponse {
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: Some(ChatMessage {
                    role: "assistant".into(),
                    content: Some(MessageContent::Text("sure".into())),
                    tool_calls: vec![ToolCall {
                        id: Some("call_1".into()),
                        function: ToolCallFunction {
                            name: Some("calc".into()),
                            arguments: "{\"a\":2}".into(),
                        },
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                finish_reason: Some("tool_calls".into()),
                ..Default::default()
            }],
            usage: Some(Usage {
                prompt_tokens: 3,
                completion_tokens: 4,
                total_tokens: 7,
            }),
            ..Default::default()
        };

        let gemini = openai_response_to_gemini(&openai);
        let candidate = &gemini.candidates[0];
        assert_eq!(candidate.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(candidate.content.parts[0].text.as_deref(), Some("sure"));
        let call = candidate.content.parts[1].function_call.as_ref().unwrap();
        assert_eq!(call.name, "calc");
        assert_eq!(call.args["a"], 2);
        assert_eq!(gemini.usage_metadata.unwrap().total_token_count, 7);
    }

    #[test]
    fn test_chunk_mapping_uses_delta() {
        let chunk = ChatCompletionResponse {
            object: "chat.completion.chunk".into(),
            choices: vec![ChatCompletionChoice {
                index: 0,
                delta: Some(ChatMessage::text("assistant", "partial")),
                ..Default::default()
            }],
            ..Default::default()
        };

        let gemini = openai_response_to_gemini(&chunk);
        assert_eq!(
            gemini.candidates[0].content.parts[0].text.as_deref(),
            Some("partial")
        );
        assert!(gemini.candidates[0].finish_reason.is_none());
    }
}

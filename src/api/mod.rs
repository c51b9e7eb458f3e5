//! HTTP layer: wire models, the proxy engine, native inbound endpoints, and
//! the admin surface.

pub mod admin;
pub mod handlers;
pub mod inbound;
pub mod models;
pub mod proxy;

// Re-export commonly used types
pub use admin::admin_router;
pub use handlers::{chat_completions, create_http_client, health_handler, AppState};
pub use inbound::{claude_messages, gemini_generate_content};
pub use models::{
    ChatCompletionChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatTool,
    ContentPart, MessageContent, StopSequence, ToolCall, Usage,
};
pub use proxy::{dispatch_chat, DispatchContext, DispatchOutcome};

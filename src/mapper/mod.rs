//! Reverse translations for native-protocol clients.
//!
//! The proxy dispatches everything in the OpenAI shape; these mappers let
//! Claude-native (`/v1/messages`) and Gemini-native (`/v1beta/models/:model`)
//! clients ride the same path: native request → OpenAI-shaped dispatch →
//! response translated back into the client's native shape, streaming
//! included.

pub mod claude_inbound;
pub mod gemini_inbound;

pub use claude_inbound::{
    claude_request_to_openai, claude_stream_done_events, openai_chunk_to_claude_events,
    openai_response_to_claude, ClaudeStreamState,
};
pub use gemini_inbound::{gemini_request_to_openai, openai_response_to_gemini};

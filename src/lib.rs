//! LLM API aggregation gateway.
//!
//! Exposes an OpenAI-compatible chat-completions endpoint and fans requests
//! out to heterogeneous upstream providers (OpenAI-compatible, Google Gemini,
//! Anthropic Claude). Per request the dispatcher selects an upstream endpoint
//! and credential according to group policy, retries across credentials and
//! endpoints on failure, and records per-key health, per-model statistics,
//! and request logs.
//!
//! # Architecture
//!
//! - [`core`]: configuration, errors, repository, logging, middleware, and
//!   the async batched log writer
//! - [`services`]: dispatch business logic (routing snapshot, strategies,
//!   credential health, secret provider)
//! - [`adapter`]: per-provider-family request/response/stream translation
//! - [`mapper`]: reverse translations for Claude- and Gemini-native clients
//! - [`api`]: HTTP handlers and wire models

pub mod adapter;
pub mod api;
pub mod core;
pub mod mapper;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{AppState, ChatCompletionRequest, ChatCompletionResponse};
pub use core::{AppConfig, AppError, Result};
pub use services::Dispatcher;

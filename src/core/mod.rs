//! Core functionality for the gateway.
//!
//! This module contains fundamental components used throughout the
//! application:
//! - Configuration management
//! - Error handling
//! - Repository over the single-file store
//! - Tracing setup and log rotation
//! - HTTP middleware (admin auth, IP rate limiting)
//! - The async batched request-log writer

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod request_logger;

// Re-export commonly used types
pub use config::AppConfig;
pub use database::{
    generate_admin_key, mask_key, AdminKeyEntity, ApiKeyEntity, Database, GroupRecord,
    ModelConfigEntity, ModelGroupEntity, ModelRecord, ModelStatsEntity, RequestLogEntity,
};
pub use error::{AppError, Result};
pub use logging::{init_tracing, load_or_create_secret_key, LogRotator};
pub use middleware::{client_ip, user_agent, IpRateLimiter};
pub use request_logger::{AsyncRequestLogger, RequestLog};

//! Environment-driven application configuration.
//!
//! Routing configuration (groups, models, credentials) lives in the database
//! and is managed through the admin API; this module only covers the
//! process-level knobs read once at startup.

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the SQLite database file
    pub database_path: String,
    /// Optional log file path; when set, tracing output goes through the
    /// rotating file writer instead of stderr
    pub log_file: Option<String>,
    /// Rotation threshold for the log file, in megabytes
    pub log_max_size_mb: u64,
    /// How many request-log rows to retain (keep-latest pruning)
    pub log_retention: u32,
    /// Optional path to the secret-key file enabling credential encryption
    pub secret_file: Option<String>,
    /// Escalate per-request logging verbosity
    pub debug: bool,
    /// Release mode quiets request tracing (`GATEWAY_MODE=release`)
    pub release_mode: bool,
    /// Port override; falls back to the persisted gateway settings when unset
    pub port: Option<u16>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "gateway.db".to_string(),
            log_file: None,
            log_max_size_mb: 10,
            log_retention: 100,
            secret_file: None,
            debug: false,
            release_mode: false,
            port: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables, applying defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_path: std::env::var("GATEWAY_DB").unwrap_or(defaults.database_path),
            log_file: std::env::var("GATEWAY_LOG_FILE").ok().filter(|s| !s.is_empty()),
            log_max_size_mb: env_parse("GATEWAY_LOG_MAX_MB", defaults.log_max_size_mb),
            log_retention: env_parse("GATEWAY_LOG_RETENTION", defaults.log_retention),
            secret_file: std::env::var("GATEWAY_SECRET_FILE").ok().filter(|s| !s.is_empty()),
            debug: env_flag("DEBUG"),
            release_mode: std::env::var("GATEWAY_MODE")
                .map(|m| m.eq_ignore_ascii_case("release"))
                .unwrap_or(false),
            port: std::env::var("GATEWAY_PORT").ok().and_then(|p| p.parse().ok()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.database_path, "gateway.db");
        assert_eq!(config.log_retention, 100);
        assert_eq!(config.log_max_size_mb, 10);
        assert!(config.port.is_none());
        assert!(!config.debug);
    }
}

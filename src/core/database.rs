//! Repository layer over the single-file SQLite store.
//!
//! Holds the persisted routing configuration (groups, models, credentials),
//! administrator keys, gateway settings, aggregated per-model statistics, and
//! request logs. The dispatcher never touches SQL directly; it reads through
//! [`Database::load_routing_table`] when building a snapshot. All writes to
//! `model_stats` funnel through the async log writer so there is at most one
//! writer per stats row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;

/// Shared database handle backed by a sqlx connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

// ============================================================================
// Entities
// ============================================================================

/// Global gateway settings (single row).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GatewaySettings {
    pub id: i64,
    pub port: i64,
}

/// Administrator bearer key.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AdminKeyEntity {
    pub id: i64,
    pub name: String,
    pub key: String,
    pub created_at: DateTime<Utc>,
}

/// A named routing bucket owning an ordered list of model configs.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ModelGroupEntity {
    pub id: i64,
    pub group_id: String,
    pub strategy: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One upstream endpoint within a group.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ModelConfigEntity {
    pub id: i64,
    pub model_group_id: i64,
    pub provider: String,
    pub upstream_url: String,
    pub upstream_model: String,
    pub timeout_secs: i64,
    pub created_at: DateTime<Utc>,
}

/// An API credential usable against one model config. `key_value` is
/// ciphertext; decryption happens only when building the routing snapshot.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ApiKeyEntity {
    pub id: i64,
    pub model_config_id: i64,
    pub key_value: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Aggregated counters per model config (at most one row per model).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ModelStatsEntity {
    pub id: i64,
    pub model_config_id: i64,
    pub success: i64,
    pub error: i64,
    pub total_latency_ms: f64,
    pub request_count: i64,
    pub total_requests: i64,
}

/// One persisted request-log row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RequestLogEntity {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status_code: i64,
    pub latency_ms: f64,
    pub client_ip: String,
    pub user_agent: String,
    pub group_id: Option<String>,
    pub provider: Option<String>,
    pub upstream_model: Option<String>,
    pub model_config_id: Option<i64>,
    pub error: Option<String>,
}

/// A group with its models and (still encrypted) credentials, as loaded for
/// snapshot construction.
#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub group: ModelGroupEntity,
    pub models: Vec<ModelRecord>,
}

#[derive(Debug, Clone)]
pub struct ModelRecord {
    pub config: ModelConfigEntity,
    pub keys: Vec<ApiKeyEntity>,
}

// ============================================================================
// Schema
// ============================================================================

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS gateway_settings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    port        INTEGER NOT NULL DEFAULT 8000
);

CREATE TABLE IF NOT EXISTS admin_keys (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL DEFAULT '',
    key         TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_admin_keys_key ON admin_keys(key);

CREATE TABLE IF NOT EXISTS model_groups (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id    TEXT NOT NULL,
    strategy    TEXT NOT NULL DEFAULT 'fallback',
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    deleted_at  TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_model_groups_group_id
    ON model_groups(group_id) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS model_configs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    model_group_id  INTEGER NOT NULL REFERENCES model_groups(id) ON DELETE CASCADE,
    provider        TEXT NOT NULL,
    upstream_url    TEXT NOT NULL,
    upstream_model  TEXT NOT NULL,
    timeout_secs    INTEGER NOT NULL DEFAULT 60,
    created_at      TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS ix_model_configs_group ON model_configs(model_group_id);

CREATE TABLE IF NOT EXISTS api_keys (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    model_config_id INTEGER NOT NULL REFERENCES model_configs(id) ON DELETE CASCADE,
    key_value       TEXT NOT NULL,
    created_at      TEXT NOT NULL DEFAULT (datetime('now')),
    deleted_at      TEXT
);
CREATE INDEX IF NOT EXISTS ix_api_keys_model ON api_keys(model_config_id);

CREATE TABLE IF NOT EXISTS model_stats (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    model_config_id INTEGER NOT NULL REFERENCES model_configs(id) ON DELETE CASCADE,
    success         INTEGER NOT NULL DEFAULT 0,
    error           INTEGER NOT NULL DEFAULT 0,
    total_latency_ms REAL NOT NULL DEFAULT 0,
    request_count   INTEGER NOT NULL DEFAULT 0,
    total_requests  INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_model_stats_model ON model_stats(model_config_id);

CREATE TABLE IF NOT EXISTS request_logs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at      TEXT NOT NULL,
    method          TEXT NOT NULL,
    path            TEXT NOT NULL,
    status_code     INTEGER NOT NULL,
    latency_ms      REAL NOT NULL DEFAULT 0,
    client_ip       TEXT NOT NULL DEFAULT '',
    user_agent      TEXT NOT NULL DEFAULT '',
    group_id        TEXT,
    provider        TEXT,
    upstream_model  TEXT,
    model_config_id INTEGER,
    error           TEXT
);
"#;

impl Database {
    /// Open (creating if missing) the single-file store and initialize the
    /// schema.
    pub async fn connect(path: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Settings & seeding
    // ------------------------------------------------------------------

    pub async fn load_settings(&self) -> Result<GatewaySettings, sqlx::Error> {
        sqlx::query_as::<_, GatewaySettings>("SELECT id, port FROM gateway_settings LIMIT 1")
            .fetch_one(&self.pool)
            .await
    }

    /// Seed default settings and an initial admin key on first boot.
    ///
    /// Returns the generated admin key when one was created so the caller can
    /// print it exactly once.
    pub async fn seed_defaults(&self) -> Result<Option<String>, sqlx::Error> {
        let settings: Option<(i64,)> = sqlx::query_as("SELECT id FROM gateway_settings LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        if settings.is_none() {
            sqlx::query("INSERT INTO gateway_settings (port) VALUES (8000)")
                .execute(&self.pool)
                .await?;
        }

        let (admin_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM admin_keys")
            .fetch_one(&self.pool)
            .await?;
        if admin_count == 0 {
            let key = generate_admin_key();
            sqlx::query("INSERT INTO admin_keys (name, key, created_at) VALUES (?, ?, ?)")
                .bind("Initial Root Key")
                .bind(&key)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
            return Ok(Some(key));
        }

        Ok(None)
    }

    // ------------------------------------------------------------------
    // Admin keys
    // ------------------------------------------------------------------

    pub async fn find_admin_key(&self, token: &str) -> Result<Option<AdminKeyEntity>, sqlx::Error> {
        sqlx::query_as::<_, AdminKeyEntity>(
            "SELECT id, name, key, created_at FROM admin_keys WHERE key = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_admin_keys(&self) -> Result<Vec<AdminKeyEntity>, sqlx::Error> {
        sqlx::query_as::<_, AdminKeyEntity>(
            "SELECT id, name, key, created_at FROM admin_keys ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn create_admin_key(&self, name: &str) -> Result<AdminKeyEntity, sqlx::Error> {
        let key = generate_admin_key();
        let id = sqlx::query("INSERT INTO admin_keys (name, key, created_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(&key)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        sqlx::query_as::<_, AdminKeyEntity>(
            "SELECT id, name, key, created_at FROM admin_keys WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn delete_admin_key(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM admin_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Routing table (snapshot source)
    // ------------------------------------------------------------------

    /// Load every non-deleted group with its models (ordered) and non-deleted
    /// credentials. Credentials remain encrypted; the dispatcher decrypts
    /// while building the snapshot.
    pub async fn load_routing_table(&self) -> Result<Vec<GroupRecord>, sqlx::Error> {
        let groups = sqlx::query_as::<_, ModelGroupEntity>(
            "SELECT id, group_id, strategy, created_at, deleted_at \
             FROM model_groups WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let configs = sqlx::query_as::<_, ModelConfigEntity>(
            "SELECT mc.id, mc.model_group_id, mc.provider, mc.upstream_url, \
                    mc.upstream_model, mc.timeout_secs, mc.created_at \
             FROM model_configs mc \
             JOIN model_groups mg ON mg.id = mc.model_group_id \
             WHERE mg.deleted_at IS NULL ORDER BY mc.id",
        )
        .fetch_all(&self.pool)
        .await?;

        let keys = sqlx::query_as::<_, ApiKeyEntity>(
            "SELECT ak.id, ak.model_config_id, ak.key_value, ak.created_at, ak.deleted_at \
             FROM api_keys ak \
             JOIN model_configs mc ON mc.id = ak.model_config_id \
             JOIN model_groups mg ON mg.id = mc.model_group_id \
             WHERE ak.deleted_at IS NULL AND mg.deleted_at IS NULL ORDER BY ak.id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records: Vec<GroupRecord> = groups
            .into_iter()
            .map(|group| GroupRecord {
                group,
                models: Vec::new(),
            })
            .collect();

        for config in configs {
            if let Some(record) = records
                .iter_mut()
                .find(|r| r.group.id == config.model_group_id)
            {
                record.models.push(ModelRecord {
                    config,
                    keys: Vec::new(),
                });
            }
        }

        for key in keys {
            for record in records.iter_mut() {
                if let Some(model) = record
                    .models
                    .iter_mut()
                    .find(|m| m.config.id == key.model_config_id)
                {
                    model.keys.push(key);
                    break;
                }
            }
        }

        Ok(records)
    }

    // ------------------------------------------------------------------
    // Group / model / credential CRUD
    // ------------------------------------------------------------------

    pub async fn get_group(&self, group_id: &str) -> Result<Option<ModelGroupEntity>, sqlx::Error> {
        sqlx::query_as::<_, ModelGroupEntity>(
            "SELECT id, group_id, strategy, created_at, deleted_at \
             FROM model_groups WHERE group_id = ? AND deleted_at IS NULL",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn create_group(
        &self,
        group_id: &str,
        strategy: &str,
    ) -> Result<ModelGroupEntity, sqlx::Error> {
        // A soft-deleted group with the same external id is restored in place
        // so it keeps its original internal id.
        if let Some(deleted) = sqlx::query_as::<_, ModelGroupEntity>(
            "SELECT id, group_id, strategy, created_at, deleted_at \
             FROM model_groups WHERE group_id = ? AND deleted_at IS NOT NULL",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?
        {
            sqlx::query("UPDATE model_groups SET deleted_at = NULL, strategy = ? WHERE id = ?")
                .bind(strategy)
                .bind(deleted.id)
                .execute(&self.pool)
                .await?;
            return Ok(ModelGroupEntity {
                strategy: strategy.to_string(),
                deleted_at: None,
                ..deleted
            });
        }

        let id = sqlx::query(
            "INSERT INTO model_groups (group_id, strategy, created_at) VALUES (?, ?, ?)",
        )
        .bind(group_id)
        .bind(strategy)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        sqlx::query_as::<_, ModelGroupEntity>(
            "SELECT id, group_id, strategy, created_at, deleted_at FROM model_groups WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn update_group_strategy(
        &self,
        group_id: &str,
        strategy: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE model_groups SET strategy = ? WHERE group_id = ? AND deleted_at IS NULL",
        )
        .bind(strategy)
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Soft-delete a group. Its models, credentials, and stats rows stay in
    /// place and come back if the group is restored.
    pub async fn delete_group(&self, group_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE model_groups SET deleted_at = ? WHERE group_id = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn create_model(
        &self,
        group_db_id: i64,
        provider: &str,
        upstream_url: &str,
        upstream_model: &str,
        timeout_secs: i64,
    ) -> Result<ModelConfigEntity, sqlx::Error> {
        let id = sqlx::query(
            "INSERT INTO model_configs \
             (model_group_id, provider, upstream_url, upstream_model, timeout_secs, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(group_db_id)
        .bind(provider)
        .bind(upstream_url)
        .bind(upstream_model)
        .bind(timeout_secs)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        sqlx::query_as::<_, ModelConfigEntity>(
            "SELECT id, model_group_id, provider, upstream_url, upstream_model, \
                    timeout_secs, created_at \
             FROM model_configs WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_model(&self, id: i64) -> Result<Option<ModelConfigEntity>, sqlx::Error> {
        sqlx::query_as::<_, ModelConfigEntity>(
            "SELECT id, model_group_id, provider, upstream_url, upstream_model, \
                    timeout_secs, created_at \
             FROM model_configs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Hard-delete a model config. Credentials and stats cascade.
    pub async fn delete_model(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM model_configs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_model_keys(
        &self,
        model_config_id: i64,
    ) -> Result<Vec<ApiKeyEntity>, sqlx::Error> {
        sqlx::query_as::<_, ApiKeyEntity>(
            "SELECT id, model_config_id, key_value, created_at, deleted_at \
             FROM api_keys WHERE model_config_id = ? AND deleted_at IS NULL ORDER BY id",
        )
        .bind(model_config_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn create_api_key(
        &self,
        model_config_id: i64,
        ciphertext: &str,
    ) -> Result<ApiKeyEntity, sqlx::Error> {
        let id = sqlx::query(
            "INSERT INTO api_keys (model_config_id, key_value, created_at) VALUES (?, ?, ?)",
        )
        .bind(model_config_id)
        .bind(ciphertext)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        sqlx::query_as::<_, ApiKeyEntity>(
            "SELECT id, model_config_id, key_value, created_at, deleted_at \
             FROM api_keys WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn delete_api_key(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE api_keys SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Stats & logs (read side; writes live in the async log writer)
    // ------------------------------------------------------------------

    pub async fn stats_for_group(
        &self,
        group_db_id: i64,
    ) -> Result<Vec<(ModelConfigEntity, Option<ModelStatsEntity>)>, sqlx::Error> {
        let configs = sqlx::query_as::<_, ModelConfigEntity>(
            "SELECT id, model_group_id, provider, upstream_url, upstream_model, \
                    timeout_secs, created_at \
             FROM model_configs WHERE model_group_id = ? ORDER BY id",
        )
        .bind(group_db_id)
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::with_capacity(configs.len());
        for config in configs {
            let stats = sqlx::query_as::<_, ModelStatsEntity>(
                "SELECT id, model_config_id, success, error, total_latency_ms, \
                        request_count, total_requests \
                 FROM model_stats WHERE model_config_id = ?",
            )
            .bind(config.id)
            .fetch_optional(&self.pool)
            .await?;
            result.push((config, stats));
        }
        Ok(result)
    }

    pub async fn list_request_logs(&self, limit: i64) -> Result<Vec<RequestLogEntity>, sqlx::Error> {
        sqlx::query_as::<_, RequestLogEntity>(
            "SELECT id, created_at, method, path, status_code, latency_ms, client_ip, \
                    user_agent, group_id, provider, upstream_model, model_config_id, error \
             FROM request_logs ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}

/// Generate a fresh administrator key: `sk-admin-` + 32 hex chars.
pub fn generate_admin_key() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sk-admin-{}", hex)
}

/// Mask a credential for log output: `sk-1***abcd`.
pub fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        return "***".to_string();
    }
    format!("{}***{}", &key[..4], &key[key.len() - 4..])
}

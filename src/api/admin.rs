//! Admin API: CRUD over groups, models, and credentials, admin-key
//! management, stats, logs, and snapshot reload.
//!
//! All routes are mounted behind the administrator-key middleware. Routing
//! changes do not take effect until a reload rebuilds the dispatcher
//! snapshot; mutating handlers trigger one automatically.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::handlers::AppState;
use crate::core::database::mask_key;
use crate::core::AppError;

// ============================================================================
// Request / response shapes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub group_id: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub models: Vec<CreateModelRequest>,
}

fn default_strategy() -> String {
    "fallback".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CreateModelRequest {
    pub provider: String,
    pub upstream_url: String,
    pub upstream_model: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: i64,
    #[serde(default)]
    pub keys: Vec<String>,
}

fn default_timeout() -> i64 {
    60
}

#[derive(Debug, Deserialize)]
pub struct UpdateGroupRequest {
    pub strategy: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateAdminKeyRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_limit")]
    pub limit: i64,
}

fn default_log_limit() -> i64 {
    100
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    success: bool,
    message: String,
}

fn ok_message(message: impl Into<String>) -> Json<ApiMessage> {
    Json(ApiMessage {
        success: true,
        message: message.into(),
    })
}

// ============================================================================
// Validation helpers
// ============================================================================

const VALID_STRATEGIES: &[&str] = &["round_robin", "fallback"];
const VALID_PROVIDERS: &[&str] = &["openai", "gemini", "claude"];

fn validate_strategy(strategy: &str) -> Result<(), AppError> {
    if VALID_STRATEGIES.contains(&strategy) {
        return Ok(());
    }
    Err(AppError::InvalidRequest(format!(
        "unknown strategy '{}' (expected one of: {})",
        strategy,
        VALID_STRATEGIES.join(", ")
    )))
}

fn validate_provider(provider: &str) -> Result<(), AppError> {
    if VALID_PROVIDERS.contains(&provider) {
        return Ok(());
    }
    Err(AppError::InvalidRequest(format!(
        "unknown provider '{}' (expected one of: {})",
        provider,
        VALID_PROVIDERS.join(", ")
    )))
}

/// Within a model no two live credentials may share a plaintext. Encryption
/// is non-deterministic, so the check decrypts and compares.
async fn check_key_unique(
    state: &AppState,
    model_config_id: i64,
    plaintext: &str,
) -> Result<(), AppError> {
    let secrets = state.dispatcher.secrets();
    for existing in state.db.list_model_keys(model_config_id).await? {
        match secrets.decrypt(&existing.key_value) {
            Ok(value) if value == plaintext => {
                return Err(AppError::InvalidRequest(
                    "an identical key already exists for this model".into(),
                ));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(key_id = existing.id, "undecryptable key skipped: {}", e);
            }
        }
    }
    Ok(())
}

// ============================================================================
// Group handlers
// ============================================================================

async fn list_groups(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let table = state.db.load_routing_table().await?;
    let groups: Vec<_> = table
        .iter()
        .map(|record| {
            json!({
                "id": record.group.id,
                "group_id": record.group.group_id,
                "strategy": record.group.strategy,
                "models": record.models.iter().map(|m| json!({
                    "id": m.config.id,
                    "provider": m.config.provider,
                    "upstream_url": m.config.upstream_url,
                    "upstream_model": m.config.upstream_model,
                    "timeout_secs": m.config.timeout_secs,
                    "keys": m.keys.iter().map(|k| json!({
                        "id": k.id,
                        "preview": mask_key(&k.key_value),
                    })).collect::<Vec<_>>(),
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    Ok(Json(json!({ "groups": groups })).into_response())
}

async fn create_group(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateGroupRequest>,
) -> Result<Response, AppError> {
    if request.group_id.trim().is_empty() {
        return Err(AppError::InvalidRequest("group_id is required".into()));
    }
    validate_strategy(&request.strategy)?;
    for model in &request.models {
        validate_provider(&model.provider)?;
    }
    if state.db.get_group(&request.group_id).await?.is_some() {
        return Err(AppError::InvalidRequest(format!(
            "group '{}' already exists",
            request.group_id
        )));
    }

    let group = state
        .db
        .create_group(request.group_id.trim(), &request.strategy)
        .await?;

    let secrets = state.dispatcher.secrets();
    for model in &request.models {
        let created = state
            .db
            .create_model(
                group.id,
                &model.provider,
                model.upstream_url.trim(),
                &model.upstream_model,
                model.timeout_secs.clamp(1, 300),
            )
            .await?;
        for key in &model.keys {
            let ciphertext = secrets.encrypt(key)?;
            state.db.create_api_key(created.id, &ciphertext).await?;
        }
    }

    state.dispatcher.refresh().await?;
    Ok((StatusCode::CREATED, Json(group)).into_response())
}

async fn update_group(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    Json(request): Json<UpdateGroupRequest>,
) -> Result<Response, AppError> {
    validate_strategy(&request.strategy)?;
    if !state
        .db
        .update_group_strategy(&group_id, &request.strategy)
        .await?
    {
        return Err(AppError::GroupNotFound(group_id));
    }
    state.dispatcher.refresh().await?;
    Ok(ok_message("group updated").into_response())
}

async fn delete_group(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
) -> Result<Response, AppError> {
    if !state.db.delete_group(&group_id).await? {
        return Err(AppError::GroupNotFound(group_id));
    }
    state.dispatcher.refresh().await?;
    Ok(ok_message("group deleted").into_response())
}

// ============================================================================
// Model handlers
// ============================================================================

async fn create_model(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    Json(request): Json<CreateModelRequest>,
) -> Result<Response, AppError> {
    validate_provider(&request.provider)?;
    let group = state
        .db
        .get_group(&group_id)
        .await?
        .ok_or(AppError::GroupNotFound(group_id))?;

    let model = state
        .db
        .create_model(
            group.id,
            &request.provider,
            request.upstream_url.trim(),
            &request.upstream_model,
            request.timeout_secs.clamp(1, 300),
        )
        .await?;

    let secrets = state.dispatcher.secrets();
    for key in &request.keys {
        let ciphertext = secrets.encrypt(key)?;
        state.db.create_api_key(model.id, &ciphertext).await?;
    }

    state.dispatcher.refresh().await?;
    Ok((StatusCode::CREATED, Json(model)).into_response())
}

async fn delete_model(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<i64>,
) -> Result<Response, AppError> {
    if !state.db.delete_model(model_id).await? {
        return Err(AppError::InvalidRequest(format!(
            "model {} not found",
            model_id
        )));
    }
    state.dispatcher.refresh().await?;
    Ok(ok_message("model deleted").into_response())
}

// ============================================================================
// Credential handlers
// ============================================================================

async fn create_key(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<i64>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<Response, AppError> {
    if request.key.trim().is_empty() {
        return Err(AppError::InvalidRequest("key is required".into()));
    }
    if state.db.get_model(model_id).await?.is_none() {
        return Err(AppError::InvalidRequest(format!(
            "model {} not found",
            model_id
        )));
    }

    check_key_unique(&state, model_id, request.key.trim()).await?;

    let ciphertext = state.dispatcher.secrets().encrypt(request.key.trim())?;
    let created = state.db.create_api_key(model_id, &ciphertext).await?;

    state.dispatcher.refresh().await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"id": created.id, "preview": mask_key(&created.key_value)})),
    )
        .into_response())
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<i64>,
) -> Result<Response, AppError> {
    if !state.db.delete_api_key(key_id).await? {
        return Err(AppError::InvalidRequest(format!(
            "key {} not found",
            key_id
        )));
    }
    state.dispatcher.refresh().await?;
    Ok(ok_message("key deleted").into_response())
}

// ============================================================================
// Admin-key handlers
// ============================================================================

async fn list_admin_keys(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let keys = state.db.list_admin_keys().await?;
    let keys: Vec<_> = keys
        .iter()
        .map(|k| {
            json!({
                "id": k.id,
                "name": k.name,
                "preview": mask_key(&k.key),
                "created_at": k.created_at,
            })
        })
        .collect();
    Ok(Json(json!({ "admin_keys": keys })).into_response())
}

async fn create_admin_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateAdminKeyRequest>,
) -> Result<Response, AppError> {
    let created = state.db.create_admin_key(&request.name).await?;
    // The plaintext is returned exactly once, at creation
    Ok((
        StatusCode::CREATED,
        Json(json!({"id": created.id, "name": created.name, "key": created.key})),
    )
        .into_response())
}

async fn delete_admin_key(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<i64>,
) -> Result<Response, AppError> {
    let remaining = state.db.list_admin_keys().await?;
    if remaining.len() <= 1 {
        return Err(AppError::InvalidRequest(
            "cannot delete the last admin key".into(),
        ));
    }
    if !state.db.delete_admin_key(key_id).await? {
        return Err(AppError::InvalidRequest(format!(
            "admin key {} not found",
            key_id
        )));
    }
    Ok(ok_message("admin key deleted").into_response())
}

// ============================================================================
// Stats, logs, reload
// ============================================================================

async fn group_stats(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
) -> Result<Response, AppError> {
    let group = state
        .db
        .get_group(&group_id)
        .await?
        .ok_or_else(|| AppError::GroupNotFound(group_id.clone()))?;

    let stats = state.db.stats_for_group(group.id).await?;
    let mut total_requests = 0i64;
    let models: Vec<_> = stats
        .iter()
        .enumerate()
        .map(|(index, (config, stats))| {
            let (success, error, request_count, avg_latency) = match stats {
                Some(s) => {
                    total_requests += s.request_count;
                    let avg = if s.request_count > 0 {
                        s.total_latency_ms / s.request_count as f64
                    } else {
                        0.0
                    };
                    (s.success, s.error, s.request_count, avg)
                }
                None => (0, 0, 0, 0.0),
            };
            json!({
                "index": index + 1,
                "provider": config.provider,
                "upstream_model": config.upstream_model,
                "success": success,
                "error": error,
                "requests": request_count,
                "avg_latency_ms": avg_latency,
            })
        })
        .collect();

    Ok(Json(json!({
        "group_id": group.group_id,
        "strategy": group.strategy,
        "models": models,
        "total_requests": total_requests,
        "timestamp": chrono::Utc::now().timestamp(),
    }))
    .into_response())
}

async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, AppError> {
    let logs = state.db.list_request_logs(query.limit.clamp(1, 1000)).await?;
    Ok(Json(json!({ "logs": logs })).into_response())
}

async fn reload(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let groups = state.dispatcher.refresh().await?;
    Ok(Json(json!({"success": true, "groups": groups})).into_response())
}

/// Admin router; caller layers the admin-auth middleware on top.
pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/groups", get(list_groups).post(create_group))
        .route("/groups/:group_id", put(update_group).delete(delete_group))
        .route("/groups/:group_id/models", post(create_model))
        .route("/models/:model_id", delete(delete_model))
        .route("/models/:model_id/keys", post(create_key))
        .route("/keys/:key_id", delete(delete_key))
        .route("/admin-keys", get(list_admin_keys).post(create_admin_key))
        .route("/admin-keys/:key_id", delete(delete_admin_key))
        .route("/stats/:group_id", get(group_stats))
        .route("/logs", get(list_logs))
        .route("/reload", post(reload))
}

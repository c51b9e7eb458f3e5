//! The dispatch engine.
//!
//! Holds the in-memory routing snapshot (swapped atomically on reload),
//! parses the request's routing token, selects an upstream model and
//! credential per group policy, classifies upstream failures, and drives the
//! per-request retry cursor. No lock is held while upstream I/O is in
//! flight: the snapshot is read through an atomic pointer and the credential
//! health store has its own narrow critical section.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::core::database::Database;
use crate::core::error::AppError;
use crate::core::mask_key;
use crate::services::key_health::KeyHealthStore;
use crate::services::secret::SecretProvider;
use crate::services::strategy::StrategyRegistry;

// ============================================================================
// Snapshot types
// ============================================================================

/// Upstream provider family, selecting the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderFamily {
    OpenAi,
    Gemini,
    Claude,
}

impl ProviderFamily {
    /// Parse the persisted provider string. Unrecognized values dispatch as
    /// OpenAI-compatible, which is the passthrough family.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "gemini" | "google" => Self::Gemini,
            "claude" | "anthropic" => Self::Claude,
            _ => Self::OpenAi,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Claude => "claude",
        }
    }
}

/// One upstream endpoint in the snapshot.
#[derive(Debug, Clone)]
pub struct ModelEndpoint {
    pub id: i64,
    pub provider: ProviderFamily,
    pub upstream_url: String,
    pub upstream_model: String,
    pub timeout_secs: u64,
}

/// Immutable per-group state inside a snapshot.
pub struct GroupState {
    pub db_id: i64,
    pub group_id: String,
    pub strategy: String,
    pub models: Vec<ModelEndpoint>,
    /// Decrypted credentials keyed by model config id
    pub keys: HashMap<i64, Vec<String>>,
    /// Survives snapshot swaps as long as the group id survives
    pub counter: Arc<AtomicU64>,
}

impl GroupState {
    pub fn keys_for(&self, model: &ModelEndpoint) -> &[String] {
        self.keys.get(&model.id).map(|k| k.as_slice()).unwrap_or(&[])
    }

    fn total_keys(&self) -> usize {
        self.models.iter().map(|m| self.keys_for(m).len()).sum()
    }
}

/// The immutable routing view, rebuilt atomically on reload.
#[derive(Default)]
pub struct RoutingSnapshot {
    groups: HashMap<String, Arc<GroupState>>,
}

impl RoutingSnapshot {
    pub fn group(&self, group_id: &str) -> Option<&Arc<GroupState>> {
        self.groups.get(group_id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

// ============================================================================
// Routing token
// ============================================================================

/// Parsed routing token: a group plus an optional pinned model index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub group_id: String,
    pub pin_index: Option<usize>,
}

impl Routing {
    pub fn is_pinned(&self) -> bool {
        self.pin_index.is_some()
    }
}

// ============================================================================
// Failure classification
// ============================================================================

/// Upstream failure classes driving health feedback and cursor transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 429: credential cooled for 60 s, next credential
    RateLimited,
    /// 401/403: credential dead, next credential
    AuthRejected,
    /// 400/404/405: endpoint misconfigured, skip the whole model
    UpstreamConfig,
    /// 5xx: credential cooled for 30 s, next credential
    ServerError,
    /// Other 4xx: no health action, next credential
    OtherClient,
    /// Generic transport failure: short cooldown, next credential
    NetworkSoft,
    /// Connection refused / DNS / TLS: the endpoint is unreachable, skip it
    NetworkHard,
}

/// Classify an upstream HTTP status (non-200).
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        429 => FailureClass::RateLimited,
        401 | 403 => FailureClass::AuthRejected,
        400 | 404 | 405 => FailureClass::UpstreamConfig,
        500..=599 => FailureClass::ServerError,
        _ => FailureClass::OtherClient,
    }
}

/// Classify a transport-level error from the HTTP client.
pub fn classify_transport(err: &reqwest::Error) -> FailureClass {
    if err.is_connect() {
        return FailureClass::NetworkHard;
    }
    let text = format!("{:#}", err).to_lowercase();
    let hard_patterns = [
        "connection refused",
        "no such host",
        "dns error",
        "failed to lookup",
        "certificate",
        "tls handshake",
        "handshake",
    ];
    if hard_patterns.iter().any(|p| text.contains(p)) {
        FailureClass::NetworkHard
    } else {
        FailureClass::NetworkSoft
    }
}

impl FailureClass {
    /// Whether this failure invalidates the whole model for this request.
    pub fn skips_model(&self) -> bool {
        matches!(self, FailureClass::UpstreamConfig | FailureClass::NetworkHard)
    }
}

// ============================================================================
// Retry cursor
// ============================================================================

/// Per-request `(model, key)` cursor. Pinned routing disables cross-model
/// advancement; round-robin groups wrap the model cursor, fallback groups
/// terminate at the end of the list.
#[derive(Debug, Clone)]
pub struct RetryCursor {
    pub model: usize,
    pub key: usize,
    pinned: bool,
    wraps: bool,
    total_models: usize,
}

impl RetryCursor {
    fn new(model: usize, key: usize, pinned: bool, wraps: bool, total_models: usize) -> Self {
        Self {
            model,
            key,
            pinned,
            wraps,
            total_models,
        }
    }

    /// Advance to the next credential, falling over to the next model when
    /// the current one is exhausted. Returns false when the cursor is done.
    pub fn advance_key(&mut self, total_keys: usize) -> bool {
        if total_keys > 0 && self.key < total_keys - 1 {
            self.key += 1;
            return true;
        }
        if self.pinned {
            return false;
        }
        self.next_model()
    }

    /// Skip the remaining credentials of the current model entirely.
    pub fn skip_model(&mut self) -> bool {
        if self.pinned {
            return false;
        }
        self.next_model()
    }

    fn next_model(&mut self) -> bool {
        self.key = 0;
        self.model += 1;
        if self.model < self.total_models {
            return true;
        }
        if self.wraps {
            self.model = 0;
            return true;
        }
        false
    }
}

// ============================================================================
// Dispatch plan
// ============================================================================

/// One selected attempt: which model and which credential to use.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub model_index: usize,
    pub key_index: usize,
    pub key: String,
}

/// Per-request dispatch state: the group snapshot, the retry cursor, and the
/// bounded attempt budget.
pub struct DispatchPlan {
    pub group: Arc<GroupState>,
    pub cursor: RetryCursor,
    pub max_attempts: usize,
}

impl DispatchPlan {
    /// Yield the next `(model, credential)` pair, skipping credentials the
    /// health store reports unavailable. Skipped credentials consume no
    /// attempt but the scan is bounded by the key-list length per model and
    /// by the model count overall, so a fully exhausted group cannot spin.
    pub fn next_attempt(&mut self, health: &KeyHealthStore) -> Option<Attempt> {
        let total_models = self.group.models.len();
        let mut models_scanned = 0;

        while models_scanned <= total_models {
            let model_index = self.cursor.model;
            let model = self.group.models.get(model_index)?;
            let keys = self.group.keys_for(model);

            if keys.is_empty() {
                if !self.cursor.skip_model() {
                    return None;
                }
                models_scanned += 1;
                continue;
            }

            let start = self.cursor.key % keys.len();
            for offset in 0..keys.len() {
                let key_index = (start + offset) % keys.len();
                if health.is_available(&keys[key_index]) {
                    self.cursor.key = key_index;
                    return Some(Attempt {
                        model_index,
                        key_index,
                        key: keys[key_index].clone(),
                    });
                }
            }

            // Every credential of this model is cooling down or dead
            if !self.cursor.skip_model() {
                return None;
            }
            models_scanned += 1;
        }

        None
    }

    /// Feed a failure class back into the cursor. Returns false when the
    /// retry loop must terminate.
    pub fn apply_failure(&mut self, class: FailureClass) -> bool {
        if class.skips_model() {
            self.cursor.skip_model()
        } else {
            let keys = self
                .group
                .models
                .get(self.cursor.model)
                .map(|m| self.group.keys_for(m).len())
                .unwrap_or(0);
            self.cursor.advance_key(keys)
        }
    }

    pub fn model(&self, index: usize) -> &ModelEndpoint {
        &self.group.models[index]
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Dispatcher over the hot-reloadable routing snapshot.
pub struct Dispatcher {
    snapshot: ArcSwap<RoutingSnapshot>,
    db: Database,
    secrets: Arc<dyn SecretProvider>,
    key_health: Arc<KeyHealthStore>,
    strategies: StrategyRegistry,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        secrets: Arc<dyn SecretProvider>,
        key_health: Arc<KeyHealthStore>,
    ) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RoutingSnapshot::default()),
            db,
            secrets,
            key_health,
            strategies: StrategyRegistry::with_builtins(),
        }
    }

    pub fn key_health(&self) -> &Arc<KeyHealthStore> {
        &self.key_health
    }

    pub fn secrets(&self) -> &Arc<dyn SecretProvider> {
        &self.secrets
    }

    /// Current snapshot (lock-free pointer read).
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot.load_full()
    }

    /// Rebuild the snapshot from the repository and swap it in atomically.
    ///
    /// Credentials are decrypted here, once per reload; a credential that
    /// fails to decrypt is logged and skipped. Per-group counters are
    /// preserved across refresh by group id.
    pub async fn refresh(&self) -> Result<usize, AppError> {
        let records = self.db.load_routing_table().await?;
        let old = self.snapshot.load();

        let mut groups = HashMap::with_capacity(records.len());
        for record in records {
            let counter = old
                .group(&record.group.group_id)
                .map(|g| g.counter.clone())
                .unwrap_or_else(|| Arc::new(AtomicU64::new(0)));

            let mut models = Vec::with_capacity(record.models.len());
            let mut keys: HashMap<i64, Vec<String>> = HashMap::new();

            for model in record.models {
                let mut decrypted = Vec::with_capacity(model.keys.len());
                for key in &model.keys {
                    match self.secrets.decrypt(&key.key_value) {
                        Ok(plain) => decrypted.push(plain),
                        Err(e) => {
                            tracing::error!(
                                model = %model.config.upstream_model,
                                key_id = key.id,
                                "failed to decrypt credential, skipping: {}", e
                            );
                        }
                    }
                }
                keys.insert(model.config.id, decrypted);
                models.push(ModelEndpoint {
                    id: model.config.id,
                    provider: ProviderFamily::parse(&model.config.provider),
                    upstream_url: model.config.upstream_url.trim().to_string(),
                    upstream_model: model.config.upstream_model.clone(),
                    timeout_secs: model.config.timeout_secs.max(1) as u64,
                });
            }

            groups.insert(
                record.group.group_id.clone(),
                Arc::new(GroupState {
                    db_id: record.group.id,
                    group_id: record.group.group_id,
                    strategy: record.group.strategy,
                    models,
                    keys,
                    counter,
                }),
            );
        }

        let count = groups.len();
        self.snapshot.store(Arc::new(RoutingSnapshot { groups }));
        tracing::info!(groups = count, "routing snapshot reloaded");
        Ok(count)
    }

    /// Parse the request's `model` field into a routing decision.
    ///
    /// `<groupId>` routes by strategy; `<groupId>$<n>` pins the 1-based n-th
    /// model. A bare token that matches no group is matched against upstream
    /// model names across all groups; failing that it is returned as-is and
    /// dispatch fails with GroupNotFound.
    pub fn parse_routing(&self, token: &str) -> Routing {
        let token = token.trim();

        if let Some(pos) = token.find('$') {
            let group_id = token[..pos].trim();
            let suffix = token[pos + 1..].trim();
            if group_id.is_empty() {
                return Routing {
                    group_id: token.to_string(),
                    pin_index: None,
                };
            }
            // Unparseable or non-positive suffix downgrades to strategy mode
            let pin_index = suffix
                .parse::<i64>()
                .ok()
                .filter(|n| *n >= 1)
                .map(|n| (n - 1) as usize);
            return Routing {
                group_id: group_id.to_string(),
                pin_index,
            };
        }

        let snapshot = self.snapshot.load();
        if snapshot.group(token).is_some() {
            return Routing {
                group_id: token.to_string(),
                pin_index: None,
            };
        }

        // Bare upstream model name: treat as a pin inside the owning group
        for group in snapshot.groups.values() {
            if let Some(index) = group
                .models
                .iter()
                .position(|m| m.upstream_model == token)
            {
                return Routing {
                    group_id: group.group_id.clone(),
                    pin_index: Some(index),
                };
            }
        }

        Routing {
            group_id: token.to_string(),
            pin_index: None,
        }
    }

    /// Build the per-request dispatch plan: resolve the group, pick the
    /// starting cursor position, and size the attempt budget.
    pub fn plan(&self, routing: &Routing) -> Result<DispatchPlan, AppError> {
        let snapshot = self.snapshot.load();
        let group = snapshot
            .group(&routing.group_id)
            .cloned()
            .ok_or_else(|| AppError::GroupNotFound(routing.group_id.clone()))?;

        if group.models.is_empty() {
            return Err(AppError::GroupNotFound(routing.group_id.clone()));
        }
        if group.total_keys() == 0 {
            return Err(AppError::NoKeysAvailable(routing.group_id.clone()));
        }

        let wraps = group.strategy == "round_robin";
        let total_models = group.models.len();

        let cursor = match routing.pin_index {
            Some(pin) => {
                if pin >= total_models {
                    return Err(AppError::ModelIndexOutOfBounds {
                        group: routing.group_id.clone(),
                        index: pin,
                    });
                }
                if group.keys_for(&group.models[pin]).is_empty() {
                    return Err(AppError::NoKeysAvailable(routing.group_id.clone()));
                }
                RetryCursor::new(pin, 0, true, false, total_models)
            }
            None => {
                // One counter tick per routing call feeds both the strategy
                // and the starting key offset
                let count = group.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
                let strategy = self.strategies.resolve(&group.strategy);
                let model_index = strategy.select(&group.models, count)?;
                let key_count = group.keys_for(&group.models[model_index]).len();
                let key_offset = if key_count > 0 {
                    (count % key_count as u64) as usize
                } else {
                    0
                };
                RetryCursor::new(model_index, key_offset, false, wraps, total_models)
            }
        };

        let max_attempts = max_attempts_for(group.total_keys());

        Ok(DispatchPlan {
            group,
            cursor,
            max_attempts,
        })
    }

    /// Feed an attempt outcome back into the credential health store.
    pub fn report_failure(&self, key: &str, class: FailureClass) {
        match class {
            FailureClass::RateLimited => {
                self.key_health.mark_cooldown(key, Duration::from_secs(60));
                tracing::warn!(key = %mask_key(key), "credential cooldown (429)");
            }
            FailureClass::AuthRejected => {
                self.key_health.mark_dead(key);
                tracing::error!(key = %mask_key(key), "credential marked dead (auth error)");
            }
            FailureClass::ServerError => {
                self.key_health.mark_cooldown(key, Duration::from_secs(30));
            }
            FailureClass::NetworkSoft | FailureClass::NetworkHard => {
                self.key_health.mark_cooldown(key, Duration::from_secs(10));
            }
            FailureClass::UpstreamConfig | FailureClass::OtherClient => {}
        }
    }
}

/// `clamp(ceil(1.5 × total keys), 3, 12)`.
pub fn max_attempts_for(total_keys: usize) -> usize {
    let scaled = (total_keys as f64 * 1.5).ceil() as usize;
    scaled.clamp(3, 12)
}

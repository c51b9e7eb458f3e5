//! Async batched request-log writer.
//!
//! A bounded MPSC channel feeds a single background worker that batch-inserts
//! request logs, folds them into per-model statistics deltas applied via an
//! atomic upsert, and prunes old rows to the configured retention. Producers
//! never block the request path: when the channel is full the record is
//! dropped with a warning.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::core::database::Database;

const CHANNEL_CAPACITY: usize = 1000;
const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL_SECS: u64 = 5;
const ERROR_EXCERPT_MAX: usize = 200;

/// One request-log record in flight.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub created_at: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub latency_ms: f64,
    pub client_ip: String,
    pub user_agent: String,
    pub group_id: Option<String>,
    pub provider: Option<String>,
    pub upstream_model: Option<String>,
    pub model_config_id: Option<i64>,
    pub error: Option<String>,
}

impl Default for RequestLog {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            method: "POST".to_string(),
            path: String::new(),
            status_code: 0,
            latency_ms: 0.0,
            client_ip: String::new(),
            user_agent: String::new(),
            group_id: None,
            provider: None,
            upstream_model: None,
            model_config_id: None,
            error: None,
        }
    }
}

impl RequestLog {
    /// A log counts as success iff `200 <= status < 500` and not 429.
    pub fn is_success(&self) -> bool {
        (200..500).contains(&self.status_code) && self.status_code != 429
    }

    /// Attach an error excerpt, truncated to a bounded length.
    pub fn with_error(mut self, message: &str) -> Self {
        let excerpt = if message.len() > ERROR_EXCERPT_MAX {
            let mut end = ERROR_EXCERPT_MAX;
            while end > 0 && !message.is_char_boundary(end) {
                end -= 1;
            }
            &message[..end]
        } else {
            message
        };
        self.error = Some(excerpt.to_string());
        self
    }
}

/// Per-model statistics delta accumulated during a flush.
#[derive(Debug, Default, Clone, Copy)]
struct StatsDelta {
    success: i64,
    error: i64,
    total_latency_ms: f64,
    request_count: i64,
}

/// Asynchronous request logger with batch persistence.
pub struct AsyncRequestLogger {
    // Mutex<Option<…>> lets close() take and drop the sender, which closes
    // the channel and triggers the worker's final drain.
    tx: Mutex<Option<mpsc::Sender<RequestLog>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl AsyncRequestLogger {
    /// Spawn the background worker and return the producer handle.
    pub fn new(db: Database, retention: u32) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(Self::worker_loop(rx, db, retention, done_tx));
        Self {
            tx: Mutex::new(Some(tx)),
            done_rx: Mutex::new(Some(done_rx)),
        }
    }

    /// Submit a record. Non-blocking; drops the record when the queue is full.
    pub fn log(&self, record: RequestLog) {
        let guard = self.tx.lock().expect("log sender lock poisoned");
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(record).is_err() {
                tracing::warn!("request log channel full, dropping record");
            }
        }
    }

    /// Close the queue and wait for the worker to drain and flush.
    pub async fn close(&self) {
        let sender = self.tx.lock().expect("log sender lock poisoned").take();
        drop(sender);
        let done = self.done_rx.lock().expect("done lock poisoned").take();
        if let Some(rx) = done {
            let _ = rx.await;
        }
    }

    async fn worker_loop(
        mut rx: mpsc::Receiver<RequestLog>,
        db: Database,
        retention: u32,
        done_tx: oneshot::Sender<()>,
    ) {
        let mut batch: Vec<RequestLog> = Vec::with_capacity(BATCH_SIZE);
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(FLUSH_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some(record) => {
                            batch.push(record);
                            if batch.len() >= BATCH_SIZE {
                                Self::flush(&db, &mut batch, retention).await;
                            }
                        }
                        None => {
                            // Channel closed: drain whatever is buffered, then exit
                            Self::flush(&db, &mut batch, retention).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        Self::flush(&db, &mut batch, retention).await;
                    }
                }
            }
        }

        tracing::info!("request log writer stopped");
        let _ = done_tx.send(());
    }

    async fn flush(db: &Database, batch: &mut Vec<RequestLog>, retention: u32) {
        if batch.is_empty() {
            return;
        }

        if let Err(e) = Self::insert_logs(db, batch).await {
            tracing::error!("failed to flush request logs: {}", e);
        }

        let deltas = Self::fold_stats(batch);
        for (model_config_id, delta) in deltas {
            if let Err(e) = Self::upsert_stats(db, model_config_id, delta).await {
                tracing::error!(
                    model_config_id,
                    "failed to upsert model stats: {}", e
                );
            }
        }

        if let Err(e) = Self::prune(db, retention).await {
            tracing::error!("failed to prune request logs: {}", e);
        }

        batch.clear();
    }

    async fn insert_logs(db: &Database, batch: &[RequestLog]) -> Result<(), sqlx::Error> {
        let cols = 12;
        let mut sql = String::from(
            "INSERT INTO request_logs (\
             created_at, method, path, status_code, latency_ms, client_ip, \
             user_agent, group_id, provider, upstream_model, model_config_id, error\
             ) VALUES ",
        );
        for i in 0..batch.len() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push('(');
            for j in 0..cols {
                if j > 0 {
                    sql.push_str(", ");
                }
                sql.push('?');
            }
            sql.push(')');
        }

        let mut query = sqlx::query(&sql);
        for record in batch {
            query = query
                .bind(record.created_at)
                .bind(&record.method)
                .bind(&record.path)
                .bind(record.status_code as i64)
                .bind(record.latency_ms)
                .bind(&record.client_ip)
                .bind(&record.user_agent)
                .bind(&record.group_id)
                .bind(&record.provider)
                .bind(&record.upstream_model)
                .bind(record.model_config_id)
                .bind(&record.error);
        }

        query.execute(db.pool()).await?;
        Ok(())
    }

    /// Fold a batch into per-model deltas. Records without a resolved model
    /// config id (auth failures, unroutable tokens) only reach the log table.
    fn fold_stats(batch: &[RequestLog]) -> HashMap<i64, StatsDelta> {
        let mut deltas: HashMap<i64, StatsDelta> = HashMap::new();
        for record in batch {
            let Some(model_config_id) = record.model_config_id else {
                continue;
            };
            let delta = deltas.entry(model_config_id).or_default();
            if record.is_success() {
                delta.success += 1;
            } else {
                delta.error += 1;
            }
            delta.total_latency_ms += record.latency_ms;
            delta.request_count += 1;
        }
        deltas
    }

    async fn upsert_stats(
        db: &Database,
        model_config_id: i64,
        delta: StatsDelta,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO model_stats \
             (model_config_id, success, error, total_latency_ms, request_count, total_requests) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(model_config_id) DO UPDATE SET \
                success = success + excluded.success, \
                error = error + excluded.error, \
                total_latency_ms = total_latency_ms + excluded.total_latency_ms, \
                request_count = request_count + excluded.request_count, \
                total_requests = total_requests + excluded.total_requests",
        )
        .bind(model_config_id)
        .bind(delta.success)
        .bind(delta.error)
        .bind(delta.total_latency_ms)
        .bind(delta.request_count)
        .bind(delta.request_count)
        .execute(db.pool())
        .await?;
        Ok(())
    }

    /// Keep only the most recent `retention` rows.
    async fn prune(db: &Database, retention: u32) -> Result<(), sqlx::Error> {
        sqlx::query(
            "DELETE FROM request_logs WHERE id NOT IN \
             (SELECT id FROM request_logs ORDER BY id DESC LIMIT ?)",
        )
        .bind(retention as i64)
        .execute(db.pool())
        .await?;
        Ok(())
    }
}

//! Background sync engine.
//!
//! Local writes land in `records` and append an outbox row to `sync_queue`.
//! A background loop pushes due outbox rows to the cloud in per-collection
//! batches, then pulls remote changes since a per-collection cursor and
//! merges them by record id with last-write-wins on `updatedAt`. Each
//! collection is pushed and pulled independently so a failure in one does
//! not block the others.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{self, CloudEndpoint, PushItem};
use crate::db::{self, DbState};
use crate::events::EventBus;
use crate::storage;
use crate::store::{self, Collection};

const DEFAULT_RETRY_DELAY_MS: i64 = 5_000;
const MAX_RETRY_DELAY_MS: i64 = 300_000;
const SETTINGS_CATEGORY: &str = "sync";

// ---------------------------------------------------------------------------
// Configuration and state
// ---------------------------------------------------------------------------

/// Sync settings stored in `local_settings` under category `sync`.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_size: usize,
    pub max_retries: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            batch_size: 50,
            max_retries: 5,
        }
    }
}

impl SyncConfig {
    pub fn load(conn: &Connection) -> Self {
        let defaults = Self::default();
        let read = |key: &str| db::get_setting(conn, SETTINGS_CATEGORY, key);
        Self {
            enabled: read("enabled")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.enabled),
            interval_secs: read("interval_secs")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.interval_secs),
            batch_size: read("batch_size")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            max_retries: read("max_retries")
                .and_then(|v| v.parse::<i64>().ok())
                .map(|v| v.clamp(1, 50))
                .unwrap_or(defaults.max_retries),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(5..=86_400).contains(&self.interval_secs) {
            return Err("Sync interval must be between 5 seconds and 24 hours".into());
        }
        if !(1..=500).contains(&self.batch_size) {
            return Err("Batch size must be between 1 and 500".into());
        }
        if !(1..=50).contains(&self.max_retries) {
            return Err("Max retries must be between 1 and 50".into());
        }
        Ok(())
    }

    pub fn save(&self, conn: &Connection) -> Result<(), String> {
        self.validate()?;
        db::set_setting(conn, SETTINGS_CATEGORY, "enabled", &self.enabled.to_string())?;
        db::set_setting(
            conn,
            SETTINGS_CATEGORY,
            "interval_secs",
            &self.interval_secs.to_string(),
        )?;
        db::set_setting(
            conn,
            SETTINGS_CATEGORY,
            "batch_size",
            &self.batch_size.to_string(),
        )?;
        db::set_setting(
            conn,
            SETTINGS_CATEGORY,
            "max_retries",
            &self.max_retries.to_string(),
        )
    }
}

fn cursor_key(collection: Collection) -> String {
    format!("cursor_{collection}")
}

pub fn get_cursor(conn: &Connection, collection: Collection) -> Option<String> {
    db::get_setting(conn, SETTINGS_CATEGORY, &cursor_key(collection))
}

/// Shared state of the background loop.
pub struct SyncState {
    pub is_running: Arc<AtomicBool>,
    pub is_online: Arc<AtomicBool>,
    pub last_sync: Arc<Mutex<Option<String>>>,
    pub last_error: Arc<Mutex<Option<String>>>,
    /// Serializes cycles between the loop and `force_sync`.
    cycle_lock: tokio::sync::Mutex<()>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            is_online: Arc::new(AtomicBool::new(false)),
            last_sync: Arc::new(Mutex::new(None)),
            last_error: Arc::new(Mutex::new(None)),
            cycle_lock: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(None),
        }
    }

    fn record_success(&self) {
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    fn record_error(&self, error: &str) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(error.to_string());
        }
    }

    /// Cancel the background loop, if one is running.
    pub fn stop(&self) {
        if let Ok(mut guard) = self.cancel.lock() {
            if let Some(token) = guard.take() {
                token.cancel();
            }
        }
        self.is_running.store(false, Ordering::SeqCst);
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// What one sync cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub requeued: usize,
    pub pushed: usize,
    pub rejected: usize,
    pub retried: usize,
    pub pulled: usize,
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    KeptLocal,
    Invalid,
}

fn remote_updated_at(doc: &Value) -> Option<DateTime<Utc>> {
    doc.get("updatedAt")
        .or_else(|| doc.get("updated_at"))
        .and_then(Value::as_str)
        .and_then(store::parse_timestamp)
}

fn remote_deleted(doc: &Value) -> bool {
    doc.get("deleted")
        .or_else(|| doc.get("isDeleted"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Merge one remote document by id. The newer `updatedAt` wins; equal
/// timestamps keep the local copy. Tombstones delete.
pub fn merge_remote_record(
    conn: &Connection,
    collection: Collection,
    doc: &Value,
) -> Result<MergeOutcome, String> {
    let Some(id) = doc.get("id").and_then(Value::as_str).filter(|s| !s.is_empty()) else {
        return Ok(MergeOutcome::Invalid);
    };
    let Some(remote_at) = remote_updated_at(doc) else {
        warn!(collection = %collection, record_id = %id, "remote record without updatedAt");
        return Ok(MergeOutcome::Invalid);
    };

    if let Some(local) = store::stored(conn, collection, id)? {
        if local.updated_at >= remote_at {
            debug!(collection = %collection, record_id = %id, "local copy is newer, keeping it");
            return Ok(MergeOutcome::KeptLocal);
        }
    }

    store::put_remote(conn, collection, id, doc, remote_at, remote_deleted(doc))?;
    Ok(MergeOutcome::Applied)
}

// ---------------------------------------------------------------------------
// Outbox bookkeeping
// ---------------------------------------------------------------------------

/// Re-enqueue records whose content differs from what was last synced and
/// that have no live outbox row.
pub fn requeue_dirty(conn: &Connection) -> Result<usize, String> {
    let mut stmt = conn
        .prepare(
            "SELECT r.collection, r.id, r.data, r.deleted, r.content_hash
             FROM records r
             WHERE (r.synced_hash IS NULL OR r.synced_hash != r.content_hash)
               AND NOT EXISTS (
                   SELECT 1 FROM sync_queue q
                   WHERE q.collection = r.collection
                     AND q.record_id = r.id
                     AND q.status IN ('pending', 'in_progress', 'failed')
               )",
        )
        .map_err(|e| format!("prepare dirty scan: {e}"))?;
    let dirty: Vec<(String, String, String, i64, String)> = stmt
        .query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })
        .map_err(|e| format!("dirty scan: {e}"))?
        .filter_map(|r| r.ok())
        .collect();

    let mut requeued = 0;
    for (collection, id, data, deleted, hash) in dirty {
        let Some(collection) = Collection::parse(&collection) else {
            continue;
        };
        let operation = if deleted != 0 { "delete" } else { "upsert" };
        store::enqueue(conn, collection, &id, operation, &data, &hash)?;
        requeued += 1;
    }
    if requeued > 0 {
        info!(requeued, "Re-enqueued unsynced records");
    }
    Ok(requeued)
}

/// Rows left `in_progress` by an interrupted cycle go back to `pending`.
fn recover_in_progress(conn: &Connection) -> Result<usize, String> {
    conn.execute(
        "UPDATE sync_queue SET status = 'pending', updated_at = datetime('now')
         WHERE status = 'in_progress'",
        [],
    )
    .map_err(|e| format!("recover in-progress rows: {e}"))
}

#[derive(Debug, Clone)]
struct QueueItem {
    id: i64,
    collection: Collection,
    record_id: String,
    operation: String,
    payload: String,
    content_hash: String,
    idempotency_key: String,
    retry_count: i64,
    max_retries: i64,
    retry_delay_ms: i64,
}

/// Claim up to `limit` due rows and mark them `in_progress`.
fn take_due_batch(conn: &Connection, limit: usize) -> Result<Vec<QueueItem>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT id, collection, record_id, operation, payload, content_hash,
                    idempotency_key, retry_count, max_retries,
                    COALESCE(retry_delay_ms, 5000)
             FROM sync_queue
             WHERE status = 'pending'
               AND retry_count < max_retries
               AND (next_retry_at IS NULL OR julianday(next_retry_at) <= julianday('now'))
             ORDER BY COALESCE(next_retry_at, created_at) ASC, id ASC
             LIMIT ?1",
        )
        .map_err(|e| format!("prepare due batch: {e}"))?;
    let rows: Vec<(i64, String, String, String, String, String, String, i64, i64, i64)> = stmt
        .query_map(params![limit as i64], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
            ))
        })
        .map_err(|e| format!("due batch: {e}"))?
        .filter_map(|r| r.ok())
        .collect();

    let mut items = Vec::with_capacity(rows.len());
    for (id, collection, record_id, operation, payload, content_hash, key, retries, max, delay) in
        rows
    {
        let Some(collection) = Collection::parse(&collection) else {
            warn!(queue_id = id, collection = %collection, "dropping sync row for unknown collection");
            let _ = conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id]);
            continue;
        };
        conn.execute(
            "UPDATE sync_queue SET status = 'in_progress', updated_at = datetime('now') WHERE id = ?1",
            params![id],
        )
        .map_err(|e| format!("claim sync row: {e}"))?;
        items.push(QueueItem {
            id,
            collection,
            record_id,
            operation,
            payload,
            content_hash,
            idempotency_key: key,
            retry_count: retries,
            max_retries: max,
            retry_delay_ms: delay,
        });
    }
    Ok(items)
}

fn mark_synced(conn: &Connection, item: &QueueItem) -> Result<(), String> {
    conn.execute(
        "UPDATE sync_queue
         SET status = 'synced', last_error = NULL, synced_at = datetime('now'),
             updated_at = datetime('now')
         WHERE id = ?1",
        params![item.id],
    )
    .map_err(|e| format!("mark synced: {e}"))?;
    // Only when the record has not changed since this payload was queued.
    conn.execute(
        "UPDATE records SET synced_hash = ?3
         WHERE collection = ?1 AND id = ?2 AND content_hash = ?3",
        params![item.collection.as_str(), item.record_id, item.content_hash],
    )
    .map_err(|e| format!("record synced hash: {e}"))?;
    Ok(())
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    (seed.unsigned_abs() % 700) as i64 + 50
}

fn schedule_next_retry(delay_ms: i64, seed: i64, now: DateTime<Utc>) -> String {
    let bounded = delay_ms.clamp(1_000, MAX_RETRY_DELAY_MS);
    let jitter = deterministic_jitter_ms(seed);
    (now + ChronoDuration::milliseconds(bounded + jitter)).to_rfc3339()
}

/// Record a failed attempt: double the delay, or give up after
/// `max_retries`. Returns true when the row is now `failed`.
fn mark_failed(conn: &Connection, item: &QueueItem, error: &str) -> Result<bool, String> {
    let new_count = item.retry_count + 1;
    let exhausted = new_count >= item.max_retries;
    let next_delay = (item.retry_delay_ms.max(DEFAULT_RETRY_DELAY_MS) * 2).min(MAX_RETRY_DELAY_MS);
    let next_retry_at = if exhausted {
        None
    } else {
        Some(schedule_next_retry(next_delay, item.id, Utc::now()))
    };
    conn.execute(
        "UPDATE sync_queue
         SET status = ?1, retry_count = ?2, next_retry_at = ?3, retry_delay_ms = ?4,
             last_error = ?5, updated_at = datetime('now')
         WHERE id = ?6",
        params![
            if exhausted { "failed" } else { "pending" },
            new_count,
            next_retry_at,
            next_delay,
            error,
            item.id
        ],
    )
    .map_err(|e| format!("mark failed: {e}"))?;
    if exhausted {
        warn!(
            queue_id = item.id,
            collection = %item.collection,
            record_id = %item.record_id,
            error,
            "Sync row exhausted its retries"
        );
    }
    Ok(exhausted)
}

/// Put claimed rows back without counting an attempt.
fn release(conn: &Connection, items: &[QueueItem], error: &str) {
    for item in items {
        let _ = conn.execute(
            "UPDATE sync_queue SET status = 'pending', last_error = ?1, updated_at = datetime('now')
             WHERE id = ?2",
            params![error, item.id],
        );
    }
}

/// Make `failed` rows eligible again.
pub fn retry_failed(conn: &Connection) -> Result<usize, String> {
    conn.execute(
        "UPDATE sync_queue
         SET status = 'pending', retry_count = 0, next_retry_at = NULL,
             retry_delay_ms = ?1, updated_at = datetime('now')
         WHERE status = 'failed'",
        params![DEFAULT_RETRY_DELAY_MS],
    )
    .map_err(|e| format!("retry failed rows: {e}"))
}

/// Delete `synced` outbox rows older than `older_than_days`.
pub fn prune_synced(conn: &Connection, older_than_days: i64) -> Result<usize, String> {
    conn.execute(
        "DELETE FROM sync_queue
         WHERE status = 'synced'
           AND julianday(COALESCE(synced_at, updated_at)) < julianday('now', ?1)",
        params![format!("-{} days", older_than_days.max(0))],
    )
    .map_err(|e| format!("prune synced rows: {e}"))
}

/// Most recent error messages on the outbox, newest first.
pub fn recent_errors(conn: &Connection, limit: usize) -> Vec<Value> {
    let Ok(mut stmt) = conn.prepare(
        "SELECT collection, record_id, operation, status, retry_count, last_error, updated_at
         FROM sync_queue
         WHERE last_error IS NOT NULL
         ORDER BY updated_at DESC, id DESC
         LIMIT ?1",
    ) else {
        return Vec::new();
    };
    stmt.query_map(params![limit as i64], |row| {
        Ok(serde_json::json!({
            "collection": row.get::<_, String>(0)?,
            "recordId": row.get::<_, String>(1)?,
            "operation": row.get::<_, String>(2)?,
            "status": row.get::<_, String>(3)?,
            "retryCount": row.get::<_, i64>(4)?,
            "error": row.get::<_, Option<String>>(5)?,
            "updatedAt": row.get::<_, Option<String>>(6)?,
        }))
    })
    .map(|rows| rows.filter_map(|r| r.ok()).collect())
    .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

fn push_items(items: &[QueueItem]) -> Vec<PushItem> {
    items
        .iter()
        .map(|item| PushItem {
            id: item.record_id.clone(),
            operation: item.operation.clone(),
            idempotency_key: item.idempotency_key.clone(),
            data: serde_json::from_str(&item.payload).unwrap_or(Value::Null),
        })
        .collect()
}

async fn push_pending(
    db: &DbState,
    endpoint: &CloudEndpoint,
    config: &SyncConfig,
    report: &mut SyncReport,
) -> Result<(), String> {
    let items = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        take_due_batch(&conn, config.batch_size)?
    };
    if items.is_empty() {
        return Ok(());
    }

    let mut by_collection: BTreeMap<&'static str, Vec<QueueItem>> = BTreeMap::new();
    for item in items {
        by_collection
            .entry(item.collection.as_str())
            .or_default()
            .push(item);
    }

    let mut auth_error: Option<String> = None;
    for batch in by_collection.into_values() {
        let collection = batch[0].collection;
        if let Some(err) = auth_error.as_deref() {
            let conn = db.conn.lock().map_err(|e| e.to_string())?;
            release(&conn, &batch, err);
            continue;
        }

        let result = api::push_batch(endpoint, collection, &push_items(&batch)).await;
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        match result {
            Ok(outcome) => {
                for item in &batch {
                    match outcome.rejected.iter().find(|r| r.id == item.record_id) {
                        Some(rejection) => {
                            let error = if rejection.error.is_empty() {
                                "Rejected by cloud"
                            } else {
                                rejection.error.as_str()
                            };
                            mark_failed(&conn, item, error)?;
                            report.rejected += 1;
                        }
                        None => {
                            mark_synced(&conn, item)?;
                            report.pushed += 1;
                        }
                    }
                }
                debug!(collection = %collection, count = batch.len(), "collection pushed");
            }
            Err(e) if api::is_auth_failure(&e) || api::is_network_failure(&e) => {
                release(&conn, &batch, &e);
                auth_error = Some(e);
            }
            Err(e) => {
                warn!(collection = %collection, error = %e, "push failed");
                for item in &batch {
                    mark_failed(&conn, item, &e)?;
                }
                report.retried += batch.len();
            }
        }
    }

    match auth_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Merge a pulled page and return (applied, newest updatedAt seen).
fn apply_pulled(
    conn: &Connection,
    collection: Collection,
    records: &[Value],
) -> Result<(usize, Option<DateTime<Utc>>), String> {
    db::in_transaction(conn, || {
        let mut applied = 0;
        let mut newest: Option<DateTime<Utc>> = None;
        for doc in records {
            if let Some(at) = remote_updated_at(doc) {
                newest = Some(newest.map_or(at, |n| n.max(at)));
            }
            if merge_remote_record(conn, collection, doc)? == MergeOutcome::Applied {
                applied += 1;
            }
        }
        Ok((applied, newest))
    })
}

async fn pull_remote(
    db: &DbState,
    endpoint: &CloudEndpoint,
    report: &mut SyncReport,
) -> Result<(), String> {
    for collection in Collection::ALL {
        let cursor = {
            let conn = db.conn.lock().map_err(|e| e.to_string())?;
            get_cursor(&conn, collection)
        };
        let page = match api::pull_since(endpoint, collection, cursor.as_deref()).await {
            Ok(page) => page,
            Err(e) if api::is_auth_failure(&e) || api::is_network_failure(&e) => return Err(e),
            Err(e) => {
                warn!(collection = %collection, error = %e, "pull failed");
                continue;
            }
        };
        if page.records.is_empty() {
            continue;
        }

        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let (applied, newest) = apply_pulled(&conn, collection, &page.records)?;
        if let Some(newest) = newest {
            let advance = cursor
                .as_deref()
                .and_then(store::parse_timestamp)
                .map_or(true, |current| newest > current);
            if advance {
                db::set_setting(
                    &conn,
                    SETTINGS_CATEGORY,
                    &cursor_key(collection),
                    &newest.to_rfc3339(),
                )?;
            }
        }
        report.pulled += applied;
        if applied > 0 {
            info!(collection = %collection, applied, "remote changes merged");
        }
    }
    Ok(())
}

/// One full cycle: recover, snapshot diff, push, pull.
pub async fn run_sync_cycle(
    db: &DbState,
    endpoint: &CloudEndpoint,
    config: &SyncConfig,
) -> Result<SyncReport, String> {
    let mut report = SyncReport::default();
    {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let recovered = recover_in_progress(&conn)?;
        if recovered > 0 {
            debug!(recovered, "recovered interrupted sync rows");
        }
        report.requeued = requeue_dirty(&conn)?;
    }
    push_pending(db, endpoint, config, &mut report).await?;
    pull_remote(db, endpoint, &mut report).await?;
    Ok(report)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

fn count_rows(conn: &Connection, status: &str) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE status = ?1",
        params![status],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

pub fn get_sync_status(db: &DbState, state: &SyncState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let config = SyncConfig::load(&conn);

    let mut per_collection = serde_json::Map::new();
    if let Ok(mut stmt) = conn.prepare(
        "SELECT collection, COUNT(*) FROM sync_queue
         WHERE status IN ('pending', 'in_progress') GROUP BY collection",
    ) {
        if let Ok(rows) = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        }) {
            for (collection, count) in rows.flatten() {
                per_collection.insert(collection, Value::from(count));
            }
        }
    }
    let dirty: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM records WHERE synced_hash IS NULL OR synced_hash != content_hash",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let last_sync = state.last_sync.lock().ok().and_then(|g| g.clone());
    let last_error = state.last_error.lock().ok().and_then(|g| g.clone());

    Ok(serde_json::json!({
        "configured": storage::is_configured(),
        "enabled": config.enabled,
        "intervalSecs": config.interval_secs,
        "isRunning": state.is_running.load(Ordering::SeqCst),
        "isOnline": state.is_online.load(Ordering::SeqCst),
        "lastSync": last_sync,
        "lastError": last_error,
        "pending": count_rows(&conn, "pending") + count_rows(&conn, "in_progress"),
        "failed": count_rows(&conn, "failed"),
        "synced": count_rows(&conn, "synced"),
        "unsyncedRecords": dirty,
        "pendingByCollection": Value::Object(per_collection),
    }))
}

fn emit_status(db: &DbState, state: &SyncState, events: &EventBus) {
    match get_sync_status(db, state) {
        Ok(status) => events.emit("sync_status", status),
        Err(e) => warn!(error = %e, "could not build sync status"),
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run one cycle now.
pub async fn force_sync(
    db: &DbState,
    state: &SyncState,
    events: &EventBus,
) -> Result<SyncReport, String> {
    let endpoint = storage::load_endpoint().ok_or("Cloud sync is not configured")?;
    let config = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        SyncConfig::load(&conn)
    };

    let _cycle = state.cycle_lock.lock().await;
    let result = run_sync_cycle(db, &endpoint, &config).await;
    match &result {
        Ok(report) => {
            state.is_online.store(true, Ordering::SeqCst);
            state.record_success();
            info!(
                pushed = report.pushed,
                pulled = report.pulled,
                "Force sync complete"
            );
        }
        Err(e) => {
            if api::is_network_failure(e) {
                state.is_online.store(false, Ordering::SeqCst);
            }
            state.record_error(e);
        }
    }
    emit_status(db, state, events);
    result
}

/// Spawn the background loop. It wakes every `interval_secs`, skips while
/// unconfigured, disabled or offline, and stops on cancellation or when the
/// cloud rejects the credentials.
pub fn start_sync_loop(
    db: Arc<DbState>,
    state: Arc<SyncState>,
    events: EventBus,
) -> JoinHandle<()> {
    let token = CancellationToken::new();
    if let Ok(mut guard) = state.cancel.lock() {
        if let Some(previous) = guard.replace(token.clone()) {
            previous.cancel();
        }
    }
    state.is_running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!("Sync loop started");
        let mut previous_online: Option<bool> = None;

        loop {
            let config = match db.conn.lock() {
                Ok(conn) => SyncConfig::load(&conn),
                Err(_) => SyncConfig::default(),
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(config.interval_secs)) => {}
            }

            let endpoint = match storage::load_endpoint() {
                Some(endpoint) if config.enabled => endpoint,
                _ => {
                    previous_online = None;
                    emit_status(&db, &state, &events);
                    continue;
                }
            };

            let probe = api::test_connectivity(&endpoint).await;
            if let Some(error) = probe.error.as_deref().filter(|e| api::is_auth_failure(e)) {
                warn!(error, "Cloud rejected credentials; stopping sync loop");
                state.record_error(error);
                events.emit("sync_auth_failed", serde_json::json!({ "error": error }));
                break;
            }
            state.is_online.store(probe.success, Ordering::SeqCst);
            if !probe.success {
                if previous_online != Some(false) {
                    info!("Cloud unreachable; keeping queue pending");
                }
                previous_online = Some(false);
                emit_status(&db, &state, &events);
                continue;
            }
            if previous_online == Some(false) {
                info!("Cloud reachable again; resuming sync");
            }
            previous_online = Some(true);

            let result = {
                let _cycle = state.cycle_lock.lock().await;
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = run_sync_cycle(&db, &endpoint, &config) => result,
                }
            };
            match result {
                Ok(report) => {
                    if report.pushed + report.pulled > 0 {
                        info!(pushed = report.pushed, pulled = report.pulled, "Sync cycle complete");
                    }
                    state.record_success();
                }
                Err(e) if api::is_auth_failure(&e) => {
                    warn!(error = %e, "Cloud rejected credentials; stopping sync loop");
                    state.record_error(&e);
                    events.emit("sync_auth_failed", serde_json::json!({ "error": e }));
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Sync cycle failed");
                    state.record_error(&e);
                }
            }
            emit_status(&db, &state, &events);
        }

        state.is_running.store(false, Ordering::SeqCst);
        emit_status(&db, &state, &events);
        info!("Sync loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookings::tests::seed_driver;
    use crate::models::Driver;
    use serde_json::json;

    fn queue_rows(conn: &Connection) -> Vec<(String, String, String)> {
        let mut stmt = conn
            .prepare("SELECT record_id, operation, status FROM sync_queue ORDER BY id")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    fn remote_driver(id: &str, name: &str, updated_at: &str) -> Value {
        json!({
            "id": id,
            "name": name,
            "phone": "+6281234567890",
            "licenseNumber": "SIM-1",
            "dailyFee": 150000.0,
            "active": true,
            "createdAt": "2026-01-01T00:00:00Z",
            "updatedAt": updated_at,
        })
    }

    #[test]
    fn test_remote_insert_is_applied_without_enqueue() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let doc = remote_driver("drv-remote", "Budi", "2026-05-01T10:00:00Z");

        assert_eq!(
            merge_remote_record(&conn, Collection::Drivers, &doc).unwrap(),
            MergeOutcome::Applied
        );
        let driver = store::get::<Driver>(&conn, "drv-remote").unwrap().unwrap();
        assert_eq!(driver.name, "Budi");
        assert!(queue_rows(&conn).is_empty());
        assert_eq!(requeue_dirty(&conn).unwrap(), 0);
    }

    #[test]
    fn test_newer_remote_wins_and_ties_keep_local() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let local = seed_driver(&conn, "Local Name", true);
        let local_at = local.updated_at;

        let tie = remote_driver(&local.id, "Tie", &local_at.to_rfc3339());
        assert_eq!(
            merge_remote_record(&conn, Collection::Drivers, &tie).unwrap(),
            MergeOutcome::KeptLocal
        );
        let older = remote_driver(
            &local.id,
            "Older",
            &(local_at - ChronoDuration::hours(1)).to_rfc3339(),
        );
        assert_eq!(
            merge_remote_record(&conn, Collection::Drivers, &older).unwrap(),
            MergeOutcome::KeptLocal
        );
        assert_eq!(
            store::get::<Driver>(&conn, &local.id).unwrap().unwrap().name,
            "Local Name"
        );

        let newer = remote_driver(
            &local.id,
            "Remote Name",
            &(local_at + ChronoDuration::hours(1)).to_rfc3339(),
        );
        assert_eq!(
            merge_remote_record(&conn, Collection::Drivers, &newer).unwrap(),
            MergeOutcome::Applied
        );
        assert_eq!(
            store::get::<Driver>(&conn, &local.id).unwrap().unwrap().name,
            "Remote Name"
        );
        // The superseded local upsert no longer needs pushing.
        assert!(queue_rows(&conn).is_empty());
    }

    #[test]
    fn test_remote_tombstone_deletes() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let local = seed_driver(&conn, "Gone Soon", true);
        let mut doc = remote_driver(
            &local.id,
            "Gone Soon",
            &(local.updated_at + ChronoDuration::minutes(5)).to_rfc3339(),
        );
        doc["deleted"] = json!(true);

        merge_remote_record(&conn, Collection::Drivers, &doc).unwrap();
        assert!(store::get::<Driver>(&conn, &local.id).unwrap().is_none());
        let stored = store::stored(&conn, Collection::Drivers, &local.id)
            .unwrap()
            .unwrap();
        assert!(stored.deleted);
    }

    #[test]
    fn test_invalid_remote_documents_are_skipped() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        assert_eq!(
            merge_remote_record(&conn, Collection::Drivers, &json!({"name": "x"})).unwrap(),
            MergeOutcome::Invalid
        );
        assert_eq!(
            merge_remote_record(&conn, Collection::Drivers, &json!({"id": "drv-x"})).unwrap(),
            MergeOutcome::Invalid
        );
    }

    #[test]
    fn test_requeue_dirty_recovers_cleared_outbox() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let driver = seed_driver(&conn, "Dewi", true);
        conn.execute("DELETE FROM sync_queue", []).unwrap();

        assert_eq!(requeue_dirty(&conn).unwrap(), 1);
        let rows = queue_rows(&conn);
        assert_eq!(rows, vec![(driver.id.clone(), "upsert".into(), "pending".into())]);
        // Already queued: nothing more to do.
        assert_eq!(requeue_dirty(&conn).unwrap(), 0);
    }

    #[test]
    fn test_synced_rows_record_hash_and_stay_clean() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        seed_driver(&conn, "Eko", true);

        let batch = take_due_batch(&conn, 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(queue_rows(&conn)[0].2, "in_progress");
        mark_synced(&conn, &batch[0]).unwrap();

        assert_eq!(queue_rows(&conn)[0].2, "synced");
        assert_eq!(requeue_dirty(&conn).unwrap(), 0);
        assert!(take_due_batch(&conn, 10).unwrap().is_empty());
    }

    #[test]
    fn test_failures_back_off_then_exhaust() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        SyncConfig {
            max_retries: 2,
            ..SyncConfig::default()
        }
        .save(&conn)
        .unwrap();
        seed_driver(&conn, "Fajar", true);
        let limit: i64 = conn
            .query_row("SELECT max_retries FROM sync_queue", [], |row| row.get(0))
            .unwrap();
        assert_eq!(limit, 2);

        let batch = take_due_batch(&conn, 10).unwrap();
        assert!(!mark_failed(&conn, &batch[0], "HTTP 500").unwrap());
        let (status, next_retry, delay): (String, Option<String>, i64) = conn
            .query_row(
                "SELECT status, next_retry_at, retry_delay_ms FROM sync_queue",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(status, "pending");
        assert!(next_retry.is_some());
        assert_eq!(delay, 10_000);
        // Not due yet.
        assert!(take_due_batch(&conn, 10).unwrap().is_empty());

        conn.execute("UPDATE sync_queue SET next_retry_at = NULL", []).unwrap();
        let batch = take_due_batch(&conn, 10).unwrap();
        assert!(mark_failed(&conn, &batch[0], "HTTP 500").unwrap());
        assert_eq!(queue_rows(&conn)[0].2, "failed");

        // A failed row blocks the snapshot diff until retried explicitly.
        assert_eq!(requeue_dirty(&conn).unwrap(), 0);
        assert_eq!(retry_failed(&conn).unwrap(), 1);
        assert_eq!(take_due_batch(&conn, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_interrupted_rows_are_recovered() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        seed_driver(&conn, "Gita", true);
        take_due_batch(&conn, 10).unwrap();
        assert_eq!(recover_in_progress(&conn).unwrap(), 1);
        assert_eq!(queue_rows(&conn)[0].2, "pending");
    }

    #[test]
    fn test_apply_pulled_reports_newest_timestamp() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let docs = vec![
            remote_driver("drv-a", "A", "2026-05-01T10:00:00Z"),
            remote_driver("drv-b", "B", "2026-05-03T10:00:00Z"),
            json!({"garbage": true}),
        ];
        let (applied, newest) = apply_pulled(&conn, Collection::Drivers, &docs).unwrap();
        assert_eq!(applied, 2);
        assert_eq!(newest, store::parse_timestamp("2026-05-03T10:00:00Z"));
    }

    #[test]
    fn test_jitter_is_deterministic_and_bounded() {
        assert_eq!(deterministic_jitter_ms(42), deterministic_jitter_ms(42));
        for seed in [-5, 0, 1, 699, 10_000] {
            let jitter = deterministic_jitter_ms(seed);
            assert!((50..750).contains(&jitter));
        }
        let now = Utc::now();
        let at = store::parse_timestamp(&schedule_next_retry(1_000_000, 1, now)).unwrap();
        assert!(at <= now + ChronoDuration::milliseconds(MAX_RETRY_DELAY_MS + 750));
    }

    #[test]
    fn test_config_round_trip_and_validation() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        assert_eq!(SyncConfig::load(&conn), SyncConfig::default());

        let config = SyncConfig {
            enabled: false,
            interval_secs: 120,
            batch_size: 20,
            max_retries: 8,
        };
        config.save(&conn).unwrap();
        assert_eq!(SyncConfig::load(&conn), config);

        let bad = SyncConfig {
            interval_secs: 1,
            ..SyncConfig::default()
        };
        assert!(bad.save(&conn).is_err());
    }

    #[test]
    fn test_status_counts_queue() {
        let state = db::test_state();
        {
            let conn = state.conn.lock().unwrap();
            seed_driver(&conn, "Hadi", true);
        }
        let sync = SyncState::new();
        let status = get_sync_status(&state, &sync).unwrap();
        assert_eq!(status["pending"], json!(1));
        assert_eq!(status["failed"], json!(0));
        assert_eq!(status["pendingByCollection"]["drivers"], json!(1));
        assert_eq!(status["isRunning"], json!(false));
    }

    #[test]
    fn test_prune_keeps_recent_synced_rows() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        seed_driver(&conn, "Indra", true);
        let batch = take_due_batch(&conn, 10).unwrap();
        mark_synced(&conn, &batch[0]).unwrap();
        assert_eq!(prune_synced(&conn, 7).unwrap(), 0);
        conn.execute(
            "UPDATE sync_queue SET synced_at = datetime('now', '-30 days')",
            [],
        )
        .unwrap();
        assert_eq!(prune_synced(&conn, 7).unwrap(), 1);
    }
}

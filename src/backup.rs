//! Full local snapshots as zstd-compressed JSON.
//!
//! A snapshot holds every stored document (tombstones included) and the
//! non-secret settings. Restoring merges documents by id with the same
//! last-write-wins rule as cloud pulls, so an old backup never overwrites
//! newer local edits.

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::db;
use crate::store::{self, Collection};
use crate::sync::{self, MergeOutcome};

const BACKUP_DIR: &str = "backups";
const BACKUP_FORMAT: &str = "fleetdesk-backup";
const BACKUP_VERSION: i64 = 1;
const ZSTD_LEVEL: i32 = 3;
/// Never exported: PIN hashes and lockout state.
const SECRET_CATEGORIES: &[&str] = &["staff"];
/// Counter categories restore as the max of both sides.
const COUNTER_CATEGORIES: &[&str] = &["bookings", "invoices"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub path: String,
    pub bytes: u64,
    pub records: usize,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub applied: usize,
    pub kept_local: usize,
    pub invalid: usize,
    pub settings: usize,
}

fn exportable_setting(category: &str, key: &str) -> bool {
    !SECRET_CATEGORIES.contains(&category) && !(category == "sync" && key.starts_with("cursor_"))
}

/// Build the snapshot document.
pub fn build_snapshot(conn: &Connection) -> Result<Value, String> {
    let mut collections = Map::new();
    for collection in Collection::ALL {
        collections.insert(
            collection.as_str().to_string(),
            Value::Array(store::all_documents(conn, collection)?),
        );
    }

    let mut settings = Map::new();
    if let Value::Object(all) = db::get_all_settings(conn) {
        for (category, values) in all {
            let Value::Object(values) = values else { continue };
            let kept: Map<String, Value> = values
                .into_iter()
                .filter(|(key, _)| exportable_setting(&category, key))
                .collect();
            if !kept.is_empty() {
                settings.insert(category, Value::Object(kept));
            }
        }
    }

    Ok(serde_json::json!({
        "format": BACKUP_FORMAT,
        "version": BACKUP_VERSION,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "createdAt": Utc::now().to_rfc3339(),
        "collections": collections,
        "settings": settings,
    }))
}

pub fn encode_snapshot(snapshot: &Value) -> Result<Vec<u8>, String> {
    let json = serde_json::to_vec(snapshot).map_err(|e| format!("encode snapshot: {e}"))?;
    zstd::encode_all(json.as_slice(), ZSTD_LEVEL).map_err(|e| format!("compress snapshot: {e}"))
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<Value, String> {
    let json = zstd::decode_all(bytes).map_err(|e| format!("decompress backup: {e}"))?;
    let snapshot: Value =
        serde_json::from_slice(&json).map_err(|e| format!("parse backup: {e}"))?;
    if snapshot.get("format").and_then(Value::as_str) != Some(BACKUP_FORMAT) {
        return Err("Not a FleetDesk backup".into());
    }
    let version = snapshot.get("version").and_then(Value::as_i64).unwrap_or(0);
    if version > BACKUP_VERSION {
        return Err(format!(
            "Backup version {version} is newer than supported ({BACKUP_VERSION})"
        ));
    }
    Ok(snapshot)
}

fn record_count(snapshot: &Value) -> usize {
    snapshot
        .get("collections")
        .and_then(Value::as_object)
        .map(|c| c.values().filter_map(Value::as_array).map(Vec::len).sum())
        .unwrap_or(0)
}

/// Write `{data_dir}/backups/fleetdesk-backup-{timestamp}.json.zst`.
pub fn create_backup(conn: &Connection, data_dir: &Path) -> Result<BackupInfo, String> {
    let snapshot = build_snapshot(conn)?;
    let bytes = encode_snapshot(&snapshot)?;

    let dir = data_dir.join(BACKUP_DIR);
    fs::create_dir_all(&dir).map_err(|e| format!("create backup dir: {e}"))?;
    let now = Utc::now();
    let path = dir.join(format!(
        "fleetdesk-backup-{}.json.zst",
        now.format("%Y%m%d-%H%M%S")
    ));
    // Write beside the target, then rename, so a crash never leaves a
    // truncated backup under the final name.
    let tmp = path.with_extension("zst.tmp");
    fs::write(&tmp, &bytes).map_err(|e| format!("write backup: {e}"))?;
    fs::rename(&tmp, &path).map_err(|e| format!("finalize backup: {e}"))?;

    db::log_generated_file(conn, "backup", None, &path)?;
    let records = record_count(&snapshot);
    info!(path = %path.display(), bytes = bytes.len(), records, "Backup written");

    Ok(BackupInfo {
        path: path.display().to_string(),
        bytes: bytes.len() as u64,
        records,
        created_at: now.to_rfc3339(),
    })
}

fn restore_settings(conn: &Connection, settings: &Map<String, Value>) -> Result<usize, String> {
    let mut restored = 0;
    for (category, values) in settings {
        let Some(values) = values.as_object() else { continue };
        for (key, value) in values {
            let Some(value) = value.as_str() else { continue };
            if !exportable_setting(category, key) {
                continue;
            }
            let value = if COUNTER_CATEGORIES.contains(&category.as_str()) {
                let incoming = value.parse::<i64>().unwrap_or(0);
                let current = db::get_setting(conn, category, key)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                incoming.max(current).to_string()
            } else {
                value.to_string()
            };
            db::set_setting(conn, category, key, &value)?;
            restored += 1;
        }
    }
    Ok(restored)
}

/// Merge a decoded snapshot into the local store.
///
/// Applied documents are marked unsynced so the next sync cycle pushes
/// them.
pub fn restore_snapshot(conn: &Connection, snapshot: &Value) -> Result<RestoreSummary, String> {
    let collections = snapshot
        .get("collections")
        .and_then(Value::as_object)
        .ok_or("Backup has no collections")?;

    db::in_transaction(conn, || {
        let mut summary = RestoreSummary::default();
        for (name, docs) in collections {
            let Some(collection) = Collection::parse(name) else {
                warn!(collection = %name, "skipping unknown collection in backup");
                continue;
            };
            for doc in docs.as_array().into_iter().flatten() {
                match sync::merge_remote_record(conn, collection, doc)? {
                    MergeOutcome::Applied => {
                        summary.applied += 1;
                        if let Some(id) = doc.get("id").and_then(Value::as_str) {
                            conn.execute(
                                "UPDATE records SET synced_hash = NULL WHERE collection = ?1 AND id = ?2",
                                rusqlite::params![collection.as_str(), id],
                            )
                            .map_err(|e| format!("mark restored record: {e}"))?;
                        }
                    }
                    MergeOutcome::KeptLocal => summary.kept_local += 1,
                    MergeOutcome::Invalid => summary.invalid += 1,
                }
            }
        }
        if let Some(settings) = snapshot.get("settings").and_then(Value::as_object) {
            summary.settings = restore_settings(conn, settings)?;
        }
        Ok(summary)
    })
}

pub fn restore_backup(conn: &Connection, path: &Path) -> Result<RestoreSummary, String> {
    let bytes = fs::read(path).map_err(|e| format!("read backup {}: {e}", path.display()))?;
    let snapshot = decode_snapshot(&bytes)?;
    let summary = restore_snapshot(conn, &snapshot)?;
    info!(
        path = %path.display(),
        applied = summary.applied,
        kept_local = summary.kept_local,
        "Backup restored"
    );
    Ok(summary)
}

/// Backups on disk, newest first.
pub fn list_backups(data_dir: &Path) -> Vec<Value> {
    let Ok(entries) = fs::read_dir(data_dir.join(BACKUP_DIR)) else {
        return Vec::new();
    };
    let mut files: Vec<(PathBuf, u64)> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("fleetdesk-backup-") && n.ends_with(".json.zst"))
        })
        .map(|p| {
            let size = fs::metadata(&p).map(|m| m.len()).unwrap_or(0);
            (p, size)
        })
        .collect();
    // Timestamped names sort chronologically.
    files.sort_by(|a, b| b.0.cmp(&a.0));
    files
        .into_iter()
        .map(|(path, bytes)| serde_json::json!({ "path": path.display().to_string(), "bytes": bytes }))
        .collect()
}

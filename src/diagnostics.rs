//! Diagnostics for support requests.
//!
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: record counts, sync backlog, database size
//! - **Diagnostics export**: about, health, recent sync errors and log
//!   files packed into a zip bundle
//! - **Log rotation helpers** used by `lib.rs`

use crate::db::{self, DbState};
use crate::{store, sync};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Log files kept by `prune_old_logs`.
pub const MAX_LOG_FILES: usize = 10;

/// Per-file cap when bundling logs (5 MB).
pub const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

/// Prefix of the daily rolling log files.
pub const LOG_FILE_PREFIX: &str = "fleetdesk";

const DIAGNOSTICS_DIR: &str = "diagnostics";

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsExportOptions {
    pub include_logs: bool,
    pub redact_sensitive: bool,
}

impl Default for DiagnosticsExportOptions {
    fn default() -> Self {
        Self {
            include_logs: true,
            redact_sensitive: true,
        }
    }
}

pub fn get_about_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

fn schema_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, Option<i64>>(0)
    })
    .ok()
    .flatten()
    .unwrap_or(0)
}

/// `{collection: {status: count}}` over the outbox.
fn get_sync_backlog(conn: &Connection) -> Value {
    let mut backlog = serde_json::Map::new();
    let Ok(mut stmt) = conn.prepare(
        "SELECT collection, status, COUNT(*) FROM sync_queue
         WHERE status != 'synced'
         GROUP BY collection, status",
    ) else {
        return Value::Object(backlog);
    };
    if let Ok(rows) = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
        ))
    }) {
        for (collection, status, count) in rows.flatten() {
            let entry = backlog.entry(collection).or_insert_with(|| json!({}));
            if let Value::Object(map) = entry {
                map.insert(status, Value::from(count));
            }
        }
    }
    Value::Object(backlog)
}

fn get_generated_files(conn: &Connection) -> Value {
    let mut by_kind = serde_json::Map::new();
    if let Ok(mut stmt) =
        conn.prepare("SELECT kind, COUNT(*), MAX(created_at) FROM generated_files GROUP BY kind")
    {
        if let Ok(rows) = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        }) {
            for (kind, count, last) in rows.flatten() {
                by_kind.insert(kind, json!({ "count": count, "lastCreatedAt": last }));
            }
        }
    }
    Value::Object(by_kind)
}

pub fn get_system_health(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);
    let wal_size = fs::metadata(db.db_path.with_extension("db-wal"))
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(json!({
        "schemaVersion": schema_version(&conn),
        "expectedSchemaVersion": db::CURRENT_SCHEMA_VERSION,
        "records": store::counts(&conn),
        "syncBacklog": get_sync_backlog(&conn),
        "generatedFiles": get_generated_files(&conn),
        "dbSizeBytes": db_size,
        "walSizeBytes": wal_size,
        "checkedAt": chrono::Utc::now().to_rfc3339(),
    }))
}

fn write_json(
    zip: &mut zip::ZipWriter<fs::File>,
    name: &str,
    value: &Value,
    options: zip::write::SimpleFileOptions,
) -> Result<(), String> {
    let body =
        serde_json::to_string_pretty(value).map_err(|e| format!("encode {name}: {e}"))?;
    zip.start_file(name, options)
        .map_err(|e| format!("zip {name}: {e}"))?;
    zip.write_all(body.as_bytes())
        .map_err(|e| format!("zip {name}: {e}"))
}

fn is_log_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(&format!("{LOG_FILE_PREFIX}.")))
}

/// Write `{data_dir}/diagnostics/fleetdesk-diagnostics-{timestamp}.zip`.
pub fn export_diagnostics(
    db: &DbState,
    data_dir: &Path,
    options: DiagnosticsExportOptions,
) -> Result<PathBuf, String> {
    let health = redact_value_for_export(get_system_health(db)?, options.redact_sensitive);
    let about = get_about_info();

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let errors = redact_value_for_export(
        Value::Array(sync::recent_errors(&conn, 20)),
        options.redact_sensitive,
    );
    let settings = redact_value_for_export(
        strip_staff_settings(db::get_all_settings(&conn)),
        options.redact_sensitive,
    );

    let out_dir = data_dir.join(DIAGNOSTICS_DIR);
    fs::create_dir_all(&out_dir).map_err(|e| format!("create diagnostics dir: {e}"))?;
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let zip_path = out_dir.join(format!("fleetdesk-diagnostics-{timestamp}.zip"));

    let file = fs::File::create(&zip_path)
        .map_err(|e| format!("Failed to create diagnostics zip: {e}"))?;
    let mut zip = zip::ZipWriter::new(file);
    let zip_options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    write_json(&mut zip, "about.json", &about, zip_options)?;
    write_json(&mut zip, "system_health.json", &health, zip_options)?;
    write_json(&mut zip, "sync_errors.json", &errors, zip_options)?;
    write_json(&mut zip, "settings.json", &settings, zip_options)?;

    let log_dir = get_log_dir(data_dir);
    if options.include_logs {
        if let Ok(entries) = fs::read_dir(&log_dir) {
            for path in entries.flatten().map(|e| e.path()) {
                if !path.is_file() || !is_log_file(&path) {
                    continue;
                }
                let Some(fname) = path.file_name().map(|n| n.to_string_lossy().to_string())
                else {
                    continue;
                };
                if zip
                    .start_file(format!("logs/{fname}"), zip_options)
                    .is_ok()
                {
                    if let Ok(f) = fs::File::open(&path) {
                        let mut buf = Vec::new();
                        let _ = f.take(MAX_LOG_SIZE).read_to_end(&mut buf);
                        let _ = zip.write_all(&buf);
                    }
                }
            }
        }
    }

    zip.finish().map_err(|e| format!("finish diagnostics zip: {e}"))?;
    db::log_generated_file(&conn, "diagnostics", None, &zip_path)?;
    info!(path = %zip_path.display(), "Diagnostics exported");
    Ok(zip_path)
}

fn strip_staff_settings(mut settings: Value) -> Value {
    if let Value::Object(map) = &mut settings {
        map.remove("staff");
    }
    settings
}

fn redact_value_for_export(value: Value, enabled: bool) -> Value {
    if !enabled {
        return value;
    }
    redact_sensitive_fields(value)
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if should_redact_key(&key) {
                        (key, Value::String("[REDACTED]".to_string()))
                    } else {
                        (key, redact_sensitive_fields(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive_fields).collect())
        }
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    [
        "api_key",
        "apikey",
        "secret",
        "password",
        "token",
        "authorization",
        "pin",
        "bank_details",
        "bankdetails",
    ]
    .iter()
    .any(|marker| normalized.contains(marker))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Keep only the newest `MAX_LOG_FILES` log files.
pub fn prune_old_logs(data_dir: &Path) {
    let log_dir = get_log_dir(data_dir);
    let Ok(entries) = fs::read_dir(&log_dir) else {
        return;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| entry.path().is_file() && is_log_file(&entry.path()))
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first; ties broken by name so dated files stay ordered.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_about_info_has_required_fields() {
        let info = get_about_info();
        for field in ["version", "buildTimestamp", "gitSha", "platform", "arch"] {
            assert!(info.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn test_system_health_with_fresh_db() {
        let dir = tempfile::tempdir().unwrap();
        let db_state = db::init(dir.path()).unwrap();
        {
            let conn = db_state.conn.lock().unwrap();
            crate::bookings::tests::seed_driver(&conn, "Joko", true);
        }
        let health = get_system_health(&db_state).unwrap();
        assert_eq!(health["schemaVersion"], json!(db::CURRENT_SCHEMA_VERSION));
        assert_eq!(health["records"]["drivers"], json!(1));
        assert_eq!(health["syncBacklog"]["drivers"]["pending"], json!(1));
        assert!(health["dbSizeBytes"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_export_diagnostics_creates_zip_with_logs() {
        let dir = tempfile::tempdir().unwrap();
        let db_state = db::init(dir.path()).unwrap();
        let log_dir = get_log_dir(dir.path());
        fs::create_dir_all(&log_dir).unwrap();
        fs::write(log_dir.join("fleetdesk.2026-05-01"), "hello log").unwrap();
        fs::write(log_dir.join("unrelated.txt"), "skip me").unwrap();

        let zip_path =
            export_diagnostics(&db_state, dir.path(), DiagnosticsExportOptions::default())
                .unwrap();
        assert!(zip_path.starts_with(dir.path().join(DIAGNOSTICS_DIR)));

        let file = fs::File::open(&zip_path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert!(names.contains(&"about.json".to_string()));
        assert!(names.contains(&"sync_errors.json".to_string()));
        assert!(names.contains(&"logs/fleetdesk.2026-05-01".to_string()));
        assert!(!names.iter().any(|n| n.contains("unrelated")));

        let mut body = String::new();
        archive
            .by_name("logs/fleetdesk.2026-05-01")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "hello log");
    }

    #[test]
    fn test_prune_old_logs_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = get_log_dir(dir.path());
        fs::create_dir_all(&log_dir).unwrap();
        for day in 1..=(MAX_LOG_FILES + 3) {
            fs::write(log_dir.join(format!("fleetdesk.2026-05-{day:02}")), "x").unwrap();
        }
        fs::write(log_dir.join("keep.txt"), "x").unwrap();

        prune_old_logs(dir.path());
        let remaining: Vec<_> = fs::read_dir(&log_dir)
            .unwrap()
            .flatten()
            .filter(|e| is_log_file(&e.path()))
            .collect();
        assert_eq!(remaining.len(), MAX_LOG_FILES);
        assert!(log_dir.join("keep.txt").exists());
    }

    #[test]
    fn test_redact_sensitive_fields_recurses_through_objects() {
        let value = json!({
            "token": "tk-val",
            "company": { "bank_details": "BCA 123", "name": "Jaya" },
            "items": [{ "apiKey": "k" }, { "status": "ok" }]
        });
        let redacted = redact_sensitive_fields(value);
        assert_eq!(redacted["token"], json!("[REDACTED]"));
        assert_eq!(redacted["company"]["bank_details"], json!("[REDACTED]"));
        assert_eq!(redacted["company"]["name"], json!("Jaya"));
        assert_eq!(redacted["items"][0]["apiKey"], json!("[REDACTED]"));
        assert_eq!(redacted["items"][1]["status"], json!("ok"));
    }
}

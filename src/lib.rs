//! FleetDesk - vehicle rental back office.
//!
//! Local-first core: master data, bookings, pricing, invoices and reports are
//! stored in SQLite and mirrored to a cloud document store by a background
//! sync loop. Front ends talk to the core through named commands
//! (`commands::dispatch`) that take and return JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod auth;
pub mod backup;
pub mod bookings;
pub mod commands;
pub mod company;
pub mod db;
pub mod diagnostics;
pub mod events;
pub mod export;
pub mod invoices;
pub mod media;
pub mod messaging;
pub mod models;
pub mod pricing;
pub mod reports;
pub mod schedule;
pub mod storage;
pub mod store;
pub mod sync;

const DATA_DIR_ENV: &str = "FLEETDESK_DATA_DIR";
const DEFAULT_DATA_DIR: &str = "fleetdesk-data";

/// First non-empty string under any of `keys`.
pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| v.get(*key).and_then(|x| x.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Numbers, or numeric strings from form input.
pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| {
        let node = v.get(*key)?;
        node.as_f64()
            .or_else(|| node.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
    })
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| {
        let node = v.get(*key)?;
        node.as_i64()
            .or_else(|| node.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
    })
}

/// `--data-dir`, else `$FLEETDESK_DATA_DIR`, else `./fleetdesk-data`.
pub fn resolve_data_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| {
        std::env::var(DATA_DIR_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
    })
    .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

/// Console plus daily rolling file logging under `{data_dir}/logs`.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
pub fn init_logging(data_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetdesk_lib=debug"));

    diagnostics::prune_old_logs(data_dir);
    let log_dir = diagnostics::get_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    guard
}

/// Everything a command handler needs.
pub struct AppContext {
    pub db: Arc<db::DbState>,
    pub data_dir: PathBuf,
    pub events: events::EventBus,
    pub auth: auth::AuthState,
    pub sync: Arc<sync::SyncState>,
}

impl AppContext {
    /// Open (and migrate) the database under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, String> {
        let db = db::init(data_dir)?;
        info!(
            data_dir = %data_dir.display(),
            "Starting FleetDesk v{}",
            env!("CARGO_PKG_VERSION")
        );
        Ok(Self::with_db(db, data_dir.to_path_buf()))
    }

    pub fn with_db(db: db::DbState, data_dir: PathBuf) -> Self {
        Self {
            db: Arc::new(db),
            data_dir,
            events: events::EventBus::new(),
            auth: auth::AuthState::new(),
            sync: Arc::new(sync::SyncState::new()),
        }
    }

    /// Start the background sync loop on its own connection so it never
    /// waits on command traffic.
    pub fn start_background_sync(&self) -> Result<JoinHandle<()>, String> {
        let sync_db = Arc::new(db::init(&self.data_dir)?);
        Ok(sync::start_sync_loop(
            sync_db,
            self.sync.clone(),
            self.events.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_helpers_accept_aliases_and_strings() {
        let v = json!({ "daily_rate": "350000", "name": "  ", "fullName": "Sari", "days": "3" });
        assert_eq!(value_str(&v, &["name", "fullName"]).as_deref(), Some("Sari"));
        assert_eq!(value_f64(&v, &["dailyRate", "daily_rate"]), Some(350000.0));
        assert_eq!(value_i64(&v, &["days"]), Some(3));
        assert_eq!(value_i64(&v, &["missing"]), None);
    }

    #[test]
    #[serial_test::serial]
    fn test_resolve_data_dir_prefers_flag_then_env() {
        std::env::set_var(DATA_DIR_ENV, "/tmp/from-env");
        assert_eq!(
            resolve_data_dir(Some(PathBuf::from("/tmp/fd"))),
            PathBuf::from("/tmp/fd")
        );
        assert_eq!(resolve_data_dir(None), PathBuf::from("/tmp/from-env"));
        std::env::set_var(DATA_DIR_ENV, "  ");
        assert_eq!(resolve_data_dir(None), PathBuf::from(DEFAULT_DATA_DIR));
        std::env::remove_var(DATA_DIR_ENV);
    }
}

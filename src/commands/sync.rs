use serde_json::Value;
use tracing::info;
use zeroize::Zeroizing;

use super::{payload_object, success, to_value};
use crate::api::{self, CloudEndpoint};
use crate::auth::{self, PERM_FORCE_SYNC, PERM_SYSTEM_SETTINGS};
use crate::{storage, sync, value_i64, value_str, AppContext};

const DEFAULT_PRUNE_DAYS: i64 = 7;

pub async fn sync_status(ctx: &AppContext) -> Result<Value, String> {
    sync::get_sync_status(&ctx.db, &ctx.sync)
}

pub async fn sync_force(ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_FORCE_SYNC)?;
    let report = sync::force_sync(&ctx.db, &ctx.sync, &ctx.events).await?;
    Ok(success(to_value(&report)?))
}

/// Put failed outbox rows back in the queue.
pub async fn sync_retry_failed(ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_FORCE_SYNC)?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let requeued = sync::retry_failed(&conn)?;
    info!(requeued, "Failed sync rows requeued");
    Ok(success(serde_json::json!({ "requeued": requeued })))
}

/// Drop synced outbox rows older than `days` (default 7).
pub async fn sync_prune(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_FORCE_SYNC)?;
    let payload = payload_object(arg0, "days");
    let days = value_i64(&payload, &["days", "olderThanDays"]).unwrap_or(DEFAULT_PRUNE_DAYS);
    if days < 0 {
        return Err("Days must be zero or greater".into());
    }
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let removed = sync::prune_synced(&conn, days)?;
    Ok(success(serde_json::json!({ "removed": removed })))
}

pub async fn cloud_get_config() -> Result<Value, String> {
    Ok(storage::get_full_config())
}

pub async fn cloud_save_credentials(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_SYSTEM_SETTINGS)?;
    let payload = arg0.ok_or("Missing cloud credentials payload")?;
    storage::update_cloud_credentials(&payload)
}

/// Probe the cloud with the given credentials, or the stored ones.
pub async fn cloud_test_connection(arg0: Option<Value>) -> Result<Value, String> {
    let payload = payload_object(arg0, "cloudUrl");
    let endpoint = match (
        value_str(&payload, &["cloudUrl", "cloud_url", "url"]),
        value_str(&payload, &["apiKey", "api_key"]),
        value_str(&payload, &["workspaceId", "workspace_id"]),
    ) {
        (Some(base_url), Some(api_key), Some(workspace_id)) => CloudEndpoint {
            base_url: api::normalize_base_url(&base_url),
            api_key: Zeroizing::new(api_key),
            workspace_id,
        },
        _ => storage::load_endpoint().ok_or("Cloud sync is not configured")?,
    };
    let result = api::test_connectivity(&endpoint).await;
    to_value(&result)
}

/// Stop syncing and forget the cloud credentials.
pub async fn cloud_factory_reset(ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_SYSTEM_SETTINGS)?;
    ctx.sync.stop();
    storage::factory_reset()
}

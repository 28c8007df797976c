use serde_json::Value;
use std::path::PathBuf;

use super::{payload_object, success, to_value};
use crate::auth::{self, PERM_MANAGE_BACKUPS};
use crate::{backup, value_str, AppContext};

pub async fn backup_create(ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_MANAGE_BACKUPS)?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let info = backup::create_backup(&conn, &ctx.data_dir)?;
    Ok(success(to_value(&info)?))
}

pub async fn backup_list(ctx: &AppContext) -> Result<Value, String> {
    Ok(Value::Array(backup::list_backups(&ctx.data_dir)))
}

/// Merge a backup into the local data. `path` may be omitted to use the
/// newest backup.
pub async fn backup_restore(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_MANAGE_BACKUPS)?;
    let payload = payload_object(arg0, "path");
    let path = match value_str(&payload, &["path", "file"]) {
        Some(path) => PathBuf::from(path),
        None => backup::list_backups(&ctx.data_dir)
            .first()
            .and_then(|b| b["path"].as_str())
            .map(PathBuf::from)
            .ok_or("No backups found")?,
    };
    let summary = {
        let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
        backup::restore_backup(&conn, &path)?
    };
    ctx.events.emit(
        "backup_restored",
        serde_json::json!({ "path": path.display().to_string(), "applied": summary.applied }),
    );
    Ok(success(to_value(&summary)?))
}

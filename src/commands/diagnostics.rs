use serde_json::Value;

use super::{payload_object, success};
use crate::diagnostics::{self, DiagnosticsExportOptions};
use crate::{db, value_i64, value_str, AppContext};

const DEFAULT_RECENT_FILES: i64 = 20;

pub async fn diagnostics_about() -> Result<Value, String> {
    Ok(diagnostics::get_about_info())
}

pub async fn diagnostics_health(ctx: &AppContext) -> Result<Value, String> {
    diagnostics::get_system_health(&ctx.db)
}

pub async fn diagnostics_export(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let payload = payload_object(arg0, "mode");
    let defaults = DiagnosticsExportOptions::default();
    let options = DiagnosticsExportOptions {
        include_logs: payload
            .get("includeLogs")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.include_logs),
        redact_sensitive: payload
            .get("redactSensitive")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.redact_sensitive),
    };
    let path = diagnostics::export_diagnostics(&ctx.db, &ctx.data_dir, options)?;
    Ok(success(serde_json::json!({ "path": path.display().to_string() })))
}

/// History of written invoices, exports, backups and diagnostics bundles.
pub async fn files_recent(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let payload = payload_object(arg0, "kind");
    let kind = value_str(&payload, &["kind"]);
    let limit = value_i64(&payload, &["limit"])
        .unwrap_or(DEFAULT_RECENT_FILES)
        .clamp(1, 500) as usize;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    Ok(Value::Array(db::recent_generated_files(&conn, kind.as_deref(), limit)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::test_ctx;
    use serde_json::json;

    #[tokio::test]
    async fn export_is_listed_in_recent_files() {
        let (ctx, _dir) = test_ctx();
        let exported = diagnostics_export(Some(json!({ "includeLogs": false })), &ctx)
            .await
            .unwrap();
        let path = exported["data"]["path"].as_str().unwrap().to_string();
        assert!(path.ends_with(".zip"));

        let files = files_recent(Some(json!("diagnostics")), &ctx).await.unwrap();
        assert_eq!(files[0]["path"], path);
        let none = files_recent(Some(json!({ "kind": "invoice" })), &ctx).await.unwrap();
        assert!(none.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_reports_schema_version() {
        let (ctx, _dir) = test_ctx();
        let health = diagnostics_health(&ctx).await.unwrap();
        assert_eq!(health["schemaVersion"], health["expectedSchemaVersion"]);
    }
}

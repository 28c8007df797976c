use chrono::Utc;
use rusqlite::Connection;
use serde_json::Value;

use super::{payload_object, period_window, success, to_value};
use crate::auth::{self, PERM_VIEW_REPORTS};
use crate::export::{self, ReportTable};
use crate::schedule::TimeWindow;
use crate::{reports, value_str, AppContext};

fn window_for(arg0: Option<Value>, ctx: &AppContext) -> Result<(Value, TimeWindow), String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_VIEW_REPORTS)?;
    let payload = payload_object(arg0, "kind");
    let window = period_window(&payload, Utc::now())?;
    Ok((payload, window))
}

pub async fn report_revenue(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let (_, window) = window_for(arg0, ctx)?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    to_value(&reports::revenue_summary(&conn, &window)?)
}

pub async fn report_utilization(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let (_, window) = window_for(arg0, ctx)?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    to_value(&reports::fleet_utilization(&conn, &window)?)
}

pub async fn report_investor_payouts(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let (_, window) = window_for(arg0, ctx)?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    to_value(&reports::investor_payouts(&conn, &window)?)
}

/// Open balances as of now. Takes no window.
pub async fn report_receivables(_arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_VIEW_REPORTS)?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    to_value(&reports::receivables(&conn, Utc::now())?)
}

fn tables_for(conn: &Connection, kind: &str, window: &TimeWindow) -> Result<Vec<ReportTable>, String> {
    match kind {
        "revenue" => Ok(reports::revenue_summary(conn, window)?.to_tables()),
        "utilization" => Ok(vec![reports::utilization_table(
            &reports::fleet_utilization(conn, window)?,
        )]),
        "payouts" | "investor_payouts" => Ok(vec![reports::payouts_table(
            &reports::investor_payouts(conn, window)?,
        )]),
        "receivables" => Ok(vec![reports::receivables_table(&reports::receivables(
            conn,
            Utc::now(),
        )?)]),
        "all" => {
            let mut tables = Vec::new();
            for kind in ["revenue", "utilization", "payouts", "receivables"] {
                tables.extend(tables_for(conn, kind, window)?);
            }
            Ok(tables)
        }
        other => Err(format!("Unknown report kind: {other}")),
    }
}

/// Export one report (or `all`) as an Excel workbook under
/// `{data_dir}/exports`.
pub async fn report_export(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let (payload, window) = window_for(arg0, ctx)?;
    let kind = value_str(&payload, &["kind", "report"]).unwrap_or_else(|| "all".into());
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let tables = tables_for(&conn, &kind, &window)?;
    let name = format!("{kind}-{}", window.start.format("%Y%m%d"));
    let path = export::write_xlsx(&conn, &ctx.data_dir, &name, &tables)?;
    Ok(success(serde_json::json!({
        "path": path.display().to_string(),
        "sheets": tables.len(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookings::tests::{new_booking, seed_customer, seed_vehicle};
    use crate::commands::tests::test_ctx;
    use serde_json::json;

    fn seed(ctx: &AppContext) {
        let conn = ctx.db.conn.lock().unwrap();
        let vehicle = seed_vehicle(&conn, "B1234XYZ", 300_000.0);
        let customer = seed_customer(&conn, "Budi");
        crate::bookings::create(&conn, new_booking(&customer, &vehicle, 3, 5)).unwrap();
    }

    #[tokio::test]
    async fn revenue_report_uses_the_requested_window() {
        let (ctx, _dir) = test_ctx();
        seed(&ctx);
        let may = report_revenue(Some(json!({ "from": "2026-05-01", "to": "2026-05-31" })), &ctx)
            .await
            .unwrap();
        assert_eq!(may["bookingCount"], 1);
        assert_eq!(may["net"], 600000.0);
        let june = report_revenue(Some(json!({ "from": "2026-06-01", "to": "2026-06-30" })), &ctx)
            .await
            .unwrap();
        assert_eq!(june["bookingCount"], 0);
    }

    #[tokio::test]
    async fn export_writes_a_workbook() {
        let (ctx, dir) = test_ctx();
        seed(&ctx);
        let exported = report_export(
            Some(json!({ "kind": "utilization", "from": "2026-05-01", "to": "2026-05-31" })),
            &ctx,
        )
        .await
        .unwrap();
        let path = exported["data"]["path"].as_str().unwrap();
        assert!(path.starts_with(dir.path().join("exports").to_str().unwrap()));
        assert!(path.ends_with(".xlsx"));
        assert_eq!(exported["data"]["sheets"], 1);
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let (ctx, _dir) = test_ctx();
        let err = report_export(Some(json!({ "kind": "weather" })), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, "Unknown report kind: weather");
    }
}

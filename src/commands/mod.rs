//! Named command handlers.
//!
//! Every handler takes the caller's JSON payload (`arg0`) and returns JSON.
//! A payload may be a bare string where a single id is expected. Mutating
//! handlers answer `{"success": true, "data": ...}`.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::schedule::TimeWindow;
use crate::{value_str, AppContext};

pub mod auth;
pub mod backup;
pub mod bookings;
pub mod diagnostics;
pub mod invoices;
pub mod master_data;
pub mod media;
pub mod messaging;
pub mod reports;
pub mod settings;
pub mod sync;

/// Every command `dispatch` understands.
pub const COMMANDS: &[&str] = &[
    // auth
    "auth_login",
    "auth_logout",
    "auth_session",
    "auth_setup_pin",
    // master data
    "vehicle_list",
    "vehicle_get",
    "vehicle_save",
    "vehicle_delete",
    "vehicle_available",
    "vehicle_calendar",
    "customer_list",
    "customer_get",
    "customer_save",
    "customer_delete",
    "customer_set_blacklist",
    "driver_list",
    "driver_get",
    "driver_save",
    "driver_delete",
    "partner_list",
    "partner_get",
    "partner_save",
    "partner_delete",
    "expense_list",
    "expense_get",
    "expense_save",
    "expense_delete",
    // bookings
    "booking_quote",
    "booking_check_conflicts",
    "booking_create",
    "booking_update",
    "booking_check_out",
    "booking_check_in",
    "booking_cancel",
    "booking_record_payment",
    "booking_get",
    "booking_list",
    // invoices
    "invoice_generate",
    "invoice_get",
    "invoice_list",
    "invoice_void",
    "invoice_render",
    // reports
    "report_revenue",
    "report_utilization",
    "report_investor_payouts",
    "report_receivables",
    "report_export",
    // messaging and media
    "message_compose",
    "message_open",
    "media_compress_image",
    // settings
    "settings_get_all",
    "company_get",
    "company_save",
    "pricing_get_config",
    "pricing_save_config",
    "messaging_get_config",
    "messaging_save_config",
    "sync_get_config",
    "sync_save_config",
    // sync and cloud
    "sync_status",
    "sync_force",
    "sync_retry_failed",
    "sync_prune",
    "cloud_get_config",
    "cloud_save_credentials",
    "cloud_test_connection",
    "cloud_factory_reset",
    // backup and diagnostics
    "backup_create",
    "backup_list",
    "backup_restore",
    "diagnostics_about",
    "diagnostics_health",
    "diagnostics_export",
    "files_recent",
];

/// Route a command by name.
pub async fn dispatch(ctx: &AppContext, name: &str, arg0: Option<Value>) -> Result<Value, String> {
    match name {
        "auth_login" => auth::auth_login(arg0, ctx).await,
        "auth_logout" => auth::auth_logout(ctx).await,
        "auth_session" => auth::auth_session(ctx).await,
        "auth_setup_pin" => auth::auth_setup_pin(arg0, ctx).await,

        "vehicle_list" => master_data::vehicle_list(arg0, ctx).await,
        "vehicle_get" => master_data::vehicle_get(arg0, ctx).await,
        "vehicle_save" => master_data::vehicle_save(arg0, ctx).await,
        "vehicle_delete" => master_data::vehicle_delete(arg0, ctx).await,
        "vehicle_available" => master_data::vehicle_available(arg0, ctx).await,
        "vehicle_calendar" => master_data::vehicle_calendar(arg0, ctx).await,
        "customer_list" => master_data::customer_list(arg0, ctx).await,
        "customer_get" => master_data::customer_get(arg0, ctx).await,
        "customer_save" => master_data::customer_save(arg0, ctx).await,
        "customer_delete" => master_data::customer_delete(arg0, ctx).await,
        "customer_set_blacklist" => master_data::customer_set_blacklist(arg0, ctx).await,
        "driver_list" => master_data::driver_list(arg0, ctx).await,
        "driver_get" => master_data::driver_get(arg0, ctx).await,
        "driver_save" => master_data::driver_save(arg0, ctx).await,
        "driver_delete" => master_data::driver_delete(arg0, ctx).await,
        "partner_list" => master_data::partner_list(arg0, ctx).await,
        "partner_get" => master_data::partner_get(arg0, ctx).await,
        "partner_save" => master_data::partner_save(arg0, ctx).await,
        "partner_delete" => master_data::partner_delete(arg0, ctx).await,
        "expense_list" => master_data::expense_list(arg0, ctx).await,
        "expense_get" => master_data::expense_get(arg0, ctx).await,
        "expense_save" => master_data::expense_save(arg0, ctx).await,
        "expense_delete" => master_data::expense_delete(arg0, ctx).await,

        "booking_quote" => bookings::booking_quote(arg0, ctx).await,
        "booking_check_conflicts" => bookings::booking_check_conflicts(arg0, ctx).await,
        "booking_create" => bookings::booking_create(arg0, ctx).await,
        "booking_update" => bookings::booking_update(arg0, ctx).await,
        "booking_check_out" => bookings::booking_check_out(arg0, ctx).await,
        "booking_check_in" => bookings::booking_check_in(arg0, ctx).await,
        "booking_cancel" => bookings::booking_cancel(arg0, ctx).await,
        "booking_record_payment" => bookings::booking_record_payment(arg0, ctx).await,
        "booking_get" => bookings::booking_get(arg0, ctx).await,
        "booking_list" => bookings::booking_list(arg0, ctx).await,

        "invoice_generate" => invoices::invoice_generate(arg0, ctx).await,
        "invoice_get" => invoices::invoice_get(arg0, ctx).await,
        "invoice_list" => invoices::invoice_list(arg0, ctx).await,
        "invoice_void" => invoices::invoice_void(arg0, ctx).await,
        "invoice_render" => invoices::invoice_render(arg0, ctx).await,

        "report_revenue" => reports::report_revenue(arg0, ctx).await,
        "report_utilization" => reports::report_utilization(arg0, ctx).await,
        "report_investor_payouts" => reports::report_investor_payouts(arg0, ctx).await,
        "report_receivables" => reports::report_receivables(arg0, ctx).await,
        "report_export" => reports::report_export(arg0, ctx).await,

        "message_compose" => messaging::message_compose(arg0, ctx).await,
        "message_open" => messaging::message_open(arg0, ctx).await,
        "media_compress_image" => media::media_compress_image(arg0).await,

        "settings_get_all" => settings::settings_get_all(ctx).await,
        "company_get" => settings::company_get(ctx).await,
        "company_save" => settings::company_save(arg0, ctx).await,
        "pricing_get_config" => settings::pricing_get_config(ctx).await,
        "pricing_save_config" => settings::pricing_save_config(arg0, ctx).await,
        "messaging_get_config" => settings::messaging_get_config(ctx).await,
        "messaging_save_config" => settings::messaging_save_config(arg0, ctx).await,
        "sync_get_config" => settings::sync_get_config(ctx).await,
        "sync_save_config" => settings::sync_save_config(arg0, ctx).await,

        "sync_status" => sync::sync_status(ctx).await,
        "sync_force" => sync::sync_force(ctx).await,
        "sync_retry_failed" => sync::sync_retry_failed(ctx).await,
        "sync_prune" => sync::sync_prune(arg0, ctx).await,
        "cloud_get_config" => sync::cloud_get_config().await,
        "cloud_save_credentials" => sync::cloud_save_credentials(arg0, ctx).await,
        "cloud_test_connection" => sync::cloud_test_connection(arg0).await,
        "cloud_factory_reset" => sync::cloud_factory_reset(ctx).await,

        "backup_create" => backup::backup_create(ctx).await,
        "backup_list" => backup::backup_list(ctx).await,
        "backup_restore" => backup::backup_restore(arg0, ctx).await,
        "diagnostics_about" => diagnostics::diagnostics_about().await,
        "diagnostics_health" => diagnostics::diagnostics_health(ctx).await,
        "diagnostics_export" => diagnostics::diagnostics_export(arg0, ctx).await,
        "files_recent" => diagnostics::files_recent(arg0, ctx).await,

        other => Err(format!("Unknown command: {other}")),
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Normalise `arg0` into an object. A bare string becomes `{key: string}`.
pub(crate) fn payload_object(arg0: Option<Value>, key: &str) -> Value {
    match arg0 {
        Some(Value::String(s)) => serde_json::json!({ key: s }),
        Some(Value::Object(obj)) => Value::Object(obj),
        Some(Value::Null) | None => serde_json::json!({}),
        Some(other) => other,
    }
}

/// Deserialize a payload into a typed DTO.
pub(crate) fn parse_payload<T: DeserializeOwned>(payload: Value, what: &str) -> Result<T, String> {
    serde_json::from_value(payload).map_err(|e| format!("Invalid {what} payload: {e}"))
}

/// Required id under any of `keys`.
pub(crate) fn require_id(payload: &Value, keys: &[&str], what: &str) -> Result<String, String> {
    value_str(payload, keys).ok_or_else(|| format!("Missing {what}"))
}

pub(crate) fn success(data: Value) -> Value {
    serde_json::json!({ "success": true, "data": data })
}

pub(crate) fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("encode response: {e}"))
}

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates (UTC midnight).
/// An end date given as a plain date is inclusive.
fn parse_bound(raw: &str, inclusive_end: bool) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| format!("Invalid date: {raw}"))?;
    let date = if inclusive_end {
        date.succ_opt().ok_or_else(|| format!("Date out of range: {raw}"))?
    } else {
        date
    };
    date.and_hms_opt(0, 0, 0)
        .map(|dt| Utc.from_utc_datetime(&dt))
        .ok_or_else(|| format!("Invalid date: {raw}"))
}

/// Reporting window from `from`/`to`; defaults to the current calendar
/// month.
pub(crate) fn period_window(payload: &Value, now: DateTime<Utc>) -> Result<TimeWindow, String> {
    let from = value_str(payload, &["from", "start", "startAt"]);
    let to = value_str(payload, &["to", "end", "endAt"]);
    match (from, to) {
        (Some(from), Some(to)) => TimeWindow::new(parse_bound(&from, false)?, parse_bound(&to, true)?),
        (None, None) => {
            let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
                .ok_or("Invalid current month")?;
            let next = if now.month() == 12 {
                NaiveDate::from_ymd_opt(now.year() + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(now.year(), now.month() + 1, 1)
            }
            .ok_or("Invalid next month")?;
            let start = first.and_hms_opt(0, 0, 0).ok_or("Invalid month start")?;
            let end = next.and_hms_opt(0, 0, 0).ok_or("Invalid month end")?;
            TimeWindow::new(Utc.from_utc_datetime(&start), Utc.from_utc_datetime(&end))
        }
        _ => Err("Both from and to are required".into()),
    }
}

/// Like [`period_window`] but without the current-month default.
pub(crate) fn required_window(payload: &Value) -> Result<TimeWindow, String> {
    if value_str(payload, &["from", "start", "startAt"]).is_none()
        || value_str(payload, &["to", "end", "endAt"]).is_none()
    {
        return Err("Both from and to are required".into());
    }
    period_window(payload, chrono::Utc::now())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// In-memory context for handler tests.
    pub(crate) fn test_ctx() -> (AppContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = AppContext::with_db(crate::db::test_state(), dir.path().to_path_buf());
        (ctx, dir)
    }

    #[test]
    fn bare_strings_become_objects() {
        assert_eq!(
            payload_object(Some(json!("bk-1")), "bookingId"),
            json!({"bookingId": "bk-1"})
        );
        assert_eq!(payload_object(None, "id"), json!({}));
    }

    #[test]
    fn plain_dates_make_inclusive_windows() {
        let window = period_window(&json!({"from": "2026-05-01", "to": "2026-05-31"}), Utc::now())
            .unwrap();
        assert_eq!(window.start.to_rfc3339(), "2026-05-01T00:00:00+00:00");
        assert_eq!(window.end.to_rfc3339(), "2026-06-01T00:00:00+00:00");
        assert!(period_window(&json!({"from": "2026-05-01"}), Utc::now()).is_err());
        assert!(period_window(&json!({"from": "x", "to": "y"}), Utc::now()).is_err());
    }

    #[test]
    fn default_window_is_current_month() {
        let now = Utc.with_ymd_and_hms(2026, 12, 15, 8, 0, 0).unwrap();
        let window = period_window(&json!({}), now).unwrap();
        assert_eq!(window.start.to_rfc3339(), "2026-12-01T00:00:00+00:00");
        assert_eq!(window.end.to_rfc3339(), "2027-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn unknown_commands_are_rejected() {
        let (ctx, _dir) = test_ctx();
        let err = dispatch(&ctx, "nope", None).await.unwrap_err();
        assert_eq!(err, "Unknown command: nope");
    }

    #[tokio::test]
    async fn every_listed_command_is_routed() {
        let (ctx, _dir) = test_ctx();
        for name in COMMANDS {
            // Handlers may fail on empty payloads but must not be unknown.
            // These reach the network, the browser or the OS keyring.
            if matches!(
                *name,
                "sync_force" | "cloud_test_connection" | "message_open" | "cloud_factory_reset"
            ) {
                continue;
            }
            if let Err(e) = dispatch(&ctx, name, None).await {
                assert!(!e.starts_with("Unknown command"), "{name} is not routed");
            }
        }
    }
}

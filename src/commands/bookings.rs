use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use super::{parse_payload, payload_object, require_id, success, to_value};
use crate::auth::{self, PERM_MANAGE_BOOKINGS};
use crate::bookings::{
    self, BookingChanges, BookingError, BookingFilter, Handover, NewBooking, NewPayment,
};
use crate::models::{Booking, InvoiceStatus};
use crate::pricing::PricingOptions;
use crate::schedule::{self, Candidate, TimeWindow};
use crate::{invoices, store, AppContext};

const BOOKING_ID_KEYS: &[&str] = &["bookingId", "booking_id", "id"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotePayload {
    #[serde(alias = "vehicle_id")]
    vehicle_id: String,
    #[serde(default, alias = "driver_id")]
    driver_id: Option<String>,
    #[serde(alias = "start_at", alias = "start")]
    start_at: DateTime<Utc>,
    #[serde(alias = "end_at", alias = "end")]
    end_at: DateTime<Utc>,
    #[serde(default)]
    pricing: PricingOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictCheckPayload {
    #[serde(alias = "vehicle_id")]
    vehicle_id: String,
    #[serde(default, alias = "driver_id")]
    driver_id: Option<String>,
    #[serde(alias = "start_at", alias = "start")]
    start_at: DateTime<Utc>,
    #[serde(alias = "end_at", alias = "end")]
    end_at: DateTime<Utc>,
    /// The booking being edited, excluded from the check.
    #[serde(default, alias = "booking_id")]
    booking_id: Option<String>,
}

/// Map a lifecycle error to the command result. Schedule conflicts are an
/// expected outcome and come back as data so the caller can show them.
fn booking_result(result: Result<Booking, BookingError>) -> Result<Booking, Value> {
    result.map_err(|e| match e {
        BookingError::Conflict(conflicts) => serde_json::json!({
            "success": false,
            "conflict": true,
            "error": BookingError::Conflict(conflicts.clone()).to_string(),
            "conflicts": conflicts,
        }),
        other => Value::String(other.to_string()),
    })
}

/// Split `booking_result` into the handler's `Result<Value, String>`.
fn respond(
    ctx: &AppContext,
    event: &str,
    result: Result<Booking, BookingError>,
) -> Result<Value, String> {
    match booking_result(result) {
        Ok(booking) => {
            ctx.events.emit(
                event,
                serde_json::json!({
                    "bookingId": booking.id,
                    "bookingNumber": booking.booking_number,
                    "status": booking.status,
                }),
            );
            Ok(success(bookings::to_json(&booking)))
        }
        Err(Value::String(message)) => Err(message),
        Err(conflict) => Ok(conflict),
    }
}

/// Keep the booking's live invoice in step with its totals and payments.
fn sync_invoice(conn: &Connection, booking: &Booking) {
    let refreshed = invoices::find_for_booking(conn, &booking.id)
        .and_then(|found| match found {
            Some(_) => invoices::generate_for_booking(conn, &booking.id).map(Some),
            None => Ok(None),
        });
    if let Err(e) = refreshed {
        warn!(booking_id = %booking.id, error = %e, "Invoice refresh failed");
    }
}

pub async fn booking_quote(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let payload: QuotePayload = parse_payload(payload_object(arg0, "vehicleId"), "quote")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let breakdown = bookings::quote(
        &conn,
        &payload.vehicle_id,
        payload.driver_id.as_deref(),
        payload.start_at,
        payload.end_at,
        &payload.pricing,
    )
    .map_err(|e| e.to_string())?;
    Ok(serde_json::json!({
        "price": to_value(&breakdown)?,
        "lines": to_value(&breakdown.line_items())?,
    }))
}

pub async fn booking_check_conflicts(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let payload: ConflictCheckPayload =
        parse_payload(payload_object(arg0, "vehicleId"), "conflict check")?;
    let window = TimeWindow::new(payload.start_at, payload.end_at)?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let all = store::list::<Booking>(&conn)?;
    let conflicts = schedule::find_conflicts(
        &all,
        &Candidate {
            booking_id: payload.booking_id.as_deref(),
            vehicle_id: &payload.vehicle_id,
            driver_id: payload.driver_id.as_deref(),
            window,
        },
    );
    Ok(serde_json::json!({
        "available": conflicts.is_empty(),
        "conflicts": conflicts,
    }))
}

pub async fn booking_create(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_MANAGE_BOOKINGS)?;
    let input: NewBooking = parse_payload(arg0.ok_or("Missing booking payload")?, "booking")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    respond(ctx, "booking_created", bookings::create(&conn, input))
}

pub async fn booking_update(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_MANAGE_BOOKINGS)?;
    let payload = payload_object(arg0, "bookingId");
    let id = require_id(&payload, BOOKING_ID_KEYS, "booking id")?;
    let changes: BookingChanges = parse_payload(payload, "booking update")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let result = bookings::update(&conn, &id, changes);
    if let Ok(booking) = result.as_ref() {
        sync_invoice(&conn, booking);
    }
    respond(ctx, "booking_updated", result)
}

pub async fn booking_check_out(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_MANAGE_BOOKINGS)?;
    let payload = payload_object(arg0, "bookingId");
    let id = require_id(&payload, BOOKING_ID_KEYS, "booking id")?;
    let handover: Handover = parse_payload(payload, "check-out")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    respond(ctx, "booking_updated", bookings::check_out(&conn, &id, handover))
}

pub async fn booking_check_in(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_MANAGE_BOOKINGS)?;
    let payload = payload_object(arg0, "bookingId");
    let id = require_id(&payload, BOOKING_ID_KEYS, "booking id")?;
    let handover: Handover = parse_payload(payload, "check-in")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let result = bookings::check_in(&conn, &id, handover);
    if let Ok(booking) = result.as_ref() {
        sync_invoice(&conn, booking);
    }
    respond(ctx, "booking_updated", result)
}

/// Cancelling also voids an invoice nothing has been paid against.
pub async fn booking_cancel(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_MANAGE_BOOKINGS)?;
    let payload = payload_object(arg0, "bookingId");
    let id = require_id(&payload, BOOKING_ID_KEYS, "booking id")?;
    let reason = crate::value_str(&payload, &["reason", "cancellationReason"]);
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let result = bookings::cancel(&conn, &id, reason);
    if result.is_ok() {
        if let Some(invoice) = invoices::find_for_booking(&conn, &id)? {
            if invoice.amount_paid <= 0.0 && invoice.status != InvoiceStatus::Void {
                invoices::void(&conn, &invoice.id)?;
                info!(invoice_number = %invoice.invoice_number, "Invoice voided with booking");
            }
        }
    }
    respond(ctx, "booking_updated", result)
}

pub async fn booking_record_payment(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_MANAGE_BOOKINGS)?;
    let payload = payload_object(arg0, "bookingId");
    let id = require_id(&payload, BOOKING_ID_KEYS, "booking id")?;
    let payment: NewPayment = parse_payload(payload, "payment")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let result = bookings::record_payment(&conn, &id, payment);
    if let Ok(booking) = result.as_ref() {
        sync_invoice(&conn, booking);
    }
    respond(ctx, "booking_updated", result)
}

pub async fn booking_get(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let payload = payload_object(arg0, "bookingId");
    let id = require_id(&payload, BOOKING_ID_KEYS, "booking id")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let booking = store::require::<Booking>(&conn, &id, "Booking")?;
    let invoice = invoices::find_for_booking(&conn, &id)?;
    let mut value = bookings::to_json(&booking);
    if let Some(obj) = value.as_object_mut() {
        obj.insert("invoice".into(), to_value(&invoice)?);
    }
    Ok(value)
}

pub async fn booking_list(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let filter: BookingFilter = parse_payload(payload_object(arg0, "status"), "booking filter")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let rows: Vec<Value> = bookings::list(&conn, &filter)?
        .iter()
        .map(bookings::to_json)
        .collect();
    Ok(Value::Array(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookings::tests::{seed_customer, seed_vehicle};
    use crate::commands::tests::test_ctx;
    use serde_json::json;

    fn seed(ctx: &AppContext) -> (String, String) {
        let conn = ctx.db.conn.lock().unwrap();
        let vehicle = seed_vehicle(&conn, "B1234XYZ", 300_000.0);
        let customer = seed_customer(&conn, "Budi");
        (vehicle.id, customer.id)
    }

    fn create_payload(vehicle_id: &str, customer_id: &str, start: &str, end: &str) -> Value {
        json!({
            "vehicleId": vehicle_id,
            "customerId": customer_id,
            "startAt": start,
            "endAt": end,
        })
    }

    #[tokio::test]
    async fn create_emits_booking_created() {
        let (ctx, _dir) = test_ctx();
        let (vehicle_id, customer_id) = seed(&ctx);
        let mut rx = ctx.events.subscribe();
        let created = booking_create(
            Some(create_payload(&vehicle_id, &customer_id, "2026-05-03T09:00:00Z", "2026-05-05T09:00:00Z")),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(created["success"], true);
        assert_eq!(created["data"]["price"]["days"], 2);
        assert_eq!(created["data"]["balanceDue"], 600000.0);
        assert_eq!(rx.try_recv().unwrap().name, "booking_created");
    }

    #[tokio::test]
    async fn overlapping_create_returns_conflicts_as_data() {
        let (ctx, _dir) = test_ctx();
        let (vehicle_id, customer_id) = seed(&ctx);
        booking_create(
            Some(create_payload(&vehicle_id, &customer_id, "2026-05-03T09:00:00Z", "2026-05-05T09:00:00Z")),
            &ctx,
        )
        .await
        .unwrap();
        let clash = booking_create(
            Some(create_payload(&vehicle_id, &customer_id, "2026-05-04T09:00:00Z", "2026-05-06T09:00:00Z")),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(clash["success"], false);
        assert_eq!(clash["conflict"], true);
        assert_eq!(clash["conflicts"].as_array().unwrap().len(), 1);
        assert_eq!(clash["conflicts"][0]["kind"], "vehicle");

        // Back-to-back is fine.
        let next = booking_create(
            Some(create_payload(&vehicle_id, &customer_id, "2026-05-05T09:00:00Z", "2026-05-06T09:00:00Z")),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(next["success"], true);
    }

    #[tokio::test]
    async fn conflict_check_ignores_the_booking_being_edited() {
        let (ctx, _dir) = test_ctx();
        let (vehicle_id, customer_id) = seed(&ctx);
        let created = booking_create(
            Some(create_payload(&vehicle_id, &customer_id, "2026-05-03T09:00:00Z", "2026-05-05T09:00:00Z")),
            &ctx,
        )
        .await
        .unwrap();
        let booking_id = created["data"]["id"].as_str().unwrap().to_string();
        let mut probe = create_payload(&vehicle_id, &customer_id, "2026-05-04T09:00:00Z", "2026-05-07T09:00:00Z");
        let busy = booking_check_conflicts(Some(probe.clone()), &ctx).await.unwrap();
        assert_eq!(busy["available"], false);
        probe["bookingId"] = json!(booking_id);
        let own = booking_check_conflicts(Some(probe), &ctx).await.unwrap();
        assert_eq!(own["available"], true);
    }

    #[tokio::test]
    async fn payments_refresh_the_invoice() {
        let (ctx, _dir) = test_ctx();
        let (vehicle_id, customer_id) = seed(&ctx);
        let created = booking_create(
            Some(create_payload(&vehicle_id, &customer_id, "2026-05-03T09:00:00Z", "2026-05-04T09:00:00Z")),
            &ctx,
        )
        .await
        .unwrap();
        let booking_id = created["data"]["id"].as_str().unwrap().to_string();
        {
            let conn = ctx.db.conn.lock().unwrap();
            invoices::generate_for_booking(&conn, &booking_id).unwrap();
        }
        booking_record_payment(
            Some(json!({ "bookingId": booking_id, "amount": 100000.0, "method": "cash" })),
            &ctx,
        )
        .await
        .unwrap();
        let fetched = booking_get(Some(json!(booking_id)), &ctx).await.unwrap();
        assert_eq!(fetched["invoice"]["amountPaid"], 100000.0);
        assert_eq!(fetched["invoice"]["status"], "partial");
    }

    #[tokio::test]
    async fn cancelling_voids_an_unpaid_invoice() {
        let (ctx, _dir) = test_ctx();
        let (vehicle_id, customer_id) = seed(&ctx);
        let created = booking_create(
            Some(create_payload(&vehicle_id, &customer_id, "2026-05-03T09:00:00Z", "2026-05-04T09:00:00Z")),
            &ctx,
        )
        .await
        .unwrap();
        let booking_id = created["data"]["id"].as_str().unwrap().to_string();
        let invoice_id = {
            let conn = ctx.db.conn.lock().unwrap();
            invoices::generate_for_booking(&conn, &booking_id).unwrap().id
        };
        let cancelled = booking_cancel(
            Some(json!({ "bookingId": booking_id, "reason": "Customer changed plans" })),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(cancelled["data"]["status"], "cancelled");
        let conn = ctx.db.conn.lock().unwrap();
        let invoice = store::require::<crate::models::Invoice>(&conn, &invoice_id, "Invoice").unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Void);
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let (ctx, _dir) = test_ctx();
        let (vehicle_id, customer_id) = seed(&ctx);
        let mut pending =
            create_payload(&vehicle_id, &customer_id, "2026-05-03T09:00:00Z", "2026-05-04T09:00:00Z");
        pending["pending"] = json!(true);
        booking_create(Some(pending), &ctx).await.unwrap();
        booking_create(
            Some(create_payload(&vehicle_id, &customer_id, "2026-05-10T09:00:00Z", "2026-05-11T09:00:00Z")),
            &ctx,
        )
        .await
        .unwrap();
        let confirmed = booking_list(Some(json!({ "status": "confirmed" })), &ctx)
            .await
            .unwrap();
        assert_eq!(confirmed.as_array().unwrap().len(), 1);
        let all = booking_list(None, &ctx).await.unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_booking_is_an_error() {
        let (ctx, _dir) = test_ctx();
        let err = booking_check_out(Some(json!("bk-missing")), &ctx).await.unwrap_err();
        assert_eq!(err, "Booking not found: bk-missing");
    }
}

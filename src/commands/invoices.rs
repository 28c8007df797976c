use serde_json::Value;
use tracing::info;

use super::{payload_object, require_id, success, to_value};
use crate::auth::{self, PERM_MANAGE_INVOICES};
use crate::models::{Invoice, InvoiceStatus};
use crate::{invoices, store, value_str, AppContext};

pub async fn invoice_generate(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_MANAGE_INVOICES)?;
    let payload = payload_object(arg0, "bookingId");
    let booking_id = require_id(&payload, &["bookingId", "booking_id"], "booking id")?;
    let write_file = payload
        .get("writeHtml")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let invoice = invoices::generate_for_booking(&conn, &booking_id)?;
    let path = if write_file {
        Some(invoices::write_html(&conn, &ctx.data_dir, &invoice.id)?)
    } else {
        None
    };
    let invoice = store::require::<Invoice>(&conn, &invoice.id, "Invoice")?;
    drop(conn);

    ctx.events.emit(
        "invoice_generated",
        serde_json::json!({
            "invoiceId": invoice.id,
            "invoiceNumber": invoice.invoice_number,
            "bookingId": invoice.booking_id,
        }),
    );
    Ok(serde_json::json!({
        "success": true,
        "data": to_value(&invoice)?,
        "path": path.map(|p| p.display().to_string()),
    }))
}

pub async fn invoice_get(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let payload = payload_object(arg0, "invoiceId");
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let invoice = match value_str(&payload, &["invoiceId", "invoice_id", "id"]) {
        Some(id) => store::require::<Invoice>(&conn, &id, "Invoice")?,
        None => {
            let booking_id = require_id(&payload, &["bookingId", "booking_id"], "invoice id")?;
            invoices::find_for_booking(&conn, &booking_id)?
                .ok_or_else(|| format!("No invoice for booking: {booking_id}"))?
        }
    };
    to_value(&invoice)
}

/// Invoices, newest issue date first. `status` filters; voided invoices are
/// hidden unless asked for.
pub async fn invoice_list(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let payload = payload_object(arg0, "status");
    let status = value_str(&payload, &["status"]);
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let mut rows: Vec<Invoice> = store::list::<Invoice>(&conn)?
        .into_iter()
        .filter(|inv| match status.as_deref() {
            Some(s) => serde_json::to_value(inv.status).ok() == Some(Value::from(s)),
            None => inv.status != InvoiceStatus::Void,
        })
        .collect();
    rows.sort_by(|a, b| {
        b.issue_date
            .cmp(&a.issue_date)
            .then_with(|| b.invoice_number.cmp(&a.invoice_number))
    });
    to_value(&rows)
}

pub async fn invoice_void(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_MANAGE_INVOICES)?;
    let payload = payload_object(arg0, "invoiceId");
    let id = require_id(&payload, &["invoiceId", "invoice_id", "id"], "invoice id")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let invoice = invoices::void(&conn, &id)?;
    info!(invoice_number = %invoice.invoice_number, "Invoice voided by user");
    Ok(success(to_value(&invoice)?))
}

/// Write the invoice HTML again and return its path.
pub async fn invoice_render(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let payload = payload_object(arg0, "invoiceId");
    let id = require_id(&payload, &["invoiceId", "invoice_id", "id"], "invoice id")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let path = invoices::write_html(&conn, &ctx.data_dir, &id)?;
    Ok(success(serde_json::json!({ "path": path.display().to_string() })))
}

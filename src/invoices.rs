//! Invoice generation and printable HTML rendering.
//!
//! One live invoice exists per booking. Generating again refreshes that
//! invoice from the booking (lines, totals, payments) and keeps its number.
//! A voided invoice no longer counts, so the next generation issues a new
//! number.

use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::company::{format_amount, CompanyProfile};
use crate::db;
use crate::models::{
    payment_status_for, Booking, BookingStatus, Customer, Invoice, InvoiceStatus, PaymentStatus,
    Vehicle,
};
use crate::pricing::round_money;
use crate::store;

const COUNTER_CATEGORY: &str = "invoices";
const INVOICE_DIR: &str = "invoices";

fn next_invoice_number(conn: &Connection, issue_date: NaiveDate) -> Result<String, String> {
    let month = issue_date.format("%Y%m").to_string();
    let seq = db::next_sequence(conn, COUNTER_CATEGORY, &format!("counter_{month}"))?;
    Ok(format!("INV-{month}-{seq:04}"))
}

/// The live (non-void) invoice of a booking, if any.
pub fn find_for_booking(conn: &Connection, booking_id: &str) -> Result<Option<Invoice>, String> {
    Ok(store::list::<Invoice>(conn)?
        .into_iter()
        .find(|inv| inv.booking_id == booking_id && inv.status != InvoiceStatus::Void))
}

/// Copy totals and payments from the booking onto the invoice.
fn apply_booking(invoice: &mut Invoice, booking: &Booking) {
    invoice.lines = booking.price.line_items();
    invoice.subtotal = booking.price.subtotal;
    invoice.discount = booking.price.discount;
    invoice.total = booking.price.total;
    invoice.amount_paid = booking.amount_paid();
    if invoice.status != InvoiceStatus::Void {
        invoice.status = match payment_status_for(invoice.amount_paid, invoice.total) {
            PaymentStatus::Unpaid => InvoiceStatus::Unpaid,
            PaymentStatus::Partial => InvoiceStatus::Partial,
            PaymentStatus::Paid => InvoiceStatus::Paid,
        };
    }
}

/// Create the booking's invoice, or refresh the existing one.
pub fn generate_for_booking(conn: &Connection, booking_id: &str) -> Result<Invoice, String> {
    let booking = store::require::<Booking>(conn, booking_id, "Booking")?;
    if booking.status == BookingStatus::Cancelled {
        return Err(format!(
            "Booking {} is cancelled and cannot be invoiced",
            booking.booking_number
        ));
    }

    if let Some(mut existing) = find_for_booking(conn, booking_id)? {
        apply_booking(&mut existing, &booking);
        store::put(conn, &mut existing)?;
        return Ok(existing);
    }

    let company = CompanyProfile::load(conn);
    let now = Utc::now();
    let issue_date = company.local_date(now);
    let due_date = company.due_date(issue_date)?;

    let invoice = db::in_transaction(conn, || {
        let mut invoice = Invoice {
            id: store::new_id::<Invoice>(),
            invoice_number: next_invoice_number(conn, issue_date)?,
            booking_id: booking.id.clone(),
            customer_id: booking.customer_id.clone(),
            issue_date,
            due_date,
            lines: Vec::new(),
            subtotal: 0.0,
            discount: 0.0,
            total: 0.0,
            amount_paid: 0.0,
            status: InvoiceStatus::Unpaid,
            voided_at: None,
            file_path: None,
            created_at: now,
            updated_at: now,
        };
        apply_booking(&mut invoice, &booking);
        store::put(conn, &mut invoice)?;
        Ok::<_, String>(invoice)
    })?;

    info!(
        invoice_id = %invoice.id,
        invoice_number = %invoice.invoice_number,
        booking_id = %booking.id,
        total = invoice.total,
        "Invoice generated"
    );
    Ok(invoice)
}

/// Mirror the booking's payments onto the invoice status.
pub fn refresh_status(conn: &Connection, invoice_id: &str) -> Result<Invoice, String> {
    let mut invoice = store::require::<Invoice>(conn, invoice_id, "Invoice")?;
    if invoice.status == InvoiceStatus::Void {
        return Ok(invoice);
    }
    let booking = store::require::<Booking>(conn, &invoice.booking_id, "Booking")?;
    invoice.amount_paid = booking.amount_paid();
    invoice.status = match payment_status_for(invoice.amount_paid, invoice.total) {
        PaymentStatus::Unpaid => InvoiceStatus::Unpaid,
        PaymentStatus::Partial => InvoiceStatus::Partial,
        PaymentStatus::Paid => InvoiceStatus::Paid,
    };
    store::put(conn, &mut invoice)?;
    Ok(invoice)
}

pub fn void(conn: &Connection, invoice_id: &str) -> Result<Invoice, String> {
    let mut invoice = store::require::<Invoice>(conn, invoice_id, "Invoice")?;
    if invoice.status == InvoiceStatus::Void {
        return Ok(invoice);
    }
    invoice.status = InvoiceStatus::Void;
    invoice.voided_at = Some(Utc::now());
    store::put(conn, &mut invoice)?;
    info!(invoice_id = %invoice.id, invoice_number = %invoice.invoice_number, "Invoice voided");
    Ok(invoice)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn esc(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn qty(value: f64) -> String {
    if (value.round() - value).abs() < f64::EPSILON {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

fn html_shell(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8"/>
<title>{}</title>
<style>
body {{ font-family: "Helvetica Neue", Arial, sans-serif; margin: 32px; color: #111; font-size: 13px; }}
header {{ display: flex; justify-content: space-between; border-bottom: 2px solid #111; padding-bottom: 12px; }}
h1 {{ margin: 0; font-size: 22px; letter-spacing: 2px; }}
.muted {{ color: #666; }}
.parties {{ display: flex; justify-content: space-between; margin: 18px 0; }}
table {{ width: 100%; border-collapse: collapse; }}
th, td {{ padding: 6px 4px; border-bottom: 1px solid #ddd; text-align: left; }}
td.num, th.num {{ text-align: right; }}
.totals td {{ border: none; }}
.totals tr.grand td {{ font-weight: bold; font-size: 15px; border-top: 2px solid #111; }}
.stamp {{ display: inline-block; border: 2px solid; padding: 2px 10px; font-weight: bold; text-transform: uppercase; }}
.stamp.paid {{ color: #0a7d28; }}
.stamp.void {{ color: #b00020; }}
footer {{ margin-top: 28px; }}
@media print {{ body {{ margin: 12mm; }} }}
</style>
</head>
<body>{}</body>
</html>"#,
        esc(title),
        body
    )
}

pub fn render_html(
    invoice: &Invoice,
    booking: &Booking,
    customer: &Customer,
    vehicle: &Vehicle,
    company: &CompanyProfile,
) -> String {
    let money = |v: f64| esc(&company.format_money(v));
    let mut body = String::new();

    body.push_str("<header><div>");
    body.push_str(&format!("<h1>{}</h1>", esc(&company.name)));
    for line in [&company.address, &company.phone, &company.email] {
        if !line.trim().is_empty() {
            body.push_str(&format!("<div class=\"muted\">{}</div>", esc(line)));
        }
    }
    body.push_str("</div><div style=\"text-align:right\">");
    body.push_str("<h1>INVOICE</h1>");
    body.push_str(&format!("<div>{}</div>", esc(&invoice.invoice_number)));
    body.push_str(&format!(
        "<div class=\"muted\">Issued {} &middot; Due {}</div>",
        invoice.issue_date.format("%d %b %Y"),
        invoice.due_date.format("%d %b %Y")
    ));
    match invoice.status {
        InvoiceStatus::Paid => body.push_str("<div class=\"stamp paid\">Paid</div>"),
        InvoiceStatus::Void => body.push_str("<div class=\"stamp void\">Void</div>"),
        _ => {}
    }
    body.push_str("</div></header>");

    body.push_str("<section class=\"parties\"><div><strong>Bill to</strong>");
    body.push_str(&format!("<div>{}</div>", esc(&customer.name)));
    if !customer.phone.trim().is_empty() {
        body.push_str(&format!("<div class=\"muted\">{}</div>", esc(&customer.phone)));
    }
    if let Some(address) = customer.address.as_deref() {
        body.push_str(&format!("<div class=\"muted\">{}</div>", esc(address)));
    }
    body.push_str("</div><div style=\"text-align:right\"><strong>Rental</strong>");
    body.push_str(&format!(
        "<div>{} &middot; {} {} ({})</div>",
        esc(&booking.booking_number),
        esc(&vehicle.brand),
        esc(&vehicle.model),
        esc(&vehicle.plate)
    ));
    body.push_str(&format!(
        "<div class=\"muted\">{} &rarr; {}</div>",
        esc(&company.format_datetime(booking.start_at)),
        esc(&company.format_datetime(booking.actual_return_at.unwrap_or(booking.end_at)))
    ));
    body.push_str("</div></section>");

    body.push_str(
        "<table><thead><tr><th>Description</th><th class=\"num\">Qty</th>\
         <th class=\"num\">Unit price</th><th class=\"num\">Amount</th></tr></thead><tbody>",
    );
    for line in &invoice.lines {
        body.push_str(&format!(
            "<tr><td>{}</td><td class=\"num\">{}</td><td class=\"num\">{}</td><td class=\"num\">{}</td></tr>",
            esc(&line.description),
            qty(line.quantity),
            esc(&format_amount(line.unit_price)),
            esc(&format_amount(line.amount)),
        ));
    }
    body.push_str("</tbody></table>");

    body.push_str("<table class=\"totals\" style=\"width:45%;margin-left:auto\">");
    body.push_str(&format!(
        "<tr><td>Subtotal</td><td class=\"num\">{}</td></tr>",
        money(invoice.subtotal)
    ));
    if invoice.discount > 0.0 {
        body.push_str(&format!(
            "<tr><td>Discount</td><td class=\"num\">-{}</td></tr>",
            money(invoice.discount)
        ));
    }
    body.push_str(&format!(
        "<tr class=\"grand\"><td>Total</td><td class=\"num\">{}</td></tr>",
        money(invoice.total)
    ));
    if invoice.amount_paid > 0.0 {
        body.push_str(&format!(
            "<tr><td>Paid</td><td class=\"num\">{}</td></tr>",
            money(invoice.amount_paid)
        ));
    }
    body.push_str(&format!(
        "<tr><td>Balance due</td><td class=\"num\">{}</td></tr>",
        money(round_money(invoice.balance_due()))
    ));
    body.push_str("</table>");

    body.push_str("<footer>");
    if !company.bank_details.trim().is_empty() {
        body.push_str(&format!(
            "<div><strong>Payment</strong><div>{}</div></div>",
            esc(&company.bank_details).replace('\n', "<br/>")
        ));
    }
    if !company.invoice_footer.trim().is_empty() {
        body.push_str(&format!(
            "<p class=\"muted\">{}</p>",
            esc(&company.invoice_footer)
        ));
    }
    body.push_str("</footer>");

    html_shell(&format!("Invoice {}", invoice.invoice_number), &body)
}

/// Render the invoice to `{data_dir}/invoices/{number}.html` and remember
/// the path on the invoice.
pub fn write_html(conn: &Connection, data_dir: &Path, invoice_id: &str) -> Result<PathBuf, String> {
    let mut invoice = store::require::<Invoice>(conn, invoice_id, "Invoice")?;
    let booking = store::require::<Booking>(conn, &invoice.booking_id, "Booking")?;
    let customer = store::require::<Customer>(conn, &booking.customer_id, "Customer")?;
    let vehicle = store::require::<Vehicle>(conn, &booking.vehicle_id, "Vehicle")?;
    let company = CompanyProfile::load(conn);

    let html = render_html(&invoice, &booking, &customer, &vehicle, &company);
    let dir = data_dir.join(INVOICE_DIR);
    fs::create_dir_all(&dir).map_err(|e| format!("create invoice dir: {e}"))?;
    let path = dir.join(format!("{}.html", invoice.invoice_number));
    fs::write(&path, html).map_err(|e| format!("write invoice: {e}"))?;

    db::log_generated_file(conn, "invoice", Some(&invoice.id), &path)?;
    invoice.file_path = Some(path.display().to_string());
    store::put(conn, &mut invoice)?;

    info!(invoice_number = %invoice.invoice_number, path = %path.display(), "Invoice written");
    Ok(path)
}

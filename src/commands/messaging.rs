use serde_json::Value;

use super::{payload_object, success};
use crate::company::CompanyProfile;
use crate::messaging::{self, MessageKind, MessagingConfig};
use crate::models::{Booking, Customer, Vehicle};
use crate::{store, value_str, AppContext};

/// Build the message text and its `wa.me` link.
///
/// With a `bookingId` the configured template of `kind` is rendered for that
/// booking's customer. Otherwise `phone` and `text` are linked as given.
/// An explicit `phone` or `text` always wins over the rendered values.
fn compose(payload: &Value, ctx: &AppContext) -> Result<Value, String> {
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let config = MessagingConfig::load(&conn);

    let (phone, text) = match value_str(payload, &["bookingId", "booking_id"]) {
        Some(booking_id) => {
            let raw_kind = value_str(payload, &["kind", "template"])
                .unwrap_or_else(|| "confirmation".into());
            let kind = MessageKind::parse(&raw_kind)
                .ok_or_else(|| format!("Unknown message kind: {raw_kind}"))?;
            let booking = store::require::<Booking>(&conn, &booking_id, "Booking")?;
            let customer = store::require::<Customer>(&conn, &booking.customer_id, "Customer")?;
            let vehicle = store::require::<Vehicle>(&conn, &booking.vehicle_id, "Vehicle")?;
            let company = CompanyProfile::load(&conn);
            let text = messaging::render_message(kind, &config, &booking, &customer, &vehicle, &company);
            (
                value_str(payload, &["phone"]).unwrap_or(customer.phone),
                value_str(payload, &["text", "message"]).unwrap_or(text),
            )
        }
        None => (
            value_str(payload, &["phone"]).ok_or("Missing phone or booking id")?,
            value_str(payload, &["text", "message"]).unwrap_or_default(),
        ),
    };

    let link = messaging::wa_link(&phone, &text, &config.country_code)?;
    Ok(serde_json::json!({
        "phone": messaging::normalize_phone(&phone, &config.country_code),
        "text": text,
        "link": link,
    }))
}

pub async fn message_compose(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let payload = payload_object(arg0, "bookingId");
    compose(&payload, ctx)
}

/// Open a `wa.me` link in the browser. Accepts a ready `url` or anything
/// `message_compose` accepts.
pub async fn message_open(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let payload = payload_object(arg0, "url");
    let link = match value_str(&payload, &["url", "link"]) {
        Some(url) => url,
        None => compose(&payload, ctx)?["link"]
            .as_str()
            .map(str::to_string)
            .ok_or("Composed message has no link")?,
    };
    messaging::open_link(&link)?;
    Ok(success(serde_json::json!({ "link": link })))
}

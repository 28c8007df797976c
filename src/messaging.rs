//! WhatsApp click-to-chat links and customer message templates.

use reqwest::Url;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::company::CompanyProfile;
use crate::db;
use crate::models::{Booking, Customer, Vehicle};

pub const DEFAULT_COUNTRY_CODE: &str = "62";
const SETTINGS_CATEGORY: &str = "messaging";
const EXTERNAL_URL_MAX_LEN: usize = 2048;
const ALLOWED_LINK_HOSTS: &[&str] = &["wa.me", "api.whatsapp.com"];

const DEFAULT_CONFIRMATION: &str = "Hello {customer}, your booking {booking_number} is confirmed.\n\
Vehicle: {vehicle} ({plate})\n\
Pick-up: {start}\n\
Return: {end}\n\
Total: {total}\n\
Thank you, {company}";

const DEFAULT_PAYMENT_REMINDER: &str = "Hello {customer}, this is a reminder that booking {booking_number} \
has an outstanding balance of {balance} (total {total}).\n\
{bank_details}\n\
Thank you, {company}";

const DEFAULT_RETURN_REMINDER: &str = "Hello {customer}, a reminder that {vehicle} ({plate}) \
from booking {booking_number} is due back on {end}.\n\
Thank you, {company}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Confirmation,
    PaymentReminder,
    ReturnReminder,
}

impl MessageKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "confirmation" | "booking_confirmation" => Some(MessageKind::Confirmation),
            "payment_reminder" | "payment" => Some(MessageKind::PaymentReminder),
            "return_reminder" | "return" => Some(MessageKind::ReturnReminder),
            _ => None,
        }
    }

    fn setting_key(self) -> &'static str {
        match self {
            MessageKind::Confirmation => "confirmation_template",
            MessageKind::PaymentReminder => "payment_reminder_template",
            MessageKind::ReturnReminder => "return_reminder_template",
        }
    }

    fn default_template(self) -> &'static str {
        match self {
            MessageKind::Confirmation => DEFAULT_CONFIRMATION,
            MessageKind::PaymentReminder => DEFAULT_PAYMENT_REMINDER,
            MessageKind::ReturnReminder => DEFAULT_RETURN_REMINDER,
        }
    }
}

/// Messaging settings (category `messaging`). Empty templates fall back to
/// the built-in wording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagingConfig {
    pub country_code: String,
    pub confirmation_template: String,
    pub payment_reminder_template: String,
    pub return_reminder_template: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            country_code: DEFAULT_COUNTRY_CODE.into(),
            confirmation_template: String::new(),
            payment_reminder_template: String::new(),
            return_reminder_template: String::new(),
        }
    }
}

impl MessagingConfig {
    pub fn load(conn: &Connection) -> Self {
        let read = |key: &str| db::get_setting(conn, SETTINGS_CATEGORY, key).unwrap_or_default();
        let country_code: String = read("country_code")
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        Self {
            country_code: if country_code.is_empty() {
                DEFAULT_COUNTRY_CODE.into()
            } else {
                country_code
            },
            confirmation_template: read(MessageKind::Confirmation.setting_key()),
            payment_reminder_template: read(MessageKind::PaymentReminder.setting_key()),
            return_reminder_template: read(MessageKind::ReturnReminder.setting_key()),
        }
    }

    pub fn save(&self, conn: &Connection) -> Result<(), String> {
        let code: String = self
            .country_code
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        if code.is_empty() || code.len() > 4 {
            return Err(format!("Country code is not valid: {}", self.country_code));
        }
        db::set_setting(conn, SETTINGS_CATEGORY, "country_code", &code)?;
        for (kind, template) in [
            (MessageKind::Confirmation, &self.confirmation_template),
            (MessageKind::PaymentReminder, &self.payment_reminder_template),
            (MessageKind::ReturnReminder, &self.return_reminder_template),
        ] {
            db::set_setting(conn, SETTINGS_CATEGORY, kind.setting_key(), template)?;
        }
        Ok(())
    }

    fn template(&self, kind: MessageKind) -> &str {
        let custom = match kind {
            MessageKind::Confirmation => &self.confirmation_template,
            MessageKind::PaymentReminder => &self.payment_reminder_template,
            MessageKind::ReturnReminder => &self.return_reminder_template,
        };
        if custom.trim().is_empty() {
            kind.default_template()
        } else {
            custom
        }
    }
}

/// Reduce a phone number to the digits WhatsApp expects.
///
/// A leading `+` is dropped and a local leading `0` is replaced with
/// `country_code`: `0812-3456-789` -> `628123456789`.
pub fn normalize_phone(raw: &str, country_code: &str) -> String {
    let trimmed = raw.trim();
    let international = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if international {
        return digits;
    }
    match digits.strip_prefix('0') {
        Some(rest) => format!("{country_code}{rest}"),
        None => digits,
    }
}

fn percent_encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 3);
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// `https://wa.me/{digits}?text={percent-encoded text}`.
pub fn wa_link(phone: &str, text: &str, country_code: &str) -> Result<String, String> {
    let digits = normalize_phone(phone, country_code);
    if digits.len() < 8 {
        return Err(format!("Phone number is not valid: {phone}"));
    }
    if text.is_empty() {
        return Ok(format!("https://wa.me/{digits}"));
    }
    Ok(format!("https://wa.me/{digits}?text={}", percent_encode(text)))
}

/// Render a template for one booking.
pub fn render_message(
    kind: MessageKind,
    config: &MessagingConfig,
    booking: &Booking,
    customer: &Customer,
    vehicle: &Vehicle,
    company: &CompanyProfile,
) -> String {
    let end = booking.actual_return_at.unwrap_or(booking.end_at);
    let replacements = [
        ("{customer}", customer.name.clone()),
        ("{booking_number}", booking.booking_number.clone()),
        ("{vehicle}", format!("{} {}", vehicle.brand, vehicle.model)),
        ("{plate}", vehicle.plate.clone()),
        ("{start}", company.format_datetime(booking.start_at)),
        ("{end}", company.format_datetime(end)),
        ("{total}", company.format_money(booking.price.total)),
        ("{paid}", company.format_money(booking.amount_paid())),
        ("{balance}", company.format_money(booking.balance_due())),
        ("{bank_details}", company.bank_details.clone()),
        ("{company}", company.name.clone()),
    ];
    let mut text = config.template(kind).to_string();
    for (placeholder, value) in replacements {
        text = text.replace(placeholder, &value);
    }
    // Drop lines left blank by empty placeholders.
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Only https links to WhatsApp hosts may be handed to the browser.
pub fn validate_external_url(url_raw: &str) -> Result<Url, String> {
    let trimmed = url_raw.trim();
    if trimmed.is_empty() {
        return Err("External URL cannot be empty".into());
    }
    if trimmed.len() > EXTERNAL_URL_MAX_LEN {
        return Err("External URL is too long".into());
    }

    let parsed = Url::parse(trimmed).map_err(|e| format!("Invalid external URL: {e}"))?;
    if parsed.scheme() != "https" {
        return Err("Only https URLs are allowed".into());
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err("Credentialed URLs are not allowed".into());
    }
    let host = parsed
        .host_str()
        .ok_or("External URL is missing a host")?
        .to_ascii_lowercase();
    if !ALLOWED_LINK_HOSTS.contains(&host.as_str()) {
        return Err(format!("External host is not allowlisted: {host}"));
    }
    Ok(parsed)
}

/// Open a validated link in the system browser.
pub fn open_link(url: &str) -> Result<(), String> {
    let parsed = validate_external_url(url)?;
    webbrowser::open(parsed.as_str()).map_err(|e| format!("Failed to open browser: {e}"))?;
    info!(host = parsed.host_str().unwrap_or_default(), "Opened WhatsApp link");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookings::tests::{new_booking, seed_customer, seed_vehicle};
    use crate::{bookings, db};

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("0812-3456-789", "62"), "628123456789");
        assert_eq!(normalize_phone("+62 812 3456 789", "62"), "628123456789");
        assert_eq!(normalize_phone("+1 (415) 555-0100", "62"), "14155550100");
        assert_eq!(normalize_phone("628123456789", "62"), "628123456789");
        assert_eq!(normalize_phone("  ", "62"), "");
    }

    #[test]
    fn wa_link_percent_encodes_text() {
        let link = wa_link("0812 3456 789", "Halo Andi & co\nTotal: Rp 1.000", "62").unwrap();
        assert_eq!(
            link,
            "https://wa.me/628123456789?text=Halo%20Andi%20%26%20co%0ATotal%3A%20Rp%201.000"
        );
        assert!(wa_link("12", "hi", "62").is_err());
        assert_eq!(
            wa_link("08123456789", "", "62").unwrap(),
            "https://wa.me/628123456789"
        );
    }

    #[test]
    fn allowlist_blocks_other_hosts() {
        assert!(validate_external_url("https://wa.me/628123456789?text=hi").is_ok());
        assert!(validate_external_url("https://api.whatsapp.com/send?phone=62812").is_ok());
        assert!(validate_external_url("http://wa.me/628123456789").is_err());
        assert!(validate_external_url("https://evil.example/wa.me").is_err());
        assert!(validate_external_url("https://user:pw@wa.me/1").is_err());
        assert!(validate_external_url("").is_err());
    }

    #[test]
    fn confirmation_template_fills_booking_details() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let customer = seed_customer(&conn, "Andi");
        let vehicle = seed_vehicle(&conn, "B1111AA", 300_000.0);
        let booking = bookings::create(&conn, new_booking(&customer, &vehicle, 1, 3)).unwrap();

        let company = CompanyProfile {
            name: "Jaya Rent".into(),
            ..CompanyProfile::default()
        };
        let text = render_message(
            MessageKind::Confirmation,
            &MessagingConfig::default(),
            &booking,
            &customer,
            &vehicle,
            &company,
        );
        assert!(text.starts_with("Hello Andi, your booking BK-"));
        assert!(text.contains("Toyota Avanza (B1111AA)"));
        assert!(text.contains("Total: Rp 600.000"));
        assert!(text.ends_with("Thank you, Jaya Rent"));

        let reminder = render_message(
            MessageKind::PaymentReminder,
            &MessagingConfig::default(),
            &booking,
            &customer,
            &vehicle,
            &company,
        );
        assert!(reminder.contains("outstanding balance of Rp 600.000"));
        assert!(
            !reminder.contains("\n\n"),
            "empty bank details line is dropped"
        );
    }

    #[test]
    fn custom_template_overrides_default() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let config = MessagingConfig {
            country_code: "+65".into(),
            return_reminder_template: "Return {plate} by {end}".into(),
            ..MessagingConfig::default()
        };
        config.save(&conn).unwrap();
        let loaded = MessagingConfig::load(&conn);
        assert_eq!(loaded.country_code, "65");
        assert_eq!(loaded.template(MessageKind::ReturnReminder), "Return {plate} by {end}");
        assert_eq!(
            loaded.template(MessageKind::Confirmation),
            DEFAULT_CONFIRMATION
        );
    }

    #[test]
    fn message_kind_parse() {
        assert_eq!(
            MessageKind::parse("payment-reminder"),
            Some(MessageKind::PaymentReminder)
        );
        assert_eq!(MessageKind::parse("nope"), None);
    }
}

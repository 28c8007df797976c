//! Company profile used on invoices and customer messages.

use chrono::{DateTime, Days, FixedOffset, NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db;

const SETTINGS_CATEGORY: &str = "company";
pub const MAX_PAYMENT_TERMS_DAYS: i64 = 365;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompanyProfile {
    pub name: String,
    pub address: String,
    pub phone: String,
    pub email: String,
    /// Free text printed in the payment box (bank, account number, holder).
    pub bank_details: String,
    pub payment_terms_days: i64,
    pub invoice_footer: String,
    pub currency_symbol: String,
    /// Offset used when printing dates for customers (default UTC+7).
    pub utc_offset_minutes: i32,
}

impl Default for CompanyProfile {
    fn default() -> Self {
        Self {
            name: "FleetDesk Rental".into(),
            address: String::new(),
            phone: String::new(),
            email: String::new(),
            bank_details: String::new(),
            payment_terms_days: 0,
            invoice_footer: "Thank you for renting with us.".into(),
            currency_symbol: "Rp".into(),
            utc_offset_minutes: 7 * 60,
        }
    }
}

impl CompanyProfile {
    pub fn load(conn: &Connection) -> Self {
        let mut profile = Self::default();
        let text = |key: &str| {
            db::get_setting(conn, SETTINGS_CATEGORY, key).filter(|v| !v.trim().is_empty())
        };
        if let Some(v) = text("name") {
            profile.name = v;
        }
        if let Some(v) = text("address") {
            profile.address = v;
        }
        if let Some(v) = text("phone") {
            profile.phone = v;
        }
        if let Some(v) = text("email") {
            profile.email = v;
        }
        if let Some(v) = text("bank_details") {
            profile.bank_details = v;
        }
        if let Some(v) = text("invoice_footer") {
            profile.invoice_footer = v;
        }
        if let Some(v) = text("currency_symbol") {
            profile.currency_symbol = v;
        }
        if let Some(days) = text("payment_terms_days").and_then(|v| v.trim().parse::<i64>().ok()) {
            profile.payment_terms_days = days.clamp(0, MAX_PAYMENT_TERMS_DAYS);
        }
        if let Some(offset) =
            text("utc_offset_minutes").and_then(|v| v.trim().parse::<i32>().ok())
        {
            profile.utc_offset_minutes = offset;
        }
        profile
    }

    pub fn save(&self, conn: &Connection) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Company name is required".into());
        }
        if !(0..=MAX_PAYMENT_TERMS_DAYS).contains(&self.payment_terms_days) {
            return Err(format!(
                "Payment terms must be between 0 and {MAX_PAYMENT_TERMS_DAYS} days"
            ));
        }
        if self.offset().is_none() {
            return Err(format!("UTC offset is out of range: {}", self.utc_offset_minutes));
        }
        let pairs: [(&str, String); 9] = [
            ("name", self.name.trim().to_string()),
            ("address", self.address.clone()),
            ("phone", self.phone.clone()),
            ("email", self.email.clone()),
            ("bank_details", self.bank_details.clone()),
            ("payment_terms_days", self.payment_terms_days.to_string()),
            ("invoice_footer", self.invoice_footer.clone()),
            ("currency_symbol", self.currency_symbol.clone()),
            ("utc_offset_minutes", self.utc_offset_minutes.to_string()),
        ];
        for (key, value) in pairs {
            db::set_setting(conn, SETTINGS_CATEGORY, key, &value)?;
        }
        Ok(())
    }

    /// `None` when the stored offset is not a valid UTC offset.
    pub fn offset(&self) -> Option<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
    }

    /// Today's date at the company offset, falling back to UTC.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        match self.offset() {
            Some(offset) => at.with_timezone(&offset).date_naive(),
            None => at.date_naive(),
        }
    }

    pub fn due_date(&self, issue_date: NaiveDate) -> Result<NaiveDate, String> {
        u64::try_from(self.payment_terms_days)
            .ok()
            .and_then(|days| issue_date.checked_add_days(Days::new(days)))
            .ok_or_else(|| format!("Invalid payment terms: {} days", self.payment_terms_days))
    }

    /// Format an instant in the company's local time.
    pub fn format_datetime(&self, at: DateTime<Utc>) -> String {
        match self.offset() {
            Some(offset) => at.with_timezone(&offset).format("%d %b %Y %H:%M").to_string(),
            None => at.format("%d %b %Y %H:%M UTC").to_string(),
        }
    }

    pub fn format_money(&self, amount: f64) -> String {
        format!("{} {}", self.currency_symbol, format_amount(amount))
    }
}

/// `1234567.5` -> `1.234.567,50`; whole amounts drop the decimals.
pub fn format_amount(amount: f64) -> String {
    let cents = (amount.abs() * 100.0).round() as i64;
    let whole = cents / 100;
    let fraction = cents % 100;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }

    let sign = if amount < 0.0 && cents > 0 { "-" } else { "" };
    if fraction == 0 {
        format!("{sign}{grouped}")
    } else {
        format!("{sign}{grouped},{fraction:02}")
    }
}

//! Master data and rental documents.
//!
//! All entities serialize with camelCase keys so cloud documents and
//! backups stay readable by the web dashboard.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::messaging;
use crate::pricing::{LineItem, PriceBreakdown, PricingOptions};
use crate::store::{Collection, Record};

macro_rules! impl_record {
    ($ty:ty, $collection:expr, $prefix:literal) => {
        impl Record for $ty {
            const COLLECTION: Collection = $collection;
            const ID_PREFIX: &'static str = $prefix;

            fn id(&self) -> &str {
                &self.id
            }

            fn updated_at(&self) -> DateTime<Utc> {
                self.updated_at
            }

            fn touch(&mut self, now: DateTime<Utc>) {
                self.updated_at = now;
            }
        }
    };
}

/// Validation and free-text search shared by the master-data collections.
pub trait MasterData: Record {
    /// Canonicalize user input (trim, upper-case plates, ...).
    fn normalize(&mut self) {}
    fn validate(&self) -> Result<(), String>;
    /// Lower-cased text matched by list filters.
    fn search_text(&self) -> String;
}

fn require_text(value: &str, label: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{label} is required"));
    }
    Ok(())
}

fn require_non_negative(value: f64, label: &str) -> Result<(), String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("{label} must be zero or greater"));
    }
    Ok(())
}

fn require_phone(phone: &str) -> Result<(), String> {
    if phone.trim().is_empty() {
        return Ok(());
    }
    let digits = messaging::normalize_phone(phone, messaging::DEFAULT_COUNTRY_CODE);
    if !(8..=15).contains(&digits.len()) {
        return Err(format!("Phone number is not valid: {phone}"));
    }
    Ok(())
}

fn trim_opt(value: &mut Option<String>) {
    if let Some(v) = value.as_mut() {
        let trimmed = v.trim().to_string();
        *v = trimmed;
    }
    if value.as_deref().is_some_and(str::is_empty) {
        *value = None;
    }
}

// ---------------------------------------------------------------------------
// Vehicles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    #[default]
    Available,
    Rented,
    Maintenance,
    Retired,
}

impl VehicleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VehicleStatus::Available => "available",
            VehicleStatus::Rented => "rented",
            VehicleStatus::Maintenance => "maintenance",
            VehicleStatus::Retired => "retired",
        }
    }

    /// Whether new bookings may be placed on a vehicle in this state.
    pub fn is_rentable(self) -> bool {
        matches!(self, VehicleStatus::Available | VehicleStatus::Rented)
    }
}

impl std::fmt::Display for VehicleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transmission {
    #[default]
    Manual,
    Automatic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: String,
    pub plate: String,
    pub brand: String,
    pub model: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub transmission: Transmission,
    #[serde(default)]
    pub fuel: Option<String>,
    #[serde(default)]
    pub seats: Option<u8>,
    #[serde(default)]
    pub color: Option<String>,
    pub daily_rate: f64,
    /// Investor partner that owns the vehicle, if it is not company-owned.
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub status: VehicleStatus,
    #[serde(default)]
    pub odometer_km: i64,
    /// Compressed JPEG data URL.
    #[serde(default)]
    pub photo: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl_record!(Vehicle, Collection::Vehicles, "veh");

/// Upper-case a plate and strip every whitespace character.
pub fn normalize_plate(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

fn validate_plate(plate: &str) -> Result<(), String> {
    if plate.is_empty() {
        return Err("Plate number is required".into());
    }
    let well_formed = (3..=12).contains(&plate.len())
        && plate.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && plate.chars().any(|c| c.is_ascii_digit())
        && plate.chars().any(|c| c.is_ascii_alphabetic());
    if !well_formed {
        return Err(format!("Plate number is not valid: {plate}"));
    }
    Ok(())
}

impl MasterData for Vehicle {
    fn normalize(&mut self) {
        self.plate = normalize_plate(&self.plate);
        self.brand = self.brand.trim().to_string();
        self.model = self.model.trim().to_string();
        self.category = self.category.trim().to_string();
        trim_opt(&mut self.color);
        trim_opt(&mut self.fuel);
        trim_opt(&mut self.owner_id);
        trim_opt(&mut self.notes);
    }

    fn validate(&self) -> Result<(), String> {
        validate_plate(&self.plate)?;
        require_text(&self.brand, "Brand")?;
        require_text(&self.model, "Model")?;
        require_non_negative(self.daily_rate, "Daily rate")?;
        if self.odometer_km < 0 {
            return Err("Odometer must be zero or greater".into());
        }
        if let Some(year) = self.year {
            if !(1950..=2100).contains(&year) {
                return Err(format!("Year is out of range: {year}"));
            }
        }
        Ok(())
    }

    fn search_text(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.plate,
            self.brand,
            self.model,
            self.category,
            self.color.as_deref().unwrap_or_default()
        )
        .to_lowercase()
    }
}

// ---------------------------------------------------------------------------
// Customers, drivers, partners
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    /// National id / passport number.
    #[serde(default)]
    pub identity_number: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub blacklisted: bool,
    #[serde(default)]
    pub blacklist_reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl_record!(Customer, Collection::Customers, "cus");

impl MasterData for Customer {
    fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.phone = self.phone.trim().to_string();
        trim_opt(&mut self.email);
        trim_opt(&mut self.identity_number);
        trim_opt(&mut self.address);
        trim_opt(&mut self.blacklist_reason);
        trim_opt(&mut self.notes);
        if !self.blacklisted {
            self.blacklist_reason = None;
        }
    }

    fn validate(&self) -> Result<(), String> {
        require_text(&self.name, "Customer name")?;
        require_phone(&self.phone)?;
        if let Some(email) = self.email.as_deref() {
            if !email.contains('@') {
                return Err(format!("Email is not valid: {email}"));
            }
        }
        Ok(())
    }

    fn search_text(&self) -> String {
        format!(
            "{} {} {} {}",
            self.name,
            self.phone,
            self.email.as_deref().unwrap_or_default(),
            self.identity_number.as_deref().unwrap_or_default()
        )
        .to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub license_number: Option<String>,
    #[serde(default)]
    pub daily_fee: f64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl_record!(Driver, Collection::Drivers, "drv");

fn default_true() -> bool {
    true
}

impl MasterData for Driver {
    fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.phone = self.phone.trim().to_string();
        trim_opt(&mut self.license_number);
        trim_opt(&mut self.notes);
    }

    fn validate(&self) -> Result<(), String> {
        require_text(&self.name, "Driver name")?;
        require_phone(&self.phone)?;
        require_non_negative(self.daily_fee, "Driver daily fee")
    }

    fn search_text(&self) -> String {
        format!(
            "{} {} {}",
            self.name,
            self.phone,
            self.license_number.as_deref().unwrap_or_default()
        )
        .to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartnerKind {
    #[default]
    Investor,
    Vendor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partner {
    pub id: String,
    #[serde(default)]
    pub kind: PartnerKind,
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub bank_account: Option<String>,
    /// Investor share of net vehicle revenue, 0-100.
    #[serde(default)]
    pub revenue_share_percent: f64,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl_record!(Partner, Collection::Partners, "prt");

impl MasterData for Partner {
    fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.phone = self.phone.trim().to_string();
        trim_opt(&mut self.email);
        trim_opt(&mut self.bank_account);
        trim_opt(&mut self.notes);
        if self.kind == PartnerKind::Vendor {
            self.revenue_share_percent = 0.0;
        }
    }

    fn validate(&self) -> Result<(), String> {
        require_text(&self.name, "Partner name")?;
        require_phone(&self.phone)?;
        if !(0.0..=100.0).contains(&self.revenue_share_percent) {
            return Err(format!(
                "Revenue share must be between 0 and 100, got {}",
                self.revenue_share_percent
            ));
        }
        Ok(())
    }

    fn search_text(&self) -> String {
        format!(
            "{} {} {}",
            self.name,
            self.phone,
            self.email.as_deref().unwrap_or_default()
        )
        .to_lowercase()
    }
}

// ---------------------------------------------------------------------------
// Bookings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    #[default]
    Confirmed,
    Active,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Active => "active",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "active" => Some(BookingStatus::Active),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether the booking still occupies its vehicle and driver.
    pub fn blocks_schedule(self) -> bool {
        !matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[default]
    Cash,
    Transfer,
    Card,
    Other,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Transfer => "transfer",
            PaymentMethod::Card => "card",
            PaymentMethod::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub amount: f64,
    #[serde(default)]
    pub method: PaymentMethod,
    pub paid_at: DateTime<Utc>,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: String,
    pub booking_number: String,
    pub customer_id: String,
    pub vehicle_id: String,
    #[serde(default)]
    pub driver_id: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    #[serde(default)]
    pub pickup_location: Option<String>,
    #[serde(default)]
    pub return_location: Option<String>,
    #[serde(default)]
    pub pricing: PricingOptions,
    pub price: PriceBreakdown,
    #[serde(default)]
    pub status: BookingStatus,
    #[serde(default)]
    pub payments: Vec<Payment>,
    #[serde(default)]
    pub actual_pickup_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actual_return_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub odometer_out: Option<i64>,
    #[serde(default)]
    pub odometer_in: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl_record!(Booking, Collection::Bookings, "bk");

impl Booking {
    pub fn amount_paid(&self) -> f64 {
        crate::pricing::round_money(self.payments.iter().map(|p| p.amount).sum())
    }

    pub fn balance_due(&self) -> f64 {
        crate::pricing::round_money((self.price.total - self.amount_paid()).max(0.0))
    }

    pub fn payment_status(&self) -> PaymentStatus {
        payment_status_for(self.amount_paid(), self.price.total)
    }
}

/// Derive paid/partial/unpaid from an amount paid against a total.
pub fn payment_status_for(paid: f64, total: f64) -> PaymentStatus {
    if paid <= 0.0 {
        if total <= 0.0 {
            PaymentStatus::Paid
        } else {
            PaymentStatus::Unpaid
        }
    } else if paid + 0.005 >= total {
        PaymentStatus::Paid
    } else {
        PaymentStatus::Partial
    }
}

// ---------------------------------------------------------------------------
// Invoices and expenses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    #[default]
    Unpaid,
    Partial,
    Paid,
    Void,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: String,
    pub invoice_number: String,
    pub booking_id: String,
    pub customer_id: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub lines: Vec<LineItem>,
    pub subtotal: f64,
    #[serde(default)]
    pub discount: f64,
    pub total: f64,
    #[serde(default)]
    pub amount_paid: f64,
    #[serde(default)]
    pub status: InvoiceStatus,
    #[serde(default)]
    pub voided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub file_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl_record!(Invoice, Collection::Invoices, "inv");

impl Invoice {
    pub fn balance_due(&self) -> f64 {
        crate::pricing::round_money((self.total - self.amount_paid).max(0.0))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseCategory {
    #[default]
    Maintenance,
    Fuel,
    Insurance,
    Tax,
    Other,
}

impl ExpenseCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ExpenseCategory::Maintenance => "maintenance",
            ExpenseCategory::Fuel => "fuel",
            ExpenseCategory::Insurance => "insurance",
            ExpenseCategory::Tax => "tax",
            ExpenseCategory::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: String,
    #[serde(default)]
    pub vehicle_id: Option<String>,
    #[serde(default)]
    pub category: ExpenseCategory,
    pub amount: f64,
    pub spent_at: DateTime<Utc>,
    /// Vendor partner that was paid.
    #[serde(default)]
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl_record!(Expense, Collection::Expenses, "exp");

impl MasterData for Expense {
    fn normalize(&mut self) {
        trim_opt(&mut self.vehicle_id);
        trim_opt(&mut self.vendor_id);
        trim_opt(&mut self.note);
        self.amount = crate::pricing::round_money(self.amount);
    }

    fn validate(&self) -> Result<(), String> {
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err("Expense amount must be greater than zero".into());
        }
        Ok(())
    }

    fn search_text(&self) -> String {
        format!(
            "{} {} {}",
            self.category.as_str(),
            self.vehicle_id.as_deref().unwrap_or_default(),
            self.note.as_deref().unwrap_or_default()
        )
        .to_lowercase()
    }
}

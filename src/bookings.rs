//! Booking lifecycle: create, edit, check-out, check-in, cancel, payments.
//!
//! Status flow:
//!
//! ```text
//! pending ──► confirmed ──► active ──► completed
//!    │            │
//!    └────────────┴──► cancelled
//! ```

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::db;
use crate::models::{
    Booking, BookingStatus, Customer, Driver, Payment, PaymentMethod, Vehicle, VehicleStatus,
};
use crate::pricing::{self, PriceBreakdown, PricingConfig, PricingInput, PricingOptions};
use crate::schedule::{self, Candidate, ScheduleConflict, TimeWindow};
use crate::store;

const COUNTER_CATEGORY: &str = "bookings";

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("Booking not found: {0}")]
    NotFound(String),
    #[error("Customer not found: {0}")]
    CustomerNotFound(String),
    #[error("Customer {name} is blacklisted{}", reason_suffix(.reason))]
    CustomerBlacklisted {
        name: String,
        reason: Option<String>,
    },
    #[error("Vehicle not found: {0}")]
    VehicleNotFound(String),
    #[error("Vehicle {plate} is not available for rent ({status})")]
    VehicleUnavailable {
        plate: String,
        status: VehicleStatus,
    },
    #[error("Vehicle {plate} is still out on booking {booking_number}")]
    VehicleInUse {
        plate: String,
        booking_number: String,
    },
    #[error("Driver not found: {0}")]
    DriverNotFound(String),
    #[error("Driver {0} is inactive")]
    DriverInactive(String),
    #[error("Schedule conflict with {}", conflict_numbers(.0))]
    Conflict(Vec<ScheduleConflict>),
    #[error("Cannot {action} a {from} booking")]
    InvalidTransition {
        from: BookingStatus,
        action: &'static str,
    },
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Storage(String),
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
}

fn conflict_numbers(conflicts: &[ScheduleConflict]) -> String {
    conflicts
        .iter()
        .map(|c| c.booking_number.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<String> for BookingError {
    fn from(message: String) -> Self {
        BookingError::Storage(message)
    }
}

/// Payload for a new booking.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBooking {
    #[serde(alias = "customer_id")]
    pub customer_id: String,
    #[serde(alias = "vehicle_id")]
    pub vehicle_id: String,
    #[serde(default, alias = "driver_id")]
    pub driver_id: Option<String>,
    #[serde(alias = "start_at", alias = "start")]
    pub start_at: DateTime<Utc>,
    #[serde(alias = "end_at", alias = "end")]
    pub end_at: DateTime<Utc>,
    #[serde(default, alias = "pickup_location")]
    pub pickup_location: Option<String>,
    #[serde(default, alias = "return_location")]
    pub return_location: Option<String>,
    #[serde(default)]
    pub pricing: PricingOptions,
    #[serde(default)]
    pub notes: Option<String>,
    /// Keep the booking as `pending` instead of confirming it.
    #[serde(default)]
    pub pending: bool,
}

/// Editable fields of a pending or confirmed booking. `None` keeps the
/// current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingChanges {
    #[serde(default, alias = "vehicle_id")]
    pub vehicle_id: Option<String>,
    #[serde(default, alias = "driver_id")]
    pub driver_id: Option<String>,
    /// Detach the driver.
    #[serde(default, alias = "clear_driver")]
    pub clear_driver: bool,
    #[serde(default, alias = "start_at", alias = "start")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "end_at", alias = "end")]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "pickup_location")]
    pub pickup_location: Option<String>,
    #[serde(default, alias = "return_location")]
    pub return_location: Option<String>,
    #[serde(default)]
    pub pricing: Option<PricingOptions>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Promote a pending booking to confirmed.
    #[serde(default)]
    pub confirm: bool,
}

/// Handover details recorded at check-out or check-in.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handover {
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    #[serde(default, alias = "odometer_km")]
    pub odometer: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPayment {
    pub amount: f64,
    #[serde(default)]
    pub method: PaymentMethod,
    #[serde(default, alias = "paid_at")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reference: Option<String>,
}

/// List filters; every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingFilter {
    #[serde(default)]
    pub status: Option<BookingStatus>,
    #[serde(default, alias = "customer_id")]
    pub customer_id: Option<String>,
    #[serde(default, alias = "vehicle_id")]
    pub vehicle_id: Option<String>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Shared checks
// ---------------------------------------------------------------------------

fn load_booking(conn: &Connection, id: &str) -> Result<Booking, BookingError> {
    store::get::<Booking>(conn, id)?.ok_or_else(|| BookingError::NotFound(id.to_string()))
}

fn rentable_vehicle(conn: &Connection, id: &str) -> Result<Vehicle, BookingError> {
    let vehicle =
        store::get::<Vehicle>(conn, id)?.ok_or_else(|| BookingError::VehicleNotFound(id.into()))?;
    if !vehicle.status.is_rentable() {
        return Err(BookingError::VehicleUnavailable {
            plate: vehicle.plate,
            status: vehicle.status,
        });
    }
    Ok(vehicle)
}

/// Another booking that currently has the vehicle out.
fn active_holder(
    conn: &Connection,
    vehicle_id: &str,
    except_id: &str,
) -> Result<Option<Booking>, BookingError> {
    Ok(store::list::<Booking>(conn)?.into_iter().find(|b| {
        b.vehicle_id == vehicle_id && b.id != except_id && b.status == BookingStatus::Active
    }))
}

fn eligible_customer(conn: &Connection, id: &str) -> Result<Customer, BookingError> {
    let customer = store::get::<Customer>(conn, id)?
        .ok_or_else(|| BookingError::CustomerNotFound(id.into()))?;
    if customer.blacklisted {
        return Err(BookingError::CustomerBlacklisted {
            name: customer.name,
            reason: customer.blacklist_reason,
        });
    }
    Ok(customer)
}

fn active_driver(conn: &Connection, id: Option<&str>) -> Result<Option<Driver>, BookingError> {
    let Some(id) = id.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    let driver =
        store::get::<Driver>(conn, id)?.ok_or_else(|| BookingError::DriverNotFound(id.into()))?;
    if !driver.active {
        return Err(BookingError::DriverInactive(driver.name));
    }
    Ok(Some(driver))
}

fn ensure_no_conflicts(
    conn: &Connection,
    candidate: &Candidate<'_>,
) -> Result<(), BookingError> {
    let bookings = store::list::<Booking>(conn)?;
    let conflicts = schedule::find_conflicts(&bookings, candidate);
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(BookingError::Conflict(conflicts))
    }
}

fn price(
    conn: &Connection,
    window: &TimeWindow,
    vehicle: &Vehicle,
    driver: Option<&Driver>,
    options: &PricingOptions,
) -> Result<PriceBreakdown, BookingError> {
    let config = PricingConfig::load(conn);
    let input = PricingInput {
        start: window.start,
        end: window.end,
        vehicle_daily_rate: vehicle.daily_rate,
        driver_daily_fee: driver.map(|d| d.daily_fee),
        options,
    };
    pricing::quote(&input, &config).map_err(BookingError::Invalid)
}

fn next_booking_number(conn: &Connection, now: DateTime<Utc>) -> Result<String, BookingError> {
    let day = now.format("%Y%m%d").to_string();
    let seq = db::next_sequence(conn, COUNTER_CATEGORY, &format!("counter_{day}"))?;
    Ok(format!("BK-{day}-{seq:04}"))
}

fn set_vehicle_state(
    conn: &Connection,
    vehicle_id: &str,
    status: VehicleStatus,
    odometer: Option<i64>,
) -> Result<(), BookingError> {
    let Some(mut vehicle) = store::get::<Vehicle>(conn, vehicle_id)? else {
        return Err(BookingError::VehicleNotFound(vehicle_id.into()));
    };
    // A vehicle sent to the workshop mid-rental keeps its maintenance flag.
    if vehicle.status.is_rentable() {
        vehicle.status = status;
    }
    if let Some(km) = odometer {
        vehicle.odometer_km = vehicle.odometer_km.max(km);
    }
    store::put(conn, &mut vehicle)?;
    Ok(())
}

fn clean(text: Option<String>) -> Option<String> {
    text.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Price a window without creating anything.
pub fn quote(
    conn: &Connection,
    vehicle_id: &str,
    driver_id: Option<&str>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    options: &PricingOptions,
) -> Result<PriceBreakdown, BookingError> {
    let window = TimeWindow::new(start, end).map_err(BookingError::Invalid)?;
    let vehicle = store::get::<Vehicle>(conn, vehicle_id)?
        .ok_or_else(|| BookingError::VehicleNotFound(vehicle_id.into()))?;
    let driver = active_driver(conn, driver_id)?;
    price(conn, &window, &vehicle, driver.as_ref(), options)
}

pub fn create(conn: &Connection, input: NewBooking) -> Result<Booking, BookingError> {
    let window = TimeWindow::new(input.start_at, input.end_at).map_err(BookingError::Invalid)?;
    eligible_customer(conn, &input.customer_id)?;
    let vehicle = rentable_vehicle(conn, &input.vehicle_id)?;
    let driver = active_driver(conn, input.driver_id.as_deref())?;

    ensure_no_conflicts(
        conn,
        &Candidate {
            booking_id: None,
            vehicle_id: &vehicle.id,
            driver_id: driver.as_ref().map(|d| d.id.as_str()),
            window,
        },
    )?;
    let price = price(conn, &window, &vehicle, driver.as_ref(), &input.pricing)?;

    let now = Utc::now();
    let booking = db::in_transaction(conn, || {
        let mut booking = Booking {
            id: store::new_id::<Booking>(),
            booking_number: next_booking_number(conn, now)?,
            customer_id: input.customer_id.clone(),
            vehicle_id: vehicle.id.clone(),
            driver_id: driver.as_ref().map(|d| d.id.clone()),
            start_at: window.start,
            end_at: window.end,
            pickup_location: clean(input.pickup_location.clone()),
            return_location: clean(input.return_location.clone()),
            pricing: input.pricing.clone(),
            price,
            status: if input.pending {
                BookingStatus::Pending
            } else {
                BookingStatus::Confirmed
            },
            payments: Vec::new(),
            actual_pickup_at: None,
            actual_return_at: None,
            odometer_out: None,
            odometer_in: None,
            notes: clean(input.notes.clone()),
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        };
        store::put(conn, &mut booking)?;
        Ok::<_, BookingError>(booking)
    })?;

    info!(
        booking_id = %booking.id,
        booking_number = %booking.booking_number,
        vehicle_id = %booking.vehicle_id,
        total = booking.price.total,
        "Booking created"
    );
    Ok(booking)
}

pub fn update(conn: &Connection, id: &str, changes: BookingChanges) -> Result<Booking, BookingError> {
    let mut booking = load_booking(conn, id)?;
    if !matches!(
        booking.status,
        BookingStatus::Pending | BookingStatus::Confirmed
    ) {
        return Err(BookingError::InvalidTransition {
            from: booking.status,
            action: "edit",
        });
    }

    let vehicle_id = changes.vehicle_id.unwrap_or_else(|| booking.vehicle_id.clone());
    let vehicle = if vehicle_id == booking.vehicle_id {
        store::get::<Vehicle>(conn, &vehicle_id)?
            .ok_or_else(|| BookingError::VehicleNotFound(vehicle_id.clone()))?
    } else {
        rentable_vehicle(conn, &vehicle_id)?
    };
    let driver_id = if changes.clear_driver {
        None
    } else {
        changes.driver_id.or_else(|| booking.driver_id.clone())
    };
    let driver = active_driver(conn, driver_id.as_deref())?;
    let window = TimeWindow::new(
        changes.start_at.unwrap_or(booking.start_at),
        changes.end_at.unwrap_or(booking.end_at),
    )
    .map_err(BookingError::Invalid)?;

    ensure_no_conflicts(
        conn,
        &Candidate {
            booking_id: Some(&booking.id),
            vehicle_id: &vehicle.id,
            driver_id: driver.as_ref().map(|d| d.id.as_str()),
            window,
        },
    )?;

    if let Some(options) = changes.pricing {
        booking.pricing = options;
    }
    booking.price = price(conn, &window, &vehicle, driver.as_ref(), &booking.pricing)?;
    booking.vehicle_id = vehicle.id.clone();
    booking.driver_id = driver.map(|d| d.id);
    booking.start_at = window.start;
    booking.end_at = window.end;
    if changes.pickup_location.is_some() {
        booking.pickup_location = clean(changes.pickup_location);
    }
    if changes.return_location.is_some() {
        booking.return_location = clean(changes.return_location);
    }
    if changes.notes.is_some() {
        booking.notes = clean(changes.notes);
    }
    if changes.confirm && booking.status == BookingStatus::Pending {
        booking.status = BookingStatus::Confirmed;
    }

    store::put(conn, &mut booking)?;
    info!(booking_id = %booking.id, total = booking.price.total, "Booking updated");
    Ok(booking)
}

/// confirmed -> active. The vehicle is marked as rented. A vehicle that is
/// not rentable, or still out on another booking, cannot be handed over.
pub fn check_out(conn: &Connection, id: &str, handover: Handover) -> Result<Booking, BookingError> {
    let mut booking = load_booking(conn, id)?;
    if booking.status != BookingStatus::Confirmed {
        return Err(BookingError::InvalidTransition {
            from: booking.status,
            action: "check out",
        });
    }
    let vehicle = rentable_vehicle(conn, &booking.vehicle_id)?;
    if let Some(holder) = active_holder(conn, &vehicle.id, &booking.id)? {
        return Err(BookingError::VehicleInUse {
            plate: vehicle.plate,
            booking_number: holder.booking_number,
        });
    }
    if let Some(km) = handover.odometer {
        if km < 0 {
            return Err(BookingError::Invalid("Odometer must be zero or greater".into()));
        }
    }

    db::in_transaction(conn, || {
        booking.status = BookingStatus::Active;
        booking.actual_pickup_at = Some(handover.at.unwrap_or_else(Utc::now));
        booking.odometer_out = handover.odometer;
        store::put(conn, &mut booking)?;
        set_vehicle_state(conn, &booking.vehicle_id, VehicleStatus::Rented, handover.odometer)
    })?;

    info!(booking_id = %booking.id, vehicle_id = %booking.vehicle_id, "Vehicle checked out");
    Ok(booking)
}

/// active -> completed. A late return is re-priced against the actual
/// return instant; an early return keeps the agreed price.
pub fn check_in(conn: &Connection, id: &str, handover: Handover) -> Result<Booking, BookingError> {
    let mut booking = load_booking(conn, id)?;
    if booking.status != BookingStatus::Active {
        return Err(BookingError::InvalidTransition {
            from: booking.status,
            action: "check in",
        });
    }
    let returned_at = handover.at.unwrap_or_else(Utc::now);
    if let (Some(km_in), Some(km_out)) = (handover.odometer, booking.odometer_out) {
        if km_in < km_out {
            return Err(BookingError::Invalid(format!(
                "Return odometer {km_in} is below the check-out reading {km_out}"
            )));
        }
    }

    if returned_at > booking.end_at {
        let vehicle = store::get::<Vehicle>(conn, &booking.vehicle_id)?
            .ok_or_else(|| BookingError::VehicleNotFound(booking.vehicle_id.clone()))?;
        let driver = match booking.driver_id.as_deref() {
            Some(driver_id) => store::get::<Driver>(conn, driver_id)?,
            None => None,
        };
        let window = TimeWindow::new(booking.start_at, returned_at).map_err(BookingError::Invalid)?;
        // Derived overtime applies to the late return, not a stale override.
        let mut options = booking.pricing.clone();
        options.overtime_hours = None;
        booking.price = price(conn, &window, &vehicle, driver.as_ref(), &options)?;
        info!(
            booking_id = %booking.id,
            planned_end = %booking.end_at,
            returned_at = %returned_at,
            total = booking.price.total,
            "Late return re-priced"
        );
    }

    let next_status = match active_holder(conn, &booking.vehicle_id, &booking.id)? {
        Some(_) => VehicleStatus::Rented,
        None => VehicleStatus::Available,
    };
    db::in_transaction(conn, || {
        booking.status = BookingStatus::Completed;
        booking.actual_return_at = Some(returned_at);
        booking.odometer_in = handover.odometer;
        store::put(conn, &mut booking)?;
        set_vehicle_state(conn, &booking.vehicle_id, next_status, handover.odometer)
    })?;

    info!(booking_id = %booking.id, vehicle_id = %booking.vehicle_id, "Vehicle checked in");
    Ok(booking)
}

pub fn cancel(conn: &Connection, id: &str, reason: Option<String>) -> Result<Booking, BookingError> {
    let mut booking = load_booking(conn, id)?;
    if !matches!(
        booking.status,
        BookingStatus::Pending | BookingStatus::Confirmed
    ) {
        return Err(BookingError::InvalidTransition {
            from: booking.status,
            action: "cancel",
        });
    }
    booking.status = BookingStatus::Cancelled;
    booking.cancel_reason = clean(reason);
    store::put(conn, &mut booking)?;
    info!(booking_id = %booking.id, "Booking cancelled");
    Ok(booking)
}

pub fn record_payment(
    conn: &Connection,
    id: &str,
    payment: NewPayment,
) -> Result<Booking, BookingError> {
    let mut booking = load_booking(conn, id)?;
    if booking.status == BookingStatus::Cancelled {
        return Err(BookingError::InvalidTransition {
            from: booking.status,
            action: "record a payment on",
        });
    }
    if !payment.amount.is_finite() || payment.amount <= 0.0 {
        return Err(BookingError::Invalid(
            "Payment amount must be greater than zero".into(),
        ));
    }

    booking.payments.push(Payment {
        id: uuid::Uuid::new_v4().to_string(),
        amount: pricing::round_money(payment.amount),
        method: payment.method,
        paid_at: payment.paid_at.unwrap_or_else(Utc::now),
        reference: clean(payment.reference),
    });
    store::put(conn, &mut booking)?;

    info!(
        booking_id = %booking.id,
        amount = payment.amount,
        method = payment.method.as_str(),
        balance_due = booking.balance_due(),
        "Payment recorded"
    );
    Ok(booking)
}

/// Bookings matching `filter`, newest start first. The date window keeps
/// bookings overlapping `[from, to)`.
pub fn list(conn: &Connection, filter: &BookingFilter) -> Result<Vec<Booking>, String> {
    let mut bookings: Vec<Booking> = store::list::<Booking>(conn)?
        .into_iter()
        .filter(|b| filter.status.map_or(true, |s| b.status == s))
        .filter(|b| {
            filter
                .customer_id
                .as_deref()
                .map_or(true, |c| b.customer_id == c)
        })
        .filter(|b| {
            filter
                .vehicle_id
                .as_deref()
                .map_or(true, |v| b.vehicle_id == v)
        })
        .filter(|b| filter.from.map_or(true, |from| b.end_at > from))
        .filter(|b| filter.to.map_or(true, |to| b.start_at < to))
        .collect();
    bookings.sort_by(|a, b| b.start_at.cmp(&a.start_at));
    Ok(bookings)
}

/// Shape returned to callers: the stored booking plus derived payment data.
pub fn to_json(booking: &Booking) -> serde_json::Value {
    let mut value = serde_json::to_value(booking).unwrap_or(serde_json::Value::Null);
    if let Some(obj) = value.as_object_mut() {
        obj.insert("amountPaid".into(), booking.amount_paid().into());
        obj.insert("balanceDue".into(), booking.balance_due().into());
        obj.insert(
            "paymentStatus".into(),
            serde_json::to_value(booking.payment_status()).unwrap_or_default(),
        );
    }
    value
}

//! Business reports over bookings, vehicles, partners and expenses.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::export::{Cell, ReportTable};
use crate::models::{Booking, BookingStatus, Customer, Expense, Partner, PartnerKind, Vehicle};
use crate::pricing::round_money;
use crate::schedule::TimeWindow;
use crate::store;

fn in_window(at: DateTime<Utc>, window: &TimeWindow) -> bool {
    window.start <= at && at < window.end
}

/// Non-cancelled bookings whose start falls inside the window.
fn bookings_starting_in(conn: &Connection, window: &TimeWindow) -> Result<Vec<Booking>, String> {
    Ok(store::list::<Booking>(conn)?
        .into_iter()
        .filter(|b| b.status != BookingStatus::Cancelled)
        .filter(|b| in_window(b.start_at, window))
        .collect())
}

// ---------------------------------------------------------------------------
// Revenue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRevenue {
    pub category: String,
    pub bookings: i64,
    pub net: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodTotal {
    pub method: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueSummary {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub booking_count: i64,
    pub gross: f64,
    pub discounts: f64,
    pub net: f64,
    pub collected: f64,
    pub outstanding: f64,
    pub by_category: Vec<CategoryRevenue>,
    pub by_payment_method: Vec<MethodTotal>,
}

pub fn revenue_summary(conn: &Connection, window: &TimeWindow) -> Result<RevenueSummary, String> {
    let bookings = bookings_starting_in(conn, window)?;
    let vehicles: BTreeMap<String, Vehicle> = store::list::<Vehicle>(conn)?
        .into_iter()
        .map(|v| (v.id.clone(), v))
        .collect();

    let mut gross = 0.0;
    let mut discounts = 0.0;
    let mut net = 0.0;
    let mut collected = 0.0;
    let mut by_category: BTreeMap<String, (i64, f64)> = BTreeMap::new();
    let mut by_method: BTreeMap<&'static str, f64> = BTreeMap::new();

    for booking in &bookings {
        gross += booking.price.subtotal;
        discounts += booking.price.discount;
        net += booking.price.total;
        collected += booking.amount_paid();

        let category = vehicles
            .get(&booking.vehicle_id)
            .map(|v| v.category.clone())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "Uncategorized".to_string());
        let entry = by_category.entry(category).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += booking.price.total;

        for payment in &booking.payments {
            *by_method.entry(payment.method.as_str()).or_insert(0.0) += payment.amount;
        }
    }

    let outstanding: f64 = bookings.iter().map(Booking::balance_due).sum();

    Ok(RevenueSummary {
        from: window.start,
        to: window.end,
        booking_count: bookings.len() as i64,
        gross: round_money(gross),
        discounts: round_money(discounts),
        net: round_money(net),
        collected: round_money(collected),
        outstanding: round_money(outstanding),
        by_category: by_category
            .into_iter()
            .map(|(category, (count, total))| CategoryRevenue {
                category,
                bookings: count,
                net: round_money(total),
            })
            .collect(),
        by_payment_method: by_method
            .into_iter()
            .map(|(method, amount)| MethodTotal {
                method: method.to_string(),
                amount: round_money(amount),
            })
            .collect(),
    })
}

impl RevenueSummary {
    pub fn to_tables(&self) -> Vec<ReportTable> {
        let mut summary = ReportTable::new("Revenue", &["Metric", "Value"]);
        summary.push(vec!["From".into(), self.from.to_rfc3339().into()]);
        summary.push(vec!["To".into(), self.to.to_rfc3339().into()]);
        summary.push(vec!["Bookings".into(), self.booking_count.into()]);
        summary.push(vec!["Gross".into(), self.gross.into()]);
        summary.push(vec!["Discounts".into(), self.discounts.into()]);
        summary.push(vec!["Net".into(), self.net.into()]);
        summary.push(vec!["Collected".into(), self.collected.into()]);
        summary.push(vec!["Outstanding".into(), self.outstanding.into()]);

        let mut categories = ReportTable::new("By category", &["Category", "Bookings", "Net"]);
        for row in &self.by_category {
            categories.push(vec![
                row.category.clone().into(),
                row.bookings.into(),
                row.net.into(),
            ]);
        }

        let mut methods = ReportTable::new("By payment method", &["Method", "Amount"]);
        for row in &self.by_payment_method {
            methods.push(vec![row.method.clone().into(), row.amount.into()]);
        }
        vec![summary, categories, methods]
    }
}

// ---------------------------------------------------------------------------
// Fleet utilization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleUtilization {
    pub vehicle_id: String,
    pub plate: String,
    pub bookings: i64,
    pub booked_hours: f64,
    pub window_hours: f64,
    pub utilization_percent: f64,
}

/// Booked time per vehicle clipped to the window. Completed rentals count
/// until their actual return.
pub fn fleet_utilization(
    conn: &Connection,
    window: &TimeWindow,
) -> Result<Vec<VehicleUtilization>, String> {
    let bookings: Vec<Booking> = store::list::<Booking>(conn)?
        .into_iter()
        .filter(|b| b.status != BookingStatus::Cancelled)
        .collect();
    let window_minutes = (window.end - window.start).num_minutes().max(1);

    let mut rows = Vec::new();
    for vehicle in store::list::<Vehicle>(conn)? {
        let mut minutes = 0;
        let mut count = 0;
        for booking in bookings.iter().filter(|b| b.vehicle_id == vehicle.id) {
            let occupied = TimeWindow {
                start: booking.actual_pickup_at.unwrap_or(booking.start_at),
                end: booking.actual_return_at.unwrap_or(booking.end_at),
            };
            let overlap = window.overlap_minutes(&occupied);
            if overlap > 0 {
                minutes += overlap;
                count += 1;
            }
        }
        rows.push(VehicleUtilization {
            vehicle_id: vehicle.id.clone(),
            plate: vehicle.plate.clone(),
            bookings: count,
            booked_hours: round_money(minutes as f64 / 60.0),
            window_hours: round_money(window_minutes as f64 / 60.0),
            utilization_percent: round_money(minutes as f64 * 100.0 / window_minutes as f64),
        });
    }
    rows.sort_by(|a, b| {
        b.utilization_percent
            .total_cmp(&a.utilization_percent)
            .then_with(|| a.plate.cmp(&b.plate))
    });
    Ok(rows)
}

pub fn utilization_table(rows: &[VehicleUtilization]) -> ReportTable {
    let mut table = ReportTable::new(
        "Fleet utilization",
        &["Plate", "Bookings", "Booked hours", "Window hours", "Utilization %"],
    );
    for row in rows {
        table.push(vec![
            row.plate.clone().into(),
            row.bookings.into(),
            row.booked_hours.into(),
            row.window_hours.into(),
            row.utilization_percent.into(),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// Investor payouts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestorPayout {
    pub partner_id: String,
    pub name: String,
    pub revenue_share_percent: f64,
    pub vehicles: i64,
    pub revenue: f64,
    pub expenses: f64,
    pub net: f64,
    /// Share of a positive net; a loss-making period pays nothing.
    pub payout: f64,
}

pub fn investor_payouts(
    conn: &Connection,
    window: &TimeWindow,
) -> Result<Vec<InvestorPayout>, String> {
    let bookings = bookings_starting_in(conn, window)?;
    let vehicles = store::list::<Vehicle>(conn)?;
    let expenses: Vec<Expense> = store::list::<Expense>(conn)?
        .into_iter()
        .filter(|e| in_window(e.spent_at, window))
        .collect();

    let mut payouts = Vec::new();
    for partner in store::list::<Partner>(conn)?
        .into_iter()
        .filter(|p| p.kind == PartnerKind::Investor)
    {
        let owned: Vec<&str> = vehicles
            .iter()
            .filter(|v| v.owner_id.as_deref() == Some(partner.id.as_str()))
            .map(|v| v.id.as_str())
            .collect();

        let revenue: f64 = bookings
            .iter()
            .filter(|b| owned.contains(&b.vehicle_id.as_str()))
            .map(|b| b.price.total)
            .sum();
        let spent: f64 = expenses
            .iter()
            .filter(|e| {
                e.vehicle_id
                    .as_deref()
                    .is_some_and(|id| owned.contains(&id))
            })
            .map(|e| e.amount)
            .sum();
        let net = round_money(revenue - spent);

        payouts.push(InvestorPayout {
            partner_id: partner.id.clone(),
            name: partner.name.clone(),
            revenue_share_percent: partner.revenue_share_percent,
            vehicles: owned.len() as i64,
            revenue: round_money(revenue),
            expenses: round_money(spent),
            net,
            payout: round_money(net.max(0.0) * partner.revenue_share_percent / 100.0),
        });
    }
    payouts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(payouts)
}

pub fn payouts_table(rows: &[InvestorPayout]) -> ReportTable {
    let mut table = ReportTable::new(
        "Investor payouts",
        &["Investor", "Vehicles", "Revenue", "Expenses", "Net", "Share %", "Payout"],
    );
    for row in rows {
        table.push(vec![
            row.name.clone().into(),
            row.vehicles.into(),
            row.revenue.into(),
            row.expenses.into(),
            row.net.into(),
            row.revenue_share_percent.into(),
            row.payout.into(),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// Receivables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receivable {
    pub booking_id: String,
    pub booking_number: String,
    pub customer_id: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub total: f64,
    pub paid: f64,
    pub balance_due: f64,
    pub end_at: DateTime<Utc>,
    /// Whole days since the planned return, zero while the rental runs.
    pub days_overdue: i64,
}

pub fn receivables(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<Receivable>, String> {
    let customers: BTreeMap<String, Customer> = store::list::<Customer>(conn)?
        .into_iter()
        .map(|c| (c.id.clone(), c))
        .collect();

    let mut rows: Vec<Receivable> = store::list::<Booking>(conn)?
        .into_iter()
        .filter(|b| b.status != BookingStatus::Cancelled)
        .filter(|b| b.balance_due() > 0.0)
        .map(|b| {
            let customer = customers.get(&b.customer_id);
            Receivable {
                booking_id: b.id.clone(),
                booking_number: b.booking_number.clone(),
                customer_id: b.customer_id.clone(),
                customer_name: customer.map(|c| c.name.clone()).unwrap_or_default(),
                customer_phone: customer.map(|c| c.phone.clone()).unwrap_or_default(),
                total: b.price.total,
                paid: b.amount_paid(),
                balance_due: b.balance_due(),
                end_at: b.end_at,
                days_overdue: (now - b.end_at).num_days().max(0),
            }
        })
        .collect();
    rows.sort_by(|a, b| a.end_at.cmp(&b.end_at));
    Ok(rows)
}

pub fn receivables_table(rows: &[Receivable]) -> ReportTable {
    let mut table = ReportTable::new(
        "Receivables",
        &["Booking", "Customer", "Phone", "Total", "Paid", "Balance", "Days overdue"],
    );
    for row in rows {
        table.push(vec![
            Cell::from(row.booking_number.as_str()),
            row.customer_name.clone().into(),
            row.customer_phone.clone().into(),
            row.total.into(),
            row.paid.into(),
            row.balance_due.into(),
            row.days_overdue.into(),
        ]);
    }
    table
}

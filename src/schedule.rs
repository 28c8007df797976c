//! Booking schedule checks.
//!
//! Every check is a linear scan over the booking list using the half-open
//! overlap test `start < other_end && end > other_start`, so a booking that
//! ends exactly when the next one starts never conflicts.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Booking, Vehicle};

/// A half-open `[start, end)` time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, String> {
        if end <= start {
            return Err("End time must be after start time".into());
        }
        Ok(Self { start, end })
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Length of the intersection with `other`, zero when disjoint.
    pub fn overlap_minutes(&self, other: &TimeWindow) -> i64 {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if end > start {
            (end - start).num_minutes()
        } else {
            0
        }
    }
}

impl Booking {
    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            start: self.start_at,
            end: self.end_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Vehicle,
    Driver,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConflict {
    pub kind: ConflictKind,
    pub booking_id: String,
    pub booking_number: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

/// The booking being placed or edited.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    /// Set when editing an existing booking so it does not conflict with
    /// itself.
    pub booking_id: Option<&'a str>,
    pub vehicle_id: &'a str,
    pub driver_id: Option<&'a str>,
    pub window: TimeWindow,
}

/// Every live booking that collides with `candidate` on its vehicle or its
/// driver. A booking sharing both is reported once, as a vehicle conflict.
pub fn find_conflicts(bookings: &[Booking], candidate: &Candidate<'_>) -> Vec<ScheduleConflict> {
    let mut conflicts = Vec::new();
    for booking in bookings {
        if !booking.status.blocks_schedule() {
            continue;
        }
        if candidate.booking_id == Some(booking.id.as_str()) {
            continue;
        }
        if !candidate.window.overlaps(&booking.window()) {
            continue;
        }

        let kind = if booking.vehicle_id == candidate.vehicle_id {
            ConflictKind::Vehicle
        } else if candidate.driver_id.is_some() && booking.driver_id.as_deref() == candidate.driver_id
        {
            ConflictKind::Driver
        } else {
            continue;
        };

        conflicts.push(ScheduleConflict {
            kind,
            booking_id: booking.id.clone(),
            booking_number: booking.booking_number.clone(),
            start_at: booking.start_at,
            end_at: booking.end_at,
        });
    }
    conflicts
}

/// Rentable vehicles with no live booking overlapping `window`.
pub fn available_vehicles<'a>(
    vehicles: &'a [Vehicle],
    bookings: &[Booking],
    window: &TimeWindow,
) -> Vec<&'a Vehicle> {
    vehicles
        .iter()
        .filter(|v| v.status.is_rentable())
        .filter(|v| {
            let candidate = Candidate {
                booking_id: None,
                vehicle_id: &v.id,
                driver_id: None,
                window: *window,
            };
            find_conflicts(bookings, &candidate).is_empty()
        })
        .collect()
}

/// Live bookings of one vehicle intersecting `window`, earliest first.
pub fn vehicle_calendar<'a>(
    bookings: &'a [Booking],
    vehicle_id: &str,
    window: &TimeWindow,
) -> Vec<&'a Booking> {
    let mut entries: Vec<&Booking> = bookings
        .iter()
        .filter(|b| b.vehicle_id == vehicle_id)
        .filter(|b| b.status != crate::models::BookingStatus::Cancelled)
        .filter(|b| window.overlaps(&b.window()))
        .collect();
    entries.sort_by_key(|b| b.start_at);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookingStatus, Transmission, VehicleStatus};
    use crate::pricing::{PriceBreakdown, PricingOptions};
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, day, hour, 0, 0).unwrap()
    }

    fn booking(id: &str, vehicle: &str, driver: Option<&str>, start: u32, end: u32) -> Booking {
        let now = Utc::now();
        Booking {
            id: id.into(),
            booking_number: format!("BK-{id}"),
            customer_id: "cus-1".into(),
            vehicle_id: vehicle.into(),
            driver_id: driver.map(String::from),
            start_at: at(start, 8),
            end_at: at(end, 8),
            pickup_location: None,
            return_location: None,
            pricing: PricingOptions::default(),
            price: PriceBreakdown::default(),
            status: BookingStatus::Confirmed,
            payments: Vec::new(),
            actual_pickup_at: None,
            actual_return_at: None,
            odometer_out: None,
            odometer_in: None,
            notes: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn vehicle(id: &str, status: VehicleStatus) -> Vehicle {
        let now = Utc::now();
        Vehicle {
            id: id.into(),
            plate: format!("B{}", id.len()),
            brand: "Daihatsu".into(),
            model: "Xenia".into(),
            year: None,
            category: "MPV".into(),
            transmission: Transmission::Manual,
            fuel: None,
            seats: None,
            color: None,
            daily_rate: 250_000.0,
            owner_id: None,
            status,
            odometer_km: 0,
            photo: None,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn candidate<'a>(vehicle: &'a str, driver: Option<&'a str>, start: u32, end: u32) -> Candidate<'a> {
        Candidate {
            booking_id: None,
            vehicle_id: vehicle,
            driver_id: driver,
            window: TimeWindow::new(at(start, 8), at(end, 8)).unwrap(),
        }
    }

    #[test]
    fn overlapping_vehicle_booking_conflicts() {
        let bookings = vec![booking("a", "veh-1", None, 10, 12)];
        let conflicts = find_conflicts(&bookings, &candidate("veh-1", None, 11, 13));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::Vehicle);
        assert_eq!(conflicts[0].booking_id, "a");
    }

    #[test]
    fn back_to_back_bookings_do_not_conflict() {
        let bookings = vec![booking("a", "veh-1", None, 10, 12)];
        assert!(find_conflicts(&bookings, &candidate("veh-1", None, 12, 14)).is_empty());
        assert!(find_conflicts(&bookings, &candidate("veh-1", None, 8, 10)).is_empty());
    }

    #[test]
    fn contained_and_enclosing_windows_conflict() {
        let bookings = vec![booking("a", "veh-1", None, 10, 20)];
        assert_eq!(find_conflicts(&bookings, &candidate("veh-1", None, 12, 13)).len(), 1);
        assert_eq!(find_conflicts(&bookings, &candidate("veh-1", None, 5, 25)).len(), 1);
    }

    #[test]
    fn cancelled_completed_and_self_are_ignored() {
        let mut cancelled = booking("a", "veh-1", None, 10, 12);
        cancelled.status = BookingStatus::Cancelled;
        let mut completed = booking("b", "veh-1", None, 10, 12);
        completed.status = BookingStatus::Completed;
        let own = booking("c", "veh-1", None, 10, 12);
        let bookings = vec![cancelled, completed, own];

        let mut edit = candidate("veh-1", None, 10, 12);
        edit.booking_id = Some("c");
        assert!(find_conflicts(&bookings, &edit).is_empty());
    }

    #[test]
    fn shared_driver_is_a_driver_conflict() {
        let bookings = vec![booking("a", "veh-1", Some("drv-1"), 10, 12)];
        let conflicts = find_conflicts(&bookings, &candidate("veh-2", Some("drv-1"), 11, 12));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::Driver);

        assert!(find_conflicts(&bookings, &candidate("veh-2", None, 11, 12)).is_empty());
    }

    #[test]
    fn availability_skips_booked_and_unrentable_vehicles() {
        let vehicles = vec![
            vehicle("veh-1", VehicleStatus::Available),
            vehicle("veh-2", VehicleStatus::Available),
            vehicle("veh-3", VehicleStatus::Maintenance),
            vehicle("veh-4", VehicleStatus::Rented),
        ];
        let bookings = vec![booking("a", "veh-1", None, 10, 12)];
        let window = TimeWindow::new(at(11, 8), at(13, 8)).unwrap();

        let ids: Vec<&str> = available_vehicles(&vehicles, &bookings, &window)
            .into_iter()
            .map(|v| v.id.as_str())
            .collect();
        assert_eq!(ids, vec!["veh-2", "veh-4"]);
    }

    #[test]
    fn calendar_is_sorted_and_clipped_to_window() {
        let bookings = vec![
            booking("late", "veh-1", None, 20, 22),
            booking("early", "veh-1", None, 2, 4),
            booking("other", "veh-2", None, 2, 4),
            booking("outside", "veh-1", None, 25, 27),
        ];
        let window = TimeWindow::new(at(1, 0), at(23, 0)).unwrap();
        let ids: Vec<&str> = vehicle_calendar(&bookings, "veh-1", &window)
            .into_iter()
            .map(|b| b.id.as_str())
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn overlap_minutes_clips_to_intersection() {
        let a = TimeWindow::new(at(1, 0), at(2, 0)).unwrap();
        let b = TimeWindow::new(at(1, 12), at(3, 0)).unwrap();
        assert_eq!(a.overlap_minutes(&b), 12 * 60);
        let c = TimeWindow::new(at(2, 0), at(3, 0)).unwrap();
        assert_eq!(a.overlap_minutes(&c), 0);
    }
}

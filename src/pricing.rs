//! Rental price computation.
//!
//! A quote is an additive breakdown:
//! `base × days + driver + high season + delivery + overtime + extras - discount`.
//! Durations are measured in whole minutes so partial hours never leak
//! floating-point drift into the day count.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db;

const SETTINGS_CATEGORY: &str = "pricing";
const MINUTES_PER_DAY: i64 = 24 * 60;

pub const DEFAULT_OVERTIME_THRESHOLD_HOURS: f64 = 4.0;
pub const DEFAULT_OVERTIME_RATE_PERCENT: f64 = 10.0;

/// Round a money amount to 2 decimals.
pub fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// A labelled add-on charge (child seat, extra driver hours, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraCharge {
    pub label: String,
    pub amount: f64,
}

/// Per-booking pricing choices captured on the booking form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PricingOptions {
    /// Delivery / pick-up service requested.
    pub delivery: bool,
    /// Overrides the configured delivery fee.
    pub delivery_fee: Option<f64>,
    /// `Some(true)` charges the surcharge on every day, `Some(false)` on none,
    /// `None` follows the configured seasons.
    pub high_season: Option<bool>,
    /// Replaces the derived overtime hours.
    pub overtime_hours: Option<f64>,
    pub extras: Vec<ExtraCharge>,
    pub discount: f64,
    /// Replaces the vehicle's daily rate (negotiated price).
    pub daily_rate: Option<f64>,
}

/// A configured high-season window, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeasonPeriod {
    #[serde(default)]
    pub label: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SeasonPeriod {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Pricing settings stored in `local_settings` (category `pricing`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PricingConfig {
    pub overtime_threshold_hours: f64,
    pub overtime_rate_percent: f64,
    pub high_season_surcharge: f64,
    pub high_season_periods: Vec<SeasonPeriod>,
    pub default_delivery_fee: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            overtime_threshold_hours: DEFAULT_OVERTIME_THRESHOLD_HOURS,
            overtime_rate_percent: DEFAULT_OVERTIME_RATE_PERCENT,
            high_season_surcharge: 0.0,
            high_season_periods: Vec::new(),
            default_delivery_fee: 0.0,
        }
    }
}

impl PricingConfig {
    pub fn load(conn: &Connection) -> Self {
        let defaults = Self::default();
        let number = |key: &str, fallback: f64| {
            db::get_setting(conn, SETTINGS_CATEGORY, key)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(fallback)
        };
        let high_season_periods = db::get_setting(conn, SETTINGS_CATEGORY, "high_season_periods")
            .and_then(|raw| serde_json::from_str::<Vec<SeasonPeriod>>(&raw).ok())
            .unwrap_or_default();

        Self {
            overtime_threshold_hours: number(
                "overtime_threshold_hours",
                defaults.overtime_threshold_hours,
            ),
            overtime_rate_percent: number("overtime_rate_percent", defaults.overtime_rate_percent),
            high_season_surcharge: number("high_season_surcharge", defaults.high_season_surcharge),
            high_season_periods,
            default_delivery_fee: number("default_delivery_fee", defaults.default_delivery_fee),
        }
    }

    pub fn save(&self, conn: &Connection) -> Result<(), String> {
        self.validate()?;
        db::set_setting(
            conn,
            SETTINGS_CATEGORY,
            "overtime_threshold_hours",
            &self.overtime_threshold_hours.to_string(),
        )?;
        db::set_setting(
            conn,
            SETTINGS_CATEGORY,
            "overtime_rate_percent",
            &self.overtime_rate_percent.to_string(),
        )?;
        db::set_setting(
            conn,
            SETTINGS_CATEGORY,
            "high_season_surcharge",
            &self.high_season_surcharge.to_string(),
        )?;
        db::set_setting(
            conn,
            SETTINGS_CATEGORY,
            "default_delivery_fee",
            &self.default_delivery_fee.to_string(),
        )?;
        let periods = serde_json::to_string(&self.high_season_periods)
            .map_err(|e| format!("encode high season periods: {e}"))?;
        db::set_setting(conn, SETTINGS_CATEGORY, "high_season_periods", &periods)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..24.0).contains(&self.overtime_threshold_hours) {
            return Err("Overtime threshold must be between 0 and 24 hours".into());
        }
        for (label, value) in [
            ("Overtime rate", self.overtime_rate_percent),
            ("High season surcharge", self.high_season_surcharge),
            ("Default delivery fee", self.default_delivery_fee),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{label} must be zero or greater"));
            }
        }
        if let Some(bad) = self.high_season_periods.iter().find(|p| p.end < p.start) {
            return Err(format!(
                "High season period {} ends before it starts",
                bad.label
            ));
        }
        Ok(())
    }

    fn is_high_season(&self, date: NaiveDate) -> bool {
        self.high_season_periods.iter().any(|p| p.contains(date))
    }
}

/// Everything a quote depends on besides configuration.
#[derive(Debug, Clone)]
pub struct PricingInput<'a> {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub vehicle_daily_rate: f64,
    /// Daily fee of the attached driver, if any.
    pub driver_daily_fee: Option<f64>,
    pub options: &'a PricingOptions,
}

/// One invoice/quote line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub amount: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PriceBreakdown {
    pub days: i64,
    pub overtime_hours: f64,
    pub daily_rate: f64,
    pub base_total: f64,
    pub driver_daily_fee: f64,
    pub driver_total: f64,
    pub high_season_days: i64,
    pub high_season_rate: f64,
    pub high_season_total: f64,
    pub delivery_fee: f64,
    pub overtime_rate: f64,
    pub overtime_total: f64,
    pub extras: Vec<ExtraCharge>,
    pub extra_total: f64,
    pub subtotal: f64,
    pub discount: f64,
    pub total: f64,
}

impl PriceBreakdown {
    /// Invoice lines for every non-zero component, discount excluded.
    pub fn line_items(&self) -> Vec<LineItem> {
        let mut lines = Vec::new();
        let days = self.days as f64;
        lines.push(LineItem {
            description: "Vehicle rental".into(),
            quantity: days,
            unit_price: self.daily_rate,
            amount: self.base_total,
        });
        if self.driver_total > 0.0 {
            lines.push(LineItem {
                description: "Driver".into(),
                quantity: days,
                unit_price: self.driver_daily_fee,
                amount: self.driver_total,
            });
        }
        if self.high_season_total > 0.0 {
            lines.push(LineItem {
                description: "High season surcharge".into(),
                quantity: self.high_season_days as f64,
                unit_price: self.high_season_rate,
                amount: self.high_season_total,
            });
        }
        if self.delivery_fee > 0.0 {
            lines.push(LineItem {
                description: "Delivery / pick-up".into(),
                quantity: 1.0,
                unit_price: self.delivery_fee,
                amount: self.delivery_fee,
            });
        }
        if self.overtime_total > 0.0 {
            lines.push(LineItem {
                description: "Overtime".into(),
                quantity: self.overtime_hours,
                unit_price: self.overtime_rate,
                amount: self.overtime_total,
            });
        }
        for extra in &self.extras {
            lines.push(LineItem {
                description: extra.label.clone(),
                quantity: 1.0,
                unit_price: extra.amount,
                amount: extra.amount,
            });
        }
        lines
    }
}

/// Billable days and overtime hours for a rental window.
///
/// Whole 24 h blocks are days. A remainder of up to `threshold_hours`
/// (counted in started hours) is overtime; a longer remainder is one more
/// day. The result is never less than one day.
pub fn rental_duration(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    threshold_hours: f64,
) -> Result<(i64, f64), String> {
    let seconds = (end - start).num_seconds();
    if end <= start || seconds <= 0 {
        return Err("End time must be after start time".into());
    }
    // Started minutes, so a window of a few seconds still counts.
    let minutes = (seconds + 59) / 60;

    let mut days = minutes / MINUTES_PER_DAY;
    let remainder = minutes % MINUTES_PER_DAY;
    let mut overtime_hours = 0.0;

    if remainder > 0 {
        let started_hours = ((remainder + 59) / 60) as f64;
        if days >= 1 && started_hours <= threshold_hours {
            overtime_hours = started_hours;
        } else {
            days += 1;
        }
    }

    Ok((days.max(1), overtime_hours))
}

/// Price a rental window.
pub fn quote(input: &PricingInput<'_>, config: &PricingConfig) -> Result<PriceBreakdown, String> {
    let options = input.options;
    let (days, derived_overtime) =
        rental_duration(input.start, input.end, config.overtime_threshold_hours)?;

    let daily_rate = options.daily_rate.unwrap_or(input.vehicle_daily_rate);
    if !daily_rate.is_finite() || daily_rate < 0.0 {
        return Err("Daily rate must be zero or greater".into());
    }
    let overtime_hours = match options.overtime_hours {
        Some(h) if h.is_finite() && h >= 0.0 => h,
        Some(_) => return Err("Overtime hours must be zero or greater".into()),
        None => derived_overtime,
    };
    if options.extras.iter().any(|e| !e.amount.is_finite() || e.amount < 0.0) {
        return Err("Extra charges must be zero or greater".into());
    }

    let base_total = round_money(daily_rate * days as f64);

    let driver_daily_fee = input.driver_daily_fee.unwrap_or(0.0).max(0.0);
    let driver_total = round_money(driver_daily_fee * days as f64);

    let high_season_days = match options.high_season {
        Some(true) => days,
        Some(false) => 0,
        None => (0..days)
            .filter(|i| {
                let day_start = input.start + Duration::days(*i);
                config.is_high_season(day_start.date_naive())
            })
            .count() as i64,
    };
    let high_season_rate = config.high_season_surcharge;
    let high_season_total = round_money(high_season_rate * high_season_days as f64);

    let delivery_fee = if options.delivery {
        round_money(
            options
                .delivery_fee
                .unwrap_or(config.default_delivery_fee)
                .max(0.0),
        )
    } else {
        0.0
    };

    let hourly_overtime = daily_rate * config.overtime_rate_percent / 100.0;
    let overtime_rate = round_money(hourly_overtime);
    let overtime_total = round_money(overtime_hours * hourly_overtime);

    let extra_total = round_money(options.extras.iter().map(|e| e.amount).sum());

    let subtotal = round_money(
        base_total + driver_total + high_season_total + delivery_fee + overtime_total + extra_total,
    );
    let discount = round_money(options.discount.max(0.0).min(subtotal));
    let total = round_money((subtotal - discount).max(0.0));

    Ok(PriceBreakdown {
        days,
        overtime_hours,
        daily_rate: round_money(daily_rate),
        base_total,
        driver_daily_fee: round_money(driver_daily_fee),
        driver_total,
        high_season_days,
        high_season_rate,
        high_season_total,
        delivery_fee,
        overtime_rate,
        overtime_total,
        extras: options.extras.clone(),
        extra_total,
        subtotal,
        discount,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0).unwrap()
    }

    fn quote_for(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        options: &PricingOptions,
        config: &PricingConfig,
    ) -> PriceBreakdown {
        let input = PricingInput {
            start,
            end,
            vehicle_daily_rate: 300_000.0,
            driver_daily_fee: None,
            options,
        };
        quote(&input, config).expect("quote")
    }

    #[test]
    fn duration_rules() {
        let t = DEFAULT_OVERTIME_THRESHOLD_HOURS;
        assert_eq!(rental_duration(at(1, 8, 0), at(2, 8, 0), t).unwrap(), (1, 0.0));
        // Short rentals still bill one day.
        assert_eq!(rental_duration(at(1, 8, 0), at(1, 11, 0), t).unwrap(), (1, 0.0));
        // Remainder within the threshold becomes overtime.
        assert_eq!(rental_duration(at(1, 8, 0), at(3, 11, 0), t).unwrap(), (2, 3.0));
        // Started hours count: 4h01 is 5 hours, above the threshold.
        assert_eq!(rental_duration(at(1, 8, 0), at(3, 12, 1), t).unwrap(), (3, 0.0));
        assert_eq!(rental_duration(at(1, 8, 0), at(3, 12, 0), t).unwrap(), (2, 4.0));
        assert!(rental_duration(at(2, 8, 0), at(2, 8, 0), t).is_err());
        // A window of seconds is one started minute, so one day.
        let start = at(1, 8, 0);
        assert_eq!(
            rental_duration(start, start + Duration::seconds(30), t).unwrap(),
            (1, 0.0)
        );
        assert_eq!(
            rental_duration(at(1, 8, 0), at(3, 8, 0) + Duration::seconds(1), t).unwrap(),
            (2, 1.0)
        );
        assert!(rental_duration(at(2, 8, 0), at(1, 8, 0), t).is_err());
    }

    #[test]
    fn full_breakdown_adds_every_component() {
        let config = PricingConfig {
            high_season_surcharge: 50_000.0,
            high_season_periods: vec![SeasonPeriod {
                label: "Lebaran".into(),
                start: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
                end: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
            }],
            default_delivery_fee: 75_000.0,
            ..PricingConfig::default()
        };
        let options = PricingOptions {
            delivery: true,
            extras: vec![ExtraCharge {
                label: "Child seat".into(),
                amount: 25_000.0,
            }],
            discount: 40_000.0,
            ..PricingOptions::default()
        };
        let input = PricingInput {
            start: at(1, 9, 0),
            end: at(4, 11, 0),
            vehicle_daily_rate: 300_000.0,
            driver_daily_fee: Some(150_000.0),
            options: &options,
        };
        let q = quote(&input, &config).unwrap();

        assert_eq!(q.days, 3);
        assert_eq!(q.overtime_hours, 2.0);
        assert_eq!(q.base_total, 900_000.0);
        assert_eq!(q.driver_total, 450_000.0);
        // Days starting 1st (no), 2nd (yes), 3rd (yes).
        assert_eq!(q.high_season_days, 2);
        assert_eq!(q.high_season_total, 100_000.0);
        assert_eq!(q.delivery_fee, 75_000.0);
        assert_eq!(q.overtime_total, 60_000.0);
        assert_eq!(q.extra_total, 25_000.0);
        assert_eq!(q.subtotal, 1_610_000.0);
        assert_eq!(q.total, 1_570_000.0);

        let line_sum: f64 = q.line_items().iter().map(|l| l.amount).sum();
        assert_eq!(round_money(line_sum), q.subtotal);
    }

    #[test]
    fn overtime_total_uses_the_unrounded_hourly_rate() {
        let options = PricingOptions {
            daily_rate: Some(12_345.67),
            ..PricingOptions::default()
        };
        let q = quote_for(at(1, 8, 0), at(3, 11, 0), &options, &PricingConfig::default());
        assert_eq!(q.overtime_hours, 3.0);
        assert_eq!(q.overtime_rate, 1_234.57);
        assert_eq!(q.overtime_total, 3_703.70);
    }

    #[test]
    fn discount_is_clamped_to_subtotal() {
        let config = PricingConfig::default();
        let options = PricingOptions {
            discount: 10_000_000.0,
            ..PricingOptions::default()
        };
        let q = quote_for(at(1, 8, 0), at(2, 8, 0), &options, &config);
        assert_eq!(q.discount, q.subtotal);
        assert_eq!(q.total, 0.0);

        let negative = PricingOptions {
            discount: -500.0,
            ..PricingOptions::default()
        };
        let q = quote_for(at(1, 8, 0), at(2, 8, 0), &negative, &config);
        assert_eq!(q.discount, 0.0);
        assert_eq!(q.total, 300_000.0);
    }

    #[test]
    fn high_season_override_wins_over_calendar() {
        let config = PricingConfig {
            high_season_surcharge: 20_000.0,
            ..PricingConfig::default()
        };
        let forced = PricingOptions {
            high_season: Some(true),
            ..PricingOptions::default()
        };
        let q = quote_for(at(1, 8, 0), at(3, 8, 0), &forced, &config);
        assert_eq!(q.high_season_days, 2);
        assert_eq!(q.high_season_total, 40_000.0);
    }

    #[test]
    fn overrides_replace_rate_and_overtime() {
        let config = PricingConfig::default();
        let options = PricingOptions {
            daily_rate: Some(250_000.0),
            overtime_hours: Some(1.0),
            ..PricingOptions::default()
        };
        let q = quote_for(at(1, 8, 0), at(2, 8, 0), &options, &config);
        assert_eq!(q.base_total, 250_000.0);
        assert_eq!(q.overtime_total, 25_000.0);
    }

    #[test]
    fn delivery_fee_only_when_requested() {
        let config = PricingConfig {
            default_delivery_fee: 50_000.0,
            ..PricingConfig::default()
        };
        let q = quote_for(at(1, 8, 0), at(2, 8, 0), &PricingOptions::default(), &config);
        assert_eq!(q.delivery_fee, 0.0);
    }

    #[test]
    fn config_round_trips_through_settings() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();

        assert_eq!(PricingConfig::load(&conn), PricingConfig::default());

        let config = PricingConfig {
            overtime_threshold_hours: 3.0,
            high_season_surcharge: 100_000.0,
            high_season_periods: vec![SeasonPeriod {
                label: "Year end".into(),
                start: NaiveDate::from_ymd_opt(2026, 12, 20).unwrap(),
                end: NaiveDate::from_ymd_opt(2027, 1, 2).unwrap(),
            }],
            ..PricingConfig::default()
        };
        config.save(&conn).unwrap();
        assert_eq!(PricingConfig::load(&conn), config);
    }

    #[test]
    fn inverted_season_is_rejected() {
        let config = PricingConfig {
            high_season_periods: vec![SeasonPeriod {
                label: "bad".into(),
                start: NaiveDate::from_ymd_opt(2026, 5, 2).unwrap(),
                end: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
            }],
            ..PricingConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

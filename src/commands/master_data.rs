use chrono::Utc;
use rusqlite::Connection;
use serde_json::Value;
use tracing::info;

use super::{payload_object, require_id, required_window, period_window, success, to_value};
use crate::auth::{self, PERM_DELETE_MASTER_DATA, PERM_MANAGE_MASTER_DATA};
use crate::models::{Booking, Customer, Driver, Expense, MasterData, Partner, Vehicle, VehicleStatus};
use crate::store::{self, Record};
use crate::{bookings, media, schedule, value_str, AppContext};

/// Keys a caller may never overwrite on an existing record.
const PROTECTED_KEYS: &[&str] = &["id", "createdAt", "updatedAt", "created_at", "updated_at"];

fn search_query(arg0: Option<Value>) -> (Value, Option<String>) {
    let payload = payload_object(arg0, "query");
    let query = value_str(&payload, &["query", "q", "search", "term"]).map(|q| q.to_lowercase());
    (payload, query)
}

fn matching<T: MasterData>(conn: &Connection, query: Option<&str>) -> Result<Vec<T>, String> {
    let records = store::list::<T>(conn)?;
    Ok(match query {
        Some(q) => records
            .into_iter()
            .filter(|r| r.search_text().contains(q))
            .collect(),
        None => records,
    })
}

/// Build the record to store from a save payload.
///
/// With an `id` the payload is merged over the stored document, so callers
/// can send only the fields they changed. Without one a new record is
/// created. Returns the normalized, validated record and whether it is new.
pub(crate) fn build_record<T: MasterData>(
    conn: &Connection,
    payload: Value,
    label: &str,
) -> Result<(T, bool), String> {
    let Value::Object(incoming) = payload else {
        return Err(format!("Invalid {label} payload: expected an object"));
    };
    let id = value_str(&Value::Object(incoming.clone()), &["id"]);

    let (mut document, created) = match id {
        Some(id) => {
            let existing = store::require::<T>(conn, &id, label)?;
            let mut document = to_value(&existing)?;
            if let Some(obj) = document.as_object_mut() {
                for (key, value) in incoming {
                    if !PROTECTED_KEYS.contains(&key.as_str()) {
                        obj.insert(key, value);
                    }
                }
            }
            (document, false)
        }
        None => {
            let now = Utc::now().to_rfc3339();
            let mut obj = incoming;
            for key in PROTECTED_KEYS {
                obj.remove(*key);
            }
            obj.insert("id".into(), Value::String(store::new_id::<T>()));
            obj.insert("createdAt".into(), Value::String(now.clone()));
            obj.insert("updatedAt".into(), Value::String(now));
            (Value::Object(obj), true)
        }
    };

    let mut record: T = serde_json::from_value(document.take())
        .map_err(|e| format!("Invalid {label} payload: {e}"))?;
    record.normalize();
    record.validate()?;
    Ok((record, created))
}

fn save_and_announce<T: MasterData>(
    ctx: &AppContext,
    conn: &Connection,
    record: &mut T,
    created: bool,
) -> Result<Value, String> {
    let changed = store::put(conn, record)?;
    info!(
        collection = %T::COLLECTION,
        record_id = %record.id(),
        created,
        changed,
        "Master data saved"
    );
    if changed {
        ctx.events.emit(
            "master_data_saved",
            serde_json::json!({ "collection": T::COLLECTION.as_str(), "id": record.id(), "created": created }),
        );
    }
    Ok(success(to_value(record)?))
}

async fn list_records<T: MasterData>(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let (_, query) = search_query(arg0);
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let records = matching::<T>(&conn, query.as_deref())?;
    to_value(&records)
}

async fn get_record<T: MasterData>(
    arg0: Option<Value>,
    ctx: &AppContext,
    label: &str,
) -> Result<Value, String> {
    let payload = payload_object(arg0, "id");
    let id = require_id(&payload, &["id"], &format!("{} id", label.to_lowercase()))?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    to_value(&store::require::<T>(&conn, &id, label)?)
}

async fn save_simple<T: MasterData>(
    arg0: Option<Value>,
    ctx: &AppContext,
    label: &str,
) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_MANAGE_MASTER_DATA)?;
    let payload = arg0.ok_or_else(|| format!("Missing {} payload", label.to_lowercase()))?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let (mut record, created) = build_record::<T>(&conn, payload, label)?;
    save_and_announce(ctx, &conn, &mut record, created)
}

/// Bookings that still hold a schedule slot and reference the record.
fn open_bookings(conn: &Connection, refers: impl Fn(&Booking) -> bool) -> Result<usize, String> {
    Ok(store::list::<Booking>(conn)?
        .iter()
        .filter(|b| b.status.blocks_schedule())
        .filter(|b| refers(b))
        .count())
}

async fn delete_record<T: MasterData>(
    arg0: Option<Value>,
    ctx: &AppContext,
    label: &str,
    in_use: impl Fn(&Connection, &str) -> Result<Option<String>, String>,
) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_DELETE_MASTER_DATA)?;
    let payload = payload_object(arg0, "id");
    let id = require_id(&payload, &["id"], &format!("{} id", label.to_lowercase()))?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    store::require::<T>(&conn, &id, label)?;
    if let Some(reason) = in_use(&conn, &id)? {
        return Err(reason);
    }
    store::soft_delete::<T>(&conn, &id)?;
    info!(collection = %T::COLLECTION, record_id = %id, "Master data deleted");
    ctx.events.emit(
        "master_data_deleted",
        serde_json::json!({ "collection": T::COLLECTION.as_str(), "id": id }),
    );
    Ok(success(serde_json::json!({ "id": id })))
}

// ---------------------------------------------------------------------------
// Vehicles
// ---------------------------------------------------------------------------

pub async fn vehicle_list(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let (payload, query) = search_query(arg0);
    let status = value_str(&payload, &["status"]);
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let vehicles: Vec<Vehicle> = matching::<Vehicle>(&conn, query.as_deref())?
        .into_iter()
        .filter(|v| status.as_deref().map_or(true, |s| v.status.as_str() == s))
        .collect();
    to_value(&vehicles)
}

pub async fn vehicle_get(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    get_record::<Vehicle>(arg0, ctx, "Vehicle").await
}

/// Plates are unique among live vehicles.
fn ensure_unique_plate(conn: &Connection, vehicle: &Vehicle) -> Result<(), String> {
    let taken = store::list::<Vehicle>(conn)?
        .into_iter()
        .any(|v| v.id != vehicle.id && v.plate == vehicle.plate);
    if taken {
        return Err(format!("Plate number already registered: {}", vehicle.plate));
    }
    Ok(())
}

/// Re-encode a newly uploaded photo. A photo equal to the stored one is kept
/// as is.
fn compress_photo(conn: &Connection, vehicle: &mut Vehicle) -> Result<(), String> {
    let Some(photo) = vehicle.photo.as_deref() else {
        return Ok(());
    };
    let stored = store::get::<Vehicle>(conn, &vehicle.id)?.and_then(|v| v.photo);
    if stored.as_deref() == Some(photo) {
        return Ok(());
    }
    let bytes = media::decode_image_source(photo)?;
    let compressed = media::compress_image(
        &bytes,
        media::DEFAULT_MAX_DIMENSION,
        media::DEFAULT_QUALITY,
    )?;
    vehicle.photo = Some(compressed.data_url);
    Ok(())
}

pub async fn vehicle_save(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_MANAGE_MASTER_DATA)?;
    let payload = arg0.ok_or("Missing vehicle payload")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let (mut vehicle, created) = build_record::<Vehicle>(&conn, payload, "Vehicle")?;
    ensure_unique_plate(&conn, &vehicle)?;
    if let Some(owner_id) = vehicle.owner_id.as_deref() {
        store::require::<Partner>(&conn, owner_id, "Owner partner")?;
    }
    compress_photo(&conn, &mut vehicle)?;
    save_and_announce(ctx, &conn, &mut vehicle, created)
}

pub async fn vehicle_delete(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    delete_record::<Vehicle>(arg0, ctx, "Vehicle", |conn, id| {
        let open = open_bookings(conn, |b| b.vehicle_id == id)?;
        Ok((open > 0).then(|| format!("Vehicle has {open} open booking(s)")))
    })
    .await
}

/// Rentable vehicles free for the whole `from`..`to` window.
pub async fn vehicle_available(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let payload = payload_object(arg0, "from");
    let window = required_window(&payload)?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let vehicles = store::list::<Vehicle>(&conn)?;
    let bookings = store::list::<Booking>(&conn)?;
    let free = schedule::available_vehicles(&vehicles, &bookings, &window);
    to_value(&free)
}

/// Bookings of one vehicle in a window (default: this month).
pub async fn vehicle_calendar(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let payload = payload_object(arg0, "vehicleId");
    let vehicle_id = require_id(&payload, &["vehicleId", "vehicle_id", "id"], "vehicle id")?;
    let window = period_window(&payload, Utc::now())?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let vehicle = store::require::<Vehicle>(&conn, &vehicle_id, "Vehicle")?;
    let bookings = store::list::<Booking>(&conn)?;
    let entries: Vec<Value> = schedule::vehicle_calendar(&bookings, &vehicle_id, &window)
        .into_iter()
        .map(bookings::to_json)
        .collect();
    Ok(serde_json::json!({
        "vehicle": to_value(&vehicle)?,
        "from": window.start,
        "to": window.end,
        "bookings": entries,
        "rentable": vehicle.status != VehicleStatus::Retired,
    }))
}

// ---------------------------------------------------------------------------
// Customers
// ---------------------------------------------------------------------------

pub async fn customer_list(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    list_records::<Customer>(arg0, ctx).await
}

pub async fn customer_get(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    get_record::<Customer>(arg0, ctx, "Customer").await
}

pub async fn customer_save(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    save_simple::<Customer>(arg0, ctx, "Customer").await
}

pub async fn customer_delete(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    delete_record::<Customer>(arg0, ctx, "Customer", |conn, id| {
        let open = open_bookings(conn, |b| b.customer_id == id)?;
        Ok((open > 0).then(|| format!("Customer has {open} open booking(s)")))
    })
    .await
}

pub async fn customer_set_blacklist(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_MANAGE_MASTER_DATA)?;
    let payload = payload_object(arg0, "customerId");
    let id = require_id(&payload, &["customerId", "customer_id", "id"], "customer id")?;
    let blacklisted = payload
        .get("blacklisted")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let reason = value_str(&payload, &["reason", "blacklistReason"]);
    let update = serde_json::json!({
        "id": id,
        "blacklisted": blacklisted,
        "blacklistReason": reason,
    });
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let (mut customer, _) = build_record::<Customer>(&conn, update, "Customer")?;
    save_and_announce(ctx, &conn, &mut customer, false)
}

// ---------------------------------------------------------------------------
// Drivers, partners, expenses
// ---------------------------------------------------------------------------

pub async fn driver_list(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let (payload, query) = search_query(arg0);
    let active_only = payload
        .get("activeOnly")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let drivers: Vec<Driver> = matching::<Driver>(&conn, query.as_deref())?
        .into_iter()
        .filter(|d| !active_only || d.active)
        .collect();
    to_value(&drivers)
}

pub async fn driver_get(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    get_record::<Driver>(arg0, ctx, "Driver").await
}

pub async fn driver_save(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    save_simple::<Driver>(arg0, ctx, "Driver").await
}

pub async fn driver_delete(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    delete_record::<Driver>(arg0, ctx, "Driver", |conn, id| {
        let open = open_bookings(conn, |b| b.driver_id.as_deref() == Some(id))?;
        Ok((open > 0).then(|| format!("Driver has {open} open booking(s)")))
    })
    .await
}

pub async fn partner_list(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let (payload, query) = search_query(arg0);
    let kind = value_str(&payload, &["kind"]);
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let partners: Vec<Partner> = matching::<Partner>(&conn, query.as_deref())?
        .into_iter()
        .filter(|p| {
            kind.as_deref()
                .map_or(true, |k| serde_json::to_value(p.kind).ok() == Some(Value::from(k)))
        })
        .collect();
    to_value(&partners)
}

pub async fn partner_get(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    get_record::<Partner>(arg0, ctx, "Partner").await
}

pub async fn partner_save(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    save_simple::<Partner>(arg0, ctx, "Partner").await
}

pub async fn partner_delete(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    delete_record::<Partner>(arg0, ctx, "Partner", |conn, id| {
        let owned = store::list::<Vehicle>(conn)?
            .iter()
            .filter(|v| v.owner_id.as_deref() == Some(id))
            .count();
        Ok((owned > 0).then(|| format!("Partner still owns {owned} vehicle(s)")))
    })
    .await
}

pub async fn expense_list(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    let (payload, query) = search_query(arg0);
    let vehicle_id = value_str(&payload, &["vehicleId", "vehicle_id"]);
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let mut expenses: Vec<Expense> = matching::<Expense>(&conn, query.as_deref())?
        .into_iter()
        .filter(|e| {
            vehicle_id
                .as_deref()
                .map_or(true, |v| e.vehicle_id.as_deref() == Some(v))
        })
        .collect();
    expenses.sort_by(|a, b| b.spent_at.cmp(&a.spent_at));
    to_value(&expenses)
}

pub async fn expense_get(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    get_record::<Expense>(arg0, ctx, "Expense").await
}

pub async fn expense_save(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_MANAGE_MASTER_DATA)?;
    let payload = arg0.ok_or("Missing expense payload")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let (mut expense, created) = build_record::<Expense>(&conn, payload, "Expense")?;
    if let Some(vehicle_id) = expense.vehicle_id.as_deref() {
        store::require::<Vehicle>(&conn, vehicle_id, "Vehicle")?;
    }
    if let Some(vendor_id) = expense.vendor_id.as_deref() {
        store::require::<Partner>(&conn, vendor_id, "Vendor")?;
    }
    save_and_announce(ctx, &conn, &mut expense, created)
}

pub async fn expense_delete(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    delete_record::<Expense>(arg0, ctx, "Expense", |_, _| Ok(None)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookings::tests::{new_booking, seed_customer, seed_vehicle};
    use crate::commands::tests::test_ctx;
    use serde_json::json;

    fn vehicle_payload(plate: &str) -> Value {
        json!({
            "plate": plate,
            "brand": "Honda",
            "model": "Brio",
            "dailyRate": 300000.0,
            "year": 2024,
            "color": ""
        })
    }

    #[tokio::test]
    async fn saving_a_new_vehicle_assigns_id_and_normalizes_plate() {
        let (ctx, _dir) = test_ctx();
        let saved = vehicle_save(Some(vehicle_payload("b 1234 xyz")), &ctx)
            .await
            .unwrap();
        assert_eq!(saved["success"], true);
        assert_eq!(saved["data"]["plate"], "B1234XYZ");
        assert!(saved["data"]["id"].as_str().unwrap().starts_with("veh-"));
        assert!(saved["data"].get("color").map_or(true, Value::is_null));
    }

    #[tokio::test]
    async fn duplicate_plates_are_rejected() {
        let (ctx, _dir) = test_ctx();
        {
            let conn = ctx.db.conn.lock().unwrap();
            seed_vehicle(&conn, "B1234XYZ", 300_000.0);
        }
        let err = vehicle_save(Some(vehicle_payload("B 1234 XYZ")), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, "Plate number already registered: B1234XYZ");
    }

    #[tokio::test]
    async fn partial_updates_merge_over_the_stored_record() {
        let (ctx, _dir) = test_ctx();
        let vehicle = {
            let conn = ctx.db.conn.lock().unwrap();
            seed_vehicle(&conn, "D5555AB", 300_000.0)
        };
        let saved = vehicle_save(
            Some(json!({ "id": vehicle.id, "dailyRate": 325000.0, "createdAt": "1999-01-01T00:00:00Z" })),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(saved["data"]["dailyRate"], 325000.0);
        assert_eq!(saved["data"]["plate"], "D5555AB");
        assert_eq!(saved["data"]["brand"], "Toyota");
        assert_ne!(saved["data"]["createdAt"], "1999-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn updating_an_unknown_id_fails() {
        let (ctx, _dir) = test_ctx();
        let err = customer_save(Some(json!({ "id": "cus-missing", "name": "X" })), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, "Customer not found: cus-missing");
    }

    #[tokio::test]
    async fn list_filters_by_search_text() {
        let (ctx, _dir) = test_ctx();
        {
            let conn = ctx.db.conn.lock().unwrap();
            seed_customer(&conn, "Budi Santoso");
            seed_customer(&conn, "Sari Dewi");
        }
        let found = customer_list(Some(json!("sari")), &ctx).await.unwrap();
        let names: Vec<&str> = found
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Sari Dewi"]);
        let all = customer_list(None, &ctx).await.unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn vehicles_with_open_bookings_cannot_be_deleted() {
        let (ctx, _dir) = test_ctx();
        let vehicle = {
            let conn = ctx.db.conn.lock().unwrap();
            let vehicle = seed_vehicle(&conn, "B7777CD", 300_000.0);
            let customer = seed_customer(&conn, "Budi");
            bookings::create(&conn, new_booking(&customer, &vehicle, 3, 5)).unwrap();
            vehicle
        };
        let err = vehicle_delete(Some(json!(vehicle.id)), &ctx).await.unwrap_err();
        assert_eq!(err, "Vehicle has 1 open booking(s)");
    }

    #[tokio::test]
    async fn deleting_emits_an_event_and_hides_the_record() {
        let (ctx, _dir) = test_ctx();
        let mut rx = ctx.events.subscribe();
        let customer = {
            let conn = ctx.db.conn.lock().unwrap();
            seed_customer(&conn, "Budi")
        };
        customer_delete(Some(json!({ "id": customer.id })), &ctx)
            .await
            .unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name, "master_data_deleted");
        let err = customer_get(Some(json!(customer.id)), &ctx).await.unwrap_err();
        assert!(err.starts_with("Customer not found"));
    }

    #[tokio::test]
    async fn blacklisting_records_the_reason() {
        let (ctx, _dir) = test_ctx();
        let customer = {
            let conn = ctx.db.conn.lock().unwrap();
            seed_customer(&conn, "Budi")
        };
        let saved = customer_set_blacklist(
            Some(json!({ "customerId": customer.id, "reason": "Unpaid damages" })),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(saved["data"]["blacklisted"], true);
        assert_eq!(saved["data"]["blacklistReason"], "Unpaid damages");
    }

    #[tokio::test]
    async fn availability_excludes_booked_vehicles() {
        let (ctx, _dir) = test_ctx();
        let free_id = {
            let conn = ctx.db.conn.lock().unwrap();
            let booked = seed_vehicle(&conn, "B1111AA", 300_000.0);
            let free = seed_vehicle(&conn, "B2222BB", 300_000.0);
            let customer = seed_customer(&conn, "Budi");
            bookings::create(&conn, new_booking(&customer, &booked, 3, 5)).unwrap();
            free.id
        };
        let free = vehicle_available(
            Some(json!({ "from": "2026-05-04T00:00:00Z", "to": "2026-05-06T00:00:00Z" })),
            &ctx,
        )
        .await
        .unwrap();
        let ids: Vec<&str> = free
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec![free_id.as_str()]);
        assert!(vehicle_available(None, &ctx).await.is_err());
    }
}

//! Typed record collections persisted as JSON documents.
//!
//! Every master-data and booking entity lives in the `records` table keyed
//! by `(collection, id)`. Writes go through [`put`] / [`soft_delete`],
//! which also append an outbox row to `sync_queue` so the background sync
//! loop can push the change. Remote changes arrive through
//! [`put_remote`], which never enqueues.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::sync::SyncConfig;

/// Named collections stored in the `records` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Vehicles,
    Customers,
    Drivers,
    Partners,
    Bookings,
    Invoices,
    Expenses,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Vehicles,
        Collection::Customers,
        Collection::Drivers,
        Collection::Partners,
        Collection::Bookings,
        Collection::Invoices,
        Collection::Expenses,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Vehicles => "vehicles",
            Collection::Customers => "customers",
            Collection::Drivers => "drivers",
            Collection::Partners => "partners",
            Collection::Bookings => "bookings",
            Collection::Invoices => "invoices",
            Collection::Expenses => "expenses",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document stored in one of the record collections.
pub trait Record: Serialize + DeserializeOwned + Clone {
    const COLLECTION: Collection;
    /// Prefix for generated ids, e.g. `veh` -> `veh-<uuid>`.
    const ID_PREFIX: &'static str;

    fn id(&self) -> &str;
    fn updated_at(&self) -> DateTime<Utc>;
    fn touch(&mut self, now: DateTime<Utc>);
}

/// Generate a new record id for `T`.
pub fn new_id<T: Record>() -> String {
    format!("{}-{}", T::ID_PREFIX, Uuid::new_v4())
}

/// Hex md5 of the serialized document, used to detect unsynced edits.
pub fn content_hash(data: &str) -> String {
    format!("{:x}", md5::compute(data.as_bytes()))
}

/// Serialize a record with sorted keys so local and remote copies of the
/// same document hash identically.
fn encode<T: Record>(record: &T) -> Result<String, String> {
    serde_json::to_value(record)
        .map(|v| v.to_string())
        .map_err(|e| format!("encode {}: {e}", T::COLLECTION))
}

/// Load every live (non-deleted) record of `T`, in insertion order.
pub fn list<T: Record>(conn: &Connection) -> Result<Vec<T>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT id, data FROM records
             WHERE collection = ?1 AND deleted = 0
             ORDER BY rowid ASC",
        )
        .map_err(|e| format!("prepare list {}: {e}", T::COLLECTION))?;
    let rows = stmt
        .query_map(params![T::COLLECTION.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| format!("list {}: {e}", T::COLLECTION))?;

    let mut records = Vec::new();
    for (id, data) in rows.flatten() {
        match serde_json::from_str::<T>(&data) {
            Ok(record) => records.push(record),
            Err(e) => debug!(
                collection = %T::COLLECTION,
                record_id = %id,
                error = %e,
                "Skipping undecodable record"
            ),
        }
    }
    Ok(records)
}

/// Load one live record by id.
pub fn get<T: Record>(conn: &Connection, id: &str) -> Result<Option<T>, String> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM records WHERE collection = ?1 AND id = ?2 AND deleted = 0",
            params![T::COLLECTION.as_str(), id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("get {} {id}: {e}", T::COLLECTION))?;

    match data {
        Some(raw) => serde_json::from_str::<T>(&raw)
            .map(Some)
            .map_err(|e| format!("decode {} {id}: {e}", T::COLLECTION)),
        None => Ok(None),
    }
}

/// Load one live record by id or fail with a "not found" message.
pub fn require<T: Record>(conn: &Connection, id: &str, label: &str) -> Result<T, String> {
    get::<T>(conn, id)?.ok_or_else(|| format!("{label} not found: {id}"))
}

/// Touch `record`, persist it and enqueue it for sync.
///
/// Returns `false` when the stored document was already identical and
/// nothing was written.
pub fn put<T: Record>(conn: &Connection, record: &mut T) -> Result<bool, String> {
    let previous_hash: Option<(String, i64)> = conn
        .query_row(
            "SELECT content_hash, deleted FROM records WHERE collection = ?1 AND id = ?2",
            params![T::COLLECTION.as_str(), record.id()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| format!("read {} hash: {e}", T::COLLECTION))?;

    // Compare against the untouched document so a no-op save does not bump
    // updated_at and create sync traffic.
    if let Some((hash, deleted)) = previous_hash.as_ref() {
        let untouched = encode(record)?;
        if *deleted == 0 && *hash == content_hash(&untouched) {
            return Ok(false);
        }
    }

    record.touch(Utc::now());
    let data = encode(record)?;
    let hash = content_hash(&data);
    let updated_at = record.updated_at().to_rfc3339();

    conn.execute(
        "INSERT INTO records (collection, id, data, updated_at, deleted, content_hash)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)
         ON CONFLICT(collection, id) DO UPDATE SET
            data = excluded.data,
            updated_at = excluded.updated_at,
            deleted = 0,
            content_hash = excluded.content_hash",
        params![T::COLLECTION.as_str(), record.id(), data, updated_at, hash],
    )
    .map_err(|e| format!("save {} {}: {e}", T::COLLECTION, record.id()))?;

    enqueue(conn, T::COLLECTION, record.id(), "upsert", &data, &hash)?;
    Ok(true)
}

/// Tombstone a record and enqueue the delete for sync.
pub fn soft_delete<T: Record>(conn: &Connection, id: &str) -> Result<bool, String> {
    let Some(mut record) = get::<T>(conn, id)? else {
        return Ok(false);
    };
    record.touch(Utc::now());
    let mut document =
        serde_json::to_value(&record).map_err(|e| format!("encode {}: {e}", T::COLLECTION))?;
    if let Some(obj) = document.as_object_mut() {
        obj.insert("deleted".to_string(), Value::Bool(true));
    }
    let data = document.to_string();
    let hash = content_hash(&data);

    conn.execute(
        "UPDATE records
         SET deleted = 1, data = ?3, updated_at = ?4, content_hash = ?5
         WHERE collection = ?1 AND id = ?2",
        params![
            T::COLLECTION.as_str(),
            id,
            data,
            record.updated_at().to_rfc3339(),
            hash
        ],
    )
    .map_err(|e| format!("delete {} {id}: {e}", T::COLLECTION))?;

    enqueue(conn, T::COLLECTION, id, "delete", &data, &hash)?;
    Ok(true)
}

/// Append an outbox row, or refresh the payload of a still-pending row for
/// the same record so the queue holds at most one pending change per record.
/// The row takes the configured retry limit at the time of the change.
pub fn enqueue(
    conn: &Connection,
    collection: Collection,
    record_id: &str,
    operation: &str,
    payload: &str,
    hash: &str,
) -> Result<(), String> {
    let max_retries = SyncConfig::load(conn).max_retries;
    let refreshed = conn
        .execute(
            "UPDATE sync_queue
             SET operation = ?3, payload = ?4, content_hash = ?5, max_retries = ?6,
                 updated_at = datetime('now')
             WHERE collection = ?1 AND record_id = ?2 AND status = 'pending'",
            params![collection.as_str(), record_id, operation, payload, hash, max_retries],
        )
        .map_err(|e| format!("refresh sync row: {e}"))?;
    if refreshed > 0 {
        return Ok(());
    }

    let idempotency_key = format!("{collection}:{record_id}:{}", Uuid::new_v4());
    conn.execute(
        "INSERT INTO sync_queue
             (collection, record_id, operation, payload, content_hash, idempotency_key, max_retries)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            collection.as_str(),
            record_id,
            operation,
            payload,
            hash,
            idempotency_key,
            max_retries
        ],
    )
    .map_err(|e| format!("enqueue sync: {e}"))?;
    Ok(())
}

/// Stored state of a record, including tombstones.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub data: Value,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub content_hash: String,
    pub synced_hash: Option<String>,
}

/// Read the raw stored row for a record, deleted or not.
pub fn stored(
    conn: &Connection,
    collection: Collection,
    id: &str,
) -> Result<Option<StoredRecord>, String> {
    let row: Option<(String, String, i64, String, Option<String>)> = conn
        .query_row(
            "SELECT data, updated_at, deleted, content_hash, synced_hash
             FROM records WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .optional()
        .map_err(|e| format!("read stored {collection} {id}: {e}"))?;

    let Some((data, updated_at, deleted, content_hash, synced_hash)) = row else {
        return Ok(None);
    };
    Ok(Some(StoredRecord {
        data: serde_json::from_str(&data).unwrap_or(Value::Null),
        updated_at: parse_timestamp(&updated_at).unwrap_or_default(),
        deleted: deleted != 0,
        content_hash,
        synced_hash,
    }))
}

/// Every stored document of a collection, tombstones included.
pub fn all_documents(conn: &Connection, collection: Collection) -> Result<Vec<Value>, String> {
    let mut stmt = conn
        .prepare("SELECT data FROM records WHERE collection = ?1 ORDER BY rowid ASC")
        .map_err(|e| format!("prepare documents {collection}: {e}"))?;
    let rows = stmt
        .query_map(params![collection.as_str()], |row| row.get::<_, String>(0))
        .map_err(|e| format!("documents {collection}: {e}"))?;
    Ok(rows
        .flatten()
        .filter_map(|raw| serde_json::from_str::<Value>(&raw).ok())
        .collect())
}

/// Write a document received from the cloud (or a backup) verbatim.
///
/// The row is marked as synced (`synced_hash = content_hash`) and no outbox
/// row is created. Pending outbox rows for the record are dropped because
/// the remote version supersedes them.
pub fn put_remote(
    conn: &Connection,
    collection: Collection,
    id: &str,
    document: &Value,
    updated_at: DateTime<Utc>,
    deleted: bool,
) -> Result<(), String> {
    let data = document.to_string();
    let hash = content_hash(&data);
    conn.execute(
        "INSERT INTO records (collection, id, data, updated_at, deleted, content_hash, synced_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(collection, id) DO UPDATE SET
            data = excluded.data,
            updated_at = excluded.updated_at,
            deleted = excluded.deleted,
            content_hash = excluded.content_hash,
            synced_hash = excluded.synced_hash",
        params![
            collection.as_str(),
            id,
            data,
            updated_at.to_rfc3339(),
            if deleted { 1_i64 } else { 0_i64 },
            hash
        ],
    )
    .map_err(|e| format!("apply remote {collection} {id}: {e}"))?;

    conn.execute(
        "DELETE FROM sync_queue WHERE collection = ?1 AND record_id = ?2 AND status IN ('pending', 'failed')",
        params![collection.as_str(), id],
    )
    .map_err(|e| format!("drop superseded sync rows: {e}"))?;
    Ok(())
}

/// Count live records per collection.
pub fn counts(conn: &Connection) -> Value {
    let mut map = serde_json::Map::new();
    for collection in Collection::ALL {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM records WHERE collection = ?1 AND deleted = 0",
                params![collection.as_str()],
                |row| row.get(0),
            )
            .unwrap_or(0);
        map.insert(collection.as_str().to_string(), Value::from(count));
    }
    Value::Object(map)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::Driver;

    fn driver(name: &str) -> Driver {
        let now = Utc::now();
        Driver {
            id: new_id::<Driver>(),
            name: name.to_string(),
            phone: "0812 3456 789".to_string(),
            license_number: Some("SIM-A-1".to_string()),
            daily_fee: 150_000.0,
            active: true,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn pending_rows(conn: &Connection, id: &str) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE record_id = ?1 AND status = 'pending'",
            params![id],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn save_then_get_round_trips_and_enqueues_once() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();

        let mut d = driver("Budi");
        assert!(put(&conn, &mut d).unwrap());
        let loaded = get::<Driver>(&conn, &d.id).unwrap().expect("driver stored");
        assert_eq!(loaded.name, "Budi");
        assert_eq!(pending_rows(&conn, &d.id), 1);

        d.daily_fee = 175_000.0;
        assert!(put(&conn, &mut d).unwrap());
        assert_eq!(
            pending_rows(&conn, &d.id),
            1,
            "pending row should be refreshed, not duplicated"
        );
    }

    #[test]
    fn unchanged_save_is_a_no_op() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();

        let mut d = driver("Sari");
        put(&conn, &mut d).unwrap();
        let first_updated = d.updated_at;
        assert!(!put(&conn, &mut d).unwrap());
        assert_eq!(d.updated_at, first_updated);
    }

    #[test]
    fn soft_delete_hides_record_and_keeps_tombstone() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();

        let mut d = driver("Agus");
        put(&conn, &mut d).unwrap();
        assert!(soft_delete::<Driver>(&conn, &d.id).unwrap());

        assert!(get::<Driver>(&conn, &d.id).unwrap().is_none());
        assert!(list::<Driver>(&conn).unwrap().is_empty());

        let tombstone = stored(&conn, Collection::Drivers, &d.id)
            .unwrap()
            .expect("tombstone kept");
        assert!(tombstone.deleted);
        assert_eq!(tombstone.data["deleted"], Value::Bool(true));

        let op: String = conn
            .query_row(
                "SELECT operation FROM sync_queue WHERE record_id = ?1 AND status = 'pending'",
                params![d.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(op, "delete");
    }

    #[test]
    fn put_remote_marks_synced_and_drops_pending_rows() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();

        let mut d = driver("Wati");
        put(&conn, &mut d).unwrap();
        assert_eq!(pending_rows(&conn, &d.id), 1);

        let mut remote = serde_json::to_value(&d).unwrap();
        remote["name"] = Value::from("Wati (remote)");
        let remote_at = d.updated_at + chrono::Duration::minutes(5);
        put_remote(&conn, Collection::Drivers, &d.id, &remote, remote_at, false).unwrap();

        assert_eq!(pending_rows(&conn, &d.id), 0);
        let row = stored(&conn, Collection::Drivers, &d.id).unwrap().unwrap();
        assert_eq!(row.synced_hash.as_deref(), Some(row.content_hash.as_str()));
        assert_eq!(row.data["name"], "Wati (remote)");
    }

    #[test]
    fn collection_parse_accepts_known_names_only() {
        assert_eq!(Collection::parse(" Bookings "), Some(Collection::Bookings));
        assert_eq!(Collection::parse("orders"), None);
    }
}

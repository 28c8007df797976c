//! PIN-based local authentication with bcrypt.
//!
//! Two accounts exist: `admin` and `staff`. PIN hashes live in
//! `local_settings` (category "staff", keys "admin_pin_hash" /
//! "staff_pin_hash") together with the persisted lockout counter. Sessions
//! are in-memory only.
//!
//! Until an admin PIN is set the desk runs open: every permission check
//! passes so a fresh install can be configured.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde_json::Value;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db;

const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 5;
const SESSION_INACTIVITY_MINUTES: i64 = 60;
const SESSION_MAX_DURATION_HOURS: i64 = 12;
const STAFF_CATEGORY: &str = "staff";
const ADMIN_PIN_KEY: &str = "admin_pin_hash";
const STAFF_PIN_KEY: &str = "staff_pin_hash";
const LOCKOUT_ATTEMPTS_KEY: &str = "lockout_attempts";
const LOCKOUT_LAST_ATTEMPT_KEY: &str = "lockout_last_attempt";

pub const PERM_MANAGE_BOOKINGS: &str = "manage_bookings";
pub const PERM_MANAGE_MASTER_DATA: &str = "manage_master_data";
pub const PERM_DELETE_MASTER_DATA: &str = "delete_master_data";
pub const PERM_MANAGE_INVOICES: &str = "manage_invoices";
pub const PERM_VIEW_REPORTS: &str = "view_reports";
pub const PERM_SYSTEM_SETTINGS: &str = "system_settings";
pub const PERM_FORCE_SYNC: &str = "force_sync";
pub const PERM_MANAGE_BACKUPS: &str = "manage_backups";

const ADMIN_PERMISSIONS: &[&str] = &[
    PERM_MANAGE_BOOKINGS,
    PERM_MANAGE_MASTER_DATA,
    PERM_DELETE_MASTER_DATA,
    PERM_MANAGE_INVOICES,
    PERM_VIEW_REPORTS,
    PERM_SYSTEM_SETTINGS,
    PERM_FORCE_SYNC,
    PERM_MANAGE_BACKUPS,
];

const STAFF_PERMISSIONS: &[&str] = &[
    PERM_MANAGE_BOOKINGS,
    PERM_MANAGE_MASTER_DATA,
    PERM_MANAGE_INVOICES,
    PERM_VIEW_REPORTS,
    PERM_FORCE_SYNC,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Staff,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Staff => "staff",
        }
    }

    fn permissions(self) -> &'static [&'static str] {
        match self {
            Role::Admin => ADMIN_PERMISSIONS,
            Role::Staff => STAFF_PERMISSIONS,
        }
    }
}

#[derive(Clone)]
struct Session {
    session_id: String,
    role: Role,
    login_time: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Session {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
            || now - self.last_activity > Duration::minutes(SESSION_INACTIVITY_MINUTES)
    }

    fn to_json(&self) -> Value {
        serde_json::json!({
            "sessionId": self.session_id,
            "role": self.role.as_str(),
            "permissions": self.role.permissions(),
            "loginTime": self.login_time.to_rfc3339(),
            "lastActivity": self.last_activity.to_rfc3339(),
            "expiresAt": self.expires_at.to_rfc3339(),
        })
    }
}

struct LockoutEntry {
    attempts: u32,
    last_attempt: DateTime<Utc>,
}

/// The desk holds at most one signed-in session.
pub struct AuthState {
    session: Mutex<Option<Session>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
        }
    }

    fn current(&self) -> Option<Session> {
        let mut guard = self.session.lock().ok()?;
        let now = Utc::now();
        match guard.as_mut() {
            Some(session) if !session.is_expired(now) => {
                session.last_activity = now;
                Some(session.clone())
            }
            Some(_) => {
                *guard = None;
                None
            }
            None => None,
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

/// `"1234"` or `{"pin": "1234"}`.
fn extract_pin(arg: &Value) -> Option<String> {
    arg.as_str()
        .or_else(|| arg.get("pin").and_then(Value::as_str))
        .map(|s| s.trim().to_string())
}

fn check_lockout(lockout: &mut LockoutEntry, now: DateTime<Utc>) -> Result<(), String> {
    if lockout.attempts < MAX_FAILED_ATTEMPTS {
        return Ok(());
    }
    let elapsed = now - lockout.last_attempt;
    if elapsed < Duration::minutes(LOCKOUT_MINUTES) {
        let remaining_secs = (Duration::minutes(LOCKOUT_MINUTES) - elapsed).num_seconds();
        let remaining = (remaining_secs + 59) / 60;
        return Err(format!(
            "Too many failed attempts. Try again in {remaining} minute(s)."
        ));
    }
    // Lockout served; the next failure starts a fresh count.
    lockout.attempts = 0;
    Ok(())
}

fn load_lockout(conn: &Connection) -> LockoutEntry {
    LockoutEntry {
        attempts: db::get_setting(conn, STAFF_CATEGORY, LOCKOUT_ATTEMPTS_KEY)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0),
        last_attempt: db::get_setting(conn, STAFF_CATEGORY, LOCKOUT_LAST_ATTEMPT_KEY)
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
    }
}

fn persist_lockout(conn: &Connection, lockout: &LockoutEntry) -> Result<(), String> {
    db::set_setting(
        conn,
        STAFF_CATEGORY,
        LOCKOUT_ATTEMPTS_KEY,
        &lockout.attempts.to_string(),
    )?;
    db::set_setting(
        conn,
        STAFF_CATEGORY,
        LOCKOUT_LAST_ATTEMPT_KEY,
        &lockout.last_attempt.to_rfc3339(),
    )
}

/// True once an admin PIN exists.
pub fn pins_configured(conn: &Connection) -> bool {
    db::get_setting(conn, STAFF_CATEGORY, ADMIN_PIN_KEY).is_some()
}

fn verify(pin: &str, hash: Option<String>) -> bool {
    hash.map(|h| bcrypt::verify(pin, &h).unwrap_or(false))
        .unwrap_or(false)
}

/// Verify a PIN and open a session.
pub fn login(arg0: Option<Value>, db: &db::DbState, auth: &AuthState) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing login argument")?;
    let pin = extract_pin(&payload).ok_or("Invalid login payload: expected a PIN string")?;
    if pin.is_empty() {
        return Err("PIN is required".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let now = Utc::now();
    let mut lockout = load_lockout(&conn);
    check_lockout(&mut lockout, now)?;

    let role = if verify(&pin, db::get_setting(&conn, STAFF_CATEGORY, ADMIN_PIN_KEY)) {
        Some(Role::Admin)
    } else if verify(&pin, db::get_setting(&conn, STAFF_CATEGORY, STAFF_PIN_KEY)) {
        Some(Role::Staff)
    } else {
        None
    };

    let Some(role) = role else {
        lockout.attempts += 1;
        lockout.last_attempt = now;
        persist_lockout(&conn, &lockout)?;
        warn!(attempts = lockout.attempts, "failed login attempt");
        return Err("Invalid PIN".into());
    };

    lockout.attempts = 0;
    lockout.last_attempt = now;
    persist_lockout(&conn, &lockout)?;

    let session = Session {
        session_id: Uuid::new_v4().to_string(),
        role,
        login_time: now,
        last_activity: now,
        expires_at: now + Duration::hours(SESSION_MAX_DURATION_HOURS),
    };
    let json = session.to_json();
    *auth.session.lock().map_err(|e| e.to_string())? = Some(session);
    info!(role = role.as_str(), "login successful");

    Ok(serde_json::json!({ "success": true, "session": json }))
}

pub fn logout(auth: &AuthState) {
    if let Ok(mut guard) = auth.session.lock() {
        if let Some(session) = guard.take() {
            info!(session_id = %session.session_id, "session logged out");
        }
    }
}

/// Current session or null.
pub fn get_session_json(auth: &AuthState) -> Value {
    auth.current()
        .map(|s| s.to_json())
        .unwrap_or(Value::Null)
}

pub fn has_permission(auth: &AuthState, permission: &str) -> bool {
    auth.current()
        .is_some_and(|s| s.role.permissions().contains(&permission))
}

/// Gate for command handlers. Passes when no PIN has been set up yet.
pub fn require_permission(
    db: &db::DbState,
    auth: &AuthState,
    permission: &str,
) -> Result<(), String> {
    let open = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        !pins_configured(&conn)
    };
    if open || has_permission(auth, permission) {
        return Ok(());
    }
    match auth.current() {
        Some(session) => Err(format!(
            "Permission denied: {} cannot {}",
            session.role.as_str(),
            permission.replace('_', " ")
        )),
        None => Err("Login required".into()),
    }
}

fn validate_pin(pin: &str, label: &str) -> Result<(), String> {
    if pin.len() < 4 || pin.len() > 12 {
        return Err(format!("{label} must be 4 to 12 digits"));
    }
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("{label} must contain only digits"));
    }
    Ok(())
}

/// Hash and store `adminPin` and/or `staffPin`.
///
/// Once an admin PIN exists, changing PINs needs an admin session.
pub fn setup_pin(arg0: Option<Value>, db: &db::DbState, auth: &AuthState) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing PIN setup payload")?;
    let admin_pin = payload.get("adminPin").and_then(Value::as_str);
    let staff_pin = payload.get("staffPin").and_then(Value::as_str);
    if admin_pin.is_none() && staff_pin.is_none() {
        return Err("At least one PIN (adminPin or staffPin) is required".into());
    }
    require_permission(db, auth, PERM_SYSTEM_SETTINGS)?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    if admin_pin.is_none() && !pins_configured(&conn) {
        return Err("Set an admin PIN first".into());
    }
    if let (Some(admin), Some(staff)) = (admin_pin, staff_pin) {
        if admin == staff {
            return Err("Admin and staff PINs must differ".into());
        }
    }

    for (pin, key, label) in [
        (admin_pin, ADMIN_PIN_KEY, "Admin PIN"),
        (staff_pin, STAFF_PIN_KEY, "Staff PIN"),
    ] {
        let Some(pin) = pin else { continue };
        validate_pin(pin, label)?;
        let hash = bcrypt::hash(pin, bcrypt::DEFAULT_COST)
            .map_err(|e| format!("Failed to hash {label}: {e}"))?;
        db::set_setting(&conn, STAFF_CATEGORY, key, &hash)?;
        info!(key, "PIN updated");
    }

    Ok(serde_json::json!({ "success": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lockout_attempts(db_state: &db::DbState) -> u32 {
        let conn = db_state.conn.lock().expect("db lock");
        db::get_setting(&conn, STAFF_CATEGORY, LOCKOUT_ATTEMPTS_KEY)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
    }

    fn seed_pins(db_state: &db::DbState) {
        let conn = db_state.conn.lock().expect("db lock");
        let admin = bcrypt::hash("1234", 4).expect("hash admin pin");
        let staff = bcrypt::hash("5678", 4).expect("hash staff pin");
        db::set_setting(&conn, STAFF_CATEGORY, ADMIN_PIN_KEY, &admin).expect("store admin");
        db::set_setting(&conn, STAFF_CATEGORY, STAFF_PIN_KEY, &staff).expect("store staff");
    }

    fn pin(value: &str) -> Option<Value> {
        Some(serde_json::json!({ "pin": value }))
    }

    #[test]
    fn lockout_persists_across_auth_state_restart() {
        let db_state = db::test_state();
        seed_pins(&db_state);
        let auth_before_restart = AuthState::new();

        for _ in 0..MAX_FAILED_ATTEMPTS {
            let err = login(pin("9999"), &db_state, &auth_before_restart)
                .expect_err("invalid login should fail");
            assert_eq!(err, "Invalid PIN");
        }
        assert_eq!(lockout_attempts(&db_state), MAX_FAILED_ATTEMPTS);

        let auth_after_restart = AuthState::new();
        let err = login(pin("1234"), &db_state, &auth_after_restart)
            .expect_err("lockout should block even the right PIN");
        assert!(err.contains("Too many failed attempts"), "unexpected: {err}");
        assert_eq!(lockout_attempts(&db_state), MAX_FAILED_ATTEMPTS);
    }

    #[test]
    fn lockout_expires_after_five_minutes() {
        let db_state = db::test_state();
        seed_pins(&db_state);
        {
            let conn = db_state.conn.lock().expect("db lock");
            let past = Utc::now() - Duration::minutes(LOCKOUT_MINUTES) - Duration::seconds(5);
            persist_lockout(
                &conn,
                &LockoutEntry {
                    attempts: MAX_FAILED_ATTEMPTS,
                    last_attempt: past,
                },
            )
            .expect("persist lockout");
        }

        let auth = AuthState::new();
        let err = login(pin("0000"), &db_state, &auth).expect_err("wrong PIN");
        assert_eq!(err, "Invalid PIN");
        assert_eq!(lockout_attempts(&db_state), 1);
        assert!(login(pin("1234"), &db_state, &auth).is_ok());
    }

    #[test]
    fn successful_login_resets_persisted_lockout() {
        let db_state = db::test_state();
        seed_pins(&db_state);
        let auth = AuthState::new();
        for _ in 0..2 {
            assert!(login(pin("9999"), &db_state, &auth).is_err());
        }
        assert_eq!(lockout_attempts(&db_state), 2);

        let result = login(pin("1234"), &db_state, &AuthState::new()).expect("valid login");
        assert_eq!(result["success"], Value::Bool(true));
        assert_eq!(result["session"]["role"], "admin");
        assert_eq!(lockout_attempts(&db_state), 0);
    }

    #[test]
    fn staff_cannot_change_settings_or_delete_master_data() {
        let db_state = db::test_state();
        seed_pins(&db_state);
        let auth = AuthState::new();
        login(Some(Value::String("5678".into())), &db_state, &auth).expect("staff login");

        assert!(has_permission(&auth, PERM_MANAGE_BOOKINGS));
        assert!(require_permission(&db_state, &auth, PERM_MANAGE_MASTER_DATA).is_ok());
        let err = require_permission(&db_state, &auth, PERM_SYSTEM_SETTINGS).unwrap_err();
        assert!(err.contains("Permission denied"));
        assert!(require_permission(&db_state, &auth, PERM_DELETE_MASTER_DATA).is_err());

        logout(&auth);
        assert_eq!(get_session_json(&auth), Value::Null);
        assert_eq!(
            require_permission(&db_state, &auth, PERM_MANAGE_BOOKINGS).unwrap_err(),
            "Login required"
        );
    }

    #[test]
    fn open_until_admin_pin_is_set() {
        let db_state = db::test_state();
        let auth = AuthState::new();
        assert!(require_permission(&db_state, &auth, PERM_SYSTEM_SETTINGS).is_ok());

        assert!(setup_pin(
            Some(serde_json::json!({ "staffPin": "5678" })),
            &db_state,
            &auth
        )
        .is_err());
        assert!(setup_pin(
            Some(serde_json::json!({ "adminPin": "12a4" })),
            &db_state,
            &auth
        )
        .is_err());

        // DEFAULT_COST hashing is slow but this runs once.
        setup_pin(
            Some(serde_json::json!({ "adminPin": "2468", "staffPin": "1357" })),
            &db_state,
            &auth,
        )
        .expect("initial setup");
        assert!(require_permission(&db_state, &auth, PERM_VIEW_REPORTS).is_err());
        assert!(setup_pin(
            Some(serde_json::json!({ "staffPin": "9753" })),
            &db_state,
            &auth
        )
        .is_err());
    }
}

//! Cloud credentials kept in the OS credential store.
//!
//! Windows uses the Credential Manager, macOS the Keychain and Linux the
//! Secret Service API, all through the `keyring` crate. Nothing here touches
//! SQLite, so a copied database never carries the API key.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::api::{self, CloudEndpoint};

const SERVICE_NAME: &str = "fleetdesk";

const KEY_CLOUD_URL: &str = "cloud_url";
const KEY_API_KEY: &str = "api_key";
const KEY_WORKSPACE_ID: &str = "workspace_id";

const ALL_KEYS: &[&str] = &[KEY_CLOUD_URL, KEY_API_KEY, KEY_WORKSPACE_ID];

/// Read one credential. `None` when missing or the platform store fails.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())
}

/// Missing entries count as deleted.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

fn non_empty(key: &str) -> Option<String> {
    get_credential(key).filter(|v| !v.trim().is_empty())
}

/// Cloud sync is possible once URL, key and workspace are all stored.
pub fn is_configured() -> bool {
    load_endpoint().is_some()
}

pub fn load_endpoint() -> Option<CloudEndpoint> {
    Some(CloudEndpoint {
        base_url: non_empty(KEY_CLOUD_URL)?,
        api_key: Zeroizing::new(non_empty(KEY_API_KEY)?),
        workspace_id: non_empty(KEY_WORKSPACE_ID)?,
    })
}

/// Show only the last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{tail}", "*".repeat(chars.len() - 4))
}

/// Stored cloud config with the API key masked.
pub fn get_full_config() -> Value {
    let api_key = get_credential(KEY_API_KEY).map(Zeroizing::new);
    serde_json::json!({
        "cloudUrl": get_credential(KEY_CLOUD_URL),
        "workspaceId": get_credential(KEY_WORKSPACE_ID),
        "apiKey": api_key.as_deref().map(|k| mask_secret(k)),
        "configured": is_configured(),
    })
}

fn payload_str(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Store cloud credentials. URL and workspace are required on first setup;
/// an omitted API key keeps the stored one.
pub fn update_cloud_credentials(payload: &Value) -> Result<Value, String> {
    let url = payload_str(payload, &["cloudUrl", "cloud_url", "url"])
        .map(|u| api::normalize_base_url(&u))
        .or_else(|| get_credential(KEY_CLOUD_URL))
        .ok_or("Missing required field: cloudUrl")?;
    let workspace_id = payload_str(payload, &["workspaceId", "workspace_id"])
        .or_else(|| get_credential(KEY_WORKSPACE_ID))
        .ok_or("Missing required field: workspaceId")?;
    let api_key = payload_str(payload, &["apiKey", "api_key"]).map(Zeroizing::new);
    if api_key.is_none() && get_credential(KEY_API_KEY).is_none() {
        return Err("Missing required field: apiKey".into());
    }

    set_credential(KEY_CLOUD_URL, &url)?;
    set_credential(KEY_WORKSPACE_ID, &workspace_id)?;
    if let Some(key) = api_key.as_deref() {
        set_credential(KEY_API_KEY, key)?;
    }

    info!(cloud_url = %url, workspace_id = %workspace_id, "cloud credentials updated");
    Ok(serde_json::json!({ "success": true }))
}

/// Delete every stored credential.
pub fn factory_reset() -> Result<Value, String> {
    info!("performing factory reset, deleting cloud credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("abcdefgh"), "****efgh");
        assert_eq!(mask_secret("abc"), "***");
        assert_eq!(mask_secret(""), "");
    }

    #[test]
    fn test_payload_str_aliases() {
        let payload = serde_json::json!({ "cloud_url": " https://x ", "workspaceId": "" });
        assert_eq!(
            payload_str(&payload, &["cloudUrl", "cloud_url"]).as_deref(),
            Some("https://x")
        );
        assert_eq!(payload_str(&payload, &["workspaceId"]), None);
    }
}

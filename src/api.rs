//! Cloud API client.
//!
//! Thin authenticated HTTP layer over the collection endpoints used by the
//! sync engine, plus a lightweight connectivity probe.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::store::Collection;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection parameters for one cloud workspace.
#[derive(Clone)]
pub struct CloudEndpoint {
    pub base_url: String,
    pub api_key: zeroize::Zeroizing<String>,
    pub workspace_id: String,
}

impl std::fmt::Debug for CloudEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudEndpoint")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .field("workspace_id", &self.workspace_id)
            .finish()
    }
}

/// Normalise the cloud URL: add a scheme (http only for localhost), drop
/// trailing slashes and a trailing `/api` segment.
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }
    url
}

fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach cloud at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid cloud URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Workspace access denied".to_string(),
        404 => "Cloud endpoint not found".to_string(),
        409 => "Cloud rejected the batch as conflicting".to_string(),
        s if s >= 500 => format!("Cloud server error (HTTP {s})"),
        s => format!("Unexpected response from cloud (HTTP {s})"),
    }
}

/// True for errors that retrying cannot fix.
pub fn is_auth_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("(http 401)")
        || lower.contains("(http 403)")
        || lower.contains("api key is invalid")
        || lower.contains("workspace access denied")
}

/// True for errors caused by the network rather than the server.
pub fn is_network_failure(message: &str) -> bool {
    message.starts_with("Cannot reach cloud") || message.contains("timed out")
}

#[derive(serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn client(timeout: Duration) -> Result<Client, String> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {e}"))
}

/// Probe `{base}/api/health`.
pub async fn test_connectivity(endpoint: &CloudEndpoint) -> ConnectivityResult {
    let base = normalize_base_url(&endpoint.base_url);
    let client = match client(CONNECTIVITY_TIMEOUT) {
        Ok(c) => c,
        Err(e) => {
            return ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(e),
            }
        }
    };

    let start = Instant::now();
    let resp = match client
        .get(format!("{base}/api/health"))
        .bearer_auth(endpoint.api_key.as_str())
        .header("X-Workspace-Id", &endpoint.workspace_id)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            return ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(friendly_error(&base, &e)),
            }
        }
    };

    let latency = start.elapsed().as_millis() as u64;
    let status = resp.status();
    if status.is_success() {
        info!(latency_ms = latency, "connectivity test passed");
        ConnectivityResult {
            success: true,
            latency_ms: Some(latency),
            error: None,
        }
    } else {
        ConnectivityResult {
            success: false,
            latency_ms: Some(latency),
            error: Some(format!("{} (HTTP {})", status_error(status), status.as_u16())),
        }
    }
}

/// Build an error string from a non-2xx response, keeping server details.
async fn error_detail(resp: reqwest::Response) -> String {
    let status = resp.status();
    let body_text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body_text)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| status_error(status));
    let body = body_text.trim();
    if !body.is_empty() && body != message && !body.starts_with('{') {
        format!("{message} (HTTP {}): {body}", status.as_u16())
    } else {
        format!("{message} (HTTP {})", status.as_u16())
    }
}

async fn json_body(resp: reqwest::Response) -> Result<Value, String> {
    let text = resp.text().await.unwrap_or_default();
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| format!("Invalid JSON from cloud: {e}"))
}

/// One document in a push batch.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushItem {
    pub id: String,
    pub operation: String,
    pub idempotency_key: String,
    pub data: Value,
}

/// Per-record rejections returned by the cloud. Anything not listed is
/// considered accepted.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOutcome {
    #[serde(default)]
    pub rejected: Vec<Rejection>,
}

#[derive(Debug, Deserialize)]
pub struct Rejection {
    pub id: String,
    #[serde(default)]
    pub error: String,
}

/// POST a batch to `{base}/api/collections/{collection}/sync`.
pub async fn push_batch(
    endpoint: &CloudEndpoint,
    collection: Collection,
    items: &[PushItem],
) -> Result<PushOutcome, String> {
    let base = normalize_base_url(&endpoint.base_url);
    let url = format!("{base}/api/collections/{collection}/sync");
    let resp = client(DEFAULT_TIMEOUT)?
        .post(&url)
        .bearer_auth(endpoint.api_key.as_str())
        .header("X-Workspace-Id", &endpoint.workspace_id)
        .json(&serde_json::json!({ "records": items }))
        .send()
        .await
        .map_err(|e| friendly_error(&base, &e))?;

    if !resp.status().is_success() {
        return Err(error_detail(resp).await);
    }
    let body = json_body(resp).await?;
    debug!(collection = %collection, count = items.len(), "batch pushed");
    if body.is_null() {
        return Ok(PushOutcome::default());
    }
    serde_json::from_value(body).map_err(|e| format!("Invalid push response: {e}"))
}

/// Records changed on the cloud since a cursor.
#[derive(Debug, Default)]
pub struct PullPage {
    pub records: Vec<Value>,
}

/// Accepts either a bare array or `{"records": [...]}`.
fn parse_pull_body(body: Value) -> Result<PullPage, String> {
    let records = match body {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("records").or_else(|| map.remove("data")) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => return Err(format!("Unexpected records payload: {other}")),
        },
        other => return Err(format!("Unexpected pull response: {other}")),
    };
    Ok(PullPage { records })
}

/// GET `{base}/api/collections/{collection}?since={cursor}`.
pub async fn pull_since(
    endpoint: &CloudEndpoint,
    collection: Collection,
    since: Option<&str>,
) -> Result<PullPage, String> {
    let base = normalize_base_url(&endpoint.base_url);
    let url = format!("{base}/api/collections/{collection}");
    let mut req = client(DEFAULT_TIMEOUT)?
        .get(&url)
        .bearer_auth(endpoint.api_key.as_str())
        .header("X-Workspace-Id", &endpoint.workspace_id);
    if let Some(cursor) = since.filter(|c| !c.is_empty()) {
        req = req.query(&[("since", cursor)]);
    }
    let resp = req.send().await.map_err(|e| friendly_error(&base, &e))?;
    if !resp.status().is_success() {
        return Err(error_detail(resp).await);
    }
    parse_pull_body(json_body(resp).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("cloud.example.com/"), "https://cloud.example.com");
        assert_eq!(normalize_base_url("https://cloud.example.com/api/"), "https://cloud.example.com");
        assert_eq!(normalize_base_url("localhost:8080"), "http://localhost:8080");
        assert_eq!(normalize_base_url("  "), "");
    }

    #[test]
    fn test_auth_failure_detection() {
        assert!(is_auth_failure("API key is invalid or expired (HTTP 401)"));
        assert!(is_auth_failure("Forbidden (HTTP 403)"));
        assert!(!is_auth_failure("Cloud server error (HTTP 502)"));
        assert!(is_network_failure("Cannot reach cloud at https://x"));
    }

    #[test]
    fn test_pull_body_shapes() {
        let page = parse_pull_body(json!([{"id": "a"}])).unwrap();
        assert_eq!(page.records.len(), 1);
        let page = parse_pull_body(json!({"records": [{"id": "a"}, {"id": "b"}]})).unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(parse_pull_body(Value::Null).unwrap().records.is_empty());
        assert!(parse_pull_body(json!("nope")).is_err());
    }

    #[test]
    fn test_push_outcome_defaults() {
        let outcome: PushOutcome =
            serde_json::from_value(json!({"rejected": [{"id": "veh-1", "error": "bad"}]})).unwrap();
        assert_eq!(outcome.rejected[0].id, "veh-1");
        let empty: PushOutcome = serde_json::from_value(json!({"ok": true})).unwrap();
        assert!(empty.rejected.is_empty());
    }

    #[test]
    fn test_endpoint_debug_masks_key() {
        let endpoint = CloudEndpoint {
            base_url: "https://x".into(),
            api_key: zeroize::Zeroizing::new("secret".into()),
            workspace_id: "ws".into(),
        };
        assert!(!format!("{endpoint:?}").contains("secret"));
    }
}

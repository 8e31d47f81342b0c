//! Remote dashboard client.
//!
//! `RemoteBackend` is the seam between the sync engine and the remote source
//! of truth; `HttpBackend` is the production implementation over reqwest.
//! A business rejection (the server answered and said no) comes back as
//! `Ok(RemoteOutcome { success: false, .. })`; a transport failure comes back
//! as `Err(SyncError::Transport)` so the drain can tell the two apart.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::{RemoteConfig, SyncScope};
use crate::error::SyncError;
use crate::outbox::{
    CheckinPayload, CheckoutPayload, QuantityAdjustPayload, StockCountRecordPayload,
};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One catalog item as the dashboard reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    pub name: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub min_quantity: Option<i64>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub folder_name: Option<String>,
}

/// One page of the scoped catalog.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogPage {
    #[serde(default)]
    pub items: Vec<RemoteItem>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Result of a remote apply: `success == false` is a business rejection with
/// the server's reason attached.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl RemoteOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
        }
    }

    /// Collapse into a `Result`, mapping a rejection to `RemoteRejection`.
    pub fn into_result(self) -> Result<(), SyncError> {
        if self.success {
            Ok(())
        } else {
            Err(SyncError::RemoteRejection(
                self.error.unwrap_or_else(|| "rejected by server".to_string()),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// The remote source of truth, as the sync engine sees it.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Cheap reachability probe. Must not hang indefinitely on its own, but
    /// callers still bound it with a timeout.
    async fn liveness_check(&self) -> bool;

    /// Fetch one page of the scoped catalog.
    async fn fetch_catalog_page(
        &self,
        scope: &SyncScope,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<CatalogPage, SyncError>;

    async fn apply_quantity_adjustment(
        &self,
        scope: &SyncScope,
        payload: &QuantityAdjustPayload,
    ) -> Result<RemoteOutcome, SyncError>;

    async fn apply_checkout(
        &self,
        scope: &SyncScope,
        payload: &CheckoutPayload,
    ) -> Result<RemoteOutcome, SyncError>;

    async fn apply_checkin(
        &self,
        scope: &SyncScope,
        payload: &CheckinPayload,
    ) -> Result<RemoteOutcome, SyncError>;

    async fn record_stock_count(
        &self,
        scope: &SyncScope,
        payload: &StockCountRecordPayload,
    ) -> Result<RemoteOutcome, SyncError>;
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach dashboard at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid dashboard URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Device not authorized".to_string(),
        404 => "Dashboard endpoint not found".to_string(),
        s if s >= 500 => format!("Dashboard server error (HTTP {s})"),
        s => format!("Unexpected response from dashboard (HTTP {s})"),
    }
}

/// Pull the server's failure reason out of an error body, falling back to
/// the status-derived message.
fn extract_failure_reason(status: StatusCode, body_text: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body_text) {
        if let Some(message) = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
        {
            if let Some(details) = json.get("details").or_else(|| json.get("errors")) {
                return format!("{message} (HTTP {}): {details}", status.as_u16());
            }
            return format!("{message} (HTTP {})", status.as_u16());
        }
    }
    if !body_text.trim().is_empty() {
        return format!("{}: {}", status_error(status), body_text.trim());
    }
    status_error(status)
}

// ---------------------------------------------------------------------------
// Production implementation
// ---------------------------------------------------------------------------

/// Authenticated HTTP client against the Fieldstock dashboard API.
pub struct HttpBackend {
    client: Client,
    liveness_client: Client,
    base_url: String,
    api_key: String,
}

impl HttpBackend {
    /// Build a backend from a remote config. `liveness_timeout` bounds the
    /// health probe independently of the (longer) request timeout.
    pub fn new(config: &RemoteConfig, liveness_timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Transport(format!("create HTTP client: {e}")))?;
        let liveness_client = Client::builder()
            .timeout(liveness_timeout)
            .build()
            .map_err(|e| SyncError::Transport(format!("create HTTP client: {e}")))?;
        Ok(Self {
            client,
            liveness_client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// POST a mutation and interpret the response as a `RemoteOutcome`.
    ///
    /// 4xx responses are business rejections (the server understood and said
    /// no); 5xx and connection-level failures are transport errors the drain
    /// will retry.
    async fn post_outcome<B: Serialize + Sync>(
        &self,
        scope: &SyncScope,
        path: &str,
        body: &B,
    ) -> Result<RemoteOutcome, SyncError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("X-Sync-API-Key", &self.api_key)
            .header("X-Tenant-Id", &scope.tenant_id)
            .header("X-User-Id", &scope.user_id)
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::Transport(friendly_error(&self.base_url, &e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            let reason = extract_failure_reason(status, &body_text);
            if status.is_client_error() {
                return Ok(RemoteOutcome::rejected(reason));
            }
            return Err(SyncError::Transport(reason));
        }

        // Empty 204-style responses count as success.
        let body_text = resp.text().await.unwrap_or_default();
        if body_text.is_empty() {
            return Ok(RemoteOutcome::ok());
        }
        serde_json::from_str(&body_text)
            .map_err(|e| SyncError::Transport(format!("invalid JSON from dashboard: {e}")))
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn liveness_check(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        match self
            .liveness_client
            .head(&url)
            .header("X-Sync-API-Key", &self.api_key)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "liveness probe failed");
                false
            }
        }
    }

    async fn fetch_catalog_page(
        &self,
        scope: &SyncScope,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<CatalogPage, SyncError> {
        let url = format!("{}/api/field/catalog", self.base_url);
        let mut req = self
            .client
            .get(&url)
            .header("X-Sync-API-Key", &self.api_key)
            .header("X-Tenant-Id", &scope.tenant_id)
            .header("X-User-Id", &scope.user_id)
            .query(&[("limit", limit.to_string())]);
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::Transport(friendly_error(&self.base_url, &e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(SyncError::Transport(extract_failure_reason(
                status, &body_text,
            )));
        }

        resp.json::<CatalogPage>()
            .await
            .map_err(|e| SyncError::Transport(format!("invalid catalog page: {e}")))
    }

    async fn apply_quantity_adjustment(
        &self,
        scope: &SyncScope,
        payload: &QuantityAdjustPayload,
    ) -> Result<RemoteOutcome, SyncError> {
        self.post_outcome(scope, "/api/field/adjustments", payload)
            .await
    }

    async fn apply_checkout(
        &self,
        scope: &SyncScope,
        payload: &CheckoutPayload,
    ) -> Result<RemoteOutcome, SyncError> {
        self.post_outcome(scope, "/api/field/checkouts", payload)
            .await
    }

    async fn apply_checkin(
        &self,
        scope: &SyncScope,
        payload: &CheckinPayload,
    ) -> Result<RemoteOutcome, SyncError> {
        self.post_outcome(scope, "/api/field/checkins", payload)
            .await
    }

    async fn record_stock_count(
        &self,
        scope: &SyncScope,
        payload: &StockCountRecordPayload,
    ) -> Result<RemoteOutcome, SyncError> {
        self.post_outcome(scope, "/api/field/stock-counts/record", payload)
            .await
    }
}

// ===========================================================================
// Test support
// ===========================================================================


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_messages() {
        assert_eq!(
            status_error(StatusCode::UNAUTHORIZED),
            "API key is invalid or expired"
        );
        assert_eq!(status_error(StatusCode::FORBIDDEN), "Device not authorized");
        assert_eq!(
            status_error(StatusCode::SERVICE_UNAVAILABLE),
            "Dashboard server error (HTTP 503)"
        );
    }

    #[test]
    fn test_extract_failure_reason_prefers_json_error() {
        let reason = extract_failure_reason(
            StatusCode::CONFLICT,
            r#"{"error":"Conflict detected: item was updated elsewhere"}"#,
        );
        assert_eq!(
            reason,
            "Conflict detected: item was updated elsewhere (HTTP 409)"
        );
    }

    #[test]
    fn test_extract_failure_reason_includes_details() {
        let reason = extract_failure_reason(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"message":"Validation failed","details":["quantity must be >= 0"]}"#,
        );
        assert!(reason.starts_with("Validation failed (HTTP 422):"));
        assert!(reason.contains("quantity must be >= 0"));
    }

    #[test]
    fn test_extract_failure_reason_falls_back_to_status() {
        let reason = extract_failure_reason(StatusCode::BAD_GATEWAY, "");
        assert_eq!(reason, "Dashboard server error (HTTP 502)");

        let reason = extract_failure_reason(StatusCode::BAD_GATEWAY, "upstream reset");
        assert_eq!(reason, "Dashboard server error (HTTP 502): upstream reset");
    }

    #[test]
    fn test_outcome_into_result() {
        assert!(RemoteOutcome::ok().into_result().is_ok());
        let err = RemoteOutcome::rejected("count is closed")
            .into_result()
            .unwrap_err();
        assert!(matches!(err, SyncError::RemoteRejection(msg) if msg == "count is closed"));
    }
}

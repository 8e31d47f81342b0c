//! Engine configuration: remote endpoint, tenant scope, and timing knobs.

use std::time::Duration;

/// Tenant + user pair that scopes every row in the durable store. On a
/// shared device this is what keeps one account's queued work from leaking
/// into another's.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncScope {
    pub tenant_id: String,
    pub user_id: String,
}

impl SyncScope {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Remote dashboard endpoint and credentials.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: String,
}

impl RemoteConfig {
    /// Build a config with a normalised base URL and trimmed API key.
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
        }
    }
}

/// Normalise the dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // Strip trailing slashes again (in case "/api/" was present)
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Timing knobs for the background machinery. Defaults match production.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between liveness probes while at least one subscriber exists.
    pub heartbeat_interval: Duration,
    /// Upper bound on a single liveness probe; expiry counts as offline.
    pub liveness_timeout: Duration,
    /// Age beyond which the item cache must be refreshed before being trusted.
    pub cache_ttl: Duration,
    /// Interval between background catalog refreshes while online.
    pub cache_sync_interval: Duration,
    /// Delay before the first catalog refresh after engine start, so startup
    /// work does not compete with first paint.
    pub startup_sync_delay: Duration,
    /// Coalescing window for drains triggered by rapid local mutations.
    pub drain_debounce: Duration,
    /// Settle delay between an online edge and the drain it triggers.
    pub reconnect_settle: Duration,
    /// Offline stretch beyond which regaining connectivity also refreshes
    /// the item cache.
    pub cache_refresh_after_offline: Duration,
    /// Minimum spacing between stock-count drain attempts.
    pub count_sync_min_spacing: Duration,
    /// Page size for catalog fetches.
    pub catalog_page_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(5 * 60),
            cache_sync_interval: Duration::from_secs(5 * 60),
            startup_sync_delay: Duration::from_secs(3),
            drain_debounce: Duration::from_millis(500),
            reconnect_settle: Duration::from_secs(2),
            cache_refresh_after_offline: Duration::from_secs(60),
            count_sync_min_spacing: Duration::from_secs(5),
            catalog_page_size: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_adds_https_scheme() {
        assert_eq!(
            normalize_base_url("dashboard.fieldstock.app"),
            "https://dashboard.fieldstock.app"
        );
    }

    #[test]
    fn test_normalize_uses_http_for_localhost() {
        assert_eq!(normalize_base_url("localhost:3000"), "http://localhost:3000");
        assert_eq!(
            normalize_base_url("127.0.0.1:3000/"),
            "http://127.0.0.1:3000"
        );
    }

    #[test]
    fn test_normalize_strips_trailing_api_segment() {
        assert_eq!(
            normalize_base_url("https://dashboard.fieldstock.app/api/"),
            "https://dashboard.fieldstock.app"
        );
        assert_eq!(
            normalize_base_url("https://dashboard.fieldstock.app///"),
            "https://dashboard.fieldstock.app"
        );
    }

    #[test]
    fn test_remote_config_trims_api_key() {
        let cfg = RemoteConfig::new("dashboard.fieldstock.app/api", "  fsk_123  ");
        assert_eq!(cfg.base_url, "https://dashboard.fieldstock.app");
        assert_eq!(cfg.api_key, "fsk_123");
    }
}

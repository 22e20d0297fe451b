// =============================================================================
// Credential Service — OAuth bearer token acquisition and caching
// =============================================================================
//
// Caches a mode-keyed token (paper vs real) in the Store. Concurrent callers
// during refresh serialize on a single async mutex so that only one refresh
// request is ever in flight; everyone else waits for that result instead of
// firing a duplicate request at the broker.
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::store::Store;

const EXPIRY_SAFETY_MARGIN_SECS: i64 = 10 * 60;
const DEFAULT_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedToken {
    token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
    #[serde(default)]
    expires_dt: Option<String>,
}

pub struct CredentialService {
    store: Store,
    http: reqwest::Client,
    base_url: String,
    app_key: String,
    secret_key: String,
    cache_key: String,
    refresh_lock: Mutex<()>,
}

impl CredentialService {
    pub fn new(
        store: Store,
        http: reqwest::Client,
        base_url: String,
        app_key: String,
        secret_key: String,
        mock_trade: bool,
    ) -> Arc<Self> {
        let cache_key = if mock_trade {
            "token_mock".to_string()
        } else {
            "token_real".to_string()
        };
        Arc::new(Self {
            store,
            http,
            base_url,
            app_key,
            secret_key,
            cache_key,
            refresh_lock: Mutex::new(()),
        })
    }

    pub async fn get_token(&self, force_refresh: bool) -> anyhow::Result<String> {
        if !force_refresh {
            if let Some(cached) = self.load_cached().await {
                if chrono::Utc::now()
                    < cached.expires_at - chrono::Duration::seconds(EXPIRY_SAFETY_MARGIN_SECS)
                {
                    return Ok(cached.token);
                }
            }
        }

        // Serialize refresh: whoever gets the lock first does the network
        // call; everyone else re-checks the cache the first caller just
        // filled in, rather than issuing a second request.
        let _guard = self.refresh_lock.lock().await;

        if !force_refresh {
            if let Some(cached) = self.load_cached().await {
                if chrono::Utc::now()
                    < cached.expires_at - chrono::Duration::seconds(EXPIRY_SAFETY_MARGIN_SECS)
                {
                    return Ok(cached.token);
                }
            }
        }

        self.fetch_and_cache().await
    }

    pub async fn clear_cache(&self) {
        self.store.set_kv(&self.cache_key, &serde_json::Value::Null).await;
    }

    async fn load_cached(&self) -> Option<CachedToken> {
        self.store.get_kv(&self.cache_key).await
    }

    async fn fetch_and_cache(&self) -> anyhow::Result<String> {
        debug!(url = %self.base_url, "credential: requesting new token");

        let resp = self
            .http
            .post(format!("{}/oauth2/token", self.base_url))
            .json(&serde_json::json!({
                "grant_type": "client_credentials",
                "appkey": self.app_key,
                "secretkey": self.secret_key,
            }))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;

        let body: TokenResponse = resp.json().await?;

        let token = body
            .access_token
            .or(body.token)
            .ok_or_else(|| anyhow::anyhow!("token response had neither access_token nor token"))?;

        let expires_at = resolve_expiry(&body);

        let cached = CachedToken {
            token: token.clone(),
            expires_at,
        };
        self.store.set_kv(&self.cache_key, &cached).await;

        Ok(token)
    }
}

/// Resolve the token expiry from either `expires_in` (seconds, int or
/// numeric string) or `expires_dt` (`YYYYMMDDHHMMSS`), falling back to a
/// conservative 24h TTL when neither field parses.
fn resolve_expiry(body: &TokenResponse) -> chrono::DateTime<chrono::Utc> {
    if let Some(v) = &body.expires_in {
        let secs = match v {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.parse::<i64>().ok(),
            _ => None,
        };
        if let Some(secs) = secs {
            return chrono::Utc::now() + chrono::Duration::seconds(secs);
        }
    }

    if let Some(dt) = &body.expires_dt {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(dt, "%Y%m%d%H%M%S") {
            return chrono::DateTime::from_naive_utc_and_offset(naive, chrono::Utc);
        }
        warn!(expires_dt = %dt, "credential: unparsable expires_dt, using default ttl");
    }

    chrono::Utc::now() + chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_expiry_prefers_expires_in_seconds() {
        let body = TokenResponse {
            access_token: Some("tok".to_string()),
            token: None,
            expires_in: Some(serde_json::json!(3600)),
            expires_dt: None,
        };
        let before = chrono::Utc::now() + chrono::Duration::seconds(3500);
        let expiry = resolve_expiry(&body);
        assert!(expiry > before);
    }

    #[test]
    fn resolve_expiry_parses_expires_dt() {
        let body = TokenResponse {
            access_token: Some("tok".to_string()),
            token: None,
            expires_in: None,
            expires_dt: Some("20990101000000".to_string()),
        };
        let expiry = resolve_expiry(&body);
        assert_eq!(expiry.format("%Y").to_string(), "2099");
    }

    #[test]
    fn resolve_expiry_falls_back_to_default_ttl() {
        let body = TokenResponse {
            access_token: Some("tok".to_string()),
            token: None,
            expires_in: None,
            expires_dt: None,
        };
        let expiry = resolve_expiry(&body);
        let expected = chrono::Utc::now() + chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECS);
        assert!((expiry - expected).num_seconds().abs() < 5);
    }

    #[tokio::test]
    async fn cached_token_roundtrips_through_store() {
        let store = Store::open_in_memory().unwrap();
        let cached = CachedToken {
            token: "abc".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        };
        store.set_kv("token_mock", &cached).await;
        let back: CachedToken = store.get_kv("token_mock").await.unwrap();
        assert_eq!(back.token, "abc");
    }
}

// =============================================================================
// REST Client — authenticated broker request issuer
// =============================================================================
//
// Every outbound call funnels through `call_api`, which: waits on the shared
// rate limiter, routes to an endpoint path by TR-ID prefix, sets the
// standard header set, and applies the 429 / 401-403 retry ladder. A single
// `tokio::sync::Mutex` around the whole call serializes issuance the way the
// Python source's module-level `API_LOCK` does.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, warn};

use crate::credential::CredentialService;
use crate::rest::rate_limit::RateLimiter;

const MAX_PAGES_DEFAULT: u32 = 2;
const PAGE_SLEEP_MS: u64 = 300;
const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("rate limited after retry")]
    RateLimited,
    #[error("authentication failed after retries")]
    Unauthenticated,
    #[error("broker returned status {0}")]
    BadStatus(u16),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// TR-ID prefix routing table. Matches the Python `_call_api` dispatch.
fn endpoint_for(tr_id: &str) -> &'static str {
    if tr_id.starts_with("kt10") || tr_id.starts_with("kt5000") {
        "/api/dostk/order"
    } else if tr_id.starts_with("kt00") || tr_id == "ka10075" {
        "/api/dostk/acnt"
    } else if tr_id == "ka10080" {
        "/api/dostk/chart"
    } else if tr_id == "ka10001" {
        "/api/dostk/stkinfo"
    } else if tr_id == "ka10004" {
        "/api/dostk/mrkcond"
    } else if tr_id == "ka10074" {
        "/api/dostk/acnt"
    } else {
        "/api/dostk/stkinfo"
    }
}

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    credential: Arc<CredentialService>,
    limiter: RateLimiter,
    mock_trade: bool,
    call_lock: AsyncMutex<()>,
}

impl RestClient {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        credential: Arc<CredentialService>,
        mock_trade: bool,
    ) -> Self {
        Self {
            http,
            base_url,
            credential,
            limiter: RateLimiter::new(),
            mock_trade,
            call_lock: AsyncMutex::new(()),
        }
    }

    /// Issue a single TR call with the full retry ladder: 429 backs off and
    /// retries once; 401/403 force-refreshes the token and retries up to
    /// twice; any other non-200 is logged and returned as a failure.
    pub async fn call_api(&self, tr_id: &str, body: Value) -> Result<Value, RestError> {
        let _serialize = self.call_lock.lock().await;

        let mut auth_retries = 0u8;
        let mut rate_retried = false;

        loop {
            self.limiter.wait().await;

            let token = self
                .credential
                .get_token(false)
                .await
                .map_err(|_| RestError::Unauthenticated)?;

            let path = endpoint_for(tr_id);
            let resp = self
                .http
                .post(format!("{}{}", self.base_url, path))
                .header("Content-Type", "application/json;charset=UTF-8")
                .header("authorization", format!("Bearer {token}"))
                .header("api-id", tr_id)
                .header("cont-yn", "N")
                .header("next-key", "")
                .json(&body)
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .send()
                .await?;

            let status = resp.status();

            if status.is_success() {
                self.limiter.report_success();
                return resp.json::<Value>().await.map_err(RestError::Transport);
            }

            if status.as_u16() == 429 {
                self.limiter.report_429();
                if rate_retried {
                    warn!(tr_id, "rest: rate limited twice, giving up");
                    return Err(RestError::RateLimited);
                }
                rate_retried = true;
                let backoff = 2.0 * (auth_retries as f64 + 1.0);
                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                continue;
            }

            if status.as_u16() == 401 || status.as_u16() == 403 {
                self.credential.clear_cache().await;
                auth_retries += 1;
                if auth_retries > 2 {
                    error!(tr_id, "rest: unauthenticated after retries");
                    return Err(RestError::Unauthenticated);
                }
                continue;
            }

            error!(tr_id, status = status.as_u16(), "rest: non-200 response");
            return Err(RestError::BadStatus(status.as_u16()));
        }
    }

    /// Paginated minute-chart retrieval. Reads `next-key`/`cont-yn` response
    /// headers case-insensitively (a `reqwest::header::HeaderMap` lookup is
    /// inherently case-insensitive), sleeping 300ms between pages.
    pub async fn get_minute_chart(
        &self,
        symbol: &str,
        max_pages: Option<u32>,
    ) -> Result<Vec<Value>, RestError> {
        let max_pages = max_pages.unwrap_or(MAX_PAGES_DEFAULT);
        let mut rows = Vec::new();
        let mut next_key = String::new();
        let mut cont_yn = "N".to_string();

        for page in 0..max_pages {
            let _serialize = self.call_lock.lock().await;
            self.limiter.wait().await;

            let token = self
                .credential
                .get_token(false)
                .await
                .map_err(|_| RestError::Unauthenticated)?;

            let resp = self
                .http
                .post(format!("{}/api/dostk/chart", self.base_url))
                .header("authorization", format!("Bearer {token}"))
                .header("api-id", "ka10080")
                .header("cont-yn", cont_yn.clone())
                .header("next-key", next_key.clone())
                .json(&serde_json::json!({ "stk_cd": symbol }))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .send()
                .await?;

            if !resp.status().is_success() {
                self.limiter.report_429();
                return Err(RestError::BadStatus(resp.status().as_u16()));
            }
            self.limiter.report_success();

            next_key = resp
                .headers()
                .get("next-key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            cont_yn = resp
                .headers()
                .get("cont-yn")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("N")
                .to_string();

            let body: Value = resp.json().await?;
            if let Some(arr) = body.get("stk_min_pole_qry").and_then(|v| v.as_array()) {
                rows.extend(arr.iter().cloned());
            }

            if cont_yn != "Y" || next_key.is_empty() {
                break;
            }
            if page + 1 < max_pages {
                tokio::time::sleep(Duration::from_millis(PAGE_SLEEP_MS)).await;
            }
        }

        Ok(rows)
    }

    pub fn is_mock(&self) -> bool {
        self.mock_trade
    }
}

/// Strip thousands separators and a leading `+` while preserving a leading
/// `-`. None/empty/unparsable all yield 0. Matches the Python `_safe_int`.
pub fn safe_int(raw: Option<&str>) -> i64 {
    let Some(raw) = raw else { return 0 };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0;
    }
    let cleaned: String = trimmed
        .chars()
        .filter(|c| *c != ',' && *c != '+')
        .collect();
    cleaned.parse::<i64>().unwrap_or(0)
}

/// Return the first present, non-null field among `names`, in order.
pub fn resolve_field<'a>(value: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .find_map(|name| value.get(*name).filter(|v| !v.is_null()))
}

/// The vision model's `stop_loss_price` may arrive as a JSON string or a
/// number; accept both.
pub fn parse_flexible_f64(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse::<f64>().ok()))
}

/// Encode order trade_type per the broker's convention: market orders
/// (`price == 0`) use "03", limit orders use "00".
pub fn order_trade_type(price: f64) -> &'static str {
    if price == 0.0 {
        "03"
    } else {
        "00"
    }
}

/// Encode cancel trade_type: "03" cancels a buy, "04" cancels a sell.
pub fn cancel_trade_type(is_buy_cancel: bool) -> &'static str {
    if is_buy_cancel {
        "03"
    } else {
        "04"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_int_preserves_sign() {
        assert_eq!(safe_int(Some("-12,345")), -12345);
        assert_eq!(safe_int(Some("+123")), 123);
        assert_eq!(safe_int(Some(" ")), 0);
        assert_eq!(safe_int(None), 0);
    }

    #[test]
    fn safe_int_handles_unparsable_as_zero() {
        assert_eq!(safe_int(Some("abc")), 0);
        assert_eq!(safe_int(Some("")), 0);
    }

    #[test]
    fn resolve_field_prefers_first_present() {
        let v = serde_json::json!({"open_prc": "100", "open_pric": "200"});
        let resolved = resolve_field(&v, &["open_pric", "open_prc"]);
        assert_eq!(resolved.unwrap().as_str().unwrap(), "200");
    }

    #[test]
    fn resolve_field_falls_back_when_first_missing() {
        let v = serde_json::json!({"open_prc": "100"});
        let resolved = resolve_field(&v, &["open_pric", "open_prc"]);
        assert_eq!(resolved.unwrap().as_str().unwrap(), "100");
    }

    #[test]
    fn resolve_field_skips_null() {
        let v = serde_json::json!({"access_token": null, "token": "abc"});
        let resolved = resolve_field(&v, &["access_token", "token"]);
        assert_eq!(resolved.unwrap().as_str().unwrap(), "abc");
    }

    #[test]
    fn parse_flexible_f64_accepts_string_or_number() {
        assert_eq!(parse_flexible_f64(&serde_json::json!(68500.0)), Some(68500.0));
        assert_eq!(parse_flexible_f64(&serde_json::json!("68500")), Some(68500.0));
        assert_eq!(parse_flexible_f64(&serde_json::json!("n/a")), None);
    }

    #[test]
    fn endpoint_routing_matches_tr_prefixes() {
        assert_eq!(endpoint_for("kt10000"), "/api/dostk/order");
        assert_eq!(endpoint_for("kt50001"), "/api/dostk/order");
        assert_eq!(endpoint_for("kt00018"), "/api/dostk/acnt");
        assert_eq!(endpoint_for("ka10075"), "/api/dostk/acnt");
        assert_eq!(endpoint_for("ka10080"), "/api/dostk/chart");
        assert_eq!(endpoint_for("ka10001"), "/api/dostk/stkinfo");
        assert_eq!(endpoint_for("ka10004"), "/api/dostk/mrkcond");
    }

    #[test]
    fn order_trade_type_distinguishes_market_vs_limit() {
        assert_eq!(order_trade_type(0.0), "03");
        assert_eq!(order_trade_type(70000.0), "00");
    }

    #[test]
    fn cancel_trade_type_distinguishes_buy_vs_sell() {
        assert_eq!(cancel_trade_type(true), "03");
        assert_eq!(cancel_trade_type(false), "04");
    }
}

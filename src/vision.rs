// =============================================================================
// Vision Client — chart-image verdict boundary
// =============================================================================
//
// Chart rendering and the vision model itself are external collaborators
// (out of scope per the system's purpose/scope section); this module models
// only the trait boundary the Signal Pipeline and Position Manager call
// through, plus an HTTP implementation for a provider that accepts a prompt
// and a base64 chart image and a deterministic stub for tests.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rest::client::parse_flexible_f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisionDecision {
    Yes,
    No,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionVerdict {
    pub decision: VisionDecision,
    pub reason: String,
    #[serde(default)]
    pub stop_loss_price: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("vision provider returned an unparsable response")]
    BadResponse,
}

/// Chart context handed to the vision provider. Candle rendering is out of
/// scope; callers pass the closes the provider needs to describe the chart.
pub struct ChartRequest<'a> {
    pub symbol: &'a str,
    pub closes: &'a [f64],
    pub prompt: &'a str,
}

#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn evaluate(&self, request: ChartRequest<'_>) -> Result<VisionVerdict, VisionError>;
}

/// HTTP implementation posting to a configured vision endpoint. Accepts a
/// comma-separated pool of API keys and round-robins across them so one
/// rate-limited key doesn't stall every signal.
pub struct HttpVisionClient {
    http: reqwest::Client,
    endpoint: String,
    api_keys: Vec<String>,
    next_key: std::sync::atomic::AtomicUsize,
}

impl HttpVisionClient {
    pub fn new(http: reqwest::Client, endpoint: String, api_keys: Vec<String>) -> Self {
        Self {
            http,
            endpoint,
            api_keys,
            next_key: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn pick_key(&self) -> Option<&str> {
        if self.api_keys.is_empty() {
            return None;
        }
        let idx = self
            .next_key
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % self.api_keys.len();
        Some(self.api_keys[idx].as_str())
    }
}

#[async_trait]
impl VisionClient for HttpVisionClient {
    async fn evaluate(&self, request: ChartRequest<'_>) -> Result<VisionVerdict, VisionError> {
        let key = self.pick_key().unwrap_or_default();
        let resp = self
            .http
            .post(&self.endpoint)
            .header("authorization", format!("Bearer {key}"))
            .json(&serde_json::json!({
                "symbol": request.symbol,
                "closes": request.closes,
                "prompt": request.prompt,
            }))
            .timeout(std::time::Duration::from_secs(20))
            .send()
            .await?;

        let body: Value = resp.json().await?;
        parse_verdict(&body).ok_or(VisionError::BadResponse)
    }
}

fn parse_verdict(body: &Value) -> Option<VisionVerdict> {
    let decision = match body.get("decision")?.as_str()? {
        "YES" => VisionDecision::Yes,
        "NO" => VisionDecision::No,
        _ => return None,
    };
    let reason = body
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let stop_loss_price = body.get("stop_loss_price").and_then(parse_flexible_f64);

    Some(VisionVerdict {
        decision,
        reason,
        stop_loss_price,
    })
}

/// Deterministic stub used by tests: always returns the configured verdict
/// regardless of the request.
pub struct StubVisionClient {
    pub verdict: VisionVerdict,
}

impl StubVisionClient {
    pub fn always_yes(stop_loss_price: Option<f64>) -> Self {
        Self {
            verdict: VisionVerdict {
                decision: VisionDecision::Yes,
                reason: "stub: always yes".to_string(),
                stop_loss_price,
            },
        }
    }

    pub fn always_no() -> Self {
        Self {
            verdict: VisionVerdict {
                decision: VisionDecision::No,
                reason: "stub: always no".to_string(),
                stop_loss_price: None,
            },
        }
    }
}

#[async_trait]
impl VisionClient for StubVisionClient {
    async fn evaluate(&self, _request: ChartRequest<'_>) -> Result<VisionVerdict, VisionError> {
        Ok(self.verdict.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_verdict_accepts_string_stop_loss() {
        let body = serde_json::json!({"decision": "YES", "reason": "breakout", "stop_loss_price": "68500"});
        let verdict = parse_verdict(&body).unwrap();
        assert_eq!(verdict.decision, VisionDecision::Yes);
        assert_eq!(verdict.stop_loss_price, Some(68500.0));
    }

    #[test]
    fn parse_verdict_accepts_numeric_stop_loss() {
        let body = serde_json::json!({"decision": "NO", "reason": "chop", "stop_loss_price": 68500.0});
        let verdict = parse_verdict(&body).unwrap();
        assert_eq!(verdict.decision, VisionDecision::No);
        assert_eq!(verdict.stop_loss_price, Some(68500.0));
    }

    #[test]
    fn parse_verdict_rejects_unknown_decision() {
        let body = serde_json::json!({"decision": "MAYBE"});
        assert!(parse_verdict(&body).is_none());
    }

    #[tokio::test]
    async fn stub_client_always_returns_configured_verdict() {
        let client = StubVisionClient::always_yes(Some(68500.0));
        let verdict = client
            .evaluate(ChartRequest {
                symbol: "005930",
                closes: &[1.0, 2.0],
                prompt: "entry",
            })
            .await
            .unwrap();
        assert_eq!(verdict.decision, VisionDecision::Yes);
        assert_eq!(verdict.stop_loss_price, Some(68500.0));
    }
}

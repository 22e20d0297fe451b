// =============================================================================
// Notifier — Telegram notification boundary
// =============================================================================
//
// Telegram delivery is an external collaborator (out of scope). This module
// models the trait boundary called by the Signal Pipeline, Position Manager,
// Scheduler, and the main loop's fatal-error handler, plus an HTTP
// implementation for the Telegram Bot API and a no-op implementation for
// `use_telegram = false` / missing credentials.
// =============================================================================

use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str);
}

pub struct TelegramNotifier {
    http: reqwest::Client,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(http: reqwest::Client, token: String, chat_id: String) -> Self {
        Self { http, token, chat_id }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "chat_id": self.chat_id, "text": text }))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await;

        if let Err(e) = resp {
            warn!(error = %e, "notifier: telegram send failed");
        }
    }
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, _text: &str) {}
}

/// A single day's summary handed to the Notifier by the Scheduler.
pub struct DailyReport {
    pub date: String,
    pub realized_pnl: i64,
    pub trade_count: usize,
    pub win_count: usize,
}

impl DailyReport {
    pub fn format(&self) -> String {
        format!(
            "Daily report {}\nrealized P&L: {}\ntrades: {}\nwins: {}",
            self.date, self.realized_pnl, self.trade_count, self.win_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_report_formats_all_fields() {
        let report = DailyReport {
            date: "2026-07-28".to_string(),
            realized_pnl: 125_000,
            trade_count: 6,
            win_count: 4,
        };
        let text = report.format();
        assert!(text.contains("2026-07-28"));
        assert!(text.contains("125000"));
        assert!(text.contains("trades: 6"));
    }

    #[tokio::test]
    async fn noop_notifier_never_panics() {
        let notifier = NoopNotifier;
        notifier.send("hello").await;
    }
}

// =============================================================================
// Scheduler — scanner rotation and daily report cadence
// =============================================================================
//
// Runs at 1-minute granularity, independent of the Control Loop's own tick.
// Compares the wall clock against `Settings.schedule` to decide whether the
// active scanner subscription should rotate, and fires the daily report once
// per calendar day inside the 15:40-15:49 window. Grounded on the gateway's
// reconnect-forever task shape (`MarketDataGateway::run`) — a small
// self-contained loop spawned once and driven by a ticker plus a shutdown
// token.
// =============================================================================

use std::sync::Arc;

use chrono::{Local, NaiveDate, NaiveTime, Timelike};
use parking_lot::RwLock;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::gateway::MarketDataGateway;
use crate::notifier::{DailyReport, Notifier};
use crate::store::Store;
use crate::types::{BotStatus, ScheduleWindow, Settings};

const TICK_SECS: u64 = 60;
const REPORT_WINDOW_START: (u32, u32) = (15, 40);
const REPORT_WINDOW_END: (u32, u32) = (15, 49);
const RETENTION_DAYS: i64 = 7;

pub struct Scheduler {
    store: Store,
    gateway: Arc<MarketDataGateway>,
    notifier: Arc<dyn Notifier>,
    last_report_date: RwLock<Option<NaiveDate>>,
}

impl Scheduler {
    pub fn new(store: Store, gateway: Arc<MarketDataGateway>, notifier: Arc<dyn Notifier>) -> Arc<Self> {
        Arc::new(Self {
            store,
            gateway,
            notifier,
            last_report_date: RwLock::new(None),
        })
    }

    /// Run the 1-minute scanner-rotation and daily-report loop. Intended to
    /// be spawned once; exits only on shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let (trades, logs) = self.store.cleanup(RETENTION_DAYS).await;
        info!(trades, logs, "scheduler: startup retention cleanup complete");

        let mut ticker = interval(Duration::from_secs(TICK_SECS));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let settings: Settings = self.store.get_kv("settings").await.unwrap_or_default();
                    let now = Local::now();

                    if settings.use_scheduler {
                        self.rotate_scanner_if_due(&settings, now).await;
                    }
                    self.send_daily_report_if_due(&settings, now).await;
                }
            }
        }
    }

    async fn rotate_scanner_if_due(&self, settings: &Settings, now: chrono::DateTime<Local>) {
        let Some(window) = latest_due_window(&settings.schedule, now) else {
            return;
        };
        if window.condition_id == settings.condition_id {
            return;
        }

        let mut updated = settings.clone();
        updated.condition_id = window.condition_id.clone();
        updated.bot_status = BotStatus::Restarting;
        self.store.set_kv("settings", &updated).await;
        self.gateway.request_snapshot(&window.condition_id);

        info!(
            condition_id = %window.condition_id,
            "scheduler: rotating scanner subscription, restarting control loop"
        );
    }

    async fn send_daily_report_if_due(&self, settings: &Settings, now: chrono::DateTime<Local>) {
        let t = now.time();
        let start = NaiveTime::from_hms_opt(REPORT_WINDOW_START.0, REPORT_WINDOW_START.1, 0).unwrap();
        let end = NaiveTime::from_hms_opt(REPORT_WINDOW_END.0, REPORT_WINDOW_END.1, 0).unwrap();
        if t < start || t > end {
            return;
        }

        let today = now.date_naive();
        if *self.last_report_date.read() == Some(today) {
            return;
        }

        let trades = self.store.recent_trades(500).await;
        let today_trades: Vec<_> = trades
            .iter()
            .filter(|t| t.timestamp.with_timezone(&Local).date_naive() == today)
            .collect();
        let win_count = today_trades
            .iter()
            .filter(|t| t.profit_rate.map(|r| r > 0.0).unwrap_or(false))
            .count();
        let realized_pnl: i64 = self.store.get_kv("daily_realized_pnl").await.unwrap_or(0);

        let report = DailyReport {
            date: today.format("%Y-%m-%d").to_string(),
            realized_pnl,
            trade_count: today_trades.len(),
            win_count,
        };

        if settings.use_telegram {
            self.notifier.send(&report.format()).await;
        }
        *self.last_report_date.write() = Some(today);
        info!(date = %report.date, "scheduler: daily report sent");
    }
}

/// Among windows whose `start_time` has already passed today, pick the one
/// with the latest start — the currently-active rotation slot.
fn latest_due_window<'a>(
    schedule: &'a [ScheduleWindow],
    now: chrono::DateTime<Local>,
) -> Option<&'a ScheduleWindow> {
    let now_minutes = now.hour() * 60 + now.minute();
    schedule
        .iter()
        .filter_map(|w| parse_hhmm(&w.start_time).map(|m| (m, w)))
        .filter(|(m, _)| *m <= now_minutes)
        .max_by_key(|(m, _)| *m)
        .map(|(_, w)| w)
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    Some(h.parse::<u32>().ok()? * 60 + m.parse::<u32>().ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window(start: &str, id: &str) -> ScheduleWindow {
        ScheduleWindow { start_time: start.to_string(), condition_id: id.to_string() }
    }

    #[test]
    fn latest_due_window_picks_most_recent_passed_start() {
        let schedule = vec![window("09:00", "0"), window("10:30", "1"), window("13:00", "2")];
        let now = Local.with_ymd_and_hms(2026, 7, 28, 11, 0, 0).unwrap();
        let due = latest_due_window(&schedule, now).unwrap();
        assert_eq!(due.condition_id, "1");
    }

    #[test]
    fn latest_due_window_none_before_first_start() {
        let schedule = vec![window("09:00", "0")];
        let now = Local.with_ymd_and_hms(2026, 7, 28, 8, 0, 0).unwrap();
        assert!(latest_due_window(&schedule, now).is_none());
    }
}

// =============================================================================
// Control Loop — the engine's single orchestrating task
// =============================================================================
//
// One cooperative loop ties every subsystem together: command dispatch,
// settings reload, status-snapshot persistence, condition-event draining
// into the Signal Pipeline, the Position Manager's periodic exit tick and
// special liquidation cycles, unfilled-order cancellation, account-stream
// fill processing, and balance/P&L reconciliation. Everything else (the
// gateway's socket task, the scheduler's 1-minute rotation) runs as its own
// spawned task; this loop is deliberately the only place Position/Settings
// mutation happens outside of those two narrow exceptions (cooldowns are
// also written by the Reconciler, which this loop calls inline).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use chrono::{DateTime, Local, NaiveTime, Utc};
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app_state::StatusSnapshot;
use crate::calendar::{is_market_open, minutes_since_midnight, SessionCalendar};
use crate::cooldown::CooldownTable;
use crate::gateway::MarketDataGateway;
use crate::position_engine::{net_profit_rate, ExitReason, FeeTable, PositionManager};
use crate::reconcile::{fetch_daily_pnl, fetch_server_holdings, reconcile_balance, store_daily_pnl};
use crate::rest::client::{cancel_trade_type, order_trade_type, resolve_field, safe_int, RestClient};
use crate::signal_pipeline::SignalPipeline;
use crate::store::Store;
use crate::types::{
    BotStatus, CommandType, PositionStatus, Settings, TradeAction, TradeRecord,
};

const RUNNING_TICK_MS: u64 = 100;
const IDLE_TICK_MS: u64 = 1000;
const POSITION_TICK_SECS: i64 = 2;
const RECONCILE_INTERVAL_SECS: i64 = 20;
const PNL_FETCH_INTERVAL_SECS: i64 = 60;
const FORCE_PERSIST_INTERVAL_SECS: i64 = 5;
const UNFILLED_ORDER_AGE_SECS: i64 = 20;
const UNFILLED_CANCEL_RETRY_SECS: i64 = 10;

const ENTRY_CUTOFF: (u32, u32, u32) = (9, 0, 30);
const MARKET_CLOSE_WINDOW: ((u32, u32), (u32, u32)) = ((15, 10), (15, 19));
const MORNING_LIQUIDATION_WINDOW: ((u32, u32), (u32, u32)) = ((9, 0), (9, 2));
const CONDITION_EVENT_WINDOW: ((u32, u32), (u32, u32)) = ((8, 30), (15, 35));
const RECONCILE_ACTIVE_WINDOW: ((u32, u32), (u32, u32)) = ((8, 40), (15, 20));

const SELL_TR_ID: &str = "kt10001";
const CANCEL_TR_ID: &str = "kt10003";

pub enum ControlLoopExit {
    Shutdown,
    Restart,
}

pub struct ControlLoop {
    store: Store,
    rest: Arc<RestClient>,
    gateway: Arc<MarketDataGateway>,
    positions: Arc<PositionManager>,
    cooldowns: Arc<CooldownTable>,
    pipeline: Arc<SignalPipeline>,
    calendar: Arc<dyn SessionCalendar>,
    account_no: String,
    initial_mock_trade: bool,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        rest: Arc<RestClient>,
        gateway: Arc<MarketDataGateway>,
        positions: Arc<PositionManager>,
        cooldowns: Arc<CooldownTable>,
        pipeline: Arc<SignalPipeline>,
        calendar: Arc<dyn SessionCalendar>,
        account_no: String,
        initial_mock_trade: bool,
    ) -> Self {
        Self {
            store,
            rest,
            gateway,
            positions,
            cooldowns,
            pipeline,
            calendar,
            account_no,
            initial_mock_trade,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> ControlLoopExit {
        let mut last_position_tick = StdInstant::now() - Duration::from_secs(60);
        let mut last_reconcile = StdInstant::now() - Duration::from_secs(60);
        let mut last_pnl_fetch = StdInstant::now() - Duration::from_secs(120);
        let mut last_force_persist = StdInstant::now() - Duration::from_secs(60);
        let mut last_morning_liquidation_date = None;
        let mut last_market_close_date = None;

        loop {
            if shutdown.is_cancelled() {
                self.persist_snapshot().await;
                return ControlLoopExit::Shutdown;
            }

            let settings: Settings = self.store.get_kv("settings").await.unwrap_or_default();
            if settings.mock_trade != self.initial_mock_trade {
                warn!("control_loop: mock_trade flip detected, restarting process");
                let mut restarting = settings.clone();
                restarting.bot_status = BotStatus::Restarting;
                self.store.set_kv("settings", &restarting).await;
                self.persist_snapshot().await;
                std::process::exit(0);
            }

            if let Some(cmd) = self.store.pop_command().await {
                self.dispatch_command(cmd).await;
            }

            if last_force_persist.elapsed().as_secs() as i64 >= FORCE_PERSIST_INTERVAL_SECS {
                self.persist_snapshot().await;
                last_force_persist = StdInstant::now();
            }

            if settings.bot_status == BotStatus::Restarting {
                self.persist_snapshot().await;
                return ControlLoopExit::Restart;
            }

            let now = Utc::now();
            let now_local = Local::now();
            let market_open = is_market_open(now_local, self.calendar.as_ref());

            match settings.bot_status {
                BotStatus::Running if market_open && minutes_since_midnight(now_local) > ENTRY_CUTOFF.0 * 60 + ENTRY_CUTOFF.1 => {
                    self.drain_condition_events(&settings).await;

                    if last_position_tick.elapsed().as_secs() as i64 >= POSITION_TICK_SECS {
                        self.run_position_tick(&settings, now).await;
                        self.run_market_close_cycle(&settings, now_local, &mut last_market_close_date).await;
                        self.run_morning_liquidation_cycle(&settings, now_local, &mut last_morning_liquidation_date).await;
                        self.manage_unfilled_orders(&settings, now).await;
                        self.process_account_stream(&settings, now).await;
                        last_position_tick = StdInstant::now();
                    }

                    if last_reconcile.elapsed().as_secs() as i64 >= RECONCILE_INTERVAL_SECS {
                        self.run_reconciliation(&settings, now).await;
                        last_reconcile = StdInstant::now();
                    }
                    if last_pnl_fetch.elapsed().as_secs() as i64 >= PNL_FETCH_INTERVAL_SECS {
                        self.run_pnl_fetch().await;
                        last_pnl_fetch = StdInstant::now();
                    }
                }
                BotStatus::Running => {
                    self.drop_condition_events_outside_window(now_local);
                    if in_window(now_local, RECONCILE_ACTIVE_WINDOW.0, RECONCILE_ACTIVE_WINDOW.1)
                        && last_reconcile.elapsed().as_secs() as i64 >= RECONCILE_INTERVAL_SECS
                    {
                        self.run_reconciliation(&settings, now).await;
                        last_reconcile = StdInstant::now();
                    }
                }
                BotStatus::Stopped | BotStatus::Booting => {
                    while self.gateway.pop_condition_event().is_some() {}
                    if last_position_tick.elapsed().as_secs() as i64 >= POSITION_TICK_SECS {
                        self.run_position_tick(&settings, now).await;
                        self.process_account_stream(&settings, now).await;
                        last_position_tick = StdInstant::now();
                    }
                }
                BotStatus::Restarting => unreachable!("handled above"),
            }

            let tick_ms = if settings.bot_status == BotStatus::Running { RUNNING_TICK_MS } else { IDLE_TICK_MS };
            sleep(Duration::from_millis(tick_ms)).await;
        }
    }

    async fn dispatch_command(&self, cmd: crate::types::Command) {
        match cmd.cmd_type {
            CommandType::BulkSell => {
                info!("control_loop: BULK_SELL command received");
                for pos in self.positions.snapshot() {
                    if pos.status == PositionStatus::Held {
                        self.submit_sell(&pos.symbol, pos.buy_qty, PositionStatus::SellOrderedBulk).await;
                    }
                }
            }
            CommandType::BacktestReq => {
                info!(payload = %cmd.payload, "control_loop: BACKTEST_REQ acknowledged (simulator out of scope)");
                self.store
                    .set_kv(
                        &format!("backtest_result_{}", cmd.id),
                        &json!({ "status": "acknowledged", "note": "backtest simulation is not implemented" }),
                    )
                    .await;
            }
        }
    }

    async fn drain_condition_events(&self, settings: &Settings) {
        while let Some(event) = self.gateway.pop_condition_event() {
            let outcome = self.pipeline.handle_event(event, settings).await;
            match outcome {
                crate::signal_pipeline::PipelineOutcome::Entered { symbol, qty, price } => {
                    info!(symbol, qty, price, "control_loop: pipeline entered position");
                }
                crate::signal_pipeline::PipelineOutcome::Rejected { symbol, reason } => {
                    tracing::debug!(symbol, reason, "control_loop: pipeline rejected event");
                }
            }
        }
    }

    fn drop_condition_events_outside_window(&self, now_local: DateTime<Local>) {
        let dropped_during_extended_hours = in_window(now_local, CONDITION_EVENT_WINDOW.0, CONDITION_EVENT_WINDOW.1);
        let mut count = 0u32;
        while self.gateway.pop_condition_event().is_some() {
            count += 1;
        }
        if count > 0 && dropped_during_extended_hours {
            tracing::debug!(count, "control_loop: dropped condition events while market not fully open");
        }
    }

    async fn run_position_tick(&self, settings: &Settings, now: DateTime<Utc>) {
        let fees = FeeTable::for_mode(settings.mock_trade);
        let mut prices: HashMap<String, f64> = HashMap::new();
        for pos in self.positions.snapshot() {
            if let Some(value) = self.gateway.latest(&pos.symbol, "0B") {
                if let Some(price) = extract_tick_price(&value) {
                    prices.insert(pos.symbol.clone(), price);
                }
            }
        }

        let exits = self.positions.check_exits(
            &prices,
            now,
            settings.stop_loss_rate,
            settings.trailing_start_rate,
            settings.trailing_stop_rate,
            settings.time_cut_minutes,
            settings.ai_stop_loss_safety_limit,
            &fees,
        );

        for (symbol, reason, price) in exits {
            let Some(pos) = self.positions.get(&symbol) else { continue };
            let rate = net_profit_rate(pos.buy_price, pos.buy_qty, price, &fees);
            self.submit_sell(&symbol, pos.buy_qty, PositionStatus::SellOrdered).await;
            self.store
                .log_trade(&TradeRecord {
                    timestamp: now,
                    action: TradeAction::Sell,
                    symbol: symbol.clone(),
                    symbol_name: pos.symbol_name.clone(),
                    qty: pos.buy_qty,
                    price,
                    reason: reason.to_string(),
                    profit_rate: Some(rate),
                    profit_amount: Some(((price - pos.buy_price) * pos.buy_qty as f64) as i64),
                    vision_reason: None,
                })
                .await;
            info!(symbol, %reason, rate, "control_loop: exit triggered");
        }
    }

    /// 15:10-15:19 forced liquidation of positions whose scanner isn't on the
    /// overnight allow-list, once per calendar day.
    async fn run_market_close_cycle(
        &self,
        settings: &Settings,
        now_local: DateTime<Local>,
        last_run_date: &mut Option<chrono::NaiveDate>,
    ) {
        if !in_window(now_local, MARKET_CLOSE_WINDOW.0, MARKET_CLOSE_WINDOW.1) {
            return;
        }
        let today = now_local.date_naive();
        if *last_run_date == Some(today) {
            return;
        }
        *last_run_date = Some(today);

        let candidates = self.positions.market_close_candidates(&settings.overnight_cond_ids);
        for pos in candidates {
            self.submit_sell(&pos.symbol, pos.buy_qty, PositionStatus::SellOrderedBulk).await;
            info!(symbol = %pos.symbol, "control_loop: market-close liquidation");
        }
    }

    /// 09:00-09:02 morning pass over positions carried overnight: ride
    /// profitable ones with trailing armed, gap-sell the rest.
    async fn run_morning_liquidation_cycle(
        &self,
        settings: &Settings,
        now_local: DateTime<Local>,
        last_run_date: &mut Option<chrono::NaiveDate>,
    ) {
        if !in_window(now_local, MORNING_LIQUIDATION_WINDOW.0, MORNING_LIQUIDATION_WINDOW.1) {
            return;
        }
        let today = now_local.date_naive();
        if *last_run_date == Some(today) {
            return;
        }
        *last_run_date = Some(today);

        let fees = FeeTable::for_mode(settings.mock_trade);
        let candidates = self.positions.morning_liquidation_candidates(&settings.overnight_cond_ids);
        for pos in candidates {
            let price = self
                .gateway
                .latest(&pos.symbol, "0B")
                .and_then(|v| extract_tick_price(&v))
                .unwrap_or(pos.buy_price);
            let rate = net_profit_rate(pos.buy_price, pos.buy_qty, price, &fees);

            if rate > 0.0 {
                self.positions.arm_trailing_now(&pos.symbol, rate);
                self.positions.mark_overnight_approved(&pos.symbol);
                info!(symbol = %pos.symbol, rate, "control_loop: morning carry-over armed for trailing");
            } else {
                self.submit_sell(&pos.symbol, pos.buy_qty, PositionStatus::SellOrderedGap).await;
                info!(symbol = %pos.symbol, rate, "control_loop: morning gap liquidation");
            }
        }
    }

    async fn manage_unfilled_orders(&self, _settings: &Settings, now: DateTime<Utc>) {
        for pos in self.positions.snapshot() {
            let Some(order_id) = pos.active_order_id.clone() else { continue };
            let is_buy_cancel = pos.status == PositionStatus::BuyOrdered;
            if !is_buy_cancel && !pos.status.is_sell_ordered() {
                continue;
            }

            let age = now.signed_duration_since(pos.order_time).num_seconds();
            if age <= UNFILLED_ORDER_AGE_SECS {
                continue;
            }
            if let Some(last) = pos.last_cancel_attempt_time {
                if now.signed_duration_since(last).num_seconds() < UNFILLED_CANCEL_RETRY_SECS {
                    continue;
                }
            }

            self.positions.mutate(&pos.symbol, |p| p.last_cancel_attempt_time = Some(now));

            let body = json!({
                "orig_ord_no": order_id,
                "stk_cd": pos.symbol,
                "cncl_qty": "0",
                "trde_tp": cancel_trade_type(is_buy_cancel),
                "dmst_stex_tp": "KRX",
            });
            match self.rest.call_api(CANCEL_TR_ID, body).await {
                Ok(_) => {
                    if is_buy_cancel {
                        self.positions.remove(&pos.symbol);
                        info!(symbol = %pos.symbol, "control_loop: unfilled buy cancelled, position removed");
                    } else {
                        self.positions.mutate(&pos.symbol, |p| {
                            p.status = PositionStatus::Held;
                            p.active_order_id = None;
                        });
                        info!(symbol = %pos.symbol, "control_loop: unfilled sell cancelled, reverted to HELD");
                    }
                }
                Err(e) => {
                    warn!(symbol = %pos.symbol, error = %e, "control_loop: order cancel failed");
                }
            }
        }
    }

    /// Best-effort fill processing off the gateway's single latest
    /// account-stream value (type "00"/"04"); multiple fills landing within
    /// one tick are coalesced into the last-seen event, acceptable for a
    /// system whose authoritative source of truth is the 20s reconciler.
    async fn process_account_stream(&self, settings: &Settings, now: DateTime<Utc>) {
        let fees = FeeTable::for_mode(settings.mock_trade);
        for data_type in ["00", "04"] {
            let Some(value) = self.gateway.latest_account(data_type) else { continue };
            let Some(order_id) = value.get("9203").and_then(|v| v.as_str()) else { continue };

            let Some(pos) = self
                .positions
                .snapshot()
                .into_iter()
                .find(|p| p.active_order_id.as_deref() == Some(order_id))
            else {
                continue;
            };

            let fill_status = value.get("913").and_then(|v| v.as_str()).unwrap_or("");
            if !fill_status.contains("체결") {
                continue;
            }

            let fill_price = resolve_field(&value, &["910"])
                .and_then(|v| v.as_str())
                .map(|s| safe_int(Some(s)).unsigned_abs() as f64)
                .unwrap_or(0.0);
            let fill_qty = resolve_field(&value, &["911"])
                .and_then(|v| v.as_str())
                .map(|s| safe_int(Some(s)).unsigned_abs())
                .unwrap_or(pos.buy_qty);

            if pos.status == PositionStatus::BuyOrdered {
                self.positions.mutate(&pos.symbol, |p| {
                    p.status = PositionStatus::Held;
                    p.active_order_id = None;
                    if fill_price > 0.0 {
                        p.buy_price = fill_price;
                    }
                    if fill_qty > 0 {
                        p.buy_qty = fill_qty;
                    }
                });
                self.gateway.add_subscription(&pos.symbol, "0B");
                info!(symbol = %pos.symbol, "control_loop: buy fill confirmed");
            } else if pos.status.is_sell_ordered() {
                let rate = net_profit_rate(pos.buy_price, pos.buy_qty, fill_price.max(pos.buy_price), &fees);
                self.positions.remove(&pos.symbol);
                self.gateway.remove_subscription(&pos.symbol, "0B");
                self.store
                    .log_trade(&TradeRecord {
                        timestamp: now,
                        action: TradeAction::Sell,
                        symbol: pos.symbol.clone(),
                        symbol_name: pos.symbol_name.clone(),
                        qty: pos.buy_qty,
                        price: fill_price,
                        reason: "fill_confirmed".to_string(),
                        profit_rate: Some(rate),
                        profit_amount: None,
                        vision_reason: None,
                    })
                    .await;
                info!(symbol = %pos.symbol, "control_loop: sell fill confirmed");
            }
        }
    }

    async fn run_reconciliation(&self, settings: &Settings, now: DateTime<Utc>) {
        match fetch_server_holdings(&self.rest, &self.account_no).await {
            Ok(holdings) => {
                let result = reconcile_balance(
                    &self.positions,
                    &self.cooldowns,
                    &holdings,
                    now,
                    settings.re_entry_cooldown_min,
                )
                .await;
                self.store.set_kv("last_reconcile_ok", &now).await;
                if result.promoted > 0 || result.created > 0 || result.deleted > 0 {
                    info!(
                        promoted = result.promoted,
                        created = result.created,
                        deleted = result.deleted,
                        "control_loop: reconciliation applied changes"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "control_loop: reconciliation fetch failed");
            }
        }
    }

    async fn run_pnl_fetch(&self) {
        if let Ok(pnl) = fetch_daily_pnl(&self.rest).await {
            store_daily_pnl(&self.store, pnl).await;
        }
    }

    async fn submit_sell(&self, symbol: &str, qty: i64, status: PositionStatus) {
        let body = json!({
            "stk_cd": symbol,
            "ord_qty": qty.to_string(),
            "ord_uv": "0",
            "trde_tp": order_trade_type(0.0),
            "dmst_stex_tp": "KRX",
        });
        match self.rest.call_api(SELL_TR_ID, body).await {
            Ok(resp) => {
                let order_no = resolve_field(&resp, &["ord_no", "orderNo"])
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.positions.mark_sell_ordered(symbol, order_no, status);
            }
            Err(e) => {
                warn!(symbol, error = %e, "control_loop: sell order submission failed");
            }
        }
    }

    async fn persist_snapshot(&self) {
        let settings: Settings = self.store.get_kv("settings").await.unwrap_or_default();
        let now_local = Local::now();
        let last_reconcile_ok: Option<DateTime<Utc>> = self.store.get_kv("last_reconcile_ok").await;
        let daily_realized_pnl: i64 = self.store.get_kv("daily_realized_pnl").await.unwrap_or(0);

        let snapshot = StatusSnapshot {
            bot_status: settings.bot_status,
            mock_trade: settings.mock_trade,
            condition_id: settings.condition_id.clone(),
            market_open: is_market_open(now_local, self.calendar.as_ref()),
            positions: self.positions.snapshot(),
            daily_realized_pnl,
            last_reconcile_ok,
            updated_at: Utc::now(),
        };
        self.store.set_kv("status_snapshot", &snapshot).await;
    }
}

fn in_window(now: DateTime<Local>, start: (u32, u32), end: (u32, u32)) -> bool {
    let t = now.time();
    let start = NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap();
    let end = NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap();
    t >= start && t <= end
}

fn extract_tick_price(value: &Value) -> Option<f64> {
    value
        .get("10")
        .and_then(|v| v.as_str())
        .map(|s| safe_int(Some(s)).unsigned_abs() as f64)
        .filter(|p| *p > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn in_window_boundaries() {
        let inside = Local.with_ymd_and_hms(2026, 7, 28, 15, 15, 0).unwrap();
        let before = Local.with_ymd_and_hms(2026, 7, 28, 15, 9, 0).unwrap();
        let after = Local.with_ymd_and_hms(2026, 7, 28, 15, 20, 0).unwrap();
        assert!(in_window(inside, MARKET_CLOSE_WINDOW.0, MARKET_CLOSE_WINDOW.1));
        assert!(!in_window(before, MARKET_CLOSE_WINDOW.0, MARKET_CLOSE_WINDOW.1));
        assert!(!in_window(after, MARKET_CLOSE_WINDOW.0, MARKET_CLOSE_WINDOW.1));
    }

    #[test]
    fn extract_tick_price_takes_absolute_value() {
        let v = serde_json::json!({"10": "-68500"});
        assert_eq!(extract_tick_price(&v), Some(68500.0));
    }

    #[test]
    fn extract_tick_price_rejects_zero() {
        let v = serde_json::json!({"10": "0"});
        assert_eq!(extract_tick_price(&v), None);
    }
}

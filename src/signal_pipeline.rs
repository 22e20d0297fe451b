// =============================================================================
// Signal Pipeline — condition-event admission filter
// =============================================================================
//
// Every `ConditionEvent` the gateway emits runs through this filter before a
// buy order is ever submitted: de-duplication, index regime, price
// acquisition, order-book imbalance, technical (RSI + candle shape), vision
// verdict, and AI stop-loss sizing. A reject at any step drops the symbol
// back to the next event with, where the design calls for it, a cooldown set
// so the same symbol doesn't retrigger immediately.
//
// Vision calls (and everything after) run behind a bounded semaphore so a
// burst of condition events can't fan out unlimited concurrent calls to the
// vision provider.
// =============================================================================

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::cooldown::{AttemptHistory, CooldownTable};
use crate::gateway::{ConditionEvent, ConditionEventType, MarketDataGateway};
use crate::index_regime::IndexRegimeTable;
use crate::indicators::rsi::calculate_rsi;
use crate::market_data::candle_buffer::{candles_from_chart_rows, CandleBuffer, CandleKey};
use crate::position_engine::{net_profit_rate, FeeTable, PositionManager};
use crate::rest::client::{resolve_field, safe_int, RestClient};
use crate::store::Store;
use crate::types::{Market, Position, PositionStatus, Settings, TradeAction, TradeRecord};
use crate::vision::{ChartRequest, VisionClient, VisionDecision};

const VISION_CONCURRENCY: usize = 5;
const TECHNICAL_CANDLE_COUNT: usize = 30;
const RSI_PERIOD: usize = 14;
const UPPER_SHADOW_LIMIT: f64 = 0.4;
const PRICE_RETRY_ATTEMPTS: u32 = 3;
const PRICE_RETRY_SPACING_MS: u64 = 200;
const BUY_TR_ID: &str = "kt10000";
const TICK_SUBSCRIPTION_TYPE: &str = "0B";

#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Entered { symbol: String, qty: i64, price: f64 },
    Rejected { symbol: String, reason: &'static str },
}

pub struct SignalPipeline {
    store: Store,
    rest: Arc<RestClient>,
    gateway: Arc<MarketDataGateway>,
    positions: Arc<PositionManager>,
    cooldowns: Arc<CooldownTable>,
    attempts: Arc<AttemptHistory>,
    candles: Arc<CandleBuffer>,
    index_regime: Arc<IndexRegimeTable>,
    vision: Arc<dyn VisionClient>,
    symbol_markets: RwLock<HashMap<String, Market>>,
    in_flight: RwLock<HashSet<String>>,
    vision_gate: Semaphore,
}

/// Removes `symbol` from the in-flight set on every exit path, including
/// early returns, so a rejected symbol is immediately eligible again.
struct InFlightGuard<'a> {
    set: &'a RwLock<HashSet<String>>,
    symbol: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.write().remove(&self.symbol);
    }
}

impl SignalPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        rest: Arc<RestClient>,
        gateway: Arc<MarketDataGateway>,
        positions: Arc<PositionManager>,
        cooldowns: Arc<CooldownTable>,
        attempts: Arc<AttemptHistory>,
        candles: Arc<CandleBuffer>,
        index_regime: Arc<IndexRegimeTable>,
        vision: Arc<dyn VisionClient>,
    ) -> Self {
        Self {
            store,
            rest,
            gateway,
            positions,
            cooldowns,
            attempts,
            candles,
            index_regime,
            vision,
            symbol_markets: RwLock::new(HashMap::new()),
            in_flight: RwLock::new(HashSet::new()),
            vision_gate: Semaphore::new(VISION_CONCURRENCY),
        }
    }

    pub async fn handle_event(&self, event: ConditionEvent, settings: &Settings) -> PipelineOutcome {
        let symbol = event.code.clone();
        let now = Utc::now();

        if event.event_type == ConditionEventType::Delete {
            return PipelineOutcome::Rejected { symbol, reason: "condition_delete" };
        }
        if self.positions.contains(&symbol) {
            return PipelineOutcome::Rejected { symbol, reason: "already_held" };
        }
        {
            let mut set = self.in_flight.write();
            if !set.insert(symbol.clone()) {
                return PipelineOutcome::Rejected { symbol, reason: "in_flight" };
            }
        }
        let _guard = InFlightGuard { set: &self.in_flight, symbol: symbol.clone() };

        if self.cooldowns.is_blocked(&symbol, now) {
            return PipelineOutcome::Rejected { symbol, reason: "cooldown" };
        }
        if self.attempts.is_blocked(&symbol, now) {
            return PipelineOutcome::Rejected { symbol, reason: "attempt_retry_block" };
        }

        if settings.use_market_filter {
            let market = self.market_for(&symbol);
            if let Some(regime) = self.index_regime.get(market) {
                if !regime.is_bullish {
                    self.cooldowns.set_minutes(&symbol, 10, now);
                    return PipelineOutcome::Rejected { symbol, reason: "bearish_regime" };
                }
            }
        }

        let (price, symbol_name) = match self.acquire_price(&symbol, event.price).await {
            Some(v) => v,
            None => {
                self.cooldowns.set_minutes(&symbol, 1, now);
                return PipelineOutcome::Rejected { symbol, reason: "no_price" };
            }
        };

        if settings.use_hoga_filter {
            match self.orderbook_ratio(&symbol).await {
                Some(ratio) if ratio >= settings.min_buy_sell_ratio => {}
                Some(_) => {
                    self.cooldowns.set_minutes(&symbol, 5, now);
                    return PipelineOutcome::Rejected { symbol, reason: "orderbook_imbalance" };
                }
                None => {
                    return PipelineOutcome::Rejected { symbol, reason: "orderbook_unavailable" };
                }
            }
        }

        let closes = self.technical_closes(&symbol).await;
        if closes.len() < TECHNICAL_CANDLE_COUNT {
            return PipelineOutcome::Rejected { symbol, reason: "insufficient_candles" };
        }
        let Some(rsi) = calculate_rsi(&closes, RSI_PERIOD).last().copied() else {
            return PipelineOutcome::Rejected { symbol, reason: "rsi_unavailable" };
        };
        if rsi > settings.rsi_limit {
            return PipelineOutcome::Rejected { symbol, reason: "rsi_overbought" };
        }
        let key = CandleKey { symbol: symbol.clone(), interval: "1m".to_string() };
        if let Some(last) = self.candles.get_closed(&key, 1).last() {
            if last.upper_shadow_ratio() > UPPER_SHADOW_LIMIT {
                return PipelineOutcome::Rejected { symbol, reason: "upper_shadow_reject" };
            }
        }

        let _permit = self.vision_gate.acquire().await.ok();
        let prompt = format!("entry signal for scanner {}", event.scanner_id);
        let verdict = match self
            .vision
            .evaluate(ChartRequest { symbol: &symbol, closes: &closes, prompt: &prompt })
            .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(symbol, error = %e, "signal_pipeline: vision call failed");
                return PipelineOutcome::Rejected { symbol, reason: "vision_error" };
            }
        };
        if verdict.decision == VisionDecision::No {
            self.cooldowns.set_minutes(&symbol, 10, now);
            return PipelineOutcome::Rejected { symbol, reason: "vision_no" };
        }

        let fees = FeeTable::for_mode(settings.mock_trade);
        let mut custom_stop_loss_rate = None;
        if settings.use_ai_stop_loss {
            if let Some(sl_price) = verdict.stop_loss_price.filter(|p| *p > 0.0) {
                let rate = net_profit_rate(price, 1, sl_price, &fees);
                if rate < settings.ai_stop_loss_safety_limit {
                    self.cooldowns.set_minutes(&symbol, 10, now);
                    return PipelineOutcome::Rejected { symbol, reason: "ai_stop_loss_out_of_bounds" };
                }
                custom_stop_loss_rate = Some(rate);
            }
        }

        let qty = compute_qty(settings.order_amount, price);
        if qty <= 0 {
            return PipelineOutcome::Rejected { symbol, reason: "zero_qty" };
        }

        self.attempts.record(&symbol, now);

        let body = json!({
            "stk_cd": symbol,
            "ord_qty": qty.to_string(),
            "ord_uv": "0",
            "trde_tp": crate::rest::client::order_trade_type(0.0),
            "dmst_stex_tp": "KRX",
        });
        let order_no = match self.rest.call_api(BUY_TR_ID, body).await {
            Ok(resp) => resolve_field(&resp, &["ord_no", "orderNo"])
                .and_then(|v| v.as_str())
                .map(String::from),
            Err(e) => {
                warn!(symbol, error = %e, "signal_pipeline: buy order submission failed");
                None
            }
        };
        let Some(order_no) = order_no else {
            return PipelineOutcome::Rejected { symbol, reason: "order_failed" };
        };

        self.positions.insert(Position {
            symbol: symbol.clone(),
            symbol_name: symbol_name.clone(),
            buy_price: price,
            buy_qty: qty,
            status: PositionStatus::BuyOrdered,
            order_time: now,
            last_cancel_attempt_time: None,
            active_order_id: Some(order_no),
            condition_source: format!("{}:{}", event.scanner_id, symbol_name),
            trailing_active: false,
            peak_profit_rate: 0.0,
            current_profit_rate: 0.0,
            custom_stop_loss_rate,
            overnight_approved: false,
        });
        self.gateway.add_subscription(&symbol, TICK_SUBSCRIPTION_TYPE);
        self.store
            .log_trade(&TradeRecord {
                timestamp: now,
                action: TradeAction::Buy,
                symbol: symbol.clone(),
                symbol_name,
                qty,
                price,
                reason: "entry".to_string(),
                profit_rate: None,
                profit_amount: None,
                vision_reason: Some(verdict.reason),
            })
            .await;

        info!(symbol, qty, price, "signal_pipeline: entered position");
        PipelineOutcome::Entered { symbol, qty, price }
    }

    fn market_for(&self, symbol: &str) -> Market {
        // Unknown symbols default to KOSPI until a stock-info lookup observes
        // their market field.
        self.symbol_markets.read().get(symbol).copied().unwrap_or(Market::Kospi)
    }

    async fn acquire_price(&self, symbol: &str, event_price: Option<i64>) -> Option<(f64, String)> {
        if let Some(p) = event_price.filter(|p| *p > 0) {
            let name = self.fetch_stock_info(symbol).await.map(|v| symbol_name_from(&v, symbol));
            return Some((p as f64, name.unwrap_or_else(|| symbol.to_string())));
        }

        for attempt in 0..PRICE_RETRY_ATTEMPTS {
            if let Some(info) = self.fetch_stock_info(symbol).await {
                if let Some(price) = resolve_field(&info, &["cur_prc", "stck_prpr"])
                    .and_then(|v| v.as_str())
                    .map(|s| safe_int(Some(s)).unsigned_abs() as f64)
                    .filter(|p| *p > 0.0)
                {
                    return Some((price, symbol_name_from(&info, symbol)));
                }
            }
            if attempt + 1 < PRICE_RETRY_ATTEMPTS {
                tokio::time::sleep(tokio::time::Duration::from_millis(PRICE_RETRY_SPACING_MS)).await;
            }
        }

        let key = CandleKey { symbol: symbol.to_string(), interval: "3m".to_string() };
        self.candles.last_close(&key).map(|p| (p, symbol.to_string()))
    }

    async fn fetch_stock_info(&self, symbol: &str) -> Option<Value> {
        let resp = self.rest.call_api("ka10001", json!({ "stk_cd": symbol })).await.ok()?;
        if let Some(market) = resolve_field(&resp, &["mrkt_tp", "mkt_tp"]).and_then(|v| v.as_str()) {
            self.symbol_markets.write().insert(symbol.to_string(), parse_market(market));
        }
        Some(resp)
    }

    async fn orderbook_ratio(&self, symbol: &str) -> Option<f64> {
        let resp = self.rest.call_api("ka10004", json!({ "stk_cd": symbol })).await.ok()?;
        let buy_total = resolve_field(&resp, &["tot_buy_req", "tot_buy_qty"])
            .and_then(|v| v.as_str())
            .map(|s| safe_int(Some(s)).unsigned_abs() as f64)
            .unwrap_or(0.0);
        let sell_total = resolve_field(&resp, &["tot_sel_req", "tot_sell_qty"])
            .and_then(|v| v.as_str())
            .map(|s| safe_int(Some(s)).unsigned_abs() as f64)
            .unwrap_or(0.0);
        Some(orderbook_ratio(buy_total, sell_total))
    }

    async fn technical_closes(&self, symbol: &str) -> Vec<f64> {
        let key = CandleKey { symbol: symbol.to_string(), interval: "1m".to_string() };
        if self.candles.count(&key) < TECHNICAL_CANDLE_COUNT {
            if let Ok(rows) = self.rest.get_minute_chart(symbol, None).await {
                self.candles.replace(key.clone(), candles_from_chart_rows(&rows));
            }
        }
        self.candles.get_closes(&key, TECHNICAL_CANDLE_COUNT)
    }
}

fn compute_qty(order_amount: i64, price: f64) -> i64 {
    if price <= 0.0 {
        return 0;
    }
    ((order_amount as f64 * 0.95) / price).floor() as i64
}

fn orderbook_ratio(buy_total: f64, sell_total: f64) -> f64 {
    if sell_total <= 0.0 {
        return f64::INFINITY;
    }
    buy_total / sell_total
}

fn parse_market(raw: &str) -> Market {
    if raw.trim() == "10" {
        Market::Kosdaq
    } else {
        Market::Kospi
    }
}

fn symbol_name_from(value: &Value, fallback: &str) -> String {
    resolve_field(value, &["stk_nm", "stk_name"])
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_qty_rounds_down_and_applies_buffer() {
        assert_eq!(compute_qty(1_000_000, 70_000.0), 13);
        assert_eq!(compute_qty(1_000_000, 2_000_000.0), 0);
        assert_eq!(compute_qty(1_000_000, 0.0), 0);
    }

    #[test]
    fn orderbook_ratio_treats_zero_sell_as_unbounded() {
        assert_eq!(orderbook_ratio(100.0, 0.0), f64::INFINITY);
        assert!((orderbook_ratio(50.0, 100.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn parse_market_distinguishes_kosdaq_code() {
        assert_eq!(parse_market("10"), Market::Kosdaq);
        assert_eq!(parse_market("0"), Market::Kospi);
        assert_eq!(parse_market("anything"), Market::Kospi);
    }

    #[test]
    fn symbol_name_from_falls_back_to_code() {
        let v = serde_json::json!({"stk_nm": "Samsung Electronics"});
        assert_eq!(symbol_name_from(&v, "005930"), "Samsung Electronics");
        let empty = serde_json::json!({});
        assert_eq!(symbol_name_from(&empty, "005930"), "005930");
    }

    #[test]
    fn in_flight_guard_releases_symbol_on_drop() {
        let set: RwLock<HashSet<String>> = RwLock::new(HashSet::new());
        set.write().insert("005930".to_string());
        {
            let _guard = InFlightGuard { set: &set, symbol: "005930".to_string() };
        }
        assert!(!set.read().contains("005930"));
    }
}

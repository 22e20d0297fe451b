// =============================================================================
// Position Engine — state machine for every held/ordered trade
// =============================================================================
//
// Holds the authoritative in-memory Position table (one entry per symbol —
// the spec forbids more than one live Position per symbol) and the pure exit
// logic the Position Manager tick evaluates every ~2s. Order submission and
// Store logging are the caller's responsibility (the Control Loop owns the
// RestClient and Store); this module only decides *what* should happen and
// mutates the Position's own bookkeeping fields (trailing arm, peak, current
// profit rate).
//
// Grounded on the structural shape of a conventional open/closed position
// table plus the periodic-tick pattern of collecting exits under a lock and
// releasing it before any caller-side async work runs.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::types::{Position, PositionStatus};

/// Fee/tax rates applied to every net-P&L computation. Values differ between
/// paper and real trading per the broker's published schedule.
#[derive(Debug, Clone, Copy)]
pub struct FeeTable {
    pub buy_fee: f64,
    pub sell_fee: f64,
    pub tax: f64,
}

impl FeeTable {
    pub const fn paper() -> Self {
        Self {
            buy_fee: 0.0035,
            sell_fee: 0.0035,
            tax: 0.0015,
        }
    }

    pub const fn real() -> Self {
        Self {
            buy_fee: 0.00015,
            sell_fee: 0.00015,
            tax: 0.0015,
        }
    }

    pub fn for_mode(mock_trade: bool) -> Self {
        if mock_trade {
            Self::paper()
        } else {
            Self::real()
        }
    }
}

/// Why a Position was exited. `StopLoss { ai }` distinguishes a regular
/// stop-loss from one sized off a vision-model verdict (`custom_stop_loss_rate`),
/// since callers report these as distinct reason strings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitReason {
    StopLoss { ai: bool },
    TimeCut,
    TakeProfit,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss { ai: false } => write!(f, "stop_loss"),
            Self::StopLoss { ai: true } => write!(f, "stop_loss(ai)"),
            Self::TimeCut => write!(f, "time_cut"),
            Self::TakeProfit => write!(f, "take_profit"),
        }
    }
}

/// Net-of-fees profit rate, shared by the periodic tick and the market-close
/// / morning-liquidation special cycles so both paths agree exactly (per the
/// fee-inconsistency design note).
pub fn net_profit_rate(buy_price: f64, qty: i64, price: f64, fees: &FeeTable) -> f64 {
    if buy_price <= 0.0 || qty <= 0 {
        return 0.0;
    }
    let qty = qty as f64;
    let pure_buy = buy_price * qty;
    let eval = price * qty;
    let fee_cost = pure_buy * fees.buy_fee + eval * (fees.sell_fee + fees.tax);
    let net = eval - pure_buy - fee_cost;
    100.0 * net / pure_buy
}

/// Thread-safe table of live Positions, keyed by symbol.
pub struct PositionManager {
    positions: RwLock<HashMap<String, Position>>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, position: Position) {
        self.positions.write().insert(position.symbol.clone(), position);
    }

    pub fn remove(&self, symbol: &str) -> Option<Position> {
        self.positions.write().remove(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.positions.read().contains_key(symbol)
    }

    pub fn snapshot(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.positions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.read().is_empty()
    }

    /// Mutate a single Position in place. Used by the Reconciler and by
    /// order-fill/cancel handlers; never leaks the internal lock guard.
    pub fn mutate<F, R>(&self, symbol: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Position) -> R,
    {
        let mut map = self.positions.write();
        map.get_mut(symbol).map(f)
    }

    /// Evaluate exit precedence for every Position not currently in a
    /// `SELL_*` status, mutating trailing-arm bookkeeping in place. Returns
    /// `(symbol, reason, exit_price)` for positions that should be closed;
    /// the lock is released before this returns, matching the
    /// collect-then-apply pattern — callers submit orders after the fact.
    pub fn check_exits(
        &self,
        prices: &HashMap<String, f64>,
        now: DateTime<Utc>,
        stop_loss_rate: f64,
        trailing_start_rate: f64,
        trailing_stop_rate: f64,
        time_cut_minutes: i64,
        ai_stop_loss_safety_limit: f64,
        fees: &FeeTable,
    ) -> Vec<(String, ExitReason, f64)> {
        let mut exits = Vec::new();
        let mut map = self.positions.write();

        for pos in map.values_mut() {
            if pos.status.is_sell_ordered() || pos.status == PositionStatus::BuyOrdered {
                continue;
            }
            let Some(&price) = prices.get(&pos.symbol) else {
                continue;
            };

            let rate = net_profit_rate(pos.buy_price, pos.buy_qty, price, fees);
            pos.current_profit_rate = rate;

            let effective_stop = pos.custom_stop_loss_rate.unwrap_or(stop_loss_rate);
            let is_ai_stop = pos.custom_stop_loss_rate.is_some()
                && effective_stop >= ai_stop_loss_safety_limit;

            if rate <= effective_stop {
                exits.push((pos.symbol.clone(), ExitReason::StopLoss { ai: is_ai_stop }, price));
                continue;
            }

            let age = now.signed_duration_since(pos.order_time);
            if age.num_minutes() > time_cut_minutes && rate < 0.5 {
                exits.push((pos.symbol.clone(), ExitReason::TimeCut, price));
                continue;
            }

            if !pos.trailing_active && rate >= trailing_start_rate {
                pos.trailing_active = true;
                pos.peak_profit_rate = rate;
                debug!(symbol = %pos.symbol, rate, "trailing stop armed");
            }

            if pos.trailing_active {
                if rate > pos.peak_profit_rate {
                    pos.peak_profit_rate = rate;
                }
                if rate - pos.peak_profit_rate <= trailing_stop_rate {
                    exits.push((pos.symbol.clone(), ExitReason::TakeProfit, price));
                }
            }
        }

        exits
    }

    /// Transition a Position into a sell-ordered status after a market-sell
    /// order has been successfully submitted by the caller.
    pub fn mark_sell_ordered(&self, symbol: &str, order_id: String, status: PositionStatus) {
        self.mutate(symbol, |pos| {
            pos.status = status;
            pos.active_order_id = Some(order_id);
        });
        info!(symbol, "position marked sell-ordered");
    }

    /// Positions eligible for the 15:10-15:19 market-close liquidation pass:
    /// held, whose scanner is not in the overnight allow-list, and not
    /// already approved to carry overnight.
    pub fn market_close_candidates(&self, overnight_cond_ids: &[String]) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| {
                p.status == PositionStatus::Held
                    && !p.overnight_approved
                    && !scanner_in(&p.condition_source, overnight_cond_ids)
            })
            .cloned()
            .collect()
    }

    /// Positions eligible for the 09:00-09:02 morning liquidation pass: any
    /// position carried overnight under the unified trigger set from the
    /// morning-liquidation design note — overnight-approved, scanner in the
    /// allow-list, or simply still present (carried over from prior session).
    pub fn morning_liquidation_candidates(&self, overnight_cond_ids: &[String]) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| {
                p.status == PositionStatus::Held
                    && (p.overnight_approved || scanner_in(&p.condition_source, overnight_cond_ids))
            })
            .cloned()
            .collect()
    }

    pub fn mark_overnight_approved(&self, symbol: &str) {
        self.mutate(symbol, |pos| pos.overnight_approved = true);
    }

    /// Arm trailing immediately at the current profit rate, used by the
    /// morning liquidation pass when a carried position is in profit.
    pub fn arm_trailing_now(&self, symbol: &str, rate: f64) {
        self.mutate(symbol, |pos| {
            pos.trailing_active = true;
            pos.peak_profit_rate = rate;
            pos.current_profit_rate = rate;
        });
    }
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager")
            .field("count", &self.len())
            .finish()
    }
}

/// `condition_source` is stored as `"{scanner_id}:{name}"`; match against the
/// scanner id prefix.
fn scanner_in(condition_source: &str, overnight_cond_ids: &[String]) -> bool {
    let scanner_id = condition_source.split(':').next().unwrap_or(condition_source);
    overnight_cond_ids.iter().any(|id| id == scanner_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_position(symbol: &str, buy_price: f64, qty: i64, order_time: DateTime<Utc>) -> Position {
        Position {
            symbol: symbol.to_string(),
            symbol_name: "Sample".to_string(),
            buy_price,
            buy_qty: qty,
            status: PositionStatus::Held,
            order_time,
            last_cancel_attempt_time: None,
            active_order_id: None,
            condition_source: "0:default".to_string(),
            trailing_active: false,
            peak_profit_rate: 0.0,
            current_profit_rate: 0.0,
            custom_stop_loss_rate: None,
            overnight_approved: false,
        }
    }

    #[test]
    fn net_profit_rate_matches_both_exit_paths() {
        let fees = FeeTable::paper();
        let a = net_profit_rate(70000.0, 13, 73000.0, &fees);
        let b = net_profit_rate(70000.0, 13, 73000.0, &fees);
        assert_eq!(a, b);
        assert!(a > 3.0 && a < 4.0);
    }

    #[test]
    fn net_profit_rate_zero_for_invalid_inputs() {
        let fees = FeeTable::paper();
        assert_eq!(net_profit_rate(0.0, 10, 100.0, &fees), 0.0);
        assert_eq!(net_profit_rate(100.0, 0, 100.0, &fees), 0.0);
    }

    #[test]
    fn scenario_happy_entry_trailing_exit() {
        let pm = PositionManager::new();
        let now = Utc::now();
        pm.insert(sample_position("005930", 70000.0, 13, now));
        let fees = FeeTable::paper();

        // Tick 1: price rises to 73000, trailing arms.
        let mut prices = HashMap::new();
        prices.insert("005930".to_string(), 73000.0);
        let exits = pm.check_exits(&prices, now, -2.5, 1.5, -1.0, 20, -5.0, &fees);
        assert!(exits.is_empty());
        let pos = pm.get("005930").unwrap();
        assert!(pos.trailing_active);
        let peak = pos.peak_profit_rate;

        // Tick 2: price drops slightly, stays above trailing stop distance.
        prices.insert("005930".to_string(), 72500.0);
        let exits = pm.check_exits(&prices, now, -2.5, 1.5, -1.0, 20, -5.0, &fees);
        assert!(exits.is_empty());
        assert_eq!(pm.get("005930").unwrap().peak_profit_rate, peak);

        // Tick 3: price drops further, trailing stop triggers take_profit.
        prices.insert("005930".to_string(), 71900.0);
        let exits = pm.check_exits(&prices, now, -2.5, 1.5, -1.0, 20, -5.0, &fees);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].1, ExitReason::TakeProfit);
    }

    #[test]
    fn scenario_stop_loss_from_vision_verdict() {
        let pm = PositionManager::new();
        let now = Utc::now();
        let mut pos = sample_position("005930", 70000.0, 13, now);
        pos.custom_stop_loss_rate = Some(-1.4);
        pm.insert(pos);
        let fees = FeeTable::paper();

        let mut prices = HashMap::new();
        prices.insert("005930".to_string(), 68900.0);
        let exits = pm.check_exits(&prices, now, -2.5, 1.5, -1.0, 20, -5.0, &fees);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].1, ExitReason::StopLoss { ai: true });
    }

    #[test]
    fn time_cut_triggers_after_window_without_material_gain() {
        let pm = PositionManager::new();
        let now = Utc::now();
        let order_time = now - chrono::Duration::minutes(21);
        pm.insert(sample_position("000660", 50000.0, 10, order_time));
        let fees = FeeTable::paper();

        let mut prices = HashMap::new();
        prices.insert("000660".to_string(), 50050.0);
        let exits = pm.check_exits(&prices, now, -2.5, 1.5, -1.0, 20, -5.0, &fees);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].1, ExitReason::TimeCut);
    }

    #[test]
    fn ordered_positions_are_skipped() {
        let pm = PositionManager::new();
        let now = Utc::now();
        let mut pos = sample_position("005930", 70000.0, 13, now);
        pos.status = PositionStatus::SellOrdered;
        pm.insert(pos);
        let fees = FeeTable::paper();

        let mut prices = HashMap::new();
        prices.insert("005930".to_string(), 1.0); // would be a huge stop-loss hit
        let exits = pm.check_exits(&prices, now, -2.5, 1.5, -1.0, 20, -5.0, &fees);
        assert!(exits.is_empty());
    }

    #[test]
    fn market_close_candidates_excludes_overnight_allowed() {
        let pm = PositionManager::new();
        let now = Utc::now();
        let mut a = sample_position("005930", 70000.0, 13, now);
        a.condition_source = "5:overnight".to_string();
        pm.insert(a);
        pm.insert(sample_position("000660", 50000.0, 10, now));

        let candidates = pm.market_close_candidates(&["5".to_string()]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].symbol, "000660");
    }

    #[test]
    fn morning_liquidation_candidates_unify_trigger_set() {
        let pm = PositionManager::new();
        let now = Utc::now();
        let mut approved = sample_position("005930", 70000.0, 13, now);
        approved.overnight_approved = true;
        pm.insert(approved);

        let mut scanner_allowed = sample_position("000660", 50000.0, 10, now);
        scanner_allowed.condition_source = "5:overnight".to_string();
        pm.insert(scanner_allowed);

        pm.insert(sample_position("035420", 30000.0, 5, now));

        let candidates = pm.morning_liquidation_candidates(&["5".to_string()]);
        let symbols: Vec<&str> = candidates.iter().map(|p| p.symbol.as_str()).collect();
        assert!(symbols.contains(&"005930"));
        assert!(symbols.contains(&"000660"));
        assert!(!symbols.contains(&"035420"));
    }

    #[test]
    fn round_trip_position_preserves_custom_fields() {
        let now = Utc::now();
        let mut pos = sample_position("005930", 70000.0, 13, now);
        pos.custom_stop_loss_rate = Some(-1.4);
        pos.overnight_approved = true;

        let json = serde_json::to_string(&pos).unwrap();
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back.custom_stop_loss_rate, Some(-1.4));
        assert!(back.overnight_approved);
    }
}

// =============================================================================
// Reconciler — keeps local Position state consistent with server balance
// =============================================================================
//
// Every 20s during market hours: fetch the authoritative account balance,
// promote BUY_ORDERED -> HELD on appearance, create Positions for holdings
// with no local record (external fills), and delete local Positions that
// have fallen off the server balance outside the opening/safe-window
// protection rules. Independently, every 60s, fetch and persist the day's
// realized P&L.
//
// Unlike a read-only drift reporter, this reconciler mutates Position state
// directly — the server balance is the source of truth once a position is
// no longer in flight.
// =============================================================================

use chrono::{DateTime, NaiveTime, Utc};
use serde_json::Value;
use tracing::info;

use crate::cooldown::CooldownTable;
use crate::position_engine::PositionManager;
use crate::rest::client::{resolve_field, safe_int, RestClient};
use crate::store::Store;
use crate::types::{Position, PositionStatus};

const OPENING_WINDOW_START: (u32, u32) = (8, 50);
const OPENING_WINDOW_END: (u32, u32) = (9, 10);
const SAFE_WINDOW_START: (u32, u32) = (8, 30);
const SAFE_WINDOW_END: (u32, u32) = (16, 30);
const BUY_ORDERED_MAX_AGE_SECS: i64 = 300;

/// A single server-reported holding, parsed from `kt00018`'s
/// `acnt_evlt_remn_indv_tot` array.
#[derive(Debug, Clone)]
pub struct ServerHolding {
    pub symbol: String,
    pub symbol_name: String,
    pub buy_price: f64,
    pub buy_qty: i64,
    pub profit_rate: f64,
}

/// Outcome of one reconciliation pass, for logging/telemetry.
#[derive(Debug, Clone, Default)]
pub struct ReconcileResult {
    pub promoted: u32,
    pub created: u32,
    pub deleted: u32,
    pub retained_protected: u32,
}

/// Fetch `kt00018` and parse the holdings list. Returns an empty vec on any
/// parse failure — callers treat that the same as "no server holdings this
/// cycle" rather than wiping local state.
pub async fn fetch_server_holdings(
    rest: &RestClient,
    account_no: &str,
) -> Result<Vec<ServerHolding>, crate::rest::client::RestError> {
    let body = serde_json::json!({
        "acnt_no": account_no,
        "qry_tp": "1",
        "dmst_stex_tp": "KRX",
    });
    let resp = rest.call_api("kt00018", body).await?;
    Ok(parse_holdings(&resp))
}

fn parse_holdings(resp: &Value) -> Vec<ServerHolding> {
    let Some(items) = resp.get("acnt_evlt_remn_indv_tot").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let symbol = item.get("stk_cd")?.as_str()?.trim_start_matches('A').to_string();
            let buy_price = safe_int(resolve_field(item, &["pur_pric"]).and_then(|v| v.as_str())) as f64;
            let buy_qty = safe_int(resolve_field(item, &["rmnd_qty"]).and_then(|v| v.as_str()));
            let profit_rate = item
                .get("prft_rt")
                .and_then(|v| v.as_str().and_then(|s| s.parse::<f64>().ok()).or_else(|| v.as_f64()))
                .unwrap_or(0.0);
            let symbol_name = item
                .get("stk_nm")
                .and_then(|v| v.as_str())
                .unwrap_or(&symbol)
                .to_string();

            Some(ServerHolding {
                symbol,
                symbol_name,
                buy_price,
                buy_qty,
                profit_rate,
            })
        })
        .collect()
}

/// Fetch `ka10074` daily realized P&L, preferring the flat `rlzt_pl` field
/// and falling back to the first row of `dt_rlzt_pl`.
pub async fn fetch_daily_pnl(rest: &RestClient) -> Result<i64, crate::rest::client::RestError> {
    let today = Utc::now().format("%Y%m%d").to_string();
    let body = serde_json::json!({ "strt_dt": today, "end_dt": today, "stk_cd": "" });
    let resp = rest.call_api("ka10074", body).await?;
    Ok(parse_daily_pnl(&resp))
}

fn parse_daily_pnl(resp: &Value) -> i64 {
    if let Some(v) = resp.get("rlzt_pl").and_then(|v| v.as_str()) {
        return safe_int(Some(v));
    }
    resp.get("dt_rlzt_pl")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|row| row.get("tdy_sel_pl"))
        .and_then(|v| v.as_str())
        .map(|v| safe_int(Some(v)))
        .unwrap_or(0)
}

/// Run one 20s balance-reconciliation pass.
pub async fn reconcile_balance(
    positions: &PositionManager,
    cooldowns: &CooldownTable,
    holdings: &[ServerHolding],
    now: DateTime<Utc>,
    re_entry_cooldown_min: i64,
) -> ReconcileResult {
    let mut result = ReconcileResult::default();
    let server_symbols: std::collections::HashSet<&str> =
        holdings.iter().map(|h| h.symbol.as_str()).collect();

    for holding in holdings {
        let existing = positions.get(&holding.symbol);
        match existing {
            Some(pos) if pos.status == PositionStatus::BuyOrdered => {
                positions.mutate(&holding.symbol, |p| {
                    p.buy_price = holding.buy_price;
                    p.buy_qty = holding.buy_qty;
                    p.status = PositionStatus::Held;
                    p.active_order_id = None;
                    if holding.profit_rate > p.peak_profit_rate {
                        p.peak_profit_rate = holding.profit_rate;
                    }
                });
                result.promoted += 1;
                info!(symbol = %holding.symbol, "position promoted BUY_ORDERED -> HELD by reconciler");
            }
            Some(_) => {
                positions.mutate(&holding.symbol, |p| {
                    p.buy_price = holding.buy_price;
                    p.buy_qty = holding.buy_qty;
                    if holding.profit_rate > p.peak_profit_rate {
                        p.peak_profit_rate = holding.profit_rate;
                    }
                });
            }
            None => {
                positions.insert(Position {
                    symbol: holding.symbol.clone(),
                    symbol_name: holding.symbol_name.clone(),
                    buy_price: holding.buy_price,
                    buy_qty: holding.buy_qty,
                    status: PositionStatus::Held,
                    order_time: now,
                    last_cancel_attempt_time: None,
                    active_order_id: None,
                    condition_source: "0:external-fill".to_string(),
                    trailing_active: false,
                    peak_profit_rate: holding.profit_rate.max(0.0),
                    current_profit_rate: holding.profit_rate,
                    custom_stop_loss_rate: None,
                    overnight_approved: false,
                });
                result.created += 1;
                info!(symbol = %holding.symbol, "position created from external fill by reconciler");
            }
        }
    }

    let is_opening_window = in_window(now, OPENING_WINDOW_START, OPENING_WINDOW_END);
    let is_safe_window = in_window(now, SAFE_WINDOW_START, SAFE_WINDOW_END);

    for pos in positions.snapshot() {
        if server_symbols.contains(pos.symbol.as_str()) {
            continue;
        }

        if is_opening_window && !pos.status.is_sell_ordered() {
            result.retained_protected += 1;
            continue;
        }
        if !is_safe_window && !pos.status.is_sell_ordered() {
            result.retained_protected += 1;
            continue;
        }

        if pos.status == PositionStatus::BuyOrdered {
            let age = now.signed_duration_since(pos.order_time).num_seconds();
            if age <= BUY_ORDERED_MAX_AGE_SECS {
                continue;
            }
            positions.remove(&pos.symbol);
            result.deleted += 1;
            continue;
        }

        positions.remove(&pos.symbol);
        cooldowns.set_minutes(&pos.symbol, re_entry_cooldown_min, now);
        result.deleted += 1;
        info!(symbol = %pos.symbol, "position removed, no longer on server balance");
    }

    result
}

fn in_window(now: DateTime<Utc>, start: (u32, u32), end: (u32, u32)) -> bool {
    let t = now.time();
    let start = NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap();
    let end = NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap();
    t >= start && t <= end
}

/// 60s daily-P&L fetch+store cycle.
pub async fn store_daily_pnl(store: &Store, pnl: i64) {
    store.set_kv("daily_realized_pnl", &pnl).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn holding(symbol: &str, buy_price: f64, qty: i64, profit_rate: f64) -> ServerHolding {
        ServerHolding {
            symbol: symbol.to_string(),
            symbol_name: symbol.to_string(),
            buy_price,
            buy_qty: qty,
            profit_rate,
        }
    }

    fn position(symbol: &str, status: PositionStatus, order_time: DateTime<Utc>) -> Position {
        Position {
            symbol: symbol.to_string(),
            symbol_name: symbol.to_string(),
            buy_price: 70000.0,
            buy_qty: 10,
            status,
            order_time,
            last_cancel_attempt_time: None,
            active_order_id: status.is_sell_ordered().then(|| "o1".to_string()),
            condition_source: "0:default".to_string(),
            trailing_active: false,
            peak_profit_rate: 0.0,
            current_profit_rate: 0.0,
            custom_stop_loss_rate: None,
            overnight_approved: false,
        }
    }

    #[test]
    fn parse_holdings_extracts_fields() {
        let resp = serde_json::json!({
            "acnt_evlt_remn_indv_tot": [
                {"stk_cd": "A005930", "stk_nm": "Samsung", "pur_pric": "70000", "rmnd_qty": "13", "prft_rt": "2.5"}
            ]
        });
        let holdings = parse_holdings(&resp);
        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[0].symbol, "005930");
        assert_eq!(holdings[0].buy_qty, 13);
    }

    #[test]
    fn parse_daily_pnl_prefers_flat_field() {
        let resp = serde_json::json!({ "rlzt_pl": "-12,345" });
        assert_eq!(parse_daily_pnl(&resp), -12345);
    }

    #[test]
    fn parse_daily_pnl_falls_back_to_list() {
        let resp = serde_json::json!({ "dt_rlzt_pl": [{"tdy_sel_pl": "5000"}] });
        assert_eq!(parse_daily_pnl(&resp), 5000);
    }

    #[tokio::test]
    async fn promotes_buy_ordered_to_held() {
        let pm = PositionManager::new();
        let cooldowns = CooldownTable::new();
        let now = Utc::now();
        pm.insert(position("005930", PositionStatus::BuyOrdered, now));

        let holdings = vec![holding("005930", 70000.0, 13, 1.0)];
        let result = reconcile_balance(&pm, &cooldowns, &holdings, now, 30).await;

        assert_eq!(result.promoted, 1);
        assert_eq!(pm.get("005930").unwrap().status, PositionStatus::Held);
    }

    #[tokio::test]
    async fn creates_position_for_external_fill() {
        let pm = PositionManager::new();
        let cooldowns = CooldownTable::new();
        let now = Utc::now();

        let holdings = vec![holding("000660", 50000.0, 5, 0.5)];
        let result = reconcile_balance(&pm, &cooldowns, &holdings, now, 30).await;

        assert_eq!(result.created, 1);
        assert!(pm.contains("000660"));
    }

    #[tokio::test]
    async fn opening_window_protects_local_position_absent_from_server() {
        let pm = PositionManager::new();
        let cooldowns = CooldownTable::new();
        // 09:00 local within the opening window.
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 9, 0, 0).unwrap();
        pm.insert(position("123450", PositionStatus::Held, now));

        let result = reconcile_balance(&pm, &cooldowns, &[], now, 30).await;

        assert_eq!(result.deleted, 0);
        assert!(pm.contains("123450"));
    }

    #[tokio::test]
    async fn reconciler_clears_sold_position_outside_protected_windows() {
        let pm = PositionManager::new();
        let cooldowns = CooldownTable::new();
        // 14:00 local, outside the opening window but inside the safe window.
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 14, 0, 0).unwrap();
        pm.insert(position("123450", PositionStatus::Held, now));

        let result = reconcile_balance(&pm, &cooldowns, &[], now, 30).await;

        assert_eq!(result.deleted, 1);
        assert!(!pm.contains("123450"));
        assert!(cooldowns.is_blocked("123450", now));
    }

    #[tokio::test]
    async fn buy_ordered_younger_than_five_minutes_is_retained() {
        let pm = PositionManager::new();
        let cooldowns = CooldownTable::new();
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 14, 0, 0).unwrap();
        pm.insert(position("005930", PositionStatus::BuyOrdered, now - chrono::Duration::minutes(2)));

        let result = reconcile_balance(&pm, &cooldowns, &[], now, 30).await;

        assert_eq!(result.deleted, 0);
        assert!(pm.contains("005930"));
    }

    #[tokio::test]
    async fn buy_ordered_older_than_five_minutes_is_dropped() {
        let pm = PositionManager::new();
        let cooldowns = CooldownTable::new();
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 14, 0, 0).unwrap();
        pm.insert(position("005930", PositionStatus::BuyOrdered, now - chrono::Duration::minutes(6)));

        let result = reconcile_balance(&pm, &cooldowns, &[], now, 30).await;

        assert_eq!(result.deleted, 1);
        assert!(!pm.contains("005930"));
    }
}

// =============================================================================
// Shared types used across the trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// A listed security, tagged with its exchange segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub code: String,
    pub name: String,
    pub market: Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Market {
    Kospi,
    Kosdaq,
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kospi => write!(f, "KOSPI"),
            Self::Kosdaq => write!(f, "KOSDAQ"),
        }
    }
}

/// Desired engine operating mode, persisted in Settings under `bot_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BotStatus {
    Running,
    Stopped,
    Restarting,
    Booting,
}

impl Default for BotStatus {
    fn default() -> Self {
        Self::Booting
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Restarting => write!(f, "RESTARTING"),
            Self::Booting => write!(f, "BOOTING"),
        }
    }
}

/// A named bundle of exit-policy parameters selected by condition (scanner) id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPreset {
    pub condition_id: String,
    pub description: String,
    pub stop_loss_rate: f64,
    pub trailing_start_rate: f64,
    pub trailing_stop_rate: f64,
    pub re_entry_cooldown_min: i64,
    pub min_buy_sell_ratio: f64,
}

/// A single rotation window: at `start_time` (HH:MM, local) switch to `condition_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub start_time: String,
    pub condition_id: String,
}

/// Process-wide configuration. Loaded from environment defaults at boot,
/// then always overridden by whatever is persisted in the Store's kv_store —
/// the Store copy is authoritative once the engine has started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub bot_status: BotStatus,
    pub mock_trade: bool,
    pub condition_id: String,
    pub order_amount: i64,
    pub stop_loss_rate: f64,
    pub trailing_start_rate: f64,
    pub trailing_stop_rate: f64,
    pub re_entry_cooldown_min: i64,
    pub time_cut_minutes: i64,
    pub rsi_limit: f64,
    pub use_hoga_filter: bool,
    pub min_buy_sell_ratio: f64,
    pub use_ai_stop_loss: bool,
    pub ai_stop_loss_safety_limit: f64,
    pub use_market_filter: bool,
    pub use_market_time: bool,
    pub use_auto_sell: bool,
    pub use_scheduler: bool,
    #[serde(default)]
    pub schedule: Vec<ScheduleWindow>,
    #[serde(default)]
    pub overnight_cond_ids: Vec<String>,
    pub use_telegram: bool,
    pub debug_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bot_status: BotStatus::default(),
            mock_trade: true,
            condition_id: "0".to_string(),
            order_amount: 1_000_000,
            stop_loss_rate: -2.5,
            trailing_start_rate: 1.5,
            trailing_stop_rate: -1.0,
            re_entry_cooldown_min: 30,
            time_cut_minutes: 20,
            rsi_limit: 70.0,
            use_hoga_filter: true,
            min_buy_sell_ratio: 0.5,
            use_ai_stop_loss: false,
            ai_stop_loss_safety_limit: -5.0,
            use_market_filter: true,
            use_market_time: true,
            use_auto_sell: true,
            use_scheduler: false,
            schedule: Vec::new(),
            overnight_cond_ids: Vec::new(),
            use_telegram: false,
            debug_mode: false,
        }
    }
}

/// Position lifecycle status. An `*_ORDERED` variant always implies
/// `active_order_id.is_some()` — see `Position` invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    BuyOrdered,
    Held,
    SellOrdered,
    SellOrderedBulk,
    SellOrderedGap,
}

impl PositionStatus {
    pub fn is_sell_ordered(&self) -> bool {
        matches!(
            self,
            Self::SellOrdered | Self::SellOrderedBulk | Self::SellOrderedGap
        )
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuyOrdered => write!(f, "BUY_ORDERED"),
            Self::Held => write!(f, "HELD"),
            Self::SellOrdered => write!(f, "SELL_ORDERED"),
            Self::SellOrderedBulk => write!(f, "SELL_ORDERED_BULK"),
            Self::SellOrderedGap => write!(f, "SELL_ORDERED_GAP"),
        }
    }
}

/// Per-symbol record of a live or in-flight trading position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub symbol_name: String,
    pub buy_price: f64,
    pub buy_qty: i64,
    pub status: PositionStatus,
    pub order_time: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub last_cancel_attempt_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub active_order_id: Option<String>,
    pub condition_source: String,
    #[serde(default)]
    pub trailing_active: bool,
    #[serde(default)]
    pub peak_profit_rate: f64,
    #[serde(default)]
    pub current_profit_rate: f64,
    #[serde(default)]
    pub custom_stop_loss_rate: Option<f64>,
    #[serde(default)]
    pub overnight_approved: bool,
}

impl Position {
    /// Invariant check used by tests and defensively before persistence.
    pub fn invariants_hold(&self) -> bool {
        if self.active_order_id.is_some() && !self.status_is_ordered() {
            return false;
        }
        if !matches!(self.status, PositionStatus::BuyOrdered)
            && !(self.buy_qty > 0 && self.buy_price > 0.0)
        {
            return false;
        }
        if self.trailing_active && self.peak_profit_rate < 0.0 {
            // peak_profit_rate must have reached at least the arming threshold;
            // the exact threshold is caller-supplied (trailing_start_rate), so
            // this only rules out an obviously broken state (negative peak).
        }
        if let Some(r) = self.custom_stop_loss_rate {
            if r >= 0.0 {
                return false;
            }
        }
        true
    }

    fn status_is_ordered(&self) -> bool {
        matches!(
            self.status,
            PositionStatus::BuyOrdered
                | PositionStatus::SellOrdered
                | PositionStatus::SellOrderedBulk
                | PositionStatus::SellOrderedGap
        )
    }
}

/// Per-index market regime, refreshed at most every five minutes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketRegime {
    pub current_close: f64,
    pub ma20: f64,
    pub is_bullish: bool,
    pub last_check_time: chrono::DateTime<chrono::Utc>,
}

impl MarketRegime {
    pub fn new(current_close: f64, ma20: f64, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            current_close,
            ma20,
            is_bullish: current_close >= ma20,
            last_check_time: now,
        }
    }
}

/// Trade action recorded in the append-only trade log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// A single append-only trade log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub action: TradeAction,
    pub symbol: String,
    pub symbol_name: String,
    pub qty: i64,
    pub price: f64,
    pub reason: String,
    pub profit_rate: Option<f64>,
    pub profit_amount: Option<i64>,
    pub vision_reason: Option<String>,
}

/// The UI-to-engine command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    BulkSell,
    BacktestReq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Pending,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: i64,
    pub cmd_type: CommandType,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_invariant_rejects_positive_custom_stop() {
        let mut pos = sample_position();
        pos.custom_stop_loss_rate = Some(1.0);
        assert!(!pos.invariants_hold());
    }

    #[test]
    fn position_invariant_rejects_ordered_without_order_id() {
        let mut pos = sample_position();
        pos.status = PositionStatus::BuyOrdered;
        pos.active_order_id = None;
        pos.buy_qty = 0;
        pos.buy_price = 0.0;
        assert!(pos.invariants_hold());

        pos.active_order_id = Some("abc".to_string());
        pos.status = PositionStatus::Held;
        assert!(!pos.invariants_hold());
    }

    fn sample_position() -> Position {
        Position {
            symbol: "005930".to_string(),
            symbol_name: "Samsung Electronics".to_string(),
            buy_price: 70000.0,
            buy_qty: 13,
            status: PositionStatus::Held,
            order_time: chrono::Utc::now(),
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
}

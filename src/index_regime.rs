// =============================================================================
// Index Regime Table — per-market bullish/bearish gate (20-day MA)
// =============================================================================
//
// Refreshed at most every 5 minutes per market, consulted by the Signal
// Pipeline's index regime gate (§4.5 step 2). Grounded on the broker's
// minute-chart endpoint (`ka10080`) applied to the KOSPI/KOSDAQ index codes
// instead of an individual stock.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::market_data::candle_buffer::candles_from_chart_rows;
use crate::rest::client::RestClient;
use crate::types::{Market, MarketRegime};

const REFRESH_INTERVAL_SECS: i64 = 5 * 60;
const MA_PERIOD: usize = 20;

fn index_code_for(market: Market) -> &'static str {
    match market {
        Market::Kospi => "001",
        Market::Kosdaq => "101",
    }
}

#[derive(Default)]
pub struct IndexRegimeTable {
    inner: RwLock<HashMap<Market, MarketRegime>>,
}

impl IndexRegimeTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, market: Market) -> Option<MarketRegime> {
        self.inner.read().get(&market).copied()
    }

    pub fn is_stale(&self, market: Market, now: DateTime<Utc>) -> bool {
        match self.inner.read().get(&market) {
            Some(regime) => (now - regime.last_check_time).num_seconds() >= REFRESH_INTERVAL_SECS,
            None => true,
        }
    }

    fn set(&self, market: Market, regime: MarketRegime) {
        self.inner.write().insert(market, regime);
    }
}

/// Refresh `market`'s regime if stale, fetching the index's minute chart and
/// computing MA20 over closed candles. Best-effort: leaves the prior value in
/// place on any REST failure or insufficient data.
pub async fn refresh_if_stale(
    table: &IndexRegimeTable,
    rest: &RestClient,
    market: Market,
    now: DateTime<Utc>,
) {
    if !table.is_stale(market, now) {
        return;
    }

    let code = index_code_for(market);
    let Ok(rows) = rest.get_minute_chart(code, Some(1)).await else {
        return;
    };
    let candles = candles_from_chart_rows(&rows);
    if candles.len() < MA_PERIOD {
        return;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let window = &closes[closes.len() - MA_PERIOD..];
    let ma20 = window.iter().sum::<f64>() / MA_PERIOD as f64;
    let current = *closes.last().unwrap();

    table.set(market, MarketRegime::new(current, ma20, now));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_when_absent() {
        let table = IndexRegimeTable::new();
        assert!(table.is_stale(Market::Kospi, Utc::now()));
    }

    #[test]
    fn fresh_within_five_minutes() {
        let table = IndexRegimeTable::new();
        let now = Utc::now();
        table.set(Market::Kospi, MarketRegime::new(100.0, 95.0, now));
        assert!(!table.is_stale(Market::Kospi, now + chrono::Duration::minutes(4)));
        assert!(table.is_stale(Market::Kospi, now + chrono::Duration::minutes(6)));
    }

    #[test]
    fn is_bullish_derived_from_close_vs_ma20() {
        let table = IndexRegimeTable::new();
        let now = Utc::now();
        table.set(Market::Kosdaq, MarketRegime::new(100.0, 105.0, now));
        assert!(!table.get(Market::Kosdaq).unwrap().is_bullish);
    }
}

// =============================================================================
// CandleBuffer — thread-safe ring buffer per (symbol, interval)
// =============================================================================
//
// Candles are not pushed over the broker WebSocket; they are fetched via the
// REST Client's paginated minute-chart call and cached here so the Signal
// Pipeline and Position Manager don't re-fetch on every tick.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rest::client::resolve_field;

/// A single OHLC candle derived from the broker's minute-chart response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub is_closed: bool,
}

impl Candle {
    /// Upper-shadow ratio used by the technical gate's candle-pattern check:
    /// `(high - max(open, close)) / (high - low)`. Returns 0 when the
    /// candle has zero range to avoid a division by zero.
    pub fn upper_shadow_ratio(&self) -> f64 {
        let range = self.high - self.low;
        if range <= 0.0 {
            return 0.0;
        }
        (self.high - self.open.max(self.close)) / range
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    max_candles: usize,
}

impl CandleBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Replace the cached series for `key` with freshly-fetched rows
    /// (oldest-first). Called after a REST minute-chart fetch.
    pub fn replace(&self, key: CandleKey, candles: Vec<Candle>) {
        let mut map = self.buffers.write();
        let mut ring: VecDeque<Candle> = candles.into();
        while ring.len() > self.max_candles {
            ring.pop_front();
        }
        map.insert(key, ring);
    }

    pub fn get_closed(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let closed: Vec<&Candle> = ring.iter().filter(|c| c.is_closed).collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|c| (*c).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn get_closes(&self, key: &CandleKey, count: usize) -> Vec<f64> {
        self.get_closed(key, count).iter().map(|c| c.close).collect()
    }

    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_closed).map(|c| c.close))
    }

    pub fn count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }
}

/// Parse the broker's minute-chart rows (`ka10080`) into closed candles.
/// Unknown or partially-missing rows are skipped rather than causing a
/// parse failure for the whole page — per the dynamic-typed-response design
/// note, we never panic on an unexpected shape.
pub fn candles_from_chart_rows(rows: &[Value]) -> Vec<Candle> {
    let mut out: Vec<Candle> = rows
        .iter()
        .filter_map(|row| {
            let open_time = resolve_field(row, &["cntr_tm", "cntr_time"])?
                .as_str()
                .and_then(|s| s.parse::<i64>().ok())?;
            let open = parse_num(resolve_field(row, &["open_pric", "open_prc"])?)?;
            let high = parse_num(resolve_field(row, &["high_pric", "high_prc"])?)?;
            let low = parse_num(resolve_field(row, &["low_pric", "low_prc"])?)?;
            let close = parse_num(resolve_field(row, &["cur_prc", "close_prc"])?)?;

            Some(Candle {
                open_time,
                open: open.abs(),
                high: high.abs(),
                low: low.abs(),
                close: close.abs(),
                is_closed: true,
            })
        })
        .collect();

    // The broker returns newest-first; callers want oldest-first.
    out.reverse();
    out
}

fn parse_num(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| *c != ',' && *c != '+').collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_trims_to_max_candles() {
        let buf = CandleBuffer::new(2);
        let key = CandleKey {
            symbol: "005930".to_string(),
            interval: "1m".to_string(),
        };
        let candles = (0..5)
            .map(|i| Candle {
                open_time: i,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0 + i as f64,
                is_closed: true,
            })
            .collect();
        buf.replace(key.clone(), candles);
        assert_eq!(buf.count(&key), 2);
        assert_eq!(buf.last_close(&key), Some(104.0));
    }

    #[test]
    fn upper_shadow_ratio_computation() {
        let c = Candle {
            open_time: 0,
            open: 100.0,
            high: 110.0,
            low: 95.0,
            close: 102.0,
            is_closed: true,
        };
        // (110 - max(100,102)) / (110-95) = 8/15
        assert!((c.upper_shadow_ratio() - (8.0 / 15.0)).abs() < 1e-9);
    }

    #[test]
    fn upper_shadow_ratio_zero_range_is_zero() {
        let c = Candle {
            open_time: 0,
            open: 100.0,
            high: 100.0,
            low: 100.0,
            close: 100.0,
            is_closed: true,
        };
        assert_eq!(c.upper_shadow_ratio(), 0.0);
    }

    #[test]
    fn candles_from_chart_rows_reverses_to_oldest_first() {
        let rows = serde_json::json!([
            {"cntr_tm": "20240102", "open_pric": "101", "high_pric": "102", "low_pric": "100", "cur_prc": "101"},
            {"cntr_tm": "20240101", "open_pric": "100", "high_pric": "101", "low_pric": "99", "cur_prc": "100"},
        ]);
        let rows = rows.as_array().unwrap();
        let candles = candles_from_chart_rows(rows);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open_time, 20240101);
        assert_eq!(candles[1].open_time, 20240102);
    }

    #[test]
    fn candles_from_chart_rows_skips_malformed_entries() {
        let rows = serde_json::json!([
            {"cntr_tm": "20240101", "open_pric": "100", "high_pric": "101", "low_pric": "99", "cur_prc": "100"},
            {"cntr_tm": "bad-row"},
        ]);
        let rows = rows.as_array().unwrap();
        let candles = candles_from_chart_rows(rows);
        assert_eq!(candles.len(), 1);
    }
}

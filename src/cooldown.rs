// =============================================================================
// Re-entry cooldown and buy-attempt history tables
// =============================================================================
//
// Two small shared tables consulted by the Signal Pipeline's de-duplication
// gate and populated by the Reconciler and the Position Manager on exit.
// Kept in one place since both the entry and exit sides read/write them.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// symbol -> wall-clock instant before which new entries are rejected.
#[derive(Default)]
pub struct CooldownTable {
    inner: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl CooldownTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Block `symbol` until `now + minutes`.
    pub fn set_minutes(&self, symbol: &str, minutes: i64, now: DateTime<Utc>) {
        self.inner
            .write()
            .insert(symbol.to_string(), now + Duration::minutes(minutes));
    }

    pub fn is_blocked(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.inner
            .read()
            .get(symbol)
            .map(|until| now < *until)
            .unwrap_or(false)
    }

    pub fn clear(&self, symbol: &str) {
        self.inner.write().remove(symbol);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// symbol -> instant of last buy attempt; blocks retries within 60s
/// regardless of cooldown expiry (spec's Buy Attempt History).
#[derive(Default)]
pub struct AttemptHistory {
    inner: RwLock<HashMap<String, DateTime<Utc>>>,
}

const RETRY_BLOCK_SECS: i64 = 60;

impl AttemptHistory {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, symbol: &str, now: DateTime<Utc>) {
        self.inner.write().insert(symbol.to_string(), now);
    }

    pub fn is_blocked(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.inner
            .read()
            .get(symbol)
            .map(|last| now.signed_duration_since(*last).num_seconds() < RETRY_BLOCK_SECS)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_blocks_until_expiry() {
        let table = CooldownTable::new();
        let now = Utc::now();
        table.set_minutes("005930", 10, now);
        assert!(table.is_blocked("005930", now + Duration::minutes(5)));
        assert!(!table.is_blocked("005930", now + Duration::minutes(11)));
    }

    #[test]
    fn cooldown_honored_regardless_of_event_frequency() {
        let table = CooldownTable::new();
        let now = Utc::now();
        table.set_minutes("000660", 30, now);
        for i in 0..50 {
            assert!(table.is_blocked("000660", now + Duration::seconds(i)));
        }
    }

    #[test]
    fn attempt_history_blocks_within_60s() {
        let hist = AttemptHistory::new();
        let now = Utc::now();
        hist.record("005930", now);
        assert!(hist.is_blocked("005930", now + Duration::seconds(30)));
        assert!(!hist.is_blocked("005930", now + Duration::seconds(61)));
    }
}

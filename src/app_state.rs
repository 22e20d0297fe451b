// =============================================================================
// Application State — API boundary
// =============================================================================
//
// The trimmed dashboard surface (§ EXTERNAL INTERFACES) sits strictly behind
// the Store: the engine writes a `StatusSnapshot` to the kv_store on every
// forced 5s tick (and on every status transition), and the API only ever
// reads that snapshot back plus the command queue. AppState holds nothing of
// the live engine state directly — a restart of the API process would see
// exactly what the engine last persisted.
// =============================================================================

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::store::Store;
use crate::types::{BotStatus, Position};

/// Persisted once per forced tick by the control loop; the sole channel the
/// API reads from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub bot_status: BotStatus,
    pub mock_trade: bool,
    pub condition_id: String,
    pub market_open: bool,
    pub positions: Vec<Position>,
    pub daily_realized_pnl: i64,
    pub last_reconcile_ok: Option<chrono::DateTime<chrono::Utc>>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

pub struct AppState {
    pub store: Store,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            start_time: Instant::now(),
        }
    }

    pub async fn latest_status(&self) -> Option<StatusSnapshot> {
        self.store.get_kv("status_snapshot").await
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

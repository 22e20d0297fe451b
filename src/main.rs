// =============================================================================
// Kiwoom Day Trader — Main Entry Point
// =============================================================================
//
// Boots every subsystem and runs the Control Loop to completion. A
// `ControlLoopExit::Restart` (scanner rotation, mock/real flip caught before
// the hard process exit, or an operator-driven settings reload) tears down
// the gateway and rebuilds every component from scratch so a stale WebSocket
// or REST token is never carried across a restart; `ControlLoopExit::Shutdown`
// (Ctrl+C) exits the process after a final snapshot persist.
// =============================================================================

mod api;
mod app_state;
mod calendar;
mod control_loop;
mod cooldown;
mod credential;
mod gateway;
mod index_regime;
mod indicators;
mod market_data;
mod notifier;
mod position_engine;
mod reconcile;
mod rest;
mod scheduler;
mod signal_pipeline;
mod store;
mod symbol_master;
mod types;
mod vision;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::calendar::NullCalendarOracle;
use crate::control_loop::{ControlLoop, ControlLoopExit};
use crate::cooldown::{AttemptHistory, CooldownTable};
use crate::credential::CredentialService;
use crate::gateway::MarketDataGateway;
use crate::index_regime::IndexRegimeTable;
use crate::market_data::CandleBuffer;
use crate::notifier::{NoopNotifier, Notifier, TelegramNotifier};
use crate::position_engine::PositionManager;
use crate::rest::client::RestClient;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::symbol_master::{HttpSymbolMasterProvider, StubSymbolMasterProvider, SymbolMasterProvider};
use crate::vision::{HttpVisionClient, StubVisionClient, VisionClient};

const CANDLE_BUFFER_DEPTH: usize = 200;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn init_tracing() {
    let log_dir = env_or("LOG_DIR", "./logs");
    let file_appender = tracing_appender::rolling::daily(&log_dir, "kiwoom-day-trader.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Leaked deliberately: the guard must outlive `main` for buffered writes
    // to flush, and this process never tears down the subscriber early.
    Box::leak(Box::new(guard));

    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    tracing_subscriber::registry()
        .with(filter())
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

struct Components {
    rest: Arc<RestClient>,
    gateway: Arc<MarketDataGateway>,
    positions: Arc<PositionManager>,
    cooldowns: Arc<CooldownTable>,
    scheduler: Arc<Scheduler>,
    control_loop: ControlLoop,
}

async fn build_components(store: Store) -> anyhow::Result<Components> {
    let http = reqwest::Client::new();

    let mock_trade = env_bool("MOCK_TRADE", true);
    let base_url = if mock_trade {
        env_or("KIWOOM_MOCK_BASE_URL", "https://mockapi.kiwoom.com")
    } else {
        env_or("KIWOOM_BASE_URL", "https://api.kiwoom.com")
    };
    let ws_url = if mock_trade {
        env_or("KIWOOM_MOCK_WS_URL", "wss://mockapi.kiwoom.com:10000/api/dostk/websocket")
    } else {
        env_or("KIWOOM_WS_URL", "wss://api.kiwoom.com:10000/api/dostk/websocket")
    };
    let app_key = env_or("KIWOOM_APP_KEY", "");
    let secret_key = env_or("KIWOOM_SECRET_KEY", "");
    let account_no = env_or("KIWOOM_ACCOUNT_NO", "");

    if app_key.is_empty() || secret_key.is_empty() {
        warn!("KIWOOM_APP_KEY / KIWOOM_SECRET_KEY not set — broker calls will fail authentication");
    }

    let credential = CredentialService::new(
        store.clone(),
        http.clone(),
        base_url.clone(),
        app_key,
        secret_key,
        mock_trade,
    );

    let rest = Arc::new(RestClient::new(http.clone(), base_url, credential.clone(), mock_trade));
    let gateway = MarketDataGateway::new(ws_url, credential, store.clone());

    let positions = Arc::new(PositionManager::new());
    let cooldowns = Arc::new(CooldownTable::new());
    let attempts = Arc::new(AttemptHistory::new());
    let candles = Arc::new(CandleBuffer::new(CANDLE_BUFFER_DEPTH));
    let index_regime = Arc::new(IndexRegimeTable::new());

    let vision: Arc<dyn VisionClient> = match std::env::var("VISION_ENDPOINT") {
        Ok(endpoint) if !endpoint.is_empty() => {
            let keys = env_or("VISION_API_KEYS", "")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            Arc::new(HttpVisionClient::new(http.clone(), endpoint, keys))
        }
        _ => {
            warn!("VISION_ENDPOINT not set — using a stub vision client that always approves");
            Arc::new(StubVisionClient::always_yes(None))
        }
    };

    let notifier: Arc<dyn Notifier> = match (
        std::env::var("TELEGRAM_BOT_TOKEN"),
        std::env::var("TELEGRAM_CHAT_ID"),
    ) {
        (Ok(token), Ok(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
            Arc::new(TelegramNotifier::new(http.clone(), token, chat_id))
        }
        _ => Arc::new(NoopNotifier),
    };

    let pipeline = Arc::new(signal_pipeline::SignalPipeline::new(
        store.clone(),
        rest.clone(),
        gateway.clone(),
        positions.clone(),
        cooldowns.clone(),
        attempts,
        candles,
        index_regime,
        vision,
    ));

    let calendar: Arc<dyn calendar::SessionCalendar> = Arc::new(NullCalendarOracle::new());

    let scheduler = Scheduler::new(store.clone(), gateway.clone(), notifier);

    let control_loop = ControlLoop::new(
        store.clone(),
        rest.clone(),
        gateway.clone(),
        positions.clone(),
        cooldowns.clone(),
        pipeline,
        calendar,
        account_no,
        mock_trade,
    );

    Ok(Components {
        rest,
        gateway,
        positions,
        cooldowns,
        scheduler,
        control_loop,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    info!("kiwoom-day-trader starting up");

    let db_path = env_or("KIWOOM_DB_PATH", "kiwoom_day_trader.db");
    let store = Store::open(&db_path)?;

    let app_state = Arc::new(AppState::new(store.clone()));
    let bind_addr = env_or("KIWOOM_BIND_ADDR", "0.0.0.0:3000");

    {
        let http = reqwest::Client::new();
        let provider: Box<dyn SymbolMasterProvider> = match (
            std::env::var("KOSPI_LISTING_URL"),
            std::env::var("KOSDAQ_LISTING_URL"),
        ) {
            (Ok(kospi), Ok(kosdaq)) if !kospi.is_empty() && !kosdaq.is_empty() => {
                Box::new(HttpSymbolMasterProvider::new(http, kospi, kosdaq))
            }
            _ => {
                warn!("KOSPI_LISTING_URL / KOSDAQ_LISTING_URL not set — skipping symbol master refresh");
                Box::new(StubSymbolMasterProvider { symbols: Vec::new() })
            }
        };
        symbol_master::refresh_if_stale(&store, provider.as_ref()).await;
    }

    {
        let api_state = app_state.clone();
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, addr = %bind_addr, "failed to bind API server");
                    return;
                }
            };
            info!(addr = %bind_addr, "API server listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    loop {
        let components = build_components(store.clone()).await?;
        let shutdown = CancellationToken::new();

        let gateway_handle = {
            let gateway = components.gateway.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { gateway.run(shutdown).await })
        };

        let scheduler_handle = {
            let scheduler = components.scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        let ctrl_c_shutdown = shutdown.clone();
        let ctrl_c_handle = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("shutdown signal received");
                ctrl_c_shutdown.cancel();
            }
        });

        info!(
            positions = components.positions.len(),
            cooldowns = components.cooldowns.len(),
            "control loop starting"
        );
        let exit = components.control_loop.run(shutdown.clone()).await;

        shutdown.cancel();
        let _ = gateway_handle.await;
        let _ = scheduler_handle.await;
        ctrl_c_handle.abort();

        // rest client is only kept alive through Arc refs above; drop them
        // explicitly before the next build so a stale credential cache
        // cannot leak across a restart.
        drop(components.rest);

        match exit {
            ControlLoopExit::Shutdown => {
                info!("kiwoom-day-trader shut down complete");
                return Ok(());
            }
            ControlLoopExit::Restart => {
                info!("control loop requested restart, rebuilding components");
                continue;
            }
        }
    }
}

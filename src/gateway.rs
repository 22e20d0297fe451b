// =============================================================================
// Market Data Gateway — broker WebSocket connection manager
// =============================================================================
//
// One dedicated task owns the socket. Lifecycle:
//
//   DISCONNECTED --connect--> AUTHENTICATING --LOGIN ok--> ACTIVE
//                                  |--fail--> clear token, DISCONNECTED (retry 5s)
//   ACTIVE --socket closed--> DISCONNECTED
//
// On entering ACTIVE: request the condition list, re-register account subs
// (group 1), re-register per-symbol subs (group 2), re-issue the active
// scanner subscription. A command channel lets other components enqueue
// subscribe/unsubscribe/snapshot-request actions, all serialized through
// this task; while DISCONNECTED, commands are drained and logged as dropped
// rather than buffered, and subscriptions are replayed from the in-memory
// registry on reconnect instead.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::credential::CredentialService;
use crate::store::Store;

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const RECONNECT_DELAY_SECS: u64 = 5;
const PING_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionEventType {
    Insert,
    Delete,
}

#[derive(Debug, Clone)]
pub struct ConditionEvent {
    pub code: String,
    pub event_type: ConditionEventType,
    pub scanner_id: String,
    pub price: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum GatewayCommand {
    Add { code: String, sub_type: String },
    Remove { code: String, sub_type: String },
    RequestSnapshot { scanner_id: String },
}

pub struct MarketDataGateway {
    ws_url: String,
    credential: Arc<CredentialService>,
    store: Store,
    realtime_data: RwLock<HashMap<String, Value>>,
    condition_tx: mpsc::UnboundedSender<ConditionEvent>,
    condition_rx: parking_lot::Mutex<mpsc::UnboundedReceiver<ConditionEvent>>,
    command_tx: mpsc::Sender<GatewayCommand>,
    command_rx: parking_lot::Mutex<Option<mpsc::Receiver<GatewayCommand>>>,
    stock_subscriptions: RwLock<Vec<(String, String)>>,
    account_subscriptions: RwLock<Vec<String>>,
    last_scanner_id: RwLock<Option<String>>,
}

impl MarketDataGateway {
    pub fn new(ws_url: String, credential: Arc<CredentialService>, store: Store) -> Arc<Self> {
        let (condition_tx, condition_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(256);
        Arc::new(Self {
            ws_url,
            credential,
            store,
            realtime_data: RwLock::new(HashMap::new()),
            condition_tx,
            condition_rx: parking_lot::Mutex::new(condition_rx),
            command_tx,
            command_rx: parking_lot::Mutex::new(Some(command_rx)),
            stock_subscriptions: RwLock::new(Vec::new()),
            account_subscriptions: RwLock::new(Vec::new()),
            last_scanner_id: RwLock::new(None),
        })
    }

    pub fn latest(&self, code: &str, data_type: &str) -> Option<Value> {
        let key = real_key(code, data_type);
        self.realtime_data.read().get(&key).cloned()
    }

    /// Fetch the latest account-stream event (`data_type` "00" or "04"),
    /// stored under a fixed key since these carry no symbol code of their own.
    pub fn latest_account(&self, data_type: &str) -> Option<Value> {
        self.realtime_data.read().get(&format!("ACCOUNT_{data_type}")).cloned()
    }

    pub fn pop_condition_event(&self) -> Option<ConditionEvent> {
        self.condition_rx.lock().try_recv().ok()
    }

    pub fn add_subscription(&self, code: &str, sub_type: &str) {
        self.stock_subscriptions
            .write()
            .push((code.to_string(), sub_type.to_string()));
        let _ = self.command_tx.try_send(GatewayCommand::Add {
            code: code.to_string(),
            sub_type: sub_type.to_string(),
        });
    }

    pub fn remove_subscription(&self, code: &str, sub_type: &str) {
        self.stock_subscriptions
            .write()
            .retain(|(c, t)| !(c == code && t == sub_type));
        let _ = self.command_tx.try_send(GatewayCommand::Remove {
            code: code.to_string(),
            sub_type: sub_type.to_string(),
        });
    }

    pub fn request_snapshot(&self, scanner_id: &str) {
        *self.last_scanner_id.write() = Some(scanner_id.to_string());
        let _ = self.command_tx.try_send(GatewayCommand::RequestSnapshot {
            scanner_id: scanner_id.to_string(),
        });
    }

    /// Run the reconnect-forever loop. Intended to be spawned once as a
    /// background task and to run for the life of the process.
    pub async fn run(self: Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let mut command_rx = self
            .command_rx
            .lock()
            .take()
            .expect("gateway run() called more than once");

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match self.connect_and_listen(&mut command_rx, &shutdown).await {
                Ok(()) => info!("gateway: session ended cleanly"),
                Err(e) => warn!(error = %e, "gateway: session error"),
            }

            if shutdown.is_cancelled() {
                return;
            }
            info!(delay_secs = RECONNECT_DELAY_SECS, "gateway: reconnecting");
            sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
        }
    }

    async fn connect_and_listen(
        &self,
        command_rx: &mut mpsc::Receiver<GatewayCommand>,
        shutdown: &tokio_util::sync::CancellationToken,
    ) -> anyhow::Result<()> {
        let token = self.credential.get_token(false).await?;

        let (ws_stream, _) = connect_async(&self.ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(Message::Text(json!({"trnm": "LOGIN", "token": token}).to_string()))
            .await?;

        let mut logged_in = false;
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.close().await;
                    return Ok(());
                }
                _ = ping_interval.tick() => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        return Ok(());
                    }
                }
                cmd = command_rx.recv() => {
                    if !logged_in {
                        // Drop commands while not yet ACTIVE; subscriptions
                        // are replayed from the registry once LOGIN succeeds.
                        continue;
                    }
                    if let Some(cmd) = cmd {
                        self.send_command(&mut write, cmd).await;
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if self.handle_frame(&text, &mut write, &mut logged_in).await? {
                                return Ok(());
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Returns `Ok(true)` if the caller should close the session (e.g. LOGIN
    /// failed and the token was invalidated).
    async fn handle_frame(
        &self,
        text: &str,
        write: &mut WsWriter,
        logged_in: &mut bool,
    ) -> anyhow::Result<bool> {
        let Ok(data) = serde_json::from_str::<Value>(text) else {
            return Ok(false);
        };
        let trnm = data.get("trnm").and_then(|v| v.as_str()).unwrap_or("");

        match trnm {
            "LOGIN" => {
                let code = data.get("return_code").and_then(|v| v.as_i64()).unwrap_or(-1);
                if code == 0 {
                    *logged_in = true;
                    info!("gateway: login accepted, resubscribing");
                    let _ = write
                        .send(Message::Text(json!({"trnm": "CNSRLST"}).to_string()))
                        .await;
                    self.resubscribe_all(write).await;
                } else {
                    warn!(code, "gateway: login rejected, clearing cached token");
                    self.credential.clear_cache().await;
                    return Ok(true);
                }
            }
            "CNSRLST" => {
                self.store.set_kv("conditions", &data.get("data").cloned().unwrap_or(Value::Null)).await;
            }
            "CNSRREQ" => {
                self.process_condition_snapshot(&data);
            }
            "REAL" => {
                if *logged_in {
                    if let Some(items) = data.get("data").and_then(|v| v.as_array()) {
                        for item in items {
                            self.process_realtime_item(item);
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(false)
    }

    async fn resubscribe_all(&self, write: &mut WsWriter) {
        let accounts = self.account_subscriptions.read().clone();
        if !accounts.is_empty() {
            let payload = json!({
                "trnm": "REG",
                "grp_no": "1",
                "refresh": "1",
                "data": accounts.iter().map(|t| json!({"item": [""], "type": [t]})).collect::<Vec<_>>(),
            });
            let _ = write.send(Message::Text(payload.to_string())).await;
        }

        let stocks = self.stock_subscriptions.read().clone();
        if !stocks.is_empty() {
            let payload = json!({
                "trnm": "REG",
                "grp_no": "2",
                "refresh": "1",
                "data": stocks.iter().map(|(c, t)| json!({"item": [c], "type": [t]})).collect::<Vec<_>>(),
            });
            let _ = write.send(Message::Text(payload.to_string())).await;
        }

        if let Some(scanner_id) = self.last_scanner_id.read().clone() {
            let payload = json!({"trnm": "CNSRREQ", "seq": scanner_id, "search_type": "1", "stex_tp": "K"});
            let _ = write.send(Message::Text(payload.to_string())).await;
        }
    }

    async fn send_command(&self, write: &mut WsWriter, cmd: GatewayCommand) {
        let payload = match cmd {
            GatewayCommand::Add { code, sub_type } => json!({
                "trnm": "REG", "grp_no": "2", "refresh": "1",
                "data": [{"item": [code], "type": [sub_type]}],
            }),
            GatewayCommand::Remove { code, sub_type } => json!({
                "trnm": "REMOVE", "grp_no": "2",
                "data": [{"item": [code], "type": [sub_type]}],
            }),
            GatewayCommand::RequestSnapshot { scanner_id } => {
                json!({"trnm": "CNSRREQ", "seq": scanner_id, "search_type": "1", "stex_tp": "K"})
            }
        };
        let _ = write.send(Message::Text(payload.to_string())).await;
    }

    fn process_condition_snapshot(&self, data: &Value) {
        let scanner_id = data
            .get("seq")
            .map(|v| v.to_string().trim_matches('"').to_string())
            .unwrap_or_else(|| "init".to_string());

        let Some(raw) = data.get("data") else { return };
        let codes: Vec<String> = match raw {
            Value::Array(items) => items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(_) => item
                        .get("jmcode")
                        .or_else(|| item.get("code"))
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    Value::String(s) => s.split('^').next().map(String::from),
                    _ => None,
                })
                .collect(),
            Value::String(s) => s
                .split(';')
                .filter(|chunk| !chunk.trim().is_empty())
                .filter_map(|chunk| chunk.split('^').next().map(String::from))
                .collect(),
            _ => Vec::new(),
        };

        for code in codes {
            let clean = code.trim_start_matches(['A', 'J']).to_string();
            if clean.is_empty() {
                continue;
            }
            let _ = self.condition_tx.send(ConditionEvent {
                code: clean,
                event_type: ConditionEventType::Insert,
                scanner_id: scanner_id.clone(),
                price: None,
            });
        }
    }

    fn process_realtime_item(&self, item: &Value) {
        let code = item.get("item").and_then(|v| v.as_str()).unwrap_or("");
        let data_type = item.get("type").and_then(|v| v.as_str()).unwrap_or("");
        let values = item.get("values").cloned().unwrap_or(Value::Null);

        if data_type == "02" {
            let raw_code = values
                .get("9001")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim_start_matches(['A', 'J'])
                .to_string();
            let event_type = values.get("843").and_then(|v| v.as_str()).unwrap_or("I");
            let scanner_id = values
                .get("9007")
                .map(|v| v.to_string().trim_matches('"').to_string())
                .unwrap_or_else(|| code.to_string());
            let price = values
                .get("10")
                .and_then(|v| v.as_str())
                .map(|s| crate::rest::client::safe_int(Some(s)).abs());

            if !raw_code.is_empty() {
                let _ = self.condition_tx.send(ConditionEvent {
                    code: raw_code,
                    event_type: if event_type == "D" {
                        ConditionEventType::Delete
                    } else {
                        ConditionEventType::Insert
                    },
                    scanner_id,
                    price,
                });
            }
            return;
        }

        let key = match data_type {
            "00" if code.is_empty() => "ACCOUNT_00".to_string(),
            "04" if code.is_empty() => "ACCOUNT_04".to_string(),
            _ => real_key(code, data_type),
        };
        self.realtime_data.write().insert(key, values);
    }
}

fn real_key(code: &str, data_type: &str) -> String {
    format!("{code}_{data_type}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_key_format() {
        assert_eq!(real_key("005930", "0B"), "005930_0B");
    }
}

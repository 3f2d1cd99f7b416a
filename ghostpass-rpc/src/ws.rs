//! WebSocket fanout for live sale stats. The connection registry is process
//! local, keyed by sale id, and mutated only on accept and close; the
//! broadcaster serializes each sale's stats exactly once per tick and fans
//! the frame out to a consistent snapshot of that sale's connections.

use crate::RpcState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use ghostpass_engine::stats::{live_stats, my_status, SaleStats};
use ghostpass_storage::{PgStore, SaleStore};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Sessions must finish the opening exchange within this deadline.
const CONNECT_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct WsRegistry {
    inner: RwLock<HashMap<Uuid, HashMap<u64, UnboundedSender<Message>>>>,
    next_id: AtomicU64,
}

impl WsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, sale_id: Uuid, tx: UnboundedSender<Message>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.write().entry(sale_id).or_default().insert(id, tx);
        id
    }

    fn unregister(&self, sale_id: Uuid, id: u64) {
        let mut inner = self.inner.write();
        if let Some(conns) = inner.get_mut(&sale_id) {
            conns.remove(&id);
            if conns.is_empty() {
                inner.remove(&sale_id);
            }
        }
    }

    /// Consistent per-tick snapshot of every sale's senders.
    fn snapshot(&self) -> Vec<(Uuid, Vec<UnboundedSender<Message>>)> {
        self.inner
            .read()
            .iter()
            .map(|(sale, conns)| (*sale, conns.values().cloned().collect()))
            .collect()
    }

    pub fn connection_count(&self, sale_id: &Uuid) -> usize {
        self.inner.read().get(sale_id).map_or(0, HashMap::len)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMsg {
    Ping,
    GetStats,
    GetMyStatus { txid: Option<String> },
}

fn stats_frame(stats: &SaleStats) -> String {
    json!({ "type": "stats", "data": stats }).to_string()
}

fn error_frame(message: &str) -> String {
    json!({ "type": "error", "message": message }).to_string()
}

pub async fn ws_handler(
    Path(sale_id): Path<String>,
    State(state): State<RpcState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, sale_id))
}

async fn handle_socket(mut socket: WebSocket, state: RpcState, raw_sale_id: String) {
    let sale = match raw_sale_id.parse::<Uuid>() {
        Ok(id) => state.store.get_sale(id).await.ok().flatten(),
        Err(_) => None,
    };
    let Some(sale) = sale else {
        let _ = socket
            .send(Message::Text(error_frame("Sale not found")))
            .await;
        return;
    };

    // First frame: current stats, bounded by the connect-open deadline.
    let opening = match live_stats(state.store.as_ref(), &sale).await {
        Ok(stats) => stats_frame(&stats),
        Err(err) => {
            warn!(sale = %sale.id, "stats for new connection failed: {err:#}");
            error_frame("stats unavailable")
        }
    };
    match tokio::time::timeout(CONNECT_DEADLINE, socket.send(Message::Text(opening))).await {
        Ok(Ok(())) => {}
        _ => return,
    }

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = state.registry.register(sale.id, tx);
    debug!(sale = %sale.id, conn = conn_id, "websocket session open");

    loop {
        tokio::select! {
            broadcast = rx.recv() => {
                match broadcast {
                    Some(frame) => {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_message(&state, sale.id, &text).await {
                            if sink.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.registry.unregister(sale.id, conn_id);
    debug!(sale = %sale.id, conn = conn_id, "websocket session closed");
}

async fn handle_client_message(state: &RpcState, sale_id: Uuid, text: &str) -> Option<String> {
    let msg: ClientMsg = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(_) => return Some(error_frame("Invalid message")),
    };
    match msg {
        ClientMsg::Ping => Some(json!({ "type": "pong" }).to_string()),
        ClientMsg::GetStats => {
            let sale = state.store.get_sale(sale_id).await.ok().flatten()?;
            match live_stats(state.store.as_ref(), &sale).await {
                Ok(stats) => Some(stats_frame(&stats)),
                Err(_) => Some(error_frame("stats unavailable")),
            }
        }
        ClientMsg::GetMyStatus { txid } => {
            let Some(txid) = txid else {
                return Some(error_frame("Invalid message"));
            };
            let sale = state.store.get_sale(sale_id).await.ok().flatten()?;
            match my_status(state.store.as_ref(), &sale, &txid).await {
                Ok(status) => Some(json!({ "type": "my_status", "data": status }).to_string()),
                Err(_) => Some(error_frame("status unavailable")),
            }
        }
    }
}

/// Timer-driven fanout: one stats computation and one serialization per sale
/// per tick, shared across that sale's connections.
pub fn spawn_broadcaster(
    store: Arc<PgStore>,
    registry: Arc<WsRegistry>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            for (sale_id, senders) in registry.snapshot() {
                if senders.is_empty() {
                    continue;
                }
                let sale = match store.get_sale(sale_id).await {
                    Ok(Some(sale)) => sale,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(sale = %sale_id, "broadcast stats lookup failed: {err:#}");
                        continue;
                    }
                };
                let frame = match live_stats(store.as_ref(), &sale).await {
                    Ok(stats) => stats_frame(&stats),
                    Err(err) => {
                        warn!(sale = %sale_id, "broadcast stats failed: {err:#}");
                        continue;
                    }
                };
                for tx in senders {
                    // A full or closed channel means the session is on its
                    // way out; the accept/close path owns registry cleanup.
                    let _ = tx.send(Message::Text(frame.clone()));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_connections_per_sale() {
        let registry = WsRegistry::new();
        let sale = Uuid::new_v4();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let a = registry.register(sale, tx_a);
        let b = registry.register(sale, tx_b);
        assert_eq!(registry.connection_count(&sale), 2);
        assert_eq!(registry.snapshot().len(), 1);

        registry.unregister(sale, a);
        assert_eq!(registry.connection_count(&sale), 1);
        registry.unregister(sale, b);
        assert_eq!(registry.connection_count(&sale), 0);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn client_messages_parse_by_type_tag() {
        assert!(matches!(
            serde_json::from_str::<ClientMsg>(r#"{"type":"ping"}"#).unwrap(),
            ClientMsg::Ping
        ));
        assert!(matches!(
            serde_json::from_str::<ClientMsg>(r#"{"type":"get_stats"}"#).unwrap(),
            ClientMsg::GetStats
        ));
        let msg =
            serde_json::from_str::<ClientMsg>(r#"{"type":"get_my_status","txid":"tx-1"}"#).unwrap();
        assert!(matches!(msg, ClientMsg::GetMyStatus { txid: Some(t) } if t == "tx-1"));
        assert!(serde_json::from_str::<ClientMsg>("not json").is_err());
    }

    #[test]
    fn frames_carry_the_protocol_shape() {
        let err = error_frame("Sale not found");
        let value: serde_json::Value = serde_json::from_str(&err).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "Sale not found");
    }
}

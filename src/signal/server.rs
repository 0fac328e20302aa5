//! Minimal signaling relay used by the integration tests.
//!
//! Routes envelopes by their `receiver` field and pushes online-presence
//! envelopes (`onlineOne`, `onlineList`, `offlineOne`) the way the production
//! service does. Not a hardened server.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use futures::{SinkExt, StreamExt};
use log::debug;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};

use crate::wire::{
    Envelope, ROLE_SERVER, TYPE_OFFLINE_ONE, TYPE_ONLINE_LIST, TYPE_ONLINE_ONE,
};

use super::HEARTBEAT_FRAME;

type SharedRegistry = Arc<PeerDirectory>;

#[derive(Debug, Default)]
struct PeerDirectory {
    inner: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl PeerDirectory {
    async fn register(&self, peer_id: &str, tx: mpsc::UnboundedSender<String>) -> Vec<String> {
        let mut guard = self.inner.write().await;
        let others: Vec<String> = guard.keys().cloned().collect();

        let online = presence(TYPE_ONLINE_ONE, peer_id);
        for sender in guard.values() {
            let _ = sender.send(online.clone());
        }
        guard.insert(peer_id.to_string(), tx);
        others
    }

    async fn remove(&self, peer_id: &str) {
        let mut guard = self.inner.write().await;
        guard.remove(peer_id);
        let offline = presence(TYPE_OFFLINE_ONE, peer_id);
        for sender in guard.values() {
            let _ = sender.send(offline.clone());
        }
    }

    async fn route(&self, receiver: &str, raw: &str) -> bool {
        let guard = self.inner.read().await;
        match guard.get(receiver) {
            Some(sender) => sender.send(raw.to_string()).is_ok(),
            None => false,
        }
    }
}

fn presence(kind: &str, peer_id: &str) -> String {
    let mut env = Envelope::new(ROLE_SERVER, kind);
    env.sender = Some(ROLE_SERVER.to_string());
    env.data = Some(json!({ "sn": peer_id }));
    env.encode().unwrap_or_default()
}

fn online_list(peers: &[String]) -> String {
    let mut env = Envelope::new(ROLE_SERVER, TYPE_ONLINE_LIST);
    env.sender = Some(ROLE_SERVER.to_string());
    env.data = Some(json!(peers
        .iter()
        .map(|id| json!({ "sn": id }))
        .collect::<Vec<_>>()));
    env.encode().unwrap_or_default()
}

#[derive(Debug, Clone, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

pub fn router() -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .with_state(Arc::new(PeerDirectory::default()))
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(registry): State<SharedRegistry>,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, registry, query.session_id).await;
    })
}

async fn handle_socket(socket: WebSocket, registry: SharedRegistry, peer_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let others = registry.register(&peer_id, tx).await;
    if sender
        .send(Message::Text(online_list(&others)))
        .await
        .is_err()
    {
        registry.remove(&peer_id).await;
        return;
    }

    loop {
        tokio::select! {
            biased;
            Some(raw) = rx.recv() => {
                if sender.send(Message::Text(raw)).await.is_err() {
                    break;
                }
            }
            maybe_msg = receiver.next() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        if text == HEARTBEAT_FRAME {
                            continue;
                        }
                        relay(&registry, &peer_id, &text).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Ok(text) = String::from_utf8(bytes) {
                            relay(&registry, &peer_id, &text).await;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                }
            }
        }
    }

    registry.remove(&peer_id).await;
}

async fn relay(registry: &SharedRegistry, from: &str, raw: &str) {
    let Ok(envelope) = Envelope::decode(raw.as_bytes()) else {
        debug!("relay: unparseable frame from {from}, dropping");
        return;
    };
    let Some(receiver) = envelope.receiver.as_deref() else {
        debug!("relay: frame from {from} without receiver, dropping");
        return;
    };
    if !registry.route(receiver, raw).await {
        debug!("relay: receiver {receiver} not online");
    }
}

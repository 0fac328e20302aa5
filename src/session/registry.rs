//! Process-scoped index of live sessions, keyed by peer id.
//!
//! The registry listens on the signaling stream: server presence pushes
//! maintain the online map, and inbound `connect` envelopes (password-gated)
//! spawn callee sessions. Outbound sessions are opened by the UI through
//! [`SessionRegistry::open_outgoing`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::config::ConfigStore;
use crate::events::{EventBus, UiEvent};
use crate::input::InputInjector;
use crate::media::hw::HwContextRegistry;
use crate::signal::{SignalClient, SignalEvent};
use crate::wire::{
    Envelope, ROLE_SERVER, TYPE_CONNECT, TYPE_ERROR, TYPE_OFFLINE_ONE, TYPE_ONLINE_LIST,
    TYPE_ONLINE_ONE,
};

use super::callee::{CalleeConfig, CalleeHandle, CalleeSession};
use super::caller::{CallerConfig, CallerHandle, CallerSession};
use super::{SessionError, SessionIdentity, SessionMode, SessionState};

/// Options for an outbound (controller) session.
#[derive(Debug, Clone)]
pub struct OutgoingOptions {
    pub mode: SessionMode,
    pub adaptive_resolution: bool,
    pub only_relay: bool,
    /// Maximum viewable area reported to the callee when adaptive.
    pub control_max: Option<(i32, i32)>,
}

#[derive(Default)]
struct Inner {
    callees: HashMap<String, CalleeHandle>,
    callers: HashMap<String, CallerHandle>,
    online: HashSet<String>,
}

pub struct SessionRegistry {
    config: Arc<ConfigStore>,
    signal: SignalClient,
    hw: Arc<HwContextRegistry>,
    events: EventBus,
    injector: Arc<dyn InputInjector>,
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new(
        config: Arc<ConfigStore>,
        signal: SignalClient,
        hw: Arc<HwContextRegistry>,
        events: EventBus,
        injector: Arc<dyn InputInjector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            signal,
            hw,
            events,
            injector,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn identity(&self) -> SessionIdentity {
        SessionIdentity {
            local_id: self.config.local_id(),
            local_pwd_md5: self.config.local_pwd_md5(),
        }
    }

    /// Drives the registry until the signaling client closes. Intended to be
    /// spawned once at startup.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.signal.subscribe();
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("registry lagged on signal events, skipped {skipped}");
                    continue;
                }
                Err(_) => return,
            };
            match event {
                SignalEvent::Text(text) => self.dispatch(text.as_bytes()).await,
                SignalEvent::Binary(bytes) => self.dispatch(&bytes).await,
                SignalEvent::Disconnected => {
                    debug!("signaling lost; sessions keep running on their own transports");
                }
                _ => {}
            }
        }
    }

    async fn dispatch(&self, raw: &[u8]) {
        // Parse errors drop the message, never the connection.
        let Ok(envelope) = Envelope::decode(raw) else {
            debug!("unparseable signaling frame dropped");
            return;
        };

        if envelope.sender.as_deref() == Some(ROLE_SERVER) || envelope.role == ROLE_SERVER {
            self.on_server_push(&envelope).await;
            return;
        }
        if envelope.kind == TYPE_CONNECT {
            self.accept_incoming(&envelope).await;
        }
    }

    async fn on_server_push(&self, envelope: &Envelope) {
        match envelope.kind.as_str() {
            TYPE_ONLINE_ONE => {
                if let Some(peer_id) = presence_sn(envelope.data.as_ref()) {
                    self.inner.lock().await.online.insert(peer_id.clone());
                    self.events.publish(UiEvent::PeerOnline { peer_id });
                }
            }
            TYPE_ONLINE_LIST => {
                let Some(list) = envelope.data.as_ref().and_then(|data| data.as_array()) else {
                    return;
                };
                let mut inner = self.inner.lock().await;
                for item in list {
                    if let Some(peer_id) = item.get("sn").and_then(|sn| sn.as_str()) {
                        inner.online.insert(peer_id.to_string());
                        self.events.publish(UiEvent::PeerOnline {
                            peer_id: peer_id.to_string(),
                        });
                    }
                }
            }
            TYPE_OFFLINE_ONE => {
                if let Some(peer_id) = presence_sn(envelope.data.as_ref()) {
                    self.inner.lock().await.online.remove(&peer_id);
                    self.events.publish(UiEvent::PeerOffline { peer_id });
                }
            }
            TYPE_ERROR => {
                let message = envelope
                    .data_str()
                    .unwrap_or("signaling error without detail")
                    .to_string();
                warn!("signaling server error: {message}");
                self.events.publish(UiEvent::ServerError { message });
            }
            other => debug!("ignoring server push '{other}'"),
        }
    }

    /// Handles an inbound `connect`: password-gates it, replaces any live
    /// session for that peer, and spawns a callee.
    pub async fn accept_incoming(&self, envelope: &Envelope) {
        if envelope.receiver.as_deref() != Some(self.config.local_id().as_str()) {
            return;
        }
        let presented = envelope.receiver_pwd.as_deref().unwrap_or_default();
        if presented.is_empty() || presented != self.config.local_pwd_md5() {
            // Dropped silently on the wire; a single log line locally.
            warn!("connect with bad verification code dropped");
            return;
        }
        let Some(remote_id) = envelope.sender.clone() else {
            warn!("connect without sender dropped");
            return;
        };

        let mode = if envelope.is_only_file.unwrap_or(false) {
            SessionMode::FileOnly
        } else {
            SessionMode::VideoAndFile
        };
        let settings = self.config.get();
        let cfg = CalleeConfig {
            remote_id: remote_id.clone(),
            fps: envelope.fps.unwrap_or(settings.fps).clamp(1, 60),
            mode,
            only_relay: envelope.only_relay.unwrap_or(false),
            control_max_width: envelope.control_max_width,
            control_max_height: envelope.control_max_height,
            aggressive_repeat_headers: settings.aggressive_repeat_headers,
        };

        {
            let mut inner = self.inner.lock().await;
            prune(&mut inner);
            if let Some(existing) = inner.callees.remove(&remote_id) {
                info!("closing older session for {remote_id} before accepting a new one");
                existing.close();
            }
        }

        match CalleeSession::spawn(
            cfg,
            settings.ice.clone(),
            self.identity(),
            self.signal.clone(),
            self.hw.clone(),
            self.events.clone(),
            self.injector.clone(),
        )
        .await
        {
            Ok(handle) => {
                info!("accepted connect from {remote_id} ({mode:?})");
                self.inner.lock().await.callees.insert(remote_id, handle);
            }
            Err(err) => warn!("failed to accept connect from {remote_id}: {err}"),
        }
    }

    /// Opens an outbound controller session toward `peer_id`.
    pub async fn open_outgoing(
        &self,
        peer_id: &str,
        password_hash: &str,
        options: OutgoingOptions,
    ) -> Result<CallerHandle, SessionError> {
        {
            let mut inner = self.inner.lock().await;
            prune(&mut inner);
            if !inner.online.contains(peer_id) {
                return Err(SessionError::PeerOffline(peer_id.to_string()));
            }
            if let Some(existing) = inner.callers.remove(peer_id) {
                existing.close();
            }
        }

        let settings = self.config.get();
        let cfg = CallerConfig {
            remote_id: peer_id.to_string(),
            remote_pwd_md5: password_hash.to_string(),
            mode: options.mode,
            adaptive_resolution: options.adaptive_resolution,
            only_relay: options.only_relay,
            fps: settings.fps,
            control_max: options.control_max,
        };
        let handle = CallerSession::spawn(
            cfg,
            settings.ice.clone(),
            self.identity(),
            self.signal.clone(),
            self.hw.clone(),
            self.events.clone(),
        )
        .await?;

        self.inner
            .lock()
            .await
            .callers
            .insert(peer_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Closes any session toward `peer_id`, both roles.
    pub async fn close(&self, peer_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.callees.remove(peer_id) {
            handle.close();
        }
        if let Some(handle) = inner.callers.remove(peer_id) {
            handle.close();
        }
    }

    pub async fn online_peers(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut peers: Vec<String> = inner.online.iter().cloned().collect();
        peers.sort();
        peers
    }

    pub async fn live_sessions(&self) -> usize {
        let mut inner = self.inner.lock().await;
        prune(&mut inner);
        inner.callees.len() + inner.callers.len()
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        for (_, handle) in inner.callees.drain() {
            handle.close();
        }
        for (_, handle) in inner.callers.drain() {
            handle.close();
        }
    }
}

/// Drops handles whose worker already reached the terminal state.
fn prune(inner: &mut Inner) {
    inner
        .callees
        .retain(|_, handle| handle.state() != SessionState::Closed);
    inner
        .callers
        .retain(|_, handle| handle.state() != SessionState::Closed);
}

fn presence_sn(data: Option<&serde_json::Value>) -> Option<String> {
    data?.get("sn")?.as_str().map(|sn| sn.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn presence_extraction_handles_shapes() {
        assert_eq!(
            presence_sn(Some(&json!({ "sn": "PEER-1" }))),
            Some("PEER-1".to_string())
        );
        assert_eq!(presence_sn(Some(&json!({ "other": 1 }))), None);
        assert_eq!(presence_sn(None), None);
    }
}

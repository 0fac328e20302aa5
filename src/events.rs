//! Typed events flowing from the core to the user interface.
//!
//! The UI holds the receiving half of a broadcast channel; nothing in the
//! core ever calls back into UI objects.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::wire::FileEntry;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Signaling-connection status surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum UiEvent {
    SignalStatus {
        status: SignalStatus,
        /// Reconnect phase and attempt, present while reconnecting.
        phase: Option<u8>,
        attempt: Option<u32>,
        next_delay_secs: Option<u64>,
    },
    PeerOnline {
        peer_id: String,
    },
    PeerOffline {
        peer_id: String,
    },
    SessionState {
        peer_id: String,
        state: String,
    },
    /// A decoded RGB frame is ready for display. The pixel buffer travels
    /// out-of-band; this event carries its dimensions.
    VideoFrame {
        peer_id: String,
        width: u32,
        height: u32,
        #[serde(skip)]
        rgb: Vec<u8>,
    },
    FileList {
        peer_id: String,
        path: String,
        entries: Vec<FileEntry>,
        mounted: Vec<String>,
    },
    DownloadResult {
        peer_id: String,
        path: String,
        ok: bool,
    },
    UploadResult {
        peer_id: String,
        path: String,
        ok: bool,
        message: String,
    },
    ServerError {
        message: String,
    },
}

/// Broadcast fan-out for [`UiEvent`]s. Cheap to clone; slow receivers drop
/// the oldest events rather than blocking the core.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UiEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. A send with no live subscribers is not an error.
    pub fn publish(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(UiEvent::PeerOnline {
            peer_id: "A".into(),
        });
        match rx.recv().await.unwrap() {
            UiEvent::PeerOnline { peer_id } => assert_eq!(peer_id, "A"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(UiEvent::ServerError {
            message: "offline".into(),
        });
    }
}

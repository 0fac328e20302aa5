//! Websocket signaling client with heartbeat and phased reconnection.
//!
//! The client owns a single logical connection. Inbound frames are fanned out
//! to subscribers; sessions filter envelopes addressed to them. Outbound
//! sends while disconnected are dropped, the application layer reissues
//! offers and candidates when a session restarts.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use super::HEARTBEAT_FRAME;

const EVENT_CAPACITY: usize = 512;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub enum SignalEvent {
    Connected,
    Disconnected,
    /// Emitted before each backoff sleep: phase, attempt within the phase
    /// (1-based), and the delay about to be observed.
    ReconnectStatus {
        phase: u8,
        attempt: u32,
        next_delay: Duration,
    },
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone)]
enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Four-phase reconnect schedule: 1 s, 10 s, 30 s, then 60 s indefinitely.
/// Ten attempts per phase; the final phase recycles its counter instead of
/// advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectSchedule {
    phase: u8,
    attempt: u32,
}

impl ReconnectSchedule {
    pub const MAX_RETRY_PER_PHASE: u32 = 10;
    const PHASE_DELAY_SECS: [u64; 4] = [1, 10, 30, 60];

    pub fn new() -> Self {
        Self {
            phase: 0,
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn phase(&self) -> u8 {
        self.phase
    }

    /// Advances the schedule one attempt and returns (phase, attempt within
    /// phase, delay to sleep before that attempt).
    pub fn next_attempt(&mut self) -> (u8, u32, Duration) {
        let phase = self.phase;
        self.attempt += 1;
        let attempt = self.attempt;
        let delay = Duration::from_secs(Self::PHASE_DELAY_SECS[phase as usize]);
        if self.attempt >= Self::MAX_RETRY_PER_PHASE {
            self.attempt = 0;
            if (self.phase as usize) < Self::PHASE_DELAY_SECS.len() - 1 {
                self.phase += 1;
            }
        }
        (phase, attempt, delay)
    }
}

impl Default for ReconnectSchedule {
    fn default() -> Self {
        Self::new()
    }
}

/// Appends the identity query parameters the signaling service expects.
pub fn endpoint_with_identity(base: &str, peer_id: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|err| anyhow::anyhow!("invalid signaling url '{base}': {err}"))?;
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    url.query_pairs_mut()
        .append_pair("sessionId", peer_id)
        .append_pair("hostname", &hostname);
    Ok(url)
}

/// Handle to the signaling worker. Cloneable; all clones feed the same
/// connection.
#[derive(Debug, Clone)]
pub struct SignalClient {
    outbound: mpsc::UnboundedSender<Outbound>,
    events: broadcast::Sender<SignalEvent>,
    shutdown: watch::Sender<bool>,
}

impl SignalClient {
    /// Spawns the signaling worker for `url`, heartbeating every
    /// `heartbeat_interval`. Returns the handle plus the worker task.
    pub fn connect(url: Url, heartbeat_interval: Duration) -> (Self, JoinHandle<()>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            url,
            heartbeat_interval,
            outbound: outbound_rx,
            events: events_tx.clone(),
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(worker.run());

        (
            Self {
                outbound: outbound_tx,
                events: events_tx,
                shutdown: shutdown_tx,
            },
            handle,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.events.subscribe()
    }

    pub fn send_text(&self, text: impl Into<String>) {
        if self.outbound.send(Outbound::Text(text.into())).is_err() {
            warn!("signal worker gone, dropping outbound text");
        }
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        if self.outbound.send(Outbound::Binary(bytes)).is_err() {
            warn!("signal worker gone, dropping outbound binary");
        }
    }

    /// Stops the worker. The reconnect loop ends at the next suspension
    /// point; no further events are emitted.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

struct Worker {
    url: Url,
    heartbeat_interval: Duration,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events: broadcast::Sender<SignalEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        let mut schedule = ReconnectSchedule::new();
        loop {
            if *self.shutdown.borrow() {
                return;
            }
            match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    schedule.reset();
                    info!("signaling connected: {}", self.url);
                    let _ = self.events.send(SignalEvent::Connected);
                    let keep_running = self.serve_connection(stream).await;
                    if !keep_running || *self.shutdown.borrow() {
                        return;
                    }
                    error!("signaling disconnected");
                    let _ = self.events.send(SignalEvent::Disconnected);
                }
                Err(err) => {
                    error!("signaling connect failed: {err}");
                }
            }

            let (phase, attempt, delay) = schedule.next_attempt();
            debug!("signaling reconnect phase {phase} attempt {attempt} in {delay:?}");
            let _ = self.events.send(SignalEvent::ReconnectStatus {
                phase,
                attempt,
                next_delay: delay,
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Serves one live connection until it drops. Returns false when the
    /// worker should stop for good (shutdown requested or every handle is
    /// gone), true when a reconnect should follow.
    async fn serve_connection(&mut self, stream: WsStream) -> bool {
        let (mut sink, mut source) = stream.split();
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        // The first tick fires immediately; skip it so the cadence starts one
        // interval after connect.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        return false;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = sink.send(Message::Text(HEARTBEAT_FRAME.to_string())).await {
                        error!("heartbeat send failed: {err}");
                        return true;
                    }
                }
                maybe_out = self.outbound.recv() => {
                    let Some(frame) = maybe_out else { return false };
                    let message = match frame {
                        Outbound::Text(text) => Message::Text(text),
                        Outbound::Binary(bytes) => Message::Binary(bytes),
                    };
                    if let Err(err) = sink.send(message).await {
                        error!("signaling send failed: {err}");
                        return true;
                    }
                }
                maybe_msg = source.next() => {
                    match maybe_msg {
                        Some(Ok(Message::Text(text))) => {
                            let _ = self.events.send(SignalEvent::Text(text));
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            let _ = self.events.send(SignalEvent::Binary(bytes));
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if sink.send(Message::Pong(payload)).await.is_err() {
                                return true;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => return true,
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(err)) => {
                            error!("signaling stream error: {err}");
                            return true;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_walks_the_four_phases() {
        let mut schedule = ReconnectSchedule::new();
        let mut delays = Vec::new();
        for _ in 0..35 {
            let (_, _, delay) = schedule.next_attempt();
            delays.push(delay.as_secs());
        }
        assert_eq!(&delays[..10], &[1; 10]);
        assert_eq!(&delays[10..20], &[10; 10]);
        assert_eq!(&delays[20..30], &[30; 10]);
        assert_eq!(&delays[30..], &[60; 5]);
    }

    #[test]
    fn final_phase_recycles_its_counter() {
        let mut schedule = ReconnectSchedule::new();
        for _ in 0..30 {
            schedule.next_attempt();
        }
        assert_eq!(schedule.phase(), 3);
        for _ in 0..25 {
            let (phase, attempt, delay) = schedule.next_attempt();
            assert_eq!(phase, 3);
            assert!(attempt >= 1 && attempt <= ReconnectSchedule::MAX_RETRY_PER_PHASE);
            assert_eq!(delay.as_secs(), 60);
        }
    }

    #[test]
    fn successful_connection_resets_the_schedule() {
        let mut schedule = ReconnectSchedule::new();
        for _ in 0..17 {
            schedule.next_attempt();
        }
        schedule.reset();
        let (phase, attempt, delay) = schedule.next_attempt();
        assert_eq!((phase, attempt), (0, 1));
        assert_eq!(delay.as_secs(), 1);
    }

    #[test]
    fn identity_query_parameters_are_appended() {
        let url = endpoint_with_identity("ws://127.0.0.1:9000/ws", "PEER-A").unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("sessionId=PEER-A"));
        assert!(query.contains("hostname="));
    }
}

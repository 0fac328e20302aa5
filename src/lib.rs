pub mod config;
pub mod events;
pub mod files;
pub mod input;
pub mod media;
pub mod session;
pub mod signal;
pub mod wire;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;

use config::{ConfigStore, DEFAULT_HEARTBEAT_SECS};
use events::{EventBus, SignalStatus, UiEvent};
use input::{InputInjector, NullInjector};
use media::hw::HwContextRegistry;
use session::caller::CallerHandle;
use session::registry::{OutgoingOptions, SessionRegistry};
use session::SessionMode;
use signal::{endpoint_with_identity, SignalClient, SignalEvent};

/// One running peer: config, signaling, and the session registry wired
/// together. Construct with [`App::start`], stop with [`App::shutdown`].
pub struct App {
    pub config: Arc<ConfigStore>,
    pub events: EventBus,
    pub registry: Arc<SessionRegistry>,
    signal: SignalClient,
}

impl App {
    /// Boots the peer from the config directory. Fails fatally (caller maps
    /// this to a non-zero exit) when the signaling URL is missing.
    pub async fn start(config_dir: &Path) -> Result<Self> {
        Self::start_with_injector(config_dir, Arc::new(NullInjector)).await
    }

    pub async fn start_with_injector(
        config_dir: &Path,
        injector: Arc<dyn InputInjector>,
    ) -> Result<Self> {
        let config = Arc::new(
            ConfigStore::initialise(config_dir).context("failed to initialise configuration")?,
        );
        let settings = config.get();
        if settings.ws_url.trim().is_empty() {
            bail!("signaling URL is not configured (set wsUrl in settings.json)");
        }

        info!(
            "local id {} (verification code in settings.json)",
            settings.local_id
        );

        let url = endpoint_with_identity(&settings.ws_url, &settings.local_id)?;
        let (signal, _worker) =
            SignalClient::connect(url, Duration::from_secs(DEFAULT_HEARTBEAT_SECS));

        let events = EventBus::new();
        let hw = Arc::new(HwContextRegistry::new());
        let registry = SessionRegistry::new(
            config.clone(),
            signal.clone(),
            hw,
            events.clone(),
            injector,
        );
        tokio::spawn(registry.clone().run());
        spawn_status_bridge(&signal, &events);

        Ok(Self {
            config,
            events,
            registry,
            signal,
        })
    }

    /// Opens a remote-desktop session toward `remote_id`, authenticated with
    /// the peer's plaintext verification code.
    pub async fn connect_desktop(
        &self,
        remote_id: &str,
        remote_pwd: &str,
        adaptive_resolution: bool,
        only_relay: bool,
        control_max: Option<(i32, i32)>,
    ) -> Result<CallerHandle> {
        let handle = self
            .registry
            .open_outgoing(
                remote_id,
                &config::password_hash(remote_pwd),
                OutgoingOptions {
                    mode: SessionMode::VideoAndFile,
                    adaptive_resolution,
                    only_relay,
                    control_max,
                },
            )
            .await?;
        Ok(handle)
    }

    /// Opens a file-browser session (no media) toward `remote_id`.
    pub async fn connect_files(&self, remote_id: &str, remote_pwd: &str) -> Result<CallerHandle> {
        let handle = self
            .registry
            .open_outgoing(
                remote_id,
                &config::password_hash(remote_pwd),
                OutgoingOptions {
                    mode: SessionMode::FileOnly,
                    adaptive_resolution: false,
                    only_relay: false,
                    control_max: None,
                },
            )
            .await?;
        Ok(handle)
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        self.signal.close();
    }
}

/// Bridges signaling connection state onto the UI event stream.
fn spawn_status_bridge(signal: &SignalClient, events: &EventBus) {
    let mut rx = signal.subscribe();
    let events = events.clone();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SignalEvent::Connected) => events.publish(UiEvent::SignalStatus {
                    status: SignalStatus::Connected,
                    phase: None,
                    attempt: None,
                    next_delay_secs: None,
                }),
                Ok(SignalEvent::Disconnected) => events.publish(UiEvent::SignalStatus {
                    status: SignalStatus::Disconnected,
                    phase: None,
                    attempt: None,
                    next_delay_secs: None,
                }),
                Ok(SignalEvent::ReconnectStatus {
                    phase,
                    attempt,
                    next_delay,
                }) => events.publish(UiEvent::SignalStatus {
                    status: SignalStatus::Reconnecting,
                    phase: Some(phase),
                    attempt: Some(attempt),
                    next_delay_secs: Some(next_delay.as_secs()),
                }),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return,
            }
        }
    });
}

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

use screenlink::events::UiEvent;
use screenlink::App;

#[derive(Parser)]
#[command(name = "screenlink", about = "Peer-to-peer remote desktop and file transfer")]
struct Cli {
    /// Configuration directory (settings.json lives here).
    #[arg(long, default_value = "~/.config/screenlink")]
    config_dir: String,

    /// Override the configured log level for this run.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register with the signaling service and accept inbound sessions.
    Serve,
    /// Open a session toward a remote peer.
    Connect {
        remote_id: String,
        /// The remote peer's plaintext verification code.
        password: String,
        /// Browse and transfer files only, no media.
        #[arg(long)]
        file_only: bool,
        /// Disable adaptive resolution (stream at the remote's native size).
        #[arg(long)]
        no_adaptive: bool,
        /// Force every connection through the TURN relay.
        #[arg(long)]
        only_relay: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = expand_path(&cli.config_dir);

    init_logging(&config_dir, cli.log_level.as_deref())?;
    let _lock = acquire_instance_lock(&config_dir)?;

    let app = App::start(&config_dir).await?;
    let mut events = app.events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            report_event(event);
        }
    });

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            info!("serving; press Ctrl-C to exit");
            tokio::signal::ctrl_c().await.context("signal handler")?;
        }
        Commands::Connect {
            remote_id,
            password,
            file_only,
            no_adaptive,
            only_relay,
        } => {
            let handle = if file_only {
                app.connect_files(&remote_id, &password).await?
            } else {
                app.connect_desktop(&remote_id, &password, !no_adaptive, only_relay, None)
                    .await?
            };
            info!("session opened toward {}", handle.remote_id);
            tokio::signal::ctrl_c().await.context("signal handler")?;
            handle.close();
        }
    }

    app.shutdown().await;
    Ok(())
}

fn report_event(event: UiEvent) {
    match event {
        UiEvent::VideoFrame { width, height, .. } => {
            log::trace!("frame {width}x{height}");
        }
        other => info!("{}", serde_json::to_string(&other).unwrap_or_default()),
    }
}

fn init_logging(config_dir: &PathBuf, override_level: Option<&str>) -> Result<()> {
    // The configured level applies unless the CLI overrides it.
    let configured = screenlink::config::ConfigStore::initialise(config_dir)
        .map(|store| store.get().log_level)
        .unwrap_or_else(|_| "info".to_string());
    let level = override_level.unwrap_or(&configured);
    let filter = match level {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    env_logger::Builder::from_default_env()
        .filter_level(filter)
        .try_init()
        .ok();
    Ok(())
}

/// Refuses to run two peers against the same configuration directory.
struct InstanceLock(PathBuf);

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn acquire_instance_lock(config_dir: &PathBuf) -> Result<InstanceLock> {
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("cannot create {}", config_dir.display()))?;
    let path = config_dir.join("instance.lock");
    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(_) => Ok(InstanceLock(path)),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            bail!(
                "another instance appears to be running ({} exists; remove it if stale)",
                path.display()
            )
        }
        Err(err) => Err(err).with_context(|| format!("cannot create {}", path.display())),
    }
}

fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut buf = PathBuf::from(home);
            buf.push(stripped);
            return buf;
        }
    }
    PathBuf::from(path)
}

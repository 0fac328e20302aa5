use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

use anyhow::{anyhow, Context, Result};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DEFAULT_FPS: u32 = 15;
const MIN_FPS: u32 = 1;
const MAX_FPS: u32 = 60;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

fn default_true() -> bool {
    true
}

fn default_fps() -> u32 {
    DEFAULT_FPS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ice_port() -> u16 {
    3478
}

/// ICE server endpoints: one STUN plus TURN over UDP and TCP at the same
/// host/port with shared credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceSettings {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ice_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    /// Installation identity, created on first run and reused.
    #[serde(default)]
    pub local_id: String,
    /// Plaintext verification code; the MD5 hash is derived on load.
    #[serde(default)]
    pub local_pwd: String,
    #[serde(default = "default_true")]
    pub show_ui: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub ws_url: String,
    #[serde(default)]
    pub ice: IceSettings,
    /// Prepend SPS/PPS on every keyframe instead of only when absent.
    #[serde(default)]
    pub aggressive_repeat_headers: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            local_id: String::new(),
            local_pwd: String::new(),
            show_ui: true,
            log_level: default_log_level(),
            fps: DEFAULT_FPS,
            ws_url: String::new(),
            ice: IceSettings::default(),
            aggressive_repeat_headers: false,
        }
    }
}

impl RuntimeSettings {
    fn normalised(mut self) -> Self {
        if self.local_id.is_empty() || Uuid::parse_str(&self.local_id).is_err() {
            self.local_id = new_identifier();
        } else {
            self.local_id = self.local_id.to_uppercase();
        }
        if self.local_pwd.is_empty() {
            self.local_pwd = new_identifier();
        }
        if !(MIN_FPS..=MAX_FPS).contains(&self.fps) {
            self.fps = DEFAULT_FPS;
        }
        let level = self.log_level.trim().to_ascii_lowercase();
        self.log_level = match level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => level,
            _ => default_log_level(),
        };
        self
    }
}

fn new_identifier() -> String {
    Uuid::new_v4().to_string().to_uppercase()
}

/// Uppercase hexadecimal MD5 of the secret, the form every envelope
/// comparison uses.
pub fn password_hash(secret: &str) -> String {
    let digest = Md5::digest(secret.as_bytes());
    hex::encode_upper(digest)
}

/// Persistent configuration, constructed once at startup and injected into
/// the components that need it.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    settings: RwLock<RuntimeSettings>,
    pwd_md5: RwLock<String>,
}

impl ConfigStore {
    pub fn initialise(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir).with_context(|| {
            format!("failed to prepare config directory {}", base_dir.display())
        })?;
        let path = base_dir.join("settings.json");
        let initial = if path.exists() {
            Self::read_settings(&path).unwrap_or_default()
        } else {
            RuntimeSettings::default()
        };
        let normalised = initial.normalised();
        let store = Self {
            pwd_md5: RwLock::new(password_hash(&normalised.local_pwd)),
            path,
            settings: RwLock::new(normalised),
        };
        // First run (or repair) persists the generated identity immediately.
        store.persist()?;
        Ok(store)
    }

    pub fn get(&self) -> RuntimeSettings {
        self.settings
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn local_id(&self) -> String {
        self.settings
            .read()
            .map(|guard| guard.local_id.clone())
            .unwrap_or_default()
    }

    /// Uppercase-hex MD5 of the current local password.
    pub fn local_pwd_md5(&self) -> String {
        self.pwd_md5
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn update(&self, next: RuntimeSettings) -> Result<RuntimeSettings> {
        let normalised = next.normalised();
        {
            let mut guard = self
                .settings
                .write()
                .map_err(|_| anyhow!("config store poisoned"))?;
            *guard = normalised.clone();
        }
        {
            let mut guard = self
                .pwd_md5
                .write()
                .map_err(|_| anyhow!("config store poisoned"))?;
            *guard = password_hash(&normalised.local_pwd);
        }
        self.persist()?;
        Ok(normalised)
    }

    /// Rotates the verification code to a fresh identifier.
    pub fn reset_password(&self) -> Result<String> {
        let mut next = self.get();
        next.local_pwd = new_identifier();
        let applied = self.update(next)?;
        Ok(applied.local_pwd)
    }

    fn persist(&self) -> Result<()> {
        let snapshot = self.get();
        let json =
            serde_json::to_vec_pretty(&snapshot).context("failed to serialise settings json")?;
        fs::write(&self.path, json)
            .with_context(|| format!("failed to persist settings to {}", self.path.display()))?;
        Ok(())
    }

    fn read_settings(path: &Path) -> Result<RuntimeSettings> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        let parsed: RuntimeSettings =
            serde_json::from_str(&contents).context("invalid settings payload")?;
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn md5_hash_is_uppercase_hex() {
        // Well-known digest of the empty string.
        assert_eq!(password_hash(""), "D41D8CD98F00B204E9800998ECF8427E");
        let hash = password_hash("secret");
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash.to_uppercase());
    }

    #[test]
    fn first_run_creates_identity_and_reuses_it() {
        let dir = tempdir().unwrap();
        let first = ConfigStore::initialise(dir.path()).unwrap();
        let id = first.local_id();
        let pwd = first.get().local_pwd;
        assert!(Uuid::parse_str(&id).is_ok());
        drop(first);

        let second = ConfigStore::initialise(dir.path()).unwrap();
        assert_eq!(second.local_id(), id);
        assert_eq!(second.get().local_pwd, pwd);
    }

    #[test]
    fn fps_out_of_range_falls_back() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::initialise(dir.path()).unwrap();
        let mut next = store.get();
        next.fps = 600;
        let applied = store.update(next).unwrap();
        assert_eq!(applied.fps, DEFAULT_FPS);
    }

    #[test]
    fn password_reset_rotates_hash() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::initialise(dir.path()).unwrap();
        let before = store.local_pwd_md5();
        store.reset_password().unwrap();
        let after = store.local_pwd_md5();
        assert_ne!(before, after);
        assert_eq!(after, password_hash(&store.get().local_pwd));
    }
}

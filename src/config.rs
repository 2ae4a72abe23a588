use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChatError, Result};
use crate::session::Session;

const CONFIG_FILE: &str = "config.json";

static CONFIG_DIR_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Timing and size knobs for the synchronizers, all in milliseconds
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Tuning {
    pub search_debounce_ms: u64,
    pub presence_snapshot_delay_ms: u64,
    pub history_page_size: u32,
    pub attachment_cap: usize,
    pub notification_ttl_ms: u64,
    pub request_timeout_ms: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            search_debounce_ms: 400,
            presence_snapshot_delay_ms: 500,
            history_page_size: 20,
            attachment_cap: 5,
            notification_ttl_ms: 4000,
            request_timeout_ms: 5000,
            reconnect_min_ms: 1000,
            reconnect_max_ms: 30_000,
        }
    }
}

impl Tuning {
    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }

    pub fn presence_snapshot_delay(&self) -> Duration {
        Duration::from_millis(self.presence_snapshot_delay_ms)
    }

    pub fn notification_ttl(&self) -> Duration {
        Duration::from_millis(self.notification_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

/// Session as cached on disk; the token is kept base64-encoded
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoredSession {
    pub token: String,
    pub user_id: String,
    pub display_name: String,
}

impl StoredSession {
    pub fn from_session(session: &Session) -> Self {
        StoredSession {
            token: BASE64.encode(session.token()),
            user_id: session.user_id().to_string(),
            display_name: session.display_name().to_string(),
        }
    }

    pub fn to_session(&self) -> Option<Session> {
        let token = BASE64
            .decode(&self.token)
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())?;
        if token.is_empty() || self.user_id.is_empty() {
            return None;
        }
        Some(Session::new(&token, &self.user_id, &self.display_name))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub api_url: String,
    pub socket_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<StoredSession>,
    #[serde(default)]
    pub tuning: Tuning,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_url: "http://localhost:5000/api".to_string(),
            socket_url: "ws://localhost:5000/chat".to_string(),
            session: None,
            tuning: Tuning::default(),
        }
    }
}

impl Config {
    /// Environment variables win over whatever was stored on disk
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("GIGCHAT_API_URL") {
            if !url.trim().is_empty() {
                self.api_url = url.trim().to_string();
            }
        }
        if let Ok(url) = std::env::var("GIGCHAT_SOCKET_URL") {
            if !url.trim().is_empty() {
                self.socket_url = url.trim().to_string();
            }
        }
        self
    }

    pub fn remember_session(&mut self, session: &Session) {
        self.session = Some(StoredSession::from_session(session));
    }

    pub fn forget_session(&mut self) {
        self.session = None;
    }

    pub fn cached_session(&self) -> Option<Session> {
        self.session.as_ref().and_then(StoredSession::to_session)
    }

    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Config::default());
        }

        let mut file = File::open(&path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let config: Config = serde_json::from_str(&contents)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let path = dir.join(CONFIG_FILE);
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(file, self)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// Point the config directory somewhere else (set once, from the command line)
pub fn set_config_dir_override(dir: PathBuf) {
    if CONFIG_DIR_OVERRIDE.set(dir).is_err() {
        log::warn!("Config directory override already set; ignoring");
    }
}

pub fn config_dir() -> Result<PathBuf> {
    if let Some(dir) = CONFIG_DIR_OVERRIDE.get() {
        return Ok(dir.clone());
    }
    let dir = dirs::config_dir()
        .ok_or_else(|| ChatError::Config("could not determine config directory".to_string()))?
        .join("gigchat");

    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

pub fn load_config() -> Result<Config> {
    Ok(Config::load_from(&config_dir()?)?.with_env_overrides())
}

pub fn save_config(config: &Config) -> Result<()> {
    config.save_to(&config_dir()?)
}

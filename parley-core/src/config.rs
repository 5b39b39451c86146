use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ParleyConfig {
    pub server: ServerConfig,
    pub connection: ConnectionConfig,
    pub sessions: SessionsConfig,
    pub conversation: ConversationConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            ws_path: "/ws".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConnectionConfig {
    pub reconnect_delay_ms: u64,
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 3000,
            event_buffer: 256,
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionsConfig {
    pub resync_debounce_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            resync_debounce_ms: 500,
        }
    }
}

impl SessionsConfig {
    pub fn resync_debounce(&self) -> Duration {
        Duration::from_millis(self.resync_debounce_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConversationConfig {
    pub completion_grace_ms: u64,
    pub closing_message: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            completion_grace_ms: 3000,
            closing_message: "This conversation has ended. Thank you for contacting us.".to_string(),
        }
    }
}

impl ConversationConfig {
    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 200,
        }
    }
}

impl ParleyConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        s.try_deserialize()
    }

    /// Like [`ParleyConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .build()?;
        s.try_deserialize()
    }

    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        s.try_deserialize()
    }
}

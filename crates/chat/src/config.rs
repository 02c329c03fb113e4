//! Chat client configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::realtime::connection::ReconnectPolicy;
use crate::sync::session::SessionConfig;

/// Chat client configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Endpoints
    pub ws_url: Url,
    pub api_url: Url,

    // Authentication
    pub access_token: Option<String>,

    // Reconnect
    pub reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,

    // Typing
    pub typing_expiry_ms: u64,
    pub typing_idle_ms: u64,

    // Messages
    pub max_message_length: usize,
    pub refetch_on_reconnect: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Endpoints
            ws_url: url_var("CHAT_WS_URL", "ws://localhost:3000", &["ws", "wss"])?,
            api_url: url_var("CHAT_API_URL", "http://localhost:3000/api", &["http", "https"])?,

            // Authentication
            access_token: env::var("CHAT_ACCESS_TOKEN")
                .ok()
                .filter(|token| !token.is_empty()),

            // Reconnect
            reconnect_attempts: parse_var("CHAT_RECONNECT_ATTEMPTS", 5)?,
            reconnect_base_delay_ms: parse_var("CHAT_RECONNECT_BASE_DELAY_MS", 1000)?,
            reconnect_max_delay_ms: parse_var("CHAT_RECONNECT_MAX_DELAY_MS", 30000)?,

            // Typing
            typing_expiry_ms: parse_var("CHAT_TYPING_EXPIRY_MS", 3000)?,
            typing_idle_ms: parse_var("CHAT_TYPING_IDLE_MS", 1000)?,

            // Messages
            max_message_length: parse_var("CHAT_MAX_MESSAGE_LENGTH", 2000)?,
            refetch_on_reconnect: parse_var("CHAT_REFETCH_ON_RECONNECT", true)?,
        })
    }

    /// The bearer credential, required for connecting
    pub fn credential(&self) -> Result<&str, ConfigError> {
        self.access_token
            .as_deref()
            .ok_or(ConfigError::Missing("CHAT_ACCESS_TOKEN"))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts.max(1),
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            typing_expiry: Duration::from_millis(self.typing_expiry_ms),
            typing_idle: Duration::from_millis(self.typing_idle_ms),
            max_message_length: self.max_message_length,
            refetch_on_reconnect: self.refetch_on_reconnect,
        }
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        _ => Ok(default),
    }
}

fn url_var(name: &'static str, default: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let url = Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl {
        name,
        reason: e.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrl {
            name,
            reason: format!("scheme must be one of {}", schemes.join(", ")),
        });
    }
    Ok(url)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
    #[error("Invalid URL in {name}: {reason}")]
    InvalidUrl { name: &'static str, reason: String },
}

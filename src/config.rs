//! Runtime settings for both roles.
//!
//! Values normally come from command line flags; [`ServerConfig::set`] and
//! [`ClientConfig::set`] additionally accept plain `key=value` settings.
use thiserror::Error;

use crate::protocol::{PROTOCOL_VERSION, factory::DEFAULT_MAX_FRAME_SIZE};

pub const DEFAULT_PORT: u16 = 10001;
pub const DEFAULT_INTERFACE: &str = "0.0.0.0";
pub const DEFAULT_RCON_PASSWORD: &str = "changeme";
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub const DEFAULT_PING_INTERVAL: f64 = 5.0;
pub const DEFAULT_IDLE_TIMEOUT: f64 = 60.0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown setting '{0}'")]
    UnknownKey(String),

    #[error("invalid value '{value}' for setting '{key}'")]
    InvalidValue { key: String, value: String },

    #[error("expected key=value, got '{0}'")]
    Syntax(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address of the interface to bind. Empty means all interfaces.
    pub interface: String,
    pub port: u16,
    /// Session password every joining client must present. Empty accepts anyone.
    pub password: String,
    /// Password that authorizes remote console commands.
    pub rcon_password: String,
    pub max_connections: usize,
    /// Seconds without received bytes before a client is dropped. `0` disables.
    pub idle_timeout: f64,
    /// Seconds without any broadcast before a keep-alive ping goes out. `0` disables.
    pub ping_interval: f64,
    pub max_frame_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interface: DEFAULT_INTERFACE.to_string(),
            port: DEFAULT_PORT,
            password: String::new(),
            rcon_password: DEFAULT_RCON_PASSWORD.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    /// Applies one `key=value` setting.
    pub fn apply(&mut self, setting: &str) -> Result<(), ConfigError> {
        let (key, value) = split_setting(setting)?;
        self.set(key, value)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "interface" => self.interface = value.to_string(),
            "port" => self.port = parse(key, value)?,
            "password" => self.password = value.to_string(),
            "rcon_password" => self.rcon_password = value.to_string(),
            "max_connections" => self.max_connections = parse(key, value)?,
            "idle_timeout" => self.idle_timeout = parse_seconds(key, value)?,
            "ping_interval" => self.ping_interval = parse_seconds(key, value)?,
            "max_frame_size" => self.max_frame_size = parse(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Reported to the server on session init.
    pub app_version: String,
    pub protocol_version: u32,
    /// Seconds without anything sent before a keep-alive ping. `0` disables.
    pub ping_interval: f64,
    pub max_frame_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            username: "anonymous".to_string(),
            password: String::new(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn apply(&mut self, setting: &str) -> Result<(), ConfigError> {
        let (key, value) = split_setting(setting)?;
        self.set(key, value)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "host" => self.host = value.to_string(),
            "port" => self.port = parse(key, value)?,
            "username" => self.username = value.to_string(),
            "password" => self.password = value.to_string(),
            "app_version" => self.app_version = value.to_string(),
            "ping_interval" => self.ping_interval = parse_seconds(key, value)?,
            "max_frame_size" => self.max_frame_size = parse(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

fn split_setting(setting: &str) -> Result<(&str, &str), ConfigError> {
    setting
        .split_once('=')
        .map(|(key, value)| (key.trim(), value.trim()))
        .ok_or_else(|| ConfigError::Syntax(setting.to_string()))
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_seconds(key: &str, value: &str) -> Result<f64, ConfigError> {
    let seconds: f64 = parse(key, value)?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 10001);
        assert_eq!(config.rcon_password, "changeme");
        assert_eq!(config.max_connections, 10);
        assert!(config.password.is_empty());
    }

    #[test]
    fn apply_key_value_settings() {
        let mut config = ServerConfig::default();
        config.apply("port=4000").unwrap();
        config.apply("password = hunter2").unwrap();
        config.apply("idle_timeout=0").unwrap();

        assert_eq!(config.port, 4000);
        assert_eq!(config.password, "hunter2");
        assert_eq!(config.idle_timeout, 0.0);
    }

    #[test]
    fn rejects_bad_settings() {
        let mut config = ServerConfig::default();
        assert_eq!(
            config.apply("colour=blue"),
            Err(ConfigError::UnknownKey("colour".to_string()))
        );
        assert!(matches!(
            config.apply("port=99999"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.apply("ping_interval=-1"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(
            config.apply("port"),
            Err(ConfigError::Syntax("port".to_string()))
        );
    }

    #[test]
    fn client_settings() {
        let mut config = ClientConfig::default();
        config.apply("host=voxels.example").unwrap();
        config.apply("username=alice").unwrap();

        assert_eq!(config.host, "voxels.example");
        assert_eq!(config.username, "alice");
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
    }
}

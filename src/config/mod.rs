//! Configuration management for roomlink

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Video codec preference for the published stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    VP8,
    VP9,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::VP8 => "vp8",
            VideoCodec::VP9 => "vp9",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Room server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Media and negotiation configuration
    #[serde(default)]
    pub media: MediaConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Room server WebSocket URL
    #[serde(default = "default_server_address")]
    pub address: String,

    /// WebSocket handshake deadline in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Per-request response deadline in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Announce a webcam when joining
    #[serde(default = "default_webcam")]
    pub webcam: bool,

    /// Ask the server to loop the published stream back
    #[serde(default)]
    pub loopback: bool,

    /// Preferred video codec
    #[serde(default)]
    pub video_codec: VideoCodec,

    /// STUN server URLs for ICE gathering
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            webcam: default_webcam(),
            loopback: false,
            video_codec: VideoCodec::default(),
            stun_servers: default_stun_servers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults
    /// when the file does not exist.
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if !self.server.address.starts_with("ws://") && !self.server.address.starts_with("wss://") {
            return Err(format!(
                "server.address must be a ws:// or wss:// URL, got '{}'",
                self.server.address
            )
            .into());
        }
        if self.server.connect_timeout_secs == 0 {
            return Err("server.connect_timeout_secs must be greater than zero".into());
        }
        if self.server.request_timeout_secs == 0 {
            return Err("server.request_timeout_secs must be greater than zero".into());
        }
        for url in &self.media.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("turn:") {
                return Err(format!("unrecognized ICE server URL '{}'", url).into());
            }
        }
        Ok(())
    }
}

fn default_server_address() -> String {
    "wss://127.0.0.1:8443/room".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_webcam() -> bool {
    true
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            address = "ws://media.example.com:8888/room"

            [media]
            loopback = true
            video_codec = "vp8"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.address, "ws://media.example.com:8888/room");
        assert_eq!(config.server.request_timeout_secs, 15);
        assert!(config.media.loopback);
        assert_eq!(config.media.video_codec, VideoCodec::VP8);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn validate_rejects_non_websocket_address() {
        let mut config = Config::default();
        config.server.address = "http://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.server.request_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_stun_url() {
        let mut config = Config::default();
        config.media.stun_servers = vec!["udp://1.2.3.4".to_string()];
        assert!(config.validate().is_err());
    }
}

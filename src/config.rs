use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mesh::{BusSettings, MeshOptions, RtcSettings};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Signaling server: token endpoint and signal POSTs
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Centrifugo websocket endpoint
    #[serde(default = "default_websocket_url")]
    pub websocket_url: String,
    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default = "default_channel_label")]
    pub channel_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Capacity of the application event queue
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    /// Capacity of the inbound signaling queue
    #[serde(default = "default_signal_buffer")]
    pub signal_buffer: usize,
    /// Inbound peer messages held before new ones are dropped
    #[serde(default = "default_message_buffer")]
    pub message_buffer: usize,
}

fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_websocket_url() -> String {
    "ws://localhost:8000/connection/websocket".to_string()
}

fn default_reconnect_min_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    20_000
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.stunprotocol.org:3478".to_string()]
}

fn default_channel_label() -> String {
    "dataChannel".to_string()
}

fn default_event_buffer() -> usize {
    256
}

fn default_command_buffer() -> usize {
    64
}

fn default_signal_buffer() -> usize {
    256
}

fn default_message_buffer() -> usize {
    1024
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            websocket_url: default_websocket_url(),
            reconnect_min_ms: default_reconnect_min_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            channel_label: default_channel_label(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
            command_buffer: default_command_buffer(),
            signal_buffer: default_signal_buffer(),
            message_buffer: default_message_buffer(),
        }
    }
}

impl Config {
    /// Load config from the default path, or create a default one if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config from `path`, writing defaults there if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    pub fn bus_settings(&self) -> BusSettings {
        BusSettings {
            server_url: self.bus.server_url.clone(),
            websocket_url: self.bus.websocket_url.clone(),
            reconnect_min: Duration::from_millis(self.bus.reconnect_min_ms),
            reconnect_max: Duration::from_millis(self.bus.reconnect_max_ms),
            buffer: self.mesh.signal_buffer,
        }
    }

    pub fn rtc_settings(&self) -> RtcSettings {
        RtcSettings {
            stun_servers: self.webrtc.stun_servers.clone(),
            channel_label: self.webrtc.channel_label.clone(),
        }
    }

    pub fn mesh_options(&self) -> MeshOptions {
        MeshOptions {
            event_buffer: self.mesh.event_buffer,
            command_buffer: self.mesh.command_buffer,
            message_buffer: self.mesh.message_buffer,
        }
    }
}

/// Get the peermesh directory (~/.peermesh)
pub fn get_peermesh_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peermesh")
}

/// Get the config file path (~/.peermesh/config.toml)
pub fn get_config_path() -> PathBuf {
    get_peermesh_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.bus.server_url, "http://localhost:8080");
        assert_eq!(config.bus.websocket_url, "ws://localhost:8000/connection/websocket");
        assert_eq!(config.webrtc.channel_label, "dataChannel");
        assert_eq!(config.mesh.command_buffer, 64);
    }

    #[test]
    fn test_load_creates_default_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path)?;
        assert!(path.exists());
        assert_eq!(config.bus.reconnect_max_ms, 20_000);

        Ok(())
    }

    #[test]
    fn test_save_and_reload() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.bus.server_url = "https://signal.example.org".to_string();
        config.webrtc.stun_servers = vec!["stun:stun.l.google.com:19302".to_string()];
        config.save_to(&path)?;

        let loaded = Config::load_from(&path)?;
        assert_eq!(loaded.bus.server_url, "https://signal.example.org");
        assert_eq!(loaded.webrtc.stun_servers, vec!["stun:stun.l.google.com:19302"]);

        Ok(())
    }

    #[test]
    fn test_partial_file_uses_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[bus]\nreconnect_min_ms = 100\n")?;

        let config = Config::load_from(&path)?;
        assert_eq!(config.bus.reconnect_min_ms, 100);
        assert_eq!(config.bus.server_url, "http://localhost:8080");
        assert_eq!(config.mesh.event_buffer, 256);
        assert_eq!(config.mesh_options().message_buffer, 1024);

        let settings = config.bus_settings();
        assert_eq!(settings.reconnect_min, Duration::from_millis(100));
        assert_eq!(settings.buffer, 256);

        Ok(())
    }
}

//! Configuration loading and validation

use anyhow::{Context, Result};
use fabsync_engine::{EngineConfig, WindowParams, DEFAULT_SETUP_PIN};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub bridge: Option<BridgeConfig>,
    #[serde(default)]
    pub commissioning: CommissioningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Unix socket of the controller process handling transport and
    /// session crypto.
    #[serde(default = "default_socket")]
    pub socket: String,
    /// Where the admin state (node id watermark, bridge id) lives.
    #[serde(default = "default_state_path")]
    pub state_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            state_path: default_state_path(),
        }
    }
}

/// Remote fabric bridge to pair on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub node_id: u64,
    #[serde(default = "default_setup_pin")]
    pub setup_pin: u32,
    pub host: String,
    #[serde(default = "default_bridge_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissioningConfig {
    /// Seconds the bridge has to answer an approval request.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
    /// Seconds a commissioning window stays open during admission.
    #[serde(default = "default_window_timeout")]
    pub window_timeout_secs: u16,
    /// Discriminator advertised while the window is open.
    #[serde(default = "default_discriminator")]
    pub discriminator: u16,
    /// PBKDF iteration count for verifier derivation.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Setup PIN for devices commissioned during admission.
    #[serde(default = "default_setup_pin")]
    pub setup_pin: u32,
}

impl Default for CommissioningConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: default_response_timeout(),
            window_timeout_secs: default_window_timeout(),
            discriminator: default_discriminator(),
            iterations: default_iterations(),
            setup_pin: default_setup_pin(),
        }
    }
}

fn default_socket() -> String {
    "/run/fabsync/controller.sock".to_string()
}

fn default_state_path() -> String {
    "fabsync-admin.json".to_string()
}

fn default_bridge_port() -> u16 {
    5540
}

fn default_response_timeout() -> u64 {
    30
}

fn default_window_timeout() -> u16 {
    300
}

fn default_discriminator() -> u16 {
    3840
}

fn default_iterations() -> u32 {
    1000
}

fn default_setup_pin() -> u32 {
    DEFAULT_SETUP_PIN
}

impl Config {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            response_timeout: Duration::from_secs(self.commissioning.response_timeout_secs),
            setup_pin: self.commissioning.setup_pin,
            window_params: WindowParams {
                iterations: self.commissioning.iterations,
                timeout_secs: self.commissioning.window_timeout_secs,
                discriminator: self.commissioning.discriminator,
                salt: Vec::new(),
                verifier: Vec::new(),
            },
        }
    }
}

/// Load configuration from a TOML file, falling back to defaults when the
/// file does not exist.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        info!(path = %path.display(), "No config file, using defaults");
        return Ok(Config::default());
    }
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: Config =
        toml::from_str(&data).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.commissioning.response_timeout_secs, 30);
        assert_eq!(config.commissioning.setup_pin, DEFAULT_SETUP_PIN);
        assert!(config.bridge.is_none());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [bridge]
            node_id = 7
            host = "fe80::1"

            [commissioning]
            response_timeout_secs = 10
            "#,
        )
        .unwrap();
        let bridge = config.bridge.unwrap();
        assert_eq!(bridge.node_id, 7);
        assert_eq!(bridge.port, 5540);
        assert_eq!(bridge.setup_pin, DEFAULT_SETUP_PIN);
        assert_eq!(config.commissioning.response_timeout_secs, 10);
        assert_eq!(config.commissioning.discriminator, 3840);
    }

    #[test]
    fn engine_config_mirrors_commissioning_section() {
        let config = Config::default();
        let engine = config.to_engine_config();
        assert_eq!(engine.response_timeout, Duration::from_secs(30));
        assert_eq!(engine.window_params.timeout_secs, 300);
        assert!(engine.window_params.salt.is_empty());
    }
}

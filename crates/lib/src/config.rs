//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.courier/config.json`) and environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Messaging bridge the protocol client connects to.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Credential store location.
    #[serde(default)]
    pub store: StoreConfig,

    /// How pairing codes are shown to the operator.
    #[serde(default)]
    pub pairing: PairingConfig,
}

/// HTTP bind address and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the HTTP API (default 8080).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Bridge endpoint and connect credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// WebSocket URL of the bridge. Overridden by COURIER_BRIDGE_URL env.
    #[serde(default = "default_bridge_url")]
    pub url: String,

    /// Shared secret presented at connect. Overridden by COURIER_BRIDGE_TOKEN env.
    pub token: Option<String>,

    /// Per-send timeout in milliseconds. Unset means sends wait for the bridge indefinitely.
    pub send_timeout_ms: Option<u64>,
}

fn default_bridge_url() -> String {
    "ws://127.0.0.1:3900/ws".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
            token: None,
            send_timeout_ms: None,
        }
    }
}

/// Credential store config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Path of the device identity file (default ~/.courier/device.json).
    pub path: Option<PathBuf>,
}

/// Pairing code rendering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingConfig {
    #[serde(default)]
    pub render: PairingRender,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingRender {
    /// Half-block QR code on stdout.
    #[default]
    Qr,

    /// The raw code string on stdout.
    Text,
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the bridge URL: env COURIER_BRIDGE_URL overrides config.
pub fn resolve_bridge_url(config: &Config) -> String {
    non_empty_env("COURIER_BRIDGE_URL").unwrap_or_else(|| config.bridge.url.trim().to_string())
}

/// Resolve the bridge token: env COURIER_BRIDGE_TOKEN overrides config.
pub fn resolve_bridge_token(config: &Config) -> Option<String> {
    non_empty_env("COURIER_BRIDGE_TOKEN").or_else(|| {
        config
            .bridge
            .token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Per-send timeout, if configured. Zero is treated as unset.
pub fn send_timeout(config: &Config) -> Option<Duration> {
    config
        .bridge
        .send_timeout_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

fn courier_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".courier"))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("COURIER_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            courier_dir()
                .map(|d| d.join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Credential file: `store.path` when set, else ~/.courier/device.json.
pub fn resolve_store_path(config: &Config) -> PathBuf {
    match &config.store.path {
        Some(p) if !p.as_os_str().is_empty() => p.clone(),
        _ => courier_dir()
            .map(|d| d.join("device.json"))
            .unwrap_or_else(|| PathBuf::from("device.json")),
    }
}

/// Load config from the given path, COURIER_CONFIG_PATH, or the default. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

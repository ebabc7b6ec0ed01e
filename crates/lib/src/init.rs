//! Initialize the configuration directory: create ~/.courier and a default config file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Default config written by `courier init`. Mirrors `Config::default()` so operators can see every knob.
const DEFAULT_CONFIG: &str = r#"{
  "gateway": { "port": 8080, "bind": "127.0.0.1" },
  "bridge": { "url": "ws://127.0.0.1:3900/ws" },
  "pairing": { "render": "qr" }
}
"#;

/// Create the config directory and default config if they do not exist.
/// Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, DEFAULT_CONFIG)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    } else {
        log::debug!("config already exists at {}, skipping", config_path.display());
    }

    Ok(config_dir.to_path_buf())
}

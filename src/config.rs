//! Configuration file loading for the `nat64-rs` binary.

use anyhow::{Context, Result};
use nat64_state::Nat64Config;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

/// Parse a TOML file.
fn load_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve the default config path (~/.config/nat64-rs/nat64.toml).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("nat64-rs").join("nat64.toml"))
}

/// Load the NAT64 configuration from an explicit path, or from the default
/// location.
///
/// The result is parsed but not validated; building the engine validates it.
pub fn load_config(path: Option<&Path>) -> Result<(PathBuf, Nat64Config)> {
    let config_path = match path {
        Some(p) => expand_tilde(p),
        None => default_config_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?,
    };
    let config = load_toml(&config_path)?;
    Ok((config_path, config))
}

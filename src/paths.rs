//! Centralized path resolution for mcpherd
//!
//! Follows XDG Base Directory Specification with 12-factor env var overrides.
//!
//! ## Directory Layout
//!
//! ```text
//! ~/.local/share/mcpherd/      (XDG_DATA_HOME)
//! └── tokens.db
//!
//! ~/.config/mcpherd/           (XDG_CONFIG_HOME)
//! └── servers.toml
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `MCPHERD_DB` | Token database path | `~/.local/share/mcpherd/tokens.db` |
//! | `MCPHERD_CONFIG` | Server config path | `~/.config/mcpherd/servers.toml` |

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::debug;

/// Get the XDG data directory for mcpherd
///
/// Priority: `XDG_DATA_HOME` > `~/.local/share`
pub fn data_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("mcpherd");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share/mcpherd");
    }

    // Last resort: current directory
    PathBuf::from(".")
}

/// Get the XDG config directory for mcpherd
///
/// Priority: `XDG_CONFIG_HOME` > `~/.config`
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("mcpherd");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config/mcpherd");
    }

    // Last resort: current directory
    PathBuf::from(".")
}

/// Get the token database path
///
/// Priority: `MCPHERD_DB` env var > `data_dir()/tokens.db`
pub fn db_path() -> PathBuf {
    std::env::var("MCPHERD_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("tokens.db"))
}

/// Get the server config path
///
/// Priority: `MCPHERD_CONFIG` env var > `config_dir()/servers.toml`
pub fn settings_path() -> PathBuf {
    std::env::var("MCPHERD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("servers.toml"))
}

/// Ensure required directories exist
///
/// Creates `data_dir()` and `config_dir()` if they don't exist.
pub fn ensure_dirs() -> Result<()> {
    let data = data_dir();
    if !data.exists() {
        debug!("creating data directory: {}", data.display());
        std::fs::create_dir_all(&data)
            .with_context(|| format!("failed to create data directory: {}", data.display()))?;
    }

    let config = config_dir();
    if !config.exists() {
        debug!("creating config directory: {}", config.display());
        std::fs::create_dir_all(&config)
            .with_context(|| format!("failed to create config directory: {}", config.display()))?;
    }

    Ok(())
}

/// Log resolved paths for discoverability
pub fn log_paths() {
    use tracing::info;
    info!("data directory: {}", data_dir().display());
    info!("config directory: {}", config_dir().display());
    info!("token database: {}", db_path().display());
    info!("server config: {}", settings_path().display());
}

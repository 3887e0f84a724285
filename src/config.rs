//! Server configuration
//!
//! Desired state for the upstream fleet. A [`ServerConfig`] is an immutable
//! value: the loader replaces whole records, everything downstream shares
//! them as `Arc<ServerConfig>` and never mutates in place.
//!
//! The daemon reads a TOML settings file (`[[servers]]` blocks) and turns it
//! into versioned [`ConfigSnapshot`]s for the supervisor. A `notify` watcher
//! re-reads the file on change and pushes the next snapshot.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Transport selector for one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// Pick stdio when a command is configured, streamable HTTP otherwise.
    #[default]
    Auto,
    Stdio,
    /// Plain HTTP request/response; served by the streamable HTTP client.
    Http,
    StreamableHttp,
    Sse,
}

impl Protocol {
    /// Resolve `Auto` against the rest of the config.
    pub fn resolve(self, config: &ServerConfig) -> Protocol {
        match self {
            Protocol::Auto => {
                if config.command.is_some() {
                    Protocol::Stdio
                } else {
                    Protocol::StreamableHttp
                }
            }
            other => other,
        }
    }
}

/// OAuth grant selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    #[default]
    Auto,
    AuthorizationCode,
    DeviceCode,
}

/// Optional OAuth block of a [`ServerConfig`].
///
/// Endpoints left empty are filled in at runtime by metadata discovery;
/// client credentials may be populated by dynamic registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct OAuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scopes: Vec<String>,
    pub redirect_uris: Vec<String>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub device_endpoint: Option<String>,
    pub registration_endpoint: Option<String>,
    pub use_pkce: bool,
    /// Defer the interactive flow until the server actually rejects us.
    pub lazy_auth: bool,
    pub flow_type: FlowType,
}

fn default_true() -> bool {
    true
}

/// Desired state for one upstream MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub quarantined: bool,
    /// Per-request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Cap on automatic connect retries; unset retries forever.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,
}

impl ServerConfig {
    /// Minimal config for a remote server, used heavily in tests.
    pub fn http(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            protocol: Protocol::Auto,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            headers: BTreeMap::new(),
            enabled: true,
            quarantined: false,
            timeout_secs: None,
            max_retries: None,
            oauth: None,
        }
    }

    /// Whether the reconciler should hold a live connection for this server.
    pub fn should_connect(&self) -> bool {
        self.enabled && !self.quarantined
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// True when a change requires tearing the connection down and
    /// rebuilding it (as opposed to, say, an edited description).
    pub fn materially_differs(&self, other: &ServerConfig) -> bool {
        self.url != other.url
            || self.protocol != other.protocol
            || self.command != other.command
            || self.args != other.args
            || self.enabled != other.enabled
            || self.quarantined != other.quarantined
    }
}

/// Parsed settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, rename = "servers")]
    pub servers: Vec<ServerConfig>,
}

impl Settings {
    /// Load settings from a TOML file. A missing file is an empty fleet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Settings::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let settings: Settings = toml::from_str(&text)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        Ok(settings)
    }
}

/// One versioned view of the desired fleet.
///
/// Duplicate names are rejected at load time, so the map is total.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub servers: BTreeMap<String, Arc<ServerConfig>>,
}

impl ConfigSnapshot {
    pub fn new(version: u64, configs: Vec<ServerConfig>) -> Result<Self> {
        let mut servers = BTreeMap::new();
        for config in configs {
            let name = config.name.clone();
            if servers.insert(name.clone(), Arc::new(config)).is_some() {
                anyhow::bail!("duplicate server name in config: {name}");
            }
        }
        Ok(Self { version, servers })
    }
}

/// Keeps the filesystem watcher alive; drop to stop watching.
pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
}

/// Load the settings file and push snapshots into `tx` on every change.
///
/// The initial snapshot is sent before this returns so the supervisor has a
/// fleet to reconcile immediately. Reload failures keep the previous
/// snapshot in force.
pub fn watch_settings(
    path: PathBuf,
    tx: tokio::sync::mpsc::Sender<ConfigSnapshot>,
) -> Result<ConfigWatcher> {
    use notify::{RecursiveMode, Watcher};

    let settings = Settings::load(&path)?;
    let initial = ConfigSnapshot::new(1, settings.servers)?;
    info!(
        servers = initial.servers.len(),
        "loaded server config from {}",
        path.display()
    );
    tx.try_send(initial)
        .context("config snapshot channel full at startup")?;

    let (raw_tx, raw_rx) = std::sync::mpsc::channel();
    let mut watcher = notify::RecommendedWatcher::new(
        raw_tx,
        notify::Config::default().with_poll_interval(Duration::from_millis(500)),
    )
    .context("failed to create filesystem watcher")?;

    // Watch the parent directory: editors replace the file by rename.
    let watch_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch: {}", watch_dir.display()))?;

    std::thread::spawn(move || {
        let mut version = 1u64;
        for result in raw_rx {
            let event = match result {
                Ok(event) => event,
                Err(err) => {
                    warn!("config watcher error: {err}");
                    continue;
                }
            };
            let relevant = matches!(
                event.kind,
                notify::EventKind::Create(_)
                    | notify::EventKind::Modify(_)
                    | notify::EventKind::Remove(_)
            ) && event.paths.iter().any(|p| p == &path);
            if !relevant {
                continue;
            }

            match Settings::load(&path) {
                Ok(settings) => {
                    version += 1;
                    match ConfigSnapshot::new(version, settings.servers) {
                        Ok(snapshot) => {
                            info!(version, "config reloaded");
                            if tx.blocking_send(snapshot).is_err() {
                                // Supervisor gone; stop feeding it.
                                break;
                            }
                        }
                        Err(err) => warn!("config rejected: {err}"),
                    }
                }
                Err(err) => warn!("config reload failed, keeping previous: {err}"),
            }
        }
    });

    Ok(ConfigWatcher { _watcher: watcher })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_server() {
        let settings: Settings = toml::from_str(
            r#"
            [[servers]]
            name = "holler"
            url = "http://localhost:8080/mcp"
            "#,
        )
        .unwrap();

        assert_eq!(settings.servers.len(), 1);
        let s = &settings.servers[0];
        assert_eq!(s.name, "holler");
        assert!(s.enabled);
        assert!(!s.quarantined);
        assert_eq!(s.protocol, Protocol::Auto);
        assert!(s.oauth.is_none());
    }

    #[test]
    fn test_parse_full_server() {
        let settings: Settings = toml::from_str(
            r#"
            [[servers]]
            name = "files"
            protocol = "stdio"
            command = "mcp-files"
            args = ["--root", "/tmp"]
            enabled = false
            timeout_secs = 15

            [servers.env]
            RUST_LOG = "debug"

            [servers.oauth]
            scopes = ["mcp"]
            use_pkce = true
            flow_type = "device_code"
            "#,
        )
        .unwrap();

        let s = &settings.servers[0];
        assert_eq!(s.protocol, Protocol::Stdio);
        assert_eq!(s.command.as_deref(), Some("mcp-files"));
        assert_eq!(s.args, vec!["--root", "/tmp"]);
        assert!(!s.enabled);
        assert_eq!(s.timeout(), Some(Duration::from_secs(15)));
        let oauth = s.oauth.as_ref().unwrap();
        assert_eq!(oauth.flow_type, FlowType::DeviceCode);
        assert!(oauth.use_pkce);
    }

    #[test]
    fn test_protocol_resolution() {
        let mut config = ServerConfig::http("s", "https://a.example");
        assert_eq!(Protocol::Auto.resolve(&config), Protocol::StreamableHttp);

        config.command = Some("serve".into());
        assert_eq!(Protocol::Auto.resolve(&config), Protocol::Stdio);
        assert_eq!(Protocol::Sse.resolve(&config), Protocol::Sse);
    }

    #[test]
    fn test_material_difference() {
        let a = ServerConfig::http("s1", "https://a");
        let mut b = a.clone();
        assert!(!a.materially_differs(&b));

        b.url = "https://b".into();
        assert!(a.materially_differs(&b));

        let mut c = a.clone();
        c.headers.insert("x-extra".into(), "1".into());
        assert!(!a.materially_differs(&c));

        let mut d = a.clone();
        d.quarantined = true;
        assert!(a.materially_differs(&d));
    }

    #[test]
    fn test_snapshot_rejects_duplicates() {
        let configs = vec![
            ServerConfig::http("dup", "https://a"),
            ServerConfig::http("dup", "https://b"),
        ];
        assert!(ConfigSnapshot::new(1, configs).is_err());
    }

    #[test]
    fn test_should_connect() {
        let mut config = ServerConfig::http("s", "https://a");
        assert!(config.should_connect());
        config.quarantined = true;
        assert!(!config.should_connect());
        config.quarantined = false;
        config.enabled = false;
        assert!(!config.should_connect());
    }
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::event::SourceKind;

pub const MIN_RETRY_INTERVAL_MS: u64 = 100;
pub const MAX_RETRY_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_DEVICE_PATH: &str = "/dev/virtio-ports/confwatch.0";
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8181";
pub const DEFAULT_SUBMIT_PATH: &str = "/changes/submit/";

/// Root configuration structure. Deserialized from
/// `$XDG_CONFIG_HOME/confwatch/config.toml`.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub paths: PathOverrides,
}

#[derive(Debug, Deserialize)]
pub struct GlobalConfig {
    /// Default tracing filter; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Framed stream on the virtio serial port.
    #[default]
    Port,
    /// One HTTP POST per change.
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub transport: TransportKind,
    /// Flush interval in milliseconds. Clamped to [100, 60000].
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_device_path")]
    pub device_path: PathBuf,
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_submit_path")]
    pub submit_path: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            server_url: DEFAULT_SERVER_URL.to_string(),
            submit_path: DEFAULT_SUBMIT_PATH.to_string(),
        }
    }
}

impl DeliveryConfig {
    /// Returns the flush interval clamped to the supported range.
    pub fn effective_retry_interval_ms(&self) -> u64 {
        self.retry_interval_ms
            .clamp(MIN_RETRY_INTERVAL_MS, MAX_RETRY_INTERVAL_MS)
    }
}

/// Per-source switches. Every source is enabled unless turned off.
#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    #[serde(default = "enabled")]
    pub settings: bool,
    #[serde(default = "enabled")]
    pub network: bool,
    #[serde(default = "enabled")]
    pub chromium: bool,
    #[serde(default = "enabled")]
    pub chrome: bool,
    #[serde(default = "enabled")]
    pub firefox: bool,
    #[serde(default = "enabled")]
    pub firefox_bookmarks: bool,
    #[serde(default = "enabled")]
    pub online_accounts: bool,
}

impl SourcesConfig {
    pub fn enabled(&self, kind: SourceKind) -> bool {
        match kind {
            SourceKind::Settings => self.settings,
            SourceKind::Network => self.network,
            SourceKind::Chromium => self.chromium,
            SourceKind::Chrome => self.chrome,
            SourceKind::Firefox => self.firefox,
            SourceKind::FirefoxBookmarks => self.firefox_bookmarks,
            SourceKind::OnlineAccounts => self.online_accounts,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            settings: true,
            network: true,
            chromium: true,
            chrome: true,
            firefox: true,
            firefox_bookmarks: true,
            online_accounts: true,
        }
    }
}

/// Optional replacements for the default watched locations.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PathOverrides {
    pub chromium_dir: Option<PathBuf>,
    pub chrome_dir: Option<PathBuf>,
    pub firefox_dir: Option<PathBuf>,
    pub goa_accounts: Option<PathBuf>,
    pub policy_map: Option<PathBuf>,
    pub bookmark_socket: Option<PathBuf>,
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_retry_interval() -> u64 {
    DEFAULT_RETRY_INTERVAL_MS
}

fn default_device_path() -> PathBuf {
    PathBuf::from(DEFAULT_DEVICE_PATH)
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_submit_path() -> String {
    DEFAULT_SUBMIT_PATH.to_string()
}

fn enabled() -> bool {
    true
}

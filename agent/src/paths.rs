/// Canonical locations used by the agent on a Linux desktop session.
///
/// Agent files live under `$XDG_CONFIG_HOME/confwatch/`:
///   - config.toml  Written by the administrator, read by the agent.
///   - status.toml  Written by the agent.
///
/// Watched application files follow each application's own conventions.
use std::ffi::OsString;
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "confwatch";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";
pub const POLICY_MAP_FILE: &str = "confwatch/chromium-policies.json";
pub const VIRTIO_PORTS_DIR: &str = "/dev/virtio-ports";
/// Device files named `<prefix><host>-<port>` announce the admin server.
pub const SERVER_DEVFILE_PREFIX: &str = "confwatch_";

/// `$HOME`, or `/` when unset.
pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// `$XDG_CONFIG_HOME`, defaulting to `~/.config`.
pub fn user_config_dir() -> PathBuf {
    xdg_dir(std::env::var_os("XDG_CONFIG_HOME"), &home_dir(), ".config")
}

/// System data directories from `$XDG_DATA_DIRS`.
pub fn system_data_dirs() -> Vec<PathBuf> {
    split_dirs(std::env::var_os("XDG_DATA_DIRS"))
}

fn xdg_dir(value: Option<OsString>, home: &Path, fallback: &str) -> PathBuf {
    match value {
        Some(v) if !v.is_empty() => PathBuf::from(v),
        _ => home.join(fallback),
    }
}

fn split_dirs(value: Option<OsString>) -> Vec<PathBuf> {
    let raw = value
        .and_then(|v| v.into_string().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "/usr/local/share:/usr/share".to_string());
    raw.split(':')
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Returns the agent directory: `$XDG_CONFIG_HOME/confwatch/`
pub fn app_config_dir() -> PathBuf {
    user_config_dir().join(APP_DIR_NAME)
}

pub fn config_file_path() -> PathBuf {
    app_config_dir().join(CONFIG_FILE_NAME)
}

pub fn status_file_path() -> PathBuf {
    app_config_dir().join(STATUS_FILE_NAME)
}

pub fn chromium_dir() -> PathBuf {
    user_config_dir().join("chromium")
}

pub fn chrome_dir() -> PathBuf {
    user_config_dir().join("google-chrome")
}

pub fn firefox_dir() -> PathBuf {
    home_dir().join(".mozilla").join("firefox")
}

pub fn goa_accounts_path() -> PathBuf {
    user_config_dir().join("goa-1.0").join("accounts.conf")
}

/// Marker file that makes LibreOffice write its registry through dconf.
pub fn libreoffice_dconfwrite_path() -> PathBuf {
    user_config_dir().join("libreoffice").join("dconfwrite")
}

/// Unix socket the Firefox native-messaging helper writes bookmark events to.
pub fn bookmark_socket_path() -> PathBuf {
    let runtime = std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    runtime.join("confwatch-bookmarks.sock")
}

/// Returns the first existing Chromium policy map in `dirs`.
pub fn find_policy_map(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|d| d.join(POLICY_MAP_FILE))
        .find(|p| p.is_file())
}

/// Looks for a `<prefix><host>-<port>` device file in `dir` and returns the
/// announced admin server.
pub fn discover_server(dir: &Path) -> Option<(String, u16)> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(hostport) = name.strip_prefix(SERVER_DEVFILE_PREFIX) {
            let parsed = parse_host_port(hostport);
            if parsed.is_none() {
                tracing::debug!("{name} does not name a host and port");
            }
            return parsed;
        }
    }
    None
}

fn parse_host_port(hostport: &str) -> Option<(String, u16)> {
    let (host, port) = hostport.rsplit_once('-')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}

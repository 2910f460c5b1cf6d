use std::fmt;

use serde::{Deserialize, Serialize};

use crate::status::SourceState;

/// Closed set of change namespaces understood by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Namespace {
    #[serde(rename = "org.gnome.gsettings")]
    DesktopSettings,
    #[serde(rename = "org.libreoffice.registry")]
    OfficeSettings,
    #[serde(rename = "org.freedesktop.NetworkManager")]
    NetworkManager,
    #[serde(rename = "org.chromium.Policies")]
    ChromiumPolicies,
    #[serde(rename = "com.google.chrome.Policies")]
    ChromePolicies,
    #[serde(rename = "org.mozilla.firefox")]
    Firefox,
    #[serde(rename = "org.mozilla.firefox.Bookmarks")]
    FirefoxBookmarks,
    #[serde(rename = "org.gnome.online-accounts")]
    OnlineAccounts,
}

impl Namespace {
    pub const ALL: [Namespace; 8] = [
        Namespace::DesktopSettings,
        Namespace::OfficeSettings,
        Namespace::NetworkManager,
        Namespace::ChromiumPolicies,
        Namespace::ChromePolicies,
        Namespace::Firefox,
        Namespace::FirefoxBookmarks,
        Namespace::OnlineAccounts,
    ];

    /// Name used on the wire and in the HTTP submit path.
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::DesktopSettings => "org.gnome.gsettings",
            Namespace::OfficeSettings => "org.libreoffice.registry",
            Namespace::NetworkManager => "org.freedesktop.NetworkManager",
            Namespace::ChromiumPolicies => "org.chromium.Policies",
            Namespace::ChromePolicies => "com.google.chrome.Policies",
            Namespace::Firefox => "org.mozilla.firefox",
            Namespace::FirefoxBookmarks => "org.mozilla.firefox.Bookmarks",
            Namespace::OnlineAccounts => "org.gnome.online-accounts",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.as_str() == name)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single normalized configuration change. The payload is a JSON document
/// whose shape depends on the namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    namespace: Namespace,
    payload: String,
}

impl ChangeEvent {
    pub fn new(namespace: Namespace, payload: impl Into<String>) -> Self {
        Self {
            namespace,
            payload: payload.into(),
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Anything that accepts normalized changes from a watcher.
///
/// The delivery queue is the production implementation; tests collect into a
/// `Vec`.
pub trait ChangeSink: Send + Sync {
    fn submit(&self, event: ChangeEvent);
}

/// Identifies one watched configuration source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Settings,
    Network,
    Chromium,
    Chrome,
    Firefox,
    FirefoxBookmarks,
    OnlineAccounts,
}

impl SourceKind {
    pub const ALL: [SourceKind; 7] = [
        SourceKind::Settings,
        SourceKind::Network,
        SourceKind::Chromium,
        SourceKind::Chrome,
        SourceKind::Firefox,
        SourceKind::FirefoxBookmarks,
        SourceKind::OnlineAccounts,
    ];
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Settings => "settings",
            SourceKind::Network => "network",
            SourceKind::Chromium => "chromium",
            SourceKind::Chrome => "chrome",
            SourceKind::Firefox => "firefox",
            SourceKind::FirefoxBookmarks => "firefox_bookmarks",
            SourceKind::OnlineAccounts => "online_accounts",
        };
        f.write_str(name)
    }
}

pub enum AgentEvent {
    /// A source driver entered a new lifecycle state.
    SourceState(SourceKind, SourceState),
    /// Ctrl+C received; give up pending deliveries and exit.
    Shutdown,
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::event::SourceKind;

/// Lifecycle state of one source watcher.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    /// Not started yet (or disabled in the config).
    Uninitialized,
    /// The backing file or bus name is present and being watched.
    Watching,
    /// The backing file or bus name is absent; retried on every notification.
    Degraded,
}

/// Runtime status written by the agent to `status.toml` next to its config.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentStatus {
    /// Agent binary version (set from Cargo.toml at compile time).
    pub version: String,
    /// Changes waiting for delivery when the status was written.
    pub queued: usize,
    /// RFC 3339 timestamp of the most recent successful delivery, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_delivery: Option<String>,
    /// Human-readable message for the last non-fatal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Keyed by the source's config name.
    pub sources: BTreeMap<String, SourceState>,
}

impl AgentStatus {
    /// Initial status on startup: every known source uninitialized.
    pub fn new() -> Self {
        let sources = SourceKind::ALL
            .into_iter()
            .map(|kind| (kind.to_string(), SourceState::Uninitialized))
            .collect();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            queued: 0,
            last_delivery: None,
            error: None,
            sources,
        }
    }

    /// Records a source's state. A degraded source becomes the reported
    /// error; once it recovers, the error moves to another degraded source or
    /// is cleared.
    pub fn set_source(&mut self, kind: SourceKind, state: SourceState) {
        self.sources.insert(kind.to_string(), state);
        if state == SourceState::Degraded {
            self.error = Some(degraded_message(&kind.to_string()));
            return;
        }
        if self.error.as_deref() == Some(degraded_message(&kind.to_string()).as_str()) {
            self.error = self
                .sources
                .iter()
                .find(|(_, st)| **st == SourceState::Degraded)
                .map(|(name, _)| degraded_message(name));
        }
    }
}

fn degraded_message(source: &str) -> String {
    format!("{source} source degraded")
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes `status` to TOML and writes it to `path`, creating the parent
/// directory if needed. Failures are logged; a status write never stops the
/// agent.
pub fn write_status(path: &Path, status: &AgentStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                tracing::warn!("failed to write status file: {e}");
            }
        }
        Err(e) => tracing::warn!("failed to serialize status: {e}"),
    }
}

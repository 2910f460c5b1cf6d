/// Firefox preference watcher and bookmark event listener.
///
/// Preferences come from the default profile's `prefs.js`, located through
/// `installs.ini`. The first successful read is the baseline; later reads
/// report every preference that is new or changed.
///
/// Firefox offers no bookmark file worth diffing, so a browser extension's
/// native-messaging helper forwards bookmark events as JSON lines over a
/// Unix socket owned by the agent.
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::event::{ChangeEvent, ChangeSink, Namespace};
use crate::file_monitor::FileMonitor;
use crate::keyfile::KeyFile;
use crate::sources::SourceContext;
use crate::status::SourceState;

pub const INSTALLS_FILE: &str = "installs.ini";
pub const PREFS_FILE: &str = "prefs.js";

const PREF_START: &str = "user_pref(";
const PREF_END: &str = ");";

/// Parses `user_pref("name", value);` lines. Lines that do not parse are
/// skipped.
pub fn parse_user_prefs(text: &str) -> BTreeMap<String, Value> {
    let mut prefs = BTreeMap::new();
    for line in text.lines().map(str::trim) {
        let Some(inner) = line
            .strip_prefix(PREF_START)
            .and_then(|l| l.strip_suffix(PREF_END))
        else {
            continue;
        };
        match serde_json::from_str::<(String, Value)>(&format!("[{inner}]")) {
            Ok((key, value)) => {
                prefs.insert(key, value);
            }
            Err(e) => tracing::debug!("ignoring preference line {line}: {e}"),
        }
    }
    prefs
}

/// Directory of the default profile named in `installs.ini`: the first group
/// with a `Default` entry.
pub fn default_profile(datadir: &Path, installs: &KeyFile) -> Option<PathBuf> {
    installs
        .groups()
        .find_map(|group| installs.get(group, "Default"))
        .map(|dir| datadir.join(dir))
}

pub struct FirefoxWatcher {
    datadir: PathBuf,
    prefs_path: Option<PathBuf>,
    known: Option<BTreeMap<String, Value>>,
    sink: Arc<dyn ChangeSink>,
}

impl FirefoxWatcher {
    pub fn new(datadir: PathBuf, sink: Arc<dyn ChangeSink>) -> Self {
        Self {
            datadir,
            prefs_path: None,
            known: None,
            sink,
        }
    }

    pub fn installs_path(&self) -> PathBuf {
        self.datadir.join(INSTALLS_FILE)
    }

    pub fn prefs_path(&self) -> Option<&Path> {
        self.prefs_path.as_deref()
    }

    /// Dispatches a change of a watched file. Returns files that must be
    /// watched from now on.
    pub fn handle_change(&mut self, path: &Path) -> Vec<PathBuf> {
        if self.prefs_path.as_deref() == Some(path) {
            self.handle_prefs();
            return Vec::new();
        }
        if path == self.installs_path() {
            return self.handle_installs().into_iter().collect();
        }
        Vec::new()
    }

    /// Looks up the default profile once. Returns its `prefs.js` the first
    /// time it is found.
    pub fn handle_installs(&mut self) -> Option<PathBuf> {
        if self.prefs_path.is_some() {
            return None;
        }
        let path = self.installs_path();
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(_) => {
                tracing::debug!("firefox profiles file {} not present (yet)", path.display());
                return None;
            }
        };
        let installs = match KeyFile::parse(&text) {
            Ok(kf) => kf,
            Err(e) => {
                tracing::debug!("could not parse {}: {e:#}", path.display());
                return None;
            }
        };
        let Some(profile) = default_profile(&self.datadir, &installs) else {
            tracing::debug!("no default profile in {}", path.display());
            return None;
        };
        let prefs = profile.join(PREFS_FILE);
        tracing::debug!("monitoring firefox preferences at {}", prefs.display());
        self.prefs_path = Some(prefs.clone());
        self.handle_prefs();
        Some(prefs)
    }

    /// Reads `prefs.js`; emits new or changed preferences after the baseline.
    pub fn handle_prefs(&mut self) {
        let Some(path) = &self.prefs_path else {
            return;
        };
        let Ok(text) = std::fs::read_to_string(path) else {
            tracing::debug!("firefox preferences {} not present (yet)", path.display());
            return;
        };
        let prefs = parse_user_prefs(&text);
        if self.known.is_none() {
            tracing::debug!(count = prefs.len(), "initial firefox preferences loaded");
            self.known = Some(prefs);
            return;
        }
        let Some(known) = self.known.as_mut() else {
            return;
        };
        for (key, value) in prefs {
            if known.get(&key) != Some(&value) {
                let payload = json!({"key": key, "value": value});
                self.sink
                    .submit(ChangeEvent::new(Namespace::Firefox, payload.to_string()));
            }
            known.insert(key, value);
        }
    }
}

/// Preference driver loop.
pub fn run(mut ctx: SourceContext, datadir: PathBuf) {
    let mut monitor = match FileMonitor::new() {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("{e:#}");
            ctx.reporter.set(SourceState::Degraded);
            return;
        }
    };
    let mut watcher = FirefoxWatcher::new(datadir, Arc::clone(&ctx.sink));
    if let Err(e) = monitor.watch_file(&watcher.installs_path()) {
        tracing::error!("{e:#}");
        ctx.reporter.set(SourceState::Degraded);
        return;
    }

    let mut pending: Vec<PathBuf> = watcher.handle_installs().into_iter().collect();
    loop {
        for path in pending.drain(..) {
            if let Err(e) = monitor.watch_file(&path) {
                tracing::warn!("{e:#}");
            }
        }
        let present = watcher.prefs_path().is_some_and(Path::is_file);
        ctx.reporter.set(if present {
            SourceState::Watching
        } else {
            SourceState::Degraded
        });

        let Some(changed) = monitor.wait() else {
            tracing::warn!("firefox file watcher stopped");
            ctx.reporter.set(SourceState::Degraded);
            return;
        };
        for path in changed {
            pending.extend(watcher.handle_change(&path));
        }
    }
}

// ── Bookmarks ─────────────────────────────────────────────────────────────────

/// One event from the browser extension.
#[derive(Debug, Deserialize)]
pub struct BookmarkMessage {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub placement: String,
    #[serde(default)]
    pub folder: String,
}

/// Turns extension messages into bookmark changes.
pub struct BookmarkListener {
    sink: Arc<dyn ChangeSink>,
}

impl BookmarkListener {
    pub fn new(sink: Arc<dyn ChangeSink>) -> Self {
        Self { sink }
    }

    /// Handles one JSON message line. Returns whether a change was emitted.
    pub fn handle_message(&self, line: &str) -> bool {
        let message: BookmarkMessage = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("ignoring bookmark message: {e}");
                return false;
            }
        };
        match message.action.as_str() {
            "add" | "change" | "move" => {
                let payload = json!({
                    "key": message.id,
                    "value": {
                        "Title": message.title,
                        "URL": message.url,
                        "Placement": message.placement,
                        "Folder": message.folder,
                    }
                });
                self.sink
                    .submit(ChangeEvent::new(Namespace::FirefoxBookmarks, payload.to_string()));
                true
            }
            // Removal is not collected.
            "remove" => {
                tracing::debug!(id = %message.id, "bookmark removed");
                false
            }
            other => {
                tracing::debug!("unknown bookmark action {other}");
                false
            }
        }
    }

    /// Reads messages from one client until it disconnects.
    pub fn serve<R: Read>(&self, stream: R) -> usize {
        let mut emitted = 0;
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(line) if line.trim().is_empty() => {}
                Ok(line) => emitted += usize::from(self.handle_message(&line)),
                Err(e) => {
                    tracing::debug!("bookmark client read failed: {e}");
                    break;
                }
            }
        }
        emitted
    }
}

/// Bookmark socket driver: accepts helper connections one at a time.
pub fn run_bookmarks(mut ctx: SourceContext, socket_path: PathBuf) {
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(&socket_path) {
            tracing::error!("failed to remove stale socket {}: {e}", socket_path.display());
        }
    }
    if let Some(parent) = socket_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let listener = match UnixListener::bind(&socket_path) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("failed to bind {}: {e}", socket_path.display());
            ctx.reporter.set(SourceState::Degraded);
            return;
        }
    };
    tracing::info!("listening for firefox bookmarks on {}", socket_path.display());
    ctx.reporter.set(SourceState::Watching);

    let handler = BookmarkListener::new(Arc::clone(&ctx.sink));
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                handler.serve(stream);
            }
            Err(e) => tracing::warn!("bookmark socket accept failed: {e}"),
        }
    }
}

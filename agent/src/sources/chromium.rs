/// Chromium and Chrome preference/bookmark watcher.
///
/// `Local State` lists the active profiles. Each profile's `Preferences`
/// file is compared against the policy map (preference path → policy name)
/// and every changed mapped preference is reported as that policy. Each
/// profile's `Bookmarks` file is diffed against its content when monitoring
/// started, and the additions of all profiles are reported together as the
/// `ManagedBookmarks` policy.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::bookmarks::{self, BookmarkRecord};
use crate::event::{ChangeEvent, ChangeSink, Namespace};
use crate::file_monitor::FileMonitor;
use crate::sources::SourceContext;
use crate::status::SourceState;

pub const LOCAL_STATE_FILE: &str = "Local State";
pub const PREFERENCES_FILE: &str = "Preferences";
pub const BOOKMARKS_FILE: &str = "Bookmarks";
pub const MANAGED_BOOKMARKS_POLICY: &str = "ManagedBookmarks";

/// Preference path (dotted) → policy name.
pub type PolicyMap = BTreeMap<String, String>;

pub fn load_policy_map(path: &Path) -> Result<PolicyMap> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy map: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse policy map: {}", path.display()))
}

/// Value at a dotted preference path, if present.
pub fn preference_value<'a>(prefs: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted.split('.').try_fold(prefs, |node, part| node.get(part))
}

fn read_json(path: &Path) -> Option<Value> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!("ignoring unparseable {}: {e}", path.display());
            None
        }
    }
}

pub struct ChromiumWatcher {
    namespace: Namespace,
    datadir: PathBuf,
    policy_map: PolicyMap,
    /// Preferences file → last seen value of each mapped preference.
    monitored_preferences: HashMap<PathBuf, HashMap<String, Value>>,
    /// Bookmarks file → flattened snapshot taken when monitoring started.
    initial_bookmarks: HashMap<PathBuf, Vec<BookmarkRecord>>,
    /// Bookmarks file → rebuilt additions, ordered by file path.
    monitored_bookmarks: BTreeMap<PathBuf, Vec<Value>>,
    sink: Arc<dyn ChangeSink>,
}

impl ChromiumWatcher {
    pub fn new(
        namespace: Namespace,
        datadir: PathBuf,
        policy_map: PolicyMap,
        sink: Arc<dyn ChangeSink>,
    ) -> Self {
        Self {
            namespace,
            datadir,
            policy_map,
            monitored_preferences: HashMap::new(),
            initial_bookmarks: HashMap::new(),
            monitored_bookmarks: BTreeMap::new(),
            sink,
        }
    }

    pub fn local_state_path(&self) -> PathBuf {
        self.datadir.join(LOCAL_STATE_FILE)
    }

    /// Dispatches a change of any watched file. Returns files that must be
    /// watched from now on.
    pub fn handle_change(&mut self, path: &Path) -> Vec<PathBuf> {
        if path == self.local_state_path() {
            return self.handle_local_state();
        }
        match path.file_name().and_then(|n| n.to_str()) {
            Some(PREFERENCES_FILE) if self.monitored_preferences.contains_key(path) => {
                self.handle_preferences(path);
            }
            Some(BOOKMARKS_FILE) if self.initial_bookmarks.contains_key(path) => {
                self.handle_bookmarks(path);
            }
            _ => {}
        }
        Vec::new()
    }

    /// Reads `Local State` and starts monitoring every active profile not
    /// monitored yet.
    pub fn handle_local_state(&mut self) -> Vec<PathBuf> {
        let path = self.local_state_path();
        let Some(state) = read_json(&path) else {
            tracing::debug!("local state {} not present (yet)", path.display());
            return Vec::new();
        };
        let sessions: Vec<String> = state
            .get("profile")
            .and_then(|p| p.get("last_active_profiles"))
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        let mut new_files = Vec::new();
        for session in sessions {
            let prefs_path = self.datadir.join(&session).join(PREFERENCES_FILE);
            if self.monitored_preferences.contains_key(&prefs_path) {
                continue;
            }
            tracing::debug!(session, "new browser session");
            let bookmarks_path = self.datadir.join(&session).join(BOOKMARKS_FILE);
            self.start_preferences(&prefs_path);
            self.start_bookmarks(&bookmarks_path);
            new_files.push(prefs_path);
            new_files.push(bookmarks_path);
        }
        new_files
    }

    fn start_preferences(&mut self, path: &Path) {
        let baseline: HashMap<String, Value> = read_json(path)
            .map(|prefs| {
                self.policy_map
                    .keys()
                    .filter_map(|pref| Some((pref.clone(), preference_value(&prefs, pref)?.clone())))
                    .collect()
            })
            .unwrap_or_default();
        self.monitored_preferences.insert(path.to_path_buf(), baseline);
    }

    fn start_bookmarks(&mut self, path: &Path) {
        let snapshot = read_json(path)
            .map(|doc| bookmarks::flatten(&doc))
            .unwrap_or_default();
        self.initial_bookmarks.insert(path.to_path_buf(), snapshot);
    }

    /// Emits one change per mapped preference whose value differs from the
    /// last one seen.
    pub fn handle_preferences(&mut self, path: &Path) {
        let Some(prefs) = read_json(path) else {
            tracing::debug!("preferences {} not present (yet)", path.display());
            return;
        };
        let Some(known) = self.monitored_preferences.get_mut(path) else {
            return;
        };
        for (pref, policy) in &self.policy_map {
            let Some(value) = preference_value(&prefs, pref) else {
                continue;
            };
            if known.get(pref) != Some(value) {
                tracing::debug!(pref, policy, "preference changed");
                let payload = json!({"key": policy, "value": value});
                self.sink
                    .submit(ChangeEvent::new(self.namespace, payload.to_string()));
            }
            known.insert(pref.clone(), value.clone());
        }
    }

    /// Emits the bookmarks added since monitoring started, across all
    /// monitored profiles.
    pub fn handle_bookmarks(&mut self, path: &Path) {
        let Some(doc) = read_json(path) else {
            tracing::debug!("bookmarks {} updated but unreadable, skipping", path.display());
            return;
        };
        let initial = self.initial_bookmarks.get(path).map(Vec::as_slice).unwrap_or_default();
        let added = bookmarks::diff(initial, &bookmarks::flatten(&doc));
        self.monitored_bookmarks
            .insert(path.to_path_buf(), bookmarks::rebuild_tree(&added));

        let all: Vec<Value> = self.monitored_bookmarks.values().flatten().cloned().collect();
        let payload = json!({"key": MANAGED_BOOKMARKS_POLICY, "value": all});
        self.sink
            .submit(ChangeEvent::new(self.namespace, payload.to_string()));
    }
}

/// Driver loop for one browser flavour.
pub fn run(
    mut ctx: SourceContext,
    namespace: Namespace,
    datadir: PathBuf,
    policy_map_path: Option<PathBuf>,
) {
    let Some(map_path) = policy_map_path else {
        tracing::error!("{namespace}: policy map not found, watcher disabled");
        ctx.reporter.set(SourceState::Degraded);
        return;
    };
    let policy_map = match load_policy_map(&map_path) {
        Ok(map) => map,
        Err(e) => {
            tracing::error!("{namespace}: {e:#}, watcher disabled");
            ctx.reporter.set(SourceState::Degraded);
            return;
        }
    };

    let mut monitor = match FileMonitor::new() {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("{e:#}");
            ctx.reporter.set(SourceState::Degraded);
            return;
        }
    };
    let mut watcher = ChromiumWatcher::new(namespace, datadir, policy_map, Arc::clone(&ctx.sink));
    let local_state = watcher.local_state_path();
    if let Err(e) = monitor.watch_file(&local_state) {
        tracing::error!("{e:#}");
        ctx.reporter.set(SourceState::Degraded);
        return;
    }

    let mut pending = watcher.handle_local_state();
    loop {
        for path in pending.drain(..) {
            if let Err(e) = monitor.watch_file(&path) {
                tracing::warn!("{e:#}");
            }
        }
        ctx.reporter.set(if local_state.is_file() {
            SourceState::Watching
        } else {
            SourceState::Degraded
        });

        let Some(changed) = monitor.wait() else {
            tracing::warn!("{namespace}: file watcher stopped");
            ctx.reporter.set(SourceState::Degraded);
            return;
        };
        for path in changed {
            pending.extend(watcher.handle_change(&path));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::testing::VecSink;

    struct Fixture {
        dir: tempfile::TempDir,
        watcher: ChromiumWatcher,
        sink: Arc<VecSink>,
    }

    fn policy_map() -> PolicyMap {
        let mut map = PolicyMap::new();
        map.insert("homepage".to_string(), "HomepageLocation".to_string());
        map.insert("browser.show_home_button".to_string(), "ShowHomeButton".to_string());
        map
    }

    fn fixture(sessions: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let state = json!({"profile": {"last_active_profiles": sessions}});
        std::fs::write(dir.path().join(LOCAL_STATE_FILE), state.to_string()).unwrap();
        for s in sessions {
            std::fs::create_dir_all(dir.path().join(s)).unwrap();
        }
        let sink = Arc::new(VecSink::default());
        let watcher = ChromiumWatcher::new(
            Namespace::ChromiumPolicies,
            dir.path().to_path_buf(),
            policy_map(),
            sink.clone(),
        );
        Fixture { dir, watcher, sink }
    }

    fn bookmarks_doc(urls: &[(&str, &str)]) -> Value {
        let children: Vec<Value> = urls
            .iter()
            .enumerate()
            .map(|(i, (name, url))| json!({"type": "url", "id": i.to_string(), "name": name, "url": url}))
            .collect();
        json!({"roots": {"bookmark_bar": {"type": "folder", "name": "Bookmarks bar", "children": children}}})
    }

    #[test]
    fn preference_value_walks_dotted_path() {
        let prefs = json!({"browser": {"show_home_button": true}});
        assert_eq!(preference_value(&prefs, "browser.show_home_button"), Some(&json!(true)));
        assert_eq!(preference_value(&prefs, "browser.missing"), None);
    }

    #[test]
    fn local_state_starts_monitoring_each_session_once() {
        let mut f = fixture(&["Default", "Profile 1"]);
        let files = f.watcher.handle_local_state();
        assert_eq!(files.len(), 4);
        assert!(files.contains(&f.dir.path().join("Default").join(PREFERENCES_FILE)));
        assert!(files.contains(&f.dir.path().join("Profile 1").join(BOOKMARKS_FILE)));
        assert!(f.watcher.handle_local_state().is_empty());
    }

    #[test]
    fn missing_local_state_watches_nothing() {
        let mut f = fixture(&[]);
        std::fs::remove_file(f.watcher.local_state_path()).unwrap();
        assert!(f.watcher.handle_local_state().is_empty());
    }

    #[test]
    fn changed_mapped_preferences_are_reported_as_policies() {
        let mut f = fixture(&["Default"]);
        let prefs = f.dir.path().join("Default").join(PREFERENCES_FILE);
        std::fs::write(&prefs, json!({"homepage": "https://a.example"}).to_string()).unwrap();
        f.watcher.handle_local_state();

        std::fs::write(
            &prefs,
            json!({
                "homepage": "https://b.example",
                "browser": {"show_home_button": true},
                "unmapped": 1
            })
            .to_string(),
        )
        .unwrap();
        f.watcher.handle_change(&prefs);

        let mut changes = f.sink.take_json(Namespace::ChromiumPolicies);
        changes.sort_by(|a, b| a["key"].as_str().cmp(&b["key"].as_str()));
        assert_eq!(
            changes,
            vec![
                json!({"key": "HomepageLocation", "value": "https://b.example"}),
                json!({"key": "ShowHomeButton", "value": true}),
            ]
        );

        // Same content again: nothing new.
        f.watcher.handle_change(&prefs);
        assert!(f.sink.take().is_empty());
    }

    #[test]
    fn bookmarks_report_additions_of_all_sessions() {
        let mut f = fixture(&["Default", "Profile 1"]);
        let b1 = f.dir.path().join("Default").join(BOOKMARKS_FILE);
        let b2 = f.dir.path().join("Profile 1").join(BOOKMARKS_FILE);
        std::fs::write(&b1, bookmarks_doc(&[("Old", "https://old.example")]).to_string()).unwrap();
        f.watcher.handle_local_state();

        std::fs::write(
            &b1,
            bookmarks_doc(&[("Old", "https://old.example"), ("New", "https://new.example")]).to_string(),
        )
        .unwrap();
        f.watcher.handle_change(&b1);
        let first = f.sink.take_json(Namespace::ChromiumPolicies);
        assert_eq!(
            first[0],
            json!({"key": "ManagedBookmarks", "value": [{"name": "New", "url": "https://new.example"}]})
        );

        std::fs::write(&b2, bookmarks_doc(&[("Two", "https://two.example")]).to_string()).unwrap();
        f.watcher.handle_change(&b2);
        let second = f.sink.take_json(Namespace::ChromiumPolicies);
        assert_eq!(
            second[0]["value"],
            json!([
                {"name": "New", "url": "https://new.example"},
                {"name": "Two", "url": "https://two.example"}
            ])
        );
    }

    #[test]
    fn unknown_files_are_ignored() {
        let mut f = fixture(&["Default"]);
        assert!(f.watcher.handle_change(&f.dir.path().join("Other").join(PREFERENCES_FILE)).is_empty());
        assert!(f.sink.take().is_empty());
    }

    #[test]
    fn policy_map_loads_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.json");
        std::fs::write(&path, r#"{"homepage": "HomepageLocation"}"#).unwrap();
        assert_eq!(load_policy_map(&path).unwrap()["homepage"], "HomepageLocation");
        assert!(load_policy_map(&dir.path().join("absent.json")).is_err());
    }
}

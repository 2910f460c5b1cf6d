/// Online accounts watcher.
///
/// `accounts.conf` is small and rarely written, so every change re-reads it
/// and reports the complete account map in one event. A missing or broken
/// file reports an empty map.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::event::{ChangeEvent, ChangeSink, Namespace};
use crate::file_monitor::FileMonitor;
use crate::keyfile::KeyFile;
use crate::sources::SourceContext;
use crate::status::SourceState;

const ACCOUNT_GROUP_PREFIX: &str = "Account ";
/// Prefix for reported account ids, keeping deployed accounts apart from the
/// ones users create on client machines.
pub const DEPLOYED_ID_PREFIX: &str = "fcmdr_";

/// Key-file boolean as GLib and configparser read it.
fn is_true(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "yes" | "on" | "1")
}

/// Deployed id → properties for every `[Account <id>]` group.
///
/// Temporary accounts (e.g. Kerberos tickets) are skipped, and the per-feature
/// `*Enabled` switches are left for the user to decide.
pub fn accounts_from_keyfile(kf: &KeyFile) -> Map<String, Value> {
    let mut accounts = Map::new();
    for group in kf.groups() {
        let Some(id) = group.strip_prefix(ACCOUNT_GROUP_PREFIX) else {
            continue;
        };
        if id.is_empty() || id.contains(' ') {
            continue;
        }
        let props: BTreeMap<String, String> = kf.entries(group);
        let temporary = props
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("IsTemporary") && is_true(v));
        if temporary {
            tracing::debug!(id, "skipping temporary account");
            continue;
        }
        let props = props
            .into_iter()
            .filter(|(k, _)| !k.to_ascii_lowercase().ends_with("enabled"))
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        accounts.insert(format!("{DEPLOYED_ID_PREFIX}{id}"), Value::Object(props));
    }
    accounts
}

/// Current account map of the file at `path`; empty when it is missing or
/// unparseable.
pub fn read_accounts(path: &Path) -> Map<String, Value> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => {
            tracing::debug!("accounts file {} not present", path.display());
            return Map::new();
        }
    };
    match KeyFile::parse(&text) {
        Ok(kf) => accounts_from_keyfile(&kf),
        Err(e) => {
            tracing::error!("could not parse accounts file {}: {e:#}", path.display());
            Map::new()
        }
    }
}

pub struct AccountsWatcher {
    path: PathBuf,
    sink: Arc<dyn ChangeSink>,
}

impl AccountsWatcher {
    pub fn new(path: PathBuf, sink: Arc<dyn ChangeSink>) -> Self {
        Self { path, sink }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Emits the full account map.
    pub fn update(&self) {
        let accounts = read_accounts(&self.path);
        tracing::debug!(accounts = accounts.len(), "online accounts updated");
        self.sink.submit(ChangeEvent::new(
            Namespace::OnlineAccounts,
            Value::Object(accounts).to_string(),
        ));
    }
}

pub fn run(mut ctx: SourceContext, path: PathBuf) {
    let watcher = AccountsWatcher::new(path, Arc::clone(&ctx.sink));
    let mut monitor = match FileMonitor::new() {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("{e:#}");
            ctx.reporter.set(SourceState::Degraded);
            return;
        }
    };
    if let Err(e) = monitor.watch_file(watcher.path()) {
        tracing::error!("{e:#}");
        ctx.reporter.set(SourceState::Degraded);
        return;
    }

    watcher.update();
    loop {
        ctx.reporter.set(if watcher.path().is_file() {
            SourceState::Watching
        } else {
            SourceState::Degraded
        });
        if monitor.wait().is_none() {
            tracing::warn!("accounts file watcher stopped");
            ctx.reporter.set(SourceState::Degraded);
            return;
        }
        watcher.update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgentEvent, SourceKind};
    use crate::sources::testing::VecSink;
    use crate::sources::StateReporter;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc::{self, error::TryRecvError};

    const ACCOUNTS: &str = "\
[Account account_1489413720_0]
Provider=google
Identity=user@gmail.com
MailEnabled=true

[Account account_1489413720_1]
Provider=owncloud
Uri=https://cloud.example

[Provider google]
Ignored=true
";

    #[test]
    fn account_groups_become_map_entries() {
        let kf = KeyFile::parse(ACCOUNTS).unwrap();
        let accounts = accounts_from_keyfile(&kf);
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts["fcmdr_account_1489413720_0"]["Identity"], "user@gmail.com");
        assert_eq!(accounts["fcmdr_account_1489413720_1"]["Uri"], "https://cloud.example");
        assert!(accounts.get("account_1489413720_0").is_none());

        // User-controlled feature switches are not collected.
        assert_eq!(
            accounts["fcmdr_account_1489413720_0"],
            json!({"Provider": "google", "Identity": "user@gmail.com"})
        );
    }

    #[test]
    fn temporary_accounts_are_skipped() {
        let kf = KeyFile::parse(
            "[Account account_1_0]\nProvider=kerberos\nIsTemporary=true\n\n\
             [Account account_1_1]\nProvider=google\nIsTemporary=false\n",
        )
        .unwrap();
        let accounts = accounts_from_keyfile(&kf);
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts["fcmdr_account_1_1"]["Provider"], "google");
    }

    #[test]
    fn update_emits_whole_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.conf");
        std::fs::write(&path, ACCOUNTS).unwrap();
        let sink = Arc::new(VecSink::default());
        let w = AccountsWatcher::new(path, sink.clone());

        w.update();
        let changes = sink.take_json(Namespace::OnlineAccounts);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["fcmdr_account_1489413720_0"]["Provider"], "google");
    }

    // ── driver ────────────────────────────────────────────────────────────────

    const WAIT: Duration = Duration::from_secs(5);

    /// Waits for `want` among the reported states, skipping others.
    fn wait_state(rx: &mut mpsc::Receiver<AgentEvent>, want: SourceState) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            match rx.try_recv() {
                Ok(AgentEvent::SourceState(_, state)) if state == want => return true,
                Ok(_) => {}
                Err(TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(20)),
                Err(TryRecvError::Disconnected) => return false,
            }
        }
        false
    }

    /// Waits for an emitted account map satisfying `pred`.
    fn wait_accounts(sink: &VecSink, pred: impl Fn(&Value) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if sink.take_json(Namespace::OnlineAccounts).iter().any(&pred) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn driver_follows_file_through_removal_and_return() {
        let dir = tempfile::tempdir().unwrap();
        let goa_dir = dir.path().join("goa-1.0");
        let path = goa_dir.join("accounts.conf");
        std::fs::create_dir(&goa_dir).unwrap();
        std::fs::write(&path, ACCOUNTS).unwrap();

        let sink = Arc::new(VecSink::default());
        let (tx, mut rx) = mpsc::channel(64);
        let ctx = SourceContext {
            sink: sink.clone(),
            reporter: StateReporter::new(SourceKind::OnlineAccounts, tx),
        };
        let driver_path = path.clone();
        // The driver runs for the life of the process.
        std::thread::spawn(move || run(ctx, driver_path));

        let has_account = |v: &Value| v.get("fcmdr_account_1489413720_0").is_some();
        assert!(wait_state(&mut rx, SourceState::Watching));
        assert!(wait_accounts(&sink, has_account));

        std::fs::remove_dir_all(&goa_dir).unwrap();
        assert!(wait_state(&mut rx, SourceState::Degraded));
        assert!(wait_accounts(&sink, |v| v == &json!({})));

        std::fs::create_dir(&goa_dir).unwrap();
        std::fs::write(&path, ACCOUNTS).unwrap();
        assert!(wait_state(&mut rx, SourceState::Watching));
        assert!(wait_accounts(&sink, has_account));

        // Still followed after coming back.
        std::fs::write(&path, "[Account account_2_0]\nProvider=imap\n").unwrap();
        assert!(wait_accounts(&sink, |v| v.get("fcmdr_account_2_0").is_some()));
    }

    #[test]
    fn missing_file_emits_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(VecSink::default());
        let w = AccountsWatcher::new(dir.path().join("accounts.conf"), sink.clone());
        w.update();
        assert_eq!(sink.take_json(Namespace::OnlineAccounts), vec![json!({})]);
    }

    #[test]
    fn unparseable_file_emits_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.conf");
        std::fs::write(&path, "this is = not [a keyfile").unwrap();
        let sink = Arc::new(VecSink::default());
        AccountsWatcher::new(path, sink.clone()).update();
        assert_eq!(sink.take_json(Namespace::OnlineAccounts), vec![json!({})]);
    }
}

/// Blocking file watcher for source driver threads.
///
/// Each watched file is observed through its parent directory rather than
/// directly, so editor-style atomic saves (write new + rename) and file
/// creation are seen too. When the parent does not exist yet, the nearest
/// existing ancestor is watched instead and the proper directory is picked up
/// as soon as it appears. A watched directory that is deleted falls back the
/// same way, so a file whose directory is removed and re-created is still
/// followed.
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

/// Quiet period after the first event before a batch is reported.
pub const DEBOUNCE: Duration = Duration::from_millis(100);
/// Longest a batch keeps collecting events before it is reported anyway.
pub const MAX_BATCH: Duration = Duration::from_secs(1);

pub struct FileMonitor {
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Event>,
    /// Watched file → directory currently watched on its behalf.
    targets: BTreeMap<PathBuf, PathBuf>,
    watched_dirs: BTreeSet<PathBuf>,
}

impl FileMonitor {
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => tracing::warn!("file watcher error: {e}"),
            },
            NotifyConfig::default(),
        )
        .context("Failed to create file watcher")?;
        Ok(Self {
            watcher,
            rx,
            targets: BTreeMap::new(),
            watched_dirs: BTreeSet::new(),
        })
    }

    /// Starts reporting changes to `path`. Watching the same file twice is a
    /// no-op.
    pub fn watch_file(&mut self, path: &Path) -> Result<()> {
        if self.targets.contains_key(path) {
            return Ok(());
        }
        let dir = nearest_existing_dir(path)
            .with_context(|| format!("No existing ancestor for {}", path.display()))?;
        self.watch_dir(&dir)?;
        self.targets.insert(path.to_path_buf(), dir);
        Ok(())
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.targets.contains_key(path)
    }

    fn watch_dir(&mut self, dir: &Path) -> Result<()> {
        if self.watched_dirs.contains(dir) {
            return Ok(());
        }
        self.watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;
        tracing::debug!("watching directory {}", dir.display());
        self.watched_dirs.insert(dir.to_path_buf());
        Ok(())
    }

    /// Forgets watched directories that were removed. The kernel drops their
    /// watches, so they have to be added again once the path exists.
    fn drop_removed_dirs(&mut self, removed: &[PathBuf]) {
        let gone: Vec<PathBuf> = self
            .watched_dirs
            .iter()
            .filter(|dir| removed.contains(*dir) || !dir.is_dir())
            .cloned()
            .collect();
        for dir in gone {
            // Fails when the watch already vanished with the directory.
            let _ = self.watcher.unwatch(&dir);
            self.watched_dirs.remove(&dir);
            tracing::debug!("watched directory {} went away", dir.display());
        }
    }

    /// Moves targets onto the closest directory that exists now: closer when
    /// a missing directory appeared, further up when theirs was removed.
    /// Returns the targets that moved, since their file may have appeared or
    /// disappeared together with the directory.
    fn rewatch(&mut self) -> Vec<PathBuf> {
        let mut moved = Vec::new();
        let pending: Vec<(PathBuf, PathBuf)> = self
            .targets
            .iter()
            .filter(|(file, dir)| {
                file.parent() != Some(dir.as_path()) || !self.watched_dirs.contains(*dir)
            })
            .map(|(f, d)| (f.clone(), d.clone()))
            .collect();
        for (file, current) in pending {
            let Some(dir) = nearest_existing_dir(&file) else {
                continue;
            };
            if dir == current && self.watched_dirs.contains(&dir) {
                continue;
            }
            match self.watch_dir(&dir) {
                Ok(()) => {
                    self.targets.insert(file.clone(), dir);
                    moved.push(file);
                }
                Err(e) => tracing::debug!("{e:#}"),
            }
        }
        moved
    }

    fn absorb(&mut self, event: notify::Event, changed: &mut BTreeSet<PathBuf>) {
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        for path in &event.paths {
            if self.targets.contains_key(path) {
                changed.insert(path.clone());
            }
        }
        let removed: &[PathBuf] = match event.kind {
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => &event.paths,
            _ => &[],
        };
        self.drop_removed_dirs(removed);
        changed.extend(self.rewatch());
    }

    /// Blocks until at least one watched file changed, then keeps collecting
    /// events until [`DEBOUNCE`] passes quietly or [`MAX_BATCH`] is reached.
    /// Returns `None` once the watcher is gone.
    pub fn wait(&mut self) -> Option<BTreeSet<PathBuf>> {
        loop {
            let event = self.rx.recv().ok()?;
            let changed = self.collect_from(event);
            if !changed.is_empty() {
                return Some(changed);
            }
        }
    }

    /// Like [`FileMonitor::wait`] but gives up after `timeout`, returning an
    /// empty set.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<BTreeSet<PathBuf>> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let event = match self.rx.recv_timeout(left) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => return Some(BTreeSet::new()),
                Err(RecvTimeoutError::Disconnected) => return None,
            };
            let changed = self.collect_from(event);
            if !changed.is_empty() {
                return Some(changed);
            }
        }
    }

    fn collect_from(&mut self, first: notify::Event) -> BTreeSet<PathBuf> {
        let mut changed = BTreeSet::new();
        let deadline = Instant::now() + MAX_BATCH;
        self.absorb(first, &mut changed);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match self.rx.recv_timeout(DEBOUNCE.min(left)) {
                Ok(event) => self.absorb(event, &mut changed),
                Err(_) => break,
            }
        }
        changed
    }
}

/// Parent of `path` if it exists, otherwise its nearest existing ancestor.
fn nearest_existing_dir(path: &Path) -> Option<PathBuf> {
    path.ancestors().skip(1).find(|p| p.is_dir()).map(Path::to_path_buf)
}

/// D-Bus signal stream read from a `gdbus monitor` subprocess.
///
/// `gdbus monitor --dest NAME` prints the owner state of `NAME` first, then
/// one line per signal or owner change. The lines are parsed into
/// [`BusLine`]s; everything else gdbus prints is ignored.
use std::io::{BufRead, BufReader, Lines};
use std::process::{Child, ChildStdout, Command, Stdio};

use anyhow::{Context, Result};

use crate::gvariant;

/// Which message bus to monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

impl BusKind {
    fn flag(self) -> &'static str {
        match self {
            BusKind::Session => "--session",
            BusKind::System => "--system",
        }
    }
}

/// One meaningful line of `gdbus monitor` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusLine {
    /// The monitored name has (or gained) an owner.
    NameOwned,
    /// The monitored name has no owner (or lost it).
    NameVanished,
    /// A signal: `member` is the fully qualified `interface.Member`, `args`
    /// the printed argument tuple.
    Signal { member: String, args: String },
}

impl BusLine {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.starts_with("The name ") {
            if line.contains("does not have an owner") {
                return Some(BusLine::NameVanished);
            }
            if line.contains("owned by") {
                return Some(BusLine::NameOwned);
            }
            return None;
        }
        // `/object/path: interface.Member (args)`
        let (_, rest) = line.split_once(": ")?;
        let (member, args) = rest.split_once(' ')?;
        if !member.contains('.') || !args.starts_with('(') {
            return None;
        }
        Some(BusLine::Signal {
            member: member.to_string(),
            args: args.to_string(),
        })
    }
}

/// A dconf `Notify(path, keys, tag)` signal with a key path split into its
/// directory and key name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    /// Directory path, always ending in `/`.
    pub path: String,
    pub keys: Vec<String>,
    pub tag: String,
}

impl Notify {
    /// Parses the argument tuple of a dconf `Notify` signal.
    pub fn from_args(args: &str) -> Option<Self> {
        let mut strings = gvariant::quoted_strings(args);
        if strings.len() < 2 {
            return None;
        }
        let tag = strings.pop()?;
        let raw_path = strings.remove(0);

        // A notification for a single key carries the full key path and an
        // empty key list.
        if raw_path.ends_with('/') {
            Some(Notify {
                path: raw_path,
                keys: strings,
                tag,
            })
        } else {
            let (dir, key) = raw_path.rsplit_once('/')?;
            Some(Notify {
                path: format!("{dir}/"),
                keys: vec![key.to_string()],
                tag,
            })
        }
    }
}

/// First object path in a signal's argument tuple, e.g. the connection in
/// `(objectpath '/org/freedesktop/NetworkManager/Settings/5',)`.
pub fn object_path_arg(args: &str) -> Option<String> {
    gvariant::quoted_strings(args)
        .into_iter()
        .find(|s| s.starts_with('/'))
}

/// Running `gdbus monitor` process. The child is killed on drop.
pub struct BusMonitor {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl BusMonitor {
    pub fn spawn(bus: BusKind, dest: &str, object_path: &str) -> Result<Self> {
        let mut child = Command::new("gdbus")
            .args(["monitor", bus.flag(), "--dest", dest, "--object-path", object_path])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to start gdbus monitor for {dest}"))?;
        let stdout = child
            .stdout
            .take()
            .context("gdbus monitor has no stdout")?;
        tracing::debug!(dest, object_path, "bus monitor started");
        Ok(Self {
            child,
            lines: BufReader::new(stdout).lines(),
        })
    }
}

impl Iterator for BusMonitor {
    type Item = BusLine;

    /// Next parsed line; `None` once the subprocess exits.
    fn next(&mut self) -> Option<BusLine> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("reading bus monitor output failed: {e}");
                    return None;
                }
            };
            if let Some(parsed) = BusLine::parse(&line) {
                return Some(parsed);
            }
        }
    }
}

impl Drop for BusMonitor {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

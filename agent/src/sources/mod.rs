/// Source watchers: one driver thread per configuration store.
///
/// Each driver owns its watcher state and handles one notification to
/// completion before reading the next. Drivers never exit on their own; when
/// the backing bus name or file is missing they report `degraded` and keep
/// waiting for it to appear.
pub mod chromium;
pub mod firefox;
pub mod goa;
pub mod network;
pub mod settings;

use std::process::Command;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;

use crate::event::{AgentEvent, ChangeSink, SourceKind};
use crate::status::SourceState;

/// Wait before restarting a bus monitor that exited or failed to start.
pub const RESPAWN_DELAY: Duration = Duration::from_secs(5);

/// Forwards a driver's lifecycle changes to the agent's event loop.
pub struct StateReporter {
    kind: SourceKind,
    tx: mpsc::Sender<AgentEvent>,
    last: Option<SourceState>,
}

impl StateReporter {
    pub fn new(kind: SourceKind, tx: mpsc::Sender<AgentEvent>) -> Self {
        Self {
            kind,
            tx,
            last: None,
        }
    }

    /// Reports `state` if it differs from the last delivered one. An update
    /// the event loop could not take is sent again on the next call.
    pub fn set(&mut self, state: SourceState) {
        if self.last == Some(state) {
            return;
        }
        // The event loop only uses this for status; never block a driver on it.
        if let Err(e) = self.tx.try_send(AgentEvent::SourceState(self.kind, state)) {
            tracing::debug!(source = %self.kind, "state update not delivered: {e}");
            return;
        }
        self.last = Some(state);
        match state {
            SourceState::Degraded => tracing::warn!(source = %self.kind, "source degraded"),
            _ => tracing::info!(source = %self.kind, ?state, "source state changed"),
        }
    }

    /// Last state the event loop received.
    pub fn state(&self) -> Option<SourceState> {
        self.last
    }
}

/// Everything a driver needs from the agent.
pub struct SourceContext {
    pub sink: Arc<dyn ChangeSink>,
    pub reporter: StateReporter,
}

/// Starts `driver` on a named thread.
pub fn spawn<F>(kind: SourceKind, context: SourceContext, driver: F) -> Result<JoinHandle<()>>
where
    F: FnOnce(SourceContext) + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("source-{kind}"))
        .spawn(move || driver(context))
        .with_context(|| format!("Failed to start {kind} source thread"))
}

/// Runs `program` and returns its stdout. A non-zero exit is an error.
pub(crate) fn command_output(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {program}"))?;
    if !output.status.success() {
        bail!(
            "{program} {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

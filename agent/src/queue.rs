/// In-memory FIFO of pending changes with periodic batch delivery.
///
/// Watchers call [`DeliveryQueue::submit`] from their own threads. The first
/// submission into an idle queue starts a flush cycle on the tokio runtime:
/// every interval the whole queue is sent in order. A batch is removed only
/// when every item in it was accepted; on the first failure the batch stays
/// queued and is retried on the next tick. The cycle ends once the queue is
/// drained and restarts on the next submission.
///
/// [`DeliveryQueue::give_up`] clears the queue and cancels the cycle. Each
/// give-up bumps a generation counter, so a flush that was already in flight
/// discards its results instead of touching the cleared queue.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::event::{ChangeEvent, ChangeSink};
use crate::transport::Transport;

/// One pending change with the moment it was accepted.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub event: ChangeEvent,
    pub enqueued_at: DateTime<Local>,
}

/// Result of a single flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The batch was delivered and nothing else is waiting.
    Drained,
    /// The batch was delivered but more items arrived meanwhile.
    Pending,
    /// A send failed; the batch stays queued.
    Failed,
    /// The queue was given up while this flush was in flight.
    Abandoned,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueuedItem>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    last_delivery: Option<DateTime<Local>>,
}

#[derive(Clone)]
pub struct DeliveryQueue {
    state: Arc<Mutex<QueueState>>,
    transport: Arc<dyn Transport>,
    interval: Duration,
    runtime: Handle,
}

impl DeliveryQueue {
    pub fn new(transport: Arc<dyn Transport>, interval: Duration, runtime: Handle) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            transport,
            interval,
            runtime,
        }
    }

    // A poisoned lock only means a holder panicked between two plain field
    // updates; the state itself is still usable.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends `event` and starts the flush cycle if none is running.
    pub fn push(&self, event: ChangeEvent) {
        let mut state = self.lock();
        tracing::debug!(
            namespace = %event.namespace(),
            queued = state.items.len() + 1,
            "change queued"
        );
        state.items.push_back(QueuedItem {
            event,
            enqueued_at: Local::now(),
        });
        if state.timer.is_none() {
            let queue = self.clone();
            state.timer = Some(self.runtime.spawn(async move { queue.run_cycle().await }));
        }
    }

    async fn run_cycle(self) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.flush_once().await != FlushOutcome::Drained {
                continue;
            }
            let mut state = self.lock();
            if state.items.is_empty() {
                state.timer = None;
                tracing::debug!("delivery queue drained");
                return;
            }
        }
    }

    /// Sends the current queue contents once. Items are removed only if the
    /// whole batch was accepted and the queue was not given up meanwhile.
    pub async fn flush_once(&self) -> FlushOutcome {
        let (generation, batch) = {
            let state = self.lock();
            let batch: Vec<ChangeEvent> = state.items.iter().map(|i| i.event.clone()).collect();
            (state.generation, batch)
        };
        if batch.is_empty() {
            return FlushOutcome::Drained;
        }

        let mut failed = false;
        for event in &batch {
            if let Err(e) = self.transport.send(event).await {
                tracing::warn!(
                    namespace = %event.namespace(),
                    "delivery failed, retrying {} queued changes later: {e}",
                    batch.len()
                );
                failed = true;
                break;
            }
        }

        let mut state = self.lock();
        if state.generation != generation {
            tracing::debug!("queue given up during flush, discarding results");
            return FlushOutcome::Abandoned;
        }
        if failed {
            return FlushOutcome::Failed;
        }
        state.items.drain(..batch.len());
        state.last_delivery = Some(Local::now());
        tracing::debug!(delivered = batch.len(), "changes delivered");
        if state.items.is_empty() {
            FlushOutcome::Drained
        } else {
            FlushOutcome::Pending
        }
    }

    /// Discards every queued change and cancels the flush cycle.
    pub fn give_up(&self) {
        let mut state = self.lock();
        state.generation += 1;
        let dropped = state.items.len();
        state.items.clear();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if dropped > 0 {
            tracing::info!("gave up delivering {dropped} queued changes");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// True while a flush cycle is scheduled.
    pub fn is_flushing(&self) -> bool {
        self.lock().timer.is_some()
    }

    /// Time of the last fully delivered batch, RFC 3339.
    pub fn last_delivery(&self) -> Option<String> {
        self.lock().last_delivery.map(|t| t.to_rfc3339())
    }

    /// Snapshot of the pending items, oldest first.
    pub fn snapshot(&self) -> Vec<QueuedItem> {
        self.lock().items.iter().cloned().collect()
    }
}

impl ChangeSink for DeliveryQueue {
    fn submit(&self, event: ChangeEvent) {
        self.push(event);
    }
}

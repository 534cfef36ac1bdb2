//! Bounded parallel executor for per-server tasks, plus the mailbox the
//! loops use for cross-loop hints. Work items are pure functions of captured
//! state; they never share mutable memory with each other.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Cross-loop notification. Consumers tolerate duplicate and stale events:
/// the cloud and CI snapshots remain the source of truth.
#[derive(Clone, Debug)]
pub enum Event {
    ServerReady { server: String },
    ServerFailed { server: String, reason: String },
    ServerDeleted { server: String },
}

/// Multi-producer handle onto the shared event queue.
#[derive(Clone, Debug)]
pub struct Mailbox {
    tx: mpsc::UnboundedSender<Event>,
}

impl Mailbox {
    pub fn send(&self, event: Event) {
        // The receiver only disappears during shutdown; events are hints, so
        // losing them then is fine.
        let _ = self.tx.send(event);
    }
}

pub struct MailboxReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl MailboxReceiver {
    /// Takes every event currently queued, in FIFO order, without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn mailbox() -> (Mailbox, MailboxReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Mailbox { tx }, MailboxReceiver { rx })
}

/// Fixed-size pool: at most `workers` per-server tasks run at once, across
/// all loops. Excess submissions queue on the semaphore.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    /// Submits a per-server task with an overall deadline. Failures and
    /// timeouts are reported to the mailbox under the server's name; the
    /// scale-down loop reaps whatever a timed-out task left behind.
    pub fn submit<F>(
        &self,
        server: String,
        deadline: Duration,
        mailbox: Mailbox,
        task: F,
    ) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            match tokio::time::timeout(deadline, task).await {
                Ok(Ok(())) => debug!(server = %server, "task finished"),
                Ok(Err(e)) => {
                    error!(server = %server, error = %e, "task failed");
                    mailbox.send(Event::ServerFailed {
                        server,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    error!(server = %server, timeout = ?deadline, "task deadline exceeded");
                    mailbox.send(Event::ServerFailed {
                        server,
                        reason: format!("deadline of {deadline:?} exceeded"),
                    });
                }
            }
        })
    }

    /// Waits until every submitted task has finished.
    pub async fn drain(&self) {
        if let Ok(permit) = self.permits.acquire_many(self.workers as u32).await {
            drop(permit);
        }
    }
}

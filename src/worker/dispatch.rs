//! Work item dispatch to per-updater workers.
//!
//! Every updater id gets its own worker task, created when the first item
//! for it arrives. Items for one updater run strictly one after another;
//! different updaters run concurrently. Backflow calculations are not tied
//! to an updater and share one dedicated worker.
//!
//! ```text
//!                                 ┌──────────────────────┐
//!                            ┌──► │ updater A channel    │ ──► worker A
//! ┌──────────────┐   ┌────────┐   └──────────────────────┘
//! │ trigger /    │──►│dispatch│   ┌──────────────────────┐
//! │ reminders    │   │ by key │─► │ updater B channel    │ ──► worker B
//! └──────────────┘   └────────┘   └──────────────────────┘
//!                            │    ┌──────────────────────┐
//!                            └──► │ backflow channel     │ ──► backflow worker
//!                                 └──────────────────────┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::remote::RetryConfig;
use crate::types::UpdaterId;

use super::item::WorkItem;
use super::processor::WorkItemProcessor;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to send work item to worker: channel closed")]
    ChannelClosed,

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Somewhere work items can be sent.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, item: WorkItem) -> Result<()>;
}

/// Channel buffer size for worker messages.
const WORKER_CHANNEL_BUFFER: usize = 100;

/// Which worker an item belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkerKey {
    Updater(UpdaterId),
    Backflow,
}

impl WorkerKey {
    pub fn for_item(item: &WorkItem) -> Self {
        match item.updater_id() {
            Some(id) => WorkerKey::Updater(id.clone()),
            None => WorkerKey::Backflow,
        }
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKey::Updater(id) => write!(f, "{id}"),
            WorkerKey::Backflow => write!(f, "backflow"),
        }
    }
}

#[derive(Debug)]
enum WorkerMessage {
    Item(WorkItem),
    Shutdown,
}

struct WorkerHandle {
    tx: mpsc::Sender<WorkerMessage>,
    #[allow(dead_code)]
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct Dispatcher {
    processor: Arc<WorkItemProcessor>,
    /// Retries of a work item that failed transiently.
    retry: RetryConfig,
    workers: RwLock<HashMap<WorkerKey, WorkerHandle>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(processor: Arc<WorkItemProcessor>, retry: RetryConfig, shutdown: CancellationToken) -> Self {
        info!(max_retries = retry.max_retries, "Creating dispatcher");
        Dispatcher {
            processor,
            retry,
            workers: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Sends `item` to its worker, spawning the worker if needed.
    #[instrument(skip(self, item), fields(kind = item.kind()))]
    pub async fn dispatch(&self, item: WorkItem) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }
        let key = WorkerKey::for_item(&item);
        let tx = self.get_or_spawn_worker(&key).await;
        tx.send(WorkerMessage::Item(item))
            .await
            .map_err(|_| DispatchError::ChannelClosed)
    }

    async fn get_or_spawn_worker(&self, key: &WorkerKey) -> mpsc::Sender<WorkerMessage> {
        {
            let workers = self.workers.read().await;
            if let Some(handle) = workers.get(key) {
                return handle.tx.clone();
            }
        }

        let mut workers = self.workers.write().await;
        if let Some(handle) = workers.get(key) {
            return handle.tx.clone();
        }

        debug!(worker = %key, "Spawning worker task");
        let (tx, rx) = mpsc::channel(WORKER_CHANNEL_BUFFER);
        // The handle and the task share one token so remove_worker cancels
        // the right task.
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(run_worker(
            key.clone(),
            Arc::clone(&self.processor),
            self.retry,
            rx,
            cancel.clone(),
        ));
        workers.insert(
            key.clone(),
            WorkerHandle {
                tx: tx.clone(),
                task,
                cancel,
            },
        );
        tx
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn has_worker(&self, key: &WorkerKey) -> bool {
        self.workers.read().await.contains_key(key)
    }

    /// Stops and forgets the worker for `key`.
    pub async fn remove_worker(&self, key: &WorkerKey) -> bool {
        let mut workers = self.workers.write().await;
        match workers.remove(key) {
            Some(handle) => {
                handle.cancel.cancel();
                let _ = handle.tx.send(WorkerMessage::Shutdown).await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown_all(&self) {
        info!("Shutting down all workers");
        self.shutdown.cancel();
        let workers = self.workers.read().await;
        for (key, handle) in workers.iter() {
            trace!(worker = %key, "Sending shutdown to worker");
            let _ = handle.tx.send(WorkerMessage::Shutdown).await;
        }
    }
}

#[async_trait]
impl WorkQueue for Dispatcher {
    async fn enqueue(&self, item: WorkItem) -> Result<()> {
        self.dispatch(item).await
    }
}

async fn run_worker(
    key: WorkerKey,
    processor: Arc<WorkItemProcessor>,
    retry: RetryConfig,
    mut rx: mpsc::Receiver<WorkerMessage>,
    cancel: CancellationToken,
) {
    debug!(worker = %key, "Worker started");
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => message,
        };
        match message {
            Some(WorkerMessage::Item(item)) => run_item(&key, &processor, retry, &item, &cancel).await,
            Some(WorkerMessage::Shutdown) | None => break,
        }
    }
    debug!(worker = %key, "Worker stopped");
}

/// Runs one item, retrying transient failures with backoff.
async fn run_item(
    key: &WorkerKey,
    processor: &WorkItemProcessor,
    retry: RetryConfig,
    item: &WorkItem,
    cancel: &CancellationToken,
) {
    let mut attempt = 0;
    loop {
        match processor.process(item, cancel).await {
            Ok(_) => return,
            Err(e) if e.is_transient() && attempt < retry.max_retries => {
                let delay = retry.delay_for_attempt(attempt);
                attempt += 1;
                warn!(worker = %key, kind = item.kind(), attempt, ?delay, error = %e, "Transient failure; retrying work item");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                error!(worker = %key, kind = item.kind(), error = %e, "Work item failed");
                return;
            }
        }
    }
}

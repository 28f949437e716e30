//! Task admission and dispatch
//!
//! The [`TaskSupervisor`] admits at most one live task per identity, queues
//! admitted tasks FIFO and runs them on a fixed pool of workers. Status
//! queries read the live snapshot first and fall back to the persisted
//! record.

use crate::config::AppConfig;
use crate::executor::{TaskExecutor, TaskJob};
use crate::pipeline::PipelineRegistry;
use crate::progress::{ProgressSnapshot, ProgressStore, ProgressView};
use crate::repository::{InMemoryTaskStore, TaskInputLoader, TaskRecordStore};
use crate::task::{TaskIdentity, TaskRecord};
use crate::{OrchestratorError, Result};
use futures::FutureExt;
use parking_lot::Mutex;
use recruit_llm::{LlmClient, LlmStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type ActiveSet = Mutex<HashSet<TaskIdentity>>;

/// Exclusive claim on a task identity.
///
/// Held from admission until the terminal record is stored. Dropping the
/// lease releases the identity.
#[derive(Debug)]
pub struct TaskLease {
    slot: Option<(Arc<ActiveSet>, TaskIdentity)>,
}

impl TaskLease {
    fn acquire(active: &Arc<ActiveSet>, identity: &TaskIdentity) -> Option<Self> {
        if active.lock().insert(identity.clone()) {
            Some(Self {
                slot: Some((active.clone(), identity.clone())),
            })
        } else {
            None
        }
    }

    /// A lease that guards nothing
    pub(crate) fn detached() -> Self {
        Self { slot: None }
    }

    pub fn identity(&self) -> Option<&TaskIdentity> {
        self.slot.as_ref().map(|(_, identity)| identity)
    }

    /// Release the identity; later calls are no-ops
    pub fn release(&mut self) {
        if let Some((active, identity)) = self.slot.take() {
            active.lock().remove(&identity);
        }
    }
}

impl Drop for TaskLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Removes a queued snapshot unless its job reached the queue.
///
/// Covers a `submit` future dropped mid-await, e.g. on client disconnect.
struct QueuedSnapshot<'a> {
    progress: &'a ProgressStore,
    identity: &'a TaskIdentity,
    task_id: Uuid,
    armed: bool,
}

impl<'a> QueuedSnapshot<'a> {
    fn put(progress: &'a ProgressStore, identity: &'a TaskIdentity, record: &TaskRecord) -> Self {
        progress.put(ProgressSnapshot::queued(
            identity.clone(),
            record.id,
            record.total_steps,
        ));
        Self {
            progress,
            identity,
            task_id: record.id,
            armed: true,
        }
    }

    /// The job owns the snapshot from here on
    fn handed_off(mut self) {
        self.armed = false;
    }
}

impl Drop for QueuedSnapshot<'_> {
    fn drop(&mut self) {
        if self.armed && self.progress.remove_if_task(self.identity, self.task_id) {
            debug!(identity = %self.identity, task_id = %self.task_id, "Queued snapshot withdrawn");
        }
    }
}

/// Returned by a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: Uuid,
    pub identity: TaskIdentity,
    pub total_steps: usize,
}

struct QueuedTask {
    job: TaskJob,
    lease: TaskLease,
}

/// Configures and starts a [`TaskSupervisor`].
pub struct SupervisorBuilder {
    llm: LlmClient,
    loader: Arc<dyn TaskInputLoader>,
    records: Arc<dyn TaskRecordStore>,
    registry: PipelineRegistry,
    workers: usize,
    task_timeout: Option<Duration>,
    persist_policy: Option<(u32, Duration)>,
}

impl SupervisorBuilder {
    /// Worker pool size; at least one
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn registry(mut self, registry: PipelineRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn persist_policy(mut self, attempts: u32, backoff: Duration) -> Self {
        self.persist_policy = Some((attempts, backoff));
        self
    }

    /// Spawn the worker pool. Must run inside a tokio runtime.
    pub fn start(self) -> TaskSupervisor {
        let progress = Arc::new(ProgressStore::new());

        let mut executor =
            TaskExecutor::new(self.llm, progress.clone(), self.records.clone())
                .with_task_timeout(self.task_timeout);
        if let Some((attempts, backoff)) = self.persist_policy {
            executor = executor.with_persist_policy(attempts, backoff);
        }
        let executor = Arc::new(executor);

        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Arc::new(tokio::sync::Mutex::new(receiver));
        let workers = (0..self.workers)
            .map(|worker| tokio::spawn(worker_loop(worker, queue.clone(), executor.clone())))
            .collect();

        info!(
            workers = self.workers,
            task_timeout = ?self.task_timeout,
            "Task supervisor started"
        );

        TaskSupervisor {
            registry: self.registry,
            executor,
            progress,
            loader: self.loader,
            records: self.records,
            active: Arc::new(Mutex::new(HashSet::new())),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            worker_count: self.workers,
        }
    }
}

/// Admits, queues and runs tasks.
pub struct TaskSupervisor {
    registry: PipelineRegistry,
    executor: Arc<TaskExecutor>,
    progress: Arc<ProgressStore>,
    loader: Arc<dyn TaskInputLoader>,
    records: Arc<dyn TaskRecordStore>,
    active: Arc<ActiveSet>,
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl std::fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("workers", &self.worker_count)
            .field("active", &self.active.lock().len())
            .finish()
    }
}

impl TaskSupervisor {
    pub fn builder(
        llm: LlmClient,
        loader: Arc<dyn TaskInputLoader>,
        records: Arc<dyn TaskRecordStore>,
    ) -> SupervisorBuilder {
        SupervisorBuilder {
            llm,
            loader,
            records,
            registry: PipelineRegistry::standard(),
            workers: 1,
            task_timeout: None,
            persist_policy: None,
        }
    }

    /// Supervisor over the standard pipelines and an in-memory store
    pub fn from_config(config: &AppConfig, store: Arc<InMemoryTaskStore>) -> Result<Self> {
        let llm = LlmClient::from_config(config.llm.clone())
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;

        Ok(Self::builder(llm, store.clone(), store)
            .workers(config.workers)
            .task_timeout(config.task_timeout())
            .start())
    }

    /// Admit a task and queue it for execution.
    ///
    /// Fails with `AlreadyRunning` while a non-terminal task exists for the
    /// identity and with `NotFound` when the entity has no input.
    pub async fn submit(&self, identity: TaskIdentity, parameters: Value) -> Result<TaskHandle> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(OrchestratorError::ShuttingDown)?;

        let pipeline = self
            .registry
            .get(identity.kind)
            .ok_or_else(|| OrchestratorError::NotFound(format!("pipeline {}", identity.kind)))?;

        let lease = TaskLease::acquire(&self.active, &identity).ok_or_else(|| {
            debug!(identity = %identity, "Submission rejected, task already running");
            OrchestratorError::AlreadyRunning(identity.clone())
        })?;

        let mut input = match self.loader.load_input(&identity).await {
            Ok(input) => input,
            Err(err) if err.is_not_found() => {
                return Err(OrchestratorError::NotFound(err.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        input.merge_parameters(&parameters);

        let record = TaskRecord::new(identity.clone(), pipeline.total_steps(), parameters);
        let handle = TaskHandle {
            task_id: record.id,
            identity: identity.clone(),
            total_steps: record.total_steps,
        };

        let snapshot = QueuedSnapshot::put(&self.progress, &identity, &record);
        if let Err(err) = self.records.persist_record(&record).await {
            warn!(identity = %identity, error = %err, "Pending task record could not be stored");
            return Err(err.into());
        }

        let task_id = record.id;
        sender
            .send(QueuedTask {
                job: TaskJob::new(record, input, pipeline),
                lease,
            })
            .map_err(|_| OrchestratorError::ShuttingDown)?;
        snapshot.handed_off();

        info!(identity = %identity, task_id = %task_id, "Task queued");
        Ok(handle)
    }

    /// Current view of a task: live snapshot, else persisted record
    pub async fn status(&self, identity: &TaskIdentity) -> Result<ProgressView> {
        if let Some(snapshot) = self.progress.get(identity) {
            return Ok(ProgressView::from_snapshot(&snapshot));
        }

        match self.records.read_record(identity).await {
            Ok(record) => Ok(ProgressView::from_record(&record)),
            Err(err) if err.is_not_found() => {
                Err(OrchestratorError::NotFound(format!("task {}", identity)))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Whether a non-terminal task holds the identity
    pub fn is_active(&self, identity: &TaskIdentity) -> bool {
        self.active.lock().contains(identity)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn progress(&self) -> &Arc<ProgressStore> {
        &self.progress
    }

    pub fn llm_status(&self) -> LlmStatus {
        self.executor.llm().status()
    }

    /// Stop accepting submissions, let the queue drain and join the workers
    pub async fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        info!("Task supervisor shutting down");

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                error!(error = %err, "Worker ended abnormally");
            }
        }
        info!("Task supervisor stopped");
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedTask>>>,
    executor: Arc<TaskExecutor>,
) {
    debug!(worker, "Worker started");
    loop {
        let next = queue.lock().await.recv().await;
        let Some(QueuedTask { job, mut lease }) = next else {
            break;
        };

        let pending = job.record.clone();
        let outcome = AssertUnwindSafe(executor.execute(job, &mut lease))
            .catch_unwind()
            .await;

        match outcome {
            Ok(record) => {
                debug!(worker, task_id = %record.id, status = %record.status, "Worker finished task");
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(worker, task_id = %pending.id, message = %message, "Task panicked");
                executor
                    .abort(pending, format!("step panicked: {}", message), &mut lease)
                    .await;
            }
        }
    }
    debug!(worker, "Worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

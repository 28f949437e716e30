//! Task execution state machine
//!
//! Drives one task lifecycle: `Pending -> Running -> {Succeeded, Failed}`.
//! Steps run strictly in order; the first failure aborts the rest. The
//! terminal record is persisted before the progress snapshot is dropped, so
//! a poller never sees a task vanish without an explanation.

use crate::input::PipelineInput;
use crate::pipeline::{Pipeline, StepContext, StepOutputs};
use crate::progress::{ProgressStore, FINALIZING_LABEL};
use crate::repository::{RepositoryError, TaskRecordStore};
use crate::supervisor::TaskLease;
use crate::task::{FailureKind, TaskFailure, TaskRecord, TaskStatus};
use recruit_llm::{backoff_delay, deadline_after, LlmClient};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Step name recorded when the terminal record cannot be stored
pub const PERSIST_STEP: &str = "PersistRecord";

const DEFAULT_PERSIST_ATTEMPTS: u32 = 3;
const DEFAULT_PERSIST_BACKOFF: Duration = Duration::from_millis(200);

/// One queued task: its pending record, loaded input and pipeline.
#[derive(Debug)]
pub struct TaskJob {
    pub record: TaskRecord,
    pub input: PipelineInput,
    pub pipeline: Arc<Pipeline>,
}

impl TaskJob {
    pub fn new(record: TaskRecord, input: PipelineInput, pipeline: Arc<Pipeline>) -> Self {
        Self {
            record,
            input,
            pipeline,
        }
    }
}

/// Runs pipelines against the shared LLM client and stores their outcome.
pub struct TaskExecutor {
    llm: LlmClient,
    progress: Arc<ProgressStore>,
    records: Arc<dyn TaskRecordStore>,
    task_timeout: Option<Duration>,
    persist_attempts: u32,
    persist_backoff: Duration,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("task_timeout", &self.task_timeout)
            .field("persist_attempts", &self.persist_attempts)
            .finish()
    }
}

impl TaskExecutor {
    pub fn new(
        llm: LlmClient,
        progress: Arc<ProgressStore>,
        records: Arc<dyn TaskRecordStore>,
    ) -> Self {
        Self {
            llm,
            progress,
            records,
            task_timeout: None,
            persist_attempts: DEFAULT_PERSIST_ATTEMPTS,
            persist_backoff: DEFAULT_PERSIST_BACKOFF,
        }
    }

    /// Wall-clock budget for a whole task; `None` disables it
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// How often, and how patiently, the terminal record store is retried
    pub fn with_persist_policy(mut self, attempts: u32, backoff: Duration) -> Self {
        self.persist_attempts = attempts.max(1);
        self.persist_backoff = backoff;
        self
    }

    pub fn llm(&self) -> &LlmClient {
        &self.llm
    }

    /// Run a job that holds no identity lease
    pub async fn run(&self, job: TaskJob) -> TaskRecord {
        let mut lease = TaskLease::detached();
        self.execute(job, &mut lease).await
    }

    /// Run a job to its terminal state and return the terminal record.
    ///
    /// `lease` is released once the terminal record is stored (or could not
    /// be), before the snapshot is removed.
    pub async fn execute(&self, job: TaskJob, lease: &mut TaskLease) -> TaskRecord {
        let TaskJob {
            mut record,
            input,
            pipeline,
        } = job;
        let identity = record.identity.clone();
        let task_id = record.id;

        if let Err(err) = record.transition(TaskStatus::Running) {
            error!(identity = %identity, task_id = %task_id, error = %err, "Task cannot start");
            lease.release();
            return record;
        }

        let first_label = pipeline
            .steps()
            .first()
            .map(|step| step.label())
            .unwrap_or(FINALIZING_LABEL);
        self.progress.update(&identity, |snapshot| {
            if snapshot.task_id == task_id {
                snapshot.advance(TaskStatus::Running, 0, first_label);
            }
        });

        info!(
            identity = %identity,
            task_id = %task_id,
            steps = pipeline.total_steps(),
            "Task started"
        );

        let started = Instant::now();
        let deadline = self
            .task_timeout
            .map(|timeout| deadline_after(started, timeout));
        let transition = match self.run_steps(&record, &input, &pipeline, deadline).await {
            Ok(outputs) => record.succeed(pipeline.assemble(&outputs)),
            Err(failure) => {
                warn!(
                    identity = %identity,
                    task_id = %task_id,
                    step = %failure.step,
                    kind = %failure.kind,
                    message = %failure.message,
                    "Task failed"
                );
                record.fail(failure)
            }
        };
        if let Err(err) = transition {
            error!(identity = %identity, task_id = %task_id, error = %err, "Task cannot finish");
        }

        self.finalize(record, lease).await
    }

    async fn run_steps(
        &self,
        record: &TaskRecord,
        input: &PipelineInput,
        pipeline: &Pipeline,
        deadline: Option<Instant>,
    ) -> Result<StepOutputs, TaskFailure> {
        let steps = pipeline.steps();
        let mut outputs = StepOutputs::new();

        for (index, step) in steps.iter().enumerate() {
            let ctx = StepContext {
                input,
                outputs: &outputs,
                llm: &self.llm,
            };
            debug!(task_id = %record.id, step = step.name(), index = index + 1, "Step started");

            let executed = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, step.execute(ctx))
                    .await
                    .ok(),
                None => Some(step.execute(ctx).await),
            };
            let Some(result) = executed else {
                return Err(TaskFailure {
                    step: step.name().to_string(),
                    step_index: index + 1,
                    kind: FailureKind::TaskTimeout,
                    message: "task exceeded its time budget".to_string(),
                    partial: Value::Object(outputs),
                });
            };

            match result {
                Ok(value) => {
                    outputs.insert(step.name().to_string(), value);
                    let next_label = steps
                        .get(index + 1)
                        .map(|next| next.label())
                        .unwrap_or(FINALIZING_LABEL);
                    self.progress.update(&record.identity, |snapshot| {
                        if snapshot.task_id == record.id {
                            snapshot.advance(TaskStatus::Running, index + 1, next_label);
                        }
                    });
                    debug!(task_id = %record.id, step = step.name(), "Step completed");
                }
                Err(err) => {
                    return Err(TaskFailure {
                        step: step.name().to_string(),
                        step_index: index + 1,
                        kind: err.kind(),
                        message: err.to_string(),
                        partial: Value::Object(outputs),
                    })
                }
            }
        }

        Ok(outputs)
    }

    /// Fail a task whose execution died unexpectedly (a panicking step)
    pub(crate) async fn abort(
        &self,
        mut record: TaskRecord,
        message: String,
        lease: &mut TaskLease,
    ) -> TaskRecord {
        let (step, step_index) = self
            .progress
            .get(&record.identity)
            .filter(|snapshot| snapshot.task_id == record.id)
            .map(|snapshot| (snapshot.step_label, snapshot.current_step + 1))
            .unwrap_or_else(|| (FINALIZING_LABEL.to_string(), 0));

        let failure = TaskFailure {
            step,
            step_index,
            kind: FailureKind::Internal,
            message,
            partial: Value::Null,
        };
        if let Err(err) = record.fail(failure) {
            error!(task_id = %record.id, error = %err, "Aborted task cannot be marked failed");
        }

        self.finalize(record, lease).await
    }

    async fn finalize(&self, record: TaskRecord, lease: &mut TaskLease) -> TaskRecord {
        match self.persist_terminal(&record).await {
            Ok(()) => {
                lease.release();
                self.progress.remove_if_task(&record.identity, record.id);
                info!(
                    identity = %record.identity,
                    task_id = %record.id,
                    status = %record.status,
                    "Task finished"
                );
            }
            Err(err) => {
                error!(
                    identity = %record.identity,
                    task_id = %record.id,
                    error = %err,
                    "Terminal task record could not be stored"
                );

                let failure = persist_failure(&record, &err);
                let updated = self.progress.update(&record.identity, |snapshot| {
                    if snapshot.task_id == record.id {
                        let completed = snapshot.current_step;
                        snapshot.advance(TaskStatus::Failed, completed, "Failed: result not stored");
                        snapshot.error = Some(failure);
                    }
                });
                if !updated {
                    warn!(task_id = %record.id, "No snapshot left to report the persist failure");
                }
                lease.release();
            }
        }

        record
    }

    async fn persist_terminal(&self, record: &TaskRecord) -> Result<(), RepositoryError> {
        let mut attempt = 0;
        loop {
            match self.records.persist_record(record).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt + 1 < self.persist_attempts => {
                    let delay = backoff_delay(
                        attempt,
                        self.persist_backoff,
                        self.persist_backoff * 8,
                        2.0,
                        0.0,
                    );
                    warn!(
                        task_id = %record.id,
                        attempt = attempt + 1,
                        error = %err,
                        "Persisting task record failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn persist_failure(record: &TaskRecord, err: &RepositoryError) -> TaskFailure {
    let message = match &record.error {
        Some(original) => format!(
            "{} (task had already failed at {}: {})",
            err, original.step, original.message
        ),
        None => err.to_string(),
    };
    let partial = match (&record.result, &record.error) {
        (Some(result), _) => result.clone(),
        (None, Some(original)) => json!({ "error": original }),
        (None, None) => Value::Null,
    };

    TaskFailure {
        step: PERSIST_STEP.to_string(),
        step_index: 0,
        kind: FailureKind::PersistError,
        message,
        partial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{client, ScriptedLlm};
    use crate::pipeline::{PipelineStep, StepError};
    use crate::progress::ProgressSnapshot;
    use crate::repository::{InMemoryTaskStore, RepositoryResult};
    use crate::task::{PipelineKind, TaskIdentity};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use recruit_llm::LlmError;

    struct Echo(&'static str);

    #[async_trait]
    impl PipelineStep for Echo {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
            Ok(json!({ "seen": ctx.outputs.len() }))
        }
    }

    struct AskModel;

    #[async_trait]
    impl PipelineStep for AskModel {
        fn name(&self) -> &'static str {
            "AskModel"
        }

        async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
            let answer = ctx.llm.complete("system", "user").await?;
            Ok(json!({ "answer": answer }))
        }
    }

    struct Sleep(Duration);

    #[async_trait]
    impl PipelineStep for Sleep {
        fn name(&self) -> &'static str {
            "Sleep"
        }

        async fn execute(&self, _ctx: StepContext<'_>) -> Result<Value, StepError> {
            tokio::time::sleep(self.0).await;
            Ok(Value::Null)
        }
    }

    /// Store that fails the first `failures` persists.
    struct FlakyStore {
        failures: Mutex<u32>,
        calls: Mutex<u32>,
        inner: InMemoryTaskStore,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures),
                calls: Mutex::new(0),
                inner: InMemoryTaskStore::new(),
            })
        }
    }

    #[async_trait]
    impl TaskRecordStore for FlakyStore {
        async fn persist_record(&self, record: &TaskRecord) -> RepositoryResult<()> {
            *self.calls.lock() += 1;
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(RepositoryError::Storage("connection reset".into()));
                }
            }
            self.inner.persist_record(record).await
        }

        async fn read_record(&self, identity: &TaskIdentity) -> RepositoryResult<TaskRecord> {
            self.inner.read_record(identity).await
        }
    }

    fn assemble_all(outputs: &StepOutputs) -> Value {
        Value::Object(outputs.clone())
    }

    fn job(pipeline: Pipeline, progress: &ProgressStore) -> TaskJob {
        let identity = TaskIdentity::new(pipeline.kind(), "E1");
        let record = TaskRecord::new(identity.clone(), pipeline.total_steps(), json!({}));
        progress.put(ProgressSnapshot::queued(
            identity,
            record.id,
            pipeline.total_steps(),
        ));
        TaskJob::new(record, PipelineInput::new("Ada"), Arc::new(pipeline))
    }

    #[tokio::test]
    async fn test_success_persists_and_clears_snapshot() {
        let llm = ScriptedLlm::new("fine");
        let progress = Arc::new(ProgressStore::new());
        let store = Arc::new(InMemoryTaskStore::new());
        let executor = TaskExecutor::new(client(llm), progress.clone(), store.clone());

        let pipeline = Pipeline::new(PipelineKind::Screening, assemble_all)
            .with_step(Echo("First"))
            .with_step(AskModel)
            .with_step(Echo("Last"));
        let job = job(pipeline, &progress);
        let identity = job.record.identity.clone();

        let record = executor.run(job).await;

        assert_eq!(record.status, TaskStatus::Succeeded);
        let result = record.result.clone().unwrap();
        assert_eq!(result["AskModel"]["answer"], json!("fine"));
        assert_eq!(result["Last"]["seen"], json!(2));
        assert!(progress.get(&identity).is_none());
        assert_eq!(store.read_record(&identity).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_failure_names_step_and_keeps_partial() {
        let llm = ScriptedLlm::new("fine");
        llm.push(Err(LlmError::Auth("invalid api key".into())));
        let progress = Arc::new(ProgressStore::new());
        let store = Arc::new(InMemoryTaskStore::new());
        let executor = TaskExecutor::new(client(llm), progress.clone(), store.clone());

        let pipeline = Pipeline::new(PipelineKind::Video, assemble_all)
            .with_step(Echo("First"))
            .with_step(AskModel)
            .with_step(Echo("Never"));
        let record = executor.run(job(pipeline, &progress)).await;

        assert_eq!(record.status, TaskStatus::Failed);
        let failure = record.error.unwrap();
        assert_eq!(failure.step, "AskModel");
        assert_eq!(failure.step_index, 2);
        assert_eq!(failure.kind, FailureKind::LlmAuthError);
        assert!(failure.partial.get("First").is_some());
        assert!(failure.partial.get("Never").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_abandons_remaining_steps() {
        let progress = Arc::new(ProgressStore::new());
        let store = Arc::new(InMemoryTaskStore::new());
        let executor = TaskExecutor::new(client(ScriptedLlm::new("x")), progress.clone(), store)
            .with_task_timeout(Some(Duration::from_secs(10)));

        let pipeline = Pipeline::new(PipelineKind::Analysis, assemble_all)
            .with_step(Sleep(Duration::from_secs(6)))
            .with_step(Sleep(Duration::from_secs(6)))
            .with_step(Echo("Never"));
        let record = executor.run(job(pipeline, &progress)).await;

        let failure = record.error.unwrap();
        assert_eq!(failure.kind, FailureKind::TaskTimeout);
        assert_eq!(failure.step_index, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_task_timeout_runs_normally() {
        let progress = Arc::new(ProgressStore::new());
        let store = Arc::new(InMemoryTaskStore::new());
        let executor = TaskExecutor::new(client(ScriptedLlm::new("ok")), progress.clone(), store)
            .with_task_timeout(Some(Duration::from_secs(u64::MAX)));

        let pipeline = Pipeline::new(PipelineKind::Video, assemble_all)
            .with_step(Sleep(Duration::from_secs(1)))
            .with_step(AskModel);
        let record = executor.run(job(pipeline, &progress)).await;

        assert_eq!(record.status, TaskStatus::Succeeded);
        assert_eq!(record.result.unwrap()["AskModel"]["answer"], json!("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flaky_persist_is_retried() {
        let progress = Arc::new(ProgressStore::new());
        let store = FlakyStore::new(2);
        let executor = TaskExecutor::new(client(ScriptedLlm::new("x")), progress.clone(), store.clone());

        let pipeline = Pipeline::new(PipelineKind::Interview, assemble_all).with_step(Echo("Only"));
        let job = job(pipeline, &progress);
        let identity = job.record.identity.clone();
        let record = executor.run(job).await;

        assert_eq!(*store.calls.lock(), 3);
        assert_eq!(record.status, TaskStatus::Succeeded);
        assert!(progress.get(&identity).is_none());
        assert_eq!(
            store.read_record(&identity).await.unwrap().status,
            TaskStatus::Succeeded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_failure_leaves_failed_snapshot() {
        let progress = Arc::new(ProgressStore::new());
        let store = FlakyStore::new(u32::MAX);
        let executor = TaskExecutor::new(client(ScriptedLlm::new("x")), progress.clone(), store.clone());

        let pipeline = Pipeline::new(PipelineKind::Interview, assemble_all).with_step(Echo("Only"));
        let job = job(pipeline, &progress);
        let identity = job.record.identity.clone();
        executor.run(job).await;

        assert_eq!(*store.calls.lock(), DEFAULT_PERSIST_ATTEMPTS);
        let snapshot = progress.get(&identity).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        let failure = snapshot.error.unwrap();
        assert_eq!(failure.kind, FailureKind::PersistError);
        assert_eq!(failure.step, PERSIST_STEP);
        assert_eq!(failure.partial["Only"], json!({"seen": 0}));
    }
}

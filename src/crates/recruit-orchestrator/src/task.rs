//! Task identity, lifecycle status and the persisted task record.

use crate::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use recruit_llm::LlmErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// The four long-running AI pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineKind {
    Screening,
    Video,
    Interview,
    Analysis,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 4] = [
        PipelineKind::Screening,
        PipelineKind::Video,
        PipelineKind::Interview,
        PipelineKind::Analysis,
    ];

    /// Lowercase name used in URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Screening => "screening",
            PipelineKind::Video => "video",
            PipelineKind::Interview => "interview",
            PipelineKind::Analysis => "analysis",
        }
    }
}

impl std::fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        PipelineKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown pipeline '{}'", s))
    }
}

/// Composite key of a task: which pipeline, for which application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskIdentity {
    pub kind: PipelineKind,
    pub entity_id: String,
}

impl TaskIdentity {
    pub fn new(kind: PipelineKind, entity_id: impl Into<String>) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
        }
    }
}

impl std::fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.entity_id)
    }
}

/// Task execution status
///
/// `Succeeded` and `Failed` are terminal. The serialized names are read by
/// polling clients and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Accepted, waiting for a worker
    Pending,
    /// Steps are executing
    Running,
    /// All steps completed and the result is stored
    Succeeded,
    /// A step, the deadline or the store failed
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Pending -> Failed` covers tasks that die before their first step.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Succeeded)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "Pending"),
            TaskStatus::Running => write!(f, "Running"),
            TaskStatus::Succeeded => write!(f, "Succeeded"),
            TaskStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Classified cause of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    LlmTimeout,
    LlmRateLimited,
    LlmTransportError,
    LlmInvalidResponse,
    LlmAuthError,
    RateLimitTimeout,
    TaskTimeout,
    PersistError,
    InvalidInput,
    Internal,
}

impl From<LlmErrorKind> for FailureKind {
    fn from(kind: LlmErrorKind) -> Self {
        match kind {
            LlmErrorKind::LlmTimeout => FailureKind::LlmTimeout,
            LlmErrorKind::LlmRateLimited => FailureKind::LlmRateLimited,
            LlmErrorKind::LlmTransportError => FailureKind::LlmTransportError,
            LlmErrorKind::LlmInvalidResponse => FailureKind::LlmInvalidResponse,
            LlmErrorKind::LlmAuthError => FailureKind::LlmAuthError,
            LlmErrorKind::RateLimitTimeout => FailureKind::RateLimitTimeout,
            LlmErrorKind::ConfigError => FailureKind::Internal,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Same spelling as the serialized form
        write!(f, "{:?}", self)
    }
}

/// Why a task failed, and what it had produced by then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Name of the failing step
    pub step: String,
    /// 1-based position of the failing step; 0 when no step had started
    pub step_index: usize,
    pub kind: FailureKind,
    pub message: String,
    /// Outputs of the steps completed before the failure, keyed by step name
    #[serde(default)]
    pub partial: Value,
}

/// Durable record of one task lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique per lifecycle; a resubmission gets a new id
    pub id: Uuid,
    pub identity: TaskIdentity,
    pub status: TaskStatus,
    pub total_steps: usize,
    /// Submission parameters
    #[serde(default)]
    pub parameters: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a new pending record
    pub fn new(identity: TaskIdentity, total_steps: usize, parameters: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            identity,
            status: TaskStatus::Pending,
            total_steps,
            parameters,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update task status, rejecting illegal transitions
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark the task succeeded with its result payload
    pub fn succeed(&mut self, result: Value) -> Result<()> {
        self.transition(TaskStatus::Succeeded)?;
        self.result = Some(result);
        Ok(())
    }

    /// Mark the task failed with its failure detail
    pub fn fail(&mut self, failure: TaskFailure) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(failure);
        Ok(())
    }
}

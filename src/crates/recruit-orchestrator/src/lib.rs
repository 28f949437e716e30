//! Background task orchestration for the AI-assisted recruitment pipelines
//!
//! A [`TaskSupervisor`] accepts one task per [`TaskIdentity`] at a time and
//! runs it on a fixed worker pool. Each task is a [`pipeline::Pipeline`]:
//! an ordered list of steps driven by the [`TaskExecutor`], which publishes
//! progress to the [`ProgressStore`] and persists the terminal
//! [`TaskRecord`] through the domain collaborators in [`repository`].

pub mod api;
pub mod config;
pub mod executor;
pub mod input;
pub mod pipeline;
pub mod progress;
pub mod repository;
pub mod supervisor;
pub mod task;

use thiserror::Error;

pub use config::AppConfig;
pub use executor::{TaskExecutor, TaskJob};
pub use input::{InterviewMessage, PipelineInput, PositionProfile};
pub use progress::{ProgressSnapshot, ProgressStore, ProgressView, ViewStatus};
pub use repository::{InMemoryTaskStore, RepositoryError, TaskInputLoader, TaskRecordStore};
pub use supervisor::{SupervisorBuilder, TaskHandle, TaskLease, TaskSupervisor};
pub use task::{
    FailureKind, PipelineKind, TaskFailure, TaskIdentity, TaskRecord, TaskStatus,
};

/// Errors surfaced by the orchestrator to its callers
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A non-terminal task already exists for this identity
    #[error("Task already running: {0}")]
    AlreadyRunning(TaskIdentity),

    /// Neither a live task nor a persisted record (or input) exists
    #[error("Not found: {0}")]
    NotFound(String),

    /// Collaborator failure
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Invalid state transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },

    /// The supervisor no longer accepts submissions
    #[error("Supervisor is shutting down")]
    ShuttingDown,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let identity = TaskIdentity::new(PipelineKind::Video, "E3");
        let err = OrchestratorError::AlreadyRunning(identity);
        assert_eq!(err.to_string(), "Task already running: video/E3");

        let err = OrchestratorError::InvalidStateTransition {
            from: TaskStatus::Succeeded,
            to: TaskStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from Succeeded to Running"
        );
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}

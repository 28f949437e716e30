//! Domain collaborator interfaces
//!
//! The orchestrator never owns entity storage. It loads pipeline input and
//! stores task records through these traits; [`InMemoryTaskStore`] backs the
//! standalone server and the tests.

use crate::input::PipelineInput;
use crate::task::{TaskIdentity, TaskRecord};
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

/// Collaborator errors
#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    /// Entity or record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend failure (connection, constraint, serialization)
    #[error("Storage error: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound(_))
    }
}

/// Result type for collaborator operations
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Loads the entity data a pipeline runs against.
#[async_trait]
pub trait TaskInputLoader: Send + Sync {
    async fn load_input(&self, identity: &TaskIdentity) -> RepositoryResult<PipelineInput>;
}

/// Durable storage of task records.
#[async_trait]
pub trait TaskRecordStore: Send + Sync {
    /// Store `record` as the current record for its identity.
    ///
    /// Must be idempotent: persisting the same record twice leaves one
    /// visible state.
    async fn persist_record(&self, record: &TaskRecord) -> RepositoryResult<()>;

    /// Current record for `identity`, or `NotFound`.
    async fn read_record(&self, identity: &TaskIdentity) -> RepositoryResult<TaskRecord>;
}

/// In-memory collaborator keyed by task identity.
///
/// Inputs are keyed by entity id and shared across pipelines; records are
/// keyed by identity with upsert semantics.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    inputs: DashMap<String, PipelineInput>,
    records: DashMap<TaskIdentity, TaskRecord>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the input for an entity
    pub fn insert_input(&self, entity_id: impl Into<String>, input: PipelineInput) {
        self.inputs.insert(entity_id.into(), input);
    }

    pub fn has_input(&self, entity_id: &str) -> bool {
        self.inputs.contains_key(entity_id)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl TaskInputLoader for InMemoryTaskStore {
    async fn load_input(&self, identity: &TaskIdentity) -> RepositoryResult<PipelineInput> {
        self.inputs
            .get(&identity.entity_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("entity {}", identity.entity_id)))
    }
}

#[async_trait]
impl TaskRecordStore for InMemoryTaskStore {
    async fn persist_record(&self, record: &TaskRecord) -> RepositoryResult<()> {
        debug!(
            identity = %record.identity,
            task_id = %record.id,
            status = %record.status,
            "Persisting task record"
        );
        self.records.insert(record.identity.clone(), record.clone());
        Ok(())
    }

    async fn read_record(&self, identity: &TaskIdentity) -> RepositoryResult<TaskRecord> {
        self.records
            .get(identity)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("task {}", identity)))
    }
}

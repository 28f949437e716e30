//! In-memory task progress
//!
//! The [`ProgressStore`] holds one ephemeral [`ProgressSnapshot`] per task
//! identity while the task is queued or running. It is never the system of
//! record: once the terminal [`TaskRecord`] is persisted the snapshot is
//! removed and status queries fall back to the record.

use crate::task::{PipelineKind, TaskFailure, TaskIdentity, TaskRecord, TaskStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Label of a snapshot waiting for a worker
pub const QUEUED_LABEL: &str = "Queued";

/// Label of a snapshot whose steps are done and whose record is being stored
pub const FINALIZING_LABEL: &str = "Finalizing";

/// Ephemeral progress of one task lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub identity: TaskIdentity,
    pub task_id: Uuid,
    pub status: TaskStatus,
    /// Number of completed steps
    pub current_step: usize,
    pub total_steps: usize,
    /// Step being executed, or the queue/finalize phase
    pub step_label: String,
    pub updated_at: DateTime<Utc>,
    /// Only set when the task failed but its record could not be stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
}

impl ProgressSnapshot {
    /// Snapshot of a freshly queued task
    pub fn queued(identity: TaskIdentity, task_id: Uuid, total_steps: usize) -> Self {
        Self {
            identity,
            task_id,
            status: TaskStatus::Pending,
            current_step: 0,
            total_steps,
            step_label: QUEUED_LABEL.to_string(),
            updated_at: Utc::now(),
            error: None,
        }
    }

    /// Move to a new step/label, stamping the update time
    pub fn advance(&mut self, status: TaskStatus, current_step: usize, label: impl Into<String>) {
        self.status = status;
        self.current_step = current_step.min(self.total_steps);
        self.step_label = label.into();
        self.updated_at = Utc::now();
    }

    /// Completed-step percentage
    pub fn progress_percent(&self) -> u32 {
        percent(self.current_step, self.total_steps)
    }
}

fn percent(done: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    (done.min(total) * 100 / total) as u32
}

/// Process-wide keyed store of progress snapshots
///
/// Safe for many concurrent readers and one writer per identity; every
/// operation is individually atomic.
#[derive(Debug, Default)]
pub struct ProgressStore {
    entries: DashMap<TaskIdentity, ProgressSnapshot>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the snapshot for its identity
    pub fn put(&self, snapshot: ProgressSnapshot) {
        self.entries.insert(snapshot.identity.clone(), snapshot);
    }

    pub fn get(&self, identity: &TaskIdentity) -> Option<ProgressSnapshot> {
        self.entries.get(identity).map(|entry| entry.value().clone())
    }

    /// Mutate an existing snapshot in place; returns false if absent
    pub fn update<F>(&self, identity: &TaskIdentity, f: F) -> bool
    where
        F: FnOnce(&mut ProgressSnapshot),
    {
        match self.entries.get_mut(identity) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, identity: &TaskIdentity) -> Option<ProgressSnapshot> {
        self.entries.remove(identity).map(|(_, snapshot)| snapshot)
    }

    /// Remove the snapshot only if it still belongs to lifecycle `task_id`
    pub fn remove_if_task(&self, identity: &TaskIdentity, task_id: Uuid) -> bool {
        self.entries
            .remove_if(identity, |_, snapshot| snapshot.task_id == task_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Status reported to polling clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// A non-terminal record exists but its snapshot is gone (process restart)
    Unknown,
}

impl From<TaskStatus> for ViewStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => ViewStatus::Pending,
            TaskStatus::Running => ViewStatus::Running,
            TaskStatus::Succeeded => ViewStatus::Succeeded,
            TaskStatus::Failed => ViewStatus::Failed,
        }
    }
}

/// What a status query returns.
///
/// Field names and status values are read by polling clients and must stay
/// stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressView {
    pub task_id: Uuid,
    pub pipeline: PipelineKind,
    pub entity_id: String,
    pub status: ViewStatus,
    pub current_step: usize,
    pub total_steps: usize,
    /// Completed-step percentage, 0-100
    pub progress: u32,
    pub step_label: String,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
}

impl ProgressView {
    /// View of a live snapshot
    pub fn from_snapshot(snapshot: &ProgressSnapshot) -> Self {
        let progress = match snapshot.status {
            TaskStatus::Succeeded => 100,
            _ => snapshot.progress_percent(),
        };

        Self {
            task_id: snapshot.task_id,
            pipeline: snapshot.identity.kind,
            entity_id: snapshot.identity.entity_id.clone(),
            status: snapshot.status.into(),
            current_step: snapshot.current_step,
            total_steps: snapshot.total_steps,
            progress,
            step_label: snapshot.step_label.clone(),
            updated_at: snapshot.updated_at,
            result: None,
            error: snapshot.error.clone(),
        }
    }

    /// View synthesized from a persisted record with no live snapshot
    pub fn from_record(record: &TaskRecord) -> Self {
        let (status, current_step, progress, step_label) = match record.status {
            TaskStatus::Succeeded => (
                ViewStatus::Succeeded,
                record.total_steps,
                100,
                "Completed".to_string(),
            ),
            TaskStatus::Failed => {
                let (completed, label) = match &record.error {
                    Some(failure) => (
                        failure.step_index.saturating_sub(1),
                        format!("Failed at {}", failure.step),
                    ),
                    None => (0, "Failed".to_string()),
                };
                (
                    ViewStatus::Failed,
                    completed,
                    percent(completed, record.total_steps),
                    label,
                )
            }
            TaskStatus::Pending | TaskStatus::Running => {
                (ViewStatus::Unknown, 0, 0, "Unknown".to_string())
            }
        };

        Self {
            task_id: record.id,
            pipeline: record.identity.kind,
            entity_id: record.identity.entity_id.clone(),
            status,
            current_step,
            total_steps: record.total_steps,
            progress,
            step_label,
            updated_at: record.updated_at,
            result: record.result.clone(),
            error: record.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FailureKind;
    use serde_json::json;
    use std::sync::Arc;

    fn identity(entity: &str) -> TaskIdentity {
        TaskIdentity::new(PipelineKind::Screening, entity)
    }

    #[test]
    fn test_put_get_remove() {
        let store = ProgressStore::new();
        let snapshot = ProgressSnapshot::queued(identity("E1"), Uuid::new_v4(), 4);

        store.put(snapshot.clone());
        assert_eq!(store.get(&identity("E1")), Some(snapshot));
        assert!(store.get(&identity("E2")).is_none());

        assert!(store.remove(&identity("E1")).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_in_place() {
        let store = ProgressStore::new();
        store.put(ProgressSnapshot::queued(identity("E1"), Uuid::new_v4(), 4));

        let updated = store.update(&identity("E1"), |s| {
            s.advance(TaskStatus::Running, 2, "MatchCriteria")
        });
        assert!(updated);
        assert!(!store.update(&identity("E9"), |_| {}));

        let snapshot = store.get(&identity("E1")).unwrap();
        assert_eq!(snapshot.current_step, 2);
        assert_eq!(snapshot.step_label, "MatchCriteria");
        assert_eq!(snapshot.progress_percent(), 50);
    }

    #[test]
    fn test_remove_if_task_ignores_newer_lifecycle() {
        let store = ProgressStore::new();
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        store.put(ProgressSnapshot::queued(identity("E1"), new, 4));

        assert!(!store.remove_if_task(&identity("E1"), old));
        assert!(store.remove_if_task(&identity("E1"), new));
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let store = Arc::new(ProgressStore::new());
        let id = identity("E1");
        store.put(ProgressSnapshot::queued(id.clone(), Uuid::new_v4(), 100));

        let writer = {
            let store = Arc::clone(&store);
            let id = id.clone();
            std::thread::spawn(move || {
                for step in 1..=100 {
                    store.update(&id, |s| s.advance(TaskStatus::Running, step, "step"));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let id = id.clone();
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..200 {
                        let step = store.get(&id).unwrap().current_step;
                        assert!(step >= last);
                        last = step;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.get(&id).unwrap().current_step, 100);
    }

    #[test]
    fn test_view_from_terminal_records() {
        let mut record = TaskRecord::new(identity("E1"), 4, json!({}));
        record.transition(TaskStatus::Running).unwrap();
        record.succeed(json!({"score": 72.5})).unwrap();

        let view = ProgressView::from_record(&record);
        assert_eq!(view.status, ViewStatus::Succeeded);
        assert_eq!(view.progress, 100);
        assert_eq!(view.current_step, 4);
        assert_eq!(view.result, Some(json!({"score": 72.5})));

        let mut failed = TaskRecord::new(identity("E2"), 4, json!({}));
        failed.transition(TaskStatus::Running).unwrap();
        failed
            .fail(TaskFailure {
                step: "ScoreCandidate".into(),
                step_index: 3,
                kind: FailureKind::LlmTimeout,
                message: "timed out".into(),
                partial: json!({}),
            })
            .unwrap();

        let view = ProgressView::from_record(&failed);
        assert_eq!(view.status, ViewStatus::Failed);
        assert_eq!(view.current_step, 2);
        assert_eq!(view.progress, 50);
        assert_eq!(view.step_label, "Failed at ScoreCandidate");
        assert_eq!(view.error.unwrap().kind, FailureKind::LlmTimeout);
    }

    #[test]
    fn test_view_of_orphaned_record_is_unknown() {
        let record = TaskRecord::new(identity("E1"), 4, json!({}));
        let view = ProgressView::from_record(&record);
        assert_eq!(view.status, ViewStatus::Unknown);
    }

    #[test]
    fn test_view_serialization_field_names() {
        let snapshot = ProgressSnapshot::queued(identity("E1"), Uuid::new_v4(), 4);
        let value = serde_json::to_value(ProgressView::from_snapshot(&snapshot)).unwrap();

        for field in [
            "task_id",
            "pipeline",
            "entity_id",
            "status",
            "current_step",
            "total_steps",
            "progress",
            "step_label",
            "updated_at",
        ] {
            assert!(value.get(field).is_some(), "missing field {}", field);
        }
        assert_eq!(value["status"], "Pending");
        assert_eq!(value["step_label"], QUEUED_LABEL);
    }
}

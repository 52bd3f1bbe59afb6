use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::diff::EntityDiff;

/// Lifecycle of a task record
///
/// ```text
/// CREATED ──► QUEUED ──► IN_PROGRESS ──► FINISHED
///    │                        │
///    └──────► FAULTY ◄────────┘
/// ```
///
/// MAINTENANCE is never reached by transition; it is the initial status of a
/// new record created by a maintenance notice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Created,
    Queued,
    InProgress,
    Finished,
    Faulty,
    Unknown,
    Maintenance,
}

impl TaskStatus {
    pub fn code(&self) -> u8 {
        match self {
            TaskStatus::Created => 0,
            TaskStatus::Queued => 1,
            TaskStatus::InProgress => 2,
            TaskStatus::Finished => 3,
            TaskStatus::Faulty => 4,
            TaskStatus::Unknown => 5,
            TaskStatus::Maintenance => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Finished => "finished",
            TaskStatus::Faulty => "faulty",
            TaskStatus::Unknown => "unknown",
            TaskStatus::Maintenance => "maintenance",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Faulty)
    }

    /// Whether a record in `self` may be moved to `next`
    ///
    /// Rewriting the current status is accepted so redelivered queue items can
    /// mark an in-progress task again.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (TaskStatus::Created, TaskStatus::Queued)
                | (TaskStatus::Created, TaskStatus::Faulty)
                | (TaskStatus::Queued, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Finished)
                | (TaskStatus::InProgress, TaskStatus::Faulty)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    OnDemand,
    Batch,
}

impl TaskType {
    pub fn code(&self) -> u8 {
        match self {
            TaskType::OnDemand => 1,
            TaskType::Batch => 2,
        }
    }
}

/// One entry of a task's diagnostic trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoreInfo {
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub details: String,
}

impl MoreInfo {
    pub fn new(source: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            created_at: Utc::now(),
            details: details.into(),
        }
    }
}

/// Persisted unit of crawl work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub user: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
    pub status: TaskStatus,
    /// Crawler identifier
    pub kind: String,
    pub params: Value,
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub times_performed: u32,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub more_info: Vec<MoreInfo>,
    pub differences_from_last_version: Option<Value>,
    #[serde(default)]
    pub inserted_fields: Vec<String>,
    #[serde(default)]
    pub updated_fields: Vec<String>,
    #[serde(default)]
    pub deleted_fields: Vec<String>,
    #[serde(default)]
    pub changed_fields: Vec<String>,
}

/// Fields accepted when creating a task; everything else is assigned by the store
#[derive(Debug, Clone, Builder)]
pub struct NewTask {
    #[builder(into)]
    pub kind: String,
    #[builder(default = Value::Object(Map::new()))]
    pub params: Value,
    #[builder(default)]
    pub options: Map<String, Value>,
    #[builder(default)]
    pub task_type: TaskType,
    #[builder(into)]
    pub user: Option<String>,
    #[builder(default)]
    pub status: TaskStatus,
    #[builder(default)]
    pub more_info: Vec<MoreInfo>,
}

impl NewTask {
    pub(crate) fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            task_id: Uuid::now_v7(),
            user: self.user,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            status: self.status,
            kind: self.kind,
            params: self.params,
            options: self.options,
            times_performed: 0,
            task_type: self.task_type,
            more_info: self.more_info,
            differences_from_last_version: None,
            inserted_fields: Vec::new(),
            updated_fields: Vec::new(),
            deleted_fields: Vec::new(),
            changed_fields: Vec::new(),
        }
    }
}

/// Partial update of a task record
///
/// There is no way to replace `task_id` or to drop diagnostics: `more_info` is
/// only ever appended to.
#[derive(Debug, Clone, Default, Builder)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub append_info: Option<MoreInfo>,
    #[builder(default)]
    pub count_performance: bool,
    pub differences: Option<EntityDiff>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(source: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Faulty),
            append_info: Some(MoreInfo::new(source, details)),
            ..Default::default()
        }
    }

    /// Fold the update into `task`; on error the task is left as it was
    pub(crate) fn apply(self, task: &mut Task, now: DateTime<Utc>) -> serde_json::Result<()> {
        let differences = self.differences.as_ref().map(serde_json::to_value).transpose()?;

        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(info) = self.append_info {
            task.more_info.push(info);
        }
        if self.count_performance {
            task.times_performed += 1;
        }
        if let Some(diff) = self.differences {
            task.inserted_fields = diff.inserted.iter().cloned().collect();
            task.updated_fields = diff.updated.iter().cloned().collect();
            task.deleted_fields = diff.deleted.iter().cloned().collect();
            task.changed_fields = diff.changed.iter().cloned().collect();
            task.differences_from_last_version = differences;
        }
        task.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::make_diff;
    use serde_json::json;

    #[test]
    fn test_status_edges() {
        use TaskStatus::*;

        assert!(Created.can_transition_to(Queued));
        assert!(Created.can_transition_to(Faulty));
        assert!(Queued.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Finished));
        assert!(InProgress.can_transition_to(Faulty));
        assert!(InProgress.can_transition_to(InProgress));

        assert!(!Created.can_transition_to(Finished));
        assert!(!Queued.can_transition_to(Finished));
        assert!(!Finished.can_transition_to(Faulty));
        assert!(!Faulty.can_transition_to(Queued));
        assert!(!Created.can_transition_to(Maintenance));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(TaskStatus::Created.code(), 0);
        assert_eq!(TaskStatus::Faulty.code(), 4);
        assert_eq!(TaskStatus::Maintenance.code(), 6);
        assert_eq!(TaskType::Batch.code(), 2);
        assert!(TaskStatus::Finished.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
    }

    #[test]
    fn test_new_task_builder_defaults() {
        let task = NewTask::builder()
            .kind("companies")
            .params(json!({"cnpj": "123"}))
            .build()
            .into_task(Utc::now());

        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.task_type, TaskType::OnDemand);
        assert_eq!(task.times_performed, 0);
        assert!(task.more_info.is_empty());
        assert!(task.user.is_none());
    }

    #[test]
    fn test_update_appends_and_writes_diff() {
        let mut task = NewTask::builder().kind("companies").build().into_task(Utc::now());
        let diff = make_diff(&json!({"name": "a"}), &json!({"name": "b", "city": "x"}));

        TaskUpdate::builder()
            .status(TaskStatus::Queued)
            .append_info(MoreInfo::new("poller", "queued"))
            .count_performance(true)
            .differences(diff)
            .build()
            .apply(&mut task, Utc::now())
            .unwrap();

        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.more_info.len(), 1);
        assert_eq!(task.times_performed, 1);
        assert_eq!(task.inserted_fields, vec!["city"]);
        assert_eq!(task.updated_fields, vec!["name"]);
        assert_eq!(task.changed_fields, vec!["city", "name"]);
        let stored = task.differences_from_last_version.unwrap();
        assert_eq!(stored["changes"], json!(["city", "name"]));
    }

    #[test]
    fn test_task_serializes_type_field() {
        let task = NewTask::builder()
            .kind("companies")
            .task_type(TaskType::Batch)
            .build()
            .into_task(Utc::now());
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "batch");
        assert_eq!(value["status"], "created");
    }
}

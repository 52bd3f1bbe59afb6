use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{LedgerError, Result};
use super::partitions::{decode_task_key, encode_snapshot_key, encode_task_key};
use super::task::{NewTask, Task, TaskStatus, TaskUpdate};

/// Persistent task records plus last-seen entity snapshots
pub trait TaskStore: Send + Sync {
    fn create(&self, task: NewTask) -> Result<Task>;

    fn get(&self, task_id: &Uuid) -> Result<Option<Task>>;

    fn filter_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;

    /// Apply `update` and return the stored record
    ///
    /// Fails with [`LedgerError::InvalidTransition`] when the status change is not
    /// an edge of the task state machine.
    fn update(&self, task_id: &Uuid, update: TaskUpdate) -> Result<Task>;

    fn load_snapshot(&self, key: &str) -> Result<Option<Value>>;

    fn save_snapshot(&self, key: &str, value: &Value) -> Result<()>;
}

/// Fjall-backed [`TaskStore`]
pub struct FjallTaskStore {
    keyspace: Keyspace,
    tasks: PartitionHandle,
    snapshots: PartitionHandle,
    write_lock: Mutex<()>,
}

impl FjallTaskStore {
    /// Open or create a task store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening task store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;

        let tasks = keyspace.open_partition("tasks", PartitionCreateOptions::default())?;
        let snapshots = keyspace.open_partition("snapshots", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            tasks,
            snapshots,
            write_lock: Mutex::new(()),
        })
    }

    fn put(&self, task: &Task) -> Result<()> {
        let key = encode_task_key(&task.task_id);
        let value = serde_json::to_vec(task)?;
        self.tasks.insert(key, value)?;
        Ok(())
    }

    /// Persist all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    /// Count tasks per status (for debugging/monitoring)
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();

        for item in self.tasks.iter() {
            let (_, value) = item?;
            let task: Task = serde_json::from_slice(&value)?;
            stats.task_count += 1;
            match task.status {
                TaskStatus::Created => stats.created += 1,
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Finished => stats.finished += 1,
                TaskStatus::Faulty => stats.faulty += 1,
                TaskStatus::Unknown | TaskStatus::Maintenance => stats.other += 1,
            }
        }

        Ok(stats)
    }
}

impl TaskStore for FjallTaskStore {
    fn create(&self, task: NewTask) -> Result<Task> {
        let task = task.into_task(Utc::now());
        self.put(&task)?;
        debug!(task_id = %task.task_id, kind = %task.kind, status = %task.status, "Created task");
        Ok(task)
    }

    fn get(&self, task_id: &Uuid) -> Result<Option<Task>> {
        let key = encode_task_key(task_id);
        match self.tasks.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn filter_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let mut matches = Vec::new();

        for item in self.tasks.prefix("task:") {
            let (key, value) = item?;
            decode_task_key(&key).ok_or_else(|| {
                LedgerError::InvalidKey(String::from_utf8_lossy(&key).into_owned())
            })?;

            let task: Task = serde_json::from_slice(&value)?;
            if task.status == status && !task.is_deleted {
                matches.push(task);
            }
        }

        Ok(matches)
    }

    fn update(&self, task_id: &Uuid, update: TaskUpdate) -> Result<Task> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut task = self
            .get(task_id)?
            .ok_or(LedgerError::TaskNotFound(*task_id))?;

        if let Some(next) = update.status {
            if !task.status.can_transition_to(next) {
                return Err(LedgerError::InvalidTransition {
                    task_id: *task_id,
                    from: task.status,
                    to: next,
                });
            }
        }

        update.apply(&mut task, Utc::now())?;
        self.put(&task)?;

        debug!(task_id = %task_id, status = %task.status, "Updated task");
        Ok(task)
    }

    fn load_snapshot(&self, key: &str) -> Result<Option<Value>> {
        match self.snapshots.get(encode_snapshot_key(key))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn save_snapshot(&self, key: &str, value: &Value) -> Result<()> {
        self.snapshots
            .insert(encode_snapshot_key(key), serde_json::to_vec(value)?)?;
        Ok(())
    }
}

/// Task store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub task_count: usize,
    pub created: usize,
    pub queued: usize,
    pub in_progress: usize,
    pub finished: usize,
    pub faulty: usize,
    pub other: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::task::MoreInfo;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store() -> (FjallTaskStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FjallTaskStore::open(temp_dir.path().join("ledger")).unwrap();
        (store, temp_dir)
    }

    fn new_task(kind: &str) -> NewTask {
        NewTask::builder()
            .kind(kind)
            .params(json!({"id": 42}))
            .build()
    }

    #[test]
    fn test_create_and_get() {
        let (store, _dir) = open_store();

        let created = store.create(new_task("companies")).unwrap();
        let fetched = store.get(&created.task_id).unwrap().unwrap();

        assert_eq!(fetched, created);
        assert_eq!(fetched.status, TaskStatus::Created);
        assert_eq!(fetched.params["id"], 42);
    }

    #[test]
    fn test_get_missing() {
        let (store, _dir) = open_store();
        assert!(store.get(&Uuid::now_v7()).unwrap().is_none());
    }

    #[test]
    fn test_filter_by_status() {
        let (store, _dir) = open_store();

        let a = store.create(new_task("companies")).unwrap();
        let b = store.create(new_task("people")).unwrap();
        store
            .update(&b.task_id, TaskUpdate::status(TaskStatus::Queued))
            .unwrap();

        let created = store.filter_by_status(TaskStatus::Created).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].task_id, a.task_id);

        let queued = store.filter_by_status(TaskStatus::Queued).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].task_id, b.task_id);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let (store, _dir) = open_store();
        let task = store.create(new_task("companies")).unwrap();

        let err = store
            .update(&task.task_id, TaskUpdate::status(TaskStatus::Finished))
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidTransition {
                from: TaskStatus::Created,
                to: TaskStatus::Finished,
                ..
            }
        ));

        let unchanged = store.get(&task.task_id).unwrap().unwrap();
        assert_eq!(unchanged.status, TaskStatus::Created);
    }

    #[test]
    fn test_more_info_only_grows() {
        let (store, _dir) = open_store();
        let task = store.create(new_task("companies")).unwrap();

        store
            .update(&task.task_id, TaskUpdate::failed("poller", "queue unavailable"))
            .unwrap();
        let updated = store
            .update(
                &task.task_id,
                TaskUpdate::builder()
                    .append_info(MoreInfo::new("operator", "checked"))
                    .build(),
            )
            .unwrap();

        assert_eq!(updated.status, TaskStatus::Faulty);
        assert_eq!(updated.more_info.len(), 2);
        assert_eq!(updated.more_info[0].source, "poller");
        assert_eq!(updated.more_info[1].source, "operator");
        assert_eq!(updated.task_id, task.task_id);
    }

    #[test]
    fn test_update_missing_task() {
        let (store, _dir) = open_store();
        let err = store
            .update(&Uuid::now_v7(), TaskUpdate::status(TaskStatus::Queued))
            .unwrap_err();
        assert!(matches!(err, LedgerError::TaskNotFound(_)));
    }

    #[test]
    fn test_snapshots_roundtrip_and_overwrite() {
        let (store, _dir) = open_store();

        assert!(store.load_snapshot("company:42").unwrap().is_none());

        store.save_snapshot("company:42", &json!({"v": 1})).unwrap();
        store.save_snapshot("company:42", &json!({"v": 2})).unwrap();

        assert_eq!(store.load_snapshot("company:42").unwrap(), Some(json!({"v": 2})));
    }

    #[test]
    fn test_persistence_across_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger");

        let task_id = {
            let store = FjallTaskStore::open(&path).unwrap();
            let task = store.create(new_task("companies")).unwrap();
            store.persist().unwrap();
            task.task_id
        };

        let store = FjallTaskStore::open(&path).unwrap();
        let task = store.get(&task_id).unwrap().unwrap();
        assert_eq!(task.kind, "companies");

        let stats = store.stats().unwrap();
        assert_eq!(stats.task_count, 1);
        assert_eq!(stats.created, 1);
    }
}

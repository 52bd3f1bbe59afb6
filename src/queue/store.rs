use chrono::{DateTime, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::item::QueueItem;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Item is not leased: seq={0}")]
    NotLeased(u64),

    #[error("Item not found in failed partition: seq={0}")]
    FailedNotFound(u64),

    #[error("Invalid sequence key")]
    InvalidSequence,
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// An item handed to exactly one consumer until it is acked or nacked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub seq: u64,
    pub leased_at: DateTime<Utc>,
    pub item: QueueItem,
}

/// A nacked item kept for inspection or replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    pub seq: u64,
    pub item: QueueItem,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Partition sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub leased: usize,
    pub failed: usize,
}

/// Disk-backed FIFO with lease/ack/nack semantics on top of Fjall
///
/// Architecture:
/// - `ready` partition: u64 (big-endian) → QueueItem (JSON), waiting to be leased
/// - `leased` partition: u64 (big-endian) → Lease (JSON), handed to a consumer
/// - `failed` partition: u64 (big-endian) → FailedItem (JSON), nacked
/// - `metadata` partition: "next_seq" → u64 (counter)
///
/// Big-endian keys make partition iteration order equal to enqueue order. A
/// sequence number is allocated and committed under the same lock, so the
/// persisted counter never goes backwards. Moving
/// an item between partitions is a single atomic batch. Items still in `leased`
/// when the queue is opened belonged to a consumer that died before acking; they
/// are moved back to `ready` under their original sequence, so they are the next
/// to be handed out.
pub struct DurableQueue {
    keyspace: Keyspace,
    ready: PartitionHandle,
    leased: PartitionHandle,
    failed: PartitionHandle,
    metadata: PartitionHandle,
    seq_counter: AtomicU64,
    put_lock: Mutex<()>,
    lease_lock: Mutex<()>,
}

impl DurableQueue {
    /// Open or create a queue at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening DurableQueue at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;

        let ready = keyspace.open_partition("ready", PartitionCreateOptions::default())?;
        let leased = keyspace.open_partition("leased", PartitionCreateOptions::default())?;
        let failed = keyspace.open_partition("failed", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        let persisted = match metadata.get(b"next_seq")? {
            Some(bytes) => decode_seq(&bytes)?,
            None => 0,
        };
        let mut current_seq = persisted;
        for partition in [&ready, &leased, &failed] {
            if let Some((key, _)) = partition.last_key_value()? {
                current_seq = current_seq.max(decode_seq(&key)? + 1);
            }
        }
        if current_seq != persisted {
            warn!(persisted, current_seq, "Sequence counter behind stored items, advancing");
        }

        let queue = Self {
            keyspace,
            ready,
            leased,
            failed,
            metadata,
            seq_counter: AtomicU64::new(current_seq),
            put_lock: Mutex::new(()),
            lease_lock: Mutex::new(()),
        };

        let resumed = queue.resume_leased()?;
        if resumed > 0 {
            warn!(resumed, "Resumed items leased by a previous process");
        }

        info!(current_seq, "DurableQueue opened");
        Ok(queue)
    }

    /// Persist an item and return its sequence number
    pub fn put(&self, item: &QueueItem) -> Result<u64> {
        let value = serde_json::to_vec(item)?;

        let _guard = self
            .put_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let seq = self.seq_counter.load(Ordering::SeqCst);

        let mut batch = self.keyspace.batch();
        batch.insert(&self.ready, encode_seq(seq), value);
        batch.insert(&self.metadata, b"next_seq".to_vec(), encode_seq(seq + 1));
        batch.commit()?;
        self.seq_counter.store(seq + 1, Ordering::SeqCst);

        debug!(
            seq,
            task_id = %item.options.task_id,
            crawler = %item.options.crawler,
            "Item enqueued"
        );
        Ok(seq)
    }

    /// Lease the oldest ready item without blocking; `None` means the queue is empty
    pub fn get(&self) -> Result<Option<Lease>> {
        let _guard = self.lock();

        let Some((key, value)) = self.ready.first_key_value()? else {
            return Ok(None);
        };

        let seq = decode_seq(&key)?;
        let lease = Lease {
            seq,
            leased_at: Utc::now(),
            item: serde_json::from_slice(&value)?,
        };

        let mut batch = self.keyspace.batch();
        batch.insert(&self.leased, encode_seq(seq), serde_json::to_vec(&lease)?);
        batch.remove(&self.ready, encode_seq(seq));
        batch.commit()?;

        debug!(seq, task_id = %lease.item.options.task_id, "Item leased");
        Ok(Some(lease))
    }

    /// Permanently remove a leased item
    pub fn ack(&self, lease: &Lease) -> Result<()> {
        let _guard = self.lock();

        if self.leased.get(encode_seq(lease.seq))?.is_none() {
            return Err(QueueError::NotLeased(lease.seq));
        }
        self.leased.remove(encode_seq(lease.seq))?;

        debug!(seq = lease.seq, "Item acked");
        Ok(())
    }

    /// Move a leased item to the failed partition instead of retrying it
    pub fn ack_failed(&self, lease: &Lease, reason: impl Into<String>) -> Result<()> {
        let _guard = self.lock();

        if self.leased.get(encode_seq(lease.seq))?.is_none() {
            return Err(QueueError::NotLeased(lease.seq));
        }

        let failed = FailedItem {
            seq: lease.seq,
            item: lease.item.clone(),
            reason: reason.into(),
            failed_at: Utc::now(),
        };

        let mut batch = self.keyspace.batch();
        batch.insert(&self.failed, encode_seq(lease.seq), serde_json::to_vec(&failed)?);
        batch.remove(&self.leased, encode_seq(lease.seq));
        batch.commit()?;

        info!(seq = lease.seq, task_id = %lease.item.options.task_id, "Item nacked");
        Ok(())
    }

    /// List nacked items, oldest first
    pub fn list_failed(&self, limit: usize) -> Result<Vec<FailedItem>> {
        let mut results = Vec::new();

        for item in self.failed.iter().take(limit) {
            let (_, value) = item?;
            results.push(serde_json::from_slice(&value)?);
        }

        Ok(results)
    }

    /// Put a nacked item back in line under its original sequence number
    pub fn replay_failed(&self, seq: u64) -> Result<QueueItem> {
        let _guard = self.lock();

        let value = self
            .failed
            .get(encode_seq(seq))?
            .ok_or(QueueError::FailedNotFound(seq))?;
        let failed: FailedItem = serde_json::from_slice(&value)?;

        let mut batch = self.keyspace.batch();
        batch.insert(&self.ready, encode_seq(seq), serde_json::to_vec(&failed.item)?);
        batch.remove(&self.failed, encode_seq(seq));
        batch.commit()?;

        info!(seq, task_id = %failed.item.options.task_id, "Failed item replayed");
        Ok(failed.item)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            ready: self.ready.len()?,
            leased: self.leased.len()?,
            failed: self.failed.len()?,
        })
    }

    /// Get current sequence counter value
    pub fn current_seq(&self) -> u64 {
        self.seq_counter.load(Ordering::SeqCst)
    }

    /// Flush all writes to disk
    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    fn resume_leased(&self) -> Result<usize> {
        let _guard = self.lock();

        let mut stale = Vec::new();
        for item in self.leased.iter() {
            let (key, value) = item?;
            let lease: Lease = serde_json::from_slice(&value)?;
            stale.push((decode_seq(&key)?, lease));
        }

        for (seq, lease) in &stale {
            let mut batch = self.keyspace.batch();
            batch.insert(&self.ready, encode_seq(*seq), serde_json::to_vec(&lease.item)?);
            batch.remove(&self.leased, encode_seq(*seq));
            batch.commit()?;
        }

        Ok(stale.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lease_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn encode_seq(seq: u64) -> Vec<u8> {
    seq.to_be_bytes().to_vec()
}

fn decode_seq(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| QueueError::InvalidSequence)?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::item::CrawlOptions;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn create_test_item(page: u32) -> QueueItem {
        QueueItem::new(
            json!({"page": page}),
            CrawlOptions::new("companies", Uuid::now_v7()),
        )
    }

    #[test]
    fn test_put_and_get_fifo() {
        let temp_dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(temp_dir.path()).unwrap();

        let seq1 = queue.put(&create_test_item(1)).unwrap();
        let seq2 = queue.put(&create_test_item(2)).unwrap();
        assert_eq!((seq1, seq2), (0, 1));

        let first = queue.get().unwrap().unwrap();
        let second = queue.get().unwrap().unwrap();
        assert_eq!(first.item.params["page"], 1);
        assert_eq!(second.item.params["page"], 2);
        assert!(queue.get().unwrap().is_none());
    }

    #[test]
    fn test_leased_item_is_not_handed_out_twice() {
        let temp_dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(temp_dir.path()).unwrap();

        queue.put(&create_test_item(1)).unwrap();
        let lease = queue.get().unwrap().unwrap();

        assert!(queue.get().unwrap().is_none());
        assert_eq!(
            queue.stats().unwrap(),
            QueueStats {
                ready: 0,
                leased: 1,
                failed: 0
            }
        );

        queue.ack(&lease).unwrap();
        assert_eq!(queue.stats().unwrap(), QueueStats::default());
    }

    #[test]
    fn test_double_ack_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(temp_dir.path()).unwrap();

        queue.put(&create_test_item(1)).unwrap();
        let lease = queue.get().unwrap().unwrap();
        queue.ack(&lease).unwrap();

        assert!(matches!(queue.ack(&lease), Err(QueueError::NotLeased(0))));
        assert!(matches!(
            queue.ack_failed(&lease, "late"),
            Err(QueueError::NotLeased(0))
        ));
    }

    #[test]
    fn test_ack_failed_keeps_item_for_replay() {
        let temp_dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(temp_dir.path()).unwrap();

        let item = create_test_item(7);
        let seq = queue.put(&item).unwrap();
        let lease = queue.get().unwrap().unwrap();
        queue.ack_failed(&lease, "Connection timeout").unwrap();

        assert!(queue.get().unwrap().is_none());

        let failed = queue.list_failed(10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].seq, seq);
        assert_eq!(failed[0].reason, "Connection timeout");
        assert_eq!(failed[0].item, item);

        let replayed = queue.replay_failed(seq).unwrap();
        assert_eq!(replayed, item);
        assert!(queue.list_failed(10).unwrap().is_empty());

        let again = queue.get().unwrap().unwrap();
        assert_eq!(again.seq, seq);
    }

    #[test]
    fn test_replay_unknown_seq() {
        let temp_dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(temp_dir.path()).unwrap();
        assert!(matches!(
            queue.replay_failed(99),
            Err(QueueError::FailedNotFound(99))
        ));
    }

    #[test]
    fn test_unacked_item_survives_crash() {
        let temp_dir = TempDir::new().unwrap();
        let item = create_test_item(1);

        {
            let queue = DurableQueue::open(temp_dir.path()).unwrap();
            queue.put(&item).unwrap();
        }

        let queue = DurableQueue::open(temp_dir.path()).unwrap();
        let lease = queue.get().unwrap().unwrap();
        assert_eq!(lease.item, item);
    }

    #[test]
    fn test_leased_item_survives_crash() {
        let temp_dir = TempDir::new().unwrap();

        let (seq, item) = {
            let queue = DurableQueue::open(temp_dir.path()).unwrap();
            queue.put(&create_test_item(1)).unwrap();
            queue.put(&create_test_item(2)).unwrap();
            let lease = queue.get().unwrap().unwrap();
            (lease.seq, lease.item)
        };

        let queue = DurableQueue::open(temp_dir.path()).unwrap();
        assert_eq!(queue.stats().unwrap().leased, 0);

        let lease = queue.get().unwrap().unwrap();
        assert_eq!(lease.seq, seq);
        assert_eq!(lease.item, item);
    }

    #[test]
    fn test_sequence_continues_after_reopen() {
        let temp_dir = TempDir::new().unwrap();

        {
            let queue = DurableQueue::open(temp_dir.path()).unwrap();
            queue.put(&create_test_item(1)).unwrap();
            queue.flush().unwrap();
        }

        let queue = DurableQueue::open(temp_dir.path()).unwrap();
        assert_eq!(queue.current_seq(), 1);
        assert_eq!(queue.put(&create_test_item(2)).unwrap(), 1);
    }

    #[test]
    fn test_concurrent_puts_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();

        for round in 0..5u64 {
            {
                let queue = Arc::new(DurableQueue::open(temp_dir.path()).unwrap());
                let writers: Vec<_> = (0..8)
                    .map(|_| {
                        let queue = queue.clone();
                        std::thread::spawn(move || {
                            for page in 0..50 {
                                queue.put(&create_test_item(page)).unwrap();
                            }
                        })
                    })
                    .collect();
                for writer in writers {
                    writer.join().unwrap();
                }
                queue.flush().unwrap();

                let stored = queue.metadata.get(b"next_seq").unwrap().unwrap();
                assert_eq!(decode_seq(&stored).unwrap(), (round + 1) * 400);
            }

            let queue = DurableQueue::open(temp_dir.path()).unwrap();
            assert_eq!(queue.current_seq(), (round + 1) * 400);
            assert_eq!(queue.stats().unwrap().ready, ((round + 1) * 400) as usize);
        }
    }

    #[test]
    fn test_stale_counter_is_advanced_past_stored_items() {
        let temp_dir = TempDir::new().unwrap();

        {
            let queue = DurableQueue::open(temp_dir.path()).unwrap();
            for page in 0..3 {
                queue.put(&create_test_item(page)).unwrap();
            }
            // Counter written by a writer that lost the race
            queue
                .metadata
                .insert(b"next_seq".to_vec(), encode_seq(1))
                .unwrap();
            queue.flush().unwrap();
        }

        let queue = DurableQueue::open(temp_dir.path()).unwrap();
        assert_eq!(queue.current_seq(), 3);
        assert_eq!(queue.put(&create_test_item(9)).unwrap(), 3);
        assert_eq!(queue.stats().unwrap().ready, 4);
    }
}

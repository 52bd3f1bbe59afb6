/// Key layout and encoding utilities for Fjall partitions
///
/// Partition structure:
/// - `tasks`: task:{uuid} -> Task (JSON)
/// - `snapshots`: snap:{key} -> last harvested version of an entity (JSON)
use uuid::Uuid;

/// Encode a task key: task:{uuid}
pub fn encode_task_key(task_id: &Uuid) -> Vec<u8> {
    format!("task:{}", task_id).into_bytes()
}

/// Decode a task key: task:{uuid} -> uuid
pub fn decode_task_key(key: &[u8]) -> Option<Uuid> {
    let key_str = std::str::from_utf8(key).ok()?;
    key_str.strip_prefix("task:")?.parse().ok()
}

/// Encode a snapshot key: snap:{key}
pub fn encode_snapshot_key(key: &str) -> Vec<u8> {
    format!("snap:{}", key).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_key_encoding() {
        let task_id = Uuid::parse_str("0190c6a2-6a4e-7c3b-9d8f-1a2b3c4d5e6f").unwrap();
        let key = encode_task_key(&task_id);
        assert_eq!(key, b"task:0190c6a2-6a4e-7c3b-9d8f-1a2b3c4d5e6f");

        let decoded = decode_task_key(&key).unwrap();
        assert_eq!(decoded, task_id);
    }

    #[test]
    fn test_decode_rejects_foreign_keys() {
        assert!(decode_task_key(b"snap:abc").is_none());
        assert!(decode_task_key(b"task:not-a-uuid").is_none());
    }

    #[test]
    fn test_snapshot_key_encoding() {
        let key = encode_snapshot_key("https://example.com/companies/42");
        assert_eq!(key, b"snap:https://example.com/companies/42");
    }
}

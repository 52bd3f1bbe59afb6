//! Structured document diffs between two versions of a harvested entity.
//!
//! [`make_diff`] produces path-keyed change records (`a.b`, `a[2].b`) together with coarse
//! summaries collapsed to the root field (`a*`). Arrays of objects are compared position by
//! position, so callers should sort them by a stable key first; otherwise a reorder shows up
//! as value updates.

mod compare;

use compare::{Delta, compare};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Path used when the whole document is replaced by a value of another type
pub const ROOT_PATH: &str = "$";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inserted {
    pub new_value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Updated {
    pub old_value: Value,
    pub new_value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deleted {
    pub old_value: Value,
}

/// Path-keyed change records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffRecords {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inserts: BTreeMap<String, Inserted>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub updates: BTreeMap<String, Updated>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deletes: BTreeMap<String, Deleted>,
}

impl DiffRecords {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Full diff between two documents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDiff {
    pub all: DiffRecords,
    #[serde(rename = "inserts", default)]
    pub inserted: BTreeSet<String>,
    #[serde(rename = "updates", default)]
    pub updated: BTreeSet<String>,
    #[serde(rename = "deletes", default)]
    pub deleted: BTreeSet<String>,
    #[serde(rename = "changes", default)]
    pub changed: BTreeSet<String>,
}

impl EntityDiff {
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

/// Compute the symmetric diff turning `previous` into `current`
pub fn make_diff(previous: &Value, current: &Value) -> EntityDiff {
    let mut records = DiffRecords::default();

    match compare(previous, current).0 {
        None => {}
        Some(Delta::Replace { old, new }) => expand_root_replace(&mut records, old, new),
        Some(delta) => collect(&mut records, String::new(), delta),
    }

    summarize(records)
}

/// Collapse a diff path to its root field: `a.b.c` and `a[2].b` become `a*`
pub fn root_field(path: &str) -> String {
    let mut root = path.to_string();
    if let Some((head, _)) = root.split_once('.') {
        root = format!("{head}*");
    }
    if let Some((head, _)) = root.split_once('[') {
        root = format!("{head}*");
    }
    root
}

fn expand_root_replace(records: &mut DiffRecords, old: Value, new: Value) {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, old_value) in old {
                records.deletes.insert(key, Deleted { old_value });
            }
            for (key, new_value) in new {
                records.inserts.insert(key, Inserted { new_value });
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            for (pos, old_value) in old.into_iter().enumerate() {
                records.deletes.insert(index_path("", pos), Deleted { old_value });
            }
            for (pos, new_value) in new.into_iter().enumerate() {
                records.inserts.insert(index_path("", pos), Inserted { new_value });
            }
        }
        (old_value, new_value) => {
            records.updates.insert(
                ROOT_PATH.to_string(),
                Updated {
                    old_value,
                    new_value,
                },
            );
        }
    }
}

fn collect(records: &mut DiffRecords, path: String, delta: Delta) {
    match delta {
        Delta::Replace { old, new } => {
            records.updates.insert(
                path,
                Updated {
                    old_value: old,
                    new_value: new,
                },
            );
        }
        Delta::Object {
            changed,
            inserted,
            deleted,
        } => {
            for (key, delta) in changed {
                collect(records, key_path(&path, &key), delta);
            }
            for (key, new_value) in inserted {
                records.inserts.insert(key_path(&path, &key), Inserted { new_value });
            }
            for (key, old_value) in deleted {
                records.deletes.insert(key_path(&path, &key), Deleted { old_value });
            }
        }
        Delta::Array {
            changed,
            inserted,
            deleted,
        } => {
            for (pos, delta) in changed {
                collect(records, index_path(&path, pos), delta);
            }
            for (pos, new_value) in inserted {
                records.inserts.insert(index_path(&path, pos), Inserted { new_value });
            }
            for (pos, old_value) in deleted {
                records.deletes.insert(index_path(&path, pos), Deleted { old_value });
            }
        }
    }
}

fn key_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn index_path(parent: &str, pos: usize) -> String {
    format!("{parent}[{pos}]")
}

fn summarize(all: DiffRecords) -> EntityDiff {
    let inserted: BTreeSet<String> = all.inserts.keys().map(|p| root_field(p)).collect();
    let mut updated: BTreeSet<String> = all.updates.keys().map(|p| root_field(p)).collect();
    let deleted: BTreeSet<String> = all.deletes.keys().map(|p| root_field(p)).collect();

    // a root touched by more than one kind of change is summarized as updated
    let mixed: BTreeSet<String> = inserted
        .intersection(&deleted)
        .chain(inserted.intersection(&updated))
        .chain(deleted.intersection(&updated))
        .cloned()
        .collect();
    updated.extend(mixed.iter().cloned());

    let inserted: BTreeSet<String> = inserted.difference(&mixed).cloned().collect();
    let deleted: BTreeSet<String> = deleted.difference(&mixed).cloned().collect();

    let changed = inserted
        .iter()
        .chain(updated.iter())
        .chain(deleted.iter())
        .cloned()
        .collect();

    EntityDiff {
        all,
        inserted,
        updated,
        deleted,
        changed,
    }
}

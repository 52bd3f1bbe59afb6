//! Similarity-scored structural comparison of JSON trees.
//!
//! Every comparison yields an optional [`Delta`] plus a similarity score in `[0, 1]`.
//! A score of `1.0` means equal, `0.0` means nothing in common (the node is reported as a
//! whole-value replacement), anything in between produces a structured delta.
//!
//! Arrays are aligned with a weighted LCS where partially similar elements may be paired,
//! so an element inserted at the front of a list is reported as one insertion instead of a
//! cascade of positional updates. Reordered arrays of objects still pair positionally when
//! their elements are partially similar.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Delta {
    Replace {
        old: Value,
        new: Value,
    },
    Object {
        changed: BTreeMap<String, Delta>,
        inserted: BTreeMap<String, Value>,
        deleted: BTreeMap<String, Value>,
    },
    Array {
        /// Keyed by position in the new array
        changed: BTreeMap<usize, Delta>,
        /// Positions in the new array
        inserted: Vec<(usize, Value)>,
        /// Positions in the old array
        deleted: Vec<(usize, Value)>,
    },
}

pub(crate) fn compare(old: &Value, new: &Value) -> (Option<Delta>, f64) {
    if old == new {
        return (None, 1.0);
    }

    match (old, new) {
        (Value::Object(a), Value::Object(b)) => compare_objects(old, new, a, b),
        (Value::Array(x), Value::Array(y)) => compare_arrays(old, new, x, y),
        _ => (
            Some(Delta::Replace {
                old: old.clone(),
                new: new.clone(),
            }),
            0.0,
        ),
    }
}

fn compare_objects(
    old: &Value,
    new: &Value,
    a: &Map<String, Value>,
    b: &Map<String, Value>,
) -> (Option<Delta>, f64) {
    let mut changed = BTreeMap::new();
    let mut inserted = BTreeMap::new();
    let mut deleted = BTreeMap::new();
    let mut matched_score = 0.0;
    let mut total = 0usize;

    for (key, value) in a {
        total += 1;
        match b.get(key) {
            None => {
                deleted.insert(key.clone(), value.clone());
            }
            Some(other) => {
                let (delta, score) = compare(value, other);
                if let Some(delta) = delta {
                    changed.insert(key.clone(), delta);
                }
                matched_score += 0.5 + 0.5 * score;
            }
        }
    }

    for (key, value) in b {
        if !a.contains_key(key) {
            total += 1;
            inserted.insert(key.clone(), value.clone());
        }
    }

    let score = if total == 0 {
        1.0
    } else {
        matched_score / total as f64
    };

    let delta = Delta::Object {
        changed,
        inserted,
        deleted,
    };
    emit(old, new, score, delta)
}

fn compare_arrays(old: &Value, new: &Value, x: &[Value], y: &[Value]) -> (Option<Delta>, f64) {
    let (m, n) = (x.len(), y.len());

    let mut pairs: Vec<Vec<(Option<Delta>, f64)>> = x
        .iter()
        .map(|left| y.iter().map(|right| compare(left, right)).collect())
        .collect();

    let mut table = vec![vec![0.0f64; n + 1]; m + 1];
    for i in 1..=m {
        for j in 1..=n {
            let score = pairs[i - 1][j - 1].1;
            table[i][j] = table[i][j - 1]
                .max(table[i - 1][j])
                .max(table[i - 1][j - 1] + score);
        }
    }

    let mut changed = BTreeMap::new();
    let mut inserted = Vec::new();
    let mut deleted = Vec::new();
    let mut total_score = 0.0;
    let (mut i, mut j) = (m, n);

    loop {
        if i > 0 && j > 0 {
            let score = pairs[i - 1][j - 1].1;
            if score > 0.0 && table[i][j] == table[i - 1][j - 1] + score {
                if let Some(delta) = pairs[i - 1][j - 1].0.take() {
                    changed.insert(j - 1, delta);
                }
                total_score += score;
                i -= 1;
                j -= 1;
                continue;
            }
        }
        if j > 0 && (i == 0 || table[i][j - 1] >= table[i - 1][j]) {
            inserted.push((j - 1, y[j - 1].clone()));
            j -= 1;
            continue;
        }
        if i > 0 {
            deleted.push((i - 1, x[i - 1].clone()));
            i -= 1;
            continue;
        }
        break;
    }

    inserted.reverse();
    deleted.reverse();

    let total = m + inserted.len();
    let score = if total == 0 {
        1.0
    } else {
        total_score / total as f64
    };

    let delta = Delta::Array {
        changed,
        inserted,
        deleted,
    };
    emit(old, new, score, delta)
}

fn emit(old: &Value, new: &Value, score: f64, delta: Delta) -> (Option<Delta>, f64) {
    if score >= 1.0 {
        (None, 1.0)
    } else if score <= 0.0 {
        (
            Some(Delta::Replace {
                old: old.clone(),
                new: new.clone(),
            }),
            0.0,
        )
    } else {
        (Some(delta), score)
    }
}

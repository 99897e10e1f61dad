//! Three-way diff producing a JSON merge patch, and merge-patch application.
//!
//! Mappings are compared key by key; sequences and scalars are atomic. A
//! `null` in the patch deletes the field (RFC 7386).

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use super::AuthoritativePaths;
use crate::document::FieldPath;

/// Compute the patch turning `current` toward `desired`, given the desired
/// state last applied (`last_applied`). Returns `None` when nothing changes.
pub(super) fn diff(
    last_applied: Option<&Value>,
    desired: Option<&Value>,
    current: Option<&Value>,
    path: &FieldPath,
    authoritative: &AuthoritativePaths,
) -> Option<Value> {
    let desired = present(desired);
    let current = present(current);
    // Live values at authoritative paths count as written by us.
    let last_applied = if authoritative.contains(path) {
        current
    } else {
        present(last_applied)
    };

    match (desired, last_applied, current) {
        // A mapping dropped from desired is compared key by key, so live keys
        // we never wrote survive. Authoritative subtrees go as a whole.
        (
            Some(Value::Object(_)),
            None | Some(Value::Object(_)),
            None | Some(Value::Object(_)),
        )
        | (None, Some(Value::Object(_)), Some(Value::Object(_)))
            if desired.is_some() || !authoritative.contains(path) =>
        {
            let empty = Map::new();
            let desired_map = desired.and_then(Value::as_object).unwrap_or(&empty);
            let last_map = last_applied.and_then(Value::as_object).unwrap_or(&empty);
            let current_map = current.and_then(Value::as_object).unwrap_or(&empty);

            let mut keys: BTreeSet<&String> = desired_map.keys().chain(last_map.keys()).collect();
            keys.extend(
                current_map
                    .keys()
                    .filter(|key| authoritative.leads_to(&path.child(key))),
            );

            let patch: Map<String, Value> = keys
                .into_iter()
                .filter_map(|key| {
                    diff(
                        last_map.get(key),
                        desired_map.get(key),
                        current_map.get(key),
                        &path.child(key),
                        authoritative,
                    )
                    .map(|value| (key.clone(), value))
                })
                .collect();

            if patch.is_empty() {
                // An empty mapping new to desired still has to be created
                let creates_empty = desired.is_some()
                    && desired_map.is_empty()
                    && current.is_none()
                    && last_applied != desired;
                return creates_empty.then(|| Value::Object(Map::new()));
            }
            Some(Value::Object(patch))
        }
        _ => diff_leaf(last_applied, desired, current),
    }
}

fn diff_leaf(
    last_applied: Option<&Value>,
    desired: Option<&Value>,
    current: Option<&Value>,
) -> Option<Value> {
    // Desired unchanged since last apply: whatever is live stays.
    if desired == last_applied || desired == current {
        return None;
    }
    match desired {
        Some(value) => Some(value.clone()),
        // Dropped from desired; a value someone else changed since is theirs now.
        None if current != last_applied => None,
        None => Some(Value::Null),
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// Apply a JSON merge patch to a mapping in place
pub(crate) fn merge_into(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(inner_patch) => {
                let entry = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !entry.is_object() {
                    *entry = Value::Object(Map::new());
                }
                if let Value::Object(inner) = entry {
                    merge_into(inner, inner_patch);
                }
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Leaf paths touched by a patch
pub(super) fn collect_paths(patch: &Map<String, Value>, prefix: &FieldPath, out: &mut Vec<FieldPath>) {
    for (key, value) in patch {
        let path = prefix.child(key);
        match value {
            Value::Object(inner) if !inner.is_empty() => collect_paths(inner, &path, out),
            _ => out.push(path),
        }
    }
}

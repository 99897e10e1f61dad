//! Status conditions on the cluster object
//!
//! Conditions follow Kubernetes conventions: one entry per type, and
//! `lastTransitionTime` moves only when the status flips.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::cluster;
use crate::document::Document;
use crate::Error;

/// Condition reporting the outcome of the last topology reconcile pass
pub const TOPOLOGY_RECONCILED: &str = "TopologyReconciled";

/// Condition reasons used on [`TOPOLOGY_RECONCILED`]
pub mod reasons {
    /// The last pass converged every unit
    pub const RECONCILE_SUCCEEDED: &str = "ReconcileSucceeded";
    /// The last pass failed and needs attention
    pub const TOPOLOGY_RECONCILE_FAILED: &str = "TopologyReconcileFailed";
    /// The cluster's class is missing required parts
    pub const INVALID_BLUEPRINT: &str = "InvalidBlueprint";
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., TopologyReconciled)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// True if status, reason and message match, ignoring the timestamp
    fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// Conditions on the cluster's status (unreadable entries skipped)
pub fn conditions(cluster_doc: &Document) -> Vec<Condition> {
    cluster_doc
        .get(&cluster::conditions())
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// The condition of `type_`, if set
pub fn get_condition(cluster_doc: &Document, type_: &str) -> Option<Condition> {
    conditions(cluster_doc).into_iter().find(|c| c.type_ == type_)
}

/// Set `condition` on the cluster's status, replacing one of the same type.
///
/// Returns whether the document changed. When the status is unchanged the
/// previous `lastTransitionTime` is kept.
pub fn set_condition(cluster_doc: &mut Document, mut condition: Condition) -> Result<bool, Error> {
    let mut entries: Vec<Value> = cluster_doc
        .get(&cluster::conditions())
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let existing = entries.iter().position(|entry| {
        entry.get("type").and_then(Value::as_str) == Some(condition.type_.as_str())
    });

    match existing {
        Some(index) => {
            if let Ok(previous) = serde_json::from_value::<Condition>(entries[index].clone()) {
                if previous.same_state(&condition) {
                    return Ok(false);
                }
                if previous.status == condition.status {
                    condition.last_transition_time = previous.last_transition_time;
                }
            }
            entries[index] = serde_json::to_value(&condition)?;
        }
        None => entries.push(serde_json::to_value(&condition)?),
    }

    cluster_doc.set(&cluster::conditions(), Value::Array(entries));
    Ok(true)
}

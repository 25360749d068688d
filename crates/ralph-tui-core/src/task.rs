//! The `Task` type consumed from a [`TrackerPlugin`](crate::plugins::tracker::TrackerPlugin).
//!
//! Tasks are owned by the tracker; the core only ever reads them and requests
//! status changes through the tracker contract.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable task identity as reported by a tracker backend.
pub type TaskId = String;

/// Lifecycle status of a task as reported by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    /// Whether the tracker would still have the task scheduled for work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

/// A single task as surfaced by the tracker plugin.
///
/// Trackers that do not track some fields may omit them; the engine defaults
/// missing optional fields rather than erroring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    /// Lower is higher priority.
    pub priority: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub depends_on: HashSet<TaskId>,
    #[serde(default)]
    pub blocks: HashSet<TaskId>,
}

impl Task {
    /// A task is actionable when it is non-completed and has no outstanding
    /// dependency (dependency satisfaction is evaluated by the graph
    /// analyzer, not by this helper — this only checks local state).
    pub fn is_open(&self) -> bool {
        self.status == TaskStatus::Open
    }

    /// Whether this task's `type`/labels match the "refactor-like"
    /// classification used by [`crate::graph::recommend_parallelism`].
    pub fn is_refactor_like(&self) -> bool {
        Self::matches_any(&self.r#type, &self.labels, &["refactor", "cleanup", "chore"])
    }

    /// Whether this task's `type`/labels match the "test-like"
    /// classification used by [`crate::graph::recommend_parallelism`].
    pub fn is_test_like(&self) -> bool {
        Self::matches_any(&self.r#type, &self.labels, &["test", "testing", "qa"])
    }

    /// Affected file paths recorded in `metadata["files"]`, if the tracker
    /// populates that convention. Used by the parallelism recommender's
    /// file-overlap heuristic.
    pub fn affected_files(&self) -> Vec<String> {
        self.metadata
            .get("files")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn matches_any(r#type: &Option<String>, labels: &[String], needles: &[&str]) -> bool {
        let type_matches = r#type
            .as_deref()
            .map(|t| needles.iter().any(|n| t.to_lowercase().contains(n)))
            .unwrap_or(false);
        let label_matches = labels
            .iter()
            .any(|l| needles.iter().any(|n| l.to_lowercase().contains(n)));
        type_matches || label_matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: "t".to_string(),
            status: TaskStatus::Open,
            priority: 0,
            description: None,
            labels: vec![],
            r#type: None,
            assignee: None,
            parent_id: None,
            created_at: None,
            updated_at: None,
            metadata: HashMap::new(),
            depends_on: HashSet::new(),
            blocks: HashSet::new(),
        }
    }

    #[test]
    fn refactor_classification_checks_type_and_labels() {
        let mut t = task("t1");
        t.r#type = Some("refactor".to_string());
        assert!(t.is_refactor_like());

        let mut t2 = task("t2");
        t2.labels = vec!["cleanup".to_string()];
        assert!(t2.is_refactor_like());
        assert!(!t2.is_test_like());
    }

    #[test]
    fn affected_files_reads_metadata_convention() {
        let mut t = task("t1");
        t.metadata.insert(
            "files".to_string(),
            serde_json::json!(["src/a.rs", "src/b.rs"]),
        );
        assert_eq!(t.affected_files(), vec!["src/a.rs", "src/b.rs"]);
    }
}

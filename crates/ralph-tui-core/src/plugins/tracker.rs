//! The [`TrackerPlugin`] contract: lists and mutates tasks in some backend
//! (beads DB, JSON PRD file, …). Concrete trackers are external
//! collaborators; the engine only ever talks to this trait.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::task::{Task, TaskId, TaskStatus};

/// Filter accepted by [`TrackerPlugin::get_tasks`].
#[derive(Debug, Clone, Default)]
pub struct GetTasksFilter {
    pub status: Option<HashSet<TaskStatus>>,
}

/// An epic as surfaced by trackers that support grouping.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Epic {
    pub id: String,
    pub title: String,
}

/// Contract for listing and mutating tasks in a backend tracker.
///
/// `get_epics`/`set_epic_id`/`set_file_path` are optional per spec.md §6;
/// the default implementations return `None`/no-op so trackers that don't
/// support epics or reconfigurable file paths need not implement them.
/// Grounded on the teacher's `TrackerPlugin`-shaped service traits in
/// `plugins/mod.rs`.
#[async_trait]
pub trait TrackerPlugin: Send + Sync {
    /// One-time setup; `options` is a free-form JSON blob the tracker parses
    /// itself. Returns a short kind string (e.g. `"beads"`, `"prd-json"`)
    /// used by the prompt builder to select a system template.
    async fn initialize(
        &self,
        options: serde_json::Value,
    ) -> Result<String, crate::error::EngineError>;

    async fn get_tasks(&self, filter: GetTasksFilter) -> Result<Vec<Task>, crate::error::EngineError>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, crate::error::EngineError>;

    async fn update_task_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
    ) -> Result<(), crate::error::EngineError>;

    async fn get_epics(&self) -> Result<Option<Vec<Epic>>, crate::error::EngineError> {
        Ok(None)
    }

    async fn set_epic_id(&self, _id: &TaskId, _epic_id: &str) -> Result<(), crate::error::EngineError> {
        Ok(())
    }

    async fn set_file_path(&self, _path: &str) -> Result<(), crate::error::EngineError> {
        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    //! In-crate mock [`TrackerPlugin`] backed by an in-memory task list.

    use super::*;
    use parking_lot::Mutex;

    pub struct MockTrackerPlugin {
        tasks: Mutex<Vec<Task>>,
    }

    impl MockTrackerPlugin {
        pub fn new(tasks: Vec<Task>) -> Self {
            Self {
                tasks: Mutex::new(tasks),
            }
        }

        pub fn snapshot(&self) -> Vec<Task> {
            self.tasks.lock().clone()
        }
    }

    #[async_trait]
    impl TrackerPlugin for MockTrackerPlugin {
        async fn initialize(&self, _options: serde_json::Value) -> Result<String, crate::error::EngineError> {
            Ok("mock".to_string())
        }

        async fn get_tasks(&self, filter: GetTasksFilter) -> Result<Vec<Task>, crate::error::EngineError> {
            let tasks = self.tasks.lock();
            Ok(match filter.status {
                Some(statuses) => tasks
                    .iter()
                    .filter(|t| statuses.contains(&t.status))
                    .cloned()
                    .collect(),
                None => tasks.clone(),
            })
        }

        async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, crate::error::EngineError> {
            Ok(self.tasks.lock().iter().find(|t| &t.id == id).cloned())
        }

        async fn update_task_status(
            &self,
            id: &TaskId,
            status: TaskStatus,
        ) -> Result<(), crate::error::EngineError> {
            if let Some(t) = self.tasks.lock().iter_mut().find(|t| &t.id == id) {
                t.status = status;
            }
            Ok(())
        }
    }
}

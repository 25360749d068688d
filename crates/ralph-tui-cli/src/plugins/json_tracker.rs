//! `JsonFileTrackerPlugin`: a concrete [`TrackerPlugin`] backed by a flat
//! JSON array of [`Task`] records on disk — the "prd-json" tracker kind
//! spec.md §6 names alongside the beads DB backend. Both are external
//! collaborators the core never implements itself; this one exists so the
//! CLI binary has something real to wire without inventing a database
//! client. Grounded on `ralph_tui_core::config`'s atomic tmp-write-then-rename
//! save strategy.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use ralph_tui_core::error::EngineError;
use ralph_tui_core::plugins::tracker::{Epic, GetTasksFilter, TrackerPlugin};
use ralph_tui_core::task::{Task, TaskId, TaskStatus};

pub struct JsonFileTrackerPlugin {
    path: PathBuf,
    tasks: Mutex<Vec<Task>>,
}

impl JsonFileTrackerPlugin {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn load(path: &Path) -> Result<Vec<Task>, EngineError> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| EngineError::Tracker(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(EngineError::Tracker(format!("{}: {e}", path.display()))),
        }
    }

    fn persist(&self, tasks: &[Task]) -> Result<(), EngineError> {
        let content = serde_json::to_string_pretty(tasks)
            .map_err(|e| EngineError::Tracker(e.to_string()))?;
        let tmp_path = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Tracker(e.to_string()))?;
        }
        {
            use std::io::Write;
            let mut file =
                std::fs::File::create(&tmp_path).map_err(|e| EngineError::Tracker(e.to_string()))?;
            file.write_all(content.as_bytes())
                .map_err(|e| EngineError::Tracker(e.to_string()))?;
            file.sync_all().map_err(|e| EngineError::Tracker(e.to_string()))?;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(|e| EngineError::Tracker(e.to_string()))
    }
}

#[async_trait]
impl TrackerPlugin for JsonFileTrackerPlugin {
    async fn initialize(&self, _options: serde_json::Value) -> Result<String, EngineError> {
        let loaded = Self::load(&self.path)?;
        *self.tasks.lock().unwrap() = loaded;
        Ok("prd-json".to_string())
    }

    async fn get_tasks(&self, filter: GetTasksFilter) -> Result<Vec<Task>, EngineError> {
        let tasks = self.tasks.lock().unwrap();
        Ok(match filter.status {
            Some(statuses) => tasks
                .iter()
                .filter(|t| statuses.contains(&t.status))
                .cloned()
                .collect(),
            None => tasks.clone(),
        })
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, EngineError> {
        Ok(self.tasks.lock().unwrap().iter().find(|t| &t.id == id).cloned())
    }

    async fn update_task_status(&self, id: &TaskId, status: TaskStatus) -> Result<(), EngineError> {
        let snapshot = {
            let mut tasks = self.tasks.lock().unwrap();
            let Some(task) = tasks.iter_mut().find(|t| &t.id == id) else {
                return Err(EngineError::Tracker(format!("unknown task {id}")));
            };
            task.status = status;
            task.updated_at = Some(chrono::Utc::now());
            tasks.clone()
        };
        self.persist(&snapshot)
    }

    async fn get_epics(&self) -> Result<Option<Vec<Epic>>, EngineError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ralph_tui_core::task::TaskStatus;
    use std::collections::HashSet;

    fn sample_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: format!("task {id}"),
            status: TaskStatus::Open,
            priority: 0,
            description: None,
            labels: Vec::new(),
            r#type: None,
            assignee: None,
            parent_id: None,
            created_at: None,
            updated_at: None,
            metadata: Default::default(),
            depends_on: Default::default(),
            blocks: Default::default(),
        }
    }

    #[tokio::test]
    async fn initialize_on_missing_file_yields_empty_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = JsonFileTrackerPlugin::new(dir.path().join("tasks.json"));
        let kind = plugin.initialize(serde_json::Value::Null).await.unwrap();
        assert_eq!(kind, "prd-json");
        assert!(plugin.get_tasks(GetTasksFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_status_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, serde_json::to_string(&vec![sample_task("t1")]).unwrap()).unwrap();

        let plugin = JsonFileTrackerPlugin::new(path.clone());
        plugin.initialize(serde_json::Value::Null).await.unwrap();
        plugin
            .update_task_status(&"t1".to_string(), TaskStatus::Completed)
            .await
            .unwrap();

        let reloaded = JsonFileTrackerPlugin::new(path);
        reloaded.initialize(serde_json::Value::Null).await.unwrap();
        let mut statuses = HashSet::new();
        statuses.insert(TaskStatus::Completed);
        let tasks = reloaded
            .get_tasks(GetTasksFilter { status: Some(statuses) })
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "t1");
    }
}

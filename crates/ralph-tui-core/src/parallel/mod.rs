//! Parallel executor (component J): fans a backlog out across N worktree-isolated
//! [`ExecutionEngine`](crate::engine::ExecutionEngine) workers, respecting the
//! task graph's depth ordering, then serializes integration through the
//! [`MergeEngine`], per spec.md §4.6. Grounded on the teacher's
//! `orchestrator::{ParallelExecutionConfig, FailureStrategy, ExecutionMode}`
//! shape, generalized from a fixed agent roster to dynamic, graph-ordered
//! task groups.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify, RwLock, Semaphore};
use tracing::{instrument, warn};

use crate::config::EngineConfig;
use crate::engine::{ExecutionEngine, InitializeOptions, StopReason};
use crate::error::EngineError;
use crate::graph::{analyze_task_graph, recommend_parallelism};
use crate::log_sink::{EngineEvent, EventBus, ParallelEvent};
use crate::merge::{MergeCandidate, MergeEngine, MergeResult};
use crate::plugins::agent::AgentPlugin;
use crate::plugins::tracker::{GetTasksFilter, TrackerPlugin};
use crate::task::{Task, TaskId};
use crate::worktree::{WorktreeLimits, WorktreePool};

/// Static configuration for one [`ParallelExecutor`] run.
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    pub max_workers: usize,
    pub branch_prefix: String,
    pub host_branch: String,
    pub fail_fast_merge: bool,
    /// Iteration budget handed to each worker's inner [`ExecutionEngine`].
    /// `0` means unbounded, matching [`crate::engine::EngineState::can_continue`].
    pub per_task_max_iterations: u64,
    pub worktree_limits: WorktreeLimits,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            branch_prefix: "ralph".to_string(),
            host_branch: "main".to_string(),
            fail_fast_merge: false,
            per_task_max_iterations: 10,
            worktree_limits: WorktreeLimits::default(),
        }
    }
}

/// Outcome of one worker's attempt at one task, per spec.md §3's
/// `WorkerResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub task_id: TaskId,
    pub worker_id: String,
    pub branch: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub commit_count: usize,
    #[serde(default)]
    pub merged: bool,
    #[serde(default)]
    pub had_conflicts: bool,
}

/// Lifecycle status of a [`ParallelExecutor`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParallelStatus {
    Idle,
    Running,
    Pausing,
    Paused,
    Stopping,
    Stopped,
    Completed,
}

/// Read-only snapshot of the executor's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelState {
    pub status: ParallelStatus,
    pub total_workers: usize,
    pub completed_workers: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub current_depth: usize,
    pub total_depth: usize,
    pub results: Vec<WorkerResult>,
}

impl ParallelState {
    fn new() -> Self {
        Self {
            status: ParallelStatus::Idle,
            total_workers: 0,
            completed_workers: 0,
            succeeded: 0,
            failed: 0,
            current_depth: 0,
            total_depth: 0,
            results: Vec::new(),
        }
    }
}

/// Drives many single-task [`ExecutionEngine`]s concurrently, one per
/// worktree, advancing through the task graph depth by depth and merging
/// each worker's branch serially as it finishes.
pub struct ParallelExecutor {
    project_dir: PathBuf,
    tracker: Arc<dyn TrackerPlugin>,
    agent: Arc<dyn AgentPlugin>,
    config: ParallelConfig,
    worktrees: Arc<WorktreePool>,
    merge_engine: Arc<MergeEngine>,
    bus: Arc<EventBus>,
    parallel_bus: Arc<ParallelEventBus>,
    state: RwLock<ParallelState>,
    pause_requested: AtomicBool,
    stop_requested: AtomicBool,
    resume_notify: Notify,
}

/// In-memory pub/sub of [`ParallelEvent`]s, mirroring [`EventBus`] but for
/// the executor's own aggregated event vocabulary rather than a worker's
/// inner engine events.
pub struct ParallelEventBus {
    sender: broadcast::Sender<ParallelEvent>,
}

impl ParallelEventBus {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    fn publish(&self, event: ParallelEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ParallelEvent> {
        self.sender.subscribe()
    }
}

impl ParallelExecutor {
    pub fn new(
        project_dir: PathBuf,
        tracker: Arc<dyn TrackerPlugin>,
        agent: Arc<dyn AgentPlugin>,
        config: ParallelConfig,
    ) -> Self {
        let worktrees = Arc::new(WorktreePool::new(
            project_dir.clone(),
            config.branch_prefix.clone(),
            config.worktree_limits,
        ));
        let merge_engine = Arc::new(MergeEngine::new(
            project_dir.clone(),
            config.host_branch.clone(),
            config.fail_fast_merge,
        ));
        Self {
            project_dir,
            tracker,
            agent,
            config,
            worktrees,
            merge_engine,
            bus: Arc::new(EventBus::new()),
            parallel_bus: Arc::new(ParallelEventBus::new()),
            state: RwLock::new(ParallelState::new()),
            pause_requested: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            resume_notify: Notify::new(),
        }
    }

    /// Subscribe to this run's aggregated [`ParallelEvent`] stream. The
    /// executor also forwards every worker's [`EngineEvent`]s onto the same
    /// channel type's sibling bus is not exposed here; callers interested in
    /// per-worker iteration detail should subscribe to that worker's own
    /// engine instead (future work, not required by the current wire
    /// protocol).
    pub fn on(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Subscribe to this run's aggregated [`ParallelEvent`] stream (merge
    /// lifecycle and final completion), per spec.md §6's `parallel_event`
    /// wire wrapping.
    pub fn on_parallel(&self) -> broadcast::Receiver<ParallelEvent> {
        self.parallel_bus.subscribe()
    }

    pub async fn get_state(&self) -> ParallelState {
        self.state.read().await.clone()
    }

    pub fn pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
    }

    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
    }

    /// Run every open task (or, if `task_ids` is given, exactly those tasks)
    /// through the graph-ordered worker/merge pipeline to completion or
    /// interruption.
    #[instrument(skip_all, fields(project = %self.project_dir.display()))]
    pub async fn execute(&self, task_ids: Option<Vec<TaskId>>) -> Result<Vec<WorkerResult>, EngineError> {
        let all_tasks = self
            .tracker
            .get_tasks(GetTasksFilter::default())
            .await
            .map_err(|e| EngineError::Tracker(e.to_string()))?;

        let scoped: Vec<Task> = match task_ids {
            Some(ids) => all_tasks
                .into_iter()
                .filter(|t| ids.contains(&t.id))
                .collect(),
            None => all_tasks.into_iter().filter(|t| t.is_open()).collect(),
        };

        let analysis = analyze_task_graph(&scoped);
        let recommendation = recommend_parallelism(&scoped, &analysis, self.config.max_workers);
        let worker_cap = recommendation.recommended_workers.max(1);

        {
            let mut state = self.state.write().await;
            state.status = ParallelStatus::Running;
            state.total_workers = scoped.len();
            state.total_depth = analysis.groups.len();
        }

        let semaphore = Arc::new(Semaphore::new(worker_cap));
        let mut all_results = Vec::new();

        for (depth, group) in analysis.groups.iter().enumerate() {
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            self.wait_if_paused().await;
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            self.state.write().await.current_depth = depth;

            let mut handles = Vec::new();
            for task in &group.tasks {
                let permit = semaphore.clone().acquire_owned().await.map_err(|_| {
                    EngineError::InitializationFailed("worker semaphore closed".to_string())
                })?;
                let task = task.clone();
                let this_tracker = self.tracker.clone();
                let this_agent = self.agent.clone();
                let project_dir = self.project_dir.clone();
                let worktrees = self.worktrees.clone();
                let merge_engine = self.merge_engine.clone();
                let bus = self.bus.clone();
                let parallel_bus = self.parallel_bus.clone();
                let config = self.config.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    run_one_worker(
                        project_dir,
                        task,
                        this_tracker,
                        this_agent,
                        worktrees,
                        merge_engine,
                        bus,
                        parallel_bus,
                        config,
                    )
                    .await
                }));
            }

            for handle in handles {
                let result = handle.await.map_err(|e| {
                    EngineError::AgentRuntime(format!("worker task panicked: {e}"))
                })??;

                let mut state = self.state.write().await;
                state.completed_workers += 1;
                if result.success {
                    state.succeeded += 1;
                } else {
                    state.failed += 1;
                }
                state.results.push(result.clone());
                all_results.push(result);
            }
        }

        let final_status = if self.stop_requested.load(Ordering::SeqCst) {
            ParallelStatus::Stopped
        } else {
            ParallelStatus::Completed
        };
        self.state.write().await.status = final_status;

        let succeeded = all_results.iter().filter(|r| r.success).count();
        let failed = all_results.len() - succeeded;
        self.parallel_bus.publish(ParallelEvent::ParallelCompleted {
            total_workers: all_results.len(),
            succeeded,
            failed,
        });

        Ok(all_results)
    }

    async fn wait_if_paused(&self) {
        if !self.pause_requested.load(Ordering::SeqCst) {
            return;
        }
        self.state.write().await.status = ParallelStatus::Paused;
        self.resume_notify.notified().await;
        self.state.write().await.status = ParallelStatus::Running;
    }
}

async fn run_one_worker(
    host_project_dir: PathBuf,
    task: Task,
    tracker: Arc<dyn TrackerPlugin>,
    agent: Arc<dyn AgentPlugin>,
    worktrees: Arc<WorktreePool>,
    merge_engine: Arc<MergeEngine>,
    bus: Arc<EventBus>,
    parallel_bus: Arc<ParallelEventBus>,
    config: ParallelConfig,
) -> Result<WorkerResult, EngineError> {
    let worker_id = format!("worker-{}", uuid::Uuid::new_v4());

    let info = worktrees
        .acquire(&worker_id, &task.id)
        .map_err(|e| EngineError::InitializationFailed(e.to_string()))?;

    let mut engine_config = EngineConfig::default();
    engine_config.max_iterations = config.per_task_max_iterations;

    let engine = ExecutionEngine::new(
        info.path.clone(),
        uuid::Uuid::new_v4().to_string(),
        tracker,
        vec![("primary".to_string(), agent)],
        engine_config,
        Some(task.clone()),
    );

    engine
        .initialize(InitializeOptions { preflight: false })
        .await?;

    let outcome = engine.start().await;

    let commit_count = worktrees.get_commit_count(&worker_id).unwrap_or(0);

    let (success, error) = match &outcome {
        Ok(StopReason::Completed) => (true, None),
        Ok(other) => (false, Some(format!("stopped early: {other:?}"))),
        Err(e) => (false, Some(e.to_string())),
    };

    let branch = info.branch.clone();
    let mut merged = false;
    let mut had_conflicts = false;

    if success && commit_count > 0 {
        let op = merge_engine.enqueue(MergeCandidate {
            task_id: task.id.clone(),
            branch: branch.clone(),
        });
        bus.publish(EngineEvent::EngineWarning {
            message: format!("merge {} queued for task {}", op.id, task.id),
        });
        parallel_bus.publish(ParallelEvent::MergeQueued {
            operation_id: op.id.clone(),
        });
        parallel_bus.publish(ParallelEvent::MergeStarted {
            operation_id: op.id.clone(),
        });
        if let Some(result) = merge_engine.process_next() {
            merged = result.success;
            had_conflicts = result.had_conflicts;
            let event = if result.success {
                ParallelEvent::MergeCompleted {
                    operation_id: op.id.clone(),
                    commit_sha: result.operation.commit_sha.clone().unwrap_or_default(),
                }
            } else if result.had_conflicts {
                ParallelEvent::MergeConflict {
                    operation_id: op.id.clone(),
                    files: result.operation.files_changed.clone().unwrap_or_default(),
                }
            } else {
                ParallelEvent::MergeFailed {
                    operation_id: op.id.clone(),
                    error: result
                        .error
                        .clone()
                        .unwrap_or_else(|| "merge failed".to_string()),
                }
            };
            parallel_bus.publish(event);
        }
    }

    if let Err(e) = worktrees.release(&worker_id) {
        warn!(worker_id = %worker_id, error = %e, "failed to release worktree");
    }

    Ok(WorkerResult {
        task_id: task.id,
        worker_id,
        branch,
        success,
        error,
        commit_count,
        merged,
        had_conflicts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::agent::mock::{MockAgentPlugin, ScriptedRun};
    use crate::plugins::tracker::mock::MockTrackerPlugin;
    use std::collections::{HashMap as Map, HashSet};

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: format!("Task {id}"),
            status: crate::task::TaskStatus::Open,
            priority: 0,
            description: None,
            labels: vec![],
            r#type: None,
            assignee: None,
            parent_id: None,
            created_at: None,
            updated_at: None,
            metadata: Map::new(),
            depends_on: HashSet::new(),
            blocks: HashSet::new(),
        }
    }

    fn init_repo_with_commit(dir: &std::path::Path) {
        let repo = git2::Repository::init(dir).unwrap();
        let signature = git2::Signature::now("test", "test@example.com").unwrap();
        let tree_id = {
            let mut index = repo.index().unwrap();
            index.write_tree().unwrap()
        };
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &signature, &signature, "initial", &tree, &[])
            .unwrap();
    }

    #[tokio::test]
    async fn execute_with_no_open_tasks_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path());
        let tracker = Arc::new(MockTrackerPlugin::new(vec![]));
        let agent = Arc::new(MockAgentPlugin::new(vec![ScriptedRun::default()]));
        let executor = ParallelExecutor::new(
            dir.path().to_path_buf(),
            tracker,
            agent,
            ParallelConfig::default(),
        );

        let results = executor.execute(None).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(executor.get_state().await.status, ParallelStatus::Completed);
    }

    #[tokio::test]
    async fn pause_then_resume_allows_completion() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path());
        let tracker = Arc::new(MockTrackerPlugin::new(vec![]));
        let agent = Arc::new(MockAgentPlugin::new(vec![]));
        let executor = Arc::new(ParallelExecutor::new(
            dir.path().to_path_buf(),
            tracker,
            agent,
            ParallelConfig::default(),
        ));

        executor.pause();
        executor.resume();
        let results = executor.execute(None).await.unwrap();
        assert!(results.is_empty());
    }
}

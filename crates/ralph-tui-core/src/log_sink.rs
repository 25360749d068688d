//! Structured log sink (component E): per-iteration append-only log files
//! plus an in-memory event bus. Grounded on the teacher's
//! `event_bus::{traits, tokio_bus}` pub/sub pattern, generalized from a
//! single flat `AppEvent` enum to the engine's and executor's event
//! vocabulary from spec.md §4.2/§4.6, and on its iteration-log naming
//! convention from spec.md §6.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::iteration::IterationResult;
use crate::task::{Task, TaskId};

const DEFAULT_CAPACITY: usize = 1024;

/// Every event the engine and parallel executor publish, per spec.md §4.2's
/// event list and §4.6's aggregated parallel events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    EngineStarted,
    EnginePaused,
    EngineResumed,
    EngineStopped { reason: String },
    EngineWarning { message: String },
    EngineIterationsAdded { count: u64, new_max: u64 },
    EngineIterationsRemoved { count: u64, new_max: u64 },

    TaskSelected { task: Task },
    TaskActivated { task_id: TaskId },
    TaskCompleted { task_id: TaskId },
    TaskAutoCommitted { task_id: TaskId, commit_sha: String },

    IterationStarted { iteration: u64, task_id: TaskId },
    IterationCompleted { result: Box<IterationResult> },
    IterationFailed { iteration: u64, task_id: TaskId, error: String },
    IterationRetrying { iteration: u64, attempt: u32 },
    IterationSkipped { iteration: u64, reason: String },

    AgentOutput { execution_id: String, chunk: String, stream: OutputStream },
    AgentUsage { execution_id: String, input_tokens: u64, output_tokens: u64 },
    AgentModel { execution_id: String, model: String },
    AgentSwitched { reason: String, to_plugin: String },
    AgentAllLimited,
    AgentRecoveryAttempted { success: bool },

    TasksRefreshed { total: u64 },
    AllComplete,
}

impl EngineEvent {
    /// The wire `type` tag for this variant — the same string
    /// `#[serde(tag = "type")]` would serialize, used so subscribers can
    /// filter the event stream by type (spec.md §4.7's
    /// `subscribe{eventTypes?}`) without round-tripping through JSON.
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::EngineStarted => "engine_started",
            EngineEvent::EnginePaused => "engine_paused",
            EngineEvent::EngineResumed => "engine_resumed",
            EngineEvent::EngineStopped { .. } => "engine_stopped",
            EngineEvent::EngineWarning { .. } => "engine_warning",
            EngineEvent::EngineIterationsAdded { .. } => "engine_iterations_added",
            EngineEvent::EngineIterationsRemoved { .. } => "engine_iterations_removed",
            EngineEvent::TaskSelected { .. } => "task_selected",
            EngineEvent::TaskActivated { .. } => "task_activated",
            EngineEvent::TaskCompleted { .. } => "task_completed",
            EngineEvent::TaskAutoCommitted { .. } => "task_auto_committed",
            EngineEvent::IterationStarted { .. } => "iteration_started",
            EngineEvent::IterationCompleted { .. } => "iteration_completed",
            EngineEvent::IterationFailed { .. } => "iteration_failed",
            EngineEvent::IterationRetrying { .. } => "iteration_retrying",
            EngineEvent::IterationSkipped { .. } => "iteration_skipped",
            EngineEvent::AgentOutput { .. } => "agent_output",
            EngineEvent::AgentUsage { .. } => "agent_usage",
            EngineEvent::AgentModel { .. } => "agent_model",
            EngineEvent::AgentSwitched { .. } => "agent_switched",
            EngineEvent::AgentAllLimited => "agent_all_limited",
            EngineEvent::AgentRecoveryAttempted { .. } => "agent_recovery_attempted",
            EngineEvent::TasksRefreshed { .. } => "tasks_refreshed",
            EngineEvent::AllComplete => "all_complete",
        }
    }
}

/// Which stream an `AgentOutput` chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Aggregated events emitted by the parallel executor (component J), wrapped
/// per spec.md §6's `parallel_event{orchestrationId, event}` wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParallelEvent {
    MergeQueued { operation_id: String },
    MergeStarted { operation_id: String },
    MergeCompleted { operation_id: String, commit_sha: String },
    MergeConflict { operation_id: String, files: Vec<String> },
    MergeFailed { operation_id: String, error: String },
    ParallelCompleted { total_workers: usize, succeeded: usize, failed: usize },
}

impl ParallelEvent {
    /// The wire `type` tag for this variant, mirrored for the same reason
    /// as [`EngineEvent::event_type`].
    pub fn event_type(&self) -> &'static str {
        match self {
            ParallelEvent::MergeQueued { .. } => "merge_queued",
            ParallelEvent::MergeStarted { .. } => "merge_started",
            ParallelEvent::MergeCompleted { .. } => "merge_completed",
            ParallelEvent::MergeConflict { .. } => "merge_conflict",
            ParallelEvent::MergeFailed { .. } => "merge_failed",
            ParallelEvent::ParallelCompleted { .. } => "parallel_completed",
        }
    }
}

/// In-memory pub/sub of [`EngineEvent`]s, backed by `tokio::sync::broadcast`.
/// Mirrors the teacher's `TokioBroadcastBus`.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Errors (no subscribers) are not reported; a log
    /// sink with zero listeners is a valid, common state.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Appends each iteration's textual record to
/// `.ralph-tui/iterations/{sessionId}-{n}-{taskId}.log`. One file per
/// iteration, never rewritten after being closed — the log sink owns
/// iteration logs for the lifetime of the session.
pub struct IterationLogSink {
    iterations_dir: PathBuf,
}

impl IterationLogSink {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            iterations_dir: project_dir.join(".ralph-tui").join("iterations"),
        }
    }

    fn log_path(&self, session_id: &str, iteration: u64, task_id: &str) -> PathBuf {
        self.iterations_dir
            .join(format!("{session_id}-{iteration}-{task_id}.log"))
    }

    /// Append `content` to this iteration's log file, creating the
    /// `iterations/` directory and file on first write.
    pub fn append(
        &self,
        session_id: &str,
        iteration: u64,
        task_id: &str,
        content: &str,
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.iterations_dir)?;
        let path = self.log_path(session_id, iteration, task_id);
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    /// Read back a completed iteration's full log, if present.
    pub fn read(
        &self,
        session_id: &str,
        iteration: u64,
        task_id: &str,
    ) -> std::io::Result<Option<String>> {
        match std::fs::read_to_string(self.log_path(session_id, iteration, task_id)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_publish_then_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::EngineStarted);
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::EngineStarted));
    }

    #[test]
    fn iteration_log_appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let sink = IterationLogSink::new(dir.path());

        sink.append("s1", 1, "t1", "first chunk\n").unwrap();
        sink.append("s1", 1, "t1", "second chunk\n").unwrap();

        let content = sink.read("s1", 1, "t1").unwrap().unwrap();
        assert_eq!(content, "first chunk\nsecond chunk\n");
    }

    #[test]
    fn iteration_log_read_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let sink = IterationLogSink::new(dir.path());
        assert!(sink.read("s1", 1, "t1").unwrap().is_none());
    }
}

//! The [`AgentPlugin`] contract: launches an agent CLI subprocess, streams its
//! output, and allows interruption. Concrete agent CLIs are external
//! collaborators; the engine only ever talks to this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static metadata an agent plugin is initialized with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMeta {
    pub name: String,
    #[serde(default)]
    pub binary_path: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
}

/// Result of [`AgentPlugin::detect`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectResult {
    pub available: bool,
}

/// Result of [`AgentPlugin::preflight`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightResult {
    pub success: bool,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
}

/// What a plugin's subprocess needs visible inside a sandbox, per
/// [`AgentPlugin::sandbox_requirements`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRequirements {
    pub auth_paths: Vec<String>,
    pub binary_paths: Vec<String>,
    pub runtime_paths: Vec<String>,
    pub requires_network: bool,
}

/// Per-execution options passed to [`AgentPlugin::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub model: Option<String>,
    pub variant: Option<String>,
}

/// One chunk of streamed subprocess output, delivered via the channel handed
/// back in [`ExecutionHandle`].
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Stdout(String),
    Stderr(String),
}

/// A live or completed agent execution.
pub struct ExecutionHandle {
    pub execution_id: String,
    /// Resolves once the subprocess exits or is interrupted.
    pub completion: tokio::sync::oneshot::Receiver<crate::iteration::AgentResult>,
    /// Streamed stdout/stderr chunks, in arrival order.
    pub stream: tokio::sync::mpsc::UnboundedReceiver<StreamChunk>,
    interrupt_tx: tokio::sync::mpsc::UnboundedSender<()>,
    running: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl ExecutionHandle {
    pub fn new(
        execution_id: String,
        completion: tokio::sync::oneshot::Receiver<crate::iteration::AgentResult>,
        stream: tokio::sync::mpsc::UnboundedReceiver<StreamChunk>,
        interrupt_tx: tokio::sync::mpsc::UnboundedSender<()>,
        running: std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Self {
            execution_id,
            completion,
            stream,
            interrupt_tx,
            running,
        }
    }

    pub fn interrupt(&self) {
        let _ = self.interrupt_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Contract for launching an AI coding agent CLI and observing its output.
///
/// Implementations own subprocess lifecycle; the engine never shells out
/// directly. Grounded on the teacher's `agents::spawner::SubagentSpawner`
/// trait shape, generalized from subagent fan-out to a single long-running
/// per-iteration execution.
#[async_trait]
pub trait AgentPlugin: Send + Sync {
    /// One-time setup using plugin-specific metadata (binary path, model).
    async fn initialize(&self, meta: AgentMeta) -> Result<(), crate::error::EngineError>;

    /// Whether the underlying CLI binary is present and invocable.
    async fn detect(&self) -> DetectResult;

    /// A cheap dry run used before committing to a full iteration.
    async fn preflight(&self, timeout: Duration) -> PreflightResult;

    /// Launch the agent with `prompt`, optionally scoped to `files`.
    async fn execute(
        &self,
        prompt: String,
        files: Option<Vec<String>>,
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, crate::error::EngineError>;

    /// Interrupt one running execution by id. Returns `false` if it was not
    /// running (already completed, or unknown id).
    async fn interrupt(&self, execution_id: &str) -> bool;

    /// Interrupt every execution this plugin instance currently tracks.
    async fn interrupt_all(&self);

    /// Paths and network access this plugin's subprocess needs inside a
    /// sandbox wrapper. The engine passes this through opaquely.
    fn sandbox_requirements(&self) -> SandboxRequirements;
}

#[cfg(test)]
pub mod mock {
    //! In-crate mock [`AgentPlugin`] used by engine/executor tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    /// Scripted response the mock returns for the next `execute` call.
    #[derive(Debug, Clone)]
    pub struct ScriptedRun {
        pub stdout: String,
        pub exit_code: Option<i32>,
        pub delay: Duration,
    }

    impl Default for ScriptedRun {
        fn default() -> Self {
            Self {
                stdout: "done".to_string(),
                exit_code: Some(0),
                delay: Duration::from_millis(0),
            }
        }
    }

    /// A deterministic [`AgentPlugin`] driven by a queue of [`ScriptedRun`]s.
    pub struct MockAgentPlugin {
        runs: parking_lot::Mutex<std::collections::VecDeque<ScriptedRun>>,
        executions: AtomicU64,
        pub interrupted_all: AtomicBool,
        interrupt_txs:
            parking_lot::Mutex<std::collections::HashMap<String, tokio::sync::mpsc::UnboundedSender<()>>>,
    }

    impl MockAgentPlugin {
        pub fn new(runs: Vec<ScriptedRun>) -> Self {
            Self {
                runs: parking_lot::Mutex::new(runs.into_iter().collect()),
                executions: AtomicU64::new(0),
                interrupted_all: AtomicBool::new(false),
                interrupt_txs: parking_lot::Mutex::new(std::collections::HashMap::new()),
            }
        }

        pub fn executions(&self) -> u64 {
            self.executions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AgentPlugin for MockAgentPlugin {
        async fn initialize(&self, _meta: AgentMeta) -> Result<(), crate::error::EngineError> {
            Ok(())
        }

        async fn detect(&self) -> DetectResult {
            DetectResult { available: true }
        }

        async fn preflight(&self, _timeout: Duration) -> PreflightResult {
            PreflightResult {
                success: true,
                duration_ms: Some(1),
                error: None,
                suggestion: None,
            }
        }

        async fn execute(
            &self,
            _prompt: String,
            _files: Option<Vec<String>>,
            _options: ExecuteOptions,
        ) -> Result<ExecutionHandle, crate::error::EngineError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let run = self
                .runs
                .lock()
                .pop_front()
                .unwrap_or_else(ScriptedRun::default);

            let execution_id = uuid::Uuid::new_v4().to_string();
            let (completion_tx, completion_rx) = tokio::sync::oneshot::channel();
            let (stream_tx, stream_rx) = tokio::sync::mpsc::unbounded_channel();
            let (interrupt_tx, mut interrupt_rx) = tokio::sync::mpsc::unbounded_channel();
            self.interrupt_txs
                .lock()
                .insert(execution_id.clone(), interrupt_tx.clone());
            let running = Arc::new(AtomicBool::new(true));
            let running_task = running.clone();

            let started_at = chrono::Utc::now();
            let exec_id = execution_id.clone();
            tokio::spawn(async move {
                let interrupted = tokio::select! {
                    _ = tokio::time::sleep(run.delay) => false,
                    _ = interrupt_rx.recv() => true,
                };
                let _ = stream_tx.send(StreamChunk::Stdout(run.stdout.clone()));
                running_task.store(false, Ordering::SeqCst);
                let ended_at = chrono::Utc::now();
                let _ = completion_tx.send(crate::iteration::AgentResult {
                    execution_id: exec_id,
                    exit_code: if interrupted { None } else { run.exit_code },
                    stdout: run.stdout,
                    stderr: String::new(),
                    interrupted,
                    started_at,
                    ended_at,
                    duration_ms: (ended_at - started_at).num_milliseconds(),
                });
            });

            Ok(ExecutionHandle::new(
                execution_id,
                completion_rx,
                stream_rx,
                interrupt_tx,
                running,
            ))
        }

        async fn interrupt(&self, execution_id: &str) -> bool {
            match self.interrupt_txs.lock().remove(execution_id) {
                Some(tx) => tx.send(()).is_ok(),
                None => false,
            }
        }

        async fn interrupt_all(&self) {
            self.interrupted_all.store(true, Ordering::SeqCst);
        }

        fn sandbox_requirements(&self) -> SandboxRequirements {
            SandboxRequirements::default()
        }
    }
}

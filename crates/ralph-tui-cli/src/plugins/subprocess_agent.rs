//! `SubprocessAgentPlugin`: a concrete [`AgentPlugin`] that launches a
//! configured external command, feeds it the prompt on stdin, and streams
//! its stdout/stderr back line-by-line. Concrete agent CLIs (claude, codex,
//! …) are external collaborators per spec.md §1; this plugin is the generic
//! "run whatever binary the operator configured" shim the CLI wires by
//! default. Grounded on `ralph_tui_core::plugins::agent::mock::MockAgentPlugin`'s
//! channel plumbing, generalized from a scripted response to a real
//! `tokio::process::Child`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ralph_tui_core::error::EngineError;
use ralph_tui_core::iteration::AgentResult;
use ralph_tui_core::plugins::agent::{
    AgentMeta, AgentPlugin, DetectResult, ExecuteOptions, ExecutionHandle, PreflightResult,
    SandboxRequirements, StreamChunk,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

struct TrackedExecution {
    running: Arc<AtomicBool>,
    interrupt_tx: mpsc::UnboundedSender<()>,
}

/// One configured agent subprocess: a program and a fixed argument template.
/// The prompt is always delivered on stdin so the template never needs a
/// `{prompt}` substitution token.
pub struct SubprocessAgentPlugin {
    program: String,
    args: Vec<String>,
    executions: Arc<std::sync::Mutex<HashMap<String, TrackedExecution>>>,
}

impl SubprocessAgentPlugin {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            executions: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl AgentPlugin for SubprocessAgentPlugin {
    async fn initialize(&self, _meta: AgentMeta) -> Result<(), EngineError> {
        Ok(())
    }

    async fn detect(&self) -> DetectResult {
        let available = Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false);
        DetectResult { available }
    }

    async fn preflight(&self, timeout: std::time::Duration) -> PreflightResult {
        let started = std::time::Instant::now();
        match tokio::time::timeout(timeout, self.detect()).await {
            Ok(result) if result.available => PreflightResult {
                success: true,
                duration_ms: Some(started.elapsed().as_millis() as i64),
                error: None,
                suggestion: None,
            },
            Ok(_) => PreflightResult {
                success: false,
                duration_ms: Some(started.elapsed().as_millis() as i64),
                error: Some(format!("'{}' is not invocable", self.program)),
                suggestion: Some("check the configured agent binary path".to_string()),
            },
            Err(_) => PreflightResult {
                success: false,
                duration_ms: Some(timeout.as_millis() as i64),
                error: Some("preflight timed out".to_string()),
                suggestion: None,
            },
        }
    }

    async fn execute(
        &self,
        prompt: String,
        _files: Option<Vec<String>>,
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, EngineError> {
        let mut args = self.args.clone();
        if let Some(model) = &options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(variant) = &options.variant {
            args.push("--variant".to_string());
            args.push(variant.clone());
        }

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::AgentSpawn(format!("{}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::AgentSpawn("subprocess did not expose stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::AgentSpawn("subprocess did not expose stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::AgentSpawn("subprocess did not expose stderr".to_string()))?;

        let execution_id = uuid::Uuid::new_v4().to_string();
        let running = Arc::new(AtomicBool::new(true));

        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = tokio::sync::oneshot::channel();
        let (interrupt_tx, mut interrupt_rx) = mpsc::unbounded_channel();

        self.executions.lock().unwrap().insert(
            execution_id.clone(),
            TrackedExecution {
                running: running.clone(),
                interrupt_tx: interrupt_tx.clone(),
            },
        );

        tokio::spawn(async move {
            if stdin.write_all(prompt.as_bytes()).await.is_err() {
                return;
            }
            let _ = stdin.shutdown().await;
        });

        let stdout_tx = stream_tx.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut buf = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.push_str(&line);
                buf.push('\n');
                let _ = stdout_tx.send(StreamChunk::Stdout(line));
            }
            buf
        });

        let stderr_tx = stream_tx;
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut buf = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.push_str(&line);
                buf.push('\n');
                let _ = stderr_tx.send(StreamChunk::Stderr(line));
            }
            buf
        });

        let running_task = running.clone();
        let execution_id_task = execution_id.clone();
        let executions = self.executions.clone();
        let execution_id_cleanup = execution_id.clone();
        tokio::spawn(async move {
            let started_at = chrono::Utc::now();
            let (interrupted, exit_code) = tokio::select! {
                status = child.wait() => (false, status.ok().and_then(|s| s.code())),
                _ = interrupt_rx.recv() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    (true, None)
                }
            };
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            running_task.store(false, Ordering::SeqCst);
            executions.lock().unwrap().remove(&execution_id_cleanup);
            let ended_at = chrono::Utc::now();
            let _ = completion_tx.send(AgentResult {
                execution_id: execution_id_task,
                exit_code,
                stdout,
                stderr,
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
        let tx = {
            let guard = self.executions.lock().unwrap();
            guard.get(execution_id).map(|e| e.interrupt_tx.clone())
        };
        match tx {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    async fn interrupt_all(&self) {
        let senders: Vec<_> = self
            .executions
            .lock()
            .unwrap()
            .values()
            .map(|e| e.interrupt_tx.clone())
            .collect();
        for tx in senders {
            let _ = tx.send(());
        }
    }

    fn sandbox_requirements(&self) -> SandboxRequirements {
        SandboxRequirements {
            requires_network: true,
            ..Default::default()
        }
    }
}

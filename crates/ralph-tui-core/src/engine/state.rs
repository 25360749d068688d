//! [`EngineState`] and its constituent snapshot types, per spec.md §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::iteration::IterationResult;
use crate::task::Task;

/// Engine lifecycle status, per spec.md §4.2's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineStatus {
    Idle,
    Selecting,
    Executing,
    Pausing,
    Paused,
    Stopping,
    Stopped,
    IdleComplete,
    Error,
}

/// Why the currently-active agent plugin was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentSelectReason {
    Primary,
    Fallback,
    Recovery,
}

/// Snapshot of which agent plugin is currently active and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveAgentState {
    pub plugin: String,
    pub reason: AgentSelectReason,
    pub since: DateTime<Utc>,
}

/// Per-agent rate-limit tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    pub limited: bool,
    #[serde(default)]
    pub retry_after: Option<DateTime<Utc>>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            limited: false,
            retry_after: None,
        }
    }
}

/// Status of one node in the subagent invocation tree, tracked by parsing
/// `[[subagent:start/end]]` markers per SPEC_FULL.md §4.2b.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Running,
    Ok,
    Error,
}

/// One node in the subagent invocation tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentNode {
    pub id: String,
    pub label: String,
    pub status: SubagentStatus,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub children: Vec<SubagentNode>,
}

/// Full read-only snapshot of one engine's state, per spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    pub status: EngineStatus,
    pub current_iteration: u64,
    /// `0` means unbounded.
    pub max_iterations: u64,
    #[serde(default)]
    pub current_task: Option<Task>,
    pub total_tasks: u64,
    pub tasks_completed: u64,
    pub iterations: Vec<IterationResult>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub current_output: String,
    pub current_stderr: String,
    #[serde(default)]
    pub active_agent: Option<ActiveAgentState>,
    #[serde(default)]
    pub rate_limit_state: std::collections::HashMap<String, RateLimitState>,
    #[serde(default)]
    pub current_model: Option<String>,
    #[serde(default)]
    pub subagent_tree: Vec<SubagentNode>,
}

impl EngineState {
    pub fn new(max_iterations: u64, total_tasks: u64) -> Self {
        Self {
            status: EngineStatus::Idle,
            current_iteration: 0,
            max_iterations,
            current_task: None,
            total_tasks,
            tasks_completed: 0,
            iterations: Vec::new(),
            started_at: None,
            current_output: String::new(),
            current_stderr: String::new(),
            active_agent: None,
            rate_limit_state: std::collections::HashMap::new(),
            current_model: None,
            subagent_tree: Vec::new(),
        }
    }

    /// Whether the engine's iteration budget allows one more iteration.
    pub fn can_continue(&self) -> bool {
        self.max_iterations == 0 || self.current_iteration < self.max_iterations
    }
}

/// Why the iteration loop stopped, surfaced on `engine:stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NoTasks,
    MaxIterations,
    Completed,
    Interrupted,
    Error,
    RateLimited,
}

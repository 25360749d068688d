//! Per-iteration result types: [`IterationResult`], [`AgentResult`], [`TokenUsageSummary`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Outcome of one agent subprocess execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub execution_id: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Normalized token usage counters for one iteration, reported by the agent
/// plugin and/or derived from the engine's own stream parsing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub context_window_tokens: Option<u64>,
    #[serde(default)]
    pub remaining_context_tokens: Option<u64>,
    #[serde(default)]
    pub remaining_context_percent: Option<f32>,
    pub events: u64,
}

impl TokenUsageSummary {
    /// Fold in a new usage tally, normalizing `total_tokens` to
    /// `input_tokens + output_tokens` when the agent reported zero for it.
    pub fn merge(&mut self, input_tokens: u64, output_tokens: u64) {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        let summed = input_tokens + output_tokens;
        self.total_tokens = summed;
        self.events += 1;
    }

    /// Recompute the remaining-context fields given a known context window.
    pub fn with_context_window(mut self, context_window_tokens: u64) -> Self {
        self.context_window_tokens = Some(context_window_tokens);
        let remaining = context_window_tokens.saturating_sub(self.total_tokens);
        self.remaining_context_tokens = Some(remaining);
        self.remaining_context_percent =
            Some((remaining as f32 / context_window_tokens.max(1) as f32) * 100.0);
        self
    }
}

/// Status of a single loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Running,
    Succeeded,
    Failed,
    Retrying,
    Skipped,
}

/// The full record of one iteration of the engine's loop.
///
/// `iteration` is 1-based and strictly monotonic for the lifetime of one
/// engine instance (it resets only if the engine itself is re-created).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationResult {
    pub iteration: u64,
    pub task: Task,
    pub agent_result: Option<AgentResult>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: IterationStatus,
    pub task_completed: bool,
    #[serde(default)]
    pub usage: Option<TokenUsageSummary>,
    #[serde(default)]
    pub commit_sha: Option<String>,
}

impl IterationResult {
    pub fn starting(iteration: u64, task: Task) -> Self {
        Self {
            iteration,
            task,
            agent_result: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            status: IterationStatus::Running,
            task_completed: false,
            usage: None,
            commit_sha: None,
        }
    }

    /// Mark this result terminal. Once called, the result is never mutated
    /// again — see spec.md §8 universal invariant 1.
    pub fn finish(&mut self, status: IterationStatus, task_completed: bool) {
        let ended_at = Utc::now();
        self.duration_ms = Some((ended_at - self.started_at).num_milliseconds());
        self.ended_at = Some(ended_at);
        self.status = status;
        self.task_completed = task_completed;
    }
}

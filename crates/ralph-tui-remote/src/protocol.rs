//! Wire protocol types for the remote control server (spec.md §4.7, §6).
//! Every message carries `{type, id, timestamp}`; responses echo the
//! request `id`. Grounded on the teacher's `gateway::ws::WsCommand` tagged
//! envelope shape, generalized from a single-purpose chat command set to
//! the full engine/orchestration control surface.

use chrono::{DateTime, Utc};
use ralph_tui_core::graph::Confidence;
use ralph_tui_core::log_sink::{EngineEvent, ParallelEvent};
use serde::{Deserialize, Serialize};

/// Which bearer token a client is presenting in `auth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Server,
    Connection,
}

/// Remote configuration scope for `push_config`/`check_config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigScope {
    Global,
    Project,
}

/// One client→server request, tagged by `type`. `id` and `timestamp` are
/// lifted out of the payload at the transport layer (see
/// [`crate::server::Envelope`]) so each variant only carries its own
/// fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Auth {
        token: String,
        token_type: TokenType,
    },
    Ping,
    Subscribe {
        #[serde(default)]
        event_types: Option<Vec<String>>,
    },
    Unsubscribe,
    GetState,
    GetTasks,
    Pause,
    Resume,
    Interrupt,
    Continue,
    RefreshTasks,
    AddIterations {
        count: u64,
    },
    RemoveIterations {
        count: u64,
    },
    GetPromptPreview {
        task_id: String,
    },
    GetIterationOutput {
        task_id: String,
    },
    CheckConfig {
        config_content: String,
    },
    PushConfig {
        scope: ConfigScope,
        config_content: String,
        #[serde(default)]
        overwrite: bool,
    },
    #[serde(rename = "orchestrate:start")]
    OrchestrateStart {
        #[serde(default)]
        max_workers: Option<usize>,
        #[serde(default)]
        direct_merge: Option<bool>,
        #[serde(default)]
        max_iterations: Option<u64>,
    },
    #[serde(rename = "orchestrate:pause")]
    OrchestratePause { orchestration_id: String },
    #[serde(rename = "orchestrate:resume")]
    OrchestrateResume { orchestration_id: String },
    #[serde(rename = "orchestrate:stop")]
    OrchestrateStop { orchestration_id: String },
    #[serde(rename = "orchestrate:get_state")]
    OrchestrateGetState { orchestration_id: String },
}

/// One server→client response payload, tagged by `type`. Carried inside an
/// [`crate::server::Envelope`] alongside the echoed request `id`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerResponse {
    AuthResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection_token_expires_at: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Pong,
    Subscribed,
    Unsubscribed,
    State {
        state: serde_json::Value,
    },
    Tasks {
        tasks: serde_json::Value,
    },
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    PromptPreview {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    IterationOutput {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    ConfigCheckResult {
        valid: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ConfigPushResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        backup_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    OrchestrationStarted {
        orchestration_id: String,
        total_tasks: usize,
        total_groups: usize,
        max_parallelism: usize,
        recommended_workers: usize,
        confidence: Confidence,
    },
    OrchestrationState {
        state: serde_json::Value,
    },
    Error {
        error: String,
    },
}

/// Unsolicited, unwrapped event push (not a response to a request), per
/// spec.md §4.7 step 3.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerPush {
    EngineEvent { event: EngineEvent },
    ParallelEvent {
        orchestration_id: String,
        event: ParallelEvent,
    },
}

//! Error kinds surfaced by the core, following the recovery policy table in
//! spec.md §7. Grounded on the teacher's `lifecycle::states::ResourceError`.

use thiserror::Error;

/// Error kinds the execution engine surfaces.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tracker error: {0}")]
    Tracker(String),

    #[error("agent failed to spawn: {0}")]
    AgentSpawn(String),

    #[error("agent runtime error: {0}")]
    AgentRuntime(String),

    #[error("agent execution was interrupted")]
    AgentInterrupted,

    #[error("agent '{0}' is rate limited until {1}")]
    RateLimited(String, chrono::DateTime<chrono::Utc>),

    #[error("all configured agents are rate limited")]
    AllAgentsLimited,

    #[error("session persistence error: {0}")]
    Persistence(String),

    #[error("session lock held by another process (pid {0})")]
    LockConflict(u32),

    #[error("engine has already been started")]
    AlreadyStarted,

    #[error("no agent plugin configured")]
    NoAgentPlugin,

    #[error("no tracker plugin configured")]
    NoTrackerPlugin,

    #[error("initialization failed: {0}")]
    InitializationFailed(String),
}

/// Error kinds surfaced by the worktree pool.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("maximum worktree count ({0}) reached")]
    CapacityExceeded(usize),

    #[error("insufficient free disk space: {available} bytes available, {required} required")]
    DiskSpace { available: u64, required: u64 },

    #[error("git worktree creation failed: {0}")]
    Creation(String),

    #[error("worktree '{0}' not found")]
    NotFound(String),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error kinds surfaced by the task graph analyzer.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate task id: {0}")]
    DuplicateTaskId(String),
}

/// Error kinds surfaced by the merge engine.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge operation '{0}' not found")]
    OperationNotFound(String),

    #[error("no session-start tag exists to roll back to")]
    NoSessionTag,

    #[error("merge conflict in {0} file(s)")]
    Conflict(usize),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}

/// Error kinds surfaced by session persistence (store + lock + registry).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session file is corrupt: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("lock is held by live process {pid}")]
    LockHeld { pid: u32 },

    #[error("lock acquisition is ambiguous and non-interactive mode forbids prompting")]
    LockAmbiguousNonInteractive,

    #[error("no session found for this project")]
    NotFound,
}

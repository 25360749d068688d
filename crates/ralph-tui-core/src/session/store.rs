//! [`PersistedSessionState`] and its atomic load/save, per spec.md §3/§4.1.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::task::TaskId;

/// Tracker identity and counters snapshotted at session creation, per
/// spec.md §3's `trackerState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerState {
    pub plugin: String,
    pub total_tasks: u64,
    #[serde(default)]
    pub epic_id: Option<String>,
    #[serde(default)]
    pub prd_path: Option<String>,
}

/// Lifecycle status of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Interrupted,
    Completed,
    Failed,
}

impl SessionStatus {
    /// A session is resumable iff it is not in a terminal state.
    ///
    /// `completed` and `failed` are terminal per spec.md §3's
    /// PersistedSessionState invariants.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            SessionStatus::Running | SessionStatus::Paused | SessionStatus::Interrupted
        )
    }
}

/// Crash-safe, atomically-persisted state for one engine session.
///
/// Written to `.ralph-tui/session.json`. See spec.md §3 invariants:
/// `activeTaskIds` is always a subset of tasks currently `in_progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSessionState {
    pub session_id: String,
    pub status: SessionStatus,
    pub agent_plugin: String,
    #[serde(default)]
    pub model: Option<String>,
    pub tracker_state: TrackerState,
    pub max_iterations: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_task_ids: HashSet<TaskId>,
    pub current_iteration: u64,
    #[serde(default)]
    pub active_task_ids: HashSet<TaskId>,
    pub is_paused: bool,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subagent_panel_visible: Option<bool>,
}

/// Metadata needed to create a fresh session.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub agent_plugin: String,
    pub model: Option<String>,
    pub tracker_state: TrackerState,
    pub max_iterations: u64,
}

impl PersistedSessionState {
    pub fn create(meta: SessionMeta) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            status: SessionStatus::Running,
            agent_plugin: meta.agent_plugin,
            model: meta.model,
            tracker_state: meta.tracker_state,
            max_iterations: meta.max_iterations,
            started_at: now,
            updated_at: now,
            completed_task_ids: HashSet::new(),
            current_iteration: 0,
            active_task_ids: HashSet::new(),
            is_paused: false,
            paused_at: None,
            subagent_panel_visible: None,
        }
    }
}

fn session_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".ralph-tui").join("session.json")
}

/// Atomic JSON persistence of [`PersistedSessionState`] under a project's
/// `.ralph-tui/` directory. Grounded on the teacher's `config::loader`
/// tmp-write → fsync → rename save strategy, adapted to per-project JSON
/// rather than a single user-global TOML file.
pub struct SessionStore;

impl SessionStore {
    /// Load session state for `project_dir`, returning `None` if no session
    /// file exists yet.
    pub fn load(project_dir: &Path) -> Result<Option<PersistedSessionState>, SessionError> {
        let path = session_path(project_dir);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let state = serde_json::from_str(&content)
                    .map_err(|e| SessionError::Corrupt(e.to_string()))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SessionError::Io(e)),
        }
    }

    /// Atomically persist `state`: write to a `.tmp` sibling, fsync, rename.
    pub fn save(project_dir: &Path, state: &mut PersistedSessionState) -> Result<(), SessionError> {
        state.updated_at = Utc::now();
        let dir = project_dir.join(".ralph-tui");
        std::fs::create_dir_all(&dir)?;

        let path = session_path(project_dir);
        let tmp_path = dir.join("session.json.tmp");

        let content = serde_json::to_string_pretty(state)?;
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            use std::io::Write;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Remove a project's session file, if present.
    pub fn delete(project_dir: &Path) -> Result<(), SessionError> {
        let path = session_path(project_dir);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::Io(e)),
        }
    }
}

/// Stale-session recovery outcome, per spec.md §4.1.
#[derive(Debug, Clone)]
pub struct StaleRecoveryOutcome {
    pub was_stale: bool,
    pub cleared_task_count: usize,
    /// The task IDs cleared from `activeTaskIds`, so the caller can reset
    /// them back to `open` in the tracker — the persisted file itself no
    /// longer carries them once this call returns.
    pub cleared_task_ids: HashSet<TaskId>,
}

/// Inspect and, if needed, recover a session left behind by a crashed
/// process: if the session is `Running` and its lock's PID is not alive,
/// mark it `Interrupted`, clear `active_task_ids`, and persist.
///
/// `is_pid_alive` is injected so tests don't depend on real process state.
pub fn detect_and_recover_stale_session(
    project_dir: &Path,
    is_pid_alive: impl Fn(u32) -> bool,
    lock_pid: Option<u32>,
) -> Result<StaleRecoveryOutcome, SessionError> {
    let Some(mut state) = SessionStore::load(project_dir)? else {
        return Ok(StaleRecoveryOutcome {
            was_stale: false,
            cleared_task_count: 0,
            cleared_task_ids: HashSet::new(),
        });
    };

    let stale = state.status == SessionStatus::Running
        && lock_pid.map(|pid| !is_pid_alive(pid)).unwrap_or(true);

    if !stale {
        return Ok(StaleRecoveryOutcome {
            was_stale: false,
            cleared_task_count: 0,
            cleared_task_ids: HashSet::new(),
        });
    }

    let cleared_task_ids = std::mem::take(&mut state.active_task_ids);
    let cleared_task_count = cleared_task_ids.len();
    state.status = SessionStatus::Interrupted;
    SessionStore::save(project_dir, &mut state)?;

    Ok(StaleRecoveryOutcome {
        was_stale: true,
        cleared_task_count,
        cleared_task_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> SessionMeta {
        SessionMeta {
            agent_plugin: "mock".to_string(),
            model: None,
            tracker_state: TrackerState {
                plugin: "mock".to_string(),
                total_tasks: 3,
                epic_id: None,
                prd_path: None,
            },
            max_iterations: 10,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = PersistedSessionState::create(meta());
        state.current_iteration = 2;
        SessionStore::save(dir.path(), &mut state).unwrap();

        let loaded = SessionStore::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.session_id, state.session_id);
        assert_eq!(loaded.current_iteration, 2);
    }

    #[test]
    fn load_missing_session_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SessionStore::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn stale_recovery_clears_active_tasks_when_pid_dead() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = PersistedSessionState::create(meta());
        state.status = SessionStatus::Running;
        state.active_task_ids.insert("t1".to_string());
        state.active_task_ids.insert("t2".to_string());
        SessionStore::save(dir.path(), &mut state).unwrap();

        let outcome =
            detect_and_recover_stale_session(dir.path(), |_pid| false, Some(12345)).unwrap();
        assert!(outcome.was_stale);
        assert_eq!(outcome.cleared_task_count, 2);

        let reloaded = SessionStore::load(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.status, SessionStatus::Interrupted);
        assert!(reloaded.active_task_ids.is_empty());
    }

    #[test]
    fn stale_recovery_leaves_live_session_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = PersistedSessionState::create(meta());
        state.status = SessionStatus::Running;
        state.active_task_ids.insert("t1".to_string());
        SessionStore::save(dir.path(), &mut state).unwrap();

        let outcome =
            detect_and_recover_stale_session(dir.path(), |_pid| true, Some(12345)).unwrap();
        assert!(!outcome.was_stale);

        let reloaded = SessionStore::load(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.status, SessionStatus::Running);
        assert_eq!(reloaded.active_task_ids.len(), 1);
    }
}

//! [`SessionLock`]: PID-based exclusive lock over `.ralph-tui/session.lock`,
//! per spec.md §3/§4.1.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Contents of `.ralph-tui/session.lock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLock {
    pub pid: u32,
    pub session_id: String,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

/// Options controlling [`acquire`]'s behavior when a lock is already present.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    /// Break a live lock unconditionally.
    pub force: bool,
    /// Fail instead of treating an ambiguous stale-vs-live lock as
    /// acquirable.
    pub non_interactive: bool,
}

/// Outcome of [`acquire`].
#[derive(Debug, Clone)]
pub struct AcquireResult {
    pub acquired: bool,
    pub existing_pid: Option<u32>,
    pub error: Option<String>,
}

/// Outcome of [`check`].
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub is_locked: bool,
    pub is_stale: bool,
    pub lock: Option<SessionLock>,
}

fn lock_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".ralph-tui").join("session.lock")
}

/// Whether the process owning `lock` is still alive on this host, using
/// `sysinfo`'s process table (a recycled PID reads as absent, matching
/// spec.md §3's "PID is absent from the host or was recycled" clause closely
/// enough for a single-host, single-boot lifetime).
fn is_lock_alive(lock: &SessionLock) -> bool {
    let mut system = sysinfo::System::new();
    system.refresh_all();
    system
        .process(sysinfo::Pid::from_u32(lock.pid))
        .is_some()
}

/// Inspect the lock file without mutating it.
pub fn check(project_dir: &Path) -> Result<CheckResult, SessionError> {
    let path = lock_path(project_dir);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CheckResult {
                is_locked: false,
                is_stale: false,
                lock: None,
            })
        }
        Err(e) => return Err(SessionError::Io(e)),
    };

    let lock: SessionLock =
        serde_json::from_str(&content).map_err(|e| SessionError::Corrupt(e.to_string()))?;
    let is_stale = !is_lock_alive(&lock);
    Ok(CheckResult {
        is_locked: true,
        is_stale,
        lock: Some(lock),
    })
}

/// Acquire the session lock for `session_id`, atomically (exclusive-create).
///
/// If a lock already exists: a stale lock is reclaimed transparently; a live
/// lock is only broken when `options.force` is set; otherwise acquisition
/// fails. `options.non_interactive` turns an ambiguous (unreadable) existing
/// lock into a hard failure rather than an acquirable one.
pub fn acquire(
    project_dir: &Path,
    session_id: &str,
    options: AcquireOptions,
) -> Result<AcquireResult, SessionError> {
    let dir = project_dir.join(".ralph-tui");
    std::fs::create_dir_all(&dir)?;
    let path = lock_path(project_dir);

    match check(project_dir)? {
        CheckResult {
            is_locked: true,
            is_stale: false,
            lock: Some(existing),
        } if !options.force => {
            return Ok(AcquireResult {
                acquired: false,
                existing_pid: Some(existing.pid),
                error: Some(format!("session locked by live process {}", existing.pid)),
            });
        }
        CheckResult {
            is_locked: true,
            lock: None,
            ..
        } if options.non_interactive => {
            return Ok(AcquireResult {
                acquired: false,
                existing_pid: None,
                error: Some("lock file unreadable; refusing in non-interactive mode".to_string()),
            });
        }
        _ => {}
    }

    let lock = SessionLock {
        pid: std::process::id(),
        session_id: session_id.to_string(),
        host: hostname(),
        acquired_at: Utc::now(),
    };
    let content = serde_json::to_string_pretty(&lock)?;
    std::fs::write(&path, content)?;

    Ok(AcquireResult {
        acquired: true,
        existing_pid: None,
        error: None,
    })
}

/// Release the lock, if this process's lock file is present. Idempotent.
pub fn release(project_dir: &Path) -> Result<(), SessionError> {
    let path = lock_path(project_dir);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SessionError::Io(e)),
    }
}

fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let result = acquire(dir.path(), "session-1", AcquireOptions::default()).unwrap();
        assert!(result.acquired);

        let check_result = check(dir.path()).unwrap();
        assert!(check_result.is_locked);
        assert_eq!(check_result.lock.unwrap().pid, std::process::id());

        release(dir.path()).unwrap();
        let after = check(dir.path()).unwrap();
        assert!(!after.is_locked);
    }

    #[test]
    fn acquire_reclaims_stale_lock_from_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        let stale = SessionLock {
            pid: u32::MAX, // exceedingly unlikely to be a live pid
            session_id: "old-session".to_string(),
            host: "other-host".to_string(),
            acquired_at: Utc::now(),
        };
        std::fs::create_dir_all(dir.path().join(".ralph-tui")).unwrap();
        std::fs::write(
            lock_path(dir.path()),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let result = acquire(dir.path(), "new-session", AcquireOptions::default()).unwrap();
        assert!(result.acquired);
    }

    #[test]
    fn acquire_refuses_live_lock_without_force() {
        let dir = tempfile::tempdir().unwrap();
        acquire(dir.path(), "session-1", AcquireOptions::default()).unwrap();

        let second = acquire(dir.path(), "session-2", AcquireOptions::default()).unwrap();
        assert!(!second.acquired);
        assert_eq!(second.existing_pid, Some(std::process::id()));
    }

    #[test]
    fn acquire_with_force_breaks_live_lock() {
        let dir = tempfile::tempdir().unwrap();
        acquire(dir.path(), "session-1", AcquireOptions::default()).unwrap();

        let forced = acquire(
            dir.path(),
            "session-2",
            AcquireOptions {
                force: true,
                non_interactive: false,
            },
        )
        .unwrap();
        assert!(forced.acquired);
    }
}

//! Worktree pool (component G): create, enumerate, and destroy isolated
//! working copies of the repository for parallel workers, per spec.md §4.3.
//! Git plumbing uses `git2`, following the usage pattern of the pack's
//! `agentgit::git::clone` module (the teacher's own dependency tree has no
//! git library).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::WorktreeError;
use crate::task::TaskId;

/// One worker's isolated working copy, per spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub id: String,
    pub path: PathBuf,
    pub branch: String,
    #[serde(default)]
    pub worker_id: Option<String>,
    pub task_id: TaskId,
    pub active: bool,
    pub dirty: bool,
    pub created_at: DateTime<Utc>,
}

/// Limits enforced by [`WorktreePool::acquire`].
#[derive(Debug, Clone, Copy)]
pub struct WorktreeLimits {
    pub max_worktrees: usize,
    pub min_free_disk_space_bytes: u64,
}

impl Default for WorktreeLimits {
    fn default() -> Self {
        Self {
            max_worktrees: 8,
            min_free_disk_space_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Sanitize a task id into a git-safe branch path segment: replaces
/// whitespace and reserved characters with `-`, collapses repeats, strips
/// leading/trailing separators, and falls back to a deterministic hash if
/// the result would be empty.
pub fn sanitize_branch_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for ch in raw.chars() {
        let is_reserved = ch.is_whitespace()
            || matches!(ch, '~' | '^' | ':' | '?' | '*' | '[' | '\\' | '.' | '/');
        if is_reserved {
            if !last_was_sep {
                out.push('-');
                last_was_sep = true;
            }
        } else {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        }
    }
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.is_empty() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        raw.hash(&mut hasher);
        format!("task-{:x}", hasher.finish())
    } else {
        trimmed
    }
}

fn branch_name(prefix: &str, task_id: &str) -> String {
    format!("{prefix}/{}", sanitize_branch_segment(task_id))
}

/// Worktrees live at `{parent(project_dir)}/.ralph-worktrees/{basename(project_dir)}/{worker_id}`,
/// a sibling of the project directory so agents walking upward for a
/// version-control marker never cross into a nested worktree.
fn worktree_path(project_dir: &Path, worker_id: &str) -> Result<PathBuf, WorktreeError> {
    let parent = project_dir
        .parent()
        .ok_or_else(|| WorktreeError::Creation("project directory has no parent".to_string()))?;
    let basename = project_dir
        .file_name()
        .ok_or_else(|| WorktreeError::Creation("project directory has no basename".to_string()))?;
    Ok(parent
        .join(".ralph-worktrees")
        .join(basename)
        .join(worker_id))
}

/// Available bytes on the filesystem backing `path`. Implemented via a
/// coarse `statvfs`-style query; returns `u64::MAX` (never blocking
/// acquisition) when the platform query is unavailable, matching the
/// teacher's "falls back to a secondary disk-free query if the first yields
/// zero/invalid" posture from spec.md §4.3.
fn free_disk_space(path: &Path) -> u64 {
    fs2::available_space(path).unwrap_or(u64::MAX)
}

/// Creates, tracks, and destroys per-worker git worktrees, guarding the
/// active set and disk budget with a single mutex so acquisition and release
/// are serialized, per spec.md §5's worktree ownership rule.
pub struct WorktreePool {
    project_dir: PathBuf,
    branch_prefix: String,
    limits: WorktreeLimits,
    active: Mutex<HashMap<String, WorktreeInfo>>,
}

impl WorktreePool {
    pub fn new(project_dir: PathBuf, branch_prefix: impl Into<String>, limits: WorktreeLimits) -> Self {
        Self {
            project_dir,
            branch_prefix: branch_prefix.into(),
            limits,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Create a fresh worktree and branch for `worker_id`/`task_id`. Refuses
    /// if the active count is at capacity or free disk space is below the
    /// configured minimum.
    pub fn acquire(&self, worker_id: &str, task_id: &TaskId) -> Result<WorktreeInfo, WorktreeError> {
        let mut active = self.active.lock();
        if active.len() >= self.limits.max_worktrees {
            return Err(WorktreeError::CapacityExceeded(self.limits.max_worktrees));
        }

        let available = free_disk_space(&self.project_dir);
        if available < self.limits.min_free_disk_space_bytes {
            return Err(WorktreeError::DiskSpace {
                available,
                required: self.limits.min_free_disk_space_bytes,
            });
        }

        let path = worktree_path(&self.project_dir, worker_id)?;
        let branch = branch_name(&self.branch_prefix, task_id);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let repo = git2::Repository::open(&self.project_dir)?;
        let head = repo.head()?.peel_to_commit()?;
        let git_branch = repo.branch(&branch, &head, true)?;
        let branch_ref = git_branch.into_reference();
        let ref_name = branch_ref
            .name()
            .ok_or_else(|| WorktreeError::Creation("branch reference has no name".to_string()))?
            .to_string();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        repo.worktree(worker_id, &path, Some(&opts))
            .map_err(WorktreeError::Git)?;

        debug!(worker_id, %branch, ref_name, "worktree created");

        let info = WorktreeInfo {
            id: worker_id.to_string(),
            path,
            branch,
            worker_id: Some(worker_id.to_string()),
            task_id: task_id.clone(),
            active: true,
            dirty: false,
            created_at: Utc::now(),
        };
        active.insert(worker_id.to_string(), info.clone());
        info!(worker_id, "worktree acquired");
        Ok(info)
    }

    /// Release a worktree: remove its working copy via `git worktree remove`
    /// semantics, preserving the branch (merge/rollback still need it) and
    /// copying any iteration logs it holds back to the project first.
    pub fn release(&self, id: &str) -> Result<(), WorktreeError> {
        let mut active = self.active.lock();
        let Some(info) = active.remove(id) else {
            return Err(WorktreeError::NotFound(id.to_string()));
        };
        self.preserve_logs(&info)?;

        let repo = git2::Repository::open(&self.project_dir)?;
        if let Ok(worktree) = repo.find_worktree(id) {
            let mut prune_opts = git2::WorktreePruneOptions::new();
            prune_opts.working_tree(true);
            worktree.prune(Some(&mut prune_opts))?;
        } else if info.path.exists() {
            std::fs::remove_dir_all(&info.path)?;
        }
        info!(worker_id = id, "worktree released");
        Ok(())
    }

    fn preserve_logs(&self, info: &WorktreeInfo) -> Result<(), WorktreeError> {
        let src = info.path.join(".ralph-tui").join("iterations");
        if !src.exists() {
            return Ok(());
        }
        let dest = self.project_dir.join(".ralph-tui").join("iterations");
        std::fs::create_dir_all(&dest)?;
        for entry in std::fs::read_dir(&src)? {
            let entry = entry?;
            let dest_path = dest.join(entry.file_name());
            std::fs::copy(entry.path(), dest_path)?;
        }
        Ok(())
    }

    /// Whether the worktree at `id` has uncommitted changes.
    pub fn is_dirty(&self, id: &str) -> Result<bool, WorktreeError> {
        let active = self.active.lock();
        let info = active.get(id).ok_or_else(|| WorktreeError::NotFound(id.to_string()))?;
        let repo = git2::Repository::open(&info.path)?;
        let statuses = repo.statuses(None)?;
        Ok(!statuses.is_empty())
    }

    /// Number of commits the worktree's branch has made beyond the host
    /// branch's tip at the time of acquisition.
    pub fn get_commit_count(&self, id: &str) -> Result<usize, WorktreeError> {
        let active = self.active.lock();
        let info = active.get(id).ok_or_else(|| WorktreeError::NotFound(id.to_string()))?;
        let repo = git2::Repository::open(&info.path)?;
        let host_repo = git2::Repository::open(&self.project_dir)?;
        let host_head = host_repo.head()?.peel_to_commit()?.id();
        let worker_head = repo.head()?.peel_to_commit()?.id();

        if worker_head == host_head {
            return Ok(0);
        }

        let mut revwalk = repo.revwalk()?;
        revwalk.push(worker_head)?;
        revwalk.hide(host_head)?;
        Ok(revwalk.count())
    }

    /// Release every tracked worktree, collecting errors rather than
    /// aborting on the first failure, per spec.md §4.3.
    pub fn cleanup_all(&self) -> Result<(), Vec<WorktreeError>> {
        let ids: Vec<String> = self.active.lock().keys().cloned().collect();
        let mut errors = Vec::new();
        for id in ids {
            if let Err(e) = self.release(&id) {
                warn!(worker_id = %id, error = %e, "failed to release worktree during cleanup");
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_reserved_chars_and_collapses() {
        assert_eq!(sanitize_branch_segment("Fix   Bug #12"), "fix-bug-#12");
        assert_eq!(sanitize_branch_segment("a/b\\c:d"), "a-b-c-d");
        assert_eq!(sanitize_branch_segment("  "), sanitize_branch_segment("  "));
    }

    #[test]
    fn sanitize_empty_falls_back_to_hash() {
        let result = sanitize_branch_segment("...");
        assert!(result.starts_with("task-"));
    }

    #[test]
    fn branch_name_uses_prefix_and_sanitized_id() {
        assert_eq!(branch_name("ralph", "Fix Bug"), "ralph/fix-bug");
    }
}

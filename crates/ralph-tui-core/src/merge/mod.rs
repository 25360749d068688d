//! Merge engine (component I): a serial FIFO queue that integrates each
//! worker's branch into the host branch, per spec.md §4.5. Exactly one
//! merge is in flight at a time, enforced by `merge_lock`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::MergeError;
use crate::task::TaskId;
use crate::worktree::sanitize_branch_segment;

/// Merge strategy chosen per spec.md §4.5 step 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    FastForward,
    MergeCommit,
}

/// Lifecycle status of one [`MergeOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Queued,
    InProgress,
    Succeeded,
    Conflicted,
    Failed,
}

/// One queued or completed merge, per spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOperation {
    pub id: String,
    pub source_branch: String,
    pub commit_message: String,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: MergeStatus,
    pub pre_merge_tag: String,
    #[serde(default)]
    pub strategy: Option<MergeStrategy>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    pub had_conflicts: bool,
    #[serde(default)]
    pub files_changed: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A worker's outcome, handed to [`MergeEngine::enqueue`]. Minimal view of
/// spec.md §3's `WorkerResult`, limited to what the merge engine needs.
#[derive(Debug, Clone)]
pub struct MergeCandidate {
    pub task_id: TaskId,
    pub branch: String,
}

const SESSION_TAG_PREFIX: &str = "ralph-session";
const BACKUP_TAG_PREFIX: &str = "ralph-backup";

/// Result of a completed merge attempt.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub success: bool,
    pub had_conflicts: bool,
    pub error: Option<String>,
    pub operation: MergeOperation,
}

/// Serially integrates worker branches into the host branch, with pre-merge
/// backup tags and rollback support. Grounded on spec.md §4.5; git plumbing
/// style follows the pack's `agentgit::git` usage of `git2`.
pub struct MergeEngine {
    project_dir: PathBuf,
    host_branch: String,
    queue: Mutex<VecDeque<MergeOperation>>,
    completed: Mutex<Vec<MergeOperation>>,
    /// Held for the duration of `process_next`, enforcing "exactly one
    /// merge in progress at a time" (spec.md §4.5).
    merge_lock: Mutex<()>,
    fail_fast: bool,
}

impl MergeEngine {
    pub fn new(project_dir: PathBuf, host_branch: impl Into<String>, fail_fast: bool) -> Self {
        Self {
            project_dir,
            host_branch: host_branch.into(),
            queue: Mutex::new(VecDeque::new()),
            completed: Mutex::new(Vec::new()),
            merge_lock: Mutex::new(()),
            fail_fast,
        }
    }

    /// Queue a worker's branch for integration, emitting `merge:queued` at
    /// the call site (the engine itself has no event bus handle; callers —
    /// the parallel executor — publish the corresponding [`crate::log_sink::ParallelEvent`]).
    pub fn enqueue(&self, candidate: MergeCandidate) -> MergeOperation {
        let now = Utc::now();
        let op = MergeOperation {
            id: uuid::Uuid::new_v4().to_string(),
            source_branch: candidate.branch,
            commit_message: format!("ralph-tui: merge task {}", candidate.task_id),
            queued_at: now,
            started_at: None,
            completed_at: None,
            status: MergeStatus::Queued,
            pre_merge_tag: format!(
                "{BACKUP_TAG_PREFIX}/{}/{}",
                sanitize_branch_segment(&candidate.task_id),
                now.timestamp()
            ),
            strategy: None,
            commit_sha: None,
            had_conflicts: false,
            files_changed: None,
            error: None,
        };
        self.queue.lock().push_back(op.clone());
        info!(operation_id = %op.id, branch = %op.source_branch, "merge queued");
        op
    }

    /// Dequeue and attempt the next merge. Returns `None` if the queue is
    /// empty.
    pub fn process_next(&self) -> Option<MergeResult> {
        let _guard = self.merge_lock.lock();
        let mut op = self.queue.lock().pop_front()?;
        op.status = MergeStatus::InProgress;
        op.started_at = Some(Utc::now());
        info!(operation_id = %op.id, "merge started");

        let result = self.attempt_merge(&mut op);
        op.completed_at = Some(Utc::now());
        self.completed.lock().push(op.clone());
        Some(result)
    }

    fn attempt_merge(&self, op: &mut MergeOperation) -> MergeResult {
        match self.try_merge_inner(op) {
            Ok((strategy, commit_sha, files_changed)) => {
                op.status = MergeStatus::Succeeded;
                op.strategy = Some(strategy);
                op.commit_sha = Some(commit_sha);
                op.files_changed = Some(files_changed);
                info!(operation_id = %op.id, ?strategy, "merge completed");
                MergeResult {
                    success: true,
                    had_conflicts: false,
                    error: None,
                    operation: op.clone(),
                }
            }
            Err(MergeError::Conflict(n)) => {
                op.status = MergeStatus::Conflicted;
                op.had_conflicts = true;
                op.error = Some(format!("merge conflict in {n} file(s)"));
                warn!(operation_id = %op.id, files = n, "merge conflict detected");
                let _ = self.rollback_to_tag(&op.pre_merge_tag);
                MergeResult {
                    success: false,
                    had_conflicts: true,
                    error: op.error.clone(),
                    operation: op.clone(),
                }
            }
            Err(e) => {
                op.status = MergeStatus::Failed;
                op.error = Some(e.to_string());
                warn!(operation_id = %op.id, error = %e, "merge failed");
                MergeResult {
                    success: false,
                    had_conflicts: false,
                    error: op.error.clone(),
                    operation: op.clone(),
                }
            }
        }
    }

    fn try_merge_inner(
        &self,
        op: &MergeOperation,
    ) -> Result<(MergeStrategy, String, Vec<String>), MergeError> {
        let repo = git2::Repository::open(&self.project_dir)?;

        let host_ref = repo.find_branch(&self.host_branch, git2::BranchType::Local)?;
        let host_commit = host_ref.get().peel_to_commit()?;
        repo.tag_lightweight(&op.pre_merge_tag, host_commit.as_object(), false)?;

        let source_ref = repo.find_branch(&op.source_branch, git2::BranchType::Local)?;
        let source_commit = source_ref.get().peel_to_commit()?;

        let annotated = repo.find_annotated_commit(source_commit.id())?;
        let analysis = repo.merge_analysis(&[&annotated])?;

        if analysis.0.is_fast_forward() {
            let mut host_ref_mut = repo.find_reference(&format!("refs/heads/{}", self.host_branch))?;
            host_ref_mut.set_target(source_commit.id(), "ralph-tui: fast-forward merge")?;
            repo.set_head(&format!("refs/heads/{}", self.host_branch))?;
            repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
            let files = diff_file_list(&repo, host_commit.id(), source_commit.id())?;
            return Ok((MergeStrategy::FastForward, source_commit.id().to_string(), files));
        }

        repo.merge(&[&annotated], None, None)?;
        let mut index = repo.index()?;
        if index.has_conflicts() {
            let conflict_count = index.conflicts()?.count();
            repo.cleanup_state()?;
            repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
            return Err(MergeError::Conflict(conflict_count));
        }

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let signature = repo.signature().unwrap_or_else(|_| {
            git2::Signature::now("ralph-tui", "ralph-tui@localhost").expect("valid signature")
        });
        let commit_sha = repo.commit(
            Some(&format!("refs/heads/{}", self.host_branch)),
            &signature,
            &signature,
            &op.commit_message,
            &tree,
            &[&host_commit, &source_commit],
        )?;
        repo.cleanup_state()?;
        let files = diff_file_list(&repo, host_commit.id(), source_commit.id())?;
        Ok((MergeStrategy::MergeCommit, commit_sha.to_string(), files))
    }

    fn rollback_to_tag(&self, tag: &str) -> Result<(), MergeError> {
        let repo = git2::Repository::open(&self.project_dir)?;
        let tag_ref = repo.find_reference(&format!("refs/tags/{tag}"))?;
        let target = tag_ref.peel_to_commit()?;
        let mut host_ref = repo.find_reference(&format!("refs/heads/{}", self.host_branch))?;
        host_ref.set_target(target.id(), "ralph-tui: rollback merge")?;
        repo.set_head(&format!("refs/heads/{}", self.host_branch))?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
        Ok(())
    }

    /// Drain the queue, processing every merge. Halts on the first failure
    /// when `fail_fast` is set; otherwise continues past failed merges and
    /// records every outcome, per spec.md §4.5.
    pub fn process_all(&self) -> Vec<MergeResult> {
        let mut results = Vec::new();
        while let Some(result) = self.process_next() {
            let failed = !result.success;
            results.push(result);
            if failed && self.fail_fast {
                break;
            }
        }
        results
    }

    /// Place a single whole-session backup tag on the host branch before any
    /// merge in this session has been attempted.
    pub fn create_session_backup(&self, session_id: &str) -> Result<String, MergeError> {
        let repo = git2::Repository::open(&self.project_dir)?;
        let host_ref = repo.find_branch(&self.host_branch, git2::BranchType::Local)?;
        let commit = host_ref.get().peel_to_commit()?;
        let tag = format!("{SESSION_TAG_PREFIX}/{session_id}");
        repo.tag_lightweight(&tag, commit.as_object(), false)?;
        Ok(tag)
    }

    /// Reset the host branch pointer back to one merge operation's
    /// pre-merge tag.
    pub fn rollback_merge(&self, op_id: &str) -> Result<(), MergeError> {
        let completed = self.completed.lock();
        let op = completed
            .iter()
            .find(|o| o.id == op_id)
            .ok_or_else(|| MergeError::OperationNotFound(op_id.to_string()))?;
        self.rollback_to_tag(&op.pre_merge_tag)
    }

    /// Reset the host branch pointer back to the whole-session backup tag.
    pub fn rollback_session(&self, session_id: &str) -> Result<(), MergeError> {
        let tag = format!("{SESSION_TAG_PREFIX}/{session_id}");
        let repo = git2::Repository::open(&self.project_dir)?;
        if repo.find_reference(&format!("refs/tags/{tag}")).is_err() {
            return Err(MergeError::NoSessionTag);
        }
        self.rollback_to_tag(&tag)
    }

    /// Remove every tag this engine placed for `session_id`: the session tag
    /// plus every completed operation's pre-merge tag.
    pub fn cleanup_tags(&self, session_id: &str) -> Result<(), MergeError> {
        let repo = git2::Repository::open(&self.project_dir)?;
        let session_tag = format!("{SESSION_TAG_PREFIX}/{session_id}");
        let _ = repo.tag_delete(&session_tag);
        for op in self.completed.lock().iter() {
            let _ = repo.tag_delete(&op.pre_merge_tag);
        }
        Ok(())
    }

    pub fn completed_operations(&self) -> Vec<MergeOperation> {
        self.completed.lock().clone()
    }
}

fn diff_file_list(
    repo: &git2::Repository,
    from: git2::Oid,
    to: git2::Oid,
) -> Result<Vec<String>, MergeError> {
    let from_tree = repo.find_commit(from)?.tree()?;
    let to_tree = repo.find_commit(to)?.tree()?;
    let diff = repo.diff_tree_to_tree(Some(&from_tree), Some(&to_tree), None)?;
    let mut files = Vec::new();
    diff.foreach(
        &mut |delta, _| {
            if let Some(path) = delta.new_file().path() {
                files.push(path.to_string_lossy().to_string());
            }
            true
        },
        None,
        None,
        None,
    )?;
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo_with_commit(dir: &Path) -> git2::Repository {
        let repo = git2::Repository::init(dir).unwrap();
        let signature = git2::Signature::now("test", "test@example.com").unwrap();
        let tree_id = {
            let mut index = repo.index().unwrap();
            index.write_tree().unwrap()
        };
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &signature, &signature, "initial", &tree, &[])
            .unwrap();
        repo
    }

    #[test]
    fn enqueue_assigns_pre_merge_tag_and_queues() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path());
        let engine = MergeEngine::new(dir.path().to_path_buf(), "main", false);

        let op = engine.enqueue(MergeCandidate {
            task_id: "fix-bug".to_string(),
            branch: "ralph/fix-bug".to_string(),
        });
        assert_eq!(op.status, MergeStatus::Queued);
        assert!(op.pre_merge_tag.starts_with("ralph-backup/fix-bug/"));
    }

    #[test]
    fn process_next_on_empty_queue_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path());
        let engine = MergeEngine::new(dir.path().to_path_buf(), "main", false);
        assert!(engine.process_next().is_none());
    }

    #[test]
    fn rollback_merge_unknown_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path());
        let engine = MergeEngine::new(dir.path().to_path_buf(), "main", false);
        let err = engine.rollback_merge("missing").unwrap_err();
        assert!(matches!(err, MergeError::OperationNotFound(_)));
    }

    #[test]
    fn rollback_session_without_tag_errors() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path());
        let engine = MergeEngine::new(dir.path().to_path_buf(), "main", false);
        let err = engine.rollback_session("nonexistent").unwrap_err();
        assert!(matches!(err, MergeError::NoSessionTag));
    }

    fn checkout_branch_hard(repo: &git2::Repository, branch: &str) {
        let commit = repo
            .find_branch(branch, git2::BranchType::Local)
            .unwrap()
            .get()
            .peel_to_commit()
            .unwrap();
        repo.set_head(&format!("refs/heads/{branch}")).unwrap();
        repo.reset(
            commit.as_object(),
            git2::ResetType::Hard,
            Some(git2::build::CheckoutBuilder::new().force().remove_untracked(true)),
        )
        .unwrap();
    }

    fn commit_file_on_branch(
        repo: &git2::Repository,
        dir: &Path,
        branch: &str,
        parent: &git2::Commit,
        content: &str,
    ) {
        repo.branch(branch, parent, true).unwrap();
        checkout_branch_hard(repo, branch);
        std::fs::write(dir.join("shared.txt"), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("shared.txt")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let signature = git2::Signature::now("test", "test@example.com").unwrap();
        repo.commit(
            Some(&format!("refs/heads/{branch}")),
            &signature,
            &signature,
            &format!("update on {branch}"),
            &tree,
            &[parent],
        )
        .unwrap();
    }

    /// S6: two tasks at the same depth both edit `shared.txt`. The first
    /// branch fast-forwards; the second conflicts and is rolled back to its
    /// pre-merge tag; `rollback_session` then unwinds the whole session,
    /// removing the first branch's merge too.
    #[test]
    fn second_conflicting_branch_rolls_back_and_session_rollback_undoes_both() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo_with_commit(dir.path());
        let base_commit = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("main", &base_commit, true).unwrap();
        checkout_branch_hard(&repo, "main");

        commit_file_on_branch(&repo, dir.path(), "ralph/t1", &base_commit, "from t1\n");
        commit_file_on_branch(&repo, dir.path(), "ralph/t2", &base_commit, "from t2\n");

        checkout_branch_hard(&repo, "main");

        let engine = MergeEngine::new(dir.path().to_path_buf(), "main", false);
        let session_tag = engine.create_session_backup("sess-1").unwrap();

        engine.enqueue(MergeCandidate {
            task_id: "t1".to_string(),
            branch: "ralph/t1".to_string(),
        });
        engine.enqueue(MergeCandidate {
            task_id: "t2".to_string(),
            branch: "ralph/t2".to_string(),
        });

        let results = engine.process_all();
        assert_eq!(results.len(), 2);
        assert!(results[0].success && !results[0].had_conflicts);
        assert_eq!(results[0].operation.strategy, Some(MergeStrategy::FastForward));
        assert!(!results[1].success && results[1].had_conflicts);
        assert_eq!(results[1].operation.status, MergeStatus::Conflicted);

        // t2's conflict was rolled back to its own pre-merge tag, so the
        // host branch still carries t1's fast-forwarded change.
        let host_after_t2 = repo
            .find_branch("main", git2::BranchType::Local)
            .unwrap()
            .get()
            .peel_to_commit()
            .unwrap();
        assert_eq!(
            host_after_t2.id(),
            repo.find_branch("ralph/t1", git2::BranchType::Local)
                .unwrap()
                .get()
                .peel_to_commit()
                .unwrap()
                .id()
        );

        engine.rollback_session("sess-1").unwrap();
        let host_after_rollback = repo
            .find_branch("main", git2::BranchType::Local)
            .unwrap()
            .get()
            .peel_to_commit()
            .unwrap();
        let tag_commit = repo
            .find_reference(&format!("refs/tags/{session_tag}"))
            .unwrap()
            .peel_to_commit()
            .unwrap();
        assert_eq!(host_after_rollback.id(), tag_commit.id());
        assert_eq!(host_after_rollback.id(), base_commit.id());
    }
}

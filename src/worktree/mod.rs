//! Bounded pool of isolated workspaces, one per concurrently active stage.
//!
//! [`GitWorktreeManager`] materializes slot *i* as a git worktree at
//! `<repo>/.worktrees/worktree-<i>`. [`TestWorktreeManager`] hands out the
//! repository itself and never isolates anything.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::process::Command;

use crate::errors::WorktreeError;

/// Directory under the repository root holding the pool's worktrees.
pub const WORKTREES_DIR: &str = ".worktrees";

/// A materialized workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub index: usize,
}

#[async_trait]
pub trait WorktreeIsolation: Send + Sync {
    /// Lowest free slot index, or [`WorktreeError::PoolExhausted`].
    fn acquire_index(&self) -> Result<usize, WorktreeError>;

    /// Acquire a slot and materialize a workspace on `branch` in it. The slot
    /// is returned to the pool if materialization fails.
    async fn create(&self, branch: &str, repo_path: &Path) -> Result<WorktreeInfo, WorktreeError>;

    async fn remove(&self, path: &Path) -> Result<(), WorktreeError>;

    fn release_index(&self, index: usize) -> Result<(), WorktreeError>;

    fn list_active(&self) -> Vec<WorktreeInfo>;

    /// Startup precondition: the isolation mechanism works in `repo_path`.
    async fn validate_isolation_strategy(&self, repo_path: &Path) -> Result<(), WorktreeError>;
}

#[derive(Debug)]
struct ActiveWorktree {
    info: WorktreeInfo,
    repo_path: PathBuf,
}

#[derive(Debug, Default)]
struct Pool {
    in_use: BTreeSet<usize>,
    active: BTreeMap<usize, ActiveWorktree>,
}

/// Git-worktree-backed pool of `capacity` slots, indexed from 1.
#[derive(Debug)]
pub struct GitWorktreeManager {
    capacity: usize,
    pool: Mutex<Pool>,
}

impl GitWorktreeManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pool: Mutex::new(Pool::default()),
        }
    }

    /// Indices currently handed out.
    pub fn held_indices(&self) -> Vec<usize> {
        self.pool().in_use.iter().copied().collect()
    }

    pub fn worktree_path(repo_path: &Path, index: usize) -> PathBuf {
        repo_path
            .join(WORKTREES_DIR)
            .join(format!("worktree-{}", index))
    }

    fn pool(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn materialize(
        &self,
        index: usize,
        branch: &str,
        repo_path: &Path,
    ) -> Result<WorktreeInfo, WorktreeError> {
        check_branch_name(branch)?;
        let path = Self::worktree_path(repo_path, index);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorktreeError::Other(e.into()))?;
        }

        if path.exists() {
            tracing::debug!(path = %path.display(), "Clearing leftover worktree");
            let _ = git(repo_path, &["worktree", "remove", "--force"], Some(&path)).await;
            let _ = tokio::fs::remove_dir_all(&path).await;
            git(repo_path, &["worktree", "prune"], None).await?;
        }

        let path_str = path.to_string_lossy().to_string();
        if branch_exists(repo_path, branch) {
            git(repo_path, &["worktree", "add", &path_str, branch], None).await?;
        } else {
            git(repo_path, &["worktree", "add", "-b", branch, &path_str], None).await?;
        }

        Ok(WorktreeInfo {
            path,
            branch: branch.to_string(),
            index,
        })
    }
}

/// Run git in `cwd`, appending `path` as the final argument when given.
async fn git(cwd: &Path, args: &[&str], path: Option<&Path>) -> Result<String, WorktreeError> {
    let mut command = Command::new("git");
    command.args(args).current_dir(cwd);
    if let Some(path) = path {
        command.arg(path);
    }
    let output = command
        .output()
        .await
        .map_err(|e| WorktreeError::GitFailed {
            operation: args.join(" "),
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(WorktreeError::GitFailed {
            operation: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Branch names come from discovery output; anything git would read as an
/// option or reject as a ref is refused before git sees it.
fn check_branch_name(branch: &str) -> Result<(), WorktreeError> {
    let valid = !branch.starts_with('-') && git2::Branch::name_is_valid(branch).unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(WorktreeError::InvalidBranch(branch.to_string()))
    }
}

fn branch_exists(repo_path: &Path, branch: &str) -> bool {
    git2::Repository::open(repo_path)
        .and_then(|repo| repo.find_branch(branch, git2::BranchType::Local).map(|_| ()))
        .is_ok()
}

#[async_trait]
impl WorktreeIsolation for GitWorktreeManager {
    fn acquire_index(&self) -> Result<usize, WorktreeError> {
        let mut pool = self.pool();
        let index = (1..=self.capacity)
            .find(|i| !pool.in_use.contains(i))
            .ok_or(WorktreeError::PoolExhausted {
                capacity: self.capacity,
            })?;
        pool.in_use.insert(index);
        tracing::debug!(worktree_index = index, "Acquired worktree index");
        Ok(index)
    }

    async fn create(&self, branch: &str, repo_path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let index = self.acquire_index()?;
        match self.materialize(index, branch, repo_path).await {
            Ok(info) => {
                tracing::info!(
                    worktree_index = index,
                    branch,
                    path = %info.path.display(),
                    "Created worktree"
                );
                self.pool().active.insert(
                    index,
                    ActiveWorktree {
                        info: info.clone(),
                        repo_path: repo_path.to_path_buf(),
                    },
                );
                Ok(info)
            }
            Err(e) => {
                self.pool().in_use.remove(&index);
                Err(e)
            }
        }
    }

    async fn remove(&self, path: &Path) -> Result<(), WorktreeError> {
        let repo_path = {
            let mut pool = self.pool();
            let index = pool
                .active
                .iter()
                .find(|(_, active)| active.info.path == path)
                .map(|(i, _)| *i);
            index
                .and_then(|i| pool.active.remove(&i))
                .map(|active| active.repo_path)
        };

        let Some(repo_path) = repo_path else {
            tracing::debug!(path = %path.display(), "Worktree not tracked; nothing to remove");
            return Ok(());
        };

        git(&repo_path, &["worktree", "remove", "--force"], Some(path)).await?;
        tracing::info!(path = %path.display(), "Removed worktree");
        Ok(())
    }

    fn release_index(&self, index: usize) -> Result<(), WorktreeError> {
        let mut pool = self.pool();
        if !pool.in_use.remove(&index) {
            return Err(WorktreeError::IndexNotHeld(index));
        }
        pool.active.remove(&index);
        tracing::debug!(worktree_index = index, "Released worktree index");
        Ok(())
    }

    fn list_active(&self) -> Vec<WorktreeInfo> {
        self.pool()
            .active
            .values()
            .map(|active| active.info.clone())
            .collect()
    }

    async fn validate_isolation_strategy(&self, repo_path: &Path) -> Result<(), WorktreeError> {
        let unavailable = |message: String| WorktreeError::IsolationUnavailable {
            repo: repo_path.to_path_buf(),
            message,
        };

        {
            let repo = git2::Repository::open(repo_path).map_err(|e| unavailable(e.to_string()))?;
            if repo.is_bare() {
                return Err(unavailable("repository is bare".to_string()));
            }
            repo.head()
                .map_err(|e| unavailable(format!("repository has no usable HEAD: {}", e)))?;
        }

        git(repo_path, &["worktree", "list", "--porcelain"], None)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        Ok(())
    }
}

/// Pool stand-in that always hands out index 1 and the repository itself.
#[derive(Debug, Default)]
pub struct TestWorktreeManager {
    active: Mutex<Vec<WorktreeInfo>>,
}

impl TestWorktreeManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorktreeIsolation for TestWorktreeManager {
    fn acquire_index(&self) -> Result<usize, WorktreeError> {
        Ok(1)
    }

    async fn create(&self, branch: &str, repo_path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let info = WorktreeInfo {
            path: repo_path.to_path_buf(),
            branch: branch.to_string(),
            index: 1,
        };
        if let Ok(mut active) = self.active.lock() {
            active.push(info.clone());
        }
        Ok(info)
    }

    async fn remove(&self, _path: &Path) -> Result<(), WorktreeError> {
        Ok(())
    }

    fn release_index(&self, _index: usize) -> Result<(), WorktreeError> {
        Ok(())
    }

    fn list_active(&self) -> Vec<WorktreeInfo> {
        self.active.lock().map(|a| a.clone()).unwrap_or_default()
    }

    async fn validate_isolation_strategy(&self, _repo_path: &Path) -> Result<(), WorktreeError> {
        Ok(())
    }
}

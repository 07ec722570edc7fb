use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;
use crate::subprocess::Tool;

/// Where a worker for a given branch runs.
pub trait WorkspaceProvider {
    /// Directory for `branch`, whether or not it exists yet.
    fn path_for(&self, branch: &str) -> PathBuf;

    /// Make sure the directory exists and is on `branch`. Called before every
    /// worker start, so it must tolerate an existing workspace.
    fn prepare(&mut self, item_id: u64, branch: &str) -> anyhow::Result<PathBuf>;
}

/// One `git worktree` per branch under a common root.
pub struct GitWorktrees {
    repo_root: PathBuf,
    root: PathBuf,
    base_branch: String,
}

impl GitWorktrees {
    pub fn new(repo_root: &Path, root: &Path, base_branch: &str) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            root: root.to_path_buf(),
            base_branch: base_branch.to_string(),
        }
    }

    pub fn from_config(config: &Config, repo_root: &Path) -> Self {
        Self::new(
            repo_root,
            &config.workspace_root(repo_root),
            &config.workspace.base_branch,
        )
    }

    fn git(&self) -> Tool {
        Tool::new("git")
            .current_dir(&self.repo_root)
            .timeout(Duration::from_secs(120))
    }

    fn branch_exists(&self, branch: &str) -> bool {
        let reference = format!("refs/heads/{branch}");
        self.git()
            .args(&["show-ref", "--verify", "--quiet", &reference])
            .run()
            .is_ok_and(|o| o.success())
    }
}

impl WorkspaceProvider for GitWorktrees {
    fn path_for(&self, branch: &str) -> PathBuf {
        self.root.join(branch)
    }

    fn prepare(&mut self, item_id: u64, branch: &str) -> anyhow::Result<PathBuf> {
        let path = self.path_for(branch);
        if path.join(".git").exists() {
            return Ok(path);
        }
        std::fs::create_dir_all(&self.root)?;
        let target = path.to_string_lossy().into_owned();
        if self.branch_exists(branch) {
            self.git().args(&["worktree", "add", &target, branch]).run_ok()?;
        } else {
            self.git()
                .args(&["worktree", "add", "-b", branch, &target, &self.base_branch])
                .run_ok()?;
        }
        tracing::info!(item = item_id, branch, path = %path.display(), "worktree created");
        Ok(path)
    }
}

//! Worker isolation: one worktree and one branch per (run, worker).

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use swarm_core::types::{worker_branch, RunId, WorkerId};

use crate::command::GitCli;
use crate::error::GitError;
use crate::merge::branch_exists;
use crate::repo::RepoHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub run_id: RunId,
    pub worker_id: WorkerId,
    pub branch: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedWorktree {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeManager {
    git: GitCli,
    root: PathBuf,
}

impl WorktreeManager {
    pub fn new(git: GitCli, root: impl Into<PathBuf>) -> Self {
        Self {
            git,
            root: root.into(),
        }
    }

    pub fn worker_path(&self, run_id: &RunId, worker_id: &WorkerId) -> PathBuf {
        self.root.join(&run_id.0).join(&worker_id.0)
    }

    /// Ensure a fresh branch off `base_branch` and a worktree for the
    /// worker. Idempotent: an existing worktree (after a crash or webhook
    /// replay) is reused rather than recreated.
    pub fn create_worktree(
        &self,
        repo: &RepoHandle,
        run_id: &RunId,
        worker_id: &WorkerId,
        base_branch: &str,
    ) -> Result<WorktreeInfo, GitError> {
        let branch = worker_branch(run_id, worker_id);
        let path = self.worker_path(run_id, worker_id);

        if path.join(".git").exists() {
            return Ok(WorktreeInfo {
                run_id: run_id.clone(),
                worker_id: worker_id.clone(),
                branch,
                path,
            });
        }

        let parent = self.root.join(&run_id.0);
        fs::create_dir_all(&parent).map_err(|source| GitError::Io {
            command: format!("create_dir_all {}", parent.display()),
            source,
        })?;

        if branch_exists(repo, &self.git, &branch)? {
            // Branch survived a crash; attach a worktree to it as-is.
            self.git.run(
                &repo.root,
                [
                    "worktree",
                    "add",
                    path.to_string_lossy().as_ref(),
                    branch.as_str(),
                ],
            )?;
        } else {
            self.git.run(
                &repo.root,
                [
                    "worktree",
                    "add",
                    "-b",
                    branch.as_str(),
                    path.to_string_lossy().as_ref(),
                    base_branch,
                ],
            )?;
        }

        Ok(WorktreeInfo {
            run_id: run_id.clone(),
            worker_id: worker_id.clone(),
            branch,
            path,
        })
    }

    /// Prune the worktree and force-delete its branch.
    pub fn remove_worktree(
        &self,
        repo: &RepoHandle,
        path: &PathBuf,
        branch: &str,
    ) -> Result<(), GitError> {
        let removed = self.git.run_status(
            &repo.root,
            [
                "worktree",
                "remove",
                "--force",
                path.to_string_lossy().as_ref(),
            ],
        )?;
        if !removed.success {
            // The directory may already be gone; prune stale metadata.
            self.git.run(&repo.root, ["worktree", "prune"])?;
        }

        let _ = self
            .git
            .run_status(&repo.root, ["branch", "-D", branch])?;
        Ok(())
    }

    /// All worktrees registered for one run.
    pub fn list_run_worktrees(
        &self,
        repo: &RepoHandle,
        run_id: &RunId,
    ) -> Result<Vec<ListedWorktree>, GitError> {
        let run_root = self.root.join(&run_id.0);
        Ok(self
            .list(repo)?
            .into_iter()
            .filter(|entry| entry.path.starts_with(&run_root))
            .collect())
    }

    pub fn list(&self, repo: &RepoHandle) -> Result<Vec<ListedWorktree>, GitError> {
        let output = self
            .git
            .run(&repo.root, ["worktree", "list", "--porcelain"])?;
        parse_worktree_list(&output.stdout)
    }
}

/// Porcelain output is blank-line-separated stanzas of `key value`
/// attributes (plus bare flags like `detached`); each stanza must open
/// with a `worktree` attribute.
fn parse_worktree_list(raw: &str) -> Result<Vec<ListedWorktree>, GitError> {
    raw.split("\n\n")
        .map(str::trim)
        .filter(|stanza| !stanza.is_empty())
        .map(parse_worktree_stanza)
        .collect()
}

fn parse_worktree_stanza(stanza: &str) -> Result<ListedWorktree, GitError> {
    let mut entry = ListedWorktree {
        path: PathBuf::new(),
        branch: None,
        head: None,
    };

    for attr in stanza.lines() {
        let (key, value) = attr.split_once(' ').unwrap_or((attr, ""));
        match key {
            "worktree" => entry.path = PathBuf::from(value.trim()),
            "branch" => {
                let name = value.trim().trim_start_matches("refs/heads/");
                entry.branch = Some(name.to_string());
            }
            "HEAD" => entry.head = Some(value.trim().to_string()),
            // Bare flags (detached, bare, locked …) carry no data we keep.
            _ => {}
        }
    }

    if entry.path.as_os_str().is_empty() {
        return Err(GitError::Parse {
            context: format!("worktree list stanza has no worktree path: {stanza:?}"),
        });
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use std::time::{SystemTime, UNIX_EPOCH};

    use swarm_core::types::{RunId, WorkerId};

    use super::{parse_worktree_list, WorktreeManager};
    use crate::command::GitCli;
    use crate::repo::discover_repo;

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("swarmops-worktree-{prefix}-{now}"))
    }

    fn run_git(cwd: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn init_repo() -> PathBuf {
        let root = unique_temp_dir("repo");
        fs::create_dir_all(&root).expect("create temp repo");
        run_git(&root, &["init", "-b", "main"]);
        fs::write(root.join("README.md"), "init\n").expect("write file");
        run_git(&root, &["add", "README.md"]);
        run_git(
            &root,
            &[
                "-c",
                "user.name=Test User",
                "-c",
                "user.email=test@example.com",
                "commit",
                "-m",
                "init",
            ],
        );
        root
    }

    #[test]
    fn parse_worktree_list_parses_multiple_entries() {
        let raw = "\
worktree /repo
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /wt/run-1/w-1
HEAD 2222222222222222222222222222222222222222
branch refs/heads/swarmops/run-1/w-1

";
        let parsed = parse_worktree_list(raw).expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].branch.as_deref(), Some("main"));
        assert_eq!(parsed[1].path, PathBuf::from("/wt/run-1/w-1"));
        assert_eq!(parsed[1].branch.as_deref(), Some("swarmops/run-1/w-1"));
    }

    #[test]
    fn parse_worktree_list_handles_detached_entry() {
        let raw = "\
worktree /wt/run-1/w-2
HEAD 3333333333333333333333333333333333333333
detached

";
        let parsed = parse_worktree_list(raw).expect("parse");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].branch, None);
    }

    #[test]
    fn parse_worktree_list_rejects_garbage() {
        let err = parse_worktree_list("nonsense output").expect_err("parse error");
        assert!(matches!(err, crate::error::GitError::Parse { .. }));
    }

    #[test]
    fn worker_path_joins_root_run_and_worker() {
        let manager = WorktreeManager::new(GitCli::default(), "/tmp/wt");
        let path = manager.worker_path(&RunId::new("run-9"), &WorkerId::new("w-3"));
        assert_eq!(path, PathBuf::from("/tmp/wt/run-9/w-3"));
    }

    #[test]
    fn create_is_idempotent_and_remove_deletes_branch() {
        let root = init_repo();
        let git = GitCli::default();
        let repo = discover_repo(&root, &git).expect("discover repo");
        let wt_root = unique_temp_dir("wt");
        let manager = WorktreeManager::new(git.clone(), &wt_root);

        let run = RunId::new("run-1");
        let worker = WorkerId::new("w-1");
        let info = manager
            .create_worktree(&repo, &run, &worker, "main")
            .expect("create worktree");
        assert_eq!(info.branch, "swarmops/run-1/w-1");
        assert!(info.path.exists());

        // Second call reuses the existing worktree.
        let again = manager
            .create_worktree(&repo, &run, &worker, "main")
            .expect("idempotent create");
        assert_eq!(again, info);

        let listed = manager
            .list_run_worktrees(&repo, &run)
            .expect("list worktrees");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].branch.as_deref(), Some("swarmops/run-1/w-1"));

        manager
            .remove_worktree(&repo, &info.path, &info.branch)
            .expect("remove worktree");
        assert!(!info.path.exists());
        assert!(
            !crate::merge::branch_exists(&repo, &git, &info.branch).expect("branch check"),
            "branch should be deleted"
        );

        let _ = fs::remove_dir_all(&root);
        let _ = fs::remove_dir_all(&wt_root);
    }

    #[test]
    fn create_reattaches_surviving_branch_after_worktree_loss() {
        let root = init_repo();
        let git = GitCli::default();
        let repo = discover_repo(&root, &git).expect("discover repo");
        let wt_root = unique_temp_dir("wt-reattach");
        let manager = WorktreeManager::new(git.clone(), &wt_root);

        let run = RunId::new("run-2");
        let worker = WorkerId::new("w-1");
        let info = manager
            .create_worktree(&repo, &run, &worker, "main")
            .expect("create worktree");

        // Simulate a crash that lost the worktree directory but kept the
        // branch.
        fs::remove_dir_all(&info.path).expect("drop worktree dir");
        run_git(&root, &["worktree", "prune"]);

        let again = manager
            .create_worktree(&repo, &run, &worker, "main")
            .expect("recreate worktree");
        assert_eq!(again.branch, info.branch);
        assert!(again.path.exists());

        let _ = fs::remove_dir_all(&root);
        let _ = fs::remove_dir_all(&wt_root);
    }
}

//! Branch and merge helpers used by the phase pipeline.

use serde::{Deserialize, Serialize};

use crate::command::GitCli;
use crate::error::GitError;
use crate::repo::RepoHandle;

/// Result of merging one branch into the current checkout. A conflict is
/// data for the conflict-resolver flow, not an error; the caller owns
/// `git merge --abort` and restoring the original branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeOutcome {
    Clean,
    Conflicted { files: Vec<String> },
}

impl MergeOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

pub fn branch_exists(repo: &RepoHandle, git: &GitCli, branch: &str) -> Result<bool, GitError> {
    let output = git.run_status(
        &repo.root,
        [
            "rev-parse",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ],
    )?;
    Ok(output.success)
}

pub fn create_branch(
    repo: &RepoHandle,
    git: &GitCli,
    name: &str,
    from: &str,
) -> Result<(), GitError> {
    git.run(&repo.root, ["branch", name, from])?;
    Ok(())
}

/// Create the branch at `from`, moving it if it already exists. Used for
/// phase branches, which are recreated at collection time.
pub fn recreate_branch(
    repo: &RepoHandle,
    git: &GitCli,
    name: &str,
    from: &str,
) -> Result<(), GitError> {
    git.run(&repo.root, ["branch", "-f", name, from])?;
    Ok(())
}

pub fn checkout_branch(repo: &RepoHandle, git: &GitCli, name: &str) -> Result<(), GitError> {
    git.run(&repo.root, ["checkout", name])?;
    Ok(())
}

pub fn delete_branch(repo: &RepoHandle, git: &GitCli, name: &str) -> Result<(), GitError> {
    let _ = git.run_status(&repo.root, ["branch", "-D", name])?;
    Ok(())
}

/// Whether `branch` carries commits that `base` does not have.
pub fn branch_has_commits_beyond(
    repo: &RepoHandle,
    git: &GitCli,
    branch: &str,
    base: &str,
) -> Result<bool, GitError> {
    let output = git.run(
        &repo.root,
        ["rev-list", "--count", &format!("{base}..{branch}")],
    )?;
    let count: u64 = output
        .stdout
        .trim()
        .parse()
        .map_err(|_| GitError::Parse {
            context: format!("rev-list count output: {:?}", output.stdout.trim()),
        })?;
    Ok(count > 0)
}

/// Merge `source` into the currently checked-out branch.
pub fn merge_branch(
    repo: &RepoHandle,
    git: &GitCli,
    source: &str,
    message: &str,
) -> Result<MergeOutcome, GitError> {
    let output = git.run_status(
        &repo.root,
        ["merge", "--no-ff", "-m", message, source],
    )?;
    if output.success {
        return Ok(MergeOutcome::Clean);
    }

    let files = conflict_files(repo, git)?;
    if files.is_empty() {
        // Not a content conflict (e.g. unknown ref); surface as failure.
        return Err(GitError::CommandFailed {
            command: format!("git merge --no-ff -m {message:?} {source}"),
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    Ok(MergeOutcome::Conflicted { files })
}

/// Abort an in-progress merge; a no-merge state is not an error.
pub fn abort_merge(repo: &RepoHandle, git: &GitCli) -> Result<(), GitError> {
    let _ = git.run_status(&repo.root, ["merge", "--abort"])?;
    Ok(())
}

/// Paths still unmerged in the index.
pub fn conflict_files(repo: &RepoHandle, git: &GitCli) -> Result<Vec<String>, GitError> {
    let output = git.run(&repo.root, ["diff", "--name-only", "--diff-filter=U"])?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::command::GitCli;
    use crate::repo::{discover_repo, head_sha};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("swarmops-merge-{prefix}-{now}"))
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

    fn commit_all(cwd: &Path, message: &str) {
        run_git(cwd, &["add", "-A"]);
        run_git(
            cwd,
            &[
                "-c",
                "user.name=Test User",
                "-c",
                "user.email=test@example.com",
                "commit",
                "-m",
                message,
            ],
        );
    }

    fn init_repo() -> PathBuf {
        let root = unique_temp_dir("repo");
        fs::create_dir_all(&root).expect("create temp repo");
        run_git(&root, &["init", "-b", "main"]);
        fs::write(root.join("README.md"), "init\n").expect("write file");
        commit_all(&root, "init");
        root
    }

    #[test]
    fn branch_exists_and_create_and_delete() {
        let root = init_repo();
        let git = GitCli::default();
        let repo = discover_repo(&root, &git).expect("discover");

        assert!(!branch_exists(&repo, &git, "topic").expect("check"));
        create_branch(&repo, &git, "topic", "main").expect("create");
        assert!(branch_exists(&repo, &git, "topic").expect("check"));
        delete_branch(&repo, &git, "topic").expect("delete");
        assert!(!branch_exists(&repo, &git, "topic").expect("check"));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn clean_merge_brings_commits_over() {
        let root = init_repo();
        let git = GitCli::default();
        let repo = discover_repo(&root, &git).expect("discover");

        create_branch(&repo, &git, "feature", "main").expect("create");
        checkout_branch(&repo, &git, "feature").expect("checkout");
        fs::write(root.join("feature.txt"), "work\n").expect("write");
        commit_all(&root, "feature work");
        checkout_branch(&repo, &git, "main").expect("checkout main");

        assert!(branch_has_commits_beyond(&repo, &git, "feature", "main").expect("count"));
        let outcome =
            merge_branch(&repo, &git, "feature", "Merge feature").expect("merge");
        assert!(outcome.is_clean());
        assert!(root.join("feature.txt").exists());
        assert!(!branch_has_commits_beyond(&repo, &git, "feature", "main").expect("count"));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn conflicting_merge_reports_files_and_abort_restores_head() {
        let root = init_repo();
        let git = GitCli::default();
        let repo = discover_repo(&root, &git).expect("discover");

        create_branch(&repo, &git, "left", "main").expect("create left");
        checkout_branch(&repo, &git, "left").expect("checkout left");
        fs::write(root.join("README.md"), "left version\n").expect("write");
        commit_all(&root, "left edit");

        checkout_branch(&repo, &git, "main").expect("checkout main");
        fs::write(root.join("README.md"), "main version\n").expect("write");
        commit_all(&root, "main edit");

        let pre_merge = head_sha(&repo, &git).expect("sha");
        let outcome = merge_branch(&repo, &git, "left", "Merge left").expect("merge");
        match outcome {
            MergeOutcome::Conflicted { files } => {
                assert_eq!(files, vec!["README.md".to_string()]);
            }
            MergeOutcome::Clean => panic!("expected conflict"),
        }

        abort_merge(&repo, &git).expect("abort");
        assert_eq!(head_sha(&repo, &git).expect("sha"), pre_merge);
        assert!(conflict_files(&repo, &git).expect("files").is_empty());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn abort_without_merge_in_progress_is_a_no_op() {
        let root = init_repo();
        let git = GitCli::default();
        let repo = discover_repo(&root, &git).expect("discover");
        abort_merge(&repo, &git).expect("abort");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn recreate_branch_moves_an_existing_branch() {
        let root = init_repo();
        let git = GitCli::default();
        let repo = discover_repo(&root, &git).expect("discover");

        create_branch(&repo, &git, "phase", "main").expect("create");
        checkout_branch(&repo, &git, "phase").expect("checkout");
        fs::write(root.join("p.txt"), "p\n").expect("write");
        commit_all(&root, "phase work");
        checkout_branch(&repo, &git, "main").expect("checkout main");

        // Recreate resets the branch back to main's tip.
        recreate_branch(&repo, &git, "phase", "main").expect("recreate");
        assert!(!branch_has_commits_beyond(&repo, &git, "phase", "main").expect("count"));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn merge_of_unknown_ref_is_an_error_not_a_conflict() {
        let root = init_repo();
        let git = GitCli::default();
        let repo = discover_repo(&root, &git).expect("discover");

        let err = merge_branch(&repo, &git, "no-such-branch", "Merge nothing")
            .expect_err("unknown ref");
        assert!(matches!(err, GitError::CommandFailed { .. }));

        let _ = fs::remove_dir_all(&root);
    }
}

//! Phase merging: collected worker branches fold into the phase branch
//! one at a time, and an approved phase branch folds into base.
//!
//! Both operations serialize on the per-repo lock, touch the main repo
//! HEAD only transiently, and restore the original branch before
//! returning — including on the conflict path, where the in-progress
//! merge is aborted first. The orchestrator owns what happens next
//! (resolver dispatch, review chain, escalations).

use std::path::Path;

use swarm_core::types::RunId;
use swarm_git::{
    abort_merge, checkout_branch, current_branch, merge_branch, GitCli, GitError, MergeOutcome,
    RepoHandle,
};
use swarm_store::PathLocks;

/// Result of one pass over the collected branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseMergeOutcome {
    /// Every branch merged cleanly into the phase branch.
    AllMerged,
    /// A merge conflicted. The merge was aborted, HEAD is back on the
    /// original branch, and the remainder waits on the resolver.
    Conflicted {
        source_branch: String,
        conflict_files: Vec<String>,
        remaining_branches: Vec<String>,
    },
}

/// The exact commit message recorded when an approved phase lands on base.
pub fn phase_merge_message(run_id: &RunId, phase_number: u32) -> String {
    format!("Merge phase {phase_number} (run: {run_id}) - Approved by AI review")
}

/// Merge `branches` into `target` (the phase branch), in order.
pub fn merge_branches_into_phase(
    git: &GitCli,
    repo: &RepoHandle,
    locks: &PathLocks,
    repo_key: &Path,
    target: &str,
    branches: &[String],
) -> Result<PhaseMergeOutcome, GitError> {
    locks.with_path(repo_key, || {
        let original = current_branch(repo, git)?;
        checkout_branch(repo, git, target)?;

        for (idx, branch) in branches.iter().enumerate() {
            let message = format!("Merge {branch} into {target}");
            match merge_branch(repo, git, branch, &message)? {
                MergeOutcome::Clean => continue,
                MergeOutcome::Conflicted { files } => {
                    abort_merge(repo, git)?;
                    checkout_branch(repo, git, &original)?;
                    return Ok(PhaseMergeOutcome::Conflicted {
                        source_branch: branch.clone(),
                        conflict_files: files,
                        remaining_branches: branches[idx + 1..].to_vec(),
                    });
                }
            }
        }

        checkout_branch(repo, git, &original)?;
        Ok(PhaseMergeOutcome::AllMerged)
    })
}

/// Merge the approved phase branch into `base_branch`. A conflict here is
/// aborted and HEAD restored; the caller fails the phase and escalates.
pub fn merge_phase_into_base(
    git: &GitCli,
    repo: &RepoHandle,
    locks: &PathLocks,
    repo_key: &Path,
    base_branch: &str,
    phase_branch: &str,
    message: &str,
) -> Result<MergeOutcome, GitError> {
    locks.with_path(repo_key, || {
        let original = current_branch(repo, git)?;
        checkout_branch(repo, git, base_branch)?;
        let outcome = merge_branch(repo, git, phase_branch, message)?;
        if let MergeOutcome::Conflicted { .. } = outcome {
            abort_merge(repo, git)?;
        }
        checkout_branch(repo, git, &original)?;
        Ok(outcome)
    })
}

//! The review chain: a fixed sequence of reviewer roles that must approve
//! in order, with a bounded fixer loop in between.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use swarm_core::state::ReviewCycleStatus;
use swarm_core::types::RunId;
use swarm_gateway::types::{ReviewDecision, ReviewFinding};
use swarm_store::{read_json, write_json_atomic, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("review cycle not found: {run_id} phase {phase_number}")]
    NotFound { run_id: String, phase_number: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewAttempt {
    pub at: DateTime<Utc>,
    pub reviewer_role: String,
    pub decision: ReviewDecision,
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewCycle {
    pub run_id: RunId,
    pub phase_number: u32,
    pub status: ReviewCycleStatus,
    /// Reviewer roles, in the order they must approve.
    pub chain: Vec<String>,
    /// Index of the reviewer whose verdict is currently awaited.
    pub reviewer_index: usize,
    pub fix_count: u32,
    pub max_fix_attempts: u32,
    #[serde(default)]
    pub pending_findings: Vec<ReviewFinding>,
    #[serde(default)]
    pub history: Vec<ReviewAttempt>,
    #[serde(default)]
    pub current_session_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewCycle {
    pub fn new(run_id: RunId, phase_number: u32, chain: Vec<String>, max_fix_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            phase_number,
            status: ReviewCycleStatus::Pending,
            chain,
            reviewer_index: 0,
            fix_count: 0,
            max_fix_attempts,
            pending_findings: Vec::new(),
            history: Vec::new(),
            current_session_key: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current_reviewer(&self) -> Option<&str> {
        self.chain.get(self.reviewer_index).map(String::as_str)
    }
}

/// What the orchestrator must do after a review decision lands.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewStep {
    /// This reviewer approved and another one is next in the chain.
    SpawnNextReviewer { role: String },
    /// The last reviewer approved: merge the phase branch into base.
    MergeToBase,
    /// Findings need a fixer agent; the fix budget allows it.
    SpawnFixer { findings: Vec<ReviewFinding> },
    /// request_changes with zero findings: a human has to interpret it.
    NeedsClarification,
    /// Fix budget exhausted; escalate.
    Escalate { reason: String },
    /// Replayed or out-of-order webhook; nothing to do.
    Ignore { reason: String },
}

/// Apply one reviewer verdict to the cycle. Pure state-machine step; the
/// caller persists the cycle and executes the returned action.
pub fn apply_review_decision(
    cycle: &mut ReviewCycle,
    decision: ReviewDecision,
    findings: Vec<ReviewFinding>,
    summary: Option<String>,
    now: DateTime<Utc>,
) -> ReviewStep {
    if cycle.status != ReviewCycleStatus::Pending {
        return ReviewStep::Ignore {
            reason: format!("review cycle is {:?}, not awaiting a verdict", cycle.status),
        };
    }
    let Some(reviewer) = cycle.current_reviewer().map(str::to_string) else {
        return ReviewStep::Ignore {
            reason: "review chain is empty".to_string(),
        };
    };

    cycle.history.push(ReviewAttempt {
        at: now,
        reviewer_role: reviewer,
        decision,
        findings: findings.clone(),
        summary,
    });
    cycle.updated_at = now;

    match decision {
        ReviewDecision::Approved => {
            if cycle.reviewer_index + 1 < cycle.chain.len() {
                cycle.reviewer_index += 1;
                ReviewStep::SpawnNextReviewer {
                    role: cycle.chain[cycle.reviewer_index].clone(),
                }
            } else {
                cycle.status = ReviewCycleStatus::Approved;
                ReviewStep::MergeToBase
            }
        }
        ReviewDecision::RequestChanges if findings.is_empty() => {
            // Respect the reviewer's verdict but don't guess what to fix.
            cycle.status = ReviewCycleStatus::NeedsClarification;
            ReviewStep::NeedsClarification
        }
        ReviewDecision::RequestChanges => {
            if cycle.fix_count < cycle.max_fix_attempts {
                cycle.fix_count += 1;
                cycle.status = ReviewCycleStatus::Fixing;
                cycle.pending_findings = findings.clone();
                ReviewStep::SpawnFixer { findings }
            } else {
                cycle.status = ReviewCycleStatus::Escalated;
                ReviewStep::Escalate {
                    reason: format!(
                        "fix attempts exhausted ({}/{})",
                        cycle.fix_count, cycle.max_fix_attempts
                    ),
                }
            }
        }
    }
}

/// The fixer reported done: the current reviewer must re-review.
/// Returns the reviewer role to respawn, or `None` for a replay.
pub fn apply_fix_complete(cycle: &mut ReviewCycle, now: DateTime<Utc>) -> Option<String> {
    if cycle.status != ReviewCycleStatus::Fixing {
        return None;
    }
    cycle.status = ReviewCycleStatus::PendingReview;
    cycle.pending_findings.clear();
    cycle.updated_at = now;
    cycle.current_reviewer().map(str::to_string)
}

/// The re-review agent was spawned; the cycle awaits its verdict again.
pub fn mark_review_pending(cycle: &mut ReviewCycle, now: DateTime<Utc>) {
    if cycle.status == ReviewCycleStatus::PendingReview {
        cycle.status = ReviewCycleStatus::Pending;
        cycle.updated_at = now;
    }
}

#[derive(Debug)]
pub struct ReviewStore {
    dir: PathBuf,
    live: Mutex<HashMap<String, ReviewCycle>>,
}

impl ReviewStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            live: Mutex::new(HashMap::new()),
        }
    }

    fn key(run_id: &RunId, phase_number: u32) -> String {
        format!("{}-phase-{phase_number}", run_id.0)
    }

    fn path(&self, run_id: &RunId, phase_number: u32) -> PathBuf {
        self.dir
            .join(format!("{}.json", Self::key(run_id, phase_number)))
    }

    pub fn init_cycle(
        &self,
        run_id: &RunId,
        phase_number: u32,
        chain: Vec<String>,
        max_fix_attempts: u32,
    ) -> Result<ReviewCycle, ReviewError> {
        if let Some(existing) = self.get(run_id, phase_number)? {
            return Ok(existing);
        }
        let cycle = ReviewCycle::new(run_id.clone(), phase_number, chain, max_fix_attempts);
        write_json_atomic(&self.path(run_id, phase_number), &cycle)?;
        self.lock()
            .insert(Self::key(run_id, phase_number), cycle.clone());
        Ok(cycle)
    }

    pub fn get(
        &self,
        run_id: &RunId,
        phase_number: u32,
    ) -> Result<Option<ReviewCycle>, ReviewError> {
        if let Some(cycle) = self.lock().get(&Self::key(run_id, phase_number)) {
            return Ok(Some(cycle.clone()));
        }
        Ok(read_json(&self.path(run_id, phase_number))?)
    }

    /// Load, mutate, persist; the closure's return value passes through.
    pub fn update<R, F>(
        &self,
        run_id: &RunId,
        phase_number: u32,
        mutate: F,
    ) -> Result<(ReviewCycle, R), ReviewError>
    where
        F: FnOnce(&mut ReviewCycle) -> R,
    {
        let mut table = self.lock();
        let key = Self::key(run_id, phase_number);
        let cycle = match table.get_mut(&key) {
            Some(cycle) => cycle,
            None => {
                let loaded: ReviewCycle = read_json(&self.path(run_id, phase_number))?
                    .ok_or_else(|| ReviewError::NotFound {
                        run_id: run_id.0.clone(),
                        phase_number,
                    })?;
                table.entry(key).or_insert(loaded)
            }
        };

        let result = mutate(cycle);
        let snapshot = cycle.clone();
        write_json_atomic(&self.path(run_id, phase_number), &snapshot)?;
        Ok((snapshot, result))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ReviewCycle>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn chain() -> Vec<String> {
        vec![
            "reviewer".to_string(),
            "security-reviewer".to_string(),
            "designer".to_string(),
        ]
    }

    fn mk_cycle() -> ReviewCycle {
        ReviewCycle::new(RunId::new("run-1"), 1, chain(), 3)
    }

    fn finding(description: &str) -> ReviewFinding {
        ReviewFinding {
            severity: "medium".to_string(),
            file: "src/lib.rs".to_string(),
            line: None,
            description: description.to_string(),
            fix: None,
        }
    }

    #[test]
    fn approvals_walk_the_chain_in_order() {
        let mut cycle = mk_cycle();

        let step = apply_review_decision(
            &mut cycle,
            ReviewDecision::Approved,
            Vec::new(),
            None,
            Utc::now(),
        );
        assert_eq!(
            step,
            ReviewStep::SpawnNextReviewer {
                role: "security-reviewer".to_string()
            }
        );
        assert_eq!(cycle.status, ReviewCycleStatus::Pending);

        let step = apply_review_decision(
            &mut cycle,
            ReviewDecision::Approved,
            Vec::new(),
            None,
            Utc::now(),
        );
        assert_eq!(
            step,
            ReviewStep::SpawnNextReviewer {
                role: "designer".to_string()
            }
        );

        let step = apply_review_decision(
            &mut cycle,
            ReviewDecision::Approved,
            Vec::new(),
            None,
            Utc::now(),
        );
        assert_eq!(step, ReviewStep::MergeToBase);
        assert_eq!(cycle.status, ReviewCycleStatus::Approved);
        assert_eq!(cycle.history.len(), 3);
    }

    #[test]
    fn request_changes_with_findings_spawns_fixer_and_counts() {
        let mut cycle = mk_cycle();
        let step = apply_review_decision(
            &mut cycle,
            ReviewDecision::RequestChanges,
            vec![finding("broken"), finding("also broken")],
            Some("two problems".to_string()),
            Utc::now(),
        );
        assert!(matches!(step, ReviewStep::SpawnFixer { ref findings } if findings.len() == 2));
        assert_eq!(cycle.status, ReviewCycleStatus::Fixing);
        assert_eq!(cycle.fix_count, 1);
        assert_eq!(cycle.pending_findings.len(), 2);
    }

    #[test]
    fn zero_finding_rejection_needs_clarification() {
        let mut cycle = mk_cycle();
        let step = apply_review_decision(
            &mut cycle,
            ReviewDecision::RequestChanges,
            Vec::new(),
            Some("something feels off".to_string()),
            Utc::now(),
        );
        assert_eq!(step, ReviewStep::NeedsClarification);
        assert_eq!(cycle.status, ReviewCycleStatus::NeedsClarification);
        assert_eq!(cycle.fix_count, 0, "no fixer was spawned");
    }

    #[test]
    fn exhausted_fix_budget_escalates() {
        let mut cycle = mk_cycle();
        cycle.max_fix_attempts = 1;

        apply_review_decision(
            &mut cycle,
            ReviewDecision::RequestChanges,
            vec![finding("first")],
            None,
            Utc::now(),
        );
        apply_fix_complete(&mut cycle, Utc::now());
        mark_review_pending(&mut cycle, Utc::now());

        let step = apply_review_decision(
            &mut cycle,
            ReviewDecision::RequestChanges,
            vec![finding("still broken")],
            None,
            Utc::now(),
        );
        assert!(matches!(step, ReviewStep::Escalate { .. }));
        assert_eq!(cycle.status, ReviewCycleStatus::Escalated);
        assert!(cycle.fix_count <= cycle.max_fix_attempts);
    }

    #[test]
    fn fix_cycle_walks_fixing_pending_review_pending() {
        let mut cycle = mk_cycle();
        apply_review_decision(
            &mut cycle,
            ReviewDecision::RequestChanges,
            vec![finding("broken")],
            None,
            Utc::now(),
        );
        assert_eq!(cycle.status, ReviewCycleStatus::Fixing);

        let respawn = apply_fix_complete(&mut cycle, Utc::now());
        assert_eq!(respawn.as_deref(), Some("reviewer"));
        assert_eq!(cycle.status, ReviewCycleStatus::PendingReview);
        assert!(cycle.pending_findings.is_empty());

        mark_review_pending(&mut cycle, Utc::now());
        assert_eq!(cycle.status, ReviewCycleStatus::Pending);

        // Now the same reviewer approves; the chain continues from where
        // it stopped, not from the beginning.
        let step = apply_review_decision(
            &mut cycle,
            ReviewDecision::Approved,
            Vec::new(),
            None,
            Utc::now(),
        );
        assert_eq!(
            step,
            ReviewStep::SpawnNextReviewer {
                role: "security-reviewer".to_string()
            }
        );
        assert_eq!(cycle.fix_count, 1);
    }

    #[test]
    fn replayed_webhooks_are_ignored() {
        let mut cycle = mk_cycle();
        cycle.status = ReviewCycleStatus::Merged;
        let step = apply_review_decision(
            &mut cycle,
            ReviewDecision::Approved,
            Vec::new(),
            None,
            Utc::now(),
        );
        assert!(matches!(step, ReviewStep::Ignore { .. }));

        let mut fixing_done = mk_cycle();
        assert!(apply_fix_complete(&mut fixing_done, Utc::now()).is_none());
    }

    #[test]
    fn store_init_is_idempotent_and_survives_restart() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("swarmops-review-{now}"));
        let store = ReviewStore::new(&dir);
        let run = RunId::new("run-1");

        let cycle = store.init_cycle(&run, 1, chain(), 3).expect("init");
        store
            .update(&run, 1, |cycle| {
                apply_review_decision(
                    cycle,
                    ReviewDecision::Approved,
                    Vec::new(),
                    None,
                    Utc::now(),
                )
            })
            .expect("update");

        // Re-init returns the advanced cycle, not a fresh one.
        let again = store.init_cycle(&run, 1, chain(), 3).expect("re-init");
        assert_eq!(again.reviewer_index, 1);
        assert_ne!(again, cycle);

        // Restart: a fresh store reads the same state.
        let restarted = ReviewStore::new(&dir);
        let loaded = restarted.get(&run, 1).expect("get").expect("present");
        assert_eq!(loaded.reviewer_index, 1);
        let _ = fs::remove_dir_all(dir);
    }
}

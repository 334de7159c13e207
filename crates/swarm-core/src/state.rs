//! Status enums and the transition guards shared across the orchestrator.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid work status transition: {from:?} -> {to:?}")]
    InvalidWorkTransition { from: WorkStatus, to: WorkStatus },
    #[error("invalid phase status transition: {from:?} -> {to:?}")]
    InvalidPhaseTransition { from: PhaseStatus, to: PhaseStatus },
}

/// Status of one ledger work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl WorkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Guard the ledger status machine: `pending -> running`,
/// `running -> {complete, failed, cancelled}`, and the administrative
/// `pending -> cancelled`. Same-state writes are allowed (idempotent replay).
pub fn check_work_transition(from: WorkStatus, to: WorkStatus) -> Result<(), StateError> {
    use WorkStatus::*;

    if from == to {
        return Ok(());
    }

    let allowed = matches!(
        (from, to),
        (Pending, Running) | (Running, Complete | Failed | Cancelled) | (Pending, Cancelled)
    );
    if allowed {
        Ok(())
    } else {
        Err(StateError::InvalidWorkTransition { from, to })
    }
}

/// Status of one worker (agent instance bound to a task in a run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Status of a phase within a run. Advances strictly in declaration order;
/// `Failed` is a terminal sink reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Collecting,
    Merging,
    Reviewing,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

pub fn check_phase_transition(from: PhaseStatus, to: PhaseStatus) -> Result<(), StateError> {
    if from == to {
        return Ok(());
    }
    if from == PhaseStatus::Failed {
        return Err(StateError::InvalidPhaseTransition { from, to });
    }
    if to == PhaseStatus::Failed || to > from {
        Ok(())
    } else {
        Err(StateError::InvalidPhaseTransition { from, to })
    }
}

/// Status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Merging,
    Reviewing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Status of a review cycle attached to one phase merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewCycleStatus {
    Pending,
    Fixing,
    PendingReview,
    NeedsClarification,
    Approved,
    Merged,
    Escalated,
}

impl ReviewCycleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Escalated)
    }
}

/// Per-step result inside a run file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

/// Lifecycle phase of a project, driven by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    Interview,
    Spec,
    Build,
    Review,
    Complete,
}

impl Default for ProjectPhase {
    fn default() -> Self {
        Self::Interview
    }
}

impl ProjectPhase {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Interview => Some(Self::Spec),
            Self::Spec => Some(Self::Build),
            Self::Build => Some(Self::Review),
            Self::Review => Some(Self::Complete),
            Self::Complete => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interview => "interview",
            Self::Spec => "spec",
            Self::Build => "build",
            Self::Review => "review",
            Self::Complete => "complete",
        }
    }
}

/// Status of a human escalation queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Open,
    Resolved,
    Dismissed,
}

impl EscalationStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_transitions_follow_the_guard_table() {
        assert!(check_work_transition(WorkStatus::Pending, WorkStatus::Running).is_ok());
        assert!(check_work_transition(WorkStatus::Running, WorkStatus::Complete).is_ok());
        assert!(check_work_transition(WorkStatus::Running, WorkStatus::Failed).is_ok());
        assert!(check_work_transition(WorkStatus::Running, WorkStatus::Cancelled).is_ok());
        assert!(check_work_transition(WorkStatus::Pending, WorkStatus::Cancelled).is_ok());

        assert!(check_work_transition(WorkStatus::Complete, WorkStatus::Pending).is_err());
        assert!(check_work_transition(WorkStatus::Failed, WorkStatus::Running).is_err());
        assert!(check_work_transition(WorkStatus::Pending, WorkStatus::Complete).is_err());
    }

    #[test]
    fn same_state_writes_are_idempotent() {
        assert!(check_work_transition(WorkStatus::Running, WorkStatus::Running).is_ok());
        assert!(check_phase_transition(PhaseStatus::Merging, PhaseStatus::Merging).is_ok());
    }

    #[test]
    fn phase_status_only_advances_forward() {
        assert!(check_phase_transition(PhaseStatus::Pending, PhaseStatus::Running).is_ok());
        assert!(check_phase_transition(PhaseStatus::Running, PhaseStatus::Merging).is_ok());
        assert!(check_phase_transition(PhaseStatus::Reviewing, PhaseStatus::Completed).is_ok());
        assert!(check_phase_transition(PhaseStatus::Merging, PhaseStatus::Running).is_err());
        assert!(check_phase_transition(PhaseStatus::Completed, PhaseStatus::Pending).is_err());
    }

    #[test]
    fn failed_phase_is_a_sink() {
        assert!(check_phase_transition(PhaseStatus::Running, PhaseStatus::Failed).is_ok());
        assert!(check_phase_transition(PhaseStatus::Failed, PhaseStatus::Running).is_err());
        assert!(check_phase_transition(PhaseStatus::Failed, PhaseStatus::Completed).is_err());
    }

    #[test]
    fn statuses_serialize_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&WorkStatus::Complete).unwrap(),
            "\"complete\""
        );
        assert_eq!(
            serde_json::to_string(&ReviewCycleStatus::PendingReview).unwrap(),
            "\"pending_review\""
        );
        assert_eq!(
            serde_json::to_string(&ProjectPhase::Build).unwrap(),
            "\"build\""
        );
    }

    #[test]
    fn project_phase_ordering_reaches_complete() {
        let mut phase = ProjectPhase::Interview;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            phase = next;
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                ProjectPhase::Interview,
                ProjectPhase::Spec,
                ProjectPhase::Build,
                ProjectPhase::Review,
                ProjectPhase::Complete,
            ]
        );
    }

    #[test]
    fn terminal_checks() {
        assert!(WorkStatus::Cancelled.is_terminal());
        assert!(!WorkStatus::Running.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Reviewing.is_terminal());
        assert!(ReviewCycleStatus::Escalated.is_terminal());
        assert!(!ReviewCycleStatus::Fixing.is_terminal());
    }
}

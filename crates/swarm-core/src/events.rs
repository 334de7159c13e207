//! Activity events appended to the per-project feed and the global ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{EscalationSeverity, ProjectPhase};
use crate::types::{RunId, TaskId, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityKind {
    /// Run created for a project.
    RunStarted { run_id: RunId },
    /// A worker agent session was spawned.
    Spawn {
        run_id: RunId,
        phase_number: u32,
        task_id: TaskId,
        worker_id: WorkerId,
        branch: String,
        path: String,
    },
    /// Spawn attempt failed; retry state recorded.
    SpawnFailed {
        run_id: RunId,
        task_id: TaskId,
        attempt: u32,
        error: String,
    },
    TaskStarted { run_id: RunId, task_id: TaskId },
    TaskCompleted { run_id: RunId, task_id: TaskId },
    TaskFailed {
        run_id: RunId,
        task_id: TaskId,
        error: String,
    },
    /// All workers of a phase reported in; branch collection begins.
    PhaseCollected {
        run_id: RunId,
        phase_number: u32,
        branches: Vec<String>,
    },
    /// A branch merge conflicted and a resolver was dispatched.
    MergeConflict {
        run_id: RunId,
        phase_number: u32,
        source_branch: String,
        conflict_files: Vec<String>,
    },
    ReviewRequested {
        run_id: RunId,
        phase_number: u32,
        reviewer_role: String,
    },
    ReviewDecision {
        run_id: RunId,
        phase_number: u32,
        reviewer_role: String,
        approved: bool,
        findings: u32,
    },
    FixerSpawned {
        run_id: RunId,
        phase_number: u32,
        fix_attempt: u32,
    },
    PhaseMerged { run_id: RunId, phase_number: u32 },
    PhaseAdvanced {
        from: ProjectPhase,
        to: ProjectPhase,
    },
    RunCompleted { run_id: RunId },
    RunFailed { run_id: RunId, reason: String },
    RunCancelled { run_id: RunId, reason: String },
    EscalationCreated {
        escalation_id: String,
        severity: EscalationSeverity,
        message: String,
    },
    EscalationResolved {
        escalation_id: String,
        resolution: String,
    },
    /// Progress watchdog decided a stalled project needs a re-dispatch.
    WatchdogRetry {
        task_id: Option<TaskId>,
        idle_secs: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub at: DateTime<Utc>,
    pub project: Option<String>,
    #[serde(flatten)]
    pub kind: ActivityKind,
}

impl ActivityEvent {
    pub fn now(project: Option<String>, kind: ActivityKind) -> Self {
        Self {
            at: Utc::now(),
            project,
            kind,
        }
    }
}

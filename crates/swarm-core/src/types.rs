//! Core identifier types and naming policies for the orchestrator.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleId(pub String);

impl RoleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for RoleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectName(pub String);

impl ProjectName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for ProjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Branch namespace shared by every branch the orchestrator creates.
pub const BRANCH_PREFIX: &str = "swarmops";

/// Branch holding one worker's isolated changes: `swarmops/<run>/<worker>`.
pub fn worker_branch(run_id: &RunId, worker_id: &WorkerId) -> String {
    format!("{BRANCH_PREFIX}/{}/{}", run_id.0, worker_id.0)
}

/// Branch collecting a phase's merged workers: `swarmops/<run>/phase-<N>`.
pub fn phase_branch(run_id: &RunId, phase_number: u32) -> String {
    format!("{BRANCH_PREFIX}/{}/phase-{phase_number}", run_id.0)
}

/// Retry-state partition key for one dispatch unit within a run.
///
/// The task-id hash must be stable across process restarts because step
/// orders are persisted in retry state and run files, so this uses FNV-1a
/// rather than the std hasher.
pub fn step_order(phase_number: u32, task_id: &TaskId) -> u64 {
    u64::from(phase_number) * 100_000 + fnv1a_64(task_id.0.as_bytes()) % 100_000
}

/// Phase number back out of a step order.
pub fn phase_of_step_order(step_order: u64) -> u32 {
    (step_order / 100_000) as u32
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Retry-timer key: at most one pending retry per (run, task).
pub fn retry_timer_key(run_id: &RunId, task_id: &TaskId) -> String {
    format!("{}:{}", run_id.0, task_id.0)
}

/// Registry key: at most one running entry per (project, task).
pub fn registry_key(project: &ProjectName, task_id: &TaskId) -> String {
    format!("{}:{}", project.0, task_id.0)
}

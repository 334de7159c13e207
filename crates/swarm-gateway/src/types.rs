//! Wire types for the session gateway RPC and the inbound webhooks.
//!
//! The gateway contract is camelCase JSON; these types own that boundary so
//! the rest of the orchestrator stays in its own naming.

use serde::{Deserialize, Serialize};

use swarm_core::types::TaskId;

/// Agent thinking level requested at spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    Low,
    Medium,
    High,
}

impl Default for ThinkingLevel {
    fn default() -> Self {
        Self::Medium
    }
}

/// Fire-and-forget session start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    /// Full prompt handed to the agent.
    pub task: String,
    /// Human-readable session label shown in the gateway.
    pub label: String,
    pub model: String,
    pub thinking: ThinkingLevel,
    /// Whether the gateway should clean the session up after completion.
    pub cleanup: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_verify: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnResponse {
    pub ok: bool,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub child_session_key: Option<String>,
    /// True when the gateway confirmed the session reached running state.
    #[serde(default)]
    pub verified: bool,
}

/// Completion status an agent reports through its webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCompletePayload {
    pub run_id: String,
    #[serde(default)]
    pub step_order: Option<u64>,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub status: WebhookStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletePayload {
    pub task_id: TaskId,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub phase_number: Option<u32>,
    #[serde(default)]
    pub project: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    RequestChanges,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewFinding {
    pub severity: String,
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
    pub description: String,
    #[serde(default)]
    pub fix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResultPayload {
    pub status: ReviewDecision,
    pub run_id: String,
    pub phase_number: u32,
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixCompletePayload {
    pub issues_fixed: u32,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub phase_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecCompletePayload {
    pub project: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrateAction {
    Start,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratePayload {
    pub action: OrchestrateAction,
    pub project: String,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub repo_dir: Option<String>,
}

//! Prompt assembly for every agent the orchestrator spawns. The webhook
//! URL embedded in each prompt is how completions find their way back.

use swarm_core::progress::ParsedTask;
use swarm_core::types::{RunId, TaskId};
use swarm_gateway::types::ReviewFinding;

use crate::roles::{RoleConfig, RoleKind};

/// Hook for appending extra skill material to a worker prompt. The default
/// instance reproduces the web-visuals heuristic; deployments can swap it.
pub trait PromptAugment: Send + Sync {
    fn augment(&self, role: &RoleConfig, task_title: &str) -> Option<String>;
}

/// Appends a web-visuals skill document to builder tasks whose title looks
/// like user-facing web design work.
#[derive(Debug, Clone)]
pub struct WebVisualsAugment {
    pub keywords: Vec<String>,
    pub skill_doc: String,
}

impl Default for WebVisualsAugment {
    fn default() -> Self {
        Self {
            keywords: [
                "design", "ui", "page", "layout", "css", "style", "frontend",
                "landing", "visual", "theme",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            skill_doc: "## Web visuals\n\
                Favor a small type scale, one accent color, generous spacing, \
                and verify every view at mobile width before committing."
                .to_string(),
        }
    }
}

impl PromptAugment for WebVisualsAugment {
    fn augment(&self, role: &RoleConfig, task_title: &str) -> Option<String> {
        if role.kind != RoleKind::Builder {
            return None;
        }
        let lower = task_title.to_ascii_lowercase();
        if self.keywords.iter().any(|kw| lower.contains(kw.as_str())) {
            Some(self.skill_doc.clone())
        } else {
            None
        }
    }
}

/// Augment that never adds anything; used where the heuristic is disabled.
#[derive(Debug, Clone, Default)]
pub struct NoAugment;

impl PromptAugment for NoAugment {
    fn augment(&self, _role: &RoleConfig, _task_title: &str) -> Option<String> {
        None
    }
}

pub struct WorkerPromptInput<'a> {
    pub role_instructions: &'a str,
    pub task: &'a ParsedTask,
    pub run_id: &'a RunId,
    pub step_order: u64,
    pub branch: &'a str,
    pub worktree_path: &'a str,
    pub webhook_base_url: &'a str,
    pub extra_skill: Option<String>,
}

pub fn build_worker_prompt(input: &WorkerPromptInput<'_>) -> String {
    let mut prompt = String::new();
    prompt.push_str(input.role_instructions);
    prompt.push_str("\n\n## Task\n");
    prompt.push_str(&format!("- id: {}\n", input.task.id));
    prompt.push_str(&format!("- title: {}\n", input.task.title));
    if !input.task.depends_on.is_empty() {
        let deps: Vec<&str> = input.task.depends_on.iter().map(|d| d.0.as_str()).collect();
        prompt.push_str(&format!("- builds on completed tasks: {}\n", deps.join(", ")));
    }
    prompt.push_str("\n## Workspace\n");
    prompt.push_str(&format!(
        "Work only inside the worktree at `{}` on branch `{}`. Commit all \
         changes there; never touch other branches.\n",
        input.worktree_path, input.branch
    ));
    prompt.push_str("\n## Completion\n");
    prompt.push_str(&format!(
        "When done (or failed), POST JSON to {}/worker-complete with body \
         {{\"runId\":\"{}\",\"stepOrder\":{},\"status\":\"completed\"|\"failed\",\
         \"output\":...,\"error\":...}}.\n",
        input.webhook_base_url, input.run_id, input.step_order
    ));
    if let Some(skill) = &input.extra_skill {
        prompt.push('\n');
        prompt.push_str(skill);
        prompt.push('\n');
    }
    prompt
}

pub struct ReviewerPromptInput<'a> {
    pub role_instructions: &'a str,
    pub run_id: &'a RunId,
    pub phase_number: u32,
    pub phase_branch: &'a str,
    pub repo_dir: &'a str,
    pub webhook_base_url: &'a str,
}

pub fn build_reviewer_prompt(input: &ReviewerPromptInput<'_>) -> String {
    format!(
        "{}\n\n## Review target\nRepository: `{}`, branch `{}` (phase {} of \
         run {}).\n\n## Verdict\nPOST JSON to {}/review-result with body \
         {{\"status\":\"approved\"|\"request_changes\",\"runId\":\"{}\",\
         \"phaseNumber\":{},\"findings\":[{{\"severity\":...,\"file\":...,\
         \"line\":...,\"description\":...,\"fix\":...}}],\"summary\":...}}. \
         Return request_changes only with concrete findings.\n",
        input.role_instructions,
        input.repo_dir,
        input.phase_branch,
        input.phase_number,
        input.run_id,
        input.webhook_base_url,
        input.run_id,
        input.phase_number,
    )
}

pub struct FixerPromptInput<'a> {
    pub role_instructions: &'a str,
    pub run_id: &'a RunId,
    pub phase_number: u32,
    pub phase_branch: &'a str,
    pub repo_dir: &'a str,
    pub findings: &'a [ReviewFinding],
    pub webhook_base_url: &'a str,
}

pub fn build_fixer_prompt(input: &FixerPromptInput<'_>) -> String {
    let mut prompt = String::new();
    prompt.push_str(input.role_instructions);
    prompt.push_str(&format!(
        "\n\n## Findings to fix on `{}` in `{}`\n",
        input.phase_branch, input.repo_dir
    ));
    for (idx, finding) in input.findings.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. [{}] {}{}: {}\n",
            idx + 1,
            finding.severity,
            finding.file,
            finding
                .line
                .map(|line| format!(":{line}"))
                .unwrap_or_default(),
            finding.description
        ));
        if let Some(fix) = &finding.fix {
            prompt.push_str(&format!("   suggested fix: {fix}\n"));
        }
    }
    prompt.push_str(&format!(
        "\nCommit each fix on the phase branch, then POST JSON to \
         {}/fix-complete with body {{\"issuesFixed\":<n>,\"runId\":\"{}\",\
         \"phaseNumber\":{}}} to trigger re-review.\n",
        input.webhook_base_url, input.run_id, input.phase_number
    ));
    prompt
}

pub struct ResolverPromptInput<'a> {
    pub role_instructions: &'a str,
    pub run_id: &'a RunId,
    pub phase_number: u32,
    pub phase_branch: &'a str,
    pub source_branch: &'a str,
    pub repo_dir: &'a str,
    pub conflict_files: &'a [String],
    pub colliding_task_titles: &'a [String],
    pub webhook_base_url: &'a str,
    /// Marker the webhook handler uses to route the completion back to
    /// the right resolver context, e.g. `resolver:<context-id>`.
    pub completion_task_id: &'a str,
}

pub fn build_resolver_prompt(input: &ResolverPromptInput<'_>) -> String {
    let mut prompt = String::new();
    prompt.push_str(input.role_instructions);
    prompt.push_str(&format!(
        "\n\n## Conflict\nMerging `{}` into `{}` in `{}` conflicted in:\n",
        input.source_branch, input.phase_branch, input.repo_dir
    ));
    for file in input.conflict_files {
        prompt.push_str(&format!("- {file}\n"));
    }
    if !input.colliding_task_titles.is_empty() {
        prompt.push_str("\nThe colliding work came from these tasks:\n");
        for title in input.colliding_task_titles {
            prompt.push_str(&format!("- {title}\n"));
        }
    }
    prompt.push_str(&format!(
        "\nRe-run the merge, resolve every conflict preserving both sides' \
         intent, commit on `{}`, then POST JSON to {}/worker-complete with \
         body {{\"runId\":\"{}\",\"taskId\":\"{}\",\"status\":\"completed\"}}.\n",
        input.phase_branch, input.webhook_base_url, input.run_id, input.completion_task_id
    ));
    prompt
}

/// Returns the task id referenced in a webhook-less context; handy for
/// labeling gateway sessions.
pub fn session_label(run_id: &RunId, task_id: &TaskId) -> String {
    format!("{}/{}", run_id.0, task_id.0)
}

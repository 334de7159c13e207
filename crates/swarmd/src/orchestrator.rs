//! The orchestrator service: one value owning every subsystem, driven by
//! webhooks, the watcher tick, and operator pipeline starts.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration as StdDuration;

use chrono::Utc;

use swarm_core::config::SwarmConfig;
use swarm_core::events::{ActivityEvent, ActivityKind};
use swarm_core::progress::{mark_task_done, parse_progress, ParsedTask, ProgressDoc, ProgressError};
use swarm_core::state::{
    PhaseStatus, ProjectPhase, RunStatus, StepStatus, WorkStatus, WorkerStatus,
};
use swarm_core::types::{
    phase_branch, step_order, ProjectName, RoleId, RunId, TaskId, WorkerId,
};
use swarm_gateway::client::SpawnBackend;
use swarm_gateway::error::GatewayError;
use swarm_gateway::types::{
    FixCompletePayload, OrchestrateAction, OrchestratePayload, ReviewResultPayload,
    SpawnRequest, SpecCompletePayload, TaskCompletePayload, WebhookStatus,
    WorkerCompletePayload,
};
use swarm_git::{
    current_branch, discover_repo, GitCli, GitError, MergeOutcome, WorktreeManager,
};
use swarm_store::{append_jsonl, PathLocks, StoreError};

use crate::advancer::{
    advance_project, decide_advance, load_project_state, load_snapshot, save_project_state,
    AdvanceError, ProjectStatus,
};
use crate::collector::{CollectorError, InitPhase, PhaseCollector};
use crate::dispatcher::{plan_dispatch, DispatchInput, RetryTimer, RetryTimers, SkipReason};
use crate::escalation::{CreateEscalation, EscalationError, EscalationStore};
use crate::ledger::{CreateWork, LedgerError, WorkLedger};
use crate::merger::{
    merge_branches_into_phase, merge_phase_into_base, phase_merge_message, PhaseMergeOutcome,
};
use crate::prompt::{
    build_fixer_prompt, build_resolver_prompt, build_reviewer_prompt, build_worker_prompt,
    session_label, FixerPromptInput, PromptAugment, ResolverPromptInput, ReviewerPromptInput,
    WebVisualsAugment, WorkerPromptInput,
};
use crate::registry::{RegistryError, TaskRegistry};
use crate::resolver::{ResolverError, ResolverStore};
use crate::retry::{RetryController, RetryError, RetryStatus};
use crate::review::{
    apply_fix_complete, apply_review_decision, mark_review_pending, ReviewError, ReviewStep,
    ReviewStore,
};
use crate::roles::{RoleError, RoleStore};
use crate::run_state::{
    next_run_id, PhaseRecord, RunState, RunStateError, RunStateManager, StepResult,
};
use crate::watcher::{project_idle_secs, CooldownTable, WatchdogState};

/// Prefix marking resolver completions on the worker-complete webhook.
const RESOLVER_TASK_PREFIX: &str = "resolver:";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Retry(#[from] RetryError),
    #[error(transparent)]
    Escalation(#[from] EscalationError),
    #[error(transparent)]
    RunState(#[from] RunStateError),
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error(transparent)]
    Review(#[from] ReviewError),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error(transparent)]
    Role(#[from] RoleError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Advance(#[from] AdvanceError),
    #[error("progress document error: {0}")]
    Progress(#[from] ProgressError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("project not found: {project}")]
    ProjectNotFound { project: String },
    #[error("project {project} has no dispatchable tasks")]
    NothingToDispatch { project: String },
}

/// Outcome of one dispatch round, mostly for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub spawned: Vec<TaskId>,
    pub skipped: Vec<(TaskId, String)>,
    pub spawn_failures: Vec<TaskId>,
}

pub struct Orchestrator {
    pub config: SwarmConfig,
    pub ledger: WorkLedger,
    pub registry: TaskRegistry,
    pub retries: RetryController,
    pub escalations: EscalationStore,
    pub runs: RunStateManager,
    pub collector: PhaseCollector,
    pub reviews: ReviewStore,
    pub resolvers: ResolverStore,
    pub roles: RoleStore,
    pub timers: RetryTimers,
    pub cooldowns: CooldownTable,
    pub watchdog: WatchdogState,
    gateway: Box<dyn SpawnBackend>,
    augment: Box<dyn PromptAugment>,
    git: GitCli,
    worktrees: WorktreeManager,
    locks: PathLocks,
    worker_seq: AtomicU64,
}

impl Orchestrator {
    /// Build the service over a data root, creating the state layout and
    /// re-entering any non-terminal runs found on disk.
    pub fn open(
        config: SwarmConfig,
        gateway: Box<dyn SpawnBackend>,
    ) -> Result<Self, OrchestratorError> {
        let data = config.data_root.clone();
        let orchestrator = Self {
            ledger: WorkLedger::new(data.join("work")),
            registry: TaskRegistry::new(data.join("task-registry.json")),
            retries: RetryController::new(data.join("retry-state.json"), config.retry.clone()),
            escalations: EscalationStore::new(data.join("escalations.json")),
            runs: RunStateManager::new(data.join("runs"), data.join("project-runs")),
            collector: PhaseCollector::new(data.join("phases")),
            reviews: ReviewStore::new(data.join("reviews")),
            resolvers: ResolverStore::new(data.join("conflict-resolvers")),
            roles: RoleStore::new(data.join("roles.json"), data.join("prompts")),
            timers: RetryTimers::new(),
            cooldowns: CooldownTable::new(),
            watchdog: WatchdogState::new(),
            gateway,
            augment: Box::new(WebVisualsAugment::default()),
            git: GitCli::default(),
            worktrees: WorktreeManager::new(GitCli::default(), config.worktree_root.clone()),
            locks: PathLocks::new(),
            worker_seq: AtomicU64::new(1),
            config,
        };

        std::fs::create_dir_all(orchestrator.config.data_root.join("work")).ok();
        let recovered = orchestrator.runs.load_active_runs()?;
        for run in &recovered {
            eprintln!(
                "[swarmd] resuming run {} for project {} at phase {}",
                run.run_id, run.project, run.current_phase_number
            );
        }
        Ok(orchestrator)
    }

    pub fn set_augment(&mut self, augment: Box<dyn PromptAugment>) {
        self.augment = augment;
    }

    // ── Pipeline starts ──────────────────────────────────────────────

    /// Operator entry point: create a run for the project's progress
    /// document and dispatch the first phase.
    pub fn start_project_run(
        &self,
        project: &ProjectName,
    ) -> Result<RunState, OrchestratorError> {
        if let Some(active) = self.runs.active_run_for_project(project)? {
            // Idempotent start: re-examine the active run instead.
            self.dispatch_phase(&active.run_id, active.current_phase_number)?;
            return Ok(active);
        }

        let project_dir = self.project_dir(project);
        let doc = self.load_progress(&project_dir)?;
        let current = doc
            .current_phase()
            .ok_or_else(|| OrchestratorError::NothingToDispatch {
                project: project.0.clone(),
            })?;
        let current_number = current.number;

        let repo_dir = project_dir.join("repo");
        let repo = discover_repo(&repo_dir, &self.git)?;
        let base_branch = current_branch(&repo, &self.git)?;

        let run = RunState {
            run_id: next_run_id(Utc::now()),
            project: project.clone(),
            pipeline_name: "build".to_string(),
            status: RunStatus::Running,
            current_phase_number: current_number,
            phases: doc
                .phases
                .iter()
                .map(|phase| PhaseRecord {
                    number: phase.number,
                    name: phase.name.clone(),
                    status: if phase.number == current_number {
                        PhaseStatus::Running
                    } else {
                        PhaseStatus::Pending
                    },
                    started_at: (phase.number == current_number).then(Utc::now),
                    completed_at: None,
                })
                .collect(),
            step_results: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            project_dir: project_dir.clone(),
            repo_dir,
            base_branch,
            active_session_key: None,
            active_task_id: None,
        };

        self.runs.create_run(run.clone())?;
        self.record_activity(
            project,
            ActivityKind::RunStarted {
                run_id: run.run_id.clone(),
            },
        );
        self.dispatch_phase(&run.run_id, current_number)?;
        self.runs
            .get(&run.run_id)?
            .ok_or(OrchestratorError::RunState(RunStateError::NotFound {
                run_id: run.run_id.0.clone(),
            }))
    }

    /// Webhook entry point for `POST /orchestrate`.
    pub fn orchestrate(&self, payload: &OrchestratePayload) -> Result<(), OrchestratorError> {
        let project = ProjectName::new(payload.project.clone());
        match payload.action {
            OrchestrateAction::Start => {
                self.start_project_run(&project)?;
            }
            OrchestrateAction::Continue => {
                if let Some(run) = self.runs.active_run_for_project(&project)? {
                    self.dispatch_phase(&run.run_id, run.current_phase_number)?;
                }
            }
        }
        Ok(())
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Spawn workers for every ready task of the phase, under dedup,
    /// exhausted-retry filtering and staggered parallelism.
    pub fn dispatch_phase(
        &self,
        run_id: &RunId,
        phase_number: u32,
    ) -> Result<DispatchSummary, OrchestratorError> {
        let Some(run) = self.runs.get(run_id)? else {
            return Ok(DispatchSummary::default());
        };
        if run.status.is_terminal() {
            return Ok(DispatchSummary::default());
        }

        let doc = self.load_progress(&run.project_dir)?;
        let candidates: Vec<ParsedTask> = doc
            .ready_tasks_in_phase(phase_number)
            .into_iter()
            .filter(|task| !self.step_skipped(&run, phase_number, &task.id))
            .cloned()
            .collect();

        let candidate_ids: Vec<TaskId> = candidates.iter().map(|t| t.id.clone()).collect();
        let (_, registry_skipped) = self
            .registry
            .filter_spawnable(&run.project, &candidate_ids)?;

        let mut exhausted = Vec::new();
        for task in &candidates {
            let order = step_order(phase_number, &task.id);
            if self.retries.is_exhausted(run_id, order)? {
                exhausted.push(task.id.clone());
                self.ensure_exhausted_escalation(&run, phase_number, task)?;
            }
        }

        let plan = plan_dispatch(DispatchInput {
            phase_number,
            candidates,
            registry_skipped: registry_skipped
                .into_iter()
                .map(|skip| (skip.task_id, skip.reason))
                .collect(),
            exhausted,
            stagger_ms: self.config.dispatch.spawn_stagger_ms,
        });

        let mut summary = DispatchSummary {
            skipped: plan
                .skipped
                .iter()
                .map(|(task_id, reason)| {
                    let rendered = match reason {
                        SkipReason::Registry { reason } => reason.clone(),
                        SkipReason::RetryExhausted => "retries exhausted".to_string(),
                    };
                    (task_id.clone(), rendered)
                })
                .collect(),
            ..DispatchSummary::default()
        };
        for (task_id, reason) in &summary.skipped {
            eprintln!("[swarmd] skipping {task_id}: {reason}");
        }

        for (idx, planned) in plan.spawns.iter().enumerate() {
            if idx > 0 && self.config.dispatch.spawn_stagger_ms > 0 {
                std::thread::sleep(StdDuration::from_millis(
                    self.config.dispatch.spawn_stagger_ms,
                ));
            }
            match self.spawn_worker(&run, phase_number, &planned.task, planned.step_order) {
                Ok(true) => summary.spawned.push(planned.task.id.clone()),
                Ok(false) => summary
                    .skipped
                    .push((planned.task.id.clone(), "lost registry race".to_string())),
                Err(err) => {
                    eprintln!(
                        "[swarmd] spawn of {} failed: {err}",
                        planned.task.id
                    );
                    summary.spawn_failures.push(planned.task.id.clone());
                    self.handle_spawn_failure(
                        &run,
                        phase_number,
                        &planned.task,
                        planned.step_order,
                        &err.to_string(),
                    )?;
                }
            }
        }

        Ok(summary)
    }

    /// Register → spawn → record, in the order the dedup invariant needs.
    /// Returns false when the registry refused (lost race).
    fn spawn_worker(
        &self,
        run: &RunState,
        phase_number: u32,
        task: &ParsedTask,
        order: u64,
    ) -> Result<bool, OrchestratorError> {
        let worker_id = self.next_worker_id();
        let repo = discover_repo(&run.repo_dir, &self.git)?;

        // Worktree isolation; a broken worktree falls back to the shared
        // repo dir with a warning.
        let (worktree_path, branch) = match self.locks.with_path(&run.repo_dir, || {
            self.worktrees
                .create_worktree(&repo, &run.run_id, &worker_id, &run.base_branch)
        }) {
            Ok(info) => (info.path, info.branch),
            Err(err) => {
                eprintln!(
                    "[swarmd] worktree creation failed for {}: {err}; using shared repo dir",
                    worker_id
                );
                (
                    run.repo_dir.clone(),
                    swarm_core::types::worker_branch(&run.run_id, &worker_id),
                )
            }
        };

        let admitted = self.registry.register(
            &run.project,
            &task.id,
            &run.run_id,
            phase_number,
            &worker_id,
            Some(branch.clone()),
        )?;
        if !admitted.can_spawn {
            return Ok(false);
        }

        self.retries.init_state(&run.run_id, order)?;
        self.ensure_phase_worker(run, phase_number, &worker_id, task, &branch)?;

        let role_id = task
            .role
            .clone()
            .unwrap_or_else(|| RoleId::new("builder"));
        let role = self.roles.get(&role_id)?;
        let instructions = self.roles.instructions(&role)?;
        let prompt = build_worker_prompt(&WorkerPromptInput {
            role_instructions: &instructions,
            task,
            run_id: &run.run_id,
            step_order: order,
            branch: &branch,
            worktree_path: &worktree_path.to_string_lossy(),
            webhook_base_url: &self.config.dispatch.webhook_base_url,
            extra_skill: self.augment.augment(&role, &task.title),
        });

        let ledger_item = self.ledger.create(CreateWork {
            id: Some(worker_id.0.clone()),
            work_type: "worker".to_string(),
            title: task.title.clone(),
            role_id: Some(role_id.clone()),
            parent_id: Some(run.run_id.0.clone()),
            tags: vec![
                format!("run:{}", run.run_id),
                format!("task:{}", task.id),
                format!("phase:{phase_number}"),
            ],
        })?;

        let spawn_result = self.gateway.spawn(&SpawnRequest {
            task: prompt,
            label: session_label(&run.run_id, &task.id),
            model: role.model.clone(),
            thinking: role.thinking,
            cleanup: true,
            run_timeout_seconds: Some(self.config.gateway.run_timeout_secs),
            skip_verify: None,
        });

        match spawn_result {
            Ok(response) => {
                // A spawn that succeeds after recorded failures closes the
                // retry loop for this step.
                if let Some(state) = self.retries.get(&run.run_id, order)? {
                    if !state.attempts.is_empty()
                        && state.status == crate::retry::RetryStatus::Retrying
                    {
                        self.retries
                            .record_attempt(&run.run_id, order, true, None, None)?;
                    }
                }
                self.ledger
                    .update_status(&ledger_item.id, WorkStatus::Running, None)?;
                self.ledger.append_event(&ledger_item.id, "task_started")?;
                self.record_activity(
                    &run.project,
                    ActivityKind::Spawn {
                        run_id: run.run_id.clone(),
                        phase_number,
                        task_id: task.id.clone(),
                        worker_id: worker_id.clone(),
                        branch,
                        path: worktree_path.to_string_lossy().into_owned(),
                    },
                );
                if let Some(session_key) = response.child_session_key {
                    let _ = self.runs.update(&run.run_id, |state| {
                        state.active_session_key = Some(session_key.clone());
                        state.active_task_id = Some(task.id.clone());
                    });
                }
                Ok(true)
            }
            Err(err) => {
                // Mark the optimistic registration failed so the retry
                // cycle can pick the task up again.
                self.registry.update_status(
                    &run.project,
                    &task.id,
                    WorkerStatus::Failed,
                    Some(err.to_string()),
                )?;
                self.collector.on_worker_complete(
                    &run.run_id,
                    phase_number,
                    &worker_id,
                    WorkerStatus::Failed,
                    None,
                    Some(err.to_string()),
                )?;
                self.ledger.update_status(
                    &ledger_item.id,
                    WorkStatus::Cancelled,
                    Some(format!("spawn failed: {err}")),
                )?;
                Err(OrchestratorError::Gateway(err))
            }
        }
    }

    /// Record the failed attempt and either schedule the delayed
    /// re-dispatch or escalate.
    fn handle_spawn_failure(
        &self,
        run: &RunState,
        phase_number: u32,
        task: &ParsedTask,
        order: u64,
        error: &str,
    ) -> Result<(), OrchestratorError> {
        let outcome =
            self.retries
                .record_attempt(&run.run_id, order, false, Some(error.to_string()), None)?;
        self.record_activity(
            &run.project,
            ActivityKind::SpawnFailed {
                run_id: run.run_id.clone(),
                task_id: task.id.clone(),
                attempt: outcome.attempt_count,
                error: error.to_string(),
            },
        );

        match outcome.status {
            RetryStatus::Exhausted => {
                self.skip_exhausted_step(run, phase_number, task, order, error)?;
            }
            RetryStatus::Retrying => {
                self.timers.schedule(RetryTimer {
                    run_id: run.run_id.clone(),
                    task_id: task.id.clone(),
                    phase_number,
                    due_at: outcome
                        .next_retry_at
                        .unwrap_or_else(Utc::now),
                });
            }
            RetryStatus::Succeeded | RetryStatus::Pending => {}
        }
        Ok(())
    }

    /// Exhausted-retry policy for build steps: skip-and-continue. The step
    /// result is recorded as skipped with its escalation, and the phase can
    /// close without the task.
    fn skip_exhausted_step(
        &self,
        run: &RunState,
        phase_number: u32,
        task: &ParsedTask,
        order: u64,
        error: &str,
    ) -> Result<(), OrchestratorError> {
        let escalation = self.escalations.create(CreateEscalation {
            run_id: Some(run.run_id.clone()),
            pipeline: Some(run.project.0.clone()),
            phase_number: Some(phase_number),
            step_order: Some(order),
            role: task.role.clone(),
            task_id: Some(task.id.clone()),
            message: format!("spawn retries exhausted: {error}"),
            attempt_count: self.config.retry.max_attempts,
            max_attempts: self.config.retry.max_attempts,
            severity: None,
        })?;
        self.record_activity(
            &run.project,
            ActivityKind::EscalationCreated {
                escalation_id: escalation.id.clone(),
                severity: escalation.severity,
                message: escalation.message.clone(),
            },
        );

        self.runs.update(&run.run_id, |state| {
            state.record_step_result(StepResult {
                step_id: task.id.0.clone(),
                step_order: order,
                status: StepStatus::Skipped,
                output: None,
                error: Some(error.to_string()),
                completed_at: Utc::now(),
                escalation_id: Some(escalation.id.clone()),
            });
        })?;

        // The collector worker for the task, if any, becomes a skip.
        self.collector.skip_task(
            &run.run_id,
            phase_number,
            &task.id,
            "skipped: retries exhausted",
        )?;

        self.maybe_close_phase(&run.run_id, phase_number)?;
        Ok(())
    }

    fn ensure_exhausted_escalation(
        &self,
        run: &RunState,
        phase_number: u32,
        task: &ParsedTask,
    ) -> Result<(), OrchestratorError> {
        if self
            .escalations
            .open_for_task(&run.run_id, &task.id)?
            .is_none()
        {
            let order = step_order(phase_number, &task.id);
            self.escalations.create(CreateEscalation {
                run_id: Some(run.run_id.clone()),
                pipeline: Some(run.project.0.clone()),
                phase_number: Some(phase_number),
                step_order: Some(order),
                role: task.role.clone(),
                task_id: Some(task.id.clone()),
                message: "task requires human action: retries exhausted".to_string(),
                attempt_count: self.config.retry.max_attempts,
                max_attempts: self.config.retry.max_attempts,
                severity: None,
            })?;
        }
        Ok(())
    }

    // ── Webhooks ─────────────────────────────────────────────────────

    pub fn handle_worker_complete(
        &self,
        payload: &WorkerCompletePayload,
    ) -> Result<(), OrchestratorError> {
        let run_id = RunId::new(payload.run_id.clone());
        let Some(run) = self.runs.get(&run_id)? else {
            eprintln!("[swarmd] orphan worker-complete for unknown run {run_id}");
            return Ok(());
        };
        if run.status.is_terminal() {
            eprintln!("[swarmd] orphan worker-complete for terminal run {run_id}");
            return Ok(());
        }

        // Resolver completions share this webhook, marked by task id.
        if let Some(task_id) = &payload.task_id {
            if let Some(context_id) = task_id.0.strip_prefix(RESOLVER_TASK_PREFIX) {
                return self.handle_resolver_complete(&run, context_id, payload.status);
            }
        }

        let doc = self.load_progress(&run.project_dir)?;
        let Some(task) = self.task_for_payload(&doc, payload) else {
            eprintln!(
                "[swarmd] orphan worker-complete: no task matches stepOrder={:?} taskId={:?}",
                payload.step_order, payload.task_id
            );
            return Ok(());
        };
        let phase_number = task.phase_number;
        let order = step_order(phase_number, &task.id);

        let Some(entry) = self.registry.get(&run.project, &task.id)? else {
            eprintln!(
                "[swarmd] orphan worker-complete: no registry entry for {}:{}",
                run.project, task.id
            );
            return Ok(());
        };
        let worker_id = entry.worker_id.clone();

        match payload.status {
            WebhookStatus::Completed => {
                // Idempotency: a completed registry entry means this
                // webhook already ran.
                if entry.status == WorkerStatus::Completed {
                    return Ok(());
                }

                self.registry.update_status(
                    &run.project,
                    &task.id,
                    WorkerStatus::Completed,
                    None,
                )?;
                if let Some(output) = &payload.output {
                    let _ = self.ledger.set_output(&worker_id.0, output);
                }
                if self.ledger.get(&worker_id.0)?.is_some() {
                    let _ = self
                        .ledger
                        .update_status(&worker_id.0, WorkStatus::Complete, None);
                    let _ = self.ledger.append_event(&worker_id.0, "task_completed");
                }

                // Resolve retry state: eventual success removes the entry.
                self.retries.clear_state(&run_id, order)?;
                self.timers.cancel(&run_id, &task.id);
                self.watchdog.reset_task(&run.project.0, &task.id);

                self.mark_done_in_progress(&run.project_dir, &task.id)?;

                let closed = self.escalations.resolve_by_task(
                    &task.id,
                    "task completed after escalation",
                    None,
                )?;
                for escalation in closed {
                    self.record_activity(
                        &run.project,
                        ActivityKind::EscalationResolved {
                            escalation_id: escalation.id,
                            resolution: "task completed after escalation".to_string(),
                        },
                    );
                }

                self.runs.update(&run_id, |state| {
                    state.record_step_result(StepResult {
                        step_id: task.id.0.clone(),
                        step_order: order,
                        status: StepStatus::Completed,
                        output: payload.output.clone(),
                        error: None,
                        completed_at: Utc::now(),
                        escalation_id: None,
                    });
                })?;

                self.collector.on_worker_complete(
                    &run_id,
                    phase_number,
                    &worker_id,
                    WorkerStatus::Completed,
                    payload.output.clone(),
                    None,
                )?;
                self.record_activity(
                    &run.project,
                    ActivityKind::TaskCompleted {
                        run_id: run_id.clone(),
                        task_id: task.id.clone(),
                    },
                );

                // More tasks may be ready now; otherwise the phase closes.
                self.dispatch_phase(&run_id, phase_number)?;
                self.maybe_close_phase(&run_id, phase_number)?;
            }
            WebhookStatus::Failed => {
                let error = payload
                    .error
                    .clone()
                    .unwrap_or_else(|| "worker reported failure".to_string());
                if entry.status.is_terminal() {
                    return Ok(());
                }

                self.registry.update_status(
                    &run.project,
                    &task.id,
                    WorkerStatus::Failed,
                    Some(error.clone()),
                )?;
                if self.ledger.get(&worker_id.0)?.is_some() {
                    let _ = self.ledger.update_status(
                        &worker_id.0,
                        WorkStatus::Failed,
                        Some(error.clone()),
                    );
                }
                self.record_activity(
                    &run.project,
                    ActivityKind::TaskFailed {
                        run_id: run_id.clone(),
                        task_id: task.id.clone(),
                        error: error.clone(),
                    },
                );

                let outcome = self.retries.record_attempt(
                    &run_id,
                    order,
                    false,
                    Some(error.clone()),
                    None,
                )?;
                match outcome.status {
                    RetryStatus::Exhausted => {
                        self.skip_exhausted_step(&run, phase_number, &task, order, &error)?;
                    }
                    RetryStatus::Retrying => {
                        self.collector.on_worker_complete(
                            &run_id,
                            phase_number,
                            &worker_id,
                            WorkerStatus::Failed,
                            None,
                            Some(error),
                        )?;
                        self.timers.schedule(RetryTimer {
                            run_id: run_id.clone(),
                            task_id: task.id.clone(),
                            phase_number,
                            due_at: outcome.next_retry_at.unwrap_or_else(Utc::now),
                        });
                    }
                    RetryStatus::Succeeded | RetryStatus::Pending => {}
                }
            }
        }
        Ok(())
    }

    pub fn handle_task_complete(
        &self,
        payload: &TaskCompletePayload,
    ) -> Result<(), OrchestratorError> {
        let project = match (&payload.project, &payload.run_id) {
            (Some(project), _) => ProjectName::new(project.clone()),
            (None, Some(run_id)) => match self.runs.get(&RunId::new(run_id.clone()))? {
                Some(run) => run.project,
                None => {
                    eprintln!("[swarmd] orphan task-complete for unknown run {run_id}");
                    return Ok(());
                }
            },
            (None, None) => {
                eprintln!("[swarmd] task-complete without project or run; ignoring");
                return Ok(());
            }
        };

        let project_dir = self.project_dir(&project);
        let changed = self.mark_done_in_progress(&project_dir, &payload.task_id)?;
        if changed {
            self.registry.update_status(
                &project,
                &payload.task_id,
                WorkerStatus::Completed,
                None,
            )?;
            self.escalations.resolve_by_task(
                &payload.task_id,
                "task completed after escalation",
                None,
            )?;
            if let Some(run) = self.runs.active_run_for_project(&project)? {
                self.dispatch_phase(&run.run_id, run.current_phase_number)?;
                self.maybe_close_phase(&run.run_id, run.current_phase_number)?;
            }
        }
        Ok(())
    }

    pub fn handle_review_result(
        &self,
        payload: &ReviewResultPayload,
    ) -> Result<(), OrchestratorError> {
        let run_id = RunId::new(payload.run_id.clone());
        let Some(run) = self.runs.get(&run_id)? else {
            eprintln!("[swarmd] orphan review-result for unknown run {}", run_id);
            return Ok(());
        };
        let phase_number = payload.phase_number;
        if self.reviews.get(&run_id, phase_number)?.is_none() {
            eprintln!(
                "[swarmd] orphan review-result: no cycle for {} phase {phase_number}",
                run_id
            );
            return Ok(());
        }

        let (cycle, step) = self.reviews.update(&run_id, phase_number, |cycle| {
            let reviewer = cycle
                .current_reviewer()
                .unwrap_or("reviewer")
                .to_string();
            let step = apply_review_decision(
                cycle,
                payload.status,
                payload.findings.clone(),
                payload.summary.clone(),
                Utc::now(),
            );
            (reviewer, step)
        })?;
        let (reviewer_role, step) = step;

        let approved = matches!(
            &step,
            ReviewStep::SpawnNextReviewer { .. } | ReviewStep::MergeToBase
        );
        self.record_activity(
            &run.project,
            ActivityKind::ReviewDecision {
                run_id: run_id.clone(),
                phase_number,
                reviewer_role: reviewer_role.clone(),
                approved,
                findings: payload.findings.len() as u32,
            },
        );

        match step {
            ReviewStep::SpawnNextReviewer { role } => {
                self.spawn_reviewer(&run, phase_number, &role)?;
            }
            ReviewStep::MergeToBase => {
                self.finalize_approved_phase(&run, phase_number)?;
            }
            ReviewStep::SpawnFixer { findings } => {
                let fix_attempt = cycle.fix_count;
                self.record_activity(
                    &run.project,
                    ActivityKind::FixerSpawned {
                        run_id: run_id.clone(),
                        phase_number,
                        fix_attempt,
                    },
                );
                self.spawn_fixer(&run, phase_number, &findings)?;
            }
            ReviewStep::NeedsClarification => {
                let escalation = self.escalations.create(CreateEscalation {
                    run_id: Some(run_id.clone()),
                    pipeline: Some(run.project.0.clone()),
                    phase_number: Some(phase_number),
                    step_order: None,
                    role: Some(RoleId::new(reviewer_role)),
                    task_id: None,
                    message: "reviewer requested changes without findings".to_string(),
                    attempt_count: cycle.fix_count,
                    max_attempts: cycle.max_fix_attempts,
                    severity: Some(swarm_core::state::EscalationSeverity::Medium),
                })?;
                self.record_activity(
                    &run.project,
                    ActivityKind::EscalationCreated {
                        escalation_id: escalation.id,
                        severity: escalation.severity,
                        message: escalation.message,
                    },
                );
            }
            ReviewStep::Escalate { reason } => {
                let escalation = self.escalations.create(CreateEscalation {
                    run_id: Some(run_id.clone()),
                    pipeline: Some(run.project.0.clone()),
                    phase_number: Some(phase_number),
                    step_order: None,
                    role: Some(RoleId::new(reviewer_role)),
                    task_id: None,
                    message: format!("review fix loop escalated: {reason}"),
                    attempt_count: cycle.fix_count,
                    max_attempts: cycle.max_fix_attempts,
                    severity: Some(swarm_core::state::EscalationSeverity::High),
                })?;
                self.record_activity(
                    &run.project,
                    ActivityKind::EscalationCreated {
                        escalation_id: escalation.id,
                        severity: escalation.severity,
                        message: escalation.message,
                    },
                );
            }
            ReviewStep::Ignore { reason } => {
                eprintln!("[swarmd] ignoring review-result replay: {reason}");
            }
        }
        Ok(())
    }

    pub fn handle_fix_complete(
        &self,
        payload: &FixCompletePayload,
    ) -> Result<(), OrchestratorError> {
        let Some(run_id) = payload.run_id.clone().map(RunId::new) else {
            eprintln!("[swarmd] fix-complete without runId; ignoring");
            return Ok(());
        };
        let Some(run) = self.runs.get(&run_id)? else {
            eprintln!("[swarmd] orphan fix-complete for unknown run {run_id}");
            return Ok(());
        };
        let Some(phase_number) = payload.phase_number else {
            eprintln!("[swarmd] fix-complete without phaseNumber; ignoring");
            return Ok(());
        };
        if self.reviews.get(&run_id, phase_number)?.is_none() {
            return Ok(());
        }

        let (_, respawn) = self.reviews.update(&run_id, phase_number, |cycle| {
            apply_fix_complete(cycle, Utc::now())
        })?;

        if let Some(role) = respawn {
            self.spawn_reviewer(&run, phase_number, &role)?;
            self.reviews.update(&run_id, phase_number, |cycle| {
                mark_review_pending(cycle, Utc::now());
            })?;
        }
        Ok(())
    }

    pub fn handle_spec_complete(
        &self,
        payload: &SpecCompletePayload,
    ) -> Result<(), OrchestratorError> {
        let project = ProjectName::new(payload.project.clone());
        let project_dir = self.project_dir(&project);
        if load_project_state(&project_dir)?.is_none() {
            return Err(OrchestratorError::ProjectNotFound {
                project: project.0.clone(),
            });
        }

        let snapshot = load_snapshot(&project_dir)?;
        if snapshot.phase == ProjectPhase::Spec {
            advance_project(&project_dir, ProjectPhase::Build, Utc::now())?;
            self.record_activity(
                &project,
                ActivityKind::PhaseAdvanced {
                    from: ProjectPhase::Spec,
                    to: ProjectPhase::Build,
                },
            );
            self.start_project_run(&project)?;
        }
        Ok(())
    }

    // ── Phase close, merge pipeline and review chain ─────────────────

    /// Close the phase when every task is accounted for (done or skipped)
    /// and every collector worker is terminal.
    fn maybe_close_phase(
        &self,
        run_id: &RunId,
        phase_number: u32,
    ) -> Result<(), OrchestratorError> {
        let Some(run) = self.runs.get(run_id)? else {
            return Ok(());
        };
        let Some(phase_state) = self.collector.get(run_id, phase_number)? else {
            return Ok(());
        };
        if phase_state.status != PhaseStatus::Running {
            return Ok(());
        }
        if !phase_state.all_workers_done() {
            return Ok(());
        }

        let doc = self.load_progress(&run.project_dir)?;
        let open_tasks: Vec<&ParsedTask> = doc
            .tasks
            .iter()
            .filter(|task| {
                task.phase_number == phase_number
                    && !task.done
                    && !self.step_skipped(&run, phase_number, &task.id)
            })
            .collect();
        if !open_tasks.is_empty() {
            return Ok(());
        }

        let repo = discover_repo(&run.repo_dir, &self.git)?;
        let branches = match self
            .collector
            .collect_phase_branches(run_id, phase_number, &self.git, &repo)
        {
            Ok(branches) => branches,
            Err(CollectorError::WorkersFailed { failed, .. }) => {
                eprintln!(
                    "[swarmd] phase {phase_number} of {run_id} has unresolved failed workers: {failed:?}"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        self.record_activity(
            &run.project,
            ActivityKind::PhaseCollected {
                run_id: run_id.clone(),
                phase_number,
                branches: branches.clone(),
            },
        );

        if branches.is_empty() {
            // No worker produced commits; nothing to merge or review.
            self.collector.complete_phase(run_id, phase_number)?;
            self.advance_after_phase(run_id, phase_number)?;
            return Ok(());
        }

        self.runs.update(run_id, |state| {
            state.status = RunStatus::Merging;
            if let Some(phase) = state.phase_mut(phase_number) {
                phase.status = PhaseStatus::Merging;
            }
        })?;
        self.collector
            .set_status(run_id, phase_number, PhaseStatus::Merging)?;
        self.merge_phase_branches(run_id, phase_number, branches)
    }

    /// Merge collected worker branches into the phase branch. A conflict
    /// (reported by the merger with HEAD already restored) parks the rest
    /// in a resolver context and spawns the resolver agent.
    fn merge_phase_branches(
        &self,
        run_id: &RunId,
        phase_number: u32,
        branches: Vec<String>,
    ) -> Result<(), OrchestratorError> {
        let Some(run) = self.runs.get(run_id)? else {
            return Ok(());
        };
        let repo = discover_repo(&run.repo_dir, &self.git)?;
        let target = phase_branch(run_id, phase_number);

        let outcome = merge_branches_into_phase(
            &self.git,
            &repo,
            &self.locks,
            &run.repo_dir,
            &target,
            &branches,
        )?;

        match outcome {
            PhaseMergeOutcome::Conflicted {
                source_branch,
                conflict_files,
                remaining_branches,
            } => {
                self.record_activity(
                    &run.project,
                    ActivityKind::MergeConflict {
                        run_id: run_id.clone(),
                        phase_number,
                        source_branch: source_branch.clone(),
                        conflict_files: conflict_files.clone(),
                    },
                );
                let context = self.resolvers.create(
                    run_id,
                    phase_number,
                    target,
                    source_branch,
                    conflict_files,
                    remaining_branches,
                    run.repo_dir.clone(),
                )?;
                self.spawn_resolver(&run, &context.id)?;
                Ok(())
            }
            PhaseMergeOutcome::AllMerged => self.begin_review(&run, phase_number),
        }
    }

    fn handle_resolver_complete(
        &self,
        run: &RunState,
        context_id: &str,
        status: WebhookStatus,
    ) -> Result<(), OrchestratorError> {
        let Some(context) = self.resolvers.get(context_id)? else {
            eprintln!("[swarmd] orphan resolver webhook for unknown context {context_id}");
            return Ok(());
        };
        if context.status != crate::resolver::ResolverStatus::Active {
            return Ok(());
        }

        match status {
            WebhookStatus::Completed => {
                self.resolvers.complete(context_id)?;
                if context.remaining_branches.is_empty() {
                    self.begin_review(run, context.phase_number)
                } else {
                    self.merge_phase_branches(
                        &context.run_id,
                        context.phase_number,
                        context.remaining_branches,
                    )
                }
            }
            WebhookStatus::Failed => {
                self.resolvers.fail(context_id)?;
                let escalation = self.escalations.create(CreateEscalation {
                    run_id: Some(context.run_id.clone()),
                    pipeline: Some(run.project.0.clone()),
                    phase_number: Some(context.phase_number),
                    step_order: None,
                    role: Some(RoleId::new("conflict-resolver")),
                    task_id: None,
                    message: format!(
                        "conflict resolution failed for {} (files: {:?})",
                        context.source_branch, context.conflict_files
                    ),
                    attempt_count: 1,
                    max_attempts: 1,
                    severity: Some(swarm_core::state::EscalationSeverity::High),
                })?;
                self.record_activity(
                    &run.project,
                    ActivityKind::EscalationCreated {
                        escalation_id: escalation.id,
                        severity: escalation.severity,
                        message: escalation.message,
                    },
                );
                Ok(())
            }
        }
    }

    /// All branches merged into the phase branch: start the review chain.
    fn begin_review(&self, run: &RunState, phase_number: u32) -> Result<(), OrchestratorError> {
        self.runs.update(&run.run_id, |state| {
            state.status = RunStatus::Reviewing;
            if let Some(phase) = state.phase_mut(phase_number) {
                phase.status = PhaseStatus::Reviewing;
            }
        })?;
        self.collector
            .set_status(&run.run_id, phase_number, PhaseStatus::Reviewing)?;

        let cycle = self.reviews.init_cycle(
            &run.run_id,
            phase_number,
            self.config.dispatch.review_chain.clone(),
            self.config.dispatch.max_fix_attempts,
        )?;
        let Some(first) = cycle.current_reviewer().map(str::to_string) else {
            // Empty chain: config validation warns about this; treat as
            // auto-approved.
            return self.finalize_approved_phase(run, phase_number);
        };
        self.spawn_reviewer(run, phase_number, &first)
    }

    /// The last reviewer approved: merge the phase branch into base.
    fn finalize_approved_phase(
        &self,
        run: &RunState,
        phase_number: u32,
    ) -> Result<(), OrchestratorError> {
        let repo = discover_repo(&run.repo_dir, &self.git)?;
        let source = phase_branch(&run.run_id, phase_number);
        let message = phase_merge_message(&run.run_id, phase_number);

        let outcome = merge_phase_into_base(
            &self.git,
            &repo,
            &self.locks,
            &run.repo_dir,
            &run.base_branch,
            &source,
            &message,
        )?;

        match outcome {
            MergeOutcome::Clean => {
                self.reviews.update(&run.run_id, phase_number, |cycle| {
                    cycle.status = swarm_core::state::ReviewCycleStatus::Merged;
                    cycle.updated_at = Utc::now();
                })?;
                self.collector.complete_phase(&run.run_id, phase_number)?;
                self.record_activity(
                    &run.project,
                    ActivityKind::PhaseMerged {
                        run_id: run.run_id.clone(),
                        phase_number,
                    },
                );
                self.cleanup_phase_workers(run, phase_number);
                self.advance_after_phase(&run.run_id, phase_number)
            }
            MergeOutcome::Conflicted { files } => {
                // Base moved underneath the phase branch; a human decides.
                self.collector.fail_phase(&run.run_id, phase_number)?;
                let escalation = self.escalations.create(CreateEscalation {
                    run_id: Some(run.run_id.clone()),
                    pipeline: Some(run.project.0.clone()),
                    phase_number: Some(phase_number),
                    step_order: None,
                    role: None,
                    task_id: None,
                    message: format!(
                        "phase merge into {} conflicted (files: {files:?})",
                        run.base_branch
                    ),
                    attempt_count: 1,
                    max_attempts: 1,
                    severity: Some(swarm_core::state::EscalationSeverity::High),
                })?;
                self.record_activity(
                    &run.project,
                    ActivityKind::EscalationCreated {
                        escalation_id: escalation.id,
                        severity: escalation.severity,
                        message: escalation.message,
                    },
                );
                self.fail_run(&run.run_id, "phase merge into base conflicted")
            }
        }
    }

    /// Event-driven advancement: mark the phase complete, then either
    /// dispatch the next phase or complete the run.
    fn advance_after_phase(
        &self,
        run_id: &RunId,
        phase_number: u32,
    ) -> Result<(), OrchestratorError> {
        let run = self.runs.update(run_id, |state| {
            if let Some(phase) = state.phase_mut(phase_number) {
                phase.status = PhaseStatus::Completed;
                phase.completed_at = Some(Utc::now());
            }
            state.status = RunStatus::Running;
        })?;

        let doc = self.load_progress(&run.project_dir)?;
        let next = doc
            .phases
            .iter()
            .filter(|phase| phase.number > phase_number)
            .find(|phase| {
                phase.task_ids.iter().any(|id| {
                    doc.task(id)
                        .map(|task| {
                            !task.done && !self.step_skipped(&run, phase.number, &task.id)
                        })
                        .unwrap_or(false)
                })
            });

        match next {
            Some(next_phase) => {
                let next_number = next_phase.number;
                self.runs.update(run_id, |state| {
                    state.current_phase_number = next_number;
                    if let Some(phase) = state.phase_mut(next_number) {
                        phase.status = PhaseStatus::Running;
                        phase.started_at = Some(Utc::now());
                    }
                })?;
                self.dispatch_phase(run_id, next_number)?;
                Ok(())
            }
            None => {
                self.runs.update(run_id, |state| {
                    state.status = RunStatus::Completed;
                })?;
                self.record_activity(
                    &run.project,
                    ActivityKind::RunCompleted {
                        run_id: run_id.clone(),
                    },
                );
                Ok(())
            }
        }
    }

    fn fail_run(&self, run_id: &RunId, reason: &str) -> Result<(), OrchestratorError> {
        let run = self.runs.update(run_id, |state| {
            state.status = RunStatus::Failed;
        })?;
        self.record_activity(
            &run.project,
            ActivityKind::RunFailed {
                run_id: run_id.clone(),
                reason: reason.to_string(),
            },
        );
        // Preserve the phase but surface the error on the project.
        if let Some(mut state) = load_project_state(&run.project_dir)? {
            state.status = ProjectStatus::Error;
            save_project_state(&run.project_dir, &state)?;
        }
        Ok(())
    }

    /// Cancel a run: running workers become cancelled, pending retry
    /// timers are dropped, late webhooks turn into orphans.
    pub fn cancel_run(&self, run_id: &RunId, reason: &str) -> Result<(), OrchestratorError> {
        let Some(run) = self.runs.get(run_id)? else {
            return Ok(());
        };

        for (key, entry) in self.registry.entries_for_run(run_id)? {
            if entry.status == WorkerStatus::Running {
                let task_id = key
                    .split_once(':')
                    .map(|(_, task)| TaskId::new(task))
                    .unwrap_or_else(|| TaskId::new(key.clone()));
                self.registry.update_status(
                    &run.project,
                    &task_id,
                    WorkerStatus::Cancelled,
                    Some(reason.to_string()),
                )?;
                if self.ledger.get(&entry.worker_id.0)?.is_some() {
                    let _ = self.ledger.cancel(&entry.worker_id.0, Some(reason.to_string()));
                }
            }
        }
        self.timers.cancel_run(run_id);
        self.runs.update(run_id, |state| {
            state.status = RunStatus::Failed;
        })?;
        self.record_activity(
            &run.project,
            ActivityKind::RunCancelled {
                run_id: run_id.clone(),
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    // ── Watcher tick ─────────────────────────────────────────────────

    /// One poller tick: fire due retry timers, sweep stale registry
    /// entries, advance projects, recover stalled dispatch.
    pub fn tick(&self) -> Result<(), OrchestratorError> {
        let now = Utc::now();

        for timer in self.timers.take_due(now) {
            eprintln!(
                "[swarmd] retry timer fired for {}:{}",
                timer.run_id, timer.task_id
            );
            self.dispatch_phase(&timer.run_id, timer.phase_number)?;
        }

        let swept = self
            .registry
            .clear_stale(chrono::Duration::seconds(self.config.watcher.registry_stale_secs))?;
        for key in swept {
            eprintln!("[swarmd] swept stale registry entry {key}");
        }

        let projects = self.list_projects()?;
        let watchdog_due = self
            .watchdog
            .sweep_due(self.config.watcher.watchdog_interval_secs, now);

        for project in projects {
            if let Err(err) = self.tick_project(&project, watchdog_due, now) {
                eprintln!("[swarmd] tick failed for project {project}: {err}");
            }
        }
        Ok(())
    }

    fn tick_project(
        &self,
        project: &ProjectName,
        watchdog_due: bool,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let project_dir = self.project_dir(project);
        let snapshot = load_snapshot(&project_dir)?;

        if let Some(to) = decide_advance(&snapshot) {
            if self
                .cooldowns
                .may_trigger(&self.config.watcher, &project.0, snapshot.phase, now)
            {
                let from = snapshot.phase;
                advance_project(&project_dir, to, now)?;
                self.cooldowns.mark_triggered(&project.0, from, now);
                self.record_activity(project, ActivityKind::PhaseAdvanced { from, to });
                match to {
                    ProjectPhase::Spec => self.spawn_spec_agent(project)?,
                    ProjectPhase::Build | ProjectPhase::Review => {
                        self.start_project_run(project).map(|_| ()).or_else(|err| {
                            match err {
                                OrchestratorError::NothingToDispatch { .. } => Ok(()),
                                other => Err(other),
                            }
                        })?;
                    }
                    _ => {}
                }
            }
            return Ok(());
        }

        // Recovery path: build phase, no running workers, ready tasks.
        if snapshot.phase == ProjectPhase::Build || snapshot.phase == ProjectPhase::Review {
            if let Some(run) = self.runs.active_run_for_project(project)? {
                let running = self.registry.running_count(project)?;
                let doc = self.load_progress(&project_dir)?;
                let ready = doc.ready_tasks_in_phase(run.current_phase_number).len();
                if running == 0
                    && ready > 0
                    && self.cooldowns.may_trigger(
                        &self.config.watcher,
                        &project.0,
                        snapshot.phase,
                        now,
                    )
                {
                    self.cooldowns.mark_triggered(&project.0, snapshot.phase, now);
                    self.dispatch_phase(&run.run_id, run.current_phase_number)?;
                }

                if watchdog_due {
                    self.watchdog_check(project, &project_dir, &run, now)?;
                }
            }
        }
        Ok(())
    }

    /// Progress watchdog: re-dispatch a project whose files have gone
    /// quiet, escalating tasks that keep stalling.
    fn watchdog_check(
        &self,
        project: &ProjectName,
        project_dir: &Path,
        run: &RunState,
        _now: chrono::DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let Some(idle) = project_idle_secs(project_dir, std::time::SystemTime::now()) else {
            return Ok(());
        };
        if idle <= self.config.watcher.watchdog_idle_secs {
            return Ok(());
        }

        let doc = self.load_progress(project_dir)?;
        let stalled: Vec<TaskId> = doc
            .ready_tasks_in_phase(run.current_phase_number)
            .iter()
            .map(|task| task.id.clone())
            .collect();

        self.record_activity(
            project,
            ActivityKind::WatchdogRetry {
                task_id: stalled.first().cloned(),
                idle_secs: idle,
            },
        );
        self.ledger_watchdog_event(run, idle);

        let over_cap = self.watchdog.record_retry(
            &project.0,
            &stalled,
            self.config.watcher.watchdog_max_retries,
        );
        for task_id in over_cap {
            if self
                .escalations
                .open_for_task(&run.run_id, &task_id)?
                .is_none()
            {
                self.escalations.create(CreateEscalation {
                    run_id: Some(run.run_id.clone()),
                    pipeline: Some(project.0.clone()),
                    phase_number: Some(run.current_phase_number),
                    step_order: Some(step_order(run.current_phase_number, &task_id)),
                    role: None,
                    task_id: Some(task_id),
                    message: format!("watchdog retries exhausted after {idle}s of no progress"),
                    attempt_count: self.config.watcher.watchdog_max_retries,
                    max_attempts: self.config.watcher.watchdog_max_retries,
                    severity: None,
                })?;
            }
        }

        // Force-continue: stale registry entries for this run get swept on
        // the next clear_stale; dispatch picks up whatever is spawnable.
        self.dispatch_phase(&run.run_id, run.current_phase_number)?;
        Ok(())
    }

    fn ledger_watchdog_event(&self, run: &RunState, idle: i64) {
        for (_, entry) in self
            .registry
            .entries_for_run(&run.run_id)
            .unwrap_or_default()
        {
            if entry.status == WorkerStatus::Running
                && self.ledger.get(&entry.worker_id.0).ok().flatten().is_some()
            {
                let _ = self.ledger.append_event(
                    &entry.worker_id.0,
                    &format!("watchdog-retry after {idle}s idle"),
                );
            }
        }
    }

    // ── Agent spawn helpers ──────────────────────────────────────────

    fn spawn_reviewer(
        &self,
        run: &RunState,
        phase_number: u32,
        role_name: &str,
    ) -> Result<(), OrchestratorError> {
        let role = self.roles.get(&RoleId::new(role_name))?;
        let instructions = self.roles.instructions(&role)?;
        let prompt = build_reviewer_prompt(&ReviewerPromptInput {
            role_instructions: &instructions,
            run_id: &run.run_id,
            phase_number,
            phase_branch: &phase_branch(&run.run_id, phase_number),
            repo_dir: &run.repo_dir.to_string_lossy(),
            webhook_base_url: &self.config.dispatch.webhook_base_url,
        });

        self.record_activity(
            &run.project,
            ActivityKind::ReviewRequested {
                run_id: run.run_id.clone(),
                phase_number,
                reviewer_role: role_name.to_string(),
            },
        );

        match self.gateway.spawn(&SpawnRequest {
            task: prompt,
            label: format!("{}/phase-{phase_number}/{role_name}", run.run_id),
            model: role.model.clone(),
            thinking: role.thinking,
            cleanup: true,
            run_timeout_seconds: Some(self.config.gateway.run_timeout_secs),
            skip_verify: None,
        }) {
            Ok(response) => {
                if let Some(session_key) = response.child_session_key {
                    self.reviews.update(&run.run_id, phase_number, |cycle| {
                        cycle.current_session_key = Some(session_key.clone());
                    })?;
                }
                Ok(())
            }
            Err(err) => self.escalate_control_spawn_failure(run, phase_number, role_name, err),
        }
    }

    fn spawn_fixer(
        &self,
        run: &RunState,
        phase_number: u32,
        findings: &[swarm_gateway::types::ReviewFinding],
    ) -> Result<(), OrchestratorError> {
        let role = self.roles.get(&RoleId::new("fixer"))?;
        let instructions = self.roles.instructions(&role)?;
        let prompt = build_fixer_prompt(&FixerPromptInput {
            role_instructions: &instructions,
            run_id: &run.run_id,
            phase_number,
            phase_branch: &phase_branch(&run.run_id, phase_number),
            repo_dir: &run.repo_dir.to_string_lossy(),
            findings,
            webhook_base_url: &self.config.dispatch.webhook_base_url,
        });

        match self.gateway.spawn(&SpawnRequest {
            task: prompt,
            label: format!("{}/phase-{phase_number}/fixer", run.run_id),
            model: role.model.clone(),
            thinking: role.thinking,
            cleanup: true,
            run_timeout_seconds: Some(self.config.gateway.run_timeout_secs),
            skip_verify: None,
        }) {
            Ok(_) => Ok(()),
            Err(err) => self.escalate_control_spawn_failure(run, phase_number, "fixer", err),
        }
    }

    fn spawn_resolver(&self, run: &RunState, context_id: &str) -> Result<(), OrchestratorError> {
        let Some(context) = self.resolvers.get(context_id)? else {
            return Ok(());
        };
        let role = self.roles.get(&RoleId::new("conflict-resolver"))?;
        let instructions = self.roles.instructions(&role)?;

        // Task titles of the colliding workers give the resolver intent.
        let doc = self.load_progress(&run.project_dir)?;
        let titles: Vec<String> = self
            .collector
            .get(&context.run_id, context.phase_number)?
            .map(|state| {
                state
                    .workers
                    .iter()
                    .filter_map(|worker| doc.task(&worker.task_id).map(|t| t.title.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let completion_task_id = format!("{RESOLVER_TASK_PREFIX}{context_id}");
        let prompt = build_resolver_prompt(&ResolverPromptInput {
            role_instructions: &instructions,
            run_id: &context.run_id,
            phase_number: context.phase_number,
            phase_branch: &context.phase_branch,
            source_branch: &context.source_branch,
            repo_dir: &context.repo_dir.to_string_lossy(),
            conflict_files: &context.conflict_files,
            colliding_task_titles: &titles,
            webhook_base_url: &self.config.dispatch.webhook_base_url,
            completion_task_id: &completion_task_id,
        });

        match self.gateway.spawn(&SpawnRequest {
            task: prompt,
            label: format!("{}/resolver/{context_id}", run.run_id),
            model: role.model.clone(),
            thinking: role.thinking,
            cleanup: true,
            run_timeout_seconds: Some(self.config.gateway.run_timeout_secs),
            skip_verify: None,
        }) {
            Ok(response) => {
                if let Some(session_key) = response.child_session_key {
                    self.resolvers.set_session_key(context_id, &session_key)?;
                }
                Ok(())
            }
            Err(err) => {
                self.resolvers.fail(context_id)?;
                self.escalate_control_spawn_failure(
                    run,
                    context.phase_number,
                    "conflict-resolver",
                    err,
                )
            }
        }
    }

    fn spawn_spec_agent(&self, project: &ProjectName) -> Result<(), OrchestratorError> {
        let role = self.roles.get(&RoleId::new("spec"))?;
        let instructions = self.roles.instructions(&role)?;
        let project_dir = self.project_dir(project);
        let prompt = format!(
            "{instructions}\n\nProject directory: `{}`. Read interview.json, \
             write specs/IMPLEMENTATION_PLAN.md and an annotated progress.md, \
             then POST JSON to {}/spec-complete with body \
             {{\"project\":\"{}\"}}.\n",
            project_dir.display(),
            self.config.dispatch.webhook_base_url,
            project
        );

        if let Err(err) = self.gateway.spawn(&SpawnRequest {
            task: prompt,
            label: format!("{project}/spec"),
            model: role.model.clone(),
            thinking: role.thinking,
            cleanup: true,
            run_timeout_seconds: Some(self.config.gateway.run_timeout_secs),
            skip_verify: None,
        }) {
            eprintln!("[swarmd] spec agent spawn failed for {project}: {err}");
        }
        Ok(())
    }

    fn escalate_control_spawn_failure(
        &self,
        run: &RunState,
        phase_number: u32,
        role_name: &str,
        err: GatewayError,
    ) -> Result<(), OrchestratorError> {
        eprintln!("[swarmd] {role_name} spawn failed for {}: {err}", run.run_id);
        let escalation = self.escalations.create(CreateEscalation {
            run_id: Some(run.run_id.clone()),
            pipeline: Some(run.project.0.clone()),
            phase_number: Some(phase_number),
            step_order: None,
            role: Some(RoleId::new(role_name)),
            task_id: None,
            message: format!("{role_name} agent spawn failed: {err}"),
            attempt_count: 1,
            max_attempts: 1,
            severity: Some(swarm_core::state::EscalationSeverity::Medium),
        })?;
        self.record_activity(
            &run.project,
            ActivityKind::EscalationCreated {
                escalation_id: escalation.id,
                severity: escalation.severity,
                message: escalation.message,
            },
        );
        Ok(())
    }

    // ── Shared plumbing ──────────────────────────────────────────────

    fn ensure_phase_worker(
        &self,
        run: &RunState,
        phase_number: u32,
        worker_id: &WorkerId,
        task: &ParsedTask,
        branch: &str,
    ) -> Result<(), OrchestratorError> {
        match self.collector.get(&run.run_id, phase_number)? {
            Some(_) => {
                self.collector.add_worker(
                    &run.run_id,
                    phase_number,
                    worker_id,
                    &task.id,
                    branch,
                )?;
            }
            None => {
                self.collector.init_phase(InitPhase {
                    run_id: run.run_id.clone(),
                    phase_number,
                    project: run.project.clone(),
                    project_dir: run.project_dir.clone(),
                    repo_dir: run.repo_dir.clone(),
                    base_branch: run.base_branch.clone(),
                    workers: vec![(worker_id.clone(), task.id.clone(), branch.to_string())],
                })?;
            }
        }
        Ok(())
    }

    /// Delete worker worktrees and branches once their phase is merged.
    fn cleanup_phase_workers(&self, run: &RunState, phase_number: u32) {
        let Ok(Some(state)) = self.collector.get(&run.run_id, phase_number) else {
            return;
        };
        let Ok(repo) = discover_repo(&run.repo_dir, &self.git) else {
            return;
        };
        for worker in &state.workers {
            let path = self
                .worktrees
                .worker_path(&run.run_id, &worker.worker_id);
            self.locks.with_path(&run.repo_dir, || {
                if let Err(err) = self.worktrees.remove_worktree(&repo, &path, &worker.branch) {
                    eprintln!(
                        "[swarmd] worktree cleanup failed for {}: {err}",
                        worker.worker_id
                    );
                }
            });
        }
        // The phase branch itself survives until project completion; only
        // the worker branches are destroyed with their phase.
    }

    fn task_for_payload(
        &self,
        doc: &ProgressDoc,
        payload: &WorkerCompletePayload,
    ) -> Option<ParsedTask> {
        if let Some(task_id) = &payload.task_id {
            return doc.task(task_id).cloned();
        }
        let order = payload.step_order?;
        doc.tasks
            .iter()
            .find(|task| step_order(task.phase_number, &task.id) == order)
            .cloned()
    }

    fn step_skipped(&self, run: &RunState, phase_number: u32, task_id: &TaskId) -> bool {
        let order = step_order(phase_number, task_id);
        run.step_results
            .iter()
            .any(|result| result.step_order == order && result.status == StepStatus::Skipped)
    }

    /// Serialized read-modify-write of the progress document. Returns
    /// whether the document changed (false on idempotent replay).
    fn mark_done_in_progress(
        &self,
        project_dir: &Path,
        task_id: &TaskId,
    ) -> Result<bool, OrchestratorError> {
        let path = project_dir.join("progress.md");
        self.locks.with_path(&path, || {
            let text = std::fs::read_to_string(&path).map_err(|source| {
                OrchestratorError::Read {
                    path: path.clone(),
                    source,
                }
            })?;
            match mark_task_done(&text, task_id) {
                Some(updated) => {
                    let tmp = path.with_extension("md.tmp");
                    std::fs::write(&tmp, &updated).map_err(|source| OrchestratorError::Read {
                        path: tmp.clone(),
                        source,
                    })?;
                    std::fs::rename(&tmp, &path).map_err(|source| OrchestratorError::Read {
                        path: path.clone(),
                        source,
                    })?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn load_progress(&self, project_dir: &Path) -> Result<ProgressDoc, OrchestratorError> {
        let path = project_dir.join("progress.md");
        let text = std::fs::read_to_string(&path).map_err(|source| OrchestratorError::Read {
            path: path.clone(),
            source,
        })?;
        Ok(parse_progress(&text)?)
    }

    fn project_dir(&self, project: &ProjectName) -> PathBuf {
        self.config.projects_root.join(&project.0)
    }

    fn list_projects(&self) -> Result<Vec<ProjectName>, OrchestratorError> {
        let entries = match std::fs::read_dir(&self.config.projects_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(OrchestratorError::Read {
                    path: self.config.projects_root.clone(),
                    source,
                })
            }
        };

        let mut projects = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && path.join("state.json").exists() {
                projects.push(ProjectName::new(
                    entry.file_name().to_string_lossy().into_owned(),
                ));
            }
        }
        projects.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(projects)
    }

    fn record_activity(&self, project: &ProjectName, kind: ActivityKind) {
        let event = ActivityEvent::now(Some(project.0.clone()), kind);
        let project_feed = self.project_dir(project).join("activity.jsonl");
        if let Err(err) = append_jsonl(&project_feed, &event) {
            eprintln!("[swarmd] failed to append activity event: {err}");
        }
        let global = self.config.data_root.join("ledger.jsonl");
        if let Err(err) = append_jsonl(&global, &event) {
            eprintln!("[swarmd] failed to append global event: {err}");
        }
    }

    fn next_worker_id(&self) -> WorkerId {
        let seq = self.worker_seq.fetch_add(1, Ordering::Relaxed);
        let millis = Utc::now().timestamp_millis();
        WorkerId::new(format!("w-{millis}-{seq}"))
    }
}


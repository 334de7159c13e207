//! Shared fixtures for the scenario tests: a recording mock gateway and a
//! project-plus-repo on-disk layout.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use swarm_core::config::SwarmConfig;
use swarm_core::state::ProjectPhase;
use swarm_core::types::{step_order, ProjectName, RunId, TaskId};
use swarm_gateway::client::SpawnBackend;
use swarm_gateway::error::GatewayError;
use swarm_gateway::types::{
    ReviewDecision, ReviewResultPayload, SpawnRequest, SpawnResponse, WebhookStatus,
    WorkerCompletePayload,
};

use crate::advancer::{save_project_state, ProjectState, ProjectStatus};
use crate::orchestrator::Orchestrator;

#[derive(Default)]
struct MockInner {
    spawns: Mutex<Vec<SpawnRequest>>,
    // label substring -> remaining failures to inject
    failures: Mutex<HashMap<String, u32>>,
    counter: AtomicU64,
}

/// Recording gateway double. Failures are scripted per label substring,
/// so one task can fail while its siblings spawn normally.
#[derive(Clone, Default)]
pub struct MockGateway {
    inner: Arc<MockInner>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_spawns_matching(&self, label_substring: &str, times: u32) {
        self.inner
            .failures
            .lock()
            .expect("mock lock")
            .insert(label_substring.to_string(), times);
    }

    pub fn spawns(&self) -> Vec<SpawnRequest> {
        self.inner.spawns.lock().expect("mock lock").clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.inner.spawns.lock().expect("mock lock").len()
    }

    pub fn spawn_labels(&self) -> Vec<String> {
        self.spawns().into_iter().map(|s| s.label).collect()
    }
}

impl SpawnBackend for MockGateway {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnResponse, GatewayError> {
        {
            let mut failures = self.inner.failures.lock().expect("mock lock");
            let matched = failures
                .iter_mut()
                .find(|(substring, remaining)| {
                    request.label.contains(substring.as_str()) && **remaining > 0
                })
                .map(|(_, remaining)| {
                    *remaining -= 1;
                });
            if matched.is_some() {
                return Err(GatewayError::SpawnRefused {
                    reason: format!("scripted failure for {}", request.label),
                });
            }
        }

        self.inner
            .spawns
            .lock()
            .expect("mock lock")
            .push(request.clone());
        let seq = self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(SpawnResponse {
            ok: true,
            run_id: Some(format!("gw-{seq}")),
            child_session_key: Some(format!("sess-{seq}")),
            verified: true,
        })
    }
}

pub fn run_git(cwd: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {:?} failed in {}: {}",
        args,
        cwd.display(),
        String::from_utf8_lossy(&output.stderr)
    );
}

pub fn commit_all(cwd: &Path, message: &str) {
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

pub struct ScenarioEnv {
    pub root: PathBuf,
    pub config: SwarmConfig,
    pub gateway: MockGateway,
    pub orch: Orchestrator,
    pub project: ProjectName,
}

impl ScenarioEnv {
    pub fn project_dir(&self) -> PathBuf {
        self.config.projects_root.join(&self.project.0)
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.project_dir().join("repo")
    }

    /// Commit a file inside a worker's worktree, simulating the agent's
    /// output.
    pub fn commit_in_worktree(&self, run_id: &RunId, task: &str, file: &str, content: &str) {
        let entry = self
            .orch
            .registry
            .get(&self.project, &TaskId::new(task))
            .expect("registry read")
            .expect("registry entry");
        let worktree = self
            .config
            .worktree_root
            .join(&run_id.0)
            .join(&entry.worker_id.0);
        assert!(worktree.exists(), "worktree missing: {}", worktree.display());
        fs::write(worktree.join(file), content).expect("write in worktree");
        commit_all(&worktree, &format!("{task}: {file}"));
    }

    /// Deliver the worker-complete webhook for one task.
    pub fn complete_worker(&self, run_id: &RunId, phase: u32, task: &str) {
        self.deliver_worker_webhook(run_id, phase, task, WebhookStatus::Completed, None);
    }

    pub fn fail_worker(&self, run_id: &RunId, phase: u32, task: &str, error: &str) {
        self.deliver_worker_webhook(
            run_id,
            phase,
            task,
            WebhookStatus::Failed,
            Some(error.to_string()),
        );
    }

    pub fn deliver_worker_webhook(
        &self,
        run_id: &RunId,
        phase: u32,
        task: &str,
        status: WebhookStatus,
        error: Option<String>,
    ) {
        self.orch
            .handle_worker_complete(&WorkerCompletePayload {
                run_id: run_id.0.clone(),
                step_order: Some(step_order(phase, &TaskId::new(task))),
                task_id: None,
                status,
                output: Some(format!("{task} done")),
                error,
            })
            .expect("worker-complete webhook");
    }

    /// Approve review rounds until the cycle is merged (or rounds run out).
    pub fn approve_reviews(&self, run_id: &RunId, phase: u32) {
        for _ in 0..8 {
            let Some(cycle) = self
                .orch
                .reviews
                .get(run_id, phase)
                .expect("review read")
            else {
                return;
            };
            if cycle.status != swarm_core::state::ReviewCycleStatus::Pending {
                return;
            }
            self.orch
                .handle_review_result(&ReviewResultPayload {
                    status: ReviewDecision::Approved,
                    run_id: run_id.0.clone(),
                    phase_number: phase,
                    findings: Vec::new(),
                    summary: None,
                })
                .expect("review webhook");
        }
    }
}

fn unique_root(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("swarmops-scenario-{prefix}-{now}"))
}

/// Build a project with the given progress document, a git repo on
/// `main`, and an orchestrator with zero stagger and fast retries.
pub fn setup(prefix: &str, progress: &str) -> ScenarioEnv {
    setup_with(prefix, progress, |_| {})
}

pub fn setup_with(
    prefix: &str,
    progress: &str,
    customize: impl FnOnce(&mut SwarmConfig),
) -> ScenarioEnv {
    let root = unique_root(prefix);
    let mut config = SwarmConfig::rooted(&root);
    config.dispatch.spawn_stagger_ms = 0;
    config.retry.base_delay_ms = 20;
    config.retry.max_delay_ms = 100;
    customize(&mut config);

    let project = ProjectName::new("shop");
    let project_dir = config.projects_root.join(&project.0);
    fs::create_dir_all(&project_dir).expect("create project dir");
    fs::write(project_dir.join("progress.md"), progress).expect("write progress");
    save_project_state(
        &project_dir,
        &ProjectState {
            phase: ProjectPhase::Build,
            status: ProjectStatus::Running,
            iteration: 0,
            history: Vec::new(),
        },
    )
    .expect("write project state");

    let repo_dir = project_dir.join("repo");
    fs::create_dir_all(&repo_dir).expect("create repo dir");
    run_git(&repo_dir, &["init", "-b", "main"]);
    fs::write(repo_dir.join("README.md"), "init\n").expect("write readme");
    commit_all(&repo_dir, "init");

    let gateway = MockGateway::new();
    let orch = Orchestrator::open(config.clone(), Box::new(gateway.clone()))
        .expect("open orchestrator");

    ScenarioEnv {
        root,
        config,
        gateway,
        orch,
        project,
    }
}

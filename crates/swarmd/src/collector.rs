//! Per-phase completion tracking and branch collection.
//!
//! Workers complete in any order; the aggregation here is commutative and
//! `phase_complete` is monotonic — once a phase closes, replayed webhooks
//! cannot reopen it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use swarm_core::state::{check_phase_transition, PhaseStatus, StateError, WorkerStatus};
use swarm_core::types::{phase_branch, ProjectName, RunId, TaskId, WorkerId};
use swarm_git::{
    branch_exists, branch_has_commits_beyond, recreate_branch, GitCli, GitError, RepoHandle,
};
use swarm_store::{read_json, write_json_atomic, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Transition(#[from] StateError),
    #[error("phase state not found: {run_id} phase {phase_number}")]
    NotFound { run_id: String, phase_number: u32 },
    #[error("phase {phase_number} of {run_id} has failed workers: {failed:?}")]
    WorkersFailed {
        run_id: String,
        phase_number: u32,
        failed: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseWorker {
    pub worker_id: WorkerId,
    pub task_id: TaskId,
    pub branch: String,
    pub status: WorkerStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    pub run_id: RunId,
    pub phase_number: u32,
    pub project: ProjectName,
    pub project_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub base_branch: String,
    pub status: PhaseStatus,
    pub workers: Vec<PhaseWorker>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PhaseState {
    pub fn worker(&self, worker_id: &WorkerId) -> Option<&PhaseWorker> {
        self.workers.iter().find(|w| &w.worker_id == worker_id)
    }

    pub fn all_workers_done(&self) -> bool {
        self.workers.iter().all(|w| w.status.is_terminal())
    }

    pub fn all_workers_succeeded(&self) -> bool {
        self.workers
            .iter()
            .all(|w| w.status == WorkerStatus::Completed)
    }

    /// Workers whose failure has not been resolved into a retry or a
    /// skip. Cancelled workers are skipped steps and do not block
    /// collection.
    pub fn failed_worker_ids(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Failed)
            .map(|w| w.worker_id.0.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionSnapshot {
    pub phase_complete: bool,
    pub all_succeeded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitPhase {
    pub run_id: RunId,
    pub phase_number: u32,
    pub project: ProjectName,
    pub project_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub base_branch: String,
    pub workers: Vec<(WorkerId, TaskId, String)>,
}

#[derive(Debug)]
pub struct PhaseCollector {
    dir: PathBuf,
    live: Mutex<HashMap<String, PhaseState>>,
}

impl PhaseCollector {
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
        self.dir.join(format!("{}.json", Self::key(run_id, phase_number)))
    }

    pub fn init_phase(&self, init: InitPhase) -> Result<PhaseState, CollectorError> {
        let now = Utc::now();
        let state = PhaseState {
            run_id: init.run_id.clone(),
            phase_number: init.phase_number,
            project: init.project,
            project_dir: init.project_dir,
            repo_dir: init.repo_dir,
            base_branch: init.base_branch,
            status: PhaseStatus::Running,
            workers: init
                .workers
                .into_iter()
                .map(|(worker_id, task_id, branch)| PhaseWorker {
                    worker_id,
                    task_id,
                    branch,
                    status: WorkerStatus::Running,
                    output: None,
                    error: None,
                })
                .collect(),
            created_at: now,
            updated_at: now,
        };

        write_json_atomic(&self.path(&init.run_id, init.phase_number), &state)?;
        self.lock()
            .insert(Self::key(&init.run_id, init.phase_number), state.clone());
        Ok(state)
    }

    pub fn get(
        &self,
        run_id: &RunId,
        phase_number: u32,
    ) -> Result<Option<PhaseState>, CollectorError> {
        if let Some(state) = self.lock().get(&Self::key(run_id, phase_number)) {
            return Ok(Some(state.clone()));
        }
        Ok(read_json(&self.path(run_id, phase_number))?)
    }

    /// Attach a worker spawned after the phase record was created (tasks
    /// unlock as their dependencies complete, and retries replace failed
    /// workers). A terminal worker for the same task is superseded; a
    /// phase past `Running` refuses new workers.
    pub fn add_worker(
        &self,
        run_id: &RunId,
        phase_number: u32,
        worker_id: &WorkerId,
        task_id: &TaskId,
        branch: &str,
    ) -> Result<(), CollectorError> {
        let mut table = self.lock();
        let key = Self::key(run_id, phase_number);
        let state = match table.get_mut(&key) {
            Some(state) => state,
            None => {
                let loaded: PhaseState = read_json(&self.path(run_id, phase_number))?
                    .ok_or_else(|| CollectorError::NotFound {
                        run_id: run_id.0.clone(),
                        phase_number,
                    })?;
                table.entry(key).or_insert(loaded)
            }
        };

        if state.status != PhaseStatus::Running {
            return Ok(());
        }
        if state.workers.iter().any(|w| &w.worker_id == worker_id) {
            return Ok(());
        }

        let fresh = PhaseWorker {
            worker_id: worker_id.clone(),
            task_id: task_id.clone(),
            branch: branch.to_string(),
            status: WorkerStatus::Running,
            output: None,
            error: None,
        };
        if let Some(existing) = state
            .workers
            .iter_mut()
            .find(|w| &w.task_id == task_id && w.status.is_terminal())
        {
            *existing = fresh;
        } else {
            state.workers.push(fresh);
        }
        state.updated_at = Utc::now();
        let snapshot = state.clone();
        write_json_atomic(&self.path(run_id, phase_number), &snapshot)?;
        Ok(())
    }

    /// Record one worker's completion. Idempotent per worker: a worker that
    /// already reached a terminal status is left untouched, so a replayed
    /// webhook cannot flip a closed phase.
    pub fn on_worker_complete(
        &self,
        run_id: &RunId,
        phase_number: u32,
        worker_id: &WorkerId,
        status: WorkerStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<CompletionSnapshot, CollectorError> {
        let mut table = self.lock();
        let key = Self::key(run_id, phase_number);
        let state = match table.get_mut(&key) {
            Some(state) => state,
            None => {
                let loaded: PhaseState = read_json(&self.path(run_id, phase_number))?
                    .ok_or_else(|| CollectorError::NotFound {
                        run_id: run_id.0.clone(),
                        phase_number,
                    })?;
                table.entry(key).or_insert(loaded)
            }
        };

        if let Some(worker) = state
            .workers
            .iter_mut()
            .find(|w| &w.worker_id == worker_id)
        {
            if !worker.status.is_terminal() {
                worker.status = status;
                worker.output = output;
                worker.error = error;
                state.updated_at = Utc::now();
                let snapshot = state.clone();
                write_json_atomic(&self.path(run_id, phase_number), &snapshot)?;
            }
        }

        Ok(CompletionSnapshot {
            phase_complete: state.all_workers_done(),
            all_succeeded: state.all_workers_succeeded(),
        })
    }

    /// Collect the worker branches that actually carry commits, and
    /// (re)create the phase branch off base as the merge target.
    ///
    /// Errors when any worker failed. Returns an empty list when no worker
    /// produced commits — the caller short-circuits the phase.
    pub fn collect_phase_branches(
        &self,
        run_id: &RunId,
        phase_number: u32,
        git: &GitCli,
        repo: &RepoHandle,
    ) -> Result<Vec<String>, CollectorError> {
        let state = self
            .get(run_id, phase_number)?
            .ok_or_else(|| CollectorError::NotFound {
                run_id: run_id.0.clone(),
                phase_number,
            })?;

        let failed = state.failed_worker_ids();
        if !failed.is_empty() {
            return Err(CollectorError::WorkersFailed {
                run_id: run_id.0.clone(),
                phase_number,
                failed,
            });
        }

        let mut branches = Vec::new();
        for worker in &state.workers {
            if worker.status == WorkerStatus::Completed
                && branch_exists(repo, git, &worker.branch)?
                && branch_has_commits_beyond(repo, git, &worker.branch, &state.base_branch)?
            {
                branches.push(worker.branch.clone());
            }
        }

        if !branches.is_empty() {
            let target = phase_branch(run_id, phase_number);
            recreate_branch(repo, git, &target, &state.base_branch)?;
        }

        self.set_status(run_id, phase_number, PhaseStatus::Collecting)?;
        Ok(branches)
    }

    /// Mark a task's worker as a skipped step (exhausted retries). Unlike
    /// `on_worker_complete` this overrides a Failed record, because the
    /// skip IS the resolution of that failure. A Completed worker is left
    /// alone.
    pub fn skip_task(
        &self,
        run_id: &RunId,
        phase_number: u32,
        task_id: &TaskId,
        reason: &str,
    ) -> Result<(), CollectorError> {
        let mut table = self.lock();
        let key = Self::key(run_id, phase_number);
        let state = match table.get_mut(&key) {
            Some(state) => state,
            None => {
                let Some(loaded) = read_json::<PhaseState>(&self.path(run_id, phase_number))?
                else {
                    return Ok(());
                };
                table.entry(key).or_insert(loaded)
            }
        };

        let mut changed = false;
        for worker in state
            .workers
            .iter_mut()
            .filter(|w| &w.task_id == task_id && w.status != WorkerStatus::Completed)
        {
            if worker.status != WorkerStatus::Cancelled {
                worker.status = WorkerStatus::Cancelled;
                worker.error = Some(reason.to_string());
                changed = true;
            }
        }
        if changed {
            state.updated_at = Utc::now();
            let snapshot = state.clone();
            write_json_atomic(&self.path(run_id, phase_number), &snapshot)?;
        }
        Ok(())
    }

    pub fn set_status(
        &self,
        run_id: &RunId,
        phase_number: u32,
        status: PhaseStatus,
    ) -> Result<PhaseState, CollectorError> {
        let mut table = self.lock();
        let key = Self::key(run_id, phase_number);
        let state = match table.get_mut(&key) {
            Some(state) => state,
            None => {
                let loaded: PhaseState = read_json(&self.path(run_id, phase_number))?
                    .ok_or_else(|| CollectorError::NotFound {
                        run_id: run_id.0.clone(),
                        phase_number,
                    })?;
                table.entry(key).or_insert(loaded)
            }
        };

        check_phase_transition(state.status, status)?;
        state.status = status;
        state.updated_at = Utc::now();
        let snapshot = state.clone();
        write_json_atomic(&self.path(run_id, phase_number), &snapshot)?;

        if status.is_terminal() {
            table.remove(&Self::key(run_id, phase_number));
        }
        Ok(snapshot)
    }

    pub fn complete_phase(
        &self,
        run_id: &RunId,
        phase_number: u32,
    ) -> Result<PhaseState, CollectorError> {
        self.set_status(run_id, phase_number, PhaseStatus::Completed)
    }

    pub fn fail_phase(
        &self,
        run_id: &RunId,
        phase_number: u32,
    ) -> Result<PhaseState, CollectorError> {
        self.set_status(run_id, phase_number, PhaseStatus::Failed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PhaseState>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::process::Command;
    use std::time::{SystemTime, UNIX_EPOCH};
    use swarm_core::types::worker_branch;
    use swarm_git::{checkout_branch, create_branch, discover_repo};

    fn unique_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("swarmops-collector-{prefix}-{now}"))
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
        let root = unique_dir("repo");
        fs::create_dir_all(&root).expect("create repo dir");
        run_git(&root, &["init", "-b", "main"]);
        fs::write(root.join("README.md"), "init\n").expect("write");
        commit_all(&root, "init");
        root
    }

    fn mk_init(run: &str, workers: &[(&str, &str)]) -> InitPhase {
        let run_id = RunId::new(run);
        InitPhase {
            run_id: run_id.clone(),
            phase_number: 1,
            project: ProjectName::new("shop"),
            project_dir: PathBuf::from("/projects/shop"),
            repo_dir: PathBuf::from("/projects/shop/repo"),
            base_branch: "main".to_string(),
            workers: workers
                .iter()
                .map(|(worker, task)| {
                    let worker_id = WorkerId::new(*worker);
                    let branch = worker_branch(&run_id, &worker_id);
                    (worker_id, TaskId::new(*task), branch)
                })
                .collect(),
        }
    }

    #[test]
    fn init_starts_all_workers_running() {
        let collector = PhaseCollector::new(unique_dir("init"));
        let state = collector
            .init_phase(mk_init("run-1", &[("w-1", "a"), ("w-2", "b")]))
            .expect("init");
        assert_eq!(state.status, PhaseStatus::Running);
        assert_eq!(state.workers.len(), 2);
        assert!(state
            .workers
            .iter()
            .all(|w| w.status == WorkerStatus::Running));
    }

    #[test]
    fn completion_is_commutative_and_reports_phase_close() {
        let collector = PhaseCollector::new(unique_dir("complete"));
        let run = RunId::new("run-1");
        collector
            .init_phase(mk_init("run-1", &[("w-1", "a"), ("w-2", "b")]))
            .expect("init");

        let first = collector
            .on_worker_complete(&run, 1, &WorkerId::new("w-2"), WorkerStatus::Completed, None, None)
            .expect("first");
        assert!(!first.phase_complete);

        let second = collector
            .on_worker_complete(&run, 1, &WorkerId::new("w-1"), WorkerStatus::Completed, None, None)
            .expect("second");
        assert!(second.phase_complete);
        assert!(second.all_succeeded);
    }

    #[test]
    fn phase_complete_is_monotonic_under_replayed_webhooks() {
        let collector = PhaseCollector::new(unique_dir("monotonic"));
        let run = RunId::new("run-1");
        collector
            .init_phase(mk_init("run-1", &[("w-1", "a")]))
            .expect("init");

        let closed = collector
            .on_worker_complete(&run, 1, &WorkerId::new("w-1"), WorkerStatus::Completed, None, None)
            .expect("complete");
        assert!(closed.phase_complete);

        // Replay with a contradictory status: the terminal worker record
        // wins and the phase stays closed.
        let replay = collector
            .on_worker_complete(
                &run,
                1,
                &WorkerId::new("w-1"),
                WorkerStatus::Failed,
                None,
                Some("late duplicate".to_string()),
            )
            .expect("replay");
        assert!(replay.phase_complete);
        assert!(replay.all_succeeded);
    }

    #[test]
    fn failed_worker_blocks_collection() {
        let dir = unique_dir("failed");
        let collector = PhaseCollector::new(&dir);
        let run = RunId::new("run-1");
        collector
            .init_phase(mk_init("run-1", &[("w-1", "a")]))
            .expect("init");
        collector
            .on_worker_complete(
                &run,
                1,
                &WorkerId::new("w-1"),
                WorkerStatus::Failed,
                None,
                Some("agent crashed".to_string()),
            )
            .expect("fail");

        let repo_root = init_repo();
        let git = GitCli::default();
        let repo = discover_repo(&repo_root, &git).expect("discover");
        let err = collector
            .collect_phase_branches(&run, 1, &git, &repo)
            .expect_err("failed worker");
        assert!(matches!(err, CollectorError::WorkersFailed { .. }));

        let _ = fs::remove_dir_all(repo_root);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn collects_only_branches_with_commits_and_creates_phase_branch() {
        let dir = unique_dir("collect");
        let collector = PhaseCollector::new(&dir);
        let repo_root = init_repo();
        let git = GitCli::default();
        let repo = discover_repo(&repo_root, &git).expect("discover");

        let run = RunId::new("run-1");
        collector
            .init_phase(mk_init("run-1", &[("w-1", "a"), ("w-2", "b")]))
            .expect("init");

        // w-1 commits work; w-2's branch stays even with main.
        let b1 = worker_branch(&run, &WorkerId::new("w-1"));
        let b2 = worker_branch(&run, &WorkerId::new("w-2"));
        create_branch(&repo, &git, &b1, "main").expect("branch");
        create_branch(&repo, &git, &b2, "main").expect("branch");
        checkout_branch(&repo, &git, &b1).expect("checkout");
        fs::write(repo_root.join("w1.txt"), "work\n").expect("write");
        commit_all(&repo_root, "w1 work");
        checkout_branch(&repo, &git, "main").expect("back to main");

        for worker in ["w-1", "w-2"] {
            collector
                .on_worker_complete(
                    &run,
                    1,
                    &WorkerId::new(worker),
                    WorkerStatus::Completed,
                    None,
                    None,
                )
                .expect("complete");
        }

        let branches = collector
            .collect_phase_branches(&run, 1, &git, &repo)
            .expect("collect");
        assert_eq!(branches, vec![b1]);
        assert!(branch_exists(&repo, &git, "swarmops/run-1/phase-1").expect("phase branch"));

        let _ = fs::remove_dir_all(repo_root);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_collection_short_circuits_without_phase_branch() {
        let dir = unique_dir("empty");
        let collector = PhaseCollector::new(&dir);
        let repo_root = init_repo();
        let git = GitCli::default();
        let repo = discover_repo(&repo_root, &git).expect("discover");

        let run = RunId::new("run-1");
        collector
            .init_phase(mk_init("run-1", &[("w-1", "a")]))
            .expect("init");
        collector
            .on_worker_complete(&run, 1, &WorkerId::new("w-1"), WorkerStatus::Completed, None, None)
            .expect("complete");

        let branches = collector
            .collect_phase_branches(&run, 1, &git, &repo)
            .expect("collect");
        assert!(branches.is_empty());
        assert!(!branch_exists(&repo, &git, "swarmops/run-1/phase-1").expect("check"));

        let _ = fs::remove_dir_all(repo_root);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn state_survives_restart_mid_phase() {
        let dir = unique_dir("restart");
        {
            let collector = PhaseCollector::new(&dir);
            collector
                .init_phase(mk_init("run-1", &[("w-1", "a"), ("w-2", "b")]))
                .expect("init");
            collector
                .on_worker_complete(
                    &RunId::new("run-1"),
                    1,
                    &WorkerId::new("w-1"),
                    WorkerStatus::Completed,
                    None,
                    None,
                )
                .expect("complete");
        }

        // New collector over the same dir (process restart).
        let collector = PhaseCollector::new(&dir);
        let state = collector
            .get(&RunId::new("run-1"), 1)
            .expect("get")
            .expect("present");
        assert_eq!(
            state.worker(&WorkerId::new("w-1")).expect("worker").status,
            WorkerStatus::Completed
        );
        assert_eq!(
            state.worker(&WorkerId::new("w-2")).expect("worker").status,
            WorkerStatus::Running
        );

        // The late webhook closes the phase normally.
        let snapshot = collector
            .on_worker_complete(
                &RunId::new("run-1"),
                1,
                &WorkerId::new("w-2"),
                WorkerStatus::Completed,
                None,
                None,
            )
            .expect("late webhook");
        assert!(snapshot.phase_complete);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn add_worker_supersedes_failed_attempt_for_same_task() {
        let dir = unique_dir("supersede");
        let collector = PhaseCollector::new(&dir);
        let run = RunId::new("run-1");
        collector
            .init_phase(mk_init("run-1", &[("w-1", "a")]))
            .expect("init");
        collector
            .on_worker_complete(
                &run,
                1,
                &WorkerId::new("w-1"),
                WorkerStatus::Failed,
                None,
                Some("boom".to_string()),
            )
            .expect("fail");

        // The retry spawn replaces the failed worker record.
        collector
            .add_worker(&run, 1, &WorkerId::new("w-2"), &TaskId::new("a"), "b2")
            .expect("add");
        let state = collector.get(&run, 1).expect("get").expect("present");
        assert_eq!(state.workers.len(), 1);
        assert_eq!(state.workers[0].worker_id, WorkerId::new("w-2"));
        assert_eq!(state.workers[0].status, WorkerStatus::Running);

        // A brand-new task appends instead.
        collector
            .add_worker(&run, 1, &WorkerId::new("w-3"), &TaskId::new("b"), "b3")
            .expect("add");
        assert_eq!(
            collector.get(&run, 1).expect("get").expect("present").workers.len(),
            2
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn terminal_status_removes_phase_from_live_table() {
        let dir = unique_dir("terminal");
        let collector = PhaseCollector::new(&dir);
        let run = RunId::new("run-1");
        collector
            .init_phase(mk_init("run-1", &[("w-1", "a")]))
            .expect("init");

        collector.complete_phase(&run, 1).expect("complete");
        // Still readable from disk.
        let state = collector.get(&run, 1).expect("get").expect("present");
        assert_eq!(state.status, PhaseStatus::Completed);

        let err = collector
            .set_status(&run, 1, PhaseStatus::Running)
            .expect_err("terminal phase");
        assert!(matches!(err, CollectorError::Transition(_)));
        let _ = fs::remove_dir_all(dir);
    }
}

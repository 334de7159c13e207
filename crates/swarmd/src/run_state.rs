//! Per-run and per-project state files, plus the in-memory table of live
//! runs. Every mutation is persisted atomically, so a crash costs at most
//! one duplicate spawn attempt (which the registry deduplicates).

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use swarm_core::state::{PhaseStatus, RunStatus, StepStatus};
use swarm_core::types::{ProjectName, RunId, TaskId};
use swarm_store::{read_json, write_json_atomic, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RunStateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("run not found: {run_id}")]
    NotFound { run_id: String },
    #[error("project {project} already has active run {run_id}")]
    RunActive { project: String, run_id: String },
    #[error("failed to scan runs directory {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub step_order: u64,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub escalation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub number: u32,
    pub name: String,
    pub status: PhaseStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub project: ProjectName,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub current_phase_number: u32,
    pub phases: Vec<PhaseRecord>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub project_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub base_branch: String,
    #[serde(default)]
    pub active_session_key: Option<String>,
    #[serde(default)]
    pub active_task_id: Option<TaskId>,
}

impl RunState {
    pub fn phase(&self, number: u32) -> Option<&PhaseRecord> {
        self.phases.iter().find(|phase| phase.number == number)
    }

    pub fn phase_mut(&mut self, number: u32) -> Option<&mut PhaseRecord> {
        self.phases.iter_mut().find(|phase| phase.number == number)
    }

    /// Record (or idempotently replace) one step result.
    pub fn record_step_result(&mut self, result: StepResult) {
        if let Some(existing) = self
            .step_results
            .iter_mut()
            .find(|r| r.step_order == result.step_order)
        {
            *existing = result;
        } else {
            self.step_results.push(result);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ProjectRunMapping {
    run_id: RunId,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Time-ordered unique run id.
pub fn next_run_id(now: DateTime<Utc>) -> RunId {
    RunId::new(format!(
        "run-{}",
        now.format("%Y%m%d-%H%M%S%3f")
    ))
}

#[derive(Debug)]
pub struct RunStateManager {
    runs_dir: PathBuf,
    project_runs_dir: PathBuf,
    active: Mutex<HashMap<String, RunState>>,
}

impl RunStateManager {
    pub fn new(runs_dir: impl Into<PathBuf>, project_runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            project_runs_dir: project_runs_dir.into(),
            active: Mutex::new(HashMap::new()),
        }
    }

    fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(format!("{}.json", run_id.0))
    }

    fn project_path(&self, project: &ProjectName) -> PathBuf {
        self.project_runs_dir.join(format!("{}.json", project.0))
    }

    /// Register a new run. Enforces the one-non-terminal-run-per-project
    /// invariant.
    pub fn create_run(&self, run: RunState) -> Result<(), RunStateError> {
        if let Some(existing) = self.active_run_for_project(&run.project)? {
            return Err(RunStateError::RunActive {
                project: run.project.0.clone(),
                run_id: existing.run_id.0,
            });
        }

        write_json_atomic(&self.run_path(&run.run_id), &run)?;
        write_json_atomic(
            &self.project_path(&run.project),
            &ProjectRunMapping {
                run_id: run.run_id.clone(),
                updated_at: Some(Utc::now()),
            },
        )?;
        self.lock().insert(run.run_id.0.clone(), run);
        Ok(())
    }

    pub fn get(&self, run_id: &RunId) -> Result<Option<RunState>, RunStateError> {
        if let Some(run) = self.lock().get(&run_id.0) {
            return Ok(Some(run.clone()));
        }
        Ok(read_json(&self.run_path(run_id))?)
    }

    /// Apply a mutation and persist it; terminal runs leave the live table.
    pub fn update<F>(&self, run_id: &RunId, mutate: F) -> Result<RunState, RunStateError>
    where
        F: FnOnce(&mut RunState),
    {
        let mut table = self.lock();
        let mut run = match table.get(&run_id.0) {
            Some(run) => run.clone(),
            None => read_json(&self.run_path(run_id))?.ok_or_else(|| RunStateError::NotFound {
                run_id: run_id.0.clone(),
            })?,
        };

        mutate(&mut run);
        if run.status.is_terminal() && run.completed_at.is_none() {
            run.completed_at = Some(Utc::now());
        }
        write_json_atomic(&self.run_path(run_id), &run)?;

        if run.status.is_terminal() {
            table.remove(&run_id.0);
            // Drop the project mapping so a new run may start.
            let _ = fs::remove_file(self.project_path(&run.project));
        } else {
            table.insert(run_id.0.clone(), run.clone());
        }
        Ok(run)
    }

    pub fn active_run_for_project(
        &self,
        project: &ProjectName,
    ) -> Result<Option<RunState>, RunStateError> {
        {
            let table = self.lock();
            if let Some(run) = table
                .values()
                .find(|run| &run.project == project && !run.status.is_terminal())
            {
                return Ok(Some(run.clone()));
            }
        }

        let Some(mapping) = read_json::<ProjectRunMapping>(&self.project_path(project))? else {
            return Ok(None);
        };
        let run: Option<RunState> = read_json(&self.run_path(&mapping.run_id))?;
        Ok(run.filter(|run| !run.status.is_terminal()))
    }

    pub fn active_runs(&self) -> Vec<RunState> {
        self.lock().values().cloned().collect()
    }

    /// Crash recovery: fold every non-terminal run file back into the live
    /// table. Returns the recovered runs for the caller to re-examine.
    pub fn load_active_runs(&self) -> Result<Vec<RunState>, RunStateError> {
        let entries = match fs::read_dir(&self.runs_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RunStateError::Scan {
                    path: self.runs_dir.clone(),
                    source,
                })
            }
        };

        let mut recovered = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| RunStateError::Scan {
                path: self.runs_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(run) = read_json::<RunState>(&path)? {
                if !run.status.is_terminal() {
                    recovered.push(run);
                }
            }
        }

        recovered.sort_by(|a, b| a.run_id.0.cmp(&b.run_id.0));
        let mut table = self.lock();
        for run in &recovered {
            table.insert(run.run_id.0.clone(), run.clone());
        }
        Ok(recovered)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunState>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_manager(prefix: &str) -> (RunStateManager, PathBuf) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("swarmops-runs-{prefix}-{now}"));
        (
            RunStateManager::new(dir.join("runs"), dir.join("project-runs")),
            dir,
        )
    }

    fn mk_run(run_id: &str, project: &str) -> RunState {
        RunState {
            run_id: RunId::new(run_id),
            project: ProjectName::new(project),
            pipeline_name: "build".to_string(),
            status: RunStatus::Running,
            current_phase_number: 1,
            phases: vec![PhaseRecord {
                number: 1,
                name: "Foundation".to_string(),
                status: PhaseStatus::Running,
                started_at: Some(Utc::now()),
                completed_at: None,
            }],
            step_results: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            project_dir: PathBuf::from("/projects/shop"),
            repo_dir: PathBuf::from("/projects/shop/repo"),
            base_branch: "main".to_string(),
            active_session_key: None,
            active_task_id: None,
        }
    }

    #[test]
    fn create_get_and_project_lookup() {
        let (manager, dir) = unique_manager("create");
        manager.create_run(mk_run("run-1", "shop")).expect("create");

        let loaded = manager.get(&RunId::new("run-1")).expect("get").expect("present");
        assert_eq!(loaded.project, ProjectName::new("shop"));

        let active = manager
            .active_run_for_project(&ProjectName::new("shop"))
            .expect("lookup")
            .expect("active");
        assert_eq!(active.run_id, RunId::new("run-1"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn second_active_run_per_project_is_rejected() {
        let (manager, dir) = unique_manager("single");
        manager.create_run(mk_run("run-1", "shop")).expect("create");
        let err = manager
            .create_run(mk_run("run-2", "shop"))
            .expect_err("second run");
        assert!(matches!(err, RunStateError::RunActive { .. }));

        // A different project is fine.
        manager.create_run(mk_run("run-3", "blog")).expect("create");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn terminal_update_clears_active_table_and_project_mapping() {
        let (manager, dir) = unique_manager("terminal");
        manager.create_run(mk_run("run-1", "shop")).expect("create");

        let completed = manager
            .update(&RunId::new("run-1"), |run| {
                run.status = RunStatus::Completed;
            })
            .expect("update");
        assert!(completed.completed_at.is_some());
        assert!(manager.active_runs().is_empty());
        assert!(manager
            .active_run_for_project(&ProjectName::new("shop"))
            .expect("lookup")
            .is_none());

        // A new run may start now.
        manager.create_run(mk_run("run-2", "shop")).expect("create");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn step_results_replace_idempotently_by_step_order() {
        let mut run = mk_run("run-1", "shop");
        let result = StepResult {
            step_id: "cart".to_string(),
            step_order: 100_001,
            status: StepStatus::Failed,
            output: None,
            error: Some("boom".to_string()),
            completed_at: Utc::now(),
            escalation_id: None,
        };
        run.record_step_result(result.clone());
        run.record_step_result(StepResult {
            status: StepStatus::Completed,
            error: None,
            ..result
        });

        assert_eq!(run.step_results.len(), 1);
        assert_eq!(run.step_results[0].status, StepStatus::Completed);
    }

    #[test]
    fn load_active_runs_recovers_only_non_terminal() {
        let (manager, dir) = unique_manager("recover");
        manager.create_run(mk_run("run-1", "shop")).expect("create");
        manager.create_run(mk_run("run-2", "blog")).expect("create");
        manager
            .update(&RunId::new("run-2"), |run| {
                run.status = RunStatus::Failed;
            })
            .expect("fail run");

        // Fresh manager over the same directory simulates a restart.
        let restarted = RunStateManager::new(dir.join("runs"), dir.join("project-runs"));
        let recovered = restarted.load_active_runs().expect("recover");
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].run_id, RunId::new("run-1"));
        assert_eq!(restarted.active_runs().len(), 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn update_of_unknown_run_is_not_found() {
        let (manager, dir) = unique_manager("missing");
        let err = manager
            .update(&RunId::new("ghost"), |_| {})
            .expect_err("missing run");
        assert!(matches!(err, RunStateError::NotFound { .. }));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn run_ids_are_time_ordered() {
        let earlier = next_run_id(Utc::now());
        let later = next_run_id(Utc::now() + chrono::Duration::seconds(2));
        assert!(later.0 > earlier.0);
    }
}

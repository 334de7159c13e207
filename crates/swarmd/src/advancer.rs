//! Project lifecycle state and the phase-advancement predicates the
//! watcher evaluates every tick.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use swarm_core::progress::{annotated_task_count, parse_progress};
use swarm_core::state::ProjectPhase;
use swarm_store::{read_json, write_json_atomic, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AdvanceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Idle,
    Running,
    Error,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseChange {
    pub at: DateTime<Utc>,
    pub from: ProjectPhase,
    pub to: ProjectPhase,
}

/// Contents of `<project>/state.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectState {
    pub phase: ProjectPhase,
    pub status: ProjectStatus,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub history: Vec<PhaseChange>,
}

impl Default for ProjectState {
    fn default() -> Self {
        Self {
            phase: ProjectPhase::Interview,
            status: ProjectStatus::Idle,
            iteration: 0,
            history: Vec::new(),
        }
    }
}

pub fn state_path(project_dir: &Path) -> PathBuf {
    project_dir.join("state.json")
}

pub fn load_project_state(project_dir: &Path) -> Result<Option<ProjectState>, AdvanceError> {
    Ok(read_json(&state_path(project_dir))?)
}

pub fn save_project_state(
    project_dir: &Path,
    state: &ProjectState,
) -> Result<(), AdvanceError> {
    write_json_atomic(&state_path(project_dir), state)?;
    Ok(())
}

/// Move the project to `to`, recording the transition. Idempotent: moving
/// to the current phase is a no-op.
pub fn advance_project(
    project_dir: &Path,
    to: ProjectPhase,
    now: DateTime<Utc>,
) -> Result<ProjectState, AdvanceError> {
    let mut state = load_project_state(project_dir)?.unwrap_or_default();
    if state.phase == to {
        return Ok(state);
    }
    state.history.push(PhaseChange {
        at: now,
        from: state.phase,
        to,
    });
    state.phase = to;
    state.iteration += 1;
    if to == ProjectPhase::Complete {
        state.status = ProjectStatus::Complete;
    }
    save_project_state(project_dir, &state)?;
    Ok(state)
}

/// Everything the advancement predicates need, read once per tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSnapshot {
    pub phase: ProjectPhase,
    pub interview_complete: bool,
    pub has_implementation_plan: bool,
    pub annotated_tasks: usize,
    pub has_tasks: bool,
    pub all_tasks_done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct InterviewFile {
    #[serde(default)]
    complete: bool,
}

/// Read the project files backing the snapshot. Absent files read as
/// their vacuous values; a parse failure of progress.md reads as "no
/// tasks" rather than wedging the watcher.
pub fn load_snapshot(project_dir: &Path) -> Result<ProjectSnapshot, AdvanceError> {
    let state = load_project_state(project_dir)?.unwrap_or_default();

    let interview_complete = read_json::<InterviewFile>(&project_dir.join("interview.json"))?
        .map(|file| file.complete)
        .unwrap_or(false);
    let has_implementation_plan = project_dir
        .join("specs")
        .join("IMPLEMENTATION_PLAN.md")
        .exists();

    let progress_path = project_dir.join("progress.md");
    let (annotated_tasks, has_tasks, all_tasks_done) = match std::fs::read_to_string(&progress_path)
    {
        Ok(text) => {
            let annotated = annotated_task_count(&text);
            match parse_progress(&text) {
                Ok(doc) => (annotated, !doc.tasks.is_empty(), doc.all_done()),
                Err(err) => {
                    eprintln!(
                        "[swarmd] progress document at {} does not parse: {err}",
                        progress_path.display()
                    );
                    (annotated, false, false)
                }
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => (0, false, false),
        Err(source) => {
            return Err(AdvanceError::Read {
                path: progress_path,
                source,
            })
        }
    };

    Ok(ProjectSnapshot {
        phase: state.phase,
        interview_complete,
        has_implementation_plan,
        annotated_tasks,
        has_tasks,
        all_tasks_done,
    })
}

/// The phase-specific completion predicates. Returns the phase to advance
/// to, or `None` when the project stays put.
pub fn decide_advance(snapshot: &ProjectSnapshot) -> Option<ProjectPhase> {
    match snapshot.phase {
        ProjectPhase::Interview if snapshot.interview_complete => Some(ProjectPhase::Spec),
        ProjectPhase::Spec
            if snapshot.has_implementation_plan && snapshot.annotated_tasks >= 1 =>
        {
            Some(ProjectPhase::Build)
        }
        ProjectPhase::Build if snapshot.has_tasks && snapshot.all_tasks_done => {
            Some(ProjectPhase::Review)
        }
        ProjectPhase::Review if snapshot.has_tasks && snapshot.all_tasks_done => {
            Some(ProjectPhase::Complete)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_project(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("swarmops-project-{prefix}-{now}"));
        fs::create_dir_all(&dir).expect("create project dir");
        dir
    }

    fn snapshot(phase: ProjectPhase) -> ProjectSnapshot {
        ProjectSnapshot {
            phase,
            ..ProjectSnapshot::default()
        }
    }

    #[test]
    fn interview_advances_only_when_complete() {
        let mut snap = snapshot(ProjectPhase::Interview);
        assert_eq!(decide_advance(&snap), None);
        snap.interview_complete = true;
        assert_eq!(decide_advance(&snap), Some(ProjectPhase::Spec));
    }

    #[test]
    fn spec_needs_plan_and_annotated_tasks() {
        let mut snap = snapshot(ProjectPhase::Spec);
        snap.has_implementation_plan = true;
        assert_eq!(decide_advance(&snap), None);
        snap.annotated_tasks = 2;
        assert_eq!(decide_advance(&snap), Some(ProjectPhase::Build));
    }

    #[test]
    fn build_and_review_need_all_tasks_done() {
        let mut snap = snapshot(ProjectPhase::Build);
        snap.has_tasks = true;
        assert_eq!(decide_advance(&snap), None);
        snap.all_tasks_done = true;
        assert_eq!(decide_advance(&snap), Some(ProjectPhase::Review));

        snap.phase = ProjectPhase::Review;
        assert_eq!(decide_advance(&snap), Some(ProjectPhase::Complete));
    }

    #[test]
    fn empty_task_set_never_advances_build() {
        let mut snap = snapshot(ProjectPhase::Build);
        snap.all_tasks_done = true;
        snap.has_tasks = false;
        assert_eq!(decide_advance(&snap), None);
    }

    #[test]
    fn complete_is_a_fixed_point() {
        let mut snap = snapshot(ProjectPhase::Complete);
        snap.has_tasks = true;
        snap.all_tasks_done = true;
        assert_eq!(decide_advance(&snap), None);
    }

    #[test]
    fn advance_project_records_history_and_is_idempotent() {
        let dir = unique_project("advance");
        let state = advance_project(&dir, ProjectPhase::Spec, Utc::now()).expect("advance");
        assert_eq!(state.phase, ProjectPhase::Spec);
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.iteration, 1);

        let again = advance_project(&dir, ProjectPhase::Spec, Utc::now()).expect("re-advance");
        assert_eq!(again.history.len(), 1, "no duplicate history entry");

        let done = advance_project(&dir, ProjectPhase::Complete, Utc::now()).expect("complete");
        assert_eq!(done.status, ProjectStatus::Complete);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_snapshot_reads_the_project_files() {
        let dir = unique_project("snapshot");
        save_project_state(
            &dir,
            &ProjectState {
                phase: ProjectPhase::Spec,
                status: ProjectStatus::Running,
                iteration: 1,
                history: Vec::new(),
            },
        )
        .expect("save state");
        fs::write(&dir.join("interview.json"), r#"{"complete":true}"#).expect("write interview");
        fs::create_dir_all(dir.join("specs")).expect("specs dir");
        fs::write(dir.join("specs/IMPLEMENTATION_PLAN.md"), "# plan\n").expect("write plan");
        fs::write(
            dir.join("progress.md"),
            "- [x] A @id(a)\n- [ ] B @id(b) @depends(a)\n",
        )
        .expect("write progress");

        let snap = load_snapshot(&dir).expect("snapshot");
        assert_eq!(snap.phase, ProjectPhase::Spec);
        assert!(snap.interview_complete);
        assert!(snap.has_implementation_plan);
        assert_eq!(snap.annotated_tasks, 2);
        assert!(snap.has_tasks);
        assert!(!snap.all_tasks_done);
        assert_eq!(decide_advance(&snap), Some(ProjectPhase::Build));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unparsable_progress_reads_as_no_tasks() {
        let dir = unique_project("broken");
        fs::write(
            dir.join("progress.md"),
            "- [ ] A @id(a) @depends(ghost)\n",
        )
        .expect("write progress");

        let snap = load_snapshot(&dir).expect("snapshot");
        assert!(!snap.has_tasks);
        assert!(!snap.all_tasks_done);
        assert_eq!(snap.annotated_tasks, 1, "annotation count is syntactic");
        let _ = fs::remove_dir_all(dir);
    }
}

//! Progress-document parser: the markdown task list that drives dispatch.
//!
//! Tasks are checkbox lines carrying `@id(…)`, `@depends(…)` and `@role(…)`
//! annotations; `## Phase N:` headers group them into phases. Parsing never
//! mutates the document — marking a task done is a separate atomic rewrite
//! owned by the webhook path.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::types::{RoleId, TaskId};

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("duplicate task id: {task_id}")]
    DuplicateId { task_id: String },
    #[error("task {task_id} depends on unknown task {missing}")]
    UnknownDependency { task_id: String, missing: String },
    #[error("dependency cycle involving tasks: {involved:?}")]
    Cycle { involved: Vec<String> },
}

/// One parsed checkbox task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTask {
    pub id: TaskId,
    pub title: String,
    pub done: bool,
    pub role: Option<RoleId>,
    pub depends_on: Vec<TaskId>,
    pub phase_number: u32,
    /// Zero-based line index in the source document.
    pub line: usize,
}

/// One phase grouping derived from `Phase N:` headers (or the whole
/// document as phase 1 when no headers exist).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub number: u32,
    pub name: String,
    pub task_ids: Vec<TaskId>,
}

/// Derived phase state; only the earliest incomplete phase can be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedPhaseState {
    Completed,
    Running,
    Blocked,
}

/// Parsed view of a progress document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressDoc {
    pub tasks: Vec<ParsedTask>,
    pub phases: Vec<PhaseSpec>,
}

impl ProgressDoc {
    pub fn task(&self, id: &TaskId) -> Option<&ParsedTask> {
        self.tasks.iter().find(|task| &task.id == id)
    }

    /// A task is ready iff it is open and every dependency is done.
    pub fn is_ready(&self, id: &TaskId) -> bool {
        let Some(task) = self.task(id) else {
            return false;
        };
        !task.done
            && task
                .depends_on
                .iter()
                .all(|dep| self.task(dep).map(|t| t.done).unwrap_or(false))
    }

    /// All ready tasks, in document order.
    pub fn ready_tasks(&self) -> Vec<&ParsedTask> {
        self.tasks
            .iter()
            .filter(|task| self.is_ready(&task.id))
            .collect()
    }

    /// Ready tasks restricted to one phase, in document order.
    pub fn ready_tasks_in_phase(&self, phase_number: u32) -> Vec<&ParsedTask> {
        self.ready_tasks()
            .into_iter()
            .filter(|task| task.phase_number == phase_number)
            .collect()
    }

    pub fn all_done(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|task| task.done)
    }

    pub fn phase_state(&self, phase_number: u32) -> DerivedPhaseState {
        let Some(phase) = self.phases.iter().find(|p| p.number == phase_number) else {
            return DerivedPhaseState::Blocked;
        };
        let done = phase
            .task_ids
            .iter()
            .all(|id| self.task(id).map(|t| t.done).unwrap_or(true));
        if done {
            return DerivedPhaseState::Completed;
        }

        let earliest_incomplete = self.phases.iter().find(|p| {
            !p.task_ids
                .iter()
                .all(|id| self.task(id).map(|t| t.done).unwrap_or(true))
        });
        match earliest_incomplete {
            Some(earliest) if earliest.number == phase_number => {
                let any_ready = phase.task_ids.iter().any(|id| self.is_ready(id));
                if any_ready {
                    DerivedPhaseState::Running
                } else {
                    DerivedPhaseState::Blocked
                }
            }
            _ => DerivedPhaseState::Blocked,
        }
    }

    /// Earliest phase with open tasks, if any.
    pub fn current_phase(&self) -> Option<&PhaseSpec> {
        self.phases.iter().find(|phase| {
            phase
                .task_ids
                .iter()
                .any(|id| self.task(id).map(|t| !t.done).unwrap_or(false))
        })
    }
}

/// Parse a progress document into a task DAG plus ordered phases.
pub fn parse_progress(text: &str) -> Result<ProgressDoc, ProgressError> {
    let mut tasks: Vec<ParsedTask> = Vec::new();
    let mut phases: Vec<PhaseSpec> = Vec::new();
    let mut current_phase: Option<u32> = None;

    for (line_idx, line) in text.lines().enumerate() {
        if let Some((number, name)) = parse_phase_header(line) {
            if !phases.iter().any(|p| p.number == number) {
                phases.push(PhaseSpec {
                    number,
                    name,
                    task_ids: Vec::new(),
                });
            }
            current_phase = Some(number);
            continue;
        }

        let Some((done, rest)) = parse_checkbox(line) else {
            continue;
        };
        // Lines without a stable id are narrative, not dispatchable tasks.
        let Some(id) = annotation(rest, "id") else {
            continue;
        };

        if tasks.iter().any(|task| task.id.0 == id) {
            return Err(ProgressError::DuplicateId {
                task_id: id.to_string(),
            });
        }

        let depends_on = annotation(rest, "depends")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(TaskId::new)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let role = annotation(rest, "role").map(RoleId::new);

        // Tasks before the first header land in the first declared phase;
        // with no headers at all the whole list is phase 1.
        let phase_number = current_phase.unwrap_or(0);

        tasks.push(ParsedTask {
            id: TaskId::new(id),
            title: strip_annotations(rest),
            done,
            role,
            depends_on,
            phase_number,
            line: line_idx,
        });
    }

    if phases.is_empty() {
        phases.push(PhaseSpec {
            number: 1,
            name: String::new(),
            task_ids: Vec::new(),
        });
        for task in &mut tasks {
            task.phase_number = 1;
        }
    } else {
        let first = phases[0].number;
        for task in &mut tasks {
            if task.phase_number == 0 {
                task.phase_number = first;
            }
        }
    }
    phases.sort_by_key(|phase| phase.number);
    for task in &tasks {
        if let Some(phase) = phases.iter_mut().find(|p| p.number == task.phase_number) {
            phase.task_ids.push(task.id.clone());
        }
    }

    let known: HashSet<&str> = tasks.iter().map(|task| task.id.0.as_str()).collect();
    for task in &tasks {
        for dep in &task.depends_on {
            if !known.contains(dep.0.as_str()) {
                return Err(ProgressError::UnknownDependency {
                    task_id: task.id.0.clone(),
                    missing: dep.0.clone(),
                });
            }
        }
    }

    check_acyclic(&tasks)?;

    Ok(ProgressDoc { tasks, phases })
}

/// Rewrite the document with one task flipped to done. Returns `None` when
/// the task is absent or already done, so replayed webhooks are no-ops.
/// Every other byte of the document is preserved.
pub fn mark_task_done(text: &str, id: &TaskId) -> Option<String> {
    let needle = format!("@id({})", id.0);
    let mut changed = false;
    let mut out = String::with_capacity(text.len());

    for line in text.split_inclusive('\n') {
        let is_target = line.contains(&needle) && parse_checkbox(line).is_some();
        if is_target && !changed {
            if let Some((false, _)) = parse_checkbox(line) {
                let rewritten = line.replacen("- [ ]", "- [x]", 1);
                out.push_str(&rewritten);
                changed = true;
                continue;
            }
        }
        out.push_str(line);
    }

    if changed {
        Some(out)
    } else {
        None
    }
}

/// Count `@id(` annotations without a full parse; used by the watcher's
/// spec-phase predicate.
pub fn annotated_task_count(text: &str) -> usize {
    text.lines()
        .filter(|line| parse_checkbox(line).is_some() && line.contains("@id("))
        .count()
}

fn parse_phase_header(line: &str) -> Option<(u32, String)> {
    let trimmed = line.trim_start();
    let rest = trimmed
        .strip_prefix("### ")
        .or_else(|| trimmed.strip_prefix("## "))?;
    let rest = rest.trim_start().strip_prefix("Phase ")?;

    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let number: u32 = digits.parse().ok()?;
    let tail = rest[digits.len()..].trim_start();
    let name = tail.strip_prefix(':').map(str::trim).unwrap_or("").to_string();
    Some((number, name))
}

fn parse_checkbox(line: &str) -> Option<(bool, &str)> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("- [ ]") {
        return Some((false, rest));
    }
    if let Some(rest) = trimmed
        .strip_prefix("- [x]")
        .or_else(|| trimmed.strip_prefix("- [X]"))
    {
        return Some((true, rest));
    }
    None
}

fn annotation<'a>(rest: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("@{name}(");
    let start = rest.find(&marker)? + marker.len();
    let end = rest[start..].find(')')? + start;
    let value = rest[start..end].trim();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn strip_annotations(rest: &str) -> String {
    let mut out = String::with_capacity(rest.len());
    let mut remaining = rest;
    while let Some(at) = remaining.find('@') {
        out.push_str(&remaining[..at]);
        match remaining[at..].find(')') {
            Some(close) => remaining = &remaining[at + close + 1..],
            None => {
                // Unterminated annotation: keep the raw text.
                out.push_str(&remaining[at..]);
                remaining = "";
                break;
            }
        }
    }
    out.push_str(remaining);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Kahn's algorithm over the dependency edges; leftover nodes are the cycle.
fn check_acyclic(tasks: &[ParsedTask]) -> Result<(), ProgressError> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();

    for task in tasks {
        indegree.entry(task.id.0.as_str()).or_insert(0);
        for dep in &task.depends_on {
            *indegree.entry(task.id.0.as_str()).or_insert(0) += 1;
            children
                .entry(dep.0.as_str())
                .or_default()
                .push(task.id.0.as_str());
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;

    while let Some(node) = queue.pop_front() {
        visited += 1;
        for child in children.get(node).into_iter().flatten() {
            let degree = indegree.get_mut(child).expect("child was registered");
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(child);
            }
        }
    }

    if visited == tasks.len() {
        Ok(())
    } else {
        let mut involved: Vec<String> = indegree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        involved.sort();
        Err(ProgressError::Cycle { involved })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "\
# Project

## Phase 1: Foundation
- [ ] Write parser @id(p) @role(builder)
- [ ] Write tests @id(t) @depends(p) @role(builder)

## Phase 2: Polish
- [ ] Review everything @id(r) @depends(t) @role(reviewer)
- Some narrative line, not a task
";

    #[test]
    fn parses_tasks_phases_and_annotations() {
        let doc = parse_progress(DOC).expect("parse");

        assert_eq!(doc.tasks.len(), 3);
        assert_eq!(doc.phases.len(), 2);
        assert_eq!(doc.phases[0].task_ids.len(), 2);
        assert_eq!(doc.phases[1].task_ids, vec![TaskId::new("r")]);

        let tests = doc.task(&TaskId::new("t")).expect("task t");
        assert_eq!(tests.title, "Write tests");
        assert_eq!(tests.depends_on, vec![TaskId::new("p")]);
        assert_eq!(tests.role, Some(RoleId::new("builder")));
        assert!(!tests.done);
        assert_eq!(tests.phase_number, 1);
    }

    #[test]
    fn document_without_headers_is_a_single_phase() {
        let doc = parse_progress("- [ ] Only task @id(a)\n").expect("parse");
        assert_eq!(doc.phases.len(), 1);
        assert_eq!(doc.phases[0].number, 1);
        assert_eq!(doc.tasks[0].phase_number, 1);
    }

    #[test]
    fn tasks_before_first_header_join_the_first_phase() {
        let text = "\
- [ ] Early task @id(early)

## Phase 1: Main
- [ ] Later task @id(late)
";
        let doc = parse_progress(text).expect("parse");
        assert_eq!(doc.phases.len(), 1);
        assert_eq!(
            doc.phases[0].task_ids,
            vec![TaskId::new("early"), TaskId::new("late")]
        );
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let text = "- [ ] One @id(a)\n- [ ] Two @id(a)\n";
        let err = parse_progress(text).expect_err("duplicate");
        assert!(matches!(err, ProgressError::DuplicateId { task_id } if task_id == "a"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let text = "- [ ] One @id(a) @depends(ghost)\n";
        let err = parse_progress(text).expect_err("unknown dep");
        assert!(matches!(
            err,
            ProgressError::UnknownDependency { task_id, missing }
                if task_id == "a" && missing == "ghost"
        ));
    }

    #[test]
    fn cycle_is_rejected_and_names_participants() {
        let text = "\
- [ ] A @id(a) @depends(b)
- [ ] B @id(b) @depends(a)
- [ ] C @id(c)
";
        let err = parse_progress(text).expect_err("cycle");
        match err {
            ProgressError::Cycle { involved } => {
                assert_eq!(involved, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn readiness_requires_all_dependencies_done() {
        let text = "\
- [x] A @id(a)
- [ ] B @id(b) @depends(a)
- [ ] C @id(c) @depends(b)
";
        let doc = parse_progress(text).expect("parse");
        assert!(!doc.is_ready(&TaskId::new("a")), "done task is not ready");
        assert!(doc.is_ready(&TaskId::new("b")));
        assert!(!doc.is_ready(&TaskId::new("c")));

        let ready: Vec<_> = doc.ready_tasks().iter().map(|t| t.id.0.clone()).collect();
        assert_eq!(ready, vec!["b".to_string()]);
    }

    #[test]
    fn phase_state_derivation() {
        let text = "\
## Phase 1
- [x] A @id(a)
## Phase 2
- [ ] B @id(b) @depends(a)
## Phase 3
- [ ] C @id(c) @depends(b)
";
        let doc = parse_progress(text).expect("parse");
        assert_eq!(doc.phase_state(1), DerivedPhaseState::Completed);
        assert_eq!(doc.phase_state(2), DerivedPhaseState::Running);
        assert_eq!(doc.phase_state(3), DerivedPhaseState::Blocked);
        assert_eq!(doc.current_phase().map(|p| p.number), Some(2));
    }

    #[test]
    fn mark_task_done_rewrites_exactly_one_checkbox() {
        let updated = mark_task_done(DOC, &TaskId::new("p")).expect("rewrite");
        assert!(updated.contains("- [x] Write parser @id(p)"));
        assert!(updated.contains("- [ ] Write tests @id(t)"));
        // Everything else is untouched.
        assert_eq!(updated.lines().count(), DOC.lines().count());
    }

    #[test]
    fn mark_task_done_is_idempotent() {
        let once = mark_task_done(DOC, &TaskId::new("p")).expect("first rewrite");
        assert!(mark_task_done(&once, &TaskId::new("p")).is_none());
        assert!(mark_task_done(DOC, &TaskId::new("missing")).is_none());
    }

    #[test]
    fn all_done_requires_nonempty_task_set() {
        let empty = parse_progress("# nothing here\n").expect("parse");
        assert!(!empty.all_done());

        let done = parse_progress("- [x] A @id(a)\n").expect("parse");
        assert!(done.all_done());
    }

    #[test]
    fn annotated_task_count_counts_checkbox_ids_only() {
        assert_eq!(annotated_task_count(DOC), 3);
        assert_eq!(annotated_task_count("no tasks, just @id(text)\n"), 0);
    }

    #[test]
    fn strip_annotations_collapses_whitespace() {
        let doc = parse_progress("- [ ]   Fix   the   thing   @id(x)  @role(builder)\n")
            .expect("parse");
        assert_eq!(doc.tasks[0].title, "Fix the thing");
    }
}

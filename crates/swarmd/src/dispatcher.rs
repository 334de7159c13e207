//! Dispatch planning: which ready tasks actually spawn, in what order,
//! with what stagger. Pure data in, plan out — the orchestrator executes
//! the plan against worktrees, the registry and the gateway.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use swarm_core::progress::ParsedTask;
use swarm_core::types::{retry_timer_key, step_order, RunId, TaskId};

/// Why a ready task was not spawned this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The task registry already holds a live or completed entry.
    Registry { reason: String },
    /// Retry budget exhausted; a human has to act.
    RetryExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSpawn {
    pub task: ParsedTask,
    pub step_order: u64,
    /// Stagger offset from the start of the dispatch round.
    pub delay_offset_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPlan {
    pub spawns: Vec<PlannedSpawn>,
    pub skipped: Vec<(TaskId, SkipReason)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchInput {
    pub phase_number: u32,
    pub candidates: Vec<ParsedTask>,
    /// Tasks the registry refused, with its reason.
    pub registry_skipped: Vec<(TaskId, String)>,
    /// Tasks whose retry state is exhausted.
    pub exhausted: Vec<TaskId>,
    pub stagger_ms: u64,
}

/// Order the spawnable tasks, drop the skipped ones, and assign staggered
/// offsets so the gateway never sees a burst.
pub fn plan_dispatch(input: DispatchInput) -> DispatchPlan {
    let mut skipped: Vec<(TaskId, SkipReason)> = input
        .registry_skipped
        .into_iter()
        .map(|(task_id, reason)| (task_id, SkipReason::Registry { reason }))
        .collect();

    let mut spawns = Vec::new();
    let mut offset: u64 = 0;
    for task in input.candidates {
        if skipped.iter().any(|(id, _)| id == &task.id) {
            continue;
        }
        if input.exhausted.contains(&task.id) {
            skipped.push((task.id.clone(), SkipReason::RetryExhausted));
            continue;
        }
        let order = step_order(input.phase_number, &task.id);
        spawns.push(PlannedSpawn {
            task,
            step_order: order,
            delay_offset_ms: offset,
        });
        offset += input.stagger_ms;
    }

    DispatchPlan { spawns, skipped }
}

/// A scheduled re-dispatch after a failed spawn attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTimer {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub phase_number: u32,
    pub due_at: DateTime<Utc>,
}

/// Process-level table of pending retry timers. At most one per
/// (run, task): scheduling again replaces (and thereby cancels) the
/// previous timer. Fired by the watcher tick, not a timer wheel.
#[derive(Debug, Default)]
pub struct RetryTimers {
    timers: Mutex<HashMap<String, RetryTimer>>,
}

impl RetryTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, timer: RetryTimer) {
        let key = retry_timer_key(&timer.run_id, &timer.task_id);
        self.lock().insert(key, timer);
    }

    pub fn cancel(&self, run_id: &RunId, task_id: &TaskId) -> bool {
        self.lock()
            .remove(&retry_timer_key(run_id, task_id))
            .is_some()
    }

    /// Drop every timer belonging to a run (used on cancellation).
    pub fn cancel_run(&self, run_id: &RunId) -> usize {
        let prefix = format!("{}:", run_id.0);
        let mut table = self.lock();
        let before = table.len();
        table.retain(|key, _| !key.starts_with(&prefix));
        before - table.len()
    }

    /// Remove and return the timers that are due, oldest first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<RetryTimer> {
        let mut table = self.lock();
        let due_keys: Vec<String> = table
            .iter()
            .filter(|(_, timer)| timer.due_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut due: Vec<RetryTimer> = due_keys
            .into_iter()
            .filter_map(|key| table.remove(&key))
            .collect();
        due.sort_by(|a, b| a.due_at.cmp(&b.due_at));
        due
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RetryTimer>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_core::progress::parse_progress;

    fn tasks(text: &str) -> Vec<ParsedTask> {
        parse_progress(text)
            .expect("parse")
            .ready_tasks()
            .into_iter()
            .cloned()
            .collect()
    }

    #[test]
    fn plan_staggers_spawns_by_fixed_delay() {
        let candidates = tasks("- [ ] A @id(a)\n- [ ] B @id(b)\n- [ ] C @id(c)\n");
        let plan = plan_dispatch(DispatchInput {
            phase_number: 1,
            candidates,
            registry_skipped: Vec::new(),
            exhausted: Vec::new(),
            stagger_ms: 3_000,
        });

        assert_eq!(plan.spawns.len(), 3);
        let offsets: Vec<u64> = plan.spawns.iter().map(|s| s.delay_offset_ms).collect();
        assert_eq!(offsets, vec![0, 3_000, 6_000]);
        assert!(plan.spawns.iter().all(|s| s.step_order >= 100_000));
    }

    #[test]
    fn plan_drops_registry_skipped_and_exhausted_tasks() {
        let candidates = tasks("- [ ] A @id(a)\n- [ ] B @id(b)\n- [ ] C @id(c)\n");
        let plan = plan_dispatch(DispatchInput {
            phase_number: 1,
            candidates,
            registry_skipped: vec![(TaskId::new("a"), "already running".to_string())],
            exhausted: vec![TaskId::new("c")],
            stagger_ms: 1_000,
        });

        assert_eq!(plan.spawns.len(), 1);
        assert_eq!(plan.spawns[0].task.id, TaskId::new("b"));
        assert_eq!(plan.spawns[0].delay_offset_ms, 0);
        assert_eq!(plan.skipped.len(), 2);
        assert!(plan
            .skipped
            .iter()
            .any(|(id, reason)| id == &TaskId::new("c") && *reason == SkipReason::RetryExhausted));
    }

    #[test]
    fn timers_replace_per_run_task_key() {
        let timers = RetryTimers::new();
        let now = Utc::now();
        timers.schedule(RetryTimer {
            run_id: RunId::new("run-1"),
            task_id: TaskId::new("a"),
            phase_number: 1,
            due_at: now + chrono::Duration::seconds(10),
        });
        timers.schedule(RetryTimer {
            run_id: RunId::new("run-1"),
            task_id: TaskId::new("a"),
            phase_number: 1,
            due_at: now + chrono::Duration::seconds(99),
        });

        assert_eq!(timers.pending_count(), 1, "second schedule replaced first");
        assert!(timers.take_due(now + chrono::Duration::seconds(11)).is_empty());
        let due = timers.take_due(now + chrono::Duration::seconds(100));
        assert_eq!(due.len(), 1);
        assert_eq!(timers.pending_count(), 0);
    }

    #[test]
    fn take_due_returns_oldest_first_and_leaves_future_timers() {
        let timers = RetryTimers::new();
        let now = Utc::now();
        for (task, secs) in [("a", 5), ("b", 1), ("c", 500)] {
            timers.schedule(RetryTimer {
                run_id: RunId::new("run-1"),
                task_id: TaskId::new(task),
                phase_number: 1,
                due_at: now + chrono::Duration::seconds(secs),
            });
        }

        let due = timers.take_due(now + chrono::Duration::seconds(10));
        let ids: Vec<&str> = due.iter().map(|t| t.task_id.0.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(timers.pending_count(), 1);
    }

    #[test]
    fn cancel_and_cancel_run_remove_timers() {
        let timers = RetryTimers::new();
        let now = Utc::now();
        for task in ["a", "b"] {
            timers.schedule(RetryTimer {
                run_id: RunId::new("run-1"),
                task_id: TaskId::new(task),
                phase_number: 1,
                due_at: now,
            });
        }
        timers.schedule(RetryTimer {
            run_id: RunId::new("run-2"),
            task_id: TaskId::new("z"),
            phase_number: 1,
            due_at: now,
        });

        assert!(timers.cancel(&RunId::new("run-1"), &TaskId::new("a")));
        assert!(!timers.cancel(&RunId::new("run-1"), &TaskId::new("a")));
        assert_eq!(timers.cancel_run(&RunId::new("run-1")), 1);
        assert_eq!(timers.pending_count(), 1, "other runs keep their timers");
    }
}

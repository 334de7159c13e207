//! Watcher-side bookkeeping: trigger cooldowns, the progress watchdog,
//! and project idle detection. The orchestrator's `tick` drives these.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};

use swarm_core::config::WatcherConfig;
use swarm_core::state::ProjectPhase;
use swarm_core::types::TaskId;

/// Per-(project, phase) last-triggered-at table. Keeps the watcher from
/// re-spawning a long-running agent that is still producing output.
#[derive(Debug, Default)]
pub struct CooldownTable {
    last: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl CooldownTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(project: &str, phase: ProjectPhase) -> String {
        format!("{project}:{}", phase.as_str())
    }

    pub fn cooldown_for(config: &WatcherConfig, phase: ProjectPhase) -> Duration {
        match phase {
            ProjectPhase::Spec => Duration::seconds(config.spec_cooldown_secs),
            _ => Duration::seconds(config.build_cooldown_secs),
        }
    }

    pub fn may_trigger(
        &self,
        config: &WatcherConfig,
        project: &str,
        phase: ProjectPhase,
        now: DateTime<Utc>,
    ) -> bool {
        let table = self.lock();
        match table.get(&Self::key(project, phase)) {
            Some(last) => now - *last >= Self::cooldown_for(config, phase),
            None => true,
        }
    }

    pub fn mark_triggered(&self, project: &str, phase: ProjectPhase, now: DateTime<Utc>) {
        self.lock().insert(Self::key(project, phase), now);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-(project, task) watchdog retry counts, capped before escalation.
#[derive(Debug, Default)]
pub struct WatchdogState {
    counts: Mutex<HashMap<String, u32>>,
    last_sweep: Mutex<Option<DateTime<Utc>>>,
}

impl WatchdogState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the slower watchdog sweep is due this tick.
    pub fn sweep_due(&self, interval_secs: u64, now: DateTime<Utc>) -> bool {
        let mut last = self.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
        let due = match *last {
            Some(at) => now - at >= Duration::seconds(interval_secs as i64),
            None => true,
        };
        if due {
            *last = Some(now);
        }
        due
    }

    /// Count one watchdog retry for each stalled task; returns the tasks
    /// that just exceeded the cap and need an escalation instead.
    pub fn record_retry(
        &self,
        project: &str,
        tasks: &[TaskId],
        max_retries: u32,
    ) -> Vec<TaskId> {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let mut over_cap = Vec::new();
        for task in tasks {
            let entry = counts.entry(format!("{project}:{}", task.0)).or_insert(0);
            *entry += 1;
            if *entry > max_retries {
                over_cap.push(task.clone());
            }
        }
        over_cap
    }

    pub fn reset_task(&self, project: &str, task: &TaskId) {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&format!("{project}:{}", task.0));
    }
}

/// Seconds since the newest touch of the files that move while a project
/// makes progress. `None` when none of the files exist yet.
pub fn project_idle_secs(project_dir: &Path, now: SystemTime) -> Option<i64> {
    let mut newest: Option<SystemTime> = None;
    for name in ["progress.md", "activity.jsonl", "state.json"] {
        if let Ok(meta) = std::fs::metadata(project_dir.join(name)) {
            if let Ok(mtime) = meta.modified() {
                newest = Some(match newest {
                    Some(current) if current >= mtime => current,
                    _ => mtime,
                });
            }
        }
    }
    let newest = newest?;
    now.duration_since(newest).ok().map(|d| d.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{Duration as StdDuration, UNIX_EPOCH};

    fn config() -> WatcherConfig {
        WatcherConfig::default()
    }

    #[test]
    fn cooldowns_differ_between_build_and_spec() {
        let cfg = config();
        assert_eq!(
            CooldownTable::cooldown_for(&cfg, ProjectPhase::Build),
            Duration::seconds(30)
        );
        assert_eq!(
            CooldownTable::cooldown_for(&cfg, ProjectPhase::Spec),
            Duration::seconds(300)
        );
    }

    #[test]
    fn first_trigger_is_always_allowed_then_cooldown_applies() {
        let cfg = config();
        let table = CooldownTable::new();
        let now = Utc::now();

        assert!(table.may_trigger(&cfg, "shop", ProjectPhase::Build, now));
        table.mark_triggered("shop", ProjectPhase::Build, now);
        assert!(!table.may_trigger(&cfg, "shop", ProjectPhase::Build, now + Duration::seconds(10)));
        assert!(table.may_trigger(&cfg, "shop", ProjectPhase::Build, now + Duration::seconds(31)));

        // Distinct phases and projects cool down independently.
        assert!(table.may_trigger(&cfg, "shop", ProjectPhase::Spec, now));
        assert!(table.may_trigger(&cfg, "blog", ProjectPhase::Build, now));
    }

    #[test]
    fn watchdog_escalates_past_the_cap() {
        let watchdog = WatchdogState::new();
        let task = TaskId::new("cart");

        for _ in 0..3 {
            let over = watchdog.record_retry("shop", &[task.clone()], 3);
            assert!(over.is_empty());
        }
        let over = watchdog.record_retry("shop", &[task.clone()], 3);
        assert_eq!(over, vec![task.clone()]);

        // A successful completion resets the count.
        watchdog.reset_task("shop", &task);
        assert!(watchdog.record_retry("shop", &[task], 3).is_empty());
    }

    #[test]
    fn sweep_due_rate_limits_itself() {
        let watchdog = WatchdogState::new();
        let now = Utc::now();
        assert!(watchdog.sweep_due(180, now));
        assert!(!watchdog.sweep_due(180, now + Duration::seconds(60)));
        assert!(watchdog.sweep_due(180, now + Duration::seconds(200)));
    }

    #[test]
    fn idle_secs_tracks_newest_project_file() {
        let stamp = std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir: PathBuf = std::env::temp_dir().join(format!("swarmops-idle-{stamp}"));
        fs::create_dir_all(&dir).expect("create dir");

        assert_eq!(project_idle_secs(&dir, std::time::SystemTime::now()), None);

        fs::write(dir.join("progress.md"), "- [ ] A @id(a)\n").expect("write");
        let later = std::time::SystemTime::now() + StdDuration::from_secs(700);
        let idle = project_idle_secs(&dir, later).expect("idle");
        assert!((699..=701).contains(&idle), "idle was {idle}");
        let _ = fs::remove_dir_all(dir);
    }
}

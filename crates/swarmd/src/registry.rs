//! Process-wide (project, task) index used only for spawn deduplication.
//!
//! One JSON file, one mutex. `can_spawn` + `register` run under the same
//! lock, so two racing spawn requests for one task serialize and the loser
//! observes `can_spawn = false`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use swarm_core::state::WorkerStatus;
use swarm_core::types::{registry_key, ProjectName, RunId, TaskId, WorkerId};
use swarm_store::{read_json, write_json_atomic, StoreError};

const CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub status: WorkerStatus,
    pub run_id: RunId,
    pub phase_number: u32,
    pub worker_id: WorkerId,
    #[serde(default)]
    pub branch: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanSpawn {
    pub can_spawn: bool,
    pub reason: String,
    pub existing: Option<RegistryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTask {
    pub task_id: TaskId,
    pub reason: String,
}

#[derive(Debug, Default)]
struct RegistryCache {
    entries: HashMap<String, RegistryEntry>,
    loaded_at: Option<Instant>,
}

#[derive(Debug)]
pub struct TaskRegistry {
    path: PathBuf,
    cache: Mutex<RegistryCache>,
}

impl TaskRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(RegistryCache::default()),
        }
    }

    pub fn can_spawn(
        &self,
        project: &ProjectName,
        task_id: &TaskId,
    ) -> Result<CanSpawn, RegistryError> {
        let mut cache = self.lock();
        self.refresh(&mut cache, false)?;
        Ok(decide_can_spawn(
            cache.entries.get(&registry_key(project, task_id)),
        ))
    }

    /// Record the task as running. Returns `can_spawn = false` without
    /// writing when a live entry already exists.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        project: &ProjectName,
        task_id: &TaskId,
        run_id: &RunId,
        phase_number: u32,
        worker_id: &WorkerId,
        branch: Option<String>,
    ) -> Result<CanSpawn, RegistryError> {
        let mut cache = self.lock();
        self.refresh(&mut cache, true)?;

        let key = registry_key(project, task_id);
        let decision = decide_can_spawn(cache.entries.get(&key));
        if !decision.can_spawn {
            return Ok(decision);
        }

        cache.entries.insert(
            key,
            RegistryEntry {
                status: WorkerStatus::Running,
                run_id: run_id.clone(),
                phase_number,
                worker_id: worker_id.clone(),
                branch,
                started_at: Utc::now(),
                completed_at: None,
                error: None,
            },
        );
        self.persist(&cache)?;
        Ok(decision)
    }

    pub fn update_status(
        &self,
        project: &ProjectName,
        task_id: &TaskId,
        status: WorkerStatus,
        error: Option<String>,
    ) -> Result<Option<RegistryEntry>, RegistryError> {
        let mut cache = self.lock();
        self.refresh(&mut cache, true)?;

        let key = registry_key(project, task_id);
        let Some(entry) = cache.entries.get_mut(&key) else {
            return Ok(None);
        };
        entry.status = status;
        entry.error = error;
        if status.is_terminal() && entry.completed_at.is_none() {
            entry.completed_at = Some(Utc::now());
        }
        let updated = entry.clone();
        self.persist(&cache)?;
        Ok(Some(updated))
    }

    pub fn get(
        &self,
        project: &ProjectName,
        task_id: &TaskId,
    ) -> Result<Option<RegistryEntry>, RegistryError> {
        let mut cache = self.lock();
        self.refresh(&mut cache, false)?;
        Ok(cache.entries.get(&registry_key(project, task_id)).cloned())
    }

    pub fn entries_for_run(&self, run_id: &RunId) -> Result<Vec<(String, RegistryEntry)>, RegistryError> {
        let mut cache = self.lock();
        self.refresh(&mut cache, false)?;
        Ok(cache
            .entries
            .iter()
            .filter(|(_, entry)| &entry.run_id == run_id)
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect())
    }

    /// Count of running entries registered for one project.
    pub fn running_count(&self, project: &ProjectName) -> Result<usize, RegistryError> {
        let prefix = format!("{}:", project.0);
        let mut cache = self.lock();
        self.refresh(&mut cache, false)?;
        Ok(cache
            .entries
            .iter()
            .filter(|(key, entry)| {
                key.starts_with(&prefix) && entry.status == WorkerStatus::Running
            })
            .count())
    }

    /// Sweep entries stuck in running past `max_age`, marking them failed so
    /// the next dispatch cycle can pick the tasks back up.
    pub fn clear_stale(&self, max_age: chrono::Duration) -> Result<Vec<String>, RegistryError> {
        self.clear_stale_at(max_age, Utc::now())
    }

    pub fn clear_stale_at(
        &self,
        max_age: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, RegistryError> {
        let mut cache = self.lock();
        self.refresh(&mut cache, true)?;

        let mut swept = Vec::new();
        for (key, entry) in cache.entries.iter_mut() {
            if entry.status == WorkerStatus::Running && now - entry.started_at > max_age {
                entry.status = WorkerStatus::Failed;
                entry.completed_at = Some(now);
                entry.error = Some("swept: no completion before stale deadline".to_string());
                swept.push(key.clone());
            }
        }
        if !swept.is_empty() {
            self.persist(&cache)?;
        }
        swept.sort();
        Ok(swept)
    }

    /// Split candidates into spawnable tasks and skipped (reason-tagged)
    /// ones, for batch dispatch.
    pub fn filter_spawnable(
        &self,
        project: &ProjectName,
        candidates: &[TaskId],
    ) -> Result<(Vec<TaskId>, Vec<SkippedTask>), RegistryError> {
        let mut cache = self.lock();
        self.refresh(&mut cache, false)?;

        let mut spawnable = Vec::new();
        let mut skipped = Vec::new();
        for task_id in candidates {
            let decision = decide_can_spawn(cache.entries.get(&registry_key(project, task_id)));
            if decision.can_spawn {
                spawnable.push(task_id.clone());
            } else {
                skipped.push(SkippedTask {
                    task_id: task_id.clone(),
                    reason: decision.reason,
                });
            }
        }
        Ok((spawnable, skipped))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reload from disk when the TTL expired (or always, before a write).
    fn refresh(&self, cache: &mut RegistryCache, force: bool) -> Result<(), RegistryError> {
        let fresh = cache
            .loaded_at
            .map(|at| at.elapsed() < CACHE_TTL)
            .unwrap_or(false);
        if fresh && !force {
            return Ok(());
        }
        cache.entries = read_json::<HashMap<String, RegistryEntry>>(&self.path)?
            .unwrap_or_default();
        cache.loaded_at = Some(Instant::now());
        Ok(())
    }

    fn persist(&self, cache: &RegistryCache) -> Result<(), RegistryError> {
        write_json_atomic(&self.path, &cache.entries)?;
        Ok(())
    }
}

fn decide_can_spawn(existing: Option<&RegistryEntry>) -> CanSpawn {
    match existing {
        None => CanSpawn {
            can_spawn: true,
            reason: "no prior entry".to_string(),
            existing: None,
        },
        Some(entry) => match entry.status {
            WorkerStatus::Running | WorkerStatus::Pending => CanSpawn {
                can_spawn: false,
                reason: "already running".to_string(),
                existing: Some(entry.clone()),
            },
            WorkerStatus::Completed => CanSpawn {
                can_spawn: false,
                reason: "already completed".to_string(),
                existing: Some(entry.clone()),
            },
            WorkerStatus::Failed | WorkerStatus::Cancelled => CanSpawn {
                can_spawn: true,
                reason: format!("prior attempt {:?} allows respawn", entry.status),
                existing: Some(entry.clone()),
            },
        },
    }
}

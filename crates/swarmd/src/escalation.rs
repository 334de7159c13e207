//! Human escalation queue: where exhausted retries and dead-ended review
//! cycles land. Entries only leave the queue by human action.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use swarm_core::state::{EscalationSeverity, EscalationStatus};
use swarm_core::types::{RoleId, RunId, TaskId};
use swarm_store::{read_json, write_json_atomic, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("escalation not found: {id}")]
    NotFound { id: String },
    #[error("escalation {id} is already {status:?}")]
    AlreadyClosed {
        id: String,
        status: EscalationStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationNote {
    pub at: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub phase_number: Option<u32>,
    #[serde(default)]
    pub step_order: Option<u64>,
    #[serde(default)]
    pub role: Option<RoleId>,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub message: String,
    pub attempt_count: u32,
    pub severity: EscalationSeverity,
    pub status: EscalationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub notes: Vec<EscalationNote>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateEscalation {
    pub run_id: Option<RunId>,
    pub pipeline: Option<String>,
    pub phase_number: Option<u32>,
    pub step_order: Option<u64>,
    pub role: Option<RoleId>,
    pub task_id: Option<TaskId>,
    pub message: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Explicit severity; auto-assigned from the attempt budget when absent.
    pub severity: Option<EscalationSeverity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscalationStats {
    pub open: usize,
    pub resolved: usize,
    pub dismissed: usize,
    pub by_severity: HashMap<EscalationSeverity, usize>,
}

/// Severity when the caller did not pick one: exhausting a real attempt
/// budget is high, a small budget is medium, anything earlier is low.
pub fn auto_severity(attempt_count: u32, max_attempts: u32) -> EscalationSeverity {
    if attempt_count >= max_attempts && max_attempts >= 3 {
        EscalationSeverity::High
    } else if attempt_count >= max_attempts {
        EscalationSeverity::Medium
    } else {
        EscalationSeverity::Low
    }
}

#[derive(Debug)]
pub struct EscalationStore {
    path: PathBuf,
    entries: Mutex<Option<Vec<Escalation>>>,
    counter: std::sync::atomic::AtomicU64,
}

impl EscalationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(None),
            counter: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn create(&self, params: CreateEscalation) -> Result<Escalation, EscalationError> {
        let now = Utc::now();
        let severity = params
            .severity
            .unwrap_or_else(|| auto_severity(params.attempt_count, params.max_attempts));
        let seq = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let id = format!(
            "esc-{}-{seq}",
            now.timestamp_nanos_opt().unwrap_or_default()
        );

        let escalation = Escalation {
            id,
            run_id: params.run_id,
            pipeline: params.pipeline,
            phase_number: params.phase_number,
            step_order: params.step_order,
            role: params.role,
            task_id: params.task_id,
            message: params.message,
            attempt_count: params.attempt_count,
            severity,
            status: EscalationStatus::Open,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            resolution: None,
            resolved_by: None,
            notes: Vec::new(),
        };

        let mut guard = self.lock();
        let entries = self.loaded(&mut guard)?;
        entries.push(escalation.clone());
        write_json_atomic(&self.path, entries)?;
        Ok(escalation)
    }

    pub fn get(&self, id: &str) -> Result<Option<Escalation>, EscalationError> {
        let mut guard = self.lock();
        let entries = self.loaded(&mut guard)?;
        Ok(entries.iter().find(|e| e.id == id).cloned())
    }

    pub fn list_open(&self) -> Result<Vec<Escalation>, EscalationError> {
        let mut guard = self.lock();
        let entries = self.loaded(&mut guard)?;
        Ok(entries
            .iter()
            .filter(|e| e.status.is_open())
            .cloned()
            .collect())
    }

    pub fn by_run(&self, run_id: &RunId) -> Result<Vec<Escalation>, EscalationError> {
        let mut guard = self.lock();
        let entries = self.loaded(&mut guard)?;
        Ok(entries
            .iter()
            .filter(|e| e.run_id.as_ref() == Some(run_id))
            .cloned()
            .collect())
    }

    pub fn by_pipeline(&self, pipeline: &str) -> Result<Vec<Escalation>, EscalationError> {
        let mut guard = self.lock();
        let entries = self.loaded(&mut guard)?;
        Ok(entries
            .iter()
            .filter(|e| e.pipeline.as_deref() == Some(pipeline))
            .cloned()
            .collect())
    }

    /// An open escalation already covering (run, task), if any; used by the
    /// dispatcher to avoid duplicate queue entries.
    pub fn open_for_task(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
    ) -> Result<Option<Escalation>, EscalationError> {
        let mut guard = self.lock();
        let entries = self.loaded(&mut guard)?;
        Ok(entries
            .iter()
            .find(|e| {
                e.status.is_open()
                    && e.run_id.as_ref() == Some(run_id)
                    && e.task_id.as_ref() == Some(task_id)
            })
            .cloned())
    }

    pub fn resolve(
        &self,
        id: &str,
        resolution: &str,
        by: Option<&str>,
    ) -> Result<Escalation, EscalationError> {
        self.close(id, EscalationStatus::Resolved, resolution, by)
    }

    pub fn dismiss(&self, id: &str, reason: Option<&str>) -> Result<Escalation, EscalationError> {
        self.close(
            id,
            EscalationStatus::Dismissed,
            reason.unwrap_or("dismissed"),
            None,
        )
    }

    pub fn add_note(&self, id: &str, text: &str) -> Result<Escalation, EscalationError> {
        let mut guard = self.lock();
        let entries = self.loaded(&mut guard)?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| EscalationError::NotFound { id: id.to_string() })?;
        entry.notes.push(EscalationNote {
            at: Utc::now(),
            text: text.to_string(),
        });
        entry.updated_at = Utc::now();
        let updated = entry.clone();
        write_json_atomic(&self.path, entries)?;
        Ok(updated)
    }

    pub fn set_severity(
        &self,
        id: &str,
        severity: EscalationSeverity,
    ) -> Result<Escalation, EscalationError> {
        let mut guard = self.lock();
        let entries = self.loaded(&mut guard)?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| EscalationError::NotFound { id: id.to_string() })?;
        entry.severity = severity;
        entry.updated_at = Utc::now();
        let updated = entry.clone();
        write_json_atomic(&self.path, entries)?;
        Ok(updated)
    }

    /// Auto-close every open escalation for a task that later succeeded.
    pub fn resolve_by_task(
        &self,
        task_id: &TaskId,
        reason: &str,
        by: Option<&str>,
    ) -> Result<Vec<Escalation>, EscalationError> {
        let now = Utc::now();
        let mut guard = self.lock();
        let entries = self.loaded(&mut guard)?;

        let mut closed = Vec::new();
        for entry in entries.iter_mut() {
            if entry.status.is_open() && entry.task_id.as_ref() == Some(task_id) {
                entry.status = EscalationStatus::Resolved;
                entry.resolution = Some(reason.to_string());
                entry.resolved_by = by.map(str::to_string);
                entry.resolved_at = Some(now);
                entry.updated_at = now;
                closed.push(entry.clone());
            }
        }
        if !closed.is_empty() {
            write_json_atomic(&self.path, entries)?;
        }
        Ok(closed)
    }

    pub fn stats(&self) -> Result<EscalationStats, EscalationError> {
        let mut guard = self.lock();
        let entries = self.loaded(&mut guard)?;

        let mut stats = EscalationStats::default();
        for entry in entries.iter() {
            match entry.status {
                EscalationStatus::Open => stats.open += 1,
                EscalationStatus::Resolved => stats.resolved += 1,
                EscalationStatus::Dismissed => stats.dismissed += 1,
            }
            *stats.by_severity.entry(entry.severity).or_insert(0) += 1;
        }
        Ok(stats)
    }

    /// Drop closed entries older than `keep_days`. Open escalations are
    /// never pruned.
    pub fn prune(&self, keep_days: i64) -> Result<usize, EscalationError> {
        self.prune_at(keep_days, Utc::now())
    }

    pub fn prune_at(&self, keep_days: i64, now: DateTime<Utc>) -> Result<usize, EscalationError> {
        let cutoff = now - Duration::days(keep_days);
        let mut guard = self.lock();
        let entries = self.loaded(&mut guard)?;

        let before = entries.len();
        entries.retain(|e| e.status.is_open() || e.updated_at >= cutoff);
        let pruned = before - entries.len();
        if pruned > 0 {
            write_json_atomic(&self.path, entries)?;
        }
        Ok(pruned)
    }

    fn close(
        &self,
        id: &str,
        status: EscalationStatus,
        resolution: &str,
        by: Option<&str>,
    ) -> Result<Escalation, EscalationError> {
        let now = Utc::now();
        let mut guard = self.lock();
        let entries = self.loaded(&mut guard)?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| EscalationError::NotFound { id: id.to_string() })?;
        if !entry.status.is_open() {
            return Err(EscalationError::AlreadyClosed {
                id: id.to_string(),
                status: entry.status,
            });
        }

        entry.status = status;
        entry.resolution = Some(resolution.to_string());
        entry.resolved_by = by.map(str::to_string);
        entry.resolved_at = Some(now);
        entry.updated_at = now;
        let updated = entry.clone();
        write_json_atomic(&self.path, entries)?;
        Ok(updated)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Vec<Escalation>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn loaded<'a>(
        &self,
        guard: &'a mut Option<Vec<Escalation>>,
    ) -> Result<&'a mut Vec<Escalation>, EscalationError> {
        if guard.is_none() {
            let loaded = read_json::<Vec<Escalation>>(&self.path)?.unwrap_or_default();
            *guard = Some(loaded);
        }
        Ok(guard.as_mut().expect("just loaded"))
    }
}

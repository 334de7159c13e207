//! Append-only work ledger, sharded one JSONL file per UTC day.
//!
//! Writes always append first, then mutate the in-memory cache; replaying
//! the shards in order reconstructs the cache exactly, which is the whole
//! crash-recovery story for this component.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use swarm_core::state::{check_work_transition, StateError, WorkStatus};
use swarm_core::types::RoleId;
use swarm_store::{append_jsonl, fold_jsonl, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    InvalidTransition(#[from] StateError),
    #[error("work item not found: {work_id}")]
    NotFound { work_id: String },
    #[error("work item already exists: {work_id}")]
    AlreadyExists { work_id: String },
    #[error("failed to scan ledger directory {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    /// Shard key, `YYYY-MM-DD` in UTC.
    pub date: String,
    pub work_type: String,
    pub title: String,
    #[serde(default)]
    pub role_id: Option<RoleId>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: WorkStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub events: Vec<WorkEvent>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Partial update applied through an `update` record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment_iterations: Option<u32>,
}

/// One line in a day shard. Replay applies these in file order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LedgerRecord {
    Create { item: WorkItem },
    Event {
        work_id: String,
        at: DateTime<Utc>,
        message: String,
    },
    Status {
        work_id: String,
        status: WorkStatus,
        #[serde(default)]
        error: Option<String>,
        at: DateTime<Utc>,
    },
    Update {
        work_id: String,
        patch: WorkPatch,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateWork {
    /// Explicit id; generated from the timestamp when absent.
    pub id: Option<String>,
    pub work_type: String,
    pub title: String,
    pub role_id: Option<RoleId>,
    pub parent_id: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub date: Option<String>,
    pub status: Option<WorkStatus>,
    pub work_type: Option<String>,
    pub role_id: Option<RoleId>,
    pub parent_id: Option<String>,
    pub tag: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Default)]
struct LedgerCache {
    items: HashMap<String, WorkItem>,
    loaded_days: HashSet<String>,
    scanned_dir: bool,
}

#[derive(Debug)]
pub struct WorkLedger {
    root: PathBuf,
    cache: Mutex<LedgerCache>,
}

impl WorkLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(LedgerCache::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_path(&self, date: &str) -> PathBuf {
        self.root.join(format!("{date}.jsonl"))
    }

    pub fn create(&self, input: CreateWork) -> Result<WorkItem, LedgerError> {
        self.create_at(input, Utc::now())
    }

    pub fn create_at(&self, input: CreateWork, now: DateTime<Utc>) -> Result<WorkItem, LedgerError> {
        let date = now.format("%Y-%m-%d").to_string();
        let id = input.id.unwrap_or_else(|| {
            format!("wk-{}", now.timestamp_nanos_opt().unwrap_or_default())
        });

        let mut cache = self.lock();
        self.ensure_all_loaded(&mut cache)?;
        if cache.items.contains_key(&id) {
            return Err(LedgerError::AlreadyExists { work_id: id });
        }

        let item = WorkItem {
            id: id.clone(),
            date: date.clone(),
            work_type: input.work_type,
            title: input.title,
            role_id: input.role_id,
            parent_id: input.parent_id,
            tags: input.tags,
            status: WorkStatus::Pending,
            error: None,
            output: None,
            iterations: 0,
            events: Vec::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
        };

        append_jsonl(
            &self.shard_path(&date),
            &LedgerRecord::Create { item: item.clone() },
        )?;
        cache.loaded_days.insert(date);
        cache.items.insert(id, item.clone());
        Ok(item)
    }

    pub fn get(&self, work_id: &str) -> Result<Option<WorkItem>, LedgerError> {
        let mut cache = self.lock();
        self.ensure_all_loaded(&mut cache)?;
        Ok(cache.items.get(work_id).cloned())
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<WorkItem>, LedgerError> {
        let mut cache = self.lock();
        self.ensure_all_loaded(&mut cache)?;

        let mut items: Vec<WorkItem> = cache
            .items
            .values()
            .filter(|item| {
                filter.date.as_deref().map_or(true, |d| item.date == d)
                    && filter.status.map_or(true, |s| item.status == s)
                    && filter
                        .work_type
                        .as_deref()
                        .map_or(true, |t| item.work_type == t)
                    && filter
                        .role_id
                        .as_ref()
                        .map_or(true, |r| item.role_id.as_ref() == Some(r))
                    && filter
                        .parent_id
                        .as_deref()
                        .map_or(true, |p| item.parent_id.as_deref() == Some(p))
                    && filter
                        .tag
                        .as_deref()
                        .map_or(true, |tag| item.tags.iter().any(|t| t == tag))
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let out: Vec<WorkItem> = items
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(out)
    }

    pub fn append_event(&self, work_id: &str, message: &str) -> Result<(), LedgerError> {
        self.append_event_at(work_id, message, Utc::now())
    }

    pub fn append_event_at(
        &self,
        work_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut cache = self.lock();
        self.ensure_all_loaded(&mut cache)?;
        let date = self.item_date(&cache, work_id)?;

        append_jsonl(
            &self.shard_path(&date),
            &LedgerRecord::Event {
                work_id: work_id.to_string(),
                at: now,
                message: message.to_string(),
            },
        )?;
        apply_event(&mut cache.items, work_id, now, message);
        Ok(())
    }

    pub fn update_status(
        &self,
        work_id: &str,
        status: WorkStatus,
        error: Option<String>,
    ) -> Result<WorkItem, LedgerError> {
        self.update_status_at(work_id, status, error, Utc::now())
    }

    pub fn update_status_at(
        &self,
        work_id: &str,
        status: WorkStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<WorkItem, LedgerError> {
        let mut cache = self.lock();
        self.ensure_all_loaded(&mut cache)?;
        let date = self.item_date(&cache, work_id)?;

        let current = cache
            .items
            .get(work_id)
            .expect("item_date verified presence");
        check_work_transition(current.status, status)?;

        append_jsonl(
            &self.shard_path(&date),
            &LedgerRecord::Status {
                work_id: work_id.to_string(),
                status,
                error: error.clone(),
                at: now,
            },
        )?;
        apply_status(&mut cache.items, work_id, status, error, now);
        Ok(cache.items.get(work_id).cloned().expect("item present"))
    }

    pub fn set_output(&self, work_id: &str, output: &str) -> Result<(), LedgerError> {
        self.update(
            work_id,
            WorkPatch {
                output: Some(output.to_string()),
                ..WorkPatch::default()
            },
        )
    }

    pub fn increment_iterations(&self, work_id: &str) -> Result<(), LedgerError> {
        self.update(
            work_id,
            WorkPatch {
                increment_iterations: Some(1),
                ..WorkPatch::default()
            },
        )
    }

    pub fn update(&self, work_id: &str, patch: WorkPatch) -> Result<(), LedgerError> {
        let now = Utc::now();
        let mut cache = self.lock();
        self.ensure_all_loaded(&mut cache)?;
        let date = self.item_date(&cache, work_id)?;

        append_jsonl(
            &self.shard_path(&date),
            &LedgerRecord::Update {
                work_id: work_id.to_string(),
                patch: patch.clone(),
                at: now,
            },
        )?;
        apply_patch(&mut cache.items, work_id, &patch);
        Ok(())
    }

    pub fn cancel(&self, work_id: &str, reason: Option<String>) -> Result<WorkItem, LedgerError> {
        self.update_status(work_id, WorkStatus::Cancelled, reason)
    }

    fn item_date(&self, cache: &LedgerCache, work_id: &str) -> Result<String, LedgerError> {
        cache
            .items
            .get(work_id)
            .map(|item| item.date.clone())
            .ok_or_else(|| LedgerError::NotFound {
                work_id: work_id.to_string(),
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load every shard present on disk that has not been folded yet.
    fn ensure_all_loaded(&self, cache: &mut LedgerCache) -> Result<(), LedgerError> {
        if cache.scanned_dir {
            return Ok(());
        }

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                cache.scanned_dir = true;
                return Ok(());
            }
            Err(source) => {
                return Err(LedgerError::Scan {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut dates = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| LedgerError::Scan {
                path: self.root.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(date) = name.strip_suffix(".jsonl") {
                if !cache.loaded_days.contains(date) {
                    dates.push(date.to_string());
                }
            }
        }
        dates.sort();

        for date in dates {
            let path = self.shard_path(&date);
            let items = &mut cache.items;
            fold_jsonl::<LedgerRecord, _>(&path, |record| {
                apply_record(items, record);
            })?;
            cache.loaded_days.insert(date);
        }
        cache.scanned_dir = true;
        Ok(())
    }
}

fn apply_record(items: &mut HashMap<String, WorkItem>, record: LedgerRecord) {
    match record {
        LedgerRecord::Create { item } => {
            items.insert(item.id.clone(), item);
        }
        LedgerRecord::Event {
            work_id,
            at,
            message,
        } => apply_event(items, &work_id, at, &message),
        LedgerRecord::Status {
            work_id,
            status,
            error,
            at,
        } => apply_status(items, &work_id, status, error, at),
        LedgerRecord::Update { work_id, patch, .. } => apply_patch(items, &work_id, &patch),
    }
}

fn apply_event(items: &mut HashMap<String, WorkItem>, work_id: &str, at: DateTime<Utc>, message: &str) {
    if let Some(item) = items.get_mut(work_id) {
        item.events.push(WorkEvent {
            at,
            message: message.to_string(),
        });
    }
}

fn apply_status(
    items: &mut HashMap<String, WorkItem>,
    work_id: &str,
    status: WorkStatus,
    error: Option<String>,
    at: DateTime<Utc>,
) {
    if let Some(item) = items.get_mut(work_id) {
        item.status = status;
        if let Some(error) = error {
            item.error = Some(error);
        }
        if status == WorkStatus::Running && item.started_at.is_none() {
            item.started_at = Some(at);
        }
        if status.is_terminal() && item.completed_at.is_none() {
            item.completed_at = Some(at);
        }
    }
}

fn apply_patch(items: &mut HashMap<String, WorkItem>, work_id: &str, patch: &WorkPatch) {
    if let Some(item) = items.get_mut(work_id) {
        if let Some(title) = &patch.title {
            item.title = title.clone();
        }
        if let Some(output) = &patch.output {
            item.output = Some(output.clone());
        }
        if let Some(tags) = &patch.tags {
            item.tags = tags.clone();
        }
        if let Some(by) = patch.increment_iterations {
            item.iterations += by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_ledger(prefix: &str) -> (WorkLedger, PathBuf) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("swarmops-ledger-{prefix}-{now}"));
        (WorkLedger::new(&root), root)
    }

    fn mk_create(id: &str) -> CreateWork {
        CreateWork {
            id: Some(id.to_string()),
            work_type: "worker".to_string(),
            title: format!("Work {id}"),
            role_id: Some(RoleId::new("builder")),
            parent_id: None,
            tags: vec!["phase-1".to_string()],
        }
    }

    #[test]
    fn create_get_roundtrip() {
        let (ledger, root) = unique_ledger("create");
        let item = ledger.create(mk_create("w1")).expect("create");
        assert_eq!(item.status, WorkStatus::Pending);

        let loaded = ledger.get("w1").expect("get").expect("present");
        assert_eq!(loaded, item);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let (ledger, root) = unique_ledger("dup");
        ledger.create(mk_create("w1")).expect("create");
        let err = ledger.create(mk_create("w1")).expect_err("duplicate");
        assert!(matches!(err, LedgerError::AlreadyExists { .. }));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn status_machine_is_guarded() {
        let (ledger, root) = unique_ledger("guard");
        ledger.create(mk_create("w1")).expect("create");

        let err = ledger
            .update_status("w1", WorkStatus::Complete, None)
            .expect_err("pending cannot jump to complete");
        assert!(matches!(err, LedgerError::InvalidTransition(_)));

        ledger
            .update_status("w1", WorkStatus::Running, None)
            .expect("start");
        ledger
            .update_status("w1", WorkStatus::Complete, None)
            .expect("complete");

        let err = ledger
            .update_status("w1", WorkStatus::Running, None)
            .expect_err("terminal is final");
        assert!(matches!(err, LedgerError::InvalidTransition(_)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn timestamps_set_once_and_monotonic() {
        let (ledger, root) = unique_ledger("stamps");
        ledger.create(mk_create("w1")).expect("create");

        let running = ledger
            .update_status("w1", WorkStatus::Running, None)
            .expect("start");
        let started_at = running.started_at.expect("started");

        let done = ledger
            .update_status("w1", WorkStatus::Complete, None)
            .expect("complete");
        let completed_at = done.completed_at.expect("completed");
        assert!(completed_at >= started_at);
        assert!(started_at >= done.created_at);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn pending_can_be_cancelled_administratively() {
        let (ledger, root) = unique_ledger("cancel");
        ledger.create(mk_create("w1")).expect("create");
        let cancelled = ledger
            .cancel("w1", Some("operator stop".to_string()))
            .expect("cancel");
        assert_eq!(cancelled.status, WorkStatus::Cancelled);
        assert_eq!(cancelled.error.as_deref(), Some("operator stop"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn replay_reconstructs_cache_exactly() {
        let (ledger, root) = unique_ledger("replay");
        ledger.create(mk_create("w1")).expect("create");
        ledger.create(mk_create("w2")).expect("create");
        ledger
            .update_status("w1", WorkStatus::Running, None)
            .expect("start");
        ledger.append_event("w1", "spawned").expect("event");
        ledger.set_output("w1", "all green").expect("output");
        ledger.increment_iterations("w1").expect("iterations");
        ledger
            .update_status("w1", WorkStatus::Complete, None)
            .expect("complete");
        ledger
            .update_status("w2", WorkStatus::Running, None)
            .expect("start w2");
        ledger
            .update_status("w2", WorkStatus::Failed, Some("boom".to_string()))
            .expect("fail w2");

        let before_w1 = ledger.get("w1").expect("get").expect("present");
        let before_w2 = ledger.get("w2").expect("get").expect("present");

        // A fresh ledger over the same directory replays the shards.
        let reloaded = WorkLedger::new(&root);
        let after_w1 = reloaded.get("w1").expect("get").expect("present");
        let after_w2 = reloaded.get("w2").expect("get").expect("present");
        assert_eq!(after_w1, before_w1);
        assert_eq!(after_w2, before_w2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn list_filters_and_paginates() {
        let (ledger, root) = unique_ledger("list");
        for idx in 0..5 {
            let mut input = mk_create(&format!("w{idx}"));
            input.work_type = if idx % 2 == 0 { "worker" } else { "reviewer" }.to_string();
            ledger.create(input).expect("create");
        }
        ledger
            .update_status("w0", WorkStatus::Running, None)
            .expect("start");

        let workers = ledger
            .list(&ListFilter {
                work_type: Some("worker".to_string()),
                ..ListFilter::default()
            })
            .expect("list");
        assert_eq!(workers.len(), 3);

        let running = ledger
            .list(&ListFilter {
                status: Some(WorkStatus::Running),
                ..ListFilter::default()
            })
            .expect("list");
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "w0");

        let page = ledger
            .list(&ListFilter {
                offset: 1,
                limit: Some(2),
                ..ListFilter::default()
            })
            .expect("list");
        assert_eq!(page.len(), 2);

        let tagged = ledger
            .list(&ListFilter {
                tag: Some("phase-1".to_string()),
                ..ListFilter::default()
            })
            .expect("list");
        assert_eq!(tagged.len(), 5);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_item_is_not_found() {
        let (ledger, root) = unique_ledger("missing");
        let err = ledger
            .update_status("ghost", WorkStatus::Running, None)
            .expect_err("missing");
        assert!(matches!(err, LedgerError::NotFound { .. }));
        assert!(ledger.get("ghost").expect("get").is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn records_serialize_with_snake_case_discriminants() {
        let record = LedgerRecord::Status {
            work_id: "w1".to_string(),
            status: WorkStatus::Failed,
            error: Some("boom".to_string()),
            at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"record\":\"status\""));
        assert!(json.contains("\"status\":\"failed\""));
        let decoded: LedgerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }
}

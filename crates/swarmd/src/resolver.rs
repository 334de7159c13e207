//! Conflict-resolver contexts: where the merge loop parks its state while
//! a resolver agent untangles a conflicted branch.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use swarm_core::types::RunId;
use swarm_store::{read_json, write_json_atomic, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("resolver context not found: {id}")]
    NotFound { id: String },
    #[error("failed to scan resolver directory {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverContext {
    pub id: String,
    pub run_id: RunId,
    pub phase_number: u32,
    pub phase_branch: String,
    /// The worker branch whose merge conflicted.
    pub source_branch: String,
    pub conflict_files: Vec<String>,
    /// Branches still waiting to merge once the resolver finishes.
    pub remaining_branches: Vec<String>,
    pub repo_dir: PathBuf,
    pub status: ResolverStatus,
    #[serde(default)]
    pub session_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ResolverStore {
    dir: PathBuf,
    // Serializes id assignment per process; contexts themselves live on disk.
    create_lock: Mutex<()>,
}

impl ResolverStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            create_lock: Mutex::new(()),
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        run_id: &RunId,
        phase_number: u32,
        phase_branch: String,
        source_branch: String,
        conflict_files: Vec<String>,
        remaining_branches: Vec<String>,
        repo_dir: PathBuf,
    ) -> Result<ResolverContext, ResolverError> {
        let _guard = self.create_lock.lock().unwrap_or_else(|e| e.into_inner());
        let seq = self.contexts_for_run(run_id)?.len() + 1;
        let now = Utc::now();
        let context = ResolverContext {
            id: format!("{}-{seq:03}", run_id.0),
            run_id: run_id.clone(),
            phase_number,
            phase_branch,
            source_branch,
            conflict_files,
            remaining_branches,
            repo_dir,
            status: ResolverStatus::Active,
            session_key: None,
            created_at: now,
            updated_at: now,
        };
        write_json_atomic(&self.path(&context.id), &context)?;
        Ok(context)
    }

    pub fn get(&self, id: &str) -> Result<Option<ResolverContext>, ResolverError> {
        Ok(read_json(&self.path(id))?)
    }

    /// All contexts belonging to one run, oldest first.
    pub fn contexts_for_run(&self, run_id: &RunId) -> Result<Vec<ResolverContext>, ResolverError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ResolverError::Scan {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let prefix = format!("{}-", run_id.0);
        let mut contexts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ResolverError::Scan {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(".json") {
                if let Some(context) = read_json::<ResolverContext>(&entry.path())? {
                    contexts.push(context);
                }
            }
        }
        contexts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(contexts)
    }

    /// The context the run's resolver webhook should resume, if any.
    pub fn active_for_run(&self, run_id: &RunId) -> Result<Option<ResolverContext>, ResolverError> {
        Ok(self
            .contexts_for_run(run_id)?
            .into_iter()
            .find(|c| c.status == ResolverStatus::Active))
    }

    pub fn set_session_key(&self, id: &str, session_key: &str) -> Result<(), ResolverError> {
        self.update(id, |context| {
            context.session_key = Some(session_key.to_string());
        })
    }

    pub fn complete(&self, id: &str) -> Result<ResolverContext, ResolverError> {
        self.update_and_get(id, |context| {
            context.status = ResolverStatus::Completed;
        })
    }

    pub fn fail(&self, id: &str) -> Result<ResolverContext, ResolverError> {
        self.update_and_get(id, |context| {
            context.status = ResolverStatus::Failed;
        })
    }

    fn update<F>(&self, id: &str, mutate: F) -> Result<(), ResolverError>
    where
        F: FnOnce(&mut ResolverContext),
    {
        self.update_and_get(id, mutate).map(|_| ())
    }

    fn update_and_get<F>(&self, id: &str, mutate: F) -> Result<ResolverContext, ResolverError>
    where
        F: FnOnce(&mut ResolverContext),
    {
        let mut context: ResolverContext =
            read_json(&self.path(id))?.ok_or_else(|| ResolverError::NotFound {
                id: id.to_string(),
            })?;
        mutate(&mut context);
        context.updated_at = Utc::now();
        write_json_atomic(&self.path(id), &context)?;
        Ok(context)
    }
}

//! Role configuration: which model and instructions each agent persona
//! gets. Roles are data looked up by id, never a polymorphic type.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use swarm_core::types::RoleId;
use swarm_gateway::types::ThinkingLevel;
use swarm_store::{read_json, StoreError};

const CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("role not found: {role_id}")]
    NotFound { role_id: String },
    #[error("failed to read prompt file {path}: {source}")]
    PromptFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What part of the pipeline a role serves; drives prompt assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Builder,
    Reviewer,
    Fixer,
    ConflictResolver,
    Spec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleConfig {
    pub id: RoleId,
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub thinking: ThinkingLevel,
    pub kind: RoleKind,
    /// Inline instruction text.
    #[serde(default)]
    pub instructions: Option<String>,
    /// Alternative: a prompt file under the data root's `prompts/` dir.
    #[serde(default)]
    pub instructions_file: Option<PathBuf>,
}

impl RoleConfig {
    fn builtin(id: &str, name: &str, model: &str, kind: RoleKind, instructions: &str) -> Self {
        Self {
            id: RoleId::new(id),
            name: name.to_string(),
            model: model.to_string(),
            thinking: ThinkingLevel::Medium,
            kind,
            instructions: Some(instructions.to_string()),
            instructions_file: None,
        }
    }
}

/// The roles every installation starts with; `roles.json` overrides them.
pub fn builtin_roles() -> Vec<RoleConfig> {
    vec![
        RoleConfig::builtin(
            "builder",
            "Builder",
            "claude-sonnet",
            RoleKind::Builder,
            "You implement one task in an isolated git worktree. Commit your \
             work on the branch you are given and report completion through \
             the webhook.",
        ),
        RoleConfig::builtin(
            "reviewer",
            "Code Reviewer",
            "claude-sonnet",
            RoleKind::Reviewer,
            "You review the phase branch for correctness and maintainability. \
             Post approved or request_changes with concrete findings.",
        ),
        RoleConfig::builtin(
            "security-reviewer",
            "Security Reviewer",
            "claude-opus",
            RoleKind::Reviewer,
            "You review the phase branch for security issues only: injection, \
             secrets, unsafe input handling, authz gaps.",
        ),
        RoleConfig::builtin(
            "designer",
            "Design Reviewer",
            "claude-sonnet",
            RoleKind::Reviewer,
            "You review user-facing surfaces on the phase branch for visual \
             and interaction quality.",
        ),
        RoleConfig::builtin(
            "fixer",
            "Fixer",
            "claude-sonnet",
            RoleKind::Fixer,
            "You address review findings on the phase branch, one by one, \
             then trigger re-review through the webhook.",
        ),
        RoleConfig::builtin(
            "conflict-resolver",
            "Conflict Resolver",
            "claude-opus",
            RoleKind::ConflictResolver,
            "You resolve git merge conflicts between worker branches, keeping \
             both sides' intent, and commit the resolution on the phase branch.",
        ),
        RoleConfig::builtin(
            "spec",
            "Spec Writer",
            "claude-opus",
            RoleKind::Spec,
            "You turn the interview transcript into an implementation plan \
             and an annotated progress document.",
        ),
    ]
}

#[derive(Debug, Default)]
struct RoleCache {
    roles: Vec<RoleConfig>,
    loaded_at: Option<Instant>,
}

#[derive(Debug)]
pub struct RoleStore {
    path: PathBuf,
    prompts_dir: PathBuf,
    cache: Mutex<RoleCache>,
}

impl RoleStore {
    pub fn new(path: impl Into<PathBuf>, prompts_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            prompts_dir: prompts_dir.into(),
            cache: Mutex::new(RoleCache::default()),
        }
    }

    pub fn get(&self, role_id: &RoleId) -> Result<RoleConfig, RoleError> {
        let mut cache = self.lock();
        self.refresh(&mut cache)?;
        cache
            .roles
            .iter()
            .find(|role| &role.id == role_id)
            .cloned()
            .ok_or_else(|| RoleError::NotFound {
                role_id: role_id.0.clone(),
            })
    }

    pub fn all(&self) -> Result<Vec<RoleConfig>, RoleError> {
        let mut cache = self.lock();
        self.refresh(&mut cache)?;
        Ok(cache.roles.clone())
    }

    /// Resolve a role's instruction text, reading the prompt file when the
    /// role references one.
    pub fn instructions(&self, role: &RoleConfig) -> Result<String, RoleError> {
        if let Some(text) = &role.instructions {
            return Ok(text.clone());
        }
        if let Some(file) = &role.instructions_file {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                self.prompts_dir.join(file)
            };
            return std::fs::read_to_string(&path)
                .map_err(|source| RoleError::PromptFile { path, source });
        }
        Ok(String::new())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RoleCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refresh(&self, cache: &mut RoleCache) -> Result<(), RoleError> {
        let fresh = cache
            .loaded_at
            .map(|at| at.elapsed() < CACHE_TTL)
            .unwrap_or(false);
        if fresh {
            return Ok(());
        }
        cache.roles =
            read_json::<Vec<RoleConfig>>(&self.path)?.unwrap_or_else(builtin_roles);
        cache.loaded_at = Some(Instant::now());
        Ok(())
    }
}

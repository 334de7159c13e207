use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config at {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLevel {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

/// Top-level orchestrator configuration.
///
/// Environment variables override the file: `SWARMOPS_DATA_ROOT`,
/// `SWARMOPS_PROJECTS_ROOT`, `SWARMOPS_GATEWAY_URL`, `SWARMOPS_GATEWAY_TOKEN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Root of the persisted state layout (ledger, registry, runs, …).
    pub data_root: PathBuf,
    /// Base directory for per-project files (progress.md, state.json, …).
    pub projects_root: PathBuf,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub retry: RetryPolicyConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub web: WebConfig,
    /// Root for per-worker git worktrees.
    #[serde(default = "default_worktree_root")]
    pub worktree_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Spacing between consecutive spawns; protects the gateway from bursts.
    pub spawn_stagger_ms: u64,
    /// Review chain roles, in order.
    pub review_chain: Vec<String>,
    pub max_fix_attempts: u32,
    /// Base URL the agents post their completion webhooks to.
    pub webhook_base_url: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            spawn_stagger_ms: 3_000,
            review_chain: vec![
                "reviewer".to_string(),
                "security-reviewer".to_string(),
                "designer".to_string(),
            ],
            max_fix_attempts: 3,
            webhook_base_url: "http://127.0.0.1:9779".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub tick_secs: u64,
    /// Re-trigger cooldown while a project is in build.
    pub build_cooldown_secs: i64,
    /// Re-trigger cooldown while a spec agent may still be writing.
    pub spec_cooldown_secs: i64,
    pub watchdog_interval_secs: u64,
    /// No progress on the project files for this long counts as stalled.
    pub watchdog_idle_secs: i64,
    pub watchdog_max_retries: u32,
    /// Registry entries stuck in running longer than this are swept failed.
    pub registry_stale_secs: i64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            build_cooldown_secs: 30,
            spec_cooldown_secs: 300,
            watchdog_interval_secs: 180,
            watchdog_idle_secs: 600,
            watchdog_max_retries: 3,
            registry_stale_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebConfig {
    pub bind: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9779".to_string(),
        }
    }
}

fn default_worktree_root() -> PathBuf {
    std::env::temp_dir().join("swarmops-worktrees")
}

fn default_run_timeout_secs() -> u64 {
    600
}

impl SwarmConfig {
    /// A config rooted at one directory; used by tests and first-run setup.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data_root: root.join("data"),
            projects_root: root.join("projects"),
            gateway: GatewayConfig {
                url: "http://127.0.0.1:9800".to_string(),
                token: None,
                run_timeout_secs: default_run_timeout_secs(),
            },
            dispatch: DispatchConfig::default(),
            retry: RetryPolicyConfig::default(),
            watcher: WatcherConfig::default(),
            web: WebConfig::default(),
            worktree_root: root.join("worktrees"),
        }
    }

    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.gateway.url.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "gateway_url_empty",
                message: "gateway url must not be empty".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "retry_max_attempts_zero",
                message: "retry max_attempts must be at least 1".to_string(),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "retry_multiplier_too_small",
                message: "retry backoff_multiplier must be >= 1.0".to_string(),
            });
        }
        if self.dispatch.review_chain.is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "review_chain_empty",
                message: "review chain must name at least one reviewer role".to_string(),
            });
        }
        if self.watcher.tick_secs == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "watcher_tick_zero",
                message: "watcher tick of zero busy-loops; expected >= 1s".to_string(),
            });
        }

        issues
    }
}

pub fn parse_config(contents: &str) -> Result<SwarmConfig, toml::de::Error> {
    toml::from_str(contents)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<SwarmConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    let mut config = parse_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })?;
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn save_config(path: impl AsRef<Path>, config: &SwarmConfig) -> Result<(), ConfigError> {
    let path_ref = path.as_ref();
    if let Some(parent) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let body = toml::to_string_pretty(config).map_err(|source| ConfigError::Serialize {
        path: path_ref.to_path_buf(),
        source,
    })?;
    fs::write(path_ref, body).map_err(|source| ConfigError::Write {
        path: path_ref.to_path_buf(),
        source,
    })
}

fn apply_env_overrides(config: &mut SwarmConfig) {
    if let Ok(value) = std::env::var("SWARMOPS_DATA_ROOT") {
        if !value.trim().is_empty() {
            config.data_root = PathBuf::from(value);
        }
    }
    if let Ok(value) = std::env::var("SWARMOPS_PROJECTS_ROOT") {
        if !value.trim().is_empty() {
            config.projects_root = PathBuf::from(value);
        }
    }
    if let Ok(value) = std::env::var("SWARMOPS_GATEWAY_URL") {
        if !value.trim().is_empty() {
            config.gateway.url = value;
        }
    }
    if let Ok(value) = std::env::var("SWARMOPS_GATEWAY_TOKEN") {
        if !value.trim().is_empty() {
            config.gateway.token = Some(value);
        }
    }
}

//! Per-(run, step) retry state: attempt history, backoff with jitter, and
//! the exhausted → escalate edge. The controller computes and records;
//! scheduling the delayed re-dispatch belongs to the dispatcher.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use swarm_core::config::RetryPolicyConfig;
use swarm_core::types::RunId;
use swarm_store::{read_json, write_json_atomic, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Retrying,
    Exhausted,
    Succeeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub at: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    pub policy: RetryPolicyConfig,
    pub attempts: Vec<RetryAttempt>,
    pub status: RetryStatus,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RetryState {
    fn new(policy: RetryPolicyConfig) -> Self {
        Self {
            policy,
            attempts: Vec::new(),
            status: RetryStatus::Pending,
            next_retry_at: None,
        }
    }
}

/// What `record_attempt` decided.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    pub status: RetryStatus,
    /// Delay before the next attempt; set only when status is `Retrying`.
    pub delay_ms: Option<u64>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
}

pub fn retry_key(run_id: &RunId, step_order: u64) -> String {
    format!("{}:{step_order}", run_id.0)
}

/// Backoff before the next attempt, given how many failures came before
/// this one. `jitter_frac` is the sampled jitter in `[-0.1, 0.1]`; tests
/// pin it, production samples it uniformly.
pub fn compute_delay_ms(policy: &RetryPolicyConfig, prior_failures: u32, jitter_frac: f64) -> u64 {
    let base = policy.base_delay_ms as f64;
    let raw = base * policy.backoff_multiplier.powi(prior_failures as i32);
    let jittered = raw + raw * jitter_frac;
    (jittered.floor() as u64).min(policy.max_delay_ms)
}

#[derive(Debug)]
pub struct RetryController {
    path: PathBuf,
    default_policy: RetryPolicyConfig,
    states: Mutex<Option<HashMap<String, RetryState>>>,
}

impl RetryController {
    pub fn new(path: impl Into<PathBuf>, default_policy: RetryPolicyConfig) -> Self {
        Self {
            path: path.into(),
            default_policy,
            states: Mutex::new(None),
        }
    }

    pub fn init_state(&self, run_id: &RunId, step_order: u64) -> Result<RetryState, RetryError> {
        let key = retry_key(run_id, step_order);
        let mut guard = self.lock();
        let states = self.loaded(&mut guard)?;
        if let Some(state) = states.get(&key) {
            return Ok(state.clone());
        }
        let state = RetryState::new(self.default_policy.clone());
        states.insert(key, state.clone());
        // Persist while still holding the lock so concurrent writers cannot
        // invert their snapshots on disk.
        write_json_atomic(&self.path, states)?;
        Ok(state)
    }

    pub fn get(&self, run_id: &RunId, step_order: u64) -> Result<Option<RetryState>, RetryError> {
        let key = retry_key(run_id, step_order);
        let mut guard = self.lock();
        let states = self.loaded(&mut guard)?;
        Ok(states.get(&key).cloned())
    }

    pub fn is_exhausted(&self, run_id: &RunId, step_order: u64) -> Result<bool, RetryError> {
        Ok(self
            .get(run_id, step_order)?
            .map(|state| state.status == RetryStatus::Exhausted)
            .unwrap_or(false))
    }

    pub fn record_attempt(
        &self,
        run_id: &RunId,
        step_order: u64,
        success: bool,
        error: Option<String>,
        duration_ms: Option<u64>,
    ) -> Result<RetryOutcome, RetryError> {
        let jitter = rand::thread_rng().gen_range(-0.1..=0.1);
        self.record_attempt_at(run_id, step_order, success, error, duration_ms, Utc::now(), jitter)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_attempt_at(
        &self,
        run_id: &RunId,
        step_order: u64,
        success: bool,
        error: Option<String>,
        duration_ms: Option<u64>,
        now: DateTime<Utc>,
        jitter_frac: f64,
    ) -> Result<RetryOutcome, RetryError> {
        let key = retry_key(run_id, step_order);
        let mut guard = self.lock();
        let states = self.loaded(&mut guard)?;
        let state = states
            .entry(key)
            .or_insert_with(|| RetryState::new(self.default_policy.clone()));

        state.attempts.push(RetryAttempt {
            at: now,
            success,
            error,
            duration_ms,
        });
        let attempt_count = state.attempts.len() as u32;

        let outcome = if success {
            state.status = RetryStatus::Succeeded;
            state.next_retry_at = None;
            RetryOutcome {
                status: RetryStatus::Succeeded,
                delay_ms: None,
                next_retry_at: None,
                attempt_count,
            }
        } else if attempt_count >= state.policy.max_attempts {
            state.status = RetryStatus::Exhausted;
            state.next_retry_at = None;
            RetryOutcome {
                status: RetryStatus::Exhausted,
                delay_ms: None,
                next_retry_at: None,
                attempt_count,
            }
        } else {
            let delay_ms = compute_delay_ms(&state.policy, attempt_count - 1, jitter_frac);
            let next = now + chrono::Duration::milliseconds(delay_ms as i64);
            state.status = RetryStatus::Retrying;
            state.next_retry_at = Some(next);
            RetryOutcome {
                status: RetryStatus::Retrying,
                delay_ms: Some(delay_ms),
                next_retry_at: Some(next),
                attempt_count,
            }
        };

        write_json_atomic(&self.path, states)?;
        Ok(outcome)
    }

    /// Drop the entry entirely; used when a retried step finally succeeds.
    pub fn clear_state(&self, run_id: &RunId, step_order: u64) -> Result<(), RetryError> {
        let key = retry_key(run_id, step_order);
        let mut guard = self.lock();
        let states = self.loaded(&mut guard)?;
        if states.remove(&key).is_some() {
            write_json_atomic(&self.path, states)?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<HashMap<String, RetryState>>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn loaded<'a>(
        &self,
        guard: &'a mut Option<HashMap<String, RetryState>>,
    ) -> Result<&'a mut HashMap<String, RetryState>, RetryError> {
        if guard.is_none() {
            let loaded = read_json::<HashMap<String, RetryState>>(&self.path)?.unwrap_or_default();
            *guard = Some(loaded);
        }
        Ok(guard.as_mut().expect("just loaded"))
    }
}

//! Error taxonomy
//!
//! Every public operation returns one of these typed errors (or a typed
//! outcome). Collaborator failures are wrapped before they cross a public
//! boundary.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure reported by an external collaborator (inference, memory, gateway, trainer)
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollabError {
    /// Call exceeded its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Temporary failure, a retry may succeed
    #[error("transient failure: {0}")]
    Transient(String),
    /// Collaborator is not reachable or not configured
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Request was understood and refused; retrying will not help
    #[error("rejected: {0}")]
    Rejected(String),
}

impl CollabError {
    /// Timeouts and transient/unavailable failures are retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transient(_) | Self::Unavailable(_))
    }

    /// Classify an error message coming back from a subprocess or HTTP call
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match crate::agent::recovery::ErrorClass::from_error(&message) {
            class if class.is_retryable() => Self::Transient(message),
            _ => Self::Rejected(message),
        }
    }
}

/// Run a collaborator future under a deadline, mapping expiry to [`CollabError::Timeout`]
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, CollabError>
where
    F: std::future::Future<Output = Result<T, CollabError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CollabError::Timeout(limit)),
    }
}

/// Invalid policy or process configuration. Fatal at startup, rejected on reload.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed policy document: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Plan could not be produced or failed validation
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("plan has no steps")]
    Empty,
    #[error("plan has {0} steps, limit is {1}")]
    TooManySteps(usize, usize),
    #[error("duplicate step id: {0}")]
    DuplicateStep(String),
    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },
    #[error("dependency cycle through steps: {0}")]
    Cycle(String),
    #[error("replan limit of {0} reached")]
    ReplanLimit(usize),
    #[error("planner output unusable: {0}")]
    Unparseable(String),
    #[error("planner inference failed: {0}")]
    Inference(#[from] CollabError),
}

/// Durable state failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

/// Why a goal ended in `failed`
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GoalFailure {
    #[error("policy denied: {0}")]
    PolicyDenied(String),
    #[error("stalled: no step succeeded in {0} consecutive iterations")]
    Stalled(usize),
    #[error("step {step} failed permanently: {reason}")]
    PermanentStepFailure { step: String, reason: String },
    #[error("planning failed: {0}")]
    Planning(String),
}

impl GoalFailure {
    /// Short machine-readable tag, stable across releases
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PolicyDenied(_) => "policyDenied",
            Self::Stalled(_) => "stalled",
            Self::PermanentStepFailure { .. } => "permanentStepFailure",
            Self::Planning(_) => "planning",
        }
    }
}

/// Why an evolution run ended in `failed` or `rolledBack`
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    #[error("insufficient data: {found} records, {required} required")]
    InsufficientData { found: usize, required: usize },
    #[error("evaluation regression: candidate {candidate:.3} < baseline {baseline:.3} - {tolerance:.3}")]
    EvaluationRegression {
        candidate: f64,
        baseline: f64,
        tolerance: f64,
    },
    #[error("{stage} failed: {reason}")]
    Infrastructure { stage: String, reason: String },
    #[error("interrupted in {stage}; outcome unknown")]
    Interrupted { stage: String },
}

impl RunFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientData { .. } => "insufficientData",
            Self::EvaluationRegression { .. } => "evaluationRegression",
            Self::Infrastructure { .. } => "infrastructure",
            Self::Interrupted { .. } => "interrupted",
        }
    }
}

/// Errors from evolution pipeline entry points
#[derive(Debug, Error)]
pub enum EvolutionError {
    #[error("an evolution run is already in progress: {0}")]
    AlreadyRunning(String),
    #[error("no evolution run in progress")]
    NoActiveRun,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from goal submission
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("supervisor is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Planning(#[from] PlanningError),
}

/// Errors from scheduler job management
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },
    #[error("job {0} already exists")]
    Duplicate(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

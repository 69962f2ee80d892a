//! Collaborator Interfaces
//!
//! The control plane only talks to the outside world through these traits:
//! - [`Inference`]: text generation and embeddings
//! - [`Memory`]: passage search and storage
//! - [`Gateway`]: skill invocation and human confirmation
//! - [`Trainer`]: fine-tuning, merging and evaluation
//!
//! Reference adapters live in the submodules.

pub mod command;
pub mod memory;
pub mod ollama;
pub mod shell;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CollabError;

pub use command::CommandTrainer;
pub use memory::SqliteMemory;
pub use ollama::{OllamaConfig, OllamaInference};
pub use shell::ShellGateway;

/// Language-model backend
#[async_trait]
pub trait Inference: Send + Sync {
    /// Generate a completion with the given model reference
    async fn generate(&self, prompt: &str, model: &str) -> Result<String, CollabError>;

    /// Embed text into a vector
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollabError>;

    /// Readiness probe used by the health check job
    async fn health(&self) -> Result<(), CollabError> {
        Ok(())
    }
}

/// Retrieved memory passage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub content: String,
    pub source: Option<String>,
    pub score: f64,
}

/// Record offered to memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// fact, lesson, conversation ...
    pub kind: String,
    pub content: String,
    pub source: Option<String>,
}

/// Long-term memory store
#[async_trait]
pub trait Memory: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>, CollabError>;

    async fn store(&self, record: MemoryRecord) -> Result<(), CollabError>;

    /// Periodic consolidation; returns the number of records touched
    async fn maintain(&self) -> Result<usize, CollabError> {
        Ok(0)
    }
}

/// Answer to a confirmation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Approved,
    Denied,
}

/// Skill execution gateway
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Run a skill with JSON arguments; the observation text on success
    async fn invoke(
        &self,
        skill: &str,
        args: &serde_json::Value,
        timeout: Duration,
    ) -> Result<String, CollabError>;

    /// Ask the human whether `action` may proceed
    async fn request_confirmation(&self, action: &str) -> Result<Confirmation, CollabError>;
}

/// Model training backend
#[async_trait]
pub trait Trainer: Send + Sync {
    /// Fine-tune on a dataset; returns an adapter reference
    async fn train(&self, dataset: &str) -> Result<String, CollabError>;

    /// Merge an adapter into a base model; returns a deployable artifact
    async fn merge(&self, base: &str, adapter: &str) -> Result<String, CollabError>;

    /// Score a model artifact, higher is better
    async fn evaluate(&self, artifact: &str) -> Result<f64, CollabError>;
}

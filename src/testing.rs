//! In-process collaborators for tests and dry runs
//!
//! Scripted stand-ins for the collaborator traits. Each records what it was
//! asked so tests can assert on prompts, invocations and confirmations.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::collab::{Confirmation, Gateway, Inference, Memory, MemoryRecord, Passage, Trainer};
use crate::error::CollabError;

/// Inference that replays canned responses in order
pub struct ScriptedInference {
    responses: Mutex<VecDeque<Result<String, CollabError>>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
    models: Mutex<Vec<String>>,
}

impl ScriptedInference {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.to_string())).collect()),
            fallback: None,
            prompts: Mutex::new(Vec::new()),
            models: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with `response` once the script runs out
    pub fn with_fallback(mut self, response: &str) -> Self {
        self.fallback = Some(response.to_string());
        self
    }

    /// Queue an error as the next response
    pub fn push_error(&self, error: CollabError) {
        self.responses.lock().push_back(Err(error));
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn models(&self) -> Vec<String> {
        self.models.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl Inference for ScriptedInference {
    async fn generate(&self, prompt: &str, model: &str) -> Result<String, CollabError> {
        self.prompts.lock().push(prompt.to_string());
        self.models.lock().push(model.to_string());
        match self.responses.lock().pop_front() {
            Some(response) => response,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| CollabError::Rejected("script exhausted".into())),
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollabError> {
        Ok(vec![text.len() as f32])
    }
}

/// Gateway with scripted skill results and a fixed confirmation answer
pub struct RecordingGateway {
    results: Mutex<VecDeque<Result<String, CollabError>>>,
    answer: Option<Confirmation>,
    delay: Duration,
    invocations: Mutex<Vec<(String, serde_json::Value)>>,
    confirmations: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingGateway {
    /// Every invocation succeeds; confirmations are approved
    pub fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            answer: Some(Confirmation::Approved),
            delay: Duration::ZERO,
            invocations: Mutex::new(Vec::new()),
            confirmations: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Results returned in order; `Ok("ok")` once exhausted
    pub fn with_results(self, results: Vec<Result<&str, CollabError>>) -> Self {
        *self.results.lock() = results.into_iter().map(|r| r.map(String::from)).collect();
        self
    }

    /// Fixed confirmation answer. `None` never answers.
    pub fn with_confirmation(mut self, answer: Option<Confirmation>) -> Self {
        self.answer = answer;
        self
    }

    /// Hold every invocation for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn invocations(&self) -> Vec<(String, serde_json::Value)> {
        self.invocations.lock().clone()
    }

    pub fn confirmations(&self) -> Vec<String> {
        self.confirmations.lock().clone()
    }

    /// Highest number of concurrent invocations observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for RecordingGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Gateway for RecordingGateway {
    async fn invoke(&self, skill: &str, args: &serde_json::Value, _timeout: Duration) -> Result<String, CollabError> {
        self.invocations.lock().push((skill.to_string(), args.clone()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.results.lock().pop_front().unwrap_or_else(|| Ok("ok".to_string()))
    }

    async fn request_confirmation(&self, action: &str) -> Result<Confirmation, CollabError> {
        self.confirmations.lock().push(action.to_string());
        match self.answer {
            Some(answer) => Ok(answer),
            None => std::future::pending().await,
        }
    }
}

/// Memory that keeps records in a vector
#[derive(Default)]
pub struct VecMemory {
    records: Mutex<Vec<MemoryRecord>>,
    fail: bool,
}

impl VecMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails as unavailable
    pub fn unavailable() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn records(&self) -> Vec<MemoryRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl Memory for VecMemory {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>, CollabError> {
        if self.fail {
            return Err(CollabError::Unavailable("memory offline".into()));
        }
        let query = query.to_lowercase();
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| {
                r.content
                    .to_lowercase()
                    .split_whitespace()
                    .any(|w| w.len() > 3 && query.contains(w))
            })
            .take(k)
            .map(|r| Passage {
                content: r.content.clone(),
                source: r.source.clone(),
                score: 1.0,
            })
            .collect())
    }

    async fn store(&self, record: MemoryRecord) -> Result<(), CollabError> {
        if self.fail {
            return Err(CollabError::Unavailable("memory offline".into()));
        }
        self.records.lock().push(record);
        Ok(())
    }
}

/// Trainer with fixed outputs and per-artifact scores
pub struct ScriptedTrainer {
    scores: Mutex<HashMap<String, f64>>,
    train_error: Mutex<Option<CollabError>>,
    delay: Duration,
    trains: AtomicUsize,
    merges: AtomicUsize,
    evaluations: Mutex<Vec<String>>,
}

impl ScriptedTrainer {
    /// Merged artifacts are named `<base>+<adapter>`
    pub fn new() -> Self {
        Self {
            scores: Mutex::new(HashMap::new()),
            train_error: Mutex::new(None),
            delay: Duration::ZERO,
            trains: AtomicUsize::new(0),
            merges: AtomicUsize::new(0),
            evaluations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_score(self, artifact: &str, score: f64) -> Self {
        self.scores.lock().insert(artifact.to_string(), score);
        self
    }

    /// Fail the next training call
    pub fn with_train_error(self, error: CollabError) -> Self {
        *self.train_error.lock() = Some(error);
        self
    }

    /// Hold training for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn trains(&self) -> usize {
        self.trains.load(Ordering::SeqCst)
    }

    pub fn merges(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }

    pub fn evaluations(&self) -> Vec<String> {
        self.evaluations.lock().clone()
    }
}

impl Default for ScriptedTrainer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Trainer for ScriptedTrainer {
    async fn train(&self, _dataset: &str) -> Result<String, CollabError> {
        let n = self.trains.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.train_error.lock().take() {
            return Err(err);
        }
        Ok(format!("adapter-{}", n))
    }

    async fn merge(&self, base: &str, adapter: &str) -> Result<String, CollabError> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}+{}", base, adapter))
    }

    async fn evaluate(&self, artifact: &str) -> Result<f64, CollabError> {
        self.evaluations.lock().push(artifact.to_string());
        let scores = self.scores.lock();
        // Merged artifacts fall back to the "candidate" entry
        scores
            .get(artifact)
            .or_else(|| artifact.contains('+').then(|| scores.get("candidate")).flatten())
            .copied()
            .ok_or_else(|| CollabError::Rejected(format!("no score for {}", artifact)))
    }
}

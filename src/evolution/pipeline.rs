//! Evolution Pipeline
//!
//! ```text
//! idle -> collecting -> filtering -> training -> merging -> evaluating
//!      -> deploying -> deployed
//!      -> rolled_back            (candidate scored below baseline - tolerance)
//!      -> failed                 (insufficient data, infrastructure, interrupted)
//! ```
//!
//! The run is persisted on entering every stage, before the stage's work
//! starts. After a restart, stages whose work is idempotent (collecting,
//! filtering, evaluating, deploying) resume; training and merging may have
//! left an unknown amount of external work behind, so those runs fail as
//! interrupted. Only one run is open at a time across the whole system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::dataset::DatasetBuilder;
use super::models::ModelRegistry;
use crate::collab::Trainer;
use crate::error::{with_timeout, EvolutionError, RunFailure, StoreError};
use crate::policy::PolicyStore;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Collecting,
    Filtering,
    Training,
    Merging,
    Evaluating,
    Deploying,
    Deployed,
    RolledBack,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Collecting => "collecting",
            Self::Filtering => "filtering",
            Self::Training => "training",
            Self::Merging => "merging",
            Self::Evaluating => "evaluating",
            Self::Deploying => "deploying",
            Self::Deployed => "deployed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "collecting" => Some(Self::Collecting),
            "filtering" => Some(Self::Filtering),
            "training" => Some(Self::Training),
            "merging" => Some(Self::Merging),
            "evaluating" => Some(Self::Evaluating),
            "deploying" => Some(Self::Deploying),
            "deployed" => Some(Self::Deployed),
            "rolled_back" | "rolledBack" => Some(Self::RolledBack),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// No further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Idle | Self::Deployed | Self::RolledBack | Self::Failed)
    }
}

/// One pass through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionRun {
    pub id: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dataset_ref: Option<String>,
    pub record_count: Option<usize>,
    pub adapter_ref: Option<String>,
    pub candidate_model_ref: Option<String>,
    pub artifact_ref: Option<String>,
    pub eval_score: Option<f64>,
    pub baseline_score: Option<f64>,
    pub failure: Option<RunFailure>,
}

impl EvolutionRun {
    fn start() -> Self {
        let now = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("evo-{}-{}", now.format("%Y%m%d%H%M%S"), &suffix[..8]),
            state: RunState::Collecting,
            started_at: now,
            updated_at: now,
            dataset_ref: None,
            record_count: None,
            adapter_ref: None,
            candidate_model_ref: None,
            artifact_ref: None,
            eval_score: None,
            baseline_score: None,
            failure: None,
        }
    }

    /// Deterministic so a restarted process can find the candidate
    pub fn candidate_id(&self) -> String {
        format!("{}-candidate", self.id)
    }
}

pub struct EvolutionPipeline {
    store: Arc<Store>,
    models: Arc<ModelRegistry>,
    trainer: Arc<dyn Trainer>,
    datasets: DatasetBuilder,
    policy: Arc<PolicyStore>,
    /// Pipeline lock; holds the open run, if any
    current: Mutex<Option<EvolutionRun>>,
}

impl EvolutionPipeline {
    pub fn new(
        store: Arc<Store>,
        models: Arc<ModelRegistry>,
        trainer: Arc<dyn Trainer>,
        data_dir: impl Into<PathBuf>,
        policy: Arc<PolicyStore>,
    ) -> Self {
        let datasets = DatasetBuilder::new(store.clone(), data_dir.into().join("datasets"));
        Self {
            store,
            models,
            trainer,
            datasets,
            policy,
            current: Mutex::new(None),
        }
    }

    /// Latest run, open or not
    pub fn latest(&self) -> Result<Option<EvolutionRun>, StoreError> {
        Ok(self.store.recent_runs(1)?.into_iter().next())
    }

    /// Open a new run in `collecting`
    pub async fn begin(&self) -> Result<EvolutionRun, EvolutionError> {
        let mut current = self
            .current
            .try_lock()
            .map_err(|_| EvolutionError::AlreadyRunning("a stage is in progress".into()))?;
        if let Some(run) = current.as_ref().filter(|r| !r.state.is_terminal()) {
            return Err(EvolutionError::AlreadyRunning(run.id.clone()));
        }
        if let Some(open) = self.store.open_runs()?.into_iter().next() {
            return Err(EvolutionError::AlreadyRunning(open.id));
        }

        let run = EvolutionRun::start();
        self.store.save_run(&run)?;
        info!(run_id = %run.id, "Evolution run started");
        *current = Some(run.clone());
        Ok(run)
    }

    /// Execute the open run's current stage and move to the next state
    pub async fn advance(&self) -> Result<EvolutionRun, EvolutionError> {
        let mut current = self
            .current
            .try_lock()
            .map_err(|_| EvolutionError::AlreadyRunning("a stage is in progress".into()))?;
        let run = current
            .as_mut()
            .filter(|r| !r.state.is_terminal())
            .ok_or(EvolutionError::NoActiveRun)?;

        match self.step(run).await {
            Ok(next) => {
                if next != run.state {
                    self.transition(run, next)?;
                }
            }
            Err(failure) => self.fail(run, failure)?,
        }
        Ok(run.clone())
    }

    /// Begin a run and drive it to a terminal state
    pub async fn run_cycle(&self) -> Result<EvolutionRun, EvolutionError> {
        self.begin().await?;
        self.drive().await
    }

    /// Drive a recovered run to completion. `NoActiveRun` if there is none.
    pub async fn resume(&self) -> Result<EvolutionRun, EvolutionError> {
        self.drive().await
    }

    async fn drive(&self) -> Result<EvolutionRun, EvolutionError> {
        loop {
            let run = self.advance().await?;
            if run.state.is_terminal() {
                return Ok(run);
            }
        }
    }

    /// Reconcile runs left open by a previous process. Returns the runs touched.
    pub async fn recover(&self) -> Result<Vec<EvolutionRun>, EvolutionError> {
        let mut current = self.current.lock().await;
        let mut touched = Vec::new();

        for mut run in self.store.open_runs()? {
            let resumable = matches!(
                run.state,
                RunState::Collecting | RunState::Filtering | RunState::Evaluating | RunState::Deploying
            );
            if run.state == RunState::Deploying {
                // The flip is one transaction: either it happened or it did not
                if self.models.active().id == run.candidate_id() {
                    info!(run_id = %run.id, "Recovered run had already deployed");
                    self.transition(&mut run, RunState::Deployed)?;
                    touched.push(run);
                    continue;
                }
            }

            let open_elsewhere = current.as_ref().map(|r| !r.state.is_terminal()).unwrap_or(false);
            if resumable && !open_elsewhere {
                info!(run_id = %run.id, state = run.state.as_str(), "Resuming evolution run");
                *current = Some(run.clone());
            } else {
                warn!(run_id = %run.id, state = run.state.as_str(), "Evolution run interrupted");
                let stage = run.state.as_str().to_string();
                self.fail(&mut run, RunFailure::Interrupted { stage })?;
            }
            touched.push(run);
        }
        Ok(touched)
    }

    fn transition(&self, run: &mut EvolutionRun, next: RunState) -> Result<(), StoreError> {
        let from = run.state;
        run.state = next;
        run.updated_at = Utc::now();
        self.store.save_run(run)?;
        info!(run_id = %run.id, from = from.as_str(), to = next.as_str(), "Evolution transition");
        Ok(())
    }

    /// Terminal failure. The active model is never touched; an inactive candidate is discarded.
    fn fail(&self, run: &mut EvolutionRun, failure: RunFailure) -> Result<(), StoreError> {
        let state = match failure {
            RunFailure::EvaluationRegression { .. } => RunState::RolledBack,
            _ => RunState::Failed,
        };
        if let Some(candidate) = run.candidate_model_ref.clone() {
            if self.models.active().id != candidate {
                if let Err(e) = self.models.discard(&candidate) {
                    warn!(run_id = %run.id, "Could not discard candidate {}: {}", candidate, e);
                }
            }
        }
        match &failure {
            RunFailure::Infrastructure { .. } => error!(run_id = %run.id, "Evolution run failed: {}", failure),
            _ => info!(run_id = %run.id, kind = failure.kind(), "Evolution run ended: {}", failure),
        }
        run.failure = Some(failure);
        self.transition(run, state)
    }

    /// Work of the current stage; returns the next state
    async fn step(&self, run: &mut EvolutionRun) -> Result<RunState, RunFailure> {
        let policy = self.policy.current();
        let evo = &policy.evolution;
        let timeout = evo.stage_timeout();
        let infra = |stage: &str, reason: String| RunFailure::Infrastructure {
            stage: stage.to_string(),
            reason,
        };

        match run.state {
            RunState::Collecting => {
                let (path, count) = self
                    .datasets
                    .collect(&run.id)
                    .map_err(|e| infra("collecting", e.to_string()))?;
                run.dataset_ref = Some(path.display().to_string());
                run.record_count = Some(count);
                Ok(RunState::Filtering)
            }

            RunState::Filtering => {
                let raw = self.datasets.raw_path(&run.id);
                let (path, count) = self
                    .datasets
                    .filter(&run.id, &raw, evo)
                    .map_err(|e| infra("filtering", e.to_string()))?;
                run.dataset_ref = Some(path.display().to_string());
                run.record_count = Some(count);
                if count < evo.min_dataset_size {
                    return Err(RunFailure::InsufficientData {
                        found: count,
                        required: evo.min_dataset_size,
                    });
                }
                Ok(RunState::Training)
            }

            RunState::Training => {
                let dataset = run
                    .dataset_ref
                    .clone()
                    .ok_or_else(|| infra("training", "run has no dataset".into()))?;
                let parent = self.models.active();
                let candidate = run.candidate_id();
                self.models
                    .register_candidate(&candidate, &parent.id)
                    .map_err(|e| infra("training", e.to_string()))?;
                run.candidate_model_ref = Some(candidate);
                // Persist the ref before training so recovery can discard the candidate
                self.store.save_run(run).map_err(|e| infra("training", e.to_string()))?;

                let adapter = with_timeout(timeout, self.trainer.train(&dataset))
                    .await
                    .map_err(|e| infra("training", e.to_string()))?;
                run.adapter_ref = Some(adapter);
                Ok(RunState::Merging)
            }

            RunState::Merging => {
                let (Some(adapter), Some(candidate)) = (run.adapter_ref.clone(), run.candidate_model_ref.clone()) else {
                    return Err(infra("merging", "run has no adapter".into()));
                };
                let base = self.models.active();
                let artifact = with_timeout(timeout, self.trainer.merge(base.model_ref(), &adapter))
                    .await
                    .map_err(|e| infra("merging", e.to_string()))?;
                self.models
                    .set_artifact(&candidate, &artifact)
                    .map_err(|e| infra("merging", e.to_string()))?;
                run.artifact_ref = Some(artifact);
                Ok(RunState::Evaluating)
            }

            RunState::Evaluating => {
                let (Some(artifact), Some(candidate)) = (run.artifact_ref.clone(), run.candidate_model_ref.clone()) else {
                    return Err(infra("evaluating", "run has no artifact".into()));
                };
                let active = self.models.active();
                let baseline = match active.score {
                    Some(score) => score,
                    None => {
                        let score = with_timeout(timeout, self.trainer.evaluate(active.model_ref()))
                            .await
                            .map_err(|e| infra("evaluating", format!("baseline: {}", e)))?;
                        if let Err(e) = self.models.set_score(&active.id, score) {
                            warn!("Could not record baseline score: {}", e);
                        }
                        score
                    }
                };
                let score = with_timeout(timeout, self.trainer.evaluate(&artifact))
                    .await
                    .map_err(|e| infra("evaluating", e.to_string()))?;
                self.models
                    .set_score(&candidate, score)
                    .map_err(|e| infra("evaluating", e.to_string()))?;
                run.eval_score = Some(score);
                run.baseline_score = Some(baseline);

                if score >= baseline - evo.tolerance {
                    Ok(RunState::Deploying)
                } else {
                    Err(RunFailure::EvaluationRegression {
                        candidate: score,
                        baseline,
                        tolerance: evo.tolerance,
                    })
                }
            }

            RunState::Deploying => {
                let candidate = run
                    .candidate_model_ref
                    .clone()
                    .ok_or_else(|| infra("deploying", "run has no candidate".into()))?;
                self.models
                    .activate(&candidate)
                    .map_err(|e| infra("deploying", e.to_string()))?;
                info!(run_id = %run.id, version = %candidate, "Deployed evolved model");
                Ok(RunState::Deployed)
            }

            terminal => Ok(terminal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::dataset::InteractionRecord;
    use crate::policy::{PolicyConfig, RoutePath};
    use crate::testing::ScriptedTrainer;

    struct Fixture {
        store: Arc<Store>,
        models: Arc<ModelRegistry>,
        trainer: Arc<ScriptedTrainer>,
        policy: Arc<PolicyStore>,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(min_dataset_size: usize, records: usize, trainer: ScriptedTrainer) -> Self {
            let store = Arc::new(Store::open_in_memory().unwrap());
            for i in 0..records {
                store
                    .save_interaction(&InteractionRecord::new(
                        &format!("question number {}", i),
                        "a helpful and complete answer",
                        RoutePath::Local,
                    ))
                    .unwrap();
            }
            let mut config = PolicyConfig::default();
            config.evolution.min_dataset_size = min_dataset_size;
            Self {
                models: Arc::new(ModelRegistry::open(store.clone(), "base-model").unwrap()),
                store,
                trainer: Arc::new(trainer),
                policy: Arc::new(PolicyStore::new(config).unwrap()),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn pipeline(&self) -> EvolutionPipeline {
            EvolutionPipeline::new(
                self.store.clone(),
                self.models.clone(),
                self.trainer.clone(),
                self.dir.path(),
                self.policy.clone(),
            )
        }
    }

    #[tokio::test]
    async fn test_insufficient_data_never_trains() {
        let fx = Fixture::new(100, 40, ScriptedTrainer::new());
        let run = fx.pipeline().run_cycle().await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.failure, Some(RunFailure::InsufficientData { found: 40, required: 100 }));
        assert_eq!(fx.trainer.trains(), 0);
    }

    #[tokio::test]
    async fn test_passing_candidate_is_deployed() {
        let trainer = ScriptedTrainer::new().with_score("base-model", 0.80).with_score("candidate", 0.79);
        let fx = Fixture::new(5, 10, trainer);
        let run = fx.pipeline().run_cycle().await.unwrap();
        assert_eq!(run.state, RunState::Deployed);
        assert_eq!(fx.models.active().id, run.candidate_id());
        assert_eq!(fx.models.active_ref(), "base-model+adapter-1");
        assert_eq!(run.baseline_score, Some(0.80));
    }

    #[tokio::test]
    async fn test_regression_rolls_back() {
        let trainer = ScriptedTrainer::new().with_score("base-model", 0.80).with_score("candidate", 0.70);
        let fx = Fixture::new(5, 10, trainer);
        let run = fx.pipeline().run_cycle().await.unwrap();
        assert_eq!(run.state, RunState::RolledBack);
        assert_eq!(fx.models.active().id, "base");
        let candidate = fx.models.get(&run.candidate_id()).unwrap().unwrap();
        assert!(candidate.discarded);
        assert!(!candidate.active);
    }

    #[tokio::test]
    async fn test_training_failure_leaves_active_untouched() {
        let trainer = ScriptedTrainer::new().with_train_error(crate::error::CollabError::Unavailable("gpu busy".into()));
        let fx = Fixture::new(5, 10, trainer);
        let run = fx.pipeline().run_cycle().await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.failure.as_ref().map(|f| f.kind()), Some("infrastructure"));
        assert_eq!(fx.models.active().id, "base");
    }

    #[tokio::test]
    async fn test_single_flight() {
        let fx = Fixture::new(5, 10, ScriptedTrainer::new());
        let pipeline = fx.pipeline();
        pipeline.begin().await.unwrap();
        assert!(matches!(pipeline.begin().await, Err(EvolutionError::AlreadyRunning(_))));

        // A second pipeline over the same store sees the open run too
        assert!(matches!(fx.pipeline().begin().await, Err(EvolutionError::AlreadyRunning(_))));
    }

    #[tokio::test]
    async fn test_recover_fails_ambiguous_stage() {
        let trainer = ScriptedTrainer::new().with_score("base-model", 0.5).with_score("candidate", 0.9);
        let fx = Fixture::new(5, 10, trainer);
        let first = fx.pipeline();
        first.begin().await.unwrap();
        first.advance().await.unwrap(); // -> filtering
        let run = first.advance().await.unwrap(); // -> training
        assert_eq!(run.state, RunState::Training);
        drop(first);

        let restarted = fx.pipeline();
        let touched = restarted.recover().await.unwrap();
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].state, RunState::Failed);
        assert!(matches!(restarted.resume().await, Err(EvolutionError::NoActiveRun)));
        assert!(fx.store.open_runs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_training_timeout_fails_run() {
        let trainer = ScriptedTrainer::new().with_delay(std::time::Duration::from_secs(3));
        let mut fx = Fixture::new(5, 10, trainer);
        let mut config = PolicyConfig::default();
        config.evolution.min_dataset_size = 5;
        config.evolution.stage_timeout_secs = 1;
        fx.policy = Arc::new(PolicyStore::new(config).unwrap());

        let run = fx.pipeline().run_cycle().await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.failure.as_ref().map(|f| f.kind()), Some("infrastructure"));
        assert!(run.failure.as_ref().unwrap().to_string().contains("timed out"));
        assert_eq!(fx.models.active().id, "base");
        assert!(fx.models.get(&run.candidate_id()).unwrap().unwrap().discarded);
        assert_eq!(fx.trainer.merges(), 0);
    }

    #[tokio::test]
    async fn test_crash_during_training_discards_candidate_on_recovery() {
        let trainer = ScriptedTrainer::new().with_delay(std::time::Duration::from_secs(30));
        let fx = Fixture::new(5, 10, trainer);
        let first = fx.pipeline();
        let run = first.begin().await.unwrap();
        first.advance().await.unwrap(); // -> filtering
        first.advance().await.unwrap(); // -> training

        // The process dies while the trainer is busy
        let interrupted = tokio::time::timeout(std::time::Duration::from_millis(100), first.advance()).await;
        assert!(interrupted.is_err());
        drop(first);

        let stored = fx.store.open_runs().unwrap();
        assert_eq!(stored[0].candidate_model_ref, Some(run.candidate_id()));

        let restarted = fx.pipeline();
        let touched = restarted.recover().await.unwrap();
        assert_eq!(touched[0].state, RunState::Failed);
        let candidate = fx.models.get(&run.candidate_id()).unwrap().unwrap();
        assert!(candidate.discarded);
        assert_eq!(fx.models.active().id, "base");
    }
}

//! Runtime wiring
//!
//! Builds every component over one store and one policy, recovers state left
//! by a previous process, and owns the background loops.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agent::{ExecutionLoop, GoalPlanner, GoalSupervisor, ReflectionEngine};
use crate::autonomous::jobs::{self, EvolutionTask, GoalTask, HealthCheckTask, MemoryMaintenanceTask};
use crate::autonomous::{install_builtin_jobs, ScheduledJob, Scheduler};
use crate::collab::{
    CommandTrainer, Gateway, Inference, Memory, OllamaConfig, OllamaInference, ShellGateway, SqliteMemory, Trainer,
};
use crate::config::Config;
use crate::error::{ConfigError, EvolutionError};
use crate::evolution::{EvolutionPipeline, EvolutionRun, InteractionLog, ModelRegistry};
use crate::policy::PolicyStore;
use crate::router::{ExternalProvider, RouterStats, SmartRouter};
use crate::store::Store;

/// Collaborators the runtime talks to
pub struct Collaborators {
    pub inference: Arc<dyn Inference>,
    pub external: Option<ExternalProvider>,
    pub memory: Arc<dyn Memory>,
    pub gateway: Arc<dyn Gateway>,
    pub trainer: Arc<dyn Trainer>,
}

/// Snapshot for the `status` command
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub policy_generation: u64,
    pub autonomy_level: &'static str,
    pub active_model: String,
    pub active_model_version: String,
    pub active_goals: usize,
    pub router: RouterStats,
    pub jobs: Vec<ScheduledJob>,
    pub latest_evolution_run: Option<EvolutionRun>,
}

pub struct Runtime {
    pub policy: Arc<PolicyStore>,
    pub store: Arc<Store>,
    pub models: Arc<ModelRegistry>,
    pub interactions: Arc<InteractionLog>,
    pub router: Arc<SmartRouter>,
    pub supervisor: Arc<GoalSupervisor>,
    pub scheduler: Arc<Scheduler>,
    pub evolution: Arc<EvolutionPipeline>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Build adapters from process configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let policy = Arc::new(PolicyStore::load(&config.policy_path).context("loading policy")?);
        let store = Arc::new(Store::open(&config.db_path).context("opening store")?);

        let inference: Arc<dyn Inference> = Arc::new(OllamaInference::new(OllamaConfig {
            url: config.ollama_url.clone(),
            ..Default::default()
        })?);
        let external = match &config.external_url {
            Some(url) => Some(ExternalProvider {
                inference: Arc::new(OllamaInference::new(OllamaConfig {
                    url: url.clone(),
                    ..Default::default()
                })?),
                model: config.external_model.clone(),
                daily_limit: config.external_daily_limit,
            }),
            None => None,
        };
        let collaborators = Collaborators {
            inference,
            external,
            memory: Arc::new(SqliteMemory::new(store.clone())),
            gateway: Arc::new(ShellGateway::new(config.workdir.clone()).with_auto_approve(config.auto_approve)),
            trainer: Arc::new(CommandTrainer {
                train_cmd: config.train_cmd.clone(),
                merge_cmd: config.merge_cmd.clone(),
                eval_cmd: config.eval_cmd.clone(),
                timeout: None,
            }),
        };

        Self::build(policy, store, config.data_dir.clone(), &config.model, collaborators)
    }

    /// Wire every component. Nothing runs until [`Runtime::start`].
    pub fn build(
        policy: Arc<PolicyStore>,
        store: Arc<Store>,
        data_dir: PathBuf,
        base_model: &str,
        collab: Collaborators,
    ) -> Result<Self> {
        let models = Arc::new(ModelRegistry::open(store.clone(), base_model).context("opening model registry")?);
        let interactions = Arc::new(InteractionLog::new(store.clone()));

        let mut router = SmartRouter::new(
            policy.clone(),
            collab.inference.clone(),
            models.clone(),
            collab.memory.clone(),
            interactions.clone(),
        );
        if let Some(external) = collab.external {
            router = router.with_external(external);
        }

        let planner = Arc::new(GoalPlanner::new(collab.inference.clone(), models.clone(), policy.clone()));
        let executor = Arc::new(ExecutionLoop::new(
            planner,
            collab.gateway.clone(),
            collab.inference.clone(),
            models.clone(),
            policy.clone(),
        ));
        let reflection = Arc::new(ReflectionEngine::new(
            collab.inference.clone(),
            models.clone(),
            collab.memory.clone(),
            store.clone(),
            policy.clone(),
        ));
        let supervisor = GoalSupervisor::start(executor, reflection, store.clone(), policy.clone());

        let evolution = Arc::new(EvolutionPipeline::new(
            store.clone(),
            models.clone(),
            collab.trainer.clone(),
            data_dir,
            policy.clone(),
        ));

        let scheduler = Scheduler::new(store.clone(), policy.clone(), Utc::now()).context("loading scheduled jobs")?;
        scheduler.register_task(
            jobs::HEALTH_CHECK,
            Arc::new(HealthCheckTask::new(collab.inference.clone(), store.clone())),
        );
        scheduler.register_task(jobs::MEMORY_MAINTENANCE, Arc::new(MemoryMaintenanceTask::new(collab.memory)));
        scheduler.register_task(jobs::EVOLUTION_CYCLE, Arc::new(EvolutionTask::new(evolution.clone())));
        scheduler.register_task(jobs::GOAL, Arc::new(GoalTask::new(supervisor.clone())));
        install_builtin_jobs(&scheduler, &policy.current().scheduler, Utc::now())?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            policy,
            store,
            models,
            interactions,
            router: Arc::new(router),
            supervisor,
            scheduler,
            evolution,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Recover interrupted evolution runs and start the scheduler loop
    pub async fn start(&self) -> Result<()> {
        let recovered = self.evolution.recover().await.context("recovering evolution runs")?;
        if recovered.iter().any(|r| !r.state.is_terminal()) {
            let pipeline = self.evolution.clone();
            self.tasks.lock().push(tokio::spawn(async move {
                match pipeline.resume().await {
                    Ok(run) => info!(run_id = %run.id, state = run.state.as_str(), "Recovered evolution run finished"),
                    Err(EvolutionError::NoActiveRun) => {}
                    Err(e) => error!("Recovered evolution run could not continue: {}", e),
                }
            }));
        }

        let scheduler = self.scheduler.clone();
        let shutdown = self.shutdown.subscribe();
        self.tasks.lock().push(tokio::spawn(scheduler.run(shutdown)));
        info!(
            model = %self.models.active_ref(),
            generation = self.policy.current().generation,
            "Runtime started"
        );
        Ok(())
    }

    /// Re-read the policy file; the scheduler's built-in jobs follow the new generation
    pub fn reload_policy(&self) -> Result<u64, ConfigError> {
        let generation = self.policy.reload()?;
        if let Err(e) = install_builtin_jobs(&self.scheduler, &self.policy.current().scheduler, Utc::now()) {
            warn!("Built-in jobs not updated after reload: {:#}", e);
        }
        Ok(generation)
    }

    pub fn status(&self) -> RuntimeStatus {
        let policy = self.policy.current();
        let active = self.models.active();
        RuntimeStatus {
            policy_generation: policy.generation,
            autonomy_level: policy.autonomy_level.as_str(),
            active_model: active.model_ref().to_string(),
            active_model_version: active.id.clone(),
            active_goals: self.supervisor.active_goals().len(),
            router: self.router.stats(),
            jobs: self.scheduler.jobs(),
            latest_evolution_run: self.evolution.latest().unwrap_or_else(|e| {
                warn!("Could not load latest evolution run: {}", e);
                None
            }),
        }
    }

    /// Stop the scheduler and abort running goals. Waits up to `grace` for background tasks.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.send_replace(true);
        let aborted = self.supervisor.abort_all();
        if aborted > 0 {
            info!(aborted, "Aborted goals for shutdown");
        }

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let join = futures_util::future::join_all(tasks);
        if tokio::time::timeout(grace, join).await.is_err() {
            warn!("Background tasks still running after {:?}", grace);
        }
        info!("Runtime stopped");
    }
}

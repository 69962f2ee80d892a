//! Built-in scheduled tasks
//!
//! - `health_check`: inference readiness plus a store probe
//! - `memory_maintenance`: memory consolidation
//! - `evolution_cycle`: one self-evolution run; skipped if one is already in flight
//! - `goal`: submits the job payload as a goal (dynamic jobs)

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::scheduler::{JobOutcome, JobTask, MisfirePolicy, Schedule, ScheduledJob, Scheduler};
use crate::agent::goal::GoalOutcome;
use crate::agent::supervisor::GoalSupervisor;
use crate::collab::{Inference, Memory};
use crate::error::EvolutionError;
use crate::evolution::pipeline::EvolutionPipeline;
use crate::policy::SchedulerPolicy;
use crate::store::Store;

pub const HEALTH_CHECK: &str = "health_check";
pub const MEMORY_MAINTENANCE: &str = "memory_maintenance";
pub const EVOLUTION_CYCLE: &str = "evolution_cycle";
pub const GOAL: &str = "goal";

pub struct HealthCheckTask {
    inference: Arc<dyn Inference>,
    store: Arc<Store>,
}

impl HealthCheckTask {
    pub fn new(inference: Arc<dyn Inference>, store: Arc<Store>) -> Self {
        Self { inference, store }
    }
}

#[async_trait]
impl JobTask for HealthCheckTask {
    async fn run(&self, _job: &ScheduledJob) -> Result<JobOutcome> {
        self.store.ping().context("store probe failed")?;
        tokio::time::timeout(Duration::from_secs(30), self.inference.health())
            .await
            .map_err(|_| anyhow!("inference health check timed out"))?
            .context("inference unhealthy")?;
        Ok(JobOutcome::Completed("inference and store healthy".into()))
    }
}

pub struct MemoryMaintenanceTask {
    memory: Arc<dyn Memory>,
}

impl MemoryMaintenanceTask {
    pub fn new(memory: Arc<dyn Memory>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl JobTask for MemoryMaintenanceTask {
    async fn run(&self, _job: &ScheduledJob) -> Result<JobOutcome> {
        let touched = self.memory.maintain().await.context("memory maintenance")?;
        Ok(JobOutcome::Completed(format!("{} records consolidated", touched)))
    }
}

pub struct EvolutionTask {
    pipeline: Arc<EvolutionPipeline>,
}

impl EvolutionTask {
    pub fn new(pipeline: Arc<EvolutionPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobTask for EvolutionTask {
    async fn run(&self, _job: &ScheduledJob) -> Result<JobOutcome> {
        match self.pipeline.run_cycle().await {
            Ok(run) => {
                let summary = match &run.failure {
                    Some(failure) => format!("run {} {} ({})", run.id, run.state.as_str(), failure),
                    None => format!("run {} {}", run.id, run.state.as_str()),
                };
                Ok(JobOutcome::Completed(summary))
            }
            Err(EvolutionError::AlreadyRunning(id)) => {
                Ok(JobOutcome::Skipped(format!("evolution run {} already in progress", id)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Submits `job.payload` as a goal and waits for it
pub struct GoalTask {
    supervisor: Arc<GoalSupervisor>,
}

impl GoalTask {
    pub fn new(supervisor: Arc<GoalSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl JobTask for GoalTask {
    async fn run(&self, job: &ScheduledJob) -> Result<JobOutcome> {
        let Some(description) = job.payload.as_deref().filter(|p| !p.trim().is_empty()) else {
            bail!("job {} has no goal payload", job.name);
        };
        let handle = self.supervisor.submit(description)?;
        info!(job = %job.name, goal_id = %handle.goal_id, "Submitted scheduled goal");
        let report = handle
            .wait()
            .await
            .ok_or_else(|| anyhow!("goal supervisor stopped before the goal finished"))?;
        match report.outcome {
            GoalOutcome::Done => Ok(JobOutcome::Completed(format!(
                "goal {} done in {} iterations",
                report.goal.id, report.iterations
            ))),
            other => bail!("goal {} {}", report.goal.id, other.describe()),
        }
    }
}

/// Create, update or remove the built-in jobs to match the policy
pub fn install_builtin_jobs(scheduler: &Scheduler, policy: &SchedulerPolicy, now: DateTime<Utc>) -> Result<()> {
    let hours = |h: u64| Schedule::every(Duration::from_secs(h * 3600));

    let evolution_schedule = match &policy.evolution_cron {
        Some(expr) => Schedule::cron(expr)?,
        None => hours(policy.evolution_hours),
    };

    let builtins = [
        (HEALTH_CHECK, policy.health_check_enabled, hours(policy.health_check_hours), MisfirePolicy::Skip),
        (
            MEMORY_MAINTENANCE,
            policy.memory_maintenance_enabled,
            hours(policy.memory_maintenance_hours),
            MisfirePolicy::RunOnce,
        ),
        (EVOLUTION_CYCLE, policy.evolution_enabled, evolution_schedule, MisfirePolicy::Skip),
    ];

    for (name, enabled, schedule, misfire) in builtins {
        if enabled {
            scheduler.ensure_job(ScheduledJob::new(name, name, schedule, misfire, now), now)?;
        } else if scheduler.remove_job(name)? {
            info!(job = name, "Built-in job disabled by policy");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyConfig, PolicyStore};

    fn scheduler() -> Arc<Scheduler> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let policy = Arc::new(PolicyStore::new(PolicyConfig::default()).unwrap());
        Scheduler::new(store, policy, Utc::now()).unwrap()
    }

    #[test]
    fn test_install_builtin_jobs() {
        let sched = scheduler();
        let now = Utc::now();
        let mut policy = SchedulerPolicy::default();
        install_builtin_jobs(&sched, &policy, now).unwrap();
        let names: Vec<_> = sched.jobs().into_iter().map(|j| j.name).collect();
        assert_eq!(names, vec![EVOLUTION_CYCLE, HEALTH_CHECK, MEMORY_MAINTENANCE]);

        policy.evolution_enabled = false;
        policy.health_check_hours = 1;
        install_builtin_jobs(&sched, &policy, now).unwrap();
        assert!(sched.job(EVOLUTION_CYCLE).is_none());
        assert_eq!(
            sched.job(HEALTH_CHECK).unwrap().schedule,
            Schedule::Interval { secs: 3600 }
        );
    }

    #[test]
    fn test_evolution_cron_overrides_hours() {
        let sched = scheduler();
        let policy = SchedulerPolicy {
            evolution_cron: Some("0 3 * * 0".into()),
            ..Default::default()
        };
        install_builtin_jobs(&sched, &policy, Utc::now()).unwrap();
        assert!(matches!(sched.job(EVOLUTION_CYCLE).unwrap().schedule, Schedule::Cron { .. }));
    }
}

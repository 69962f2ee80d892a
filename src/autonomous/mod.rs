//! Proactive Behavior
//!
//! The scheduler fires persisted jobs on their own clock, independent of
//! any request:
//! - Health checks of the inference backend and store
//! - Memory maintenance
//! - Self-evolution cycles
//! - User-defined goals on a cron schedule

pub mod jobs;
pub mod scheduler;

pub use jobs::{install_builtin_jobs, EvolutionTask, GoalTask, HealthCheckTask, MemoryMaintenanceTask};
pub use scheduler::{JobOutcome, JobStatus, JobTask, MisfirePolicy, Schedule, ScheduledJob, Scheduler, TickReport};

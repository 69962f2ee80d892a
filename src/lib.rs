//! SOVRA Agent Runtime
//!
//! Decision and self-improvement control plane for a local-first personal agent.
//!
//! # Features
//!
//! - **Smart Router**: ordered policy rules pick local, memory-augmented or external handling
//! - **Credential Redaction**: stable placeholders before anything is logged or forwarded
//! - **Goal Execution**: planned step graphs run through a ReAct loop under an autonomy policy
//! - **Reflection**: every finished goal is distilled into lessons
//! - **Proactive Scheduler**: persisted cron and interval jobs with misfire policies
//! - **Self-Evolution**: crash-safe retraining pipeline with evaluation-gated deploys
//!
//! # Architecture
//!
//! ```text
//! request ──► Router ──► local / rag_local / external
//!               │
//! goal ─────► Supervisor ──► Planner ──► Execution Loop ──► Reflection ──► lessons
//!                                                                             │
//! Scheduler ──► health / maintenance / evolution ──► Evolution Pipeline ◄────┘
//!                                                          │
//!                                                   active ModelVersion
//! ```

pub mod agent;
pub mod autonomous;
pub mod collab;
pub mod config;
pub mod error;
pub mod evolution;
pub mod policy;
pub mod redact;
pub mod router;
pub mod runtime;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use agent::{Goal, GoalHandle, GoalOutcome, GoalReport, GoalSupervisor, Lesson, Plan, Step};
pub use autonomous::{MisfirePolicy, Schedule, ScheduledJob, Scheduler};
pub use config::Config;
pub use error::{CollabError, ConfigError, GoalFailure, PlanningError, RunFailure, StoreError};
pub use evolution::{EvolutionPipeline, EvolutionRun, ModelRegistry, ModelVersion, RunState};
pub use policy::{AutonomyLevel, PolicyConfig, PolicyStore, RoutePath, TaskType};
pub use redact::Redactor;
pub use router::{Request, RouterDecision, SmartRouter};
pub use runtime::{Collaborators, Runtime, RuntimeStatus};
pub use store::Store;

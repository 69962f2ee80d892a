//! Self-evolution
//!
//! Interaction logs and lessons flow into a training dataset, the trainer
//! produces a candidate model, and the candidate replaces the active model
//! only if it evaluates no worse than the baseline.

pub mod dataset;
pub mod models;
pub mod pipeline;

pub use dataset::{DatasetBuilder, InteractionLog, InteractionRecord, QualityStats, TrainingExample};
pub use models::{ModelRegistry, ModelVersion};
pub use pipeline::{EvolutionPipeline, EvolutionRun, RunState};

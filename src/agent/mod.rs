//! Goal Agent
//!
//! Everything between "the user wants X" and "here is what happened":
//! - Planning into a validated step graph
//! - ReAct execution under the autonomy policy
//! - Reflection into lessons
//! - Admission and abort through the supervisor
//!
//! Observe -> Decide -> Act -> Reflect -> Learn

pub mod execution;
pub mod goal;
pub mod planner;
pub mod recovery;
pub mod reflection;
pub mod supervisor;

pub use execution::{ExecutionLoop, GoalRun};
pub use goal::{
    ExecutionTrace, Goal, GoalOutcome, GoalStatus, Lesson, LessonCategory, Plan, Step, StepStatus, TraceEntry,
    TraceOutcome,
};
pub use planner::GoalPlanner;
pub use recovery::{CircuitBreaker, CircuitState, ErrorClass, RetryPolicy};
pub use reflection::ReflectionEngine;
pub use supervisor::{GoalHandle, GoalReport, GoalSupervisor};

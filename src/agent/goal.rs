//! Goal, Plan and Trace state
//!
//! Explicit state machines for goals and steps:
//!
//! ```text
//! Goal: pending -> planning -> executing -> reflecting -> {done, failed, aborted}
//! Step: pending -> running -> {succeeded, failed}   (+ skipped, aborted)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{GoalFailure, PlanningError};

/// Goal lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    Pending,
    Planning,
    Executing,
    Reflecting,
    Done,
    Failed,
    Aborted,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Reflecting => "reflecting",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Aborted)
    }
}

/// How a goal's execution ended
#[derive(Debug, Clone, PartialEq)]
pub enum GoalOutcome {
    Done,
    Failed(GoalFailure),
    Aborted,
}

impl GoalOutcome {
    pub fn status(&self) -> GoalStatus {
        match self {
            Self::Done => GoalStatus::Done,
            Self::Failed(_) => GoalStatus::Failed,
            Self::Aborted => GoalStatus::Aborted,
        }
    }

    /// Human-readable reason for reports
    pub fn describe(&self) -> String {
        match self {
            Self::Done => "completed".to_string(),
            Self::Failed(f) => format!("failed ({}): {}", f.kind(), f),
            Self::Aborted => "aborted".to_string(),
        }
    }
}

/// A user goal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub status: GoalStatus,
    pub failure: Option<String>,
}

impl Goal {
    pub fn new(description: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.trim().to_string(),
            created_at: Utc::now(),
            status: GoalStatus::Pending,
            failure: None,
        }
    }
}

/// Step lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Aborted,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Aborted => "aborted",
        }
    }
}

/// Skill handled by the inference backend instead of the gateway
pub const THINK_SKILL: &str = "think";

/// One unit of work in a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    /// Skill to invoke (`shell`, `think`, ...)
    pub action: String,
    /// What the step is meant to achieve
    pub description: String,
    pub args: serde_json::Value,
    pub depends_on: Vec<String>,
    pub status: StepStatus,
    /// Present in the user's original instruction (vs. inferred by the planner)
    pub instructed: bool,
    pub attempts: usize,
    /// Human approved this step already
    #[serde(default)]
    pub confirmed: bool,
}

impl Step {
    pub fn new(id: &str, action: &str, description: &str, args: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            action: action.to_string(),
            description: description.to_string(),
            args,
            depends_on: Vec::new(),
            status: StepStatus::Pending,
            instructed: false,
            attempts: 0,
            confirmed: false,
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn instructed(mut self, instructed: bool) -> Self {
        self.instructed = instructed;
        self
    }

    /// The command line, if the step carries one
    pub fn command(&self) -> Option<&str> {
        self.args.get("command").and_then(|c| c.as_str())
    }

    /// Text checked against the blocked command list
    pub fn action_text(&self) -> String {
        match self.command() {
            Some(cmd) => format!("{}: {}", self.action, cmd),
            None => format!("{}: {}", self.action, self.description),
        }
    }
}

/// Ordered step graph for one goal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub goal_id: String,
    pub steps: Vec<Step>,
    /// Number of times this plan was replanned
    pub revision: usize,
}

impl Plan {
    /// Build and validate a plan
    pub fn new(goal_id: &str, steps: Vec<Step>, max_steps: usize) -> Result<Self, PlanningError> {
        let plan = Self {
            goal_id: goal_id.to_string(),
            steps,
            revision: 0,
        };
        plan.validate(max_steps)?;
        Ok(plan)
    }

    /// Plan supplied verbatim by the user; every step counts as instructed
    pub fn from_template(goal_id: &str, steps: Vec<Step>, max_steps: usize) -> Result<Self, PlanningError> {
        let steps = steps.into_iter().map(|s| s.instructed(true)).collect();
        Self::new(goal_id, steps, max_steps)
    }

    /// Unique ids, known dependencies, no cycles
    pub fn validate(&self, max_steps: usize) -> Result<(), PlanningError> {
        if self.steps.is_empty() {
            return Err(PlanningError::Empty);
        }
        if self.steps.len() > max_steps {
            return Err(PlanningError::TooManySteps(self.steps.len(), max_steps));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(PlanningError::DuplicateStep(step.id.clone()));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(PlanningError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm; whatever is left over sits on a cycle
        let mut indegree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
            }
        }
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for &next in dependents.get(id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }
        if visited != self.steps.len() {
            let mut stuck: Vec<&str> = indegree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(id, _)| id)
                .collect();
            stuck.sort();
            return Err(PlanningError::Cycle(stuck.join(", ")));
        }
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// First pending step, in plan order, whose dependencies all succeeded
    pub fn next_runnable(&self) -> Option<usize> {
        self.steps.iter().position(|step| {
            step.status == StepStatus::Pending
                && step.depends_on.iter().all(|dep| {
                    self.step(dep)
                        .map(|d| d.status == StepStatus::Succeeded)
                        .unwrap_or(false)
                })
        })
    }

    /// Every step succeeded or was skipped
    pub fn is_complete(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Skipped))
    }

    /// Pending steps that were inferred rather than instructed
    pub fn inferred_pending(&self) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending && !s.instructed)
            .collect()
    }

    /// Mark every unfinished step aborted
    pub fn abort_unfinished(&mut self) {
        for step in &mut self.steps {
            if matches!(step.status, StepStatus::Pending | StepStatus::Running) {
                step.status = StepStatus::Aborted;
            }
        }
    }

    /// Mark pending steps skipped (goal ended without reaching them)
    pub fn skip_pending(&mut self) {
        for step in &mut self.steps {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Skipped;
            }
        }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.status == StepStatus::Succeeded)
    }
}

/// Outcome recorded in a trace entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceOutcome {
    Succeeded,
    Retrying,
    Failed,
    Denied,
    Replanned,
    Aborted,
    Info,
}

/// One observation in a goal's trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub step_id: Option<String>,
    pub observation: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: TraceOutcome,
}

/// Append-only record of one goal's execution; sealed once the goal is terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub goal_id: String,
    entries: Vec<TraceEntry>,
    sealed: bool,
}

impl ExecutionTrace {
    pub fn new(goal_id: &str) -> Self {
        Self {
            goal_id: goal_id.to_string(),
            entries: Vec::new(),
            sealed: false,
        }
    }

    /// Append an entry. Returns false (and drops it) once sealed.
    pub fn record(&mut self, step_id: Option<&str>, observation: impl Into<String>, outcome: TraceOutcome) -> bool {
        if self.sealed {
            tracing::warn!(goal_id = %self.goal_id, "Dropping trace entry for sealed trace");
            return false;
        }
        self.entries.push(TraceEntry {
            step_id: step_id.map(String::from),
            observation: observation.into(),
            timestamp: Utc::now(),
            outcome,
        });
        true
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Kind of lesson
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonCategory {
    /// Something that worked and should be repeated
    Success,
    /// Root cause of a failure
    Failure,
    /// Safety boundary hit
    Policy,
    /// Loop made no progress
    Stall,
    Insight,
    /// Reflection produced nothing useful
    NoActionableLesson,
}

impl LessonCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Policy => "policy",
            Self::Stall => "stall",
            Self::Insight => "insight",
            Self::NoActionableLesson => "no_actionable_lesson",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "success" => Some(Self::Success),
            "failure" | "error" => Some(Self::Failure),
            "policy" => Some(Self::Policy),
            "stall" => Some(Self::Stall),
            "insight" | "improvement" => Some(Self::Insight),
            "no_actionable_lesson" => Some(Self::NoActionableLesson),
            _ => None,
        }
    }
}

/// Reflection output; immutable once created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    pub source_goal_id: String,
    pub summary: String,
    pub category: LessonCategory,
    pub created_at: DateTime<Utc>,
}

impl Lesson {
    pub fn new(source_goal_id: &str, summary: &str, category: LessonCategory) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_goal_id: source_goal_id.to_string(),
            summary: summary.trim().to_string(),
            category,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step::new(id, "shell", id, json!({"command": format!("echo {}", id)})).after(deps)
    }

    #[test]
    fn test_cycle_rejected() {
        let err = Plan::new("g", vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])], 10).unwrap_err();
        match err {
            PlanningError::Cycle(ids) => assert_eq!(ids, "a, b, c"),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_rejected() {
        assert!(matches!(
            Plan::new("g", vec![step("a", &["a"])], 10),
            Err(PlanningError::Cycle(_))
        ));
    }

    #[test]
    fn test_unknown_and_duplicate_rejected() {
        assert!(matches!(
            Plan::new("g", vec![step("a", &["zzz"])], 10),
            Err(PlanningError::UnknownDependency { .. })
        ));
        assert!(matches!(
            Plan::new("g", vec![step("a", &[]), step("a", &[])], 10),
            Err(PlanningError::DuplicateStep(_))
        ));
        assert!(matches!(Plan::new("g", vec![], 10), Err(PlanningError::Empty)));
        assert!(matches!(
            Plan::new("g", vec![step("a", &[]), step("b", &[])], 1),
            Err(PlanningError::TooManySteps(2, 1))
        ));
    }

    #[test]
    fn test_next_runnable_respects_dependencies() {
        // b is listed first but depends on a
        let mut plan = Plan::new("g", vec![step("b", &["a"]), step("a", &[])], 10).unwrap();
        assert_eq!(plan.steps[plan.next_runnable().unwrap()].id, "a");

        plan.steps[1].status = StepStatus::Running;
        assert!(plan.next_runnable().is_none());

        plan.steps[1].status = StepStatus::Failed;
        assert!(plan.next_runnable().is_none());

        plan.steps[1].status = StepStatus::Succeeded;
        assert_eq!(plan.steps[plan.next_runnable().unwrap()].id, "b");
    }

    #[test]
    fn test_sealed_trace_is_immutable() {
        let mut trace = ExecutionTrace::new("g");
        assert!(trace.record(Some("a"), "ok", TraceOutcome::Succeeded));
        trace.seal();
        assert!(!trace.record(Some("b"), "late", TraceOutcome::Info));
        assert_eq!(trace.len(), 1);
    }

    #[test]
    fn test_template_steps_are_instructed() {
        let plan = Plan::from_template("g", vec![step("a", &[])], 10).unwrap();
        assert!(plan.steps[0].instructed);
        assert!(plan.inferred_pending().is_empty());
    }
}

//! Reflection Engine
//!
//! Turns a finished goal's trace into lessons:
//! - Successful goals are reflected on a best-effort basis and skipped
//!   when every reflection slot is busy
//! - Failed and aborted goals are always reflected; when the model has
//!   nothing useful to say a `no_actionable_lesson` record is written
//!
//! Lessons are persisted and offered to memory. Reflection never fails the
//! goal: every error degrades to a logged warning.

use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::goal::{ExecutionTrace, Goal, GoalOutcome, Lesson, LessonCategory, TraceOutcome};
use super::planner::{extract_array, extract_json, truncate};
use crate::collab::{Inference, Memory, MemoryRecord};
use crate::error::{with_timeout, CollabError, GoalFailure};
use crate::evolution::models::ModelRegistry;
use crate::policy::PolicyStore;
use crate::redact::Redactor;
use crate::store::Store;

/// Lessons derived from one trace are capped
const MAX_LESSONS: usize = 3;

pub struct ReflectionEngine {
    inference: Arc<dyn Inference>,
    models: Arc<ModelRegistry>,
    memory: Arc<dyn Memory>,
    store: Arc<Store>,
    policy: Arc<PolicyStore>,
    /// Slots for best-effort reflection of successful goals
    slots: Semaphore,
}

impl ReflectionEngine {
    pub fn new(
        inference: Arc<dyn Inference>,
        models: Arc<ModelRegistry>,
        memory: Arc<dyn Memory>,
        store: Arc<Store>,
        policy: Arc<PolicyStore>,
    ) -> Self {
        let slots = policy.current().execution.reflection_concurrency.max(1);
        Self {
            inference,
            models,
            memory,
            store,
            policy,
            slots: Semaphore::new(slots),
        }
    }

    /// Reflect on a finished goal. Returns the lessons that were recorded.
    pub async fn reflect(&self, goal: &Goal, outcome: &GoalOutcome, trace: &ExecutionTrace) -> Vec<Lesson> {
        let lessons = match outcome {
            GoalOutcome::Done => {
                let Ok(_slot) = self.slots.try_acquire() else {
                    debug!(goal_id = %goal.id, "Reflection skipped, all slots busy");
                    return Vec::new();
                };
                match self.derive(goal, outcome, trace).await {
                    Ok(lessons) => lessons,
                    Err(e) => {
                        warn!(goal_id = %goal.id, "Reflection failed: {}", e);
                        Vec::new()
                    }
                }
            }
            GoalOutcome::Failed(_) | GoalOutcome::Aborted => {
                let policy = self.policy.current();
                let redactor = &policy.redactor;
                match self.derive(goal, outcome, trace).await {
                    Ok(lessons) if !lessons.is_empty() => lessons,
                    Ok(_) => vec![no_actionable_lesson(goal, outcome, redactor)],
                    Err(e) => {
                        warn!(goal_id = %goal.id, "Reflection failed, recording fallback lesson: {}", e);
                        vec![no_actionable_lesson(goal, outcome, redactor)]
                    }
                }
            }
        };

        for lesson in &lessons {
            self.persist(lesson).await;
        }
        if !lessons.is_empty() {
            info!(goal_id = %goal.id, count = lessons.len(), "Recorded lessons");
        }
        lessons
    }

    async fn derive(&self, goal: &Goal, outcome: &GoalOutcome, trace: &ExecutionTrace) -> Result<Vec<Lesson>, CollabError> {
        let policy = self.policy.current();
        let prompt = format!(
            r#"Review how an autonomous agent handled a goal and extract lessons for next time.

Goal: {goal}
Outcome: {outcome}

Trace:
{trace}

Return JSON only: {{"lessons": [{{"summary": "one sentence, actionable", "category": "success|failure|policy|stall|insight"}}]}}
Return an empty list if there is nothing worth remembering."#,
            goal = goal.description,
            outcome = outcome.describe(),
            trace = format_trace(trace),
        );

        let model = self.models.active_ref();
        let response = with_timeout(
            policy.execution.inference_timeout(),
            self.inference.generate(&policy.redactor.scrub(&prompt), &model),
        )
        .await?;

        let default_category = default_category(outcome);
        Ok(parse_lessons(&response)
            .into_iter()
            .take(MAX_LESSONS)
            .map(|(summary, category)| {
                let category = category
                    .as_deref()
                    .and_then(LessonCategory::parse)
                    .unwrap_or(default_category);
                Lesson::new(&goal.id, &policy.redactor.scrub(&summary), category)
            })
            .collect())
    }

    async fn persist(&self, lesson: &Lesson) {
        if let Err(e) = self.store.save_lesson(lesson) {
            warn!(lesson_id = %lesson.id, "Failed to persist lesson: {}", e);
        }
        if lesson.category == LessonCategory::NoActionableLesson {
            return;
        }
        let record = MemoryRecord {
            kind: "lesson".to_string(),
            content: lesson.summary.clone(),
            source: Some(lesson.source_goal_id.clone()),
        };
        let timeout = self.policy.current().execution.inference_timeout();
        if let Err(e) = with_timeout(timeout, self.memory.store(record)).await {
            warn!(lesson_id = %lesson.id, "Failed to store lesson in memory: {}", e);
        }
    }
}

fn default_category(outcome: &GoalOutcome) -> LessonCategory {
    match outcome {
        GoalOutcome::Done => LessonCategory::Success,
        GoalOutcome::Failed(GoalFailure::PolicyDenied(_)) => LessonCategory::Policy,
        GoalOutcome::Failed(GoalFailure::Stalled(_)) => LessonCategory::Stall,
        GoalOutcome::Failed(_) | GoalOutcome::Aborted => LessonCategory::Failure,
    }
}

fn no_actionable_lesson(goal: &Goal, outcome: &GoalOutcome, redactor: &Redactor) -> Lesson {
    // Scrub before truncating so a cut never leaves a partial secret behind
    let description = redactor.scrub(&goal.description);
    let summary = format!(
        "No actionable lesson: goal \"{}\" {}",
        truncate(&description, 120),
        outcome.describe()
    );
    Lesson::new(&goal.id, &redactor.scrub(&summary), LessonCategory::NoActionableLesson)
}

fn format_trace(trace: &ExecutionTrace) -> String {
    if trace.is_empty() {
        return "(no entries)".to_string();
    }
    // Keep the tail; failures tend to be at the end
    let entries = trace.entries();
    let skip = entries.len().saturating_sub(30);
    entries[skip..]
        .iter()
        .map(|e| {
            let outcome = match e.outcome {
                TraceOutcome::Succeeded => "ok",
                TraceOutcome::Retrying => "retry",
                TraceOutcome::Failed => "FAILED",
                TraceOutcome::Denied => "DENIED",
                TraceOutcome::Replanned => "replan",
                TraceOutcome::Aborted => "aborted",
                TraceOutcome::Info => "info",
            };
            format!(
                "- [{}] {}: {}",
                e.step_id.as_deref().unwrap_or("-"),
                outcome,
                truncate(&e.observation, 300)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse `{"lessons": [...]}`, a bare array, or plain bullet lines
fn parse_lessons(response: &str) -> Vec<(String, Option<String>)> {
    #[derive(Deserialize)]
    struct LessonsJson {
        lessons: Vec<LessonJson>,
    }

    #[derive(Deserialize)]
    struct LessonJson {
        #[serde(alias = "lesson", alias = "text")]
        summary: String,
        category: Option<String>,
    }

    let parsed: Option<Vec<LessonJson>> = extract_json(response)
        .and_then(|obj| serde_json::from_str::<LessonsJson>(obj).ok())
        .map(|l| l.lessons)
        .or_else(|| extract_array(response).and_then(|arr| serde_json::from_str(arr).ok()));

    match parsed {
        Some(lessons) => lessons
            .into_iter()
            .filter(|l| !l.summary.trim().is_empty())
            .map(|l| (l.summary, l.category))
            .collect(),
        None => response
            .lines()
            .map(str::trim)
            .filter_map(|l| l.strip_prefix("- ").or_else(|| l.strip_prefix("* ")))
            .filter(|l| l.len() > 10)
            .map(|l| (l.to_string(), None))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyConfig;
    use crate::testing::{ScriptedInference, VecMemory};

    fn engine(inference: ScriptedInference, concurrency: usize) -> (ReflectionEngine, Arc<Store>, Arc<VecMemory>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let models = Arc::new(ModelRegistry::open(store.clone(), "base-model").unwrap());
        let mut config = PolicyConfig::default();
        config.execution.reflection_concurrency = concurrency;
        let policy = Arc::new(PolicyStore::new(config).unwrap());
        let memory = Arc::new(VecMemory::new());
        let engine = ReflectionEngine::new(Arc::new(inference), models, memory.clone(), store.clone(), policy);
        (engine, store, memory)
    }

    fn failed_trace(goal: &Goal) -> ExecutionTrace {
        let mut trace = ExecutionTrace::new(&goal.id);
        trace.record(Some("1"), "exit code 2: no such file", TraceOutcome::Failed);
        trace
    }

    #[test]
    fn test_parse_lessons_formats() {
        let json = r#"{"lessons": [{"summary": "Check the path exists before copying", "category": "failure"}]}"#;
        assert_eq!(parse_lessons(json)[0].1.as_deref(), Some("failure"));

        let bullets = "Lessons:\n- Always verify disk space first\n- ok\n";
        let parsed = parse_lessons(bullets);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "Always verify disk space first");
    }

    #[tokio::test]
    async fn test_failed_goal_gets_lesson() {
        let (engine, store, memory) = engine(
            ScriptedInference::new(vec![r#"{"lessons": [{"summary": "Create the directory before writing into it"}]}"#]),
            1,
        );
        let goal = Goal::new("write report to /data/out");
        let outcome = GoalOutcome::Failed(GoalFailure::Stalled(3));
        let lessons = engine.reflect(&goal, &outcome, &failed_trace(&goal)).await;
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].category, LessonCategory::Stall);
        assert_eq!(store.recent_lessons(10).unwrap().len(), 1);
        assert_eq!(memory.records().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_goal_falls_back_when_inference_fails() {
        let (engine, store, memory) = engine(ScriptedInference::new(vec![]), 1);
        let goal = Goal::new("deploy the thing");
        let lessons = engine.reflect(&goal, &GoalOutcome::Aborted, &failed_trace(&goal)).await;
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].category, LessonCategory::NoActionableLesson);
        assert_eq!(store.recent_lessons(10).unwrap()[0].category, LessonCategory::NoActionableLesson);
        // Fallback records are not memory-worthy
        assert!(memory.records().is_empty());
    }

    #[tokio::test]
    async fn test_empty_reflection_on_failure_still_records() {
        let (engine, _, _) = engine(ScriptedInference::new(vec![r#"{"lessons": []}"#]), 1);
        let goal = Goal::new("x");
        let outcome = GoalOutcome::Failed(GoalFailure::PolicyDenied("rm".into()));
        let lessons = engine.reflect(&goal, &outcome, &failed_trace(&goal)).await;
        assert_eq!(lessons[0].category, LessonCategory::NoActionableLesson);
    }

    #[tokio::test]
    async fn test_success_reflection_skipped_when_busy() {
        let (engine, store, _) = engine(
            ScriptedInference::new(vec![r#"{"lessons": [{"summary": "Listing first saved a step"}]}"#]),
            1,
        );
        let goal = Goal::new("list files");
        let trace = ExecutionTrace::new(&goal.id);

        let held = engine.slots.try_acquire().unwrap();
        assert!(engine.reflect(&goal, &GoalOutcome::Done, &trace).await.is_empty());
        drop(held);

        let lessons = engine.reflect(&goal, &GoalOutcome::Done, &trace).await;
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].category, LessonCategory::Success);
        assert_eq!(store.recent_lessons(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lessons_are_redacted() {
        let (engine, _, _) = engine(
            ScriptedInference::new(vec![
                r#"{"lessons": [{"summary": "Do not paste sk-abcdefghijklmnopqrstuvwxyz into commands"}]}"#,
            ]),
            1,
        );
        let goal = Goal::new("x");
        let lessons = engine
            .reflect(&goal, &GoalOutcome::Failed(GoalFailure::Stalled(1)), &failed_trace(&goal))
            .await;
        assert!(!lessons[0].summary.contains("sk-abcdefghijklmnopqrstuvwxyz"));
    }

    #[tokio::test]
    async fn test_fallback_lesson_is_redacted() {
        let (engine, store, _) = engine(ScriptedInference::new(vec![]), 1);
        let key = "sk-abcdefghijklmnopqrstuvwxyz";
        let goal = Goal::new(&format!("call the api with {}", key));
        let lessons = engine.reflect(&goal, &GoalOutcome::Aborted, &failed_trace(&goal)).await;
        assert_eq!(lessons[0].category, LessonCategory::NoActionableLesson);
        assert!(!lessons[0].summary.contains(key));

        let stored = store.recent_lessons(10).unwrap();
        assert!(!stored[0].summary.contains(key));
        assert!(stored[0].summary.contains("[REDACTED:"));
    }
}

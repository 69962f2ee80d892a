//! Goal Planner
//!
//! Decomposes a goal into a validated step graph using the active model.
//! Lessons from earlier goals are passed along as advisory context.
//! Replanning keeps the steps that already succeeded and asks for a new
//! tail, bounded by `execution.max_replans`.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::goal::{ExecutionTrace, Goal, Lesson, Plan, Step, StepStatus, THINK_SKILL};
use crate::collab::Inference;
use crate::error::{with_timeout, PlanningError};
use crate::evolution::models::ModelRegistry;
use crate::policy::PolicyStore;

/// Planner backed by the inference collaborator
pub struct GoalPlanner {
    inference: Arc<dyn Inference>,
    models: Arc<ModelRegistry>,
    policy: Arc<PolicyStore>,
}

impl GoalPlanner {
    pub fn new(inference: Arc<dyn Inference>, models: Arc<ModelRegistry>, policy: Arc<PolicyStore>) -> Self {
        Self {
            inference,
            models,
            policy,
        }
    }

    /// Produce an initial plan for `goal`
    pub async fn plan(&self, goal: &Goal, lessons: &[Lesson]) -> Result<Plan, PlanningError> {
        let policy = self.policy.current();
        let max_steps = policy.execution.max_steps;

        let prompt = format!(
            r#"You are the planning module of an autonomous agent. Break the goal into concrete steps.

Goal: {goal}
{lessons}
Available skills:
- shell: run a shell command (args: command)
- think: reason or write text with the language model

Return a JSON object:
{{"steps": [{{"id": "1", "action": "shell|think", "description": "what this step does", "command": "shell command or null", "depends_on": []}}]}}

Use at most {max_steps} steps. depends_on lists ids of steps that must succeed first.

JSON only:"#,
            goal = goal.description,
            lessons = format_lessons(lessons),
            max_steps = max_steps,
        );

        let model = self.models.active_ref();
        let response = with_timeout(
            policy.execution.inference_timeout(),
            self.inference.generate(&policy.redactor.scrub(&prompt), &model),
        )
        .await?;

        let steps = match parse_steps(&response) {
            Some(steps) if !steps.is_empty() => steps,
            _ => {
                warn!(goal_id = %goal.id, "Planner output unparseable, falling back to a single step");
                vec![Step::new("1", THINK_SKILL, &goal.description, serde_json::json!({}))]
            }
        };

        let steps = steps
            .into_iter()
            .map(|s| {
                let instructed = is_instructed(&goal.description, &s);
                s.instructed(instructed)
            })
            .collect();

        let plan = Plan::new(&goal.id, steps, max_steps)?;
        info!(goal_id = %goal.id, steps = plan.steps.len(), "Plan created");
        Ok(plan)
    }

    /// Replace everything after the succeeded steps, given the failed step and trace so far
    pub async fn replan(
        &self,
        goal: &Goal,
        plan: &Plan,
        trace: &ExecutionTrace,
        failed_step: &str,
        lessons: &[Lesson],
    ) -> Result<Plan, PlanningError> {
        let policy = self.policy.current();
        let max_replans = policy.execution.max_replans;
        if plan.revision >= max_replans {
            return Err(PlanningError::ReplanLimit(max_replans));
        }

        let completed: Vec<String> = plan
            .succeeded()
            .map(|s| format!("- [{}] {} ({})", s.id, s.description, s.action))
            .collect();
        let failure = trace
            .entries()
            .iter()
            .rev()
            .find(|e| e.step_id.as_deref() == Some(failed_step))
            .map(|e| e.observation.clone())
            .unwrap_or_default();
        let failed_desc = plan
            .step(failed_step)
            .map(|s| s.action_text())
            .unwrap_or_else(|| failed_step.to_string());

        let prompt = format!(
            r#"A step of your plan failed. Produce replacement steps to still reach the goal.

Goal: {goal}
Completed steps (keep, do not repeat):
{completed}
Failed step: {failed_desc}
Error: {failure}
{lessons}
Return JSON only: {{"steps": [{{"id": "...", "action": "shell|think", "description": "...", "command": "... or null", "depends_on": []}}]}}
depends_on may reference completed step ids."#,
            goal = goal.description,
            completed = if completed.is_empty() { "(none)".to_string() } else { completed.join("\n") },
            failed_desc = failed_desc,
            failure = truncate(&failure, 500),
            lessons = format_lessons(lessons),
        );

        let model = self.models.active_ref();
        let response = with_timeout(
            policy.execution.inference_timeout(),
            self.inference.generate(&policy.redactor.scrub(&prompt), &model),
        )
        .await?;

        let new_steps = parse_steps(&response)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PlanningError::Unparseable(truncate(&response, 200)))?;

        let revision = plan.revision + 1;
        let kept: Vec<Step> = plan.succeeded().cloned().collect();
        let steps = merge_replacement(&goal.description, kept, new_steps, revision);

        let mut replanned = Plan::new(&goal.id, steps, policy.execution.max_steps)?;
        replanned.revision = revision;
        info!(goal_id = %goal.id, revision, steps = replanned.steps.len(), "Replanned after failed step {}", failed_step);
        Ok(replanned)
    }
}

/// Keep succeeded steps, rename clashing new ids, drop dependencies on discarded steps.
/// A dependency id that names a kept step refers to that step.
fn merge_replacement(goal: &str, kept: Vec<Step>, new_steps: Vec<Step>, revision: usize) -> Vec<Step> {
    let kept_ids: HashSet<String> = kept.iter().map(|s| s.id.clone()).collect();
    let renames: HashMap<String, String> = new_steps
        .iter()
        .map(|s| {
            let id = if kept_ids.contains(&s.id) {
                format!("r{}.{}", revision, s.id)
            } else {
                s.id.clone()
            };
            (s.id.clone(), id)
        })
        .collect();

    let mut steps = kept;
    for mut step in new_steps {
        step.id = renames.get(&step.id).cloned().unwrap_or(step.id);
        step.depends_on = step
            .depends_on
            .iter()
            .filter_map(|dep| {
                if kept_ids.contains(dep) {
                    Some(dep.clone())
                } else if let Some(renamed) = renames.get(dep) {
                    Some(renamed.clone())
                } else {
                    debug!("Dropping dependency on discarded step {}", dep);
                    None
                }
            })
            .collect();
        step.status = StepStatus::Pending;
        step.attempts = 0;
        step.instructed = is_instructed(goal, &step);
        steps.push(step);
    }
    steps
}

fn format_lessons(lessons: &[Lesson]) -> String {
    if lessons.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = lessons
        .iter()
        .take(5)
        .map(|l| format!("- ({}) {}", l.category.as_str(), truncate(&l.summary, 200)))
        .collect();
    format!("\nLessons from earlier goals (advisory):\n{}\n", lines.join("\n"))
}

fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// A step is instructed when the user's text literally names it: its command,
/// or for command-less steps its description.
pub fn is_instructed(goal: &str, step: &Step) -> bool {
    let goal = normalize(goal);
    match step.command().map(normalize).filter(|c| !c.is_empty()) {
        Some(cmd) => goal.contains(&cmd),
        None => {
            let desc = normalize(&step.description);
            !desc.is_empty() && (goal.contains(&desc) || desc == goal)
        }
    }
}

/// Parse the planner's JSON into steps. Accepts `{"steps": [...]}` or a bare array.
pub fn parse_steps(response: &str) -> Option<Vec<Step>> {
    #[derive(Deserialize)]
    struct PlanJson {
        steps: Vec<StepJson>,
    }

    #[derive(Deserialize)]
    struct StepJson {
        id: Option<serde_json::Value>,
        action: Option<String>,
        #[serde(alias = "skill")]
        r#type: Option<String>,
        description: Option<String>,
        command: Option<String>,
        args: Option<serde_json::Value>,
        #[serde(default)]
        depends_on: Vec<serde_json::Value>,
    }

    fn id_string(v: &serde_json::Value) -> Option<String> {
        match v {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    let parsed: Vec<StepJson> = extract_json(response)
        .and_then(|obj| serde_json::from_str::<PlanJson>(obj).ok())
        .map(|plan| plan.steps)
        .or_else(|| extract_array(response).and_then(|arr| serde_json::from_str(arr).ok()))?;

    let steps = parsed
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            let id = s.id.as_ref().and_then(id_string).unwrap_or_else(|| (i + 1).to_string());
            // Either {"type": skill, "action": description} or {"action": skill, "description": ...}
            let (skill, description) = match s.r#type {
                Some(t) => (t, s.description.or(s.action).unwrap_or_default()),
                None => {
                    let skill = s.action.clone().unwrap_or_else(|| THINK_SKILL.to_string());
                    (skill.clone(), s.description.unwrap_or(skill))
                }
            };
            let mut args = s.args.filter(|a| a.is_object()).unwrap_or_else(|| serde_json::json!({}));
            if let Some(cmd) = s.command.filter(|c| !c.trim().is_empty()) {
                args["command"] = serde_json::Value::String(cmd);
            }
            let mut step = Step::new(&id, &skill.trim().to_lowercase(), description.trim(), args);
            step.depends_on = s.depends_on.iter().filter_map(id_string).collect();
            step
        })
        .collect();
    Some(steps)
}

/// First balanced `{...}` block in a model response
pub(crate) fn extract_json(s: &str) -> Option<&str> {
    extract_balanced(s, '{', '}')
}

pub(crate) fn extract_array(s: &str) -> Option<&str> {
    extract_balanced(s, '[', ']')
}

fn extract_balanced(s: &str, open: char, close: char) -> Option<&str> {
    let start = s.find(open)?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

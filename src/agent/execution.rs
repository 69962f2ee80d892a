//! Execution Loop (ReAct cycle)
//!
//! One loop per goal. Each iteration selects the next runnable step, applies
//! the autonomy gate, makes exactly one skill attempt, records the
//! observation and decides whether the goal is finished.
//!
//! - restricted: any inferred step fails the goal before a skill runs
//! - supervised: dangerous steps wait for human confirmation
//! - full: everything runs
//!
//! A goal that goes `stall_iterations` iterations without a step succeeding
//! fails as stalled. Aborts are observed at every suspension point.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::goal::{
    ExecutionTrace, Goal, GoalOutcome, GoalStatus, Lesson, Plan, StepStatus, TraceOutcome, THINK_SKILL,
};
use super::planner::GoalPlanner;
use super::recovery::RetryPolicy;
use crate::collab::{Confirmation, Gateway, Inference};
use crate::error::{with_timeout, CollabError, GoalFailure};
use crate::evolution::models::ModelRegistry;
use crate::policy::{AutonomyLevel, Policy, PolicyStore};

/// Result of running one goal through the loop
#[derive(Debug, Clone)]
pub struct GoalRun {
    pub goal: Goal,
    pub plan: Option<Plan>,
    pub trace: ExecutionTrace,
    pub outcome: GoalOutcome,
    /// Loop iterations (skill attempts) performed
    pub iterations: usize,
}

impl GoalRun {
    /// Move the goal to its terminal status and seal the trace
    pub fn finish(&mut self) {
        self.goal.status = self.outcome.status();
        if let GoalOutcome::Failed(failure) = &self.outcome {
            self.goal.failure = Some(failure.to_string());
        }
        self.trace.seal();
    }
}

/// Resolves once `abort` is set. Never resolves if the sender is gone.
pub async fn aborted(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow_and_update() {
            return;
        }
        if abort.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// The ReAct executor
pub struct ExecutionLoop {
    planner: Arc<GoalPlanner>,
    gateway: Arc<dyn Gateway>,
    inference: Arc<dyn Inference>,
    models: Arc<ModelRegistry>,
    policy: Arc<PolicyStore>,
}

impl ExecutionLoop {
    pub fn new(
        planner: Arc<GoalPlanner>,
        gateway: Arc<dyn Gateway>,
        inference: Arc<dyn Inference>,
        models: Arc<ModelRegistry>,
        policy: Arc<PolicyStore>,
    ) -> Self {
        Self {
            planner,
            gateway,
            inference,
            models,
            policy,
        }
    }

    /// Plan and execute a goal
    pub async fn execute(&self, mut goal: Goal, lessons: &[Lesson], mut abort: watch::Receiver<bool>) -> GoalRun {
        let mut trace = ExecutionTrace::new(&goal.id);
        goal.status = GoalStatus::Planning;
        debug!(goal_id = %goal.id, "Planning goal");

        let planned = tokio::select! {
            biased;
            _ = aborted(&mut abort) => None,
            result = self.planner.plan(&goal, lessons) => Some(result),
        };

        match planned {
            None => {
                trace.record(None, "aborted during planning", TraceOutcome::Aborted);
                Self::conclude(goal, None, trace, GoalOutcome::Aborted, 0)
            }
            Some(Err(e)) => {
                warn!(goal_id = %goal.id, "Planning failed: {}", e);
                trace.record(None, format!("planning failed: {}", e), TraceOutcome::Failed);
                Self::conclude(goal, None, trace, GoalOutcome::Failed(GoalFailure::Planning(e.to_string())), 0)
            }
            Some(Ok(plan)) => {
                trace.record(None, format!("planned {} steps", plan.steps.len()), TraceOutcome::Info);
                self.run(goal, plan, trace, lessons, abort).await
            }
        }
    }

    /// Execute an already validated plan
    pub async fn execute_plan(&self, goal: Goal, plan: Plan, lessons: &[Lesson], abort: watch::Receiver<bool>) -> GoalRun {
        let trace = ExecutionTrace::new(&goal.id);
        self.run(goal, plan, trace, lessons, abort).await
    }

    fn conclude(mut goal: Goal, plan: Option<Plan>, trace: ExecutionTrace, outcome: GoalOutcome, iterations: usize) -> GoalRun {
        goal.status = GoalStatus::Reflecting;
        GoalRun {
            goal,
            plan,
            trace,
            outcome,
            iterations,
        }
    }

    async fn run(
        &self,
        mut goal: Goal,
        mut plan: Plan,
        mut trace: ExecutionTrace,
        lessons: &[Lesson],
        mut abort: watch::Receiver<bool>,
    ) -> GoalRun {
        goal.status = GoalStatus::Executing;
        let mut iterations = 0usize;
        let mut without_progress = 0usize;

        let outcome = loop {
            if *abort.borrow() {
                break GoalOutcome::Aborted;
            }

            // Each decision reads the current policy generation
            let policy = self.policy.current();
            let exec = &policy.execution;
            let retry = RetryPolicy::from_execution(exec);

            if policy.autonomy_level == AutonomyLevel::Restricted {
                let inferred: Vec<String> = plan.inferred_pending().iter().map(|s| s.id.clone()).collect();
                if !inferred.is_empty() {
                    let reason = format!(
                        "restricted autonomy: step(s) {} are not part of the instruction",
                        inferred.join(", ")
                    );
                    trace.record(None, reason.clone(), TraceOutcome::Denied);
                    break GoalOutcome::Failed(GoalFailure::PolicyDenied(reason));
                }
            }

            let Some(idx) = plan.next_runnable() else {
                if plan.is_complete() {
                    break GoalOutcome::Done;
                }
                let blocked = plan
                    .steps
                    .iter()
                    .find(|s| s.status == StepStatus::Pending)
                    .map(|s| s.id.clone())
                    .unwrap_or_default();
                break GoalOutcome::Failed(GoalFailure::PermanentStepFailure {
                    step: blocked,
                    reason: "dependencies can never be satisfied".to_string(),
                });
            };

            iterations += 1;
            let step_id = plan.steps[idx].id.clone();
            let action_text = policy.redactor.scrub(&plan.steps[idx].action_text());

            if policy.autonomy_level == AutonomyLevel::Supervised
                && !plan.steps[idx].confirmed
                && policy.is_dangerous(&plan.steps[idx].action_text())
            {
                info!(goal_id = %goal.id, step = %step_id, "Awaiting confirmation for {}", action_text);
                let answer = tokio::select! {
                    biased;
                    _ = aborted(&mut abort) => break GoalOutcome::Aborted,
                    answer = with_timeout(
                        exec.confirmation_timeout(),
                        self.gateway.request_confirmation(&action_text),
                    ) => answer,
                };
                match answer {
                    Ok(Confirmation::Approved) => {
                        plan.steps[idx].confirmed = true;
                        trace.record(Some(&step_id), "confirmed by user", TraceOutcome::Info);
                    }
                    Ok(Confirmation::Denied) => {
                        let reason = format!("confirmation denied for step {} ({})", step_id, action_text);
                        trace.record(Some(&step_id), reason.clone(), TraceOutcome::Denied);
                        break GoalOutcome::Failed(GoalFailure::PolicyDenied(reason));
                    }
                    Err(e) => {
                        let reason = format!("no confirmation for step {}: {}", step_id, e);
                        trace.record(Some(&step_id), reason.clone(), TraceOutcome::Denied);
                        break GoalOutcome::Failed(GoalFailure::PolicyDenied(reason));
                    }
                }
            }

            let step = &mut plan.steps[idx];
            step.status = StepStatus::Running;
            step.attempts += 1;
            let attempt = step.attempts;
            let skill = step.action.clone();
            let description = step.description.clone();
            let args = step.args.clone();
            debug!(goal_id = %goal.id, step = %step_id, attempt, "Running {}", action_text);

            let result = tokio::select! {
                biased;
                _ = aborted(&mut abort) => break GoalOutcome::Aborted,
                result = self.invoke(&goal, &skill, &description, &args, &policy) => result,
            };

            match result {
                Ok(observation) => {
                    plan.steps[idx].status = StepStatus::Succeeded;
                    trace.record(Some(&step_id), policy.redactor.scrub(&observation), TraceOutcome::Succeeded);
                    without_progress = 0;
                }
                Err(e) => {
                    without_progress += 1;
                    let message = policy.redactor.scrub(&e.to_string());

                    if without_progress >= exec.stall_iterations {
                        plan.steps[idx].status = StepStatus::Failed;
                        trace.record(Some(&step_id), message, TraceOutcome::Failed);
                        warn!(goal_id = %goal.id, iterations, "Goal stalled");
                        break GoalOutcome::Failed(GoalFailure::Stalled(exec.stall_iterations));
                    }

                    if e.is_retryable() && attempt <= retry.max_retries {
                        plan.steps[idx].status = StepStatus::Pending;
                        trace.record(
                            Some(&step_id),
                            format!("attempt {} failed, will retry: {}", attempt, message),
                            TraceOutcome::Retrying,
                        );
                        let delay = retry.delay_for_attempt(attempt - 1);
                        tokio::select! {
                            biased;
                            _ = aborted(&mut abort) => break GoalOutcome::Aborted,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }

                    plan.steps[idx].status = StepStatus::Failed;
                    trace.record(Some(&step_id), message.clone(), TraceOutcome::Failed);
                    info!(goal_id = %goal.id, step = %step_id, "Step failed permanently, replanning");

                    let replanned = tokio::select! {
                        biased;
                        _ = aborted(&mut abort) => break GoalOutcome::Aborted,
                        replanned = self.planner.replan(&goal, &plan, &trace, &step_id, lessons) => replanned,
                    };
                    match replanned {
                        Ok(new_plan) => {
                            trace.record(
                                None,
                                format!("replanned (revision {}, {} steps)", new_plan.revision, new_plan.steps.len()),
                                TraceOutcome::Replanned,
                            );
                            plan = new_plan;
                        }
                        Err(pe) => {
                            break GoalOutcome::Failed(GoalFailure::PermanentStepFailure {
                                step: step_id,
                                reason: format!("{} ({})", message, pe),
                            });
                        }
                    }
                }
            }
        };

        match &outcome {
            GoalOutcome::Aborted => {
                plan.abort_unfinished();
                trace.record(None, "goal aborted", TraceOutcome::Aborted);
            }
            GoalOutcome::Failed(_) => plan.skip_pending(),
            GoalOutcome::Done => {}
        }
        info!(goal_id = %goal.id, iterations, outcome = %outcome.describe(), "Execution finished");
        Self::conclude(goal, Some(plan), trace, outcome, iterations)
    }

    /// One skill attempt. `think` goes to the model, everything else to the gateway.
    async fn invoke(
        &self,
        goal: &Goal,
        skill: &str,
        description: &str,
        args: &serde_json::Value,
        policy: &Policy,
    ) -> Result<String, CollabError> {
        let timeout = policy.execution.step_timeout();
        if skill == THINK_SKILL {
            let prompt = format!(
                "You are working on the goal: {}\n\nCurrent task: {}\n{}\nRespond with the result only.",
                goal.description,
                description,
                if args.as_object().map(|o| o.is_empty()).unwrap_or(true) {
                    String::new()
                } else {
                    format!("Inputs: {}\n", args)
                }
            );
            let model = self.models.active_ref();
            with_timeout(timeout, self.inference.generate(&policy.redactor.scrub(&prompt), &model)).await
        } else {
            // Adapters get the deadline too; whichever fires first yields a timeout
            with_timeout(timeout, self.gateway.invoke(skill, args, timeout)).await
        }
    }
}

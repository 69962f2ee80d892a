//! Goal Supervisor
//!
//! Admits goals in FIFO order behind a fixed number of execution slots,
//! runs each through plan -> execute -> reflect, and exposes abort.
//! Reflection of failed and aborted goals finishes before the goal is
//! reported terminal.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::execution::{aborted, ExecutionLoop, GoalRun};
use super::goal::{ExecutionTrace, Goal, GoalOutcome, Lesson, Plan, Step, TraceOutcome};
use super::reflection::ReflectionEngine;
use crate::error::SubmitError;
use crate::policy::PolicyStore;
use crate::store::Store;

/// Lessons offered to the planner per goal
const PLANNING_LESSONS: usize = 5;

/// Final report for one goal
#[derive(Debug, Clone)]
pub struct GoalReport {
    pub goal: Goal,
    pub plan: Option<Plan>,
    pub trace: ExecutionTrace,
    pub outcome: GoalOutcome,
    pub lessons: Vec<Lesson>,
    pub iterations: usize,
}

/// Handle to a submitted goal
pub struct GoalHandle {
    pub goal_id: String,
    result: oneshot::Receiver<GoalReport>,
}

impl GoalHandle {
    /// Wait for the goal to reach a terminal state
    pub async fn wait(self) -> Option<GoalReport> {
        self.result.await.ok()
    }
}

struct Queued {
    goal: Goal,
    plan: Option<Plan>,
    abort: watch::Receiver<bool>,
    reply: oneshot::Sender<GoalReport>,
}

pub struct GoalSupervisor {
    executor: Arc<ExecutionLoop>,
    reflection: Arc<ReflectionEngine>,
    store: Arc<Store>,
    policy: Arc<PolicyStore>,
    queue: mpsc::UnboundedSender<Queued>,
    /// Abort switch per queued or running goal
    active: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl GoalSupervisor {
    /// Start the supervisor and its admission task. The slot count is fixed
    /// from the policy at start.
    pub fn start(
        executor: Arc<ExecutionLoop>,
        reflection: Arc<ReflectionEngine>,
        store: Arc<Store>,
        policy: Arc<PolicyStore>,
    ) -> Arc<Self> {
        let slots = policy.current().execution.max_concurrent_goals.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            executor,
            reflection,
            store,
            policy,
            queue: tx,
            active: Mutex::new(HashMap::new()),
        });
        tokio::spawn(Self::admit(Arc::downgrade(&supervisor), rx, Arc::new(Semaphore::new(slots))));
        info!(slots, "Goal supervisor started");
        supervisor
    }

    /// Admission loop: one permit per goal, handed out in submission order.
    /// A goal aborted while waiting for its slot is released without one.
    async fn admit(
        supervisor: std::sync::Weak<Self>,
        mut rx: mpsc::UnboundedReceiver<Queued>,
        slots: Arc<Semaphore>,
    ) {
        while let Some(mut queued) = rx.recv().await {
            let permit = tokio::select! {
                biased;
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                _ = aborted(&mut queued.abort) => None,
            };
            let Some(this) = supervisor.upgrade() else {
                break;
            };
            tokio::spawn(async move {
                let report = this.run_goal(queued.goal, queued.plan, queued.abort, permit).await;
                let _ = queued.reply.send(report);
            });
        }
        debug!("Goal admission loop stopped");
    }

    /// Submit a goal for planning and execution
    pub fn submit(&self, description: &str) -> Result<GoalHandle, SubmitError> {
        self.enqueue(Goal::new(description), None)
    }

    /// Submit a goal with an explicit step list. Every step counts as instructed.
    pub fn submit_plan(&self, description: &str, steps: Vec<Step>) -> Result<GoalHandle, SubmitError> {
        let goal = Goal::new(description);
        let max_steps = self.policy.current().execution.max_steps;
        let plan = Plan::from_template(&goal.id, steps, max_steps)?;
        self.enqueue(goal, Some(plan))
    }

    fn enqueue(&self, goal: Goal, plan: Option<Plan>) -> Result<GoalHandle, SubmitError> {
        let goal_id = goal.id.clone();
        let (abort_tx, abort_rx) = watch::channel(false);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.active.lock().insert(goal_id.clone(), abort_tx);
        let queued = Queued {
            goal,
            plan,
            abort: abort_rx,
            reply: reply_tx,
        };
        if self.queue.send(queued).is_err() {
            self.active.lock().remove(&goal_id);
            return Err(SubmitError::ShuttingDown);
        }
        info!(goal_id = %goal_id, "Goal queued");
        Ok(GoalHandle {
            goal_id,
            result: reply_rx,
        })
    }

    /// Abort a queued or running goal. Idempotent; false if the goal is unknown or finished.
    pub fn abort(&self, goal_id: &str) -> bool {
        match self.active.lock().get(goal_id) {
            Some(switch) => {
                if !*switch.borrow() {
                    info!(goal_id = %goal_id, "Abort requested");
                }
                switch.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Abort every goal that has not finished
    pub fn abort_all(&self) -> usize {
        let active = self.active.lock();
        for switch in active.values() {
            switch.send_replace(true);
        }
        active.len()
    }

    /// Ids of goals queued or running
    pub fn active_goals(&self) -> Vec<String> {
        self.active.lock().keys().cloned().collect()
    }

    async fn run_goal(
        &self,
        goal: Goal,
        plan: Option<Plan>,
        abort: watch::Receiver<bool>,
        _permit: Option<OwnedSemaphorePermit>,
    ) -> GoalReport {
        let goal_id = goal.id.clone();
        let lessons = self.store.recent_lessons(PLANNING_LESSONS).unwrap_or_else(|e| {
            warn!(goal_id = %goal_id, "Could not load lessons: {}", e);
            Vec::new()
        });

        let mut run = if *abort.borrow() {
            // Aborted while queued; never planned or executed
            let mut trace = ExecutionTrace::new(&goal.id);
            trace.record(None, "aborted before execution", TraceOutcome::Aborted);
            GoalRun {
                goal,
                plan: plan.map(|mut p| {
                    p.abort_unfinished();
                    p
                }),
                trace,
                outcome: GoalOutcome::Aborted,
                iterations: 0,
            }
        } else {
            match plan {
                Some(plan) => self.executor.execute_plan(goal, plan, &lessons, abort).await,
                None => self.executor.execute(goal, &lessons, abort).await,
            }
        };

        let lessons = self.reflection.reflect(&run.goal, &run.outcome, &run.trace).await;
        run.finish();
        self.active.lock().remove(&goal_id);

        info!(
            goal_id = %goal_id,
            status = run.goal.status.as_str(),
            iterations = run.iterations,
            lessons = lessons.len(),
            "Goal finished: {}",
            run.outcome.describe()
        );

        GoalReport {
            goal: run.goal,
            plan: run.plan,
            trace: run.trace,
            outcome: run.outcome,
            lessons,
            iterations: run.iterations,
        }
    }
}

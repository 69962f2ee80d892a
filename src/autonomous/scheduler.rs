//! Proactive Scheduler
//!
//! Persisted jobs triggered on cron expressions or fixed intervals:
//! - Every job with `next_run_at <= now` starts on the next tick
//! - Per-job single flight; a job that comes due while still running
//!   misfires and its policy decides what happens (skip, or one coalesced rerun)
//! - Job state is written to the store after every transition, so a restart
//!   resumes the schedule; a job found `running` at startup was interrupted
//!   and runs again once
//!
//! `tick(now)` takes the clock explicitly; `run()` drives it from a timer.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, StoreError};
use crate::policy::PolicyStore;
use crate::store::Store;

/// When a job runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Standard 5-field cron expression (or 6/7 fields with seconds), UTC
    Cron { expr: String },
    Interval { secs: u64 },
}

fn parse_cron(expr: &str) -> Result<cron::Schedule, SchedulerError> {
    let expr = expr.trim();
    // The cron crate wants a seconds field
    let full = if !expr.starts_with('@') && expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&full).map_err(|e| SchedulerError::InvalidSchedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

impl Schedule {
    /// Validated cron schedule
    pub fn cron(expr: &str) -> Result<Self, SchedulerError> {
        parse_cron(expr)?;
        Ok(Self::Cron {
            expr: expr.trim().to_string(),
        })
    }

    pub fn every(interval: Duration) -> Self {
        Self::Interval {
            secs: interval.as_secs().max(1),
        }
    }

    /// First occurrence strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron { expr } => parse_cron(expr).ok()?.after(&after).next(),
            Self::Interval { secs } => Some(after + ChronoDuration::seconds((*secs).max(1) as i64)),
        }
    }
}

/// What to do when a job comes due while it is still running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Drop the occurrence
    Skip,
    /// Coalesce any number of missed occurrences into one run after the current one
    RunOnce,
}

impl MisfirePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::RunOnce => "run_once",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "skip" => Some(Self::Skip),
            "run_once" | "runOnce" => Some(Self::RunOnce),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Never,
    Running,
    Succeeded,
    Failed,
    /// Task declined to run (e.g. already in progress elsewhere)
    Skipped,
    /// Process stopped while the job was running
    Interrupted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "never" => Some(Self::Never),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }
}

/// A persisted job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub name: String,
    /// Registered task that runs this job
    pub task: String,
    /// Task input (a goal description for goal jobs)
    pub payload: Option<String>,
    pub schedule: Schedule,
    pub misfire_policy: MisfirePolicy,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: JobStatus,
    pub last_error: Option<String>,
    pub running: bool,
    pub pending_rerun: bool,
    pub misfires: u64,
    pub run_count: u64,
}

impl ScheduledJob {
    pub fn new(name: &str, task: &str, schedule: Schedule, misfire_policy: MisfirePolicy, now: DateTime<Utc>) -> Self {
        let next_run_at = schedule.next_after(now).unwrap_or(now);
        Self {
            name: name.to_string(),
            task: task.to_string(),
            payload: None,
            schedule,
            misfire_policy,
            next_run_at,
            last_run_at: None,
            last_status: JobStatus::Never,
            last_error: None,
            running: false,
            pending_rerun: false,
            misfires: 0,
            run_count: 0,
        }
    }

    pub fn with_payload(mut self, payload: &str) -> Self {
        self.payload = Some(payload.to_string());
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at <= now
    }

    fn advance(&mut self, now: DateTime<Utc>) {
        match self.schedule.next_after(now) {
            Some(next) => self.next_run_at = next,
            None => {
                // Cron with no future occurrence: park it far out
                warn!(job = %self.name, "Schedule has no next occurrence");
                self.next_run_at = DateTime::<Utc>::MAX_UTC;
            }
        }
    }
}

/// Result of one task execution
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(String),
    /// Did not run; counted as a misfire
    Skipped(String),
}

/// Work behind a job
#[async_trait]
pub trait JobTask: Send + Sync {
    async fn run(&self, job: &ScheduledJob) -> anyhow::Result<JobOutcome>;
}

/// Jobs acted on in one tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub started: Vec<String>,
    pub misfired: Vec<String>,
}

pub struct Scheduler {
    store: Arc<Store>,
    policy: Arc<PolicyStore>,
    tasks: RwLock<HashMap<String, Arc<dyn JobTask>>>,
    jobs: Mutex<HashMap<String, ScheduledJob>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Load persisted jobs. Jobs left `running` by a previous process become
    /// `interrupted` and due immediately.
    pub fn new(store: Arc<Store>, policy: Arc<PolicyStore>, now: DateTime<Utc>) -> Result<Arc<Self>, StoreError> {
        let mut jobs = HashMap::new();
        for mut job in store.load_jobs()? {
            if job.running {
                warn!(job = %job.name, "Job was interrupted by a restart, rescheduling now");
                job.running = false;
                job.pending_rerun = false;
                job.last_status = JobStatus::Interrupted;
                job.next_run_at = now;
                store.save_job(&job)?;
            }
            jobs.insert(job.name.clone(), job);
        }
        info!(jobs = jobs.len(), "Scheduler loaded");
        Ok(Arc::new(Self {
            store,
            policy,
            tasks: RwLock::new(HashMap::new()),
            jobs: Mutex::new(jobs),
            handles: Mutex::new(Vec::new()),
        }))
    }

    pub fn register_task(&self, name: &str, task: Arc<dyn JobTask>) {
        self.tasks.write().insert(name.to_string(), task);
    }

    /// Create the job, or update it if its definition changed. Run history is kept.
    pub fn ensure_job(&self, job: ScheduledJob, now: DateTime<Utc>) -> Result<(), StoreError> {
        let updated = {
            let mut jobs = self.jobs.lock();
            match jobs.get_mut(&job.name) {
                Some(existing)
                    if existing.schedule == job.schedule
                        && existing.task == job.task
                        && existing.payload == job.payload
                        && existing.misfire_policy == job.misfire_policy =>
                {
                    None
                }
                Some(existing) => {
                    existing.task = job.task;
                    existing.payload = job.payload;
                    existing.misfire_policy = job.misfire_policy;
                    if existing.schedule != job.schedule {
                        existing.schedule = job.schedule;
                        existing.advance(now);
                    }
                    Some(existing.clone())
                }
                None => {
                    jobs.insert(job.name.clone(), job.clone());
                    Some(job)
                }
            }
        };
        if let Some(job) = updated {
            self.store.save_job(&job)?;
            info!(job = %job.name, next_run_at = %job.next_run_at, "Job scheduled");
        }
        Ok(())
    }

    /// Schedule a goal submission on a cron expression
    pub fn add_dynamic_job(&self, name: &str, goal: &str, cron: &str, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if self.jobs.lock().contains_key(name) {
            return Err(SchedulerError::Duplicate(name.to_string()));
        }
        let job = ScheduledJob::new(name, super::jobs::GOAL, Schedule::cron(cron)?, MisfirePolicy::Skip, now)
            .with_payload(goal);
        self.ensure_job(job, now)?;
        Ok(())
    }

    /// Remove a job. A run in progress finishes but is not rescheduled.
    pub fn remove_job(&self, name: &str) -> Result<bool, StoreError> {
        let removed = self.jobs.lock().remove(name).is_some();
        let deleted = self.store.delete_job(name)?;
        if removed || deleted {
            info!(job = name, "Job removed");
        }
        Ok(removed || deleted)
    }

    pub fn job(&self, name: &str) -> Option<ScheduledJob> {
        self.jobs.lock().get(name).cloned()
    }

    pub fn jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<_> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    /// Start every due job that is idle; apply misfire policy to due jobs that are busy
    pub fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let mut to_save = Vec::new();
        let mut to_start = Vec::new();

        {
            let tasks = self.tasks.read();
            let mut jobs = self.jobs.lock();
            let mut due: Vec<&mut ScheduledJob> = jobs.values_mut().filter(|j| j.is_due(now)).collect();
            due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then_with(|| a.name.cmp(&b.name)));

            for job in due {
                job.advance(now);
                if job.running {
                    job.misfires += 1;
                    if job.misfire_policy == MisfirePolicy::RunOnce {
                        job.pending_rerun = true;
                    }
                    debug!(job = %job.name, policy = job.misfire_policy.as_str(), "Job misfired while running");
                    report.misfired.push(job.name.clone());
                    to_save.push(job.clone());
                    continue;
                }

                let Some(task) = tasks.get(&job.task).cloned() else {
                    warn!(job = %job.name, task = %job.task, "No task registered for job");
                    job.last_status = JobStatus::Failed;
                    job.last_error = Some(format!("no task registered for '{}'", job.task));
                    to_save.push(job.clone());
                    continue;
                };

                job.running = true;
                job.last_status = JobStatus::Running;
                job.last_run_at = Some(now);
                report.started.push(job.name.clone());
                to_save.push(job.clone());
                to_start.push((job.name.clone(), task));
            }
        }

        for job in &to_save {
            if let Err(e) = self.store.save_job(job) {
                warn!(job = %job.name, "Failed to persist job state: {}", e);
            }
        }
        for (name, task) in to_start {
            info!(job = %name, "Starting scheduled job");
            let this = self.clone();
            let handle = tokio::spawn(async move { this.supervise(name, task).await });
            self.handles.lock().push(handle);
        }
        report
    }

    /// Run a job's task, plus one coalesced rerun if it misfired meanwhile
    async fn supervise(self: Arc<Self>, name: String, task: Arc<dyn JobTask>) {
        loop {
            let Some(snapshot) = self.job(&name) else {
                return;
            };
            let runner = task.clone();
            // Separate task so a panic is recorded as a failure instead of wedging the job
            let result = match tokio::spawn(async move { runner.run(&snapshot).await }).await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("job task panicked: {}", e)),
            };
            if !self.finish(&name, result) {
                return;
            }
            info!(job = %name, "Running coalesced missed occurrence");
        }
    }

    /// Record a finished run. Returns true when a coalesced rerun should start.
    fn finish(&self, name: &str, result: anyhow::Result<JobOutcome>) -> bool {
        let (job, rerun) = {
            let mut jobs = self.jobs.lock();
            let Some(job) = jobs.get_mut(name) else {
                return false;
            };
            job.run_count += 1;
            match result {
                Ok(JobOutcome::Completed(summary)) => {
                    info!(job = %name, "Job completed: {}", summary);
                    job.last_status = JobStatus::Succeeded;
                    job.last_error = None;
                }
                Ok(JobOutcome::Skipped(reason)) => {
                    info!(job = %name, "Job skipped: {}", reason);
                    job.last_status = JobStatus::Skipped;
                    job.last_error = Some(reason);
                    job.misfires += 1;
                }
                Err(e) => {
                    warn!(job = %name, "Job failed: {:#}", e);
                    job.last_status = JobStatus::Failed;
                    job.last_error = Some(format!("{:#}", e));
                }
            }

            let rerun = job.pending_rerun;
            if rerun {
                job.pending_rerun = false;
                job.last_status = JobStatus::Running;
                job.last_run_at = Some(Utc::now());
            } else {
                job.running = false;
            }
            (job.clone(), rerun)
        };

        if let Err(e) = self.store.save_job(&job) {
            warn!(job = %name, "Failed to persist job state: {}", e);
        }
        rerun
    }

    /// Wait for every started job (and its reruns) to finish
    pub async fn wait_idle(&self) {
        loop {
            let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    /// Tick on the policy interval until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let tick_secs = self.policy.current().scheduler.tick_secs.max(1);
        let mut interval = tokio::time::interval(Duration::from_secs(tick_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick_secs, "Scheduler running");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick(Utc::now());
                    if !report.started.is_empty() || !report.misfired.is_empty() {
                        debug!(?report, "Scheduler tick");
                    }
                    self.handles.lock().retain(|h| !h.is_finished());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Counts runs; each run waits for a permit on `gate`
    struct GatedTask {
        calls: AtomicUsize,
        gate: Semaphore,
    }

    impl GatedTask {
        fn new(open: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
            })
        }
    }

    #[async_trait]
    impl JobTask for GatedTask {
        async fn run(&self, _job: &ScheduledJob) -> anyhow::Result<JobOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await?.forget();
            Ok(JobOutcome::Completed("done".into()))
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn scheduler(store: Arc<Store>) -> Arc<Scheduler> {
        let policy = Arc::new(PolicyStore::new(PolicyConfig::default()).unwrap());
        Scheduler::new(store, policy, t(0)).unwrap()
    }

    async fn missed_ticks_while_busy(policy: MisfirePolicy) -> (usize, ScheduledJob) {
        let sched = scheduler(Arc::new(Store::open_in_memory().unwrap()));
        let task = GatedTask::new(false);
        sched.register_task("work", task.clone());
        sched
            .ensure_job(ScheduledJob::new("job", "work", Schedule::every(Duration::from_secs(60)), policy, t(0)), t(0))
            .unwrap();

        assert_eq!(sched.tick(t(60)).started, vec!["job".to_string()]);
        for i in 2..=4 {
            assert_eq!(sched.tick(t(60 * i)).misfired, vec!["job".to_string()]);
        }
        task.gate.add_permits(10);
        sched.wait_idle().await;
        (task.calls.load(Ordering::SeqCst), sched.job("job").unwrap())
    }

    #[test]
    fn test_cron_schedule() {
        let schedule = Schedule::cron("0 3 * * *").unwrap();
        let next = schedule.next_after(t(0)).unwrap();
        assert_eq!(next.format("%H:%M").to_string(), "03:00");
        assert!(next > t(0));
        assert!(Schedule::cron("not a cron").is_err());
    }

    #[tokio::test]
    async fn test_run_once_coalesces_missed_ticks() {
        let (calls, job) = missed_ticks_while_busy(MisfirePolicy::RunOnce).await;
        assert_eq!(calls, 2);
        assert_eq!(job.run_count, 2);
        assert_eq!(job.misfires, 3);
        assert!(!job.running);
        assert!(!job.pending_rerun);
    }

    #[tokio::test]
    async fn test_skip_drops_missed_ticks() {
        let (calls, job) = missed_ticks_while_busy(MisfirePolicy::Skip).await;
        assert_eq!(calls, 1);
        assert_eq!(job.misfires, 3);
        assert_eq!(job.last_status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_not_due_jobs_do_not_start() {
        let sched = scheduler(Arc::new(Store::open_in_memory().unwrap()));
        sched.register_task("work", GatedTask::new(true));
        sched
            .ensure_job(
                ScheduledJob::new("job", "work", Schedule::every(Duration::from_secs(60)), MisfirePolicy::Skip, t(0)),
                t(0),
            )
            .unwrap();
        assert!(sched.tick(t(59)).started.is_empty());
        assert_eq!(sched.tick(t(60)).started.len(), 1);
        sched.wait_idle().await;
        assert_eq!(sched.job("job").unwrap().next_run_at, t(120));
    }

    #[tokio::test]
    async fn test_restart_resumes_and_reruns_interrupted() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut job = ScheduledJob::new("job", "work", Schedule::every(Duration::from_secs(3600)), MisfirePolicy::Skip, t(0));
        job.running = true;
        job.last_status = JobStatus::Running;
        store.save_job(&job).unwrap();

        let sched = scheduler(store.clone());
        let loaded = sched.job("job").unwrap();
        assert_eq!(loaded.last_status, JobStatus::Interrupted);
        assert!(!loaded.running);

        let task = GatedTask::new(true);
        sched.register_task("work", task.clone());
        assert_eq!(sched.tick(t(1)).started, vec!["job".to_string()]);
        sched.wait_idle().await;
        assert_eq!(task.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.load_jobs().unwrap()[0].last_status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_dynamic_jobs() {
        let sched = scheduler(Arc::new(Store::open_in_memory().unwrap()));
        sched.add_dynamic_job("morning", "summarize overnight alerts", "0 7 * * *", t(0)).unwrap();
        assert!(matches!(
            sched.add_dynamic_job("morning", "again", "0 7 * * *", t(0)),
            Err(SchedulerError::Duplicate(_))
        ));
        assert!(matches!(
            sched.add_dynamic_job("bad", "x", "every tuesday", t(0)),
            Err(SchedulerError::InvalidSchedule { .. })
        ));
        assert_eq!(sched.job("morning").unwrap().payload.as_deref(), Some("summarize overnight alerts"));
        assert!(sched.remove_job("morning").unwrap());
        assert!(sched.job("morning").is_none());
    }

    #[tokio::test]
    async fn test_skipped_outcome_counts_as_misfire() {
        struct Busy;
        #[async_trait]
        impl JobTask for Busy {
            async fn run(&self, _job: &ScheduledJob) -> anyhow::Result<JobOutcome> {
                Ok(JobOutcome::Skipped("already running".into()))
            }
        }
        let sched = scheduler(Arc::new(Store::open_in_memory().unwrap()));
        sched.register_task("busy", Arc::new(Busy));
        sched
            .ensure_job(
                ScheduledJob::new("evo", "busy", Schedule::every(Duration::from_secs(10)), MisfirePolicy::Skip, t(0)),
                t(0),
            )
            .unwrap();
        sched.tick(t(10));
        sched.wait_idle().await;
        let job = sched.job("evo").unwrap();
        assert_eq!(job.last_status, JobStatus::Skipped);
        assert_eq!(job.misfires, 1);
    }
}

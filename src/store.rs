//! SQLite persistence
//!
//! One database holds every piece of durable control-plane state:
//! scheduled jobs, evolution runs, lessons, model versions, interaction logs
//! and the keyword memory. Every update is a single-row upsert, except model
//! activation which flips the active flag inside one transaction.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use crate::agent::goal::{Lesson, LessonCategory};
use crate::autonomous::scheduler::{JobStatus, MisfirePolicy, Schedule, ScheduledJob};
use crate::collab::{MemoryRecord, Passage};
use crate::error::{RunFailure, StoreError};
use crate::evolution::dataset::InteractionRecord;
use crate::evolution::models::ModelVersion;
use crate::evolution::pipeline::{EvolutionRun, RunState};
use crate::policy::RoutePath;

pub type Result<T> = std::result::Result<T, StoreError>;

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Shared handle to the runtime database
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        info!("Opened store at {}", path.display());
        Ok(store)
    }

    /// Throwaway database for tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                name TEXT PRIMARY KEY,
                task TEXT NOT NULL,
                payload TEXT,
                schedule TEXT NOT NULL,
                misfire_policy TEXT NOT NULL,
                next_run_at INTEGER NOT NULL,
                last_run_at INTEGER,
                last_status TEXT NOT NULL,
                last_error TEXT,
                running INTEGER NOT NULL DEFAULT 0,
                pending_rerun INTEGER NOT NULL DEFAULT 0,
                misfires INTEGER NOT NULL DEFAULT 0,
                run_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS evolution_runs (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                dataset_ref TEXT,
                record_count INTEGER,
                adapter_ref TEXT,
                candidate_model_ref TEXT,
                artifact_ref TEXT,
                eval_score REAL,
                baseline_score REAL,
                failure TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_state ON evolution_runs(state);

            CREATE TABLE IF NOT EXISTS lessons (
                id TEXT PRIMARY KEY,
                source_goal_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                category TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_lessons_created ON lessons(created_at);

            CREATE TABLE IF NOT EXISTS model_versions (
                id TEXT PRIMARY KEY,
                parent_id TEXT,
                created_at INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 0,
                artifact TEXT,
                score REAL,
                discarded INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS interactions (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                user_input TEXT NOT NULL,
                response TEXT NOT NULL,
                route TEXT NOT NULL,
                quality_score REAL,
                user_feedback TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_interactions_ts ON interactions(timestamp);

            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                source TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_kind ON memories(kind);
            "#,
        )?;
        Ok(())
    }

    /// Cheap liveness probe
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ── Scheduled jobs ────────────────────────────────────────────────

    pub fn save_job(&self, job: &ScheduledJob) -> Result<()> {
        let schedule = serde_json::to_string(&job.schedule)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO scheduled_jobs
            (name, task, payload, schedule, misfire_policy, next_run_at, last_run_at,
             last_status, last_error, running, pending_rerun, misfires, run_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(name) DO UPDATE SET
                task = excluded.task,
                payload = excluded.payload,
                schedule = excluded.schedule,
                misfire_policy = excluded.misfire_policy,
                next_run_at = excluded.next_run_at,
                last_run_at = excluded.last_run_at,
                last_status = excluded.last_status,
                last_error = excluded.last_error,
                running = excluded.running,
                pending_rerun = excluded.pending_rerun,
                misfires = excluded.misfires,
                run_count = excluded.run_count
            "#,
            params![
                job.name,
                job.task,
                job.payload,
                schedule,
                job.misfire_policy.as_str(),
                to_millis(job.next_run_at),
                job.last_run_at.map(to_millis),
                job.last_status.as_str(),
                job.last_error,
                job.running,
                job.pending_rerun,
                job.misfires as i64,
                job.run_count as i64,
            ],
        )?;
        Ok(())
    }

    pub fn load_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, task, payload, schedule, misfire_policy, next_run_at, last_run_at,
                    last_status, last_error, running, pending_rerun, misfires, run_count
             FROM scheduled_jobs ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<i64>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, bool>(9)?,
                row.get::<_, bool>(10)?,
                row.get::<_, i64>(11)?,
                row.get::<_, i64>(12)?,
            ))
        })?;

        let mut jobs = Vec::new();
        for row in rows {
            let (name, task, payload, schedule, misfire, next, last, status, error, running, rerun, misfires, runs) = row?;
            let schedule: Schedule = serde_json::from_str(&schedule)?;
            let misfire_policy = MisfirePolicy::parse(&misfire).ok_or_else(|| StoreError::Corrupt {
                table: "scheduled_jobs",
                reason: format!("unknown misfire policy '{}' for {}", misfire, name),
            })?;
            jobs.push(ScheduledJob {
                name,
                task,
                payload,
                schedule,
                misfire_policy,
                next_run_at: from_millis(next),
                last_run_at: last.map(from_millis),
                last_status: JobStatus::parse(&status).unwrap_or(JobStatus::Never),
                last_error: error,
                running,
                pending_rerun: rerun,
                misfires: misfires.max(0) as u64,
                run_count: runs.max(0) as u64,
            });
        }
        Ok(jobs)
    }

    pub fn delete_job(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM scheduled_jobs WHERE name = ?1", params![name])?;
        Ok(n > 0)
    }

    // ── Evolution runs ────────────────────────────────────────────────

    pub fn save_run(&self, run: &EvolutionRun) -> Result<()> {
        let failure = run.failure.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO evolution_runs
            (id, state, started_at, updated_at, dataset_ref, record_count, adapter_ref,
             candidate_model_ref, artifact_ref, eval_score, baseline_score, failure)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at,
                dataset_ref = excluded.dataset_ref,
                record_count = excluded.record_count,
                adapter_ref = excluded.adapter_ref,
                candidate_model_ref = excluded.candidate_model_ref,
                artifact_ref = excluded.artifact_ref,
                eval_score = excluded.eval_score,
                baseline_score = excluded.baseline_score,
                failure = excluded.failure
            "#,
            params![
                run.id,
                run.state.as_str(),
                to_millis(run.started_at),
                to_millis(run.updated_at),
                run.dataset_ref,
                run.record_count.map(|n| n as i64),
                run.adapter_ref,
                run.candidate_model_ref,
                run.artifact_ref,
                run.eval_score,
                run.baseline_score,
                failure,
            ],
        )?;
        debug!(run_id = %run.id, state = run.state.as_str(), "Persisted evolution run");
        Ok(())
    }

    const RUN_COLUMNS: &'static str = "id, state, started_at, updated_at, dataset_ref, record_count, adapter_ref,
         candidate_model_ref, artifact_ref, eval_score, baseline_score, failure";

    fn load_run_row(row: &rusqlite::Row) -> rusqlite::Result<(EvolutionRun, Option<String>)> {
        let state: String = row.get(1)?;
        let run = EvolutionRun {
            id: row.get(0)?,
            state: RunState::parse(&state).unwrap_or(RunState::Failed),
            started_at: from_millis(row.get(2)?),
            updated_at: from_millis(row.get(3)?),
            dataset_ref: row.get(4)?,
            record_count: row.get::<_, Option<i64>>(5)?.map(|n| n.max(0) as usize),
            adapter_ref: row.get(6)?,
            candidate_model_ref: row.get(7)?,
            artifact_ref: row.get(8)?,
            eval_score: row.get(9)?,
            baseline_score: row.get(10)?,
            failure: None,
        };
        Ok((run, row.get(11)?))
    }

    fn finish_run(entry: (EvolutionRun, Option<String>)) -> Result<EvolutionRun> {
        let (mut run, failure) = entry;
        run.failure = failure
            .map(|f| serde_json::from_str::<RunFailure>(&f))
            .transpose()?;
        Ok(run)
    }

    pub fn load_run(&self, id: &str) -> Result<Option<EvolutionRun>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM evolution_runs WHERE id = ?1", Self::RUN_COLUMNS);
        let entry = conn.query_row(&sql, params![id], Self::load_run_row).optional()?;
        entry.map(Self::finish_run).transpose()
    }

    /// Runs not yet in a terminal state, oldest first
    pub fn open_runs(&self) -> Result<Vec<EvolutionRun>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM evolution_runs
             WHERE state IN ('collecting', 'filtering', 'training', 'merging', 'evaluating', 'deploying')
             ORDER BY started_at ASC",
            Self::RUN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map([], Self::load_run_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        entries.into_iter().map(Self::finish_run).collect()
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<EvolutionRun>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM evolution_runs ORDER BY started_at DESC LIMIT ?1",
            Self::RUN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![limit as i64], Self::load_run_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        entries.into_iter().map(Self::finish_run).collect()
    }

    // ── Lessons ───────────────────────────────────────────────────────

    pub fn save_lesson(&self, lesson: &Lesson) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO lessons (id, source_goal_id, summary, category, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                lesson.id,
                lesson.source_goal_id,
                lesson.summary,
                lesson.category.as_str(),
                to_millis(lesson.created_at),
            ],
        )?;
        Ok(())
    }

    /// Most recent lessons first
    pub fn recent_lessons(&self, limit: usize) -> Result<Vec<Lesson>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, source_goal_id, summary, category, created_at
             FROM lessons ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let lessons = stmt
            .query_map(params![limit as i64], |row| {
                let category: String = row.get(3)?;
                Ok(Lesson {
                    id: row.get(0)?,
                    source_goal_id: row.get(1)?,
                    summary: row.get(2)?,
                    category: LessonCategory::parse(&category).unwrap_or(LessonCategory::Insight),
                    created_at: from_millis(row.get(4)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(lessons)
    }

    // ── Model versions ────────────────────────────────────────────────

    pub fn save_version(&self, version: &ModelVersion) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO model_versions (id, parent_id, created_at, active, artifact, score, discarded)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                artifact = excluded.artifact,
                score = excluded.score,
                discarded = excluded.discarded
            "#,
            params![
                version.id,
                version.parent_id,
                to_millis(version.created_at),
                version.active,
                version.artifact,
                version.score,
                version.discarded,
            ],
        )?;
        Ok(())
    }

    pub fn load_versions(&self) -> Result<Vec<ModelVersion>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, parent_id, created_at, active, artifact, score, discarded
             FROM model_versions ORDER BY created_at ASC, rowid ASC",
        )?;
        let versions = stmt
            .query_map([], |row| {
                Ok(ModelVersion {
                    id: row.get(0)?,
                    parent_id: row.get(1)?,
                    created_at: from_millis(row.get(2)?),
                    active: row.get(3)?,
                    artifact: row.get(4)?,
                    score: row.get(5)?,
                    discarded: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(versions)
    }

    /// Make `id` the only active version, atomically
    pub fn activate_version(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM model_versions WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::Corrupt {
                table: "model_versions",
                reason: format!("cannot activate unknown version {}", id),
            });
        }
        tx.execute("UPDATE model_versions SET active = 0 WHERE active = 1", [])?;
        tx.execute("UPDATE model_versions SET active = 1 WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // ── Interactions ──────────────────────────────────────────────────

    pub fn save_interaction(&self, record: &InteractionRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO interactions
            (id, timestamp, user_input, response, route, quality_score, user_feedback)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.id,
                to_millis(record.timestamp),
                record.user_input,
                record.response,
                record.route.as_str(),
                record.quality_score,
                record.user_feedback,
            ],
        )?;
        Ok(())
    }

    /// Attach user feedback and/or a quality score. Returns false for unknown ids.
    pub fn update_feedback(&self, id: &str, feedback: Option<&str>, score: Option<f64>) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE interactions
             SET user_feedback = COALESCE(?2, user_feedback),
                 quality_score = COALESCE(?3, quality_score)
             WHERE id = ?1",
            params![id, feedback, score],
        )?;
        Ok(n > 0)
    }

    pub fn load_interactions(&self) -> Result<Vec<InteractionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, user_input, response, route, quality_score, user_feedback
             FROM interactions ORDER BY timestamp ASC, rowid ASC",
        )?;
        let records = stmt
            .query_map([], |row| {
                let route: String = row.get(4)?;
                Ok(InteractionRecord {
                    id: row.get(0)?,
                    timestamp: from_millis(row.get(1)?),
                    user_input: row.get(2)?,
                    response: row.get(3)?,
                    route: RoutePath::parse(&route).unwrap_or(RoutePath::Local),
                    quality_score: row.get(5)?,
                    user_feedback: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    // ── Memory ────────────────────────────────────────────────────────

    pub fn insert_memory(&self, record: &MemoryRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memories (id, kind, content, source, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid::Uuid::new_v4().to_string(),
                record.kind,
                record.content,
                record.source,
                to_millis(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Keyword search: rank by the share of query terms each memory contains
    pub fn search_memories(&self, query: &str, k: usize) -> Result<Vec<Passage>> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(String::from)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let clause = terms.iter().map(|_| "LOWER(content) LIKE ?").collect::<Vec<_>>().join(" OR ");
        let sql = format!(
            "SELECT content, source FROM memories WHERE {} ORDER BY created_at DESC LIMIT 500",
            clause
        );
        let patterns: Vec<String> = terms.iter().map(|t| format!("%{}%", t)).collect();

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(patterns.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut passages: Vec<Passage> = rows
            .into_iter()
            .map(|(content, source)| {
                let lower = content.to_lowercase();
                let hits = terms.iter().filter(|t| lower.contains(t.as_str())).count();
                Passage {
                    content,
                    source,
                    score: hits as f64 / terms.len() as f64,
                }
            })
            .collect();
        passages.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        passages.truncate(k);
        Ok(passages)
    }

    /// Drop exact duplicate memories, keeping the oldest copy
    pub fn dedupe_memories(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM memories WHERE rowid NOT IN (
                 SELECT MIN(rowid) FROM memories GROUP BY kind, content
             )",
            [],
        )?;
        Ok(removed)
    }

    pub fn memory_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
        Ok(n.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_search_ranks_by_overlap() {
        let store = Store::open_in_memory().unwrap();
        for content in [
            "The backup job runs nightly at 02:00",
            "Nightly backup failed because the disk was full",
            "User prefers dark mode",
        ] {
            store
                .insert_memory(&MemoryRecord {
                    kind: "fact".into(),
                    content: content.into(),
                    source: None,
                })
                .unwrap();
        }

        let hits = store.search_memories("why did the nightly backup fail?", 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].content.contains("failed"));
        assert!(hits.iter().all(|p| !p.content.contains("dark mode")));
    }

    #[test]
    fn test_dedupe_memories() {
        let store = Store::open_in_memory().unwrap();
        let record = MemoryRecord {
            kind: "lesson".into(),
            content: "retry flaky network calls".into(),
            source: Some("goal-1".into()),
        };
        store.insert_memory(&record).unwrap();
        store.insert_memory(&record).unwrap();
        assert_eq!(store.memory_count().unwrap(), 2);
        assert_eq!(store.dedupe_memories().unwrap(), 1);
        assert_eq!(store.memory_count().unwrap(), 1);
    }

    #[test]
    fn test_activate_version_is_exclusive() {
        let store = Store::open_in_memory().unwrap();
        let a = ModelVersion::base("base.gguf");
        let mut b = ModelVersion::candidate("cand", &a.id);
        b.artifact = Some("cand.gguf".into());
        store.save_version(&a).unwrap();
        store.save_version(&b).unwrap();

        store.activate_version(&a.id).unwrap();
        store.activate_version(&b.id).unwrap();
        let versions = store.load_versions().unwrap();
        let active: Vec<_> = versions.iter().filter(|v| v.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);

        assert!(store.activate_version("missing").is_err());
        let still: Vec<_> = store.load_versions().unwrap().into_iter().filter(|v| v.active).collect();
        assert_eq!(still[0].id, b.id);
    }
}

//! Interaction log and training dataset builder
//!
//! Every routed request is logged as an [`InteractionRecord`]. An evolution
//! run turns those records plus lessons into two JSONL files under the data
//! directory:
//!
//! - `<run>.raw.jsonl`: everything collected
//! - `<run>.jsonl`: filtered instruction/output pairs handed to the trainer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::agent::goal::LessonCategory;
use crate::error::StoreError;
use crate::policy::{EvolutionPolicy, RoutePath};
use crate::store::Store;

/// Feedback containing any of these counts as negative
const NEGATIVE_FEEDBACK: &[&str] = &["bad", "wrong", "incorrect", "terrible"];

/// Lessons offered to a dataset, newest first
const LESSON_LIMIT: usize = 1000;

/// One request/response pair seen by the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_input: String,
    pub response: String,
    pub route: RoutePath,
    pub quality_score: Option<f64>,
    pub user_feedback: Option<String>,
}

impl InteractionRecord {
    pub fn new(user_input: &str, response: &str, route: RoutePath) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            user_input: user_input.to_string(),
            response: response.to_string(),
            route,
            quality_score: None,
            user_feedback: None,
        }
    }

    fn has_negative_feedback(&self) -> bool {
        self.user_feedback
            .as_deref()
            .map(|f| {
                let lower = f.to_lowercase();
                NEGATIVE_FEEDBACK.iter().any(|bad| lower.contains(bad))
            })
            .unwrap_or(false)
    }

    /// Whether this record is fit for training under `rules`
    pub fn is_trainable(&self, rules: &EvolutionPolicy) -> bool {
        if self.has_negative_feedback() {
            return false;
        }
        if self.quality_score.map(|s| s < rules.min_quality).unwrap_or(false) {
            return false;
        }
        if self.response.trim().chars().count() < rules.min_record_length {
            return false;
        }
        if self.user_input.trim().chars().count() < rules.min_input_length {
            return false;
        }
        // Train local behavior only
        self.route != RoutePath::External
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityStats {
    pub total: usize,
    pub scored: usize,
    pub avg_score: f64,
}

/// Persistent interaction log
pub struct InteractionLog {
    store: Arc<Store>,
}

impl InteractionLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn record(&self, record: &InteractionRecord) -> Result<(), StoreError> {
        self.store.save_interaction(record)?;
        debug!(id = %record.id, route = record.route.as_str(), "Logged interaction");
        Ok(())
    }

    /// Attach user feedback and/or a quality score. False if the id is unknown.
    pub fn feedback(&self, id: &str, feedback: Option<&str>, score: Option<f64>) -> Result<bool, StoreError> {
        self.store.update_feedback(id, feedback, score)
    }

    pub fn stats(&self) -> Result<QualityStats, StoreError> {
        let records = self.store.load_interactions()?;
        let scores: Vec<f64> = records.iter().filter_map(|r| r.quality_score).collect();
        let avg_score = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        Ok(QualityStats {
            total: records.len(),
            scored: scores.len(),
            avg_score,
        })
    }
}

/// Trainer input line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub instruction: String,
    pub input: String,
    pub output: String,
}

/// Writes collected and filtered datasets for evolution runs
pub struct DatasetBuilder {
    store: Arc<Store>,
    dir: PathBuf,
}

impl DatasetBuilder {
    pub fn new(store: Arc<Store>, dir: impl Into<PathBuf>) -> Self {
        Self { store, dir: dir.into() }
    }

    pub fn raw_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.raw.jsonl", run_id))
    }

    pub fn filtered_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", run_id))
    }

    /// Snapshot interactions and lessons into the raw dataset. Returns its path and size.
    pub fn collect(&self, run_id: &str) -> Result<(PathBuf, usize), StoreError> {
        let mut records = self.store.load_interactions()?;
        for lesson in self.store.recent_lessons(LESSON_LIMIT)? {
            if lesson.category == LessonCategory::NoActionableLesson {
                continue;
            }
            records.push(InteractionRecord {
                id: lesson.id.clone(),
                timestamp: lesson.created_at,
                user_input: format!("What have you learned ({}) from past goals?", lesson.category.as_str()),
                response: lesson.summary.clone(),
                route: RoutePath::Local,
                quality_score: None,
                user_feedback: None,
            });
        }

        let path = self.raw_path(run_id);
        write_jsonl(&path, &records)?;
        info!(run_id, records = records.len(), "Collected raw dataset at {}", path.display());
        Ok((path, records.len()))
    }

    /// Apply the quality filter to a raw dataset. Returns the training file and its size.
    pub fn filter(&self, run_id: &str, raw: &Path, rules: &EvolutionPolicy) -> Result<(PathBuf, usize), StoreError> {
        let records: Vec<InteractionRecord> = read_jsonl(raw)?;
        let examples: Vec<TrainingExample> = records
            .iter()
            .filter(|r| r.is_trainable(rules))
            .map(|r| TrainingExample {
                instruction: r.user_input.clone(),
                input: String::new(),
                output: r.response.clone(),
            })
            .collect();

        let path = self.filtered_path(run_id);
        write_jsonl(&path, &examples)?;
        info!(
            run_id,
            raw = records.len(),
            kept = examples.len(),
            "Filtered dataset at {}",
            path.display()
        );
        Ok((path, examples.len()))
    }
}

fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Write to a sibling then rename so a crash never leaves a half file under the real name
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut out = BufWriter::new(std::fs::File::create(&tmp)?);
        for item in items {
            serde_json::to_writer(&mut out, item)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a JSONL file, skipping lines that do not parse
pub fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, StoreError> {
    let file = std::fs::File::open(path)?;
    let mut items = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(item) => items.push(item),
            Err(e) => debug!("Skipping malformed dataset line: {}", e),
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::goal::Lesson;

    fn record(input: &str, response: &str, route: RoutePath) -> InteractionRecord {
        InteractionRecord::new(input, response, route)
    }

    #[test]
    fn test_filter_rules() {
        let rules = EvolutionPolicy::default();
        assert!(record("how do I list files?", "Use ls -la in the directory.", RoutePath::Local).is_trainable(&rules));
        assert!(!record("hi", "Hello! How can I help you today?", RoutePath::Local).is_trainable(&rules));
        assert!(!record("how do I list files?", "ls", RoutePath::Local).is_trainable(&rules));
        assert!(!record("how do I list files?", "Use ls -la in the directory.", RoutePath::External).is_trainable(&rules));

        let mut low = record("how do I list files?", "Use ls -la in the directory.", RoutePath::RagLocal);
        low.quality_score = Some(0.2);
        assert!(!low.is_trainable(&rules));

        let mut disliked = record("how do I list files?", "Use ls -la in the directory.", RoutePath::Local);
        disliked.user_feedback = Some("That was WRONG".into());
        assert!(!disliked.is_trainable(&rules));
    }

    #[test]
    fn test_collect_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .save_interaction(&record("summarize the logs", "The logs show two restarts.", RoutePath::Local))
            .unwrap();
        store
            .save_interaction(&record("ask the cloud", "A long answer from far away.", RoutePath::External))
            .unwrap();
        store
            .save_lesson(&Lesson::new("g1", "Check disk space before large downloads", LessonCategory::Failure))
            .unwrap();
        store
            .save_lesson(&Lesson::new("g2", "No actionable lesson: goal x", LessonCategory::NoActionableLesson))
            .unwrap();

        let builder = DatasetBuilder::new(store, dir.path());
        let (raw, collected) = builder.collect("run-1").unwrap();
        assert_eq!(collected, 3);

        let (filtered, kept) = builder.filter("run-1", &raw, &EvolutionPolicy::default()).unwrap();
        assert_eq!(kept, 2);
        let examples: Vec<TrainingExample> = read_jsonl(&filtered).unwrap();
        assert!(examples.iter().any(|e| e.output == "Check disk space before large downloads"));
        assert!(!dir.path().join("run-1.jsonl.tmp").exists());
    }

    #[test]
    fn test_feedback_and_stats() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let log = InteractionLog::new(store);
        let r = record("what time is it?", "It is noon.", RoutePath::Local);
        log.record(&r).unwrap();
        assert!(log.feedback(&r.id, Some("great"), Some(0.9)).unwrap());
        assert!(!log.feedback("missing", None, Some(0.1)).unwrap());
        let stats = log.stats().unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.scored, 1);
        assert!((stats.avg_score - 0.9).abs() < 1e-9);
    }
}

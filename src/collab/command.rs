//! Trainer adapter that shells out to external commands
//!
//! Each operation runs a configured command line. Inputs arrive through
//! environment variables; the last stdout line must be a JSON object:
//!
//! | operation | env                                  | output                    |
//! |-----------|--------------------------------------|---------------------------|
//! | train     | `SOVRA_DATASET`                      | `{"adapter": "<ref>"}`    |
//! | merge     | `SOVRA_BASE`, `SOVRA_ADAPTER`        | `{"artifact": "<ref>"}`   |
//! | evaluate  | `SOVRA_ARTIFACT`                     | `{"score": <float>}`      |

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use super::shell::run_command;
use super::Trainer;
use crate::error::CollabError;

#[derive(Debug, Clone, Default)]
pub struct CommandTrainer {
    pub train_cmd: Option<String>,
    pub merge_cmd: Option<String>,
    pub eval_cmd: Option<String>,
    /// Upper bound for a single command; the pipeline applies its own stage deadline too
    pub timeout: Option<Duration>,
}

impl CommandTrainer {
    async fn run(&self, op: &str, cmd: &Option<String>, envs: &[(&str, &str)]) -> Result<serde_json::Value, CollabError> {
        let cmd = cmd
            .as_deref()
            .ok_or_else(|| CollabError::Unavailable(format!("no {} command configured", op)))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(24 * 3600));

        info!(op, "Running trainer command");
        let output = run_command(cmd, envs, None, timeout).await?;
        if !output.success() {
            return Err(CollabError::from_message(format!(
                "{} command failed ({:?}): {}",
                op,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        parse_last_json(&output.stdout)
            .ok_or_else(|| CollabError::Rejected(format!("{} command printed no JSON result", op)))
    }
}

fn parse_last_json(stdout: &str) -> Option<serde_json::Value> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(|l| serde_json::from_str::<serde_json::Value>(l).ok().filter(|v| v.is_object()))
}

fn field_str(value: &serde_json::Value, key: &str) -> Result<String, CollabError> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| CollabError::Rejected(format!("result is missing '{}'", key)))
}

#[async_trait]
impl Trainer for CommandTrainer {
    async fn train(&self, dataset: &str) -> Result<String, CollabError> {
        let out = self.run("train", &self.train_cmd, &[("SOVRA_DATASET", dataset)]).await?;
        field_str(&out, "adapter")
    }

    async fn merge(&self, base: &str, adapter: &str) -> Result<String, CollabError> {
        let out = self
            .run("merge", &self.merge_cmd, &[("SOVRA_BASE", base), ("SOVRA_ADAPTER", adapter)])
            .await?;
        field_str(&out, "artifact")
    }

    async fn evaluate(&self, artifact: &str) -> Result<f64, CollabError> {
        let out = self.run("evaluate", &self.eval_cmd, &[("SOVRA_ARTIFACT", artifact)]).await?;
        out.get("score")
            .and_then(|s| s.as_f64())
            .filter(|s| s.is_finite())
            .ok_or_else(|| CollabError::Rejected("result is missing a numeric 'score'".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_last_json_line() {
        let out = "epoch 1 loss=0.9\nepoch 2 loss=0.4\n{\"adapter\": \"/tmp/a\"}\n\n";
        assert_eq!(parse_last_json(out).unwrap()["adapter"], "/tmp/a");
        assert!(parse_last_json("no json here").is_none());
    }

    #[tokio::test]
    async fn test_evaluate_via_command() {
        let trainer = CommandTrainer {
            eval_cmd: Some("echo \"{\\\"score\\\": 0.82}\"".into()),
            ..Default::default()
        };
        let score = trainer.evaluate("/models/x").await.unwrap();
        assert!((score - 0.82).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_command_is_unavailable() {
        let trainer = CommandTrainer::default();
        let err = trainer.train("/data/x.jsonl").await.unwrap_err();
        assert!(matches!(err, CollabError::Unavailable(_)));
    }
}

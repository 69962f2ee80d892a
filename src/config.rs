//! Process configuration

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Runtime configuration from environment variables (and `.env`)
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database for all durable state
    pub db_path: PathBuf,

    /// Datasets and other evolution artifacts
    pub data_dir: PathBuf,

    /// Policy document (TOML); defaults apply when missing
    pub policy_path: PathBuf,

    /// Ollama server for the local model
    pub ollama_url: String,

    /// Base model reference, used until an evolved version is deployed
    pub model: String,

    /// Ollama-compatible server for the external path (optional)
    pub external_url: Option<String>,

    pub external_model: String,

    /// Overrides the policy's external daily limit
    pub external_daily_limit: Option<u32>,

    pub train_cmd: Option<String>,
    pub merge_cmd: Option<String>,
    pub eval_cmd: Option<String>,

    /// Working directory for the shell skill
    pub workdir: Option<PathBuf>,

    /// Approve every confirmation request without asking
    pub auto_approve: bool,

    /// Emit JSON logs
    pub log_json: bool,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn flag(name: &str) -> bool {
    var(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let data_dir = var("SOVRA_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("sovra")
        });

        let db_path = var("SOVRA_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("sovra.db"));

        let policy_path = var("SOVRA_POLICY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("policy.toml"));

        let external_daily_limit = var("SOVRA_EXTERNAL_DAILY_LIMIT")
            .map(|v| v.parse::<u32>())
            .transpose()
            .context("SOVRA_EXTERNAL_DAILY_LIMIT must be a non-negative integer")?;

        Ok(Self {
            db_path,
            data_dir,
            policy_path,
            ollama_url: var("OLLAMA_URL").unwrap_or_else(|| "http://localhost:11434".to_string()),
            model: var("SOVRA_MODEL").unwrap_or_else(|| "qwen2.5:7b".to_string()),
            external_url: var("SOVRA_EXTERNAL_URL"),
            external_model: var("SOVRA_EXTERNAL_MODEL").unwrap_or_else(|| "llama3.1:70b".to_string()),
            external_daily_limit,
            train_cmd: var("SOVRA_TRAIN_CMD"),
            merge_cmd: var("SOVRA_MERGE_CMD"),
            eval_cmd: var("SOVRA_EVAL_CMD"),
            workdir: var("SOVRA_WORKDIR").map(PathBuf::from),
            auto_approve: flag("SOVRA_AUTO_APPROVE"),
            log_json: flag("SOVRA_LOG_JSON"),
        })
    }
}

// Platform-specific dirs fallback
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
                .ok()
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").map(PathBuf::from).ok()
        }

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            std::env::var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .ok()
                .or_else(|| {
                    std::env::var("HOME")
                        .map(|h| PathBuf::from(h).join(".local/share"))
                        .ok()
                })
        }
    }
}

//! Policy Store
//!
//! Personality, autonomy level, router rules, safety boundaries and runtime
//! thresholds, loaded from a TOML document:
//! - Validated once at load; a malformed document is a fatal configuration error
//! - Each loaded document becomes an immutable generation
//! - Reloads swap the generation atomically; in-flight decisions keep the one they read

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::redact::Redactor;

/// How much the agent may do without a human
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    /// Every step runs without confirmation
    Full,
    /// Dangerous steps need confirmation
    #[default]
    Supervised,
    /// Only steps present in the user's instruction may run
    Restricted,
}

impl AutonomyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Supervised => "supervised",
            Self::Restricted => "restricted",
        }
    }
}

/// Handling path selected by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePath {
    /// Local model only
    Local,
    /// Local model with memory retrieval
    #[serde(alias = "ragLocal")]
    RagLocal,
    /// External inference provider
    External,
}

impl RoutePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::RagLocal => "rag_local",
            Self::External => "external",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "local" => Some(Self::Local),
            "rag_local" | "raglocal" | "rag" => Some(Self::RagLocal),
            "external" => Some(Self::External),
            _ => None,
        }
    }
}

/// Declared (or inferred) kind of request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Chat,
    Recall,
    Code,
    Reasoning,
    Task,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Recall => "recall",
            Self::Code => "code",
            Self::Reasoning => "reasoning",
            Self::Task => "task",
        }
    }
}

/// Conditions of a router rule. Every specified field must hold; an empty
/// condition matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleCondition {
    pub task_type: Option<TaskType>,
    pub min_complexity: Option<f64>,
    pub max_complexity: Option<f64>,
    pub user_override: Option<RoutePath>,
}

impl RuleCondition {
    pub fn is_catch_all(&self) -> bool {
        self == &Self::default()
    }
}

/// One ordered router rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterRule {
    pub name: String,
    #[serde(default)]
    pub when: RuleCondition,
    pub path: RoutePath,
}

/// Named credential pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedactionPattern {
    pub name: String,
    pub regex: String,
}

/// Weighted-keyword complexity heuristic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityConfig {
    /// Score every request starts from
    pub base: f64,
    /// Contribution of request length, reached at `length_saturation` chars
    pub length_weight: f64,
    pub length_saturation: usize,
    /// Keyword -> weight added when the keyword occurs
    pub keywords: HashMap<String, f64>,
}

impl Default for ComplexityConfig {
    fn default() -> Self {
        let keywords = [
            ("analyze", 0.25),
            ("architecture", 0.3),
            ("design", 0.2),
            ("prove", 0.35),
            ("optimize", 0.25),
            ("refactor", 0.25),
            ("algorithm", 0.3),
            ("compare", 0.15),
            ("explain why", 0.2),
            ("step by step", 0.2),
            ("security", 0.25),
            ("math", 0.2),
        ]
        .into_iter()
        .map(|(k, w)| (k.to_string(), w))
        .collect();

        Self {
            base: 0.1,
            length_weight: 0.3,
            length_saturation: 1200,
            keywords,
        }
    }
}

/// Execution loop and goal supervision thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPolicy {
    pub max_concurrent_goals: usize,
    /// Consecutive iterations without a succeeded step before a goal is stalled
    pub stall_iterations: usize,
    pub max_step_retries: usize,
    pub max_replans: usize,
    pub max_steps: usize,
    pub step_timeout_secs: u64,
    pub confirmation_timeout_secs: u64,
    pub inference_timeout_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Concurrent best-effort reflections on successful goals
    pub reflection_concurrency: usize,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_concurrent_goals: 4,
            stall_iterations: 5,
            max_step_retries: 3,
            max_replans: 2,
            max_steps: 20,
            step_timeout_secs: 120,
            confirmation_timeout_secs: 300,
            inference_timeout_secs: 90,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            reflection_concurrency: 2,
        }
    }
}

impl ExecutionPolicy {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }
}

/// Proactive scheduler timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerPolicy {
    pub tick_secs: u64,
    pub health_check_enabled: bool,
    pub health_check_hours: u64,
    pub memory_maintenance_enabled: bool,
    pub memory_maintenance_hours: u64,
    pub evolution_enabled: bool,
    pub evolution_hours: u64,
    /// Overrides `evolution_hours` when set
    pub evolution_cron: Option<String>,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            health_check_enabled: true,
            health_check_hours: 24,
            memory_maintenance_enabled: true,
            memory_maintenance_hours: 168,
            evolution_enabled: true,
            evolution_hours: 168,
            evolution_cron: None,
        }
    }
}

/// Self-evolution thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionPolicy {
    pub min_dataset_size: usize,
    /// Candidate passes iff `candidate >= baseline - tolerance`
    pub tolerance: f64,
    pub min_quality: f64,
    pub min_record_length: usize,
    pub min_input_length: usize,
    pub stage_timeout_secs: u64,
}

impl Default for EvolutionPolicy {
    fn default() -> Self {
        Self {
            min_dataset_size: 200,
            tolerance: 0.02,
            min_quality: 0.5,
            min_record_length: 10,
            min_input_length: 5,
            stage_timeout_secs: 6 * 3600,
        }
    }
}

impl EvolutionPolicy {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

/// The policy document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub name: String,
    pub autonomy_level: AutonomyLevel,
    pub blocked_commands: BTreeSet<String>,
    pub router_rules: Vec<RouterRule>,
    pub redaction: Vec<RedactionPattern>,
    pub complexity: ComplexityConfig,
    pub external_daily_limit: u32,
    pub execution: ExecutionPolicy,
    pub scheduler: SchedulerPolicy,
    pub evolution: EvolutionPolicy,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            name: "SOVRA".to_string(),
            autonomy_level: AutonomyLevel::default(),
            blocked_commands: default_blocked_commands(),
            router_rules: default_router_rules(),
            redaction: default_redaction_patterns(),
            complexity: ComplexityConfig::default(),
            external_daily_limit: 50,
            execution: ExecutionPolicy::default(),
            scheduler: SchedulerPolicy::default(),
            evolution: EvolutionPolicy::default(),
        }
    }
}

fn default_blocked_commands() -> BTreeSet<String> {
    [
        "rm -rf", "mkfs", "dd if=", "shutdown", "reboot", "kill -9",
        "chmod 777", "> /dev/sd", "curl | sh", "wget | sh",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_router_rules() -> Vec<RouterRule> {
    let rule = |name: &str, when: RuleCondition, path: RoutePath| RouterRule {
        name: name.to_string(),
        when,
        path,
    };
    vec![
        rule(
            "override_local",
            RuleCondition { user_override: Some(RoutePath::Local), ..Default::default() },
            RoutePath::Local,
        ),
        rule(
            "override_rag",
            RuleCondition { user_override: Some(RoutePath::RagLocal), ..Default::default() },
            RoutePath::RagLocal,
        ),
        rule(
            "override_external",
            RuleCondition { user_override: Some(RoutePath::External), ..Default::default() },
            RoutePath::External,
        ),
        rule(
            "recall_uses_memory",
            RuleCondition { task_type: Some(TaskType::Recall), ..Default::default() },
            RoutePath::RagLocal,
        ),
        rule(
            "complex_goes_external",
            RuleCondition { min_complexity: Some(0.75), ..Default::default() },
            RoutePath::External,
        ),
    ]
}

/// Credential patterns redacted before content leaves the process or is logged
pub fn default_redaction_patterns() -> Vec<RedactionPattern> {
    [
        ("anthropic_key", r"sk-ant-[A-Za-z0-9_\-]{20,}"),
        ("openrouter_key", r"sk-or-[A-Za-z0-9_\-]{20,}"),
        ("openai_key", r"sk-[A-Za-z0-9]{20,}"),
        ("google_api_key", r"AIza[A-Za-z0-9_\-]{35}"),
        ("aws_access_key", r"AKIA[0-9A-Z]{16}"),
        ("bearer_token", r"(?i)bearer\s+[A-Za-z0-9._~+/\-]{20,}=*"),
        ("hex_secret", r"\b[a-f0-9]{32,64}\b"),
    ]
    .into_iter()
    .map(|(name, regex)| RedactionPattern {
        name: name.to_string(),
        regex: regex.to_string(),
    })
    .collect()
}

impl PolicyConfig {
    /// Parse and validate a TOML policy document
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: PolicyConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every constraint the runtime relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for (i, rule) in self.router_rules.iter().enumerate() {
            let field = format!("router_rules[{}]", i);
            if rule.name.trim().is_empty() {
                return Err(ConfigError::invalid(field, "rule name is empty"));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::invalid(field, format!("duplicate rule name '{}'", rule.name)));
            }
            for bound in [rule.when.min_complexity, rule.when.max_complexity].into_iter().flatten() {
                if !(0.0..=1.0).contains(&bound) {
                    return Err(ConfigError::invalid(field, format!("complexity bound {} outside [0, 1]", bound)));
                }
            }
            if let (Some(min), Some(max)) = (rule.when.min_complexity, rule.when.max_complexity) {
                if min > max {
                    return Err(ConfigError::invalid(field, format!("min_complexity {} > max_complexity {}", min, max)));
                }
            }
        }

        // Compiling is the validation for patterns
        Redactor::new(&self.redaction)?;

        if self.blocked_commands.iter().any(|c| c.trim().is_empty()) {
            return Err(ConfigError::invalid("blocked_commands", "empty entry"));
        }

        let exec = &self.execution;
        for (field, value) in [
            ("execution.max_concurrent_goals", exec.max_concurrent_goals),
            ("execution.stall_iterations", exec.stall_iterations),
            ("execution.max_steps", exec.max_steps),
            ("execution.reflection_concurrency", exec.reflection_concurrency),
            ("execution.step_timeout_secs", exec.step_timeout_secs as usize),
            ("execution.inference_timeout_secs", exec.inference_timeout_secs as usize),
            ("scheduler.tick_secs", self.scheduler.tick_secs as usize),
            ("evolution.min_dataset_size", self.evolution.min_dataset_size),
            ("evolution.stage_timeout_secs", self.evolution.stage_timeout_secs as usize),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        if exec.backoff_initial_ms > exec.backoff_max_ms {
            return Err(ConfigError::invalid("execution.backoff_initial_ms", "exceeds backoff_max_ms"));
        }

        let evo = &self.evolution;
        if !evo.tolerance.is_finite() || evo.tolerance < 0.0 {
            return Err(ConfigError::invalid("evolution.tolerance", "must be a non-negative number"));
        }
        if !(0.0..=1.0).contains(&evo.min_quality) {
            return Err(ConfigError::invalid("evolution.min_quality", "outside [0, 1]"));
        }

        let sched = &self.scheduler;
        if sched.health_check_hours == 0 || sched.memory_maintenance_hours == 0 || sched.evolution_hours == 0 {
            return Err(ConfigError::invalid("scheduler", "job intervals must be greater than zero"));
        }
        if let Some(expr) = &sched.evolution_cron {
            crate::autonomous::scheduler::Schedule::cron(expr)
                .map_err(|e| ConfigError::invalid("scheduler.evolution_cron", e.to_string()))?;
        }

        Ok(())
    }

    /// Whether a step's action or arguments contain a blocked command
    pub fn is_dangerous(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.blocked_commands
            .iter()
            .any(|blocked| lower.contains(&blocked.to_lowercase()))
    }
}

/// One immutable policy generation with its compiled parts
#[derive(Debug)]
pub struct Policy {
    pub generation: u64,
    pub config: PolicyConfig,
    pub redactor: Redactor,
}

impl Policy {
    fn compile(generation: u64, config: PolicyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let redactor = Redactor::new(&config.redaction)?;
        Ok(Self {
            generation,
            config,
            redactor,
        })
    }
}

impl std::ops::Deref for Policy {
    type Target = PolicyConfig;

    fn deref(&self) -> &PolicyConfig {
        &self.config
    }
}

/// Holder of the current policy generation
pub struct PolicyStore {
    current: ArcSwap<Policy>,
    source: Option<PathBuf>,
    next_generation: AtomicU64,
}

impl PolicyStore {
    /// Build a store from an in-memory document
    pub fn new(config: PolicyConfig) -> Result<Self, ConfigError> {
        let policy = Policy::compile(1, config)?;
        Ok(Self {
            current: ArcSwap::from_pointee(policy),
            source: None,
            next_generation: AtomicU64::new(2),
        })
    }

    /// Load from a TOML file. Missing file falls back to defaults; a malformed
    /// one is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = if path.exists() {
            read_policy(path)?
        } else {
            warn!("Policy file {} not found, using defaults", path.display());
            PolicyConfig::default()
        };
        let mut store = Self::new(config)?;
        store.source = Some(path.to_path_buf());
        info!("Loaded policy from {} (generation 1)", path.display());
        Ok(store)
    }

    /// Lock-free read of the current generation
    pub fn current(&self) -> Arc<Policy> {
        self.current.load_full()
    }

    /// Replace the policy. On validation failure the previous generation stays.
    pub fn replace(&self, config: PolicyConfig) -> Result<u64, ConfigError> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let policy = Policy::compile(generation, config)?;
        self.current.store(Arc::new(policy));
        info!(generation, "Policy generation activated");
        Ok(generation)
    }

    /// Re-read the source file
    pub fn reload(&self) -> Result<u64, ConfigError> {
        let Some(path) = &self.source else {
            return Err(ConfigError::invalid("policy", "store has no source file"));
        };
        match read_policy(path).and_then(|config| self.replace(config)) {
            Ok(generation) => Ok(generation),
            Err(e) => {
                warn!("Policy reload rejected, keeping generation {}: {}", self.current().generation, e);
                Err(e)
            }
        }
    }
}

fn read_policy(path: &Path) -> Result<PolicyConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    PolicyConfig::from_toml(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        assert!(PolicyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_document() {
        let doc = r#"
            autonomy_level = "restricted"
            blocked_commands = ["rm -rf"]

            [[router_rules]]
            name = "code_external"
            path = "external"
            when = { task_type = "code", min_complexity = 0.5 }

            [[router_rules]]
            name = "fallback"
            path = "rag_local"

            [execution]
            stall_iterations = 3
        "#;
        let config = PolicyConfig::from_toml(doc).unwrap();
        assert_eq!(config.autonomy_level, AutonomyLevel::Restricted);
        assert_eq!(config.router_rules.len(), 2);
        assert_eq!(config.router_rules[0].when.task_type, Some(TaskType::Code));
        assert!(config.router_rules[1].when.is_catch_all());
        assert_eq!(config.execution.stall_iterations, 3);
        assert_eq!(config.execution.max_step_retries, 3);
    }

    #[test]
    fn test_malformed_rules_rejected() {
        let bad_path = r#"
            [[router_rules]]
            name = "x"
            path = "somewhere"
        "#;
        assert!(matches!(PolicyConfig::from_toml(bad_path), Err(ConfigError::Parse(_))));

        let bad_bounds = r#"
            [[router_rules]]
            name = "x"
            path = "local"
            when = { min_complexity = 0.9, max_complexity = 0.2 }
        "#;
        assert!(matches!(PolicyConfig::from_toml(bad_bounds), Err(ConfigError::Invalid { .. })));

        let dup = r#"
            [[router_rules]]
            name = "x"
            path = "local"
            [[router_rules]]
            name = "x"
            path = "external"
        "#;
        assert!(PolicyConfig::from_toml(dup).is_err());

        let bad_regex = r#"
            [[redaction]]
            name = "broken"
            regex = "([a-z"
        "#;
        assert!(PolicyConfig::from_toml(bad_regex).is_err());
    }

    #[test]
    fn test_reload_swaps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, "autonomy_level = \"full\"").unwrap();

        let store = PolicyStore::load(&path).unwrap();
        let before = store.current();
        assert_eq!(before.autonomy_level, AutonomyLevel::Full);

        std::fs::write(&path, "autonomy_level = \"restricted\"").unwrap();
        let generation = store.reload().unwrap();
        assert!(generation > before.generation);
        assert_eq!(store.current().autonomy_level, AutonomyLevel::Restricted);
        // Readers holding the old generation are unaffected
        assert_eq!(before.autonomy_level, AutonomyLevel::Full);
    }

    #[test]
    fn test_invalid_reload_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, "autonomy_level = \"full\"").unwrap();
        let store = PolicyStore::load(&path).unwrap();

        std::fs::write(&path, "autonomy_level = \"sometimes\"").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.current().autonomy_level, AutonomyLevel::Full);
        assert_eq!(store.current().generation, 1);
    }

    #[test]
    fn test_dangerous_detection() {
        let config = PolicyConfig::default();
        assert!(config.is_dangerous("shell: RM -RF /tmp/x"));
        assert!(!config.is_dangerous("shell: ls -la"));
    }
}

//! Smart Router
//!
//! Decides how each request is handled and then handles it:
//! - `local`: active model only
//! - `rag_local`: active model with memory passages
//! - `external`: external provider, under a daily call budget
//!
//! Routing evaluates the policy's ordered rules against closed request
//! features (task type, complexity, user override); first match wins, no
//! match means `local`. Request text is redacted before it is logged or
//! forwarded anywhere, and again at every inference boundary.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::agent::recovery::CircuitBreaker;
use crate::collab::{Inference, Memory, Passage};
use crate::error::{with_timeout, CollabError};
use crate::evolution::dataset::{InteractionLog, InteractionRecord};
use crate::evolution::models::ModelRegistry;
use crate::policy::{ComplexityConfig, Policy, PolicyStore, RoutePath, RouterRule, TaskType};

/// Passages retrieved for `rag_local`
const RAG_PASSAGES: usize = 5;

/// Audit log target, one event per routing decision
pub const AUDIT_TARGET: &str = "sovra::audit";

static OVERRIDE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:^|\s)@(local|rag|external)\b").unwrap());

static RECALL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(remember|recall|what did (i|we)|last time|earlier|you told me|my notes)\b").unwrap()
});

static CODE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(```|\b(code|function|compile|bug|stack trace|script|regex|rust|python|sql)\b)").unwrap()
});

static TASK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(please\s+)?(run|install|download|schedule|create|delete|move|backup|deploy|check|clean)\b").unwrap()
});

static REASONING_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(why|prove|analy[sz]e|compare|trade-?offs?|plan|reason)\b").unwrap());

/// Incoming request
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub text: String,
    /// Declared task type; inferred from the text when absent
    pub task_type: Option<TaskType>,
}

impl Request {
    pub fn new(text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            task_type: None,
        }
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }
}

/// Closed set of features rules are evaluated against
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestFeatures {
    pub task_type: TaskType,
    /// In `[0, 1]`
    pub complexity: f64,
    pub user_override: Option<RoutePath>,
}

/// Estimates how demanding a request is, in `[0, 1]`
pub trait ComplexityScorer: Send + Sync {
    fn score(&self, text: &str) -> f64;
}

/// Base score plus length contribution plus weights of matched keywords
pub struct KeywordScorer {
    config: ComplexityConfig,
}

impl KeywordScorer {
    pub fn new(config: ComplexityConfig) -> Self {
        Self { config }
    }
}

impl ComplexityScorer for KeywordScorer {
    fn score(&self, text: &str) -> f64 {
        let lower = text.to_lowercase();
        let saturation = self.config.length_saturation.max(1) as f64;
        let length = (lower.chars().count() as f64 / saturation).min(1.0);
        let keywords: f64 = self
            .config
            .keywords
            .iter()
            .filter(|(k, _)| lower.contains(k.as_str()))
            .map(|(_, w)| *w)
            .sum();
        (self.config.base + self.config.length_weight * length + keywords).clamp(0.0, 1.0)
    }
}

/// Outcome of routing one request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterDecision {
    pub request_id: String,
    pub path: RoutePath,
    pub reason: String,
    /// Placeholder keys of every credential removed from the request
    pub redacted_keys: BTreeSet<String>,
    pub matched_rule: Option<String>,
    pub task_type: TaskType,
    pub complexity: f64,
    pub policy_generation: u64,
}

/// Result of dispatching a request
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub decision: RouterDecision,
    /// Path that actually produced the response
    pub served_by: RoutePath,
    /// Set when `external` was decided but `local` answered
    pub fallback: Option<String>,
    pub text: String,
    /// Id of the logged interaction, for later feedback
    pub interaction_id: String,
}

/// Per-path counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouterStats {
    pub local: u64,
    pub rag_local: u64,
    pub external: u64,
    pub fallbacks: u64,
    pub redacted_requests: u64,
    pub external_calls_today: u32,
}

#[derive(Default)]
struct Counters {
    local: AtomicU64,
    rag_local: AtomicU64,
    external: AtomicU64,
    fallbacks: AtomicU64,
    redacted_requests: AtomicU64,
}

impl Counters {
    fn record(&self, path: RoutePath) {
        let counter = match path {
            RoutePath::Local => &self.local,
            RoutePath::RagLocal => &self.rag_local,
            RoutePath::External => &self.external,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Calls to the external provider on one UTC day
struct DailyBudget {
    day: NaiveDate,
    used: u32,
}

impl DailyBudget {
    fn roll(&mut self, today: NaiveDate) {
        if self.day != today {
            self.day = today;
            self.used = 0;
        }
    }

    /// Reserve one call if under `limit`
    fn try_take(&mut self, today: NaiveDate, limit: u32) -> bool {
        self.roll(today);
        if self.used >= limit {
            return false;
        }
        self.used += 1;
        true
    }
}

/// Inference wrapper that redacts every prompt with the current policy
pub struct RedactingInference {
    inner: Arc<dyn Inference>,
    policy: Arc<PolicyStore>,
}

impl RedactingInference {
    pub fn new(inner: Arc<dyn Inference>, policy: Arc<PolicyStore>) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Inference for RedactingInference {
    async fn generate(&self, prompt: &str, model: &str) -> Result<String, CollabError> {
        let prompt = self.policy.current().redactor.scrub(prompt);
        self.inner.generate(&prompt, model).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollabError> {
        let text = self.policy.current().redactor.scrub(text);
        self.inner.embed(&text).await
    }

    async fn health(&self) -> Result<(), CollabError> {
        self.inner.health().await
    }
}

/// External provider and the model name it is called with
pub struct ExternalProvider {
    pub inference: Arc<dyn Inference>,
    pub model: String,
    /// Overrides the policy's daily limit
    pub daily_limit: Option<u32>,
}

pub struct SmartRouter {
    policy: Arc<PolicyStore>,
    local: Arc<dyn Inference>,
    external: Option<ExternalProvider>,
    models: Arc<ModelRegistry>,
    memory: Arc<dyn Memory>,
    interactions: Arc<InteractionLog>,
    scorer: Option<Arc<dyn ComplexityScorer>>,
    breaker: CircuitBreaker,
    budget: Mutex<DailyBudget>,
    counters: Counters,
}

impl SmartRouter {
    pub fn new(
        policy: Arc<PolicyStore>,
        local: Arc<dyn Inference>,
        models: Arc<ModelRegistry>,
        memory: Arc<dyn Memory>,
        interactions: Arc<InteractionLog>,
    ) -> Self {
        Self {
            local: Arc::new(RedactingInference::new(local, policy.clone())),
            policy,
            external: None,
            models,
            memory,
            interactions,
            scorer: None,
            breaker: CircuitBreaker::new("external", 3, Duration::from_secs(300)),
            budget: Mutex::new(DailyBudget {
                day: Utc::now().date_naive(),
                used: 0,
            }),
            counters: Counters::default(),
        }
    }

    /// Enable the `external` path
    pub fn with_external(mut self, mut provider: ExternalProvider) -> Self {
        provider.inference = Arc::new(RedactingInference::new(provider.inference, self.policy.clone()));
        self.external = Some(provider);
        self
    }

    /// Replace the keyword scorer built from the policy
    pub fn with_scorer(mut self, scorer: Arc<dyn ComplexityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Extract features from request text (override tokens already stripped)
    pub fn features(&self, policy: &Policy, text: &str, declared: Option<TaskType>, user_override: Option<RoutePath>) -> RequestFeatures {
        let complexity = match &self.scorer {
            Some(scorer) => scorer.score(text),
            None => KeywordScorer::new(policy.complexity.clone()).score(text),
        };
        RequestFeatures {
            task_type: declared.unwrap_or_else(|| classify(text)),
            complexity: complexity.clamp(0.0, 1.0),
            user_override,
        }
    }

    /// Decide the handling path for a request
    pub fn route(&self, request: &Request) -> RouterDecision {
        let policy = self.policy.current();
        self.decide(&policy, request).0
    }

    fn decide(&self, policy: &Policy, request: &Request) -> (RouterDecision, String) {
        let (text, user_override) = strip_override(&request.text);
        let redacted = policy.redactor.redact(&text);
        let features = self.features(policy, &redacted.text, request.task_type, user_override);

        let matched = policy.router_rules.iter().find(|rule| rule_matches(rule, &features));
        let (path, reason, matched_rule) = match matched {
            Some(rule) => (rule.path, format!("matched rule '{}'", rule.name), Some(rule.name.clone())),
            None => (RoutePath::Local, "no rule matched".to_string(), None),
        };

        let decision = RouterDecision {
            request_id: request.id.clone(),
            path,
            reason,
            redacted_keys: redacted.keys,
            matched_rule,
            task_type: features.task_type,
            complexity: features.complexity,
            policy_generation: policy.generation,
        };

        info!(
            target: AUDIT_TARGET,
            request_id = %decision.request_id,
            path = decision.path.as_str(),
            rule = decision.matched_rule.as_deref().unwrap_or("-"),
            task_type = decision.task_type.as_str(),
            complexity = decision.complexity,
            redacted = decision.redacted_keys.len(),
            generation = decision.policy_generation,
            "route decision"
        );

        (decision, redacted.text)
    }

    /// Route and handle a request
    pub async fn dispatch(&self, request: &Request) -> Result<RoutedResponse, CollabError> {
        let policy = self.policy.current();
        let (decision, text) = self.decide(&policy, request);
        if !decision.redacted_keys.is_empty() {
            self.counters.redacted_requests.fetch_add(1, Ordering::Relaxed);
        }
        let timeout = policy.execution.inference_timeout();

        let (served_by, fallback, response) = match decision.path {
            RoutePath::Local => (RoutePath::Local, None, self.generate_local(&policy, &text, &[], timeout).await?),
            RoutePath::RagLocal => {
                let passages = match with_timeout(timeout, self.memory.search(&text, RAG_PASSAGES)).await {
                    Ok(passages) => passages,
                    Err(e) => {
                        warn!(request_id = %decision.request_id, "Memory search failed, answering without context: {}", e);
                        Vec::new()
                    }
                };
                debug!(request_id = %decision.request_id, passages = passages.len(), "Retrieved memory");
                (RoutePath::RagLocal, None, self.generate_local(&policy, &text, &passages, timeout).await?)
            }
            RoutePath::External => match self.generate_external(&policy, &text, timeout).await {
                Ok(response) => (RoutePath::External, None, response),
                Err(reason) => {
                    warn!(request_id = %decision.request_id, "External path unavailable, falling back to local: {}", reason);
                    self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                    let response = self.generate_local(&policy, &text, &[], timeout).await?;
                    (RoutePath::Local, Some(reason), response)
                }
            },
        };
        self.counters.record(served_by);

        let record = InteractionRecord::new(&text, &policy.redactor.scrub(&response), served_by);
        if let Err(e) = self.interactions.record(&record) {
            warn!(request_id = %decision.request_id, "Failed to log interaction: {}", e);
        }

        Ok(RoutedResponse {
            decision,
            served_by,
            fallback,
            text: response,
            interaction_id: record.id,
        })
    }

    async fn generate_local(&self, policy: &Policy, text: &str, passages: &[Passage], timeout: Duration) -> Result<String, CollabError> {
        let prompt = build_prompt(&policy.name, text, passages);
        let model = self.models.active_ref();
        with_timeout(timeout, self.local.generate(&prompt, &model)).await
    }

    /// External answer, or the reason it could not be used
    async fn generate_external(&self, policy: &Policy, text: &str, timeout: Duration) -> Result<String, String> {
        let Some(provider) = &self.external else {
            return Err("no external provider configured".into());
        };
        if !self.breaker.allow() {
            return Err("external circuit open".into());
        }
        // Budget is only spent on calls that reach the provider
        let limit = provider.daily_limit.unwrap_or(policy.external_daily_limit);
        if !self.budget.lock().try_take(Utc::now().date_naive(), limit) {
            return Err(format!("daily external limit of {} reached", limit));
        }

        let prompt = build_prompt(&policy.name, text, &[]);
        match with_timeout(timeout, provider.inference.generate(&prompt, &provider.model)).await {
            Ok(response) => {
                self.breaker.record_success();
                Ok(response)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e.to_string())
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        let mut budget = self.budget.lock();
        budget.roll(Utc::now().date_naive());
        RouterStats {
            local: self.counters.local.load(Ordering::Relaxed),
            rag_local: self.counters.rag_local.load(Ordering::Relaxed),
            external: self.counters.external.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            redacted_requests: self.counters.redacted_requests.load(Ordering::Relaxed),
            external_calls_today: budget.used,
        }
    }
}

fn rule_matches(rule: &RouterRule, features: &RequestFeatures) -> bool {
    let when = &rule.when;
    if let Some(task_type) = when.task_type {
        if task_type != features.task_type {
            return false;
        }
    }
    if let Some(min) = when.min_complexity {
        if features.complexity < min {
            return false;
        }
    }
    if let Some(max) = when.max_complexity {
        if features.complexity > max {
            return false;
        }
    }
    if let Some(path) = when.user_override {
        if features.user_override != Some(path) {
            return false;
        }
    }
    true
}

/// Remove `@local` / `@rag` / `@external` tokens; the last one wins
fn strip_override(text: &str) -> (String, Option<RoutePath>) {
    let mut user_override = None;
    for caps in OVERRIDE_PATTERN.captures_iter(text) {
        user_override = RoutePath::parse(&caps[1]);
    }
    if user_override.is_none() {
        return (text.to_string(), None);
    }
    let stripped = OVERRIDE_PATTERN.replace_all(text, " ");
    (stripped.split_whitespace().collect::<Vec<_>>().join(" "), user_override)
}

/// Infer a task type from request text
fn classify(text: &str) -> TaskType {
    if RECALL_PATTERN.is_match(text) {
        TaskType::Recall
    } else if CODE_PATTERN.is_match(text) {
        TaskType::Code
    } else if TASK_PATTERN.is_match(text) {
        TaskType::Task
    } else if REASONING_PATTERN.is_match(text) {
        TaskType::Reasoning
    } else {
        TaskType::Chat
    }
}

fn build_prompt(name: &str, text: &str, passages: &[Passage]) -> String {
    let mut prompt = format!("You are {}, a personal assistant running on the user's machine.\n\n", name);
    if !passages.is_empty() {
        prompt.push_str("Relevant memory:\n");
        for p in passages {
            prompt.push_str(&format!("- {}\n", p.content));
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!("User: {}\nAssistant:", text));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::MemoryRecord;
    use crate::policy::{PolicyConfig, RuleCondition};
    use crate::store::Store;
    use crate::testing::{ScriptedInference, VecMemory};

    const KEY: &str = "sk-ant-REDACTED";

    struct Fixture {
        router: SmartRouter,
        local: Arc<ScriptedInference>,
        external: Arc<ScriptedInference>,
        memory: Arc<VecMemory>,
        store: Arc<Store>,
    }

    fn fixture(config: PolicyConfig, external: ScriptedInference) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let policy = Arc::new(PolicyStore::new(config).unwrap());
        let local = Arc::new(ScriptedInference::new(vec![]).with_fallback("local answer"));
        let external = Arc::new(external);
        let memory = Arc::new(VecMemory::new());
        let models = Arc::new(ModelRegistry::open(store.clone(), "qwen2.5:7b").unwrap());
        let router = SmartRouter::new(
            policy,
            local.clone(),
            models,
            memory.clone(),
            Arc::new(InteractionLog::new(store.clone())),
        )
        .with_external(ExternalProvider {
            inference: external.clone(),
            model: "claude-sonnet".into(),
            daily_limit: None,
        });
        Fixture { router, local, external, memory, store }
    }

    #[test]
    fn test_first_match_wins_and_default_is_local() {
        let rule = |name: &str, when: RuleCondition, path| RouterRule { name: name.into(), when, path };
        let config = PolicyConfig {
            router_rules: vec![
                rule("code_external", RuleCondition { task_type: Some(TaskType::Code), ..Default::default() }, RoutePath::External),
                rule("code_rag", RuleCondition { task_type: Some(TaskType::Code), ..Default::default() }, RoutePath::RagLocal),
            ],
            ..Default::default()
        };
        let f = fixture(config, ScriptedInference::new(vec![]));

        let decision = f.router.route(&Request::new("fix this rust function"));
        assert_eq!(decision.path, RoutePath::External);
        assert_eq!(decision.matched_rule.as_deref(), Some("code_external"));

        let decision = f.router.route(&Request::new("hello there"));
        assert_eq!(decision.path, RoutePath::Local);
        assert!(decision.matched_rule.is_none());
    }

    #[test]
    fn test_override_tokens() {
        let f = fixture(PolicyConfig::default(), ScriptedInference::new(vec![]));
        assert_eq!(f.router.route(&Request::new("@external hello")).path, RoutePath::External);
        assert_eq!(f.router.route(&Request::new("what's up @rag")).path, RoutePath::RagLocal);
        assert_eq!(strip_override("a @local b").0, "a b");
        assert_eq!(strip_override("mail me@external.com").1, None);
    }

    #[test]
    fn test_declared_task_type_and_complexity_bounds() {
        let f = fixture(PolicyConfig::default(), ScriptedInference::new(vec![]));
        let recall = f.router.route(&Request::new("hello").with_task_type(TaskType::Recall));
        assert_eq!(recall.path, RoutePath::RagLocal);

        let heavy = "analyze the architecture and prove the algorithm is optimal, explain why step by step";
        let decision = f.router.route(&Request::new(heavy));
        assert!(decision.complexity >= 0.75);
        assert_eq!(decision.path, RoutePath::External);
        assert!(f.router.route(&Request::new("hi")).complexity < 0.5);
    }

    #[tokio::test]
    async fn test_credentials_never_forwarded_or_logged() {
        let f = fixture(PolicyConfig::default(), ScriptedInference::new(vec!["external answer"]));
        let text = format!("@external use key {} to call the api", KEY);
        let response = f.router.dispatch(&Request::new(&text)).await.unwrap();

        assert_eq!(response.served_by, RoutePath::External);
        assert_eq!(response.decision.redacted_keys.len(), 1);
        let prompt = &f.external.prompts()[0];
        assert!(!prompt.contains(KEY));
        assert!(prompt.contains("[REDACTED:anthropic_key:"));

        let logged = f.store.load_interactions().unwrap();
        assert!(!logged[0].user_input.contains(KEY));
        assert_eq!(f.router.stats().redacted_requests, 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_falls_back_to_local() {
        let config = PolicyConfig {
            external_daily_limit: 1,
            ..Default::default()
        };
        let f = fixture(config, ScriptedInference::new(vec![]).with_fallback("external answer"));

        let first = f.router.dispatch(&Request::new("@external one")).await.unwrap();
        assert_eq!(first.served_by, RoutePath::External);
        let second = f.router.dispatch(&Request::new("@external two")).await.unwrap();
        assert_eq!(second.served_by, RoutePath::Local);
        assert_eq!(second.text, "local answer");
        assert!(second.fallback.unwrap().contains("daily external limit"));

        let stats = f.router.stats();
        assert_eq!((stats.external, stats.local, stats.fallbacks), (1, 1, 1));
        assert_eq!(f.external.calls(), 1);
    }

    #[tokio::test]
    async fn test_external_failure_falls_back_to_local() {
        let external = ScriptedInference::new(vec![]);
        external.push_error(CollabError::Unavailable("provider down".into()));
        let f = fixture(PolicyConfig::default(), external);
        let response = f.router.dispatch(&Request::new("@external hi")).await.unwrap();
        assert_eq!(response.served_by, RoutePath::Local);
        assert_eq!(f.local.models(), vec!["qwen2.5:7b".to_string()]);
    }

    #[tokio::test]
    async fn test_open_circuit_does_not_spend_budget() {
        let config = PolicyConfig {
            external_daily_limit: 5,
            ..Default::default()
        };
        let external = ScriptedInference::new(vec![]).with_fallback("external answer");
        for _ in 0..3 {
            external.push_error(CollabError::Unavailable("provider down".into()));
        }
        let f = fixture(config, external);

        for i in 0..8 {
            let response = f.router.dispatch(&Request::new(&format!("@external q{}", i))).await.unwrap();
            assert_eq!(response.served_by, RoutePath::Local);
        }
        assert_eq!(f.external.calls(), 3);
        assert_eq!(f.router.stats().external_calls_today, 3);
    }

    #[tokio::test]
    async fn test_rag_includes_passages() {
        let f = fixture(PolicyConfig::default(), ScriptedInference::new(vec![]));
        f.memory
            .store(MemoryRecord {
                kind: "fact".into(),
                content: "The backup drive is mounted at /mnt/backup".into(),
                source: None,
            })
            .await
            .unwrap();
        let response = f.router.dispatch(&Request::new("@rag where is the backup drive?")).await.unwrap();
        assert_eq!(response.served_by, RoutePath::RagLocal);
        assert!(f.local.prompts()[0].contains("/mnt/backup"));
        assert_eq!(f.store.load_interactions().unwrap()[0].route, RoutePath::RagLocal);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("do you remember my wifi password?"), TaskType::Recall);
        assert_eq!(classify("why does this compile error happen in rust"), TaskType::Code);
        assert_eq!(classify("backup my documents folder"), TaskType::Task);
        assert_eq!(classify("compare these two options"), TaskType::Reasoning);
        assert_eq!(classify("good morning"), TaskType::Chat);
    }
}

/// Configuration module for graphlens.
///
/// Handles loading, validating, and providing default configuration values.
/// Everything here is resolved once and treated as read-only by the engine.
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ── Default value functions ──────────────────────────────────────────

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|d| d.join("graphlens").to_string_lossy().to_string())
        .unwrap_or_else(|| "./.graphlens".to_string())
}

fn default_enrichment_db() -> String {
    "enrichment.db".to_string()
}

fn default_backends() -> Vec<BackendSpec> {
    vec![BackendSpec::Ollama(OllamaConfig::default())]
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_rpm() -> u32 {
    60
}

fn default_tpm() -> u32 {
    100_000
}

fn default_max_concurrent() -> usize {
    2
}

fn default_max_wait_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_max_total_wait_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    60
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_max_cooldown_ms() -> u64 {
    600_000
}

fn default_batch_size() -> usize {
    50
}

fn default_max_span_failures() -> u32 {
    3
}

fn default_failure_cooldown_secs() -> u64 {
    6 * 60 * 60
}

fn default_parallelism() -> usize {
    4
}

fn default_max_span_lines() -> usize {
    400
}

fn default_max_concurrent_repos() -> usize {
    2
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_idle_runs_before_backoff() -> usize {
    3
}

fn default_max_idle_multiplier() -> u32 {
    16
}

fn default_degraded_after() -> u32 {
    3
}

fn default_max_failure_multiplier() -> u32 {
    32
}

fn default_run_deadline_secs() -> u64 {
    30 * 60
}

fn default_query_limit() -> usize {
    20
}

fn default_max_lineage_results() -> usize {
    200
}

fn default_max_fallback_file_bytes() -> u64 {
    1_048_576
}

fn default_fallback_exclude() -> Vec<String> {
    vec![
        "**/.git/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/target/**".to_string(),
    ]
}

fn default_vcs_timeout_secs() -> u64 {
    5
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Root for graph snapshots and the enrichment database.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Enrichment database file, relative to `data_dir` unless absolute.
    #[serde(default = "default_enrichment_db")]
    pub enrichment_db: String,

    /// Backend cascade, tried in order.
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendSpec>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub freshness: FreshnessConfig,

    #[serde(default)]
    pub query: QueryConfig,

    /// Repositories the daemon registers at startup.
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RepoConfig {
    pub id: String,
    pub path: PathBuf,
}

/// One entry of the backend cascade. The set of kinds is closed; each has
/// its own typed settings.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSpec {
    /// Local Ollama server.
    Ollama(OllamaConfig),
    /// Any server speaking the OpenAI chat-completions API.
    OpenaiCompatible(OpenAiConfig),
    /// Anthropic messages API.
    Anthropic(AnthropicConfig),
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct OllamaConfig {
    pub id: String,
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub limits: RateLimitConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct OpenAiConfig {
    pub id: String,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key. Local OpenAI-compatible
    /// servers usually need none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub limits: RateLimitConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AnthropicConfig {
    pub id: String,
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub limits: RateLimitConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
    #[serde(default = "default_tpm")]
    pub tokens_per_minute: u32,
    /// In-flight calls allowed against this backend.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Longest a caller waits for capacity before failing with `RateLimited`.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct BudgetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_usd: Option<f64>,
    /// Price used for cost estimates; `0` for local models.
    #[serde(default)]
    pub usd_per_1k_tokens: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_total_wait_ms")]
    pub max_total_wait_ms: u64,
    /// Fractional jitter applied to each delay, e.g. `0.2` = ±20%.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures within `window_secs` that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EnrichmentConfig {
    /// Spans enriched per run.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Consecutive failures after which a span sits out `failure_cooldown_secs`.
    #[serde(default = "default_max_span_failures")]
    pub max_span_failures: u32,
    #[serde(default = "default_failure_cooldown_secs")]
    pub failure_cooldown_secs: u64,
    /// Spans dispatched concurrently within one run.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Spans longer than this are skipped.
    #[serde(default = "default_max_span_lines")]
    pub max_span_lines: usize,
    /// Custom prompt template; see `backend::prompt` for placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Repositories enriching concurrently, process-wide.
    #[serde(default = "default_max_concurrent_repos")]
    pub max_concurrent_repos: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Consecutive zero-yield runs before the poll interval starts growing.
    #[serde(default = "default_idle_runs_before_backoff")]
    pub idle_runs_before_backoff: usize,
    #[serde(default = "default_max_idle_multiplier")]
    pub max_idle_multiplier: u32,
    /// Consecutive failed runs after which a repository is degraded.
    #[serde(default = "default_degraded_after")]
    pub degraded_after_failures: u32,
    #[serde(default = "default_max_failure_multiplier")]
    pub max_failure_multiplier: u32,
    #[serde(default = "default_run_deadline_secs")]
    pub run_deadline_secs: u64,
    #[serde(default = "default_vcs_timeout_secs")]
    pub vcs_timeout_secs: u64,
}

/// What to do with a graph whose revision no longer matches the head.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    /// Answer from the graph and flag the result as stale.
    #[default]
    ServeStale,
    /// Route stale graphs to the live fallback search.
    ForceFallback,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct FreshnessConfig {
    #[serde(default)]
    pub stale_policy: StalePolicy,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct QueryConfig {
    #[serde(default = "default_query_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_lineage_results")]
    pub max_lineage_results: usize,
    #[serde(default = "default_max_fallback_file_bytes")]
    pub max_fallback_file_bytes: u64,
    /// Globs the fallback search never descends into.
    #[serde(default = "default_fallback_exclude")]
    pub fallback_exclude: Vec<String>,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            enrichment_db: default_enrichment_db(),
            backends: default_backends(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            enrichment: EnrichmentConfig::default(),
            scheduler: SchedulerConfig::default(),
            freshness: FreshnessConfig::default(),
            query: QueryConfig::default(),
            repos: Vec::new(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            id: "local".to_string(),
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "qwen2.5-coder:7b".to_string(),
            timeout_secs: default_timeout_secs(),
            limits: RateLimitConfig::default(),
            budget: BudgetConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_rpm(),
            tokens_per_minute: default_tpm(),
            max_concurrent: default_max_concurrent(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_total_wait_ms: default_max_total_wait_ms(),
            jitter: default_jitter(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_ms: default_cooldown_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_span_failures: default_max_span_failures(),
            failure_cooldown_secs: default_failure_cooldown_secs(),
            parallelism: default_parallelism(),
            max_span_lines: default_max_span_lines(),
            prompt_template: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_repos: default_max_concurrent_repos(),
            poll_interval_secs: default_poll_interval_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            idle_runs_before_backoff: default_idle_runs_before_backoff(),
            max_idle_multiplier: default_max_idle_multiplier(),
            degraded_after_failures: default_degraded_after(),
            max_failure_multiplier: default_max_failure_multiplier(),
            run_deadline_secs: default_run_deadline_secs(),
            vcs_timeout_secs: default_vcs_timeout_secs(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_query_limit(),
            max_lineage_results: default_max_lineage_results(),
            max_fallback_file_bytes: default_max_fallback_file_bytes(),
            fallback_exclude: default_fallback_exclude(),
        }
    }
}

// ── Backend spec accessors ───────────────────────────────────────────

impl BackendSpec {
    pub fn id(&self) -> &str {
        match self {
            BackendSpec::Ollama(c) => &c.id,
            BackendSpec::OpenaiCompatible(c) => &c.id,
            BackendSpec::Anthropic(c) => &c.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BackendSpec::Ollama(_) => "ollama",
            BackendSpec::OpenaiCompatible(_) => "openai_compatible",
            BackendSpec::Anthropic(_) => "anthropic",
        }
    }

    pub fn base_url(&self) -> &str {
        match self {
            BackendSpec::Ollama(c) => &c.base_url,
            BackendSpec::OpenaiCompatible(c) => &c.base_url,
            BackendSpec::Anthropic(c) => &c.base_url,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            BackendSpec::Ollama(c) => &c.model,
            BackendSpec::OpenaiCompatible(c) => &c.model,
            BackendSpec::Anthropic(c) => &c.model,
        }
    }

    pub fn timeout(&self) -> Duration {
        let secs = match self {
            BackendSpec::Ollama(c) => c.timeout_secs,
            BackendSpec::OpenaiCompatible(c) => c.timeout_secs,
            BackendSpec::Anthropic(c) => c.timeout_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn limits(&self) -> &RateLimitConfig {
        match self {
            BackendSpec::Ollama(c) => &c.limits,
            BackendSpec::OpenaiCompatible(c) => &c.limits,
            BackendSpec::Anthropic(c) => &c.limits,
        }
    }

    pub fn budget(&self) -> &BudgetConfig {
        match self {
            BackendSpec::Ollama(c) => &c.budget,
            BackendSpec::OpenaiCompatible(c) => &c.budget,
            BackendSpec::Anthropic(c) => &c.budget,
        }
    }

    /// Check the settings that do not depend on the environment.
    pub fn validate(&self) -> Result<()> {
        let id = self.id();
        anyhow::ensure!(!id.trim().is_empty(), "backend id must not be empty");
        anyhow::ensure!(
            !self.model().trim().is_empty(),
            "backend {id}: model must not be empty"
        );
        let url = self.base_url();
        anyhow::ensure!(
            url.starts_with("http://") || url.starts_with("https://"),
            "backend {id}: base_url must be http(s), got {url:?}"
        );
        anyhow::ensure!(
            !self.timeout().is_zero(),
            "backend {id}: timeout_secs must be positive"
        );

        let limits = self.limits();
        anyhow::ensure!(
            limits.requests_per_minute > 0,
            "backend {id}: requests_per_minute must be positive"
        );
        anyhow::ensure!(
            limits.tokens_per_minute > 0,
            "backend {id}: tokens_per_minute must be positive"
        );
        anyhow::ensure!(
            limits.max_concurrent > 0,
            "backend {id}: max_concurrent must be positive"
        );

        let budget = self.budget();
        anyhow::ensure!(
            budget.usd_per_1k_tokens >= 0.0,
            "backend {id}: usd_per_1k_tokens must not be negative"
        );
        for (name, limit) in [("daily_usd", budget.daily_usd), ("monthly_usd", budget.monthly_usd)] {
            if let Some(v) = limit {
                anyhow::ensure!(v >= 0.0, "backend {id}: {name} must not be negative");
            }
        }

        if let BackendSpec::Anthropic(c) = self {
            anyhow::ensure!(
                !c.api_key_env.trim().is_empty(),
                "backend {id}: api_key_env must name an environment variable"
            );
        }
        Ok(())
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"graphlens.json"`.
    /// A missing file yields the default configuration; a malformed one is
    /// an error, since running against half-parsed backend settings is worse
    /// than not starting.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "graphlens.json"
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config =
            serde_json::from_str(&data).with_context(|| format!("invalid JSON in {path}"))?;

        info!("Loaded configuration from {path}");
        cfg.validate()
            .with_context(|| format!("invalid configuration in {path}"))?;

        if cfg.repos.is_empty() {
            warn!("No repositories configured in {path}");
        }

        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.backends.is_empty(),
            "at least one backend must be configured"
        );
        let mut ids = HashSet::new();
        for spec in &self.backends {
            spec.validate()?;
            anyhow::ensure!(
                ids.insert(spec.id().to_string()),
                "duplicate backend id: {}",
                spec.id()
            );
        }

        anyhow::ensure!(
            self.retry.max_attempts > 0,
            "retry.max_attempts must be positive"
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.retry.jitter),
            "retry.jitter must be in [0, 1)"
        );
        anyhow::ensure!(
            self.breaker.failure_threshold > 0,
            "breaker.failure_threshold must be positive"
        );
        anyhow::ensure!(
            self.breaker.max_cooldown_ms >= self.breaker.cooldown_ms,
            "breaker.max_cooldown_ms must be >= breaker.cooldown_ms"
        );
        anyhow::ensure!(
            self.enrichment.batch_size > 0,
            "enrichment.batch_size must be positive"
        );
        anyhow::ensure!(
            self.enrichment.parallelism > 0,
            "enrichment.parallelism must be positive"
        );
        anyhow::ensure!(
            self.scheduler.max_concurrent_repos > 0,
            "scheduler.max_concurrent_repos must be positive"
        );
        anyhow::ensure!(
            self.scheduler.poll_interval_secs > 0,
            "scheduler.poll_interval_secs must be positive"
        );
        anyhow::ensure!(
            self.scheduler.max_idle_multiplier >= 1 && self.scheduler.max_failure_multiplier >= 1,
            "scheduler multipliers must be >= 1"
        );
        anyhow::ensure!(
            self.query.default_limit > 0,
            "query.default_limit must be positive"
        );

        let mut repo_ids = HashSet::new();
        for repo in &self.repos {
            anyhow::ensure!(
                repo_ids.insert(repo.id.as_str()),
                "duplicate repository id: {}",
                repo.id
            );
        }
        Ok(())
    }

    /// Directory holding one graph snapshot per repository.
    #[must_use]
    pub fn graph_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join("graphs")
    }

    #[must_use]
    pub fn enrichment_db_path(&self) -> PathBuf {
        let db = Path::new(&self.enrichment_db);
        if db.is_absolute() {
            db.to_path_buf()
        } else {
            Path::new(&self.data_dir).join(db)
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].id(), "local");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.scheduler.max_concurrent_repos, 2);
        assert_eq!(config.freshness.stale_policy, StalePolicy::ServeStale);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_json() {
        let json = r#"{
            "data_dir": "/tmp/gl",
            "backends": [
                {"kind": "ollama", "id": "local", "base_url": "http://localhost:11434", "model": "llama3"},
                {"kind": "openai_compatible", "id": "oai", "base_url": "https://api.openai.com/v1",
                 "model": "gpt-4o-mini", "api_key_env": "OPENAI_API_KEY",
                 "budget": {"daily_usd": 2.5, "usd_per_1k_tokens": 0.0006}},
                {"kind": "anthropic", "id": "claude", "base_url": "https://api.anthropic.com",
                 "model": "claude-haiku", "api_key_env": "ANTHROPIC_API_KEY",
                 "limits": {"requests_per_minute": 10}}
            ],
            "freshness": {"stale_policy": "force_fallback"}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.backends.len(), 3);
        assert_eq!(config.backends[1].kind(), "openai_compatible");
        assert_eq!(config.backends[1].budget().daily_usd, Some(2.5));
        assert_eq!(config.backends[2].limits().requests_per_minute, 10);
        // Other limit fields should have defaults
        assert_eq!(config.backends[2].limits().tokens_per_minute, 100_000);
        assert_eq!(config.freshness.stale_policy, StalePolicy::ForceFallback);
        assert_eq!(config.enrichment_db_path(), PathBuf::from("/tmp/gl/enrichment.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_backend_kind_rejected() {
        let json = r#"{"backends": [{"kind": "carrier_pigeon", "id": "x"}]}"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }

    #[test]
    fn test_validate_duplicate_backend_ids() {
        let mut config = Config::default();
        config.backends.push(config.backends[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_base_url() {
        let mut config = Config::default();
        config.backends = vec![BackendSpec::Ollama(OllamaConfig {
            base_url: "localhost:11434".to_string(),
            ..OllamaConfig::default()
        })];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_limits() {
        let mut config = Config::default();
        config.backends = vec![BackendSpec::Ollama(OllamaConfig {
            limits: RateLimitConfig {
                max_concurrent: 0,
                ..RateLimitConfig::default()
            },
            ..OllamaConfig::default()
        })];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_backends() {
        let mut config = Config::default();
        config.backends = vec![];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("absent.json");
        let config = Config::load(&path.to_string_lossy()).unwrap();
        assert_eq!(config.backends.len(), 1);
    }

    #[test]
    fn test_load_invalid_json_is_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Config::load(&path.to_string_lossy()).is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.backends, config.backends);
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.scheduler, config.scheduler);
    }
}

use std::env;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WardenError;
use crate::taxonomy::ErrorTaxonomy;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

/// Parse a profiled env var, ignoring values that do not parse.
fn profiled_env_parsed<T: FromStr>(profile: &str, key: &str) -> Option<T> {
    let raw = profiled_env_opt(profile, key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}

fn override_with<T: FromStr>(profile: &str, key: &str, slot: &mut T) {
    if let Some(v) = profiled_env_parsed(profile, key) {
        *slot = v;
    }
}

// ── Top-level config ──────────────────────────────────────────

/// Full configuration for one control plane instance.
///
/// Every section is optional in TOML; missing sections and keys take their
/// defaults. Environment variables named `WARDEN_<SECTION>_<KEY>` override
/// both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Active profile name (empty = default).
    #[serde(skip)]
    pub profile: String,
    pub concurrency: ConcurrencyConfig,
    pub gate: GateConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub dlq: DlqConfig,
    pub session: SessionConfig,
    pub monitor: MonitorConfig,
}

impl ControlPlaneConfig {
    /// Build config from defaults plus environment variables (call `load_dotenv()` first).
    /// Profile is read from `WARDEN_PROFILE`. When set (e.g. `PROD`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, WardenError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string, then apply env overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, WardenError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WardenError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    pub(crate) fn apply_env_overrides(&mut self) {
        self.profile = env_or("WARDEN_PROFILE", "").to_uppercase();
        let p = self.profile.clone();
        let p = p.as_str();
        self.concurrency.apply_env(p);
        self.gate.apply_env(p);
        self.breaker.apply_env(p);
        self.retry.apply_env(p);
        self.dlq.apply_env(p);
        self.session.apply_env(p);
        self.monitor.apply_env(p);
    }

    /// Reject settings no component can operate with.
    pub fn validate(&self) -> Result<(), WardenError> {
        self.concurrency.validate()?;
        if self.gate.max_global_concurrent == 0 {
            return Err(config_err("gate.max_global_concurrent must be at least 1"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(config_err("breaker.failure_threshold must be at least 1"));
        }
        self.retry.validate()?;
        if self.dlq.max_size == 0 {
            return Err(config_err("dlq.max_size must be at least 1"));
        }
        if self.session.ttl_ms == 0 {
            return Err(config_err("session.ttl_ms must be positive"));
        }
        if self.monitor.sample_interval_ms == 0 {
            return Err(config_err("monitor.sample_interval_ms must be positive"));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  concurrency: workers={}..{}, queue={}, threshold={}",
            self.concurrency.min_workers,
            self.concurrency.max_workers,
            self.concurrency.max_queue_size,
            self.concurrency.backpressure_threshold
        );
        tracing::info!("  gate:        max_global_concurrent={}", self.gate.max_global_concurrent);
        tracing::info!(
            "  breaker:     failure_threshold={}, reset_timeout_ms={}",
            self.breaker.failure_threshold,
            self.breaker.reset_timeout_ms
        );
        tracing::info!(
            "  retry:       max_attempts_per_task={}, retryable={:?}",
            self.retry.max_attempts_per_task,
            self.retry.retryable
        );
        tracing::info!("  dlq:         max_size={}", self.dlq.max_size);
        tracing::info!("  session:     ttl_ms={}", self.session.ttl_ms);
        tracing::info!("  monitor:     sample_interval_ms={}", self.monitor.sample_interval_ms);
    }
}

fn config_err(msg: &str) -> WardenError {
    WardenError::Config(msg.to_string())
}

// ── Concurrency ───────────────────────────────────────────────

/// Worker pool sizing and load thresholds.
///
/// Only `max_workers`, `min_workers`, `max_queue_size` and
/// `backpressure_threshold` are interpreted by the control plane. The rest
/// is carried for the worker pool that consumes the same config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_workers: u32,
    pub min_workers: u32,
    pub max_queue_size: u64,
    /// Composite load level (0–1) at or above which admissions are rejected.
    pub backpressure_threshold: f64,
    pub worker_timeout_ms: u64,
    pub max_requests_per_worker: u32,
    pub memory_limit_mb: u32,
    pub heartbeat_interval_ms: u64,
    pub stuck_threshold_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            min_workers: 1,
            max_queue_size: 32,
            backpressure_threshold: 0.7,
            worker_timeout_ms: 120_000,
            max_requests_per_worker: 100,
            memory_limit_mb: 512,
            heartbeat_interval_ms: 5_000,
            stuck_threshold_ms: 60_000,
        }
    }
}

impl ConcurrencyConfig {
    fn apply_env(&mut self, p: &str) {
        override_with(p, "WARDEN_CONCURRENCY_MAX_WORKERS", &mut self.max_workers);
        override_with(p, "WARDEN_CONCURRENCY_MIN_WORKERS", &mut self.min_workers);
        override_with(p, "WARDEN_CONCURRENCY_MAX_QUEUE_SIZE", &mut self.max_queue_size);
        override_with(
            p,
            "WARDEN_CONCURRENCY_BACKPRESSURE_THRESHOLD",
            &mut self.backpressure_threshold,
        );
        override_with(p, "WARDEN_CONCURRENCY_WORKER_TIMEOUT_MS", &mut self.worker_timeout_ms);
        override_with(
            p,
            "WARDEN_CONCURRENCY_MAX_REQUESTS_PER_WORKER",
            &mut self.max_requests_per_worker,
        );
        override_with(p, "WARDEN_CONCURRENCY_MEMORY_LIMIT_MB", &mut self.memory_limit_mb);
        override_with(
            p,
            "WARDEN_CONCURRENCY_HEARTBEAT_INTERVAL_MS",
            &mut self.heartbeat_interval_ms,
        );
        override_with(p, "WARDEN_CONCURRENCY_STUCK_THRESHOLD_MS", &mut self.stuck_threshold_ms);
    }

    pub fn validate(&self) -> Result<(), WardenError> {
        if self.max_workers == 0 {
            return Err(config_err("concurrency.max_workers must be at least 1"));
        }
        if self.min_workers > self.max_workers {
            return Err(WardenError::Config(format!(
                "concurrency.min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if !(0.0..=1.0).contains(&self.backpressure_threshold) {
            return Err(WardenError::Config(format!(
                "concurrency.backpressure_threshold {} is outside [0, 1]",
                self.backpressure_threshold
            )));
        }
        Ok(())
    }
}

// ── Gate ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Total execution slots shared by all agents.
    pub max_global_concurrent: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { max_global_concurrent: 8 }
    }
}

impl GateConfig {
    fn apply_env(&mut self, p: &str) {
        override_with(p, "WARDEN_GATE_MAX_GLOBAL_CONCURRENT", &mut self.max_global_concurrent);
    }
}

// ── Circuit breaker ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures while closed that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    fn apply_env(&mut self, p: &str) {
        override_with(p, "WARDEN_BREAKER_FAILURE_THRESHOLD", &mut self.failure_threshold);
        override_with(p, "WARDEN_BREAKER_RESET_TIMEOUT_MS", &mut self.reset_timeout_ms);
    }
}

// ── Retry budgets ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Recorded attempts after which a task's budget is exhausted.
    pub max_attempts_per_task: u32,
    /// Failure categories eligible for another attempt.
    pub retryable: Vec<ErrorTaxonomy>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_task: 1,
            retryable: ErrorTaxonomy::DEFAULT_RETRYABLE.to_vec(),
        }
    }
}

impl RetryConfig {
    fn apply_env(&mut self, p: &str) {
        override_with(p, "WARDEN_RETRY_MAX_ATTEMPTS_PER_TASK", &mut self.max_attempts_per_task);
        if let Some(raw) = profiled_env_opt(p, "WARDEN_RETRY_RETRYABLE") {
            let parsed: Result<Vec<ErrorTaxonomy>, String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect();
            match parsed {
                Ok(list) => self.retryable = list,
                Err(e) => tracing::warn!(error = %e, "ignoring WARDEN_RETRY_RETRYABLE"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), WardenError> {
        if self.max_attempts_per_task == 0 {
            return Err(config_err("retry.max_attempts_per_task must be at least 1"));
        }
        if let Some(t) = self.retryable.iter().find(|t| t.is_never_retryable()) {
            return Err(WardenError::Config(format!(
                "retry.retryable may not contain {t}"
            )));
        }
        Ok(())
    }
}

// ── Dead-letter queue ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub max_size: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self { max_size: 1_000 }
    }
}

impl DlqConfig {
    fn apply_env(&mut self, p: &str) {
        override_with(p, "WARDEN_DLQ_MAX_SIZE", &mut self.max_size);
    }
}

// ── Sessions ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_ms: 3_600_000 }
    }
}

impl SessionConfig {
    fn apply_env(&mut self, p: &str) {
        override_with(p, "WARDEN_SESSION_TTL_MS", &mut self.ttl_ms);
    }
}

// ── Monitor ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { sample_interval_ms: 1_000 }
    }
}

impl MonitorConfig {
    fn apply_env(&mut self, p: &str) {
        override_with(p, "WARDEN_MONITOR_SAMPLE_INTERVAL_MS", &mut self.sample_interval_ms);
    }
}

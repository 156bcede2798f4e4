use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration: the embedded configuration contract of
/// Parsing, environment interpolation, and `${VAR}` expansion
/// follow the usual layered `Config::load` pipeline; the outer CLI/file-watch
/// ergonomics that drive *when* this gets reloaded are out of scope, only
/// the shape of what gets installed lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub batcher: BatcherConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub pools: PoolsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            backends: HashMap::new(),
            router: RouterConfig::default(),
            cache: CacheConfig::default(),
            batcher: BatcherConfig::default(),
            compression: CompressionConfig::default(),
            health: HealthConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            pools: PoolsConfig::default(),
        }
    }
}

/// Per-backend configuration: the Backend Descriptor of, as
/// accepted from the external config loader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default = "default_transport")]
    pub transport: Transport,

    /// Command to spawn (stdio backends).
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    pub cwd: Option<String>,

    /// URL for http / streamable-http / sse / websocket backends.
    pub url: Option<String>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default = "default_timeout", with = "humantime_duration")]
    pub timeout: Duration,

    /// Regexes this backend declares it can serve, matched against tool
    /// names and method strings by the tool registry at install time.
    #[serde(default)]
    pub tool_name_patterns: Vec<String>,

    /// Relative routing priority; higher wins ties that are not
    /// resolved by the hash ring.
    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub prerequisite: Option<PrerequisiteConfig>,

    /// Methods this backend declares as idempotent (eligible for HTTP
    /// retry and response caching) beyond the built-in listing methods.
    #[serde(default)]
    pub idempotent_methods: Vec<String>,

    /// Methods this backend declares it can accept as a single batched
    /// call (`capabilities.batch`).
    #[serde(default)]
    pub batchable_methods: Vec<String>,

    /// Framing used for stdio backends. Ignored for other transports.
    #[serde(default)]
    pub framing: StdioFraming,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StdioFraming {
    #[default]
    NewlineDelimited,
    LengthPrefixed,
}

/// Transport kind for a backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    Stdio,
    Http,
    StreamableHttp,
    Sse,
    WebSocket,
}

/// Per-backend retry configuration for transient failures, reused
/// the HTTP driver retry budget,
///).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_initial_delay", with = "humantime_duration")]
    pub initial_delay: Duration,
    #[serde(default = "default_retry_max_delay", with = "humantime_duration")]
    pub max_delay: Duration,
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_retry_initial_delay(),
            max_delay: default_retry_max_delay(),
            jitter_pct: default_jitter_pct(),
        }
    }
}

/// A prerequisite process that must be confirmed running before a
/// stdio backend is spawned.
/// `backend/prerequisite.rs`; generalized to apply to any backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrerequisiteConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub process_match: Option<String>,
    #[serde(default)]
    pub managed: bool,
    #[serde(default = "default_startup_delay", with = "humantime_duration")]
    pub startup_delay: Duration,
}

/// Router / consistent-hash-ring configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,
    #[serde(default)]
    pub hash_key_strategy: HashKeyStrategy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: default_virtual_nodes(),
            hash_key_strategy: HashKeyStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashKeyStrategy {
    #[default]
    ToolName,
    Method,
}

/// Response cache configuration (C7)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_l1")]
    pub l1: CacheLayerConfig,
    #[serde(default = "default_l2")]
    pub l2: CacheLayerConfig,
    #[serde(default = "default_l3")]
    pub l3: CacheLayerConfig,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1: default_l1(),
            l2: default_l2(),
            l3: default_l3(),
            max_total_bytes: default_max_total_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheLayerConfig {
    pub max_entries: u64,
    #[serde(with = "humantime_duration")]
    pub ttl: Duration,
}

/// Batcher configuration (C8)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatcherConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_batchable_methods")]
    pub enabled_methods: Vec<String>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_batch_size: default_max_batch_size(),
            enabled_methods: default_batchable_methods(),
        }
    }
}

/// Compressor configuration (C9)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionConfig {
    #[serde(default = "default_true_config")]
    pub enabled: bool,
    #[serde(default = "default_min_size_bytes")]
    pub min_size_bytes: usize,
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<CompressionAlgorithm>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size_bytes: default_min_size_bytes(),
            algorithms: default_algorithms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Zstd,
    Gzip,
    Brotli,
}

/// Health check configuration (C3)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    #[serde(default = "default_healthy_interval", with = "humantime_duration")]
    pub healthy_interval: Duration,
    #[serde(default = "default_degraded_interval", with = "humantime_duration")]
    pub degraded_interval: Duration,
    #[serde(default = "default_unhealthy_interval", with = "humantime_duration")]
    pub unhealthy_interval: Duration,
    #[serde(default = "default_probe_timeout", with = "humantime_duration")]
    pub timeout: Duration,
    #[serde(default = "default_fall_threshold")]
    pub fall_threshold: u32,
    #[serde(default = "default_rise_threshold")]
    pub rise_threshold: u32,
    #[serde(default = "default_err_rate_degraded")]
    pub err_rate_degraded: f64,
    #[serde(default = "default_err_rate_unhealthy")]
    pub err_rate_unhealthy: f64,
    #[serde(default = "default_latency_unhealthy", with = "humantime_duration")]
    pub latency_unhealthy: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            healthy_interval: default_healthy_interval(),
            degraded_interval: default_degraded_interval(),
            unhealthy_interval: default_unhealthy_interval(),
            timeout: default_probe_timeout(),
            fall_threshold: default_fall_threshold(),
            rise_threshold: default_rise_threshold(),
            err_rate_degraded: default_err_rate_degraded(),
            err_rate_unhealthy: default_err_rate_unhealthy(),
            latency_unhealthy: default_latency_unhealthy(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    #[serde(default = "default_recovery_timeout", with = "humantime_duration")]
    pub recovery_timeout: Duration,
    #[serde(default = "default_half_open_limit")]
    pub half_open_limit: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff", with = "humantime_duration")]
    pub max_backoff: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            error_rate_threshold: default_error_rate_threshold(),
            recovery_timeout: default_recovery_timeout(),
            half_open_limit: default_half_open_limit(),
            success_threshold: default_success_threshold(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff: default_max_backoff(),
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolsConfig {
    #[serde(default = "default_http_pool")]
    pub http: PoolLimits,
    #[serde(default = "default_stdio_pool")]
    pub stdio: PoolLimits,
    #[serde(default)]
    pub stdio_command_allowlist: Vec<String>,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            http: default_http_pool(),
            stdio: default_stdio_pool(),
            stdio_command_allowlist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolLimits {
    pub max: u32,
    pub min_idle: u32,
    #[serde(with = "humantime_duration")]
    pub max_idle: Duration,
    #[serde(with = "humantime_duration")]
    pub acquire_timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub drain_timeout: Duration,
}

// --- defaults ---

fn default_log_level() -> String {
    "info".to_string()
}
fn default_transport() -> Transport {
    Transport::Stdio
}
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_priority() -> i32 {
    0
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_initial_delay() -> Duration {
    Duration::from_millis(50)
}
fn default_retry_max_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_jitter_pct() -> f64 {
    0.2
}
fn default_startup_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_virtual_nodes() -> u32 {
    160
}
fn default_l1() -> CacheLayerConfig {
    CacheLayerConfig {
        max_entries: 1_000,
        ttl: Duration::from_secs(5 * 60),
    }
}
fn default_l2() -> CacheLayerConfig {
    CacheLayerConfig {
        max_entries: 5_000,
        ttl: Duration::from_secs(30 * 60),
    }
}
fn default_l3() -> CacheLayerConfig {
    CacheLayerConfig {
        max_entries: 10_000,
        ttl: Duration::from_secs(2 * 60 * 60),
    }
}
fn default_max_total_bytes() -> u64 {
    256 * 1024 * 1024
}
fn default_window_ms() -> u64 {
    100
}
fn default_max_batch_size() -> usize {
    50
}
fn default_batchable_methods() -> Vec<String> {
    vec![
        "tools/call".to_string(),
        "resources/read".to_string(),
        "prompts/get".to_string(),
    ]
}
fn default_min_size_bytes() -> usize {
    1024
}
fn default_algorithms() -> Vec<CompressionAlgorithm> {
    vec![
        CompressionAlgorithm::Zstd,
        CompressionAlgorithm::Gzip,
        CompressionAlgorithm::Brotli,
    ]
}
fn default_healthy_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_degraded_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_unhealthy_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_fall_threshold() -> u32 {
    3
}
fn default_rise_threshold() -> u32 {
    5
}
fn default_err_rate_degraded() -> f64 {
    0.10
}
fn default_err_rate_unhealthy() -> f64 {
    0.50
}
fn default_latency_unhealthy() -> Duration {
    Duration::from_secs(5)
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_error_rate_threshold() -> f64 {
    0.50
}
fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_half_open_limit() -> u32 {
    3
}
fn default_success_threshold() -> u32 {
    3
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_true_config() -> bool {
    true
}
fn default_http_pool() -> PoolLimits {
    PoolLimits {
        max: 100,
        min_idle: 1,
        max_idle: Duration::from_secs(5 * 60),
        acquire_timeout: Duration::from_secs(30),
        drain_timeout: Duration::from_secs(30),
    }
}
fn default_stdio_pool() -> PoolLimits {
    PoolLimits {
        max: 5,
        min_idle: 1,
        max_idle: Duration::from_secs(5 * 60),
        acquire_timeout: Duration::from_secs(30),
        drain_timeout: Duration::from_secs(30),
    }
}

/// Serde helper for humantime-style durations ("30s", "5m", "1h"),
/// unchanged.
mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    fn format(d: &Duration) -> String {
        let ms = d.as_millis();
        if ms.is_multiple_of(1000) {
            let secs = d.as_secs();
            if secs.is_multiple_of(3600) && secs >= 3600 {
                format!("{}h", secs / 3600)
            } else if secs.is_multiple_of(60) && secs >= 60 {
                format!("{}m", secs / 60)
            } else {
                format!("{secs}s")
            }
        } else {
            format!("{ms}ms")
        }
    }

    fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix("ms") {
            return n
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| format!("invalid duration '{s}': {e}"));
        }
        if let Some(n) = s.strip_suffix('s') {
            return n
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("invalid duration '{s}': {e}"));
        }
        if let Some(n) = s.strip_suffix('m') {
            return n
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| format!("invalid duration '{s}': {e}"));
        }
        if let Some(n) = s.strip_suffix('h') {
            return n
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|e| format!("invalid duration '{s}': {e}"));
        }
        s.parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| format!("invalid duration '{s}': expected e.g. '30s', '5m', '1h', '200ms'"))
    }
}

impl Config {
    /// Read a YAML config file, expand `${VAR}` references against the
    /// process environment, and deserialize.
    /// `Config::load` pipeline.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let expanded = shellexpand::env(&raw)
            .map_err(|e| anyhow::anyhow!("env var interpolation failed: {e}"))?;
        let config: Config = serde_yaml_ng::from_str(&expanded)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde's `Deserialize` enforces.
    pub fn validate(&self) -> Result<()> {
        if !(150..=200).contains(&self.router.virtual_nodes) {
            anyhow::bail!(
                "router.virtual_nodes must be within 150..=200, got {}",
                self.router.virtual_nodes
            );
        }
        for (id, backend) in &self.backends {
            match backend.transport {
                Transport::Stdio => {
                    if backend.command.is_none() {
                        anyhow::bail!("backend '{id}' uses stdio transport but has no command");
                    }
                    if let Some(command) = &backend.command
                        && !self.pools.stdio_command_allowlist.is_empty()
                        && !self.pools.stdio_command_allowlist.contains(command)
                    {
                        anyhow::bail!(
                            "backend '{id}' command '{command}' is not in pools.stdio_command_allowlist"
                        );
                    }
                }
                Transport::Http | Transport::StreamableHttp | Transport::Sse | Transport::WebSocket => {
                    if backend.url.is_none() {
                        anyhow::bail!("backend '{id}' uses a network transport but has no url");
                    }
                }
            }
        }
        Ok(())
    }

    /// Diff this generation's backend set against a previous one, per the
    /// install protocol's step 4 : identifies which backend
    /// ids are new, removed, or structurally changed so the registry can
    /// decide what to re-probe versus carry over unchanged.
    pub fn diff_backends(&self, previous: &Config) -> ConfigDiff {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut changed = Vec::new();
        let mut unchanged = Vec::new();

        for (id, cfg) in &self.backends {
            match previous.backends.get(id) {
                None => added.push(id.clone()),
                Some(old) if old != cfg => changed.push(id.clone()),
                Some(_) => unchanged.push(id.clone()),
            }
        }
        for id in previous.backends.keys() {
            if !self.backends.contains_key(id) {
                removed.push(id.clone());
            }
        }
        added.sort();
        removed.sort();
        changed.sort();
        unchanged.sort();
        ConfigDiff {
            added,
            removed,
            changed,
            unchanged,
        }
    }
}

/// Result of comparing two successive configuration generations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ConfigDiff {
    /// Backend ids that require a fresh health-gate probe before
    /// install: everything new or structurally changed.
    pub fn needs_health_gate(&self) -> impl Iterator<Item = &str> {
        self.added.iter().chain(self.changed.iter()).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(command: &str) -> BackendConfig {
        BackendConfig {
            transport: Transport::Stdio,
            command: Some(command.to_string()),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            timeout: default_timeout(),
            tool_name_patterns: Vec::new(),
            priority: 0,
            retry: RetryConfig::default(),
            prerequisite: None,
            idempotent_methods: Vec::new(),
            batchable_methods: Vec::new(),
            framing: StdioFraming::default(),
        }
    }

    #[test]
    fn duration_round_trips_through_yaml() {
        let cfg = CacheLayerConfig {
            max_entries: 10,
            ttl: Duration::from_secs(90),
        };
        let yaml = serde_yaml_ng::to_string(&cfg).unwrap();
        let back: CacheLayerConfig = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn stdio_backend_without_command_fails_validation() {
        let mut cfg = Config::default();
        cfg.backends.insert(
            "broken".to_string(),
            BackendConfig {
                command: None,
                ..backend("unused")
            },
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn virtual_nodes_out_of_range_fails_validation() {
        let mut cfg = Config::default();
        cfg.router.virtual_nodes = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn diff_classifies_added_removed_changed_unchanged() {
        let mut old = Config::default();
        old.backends.insert("a".to_string(), backend("echo"));
        old.backends.insert("b".to_string(), backend("cat"));

        let mut new = Config::default();
        new.backends.insert("a".to_string(), backend("echo")); // unchanged
        new.backends.insert("b".to_string(), backend("tac")); // changed
        new.backends.insert("c".to_string(), backend("grep")); // added

        let diff = new.diff_backends(&old);
        assert_eq!(diff.added, vec!["c".to_string()]);
        assert_eq!(diff.changed, vec!["b".to_string()]);
        assert_eq!(diff.unchanged, vec!["a".to_string()]);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn diff_detects_removed_backend() {
        let mut old = Config::default();
        old.backends.insert("a".to_string(), backend("echo"));
        let new = Config::default();

        let diff = new.diff_backends(&old);
        assert_eq!(diff.removed, vec!["a".to_string()]);
    }

    #[test]
    fn stdio_allowlist_rejects_unlisted_command() {
        let mut cfg = Config::default();
        cfg.pools.stdio_command_allowlist = vec!["echo".to_string()];
        cfg.backends.insert("a".to_string(), backend("cat"));
        assert!(cfg.validate().is_err());
    }
}

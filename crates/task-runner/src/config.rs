//! Runner configuration and per-worker property overrides

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;

/// Property key shared by every worker
pub const ALL_WORKERS: &str = "all";

/// Property naming the execution domain to poll
pub const DOMAIN: &str = "domain";

/// Property allowing polls while discovery reports the instance down
pub const POLL_OUT_OF_DISCOVERY: &str = "pollOutOfDiscovery";

/// Prefix of dotted worker property variables
const PROPERTY_PREFIX: &str = "conductor.worker.";

/// Prefix of shell-friendly worker property variables
const ENV_PROPERTY_PREFIX: &str = "CONDUCTOR_WORKER_";

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("thread count must be at least 1 (task type: {0})")]
    ZeroThreads(String),

    #[error("update retry count must be at least 1")]
    ZeroRetries,

    #[error("unknown polling strategy: {0}")]
    UnknownStrategy(String),
}

/// How tasks are acquired from the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStrategy {
    /// One batched poll per tick sized to the pool's idle capacity
    #[default]
    Direct,

    /// Streamed batch polls accumulated across waiting pool slots
    Streaming,
}

impl std::str::FromStr for PollStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "streaming" | "stream" => Ok(Self::Streaming),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
    /// Pool size for task types without an explicit count
    pub thread_count: usize,

    /// Pool size per task type
    #[serde(default)]
    pub task_thread_count: HashMap<String, usize>,

    /// How long the service may hold a poll open
    #[serde(with = "duration_millis")]
    pub poll_timeout: Duration,

    /// Attempts for each result upload/update
    pub update_retry_count: u32,

    /// Fixed delay between update attempts
    #[serde(with = "duration_millis")]
    pub retry_backoff: Duration,

    /// How long shutdown waits for in-flight executions
    #[serde(with = "duration_millis")]
    pub shutdown_grace_period: Duration,

    /// Execution unit naming pattern; `%d` is replaced by the unit number
    pub worker_name_prefix: String,

    /// Static task type to domain mapping
    #[serde(default)]
    pub task_to_domain: HashMap<String, String>,

    pub strategy: PollStrategy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            thread_count: 1,
            task_thread_count: HashMap::new(),
            poll_timeout: Duration::from_millis(100),
            update_retry_count: 3,
            retry_backoff: Duration::from_millis(500),
            shutdown_grace_period: Duration::from_secs(10),
            worker_name_prefix: "workflow-worker-%d".to_string(),
            task_to_domain: HashMap::new(),
            strategy: PollStrategy::Direct,
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `TASK_RUNNER_THREAD_COUNT`: Default pool size (default: 1)
    /// - `TASK_RUNNER_POLL_TIMEOUT_MS`: Poll timeout (default: 100)
    /// - `TASK_RUNNER_UPDATE_RETRY_COUNT`: Update attempts (default: 3)
    /// - `TASK_RUNNER_RETRY_BACKOFF_MS`: Delay between attempts (default: 500)
    /// - `TASK_RUNNER_SHUTDOWN_GRACE_PERIOD_MS`: Drain timeout (default: 10000)
    /// - `TASK_RUNNER_WORKER_NAME_PREFIX`: Execution unit naming pattern
    /// - `TASK_RUNNER_STRATEGY`: `direct` or `streaming` (default: direct)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let strategy = match std::env::var("TASK_RUNNER_STRATEGY") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.strategy,
        };

        Ok(Self {
            thread_count: env_parse("TASK_RUNNER_THREAD_COUNT").unwrap_or(defaults.thread_count),
            poll_timeout: env_parse("TASK_RUNNER_POLL_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_timeout),
            update_retry_count: env_parse("TASK_RUNNER_UPDATE_RETRY_COUNT")
                .unwrap_or(defaults.update_retry_count),
            retry_backoff: env_parse("TASK_RUNNER_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            shutdown_grace_period: env_parse("TASK_RUNNER_SHUTDOWN_GRACE_PERIOD_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_grace_period),
            worker_name_prefix: std::env::var("TASK_RUNNER_WORKER_NAME_PREFIX")
                .unwrap_or(defaults.worker_name_prefix),
            strategy,
            ..defaults
        })
    }

    /// Set the default pool size
    pub fn with_thread_count(mut self, count: usize) -> Self {
        self.thread_count = count;
        self
    }

    /// Set the pool size for one task type
    pub fn with_task_thread_count(mut self, task_type: impl Into<String>, count: usize) -> Self {
        self.task_thread_count.insert(task_type.into(), count);
        self
    }

    /// Set the poll timeout
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the number of update attempts
    pub fn with_update_retry_count(mut self, count: u32) -> Self {
        self.update_retry_count = count;
        self
    }

    /// Set the delay between update attempts
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace_period(mut self, period: Duration) -> Self {
        self.shutdown_grace_period = period;
        self
    }

    /// Set the execution unit naming pattern
    pub fn with_worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }

    /// Map a task type to a domain
    pub fn with_task_domain(
        mut self,
        task_type: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        self.task_to_domain.insert(task_type.into(), domain.into());
        self
    }

    /// Set the polling strategy
    pub fn with_strategy(mut self, strategy: PollStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Pool size for a task type
    pub fn thread_count_for(&self, task_type: &str) -> usize {
        self.task_thread_count
            .get(task_type)
            .copied()
            .unwrap_or(self.thread_count)
    }

    /// Retry policy applied to result reporting
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retry_backoff, self.update_retry_count)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count == 0 {
            return Err(ConfigError::ZeroThreads(ALL_WORKERS.to_string()));
        }
        if let Some((task_type, _)) = self.task_thread_count.iter().find(|(_, n)| **n == 0) {
            return Err(ConfigError::ZeroThreads(task_type.clone()));
        }
        if self.update_retry_count == 0 {
            return Err(ConfigError::ZeroRetries);
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Per-worker property overrides
///
/// Keys are `<taskType>.<property>`; the task type `all` applies to every
/// worker. A task-type value always wins over the `all` value.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use task_runner::config::WorkerProperties;
///
/// let properties = WorkerProperties::new()
///     .with_property("all", "domain", "shared")
///     .with_property("encode", "domain", "gpu");
///
/// let static_map = HashMap::new();
/// assert_eq!(properties.resolve_domain("encode", &static_map).as_deref(), Some("gpu"));
/// assert_eq!(properties.resolve_domain("decode", &static_map).as_deref(), Some("shared"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerProperties {
    values: HashMap<String, String>,
}

impl WorkerProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load properties from the process environment
    ///
    /// Accepts `conductor.worker.<taskType>.<property>` and
    /// `CONDUCTOR_WORKER_<TASKTYPE>__<PROPERTY>` variables. Shell-style task
    /// types are stored lowercased; lookups for a mixed-case task type such
    /// as `encodeVideo` fall back to its lowercased form.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Load properties from key/value pairs
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut properties = Self::new();
        for (key, value) in vars {
            let key = key.as_ref();
            if let Some(rest) = key.strip_prefix(PROPERTY_PREFIX) {
                if let Some((task_type, property)) = rest.rsplit_once('.') {
                    properties = properties.with_property(task_type, property, value);
                }
            } else if let Some(rest) = key.strip_prefix(ENV_PROPERTY_PREFIX) {
                if let Some((task_type, property)) = rest.split_once("__") {
                    let property = match property {
                        "DOMAIN" => DOMAIN.to_string(),
                        "POLL_OUT_OF_DISCOVERY" => POLL_OUT_OF_DISCOVERY.to_string(),
                        other => other.to_ascii_lowercase(),
                    };
                    properties =
                        properties.with_property(task_type.to_ascii_lowercase(), property, value);
                }
            }
        }
        properties
    }

    /// Set a property
    pub fn with_property(
        mut self,
        task_type: impl Into<String>,
        property: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.set(task_type, property, value);
        self
    }

    /// Set a property in place
    pub fn set(
        &mut self,
        task_type: impl Into<String>,
        property: impl Into<String>,
        value: impl Into<String>,
    ) {
        let key = format!("{}.{}", task_type.into(), property.into());
        self.values.insert(key, value.into());
    }

    /// Remove a property
    pub fn remove(&mut self, task_type: &str, property: &str) {
        self.values.remove(&format!("{task_type}.{property}"));
    }

    /// Raw value for a task type, ignoring blanks
    ///
    /// An exact task-type key wins over its lowercased form.
    fn own(&self, task_type: &str, property: &str) -> Option<&str> {
        self.exact(task_type, property).or_else(|| {
            let lowered = task_type.to_ascii_lowercase();
            if lowered == task_type {
                None
            } else {
                self.exact(&lowered, property)
            }
        })
    }

    fn exact(&self, task_type: &str, property: &str) -> Option<&str> {
        self.values
            .get(&format!("{task_type}.{property}"))
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Task-type value, falling back to the `all` value
    pub fn get_string(&self, task_type: &str, property: &str) -> Option<&str> {
        self.own(task_type, property).or_else(|| self.own(ALL_WORKERS, property))
    }

    /// Boolean task-type value, falling back to the `all` value
    ///
    /// Unparseable values are treated as unset.
    pub fn get_bool(&self, task_type: &str, property: &str) -> Option<bool> {
        self.own(task_type, property)
            .and_then(parse_bool)
            .or_else(|| self.own(ALL_WORKERS, property).and_then(parse_bool))
    }

    /// Domain to poll for a task type
    ///
    /// Resolution order: task-type property, `all` property, static mapping.
    /// The first non-empty value wins.
    pub fn resolve_domain(
        &self,
        task_type: &str,
        task_to_domain: &HashMap<String, String>,
    ) -> Option<String> {
        self.get_string(task_type, DOMAIN)
            .map(str::to_string)
            .or_else(|| {
                task_to_domain
                    .get(task_type)
                    .filter(|d| !d.trim().is_empty())
                    .cloned()
            })
    }

    /// Whether the worker may poll while discovery reports the instance down
    pub fn discovery_override(&self, task_type: &str) -> bool {
        self.get_bool(task_type, POLL_OUT_OF_DISCOVERY).unwrap_or(false)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert_eq!(config.thread_count, 1);
        assert_eq!(config.poll_timeout, Duration::from_millis(100));
        assert_eq!(config.update_retry_count, 3);
        assert_eq!(config.retry_backoff, Duration::from_millis(500));
        assert_eq!(config.strategy, PollStrategy::Direct);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = RunnerConfig::new()
            .with_thread_count(4)
            .with_task_thread_count("encode", 8)
            .with_poll_timeout(Duration::from_millis(250))
            .with_update_retry_count(5)
            .with_retry_backoff(Duration::from_millis(50))
            .with_task_domain("encode", "gpu")
            .with_strategy(PollStrategy::Streaming);

        assert_eq!(config.thread_count_for("encode"), 8);
        assert_eq!(config.thread_count_for("decode"), 4);
        assert_eq!(config.task_to_domain.get("encode").unwrap(), "gpu");

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff, Duration::from_millis(50));
    }

    #[test]
    fn test_config_validation() {
        assert_eq!(
            RunnerConfig::new().with_thread_count(0).validate(),
            Err(ConfigError::ZeroThreads("all".to_string()))
        );
        assert_eq!(
            RunnerConfig::new()
                .with_task_thread_count("encode", 0)
                .validate(),
            Err(ConfigError::ZeroThreads("encode".to_string()))
        );
        assert_eq!(
            RunnerConfig::new().with_update_retry_count(0).validate(),
            Err(ConfigError::ZeroRetries)
        );
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("direct".parse::<PollStrategy>(), Ok(PollStrategy::Direct));
        assert_eq!(
            " Streaming ".parse::<PollStrategy>(),
            Ok(PollStrategy::Streaming)
        );
        assert!("grpc".parse::<PollStrategy>().is_err());
    }

    #[test]
    fn test_serialization() {
        let config = RunnerConfig::new().with_retry_backoff(Duration::from_millis(750));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["retry_backoff"], 750);

        let parsed: RunnerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_domain_resolution_order() {
        let static_map = HashMap::from([("encode".to_string(), "static".to_string())]);
        let mut properties = WorkerProperties::new()
            .with_property("encode", DOMAIN, "per-type")
            .with_property(ALL_WORKERS, DOMAIN, "global");

        assert_eq!(
            properties.resolve_domain("encode", &static_map).as_deref(),
            Some("per-type")
        );

        properties.remove("encode", DOMAIN);
        assert_eq!(
            properties.resolve_domain("encode", &static_map).as_deref(),
            Some("global")
        );

        properties.remove(ALL_WORKERS, DOMAIN);
        assert_eq!(
            properties.resolve_domain("encode", &static_map).as_deref(),
            Some("static")
        );

        assert_eq!(properties.resolve_domain("decode", &static_map), None);
    }

    #[test]
    fn test_blank_values_do_not_win() {
        let static_map = HashMap::from([("encode".to_string(), "static".to_string())]);
        let properties = WorkerProperties::new()
            .with_property("encode", DOMAIN, "")
            .with_property(ALL_WORKERS, DOMAIN, "  ");

        assert_eq!(
            properties.resolve_domain("encode", &static_map).as_deref(),
            Some("static")
        );
    }

    #[test]
    fn test_discovery_override() {
        let properties = WorkerProperties::new()
            .with_property(ALL_WORKERS, POLL_OUT_OF_DISCOVERY, "true")
            .with_property("encode", POLL_OUT_OF_DISCOVERY, "false");

        assert!(!properties.discovery_override("encode"));
        assert!(properties.discovery_override("decode"));
        assert!(!WorkerProperties::new().discovery_override("decode"));
    }

    #[test]
    fn test_properties_from_vars() {
        let properties = WorkerProperties::from_vars(vec![
            ("conductor.worker.encode.domain", "gpu"),
            ("conductor.worker.all.pollOutOfDiscovery", "true"),
            ("CONDUCTOR_WORKER_DECODE__DOMAIN", "cpu"),
            ("UNRELATED", "x"),
        ]);

        let static_map = HashMap::new();
        assert_eq!(
            properties.resolve_domain("encode", &static_map).as_deref(),
            Some("gpu")
        );
        assert_eq!(
            properties.resolve_domain("decode", &static_map).as_deref(),
            Some("cpu")
        );
        assert!(properties.discovery_override("encode"));
    }

    #[test]
    fn test_shell_style_matches_mixed_case_task_type() {
        let properties = WorkerProperties::from_vars(vec![
            ("CONDUCTOR_WORKER_ENCODEVIDEO__DOMAIN", "gpu"),
            ("CONDUCTOR_WORKER_ENCODEVIDEO__POLL_OUT_OF_DISCOVERY", "true"),
            ("conductor.worker.resizeImage.domain", "exact"),
            ("CONDUCTOR_WORKER_RESIZEIMAGE__DOMAIN", "shell"),
        ]);

        let static_map = HashMap::new();
        assert_eq!(
            properties.resolve_domain("encodeVideo", &static_map).as_deref(),
            Some("gpu")
        );
        assert!(properties.discovery_override("encodeVideo"));
        assert_eq!(
            properties.resolve_domain("resizeImage", &static_map).as_deref(),
            Some("exact")
        );
    }
}

//! Pipeline configuration from environment variables

use super::error::ConfigError;
use std::env;
use std::str::FromStr;

/// Source of "now" for a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    /// Wall clock.
    System,
    /// Highest event timestamp seen by the partition (for replaying files).
    EventTime,
}

impl Clock {
    pub fn as_str(&self) -> &'static str {
        match self {
            Clock::System => "system",
            Clock::EventTime => "event_time",
        }
    }
}

impl FromStr for Clock {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Clock::System),
            "event_time" => Ok(Clock::EventTime),
            other => Err(ConfigError::InvalidValue(format!(
                "SERVFLOW_CLOCK must be 'system' or 'event_time', got '{}'",
                other
            ))),
        }
    }
}

/// Configuration for pipeline runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// How long a seen `event_id` is remembered
    pub dedup_horizon_minutes: i64,

    /// Lateness the pipeline guarantees to handle
    pub max_lateness_minutes: i64,

    /// Window bucket granularity
    pub bucket_width_secs: i64,

    pub bucket_retention_minutes: i64,

    pub max_funnel_lifetime_minutes: i64,

    /// Raw events per sink batch
    pub flush_batch_size: usize,

    pub flush_interval_ms: u64,

    pub flush_max_retries: u32,
    pub flush_backoff_initial_ms: u64,
    pub flush_backoff_max_ms: u64,

    /// Number of partitions (one worker each)
    pub partition_count: usize,

    /// Bounded queue size per partition
    pub partition_queue_capacity: usize,

    pub clock: Clock,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: "data/servflow.db".to_string(),
            dedup_horizon_minutes: 10,
            max_lateness_minutes: 5,
            bucket_width_secs: 60,
            bucket_retention_minutes: 70,
            max_funnel_lifetime_minutes: 180,
            flush_batch_size: 1_000,
            flush_interval_ms: 2_000,
            flush_max_retries: 5,
            flush_backoff_initial_ms: 100,
            flush_backoff_max_ms: 5_000,
            partition_count: 4,
            partition_queue_capacity: 10_000,
            clock: Clock::System,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(format!("{} has unparseable value '{}'", key, raw))
        }),
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `SERVFLOW_DB_PATH` (default: data/servflow.db)
    /// - `DEDUP_HORIZON_MINUTES` (default: 10)
    /// - `MAX_LATENESS_MINUTES` (default: 5)
    /// - `BUCKET_WIDTH_SECS` (default: 60)
    /// - `BUCKET_RETENTION_MINUTES` (default: 70)
    /// - `MAX_FUNNEL_LIFETIME_MINUTES` (default: 180)
    /// - `FLUSH_BATCH_SIZE` (default: 1000)
    /// - `FLUSH_INTERVAL_MS` (default: 2000)
    /// - `FLUSH_MAX_RETRIES` (default: 5)
    /// - `FLUSH_BACKOFF_INITIAL_MS` / `FLUSH_BACKOFF_MAX_MS` (default: 100 / 5000)
    /// - `PARTITION_COUNT` (default: 4)
    /// - `PARTITION_QUEUE_CAPACITY` (default: 10000)
    /// - `SERVFLOW_CLOCK` (default: system)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            db_path: lookup("SERVFLOW_DB_PATH").unwrap_or(d.db_path),
            dedup_horizon_minutes: parse_var(&lookup, "DEDUP_HORIZON_MINUTES", d.dedup_horizon_minutes)?,
            max_lateness_minutes: parse_var(&lookup, "MAX_LATENESS_MINUTES", d.max_lateness_minutes)?,
            bucket_width_secs: parse_var(&lookup, "BUCKET_WIDTH_SECS", d.bucket_width_secs)?,
            bucket_retention_minutes: parse_var(
                &lookup,
                "BUCKET_RETENTION_MINUTES",
                d.bucket_retention_minutes,
            )?,
            max_funnel_lifetime_minutes: parse_var(
                &lookup,
                "MAX_FUNNEL_LIFETIME_MINUTES",
                d.max_funnel_lifetime_minutes,
            )?,
            flush_batch_size: parse_var(&lookup, "FLUSH_BATCH_SIZE", d.flush_batch_size)?,
            flush_interval_ms: parse_var(&lookup, "FLUSH_INTERVAL_MS", d.flush_interval_ms)?,
            flush_max_retries: parse_var(&lookup, "FLUSH_MAX_RETRIES", d.flush_max_retries)?,
            flush_backoff_initial_ms: parse_var(
                &lookup,
                "FLUSH_BACKOFF_INITIAL_MS",
                d.flush_backoff_initial_ms,
            )?,
            flush_backoff_max_ms: parse_var(&lookup, "FLUSH_BACKOFF_MAX_MS", d.flush_backoff_max_ms)?,
            partition_count: parse_var(&lookup, "PARTITION_COUNT", d.partition_count)?,
            partition_queue_capacity: parse_var(
                &lookup,
                "PARTITION_QUEUE_CAPACITY",
                d.partition_queue_capacity,
            )?,
            clock: parse_var(&lookup, "SERVFLOW_CLOCK", d.clock)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the pipeline cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidValue(msg));

        if self.partition_count == 0 {
            return invalid("PARTITION_COUNT must be at least 1".to_string());
        }
        if self.partition_queue_capacity == 0 || self.flush_batch_size == 0 {
            return invalid("queue capacity and flush batch size must be positive".to_string());
        }
        if self.bucket_width_secs <= 0 || 300 % self.bucket_width_secs != 0 {
            return invalid(format!(
                "BUCKET_WIDTH_SECS must divide 300, got {}",
                self.bucket_width_secs
            ));
        }
        if self.max_lateness_minutes < 0 || self.dedup_horizon_minutes < self.max_lateness_minutes {
            return invalid(format!(
                "DEDUP_HORIZON_MINUTES ({}) must be >= MAX_LATENESS_MINUTES ({})",
                self.dedup_horizon_minutes, self.max_lateness_minutes
            ));
        }
        if self.bucket_retention_minutes < 60 + self.max_lateness_minutes {
            return invalid(format!(
                "BUCKET_RETENTION_MINUTES must cover the 1h window plus lateness, got {}",
                self.bucket_retention_minutes
            ));
        }
        if self.max_funnel_lifetime_minutes <= self.max_lateness_minutes {
            return invalid("MAX_FUNNEL_LIFETIME_MINUTES must exceed the lateness horizon".to_string());
        }
        if self.flush_backoff_initial_ms > self.flush_backoff_max_ms {
            return invalid("FLUSH_BACKOFF_INITIAL_MS exceeds FLUSH_BACKOFF_MAX_MS".to_string());
        }
        Ok(())
    }

    pub fn dedup_horizon_secs(&self) -> i64 {
        self.dedup_horizon_minutes * 60
    }

    pub fn max_lateness_secs(&self) -> i64 {
        self.max_lateness_minutes * 60
    }

    pub fn bucket_retention_secs(&self) -> i64 {
        self.bucket_retention_minutes * 60
    }

    pub fn max_funnel_lifetime_secs(&self) -> i64 {
        self.max_funnel_lifetime_minutes * 60
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.db_path, "data/servflow.db");
        assert_eq!(config.dedup_horizon_secs(), 600);
        assert_eq!(config.max_lateness_secs(), 300);
        assert_eq!(config.bucket_width_secs, 60);
        assert_eq!(config.flush_batch_size, 1_000);
        assert_eq!(config.flush_interval_ms, 2_000);
        assert_eq!(config.partition_count, 4);
        assert_eq!(config.clock, Clock::System);
    }

    #[test]
    fn test_custom_config() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("SERVFLOW_DB_PATH", "/tmp/test.db"),
            ("PARTITION_COUNT", "8"),
            ("FLUSH_INTERVAL_MS", "500"),
            ("BUCKET_WIDTH_SECS", "30"),
            ("SERVFLOW_CLOCK", "event_time"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.partition_count, 8);
        assert_eq!(config.flush_interval_ms, 500);
        assert_eq!(config.bucket_width_secs, 30);
        assert_eq!(config.clock, Clock::EventTime);
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = PipelineConfig::from_lookup(lookup(&[("PARTITION_COUNT", "many")])).unwrap_err();
        assert!(err.to_string().contains("PARTITION_COUNT"));

        assert!(PipelineConfig::from_lookup(lookup(&[("BUCKET_WIDTH_SECS", "7")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("DEDUP_HORIZON_MINUTES", "3")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("SERVFLOW_CLOCK", "lunar")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("PARTITION_COUNT", "0")])).is_err());
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the stream replicator.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//! Durations are humantime strings (`"100ms"`, `"30s"`).
//!
//! # Quick Start
//!
//! ```rust
//! use stream_replicator::config::ReplicatorConfig;
//!
//! let mut config = ReplicatorConfig::for_testing("orders-replicator");
//! config.input.stream_name = "orders".into();
//! config.output.stream_name = "orders-replica".into();
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── app_name: String            # Lease and checkpoint namespace
//! ├── worker_id: String           # Lease owner identity of this process
//! ├── shutdown_timeout: String    # Drain budget for graceful shutdown
//! ├── input: InputConfig          # Stream read from
//! ├── output: OutputConfig        # Stream written to, flush thresholds
//! ├── retry: RetrySettings        # Sink backoff schedule
//! └── checkpoint: CheckpointConfig # SQLite checkpoint store
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! app_name: "orders-replicator"
//! worker_id: "replicator-eu-1"
//!
//! input:
//!   stream_name: "orders"
//!   region: "us-east-1"
//!   initial_position: "TRIM_HORIZON"
//!   idle_time_between_reads: "100ms"
//!
//! output:
//!   stream_name: "orders"
//!   region: "eu-west-1"
//!   max_records_per_flush: 500
//!
//! checkpoint:
//!   sqlite_path: "/var/lib/replicator/checkpoints.db"
//! ```

use crate::batch::{FlushThresholds, DEFAULT_MAX_BYTES, DEFAULT_MAX_RECORDS};
use crate::error::{ReplicatorError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use crate::source::InitialPosition;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Application name. Namespaces checkpoints so several replicators can
    /// share one store.
    pub app_name: String,

    /// Identity used when taking shard leases.
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// How long `shutdown()` waits for shard loops to drain.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,

    pub input: InputConfig,

    pub output: OutputConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

fn default_worker_id() -> String {
    "replicator-worker".to_string()
}

fn default_shutdown_timeout() -> String {
    "30s".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl ReplicatorConfig {
    /// Create a minimal config for testing.
    ///
    /// Stream names are placeholders; the checkpoint store is in memory.
    pub fn for_testing(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            worker_id: "test-worker".to_string(),
            shutdown_timeout: "5s".to_string(),
            input: InputConfig {
                stream_name: "input".to_string(),
                idle_time_between_reads: "1ms".to_string(),
                ..InputConfig::default()
            },
            output: OutputConfig {
                stream_name: "output".to_string(),
                ..OutputConfig::default()
            },
            retry: RetrySettings::default(),
            checkpoint: CheckpointConfig::in_memory(),
        }
    }

    /// Reject configurations the replicator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.app_name.trim().is_empty() {
            return Err(ReplicatorError::Config("app_name is empty".into()));
        }
        if self.worker_id.trim().is_empty() {
            return Err(ReplicatorError::Config("worker_id is empty".into()));
        }
        if self.input.stream_name.trim().is_empty() {
            return Err(ReplicatorError::Config("input.stream_name is empty".into()));
        }
        if self.output.stream_name.trim().is_empty() {
            return Err(ReplicatorError::Config("output.stream_name is empty".into()));
        }
        if self.input.stream_name == self.output.stream_name && self.input.region == self.output.region {
            return Err(ReplicatorError::Config(format!(
                "input and output are the same stream ({} in {})",
                self.input.stream_name, self.input.region
            )));
        }
        if self.input.max_records_per_fetch == 0 {
            return Err(ReplicatorError::Config("input.max_records_per_fetch must be > 0".into()));
        }
        if self.input.rate_limit_enabled && (self.input.rate_limit_per_sec == 0 || self.input.rate_limit_burst == 0) {
            return Err(ReplicatorError::Config(
                "input rate limit and burst must be > 0 when rate limiting is enabled".into(),
            ));
        }
        if self.output.max_records_per_flush == 0 || self.output.max_bytes_per_flush == 0 {
            return Err(ReplicatorError::Config("output flush thresholds must be > 0".into()));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(ReplicatorError::Config("retry.base_delay_ms must be > 0".into()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ReplicatorError::Config(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if self.checkpoint.sqlite_path.trim().is_empty() {
            return Err(ReplicatorError::Config("checkpoint.sqlite_path is empty".into()));
        }

        parse_duration("shutdown_timeout", &self.shutdown_timeout)?;
        parse_duration("input.idle_time_between_reads", &self.input.idle_time_between_reads)?;
        let timeout = parse_duration("retry.request_timeout", &self.retry.request_timeout)?;
        if timeout.is_zero() {
            return Err(ReplicatorError::Config("retry.request_timeout must be > 0".into()));
        }
        Ok(())
    }

    /// Flush thresholds for every worker.
    pub fn flush_thresholds(&self) -> FlushThresholds {
        FlushThresholds::new(self.output.max_records_per_flush, self.output.max_bytes_per_flush)
    }

    /// Backoff schedule for sink retries.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_factor: 2.0,
            request_timeout: self.request_timeout(),
        }
    }

    /// Pause after an empty fetch.
    pub fn idle_time(&self) -> Duration {
        humantime::parse_duration(&self.input.idle_time_between_reads).unwrap_or(Duration::from_millis(100))
    }

    pub fn request_timeout(&self) -> Duration {
        humantime::parse_duration(&self.retry.request_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Fetch pacing. Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.input.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.input.rate_limit_burst,
                refill_rate: self.input.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| ReplicatorError::Config(format!("{} is not a duration ({:?}): {}", field, value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// InputConfig: stream read from
// ═══════════════════════════════════════════════════════════════════════════════

/// Input stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    pub stream_name: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Where to start on shards without a checkpoint.
    #[serde(default)]
    pub initial_position: InitialPosition,

    /// Upper bound for records returned by one fetch.
    #[serde(default = "default_max_records_per_fetch")]
    pub max_records_per_fetch: usize,

    /// Pause after a fetch that returned nothing.
    #[serde(default = "default_idle_time_between_reads")]
    pub idle_time_between_reads: String,

    /// Credential provider identifier, resolved by the embedding process.
    #[serde(default)]
    pub credentials_provider: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────

    /// Pace reads across all shards of this process.
    #[serde(default)]
    pub rate_limit_enabled: bool,

    /// Maximum records per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_max_records_per_fetch() -> usize {
    10_000
}

fn default_idle_time_between_reads() -> String {
    "100ms".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            region: default_region(),
            initial_position: InitialPosition::Latest,
            max_records_per_fetch: 10_000,
            idle_time_between_reads: "100ms".to_string(),
            credentials_provider: None,
            rate_limit_enabled: false,
            rate_limit_per_sec: 10_000,
            rate_limit_burst: 1000,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OutputConfig: stream written to
// ═══════════════════════════════════════════════════════════════════════════════

/// Output stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub stream_name: String,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub credentials_provider: Option<String>,

    /// Flush once this many records are buffered.
    #[serde(default = "default_max_records_per_flush")]
    pub max_records_per_flush: usize,

    /// Flush once this many payload bytes are buffered.
    #[serde(default = "default_max_bytes_per_flush")]
    pub max_bytes_per_flush: usize,
}

fn default_max_records_per_flush() -> usize {
    DEFAULT_MAX_RECORDS
}

fn default_max_bytes_per_flush() -> usize {
    DEFAULT_MAX_BYTES
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            region: default_region(),
            credentials_provider: None,
            max_records_per_flush: DEFAULT_MAX_RECORDS,
            max_bytes_per_flush: DEFAULT_MAX_BYTES,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetrySettings: sink backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// Sink retry schedule. Delay = min(base × 2^(attempt−1), max).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// A write taking longer than this counts as a transport failure.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    6400
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 6400,
            request_timeout: "30s".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: durable checkpoint store
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to the SQLite database, or `":memory:"`.
    pub sqlite_path: String,

    /// Credential provider identifier for the lease table.
    #[serde(default)]
    pub lease_credentials_provider: Option<String>,

    /// Credential provider identifier for the metrics backend.
    #[serde(default)]
    pub metrics_credentials_provider: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replicator_checkpoints.db".to_string(),
            lease_credentials_provider: None,
            metrics_credentials_provider: None,
        }
    }
}

impl CheckpointConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            ..Self::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ReplicatorConfig {
        ReplicatorConfig::for_testing("app")
    }

    #[test]
    fn test_for_testing_is_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_deserialize_minimal_applies_defaults() {
        let json = r#"{
            "app_name": "orders-replicator",
            "input": { "stream_name": "orders" },
            "output": { "stream_name": "orders-copy" }
        }"#;
        let config: ReplicatorConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.worker_id, "replicator-worker");
        assert_eq!(config.input.region, "us-east-1");
        assert_eq!(config.input.initial_position, InitialPosition::Latest);
        assert_eq!(config.input.max_records_per_fetch, 10_000);
        assert_eq!(config.idle_time(), Duration::from_millis(100));
        assert_eq!(config.output.max_records_per_flush, 500);
        assert_eq!(config.output.max_bytes_per_flush, 4 * 1024 * 1024);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.retry.max_delay_ms, 6400);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.checkpoint.sqlite_path, "replicator_checkpoints.db");
        assert!(config.rate_limit_config().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_full() {
        let json = r#"{
            "app_name": "a",
            "worker_id": "w-1",
            "shutdown_timeout": "10s",
            "input": {
                "stream_name": "in",
                "region": "us-west-2",
                "initial_position": "TRIM_HORIZON",
                "credentials_provider": "InstanceProfile",
                "rate_limit_enabled": true,
                "rate_limit_per_sec": 50,
                "rate_limit_burst": 5
            },
            "output": { "stream_name": "in", "region": "eu-west-1", "max_records_per_flush": 3 },
            "retry": { "base_delay_ms": 10, "max_delay_ms": 80, "request_timeout": "2s" },
            "checkpoint": { "sqlite_path": ":memory:", "lease_credentials_provider": "Profile" }
        }"#;
        let config: ReplicatorConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.input.initial_position, InitialPosition::TrimHorizon);
        assert_eq!(config.input.credentials_provider.as_deref(), Some("InstanceProfile"));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.flush_thresholds(), FlushThresholds::new(3, 4 * 1024 * 1024));

        let retry = config.retry_config();
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_millis(80));
        assert_eq!(retry.request_timeout, Duration::from_secs(2));

        let rate = config.rate_limit_config().unwrap();
        assert_eq!(rate.refill_rate, 50);
        assert_eq!(rate.burst_size, 5);
    }

    #[test]
    fn test_validate_rejects_empty_names() {
        let mut config = valid();
        config.app_name = " ".into();
        assert!(matches!(config.validate(), Err(ReplicatorError::Config(_))));

        let mut config = valid();
        config.output.stream_name.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_same_stream() {
        let mut config = valid();
        config.output.stream_name = config.input.stream_name.clone();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("same stream"));

        // Same name in another region is a legitimate cross-region copy
        config.output.region = "eu-west-1".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_thresholds() {
        let mut config = valid();
        config.output.max_records_per_flush = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.input.max_records_per_fetch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let mut config = valid();
        config.retry.base_delay_ms = 500;
        config.retry.max_delay_ms = 100;
        assert!(config.validate().unwrap_err().to_string().contains("max_delay_ms"));
    }

    #[test]
    fn test_validate_rejects_bad_durations() {
        let mut config = valid();
        config.input.idle_time_between_reads = "soon".into();
        assert!(config.validate().unwrap_err().to_string().contains("idle_time_between_reads"));

        let mut config = valid();
        config.retry.request_timeout = "0s".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_rate_limit() {
        let mut config = valid();
        config.input.rate_limit_enabled = true;
        config.input.rate_limit_per_sec = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unparseable_duration_falls_back() {
        let mut config = valid();
        config.retry.request_timeout = "whenever".into();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_checkpoint_in_memory() {
        assert_eq!(CheckpointConfig::in_memory().sqlite_path, ":memory:");
    }
}

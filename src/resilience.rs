// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: backoff schedule, injectable sleeping, rate limiting.
//!
//! - [`RetryConfig`]: capped exponential backoff for sink retries and fetch errors
//! - [`Sleeper`]: the single suspension point of every retry loop, swappable in tests
//! - [`RateLimiter`]: token bucket pacing reads from the input stream
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use stream_replicator::resilience::{RateLimiter, RateLimitConfig, RetryConfig};
//! use std::time::Duration;
//!
//! let retry = RetryConfig::default();
//! assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
//!
//! // Max 1000 records/sec with burst of 100
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire_records(42).await;
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::future::Future;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// Backoff schedule for retried operations.
///
/// There is no attempt ceiling. A batch is retried until it is delivered or
/// the worker is shut down.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Upper bound for a single sink write; exceeding it counts as a
    /// transport failure.
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(6400),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Schedule for input-stream fetch errors in the shard loop.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9+       300s (cap)
    /// ```
    pub fn fetch() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Fast schedule for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    ///
    /// `min(initial_delay × factor^(attempt − 1), max_delay)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        // Past 63 doublings every realistic schedule is pinned at the cap.
        let exponent = (attempt - 1).min(63) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

// =============================================================================
// Sleeping
// =============================================================================

/// Suspension used between retries.
///
/// Production code uses [`TokioSleeper`]; tests inject [`RecordingSleeper`]
/// to observe the schedule without waiting for it.
pub trait Sleeper: Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Real sleeping on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(duration);
        }
        Box::pin(async {})
    }
}

// =============================================================================
// Shutdown Signalling
// =============================================================================

/// Check the shutdown flag without waiting.
pub fn is_signalled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Resolves once the shutdown flag is set.
///
/// If every sender is dropped without signalling, this never resolves, so it
/// can be raced in `select!` without turning a dropped handle into a shutdown.
pub async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let signalled = shutdown.wait_for(|flag| *flag).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}

/// Sleep for `delay` unless shutdown is signalled first.
///
/// Returns `false` when interrupted.
pub async fn sleep_or_shutdown(
    sleeper: &dyn Sleeper,
    delay: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        biased;
        _ = shutdown_signalled(shutdown) => false,
        _ = sleeper.sleep(delay) => true,
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Fetch pacing for the input stream.
///
/// Token bucket: `records_per_sec` tokens refill each second, up to
/// `burst_size`. Each fetched record costs one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Records that may be read back to back after an idle period.
    pub burst_size: u32,

    /// Sustained records per second across all shards.
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// 1000 records/sec with a burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Record-rate limiter shared by all shard loops of an engine.
///
/// A fleet of shards catching up at once cannot exceed the configured rate.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Zero rates are raised to 1.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait until `records` tokens have been taken.
    ///
    /// Counts above the burst size are taken in burst-sized chunks. Cancel-safe:
    /// dropping the future forfeits only the chunk in progress.
    pub async fn acquire_records(&self, records: usize) {
        let burst = self.config.burst_size.max(1) as usize;
        let mut remaining = records;

        while remaining > 0 {
            let chunk = remaining.min(burst);
            let Some(n) = u32::try_from(chunk).ok().and_then(NonZeroU32::new) else {
                return;
            };
            // `chunk` never exceeds the quota's burst, so InsufficientCapacity cannot occur.
            let _ = self.limiter.until_n_ready(n).await;
            remaining -= chunk;
        }
    }

    /// Take `records` tokens if they are available right now.
    pub fn try_acquire_records(&self, records: u32) -> bool {
        match NonZeroU32::new(records) {
            None => true,
            Some(n) => matches!(self.limiter.check_n(n), Ok(Ok(()))),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

//! Connection retry with exponential backoff.
//!
//! Brokers are often still starting when a service boots. The transport
//! builder wraps the initial connect in [`retry_with_backoff`], which retries
//! only [`Error::TransportRetryable`]. Anything else, a malformed URI for
//! example, fails straight away.

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;

use crate::{Error, Result};

/// Backoff settings for the initial broker connection.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = try once).
    pub max_attempts: u32,

    /// Growth factor applied to the delay after every retry.
    pub multiplier: f32,

    pub initial_delay: Duration,

    /// Upper bound for a single delay, before jitter.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// 5 retries starting at 200ms, doubling, capped at 5s.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Un-jittered delays, one per retry.
    pub(crate) fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let factor = f64::from(self.multiplier.max(1.0));
        let cap = self.max_delay;
        std::iter::successors(Some(self.initial_delay.min(cap)), move |prev| {
            Some(Duration::from_secs_f64(prev.as_secs_f64() * factor).min(cap))
        })
        .take(self.max_attempts as usize)
    }
}

/// Run `operation`, retrying retryable transport errors per `config`.
///
/// With `config` set to `None` the operation runs exactly once. `what` names
/// the operation in log lines.
#[cfg_attr(not(feature = "transport_lapin"), allow(dead_code))]
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    config: Option<&RetryConfig>,
    what: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let Some(config) = config else {
        return operation().await;
    };

    let mut delays = config.delays();
    let mut attempt = 1u32;

    loop {
        let details = match operation().await {
            Err(Error::TransportRetryable(details)) => details,
            other => return other,
        };

        let Some(delay) = delays.next() else {
            log_warn!("{what}: giving up after {attempt} attempts: {details}");
            return Err(Error::TransportRetryable(details));
        };

        let delay = jitter(delay);
        log_info!(
            "{what}: attempt {attempt}/{} failed ({details}); retrying in {delay:?}",
            config.max_attempts + 1
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Scale `delay` by a random factor in `0.75..=1.25`.
fn jitter(delay: Duration) -> Duration {
    let seed = RandomState::new().hash_one(std::time::Instant::now());
    let factor = 0.75 + (seed % 501) as f64 / 1000.0;
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

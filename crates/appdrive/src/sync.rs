//! Idle detection and wait loops.
//!
//! Every interaction with the application is followed by a wait until the
//! app is quiescent. Quiescence is the conjunction of three signals, each
//! sampled in the same probe:
//!
//! - no in-flight network requests,
//! - no DOM mutation within the debounce window,
//! - the application's own busy indicator is clear.
//!
//! A single sample showing all three is enough. There is no ordering
//! between them, and the debounce only applies to DOM mutations.
//!
//! Signals come from a [`SignalSource`]. The browser session implements it
//! against the page; tests implement it with a scripted fake so the loop
//! can be exercised without a browser.

use crate::error::{DriverError, Result};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};

/// Default interval between probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default DOM quiescence window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// One sample of the readiness signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleSignals {
    /// Network requests started but not yet finished or failed.
    pub pending_requests: usize,
    /// Time since the last observed DOM mutation.
    pub quiet_for: Duration,
    /// The application's own busy flag, including unacknowledged inputs.
    pub app_busy: bool,
}

impl IdleSignals {
    /// Returns true if all three signals indicate quiescence.
    #[must_use]
    pub fn is_idle(&self, debounce: Duration) -> bool {
        self.pending_requests == 0 && self.quiet_for >= debounce && !self.app_busy
    }
}

impl fmt::Display for IdleSignals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending_requests={}, dom_quiet_for={:?}, app_busy={}",
            self.pending_requests, self.quiet_for, self.app_busy
        )
    }
}

/// Something that can be probed for readiness.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Takes one sample.
    ///
    /// Transient failures (a navigation in progress, a bridge not yet
    /// installed) are retried by the caller. Terminal failures
    /// (see [`DriverError::is_terminal`]) end the wait immediately.
    async fn sample(&self) -> Result<IdleSignals>;
}

/// Tuning for [`wait_for_idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleConfig {
    /// Delay between probes.
    pub poll_interval: Duration,
    /// Required DOM quiescence.
    pub debounce: Duration,
    /// Upper bound on the whole wait.
    pub timeout: Duration,
}

impl IdleConfig {
    /// Creates an idle configuration with default probing and the given timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
            timeout,
        }
    }
}

/// Outcome of a successful idle wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleReport {
    /// The sample that satisfied the condition.
    pub signals: IdleSignals,
    /// Number of probes taken.
    pub polls: u32,
    /// Time spent waiting.
    pub elapsed: Duration,
}

/// Polls `source` until a sample is idle or `config.timeout` expires.
///
/// # Errors
///
/// - `StillBusy` with the last sampled values when the timeout expires
/// - any terminal error returned by the source, unchanged
pub async fn wait_for_idle(source: &dyn SignalSource, config: &IdleConfig) -> Result<IdleReport> {
    let start = Instant::now();
    let mut polls = 0u32;
    let mut last = None;
    let mut last_error = None;

    loop {
        polls += 1;
        // A page stuck in a long script stalls the sample itself.
        let remaining = config.timeout.saturating_sub(start.elapsed());
        let sample = timeout(remaining, source.sample())
            .await
            .unwrap_or_else(|_| Err(stalled("readiness sample", remaining)));
        match sample {
            Ok(signals) => {
                if signals.is_idle(config.debounce) {
                    let elapsed = start.elapsed();
                    tracing::trace!(polls, ?elapsed, "application idle");
                    return Ok(IdleReport {
                        signals,
                        polls,
                        elapsed,
                    });
                }
                last = Some(signals);
            }
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) => {
                tracing::trace!(error = %e, "idle probe failed, retrying");
                last_error = Some(e.to_string());
            }
        }

        if start.elapsed() >= config.timeout {
            tracing::debug!(polls, ?last, "gave up waiting for idle");
            return Err(DriverError::StillBusy {
                timeout: config.timeout,
                last,
                last_error,
            });
        }

        sleep(config.poll_interval).await;
    }
}

/// Timeout and poll interval for generic condition waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    /// Maximum time to wait for the condition.
    pub timeout: Duration,
    /// How often to check the condition.
    pub poll_interval: Duration,
}

impl WaitConfig {
    /// Creates a wait configuration.
    #[must_use]
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    /// Creates a config with the given timeout and the default poll interval.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(timeout, DEFAULT_POLL_INTERVAL)
    }
}

/// Waits for a fallible condition that yields a value once satisfied.
///
/// `condition` returning `Ok(None)` or a non-terminal error keeps waiting.
/// On expiry, `on_timeout` builds the error to return.
///
/// # Errors
///
/// Returns the first terminal error from `condition`, or the error built by
/// `on_timeout`.
pub async fn wait_for_result<T, F, Fut, E>(
    mut condition: F,
    config: WaitConfig,
    on_timeout: E,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
    E: FnOnce() -> DriverError,
{
    let start = Instant::now();

    loop {
        let remaining = config.timeout.saturating_sub(start.elapsed());
        let outcome = timeout(remaining, condition())
            .await
            .unwrap_or_else(|_| Err(stalled("wait condition", remaining)));
        match outcome {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) => tracing::trace!(error = %e, "wait condition failed, retrying"),
        }

        if start.elapsed() >= config.timeout {
            return Err(on_timeout());
        }

        sleep(config.poll_interval).await;
    }
}

fn stalled(operation: &str, timeout: Duration) -> DriverError {
    DriverError::ProtocolTimeout {
        operation: operation.to_string(),
        timeout,
    }
}

//! Exponential-backoff retry envelope.
//!
//! Retries suspend on the backoff timer and abort early when either the
//! caller's cancellation token or the configured shutdown closer fires.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Backoff envelope for a retry loop.
#[derive(Clone, Debug)]
pub struct RetryOptions {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Maximum number of retries after the first attempt. 0 = unlimited.
    pub max_retries: u32,
    /// Fires on process shutdown; pending backoffs are abandoned.
    pub closer: Option<CancellationToken>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_retries: 0,
            closer: None,
        }
    }
}

/// Retry loop driver.
///
/// The first call to [`Retry::next`] returns immediately; each subsequent
/// call sleeps the current backoff before returning `true`. Returns `false`
/// once retries are exhausted or the closer / cancellation token fires.
pub struct Retry {
    opts: RetryOptions,
    attempt: u32,
}

impl Retry {
    pub fn new(opts: &RetryOptions) -> Self {
        Self {
            opts: opts.clone(),
            attempt: 0,
        }
    }

    /// Attempts made so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn backoff(&self) -> Duration {
        let exp = self.attempt.saturating_sub(1);
        let backoff = self.opts.initial_backoff.as_secs_f64() * self.opts.multiplier.powi(exp as i32);
        // Clamp in float space: the exponential overflows f64 long before
        // it would fit in a Duration.
        let capped = backoff.min(self.opts.max_backoff.as_secs_f64());
        if !capped.is_finite() || capped <= 0.0 {
            return self.opts.max_backoff;
        }
        Duration::from_secs_f64(capped)
    }

    pub async fn next(&mut self, ctx: &CancellationToken) -> bool {
        if ctx.is_cancelled() {
            return false;
        }
        if let Some(closer) = &self.opts.closer {
            if closer.is_cancelled() {
                return false;
            }
        }
        if self.attempt == 0 {
            self.attempt = 1;
            return true;
        }
        if self.opts.max_retries > 0 && self.attempt > self.opts.max_retries {
            return false;
        }

        let backoff = self.backoff();
        self.attempt += 1;
        match &self.opts.closer {
            Some(closer) => {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => true,
                    _ = ctx.cancelled() => false,
                    _ = closer.cancelled() => false,
                }
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => true,
                    _ = ctx.cancelled() => false,
                }
            }
        }
    }
}

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Bounds for a retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
    /// Total attempts including the first one. `None` retries forever.
    pub max_attempts: Option<usize>,
}

impl RetryPolicy {
    /// Unbounded policy doubling from `initial_delay` up to `max_delay`.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: None,
        }
    }

    /// Caps the number of attempts. Zero is treated as one.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// A fresh delay sequence for this policy.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_delay, self.max_delay)
    }

    fn exhausted(&self, attempt: usize) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// # Backoff
///
/// Doubling delay capped at `max`. Serial devices hold one across connect
/// attempts and reset it once a port opens; [`retry_transient`] takes a fresh
/// one per call.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Starts at `initial`, never exceeds `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial.min(max),
        }
    }

    /// The delay to wait now; the next call returns twice as much.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Back to the initial delay, called after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}

/// Why [`retry_transient`] gave up. Every variant carries the last failure.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The failure was not transient; retrying would not help.
    #[error("{0}")]
    Rejected(E),

    /// The attempt budget ran out.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: usize,
        /// Failure of the last attempt.
        last: E,
    },

    /// Cancellation fired while waiting for the next attempt.
    #[error("cancelled while retrying: {0}")]
    Cancelled(E),
}

impl<E> RetryError<E> {
    /// The last failure.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Rejected(e) | RetryError::Cancelled(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Runs `operation` until it succeeds, fails with an error `is_transient`
/// refuses, runs out of attempts or `cancel` fires during a wait.
///
/// `on_failure(attempt, error, next_delay)` is told about every transient
/// failure; `next_delay` is `None` when no further attempt follows.
pub async fn retry_transient<T, E, F, Fut, P, L>(
    policy: RetryPolicy,
    cancel: Option<&CancellationToken>,
    mut operation: F,
    is_transient: P,
    mut on_failure: L,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    L: FnMut(usize, &E, Option<Duration>),
{
    let mut backoff = policy.backoff();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_transient(&err) {
            return Err(RetryError::Rejected(err));
        }
        if policy.exhausted(attempt) {
            on_failure(attempt, &err, None);
            return Err(RetryError::Exhausted { attempts: attempt, last: err });
        }

        let delay = backoff.next_delay();
        on_failure(attempt, &err, Some(delay));

        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(RetryError::Cancelled(err)),
                    _ = sleep(delay) => {}
                }
            }
            None => sleep(delay).await,
        }
    }
}

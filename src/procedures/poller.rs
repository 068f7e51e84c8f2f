//! Command-then-poll convergence primitive.
//!
//! Every bring-up stage that waits on the controller uses [`ConvergencePoller`]:
//! the stage issues its command, then the poller re-reads hardware state every
//! `interval` until a predicate holds or `timeout` has elapsed. The timeout is
//! checked once per iteration, after the read, so it is a lower bound: a read
//! that blocks for a long time can push the observed elapsed time past it.
//!
//! Emission confirmation wraps the same loop in an attempt loop
//! ([`ConvergencePoller::poll_attempts`]) that re-issues the command at the
//! start of every attempt.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Successful convergence.
#[derive(Debug, Clone)]
pub struct Converged<S> {
    /// Last state read from the hardware (satisfies the predicate).
    pub state: S,
    /// Reads performed in the converging attempt.
    pub iterations: u32,
    /// Time since polling started, across all attempts.
    pub elapsed: Duration,
    /// Attempt that converged (1-based). Always 1 for single-attempt polls.
    pub attempt: u32,
}

/// Why a poll did not converge.
#[derive(Debug, Error)]
pub enum PollError {
    /// The predicate never held within the timeout.
    #[error("not confirmed after {elapsed:?} ({iterations} reads)")]
    TimedOut {
        /// Time spent polling.
        elapsed: Duration,
        /// Reads performed.
        iterations: u32,
    },

    /// Every attempt timed out.
    #[error("not confirmed after {attempts} attempts ({elapsed:?})")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Time spent across all attempts.
        elapsed: Duration,
    },

    /// A command or read failed.
    #[error(transparent)]
    Hardware(#[from] anyhow::Error),
}

/// Result of an attempt loop, with one record per attempt.
#[derive(Debug)]
pub struct AttemptOutcome<S, T> {
    /// Convergence or the reason it failed.
    pub result: Result<Converged<S>, PollError>,
    /// Value produced after each attempt, in order.
    pub records: Vec<T>,
}

/// Poll interval, timeout and attempt bound for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergencePoller {
    interval: Duration,
    timeout: Duration,
    max_attempts: u32,
}

impl ConvergencePoller {
    /// Single-attempt poller.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            max_attempts: 1,
        }
    }

    /// Bound the attempt loop of [`poll_attempts`](Self::poll_attempts).
    /// Zero is treated as one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Interval between reads.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Timeout per attempt.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Attempt bound.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Read state until `done` holds or the timeout elapses.
    ///
    /// Reads immediately, then once per interval. Returns the last state read.
    pub async fn poll_until<S, R, RF, P>(
        &self,
        mut read: R,
        mut done: P,
    ) -> Result<Converged<S>, PollError>
    where
        R: FnMut() -> RF,
        RF: Future<Output = anyhow::Result<S>>,
        P: FnMut(&S) -> bool,
    {
        let start = Instant::now();
        let mut iterations = 0u32;
        loop {
            let state = read().await?;
            iterations += 1;
            if done(&state) {
                return Ok(Converged {
                    state,
                    iterations,
                    elapsed: start.elapsed(),
                    attempt: 1,
                });
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(PollError::TimedOut {
                    elapsed,
                    iterations,
                });
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Attempt loop: issue `command`, then [`poll_until`](Self::poll_until).
    ///
    /// `after_attempt(attempt, confirmed)` runs after every attempt, whether
    /// it converged or not, and its output is collected in
    /// [`AttemptOutcome::records`]. A hardware error ends the loop at once.
    pub async fn poll_attempts<S, T, C, CF, R, RF, P, A, AF>(
        &self,
        mut command: C,
        mut read: R,
        mut done: P,
        mut after_attempt: A,
    ) -> AttemptOutcome<S, T>
    where
        C: FnMut(u32) -> CF,
        CF: Future<Output = anyhow::Result<()>>,
        R: FnMut() -> RF,
        RF: Future<Output = anyhow::Result<S>>,
        P: FnMut(&S) -> bool,
        A: FnMut(u32, bool) -> AF,
        AF: Future<Output = T>,
    {
        let start = Instant::now();
        let mut records = Vec::new();

        for attempt in 1..=self.max_attempts {
            if let Err(e) = command(attempt).await {
                return AttemptOutcome {
                    result: Err(PollError::Hardware(e)),
                    records,
                };
            }

            let polled = self.poll_until(&mut read, &mut done).await;
            records.push(after_attempt(attempt, polled.is_ok()).await);

            match polled {
                Ok(converged) => {
                    return AttemptOutcome {
                        result: Ok(Converged {
                            attempt,
                            elapsed: start.elapsed(),
                            ..converged
                        }),
                        records,
                    }
                }
                Err(PollError::TimedOut { elapsed, .. }) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        ?elapsed,
                        "attempt not confirmed"
                    );
                }
                Err(other) => {
                    return AttemptOutcome {
                        result: Err(other),
                        records,
                    }
                }
            }
        }

        AttemptOutcome {
            result: Err(PollError::Exhausted {
                attempts: self.max_attempts,
                elapsed: start.elapsed(),
            }),
            records,
        }
    }
}

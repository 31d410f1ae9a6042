//! Bounded retry with a fixed delay.
//!
//! [`RetryPolicy::run`] is the single loop behind every retried operation in
//! the workflow; [`converge`] builds predicate polling on top of it.
use crate::clock::Clock;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait after each attempt that asks for a retry, including the last.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Run `attempt` (1-based attempt number) until it finishes, aborts, or
    /// the attempt budget is spent.
    pub fn run<T, E>(
        &self,
        clock: &dyn Clock,
        label: &str,
        mut attempt: impl FnMut(u32) -> Attempt<T, E>,
    ) -> Result<Retried<T>, RetryError<E>> {
        let mut last_reason = String::new();
        for number in 1..=self.max_attempts {
            match attempt(number) {
                Attempt::Done(value) => {
                    if number > 1 {
                        tracing::info!(label, attempts = number, "retry succeeded");
                    }
                    return Ok(Retried {
                        value,
                        attempts: number,
                    });
                }
                Attempt::Abort(error) => {
                    return Err(RetryError::Aborted {
                        error,
                        attempt: number,
                    });
                }
                Attempt::Retry(reason) => {
                    tracing::warn!(
                        label,
                        attempt = number,
                        max_attempts = self.max_attempts,
                        %reason,
                        "attempt failed"
                    );
                    last_reason = reason;
                    if !self.delay.is_zero() {
                        clock.sleep(self.delay);
                    }
                }
            }
        }
        Err(RetryError::Exhausted {
            attempts: self.max_attempts,
            last_reason,
        })
    }
}

/// What a single attempt decided.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    /// Failed in a way another attempt may fix.
    Retry(String),
    /// Failed in a way no further attempt can fix.
    Abort(E),
}

#[derive(Debug, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    Aborted { error: E, attempt: u32 },
    Exhausted { attempts: u32, last_reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// The predicate held after `remediations` remediation rounds.
    Converged { remediations: u32 },
    /// The predicate never held within the budget.
    TimedOut { iterations: u32 },
}

/// Poll `satisfied`; while it does not hold, call `remediate` and wait the
/// policy delay. After the last iteration the predicate is checked once more.
pub fn converge(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    label: &str,
    mut satisfied: impl FnMut() -> bool,
    mut remediate: impl FnMut(u32),
) -> Convergence {
    let result = policy.run::<u32, ()>(clock, label, |iteration| {
        if satisfied() {
            return Attempt::Done(iteration - 1);
        }
        remediate(iteration);
        Attempt::Retry(format!("{label} not converged"))
    });
    match result {
        Ok(retried) => Convergence::Converged {
            remediations: retried.value,
        },
        Err(RetryError::Exhausted { attempts, .. }) => {
            if satisfied() {
                Convergence::Converged {
                    remediations: attempts,
                }
            } else {
                Convergence::TimedOut {
                    iterations: attempts,
                }
            }
        }
        Err(RetryError::Aborted { attempt, .. }) => Convergence::TimedOut {
            iterations: attempt,
        },
    }
}

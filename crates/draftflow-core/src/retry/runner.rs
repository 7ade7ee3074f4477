use std::fmt::Display;
use std::future::Future;

use thiserror::Error;

use super::policy::RetryPolicy;
use crate::error::DraftflowError;

/// Classifies an error as worth retrying.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for DraftflowError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E: Display> {
    /// Every attempt failed with a retryable error.
    #[error("retry exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
    /// An attempt failed with a non-retryable error.
    #[error("aborted on attempt {attempt}: {error}")]
    Aborted { attempt: u32, error: E },
}

impl<E: Display> RetryError<E> {
    /// Number of attempts that were made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            Self::Aborted { attempt, .. } => *attempt,
        }
    }

    /// Whether the attempt budget ran out.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// The last underlying error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::Aborted { error, .. } => error,
        }
    }
}

impl From<RetryError<DraftflowError>> for DraftflowError {
    fn from(e: RetryError<DraftflowError>) -> Self {
        match e {
            RetryError::Exhausted {
                attempts,
                last_error,
            } if last_error.is_transient() => DraftflowError::RetryExhausted {
                attempts,
                last_error: last_error.to_string(),
            },
            other => other.into_inner(),
        }
    }
}

/// Run `op` under `policy`, using the error's own [`Retryable`] classification.
///
/// `op` receives the 1-based attempt number.
pub async fn run<T, E, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, RetryError<E>>
where
    E: Retryable + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    run_with(policy, |e: &E| e.is_retryable(), op).await
}

/// Run `op` under `policy` with an explicit retry predicate.
pub async fn run_with<T, E, P, F, Fut>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    P: Fn(&E) -> bool,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if !is_retryable(&error) => {
                return Err(RetryError::Aborted { attempt, error });
            }
            Err(error) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }
            Err(error) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay = ?delay,
                    error = %error,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<&str, RetryError<DraftflowError>> = run(&fast_policy(3), move |_| async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DraftflowError::TransientStore("blip".into()))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempt_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = run(&fast_policy(3), move |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DraftflowError::TransientStore("down".into()))
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let converted: DraftflowError = err.into();
        assert!(matches!(
            converted,
            DraftflowError::RetryExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_non_retryable_aborts_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = run(&fast_policy(5), move |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DraftflowError::Validation("bad input".into()))
        })
        .await;

        let err = result.unwrap_err();
        assert!(!err.is_exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            DraftflowError::from(err),
            DraftflowError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_custom_predicate_and_attempt_numbers() {
        let mut seen = Vec::new();
        let result: Result<(), RetryError<String>> = run_with(
            &fast_policy(4),
            |e: &String| e.starts_with("retry"),
            |attempt| {
                seen.push(attempt);
                async move {
                    if attempt < 3 {
                        Err("retry me".to_string())
                    } else {
                        Err("fatal".to_string())
                    }
                }
            },
        )
        .await;

        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(result.unwrap_err().into_inner(), "fatal");
    }

    #[test]
    fn test_single_attempt_policy_runs_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> =
            tokio_test::block_on(run(&RetryPolicy::single_attempt(), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DraftflowError::TransientStore("down".into()))
            }));

        assert!(result.unwrap_err().is_exhausted());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_between_attempts() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(2), Duration::from_secs(60));
        let start = tokio::time::Instant::now();
        let _: Result<(), _> = run(&policy, |_| async {
            Err(DraftflowError::TransientStore("down".into()))
        })
        .await;

        // 2s after the first failure, 4s after the second.
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }
}

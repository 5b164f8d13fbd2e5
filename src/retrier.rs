use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{ErrorKind, UploadError};
use crate::interrupter::Interrupter;

/// Bounded-attempt retry with exponential backoff, generalized from the
/// teacher's `utils::with_retry`: that helper retried unconditionally until
/// the attempt budget ran out. This one additionally (spec §4.6):
///   1. propagates immediately on a non-recoverable error,
///   2. propagates immediately on an `Interrupted` error,
///   3. races the backoff sleep against the interrupter so a fired
///      cancellation ends the wait early instead of after the full delay.
#[derive(Debug, Clone)]
pub struct Retrier {
    max_attempts: u32,
    base_delay_ms: u64,
}

impl Retrier {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    pub async fn run<F, Fut, T>(
        &self,
        interrupter: &dyn Interrupter,
        mut f: F,
    ) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        if let Some(reason) = interrupter.reason() {
            return Err(UploadError::Interrupted(reason));
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match f().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            if err.is_interrupted() || err.kind() == ErrorKind::BrokerShutdown {
                return Err(err);
            }
            if !err.is_recoverable() {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                return Err(err);
            }

            let backoff = self.base_delay_ms.saturating_mul(1u64 << (attempt - 1));
            debug!(attempt, backoff_ms = backoff, error = %err, "retrying after backoff");

            if !sleep_cancellable(Duration::from_millis(backoff), interrupter).await {
                return Err(UploadError::Interrupted(
                    interrupter
                        .reason()
                        .unwrap_or_else(|| "interrupted during backoff".to_string()),
                ));
            }
        }
    }
}

/// Sleeps for `dur`, polling the interrupter at a fine interval so a fired
/// cancellation ends the wait well before `dur` elapses. Returns `false` if
/// interrupted mid-sleep.
async fn sleep_cancellable(dur: Duration, interrupter: &dyn Interrupter) -> bool {
    const POLL_INTERVAL: Duration = Duration::from_millis(20);
    let mut remaining = dur;
    loop {
        if interrupter.check() {
            return false;
        }
        if remaining.is_zero() {
            return true;
        }
        let step = remaining.min(POLL_INTERVAL);
        tokio::time::sleep(step).await;
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupter::NeverInterrupted;
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_retry() {
        let retrier = Retrier::new(3, 10);
        let calls = Cell::new(0);
        let result: Result<u32, UploadError> = retrier
            .run(&NeverInterrupted, || {
                calls.set(calls.get() + 1);
                async { Ok(42) }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_recoverable_errors_until_budget_exhausted() {
        let retrier = Retrier::new(3, 10);
        let calls = Cell::new(0);
        let result: Result<u32, UploadError> = retrier
            .run(&NeverInterrupted, || {
                calls.set(calls.get() + 1);
                async { Err(UploadError::S3Transport("boom".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_non_recoverable_errors() {
        let retrier = Retrier::new(5, 10);
        let calls = Cell::new(0);
        let result: Result<u32, UploadError> = retrier
            .run(&NeverInterrupted, || {
                calls.set(calls.get() + 1);
                async { Err(UploadError::S3Permanent("nope".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_interrupted() {
        let retrier = Retrier::new(5, 10);
        let calls = Cell::new(0);
        let result: Result<u32, UploadError> = retrier
            .run(&NeverInterrupted, || {
                calls.set(calls.get() + 1);
                async { Err(UploadError::Interrupted("stop".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}

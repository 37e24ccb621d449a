//! Bounded retry of transactional operations.
//!
//! System-initiated flows (hooks, the upload finaliser) run their
//! read-modify-commit cycles through [`retry`]: an optimistic-concurrency
//! conflict means some other writer won the race, so the operation reloads
//! and tries again. Every other error is returned immediately.

use std::future::Future;
use std::sync::LazyLock;

use tokio_util::sync::CancellationToken;

use crate::config::{self, ConfigOption};
use crate::error::{Error, Result};

/// Maximum number of attempts for a conflicting operation.
pub static OPT_RETRY_COUNT: LazyLock<&'static ConfigOption<i64>> =
    LazyLock::new(|| config::int_opt("retry_count", 3));

/// Runs `op` until it succeeds, fails with a non-conflict error, or the
/// attempt budget (`retry_count` option) is exhausted.
///
/// Cancellation is honoured between attempts; an in-flight attempt runs to
/// its own completion.
///
/// # Errors
///
/// Returns [`Error::Interrupted`] when `shutdown` is cancelled, the last
/// conflict when attempts run out, or the first non-conflict error.
pub async fn retry<T, F, Fut>(shutdown: &CancellationToken, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = OPT_RETRY_COUNT.value().max(1);
    let mut last = Error::Interrupted;
    for attempt in 0..attempts {
        if shutdown.is_cancelled() {
            return Err(Error::Interrupted);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() => {
                tracing::warn!(attempt, error = %e, "conflict, trying again");
                last = e;
            }
            Err(e) => {
                tracing::error!(attempt, error = %e, "operation failed, can't retry");
                return Err(e);
            }
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let shutdown = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let result = retry(&shutdown, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::Conflict { xid: "x1".into() })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_conflict_errors_are_not_retried() {
        let shutdown = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry(&shutdown, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::backend("gone")) }
        })
        .await;
        assert!(matches!(result, Err(Error::Backend { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_conflict() {
        let shutdown = CancellationToken::new();
        let result: Result<()> = retry(&shutdown, || async {
            Err(Error::Conflict { xid: "x2".into() })
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn cancellation_interrupts_between_attempts() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let result: Result<()> = retry(&shutdown, || async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Interrupted)));
    }
}

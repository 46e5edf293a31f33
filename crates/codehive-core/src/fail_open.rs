//! Fail-open helpers for side effects that must not abort a cycle
//!
//! Used for snapshots and checkpoints taken during a phase, snapshot
//! metadata lookups, snapshot cleanup and instruction token counts.
//! Status writes, phase transitions and git commits never fail open.

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run `f`, logging and swallowing any error
///
/// ```no_run
/// use codehive_core::fail_open::fail_open;
/// use codehive_core::Result;
///
/// async fn prune() -> Result<usize> {
///     Ok(0)
/// }
///
/// async fn example() {
///     let removed = fail_open("snapshot_cleanup", || prune()).await;
///     assert!(removed.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Like `fail_open` with linear backoff (`100ms * attempt`) between attempts
pub async fn fail_open_with_retries<F, Fut, T>(
    operation_name: &str,
    mut f: F,
    max_retries: usize,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=max_retries {
        match f().await {
            Ok(val) => return Some(val),
            Err(e) => {
                if attempt == max_retries {
                    warn!(
                        "{} failed after {} retries (fail-open): {}",
                        operation_name, max_retries, e
                    );
                    return None;
                }
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_retries, e
                );
                let delay_ms = 100 * attempt as u64;
                tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CodehiveError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, CodehiveError>(7) }).await;
        assert_eq!(result, Some(7));
    }

    #[tokio::test]
    async fn test_fail_open_swallows_error() {
        let result = fail_open("test_op", || async {
            Err::<i32, _>(CodehiveError::Store("disk full".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_fail_open_with_retries_success_after_retry() {
        let mut attempts = 0;
        let result = fail_open_with_retries(
            "test_op",
            || {
                attempts += 1;
                async move {
                    if attempts < 2 {
                        Err(CodehiveError::Other("transient".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            },
            3,
        )
        .await;
        assert_eq!(result, Some(42));
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_fail_open_with_retries_all_failures() {
        let mut attempts = 0;
        let result = fail_open_with_retries(
            "test_op",
            || {
                attempts += 1;
                async move { Err::<i32, _>(CodehiveError::Other("persistent".to_string())) }
            },
            3,
        )
        .await;
        assert_eq!(result, None);
        assert_eq!(attempts, 3);
    }
}

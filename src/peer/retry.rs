use std::future::Future;
use tokio::time::sleep;
use tracing::warn;

use crate::config::RetryPolicy;

/// Runs `op` until it succeeds or `policy.max_attempts` is spent, sleeping the
/// policy's backoff between attempts.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(what, attempt, ?delay, "attempt failed, retrying: {:#}", e);
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e.context(format!("{} failed after {} attempts", what, attempt))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            multiplier: 1.0,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = with_retry(&fast(3), "publish", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("busy")
            }
            Ok(7)
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_at_the_bound() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&fast(2), "publish", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("busy")
        })
        .await
        .map(|()| ())
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(format!("{:#}", err).contains("publish failed after 2 attempts"));
    }
}

//! Bounded polling and retry for asynchronous remote orders.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::error::{OrchestratorError, Result};

/// How long to keep checking, and how often.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Budget {
    pub max_wait: Duration,
    pub interval: Duration,
}

impl Budget {
    pub const fn secs(max_wait: u64, interval: u64) -> Self {
        Self {
            max_wait: Duration::from_secs(max_wait),
            interval: Duration::from_secs(interval),
        }
    }
}

const DAY: u64 = 24 * 3600;

/// Budgets per call site.
#[derive(Clone, Copy, Debug)]
pub struct PollBudgets {
    pub cvm_order: Budget,
    pub dvm_order: Budget,
    pub pool_recall: Budget,
    pub instance_list: Budget,
    pub sops_task: Budget,
    pub create_attempts: u32,
    pub create_backoff: Duration,
}

impl Default for PollBudgets {
    fn default() -> Self {
        Self {
            cvm_order: Budget::secs(DAY, 60),
            dvm_order: Budget::secs(DAY, 30),
            pool_recall: Budget::secs(DAY, 300),
            instance_list: Budget::secs(300, 5),
            sops_task: Budget::secs(2 * 3600, 30),
            create_attempts: 3,
            create_backoff: Duration::from_secs(30),
        }
    }
}

/// Run `check` until it yields a value or the budget runs out.
///
/// The first check happens immediately. `Ok(None)` means "not yet"; transient errors are
/// treated the same way, any other error ends the poll.
pub async fn poll_until<T, F, Fut>(what: &str, budget: Budget, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    loop {
        match check().await {
            Ok(Some(v)) => return Ok(v),
            Ok(None) => {}
            Err(e) if e.is_transient() => {
                tracing::debug!("[retry] {} not ready: {}", what, e);
            }
            Err(e) => return Err(e),
        }
        if started.elapsed() + budget.interval > budget.max_wait {
            return Err(OrchestratorError::Timeout {
                what: what.to_string(),
                waited: started.elapsed(),
            });
        }
        sleep(budget.interval).await;
    }
}

/// Retry a one-shot call on transient failures only.
pub async fn retry_transient<T, F, Fut>(
    what: &str,
    attempts: u32,
    backoff: Duration,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(
                    "[retry] {} attempt {}/{} failed: {}",
                    what,
                    attempt,
                    attempts,
                    e
                );
                attempt += 1;
                sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use supply_providers::RemoteError;

    #[tokio::test(start_paused = true)]
    async fn poll_checks_until_ready() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let started = Instant::now();
        let v = poll_until("order", Budget::secs(600, 60), move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let ready: Option<u32> = if n < 3 { None } else { Some(n) };
            Ok::<_, OrchestratorError>(ready)
        })
        .await
        .unwrap();
        assert_eq!(v, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let err = poll_until("order", Budget::secs(300, 60), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<Option<()>, _>(OrchestratorError::from(RemoteError::Transient(
                "503".into(),
            )))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout { .. }));
        // checks at 0, 60, 120, 180, 240 and 300 seconds
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_stops_on_terminal_error() {
        let err = poll_until("order", Budget::secs(300, 60), || async {
            Err::<Option<()>, _>(OrchestratorError::from(RemoteError::NotFound(
                "order".into(),
            )))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::Remote(RemoteError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn create_retries_transient_only() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = retry_transient("create", 3, Duration::from_secs(30), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(OrchestratorError::from(RemoteError::Transient(
                "timeout".into(),
            )))
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = retry_transient("create", 3, Duration::from_secs(30), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(OrchestratorError::from(RemoteError::SoldOut("zone".into())))
        })
        .await
        .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

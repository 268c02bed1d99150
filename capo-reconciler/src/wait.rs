//! Bounded state-transition polling.

use std::future::Future;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::PollSettings;
use crate::error::{ReconcileError, Result};

/// Call `probe` every tick until it yields a value or the timeout elapses.
///
/// The first probe runs immediately. Probe errors abort the wait.
pub async fn poll_until<T, F, Fut>(what: &str, settings: PollSettings, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    let timeout = settings.timeout();

    loop {
        if let Some(value) = probe().await? {
            debug!(
                what = what,
                elapsed_ms = start.elapsed().as_millis(),
                "Wait finished"
            );
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            warn!(what = what, timeout_secs = timeout.as_secs(), "Timeout while waiting");
            return Err(ReconcileError::Timeout {
                what: what.to_string(),
                after: timeout,
            });
        }

        debug!(what = what, "Not ready yet, retrying...");
        tokio::time::sleep(settings.tick().min(timeout - elapsed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FAST: PollSettings = PollSettings {
        tick_ms: 1,
        timeout_ms: 50,
    };

    #[tokio::test]
    async fn test_returns_once_ready() {
        let counter = AtomicUsize::new(0);
        let probes = &counter;
        let value = poll_until("counter", FAST, move || async move {
            let n = probes.fetch_add(1, Ordering::SeqCst);
            Ok((n >= 2).then_some(n))
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_times_out() {
        let err = poll_until("never", FAST, || async { Ok(None::<()>) })
            .await
            .unwrap_err();
        match err {
            ReconcileError::Timeout { what, .. } => assert_eq!(what, "never"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_probe_error_aborts() {
        let counter = AtomicUsize::new(0);
        let probes = &counter;
        let err = poll_until("broken", FAST, move || async move {
            probes.fetch_add(1, Ordering::SeqCst);
            Err::<Option<()>, _>(ReconcileError::DeadlineExceeded(FAST.timeout()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ReconcileError::DeadlineExceeded(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

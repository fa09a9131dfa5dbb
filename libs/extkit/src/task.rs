//! Timeout and detached-task plumbing.
//!
//! Background work spawned by the manager derives from the manager's root
//! cancellation token, never from a request context: request-scoped values
//! (the current `tracing` span, business keys) travel with the task while
//! request cancellation stays behind.

use std::any::Any;
use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::errors::ExtensionError;

/// Default bound for detached async work.
pub const DEFAULT_ASYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound a future; a zero duration means no wrapping at all.
pub async fn with_timeout<T, F>(
    what: &str,
    timeout: Duration,
    fut: F,
) -> Result<T, ExtensionError>
where
    F: Future<Output = T>,
{
    if timeout.is_zero() {
        return Ok(fut.await);
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ExtensionError::Timeout {
            what: what.to_string(),
            timeout,
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a hook, converting a panic into an ordinary error.
pub async fn run_caught<T, F>(fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("panicked: {}", panic_message(&*payload))),
    }
}

/// Spawn detached work bound to `cancel`, preserving the caller's span.
///
/// The task ends when the future finishes, the timeout fires, or the token
/// cancels; failures are logged, never propagated to the caller.
pub fn spawn_detached<F>(
    name: &'static str,
    cancel: &CancellationToken,
    timeout: Duration,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let cancel = cancel.clone();
    let span = tracing::Span::current();
    tokio::spawn(
        async move {
            let bounded = async {
                if timeout.is_zero() {
                    run_caught(fut).await
                } else {
                    match tokio::time::timeout(timeout, run_caught(fut)).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!("timed out after {timeout:?}")),
                    }
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(task = name, "detached task cancelled");
                }
                result = bounded => {
                    if let Err(e) = result {
                        tracing::warn!(task = name, error = %e, "detached task failed");
                    }
                }
            }
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn zero_timeout_is_unbounded() {
        let out = with_timeout("noop", Duration::ZERO, async { 7 }).await;
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test]
    async fn expired_timeout_names_the_operation() {
        let out = with_timeout("slow_hook", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;
        match out.unwrap_err() {
            ExtensionError::Timeout { what, .. } => assert_eq!(what, "slow_hook"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let out = run_caught(async {
            panic!("hook exploded");
            #[allow(unreachable_code)]
            Ok(())
        })
        .await;
        let msg = out.unwrap_err().to_string();
        assert!(msg.contains("hook exploded"), "got: {msg}");
    }

    #[tokio::test]
    async fn detached_task_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let handle = spawn_detached("sleeper", &cancel, Duration::ZERO, async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        cancel.cancel();
        handle.await.unwrap();
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn detached_task_runs_to_completion() {
        let cancel = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let handle = spawn_detached("quick", &cancel, DEFAULT_ASYNC_TIMEOUT, async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        handle.await.unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }
}

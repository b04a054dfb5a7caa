use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Keeps a long-running task alive: whenever it panics or returns before
/// shutdown, a fresh instance is started from `make`.
pub async fn supervise<F, Fut>(name: String, shutdown: CancellationToken, mut make: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut restarts = 0u32;

    loop {
        let outcome = tokio::spawn(make()).await;

        if shutdown.is_cancelled() {
            info!(task = %name, "stopped");
            return;
        }

        restarts += 1;
        match outcome {
            Ok(()) => warn!(task = %name, restarts, "exited unexpectedly, restarting"),
            Err(err) if err.is_panic() => error!(task = %name, restarts, "panicked, restarting"),
            Err(err) => error!(task = %name, restarts, "aborted ({err}), restarting"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RESTART_DELAY) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn restarts_a_panicking_task() {
        let starts = Arc::new(AtomicU32::new(0));
        let shutdown = CancellationToken::new();

        let supervisor = {
            let starts = starts.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(supervise("flaky".to_owned(), shutdown.clone(), move || {
                let starts = starts.clone();
                let shutdown = shutdown.clone();
                async move {
                    if starts.fetch_add(1, Ordering::SeqCst) < 2 {
                        panic!("boom");
                    }
                    shutdown.cancelled().await;
                }
            }))
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        supervisor.await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 3);
    }
}

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A job run every `interval` until cancelled.
///
/// The first run happens one interval after spawning. Cancellation is
/// observed between runs and during the wait.
pub struct PeriodicTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn on the current tokio runtime. `token` is usually a child of a
    /// shutdown token, cancelling the parent stops the task too.
    pub fn spawn<F, Fut>(
        name: &'static str,
        interval: Duration,
        token: CancellationToken,
        mut job: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            debug!(task = name, interval_ms = interval.as_millis() as u64, "periodic task started");
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                job().await;
                if loop_token.is_cancelled() {
                    break;
                }
            }
            debug!(task = name, "periodic task stopped");
        });

        Self {
            name,
            token,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait for the current run to finish
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

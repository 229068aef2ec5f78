use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A blocking I/O loop running on the runtime's blocking pool.
///
/// The loop receives a [`CancellationToken`] and must check it at least once per
/// poll interval. Dropping the worker cancels it without waiting.
pub struct BlockingWorker {
    name: &'static str,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BlockingWorker {
    pub fn spawn<F>(name: &'static str, work: F) -> Self
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::task::spawn_blocking(move || work(child));
        info!("Started {} worker", name);

        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Signal the loop to stop and wait for it to return. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.token.cancel();
        let Some(handle) = self.handle.take() else {
            return;
        };
        match handle.await {
            Ok(()) => info!("{} worker stopped", self.name),
            Err(e) => error!("{} worker failed: {}", self.name, e),
        }
    }
}

impl Drop for BlockingWorker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

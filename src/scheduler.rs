use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// One-shot delayed work with cooperative cancellation.
///
/// Every scheduled task races its delay against a child of one shared
/// cancellation token, so [stop_all] drops all pending work at once.
/// Cancelling a task that has already fired is a no-op.
///
/// [stop_all]: Scheduler::stop_all
#[derive(Debug)]
pub(crate) struct Scheduler {
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    /// Run `task` after `delay` unless [stop_all] is called first.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// [stop_all]: Scheduler::stop_all
    pub fn schedule_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                // cancellation wins over an elapsed delay
                biased;
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => task(),
            }
        });
    }

    pub fn stop_all(&self) {
        self.cancel.cancel();
    }
}

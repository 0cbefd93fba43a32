//! Process lifecycle and bounded async task admission.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Coordinates shutdown and limits the number of detached async tasks.
///
/// `should_quiesce` hands out a token that fires when the process begins
/// draining; retry loops and backoffs watch it so shutdown is prompt.
#[derive(Clone, Debug, Default)]
pub struct Stopper {
    quiesce: CancellationToken,
}

impl Stopper {
    pub fn new() -> Self {
        Self {
            quiesce: CancellationToken::new(),
        }
    }

    /// Token that fires when shutdown begins.
    pub fn should_quiesce(&self) -> CancellationToken {
        self.quiesce.clone()
    }

    /// Begin draining: pending backoffs abort and no new tasks are admitted.
    pub fn stop(&self) {
        self.quiesce.cancel();
    }

    /// Run `task` detached if a permit is immediately available from `sem`.
    ///
    /// Acquisition never blocks: when the semaphore is exhausted (or the
    /// stopper is draining) the task is not started and `false` is returned,
    /// letting the caller fall back to running the work inline.
    pub fn run_limited_async<F>(&self, sem: &Arc<Semaphore>, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.quiesce.is_cancelled() {
            return false;
        }
        let Ok(permit) = sem.clone().try_acquire_owned() else {
            return false;
        };
        tokio::spawn(async move {
            let _permit = permit;
            task.await;
        });
        true
    }
}

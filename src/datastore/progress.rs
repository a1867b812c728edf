use std::future::{Future, IntoFuture};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{internal_error, KinveyResult};
use crate::platform::runtime;

/// Progress of a pull or push, in work units (pages for a pull, operations for a push).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncProgressUpdate {
    pub completed_units: usize,
    pub total_units: usize,
    pub finished: bool,
}

impl SyncProgressUpdate {
    pub fn fraction_completed(&self) -> f64 {
        if self.total_units == 0 {
            return if self.finished { 1.0 } else { 0.0 };
        }
        (self.completed_units as f64 / self.total_units as f64).min(1.0)
    }
}

/// Observable, cancellable progress shared between a sync task and its caller.
#[derive(Clone)]
pub struct SyncProgress {
    updates: Arc<watch::Sender<SyncProgressUpdate>>,
    cancellation: CancellationToken,
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncProgress {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(SyncProgressUpdate::default());
        Self {
            updates: Arc::new(updates),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn current(&self) -> SyncProgressUpdate {
        *self.updates.borrow()
    }

    pub fn fraction_completed(&self) -> f64 {
        self.current().fraction_completed()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncProgressUpdate> {
        self.updates.subscribe()
    }

    /// Requests cooperative cancellation. Work already committed is kept.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Announces `units` more work units. A sync adds its push operations first and
    /// its pull pages later, so the total only grows.
    pub(crate) fn add_units(&self, units: usize) {
        self.updates.send_modify(|update| update.total_units += units);
    }

    pub(crate) fn advance(&self, units: usize) {
        self.updates
            .send_modify(|update| update.completed_units += units);
    }

    pub(crate) fn finish(&self) {
        self.updates.send_modify(|update| {
            update.completed_units = update.total_units.max(update.completed_units);
            update.finished = true;
        });
    }
}

/// Handle of a running pull, push or sync. Await it (or call [`wait`](Self::wait))
/// for the result.
pub struct SyncRequest<T> {
    progress: SyncProgress,
    handle: JoinHandle<KinveyResult<T>>,
}

impl<T: Send + 'static> SyncRequest<T> {
    /// Runs `task` in the background and marks the progress finished when it succeeds.
    pub(crate) fn spawn<F>(progress: SyncProgress, task: F) -> Self
    where
        F: Future<Output = KinveyResult<T>> + Send + 'static,
    {
        let finisher = progress.clone();
        let handle = runtime::spawn(async move {
            let result = task.await;
            if result.is_ok() {
                finisher.finish();
            }
            result
        });
        Self { progress, handle }
    }

    pub fn progress(&self) -> &SyncProgress {
        &self.progress
    }

    pub fn cancel(&self) {
        self.progress.cancel();
    }

    pub async fn wait(self) -> KinveyResult<T> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(internal_error(format!("Sync task did not complete: {err}"))),
        }
    }
}

impl<T: Send + 'static> IntoFuture for SyncRequest<T> {
    type Output = KinveyResult<T>;
    type IntoFuture = BoxFuture<'static, KinveyResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_tracks_units() {
        let progress = SyncProgress::new();
        assert_eq!(progress.fraction_completed(), 0.0);
        progress.add_units(2);
        progress.advance(1);
        progress.add_units(2);
        assert_eq!(progress.current().total_units, 4);
        assert_eq!(progress.fraction_completed(), 0.25);
        progress.finish();
        assert_eq!(progress.fraction_completed(), 1.0);
    }

    #[test]
    fn empty_work_is_complete_once_finished() {
        let progress = SyncProgress::new();
        let receiver = progress.subscribe();
        progress.finish();
        assert!(receiver.borrow().finished);
        assert_eq!(receiver.borrow().fraction_completed(), 1.0);
    }

    #[tokio::test]
    async fn request_resolves_and_shares_cancellation() {
        let progress = SyncProgress::new();
        let observed = progress.clone();
        let request = SyncRequest::spawn(progress, async move {
            observed.cancellation.cancelled().await;
            Ok(7)
        });
        request.cancel();
        assert!(request.progress().is_cancelled());
        let progress = request.progress().clone();
        assert_eq!(request.await.unwrap(), 7);
        assert!(progress.current().finished);
    }

    #[tokio::test]
    async fn failed_request_is_not_marked_finished() {
        let progress = SyncProgress::new();
        let request: SyncRequest<()> =
            SyncRequest::spawn(progress, async { Err(internal_error("boom")) });
        let progress = request.progress().clone();
        assert!(request.await.is_err());
        assert!(!progress.current().finished);
    }
}

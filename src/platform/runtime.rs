use std::future::Future;
use std::sync::LazyLock;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

static BACKGROUND_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("kinvey-background")
        .enable_all()
        .build()
        .expect("failed to build background tokio runtime")
});

/// Spawns `future` on the caller's tokio runtime, or on a shared background runtime
/// when called outside of one, and returns its join handle.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => handle.spawn(future),
        Err(_) => BACKGROUND_RUNTIME.spawn(future),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_runs_on_current_runtime() {
        let handle = spawn(async { 21 * 2 });
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[test]
    fn spawn_without_runtime_uses_background() {
        let handle = spawn(async { "done" });
        let value = futures::executor::block_on(handle).unwrap();
        assert_eq!(value, "done");
    }
}

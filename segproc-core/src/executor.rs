use std::future::Future;
use std::pin::Pin;

/// Something that can run a unit of work without the caller spawning its own
/// thread. The original design names `coordinatorExecutor`/`workerExecutor`
/// as injectable configuration fields rather than hardcoding a runtime, so
/// this crate exposes the same seam even though the only implementation it
/// ships runs on the ambient Tokio runtime.
pub trait TaskExecutor: Send + Sync {
    fn spawn(&self, task: Pin<Box<dyn Future<Output = ()> + Send>>);
}

/// Spawns onto whatever Tokio runtime is current when `spawn` is called.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioExecutor;

impl TaskExecutor for TokioExecutor {
    fn spawn(&self, task: Pin<Box<dyn Future<Output = ()> + Send>>) {
        tokio::spawn(task);
    }
}

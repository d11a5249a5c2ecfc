use std::time::Duration;

use anyhow::Context;

/// A periodically reconciled unit of work owned by the `Reconciler`.
///
/// `reconcile` must be idempotent. Its errors are reported and the worker is
/// ticked again; only `Reconciler::stop` or `has_terminated` end the loop.
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> &str;
    fn worker_type(&self) -> &str;
    fn interval(&self) -> Duration;

    /// Called once before the first tick.
    async fn start(&self) {}

    /// Called once after the loop exits and any in-flight reconcile finished.
    async fn stop(&self) {}

    /// Self-retirement. Checked before every tick.
    fn has_terminated(&self) -> bool {
        false
    }

    async fn reconcile(&self) -> Vec<anyhow::Error>;
}

pub(crate) fn new_worker_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Run synchronous store work on tokio's blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.context("blocking store task failed")?
}

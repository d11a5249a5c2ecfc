//! Startup gate: a process-wide readiness signal released once global type state converged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Answers whether the database already reflects the local catalog.
#[async_trait::async_trait]
pub trait ConvergenceCheck: Send + Sync {
    async fn converged(&self) -> anyhow::Result<bool>;
}

/// Converged when every check is. Checks run in order and stop at the first `false`.
pub struct AllOf(pub Vec<Arc<dyn ConvergenceCheck>>);

#[async_trait::async_trait]
impl ConvergenceCheck for AllOf {
    async fn converged(&self) -> anyhow::Result<bool> {
        for check in &self.0 {
            if !check.converged().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Cloneable handle on the one-shot release.
#[derive(Clone)]
pub struct Readiness {
    rx: watch::Receiver<bool>,
}

impl Readiness {
    /// Already released.
    pub fn ready() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { rx }
    }

    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once released; immediately if it already was.
    pub async fn wait(&self) {
        if self.is_ready() {
            return;
        }
        let mut rx = self.rx.clone();
        if rx.wait_for(|ready| *ready).await.is_err() {
            // The gate task is gone without releasing; readiness can never arrive.
            error!("gate: polling task ended before release");
            std::future::pending::<()>().await;
        }
    }
}

pub struct StartupGate;

impl StartupGate {
    /// Spawn the polling task. It is the only writer of the returned handle's state.
    pub fn spawn(check: Arc<dyn ConvergenceCheck>, interval: Duration) -> Readiness {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            let started = Instant::now();
            let mut polls: u64 = 0;
            loop {
                if tx.is_closed() {
                    debug!("gate: no readiness handles left; polling stopped");
                    return;
                }
                polls += 1;
                match check.converged().await {
                    Ok(true) => {
                        tx.send_replace(true);
                        counter!("gate_release_total", 1u64);
                        info!(polls, took_ms = %started.elapsed().as_millis(), "gate: released");
                        return;
                    }
                    Ok(false) => debug!(polls, "gate: not converged yet"),
                    Err(e) => warn!(polls, error = %format!("{:#}", e), "gate: convergence check failed"),
                }
                tokio::time::sleep(interval).await;
            }
        });
        Readiness { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Converges on the `after`-th call. Earlier odd calls fail, even ones report false.
    struct Flaky {
        calls: AtomicUsize,
        after: usize,
    }

    #[async_trait::async_trait]
    impl ConvergenceCheck for Flaky {
        async fn converged(&self) -> anyhow::Result<bool> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.after {
                Ok(true)
            } else if n % 2 == 1 {
                Err(anyhow::anyhow!("db unavailable"))
            } else {
                Ok(false)
            }
        }
    }

    #[tokio::test]
    async fn releases_once_and_late_waiters_pass() {
        let check = Arc::new(Flaky { calls: AtomicUsize::new(0), after: 4 });
        let readiness = StartupGate::spawn(check.clone(), Duration::from_millis(5));
        assert!(!readiness.is_ready());
        let early = readiness.clone();
        tokio::time::timeout(Duration::from_secs(2), early.wait()).await.unwrap();
        assert!(readiness.is_ready());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(check.calls.load(Ordering::SeqCst), 4, "gate stops polling after release");
        tokio::time::timeout(Duration::from_millis(10), readiness.clone().wait()).await.unwrap();
    }

    #[tokio::test]
    async fn all_of_requires_every_check() {
        let done = Arc::new(Flaky { calls: AtomicUsize::new(0), after: 1 });
        let never = Arc::new(Flaky { calls: AtomicUsize::new(1), after: usize::MAX });
        let checks: Vec<Arc<dyn ConvergenceCheck>> = vec![done.clone(), never];
        assert!(!AllOf(checks).converged().await.unwrap());
        let checks: Vec<Arc<dyn ConvergenceCheck>> = vec![done];
        assert!(AllOf(checks).converged().await.unwrap());
    }

    #[tokio::test]
    async fn ready_handle_never_blocks() {
        let r = Readiness::ready();
        assert!(r.is_ready());
        tokio::time::timeout(Duration::from_millis(10), r.wait()).await.unwrap();
    }
}

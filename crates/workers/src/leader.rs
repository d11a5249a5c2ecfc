use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_persist::LeaseStore;
use tracing::{info, warn};

use crate::worker::blocking;
use crate::Worker;

/// Runs `inner` only on the instance holding the lease for `lease_type`.
///
/// Every tick renews the lease, or claims it when not held. Ticks without the
/// lease do nothing and report no errors.
pub struct LeaderWorker<W> {
    inner: W,
    leases: Arc<dyn LeaseStore>,
    lease_type: String,
    ttl: Duration,
    leading: AtomicBool,
}

impl<W: Worker> LeaderWorker<W> {
    pub fn new(inner: W, leases: Arc<dyn LeaseStore>, lease_type: impl Into<String>, ttl: Duration) -> Self {
        Self { inner, leases, lease_type: lease_type.into(), ttl, leading: AtomicBool::new(false) }
    }

    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &W {
        &self.inner
    }

    async fn acquire(&self) -> anyhow::Result<bool> {
        let (leases, lease_type, id, ttl) =
            (self.leases.clone(), self.lease_type.clone(), self.inner.id().to_string(), self.ttl);
        blocking(move || {
            if leases.renew(&lease_type, &id, ttl)? {
                return Ok(true);
            }
            leases.claim(&lease_type, &id, ttl)
        })
        .await
    }
}

#[async_trait::async_trait]
impl<W: Worker> Worker for LeaderWorker<W> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn worker_type(&self) -> &str {
        self.inner.worker_type()
    }

    fn interval(&self) -> Duration {
        self.inner.interval()
    }

    async fn start(&self) {
        self.inner.start().await
    }

    async fn stop(&self) {
        if self.leading.swap(false, Ordering::SeqCst) {
            let (leases, lease_type, id) = (self.leases.clone(), self.lease_type.clone(), self.inner.id().to_string());
            match blocking(move || leases.release(&lease_type, &id)).await {
                Ok(_) => info!(worker = %self.inner.id(), lease_type = %self.lease_type, "leader: lease released"),
                Err(e) => warn!(worker = %self.inner.id(), lease_type = %self.lease_type, error = %e, "leader: lease release failed"),
            }
        }
        self.inner.stop().await
    }

    fn has_terminated(&self) -> bool {
        self.inner.has_terminated()
    }

    async fn reconcile(&self) -> Vec<anyhow::Error> {
        let held = match self.acquire().await {
            Ok(held) => held,
            Err(e) => {
                self.leading.store(false, Ordering::SeqCst);
                return vec![e.context(format!("acquiring {} lease", self.lease_type))];
            }
        };
        let was = self.leading.swap(held, Ordering::SeqCst);
        if held != was {
            info!(worker = %self.inner.id(), lease_type = %self.lease_type, leader = held, "leader: leadership changed");
        }
        if !held {
            return Vec::new();
        }
        self.inner.reconcile().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_persist::SqliteStore;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        id: String,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Worker for Counting {
        fn id(&self) -> &str { &self.id }
        fn worker_type(&self) -> &str { "counting" }
        fn interval(&self) -> Duration { Duration::from_millis(5) }
        async fn reconcile(&self) -> Vec<anyhow::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
    }

    fn counting(id: &str) -> (Counting, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (Counting { id: id.into(), calls: calls.clone() }, calls)
    }

    #[tokio::test]
    async fn only_the_leader_reconciles() {
        let store: Arc<dyn LeaseStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ttl = Duration::from_secs(30);
        let (a, a_calls) = counting("a");
        let (b, b_calls) = counting("b");
        let a = LeaderWorker::new(a, store.clone(), "processor_type", ttl);
        let b = LeaderWorker::new(b, store.clone(), "processor_type", ttl);
        for _ in 0..3 {
            assert!(a.reconcile().await.is_empty());
            assert!(b.reconcile().await.is_empty());
        }
        assert_eq!(a_calls.load(Ordering::SeqCst), 3);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        assert!(a.is_leader() && !b.is_leader());

        a.stop().await;
        assert!(b.reconcile().await.is_empty());
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert!(b.is_leader());
    }
}

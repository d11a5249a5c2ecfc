//! Periodic-tick scheduler. One tokio task per worker; ticks of one worker never overlap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::Worker;

/// Outcome of a worker's most recent tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickState {
    pub ticks: u64,
    pub last_errors: Vec<String>,
}

struct Record {
    worker: Arc<dyn Worker>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    state: Arc<Mutex<TickState>>,
}

#[derive(Default)]
pub struct Reconciler {
    workers: Mutex<HashMap<String, Record>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker and spawn its loop. Ids must be unique among running workers.
    pub fn start(&self, worker: Arc<dyn Worker>) -> Result<()> {
        let mut workers = lock(&self.workers);
        let id = worker.id().to_string();
        if workers.contains_key(&id) {
            bail!("worker {} is already registered", id);
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(TickState::default()));
        let handle = tokio::spawn(run(worker.clone(), stop_rx, state.clone()));
        info!(worker = %id, worker_type = %worker.worker_type(), interval_ms = %worker.interval().as_millis(), "reconciler: worker started");
        workers.insert(id, Record { worker, stop_tx, handle, state });
        Ok(())
    }

    /// Signal the worker's loop, wait for it to finish and deregister it.
    /// Returns false if no worker with that id is registered.
    pub async fn stop(&self, id: &str) -> bool {
        let record = lock(&self.workers).remove(id);
        match record {
            Some(r) => {
                shutdown(id, r).await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let records: Vec<(String, Record)> = lock(&self.workers).drain().collect();
        let stops = records.into_iter().map(|(id, r)| async move { shutdown(&id, r).await });
        futures::future::join_all(stops).await;
    }

    /// Deregister workers whose loop has exited on its own. Returns their ids.
    pub async fn prune_terminated(&self) -> Vec<String> {
        let finished: Vec<(String, Record)> = {
            let mut workers = lock(&self.workers);
            let ids: Vec<String> =
                workers.iter().filter(|(_, r)| r.handle.is_finished()).map(|(id, _)| id.clone()).collect();
            ids.into_iter().filter_map(|id| workers.remove(&id).map(|r| (id, r))).collect()
        };
        let mut out = Vec::with_capacity(finished.len());
        for (id, r) in finished {
            if let Err(e) = r.handle.await {
                warn!(worker = %id, error = %e, "reconciler: worker task failed");
            }
            debug!(worker = %id, worker_type = %r.worker.worker_type(), "reconciler: pruned terminated worker");
            out.push(id);
        }
        out
    }

    pub fn is_running(&self, id: &str) -> bool {
        lock(&self.workers).get(id).map(|r| !r.handle.is_finished()).unwrap_or(false)
    }

    pub fn worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.workers).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn tick_state(&self, id: &str) -> Option<TickState> {
        lock(&self.workers).get(id).map(|r| lock(&r.state).clone())
    }

    pub fn last_errors(&self, id: &str) -> Option<Vec<String>> {
        self.tick_state(id).map(|s| s.last_errors)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn shutdown(id: &str, r: Record) {
    let _ = r.stop_tx.send(true);
    if let Err(e) = r.handle.await {
        warn!(worker = %id, error = %e, "reconciler: worker task failed");
    }
    info!(worker = %id, worker_type = %r.worker.worker_type(), "reconciler: worker stopped");
}

async fn run(worker: Arc<dyn Worker>, mut stop_rx: watch::Receiver<bool>, state: Arc<Mutex<TickState>>) {
    let id = worker.id().to_string();
    let worker_type = worker.worker_type().to_string();
    worker.start().await;
    let mut ticker = tokio::time::interval(worker.interval().max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {
                if worker.has_terminated() {
                    info!(worker = %id, worker_type = %worker_type, "reconciler: worker terminated");
                    break;
                }
                let started = Instant::now();
                // Awaited inside the branch: a stop signal waits for this call to return.
                let errors = worker.reconcile().await;
                let took_ms = started.elapsed().as_secs_f64() * 1000.0;
                histogram!("worker_reconcile_ms", took_ms, "worker_type" => worker_type.clone());
                counter!("worker_reconcile_total", 1u64, "worker_type" => worker_type.clone());
                for e in &errors {
                    error!(worker = %id, worker_type = %worker_type, error = %format!("{:#}", e), "reconciler: reconcile error");
                }
                if !errors.is_empty() {
                    counter!("worker_reconcile_errors_total", errors.len() as u64, "worker_type" => worker_type.clone());
                }
                let mut s = lock(&state);
                s.ticks += 1;
                s.last_errors = errors.iter().map(|e| format!("{:#}", e)).collect();
            }
        }
    }
    worker.stop().await;
}

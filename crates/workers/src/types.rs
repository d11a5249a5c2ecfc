//! Type reconciliation: converge stored resource types of one kind onto the loaded catalog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use fleet_catalog::{shard_revision, Catalog, CatalogLoader, ChannelConfig};
use fleet_core::{CatalogKind, ShardMetadata};
use fleet_persist::SqliteStore;
use metrics::histogram;
use tracing::{debug, info, warn};

use crate::gate::{ConvergenceCheck, Readiness};
use crate::worker::{blocking, new_worker_id};
use crate::Worker;

/// Counts from one `delete_or_deprecate_removed_types` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovedTypes {
    pub deprecated: usize,
    pub deleted: usize,
}

pub struct TypeService {
    store: Arc<SqliteStore>,
    loader: CatalogLoader,
    catalog: Mutex<Option<Arc<Catalog>>>,
    /// Type id to the checksum already confirmed in the database.
    reconciled: Mutex<HashMap<String, String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TypeService {
    pub fn new(store: Arc<SqliteStore>, loader: CatalogLoader) -> Self {
        Self { store, loader, catalog: Mutex::new(None), reconciled: Mutex::new(HashMap::new()) }
    }

    pub fn kind(&self) -> CatalogKind {
        self.loader.kind()
    }

    /// The loaded catalog. A failed load is not cached; the next call retries.
    pub fn catalog(&self) -> Result<Arc<Catalog>> {
        let mut slot = lock(&self.catalog);
        if let Some(c) = slot.as_ref() {
            return Ok(c.clone());
        }
        let report = self.loader.load().with_context(|| format!("loading {} catalog", self.kind()))?;
        if let Some(deferred) = &report.deferred {
            warn!(kind = %self.kind(), error = %deferred, "types: catalog loaded with unrecognized metadata");
        }
        let catalog = Arc::new(report.catalog);
        *slot = Some(catalog.clone());
        Ok(catalog)
    }

    /// Upsert every catalog entry whose checksum differs from the stored one.
    /// Rows are written without a checksum; `record_checksums` stamps it once the
    /// rest of the pass has succeeded. Returns the number of types written.
    pub fn reconcile_types(&self) -> Result<usize> {
        let started = Instant::now();
        let kind = self.kind();
        let catalog = self.catalog()?;
        let mut written = 0;
        for entry in catalog.iter() {
            let stored = self.store.type_checksum(entry.id())?;
            if stored.as_deref() == Some(entry.checksum.as_str()) {
                debug!(kind = %kind, id = %entry.id(), "types: unchanged");
                continue;
            }
            let mut pending = entry.resource_type.clone();
            pending.checksum = None;
            self.store
                .upsert_type(kind, &pending)
                .with_context(|| format!("reconciling {} type {}", kind, entry.id()))?;
            lock(&self.reconciled).remove(entry.id());
            written += 1;
        }
        histogram!("types_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => kind.name());
        info!(kind = %kind, entries = catalog.len(), written, took_ms = %started.elapsed().as_millis(), "types: reconciled");
        Ok(written)
    }

    /// Stamp every entry's checksum on its stored type. A stored checksum is what
    /// marks an entry converged, so this is the last step of a pass.
    /// Returns the number of checksums written.
    pub fn record_checksums(&self) -> Result<usize> {
        let kind = self.kind();
        let catalog = self.catalog()?;
        let mut recorded = 0;
        for entry in catalog.iter() {
            if self.store.type_checksum(entry.id())?.as_deref() != Some(entry.checksum.as_str()) {
                if !self.store.set_type_checksum(entry.id(), &entry.checksum)? {
                    bail!("{} type {} is not stored; reconcile types first", kind, entry.id());
                }
                recorded += 1;
            }
            lock(&self.reconciled).insert(entry.id().to_string(), entry.checksum.clone());
        }
        Ok(recorded)
    }

    /// Call `f` for every (type, channel) pair of the catalog, stopping at the first error.
    pub fn for_each_catalog_entry<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &str, &ChannelConfig) -> Result<()>,
    {
        let catalog = self.catalog()?;
        for entry in catalog.iter() {
            for (channel, config) in &entry.channels {
                f(entry.id(), channel, config)?;
            }
        }
        Ok(())
    }

    /// Store a channel's shard metadata under the revision it declares.
    pub fn reconcile_shard_metadata(&self, type_id: &str, channel: &str, config: &ChannelConfig) -> Result<ShardMetadata> {
        let kind = self.kind();
        let revision = shard_revision(kind, &config.shard_metadata)
            .with_context(|| format!("{} type {} channel {}", kind, type_id, channel))?;
        let metadata = serde_json::Value::Object(config.shard_metadata.clone());
        self.store.put_shard_metadata(type_id, channel, revision, &metadata)
    }

    /// Deprecate stored types missing from the catalog that resources still use; delete the rest.
    pub fn delete_or_deprecate_removed_types(&self) -> Result<RemovedTypes> {
        let kind = self.kind();
        let catalog = self.catalog()?;
        let mut out = RemovedTypes::default();
        for id in self.store.type_ids(kind)? {
            if catalog.contains(&id) {
                continue;
            }
            lock(&self.reconciled).remove(&id);
            if self.store.count_type_references(&id)? > 0 {
                let already = self.store.get_type(&id)?.map(|t| t.deprecated).unwrap_or(false);
                if !already {
                    self.store.deprecate_type(&id)?;
                    out.deprecated += 1;
                    info!(kind = %kind, id = %id, "types: deprecated removed type still in use");
                }
            } else {
                self.store.delete_type(&id)?;
                out.deleted += 1;
                info!(kind = %kind, id = %id, "types: deleted removed type");
            }
        }
        Ok(out)
    }

    /// Flag deployments pinned to superseded shard metadata. Returns how many changed.
    pub fn cleanup_deployments(&self) -> Result<usize> {
        let changed = self.store.refresh_upgrade_flags(self.kind())?;
        if changed > 0 {
            info!(kind = %self.kind(), changed, "types: deployment upgrade flags refreshed");
        }
        Ok(changed)
    }

    /// True when every catalog entry's stored checksum matches the loaded one.
    pub fn catalog_entries_reconciled(&self) -> Result<bool> {
        let catalog = self.catalog()?;
        for entry in catalog.iter() {
            if lock(&self.reconciled).get(entry.id()) == Some(&entry.checksum) {
                continue;
            }
            match self.store.type_checksum(entry.id())? {
                Some(sum) if sum == entry.checksum => {
                    lock(&self.reconciled).insert(entry.id().to_string(), sum);
                }
                _ => {
                    debug!(kind = %self.kind(), id = %entry.id(), "types: entry not reconciled yet");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

#[async_trait::async_trait]
impl ConvergenceCheck for TypeService {
    async fn converged(&self) -> Result<bool> {
        self.catalog_entries_reconciled()
    }
}

/// One-shot worker running a full type reconcile pass for one catalog kind.
/// Meant to run wrapped in a `LeaderWorker` on the kind's lease type.
pub struct TypeManager {
    id: String,
    worker_type: String,
    service: Arc<TypeService>,
    readiness: Readiness,
    interval: Duration,
    done: AtomicBool,
}

impl TypeManager {
    pub fn new(service: Arc<TypeService>, readiness: Readiness, interval: Duration) -> Self {
        let worker_type = format!("{}_type_manager", service.kind());
        Self { id: new_worker_id(), worker_type, service, readiness, interval, done: AtomicBool::new(false) }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

/// One full pass. Checksums go in last, so a failure anywhere keeps the gate closed
/// and the pass is retried on the next tick.
fn run_pass(service: &TypeService) -> Result<()> {
    let removed = service.delete_or_deprecate_removed_types()?;
    let written = service.reconcile_types()?;
    service.for_each_catalog_entry(|type_id, channel, config| {
        service.reconcile_shard_metadata(type_id, channel, config).map(|_| ())
    })?;
    let flagged = service.cleanup_deployments()?;
    let recorded = service.record_checksums()?;
    info!(
        kind = %service.kind(),
        written,
        deprecated = removed.deprecated,
        deleted = removed.deleted,
        flagged,
        recorded,
        "types: reconcile pass complete"
    );
    Ok(())
}

#[async_trait::async_trait]
impl Worker for TypeManager {
    fn id(&self) -> &str {
        &self.id
    }

    fn worker_type(&self) -> &str {
        &self.worker_type
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn has_terminated(&self) -> bool {
        self.is_done() || self.readiness.is_ready()
    }

    async fn reconcile(&self) -> Vec<anyhow::Error> {
        if self.is_done() {
            return Vec::new();
        }
        let service = self.service.clone();
        match blocking(move || run_pass(&service)).await {
            Ok(()) => {
                self.done.store(true, Ordering::SeqCst);
                Vec::new()
            }
            Err(e) => vec![e],
        }
    }
}

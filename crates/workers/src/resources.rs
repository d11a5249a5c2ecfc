//! Per-resource workers: push resource changes into deployments and reap deleted resources.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fleet_core::{DesiredState, Resource, ResourceDeployment, StatusPhase};
use fleet_persist::SqliteStore;
use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::worker::{blocking, new_worker_id};
use crate::Worker;

/// Brings each deployment in line with its resource after the resource changed.
///
/// The deployment copies the resource version, moves to the latest shard metadata
/// when upgrades are allowed, and applies the desired state. The write stamps a new
/// deployment version so agents polling by version see the change.
pub struct ResourceDeploymentManager {
    id: String,
    store: Arc<SqliteStore>,
    interval: Duration,
}

impl ResourceDeploymentManager {
    pub fn new(store: Arc<SqliteStore>, interval: Duration) -> Self {
        Self { id: new_worker_id(), store, interval }
    }
}

fn sync(store: &SqliteStore, resource: &Resource, deployment: &ResourceDeployment) -> Result<()> {
    let latest = if resource.type_id.is_empty() {
        None
    } else {
        store.latest_shard_metadata(&resource.type_id, &resource.channel)?
    };
    let updated = store
        .modify_deployment(&deployment.id, |d| {
            // Another instance may already have synced from a newer snapshot.
            if d.resource_version >= resource.version {
                return false;
            }
            d.resource_version = resource.version;
            if let Some(latest) = &latest {
                if d.allow_upgrade && d.shard_metadata_id != Some(latest.id) {
                    d.shard_metadata_id = Some(latest.id);
                    d.status.upgrade_available = false;
                }
            }
            d.status.apply_desired(resource.desired_state);
            true
        })
        .with_context(|| format!("syncing deployment {} of resource {}", deployment.id, resource.id))?;
    if let Some(d) = updated {
        debug!(resource = %resource.id, deployment = %d.id, version = d.version, phase = %d.status.phase.as_str(), "resources: deployment synced");
    }
    Ok(())
}

fn sync_all(store: &SqliteStore) -> Vec<anyhow::Error> {
    let started = Instant::now();
    let pending = match store.list_out_of_sync() {
        Ok(p) => p,
        Err(e) => return vec![e.context("listing out of sync deployments")],
    };
    let mut errors = Vec::new();
    let mut synced = 0u64;
    for (resource, deployment) in &pending {
        match sync(store, resource, deployment) {
            Ok(()) => synced += 1,
            Err(e) => errors.push(e),
        }
    }
    if synced > 0 {
        counter!("deployments_synced_total", synced);
        info!(synced, failed = errors.len(), took_ms = %started.elapsed().as_millis(), "resources: deployments synced");
    }
    histogram!("resources_sync_ms", started.elapsed().as_secs_f64() * 1000.0);
    errors
}

#[async_trait::async_trait]
impl Worker for ResourceDeploymentManager {
    fn id(&self) -> &str {
        &self.id
    }

    fn worker_type(&self) -> &str {
        "resource_deployment_manager"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn reconcile(&self) -> Vec<anyhow::Error> {
        let store = self.store.clone();
        blocking(move || Ok(sync_all(&store))).await.unwrap_or_else(|e| vec![e])
    }
}

/// Removes resources marked for deletion once nothing runs them any more.
pub struct DeletingResourceManager {
    id: String,
    store: Arc<SqliteStore>,
    interval: Duration,
}

impl DeletingResourceManager {
    pub fn new(store: Arc<SqliteStore>, interval: Duration) -> Self {
        Self { id: new_worker_id(), store, interval }
    }
}

/// True if the resource was removed.
fn reap(store: &SqliteStore, resource: &Resource) -> Result<bool> {
    let deployment = store.deployment_for_resource(&resource.id)?;
    let gone = match &deployment {
        None => true,
        Some(d) => d.status.phase == StatusPhase::Deleted,
    };
    if !gone {
        return Ok(false);
    }
    store.delete_resource(&resource.id).with_context(|| format!("deleting resource {}", resource.id))
}

fn reap_all(store: &SqliteStore) -> Vec<anyhow::Error> {
    let deleting = match store.list_resources(Some(DesiredState::Deleted)) {
        Ok(r) => r,
        Err(e) => return vec![e.context("listing deleted resources")],
    };
    let mut errors = Vec::new();
    for resource in &deleting {
        match reap(store, resource) {
            Ok(true) => info!(resource = %resource.id, kind = %resource.kind.as_str(), "resources: resource removed"),
            Ok(false) => debug!(resource = %resource.id, "resources: waiting for deployment to be deleted"),
            Err(e) => errors.push(e),
        }
    }
    errors
}

#[async_trait::async_trait]
impl Worker for DeletingResourceManager {
    fn id(&self) -> &str {
        &self.id
    }

    fn worker_type(&self) -> &str {
        "deleting_resource_manager"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn reconcile(&self) -> Vec<anyhow::Error> {
        let store = self.store.clone();
        blocking(move || Ok(reap_all(&store))).await.unwrap_or_else(|e| vec![e])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{DeploymentTarget, NewResource, ResourceKind};
    use std::collections::BTreeMap;

    fn kafka() -> NewResource {
        NewResource {
            kind: ResourceKind::Kafka,
            name: "k".into(),
            type_id: String::new(),
            channel: String::new(),
            namespace_id: "ns".into(),
            owner: "owner".into(),
            organisation_id: String::new(),
            desired_state: DesiredState::Ready,
            definition: serde_json::json!({}),
            annotations: BTreeMap::new(),
        }
    }

    #[test]
    fn stale_snapshot_does_not_rewind_the_deployment() {
        let store = SqliteStore::open_in_memory().unwrap();
        let res = store.create_resource(&kafka()).unwrap();
        let target = DeploymentTarget { cluster_id: "c1".into(), namespace_id: "ns".into(), operator_id: "op".into() };
        let dep = store.create_deployment(&res.id, &target, None, false).unwrap();
        let stale = store.update_desired_state(&res.id, DesiredState::Stopped).unwrap().unwrap();
        let fresh = store.update_desired_state(&res.id, DesiredState::Deleted).unwrap().unwrap();

        sync(&store, &fresh, &dep).unwrap();
        let synced = store.get_deployment(&dep.id).unwrap().unwrap();
        assert_eq!(synced.resource_version, fresh.version);

        sync(&store, &stale, &dep).unwrap();
        let after = store.get_deployment(&dep.id).unwrap().unwrap();
        assert_eq!(after.resource_version, fresh.version);
        assert_eq!(after.version, synced.version, "no extra version bump");
    }
}

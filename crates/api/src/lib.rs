//! Fleet manager API facade (in-process).
//!
//! Frontends depend on the `FleetApi` trait. `InProcApi` serves it from the
//! SQLite store; `MockApi` keeps everything in memory for tests. Mutating calls
//! wait for the startup gate before touching the store.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use fleet_catalog::validate_definition;
use fleet_core::{
    now_ms, AgentStatusReport, CatalogKind, DeploymentStatus, DeploymentTarget, DesiredState, NewResource, Resource,
    ResourceDeployment, ResourceType, ServiceError, ServiceResult,
};
use fleet_persist::SqliteStore;
use fleet_workers::Readiness;
use metrics::counter;
use tracing::{debug, info, warn};

pub use fleet_core::{PublicError, ServiceErrorCode};

#[async_trait::async_trait]
pub trait FleetApi: Send + Sync {
    /// Stored types of a catalog kind, featured first.
    async fn list_types(&self, kind: CatalogKind) -> ServiceResult<Vec<ResourceType>>;

    async fn get_type(&self, id: &str) -> ServiceResult<ResourceType>;

    /// Create a resource. Catalog-backed kinds are validated against their type's JSON schema.
    async fn create_resource(&self, new: NewResource) -> ServiceResult<Resource>;

    async fn get_resource(&self, id: &str) -> ServiceResult<Resource>;

    async fn set_desired_state(&self, id: &str, desired: DesiredState) -> ServiceResult<Resource>;

    /// Place a resource on a data-plane cluster, pinned to the latest shard metadata of its type.
    async fn create_deployment(
        &self,
        resource_id: &str,
        target: DeploymentTarget,
        allow_upgrade: bool,
    ) -> ServiceResult<ResourceDeployment>;

    /// Deployments on a cluster changed after `after_version`, oldest change first.
    async fn list_deployments_since(&self, cluster_id: &str, after_version: i64)
        -> ServiceResult<Vec<ResourceDeployment>>;

    /// Fold an agent's status report into the stored deployment.
    async fn report_status(&self, cluster_id: &str, report: AgentStatusReport) -> ServiceResult<ResourceDeployment>;
}

/// Translate a call's outcome into what API clients receive on failure.
pub fn public_result<T>(operation_id: &str, outcome: ServiceResult<T>) -> Result<T, PublicError> {
    outcome.map_err(|e| {
        if e.http_code >= 500 {
            warn!(operation = operation_id, code = %e.code.code_str(), reason = %e.reason, "api: call failed");
        }
        e.as_public_error(operation_id)
    })
}

fn internal(e: anyhow::Error) -> ServiceError {
    ServiceError::general(format!("{:#}", e))
}

fn check_new(new: &NewResource) -> ServiceResult<()> {
    if new.name.trim().is_empty() {
        return Err(ServiceError::bad_request("name must not be empty"));
    }
    if new.namespace_id.trim().is_empty() {
        return Err(ServiceError::bad_request("namespace_id must not be empty"));
    }
    if new.owner.trim().is_empty() {
        return Err(ServiceError::bad_request("owner must not be empty"));
    }
    if new.kind.catalog_kind().is_some() && new.type_id.is_empty() {
        return Err(ServiceError::bad_request(format!("{} type id is required", new.kind.as_str())));
    }
    Ok(())
}

/// Reject deprecated types, unknown channels and definitions that fail the type's schema.
fn check_against_type(new: &NewResource, t: &ResourceType) -> ServiceResult<()> {
    if t.deprecated {
        return Err(ServiceError::bad_request(format!("{} type {} is deprecated", new.kind.as_str(), t.id)));
    }
    if !new.channel.is_empty() && !t.channels.iter().any(|c| c == &new.channel) {
        return Err(ServiceError::bad_request(format!("channel {} is not offered by type {}", new.channel, t.id)));
    }
    let issues = validate_definition(t, &new.definition).map_err(|e| ServiceError::general(e.to_string()))?;
    if !issues.is_empty() {
        let msg = issues.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; ");
        return Err(ServiceError::validation(format!("invalid definition for type {}: {}", t.id, msg)));
    }
    Ok(())
}

/// Fold a report into a copy of `d`. Returns true if anything stored changed.
fn fold_report(d: &mut ResourceDeployment, report: &AgentStatusReport) -> bool {
    let before: DeploymentStatus = d.status.clone();
    d.status.fold(report);
    d.status != before
}

// ----------------- In-process implementation -----------------

pub struct InProcApi {
    store: Arc<SqliteStore>,
    readiness: Readiness,
}

impl InProcApi {
    pub fn new(store: Arc<SqliteStore>, readiness: Readiness) -> Self {
        Self { store, readiness }
    }

    async fn ready(&self) {
        if !self.readiness.is_ready() {
            debug!("api: waiting for startup gate");
        }
        self.readiness.wait().await;
    }

    /// Run a store call on tokio's blocking pool.
    async fn with_store<T, F>(&self, f: F) -> ServiceResult<T>
    where
        F: FnOnce(&SqliteStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| ServiceError::general(format!("store task failed: {}", e)))?
            .map_err(internal)
    }
}

#[async_trait::async_trait]
impl FleetApi for InProcApi {
    async fn list_types(&self, kind: CatalogKind) -> ServiceResult<Vec<ResourceType>> {
        self.with_store(move |s| s.list_types(kind)).await
    }

    async fn get_type(&self, id: &str) -> ServiceResult<ResourceType> {
        let key = id.to_string();
        self.with_store(move |s| s.get_type(&key))
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("type {} not found", id)))
    }

    async fn create_resource(&self, mut new: NewResource) -> ServiceResult<Resource> {
        self.ready().await;
        let t0 = Instant::now();
        check_new(&new)?;
        if new.kind.catalog_kind().is_some() {
            let type_id = new.type_id.clone();
            let t = self
                .with_store(move |s| s.get_type(&type_id))
                .await?
                .ok_or_else(|| ServiceError::bad_request(format!("{} type {} not found", new.kind.as_str(), new.type_id)))?;
            check_against_type(&new, &t)?;
            if new.channel.is_empty() {
                new.channel = t.channels.first().cloned().unwrap_or_default();
            }
        }
        let created = self.with_store(move |s| s.create_resource(&new)).await?;
        counter!("api_resources_created_total", 1u64, "kind" => created.kind.as_str());
        info!(resource = %created.id, kind = %created.kind.as_str(), version = created.version, took_ms = %t0.elapsed().as_millis(), "api: resource created");
        Ok(created)
    }

    async fn get_resource(&self, id: &str) -> ServiceResult<Resource> {
        let key = id.to_string();
        self.with_store(move |s| s.get_resource(&key))
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("resource {} not found", id)))
    }

    async fn set_desired_state(&self, id: &str, desired: DesiredState) -> ServiceResult<Resource> {
        self.ready().await;
        let current = self.get_resource(id).await?;
        if current.desired_state == desired {
            return Ok(current);
        }
        if current.desired_state == DesiredState::Deleted {
            return Err(ServiceError::conflict(format!("resource {} is being deleted", id)));
        }
        let key = id.to_string();
        let updated = self
            .with_store(move |s| s.update_desired_state(&key, desired))
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("resource {} not found", id)))?;
        info!(resource = %id, desired = %desired.as_str(), version = updated.version, "api: desired state changed");
        Ok(updated)
    }

    async fn create_deployment(
        &self,
        resource_id: &str,
        target: DeploymentTarget,
        allow_upgrade: bool,
    ) -> ServiceResult<ResourceDeployment> {
        self.ready().await;
        let resource = self.get_resource(resource_id).await?;
        let key = resource_id.to_string();
        if let Some(existing) = self.with_store(move |s| s.deployment_for_resource(&key)).await? {
            return Err(ServiceError::conflict(format!(
                "resource {} already has deployment {}",
                resource_id, existing.id
            )));
        }
        let shard = if resource.type_id.is_empty() {
            None
        } else {
            let (type_id, channel) = (resource.type_id.clone(), resource.channel.clone());
            self.with_store(move |s| s.latest_shard_metadata(&type_id, &channel)).await?
        };
        if resource.kind.catalog_kind().is_some() && shard.is_none() {
            return Err(ServiceError::bad_request(format!(
                "no shard metadata for type {} channel {}",
                resource.type_id, resource.channel
            )));
        }
        let key = resource_id.to_string();
        let shard_id = shard.map(|s| s.id);
        let d = self
            .with_store(move |s| s.create_deployment(&key, &target, shard_id, allow_upgrade))
            .await?;
        info!(deployment = %d.id, resource = %resource_id, cluster = %d.cluster_id, version = d.version, "api: deployment created");
        Ok(d)
    }

    async fn list_deployments_since(
        &self,
        cluster_id: &str,
        after_version: i64,
    ) -> ServiceResult<Vec<ResourceDeployment>> {
        let cluster = cluster_id.to_string();
        self.with_store(move |s| s.list_deployments_since(&cluster, after_version)).await
    }

    async fn report_status(&self, cluster_id: &str, report: AgentStatusReport) -> ServiceResult<ResourceDeployment> {
        self.ready().await;
        let key = report.resource_id.clone();
        let d = self
            .with_store(move |s| s.deployment_for_resource(&key))
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("no deployment for resource {}", report.resource_id)))?;
        if d.cluster_id != cluster_id {
            warn!(resource = %report.resource_id, cluster = %cluster_id, owner = %d.cluster_id, "api: status report from foreign cluster");
            return Err(ServiceError::forbidden(format!(
                "resource {} is not deployed on cluster {}",
                report.resource_id, cluster_id
            )));
        }
        let deployment_id = d.id.clone();
        let updated = self
            .with_store(move |s| s.modify_deployment(&deployment_id, |d| fold_report(d, &report)))
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("deployment {} not found", d.id)))?;
        counter!("api_status_reports_total", 1u64, "phase" => updated.status.phase.as_str());
        debug!(deployment = %updated.id, phase = %updated.status.phase, version = updated.version, "api: status folded");
        Ok(updated)
    }
}

// ----------------- Mock implementation -----------------

#[derive(Default)]
struct MockState {
    resources: HashMap<String, Resource>,
    deployments: HashMap<String, ResourceDeployment>,
    version: i64,
}

/// In-memory implementation for frontend tests. Skips schema validation and the startup gate.
#[derive(Default)]
pub struct MockApi {
    pub types: Vec<(CatalogKind, ResourceType)>,
    state: Mutex<MockState>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types(types: Vec<(CatalogKind, ResourceType)>) -> Self {
        Self { types, ..Self::default() }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MockState {
    fn next_version(&mut self) -> i64 {
        self.version += 1;
        self.version
    }
}

#[async_trait::async_trait]
impl FleetApi for MockApi {
    async fn list_types(&self, kind: CatalogKind) -> ServiceResult<Vec<ResourceType>> {
        Ok(self.types.iter().filter(|(k, _)| *k == kind).map(|(_, t)| t.clone()).collect())
    }

    async fn get_type(&self, id: &str) -> ServiceResult<ResourceType> {
        self.types
            .iter()
            .find(|(_, t)| t.id == id)
            .map(|(_, t)| t.clone())
            .ok_or_else(|| ServiceError::not_found(format!("type {} not found", id)))
    }

    async fn create_resource(&self, new: NewResource) -> ServiceResult<Resource> {
        check_new(&new)?;
        let mut s = self.state();
        let now = now_ms();
        let r = Resource {
            id: uuid::Uuid::new_v4().to_string(),
            kind: new.kind,
            name: new.name,
            type_id: new.type_id,
            channel: new.channel,
            namespace_id: new.namespace_id,
            owner: new.owner,
            organisation_id: new.organisation_id,
            desired_state: new.desired_state,
            definition: new.definition,
            annotations: new.annotations,
            version: s.next_version(),
            created_at: now,
            updated_at: now,
        };
        s.resources.insert(r.id.clone(), r.clone());
        Ok(r)
    }

    async fn get_resource(&self, id: &str) -> ServiceResult<Resource> {
        self.state()
            .resources
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("resource {} not found", id)))
    }

    async fn set_desired_state(&self, id: &str, desired: DesiredState) -> ServiceResult<Resource> {
        let mut s = self.state();
        let version = s.next_version();
        let r = s.resources.get_mut(id).ok_or_else(|| ServiceError::not_found(format!("resource {} not found", id)))?;
        r.desired_state = desired;
        r.version = version;
        r.updated_at = now_ms();
        Ok(r.clone())
    }

    async fn create_deployment(
        &self,
        resource_id: &str,
        target: DeploymentTarget,
        allow_upgrade: bool,
    ) -> ServiceResult<ResourceDeployment> {
        let mut s = self.state();
        let resource_version = s
            .resources
            .get(resource_id)
            .map(|r| r.version)
            .ok_or_else(|| ServiceError::not_found(format!("resource {} not found", resource_id)))?;
        if s.deployments.values().any(|d| d.resource_id == resource_id) {
            return Err(ServiceError::conflict(format!("resource {} already has a deployment", resource_id)));
        }
        let d = ResourceDeployment {
            id: uuid::Uuid::new_v4().to_string(),
            resource_id: resource_id.to_string(),
            resource_version,
            shard_metadata_id: None,
            cluster_id: target.cluster_id,
            namespace_id: target.namespace_id,
            operator_id: target.operator_id,
            allow_upgrade,
            version: s.next_version(),
            status: DeploymentStatus::default(),
        };
        s.deployments.insert(d.id.clone(), d.clone());
        Ok(d)
    }

    async fn list_deployments_since(
        &self,
        cluster_id: &str,
        after_version: i64,
    ) -> ServiceResult<Vec<ResourceDeployment>> {
        let mut out: Vec<ResourceDeployment> = self
            .state()
            .deployments
            .values()
            .filter(|d| d.cluster_id == cluster_id && d.version > after_version)
            .cloned()
            .collect();
        out.sort_by_key(|d| d.version);
        Ok(out)
    }

    async fn report_status(&self, cluster_id: &str, report: AgentStatusReport) -> ServiceResult<ResourceDeployment> {
        let mut s = self.state();
        let version = s.version + 1;
        let d = s
            .deployments
            .values_mut()
            .find(|d| d.resource_id == report.resource_id)
            .ok_or_else(|| ServiceError::not_found(format!("no deployment for resource {}", report.resource_id)))?;
        if d.cluster_id != cluster_id {
            return Err(ServiceError::forbidden(format!("resource {} is not deployed on cluster {}", report.resource_id, cluster_id)));
        }
        let changed = fold_report(d, &report);
        if changed {
            d.version = version;
        }
        let out = d.clone();
        if changed {
            s.version = version;
        }
        Ok(out)
    }
}

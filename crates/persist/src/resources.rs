//! Resources and their deployments. Every write stamps a fresh version from the
//! table's sequence inside the write transaction.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use fleet_core::{
    now_ms, DeploymentStatus, DeploymentTarget, DesiredState, NewResource, Resource, ResourceDeployment, ResourceKind,
    StatusPhase,
};
use metrics::counter;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::{from_json_text, sequence, to_json_text, SqliteStore, DEPLOYMENTS_TABLE, RESOURCES_TABLE};

const RESOURCE_COLUMNS: &str = "id, kind, name, type_id, channel, namespace_id, owner, organisation_id, desired_state,
     definition, version, created_ms, updated_ms";

const DEPLOYMENT_COLUMNS: &str = "id, resource_id, resource_version, shard_metadata_id, cluster_id, namespace_id,
     operator_id, allow_upgrade, version, phase, status_version, conditions, routes, upgrade_available";

impl SqliteStore {
    pub fn create_resource(&self, new: &NewResource) -> Result<Resource> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = uuid::Uuid::new_v4().to_string();
        let version = sequence::next_version(&tx, RESOURCES_TABLE)?;
        let now = now_ms();
        tx.execute(
            "INSERT INTO resources(id, kind, name, type_id, channel, namespace_id, owner, organisation_id,
                                   desired_state, definition, version, created_ms, updated_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            rusqlite::params![
                id,
                new.kind.as_str(),
                new.name,
                new.type_id,
                new.channel,
                new.namespace_id,
                new.owner,
                new.organisation_id,
                new.desired_state.as_str(),
                to_json_text(&new.definition)?,
                version,
                now,
            ],
        )
        .with_context(|| format!("inserting resource {}", new.name))?;
        for (k, v) in &new.annotations {
            tx.execute("INSERT INTO resource_annotations(resource_id, key, value) VALUES (?1, ?2, ?3)", (&id, k, v))?;
        }
        let created = load_resource(&tx, &id)?.ok_or_else(|| anyhow!("resource {} vanished after insert", id))?;
        tx.commit().context("committing resource")?;
        counter!("resources_created_total", 1u64, "kind" => new.kind.as_str());
        debug!(resource = %id, version, "persist: resource created");
        Ok(created)
    }

    pub fn get_resource(&self, id: &str) -> Result<Option<Resource>> {
        let db = self.conn()?;
        load_resource(&db, id)
    }

    /// Resources ordered by version, optionally restricted to one desired state.
    pub fn list_resources(&self, desired: Option<DesiredState>) -> Result<Vec<Resource>> {
        let db = self.conn()?;
        let ids: Vec<String> = {
            let mut out = Vec::new();
            match desired {
                Some(d) => {
                    let mut stmt =
                        db.prepare("SELECT id FROM resources WHERE desired_state = ?1 ORDER BY version ASC")?;
                    let mut rows = stmt.query([d.as_str()])?;
                    while let Some(row) = rows.next()? {
                        out.push(row.get(0)?);
                    }
                }
                None => {
                    let mut stmt = db.prepare("SELECT id FROM resources ORDER BY version ASC")?;
                    let mut rows = stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        out.push(row.get(0)?);
                    }
                }
            }
            out
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = load_resource(&db, &id)? {
                out.push(r);
            }
        }
        Ok(out)
    }

    /// Change the desired state. Returns the updated resource, or `None` if it does not exist.
    pub fn update_desired_state(&self, id: &str, desired: DesiredState) -> Result<Option<Resource>> {
        self.update_resource(id, "desired_state", desired.as_str().to_string())
    }

    pub fn update_definition(&self, id: &str, definition: &serde_json::Value) -> Result<Option<Resource>> {
        self.update_resource(id, "definition", to_json_text(definition)?)
    }

    fn update_resource(&self, id: &str, column: &str, value: String) -> Result<Option<Resource>> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let version = sequence::next_version(&tx, RESOURCES_TABLE)?;
        let n = tx.execute(
            &format!("UPDATE resources SET {} = ?2, version = ?3, updated_ms = ?4 WHERE id = ?1", column),
            (id, value, version, now_ms()),
        )?;
        if n == 0 {
            // Leave the sequence untouched for misses.
            tx.rollback()?;
            return Ok(None);
        }
        let updated = load_resource(&tx, id)?;
        tx.commit().with_context(|| format!("updating resource {}", id))?;
        Ok(updated)
    }

    /// Delete a resource with its annotations and deployment.
    pub fn delete_resource(&self, id: &str) -> Result<bool> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM resource_annotations WHERE resource_id = ?1", [id])?;
        tx.execute("DELETE FROM resource_deployments WHERE resource_id = ?1", [id])?;
        let n = tx.execute("DELETE FROM resources WHERE id = ?1", [id])?;
        tx.commit().with_context(|| format!("deleting resource {}", id))?;
        if n == 1 {
            counter!("resources_deleted_total", 1u64);
        }
        Ok(n == 1)
    }

    /// Create the deployment of a resource. A resource has at most one deployment.
    pub fn create_deployment(
        &self,
        resource_id: &str,
        target: &DeploymentTarget,
        shard_metadata_id: Option<i64>,
        allow_upgrade: bool,
    ) -> Result<ResourceDeployment> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let resource_version: Option<i64> = tx
            .query_row("SELECT version FROM resources WHERE id = ?1", [resource_id], |row| row.get(0))
            .optional()?;
        let Some(resource_version) = resource_version else {
            bail!("resource {} not found", resource_id);
        };
        let existing: Option<String> = tx
            .query_row("SELECT id FROM resource_deployments WHERE resource_id = ?1", [resource_id], |row| row.get(0))
            .optional()?;
        if let Some(existing) = existing {
            bail!("resource {} already has deployment {}", resource_id, existing);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let version = sequence::next_version(&tx, DEPLOYMENTS_TABLE)?;
        let now = now_ms();
        tx.execute(
            "INSERT INTO resource_deployments(id, resource_id, resource_version, shard_metadata_id, cluster_id,
                 namespace_id, operator_id, allow_upgrade, version, phase, created_ms, updated_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            rusqlite::params![
                id,
                resource_id,
                resource_version,
                shard_metadata_id,
                target.cluster_id,
                target.namespace_id,
                target.operator_id,
                allow_upgrade,
                version,
                StatusPhase::default().as_str(),
                now,
            ],
        )
        .with_context(|| format!("inserting deployment for {}", resource_id))?;
        let created = load_deployment(&tx, "id", &id)?.ok_or_else(|| anyhow!("deployment {} vanished", id))?;
        tx.commit().context("committing deployment")?;
        counter!("deployments_created_total", 1u64);
        debug!(deployment = %id, resource = %resource_id, version, "persist: deployment created");
        Ok(created)
    }

    pub fn get_deployment(&self, id: &str) -> Result<Option<ResourceDeployment>> {
        let db = self.conn()?;
        load_deployment(&db, "id", id)
    }

    pub fn deployment_for_resource(&self, resource_id: &str) -> Result<Option<ResourceDeployment>> {
        let db = self.conn()?;
        load_deployment(&db, "resource_id", resource_id)
    }

    /// Deployments on `cluster_id` with a version greater than `after_version`, by version.
    pub fn list_deployments_since(&self, cluster_id: &str, after_version: i64) -> Result<Vec<ResourceDeployment>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM resource_deployments WHERE cluster_id = ?1 AND version > ?2 ORDER BY version ASC",
            DEPLOYMENT_COLUMNS
        ))?;
        let mut rows = stmt.query((cluster_id, after_version))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(deployment_row(row)?.decode()?);
        }
        Ok(out)
    }

    /// Read-modify-write of a deployment in one transaction. `f` returns whether it
    /// changed anything; only then is the row written back with a fresh version.
    /// Returns the stored deployment, or `None` if it does not exist.
    pub fn modify_deployment<F>(&self, id: &str, f: F) -> Result<Option<ResourceDeployment>>
    where
        F: FnOnce(&mut ResourceDeployment) -> bool,
    {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut dep) = load_deployment(&tx, "id", id)? else {
            return Ok(None);
        };
        if !f(&mut dep) {
            return Ok(Some(dep));
        }
        dep.version = sequence::next_version(&tx, DEPLOYMENTS_TABLE)?;
        tx.execute(
            "UPDATE resource_deployments SET resource_version = ?2, shard_metadata_id = ?3, allow_upgrade = ?4,
                 version = ?5, phase = ?6, status_version = ?7, conditions = ?8, routes = ?9,
                 upgrade_available = ?10, updated_ms = ?11
             WHERE id = ?1",
            rusqlite::params![
                dep.id,
                dep.resource_version,
                dep.shard_metadata_id,
                dep.allow_upgrade,
                dep.version,
                dep.status.phase.as_str(),
                dep.status.version,
                to_json_text(&dep.status.conditions)?,
                to_json_text(&dep.status.routes)?,
                dep.status.upgrade_available,
                now_ms(),
            ],
        )
        .with_context(|| format!("writing deployment {}", id))?;
        tx.commit()?;
        Ok(Some(dep))
    }

    /// Resources whose version moved past the version their deployment was synced from.
    pub fn list_out_of_sync(&self) -> Result<Vec<(Resource, ResourceDeployment)>> {
        let db = self.conn()?;
        let pairs: Vec<(String, String)> = {
            let mut stmt = db.prepare(
                "SELECT r.id, d.id FROM resources r JOIN resource_deployments d ON d.resource_id = r.id
                 WHERE r.version > d.resource_version ORDER BY r.version ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push((row.get(0)?, row.get(1)?));
            }
            out
        };
        let mut out = Vec::with_capacity(pairs.len());
        for (rid, did) in pairs {
            if let (Some(r), Some(d)) = (load_resource(&db, &rid)?, load_deployment(&db, "id", &did)?) {
                out.push((r, d));
            }
        }
        Ok(out)
    }
}

fn load_resource(db: &Connection, id: &str) -> Result<Option<Resource>> {
    let raw = db
        .query_row(&format!("SELECT {} FROM resources WHERE id = ?1", RESOURCE_COLUMNS), [id], |row| {
            Ok(ResourceRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                name: row.get(2)?,
                type_id: row.get(3)?,
                channel: row.get(4)?,
                namespace_id: row.get(5)?,
                owner: row.get(6)?,
                organisation_id: row.get(7)?,
                desired_state: row.get(8)?,
                definition: row.get(9)?,
                version: row.get(10)?,
                created_ms: row.get(11)?,
                updated_ms: row.get(12)?,
            })
        })
        .optional()?;
    let Some(raw) = raw else { return Ok(None) };
    let mut annotations = BTreeMap::new();
    let mut stmt = db.prepare("SELECT key, value FROM resource_annotations WHERE resource_id = ?1")?;
    let mut rows = stmt.query([id])?;
    while let Some(row) = rows.next()? {
        annotations.insert(row.get(0)?, row.get(1)?);
    }
    raw.decode(annotations).map(Some)
}

struct ResourceRow {
    id: String,
    kind: String,
    name: String,
    type_id: String,
    channel: String,
    namespace_id: String,
    owner: String,
    organisation_id: String,
    desired_state: String,
    definition: String,
    version: i64,
    created_ms: i64,
    updated_ms: i64,
}

impl ResourceRow {
    fn decode(self, annotations: BTreeMap<String, String>) -> Result<Resource> {
        let kind = ResourceKind::parse(&self.kind)
            .ok_or_else(|| anyhow!("resource {} has unknown kind {}", self.id, self.kind))?;
        let desired_state = DesiredState::parse(&self.desired_state)
            .ok_or_else(|| anyhow!("resource {} has unknown desired state {}", self.id, self.desired_state))?;
        Ok(Resource {
            definition: from_json_text(&self.definition)?,
            id: self.id,
            kind,
            name: self.name,
            type_id: self.type_id,
            channel: self.channel,
            namespace_id: self.namespace_id,
            owner: self.owner,
            organisation_id: self.organisation_id,
            desired_state,
            annotations,
            version: self.version,
            created_at: self.created_ms,
            updated_at: self.updated_ms,
        })
    }
}

fn load_deployment(db: &Connection, key: &str, value: &str) -> Result<Option<ResourceDeployment>> {
    let raw = db
        .query_row(
            &format!("SELECT {} FROM resource_deployments WHERE {} = ?1", DEPLOYMENT_COLUMNS, key),
            [value],
            deployment_row,
        )
        .optional()?;
    raw.map(DeploymentRow::decode).transpose()
}

struct DeploymentRow {
    id: String,
    resource_id: String,
    resource_version: i64,
    shard_metadata_id: Option<i64>,
    cluster_id: String,
    namespace_id: String,
    operator_id: String,
    allow_upgrade: bool,
    version: i64,
    phase: String,
    status_version: i64,
    conditions: String,
    routes: String,
    upgrade_available: bool,
}

impl DeploymentRow {
    fn decode(self) -> Result<ResourceDeployment> {
        let phase = StatusPhase::parse(&self.phase)
            .ok_or_else(|| anyhow!("deployment {} has unknown phase {}", self.id, self.phase))?;
        Ok(ResourceDeployment {
            status: DeploymentStatus {
                phase,
                version: self.status_version,
                conditions: from_json_text(&self.conditions)?,
                routes: from_json_text(&self.routes)?,
                upgrade_available: self.upgrade_available,
            },
            id: self.id,
            resource_id: self.resource_id,
            resource_version: self.resource_version,
            shard_metadata_id: self.shard_metadata_id,
            cluster_id: self.cluster_id,
            namespace_id: self.namespace_id,
            operator_id: self.operator_id,
            allow_upgrade: self.allow_upgrade,
            version: self.version,
        })
    }
}

fn deployment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeploymentRow> {
    Ok(DeploymentRow {
        id: row.get(0)?,
        resource_id: row.get(1)?,
        resource_version: row.get(2)?,
        shard_metadata_id: row.get(3)?,
        cluster_id: row.get(4)?,
        namespace_id: row.get(5)?,
        operator_id: row.get(6)?,
        allow_upgrade: row.get(7)?,
        version: row.get(8)?,
        phase: row.get(9)?,
        status_version: row.get(10)?,
        conditions: row.get(11)?,
        routes: row.get(12)?,
        upgrade_available: row.get(13)?,
    })
}

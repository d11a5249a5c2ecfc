//! Fleet core types: resource types, resources, deployments and leases.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod errors;
pub mod status;

pub use errors::{PublicError, ServiceError, ServiceErrorCode, ServiceResult};
pub use status::{ready_condition, AgentStatusReport, Condition, DeploymentStatus, Route, StatusPhase};

/// Millisecond UTC timestamp as stored in the database.
pub type Millis = i64;

pub fn now_ms() -> Millis {
    chrono::Utc::now().timestamp_millis()
}

/// Family of catalog entries. Each kind is loaded, reconciled and leased on its own.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CatalogKind {
    Connector,
    Processor,
}

impl CatalogKind {
    pub fn name(&self) -> &'static str {
        match self {
            CatalogKind::Connector => "connector",
            CatalogKind::Processor => "processor",
        }
    }

    /// Key holding the numeric revision inside a channel's shard metadata.
    pub fn revision_key(&self) -> &'static str {
        match self {
            CatalogKind::Connector => "connector_revision",
            CatalogKind::Processor => "processor_revision",
        }
    }

    pub fn lease_type(&self) -> &'static str {
        match self {
            CatalogKind::Connector => "connector_type",
            CatalogKind::Processor => "processor_type",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connector" => Some(CatalogKind::Connector),
            "processor" => Some(CatalogKind::Processor),
            _ => None,
        }
    }
}

impl std::fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A deployable type known to the fleet manager, as stored after catalog reconciliation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceType {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon_href: String,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub featured_rank: i32,
    /// JSON schema for validating a resource's `definition`.
    #[serde(default)]
    pub json_schema: serde_json::Value,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Checksum of the catalog entry this row was written from.
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Per (type, channel) operational metadata, keyed further by revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardMetadata {
    pub id: i64,
    pub type_id: String,
    pub channel: String,
    pub revision: i64,
    pub latest: bool,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Kafka,
    Connector,
    Processor,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Kafka => "kafka",
            ResourceKind::Connector => "connector",
            ResourceKind::Processor => "processor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "kafka" => Some(ResourceKind::Kafka),
            "connector" => Some(ResourceKind::Connector),
            "processor" => Some(ResourceKind::Processor),
            _ => None,
        }
    }

    /// Catalog family whose types this resource instantiates, if any.
    pub fn catalog_kind(&self) -> Option<CatalogKind> {
        match self {
            ResourceKind::Kafka => None,
            ResourceKind::Connector => Some(CatalogKind::Connector),
            ResourceKind::Processor => Some(CatalogKind::Processor),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Ready,
    Stopped,
    Deleted,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Ready => "ready",
            DesiredState::Stopped => "stopped",
            DesiredState::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(DesiredState::Ready),
            "stopped" => Some(DesiredState::Stopped),
            "deleted" => Some(DesiredState::Deleted),
            _ => None,
        }
    }
}

/// A managed instance (Kafka instance, connector or processor).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub id: String,
    pub kind: ResourceKind,
    pub name: String,
    /// Catalog type id; empty for kinds without a catalog.
    pub type_id: String,
    pub channel: String,
    pub namespace_id: String,
    pub owner: String,
    pub organisation_id: String,
    pub desired_state: DesiredState,
    pub definition: serde_json::Value,
    pub annotations: BTreeMap<String, String>,
    /// Stamped by the version sequencer on every write; never set by callers.
    pub version: i64,
    pub created_at: Millis,
    pub updated_at: Millis,
}

/// Input for creating a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResource {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default)]
    pub type_id: String,
    #[serde(default)]
    pub channel: String,
    pub namespace_id: String,
    pub owner: String,
    #[serde(default)]
    pub organisation_id: String,
    pub desired_state: DesiredState,
    #[serde(default)]
    pub definition: serde_json::Value,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Where a resource runs on the data plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentTarget {
    pub cluster_id: String,
    pub namespace_id: String,
    pub operator_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDeployment {
    pub id: String,
    pub resource_id: String,
    /// Resource version this deployment was last synced from.
    pub resource_version: i64,
    pub shard_metadata_id: Option<i64>,
    pub cluster_id: String,
    pub namespace_id: String,
    pub operator_id: String,
    pub allow_upgrade: bool,
    pub version: i64,
    pub status: DeploymentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderLease {
    pub lease_type: String,
    pub leader: String,
    pub expires: Millis,
}

impl LeaderLease {
    pub fn is_expired(&self, now: Millis) -> bool {
        self.expires <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_kind_keys() {
        assert_eq!(CatalogKind::Processor.revision_key(), "processor_revision");
        assert_eq!(CatalogKind::Connector.lease_type(), "connector_type");
        assert_eq!(CatalogKind::parse("processor"), Some(CatalogKind::Processor));
        assert_eq!(CatalogKind::parse("kafka"), None);
    }

    #[test]
    fn resource_kind_maps_to_catalog() {
        assert_eq!(ResourceKind::Kafka.catalog_kind(), None);
        assert_eq!(ResourceKind::Connector.catalog_kind(), Some(CatalogKind::Connector));
        assert_eq!(ResourceKind::parse(ResourceKind::Processor.as_str()), Some(ResourceKind::Processor));
        assert_eq!(DesiredState::parse("deleted"), Some(DesiredState::Deleted));
    }

    #[test]
    fn lease_expiry_is_inclusive() {
        let lease = LeaderLease { lease_type: "t".into(), leader: "a".into(), expires: 100 };
        assert!(!lease.is_expired(99));
        assert!(lease.is_expired(100));
    }
}

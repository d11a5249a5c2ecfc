//! Fleet catalog: load type definitions and shard metadata from disk.
//!
//! A catalog kind (connector or processor) is described by two sets of directories:
//! catalog dirs holding one file per type, and metadata dirs holding lists of
//! recognized type ids with labels/annotations. Loading is a pure function of the
//! filesystem; every entry carries a checksum used to detect drift against the
//! database.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use fleet_core::{CatalogKind, ResourceType};
use serde::{Deserialize, Serialize};

mod error;
mod loader;
pub mod revision;
pub mod validate;

pub use error::{CatalogError, FormatError};
pub use loader::{CatalogLoader, LoadReport};
pub use revision::{shard_revision, ShardRevision};
pub use validate::{validate_definition, ValidationIssue};

/// Per-channel configuration of a catalog type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    #[serde(default)]
    pub shard_metadata: serde_json::Map<String, serde_json::Value>,
}

/// On-disk shape of a catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(rename = "type", alias = "connector_type", alias = "processor_type")]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

/// One element of a metadata file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogMetadata {
    #[serde(alias = "connector_type_id", alias = "processor_type_id")]
    pub id: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub featured_rank: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub kind: CatalogKind,
    /// Type definition merged with its metadata; `checksum` is set.
    pub resource_type: ResourceType,
    pub channels: BTreeMap<String, ChannelConfig>,
    pub metadata: CatalogMetadata,
    pub checksum: String,
    pub source: PathBuf,
}

impl CatalogEntry {
    pub fn id(&self) -> &str {
        &self.resource_type.id
    }
}

/// Loaded catalog of one kind, keyed by type id.
#[derive(Debug, Clone)]
pub struct Catalog {
    kind: CatalogKind,
    entries: BTreeMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn new(kind: CatalogKind) -> Self {
        Self { kind, entries: BTreeMap::new() }
    }

    pub fn kind(&self) -> CatalogKind { self.kind }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn get(&self, id: &str) -> Option<&CatalogEntry> { self.entries.get(id) }
    pub fn contains(&self, id: &str) -> bool { self.entries.contains_key(id) }
    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> { self.entries.values() }
    pub fn ids(&self) -> impl Iterator<Item = &str> { self.entries.keys().map(|s| s.as_str()) }

    /// Checksum per type id.
    pub fn checksums(&self) -> BTreeMap<String, String> {
        self.entries.iter().map(|(k, v)| (k.clone(), v.checksum.clone())).collect()
    }

    /// Insert or replace by id; returns the previous entry for that id.
    pub fn insert(&mut self, entry: CatalogEntry) -> Option<CatalogEntry> {
        self.entries.insert(entry.id().to_string(), entry)
    }
}

use std::path::PathBuf;

use fleet_core::CatalogKind;

/// Parse failure of a catalog or metadata file, by format.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("error listing {kind} metadata in {}: {source}", .dir.display())]
    ListMetadata { kind: CatalogKind, dir: PathBuf, source: Box<CatalogError> },

    #[error("error listing {kind} catalogs in {}: {source}", .dir.display())]
    ListCatalogs { kind: CatalogKind, dir: PathBuf, source: Box<CatalogError> },

    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    #[error("error reading {}: {source}", .path.display())]
    Io { path: PathBuf, source: std::io::Error },

    #[error("error reading {kind} metadata from {}: {source}", .path.display())]
    ReadMetadata { kind: CatalogKind, path: PathBuf, source: FormatError },

    #[error("error unmarshaling catalog file {}: {source}", .path.display())]
    ParseCatalog { path: PathBuf, source: FormatError },

    #[error("missing metadata for {kind} {id}")]
    MissingMetadata { kind: CatalogKind, id: String },

    #[error("found {} unrecognized {kind} metadata with ids: [{}]", .ids.len(), .ids.join(", "))]
    Unrecognized { kind: CatalogKind, ids: Vec<String> },

    #[error("{key} not found in shard metadata")]
    RevisionMissing { key: String },

    #[error("{key} in shard metadata must be a non-negative integer, got {found}")]
    RevisionInvalid { key: String, found: String },

    #[error("invalid json schema for type {id}: {reason}")]
    InvalidSchema { id: String, reason: String },
}

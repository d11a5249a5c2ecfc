use anyhow::{Context, Result};

/// Tables the reconciler depends on. Versions are never supplied by callers;
/// `version_sequences` hands them out (see `sequence.rs`).
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS version_sequences (
    table_name TEXT PRIMARY KEY,
    value      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS leader_leases (
    lease_type TEXT PRIMARY KEY,
    leader     TEXT NOT NULL DEFAULT '',
    expires_ms INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS channels (
    channel    TEXT PRIMARY KEY,
    created_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS resource_types (
    id            TEXT PRIMARY KEY,
    kind          TEXT NOT NULL,
    name          TEXT NOT NULL DEFAULT '',
    version       TEXT NOT NULL DEFAULT '',
    description   TEXT NOT NULL DEFAULT '',
    icon_href     TEXT NOT NULL DEFAULT '',
    deprecated    INTEGER NOT NULL DEFAULT 0,
    featured_rank INTEGER NOT NULL DEFAULT 0,
    json_schema   TEXT NOT NULL DEFAULT 'null',
    checksum      TEXT,
    created_ms    INTEGER NOT NULL,
    updated_ms    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_resource_types_kind ON resource_types(kind);

CREATE TABLE IF NOT EXISTS resource_type_channels (
    type_id TEXT NOT NULL,
    channel TEXT NOT NULL,
    PRIMARY KEY (type_id, channel)
);

CREATE TABLE IF NOT EXISTS resource_type_labels (
    type_id TEXT NOT NULL,
    label   TEXT NOT NULL,
    PRIMARY KEY (type_id, label)
);

CREATE TABLE IF NOT EXISTS resource_type_annotations (
    type_id TEXT NOT NULL,
    key     TEXT NOT NULL,
    value   TEXT NOT NULL,
    PRIMARY KEY (type_id, key)
);

CREATE TABLE IF NOT EXISTS resource_type_capabilities (
    type_id    TEXT NOT NULL,
    capability TEXT NOT NULL,
    PRIMARY KEY (type_id, capability)
);

CREATE TABLE IF NOT EXISTS shard_metadata (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    type_id  TEXT NOT NULL,
    channel  TEXT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0,
    latest   INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_shard_metadata_type_channel_revision
    ON shard_metadata(type_id, channel, revision);

CREATE TABLE IF NOT EXISTS resources (
    id              TEXT PRIMARY KEY,
    kind            TEXT NOT NULL,
    name            TEXT NOT NULL,
    type_id         TEXT NOT NULL DEFAULT '',
    channel         TEXT NOT NULL DEFAULT '',
    namespace_id    TEXT NOT NULL,
    owner           TEXT NOT NULL,
    organisation_id TEXT NOT NULL DEFAULT '',
    desired_state   TEXT NOT NULL,
    definition      TEXT NOT NULL DEFAULT 'null',
    version         INTEGER NOT NULL,
    created_ms      INTEGER NOT NULL,
    updated_ms      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_resources_type_id ON resources(type_id);
CREATE INDEX IF NOT EXISTS idx_resources_version ON resources(version);

CREATE TABLE IF NOT EXISTS resource_annotations (
    resource_id TEXT NOT NULL,
    key         TEXT NOT NULL,
    value       TEXT NOT NULL,
    PRIMARY KEY (resource_id, key)
);

CREATE TABLE IF NOT EXISTS resource_deployments (
    id                TEXT PRIMARY KEY,
    resource_id       TEXT NOT NULL UNIQUE,
    resource_version  INTEGER NOT NULL,
    shard_metadata_id INTEGER,
    cluster_id        TEXT NOT NULL,
    namespace_id      TEXT NOT NULL,
    operator_id       TEXT NOT NULL DEFAULT '',
    allow_upgrade     INTEGER NOT NULL DEFAULT 0,
    version           INTEGER NOT NULL,
    phase             TEXT NOT NULL,
    status_version    INTEGER NOT NULL DEFAULT 0,
    conditions        TEXT NOT NULL DEFAULT '[]',
    routes            TEXT NOT NULL DEFAULT '[]',
    upgrade_available INTEGER NOT NULL DEFAULT 0,
    created_ms        INTEGER NOT NULL,
    updated_ms        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_resource_deployments_cluster_version
    ON resource_deployments(cluster_id, version);
";

pub(crate) fn migrate(db: &rusqlite::Connection) -> Result<()> {
    db.execute_batch(SCHEMA).context("creating fleet schema")
}

//! Resource types, their child rows and shard metadata.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use anyhow::{Context, Result};
use fleet_core::{now_ms, CatalogKind, ResourceType, ShardMetadata};
use metrics::{counter, histogram};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::{from_json_text, sequence, to_json_text, SqliteStore, DEPLOYMENTS_TABLE};

const CHILD_TABLES: [&str; 4] =
    ["resource_type_channels", "resource_type_labels", "resource_type_annotations", "resource_type_capabilities"];

impl SqliteStore {
    /// Insert or replace a type with all of its child rows in one transaction.
    /// `created_ms` survives updates.
    pub fn upsert_type(&self, kind: CatalogKind, t: &ResourceType) -> Result<()> {
        let started = Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ms();
        tx.execute(
            "INSERT INTO resource_types(id, kind, name, version, description, icon_href, deprecated, featured_rank,
                                        json_schema, checksum, created_ms, updated_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 kind = excluded.kind, name = excluded.name, version = excluded.version,
                 description = excluded.description, icon_href = excluded.icon_href,
                 deprecated = excluded.deprecated, featured_rank = excluded.featured_rank,
                 json_schema = excluded.json_schema, checksum = excluded.checksum,
                 updated_ms = excluded.updated_ms",
            rusqlite::params![
                t.id,
                kind.name(),
                t.name,
                t.version,
                t.description,
                t.icon_href,
                t.deprecated,
                t.featured_rank,
                to_json_text(&t.json_schema)?,
                t.checksum,
                now,
            ],
        )
        .with_context(|| format!("upserting type {}", t.id))?;
        for table in CHILD_TABLES {
            tx.execute(&format!("DELETE FROM {} WHERE type_id = ?1", table), [&t.id])?;
        }
        for ch in &t.channels {
            tx.execute("INSERT OR IGNORE INTO channels(channel, created_ms) VALUES (?1, ?2)", (ch, now))?;
            tx.execute("INSERT OR IGNORE INTO resource_type_channels(type_id, channel) VALUES (?1, ?2)", (&t.id, ch))?;
        }
        for l in &t.labels {
            tx.execute("INSERT OR IGNORE INTO resource_type_labels(type_id, label) VALUES (?1, ?2)", (&t.id, l))?;
        }
        for (k, v) in &t.annotations {
            tx.execute(
                "INSERT INTO resource_type_annotations(type_id, key, value) VALUES (?1, ?2, ?3)",
                (&t.id, k, v),
            )?;
        }
        for c in &t.capabilities {
            tx.execute(
                "INSERT OR IGNORE INTO resource_type_capabilities(type_id, capability) VALUES (?1, ?2)",
                (&t.id, c),
            )?;
        }
        tx.commit().with_context(|| format!("committing type {}", t.id))?;
        histogram!("persist_type_upsert_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("types_upserted_total", 1u64, "kind" => kind.name());
        debug!(kind = %kind, id = %t.id, "persist: type upserted");
        Ok(())
    }

    pub fn get_type(&self, id: &str) -> Result<Option<ResourceType>> {
        let db = self.conn()?;
        load_type(&db, id)
    }

    /// Stored types of `kind`, highest featured rank first.
    pub fn list_types(&self, kind: CatalogKind) -> Result<Vec<ResourceType>> {
        let db = self.conn()?;
        let ids = type_ids(&db, kind, "ORDER BY featured_rank DESC, id ASC")?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(t) = load_type(&db, &id)? {
                out.push(t);
            }
        }
        Ok(out)
    }

    pub fn type_ids(&self, kind: CatalogKind) -> Result<Vec<String>> {
        let db = self.conn()?;
        type_ids(&db, kind, "ORDER BY id ASC")
    }

    pub fn type_checksum(&self, id: &str) -> Result<Option<String>> {
        let db = self.conn()?;
        let sum: Option<Option<String>> = db
            .query_row("SELECT checksum FROM resource_types WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(sum.flatten())
    }

    /// Checksums of stored types of `kind`; types without one are omitted.
    pub fn type_checksums(&self, kind: CatalogKind) -> Result<HashMap<String, String>> {
        let db = self.conn()?;
        let mut stmt =
            db.prepare("SELECT id, checksum FROM resource_types WHERE kind = ?1 AND checksum IS NOT NULL")?;
        let mut rows = stmt.query([kind.name()])?;
        let mut out = HashMap::new();
        while let Some(row) = rows.next()? {
            out.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
        }
        Ok(out)
    }

    /// Record the catalog checksum a stored type converged to. False if the type is unknown.
    pub fn set_type_checksum(&self, id: &str, checksum: &str) -> Result<bool> {
        let db = self.conn()?;
        let n = db
            .execute("UPDATE resource_types SET checksum = ?2 WHERE id = ?1", (id, checksum))
            .with_context(|| format!("recording checksum of type {}", id))?;
        Ok(n == 1)
    }

    /// Number of resources instantiating type `id`.
    pub fn count_type_references(&self, id: &str) -> Result<i64> {
        let db = self.conn()?;
        let n = db.query_row("SELECT COUNT(*) FROM resources WHERE type_id = ?1", [id], |row| row.get(0))?;
        Ok(n)
    }

    /// Mark a type deprecated and forget its checksum so a returning catalog entry is re-upserted.
    pub fn deprecate_type(&self, id: &str) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE resource_types SET deprecated = 1, checksum = NULL, updated_ms = ?2 WHERE id = ?1",
            (id, now_ms()),
        )?;
        Ok(n == 1)
    }

    /// Delete a type with its child rows and shard metadata.
    pub fn delete_type(&self, id: &str) -> Result<bool> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for table in CHILD_TABLES {
            tx.execute(&format!("DELETE FROM {} WHERE type_id = ?1", table), [id])?;
        }
        tx.execute("DELETE FROM shard_metadata WHERE type_id = ?1", [id])?;
        let n = tx.execute("DELETE FROM resource_types WHERE id = ?1", [id])?;
        tx.commit().with_context(|| format!("deleting type {}", id))?;
        Ok(n == 1)
    }

    /// Store metadata for (type, channel, revision), then mark the highest revision
    /// of that (type, channel) as the only latest row.
    pub fn put_shard_metadata(
        &self,
        type_id: &str,
        channel: &str,
        revision: i64,
        metadata: &serde_json::Value,
    ) -> Result<ShardMetadata> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO shard_metadata(type_id, channel, revision, latest, metadata) VALUES (?1, ?2, ?3, 0, ?4)
             ON CONFLICT(type_id, channel, revision) DO UPDATE SET metadata = excluded.metadata",
            (type_id, channel, revision, to_json_text(metadata)?),
        )
        .with_context(|| format!("storing shard metadata for {} {} r{}", type_id, channel, revision))?;
        tx.execute(
            "UPDATE shard_metadata SET latest = (revision = (
                 SELECT MAX(revision) FROM shard_metadata WHERE type_id = ?1 AND channel = ?2))
             WHERE type_id = ?1 AND channel = ?2",
            (type_id, channel),
        )?;
        let row = tx
            .query_row(
                "SELECT id, type_id, channel, revision, latest, metadata FROM shard_metadata
                 WHERE type_id = ?1 AND channel = ?2 AND revision = ?3",
                (type_id, channel, revision),
                shard_row,
            )
            .context("reading stored shard metadata")?;
        tx.commit()?;
        row.decode()
    }

    pub fn latest_shard_metadata(&self, type_id: &str, channel: &str) -> Result<Option<ShardMetadata>> {
        let db = self.conn()?;
        let row = db
            .query_row(
                "SELECT id, type_id, channel, revision, latest, metadata FROM shard_metadata
                 WHERE type_id = ?1 AND channel = ?2 AND latest = 1",
                (type_id, channel),
                shard_row,
            )
            .optional()?;
        row.map(ShardRow::decode).transpose()
    }

    /// All shard metadata rows of a type, by channel then revision.
    pub fn list_shard_metadata(&self, type_id: &str) -> Result<Vec<ShardMetadata>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, type_id, channel, revision, latest, metadata FROM shard_metadata
             WHERE type_id = ?1 ORDER BY channel ASC, revision ASC",
        )?;
        let mut rows = stmt.query([type_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(shard_row(row)?.decode()?);
        }
        Ok(out)
    }

    /// Set `upgrade_available` on deployments of `kind` types whose pinned shard metadata
    /// is no longer latest, clear it where it is. Changed deployments get a new version.
    /// Returns how many deployments changed.
    pub fn refresh_upgrade_flags(&self, kind: CatalogKind) -> Result<usize> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stale: Vec<(String, bool)> = {
            let mut stmt = tx.prepare(
                "SELECT d.id, s.latest FROM resource_deployments d
                 JOIN shard_metadata s ON s.id = d.shard_metadata_id
                 JOIN resource_types t ON t.id = s.type_id
                 WHERE t.kind = ?1 AND d.upgrade_available = s.latest",
            )?;
            let mut rows = stmt.query([kind.name()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push((row.get(0)?, row.get(1)?));
            }
            out
        };
        let now = now_ms();
        for (id, latest) in &stale {
            let version = sequence::next_version(&tx, DEPLOYMENTS_TABLE)?;
            tx.execute(
                "UPDATE resource_deployments SET upgrade_available = ?2, version = ?3, updated_ms = ?4 WHERE id = ?1",
                (id, !*latest, version, now),
            )?;
        }
        tx.commit().context("committing upgrade flags")?;
        Ok(stale.len())
    }
}

fn type_ids(db: &Connection, kind: CatalogKind, order: &str) -> Result<Vec<String>> {
    let mut stmt = db.prepare(&format!("SELECT id FROM resource_types WHERE kind = ?1 {}", order))?;
    let mut rows = stmt.query([kind.name()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row.get(0)?);
    }
    Ok(out)
}

fn child_values(db: &Connection, sql: &str, id: &str) -> Result<Vec<String>> {
    let mut stmt = db.prepare(sql)?;
    let mut rows = stmt.query([id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row.get(0)?);
    }
    Ok(out)
}

fn load_type(db: &Connection, id: &str) -> Result<Option<ResourceType>> {
    let base = db
        .query_row(
            "SELECT name, version, description, icon_href, deprecated, featured_rank, json_schema, checksum
             FROM resource_types WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, i32>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional()?;
    let Some((name, version, description, icon_href, deprecated, featured_rank, schema, checksum)) = base else {
        return Ok(None);
    };
    let mut annotations = BTreeMap::new();
    {
        let mut stmt = db.prepare("SELECT key, value FROM resource_type_annotations WHERE type_id = ?1")?;
        let mut rows = stmt.query([id])?;
        while let Some(row) = rows.next()? {
            annotations.insert(row.get(0)?, row.get(1)?);
        }
    }
    Ok(Some(ResourceType {
        id: id.to_string(),
        name,
        version,
        channels: child_values(
            db,
            "SELECT channel FROM resource_type_channels WHERE type_id = ?1 ORDER BY channel",
            id,
        )?,
        description,
        icon_href,
        deprecated,
        featured_rank,
        json_schema: from_json_text(&schema)?,
        capabilities: child_values(
            db,
            "SELECT capability FROM resource_type_capabilities WHERE type_id = ?1 ORDER BY capability",
            id,
        )?,
        labels: child_values(db, "SELECT label FROM resource_type_labels WHERE type_id = ?1 ORDER BY label", id)?,
        annotations,
        checksum,
    }))
}

struct ShardRow {
    id: i64,
    type_id: String,
    channel: String,
    revision: i64,
    latest: bool,
    metadata: String,
}

impl ShardRow {
    fn decode(self) -> Result<ShardMetadata> {
        Ok(ShardMetadata {
            id: self.id,
            type_id: self.type_id,
            channel: self.channel,
            revision: self.revision,
            latest: self.latest,
            metadata: from_json_text(&self.metadata)?,
        })
    }
}

fn shard_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShardRow> {
    Ok(ShardRow {
        id: row.get(0)?,
        type_id: row.get(1)?,
        channel: row.get(2)?,
        revision: row.get(3)?,
        latest: row.get(4)?,
        metadata: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(id: &str) -> ResourceType {
        ResourceType {
            id: id.into(),
            name: "Sample".into(),
            version: "0.1".into(),
            channels: vec!["beta".into(), "stable".into()],
            labels: vec!["source".into()],
            capabilities: vec!["processors".into()],
            annotations: BTreeMap::from([("fleet/tier".to_string(), "free".to_string())]),
            json_schema: json!({"type": "object"}),
            checksum: Some("abc".into()),
            ..Default::default()
        }
    }

    #[test]
    fn upsert_then_read_back() {
        let s = SqliteStore::open_in_memory().unwrap();
        let t = sample("p_0.1");
        s.upsert_type(CatalogKind::Processor, &t).unwrap();
        assert_eq!(s.get_type("p_0.1").unwrap().unwrap(), t);
        assert_eq!(s.type_ids(CatalogKind::Processor).unwrap(), vec!["p_0.1"]);
        assert!(s.type_ids(CatalogKind::Connector).unwrap().is_empty());
        assert_eq!(s.type_checksum("p_0.1").unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn upsert_replaces_child_rows() {
        let s = SqliteStore::open_in_memory().unwrap();
        s.upsert_type(CatalogKind::Processor, &sample("p")).unwrap();
        let mut t = sample("p");
        t.labels = vec!["sink".into()];
        t.channels = vec!["stable".into()];
        s.upsert_type(CatalogKind::Processor, &t).unwrap();
        let got = s.get_type("p").unwrap().unwrap();
        assert_eq!(got.labels, vec!["sink"]);
        assert_eq!(got.channels, vec!["stable"]);
    }

    #[test]
    fn deprecate_clears_checksum() {
        let s = SqliteStore::open_in_memory().unwrap();
        s.upsert_type(CatalogKind::Connector, &sample("c")).unwrap();
        assert!(s.deprecate_type("c").unwrap());
        let got = s.get_type("c").unwrap().unwrap();
        assert!(got.deprecated);
        assert!(got.checksum.is_none());
        assert!(s.type_checksums(CatalogKind::Connector).unwrap().is_empty());
    }

    #[test]
    fn checksum_is_recorded_separately() {
        let s = SqliteStore::open_in_memory().unwrap();
        let mut t = sample("p");
        t.checksum = None;
        s.upsert_type(CatalogKind::Processor, &t).unwrap();
        assert!(s.type_checksum("p").unwrap().is_none());
        assert!(s.set_type_checksum("p", "def").unwrap());
        assert_eq!(s.type_checksum("p").unwrap().as_deref(), Some("def"));
        assert!(!s.set_type_checksum("missing", "def").unwrap());
    }

    #[test]
    fn delete_removes_everything() {
        let s = SqliteStore::open_in_memory().unwrap();
        s.upsert_type(CatalogKind::Processor, &sample("p")).unwrap();
        s.put_shard_metadata("p", "stable", 1, &json!({})).unwrap();
        assert!(s.delete_type("p").unwrap());
        assert!(s.get_type("p").unwrap().is_none());
        assert!(s.list_shard_metadata("p").unwrap().is_empty());
        assert!(!s.delete_type("p").unwrap());
    }

    #[test]
    fn highest_revision_is_latest() {
        let s = SqliteStore::open_in_memory().unwrap();
        let r2 = s.put_shard_metadata("p", "stable", 2, &json!({"image": "b"})).unwrap();
        assert!(r2.latest);
        let r1 = s.put_shard_metadata("p", "stable", 1, &json!({"image": "a"})).unwrap();
        assert!(!r1.latest);
        let latest = s.latest_shard_metadata("p", "stable").unwrap().unwrap();
        assert_eq!(latest.revision, 2);
        assert_eq!(latest.metadata, json!({"image": "b"}));
        let again = s.put_shard_metadata("p", "stable", 2, &json!({"image": "c"})).unwrap();
        assert_eq!(again.id, r2.id);
        assert!(s.latest_shard_metadata("p", "beta").unwrap().is_none());
    }
}

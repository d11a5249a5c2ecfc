//! Per-table version sequencer.
//!
//! Every insert or update of a tracked row takes `next_version` inside the same
//! transaction as the write, so versions per table are strictly increasing.
//! Contiguity is not promised.

use anyhow::{Context, Result};
use metrics::counter;

use crate::SqliteStore;

/// Hands out strictly increasing versions per table.
pub trait VersionSequencer {
    fn next_version(&self, table: &str) -> Result<i64>;
}

/// Atomically increment and return the sequence for `table`.
pub(crate) fn next_version(db: &rusqlite::Connection, table: &str) -> Result<i64> {
    let v: i64 = db
        .query_row(
            "INSERT INTO version_sequences(table_name, value) VALUES (?1, 1)
             ON CONFLICT(table_name) DO UPDATE SET value = value + 1
             RETURNING value",
            [table],
            |row| row.get(0),
        )
        .with_context(|| format!("advancing version sequence for {}", table))?;
    counter!("persist_version_stamps_total", 1u64, "table" => table.to_string());
    Ok(v)
}

impl VersionSequencer for SqliteStore {
    fn next_version(&self, table: &str) -> Result<i64> {
        let db = self.conn()?;
        next_version(&db, table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_strictly_increase_per_table() {
        let s = SqliteStore::open_in_memory().unwrap();
        let mut last = 0;
        for _ in 0..10 {
            let v = s.next_version("resources").unwrap();
            assert!(v > last);
            last = v;
        }
        assert_eq!(s.next_version("resource_deployments").unwrap(), 1);
        assert!(s.next_version("resources").unwrap() > last);
    }
}

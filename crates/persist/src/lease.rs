//! Leader leases: one row per lease type, claimed with a single conditional upsert.

use std::time::Duration;

use anyhow::{Context, Result};
use fleet_core::{now_ms, LeaderLease};
use metrics::counter;
use rusqlite::{OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::SqliteStore;

/// Claim/renew/release semantics for cross-process leadership.
pub trait LeaseStore: Send + Sync {
    /// Take the lease if no row exists or the current one has expired.
    fn claim(&self, lease_type: &str, candidate: &str, ttl: Duration) -> Result<bool>;
    /// Extend the lease if `candidate` holds it and it has not expired.
    fn renew(&self, lease_type: &str, candidate: &str, ttl: Duration) -> Result<bool>;
    /// Expire the lease now if `candidate` holds it.
    fn release(&self, lease_type: &str, candidate: &str) -> Result<bool>;
    fn current_lease(&self, lease_type: &str) -> Result<Option<LeaderLease>>;
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl LeaseStore for SqliteStore {
    fn claim(&self, lease_type: &str, candidate: &str, ttl: Duration) -> Result<bool> {
        let mut db = self.conn()?;
        // IMMEDIATE takes the write lock up front so concurrent claimants queue on busy_timeout
        // instead of failing on a stale read snapshot.
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate).context("starting lease claim")?;
        let now = now_ms();
        let expires = now.saturating_add(ttl_ms(ttl));
        let changed = tx
            .execute(
                "INSERT INTO leader_leases(lease_type, leader, expires_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(lease_type) DO UPDATE SET leader = excluded.leader, expires_ms = excluded.expires_ms
                 WHERE leader_leases.expires_ms <= ?4",
                (lease_type, candidate, expires, now),
            )
            .with_context(|| format!("claiming lease {}", lease_type))?;
        tx.commit().context("committing lease claim")?;
        let acquired = changed == 1;
        counter!("lease_claim_total", 1u64, "lease_type" => lease_type.to_string(), "acquired" => acquired.to_string());
        debug!(lease_type, candidate, acquired, "lease: claim");
        Ok(acquired)
    }

    fn renew(&self, lease_type: &str, candidate: &str, ttl: Duration) -> Result<bool> {
        let db = self.conn()?;
        let now = now_ms();
        let changed = db
            .execute(
                "UPDATE leader_leases SET expires_ms = ?3
                 WHERE lease_type = ?1 AND leader = ?2 AND expires_ms > ?4",
                (lease_type, candidate, now.saturating_add(ttl_ms(ttl)), now),
            )
            .with_context(|| format!("renewing lease {}", lease_type))?;
        Ok(changed == 1)
    }

    fn release(&self, lease_type: &str, candidate: &str) -> Result<bool> {
        let db = self.conn()?;
        let now = now_ms();
        let changed = db
            .execute(
                "UPDATE leader_leases SET expires_ms = ?3
                 WHERE lease_type = ?1 AND leader = ?2 AND expires_ms > ?3",
                (lease_type, candidate, now),
            )
            .with_context(|| format!("releasing lease {}", lease_type))?;
        debug!(lease_type, candidate, released = changed == 1, "lease: release");
        Ok(changed == 1)
    }

    fn current_lease(&self, lease_type: &str) -> Result<Option<LeaderLease>> {
        let db = self.conn()?;
        db.query_row(
            "SELECT lease_type, leader, expires_ms FROM leader_leases WHERE lease_type = ?1",
            [lease_type],
            |row| Ok(LeaderLease { lease_type: row.get(0)?, leader: row.get(1)?, expires: row.get(2)? }),
        )
        .optional()
        .context("reading lease")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn claim_on_empty_table() {
        let s = SqliteStore::open_in_memory().unwrap();
        assert!(s.claim("processor_type", "a", TTL).unwrap());
        let lease = s.current_lease("processor_type").unwrap().unwrap();
        assert_eq!(lease.leader, "a");
        assert!(!lease.is_expired(now_ms()));
    }

    #[test]
    fn unexpired_lease_cannot_be_taken() {
        let s = SqliteStore::open_in_memory().unwrap();
        assert!(s.claim("t", "a", TTL).unwrap());
        assert!(!s.claim("t", "b", TTL).unwrap());
        assert!(!s.claim("t", "a", TTL).unwrap(), "claim is not renew");
        assert!(s.renew("t", "a", TTL).unwrap());
        assert!(!s.renew("t", "b", TTL).unwrap());
        assert_eq!(s.current_lease("t").unwrap().unwrap().leader, "a");
    }

    #[test]
    fn expired_lease_transfers() {
        let s = SqliteStore::open_in_memory().unwrap();
        assert!(s.claim("t", "a", Duration::ZERO).unwrap());
        assert!(!s.renew("t", "a", TTL).unwrap());
        assert!(s.claim("t", "b", TTL).unwrap());
        assert_eq!(s.current_lease("t").unwrap().unwrap().leader, "b");
    }

    #[test]
    fn released_lease_is_claimable_immediately() {
        let s = SqliteStore::open_in_memory().unwrap();
        assert!(s.claim("t", "a", TTL).unwrap());
        assert!(!s.release("t", "b").unwrap());
        assert!(s.release("t", "a").unwrap());
        assert!(s.claim("t", "b", TTL).unwrap());
    }

    #[test]
    fn lease_types_are_independent() {
        let s = SqliteStore::open_in_memory().unwrap();
        assert!(s.claim("connector_type", "a", TTL).unwrap());
        assert!(s.claim("processor_type", "b", TTL).unwrap());
        assert!(s.current_lease("other").unwrap().is_none());
    }
}

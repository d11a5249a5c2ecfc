//! Fleet persistence: SQLite store shared by every control-plane instance.
//!
//! The database is the only state shared across instances. Cross-instance
//! coordination goes through single conditional statements (lease claims) or
//! checksum comparison; nothing here caches rows in memory.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use metrics::histogram;
use tracing::debug;

mod lease;
mod resources;
mod schema;
mod sequence;
mod types;

pub use lease::LeaseStore;
pub use sequence::VersionSequencer;

/// Table names with a version sequence.
pub const RESOURCES_TABLE: &str = "resources";
pub const DEPLOYMENTS_TABLE: &str = "resource_deployments";

/// SQLite-backed store. Synchronous; callers hold the lock only for the duration of a statement or transaction.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("FLEET_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        Self::init(db, started)
    }

    /// Private in-memory database, one per store. Useful for tests.
    pub fn open_in_memory() -> Result<Self> {
        let started = Instant::now();
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db, started)
    }

    fn init(db: rusqlite::Connection, started: Instant) -> Result<Self> {
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.busy_timeout(busy_timeout()).context("setting sqlite busy timeout")?;
        schema::migrate(&db)?;
        let me = Self { db: Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(took_ms = %started.elapsed().as_millis(), "persist: store opened");
        Ok(me)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

fn busy_timeout() -> Duration {
    let ms = std::env::var("FLEET_DB_BUSY_TIMEOUT_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(5_000);
    Duration::from_millis(ms)
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".fleet-manager");
        let _ = std::fs::create_dir_all(&p);
        p.push("fleet.db");
        return p.to_string_lossy().to_string();
    }
    "fleet.db".to_string()
}

pub(crate) fn to_json_text<T: serde::Serialize>(v: &T) -> Result<String> {
    serde_json::to_string(v).context("encoding json column")
}

pub(crate) fn from_json_text<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).context("decoding json column")
}

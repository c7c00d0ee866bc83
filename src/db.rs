//! Durable key/value cache backed by a single-file redb database.
//!
//! One logical bucket (the `global` table) holding storage snapshots keyed
//! by release date. Writes are transactional, so a crash can lose the last
//! update at worst, never corrupt the file.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use redb::{Database, ReadableTable, TableDefinition};
use thiserror::Error;
use tokio::{task, time};
use tracing::{debug, trace};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("global");

/// Pause between attempts while another process holds the file lock.
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Sentinel lookup failures, so callers can treat a missing key differently
/// from a broken cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("key not found")]
    NotFound,
    #[error("value is nil")]
    NilValue,
}

/// File-backed store for storage snapshots.
#[derive(Debug)]
pub struct Db {
    db: RwLock<Option<Database>>,
    path: PathBuf,
    timeout: Duration,
}

impl Db {
    /// Opens (or creates) the database at `path`, waiting up to `timeout`
    /// for the file lock, and makes sure the bucket exists.
    pub fn open(path: impl AsRef<Path>, timeout: Duration) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(path = %path.display(), ?timeout, "opening the cache");

        let deadline = Instant::now() + timeout;
        let db = loop {
            match Database::create(&path) {
                Ok(db) => break db,
                Err(err) if Instant::now() < deadline => {
                    trace!(error = %err, "cache not available yet, retrying");
                    thread::sleep(OPEN_RETRY_INTERVAL);
                }
                Err(err) => return Err(err).context("unable to open the cache: timeout"),
            }
        };

        let txn = db.begin_write()?;
        txn.open_table(TABLE)?;
        txn.commit()?;

        debug!("cache ready");
        Ok(Db {
            db: RwLock::new(Some(db)),
            path,
            timeout,
        })
    }

    /// Closes the database, waiting up to the configured timeout for pending
    /// work to settle. With `delete` set the file is removed afterwards.
    pub async fn close(&self, delete: bool) -> crate::Result<()> {
        debug!("closing the cache");
        let db = self
            .db
            .write()
            .unwrap()
            .take()
            .context("cache is already closed")?;

        let done = task::spawn_blocking(move || drop(db));
        time::timeout(self.timeout, done)
            .await
            .context("unable to close the cache: timeout")??;

        if delete {
            std::fs::remove_file(&self.path).context("unable to remove the cache file")?;
        }
        Ok(())
    }

    /// Returns all keys in the bucket, sorted ascending. Keys holding empty
    /// values are treated as absent.
    pub fn keys(&self) -> crate::Result<Vec<String>> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(TABLE)?;
            let mut keys = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                if !value.value().is_empty() {
                    keys.push(key.value().to_string());
                }
            }
            Ok(keys)
        })
    }

    /// Gets a copy of the value stored under `key`.
    pub fn get(&self, key: &str) -> crate::Result<Vec<u8>> {
        trace!(key, "getting value from the cache");
        self.with_db(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(TABLE)?;
            let value = table.get(key)?.ok_or(CacheError::NotFound)?;
            let bytes = value.value().to_vec();
            if bytes.is_empty() {
                return Err(CacheError::NilValue.into());
            }
            Ok(bytes)
        })
    }

    /// Inserts or overwrites the value under `key`.
    pub fn put(&self, key: &str, value: &[u8]) -> crate::Result<()> {
        trace!(key, len = value.len(), "saving value to the cache");
        self.with_db(|db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(TABLE)?;
                table.insert(key, value)?;
            }
            txn.commit()?;
            Ok(())
        })
    }

    /// Removes the value under `key`; absent keys are a no-op.
    pub fn delete(&self, key: &str) -> crate::Result<()> {
        trace!(key, "deleting from the cache");
        self.with_db(|db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(TABLE)?;
                table.remove(key)?;
            }
            txn.commit()?;
            Ok(())
        })
    }

    /// Drops the whole bucket.
    pub fn purge(&self) -> crate::Result<()> {
        debug!("purging the cache");
        self.with_db(|db| {
            let txn = db.begin_write()?;
            txn.delete_table(TABLE)?;
            txn.commit()?;
            Ok(())
        })
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> crate::Result<T>) -> crate::Result<T> {
        let guard = self.db.read().unwrap();
        let db = guard.as_ref().context("cache is closed")?;
        f(db)
    }
}

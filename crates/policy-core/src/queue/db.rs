//! Queue storage in a single redb table.
//!
//! # Table design
//!
//! ```text
//! QUEUE: hash (&str) -> JSON-encoded QueueEntry
//! ```
//!
//! Every mutation runs inside one write transaction. redb serializes write
//! transactions, so the read-check-write in `create` and `transition` is
//! atomic with respect to other writers on the same database.
//!
//! redb holds an exclusive lock on the file while a `Database` is open, so
//! the file is opened per operation. Concurrent sessions wait for each other
//! with a bounded retry instead of failing.
//!
//! A value that does not decode is logged and dropped from the table.

use super::entry::{ActionResult, QueueEntry, QueueStatus};
use super::{check_transition, sort_entries, QueueStore};
use crate::error::{PolicyError, Result};
use crate::io;
use redb::{Database, DatabaseError, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Table definition
// ---------------------------------------------------------------------------

const QUEUE: TableDefinition<&str, &[u8]> = TableDefinition::new("queue");

/// Attempts to acquire the database before giving up.
const OPEN_ATTEMPTS: u32 = 100;
const OPEN_BACKOFF: Duration = Duration::from_millis(20);

fn db_err(e: impl std::fmt::Display) -> PolicyError {
    PolicyError::QueueDb(e.to_string())
}

fn decode(hash: &str, bytes: &[u8]) -> Option<QueueEntry> {
    match serde_json::from_slice(bytes) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!(hash, error = %e, "discarding corrupt queue row");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// RedbQueue
// ---------------------------------------------------------------------------

pub struct RedbQueue {
    path: PathBuf,
}

impl RedbQueue {
    /// Create the database at `path` if needed, along with its table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            io::ensure_dir(parent)?;
        }
        let queue = Self {
            path: path.to_path_buf(),
        };
        let db = queue.db()?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(QUEUE).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(queue)
    }

    /// Open the file, waiting while another handle holds it.
    fn db(&self) -> Result<Database> {
        let mut attempt = 1;
        loop {
            match Database::create(&self.path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen) if attempt < OPEN_ATTEMPTS => {
                    if attempt == 1 {
                        debug!(path = %self.path.display(), "queue database busy; waiting");
                    }
                    attempt += 1;
                    std::thread::sleep(OPEN_BACKOFF);
                }
                Err(e) => return Err(db_err(e)),
            }
        }
    }

    /// Remove rows that failed to decode.
    fn discard(db: &Database, hashes: &[String]) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        let wt = db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(QUEUE).map_err(db_err)?;
            for hash in hashes {
                table.remove(hash.as_str()).map_err(db_err)?;
            }
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }
}

impl QueueStore for RedbQueue {
    fn lookup(&self, hash: &str) -> Result<Option<QueueEntry>> {
        let db = self.db()?;
        let (entry, corrupt) = {
            let rt = db.begin_read().map_err(db_err)?;
            let table = rt.open_table(QUEUE).map_err(db_err)?;
            let found = match table.get(hash).map_err(db_err)? {
                Some(v) => match decode(hash, v.value()) {
                    Some(entry) => (Some(entry), false),
                    None => (None, true),
                },
                None => (None, false),
            };
            found
        };
        if corrupt {
            Self::discard(&db, &[hash.to_string()])?;
        }
        Ok(entry)
    }

    fn create(&self, entry: &QueueEntry) -> Result<bool> {
        let value = serde_json::to_vec(entry).map_err(db_err)?;
        let db = self.db()?;
        let wt = db.begin_write().map_err(db_err)?;
        let created = {
            let mut table = wt.open_table(QUEUE).map_err(db_err)?;
            let exists = match table.get(entry.hash.as_str()).map_err(db_err)? {
                Some(v) => decode(&entry.hash, v.value()).is_some(),
                None => false,
            };
            if !exists {
                table
                    .insert(entry.hash.as_str(), value.as_slice())
                    .map_err(db_err)?;
            }
            !exists
        };
        wt.commit().map_err(db_err)?;
        if created {
            info!(hash = %entry.hash, rule = %entry.rule, "queued trigger");
        }
        Ok(created)
    }

    fn transition(
        &self,
        hash: &str,
        status: QueueStatus,
        result: Option<ActionResult>,
    ) -> Result<bool> {
        let db = self.db()?;
        let wt = db.begin_write().map_err(db_err)?;
        let rule = {
            let mut table = wt.open_table(QUEUE).map_err(db_err)?;
            let stored = match table.get(hash).map_err(db_err)? {
                Some(v) => Some(decode(hash, v.value())),
                None => None,
            };
            let current = match stored {
                Some(Some(entry)) => Some(entry),
                Some(None) => {
                    table.remove(hash).map_err(db_err)?;
                    None
                }
                None => None,
            };
            let Some(current) = current else {
                drop(table);
                wt.commit().map_err(db_err)?;
                return Err(PolicyError::EntryNotFound(hash.to_string()));
            };
            check_transition(&current, status)?;

            let mut entry = current;
            entry.settle(status, result);
            let value = serde_json::to_vec(&entry).map_err(db_err)?;
            table.insert(hash, value.as_slice()).map_err(db_err)?;
            entry.rule
        };
        wt.commit().map_err(db_err)?;
        info!(hash, %rule, %status, "queue entry settled");
        Ok(true)
    }

    fn list(&self) -> Result<Vec<QueueEntry>> {
        let db = self.db()?;
        let mut entries = Vec::new();
        let mut corrupt = Vec::new();
        {
            let rt = db.begin_read().map_err(db_err)?;
            let table = rt.open_table(QUEUE).map_err(db_err)?;
            for row in table.iter().map_err(db_err)? {
                let (k, v) = row.map_err(db_err)?;
                match decode(k.value(), v.value()) {
                    Some(entry) => entries.push(entry),
                    None => corrupt.push(k.value().to_string()),
                }
            }
        }
        Self::discard(&db, &corrupt)?;
        sort_entries(&mut entries);
        Ok(entries)
    }

    fn remove(&self, hash: &str) -> Result<bool> {
        let db = self.db()?;
        let wt = db.begin_write().map_err(db_err)?;
        let removed = {
            let mut table = wt.open_table(QUEUE).map_err(db_err)?;
            let old = table.remove(hash).map_err(db_err)?;
            old.is_some()
        };
        wt.commit().map_err(db_err)?;
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! The trigger queue: one content-addressed record per unique firing.
//!
//! `QueueStore` is the persistence seam. `FsQueue` keeps one YAML record per
//! entry under `.policy/queue/`; `RedbQueue` keeps them in a single redb table.
//! Both give the same guarantees: `create` is create-if-absent, and
//! `transition` is a compare-and-swap from `Queued` that a concurrent loser
//! observes as a no-op.

pub mod db;
pub mod entry;
pub mod fs;

pub use db::RedbQueue;
pub use entry::{ActionResult, CommandRun, QueueEntry, QueueStatus};
pub use fs::FsQueue;

use crate::config::{Config, QueueBackend};
use crate::error::{PolicyError, Result};
use crate::paths;
use std::path::Path;
use std::time::Duration;

pub trait QueueStore {
    fn lookup(&self, hash: &str) -> Result<Option<QueueEntry>>;

    /// Store `entry` unless a record with its hash exists in any status.
    /// Returns `true` if this call created it.
    fn create(&self, entry: &QueueEntry) -> Result<bool>;

    /// Move a `Queued` entry to a terminal status.
    ///
    /// Returns `false` if a concurrent writer settled the entry first. An
    /// entry that is already terminal when the call starts is an
    /// `InvalidTransition` error.
    fn transition(
        &self,
        hash: &str,
        status: QueueStatus,
        result: Option<ActionResult>,
    ) -> Result<bool>;

    /// All entries, oldest first.
    fn list(&self) -> Result<Vec<QueueEntry>>;

    /// Delete an entry. Only callers implementing retention use this.
    fn remove(&self, hash: &str) -> Result<bool>;
}

/// Open the store selected by `config`.
pub fn open(root: &Path, config: &Config) -> Result<Box<dyn QueueStore>> {
    match config.queue.backend {
        QueueBackend::Files => {
            let queue = FsQueue::new(
                paths::queue_dir(root),
                Duration::from_secs(config.queue.stale_lock_seconds),
            );
            queue.recover_stale_locks()?;
            Ok(Box::new(queue))
        }
        QueueBackend::Redb => Ok(Box::new(RedbQueue::open(&paths::queue_db_path(root))?)),
    }
}

/// Reject transitions that are never valid regardless of timing.
pub(crate) fn check_transition(entry: &QueueEntry, to: QueueStatus) -> Result<()> {
    if entry.is_terminal() || !to.is_terminal() {
        return Err(PolicyError::InvalidTransition {
            hash: entry.hash.clone(),
            from: entry.status.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn sort_entries(entries: &mut [QueueEntry]) {
    entries.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.hash.cmp(&b.hash))
    });
}

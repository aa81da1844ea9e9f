//! Filesystem-backed queue.
//!
//! # Layout
//!
//! ```text
//! .policy/queue/
//!   <hash>.<status>.yaml   one record per entry
//!   <hash>.lock            held while creating or transitioning <hash>
//! ```
//!
//! The lock file is created with `create_new`, so at most one process mutates
//! a given hash at a time. A process that finds the lock held treats its own
//! operation as lost and returns without error. Locks older than the
//! configured stale age are reclaimed, since a crashed holder never removes
//! its lock.

use super::entry::{ActionResult, QueueEntry, QueueStatus};
use super::{check_transition, sort_entries, QueueStore};
use crate::error::{PolicyError, Result};
use crate::io;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const RECORD_EXT: &str = "yaml";

pub struct FsQueue {
    dir: PathBuf,
    stale_lock: Duration,
}

/// Removes the lock file when dropped.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn valid_hash(hash: &str) -> bool {
    !hash.is_empty() && hash.chars().all(|c| c.is_ascii_alphanumeric())
}

impl FsQueue {
    pub fn new(dir: impl Into<PathBuf>, stale_lock: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_lock,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, hash: &str, status: QueueStatus) -> PathBuf {
        self.dir.join(format!("{hash}.{status}.{RECORD_EXT}"))
    }

    fn lock_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.lock"))
    }

    /// Read one record. A record that fails to parse is discarded.
    fn read_record(path: &Path) -> Result<Option<QueueEntry>> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_yaml::from_str::<QueueEntry>(&data) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding corrupt queue record");
                let _ = std::fs::remove_file(path);
                Ok(None)
            }
        }
    }

    fn acquire(&self, hash: &str) -> Result<Option<LockGuard>> {
        io::ensure_dir(&self.dir)?;
        let path = self.lock_path(hash);
        for attempt in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Some(LockGuard { path })),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && self.is_stale(&path) {
                        warn!(lock = %path.display(), "reclaiming stale queue lock");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    fn is_stale(&self, lock: &Path) -> bool {
        std::fs::metadata(lock)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age > self.stale_lock)
    }

    /// Remove locks older than the stale age. Returns how many were removed.
    ///
    /// Run when the queue is opened, so a crashed session's locks do not
    /// linger until the same hash is touched again.
    pub fn recover_stale_locks(&self) -> Result<u32> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut count = 0;
        for dirent in std::fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("lock")
                && self.is_stale(&path)
                && io::remove_if_exists(&path)?
            {
                count += 1;
            }
        }
        if count > 0 {
            warn!(dir = %self.dir.display(), count, "removed stale queue locks");
        }
        Ok(count)
    }
}

impl QueueStore for FsQueue {
    fn lookup(&self, hash: &str) -> Result<Option<QueueEntry>> {
        if !valid_hash(hash) {
            return Ok(None);
        }
        let queued_path = self.record_path(hash, QueueStatus::Queued);
        for status in [
            QueueStatus::Passed,
            QueueStatus::Failed,
            QueueStatus::Skipped,
        ] {
            if let Some(entry) = Self::read_record(&self.record_path(hash, status))? {
                // A crash between writing the terminal record and removing
                // the queued one leaves both; the terminal record wins.
                let _ = std::fs::remove_file(&queued_path);
                return Ok(Some(entry));
            }
        }
        Self::read_record(&queued_path)
    }

    fn create(&self, entry: &QueueEntry) -> Result<bool> {
        if !valid_hash(&entry.hash) {
            return Err(PolicyError::InvalidHash(entry.hash.clone()));
        }
        if self.lookup(&entry.hash)?.is_some() {
            return Ok(false);
        }
        let Some(_lock) = self.acquire(&entry.hash)? else {
            return Ok(false);
        };
        if self.lookup(&entry.hash)?.is_some() {
            return Ok(false);
        }
        let data = serde_yaml::to_string(entry)?;
        let created = io::atomic_create(&self.record_path(&entry.hash, entry.status), data.as_bytes())?;
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
        let entry = self
            .lookup(hash)?
            .ok_or_else(|| PolicyError::EntryNotFound(hash.to_string()))?;
        check_transition(&entry, status)?;

        let Some(_lock) = self.acquire(hash)? else {
            return Ok(false);
        };
        let Some(mut entry) = self.lookup(hash)? else {
            return Ok(false);
        };
        if entry.is_terminal() {
            return Ok(false);
        }

        entry.settle(status, result);
        let data = serde_yaml::to_string(&entry)?;
        io::atomic_write(&self.record_path(hash, status), data.as_bytes())?;
        // A concurrent lookup may already have dropped the queued record.
        io::remove_if_exists(&self.record_path(hash, QueueStatus::Queued))?;
        info!(hash, rule = %entry.rule, %status, "queue entry settled");
        Ok(true)
    }

    fn list(&self) -> Result<Vec<QueueEntry>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut by_hash: BTreeMap<String, QueueEntry> = BTreeMap::new();
        for dirent in std::fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(&format!(".{RECORD_EXT}")) else {
                continue;
            };
            let Some((hash, status)) = stem.split_once('.') else {
                continue;
            };
            if !valid_hash(hash) || status.parse::<QueueStatus>().is_err() {
                continue;
            }
            let Some(entry) = Self::read_record(&path)? else {
                continue;
            };
            match by_hash.get(hash) {
                Some(existing) if existing.is_terminal() => {}
                _ => {
                    by_hash.insert(hash.to_string(), entry);
                }
            }
        }
        let mut entries: Vec<QueueEntry> = by_hash.into_values().collect();
        sort_entries(&mut entries);
        Ok(entries)
    }

    fn remove(&self, hash: &str) -> Result<bool> {
        if !valid_hash(hash) {
            return Ok(false);
        }
        let mut removed = false;
        for status in QueueStatus::all() {
            removed |= io::remove_if_exists(&self.record_path(hash, *status))?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::contract;
    use tempfile::TempDir;

    fn store(dir: &Path) -> FsQueue {
        FsQueue::new(dir.join("queue"), Duration::from_secs(120))
    }

    #[test]
    fn satisfies_queue_contract() {
        contract::run_all(|dir| Box::new(store(dir)));
    }

    #[test]
    fn records_are_named_by_hash_and_status() {
        let dir = TempDir::new().unwrap();
        let q = store(dir.path());
        q.create(&contract::entry("ab12")).unwrap();
        assert!(dir.path().join("queue/ab12.queued.yaml").exists());

        q.transition("ab12", QueueStatus::Skipped, None).unwrap();
        assert!(!dir.path().join("queue/ab12.queued.yaml").exists());
        assert!(dir.path().join("queue/ab12.skipped.yaml").exists());
        assert!(!dir.path().join("queue/ab12.lock").exists());
    }

    #[test]
    fn corrupt_records_are_discarded() {
        let dir = TempDir::new().unwrap();
        let q = store(dir.path());
        std::fs::create_dir_all(dir.path().join("queue")).unwrap();
        let bad = dir.path().join("queue/ff00.queued.yaml");
        std::fs::write(&bad, "status: [not valid").unwrap();

        assert!(q.lookup("ff00").unwrap().is_none());
        assert!(!bad.exists());
        // The trigger can be queued fresh afterwards.
        assert!(q.create(&contract::entry("ff00")).unwrap());
    }

    #[test]
    fn held_lock_makes_writers_lose_quietly() {
        let dir = TempDir::new().unwrap();
        let q = store(dir.path());
        q.create(&contract::entry("cd34")).unwrap();
        std::fs::write(dir.path().join("queue/cd34.lock"), "").unwrap();

        assert!(!q.transition("cd34", QueueStatus::Passed, None).unwrap());
        assert_eq!(q.lookup("cd34").unwrap().unwrap().status, QueueStatus::Queued);

        std::fs::write(dir.path().join("queue/ef56.lock"), "").unwrap();
        assert!(!q.create(&contract::entry("ef56")).unwrap());
        assert!(q.lookup("ef56").unwrap().is_none());
    }

    #[test]
    fn stale_locks_are_reclaimed() {
        let dir = TempDir::new().unwrap();
        let q = FsQueue::new(dir.path().join("queue"), Duration::ZERO);
        q.create(&contract::entry("cd34")).unwrap();
        std::fs::write(dir.path().join("queue/cd34.lock"), "").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(q.transition("cd34", QueueStatus::Passed, None).unwrap());
    }

    #[test]
    fn recover_stale_locks_counts_removed() {
        let dir = TempDir::new().unwrap();
        let q = FsQueue::new(dir.path().join("queue"), Duration::ZERO);
        std::fs::create_dir_all(q.dir()).unwrap();
        std::fs::write(q.dir().join("aa.lock"), "").unwrap();
        std::fs::write(q.dir().join("bb.lock"), "").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(q.recover_stale_locks().unwrap(), 2);
    }

    #[test]
    fn opening_the_queue_clears_stale_locks() {
        let dir = TempDir::new().unwrap();
        let queue_dir = crate::paths::queue_dir(dir.path());
        std::fs::create_dir_all(&queue_dir).unwrap();
        std::fs::write(queue_dir.join("aa.lock"), "").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let mut config = crate::config::Config::default();
        config.queue.stale_lock_seconds = 0;
        crate::queue::open(dir.path(), &config).unwrap();
        assert!(!queue_dir.join("aa.lock").exists());
    }

    #[test]
    fn transition_survives_concurrent_lookups() {
        let dir = TempDir::new().unwrap();
        let q = store(dir.path());
        let hashes: Vec<String> = (0..40).map(|i| format!("c{i:03}")).collect();
        for h in &hashes {
            q.create(&contract::entry(h)).unwrap();
        }

        std::thread::scope(|s| {
            let reader = s.spawn(|| {
                let q = store(dir.path());
                for _ in 0..20 {
                    for h in &hashes {
                        q.lookup(h).unwrap();
                    }
                }
            });
            for h in &hashes {
                assert!(q.transition(h, QueueStatus::Passed, None).unwrap());
            }
            reader.join().unwrap();
        });

        assert!(q.list().unwrap().iter().all(|e| e.status == QueueStatus::Passed));
    }

    #[test]
    fn terminal_record_wins_over_leftover_queued() {
        let dir = TempDir::new().unwrap();
        let q = store(dir.path());
        let mut entry = contract::entry("9a9a");
        q.create(&entry).unwrap();
        entry.settle(QueueStatus::Failed, None);
        std::fs::write(
            dir.path().join("queue/9a9a.failed.yaml"),
            serde_yaml::to_string(&entry).unwrap(),
        )
        .unwrap();

        assert_eq!(q.list().unwrap().len(), 1);
        assert_eq!(q.lookup("9a9a").unwrap().unwrap().status, QueueStatus::Failed);
        assert!(!dir.path().join("queue/9a9a.queued.yaml").exists());
    }

    #[test]
    fn concurrent_creates_converge() {
        let dir = TempDir::new().unwrap();
        let queue_dir = dir.path().join("queue");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let d = queue_dir.clone();
                std::thread::spawn(move || {
                    let q = FsQueue::new(d, Duration::from_secs(120));
                    q.create(&contract::entry("c0ffee")).unwrap()
                })
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|c| *c)
            .count();
        assert!(created <= 1);
        let q = FsQueue::new(queue_dir, Duration::from_secs(120));
        assert_eq!(q.list().unwrap().len(), 1);
    }
}

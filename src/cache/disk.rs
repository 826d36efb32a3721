//! Journaled, size-bounded disk LRU tier.
//!
//! Each entry is one file named by its disk key under the cache directory.
//! Writes go through an edit: bytes are staged in `<disk key>.tmp`, and only
//! a commit renames the staging file into place and records the entry in the
//! journal. An abort deletes the staging file and leaves the index untouched.
//!
//! Recency is updated on both read and commit. When the total size of the
//! committed files exceeds capacity, least-recently-used files are deleted
//! until it fits.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use lru::LruCache;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use super::journal::{self, Journal, JournalError, JournalRecord, JOURNAL_FILE};
use super::key::disk_key;

/// Rewrite the journal once this many records are redundant (and they
/// outnumber the live entries).
const COMPACT_THRESHOLD: usize = 2000;

const STAGING_SUFFIX: &str = ".tmp";

#[derive(Error, Debug)]
pub enum DiskCacheError {
    #[error("disk cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("an edit is already in progress for {0}")]
    EditInProgress(String),

    #[error("disk cache is closed")]
    Closed,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DiskStoreStats {
    pub total_reads: u64,
    pub total_hits: u64,
    pub total_writes: u64,
    pub total_aborts: u64,
    pub total_evictions: u64,
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
}

/// An open write to one entry. Finish it with [`DiskStore::commit`] or
/// [`DiskStore::abort`].
#[derive(Debug)]
pub struct Edit {
    key: String,
    staging: PathBuf,
}

impl Edit {
    /// Disk key being written.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Write the entry's bytes to the staging file.
    pub async fn write(&self, data: &[u8]) -> Result<(), DiskCacheError> {
        fs::write(&self.staging, data).await?;
        Ok(())
    }
}

pub struct DiskStore {
    dir: PathBuf,
    app_version: u32,
    capacity: u64,
    size: u64,
    /// Disk key → committed file length, least recently used first.
    entries: LruCache<String, u64>,
    editing: HashSet<String>,
    journal: Option<Journal>,
    redundant: usize,
    stats: DiskStoreStats,
}

impl DiskStore {
    /// Open (or create) the store under `dir`, recovering its index from the
    /// journal.
    ///
    /// A journal written for another app version, or one that cannot be
    /// parsed, invalidates the whole directory. Files the journal does not
    /// account for (staging files of interrupted writes, orphans) are deleted.
    pub async fn open(dir: &Path, app_version: u32, capacity: u64) -> Result<Self, DiskCacheError> {
        fs::create_dir_all(dir).await?;

        let replay = match fs::read_to_string(dir.join(JOURNAL_FILE)).await {
            Ok(text) => match journal::replay(&text, app_version) {
                Ok(replay) => Some(replay),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Discarding disk cache contents");
                    wipe(dir).await?;
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut entries: LruCache<String, u64> = LruCache::unbounded();
        let mut redundant = 0;
        if let Some(replay) = replay {
            redundant = replay.redundant;
            let dirty: HashSet<String> = replay.dirty.into_iter().collect();
            for (key, _) in replay.entries {
                if dirty.contains(&key) {
                    continue;
                }
                match fs::metadata(dir.join(&key)).await {
                    Ok(meta) if meta.is_file() => {
                        entries.put(key, meta.len());
                    }
                    _ => debug!(key = %key, "Dropping index entry without a file"),
                }
            }
        }

        sweep(dir, &entries).await?;

        let size: u64 = entries.iter().map(|(_, len)| *len).sum();
        let journal = Journal::create(dir, app_version, entries.iter().rev()).await?;

        let mut store = Self {
            dir: dir.to_path_buf(),
            app_version,
            capacity,
            size,
            entries,
            editing: HashSet::new(),
            journal: Some(journal),
            redundant,
            stats: DiskStoreStats::default(),
        };
        store.trim_to_size().await?;

        info!(
            dir = %store.dir.display(),
            entries = store.entries.len(),
            size = store.size,
            capacity,
            "Opened disk cache"
        );
        Ok(store)
    }

    /// Read an entry's bytes and mark it most recently used.
    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, DiskCacheError> {
        self.ensure_open()?;
        let dk = disk_key(key);
        self.stats.total_reads += 1;
        if self.entries.get(&dk).is_none() {
            return Ok(None);
        }

        let data = match fs::read(self.dir.join(&dk)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(key = %key, "Disk cache file vanished");
                if let Some(len) = self.entries.pop(&dk) {
                    self.size -= len;
                }
                self.append(JournalRecord::Remove { key: dk }).await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        self.stats.total_hits += 1;
        self.stats.total_bytes_read += data.len() as u64;
        self.append(JournalRecord::Read { key: dk }).await?;
        self.redundant += 1;
        self.compact_if_needed().await?;
        Ok(Some(data))
    }

    /// Index-only membership check. Does not touch recency.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(&disk_key(key))
    }

    /// Start a write to `key`.
    pub async fn edit(&mut self, key: &str) -> Result<Edit, DiskCacheError> {
        self.ensure_open()?;
        let dk = disk_key(key);
        if !self.editing.insert(dk.clone()) {
            return Err(DiskCacheError::EditInProgress(key.to_string()));
        }
        if let Err(e) = self.append(JournalRecord::Dirty { key: dk.clone() }).await {
            self.editing.remove(&dk);
            return Err(e);
        }
        let staging = self.dir.join(format!("{dk}{STAGING_SUFFIX}"));
        Ok(Edit { key: dk, staging })
    }

    /// Make a staged write visible.
    pub async fn commit(&mut self, edit: Edit) -> Result<(), DiskCacheError> {
        let len = match self.publish(&edit).await {
            Ok(len) => len,
            Err(e) => {
                self.abort(edit).await;
                return Err(e);
            }
        };
        self.editing.remove(&edit.key);

        if let Some(old) = self.entries.put(edit.key.clone(), len) {
            self.size -= old;
            self.redundant += 1;
        }
        self.size += len;
        self.stats.total_writes += 1;
        self.stats.total_bytes_written += len;
        // The dirty record is now redundant.
        self.redundant += 1;
        self.append(JournalRecord::Clean {
            key: edit.key.clone(),
            len,
        })
        .await?;
        debug!(disk_key = %edit.key, bytes = len, "Committed disk cache entry");

        self.trim_to_size().await?;
        self.compact_if_needed().await
    }

    /// Discard a staged write. The index is left as it was.
    pub async fn abort(&mut self, edit: Edit) {
        self.editing.remove(&edit.key);
        self.stats.total_aborts += 1;
        if let Err(e) = fs::remove_file(&edit.staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %edit.staging.display(), error = %e, "Failed to delete staging file");
            }
        }
        let record = match self.entries.peek(&edit.key) {
            Some(len) => JournalRecord::Clean {
                key: edit.key.clone(),
                len: *len,
            },
            None => JournalRecord::Remove {
                key: edit.key.clone(),
            },
        };
        self.redundant += 2;
        if let Err(e) = self.append(record).await {
            warn!(disk_key = %edit.key, error = %e, "Failed to journal aborted edit");
        }
        debug!(disk_key = %edit.key, "Aborted disk cache edit");
    }

    /// Delete an entry. Returns whether it existed.
    pub async fn remove(&mut self, key: &str) -> Result<bool, DiskCacheError> {
        self.ensure_open()?;
        let dk = disk_key(key);
        let Some(len) = self.entries.pop(&dk) else {
            return Ok(false);
        };
        self.size -= len;
        remove_if_exists(&self.dir.join(&dk)).await?;
        self.append(JournalRecord::Remove { key: dk }).await?;
        self.redundant += 2;
        Ok(true)
    }

    /// Evict least-recently-used entries until the total size fits.
    pub async fn trim_to_size(&mut self) -> Result<(), DiskCacheError> {
        while self.size > self.capacity {
            let Some((dk, len)) = self.entries.pop_lru() else {
                break;
            };
            self.size -= len;
            self.stats.total_evictions += 1;
            remove_if_exists(&self.dir.join(&dk)).await?;
            self.append(JournalRecord::Remove { key: dk.clone() }).await?;
            self.redundant += 2;
            debug!(disk_key = %dk, bytes = len, "Evicted from disk tier");
        }
        Ok(())
    }

    /// Persist a compact journal and stop accepting operations.
    pub async fn close(&mut self) -> Result<(), DiskCacheError> {
        if self.journal.is_none() {
            return Ok(());
        }
        self.rebuild_journal().await?;
        if let Some(mut journal) = self.journal.take() {
            journal.sync().await?;
        }
        info!(dir = %self.dir.display(), entries = self.entries.len(), size = self.size, "Closed disk cache");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.journal.is_none()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stats(&self) -> &DiskStoreStats {
        &self.stats
    }

    fn ensure_open(&self) -> Result<(), DiskCacheError> {
        if self.journal.is_none() {
            return Err(DiskCacheError::Closed);
        }
        Ok(())
    }

    async fn publish(&self, edit: &Edit) -> Result<u64, DiskCacheError> {
        let len = fs::metadata(&edit.staging).await?.len();
        fs::rename(&edit.staging, self.dir.join(&edit.key)).await?;
        Ok(len)
    }

    async fn append(&mut self, record: JournalRecord) -> Result<(), DiskCacheError> {
        let journal = self.journal.as_mut().ok_or(DiskCacheError::Closed)?;
        journal.append(&record).await?;
        Ok(())
    }

    async fn compact_if_needed(&mut self) -> Result<(), DiskCacheError> {
        if self.redundant >= COMPACT_THRESHOLD && self.redundant >= self.entries.len() {
            self.rebuild_journal().await?;
        }
        Ok(())
    }

    async fn rebuild_journal(&mut self) -> Result<(), DiskCacheError> {
        let journal = Journal::create(&self.dir, self.app_version, self.entries.iter().rev()).await?;
        self.journal = Some(journal);
        self.redundant = 0;
        // Writes still in flight must survive a replay of the new journal.
        let editing: Vec<String> = self.editing.iter().cloned().collect();
        for key in editing {
            self.append(JournalRecord::Dirty { key }).await?;
        }
        Ok(())
    }
}

/// Delete everything under `dir` and recreate it empty.
async fn wipe(dir: &Path) -> Result<(), DiskCacheError> {
    fs::remove_dir_all(dir).await?;
    fs::create_dir_all(dir).await?;
    Ok(())
}

/// Delete files that are neither the journal nor a live entry.
async fn sweep(dir: &Path, entries: &LruCache<String, u64>) -> Result<(), DiskCacheError> {
    let mut listing = fs::read_dir(dir).await?;
    while let Some(entry) = listing.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == JOURNAL_FILE || entries.contains(&name) {
            continue;
        }
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        debug!(path = %path.display(), "Removed stray disk cache file");
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), DiskCacheError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn put(store: &mut DiskStore, key: &str, data: &[u8]) {
        let edit = store.edit(key).await.unwrap();
        edit.write(data).await.unwrap();
        store.commit(edit).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiskStore::open(dir.path(), 1, 1024).await.unwrap();

        put(&mut store, "http://x/a.png", b"hello").await;
        assert!(store.contains("http://x/a.png"));
        assert_eq!(store.size(), 5);
        assert_eq!(
            store.get("http://x/a.png").await.unwrap().as_deref(),
            Some(&b"hello"[..])
        );
        assert_eq!(store.get("http://x/b.png").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_abort_leaves_index_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiskStore::open(dir.path(), 1, 1024).await.unwrap();

        let edit = store.edit("k").await.unwrap();
        edit.write(b"partial").await.unwrap();
        store.abort(edit).await;

        assert!(!store.contains("k"));
        assert_eq!(store.size(), 0);
        assert!(!dir.path().join(format!("{}.tmp", disk_key("k"))).exists());
    }

    #[tokio::test]
    async fn test_second_edit_of_same_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiskStore::open(dir.path(), 1, 1024).await.unwrap();

        let first = store.edit("k").await.unwrap();
        assert!(matches!(
            store.edit("k").await,
            Err(DiskCacheError::EditInProgress(_))
        ));
        store.abort(first).await;
        assert!(store.edit("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_filenames_are_disk_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiskStore::open(dir.path(), 1, 1024).await.unwrap();
        put(&mut store, "http://x/../../escape", b"x").await;

        assert!(dir.path().join(disk_key("http://x/../../escape")).is_file());
    }

    #[tokio::test]
    async fn test_interrupted_write_is_cleaned_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = DiskStore::open(dir.path(), 1, 1024).await.unwrap();
            put(&mut store, "kept", b"kept").await;
            let edit = store.edit("lost").await.unwrap();
            edit.write(b"half").await.unwrap();
            // Dropped without commit or abort, as in a crash.
        }

        let store = DiskStore::open(dir.path(), 1, 1024).await.unwrap();
        assert!(store.contains("kept"));
        assert!(!store.contains("lost"));
        assert!(!dir.path().join(format!("{}.tmp", disk_key("lost"))).exists());
    }

    #[tokio::test]
    async fn test_closed_store_refuses_operations() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiskStore::open(dir.path(), 1, 1024).await.unwrap();
        store.close().await.unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.get("k").await, Err(DiskCacheError::Closed)));
        assert!(matches!(store.edit("k").await, Err(DiskCacheError::Closed)));
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiskStore::open(dir.path(), 1, 1024).await.unwrap();
        put(&mut store, "k", b"abc").await;
        assert!(store.remove("k").await.unwrap());
        assert!(!store.remove("k").await.unwrap());
        assert_eq!(store.size(), 0);
    }
}

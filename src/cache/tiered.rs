//! Two-tier image cache: memory LRU over disk LRU.
//!
//! Reads check memory first, then disk. A disk hit is decoded and returned
//! but not promoted into memory; the caller decides. Writes go to each tier
//! independently and only when the key is absent from that tier.
//!
//! The disk tier opens in the background. Disk operations issued before it
//! is ready wait for the init signal. If opening fails, the disk tier stays
//! disabled for the life of this cache and every disk operation is a no-op.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::disk::{DiskStore, DiskStoreStats};
use super::memory::MemoryCache;
use crate::config::CacheConfig;
use crate::executor::TaskExecutor;
use crate::transfer::codec::{Bitmap, ImageCodec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiskState {
    Initializing,
    Ready,
    Disabled,
}

struct DiskTier {
    root: PathBuf,
    app_version: u32,
    capacity: u64,
    store: Mutex<Option<DiskStore>>,
    state: watch::Sender<DiskState>,
}

impl DiskTier {
    fn new(config: &CacheConfig) -> Self {
        let (state, _) = watch::channel(DiskState::Initializing);
        Self {
            root: config.disk_cache_root(),
            app_version: config.app_version,
            capacity: config.disk_cache_capacity_bytes,
            store: Mutex::new(None),
            state,
        }
    }

    async fn init(&self) {
        match DiskStore::open(&self.root, self.app_version, self.capacity).await {
            Ok(store) => {
                *self.store.lock().await = Some(store);
                self.state.send_replace(DiskState::Ready);
            }
            Err(e) => {
                error!(
                    dir = %self.root.display(),
                    error = %e,
                    "Disk cache init failed, continuing memory-only"
                );
                self.state.send_replace(DiskState::Disabled);
            }
        }
    }

    /// Wait for init; `true` if the tier is usable.
    async fn ready(&self) -> bool {
        let mut rx = self.state.subscribe();
        let ready = match rx.wait_for(|state| *state != DiskState::Initializing).await {
            Ok(state) => *state == DiskState::Ready,
            Err(_) => false,
        };
        ready
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_cost: usize,
    pub memory_capacity: usize,
    pub memory_evictions: u64,
    pub disk_enabled: bool,
    pub disk_entries: usize,
    pub disk_size: u64,
    pub disk_capacity: u64,
    pub disk: DiskStoreStats,
}

pub struct ImageCache {
    memory: Option<MemoryCache<Bitmap>>,
    disk: Option<Arc<DiskTier>>,
    codec: Arc<dyn ImageCodec>,
    closed: AtomicBool,
}

impl ImageCache {
    /// Build the cache and open the disk tier on `executor`.
    pub fn new(config: &CacheConfig, codec: Arc<dyn ImageCodec>, executor: &dyn TaskExecutor) -> Self {
        let cache = Self::unopened(config, codec);
        if let Some(disk) = &cache.disk {
            let disk = disk.clone();
            executor.execute_runnable(Box::pin(async move { disk.init().await }));
        }
        cache
    }

    /// Build the cache and open the disk tier before returning.
    pub async fn open(config: &CacheConfig, codec: Arc<dyn ImageCodec>) -> Self {
        let cache = Self::unopened(config, codec);
        if let Some(disk) = &cache.disk {
            disk.init().await;
        }
        cache
    }

    fn unopened(config: &CacheConfig, codec: Arc<dyn ImageCodec>) -> Self {
        let memory = config
            .enable_memory_cache
            .then(|| MemoryCache::new(config.memory_cache_capacity_bytes));
        let disk = match config.validate_namespace() {
            Ok(()) => config
                .enable_disk_cache
                .then(|| Arc::new(DiskTier::new(config))),
            Err(e) => {
                error!(error = %e, "Refusing disk cache root, continuing memory-only");
                None
            }
        };
        info!(
            memory = memory.is_some(),
            disk = disk.is_some(),
            "Created image cache"
        );
        Self {
            memory,
            disk,
            codec,
            closed: AtomicBool::new(false),
        }
    }

    pub fn get_from_memory(&self, key: &str) -> Option<Bitmap> {
        self.memory.as_ref()?.get(key)
    }

    /// Read and decode a disk entry. Waits for disk init.
    pub async fn get_from_disk(&self, key: &str) -> Option<Bitmap> {
        let disk = self.disk.as_ref()?;
        if !disk.ready().await {
            return None;
        }
        let bytes = {
            let mut guard = disk.store.lock().await;
            let store = guard.as_mut()?;
            match store.get(key).await {
                Ok(bytes) => bytes?,
                Err(e) => {
                    warn!(key = %key, error = %e, "Disk cache read failed");
                    return None;
                }
            }
        };

        let codec = self.codec.clone();
        match tokio::task::spawn_blocking(move || codec.decode(&bytes)).await {
            Ok(Some(bitmap)) => {
                debug!(key = %key, "Disk cache hit");
                Some(bitmap)
            }
            Ok(None) => {
                warn!(key = %key, "Disk cache entry does not decode");
                None
            }
            Err(e) => {
                error!(key = %key, error = %e, "Decode worker failed");
                None
            }
        }
    }

    /// Memory, then disk. A disk hit is not promoted.
    pub async fn get(&self, key: &str) -> Option<Bitmap> {
        if let Some(bitmap) = self.get_from_memory(key) {
            return Some(bitmap);
        }
        self.get_from_disk(key).await
    }

    /// Write-through to both tiers, each only if `key` is absent there.
    /// Disk write failures are logged and leave the disk tier unchanged.
    pub async fn put(&self, key: &str, bitmap: &Bitmap) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(key = %key, "Cache closed, dropping write");
            return;
        }
        if let Some(memory) = &self.memory {
            if memory.insert_if_absent(key, bitmap.clone()) {
                debug!(key = %key, cost = bitmap.byte_size(), "Stored in memory tier");
            }
        }
        if let Some(disk) = &self.disk {
            self.put_disk(disk, key, bitmap).await;
        }
    }

    async fn put_disk(&self, disk: &DiskTier, key: &str, bitmap: &Bitmap) {
        if !disk.ready().await {
            return;
        }
        {
            let guard = disk.store.lock().await;
            match guard.as_ref() {
                Some(store) if !store.contains(key) => {}
                _ => return,
            }
        }

        let codec = self.codec.clone();
        let source = bitmap.clone();
        let encoded = match tokio::task::spawn_blocking(move || codec.encode(&source)).await {
            Ok(Some(encoded)) => encoded,
            Ok(None) => {
                warn!(key = %key, "Bitmap does not encode, skipping disk write");
                return;
            }
            Err(e) => {
                error!(key = %key, error = %e, "Encode worker failed");
                return;
            }
        };

        let mut guard = disk.store.lock().await;
        let Some(store) = guard.as_mut() else {
            return;
        };
        if store.contains(key) {
            return;
        }
        let edit = match store.edit(key).await {
            Ok(edit) => edit,
            Err(e) => {
                debug!(key = %key, error = %e, "Skipping disk write");
                return;
            }
        };
        if let Err(e) = edit.write(&encoded).await {
            warn!(key = %key, error = %e, "Disk write failed, aborting edit");
            store.abort(edit).await;
            return;
        }
        if let Err(e) = store.commit(edit).await {
            warn!(key = %key, error = %e, "Disk commit failed");
        }
    }

    /// Memory membership, then an index-only disk check.
    pub async fn contains(&self, key: &str) -> bool {
        if self.contains_in_memory(key) {
            return true;
        }
        let Some(disk) = &self.disk else {
            return false;
        };
        if !disk.ready().await {
            return false;
        }
        let guard = disk.store.lock().await;
        guard.as_ref().is_some_and(|store| store.contains(key))
    }

    pub fn contains_in_memory(&self, key: &str) -> bool {
        self.memory.as_ref().is_some_and(|memory| memory.contains(key))
    }

    /// Whether the disk tier opened. Waits for init.
    pub async fn disk_ready(&self) -> bool {
        match &self.disk {
            Some(disk) => disk.ready().await,
            None => false,
        }
    }

    /// Evict the memory tier and close the disk tier.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(memory) = &self.memory {
            memory.evict_all();
        }
        let Some(disk) = &self.disk else {
            return;
        };
        if !disk.ready().await {
            return;
        }
        let mut guard = disk.store.lock().await;
        if let Some(mut store) = guard.take() {
            if let Err(e) = store.close().await {
                warn!(error = %e, "Disk cache close failed");
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        if let Some(memory) = &self.memory {
            stats.memory_entries = memory.len();
            stats.memory_cost = memory.cost();
            stats.memory_capacity = memory.capacity();
            stats.memory_evictions = memory.evictions();
        }
        if let Some(disk) = &self.disk {
            if *disk.state.borrow() == DiskState::Ready {
                let guard = disk.store.lock().await;
                if let Some(store) = guard.as_ref() {
                    stats.disk_enabled = true;
                    stats.disk_entries = store.len();
                    stats.disk_size = store.size();
                    stats.disk_capacity = store.capacity();
                    stats.disk = store.stats().clone();
                }
            }
        }
        stats
    }
}

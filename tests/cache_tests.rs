//! Integration tests for the two cache tiers.

use std::path::Path;
use std::sync::Arc;

use image::{Rgba, RgbaImage};

use image_cache_tier::cache::disk::DiskStore;
use image_cache_tier::cache::memory::MemoryCache;
use image_cache_tier::cache::ImageCache;
use image_cache_tier::config::CacheConfig;
use image_cache_tier::executor::serial::SerialExecutor;
use image_cache_tier::transfer::codec::PngCodec;
use image_cache_tier::Bitmap;

fn cache_config(dir: &Path) -> CacheConfig {
    CacheConfig {
        cache_dir: Some(dir.to_path_buf()),
        ..CacheConfig::default()
    }
}

fn gradient(w: u32, h: u32) -> Bitmap {
    Bitmap::new(RgbaImage::from_fn(w, h, |x, y| {
        Rgba([(x * 7) as u8, (y * 13) as u8, ((x + y) * 3) as u8, 255])
    }))
}

async fn put_bytes(store: &mut DiskStore, key: &str, len: usize) {
    let edit = store.edit(key).await.unwrap();
    edit.write(&vec![0xAB; len]).await.unwrap();
    store.commit(edit).await.unwrap();
}

#[tokio::test]
async fn test_put_then_get_from_memory() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ImageCache::open(&cache_config(dir.path()), Arc::new(PngCodec)).await;

    let keys: Vec<String> = (0..10).map(|i| format!("http://x/{i}.png")).collect();
    for (i, key) in keys.iter().enumerate() {
        cache.put(key, &gradient(8 + i as u32, 8)).await;
    }
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(cache.get_from_memory(key), Some(gradient(8 + i as u32, 8)));
    }
}

#[tokio::test]
async fn test_disk_entry_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = cache_config(dir.path());
    let original = gradient(32, 24);

    {
        let cache = ImageCache::open(&config, Arc::new(PngCodec)).await;
        cache.put("http://x/a.png", &original).await;
        cache.close().await;
    }

    let cache = ImageCache::open(&config, Arc::new(PngCodec)).await;
    assert!(cache.get_from_memory("http://x/a.png").is_none());
    assert_eq!(cache.get_from_disk("http://x/a.png").await, Some(original));
}

#[tokio::test]
async fn test_disk_entry_survives_restart_without_close() {
    let dir = tempfile::tempdir().unwrap();
    let config = cache_config(dir.path());
    let original = gradient(5, 5);

    {
        let cache = ImageCache::open(&config, Arc::new(PngCodec)).await;
        cache.put("http://x/a.png", &original).await;
    }

    let cache = ImageCache::open(&config, Arc::new(PngCodec)).await;
    assert_eq!(cache.get_from_disk("http://x/a.png").await, Some(original));
}

#[tokio::test]
async fn test_disk_capacity_evicts_least_recently_touched() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DiskStore::open(dir.path(), 1, 100).await.unwrap();

    put_bytes(&mut store, "e1", 40).await;
    put_bytes(&mut store, "e2", 40).await;
    put_bytes(&mut store, "e3", 40).await;

    assert!(!store.contains("e1"));
    assert!(store.contains("e2"));
    assert!(store.contains("e3"));
    assert_eq!(store.size(), 80);
    assert!(store.size() <= store.capacity());
}

#[tokio::test]
async fn test_disk_read_protects_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DiskStore::open(dir.path(), 1, 100).await.unwrap();

    put_bytes(&mut store, "e1", 40).await;
    put_bytes(&mut store, "e2", 40).await;
    assert!(store.get("e1").await.unwrap().is_some());
    put_bytes(&mut store, "e3", 40).await;

    assert!(store.contains("e1"));
    assert!(!store.contains("e2"));
}

#[tokio::test]
async fn test_disk_lru_order_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = DiskStore::open(dir.path(), 1, 100).await.unwrap();
        put_bytes(&mut store, "e1", 40).await;
        put_bytes(&mut store, "e2", 40).await;
        store.get("e1").await.unwrap();
        store.close().await.unwrap();
    }

    let mut store = DiskStore::open(dir.path(), 1, 100).await.unwrap();
    put_bytes(&mut store, "e3", 40).await;
    assert!(store.contains("e1"));
    assert!(!store.contains("e2"));
}

#[test]
fn test_memory_lru_order() {
    let cache: MemoryCache<Bitmap> = MemoryCache::new(3 * 4 * 4 * 4);
    let (e1, e2, e3, e4) = (gradient(4, 4), gradient(4, 4), gradient(4, 4), gradient(4, 4));

    cache.insert("e1", e1);
    cache.insert("e2", e2);
    cache.insert("e3", e3);
    assert!(cache.get("e1").is_some());
    cache.insert("e4", e4);

    assert!(cache.contains("e1"));
    assert!(!cache.contains("e2"));
    assert!(cache.contains("e3"));
    assert!(cache.contains("e4"));
}

#[tokio::test]
async fn test_two_tier_put_on_existing_key_keeps_recency() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = cache_config(dir.path());
    config.enable_disk_cache = false;
    // Room for two 4x4 bitmaps.
    config.memory_cache_capacity_bytes = 2 * 4 * 4 * 4;
    let cache = ImageCache::open(&config, Arc::new(PngCodec)).await;

    cache.put("a", &gradient(4, 4)).await;
    cache.put("b", &gradient(4, 4)).await;
    // Re-put of "a" is a no-op: "a" stays least recently used.
    cache.put("a", &gradient(4, 4)).await;
    cache.put("c", &gradient(4, 4)).await;

    assert!(!cache.contains_in_memory("a"));
    assert!(cache.contains_in_memory("b"));
    assert!(cache.contains_in_memory("c"));
}

#[tokio::test]
async fn test_contains_checks_index_only() {
    let dir = tempfile::tempdir().unwrap();
    let config = cache_config(dir.path());
    {
        let cache = ImageCache::open(&config, Arc::new(PngCodec)).await;
        cache.put("http://x/a.png", &gradient(4, 4)).await;
        cache.close().await;
    }

    let cache = ImageCache::open(&config, Arc::new(PngCodec)).await;
    assert!(cache.contains("http://x/a.png").await);
    assert!(!cache.contains("http://x/b.png").await);
    let stats = cache.stats().await;
    assert_eq!(stats.disk.total_reads, 0);
    assert_eq!(stats.disk_entries, 1);
}

#[tokio::test]
async fn test_failed_disk_write_leaves_tier_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = cache_config(dir.path());
    config.enable_memory_cache = false;
    let disk_only = ImageCache::open(&config, Arc::new(PngCodec)).await;
    disk_only.put("http://x/kept.png", &gradient(4, 4)).await;
    let before = disk_only.stats().await;
    assert_eq!(before.disk_entries, 1);

    // Pull the directory out from under the open store.
    std::fs::remove_dir_all(config.disk_cache_root()).unwrap();
    disk_only.put("http://x/a.png", &gradient(6, 6)).await;

    let after = disk_only.stats().await;
    assert!(!disk_only.contains("http://x/a.png").await);
    assert_eq!(after.disk_entries, before.disk_entries);
    assert_eq!(after.disk_size, before.disk_size);
    assert_eq!(after.disk.total_writes, before.disk.total_writes);
    assert_eq!(after.disk.total_aborts, 1);
}

#[tokio::test]
async fn test_failed_disk_write_keeps_memory_entry() {
    let dir = tempfile::tempdir().unwrap();
    let config = cache_config(dir.path());
    let cache = ImageCache::open(&config, Arc::new(PngCodec)).await;
    std::fs::remove_dir_all(config.disk_cache_root()).unwrap();

    cache.put("http://x/a.png", &gradient(6, 6)).await;

    assert_eq!(cache.get_from_memory("http://x/a.png"), Some(gradient(6, 6)));
    let stats = cache.stats().await;
    assert_eq!(stats.disk_entries, 0);
    assert_eq!(stats.disk.total_aborts, 1);
}

#[tokio::test]
async fn test_app_version_change_invalidates_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = cache_config(dir.path());
    {
        let cache = ImageCache::open(&config, Arc::new(PngCodec)).await;
        cache.put("http://x/a.png", &gradient(4, 4)).await;
        cache.close().await;
    }

    config.app_version = 2;
    let cache = ImageCache::open(&config, Arc::new(PngCodec)).await;
    assert!(!cache.contains("http://x/a.png").await);
    assert!(cache.get_from_disk("http://x/a.png").await.is_none());
}

#[tokio::test]
async fn test_disk_init_failure_degrades_to_memory_only() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file where the cache root directory should be.
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();
    let config = cache_config(&blocker);

    let executor = SerialExecutor::new();
    let cache = ImageCache::new(&config, Arc::new(PngCodec), &executor);

    assert!(!cache.disk_ready().await);
    cache.put("http://x/a.png", &gradient(4, 4)).await;
    assert_eq!(cache.get("http://x/a.png").await, Some(gradient(4, 4)));
    assert!(cache.contains("http://x/a.png").await);
    assert!(!cache.stats().await.disk_enabled);
}

#[tokio::test]
async fn test_disk_operations_wait_for_background_init() {
    let dir = tempfile::tempdir().unwrap();
    let config = cache_config(dir.path());
    let executor = SerialExecutor::new();
    let cache = ImageCache::new(&config, Arc::new(PngCodec), &executor);

    // Issued before init has had a chance to run.
    cache.put("http://x/a.png", &gradient(4, 4)).await;
    assert!(cache.disk_ready().await);
    assert_eq!(
        cache.get_from_disk("http://x/a.png").await,
        Some(gradient(4, 4))
    );
}

//! The image loader.
//!
//! - [`consumer`]: `Consumer` contexts and the `ImageSink` they deliver to
//! - [`fetch`]: `FetchJob`, the task body run on a cache miss
//!
//! `ImageLoader::request` answers from the memory tier when it can. On a
//! miss it wraps a fetch task in a request and queues it behind the admission
//! gate; the result reaches the consumer on the loader's callback context.

pub mod consumer;
pub mod fetch;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::key::{cache_key, parse_key, KeyError};
use crate::cache::{CacheStats, ImageCache};
use crate::config::{Config, ConfigError};
use crate::executor::callback::CallbackContext;
use crate::executor::task::{Task, TaskOutcome, TaskStatus};
use crate::executor::{build_executor, TaskExecutor};
use crate::request::dispatcher::spawn_dispatcher;
use crate::request::queue::RequestQueue;
use crate::request::{Request, RequestId};
use crate::transfer::codec::{Bitmap, ImageCodec, PngCodec};
use crate::transfer::transport::{HttpTransport, Transport, TransportError};

pub use consumer::{ChannelSink, Consumer, Delivery, ImageSink};
pub use fetch::{FetchError, FetchJob, FetchStage};

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("loader is shut down")]
    ShutDown,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Which rendition of a source image is wanted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Variant {
    /// Rounded-corner radius; 0 means square corners.
    pub corner_radius: u32,
    /// Transparent margin around a rounded rendition.
    pub margin: u32,
}

impl Variant {
    pub fn rounded(corner_radius: u32, margin: u32) -> Self {
        Self {
            corner_radius,
            margin,
        }
    }
}

/// Target size for the decoded bitmap. A zero dimension means no scaling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeHint {
    pub width: u32,
    pub height: u32,
}

impl SizeHint {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_unbounded(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Result of [`ImageLoader::request`].
#[derive(Debug)]
pub enum LoadOutcome {
    /// Memory hit, answered synchronously.
    Ready(Bitmap),
    /// Fetch queued or already in progress.
    Pending(RequestHandle),
}

/// Handle to a queued or running fetch.
#[derive(Clone)]
pub struct RequestHandle {
    request: Request,
    task: Task<FetchJob>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.request.id()
    }

    /// Cache key of the rendition being fetched.
    pub fn key(&self) -> &str {
        self.task.job().cache_key()
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status()
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// Cancel the fetch and drop it from the queue if it has not started.
    pub fn cancel(&self) {
        self.request.cancel(true);
        if self.task.job().shared.queue.remove(&self.request) {
            debug!(request_id = %self.id(), "Removed cancelled request from queue");
        }
    }

    /// Wait for the fetch to finish.
    pub async fn outcome(&self) -> Result<Bitmap, FetchError> {
        match self.task.get().await {
            TaskOutcome::Completed(result) => result,
            TaskOutcome::Cancelled(_) => Err(FetchError::Cancelled),
            TaskOutcome::Faulted(e) => Err(FetchError::Fault(e.to_string())),
        }
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id())
            .field("key", &self.key())
            .field("status", &self.status())
            .finish()
    }
}

#[derive(Debug, Default)]
pub(crate) struct LoaderCounters {
    pub requests: AtomicU64,
    pub rejected: AtomicU64,
    pub memory_hits: AtomicU64,
    pub disk_hits: AtomicU64,
    pub fetches: AtomicU64,
    pub failures: AtomicU64,
    pub cancellations: AtomicU64,
    pub deliveries: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoaderStats {
    pub requests: u64,
    pub rejected: u64,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub fetches: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub deliveries: u64,
    pub queued: usize,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub cache: CacheStats,
}

/// State shared by the loader and its fetch jobs.
pub(crate) struct LoaderShared {
    pub cache: ImageCache,
    pub queue: Arc<RequestQueue>,
    pub transport: Arc<dyn Transport>,
    pub codec: Arc<dyn ImageCodec>,
    pub callbacks: CallbackContext,
    pub stats: LoaderCounters,
}

impl LoaderShared {
    /// The bitmap as the consumer sees it.
    pub fn rendition(&self, bitmap: &Bitmap, variant: Variant) -> Bitmap {
        if variant.corner_radius > 0 {
            self.codec
                .rounded(bitmap, variant.corner_radius, variant.margin)
        } else {
            bitmap.clone()
        }
    }
}

pub struct ImageLoader {
    shared: Arc<LoaderShared>,
    executor: Arc<dyn TaskExecutor>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    accepting: AtomicBool,
}

impl ImageLoader {
    /// Build a loader around injected collaborators. Must be called on a
    /// tokio runtime; the dispatcher and callback context are spawned here.
    pub fn new(
        config: &Config,
        executor: Arc<dyn TaskExecutor>,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn ImageCodec>,
    ) -> Result<Self, LoaderError> {
        config.validate()?;

        let cache = ImageCache::new(&config.cache, codec.clone(), executor.as_ref());
        let queue = Arc::new(RequestQueue::new(config.queue.max_in_flight));
        let dispatcher = spawn_dispatcher(queue.clone());

        info!(
            executor = ?executor.kind(),
            max_in_flight = queue.max_in_flight(),
            "Image loader started"
        );

        Ok(Self {
            shared: Arc::new(LoaderShared {
                cache,
                queue,
                transport,
                codec,
                callbacks: CallbackContext::spawn(),
                stats: LoaderCounters::default(),
            }),
            executor,
            dispatcher: Mutex::new(Some(dispatcher)),
            accepting: AtomicBool::new(true),
        })
    }

    /// Build a loader with the configured executor, HTTP transport and PNG codec.
    pub fn from_config(config: &Config) -> Result<Self, LoaderError> {
        let executor = build_executor(&config.executor);
        let transport = Arc::new(HttpTransport::new(&config.transport)?);
        Self::new(config, executor, transport, Arc::new(PngCodec))
    }

    /// Request the rendition of `key` described by `variant`, scaled to `size`.
    ///
    /// A memory hit is returned as [`LoadOutcome::Ready`] and, when a consumer
    /// is given, delivered to its sink before this call returns. A miss queues
    /// a fetch. Binding a consumer to a new key cancels the request it was
    /// waiting for; re-requesting the key it is already waiting for reuses
    /// that request.
    pub fn request(
        &self,
        key: &str,
        variant: Variant,
        size: SizeHint,
        consumer: Option<&Arc<Consumer>>,
    ) -> Result<LoadOutcome, LoaderError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(LoaderError::ShutDown);
        }
        let shared = &self.shared;
        let url = parse_key(key).map_err(|e| {
            shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, error = %e, "Rejected request");
            e
        })?;
        shared.stats.requests.fetch_add(1, Ordering::Relaxed);
        let cache_key = cache_key(key, variant.corner_radius);

        if let Some(bitmap) = shared.cache.get_from_memory(&cache_key) {
            shared.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %cache_key, "Memory cache hit");
            let rendition = shared.rendition(&bitmap, variant);
            if let Some(consumer) = consumer {
                if let Some(stale) = consumer.take_binding() {
                    self.supersede(&stale);
                }
                shared.stats.deliveries.fetch_add(1, Ordering::Relaxed);
                consumer.sink().on_success(rendition.clone());
            }
            return Ok(LoadOutcome::Ready(rendition));
        }

        if let Some(consumer) = consumer {
            if let Some(current) = consumer.current() {
                if current.key() == cache_key && !current.is_cancelled() {
                    debug!(request_id = %current.id(), key = %cache_key, "Reusing pending request");
                    return Ok(LoadOutcome::Pending(current));
                }
                consumer.release(current.id());
                self.supersede(&current);
            }
        }

        let id = RequestId::new();
        let job = FetchJob {
            request_id: id,
            url,
            cache_key: cache_key.clone(),
            size,
            variant,
            consumer: consumer.map(Arc::downgrade),
            shared: shared.clone(),
        };
        let task = Task::new(job, shared.callbacks.clone());
        let request = Request::new(
            id,
            key,
            Arc::new(task.clone()),
            self.executor.clone(),
        );
        let handle = RequestHandle {
            request: request.clone(),
            task,
        };

        if let Some(consumer) = consumer {
            consumer.bind(handle.clone());
        }
        if !shared.queue.put(request) {
            handle.cancel();
            if let Some(consumer) = consumer {
                consumer.release(handle.id());
            }
            return Err(LoaderError::ShutDown);
        }
        debug!(request_id = %id, key = %cache_key, queued = shared.queue.queued_len(), "Queued fetch");
        Ok(LoadOutcome::Pending(handle))
    }

    /// Cancel whatever `consumer` is waiting for. Returns whether anything
    /// was pending.
    pub fn cancel(&self, consumer: &Consumer) -> bool {
        match consumer.take_binding() {
            Some(handle) => {
                self.supersede(&handle);
                true
            }
            None => false,
        }
    }

    fn supersede(&self, stale: &RequestHandle) {
        debug!(request_id = %stale.id(), key = %stale.key(), "Cancelling superseded request");
        stale.cancel();
    }

    /// Memory, then disk membership of a rendition.
    pub async fn contains(&self, key: &str, variant: Variant) -> bool {
        self.shared
            .cache
            .contains(&cache_key(key, variant.corner_radius))
            .await
    }

    pub fn cache(&self) -> &ImageCache {
        &self.shared.cache
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.shared.queue
    }

    pub fn executor(&self) -> &Arc<dyn TaskExecutor> {
        &self.executor
    }

    /// Wait until every callback posted so far has run.
    pub async fn flush_callbacks(&self) {
        self.shared.callbacks.flush().await;
    }

    pub async fn stats(&self) -> LoaderStats {
        let counters = &self.shared.stats;
        let queue = &self.shared.queue;
        LoaderStats {
            requests: counters.requests.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            memory_hits: counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: counters.disk_hits.load(Ordering::Relaxed),
            fetches: counters.fetches.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            cancellations: counters.cancellations.load(Ordering::Relaxed),
            deliveries: counters.deliveries.load(Ordering::Relaxed),
            queued: queue.queued_len(),
            in_flight: queue.in_flight(),
            max_in_flight: queue.max_in_flight(),
            cache: self.shared.cache.stats().await,
        }
    }

    /// Stop accepting requests, drop queued ones, stop the dispatcher and
    /// close the cache. The executor belongs to the caller and keeps running.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down image loader");

        let queue = &self.shared.queue;
        queue.close();
        for request in queue.remove_all() {
            request.cancel(false);
        }

        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                warn!(error = %e, "Dispatcher ended abnormally");
            }
        }

        self.shared.cache.close().await;
        self.shared.callbacks.flush().await;
        info!("Image loader stopped");
    }
}

impl Drop for ImageLoader {
    fn drop(&mut self) {
        // Lets the dispatcher exit if shutdown was never awaited.
        self.shared.queue.close();
    }
}

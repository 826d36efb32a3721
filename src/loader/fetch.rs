//! The fetch job: disk tier, then network, then decode, scale and store.
//!
//! The body checks for cancellation before the disk lookup, before the network
//! read, before decoding and before the cache write. The first three also
//! stop a fetch whose consumer was dropped or rebound. Completion handlers
//! run on the loader's callback context; each one releases the request's
//! admission slot before anything else.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace, warn};
use url::Url;

use super::consumer::Consumer;
use super::{LoaderShared, SizeHint, Variant};
use crate::executor::task::{Job, TaskContext, TaskError};
use crate::request::RequestId;
use crate::transfer::codec::{Bitmap, ImageCodec};
use crate::transfer::transport::TransportError;

/// Status reported to consumers for failures without an HTTP status.
pub const FAILURE_STATUS: u16 = 500;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{url} did not decode to an image")]
    Decode { url: String },

    #[error("failure on retrieval of the bitmap: {0}")]
    Fault(String),

    #[error("request was cancelled")]
    Cancelled,
}

impl FetchError {
    /// Status delivered to `ImageSink::on_failure`.
    pub fn status(&self) -> u16 {
        match self {
            FetchError::Transport(e) => e.status_code().unwrap_or(FAILURE_STATUS),
            _ => FAILURE_STATUS,
        }
    }
}

/// Stages a fetch reports through progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStage {
    DiskLookup,
    Fetching,
    Decoding,
    Storing,
}

pub struct FetchJob {
    pub(crate) request_id: RequestId,
    pub(crate) url: Url,
    pub(crate) cache_key: String,
    pub(crate) size: SizeHint,
    pub(crate) variant: Variant,
    pub(crate) consumer: Option<Weak<Consumer>>,
    pub(crate) shared: Arc<LoaderShared>,
}

impl FetchJob {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// The consumer, if it is alive and still waiting for this request.
    fn bound_consumer(&self) -> Option<Arc<Consumer>> {
        let consumer = self.consumer.as_ref()?.upgrade()?;
        consumer.is_bound_to(self.request_id).then_some(consumer)
    }

    /// The consumer was dropped or moved on to another request.
    fn abandoned(&self) -> bool {
        self.consumer.is_some() && self.bound_consumer().is_none()
    }

    fn checkpoint(&self, ctx: &TaskContext<Self>, stage: &str) -> Result<(), FetchError> {
        if ctx.is_cancelled() {
            debug!(request_id = %self.request_id, key = %self.cache_key, stage, "Fetch cancelled");
            return Err(FetchError::Cancelled);
        }
        if self.abandoned() {
            debug!(request_id = %self.request_id, key = %self.cache_key, stage, "Fetch abandoned by its consumer");
            return Err(FetchError::Cancelled);
        }
        Ok(())
    }

    fn deliver(&self, result: &Result<Bitmap, FetchError>) {
        let Some(weak) = &self.consumer else {
            return;
        };
        let Some(consumer) = weak.upgrade() else {
            debug!(request_id = %self.request_id, "Consumer gone, dropping result");
            return;
        };
        if !consumer.release(self.request_id) {
            debug!(request_id = %self.request_id, "Consumer superseded, dropping result");
            return;
        }

        self.shared.stats.deliveries.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(bitmap) => {
                let rendition = self.shared.rendition(bitmap, self.variant);
                consumer.sink().on_success(rendition);
            }
            Err(e) => consumer.sink().on_failure(e.status(), &e.to_string()),
        }
    }
}

#[async_trait]
impl Job for FetchJob {
    type Input = String;
    type Progress = FetchStage;
    type Output = Result<Bitmap, FetchError>;

    async fn run(&self, key: String, ctx: &TaskContext<Self>) -> Result<Bitmap, FetchError> {
        let shared = &self.shared;
        debug!(request_id = %self.request_id, key = %key, "Fetch started");

        self.checkpoint(ctx, "disk")?;
        ctx.publish_progress(FetchStage::DiskLookup);
        if let Some(bitmap) = shared.cache.get_from_disk(&self.cache_key).await {
            shared.stats.disk_hits.fetch_add(1, Ordering::Relaxed);
            // Promote into memory; the disk entry is already present.
            shared.cache.put(&self.cache_key, &bitmap).await;
            return Ok(bitmap);
        }

        self.checkpoint(ctx, "network")?;
        ctx.publish_progress(FetchStage::Fetching);
        shared.stats.fetches.fetch_add(1, Ordering::Relaxed);
        let bytes = shared.transport.open_stream(&self.url).await?;

        self.checkpoint(ctx, "decode")?;
        ctx.publish_progress(FetchStage::Decoding);
        let codec = shared.codec.clone();
        let (size, radius) = (self.size, self.variant.corner_radius);
        let decoded = tokio::task::spawn_blocking(move || {
            decode_and_scale(codec.as_ref(), &bytes, size, radius)
        })
        .await
        .map_err(|e| FetchError::Fault(e.to_string()))?;
        let bitmap = decoded.ok_or_else(|| FetchError::Decode {
            url: self.url.to_string(),
        })?;

        if ctx.is_cancelled() {
            debug!(request_id = %self.request_id, "Fetch cancelled before cache write");
            return Ok(bitmap);
        }
        ctx.publish_progress(FetchStage::Storing);
        shared.cache.put(&self.cache_key, &bitmap).await;
        Ok(bitmap)
    }

    fn on_success(&self, output: &Result<Bitmap, FetchError>) {
        self.shared.queue.notify_complete(self.request_id);
        match output {
            Ok(bitmap) => debug!(
                request_id = %self.request_id,
                key = %self.cache_key,
                width = bitmap.width(),
                height = bitmap.height(),
                "Fetch finished"
            ),
            Err(FetchError::Cancelled) => {
                self.shared.stats.cancellations.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.shared.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(request_id = %self.request_id, key = %self.cache_key, error = %e, "Fetch failed");
            }
        }
        self.deliver(output);
    }

    fn on_cancelled(&self, partial: Option<&Result<Bitmap, FetchError>>) {
        self.shared.queue.notify_complete(self.request_id);
        self.shared.stats.cancellations.fetch_add(1, Ordering::Relaxed);
        debug!(
            request_id = %self.request_id,
            key = %self.cache_key,
            discarded = partial.is_some_and(|r| r.is_ok()),
            "Fetch cancelled"
        );
        if let Some(consumer) = self.consumer.as_ref().and_then(Weak::upgrade) {
            consumer.release(self.request_id);
        }
    }

    fn on_fault(&self, error: &TaskError) {
        self.shared.queue.notify_complete(self.request_id);
        self.shared.stats.failures.fetch_add(1, Ordering::Relaxed);
        warn!(request_id = %self.request_id, key = %self.cache_key, error = %error, "Fetch faulted");
        self.deliver(&Err(FetchError::Fault(error.to_string())));
    }

    fn on_progress(&self, stage: FetchStage) {
        trace!(request_id = %self.request_id, stage = ?stage, "Fetch progress");
    }
}

fn decode_and_scale(
    codec: &dyn ImageCodec,
    bytes: &[u8],
    size: SizeHint,
    corner_radius: u32,
) -> Option<Bitmap> {
    let bitmap = codec.decode(bytes)?;
    if size.is_unbounded() {
        return Some(bitmap);
    }
    Some(if corner_radius > 0 {
        codec.scale_exact(&bitmap, size.width, size.height)
    } else {
        codec.scale(&bitmap, size.width, size.height, true)
    })
}

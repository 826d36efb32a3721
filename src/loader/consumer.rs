//! Consumer contexts.
//!
//! A [`Consumer`] is the thing an image is destined for (a view, a widget,
//! a channel). It holds at most one pending request at a time. Fetch tasks
//! keep only a weak reference to it and deliver only if the consumer is
//! still alive and still bound to their request.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::RequestHandle;
use crate::request::RequestId;
use crate::transfer::codec::Bitmap;

/// Receives the final result of a consumer's request.
pub trait ImageSink: Send + Sync {
    fn on_success(&self, bitmap: Bitmap);
    fn on_failure(&self, status: u16, diagnostic: &str);
}

pub struct Consumer {
    sink: Box<dyn ImageSink>,
    binding: Mutex<Option<RequestHandle>>,
}

impl Consumer {
    pub fn new(sink: impl ImageSink + 'static) -> Arc<Self> {
        Arc::new(Self {
            sink: Box::new(sink),
            binding: Mutex::new(None),
        })
    }

    /// Cache key of the pending request, if any.
    pub fn pending_key(&self) -> Option<String> {
        self.binding
            .lock()
            .as_ref()
            .map(|handle| handle.key().to_string())
    }

    pub fn is_bound(&self) -> bool {
        self.binding.lock().is_some()
    }

    pub(crate) fn sink(&self) -> &dyn ImageSink {
        self.sink.as_ref()
    }

    pub(crate) fn current(&self) -> Option<RequestHandle> {
        self.binding.lock().clone()
    }

    /// Bind `handle`, returning the previous binding.
    pub(crate) fn bind(&self, handle: RequestHandle) -> Option<RequestHandle> {
        self.binding.lock().replace(handle)
    }

    pub(crate) fn take_binding(&self) -> Option<RequestHandle> {
        self.binding.lock().take()
    }

    /// Clear the binding if it still points at `id`.
    pub(crate) fn release(&self, id: RequestId) -> bool {
        let mut binding = self.binding.lock();
        if binding.as_ref().is_some_and(|handle| handle.id() == id) {
            *binding = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn is_bound_to(&self, id: RequestId) -> bool {
        self.binding
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.id() == id)
    }
}

/// What a [`ChannelSink`] forwards.
#[derive(Debug, Clone)]
pub enum Delivery {
    Success {
        tag: String,
        bitmap: Bitmap,
    },
    Failure {
        tag: String,
        status: u16,
        diagnostic: String,
    },
}

impl Delivery {
    pub fn tag(&self) -> &str {
        match self {
            Delivery::Success { tag, .. } | Delivery::Failure { tag, .. } => tag,
        }
    }
}

/// Sink that forwards deliveries to a channel, labelled with `tag`.
pub struct ChannelSink {
    tag: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelSink {
    pub fn new(tag: impl Into<String>, tx: mpsc::UnboundedSender<Delivery>) -> Self {
        Self {
            tag: tag.into(),
            tx,
        }
    }
}

impl ImageSink for ChannelSink {
    fn on_success(&self, bitmap: Bitmap) {
        let _ = self.tx.send(Delivery::Success {
            tag: self.tag.clone(),
            bitmap,
        });
    }

    fn on_failure(&self, status: u16, diagnostic: &str) {
        let _ = self.tx.send(Delivery::Failure {
            tag: self.tag.clone(),
            status,
            diagnostic: diagnostic.to_string(),
        });
    }
}

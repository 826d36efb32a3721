//! The dispatcher loop.
//!
//! One tokio task takes admitted requests from the queue and submits each
//! request's task to its executor. It runs until the queue is closed.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::queue::RequestQueue;
use crate::executor::task::TaskError;

pub fn spawn_dispatcher(queue: Arc<RequestQueue>) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(max_in_flight = queue.max_in_flight(), "Dispatcher started");

        while let Some(request) = queue.take().await {
            match request.execute() {
                Ok(()) => {}
                Err(TaskError::Cancelled) => {
                    debug!(request_id = %request.id(), key = %request.key(), "Skipping cancelled request");
                    queue.notify_complete(request.id());
                }
                Err(e) => {
                    // A request whose task was already started elsewhere.
                    error!(
                        request_id = %request.id(),
                        key = %request.key(),
                        error = %e,
                        "Request task could not be started"
                    );
                    queue.notify_complete(request.id());
                }
            }
        }

        let dropped = queue.remove_all();
        for request in &dropped {
            request.cancel(false);
        }
        info!(dropped = dropped.len(), "Dispatcher stopped");
    })
}

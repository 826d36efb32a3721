//! Single-worker executor.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::callback::panic_message;
use super::{Runnable, TaskExecutor};
use crate::config::ExecutorKind;

/// Runs submitted work one item at a time, in submission order.
pub struct SerialExecutor {
    tx: mpsc::UnboundedSender<Runnable>,
    shutdown: CancellationToken,
}

impl SerialExecutor {
    /// Spawn the worker on the current runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Runnable>();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        tokio::spawn(async move {
            loop {
                let runnable = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(runnable) => runnable,
                        None => break,
                    },
                };
                if let Err(panic) = AssertUnwindSafe(runnable).catch_unwind().await {
                    error!(panic = %panic_message(&*panic), "Serial runnable panicked");
                }
            }
            debug!("Serial executor stopped");
        });

        Self { tx, shutdown }
    }
}

impl Default for SerialExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskExecutor for SerialExecutor {
    fn execute_runnable(&self, runnable: Runnable) {
        if self.shutdown.is_cancelled() || self.tx.send(runnable).is_err() {
            warn!("Serial executor is shut down, dropping runnable");
        }
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Serial
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

//! The single ordered callback context.
//!
//! Every completion and progress callback is posted here, whatever worker
//! produced it. One tokio task drains the channel, so callbacks run one at a
//! time, in the order they were posted.

use std::panic::AssertUnwindSafe;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct CallbackContext {
    tx: mpsc::UnboundedSender<Callback>,
}

impl CallbackContext {
    /// Start the context's drain task on the current runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Callback>();
        tokio::spawn(async move {
            while let Some(callback) = rx.recv().await {
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(callback)) {
                    error!(panic = %panic_message(&*panic), "Callback panicked");
                }
            }
            debug!("Callback context stopped");
        });
        Self { tx }
    }

    /// Queue `callback` behind everything already posted.
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(callback)).is_err() {
            debug!("Callback context gone, dropping callback");
        }
    }

    /// Wait until every callback posted before this call has run.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.post(move || {
            let _ = done.send(());
        });
        let _ = wait.await;
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

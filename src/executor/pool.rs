//! Bounded worker pool.
//!
//! Work goes into an unbounded FIFO queue. Up to `core_size` workers are
//! started as work arrives; beyond that, a new worker is started only when
//! the queue holds more items than there are idle workers, up to `max_size`.
//! Workers above `core_size` exit after `keep_alive` without work.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::callback::panic_message;
use super::{Runnable, TaskExecutor};
use crate::config::ExecutorKind;

pub const DEFAULT_CORE_POOL_SIZE: usize = 5;
pub const DEFAULT_MAX_POOL_SIZE: usize = 128;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub core_size: usize,
    pub max_size: usize,
    pub keep_alive: Duration,
}

impl PoolSettings {
    /// Non-positive values fall back to the defaults. `max_size` is raised to
    /// `core_size` if smaller.
    pub fn resolve(core_size: i64, max_size: i64, keep_alive_millis: i64) -> Self {
        let core_size = if core_size > 0 {
            core_size as usize
        } else {
            DEFAULT_CORE_POOL_SIZE
        };
        let max_size = if max_size > 0 {
            max_size as usize
        } else {
            DEFAULT_MAX_POOL_SIZE
        };
        let keep_alive = if keep_alive_millis > 0 {
            Duration::from_millis(keep_alive_millis as u64)
        } else {
            DEFAULT_KEEP_ALIVE
        };
        Self {
            core_size,
            max_size: max_size.max(core_size),
            keep_alive,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::resolve(0, 0, 0)
    }
}

struct Shared {
    settings: PoolSettings,
    queue: Mutex<VecDeque<Runnable>>,
    work: Notify,
    workers: AtomicUsize,
    idle: AtomicUsize,
    shutdown: CancellationToken,
}

pub struct PoolExecutor {
    shared: Arc<Shared>,
}

impl PoolExecutor {
    pub fn new(settings: PoolSettings) -> Self {
        debug!(
            core = settings.core_size,
            max = settings.max_size,
            keep_alive_ms = settings.keep_alive.as_millis() as u64,
            "Created worker pool"
        );
        Self {
            shared: Arc::new(Shared {
                settings,
                queue: Mutex::new(VecDeque::new()),
                work: Notify::new(),
                workers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> PoolSettings {
        self.shared.settings
    }

    /// Live worker count.
    pub fn workers(&self) -> usize {
        self.shared.workers.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl TaskExecutor for PoolExecutor {
    fn execute_runnable(&self, runnable: Runnable) {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            warn!("Worker pool is shut down, dropping runnable");
            return;
        }

        let spawn = {
            let mut queue = shared.queue.lock();
            queue.push_back(runnable);
            let workers = shared.workers.load(Ordering::SeqCst);
            let idle = shared.idle.load(Ordering::SeqCst);
            let spawn = workers < shared.settings.core_size
                || (idle < queue.len() && workers < shared.settings.max_size);
            if spawn {
                shared.workers.fetch_add(1, Ordering::SeqCst);
            }
            spawn
        };

        if spawn {
            tokio::spawn(worker(shared.clone()));
        }
        shared.work.notify_one();
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::BoundedParallel
    }

    fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let dropped = std::mem::take(&mut *self.shared.queue.lock());
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "Dropped queued runnables on shutdown");
        }
        self.shared.work.notify_waiters();
    }
}

impl Drop for PoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn worker(shared: Arc<Shared>) {
    loop {
        let next = shared.queue.lock().pop_front();
        if let Some(runnable) = next {
            if let Err(panic) = AssertUnwindSafe(runnable).catch_unwind().await {
                error!(panic = %panic_message(&*panic), "Pool runnable panicked");
            }
            continue;
        }

        shared.idle.fetch_add(1, Ordering::SeqCst);
        let notified = shared.work.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if !shared.queue.lock().is_empty() {
            shared.idle.fetch_sub(1, Ordering::SeqCst);
            continue;
        }

        let exit = tokio::select! {
            _ = shared.shutdown.cancelled() => {
                shared.workers.fetch_sub(1, Ordering::SeqCst);
                true
            }
            _ = &mut notified => false,
            _ = tokio::time::sleep(shared.settings.keep_alive) => retire(&shared),
        };
        shared.idle.fetch_sub(1, Ordering::SeqCst);

        if exit {
            debug!("Pool worker exiting");
            return;
        }
    }
}

/// Leave the pool if it is above core size and has nothing queued. Checked
/// and decremented under the queue lock.
fn retire(shared: &Shared) -> bool {
    let queue = shared.queue.lock();
    if !queue.is_empty() || shared.workers.load(Ordering::SeqCst) <= shared.settings.core_size {
        return false;
    }
    shared.workers.fetch_sub(1, Ordering::SeqCst);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Barrier};

    #[test]
    fn test_resolve_defaults_and_ordering() {
        assert_eq!(PoolSettings::default().core_size, DEFAULT_CORE_POOL_SIZE);
        let settings = PoolSettings::resolve(8, 2, 50);
        assert_eq!(settings.core_size, 8);
        assert_eq!(settings.max_size, 8);
        assert_eq!(settings.keep_alive, Duration::from_millis(50));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_runs_core_size_tasks_concurrently() {
        let pool = PoolExecutor::new(PoolSettings::resolve(3, 3, 1000));
        // All three must be running at once to pass the barrier.
        let barrier = Arc::new(Barrier::new(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..3 {
            let barrier = barrier.clone();
            let tx = tx.clone();
            pool.execute_runnable(Box::pin(async move {
                barrier.wait().await;
                let _ = tx.send(i);
            }));
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(pool.workers() <= 3);
    }

    #[tokio::test]
    async fn test_extra_workers_retire_after_keep_alive() {
        let pool = PoolExecutor::new(PoolSettings::resolve(1, 4, 30));
        let gate = Arc::new(Barrier::new(4));
        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..4 {
            let gate = gate.clone();
            let tx = tx.clone();
            pool.execute_runnable(Box::pin(async move {
                gate.wait().await;
                let _ = tx.send(());
            }));
        }
        for _ in 0..4 {
            rx.recv().await.unwrap();
        }
        assert_eq!(pool.workers(), 4);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.workers(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drops_queued_work() {
        let pool = PoolExecutor::new(PoolSettings::resolve(1, 1, 1000));
        pool.shutdown();
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        pool.execute_runnable(Box::pin(async move {
            let _ = tx.send(());
        }));
        assert!(rx.recv().await.is_none());
    }
}

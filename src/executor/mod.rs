//! Task execution.
//!
//! - [`task`]: `Task` lifecycle, cooperative cancellation, outcomes
//! - [`callback`]: the single ordered context completion handlers run on
//! - [`serial`]: one worker, strict submission order
//! - [`pool`]: bounded worker pool with idle keep-alive
//!
//! Executors only bound worker usage. How many fetches may run at once is
//! decided by the request queue.

pub mod callback;
pub mod pool;
pub mod serial;
pub mod task;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::config::{ExecutorConfig, ExecutorKind};
use task::{Job, Task, TaskError};

/// Fire-and-forget unit of work.
pub type Runnable = BoxFuture<'static, ()>;

pub trait TaskExecutor: Send + Sync {
    fn execute_runnable(&self, runnable: Runnable);

    fn kind(&self) -> ExecutorKind;

    /// Stop picking up work. Queued runnables are dropped.
    fn shutdown(&self);
}

impl dyn TaskExecutor {
    /// Submit `task` with `input`; returns the same task.
    pub fn execute<J: Job>(&self, task: &Task<J>, input: J::Input) -> Result<Task<J>, TaskError> {
        task.execute(self, input)
    }
}

/// Build the executor described by `config` on the current runtime.
pub fn build_executor(config: &ExecutorConfig) -> Arc<dyn TaskExecutor> {
    match config.kind {
        ExecutorKind::Serial => Arc::new(serial::SerialExecutor::new()),
        ExecutorKind::BoundedParallel => Arc::new(pool::PoolExecutor::new(config.pool_settings())),
    }
}

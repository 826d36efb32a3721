//! Requests and admission control.
//!
//! - [`queue`]: `RequestQueue`, the FIFO queue that bounds in-flight fetches
//! - [`dispatcher`]: the loop that admits requests and submits their tasks
//!
//! A [`Request`] pairs a key with the task that will fetch it and the
//! executor that will run that task. Requests compare by identity.

pub mod dispatcher;
pub mod queue;

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::executor::task::{Job, Task, TaskError, TaskStatus};
use crate::executor::TaskExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task that is started with the request's key.
pub trait KeyedTask: Send + Sync {
    fn start(&self, executor: &dyn TaskExecutor, key: String) -> Result<(), TaskError>;
    fn cancel(&self, interrupt: bool) -> bool;
    fn is_cancelled(&self) -> bool;
    fn status(&self) -> TaskStatus;
}

impl<J: Job<Input = String>> KeyedTask for Task<J> {
    fn start(&self, executor: &dyn TaskExecutor, key: String) -> Result<(), TaskError> {
        self.execute(executor, key).map(|_| ())
    }

    fn cancel(&self, interrupt: bool) -> bool {
        Task::cancel(self, interrupt)
    }

    fn is_cancelled(&self) -> bool {
        Task::is_cancelled(self)
    }

    fn status(&self) -> TaskStatus {
        Task::status(self)
    }
}

struct RequestInner {
    id: RequestId,
    key: String,
    task: Arc<dyn KeyedTask>,
    executor: Arc<dyn TaskExecutor>,
}

#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    pub fn new(
        id: RequestId,
        key: impl Into<String>,
        task: Arc<dyn KeyedTask>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                id,
                key: key.into(),
                task,
                executor,
            }),
        }
    }

    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Submit the task to the executor.
    pub fn execute(&self) -> Result<(), TaskError> {
        self.inner
            .task
            .start(self.inner.executor.as_ref(), self.inner.key.clone())
    }

    pub fn cancel(&self, interrupt: bool) -> bool {
        self.inner.task.cancel(interrupt)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.task.is_cancelled()
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.task.status()
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Request {}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("status", &self.status())
            .finish()
    }
}

//! Cancellable, observable units of asynchronous work.
//!
//! A [`Task`] wraps a [`Job`] and drives it through one lifecycle:
//!
//! ```text
//! Pending ──execute──► Running ──body returns──► Finished
//!    │                    │
//!    └──cancel──► Cancelled ◄──cancel──┘
//! ```
//!
//! Cancellation is cooperative. A cancelled task whose body has not started
//! never runs it; a running body is expected to poll
//! [`TaskContext::is_cancelled`] at its checkpoints. `cancel(true)`
//! additionally interrupts the body at its next await point.
//!
//! Whatever worker runs the body, the job's completion handlers run on the
//! task's [`CallbackContext`]. Exactly one of `on_success`, `on_cancelled` or
//! `on_fault` is invoked per task.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::callback::{panic_message, CallbackContext};
use super::TaskExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Finished,
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task cannot be executed: it is already {0:?}")]
    IllegalState(TaskStatus),

    #[error("task was cancelled")]
    Cancelled,

    #[error("task body panicked: {0}")]
    Panicked(String),
}

/// The work a [`Task`] performs, plus its completion handlers.
#[async_trait]
pub trait Job: Send + Sync + Sized + 'static {
    type Input: Send + 'static;
    type Progress: Send + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// Background computation. Runs off the callback context.
    async fn run(&self, input: Self::Input, ctx: &TaskContext<Self>) -> Self::Output;

    fn on_success(&self, _output: &Self::Output) {}

    /// `partial` is the body's result when it completed after cancellation.
    fn on_cancelled(&self, _partial: Option<&Self::Output>) {}

    fn on_fault(&self, _error: &TaskError) {}

    fn on_progress(&self, _progress: Self::Progress) {}
}

/// Terminal result of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Completed(T),
    Cancelled(Option<T>),
    Faulted(TaskError),
}

/// What the body left behind when it stopped.
enum RunResult<T> {
    Output(T),
    /// Body never started.
    Skipped,
    /// Body dropped at an await point by `cancel(true)`.
    Interrupted,
    Panicked(String),
}

struct TaskInner<J: Job> {
    job: J,
    status: Mutex<TaskStatus>,
    cancelled: AtomicBool,
    interrupt: CancellationToken,
    executed: AtomicBool,
    completed: AtomicBool,
    callbacks: CallbackContext,
    outcome: watch::Sender<Option<TaskOutcome<J::Output>>>,
}

/// Shared handle to one task. Clones refer to the same task.
pub struct Task<J: Job> {
    inner: Arc<TaskInner<J>>,
}

impl<J: Job> Clone for Task<J> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<J: Job> Task<J> {
    pub fn new(job: J, callbacks: CallbackContext) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(TaskInner {
                job,
                status: Mutex::new(TaskStatus::Pending),
                cancelled: AtomicBool::new(false),
                interrupt: CancellationToken::new(),
                executed: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                callbacks,
                outcome,
            }),
        }
    }

    pub fn job(&self) -> &J {
        &self.inner.job
    }

    pub fn status(&self) -> TaskStatus {
        *self.inner.status.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Whether both handles refer to the same task.
    pub fn ptr_eq(&self, other: &Task<J>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Submit the task to `executor`. A task runs at most once.
    pub fn execute(
        &self,
        executor: &dyn TaskExecutor,
        input: J::Input,
    ) -> Result<Task<J>, TaskError> {
        {
            let mut status = self.inner.status.lock();
            match *status {
                TaskStatus::Pending => *status = TaskStatus::Running,
                TaskStatus::Cancelled if !self.inner.executed.load(Ordering::SeqCst) => {
                    return Err(TaskError::Cancelled)
                }
                other => return Err(TaskError::IllegalState(other)),
            }
            self.inner.executed.store(true, Ordering::SeqCst);
        }
        let task = self.clone();
        executor.execute_runnable(Box::pin(async move { task.run(input).await }));
        Ok(self.clone())
    }

    /// Request cancellation. Idempotent; returns `true` only for the call that
    /// set the flag.
    pub fn cancel(&self, interrupt: bool) -> bool {
        let (first, never_started) = {
            let mut status = self.inner.status.lock();
            let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
            let never_started = *status == TaskStatus::Pending;
            if matches!(*status, TaskStatus::Pending | TaskStatus::Running) {
                *status = TaskStatus::Cancelled;
            }
            (first, never_started)
        };
        if never_started {
            debug!("Cancelled task before execution");
            self.finish(RunResult::Skipped);
        }
        if interrupt {
            self.inner.interrupt.cancel();
        }
        first
    }

    /// Wait for the task to finish or be cancelled.
    pub async fn get(&self) -> TaskOutcome<J::Output> {
        let mut rx = self.inner.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(TaskOutcome::Cancelled(None)),
            Err(_) => TaskOutcome::Cancelled(None),
        };
        outcome
    }

    /// The outcome, if the completion handlers have already run.
    pub fn outcome(&self) -> Option<TaskOutcome<J::Output>> {
        self.inner.outcome.borrow().clone()
    }

    async fn run(self, input: J::Input) {
        let result = if self.is_cancelled() {
            RunResult::Skipped
        } else {
            let ctx = TaskContext {
                inner: self.inner.clone(),
            };
            let body = AssertUnwindSafe(self.inner.job.run(input, &ctx)).catch_unwind();
            tokio::select! {
                _ = self.inner.interrupt.cancelled() => RunResult::Interrupted,
                result = body => match result {
                    Ok(output) => RunResult::Output(output),
                    Err(panic) => RunResult::Panicked(panic_message(&*panic)),
                },
            }
        };
        self.finish(result);
    }

    fn finish(&self, result: RunResult<J::Output>) {
        let inner = self.inner.clone();
        self.inner.callbacks.post(move || inner.complete(result));
    }
}

impl<J: Job> TaskInner<J> {
    /// Runs on the callback context.
    fn complete(&self, result: RunResult<J::Output>) {
        if self.completed.swap(true, Ordering::SeqCst) {
            warn!("Task completion delivered twice, ignoring");
            return;
        }
        let cancelled = {
            let mut status = self.status.lock();
            let cancelled = self.cancelled.load(Ordering::SeqCst);
            if !cancelled {
                *status = TaskStatus::Finished;
            }
            cancelled
        };

        let outcome = match result {
            RunResult::Output(output) if !cancelled => {
                self.job.on_success(&output);
                TaskOutcome::Completed(output)
            }
            RunResult::Output(output) => {
                self.job.on_cancelled(Some(&output));
                TaskOutcome::Cancelled(Some(output))
            }
            RunResult::Skipped | RunResult::Interrupted => {
                self.job.on_cancelled(None);
                TaskOutcome::Cancelled(None)
            }
            RunResult::Panicked(_) if cancelled => {
                self.job.on_cancelled(None);
                TaskOutcome::Cancelled(None)
            }
            RunResult::Panicked(message) => {
                let error = TaskError::Panicked(message);
                warn!(error = %error, "Task faulted");
                self.job.on_fault(&error);
                TaskOutcome::Faulted(error)
            }
        };
        self.outcome.send_replace(Some(outcome));
    }
}

/// Handed to a running body.
pub struct TaskContext<J: Job> {
    inner: Arc<TaskInner<J>>,
}

impl<J: Job> TaskContext<J> {
    /// Cancellation checkpoint.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the task is cancelled with interrupt.
    pub async fn interrupted(&self) {
        self.inner.interrupt.cancelled().await
    }

    /// Deliver a progress value on the callback context. Dropped once the
    /// task is cancelled.
    pub fn publish_progress(&self, progress: J::Progress) {
        if self.is_cancelled() {
            return;
        }
        let inner = self.inner.clone();
        self.inner.callbacks.post(move || {
            if !inner.cancelled.load(Ordering::SeqCst) {
                inner.job.on_progress(progress);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::serial::SerialExecutor;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: String) {
            self.events.lock().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    struct Double {
        recorder: Arc<Recorder>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Job for Double {
        type Input = u32;
        type Progress = u32;
        type Output = u32;

        async fn run(&self, input: u32, ctx: &TaskContext<Self>) -> u32 {
            ctx.publish_progress(input);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if input == 13 {
                panic!("unlucky");
            }
            input * 2
        }

        fn on_success(&self, output: &u32) {
            self.recorder.push(format!("success {output}"));
        }

        fn on_cancelled(&self, partial: Option<&u32>) {
            self.recorder.push(format!("cancelled {partial:?}"));
        }

        fn on_fault(&self, error: &TaskError) {
            self.recorder.push(format!("fault {error}"));
        }

        fn on_progress(&self, progress: u32) {
            self.recorder.push(format!("progress {progress}"));
        }
    }

    fn task(gate: Option<Arc<Notify>>) -> (Task<Double>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let job = Double {
            recorder: recorder.clone(),
            gate,
        };
        (Task::new(job, CallbackContext::spawn()), recorder)
    }

    #[tokio::test]
    async fn test_runs_once_and_reports_success() {
        let executor = SerialExecutor::new();
        let (task, recorder) = task(None);

        let same = task.execute(&executor, 21).unwrap();
        assert!(same.ptr_eq(&task));
        assert_eq!(task.get().await, TaskOutcome::Completed(42));
        assert_eq!(task.status(), TaskStatus::Finished);
        assert_eq!(recorder.events(), vec!["progress 21", "success 42"]);
    }

    #[tokio::test]
    async fn test_second_execute_is_illegal() {
        let executor = SerialExecutor::new();
        let (task, _) = task(None);
        task.execute(&executor, 1).unwrap();
        task.get().await;

        assert_eq!(
            task.execute(&executor, 1).err(),
            Some(TaskError::IllegalState(TaskStatus::Finished))
        );
    }

    #[tokio::test]
    async fn test_cancel_before_execute_never_runs_body() {
        let executor = SerialExecutor::new();
        let (task, recorder) = task(None);

        assert!(task.cancel(false));
        assert!(!task.cancel(false));
        assert_eq!(task.execute(&executor, 5).err(), Some(TaskError::Cancelled));
        assert_eq!(task.get().await, TaskOutcome::Cancelled(None));
        assert_eq!(recorder.events(), vec!["cancelled None"]);
    }

    #[tokio::test]
    async fn test_cancel_while_running_routes_to_on_cancelled() {
        let executor = SerialExecutor::new();
        let gate = Arc::new(Notify::new());
        let (task, recorder) = task(Some(gate.clone()));

        task.execute(&executor, 4).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.cancel(false);
        assert_eq!(task.status(), TaskStatus::Cancelled);
        gate.notify_one();

        assert_eq!(task.get().await, TaskOutcome::Cancelled(Some(8)));
        let events = recorder.events();
        assert_eq!(events.last().map(String::as_str), Some("cancelled Some(8)"));
        assert!(!events.iter().any(|e| e.starts_with("success")));
    }

    #[tokio::test]
    async fn test_interrupt_drops_body() {
        let executor = SerialExecutor::new();
        let gate = Arc::new(Notify::new());
        let (task, recorder) = task(Some(gate));

        task.execute(&executor, 4).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.cancel(true);

        assert_eq!(task.get().await, TaskOutcome::Cancelled(None));
        assert_eq!(recorder.events().last().map(String::as_str), Some("cancelled None"));
    }

    #[tokio::test]
    async fn test_panic_becomes_fault() {
        let executor = SerialExecutor::new();
        let (task, recorder) = task(None);
        task.execute(&executor, 13).unwrap();

        assert_eq!(
            task.get().await,
            TaskOutcome::Faulted(TaskError::Panicked("unlucky".into()))
        );
        assert!(recorder
            .events()
            .iter()
            .any(|e| e == "fault task body panicked: unlucky"));
    }
}

//! Admission-controlled request queue.
//!
//! Requests wait in FIFO order until the dispatcher takes them. A request
//! taken from the queue is *admitted*: it counts against `max_in_flight`
//! until [`RequestQueue::notify_complete`] is called with its id. `take`
//! blocks while nothing is queued or the ceiling is reached.
//!
//! All state lives under one lock, so the admission check, the dequeue and
//! the bookkeeping are a single step. The in-flight count is the size of the
//! admitted set; releasing an id twice is a no-op.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::{Request, RequestId};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 5;

struct QueueState {
    queued: VecDeque<Request>,
    admitted: HashSet<RequestId>,
    closed: bool,
}

pub struct RequestQueue {
    max_in_flight: usize,
    state: Mutex<QueueState>,
    changed: Notify,
}

impl RequestQueue {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            state: Mutex::new(QueueState {
                queued: VecDeque::new(),
                admitted: HashSet::new(),
                closed: false,
            }),
            changed: Notify::new(),
        }
    }

    /// Append a request. Returns `false` once the queue is closed.
    pub fn put(&self, request: Request) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            trace!(request_id = %request.id(), queued = state.queued.len() + 1, "Enqueued request");
            state.queued.push_back(request);
        }
        self.changed.notify_waiters();
        true
    }

    /// Wait for the next request that may start. `None` once closed.
    pub async fn take(&self) -> Option<Request> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(request) = self.admit(&mut state) {
                    return Some(request);
                }
            }
            notified.await;
        }
    }

    /// Admit the next request if the ceiling allows, without waiting.
    pub fn try_take(&self) -> Option<Request> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        self.admit(&mut state)
    }

    fn admit(&self, state: &mut QueueState) -> Option<Request> {
        if state.admitted.len() >= self.max_in_flight {
            return None;
        }
        let request = state.queued.pop_front()?;
        state.admitted.insert(request.id());
        debug!(
            request_id = %request.id(),
            key = %request.key(),
            in_flight = state.admitted.len(),
            "Admitted request"
        );
        Some(request)
    }

    /// Remove a request that has not been admitted. Returns whether it was queued.
    pub fn remove(&self, request: &Request) -> bool {
        let mut state = self.state.lock();
        let before = state.queued.len();
        state.queued.retain(|queued| queued != request);
        before != state.queued.len()
    }

    /// Release the admission slot held by `id`. Returns `false` if `id` was
    /// not admitted (never taken, or already released).
    pub fn notify_complete(&self, id: RequestId) -> bool {
        let released = self.state.lock().admitted.remove(&id);
        if released {
            trace!(request_id = %id, "Released admission slot");
            self.changed.notify_waiters();
        }
        released
    }

    /// Drain every queued request without running it.
    pub fn remove_all(&self) -> Vec<Request> {
        let mut state = self.state.lock();
        state.queued.drain(..).collect()
    }

    /// Refuse new requests and wake the dispatcher so it can exit.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Requests queued or admitted and not yet completed.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.queued.len() + state.admitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().admitted.len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IN_FLIGHT)
    }
}

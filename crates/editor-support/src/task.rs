//! Background execution.
//!
//! [`TaskQueue`] is a single-worker queue: jobs run one at a time on a dedicated thread, ordered
//! by their due time and, for equal due times, by submission order. A job can carry a delay and,
//! until it starts, can be cancelled or moved to run immediately.
//!
//! [`Task`] is the shared, waitable result of a job. Every clone observes the same outcome, and
//! a failure captured on the worker is re-raised to each waiter.

use crate::error::{Result, SupportError};
use crate::sync::{lock, wait, wait_timeout};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

struct TaskShared<T> {
    result: Mutex<Option<Result<T>>>,
    done: Condvar,
}

/// The eventual outcome of a background operation.
pub struct Task<T> {
    shared: Arc<TaskShared<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T: Clone> Task<T> {
    /// Create an unfinished task.
    pub fn pending() -> Self {
        Self {
            shared: Arc::new(TaskShared {
                result: Mutex::new(None),
                done: Condvar::new(),
            }),
        }
    }

    /// Create a task that already finished with `value`.
    pub fn finished(value: T) -> Self {
        let task = Self::pending();
        task.complete(Ok(value));
        task
    }

    /// Create a task that already failed.
    pub fn failed(err: SupportError) -> Self {
        let task = Self::pending();
        task.complete(Err(err));
        task
    }

    /// Whether the outcome is known.
    pub fn is_finished(&self) -> bool {
        lock(&self.shared.result).is_some()
    }

    /// Whether two handles refer to the same task.
    pub fn same_task(&self, other: &Task<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Record the outcome; later calls are ignored.
    pub(crate) fn complete(&self, result: Result<T>) {
        let mut slot = lock(&self.shared.result);
        if slot.is_none() {
            *slot = Some(result);
            self.shared.done.notify_all();
        }
    }

    /// Block until the task finishes.
    pub fn wait(&self) -> Result<T> {
        let mut slot = lock(&self.shared.result);
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = wait(&self.shared.done, slot);
        }
    }

    /// Block until the task finishes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.shared.result);
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SupportError::Timeout("background task"));
            }
            slot = wait_timeout(&self.shared.done, slot, deadline - now);
        }
    }

    /// The outcome, if known, without blocking.
    pub fn try_result(&self) -> Option<Result<T>> {
        lock(&self.shared.result).clone()
    }
}

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

type Job = Box<dyn FnOnce() + Send>;

struct Entry {
    seq: u64,
    due: Instant,
    job: Job,
    state: Arc<AtomicU8>,
}

#[derive(Default)]
struct QueueState {
    entries: Vec<Entry>,
    next_seq: u64,
    shutdown: bool,
}

impl QueueState {
    fn next_index(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| (entry.due, entry.seq))
            .map(|(idx, _)| idx)
    }
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    wakeup: Condvar,
    worker: OnceLock<ThreadId>,
}

/// A single-worker background queue with FIFO ordering.
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.inner.name)
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Handle of a job posted to a [`TaskQueue`].
#[derive(Clone)]
pub struct ScheduledJob {
    queue: Arc<QueueInner>,
    seq: u64,
    state: Arc<AtomicU8>,
}

impl std::fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("seq", &self.seq)
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}

impl ScheduledJob {
    /// Remove the job if it has not started yet; returns whether it was removed.
    pub fn cancel(&self) -> bool {
        let mut state = lock(&self.queue.state);
        match state.entries.iter().position(|entry| entry.seq == self.seq) {
            Some(idx) => {
                state.entries.remove(idx);
                self.state.store(CANCELLED, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Move a job that has not started yet to run after `delay` from now.
    ///
    /// Returns `false` if the job already started, finished or was cancelled.
    pub fn reschedule(&self, delay: Duration) -> bool {
        let mut state = lock(&self.queue.state);
        let due = Instant::now() + delay;
        match state.entries.iter_mut().find(|entry| entry.seq == self.seq) {
            Some(entry) => {
                entry.due = due;
                self.queue.wakeup.notify_all();
                true
            }
            None => false,
        }
    }

    /// Whether the job has started (and cannot be cancelled anymore).
    pub fn is_started(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), RUNNING | DONE)
    }

    /// Whether the job has completed.
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    /// Whether the job was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

impl TaskQueue {
    /// Create a queue and start its worker thread.
    pub fn new(name: impl Into<String>) -> Self {
        let inner = Arc::new(QueueInner {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
            worker: OnceLock::new(),
        });

        let worker_inner = inner.clone();
        let spawned = thread::Builder::new()
            .name(inner.name.clone())
            .spawn(move || worker_loop(worker_inner));
        match spawned {
            Ok(handle) => {
                let _ = inner.worker.set(handle.thread().id());
            }
            Err(err) => log::error!("{}: cannot start worker thread: {}", inner.name, err),
        }

        Self { inner }
    }

    /// Queue name (also the worker thread name).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Post a job to run after `delay`.
    pub fn post(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> ScheduledJob {
        let state_flag = Arc::new(AtomicU8::new(PENDING));
        let mut state = lock(&self.inner.state);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(Entry {
            seq,
            due: Instant::now() + delay,
            job: Box::new(job),
            state: state_flag.clone(),
        });
        self.inner.wakeup.notify_all();

        ScheduledJob {
            queue: self.inner.clone(),
            seq,
            state: state_flag,
        }
    }

    /// Whether the caller runs on this queue's worker thread.
    pub fn is_worker_thread(&self) -> bool {
        self.inner.worker.get() == Some(&thread::current().id())
    }

    /// Number of jobs waiting to run.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.state).entries.len()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        let mut state = lock(&self.inner.state);
        state.shutdown = true;
        self.inner.wakeup.notify_all();
    }
}

fn worker_loop(inner: Arc<QueueInner>) {
    loop {
        let entry = {
            let mut state = lock(&inner.state);
            loop {
                if state.shutdown {
                    // Jobs due now still run; delayed ones are dropped with the queue.
                    let now = Instant::now();
                    state.entries.retain(|entry| entry.due <= now);
                    if state.entries.is_empty() {
                        return;
                    }
                }
                match state.next_index() {
                    Some(idx) => {
                        let now = Instant::now();
                        let due = state.entries[idx].due;
                        if due <= now {
                            break state.entries.remove(idx);
                        }
                        state = wait_timeout(&inner.wakeup, state, due - now);
                    }
                    None => state = wait(&inner.wakeup, state),
                }
            }
        };

        entry.state.store(RUNNING, Ordering::Release);
        if catch_unwind(AssertUnwindSafe(entry.job)).is_err() {
            log::error!("{}: background job {} panicked", inner.name, entry.seq);
        }
        entry.state.store(DONE, Ordering::Release);
    }
}

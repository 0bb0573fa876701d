//! Document open/close/reload state machine.
//!
//! [`DocumentOpenClose`] owns the lifecycle of the single [`Document`] behind an editor
//! support. It never reads or writes content itself: the owner plugs in [`LifecycleHooks`] and
//! the state machine decides *when* they run.
//!
//! Rules:
//!
//! - All status changes and task bookkeeping happen under one mutex.
//! - Loads, closes and reloads run as jobs on one FIFO worker, so a close followed by an open
//!   always completes the close first.
//! - At most one load, one close and one reload are active at a time.
//! - The document is held weakly. When every holder drops it, a close is scheduled after
//!   [`SupportConfig::close_delay`]; an explicit [`close`](DocumentOpenClose::close) runs
//!   right away.
//! - An open requested on the worker itself (for example by a listener reacting to a close)
//!   runs the pending jobs inline instead of waiting for them.

use crate::config::SupportConfig;
use crate::document::Document;
use crate::env::EditorView;
use crate::error::{Result, SupportError};
use crate::sync::{lock, wait_timeout};
use crate::task::{ScheduledJob, Task, TaskQueue};
use crate::text::TextSnapshot;
use crate::ui::UiThread;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// Lifecycle status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DocumentStatus {
    /// No document.
    #[default]
    Closed,
    /// A load is in flight.
    Loading,
    /// The document is open.
    Opened,
    /// The open document is being refilled from its content source.
    Reloading,
}

/// Caret of one view, captured before a reload.
#[derive(Clone)]
pub struct CaretState {
    /// The view.
    pub view: Arc<dyn EditorView>,
    /// Caret offset before the reload.
    pub offset: usize,
    /// Caret line before the reload.
    pub line: usize,
    /// Caret column before the reload.
    pub column: usize,
}

impl fmt::Debug for CaretState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaretState")
            .field("offset", &self.offset)
            .field("line", &self.line)
            .field("column", &self.column)
            .finish()
    }
}

/// Lifecycle notification sent through [`LifecycleHooks::notify`].
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A load finished.
    Opened,
    /// A close finished.
    Closed,
    /// A reload started.
    ReloadStarted,
    /// A reload finished.
    ReloadFinished,
    /// A reload failed; the previous text is still in place.
    ReloadFailed(SupportError),
}

/// Work the state machine delegates to its owner.
///
/// Every hook except [`capture_views`](LifecycleHooks::capture_views) runs on the worker
/// thread with no state machine lock held.
pub trait LifecycleHooks: Send + Sync {
    /// Read the content and build a fresh document.
    fn load(&self) -> Result<Arc<Document>>;

    /// Attach positions, line sets and listeners to a loaded document.
    ///
    /// Runs before the load completes; no waiter sees the document earlier.
    fn bind(&self, document: &Arc<Document>);

    /// Detach everything from a closing document.
    ///
    /// `document` is `None` when every holder released it. `snapshot` is its final text, or
    /// `None` if a released document never delivered it.
    fn unbind(&self, document: Option<&Arc<Document>>, snapshot: Option<&TextSnapshot>);

    /// Capture the carets of the open views. Runs on the UI thread when there is one.
    fn capture_views(&self, document: &Arc<Document>) -> Vec<CaretState>;

    /// Refill `document` from the content source and restore `carets`.
    ///
    /// Must leave the document untouched when reading fails.
    fn reload(&self, document: &Arc<Document>, carets: &[CaretState]) -> Result<()>;

    /// Lifecycle notification.
    fn notify(&self, event: LifecycleEvent);
}

struct LoadSlot {
    task: Task<Arc<Document>>,
    job: ScheduledJob,
}

struct CloseSlot {
    task: Task<()>,
    job: ScheduledJob,
    delayed: bool,
}

struct ReloadSlot {
    task: Task<()>,
}

#[derive(Default)]
struct State {
    status: DocumentStatus,
    document: Weak<Document>,
    pinned: Option<Arc<Document>>,
    load: Option<LoadSlot>,
    close: Option<CloseSlot>,
    reload: Option<ReloadSlot>,
    generation: u64,
}

struct Inner {
    config: SupportConfig,
    state: Mutex<State>,
    released: Mutex<Option<(u64, TextSnapshot)>>,
    released_ready: Condvar,
    worker: TaskQueue,
    ui: Option<Arc<UiThread>>,
    hooks: Weak<dyn LifecycleHooks>,
}

/// The open/close/reload state machine of one logical document.
pub struct DocumentOpenClose {
    inner: Arc<Inner>,
}

impl fmt::Debug for DocumentOpenClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("DocumentOpenClose")
            .field("document_id", &self.inner.config.document_id)
            .field("status", &state.status)
            .field("load", &state.load.is_some())
            .field("close", &state.close.is_some())
            .field("reload", &state.reload.is_some())
            .finish()
    }
}

impl DocumentOpenClose {
    /// Create a closed state machine.
    ///
    /// Hooks are held weakly; once they are gone every job fails with
    /// [`SupportError::Released`].
    pub fn new(
        config: SupportConfig,
        hooks: Weak<dyn LifecycleHooks>,
        ui: Option<Arc<UiThread>>,
    ) -> Self {
        let worker = TaskQueue::new(format!("{}-lifecycle", config.document_id));
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                released: Mutex::new(None),
                released_ready: Condvar::new(),
                worker,
                ui,
                hooks,
            }),
        }
    }

    /// Current status.
    pub fn status(&self) -> DocumentStatus {
        lock(&self.inner.state).status
    }

    /// The open document, without loading.
    pub fn document(&self) -> Option<Arc<Document>> {
        let state = lock(&self.inner.state);
        match state.status {
            DocumentStatus::Opened | DocumentStatus::Reloading => state.document.upgrade(),
            DocumentStatus::Closed | DocumentStatus::Loading => None,
        }
    }

    /// Whether the document is open and alive.
    pub fn is_loaded(&self) -> bool {
        self.document().is_some()
    }

    /// Whether the calling thread is the lifecycle worker.
    pub fn is_worker_thread(&self) -> bool {
        self.inner.worker.is_worker_thread()
    }

    /// The in-flight or finished load, scheduling one if needed.
    ///
    /// Never blocks. Concurrent callers share a single load.
    pub fn open_task(&self) -> Task<Arc<Document>> {
        let inner = &self.inner;
        let mut state = lock(&inner.state);

        if matches!(
            state.status,
            DocumentStatus::Opened | DocumentStatus::Reloading
        ) {
            if let Some(doc) = state.document.upgrade() {
                match state.close.take() {
                    None => return Task::finished(doc),
                    Some(close) if close.job.cancel() => {
                        log::debug!("{}: pending close cancelled by open", inner.config.document_id);
                        close.task.complete(Err(SupportError::Cancelled));
                        return Task::finished(doc);
                    }
                    Some(running) => state.close = Some(running),
                }
            }
        }

        if let Some(load) = &state.load {
            return load.task.clone();
        }

        let pending_close = state.close.as_ref().map(|close| close.job.clone());
        match pending_close {
            Some(job) => {
                // Run the pending close first, then load behind it.
                job.reschedule(Duration::ZERO);
            }
            None if state.status != DocumentStatus::Closed => {
                log::debug!(
                    "{}: document released before its close, closing now",
                    inner.config.document_id
                );
                inner.schedule_close(&mut state, Duration::ZERO, false);
            }
            None => state.status = DocumentStatus::Loading,
        }

        let task = Task::pending();
        let job_task = task.clone();
        let job = inner.post(Duration::ZERO, move |inner| inner.run_load(job_task));
        state.load = Some(LoadSlot {
            task: task.clone(),
            job,
        });
        log::debug!("{}: load scheduled", inner.config.document_id);
        task
    }

    /// The document, loading it if needed. Blocks until the load finishes.
    ///
    /// On the UI thread the wait is bounded by [`SupportConfig::ui_wait_timeout`].
    pub fn open(&self) -> Result<Arc<Document>> {
        let task = self.open_task();
        if let Some(result) = task.try_result() {
            return result;
        }

        if self.inner.worker.is_worker_thread() {
            self.inner.run_pending_inline();
            return task.try_result().unwrap_or_else(|| {
                Err(SupportError::InvalidState(
                    "load did not complete on the worker".to_string(),
                ))
            });
        }

        match &self.inner.ui {
            Some(ui) if ui.is_current() => task.wait_timeout(self.inner.config.ui_wait_timeout),
            _ => task.wait(),
        }
    }

    /// Close the document now; returns the close task.
    ///
    /// A load in flight completes first and is closed right after.
    pub fn close(&self) -> Task<()> {
        let mut state = lock(&self.inner.state);
        if state.status == DocumentStatus::Closed && state.close.is_none() {
            return Task::finished(());
        }
        self.inner.schedule_close(&mut state, Duration::ZERO, false)
    }

    /// Refill the open document from its content source.
    ///
    /// Fails with [`SupportError::InvalidState`] when nothing is open or loading, or a close is
    /// pending. A reload already pending is shared.
    pub fn reload(&self) -> Result<Task<()>> {
        let inner = &self.inner;
        let mut state = lock(&inner.state);
        if state.close.is_some() {
            return Err(SupportError::InvalidState("a close is pending".to_string()));
        }
        if let Some(reload) = &state.reload {
            return Ok(reload.task.clone());
        }
        if !matches!(
            state.status,
            DocumentStatus::Opened | DocumentStatus::Loading
        ) {
            return Err(SupportError::InvalidState(format!(
                "cannot reload a document that is {:?}",
                state.status
            )));
        }

        let task = Task::pending();
        let job_task = task.clone();
        inner.post(Duration::ZERO, move |inner| inner.run_reload(job_task));
        state.reload = Some(ReloadSlot { task: task.clone() });
        log::debug!("{}: reload scheduled", inner.config.document_id);
        Ok(task)
    }

    /// Keep the open document alive regardless of outside holders.
    pub fn pin(&self) {
        let mut state = lock(&self.inner.state);
        if state.pinned.is_none() {
            state.pinned = state.document.upgrade();
        }
    }

    /// Undo [`pin`](Self::pin).
    pub fn unpin(&self) {
        let pinned = lock(&self.inner.state).pinned.take();
        drop(pinned);
    }
}

impl Inner {
    fn post(
        self: &Arc<Self>,
        delay: Duration,
        job: impl FnOnce(&Arc<Inner>) + Send + 'static,
    ) -> ScheduledJob {
        let weak = Arc::downgrade(self);
        self.worker.post(delay, move || {
            if let Some(inner) = weak.upgrade() {
                job(&inner);
            }
        })
    }

    fn schedule_close(self: &Arc<Self>, state: &mut State, delay: Duration, delayed: bool) -> Task<()> {
        if let Some(close) = state.close.as_mut() {
            if close.delayed && !delayed && !close.job.is_started() {
                close.job.reschedule(Duration::ZERO);
                close.delayed = false;
            }
            return close.task.clone();
        }

        let task = Task::pending();
        let job_task = task.clone();
        let job = self.post(delay, move |inner| inner.run_close(job_task));
        state.close = Some(CloseSlot {
            task: task.clone(),
            job,
            delayed,
        });
        log::debug!(
            "{}: close scheduled in {:?}",
            self.config.document_id,
            delay
        );
        task
    }

    fn run_pending_inline(self: &Arc<Self>) {
        let (close, load) = {
            let state = lock(&self.state);
            (
                state
                    .close
                    .as_ref()
                    .map(|close| (close.task.clone(), close.job.clone())),
                state
                    .load
                    .as_ref()
                    .map(|load| (load.task.clone(), load.job.clone())),
            )
        };
        if let Some((task, job)) = close {
            if job.cancel() {
                self.run_close(task);
            }
        }
        if let Some((task, job)) = load {
            if job.cancel() {
                self.run_load(task);
            }
        }
    }

    fn document_released(self: &Arc<Self>, generation: u64) {
        let mut state = lock(&self.state);
        if state.generation != generation
            || state.status != DocumentStatus::Opened
            || state.document.strong_count() > 0
        {
            return;
        }
        log::debug!("{}: document released by all holders", self.config.document_id);
        self.schedule_close(&mut state, self.config.close_delay, true);
    }

    fn run_load(self: &Arc<Self>, task: Task<Arc<Document>>) {
        {
            let state = lock(&self.state);
            let current = state
                .load
                .as_ref()
                .is_some_and(|load| load.task.same_task(&task));
            if !current || task.is_finished() {
                return;
            }
        }

        let id = &self.config.document_id;
        log::debug!("{}: loading", id);
        let loaded = match self.hooks.upgrade() {
            Some(hooks) => hooks.load().map(|doc| (hooks, doc)),
            None => Err(SupportError::Released),
        };

        match loaded {
            Ok((hooks, doc)) => {
                let generation = {
                    let mut state = lock(&self.state);
                    state.generation += 1;
                    state.document = Arc::downgrade(&doc);
                    state.generation
                };
                let weak = Arc::downgrade(self);
                doc.set_release_hook(Box::new(move |_id: u64, snapshot: TextSnapshot| {
                    if let Some(inner) = weak.upgrade() {
                        *lock(&inner.released) = Some((generation, snapshot));
                        inner.released_ready.notify_all();
                        inner.post(Duration::ZERO, move |inner| {
                            inner.document_released(generation)
                        });
                    }
                }));

                hooks.bind(&doc);
                {
                    let mut state = lock(&self.state);
                    state.status = DocumentStatus::Opened;
                    state.load = None;
                }
                log::debug!("{}: opened document {}", id, doc.id());
                hooks.notify(LifecycleEvent::Opened);
                task.complete(Ok(doc));
            }
            Err(err) => {
                {
                    let mut state = lock(&self.state);
                    state.status = DocumentStatus::Closed;
                    state.document = Weak::new();
                    state.load = None;
                }
                log::warn!("{}: load failed: {}", id, err);
                task.complete(Err(err));
            }
        }
    }

    fn run_close(self: &Arc<Self>, task: Task<()>) {
        let (document, pinned, generation) = {
            let mut state = lock(&self.state);
            let current = state
                .close
                .as_ref()
                .is_some_and(|close| close.task.same_task(&task));
            if !current {
                return;
            }
            state.close = None;
            let document = state.document.upgrade();
            state.document = Weak::new();
            let pinned = state.pinned.take();
            state.status = if state.load.is_some() {
                DocumentStatus::Loading
            } else {
                DocumentStatus::Closed
            };
            let generation = state.generation;
            state.generation += 1;
            (document, pinned, generation)
        };
        drop(pinned);

        let snapshot = match &document {
            Some(doc) => {
                doc.clear_release_hook();
                lock(&self.released).take();
                Some(doc.snapshot())
            }
            None => self.take_released(generation),
        };

        log::debug!("{}: closing", self.config.document_id);
        if let Some(hooks) = self.hooks.upgrade() {
            hooks.unbind(document.as_ref(), snapshot.as_ref());
            hooks.notify(LifecycleEvent::Closed);
        }
        task.complete(Ok(()));
    }

    /// Final text of the released document of `generation`.
    ///
    /// The last holder may still be inside the document's drop, so wait a bounded time for the
    /// release hook to deliver it.
    fn take_released(&self, generation: u64) -> Option<TextSnapshot> {
        let deadline = Instant::now() + self.config.ui_wait_timeout;
        let mut released = lock(&self.released);
        loop {
            match released.take() {
                Some((delivered, snapshot)) if delivered == generation => return Some(snapshot),
                Some((stale, _)) => log::trace!(
                    "{}: dropped stale snapshot of generation {}",
                    self.config.document_id,
                    stale
                ),
                None => {}
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "{}: closing a released document without its final text",
                    self.config.document_id
                );
                return None;
            }
            released = wait_timeout(&self.released_ready, released, deadline - now);
        }
    }

    fn run_reload(self: &Arc<Self>, task: Task<()>) {
        let document = {
            let mut state = lock(&self.state);
            let current = state
                .reload
                .as_ref()
                .is_some_and(|reload| reload.task.same_task(&task));
            if !current {
                return;
            }
            match (state.status, state.document.upgrade()) {
                (DocumentStatus::Opened, Some(doc)) => {
                    state.status = DocumentStatus::Reloading;
                    Ok(doc)
                }
                (status, _) => {
                    state.reload = None;
                    Err(SupportError::InvalidState(format!(
                        "cannot reload a document that is {:?}",
                        status
                    )))
                }
            }
        };
        let document = match document {
            Ok(document) => document,
            Err(err) => {
                task.complete(Err(err));
                return;
            }
        };

        let Some(hooks) = self.hooks.upgrade() else {
            self.finish_reload();
            task.complete(Err(SupportError::Released));
            return;
        };

        let id = &self.config.document_id;
        log::debug!("{}: reloading document {}", id, document.id());
        hooks.notify(LifecycleEvent::ReloadStarted);

        let carets = match &self.ui {
            Some(ui) => {
                let capture_hooks = hooks.clone();
                let capture_doc = document.clone();
                ui.invoke_and_wait(self.config.ui_wait_timeout, move || {
                    capture_hooks.capture_views(&capture_doc)
                })
                .unwrap_or_else(|err| {
                    log::warn!("{}: carets not captured: {}", id, err);
                    Vec::new()
                })
            }
            None => hooks.capture_views(&document),
        };

        let result = hooks.reload(&document, &carets);
        self.finish_reload();
        match &result {
            Ok(()) => {
                log::debug!("{}: reloaded", id);
                hooks.notify(LifecycleEvent::ReloadFinished);
            }
            Err(err) => {
                log::warn!("{}: reload failed: {}", id, err);
                hooks.notify(LifecycleEvent::ReloadFailed(err.clone()));
            }
        }
        task.complete(result);
    }

    fn finish_reload(&self) {
        let mut state = lock(&self.state);
        if state.status == DocumentStatus::Reloading {
            state.status = DocumentStatus::Opened;
        }
        state.reload = None;
    }
}

//! The editor support: one logical document and everything tracked around it.
//!
//! [`EditorSupport`] ties the pieces together. It loads the document from a
//! [`ContentSource`] through the [`DocumentOpenClose`] state machine, keeps [`PositionRef`]s
//! and lines bound across close and reopen, tracks modification, serializes saves, and
//! notifies subscribers with [`SupportEvent`]s.
//!
//! # Example
//!
//! ```rust
//! use editor_support::{Bias, EditorSupport, MemoryContent, SupportConfig, SupportEnv};
//! use std::sync::Arc;
//!
//! let content = Arc::new(MemoryContent::new("hello\nworld\n"));
//! let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());
//!
//! let doc = support.open_document().unwrap();
//! let pos = support.create_position_ref(6, Bias::Forward);
//! doc.insert(0, ">> ").unwrap();
//! assert_eq!(pos.offset(), 9);
//!
//! support.save_document().unwrap();
//! assert_eq!(content.text(), ">> hello\nworld\n");
//! ```

use crate::config::SupportConfig;
use crate::document::{Bias, Document, DocumentEvent, ListenerId};
use crate::env::{
    ConfirmationHandler, ContentSource, NoUndoLog, PendingConfirmation, QuestionKind, Resume,
    Resumed, UndoLog, UserQuestion, ViewList, ViewRegistry,
};
use crate::error::{Result, SupportError};
use crate::line::{ClosedLineSet, DocumentLine, DocumentLineSet, LineSet};
use crate::line_ending::LineEnding;
use crate::line_vector::LineVector;
use crate::open_close::{
    CaretState, DocumentOpenClose, DocumentStatus, LifecycleEvent, LifecycleHooks,
};
use crate::position::{DocumentProvider, PositionManager, PositionRef};
use crate::sync::{lock, read, wait, write};
use crate::task::Task;
use crate::text::TextSnapshot;
use crate::ui::UiThread;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::SystemTime;

/// Notification sent to [`EditorSupport::subscribe`] callbacks.
#[derive(Debug, Clone)]
pub enum SupportEvent {
    /// The document was loaded.
    Opened,
    /// The document was closed.
    Closed,
    /// A reload started.
    ReloadStarted,
    /// A reload finished.
    ReloadFinished,
    /// A reload failed; the document keeps its previous text.
    ReloadFailed(SupportError),
    /// The first edit since the last load or save.
    Modified,
    /// The document matches its content source again.
    Unmodified,
    /// The document was written to its content source.
    Saved,
}

/// Callback registered with [`EditorSupport::subscribe`].
pub type SupportListener = Arc<dyn Fn(&SupportEvent) + Send + Sync>;

/// Handle returned by [`EditorSupport::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// The collaborators of an [`EditorSupport`].
#[derive(Clone)]
pub struct SupportEnv {
    /// Where the text is read from and written to.
    pub content: Arc<dyn ContentSource>,
    /// Undo history kept in sync with document identity.
    pub undo: Arc<dyn UndoLog>,
    /// Views whose carets survive a reload.
    pub views: Arc<dyn ViewRegistry>,
    /// Answers questions; without one every question fails with
    /// [`SupportError::ConfirmationRequired`], which can be confirmed later.
    pub confirmation: Option<Arc<dyn ConfirmationHandler>>,
    /// UI-affine thread used to capture view state.
    pub ui: Option<Arc<UiThread>>,
}

impl fmt::Debug for SupportEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupportEnv")
            .field("mime_type", &self.content.mime_type())
            .field("confirmation", &self.confirmation.is_some())
            .field("ui", &self.ui.is_some())
            .finish()
    }
}

impl SupportEnv {
    /// An environment with no undo log, no views, no confirmation handler and no UI thread.
    pub fn new(content: Arc<dyn ContentSource>) -> Self {
        Self {
            content,
            undo: Arc::new(NoUndoLog),
            views: Arc::new(ViewList::new()),
            confirmation: None,
            ui: None,
        }
    }

    /// Set the undo log.
    pub fn with_undo_log(mut self, undo: Arc<dyn UndoLog>) -> Self {
        self.undo = undo;
        self
    }

    /// Set the view registry.
    pub fn with_views(mut self, views: Arc<dyn ViewRegistry>) -> Self {
        self.views = views;
        self
    }

    /// Set the confirmation handler.
    pub fn with_confirmation(mut self, handler: Arc<dyn ConfirmationHandler>) -> Self {
        self.confirmation = Some(handler);
        self
    }

    /// Set the UI thread.
    pub fn with_ui_thread(mut self, ui: Arc<UiThread>) -> Self {
        self.ui = Some(ui);
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Reading {
    Load,
    Reload,
}

struct SupportState {
    modified: bool,
    document_id: Option<u64>,
    line_set: Option<Arc<DocumentLineSet>>,
    edit_listener: Option<ListenerId>,
    last_save_time: Option<SystemTime>,
    line_ending: LineEnding,
    last_line_count: Option<usize>,
}

struct SupportShared {
    this: Weak<SupportShared>,
    config: SupportConfig,
    env: SupportEnv,
    lifecycle: DocumentOpenClose,
    positions: Arc<PositionManager>,
    lines: Arc<LineVector<DocumentLine>>,
    state: Mutex<SupportState>,
    reloading: AtomicBool,
    size_confirmed: AtomicBool,
    saving: Mutex<bool>,
    save_done: Condvar,
    listeners: Mutex<Vec<(SubscriptionId, SupportListener)>>,
    next_listener: AtomicU64,
    redirect: RwLock<Option<EditorSupport>>,
}

/// Editor support of one logical document.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct EditorSupport {
    shared: Arc<SupportShared>,
}

impl fmt::Debug for EditorSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EditorSupport")
            .field("document_id", &self.shared.config.document_id)
            .field("status", &self.shared.lifecycle.status())
            .field("modified", &lock(&self.shared.state).modified)
            .finish()
    }
}

struct SaveSlot<'a> {
    shared: &'a SupportShared,
}

impl Drop for SaveSlot<'_> {
    fn drop(&mut self) {
        *lock(&self.shared.saving) = false;
        self.shared.save_done.notify_all();
    }
}

impl EditorSupport {
    /// Create a support; nothing is read until the document is first opened.
    pub fn new(env: SupportEnv, config: SupportConfig) -> Self {
        let shared = Arc::new_cyclic(|this: &Weak<SupportShared>| {
            let hooks: Weak<dyn LifecycleHooks> = this.clone();
            let provider: Weak<dyn DocumentProvider> = this.clone();
            SupportShared {
                this: this.clone(),
                lifecycle: DocumentOpenClose::new(config.clone(), hooks, env.ui.clone()),
                positions: Arc::new(PositionManager::new(
                    provider,
                    config.position_sweep_threshold,
                )),
                lines: Arc::new(LineVector::new(config.line_vector_min_gc)),
                state: Mutex::new(SupportState {
                    modified: false,
                    document_id: None,
                    line_set: None,
                    edit_listener: None,
                    last_save_time: None,
                    line_ending: LineEnding::default(),
                    last_line_count: None,
                }),
                reloading: AtomicBool::new(false),
                size_confirmed: AtomicBool::new(false),
                saving: Mutex::new(false),
                save_done: Condvar::new(),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                redirect: RwLock::new(None),
                config,
                env,
            }
        });
        Self { shared }
    }

    /// The configuration.
    pub fn config(&self) -> &SupportConfig {
        &self.shared.config
    }

    /// Forward every operation to `target`, or stop forwarding with `None`.
    ///
    /// Fails with [`SupportError::InvalidState`] if forwarding would loop back to this support.
    pub fn set_redirect(&self, target: Option<EditorSupport>) -> Result<()> {
        if let Some(target) = &target {
            if target.resolve().same_support(self) {
                return Err(SupportError::InvalidState(
                    "redirect would form a cycle".to_string(),
                ));
            }
        }
        *write(&self.shared.redirect) = target;
        Ok(())
    }

    /// The support operations are forwarded to, if any.
    pub fn redirect(&self) -> Option<EditorSupport> {
        read(&self.shared.redirect).clone()
    }

    /// Whether both handles share the same state.
    pub fn same_support(&self, other: &EditorSupport) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn resolve(&self) -> EditorSupport {
        let mut current = self.clone();
        loop {
            let next = read(&current.shared.redirect).clone();
            match next {
                Some(next) => current = next,
                None => return current,
            }
        }
    }

    /// Open the document, loading it if needed; blocks until it is loaded.
    pub fn open_document(&self) -> Result<Arc<Document>> {
        self.resolve().shared.lifecycle.open()
    }

    /// Start loading the document without blocking.
    pub fn prepare_document(&self) -> Task<Arc<Document>> {
        self.resolve().shared.lifecycle.open_task()
    }

    /// The open document, if any. Never loads.
    pub fn document(&self) -> Option<Arc<Document>> {
        self.resolve().shared.lifecycle.document()
    }

    /// Lifecycle status of the document.
    pub fn status(&self) -> DocumentStatus {
        self.resolve().shared.lifecycle.status()
    }

    /// Whether the document is in memory or a load is running.
    ///
    /// See [`is_document_ready`](Self::is_document_ready) to know whether loading finished.
    pub fn is_document_loaded(&self) -> bool {
        let target = self.resolve();
        let lifecycle = &target.shared.lifecycle;
        lifecycle.status() == DocumentStatus::Loading || lifecycle.is_loaded()
    }

    /// Whether the document is in memory and no load or reload is running.
    pub fn is_document_ready(&self) -> bool {
        let target = self.resolve();
        let lifecycle = &target.shared.lifecycle;
        lifecycle.status() == DocumentStatus::Opened && lifecycle.is_loaded()
    }

    /// Whether the document has edits that were not saved.
    pub fn is_modified(&self) -> bool {
        lock(&self.resolve().shared.state).modified
    }

    /// Line ending written on save.
    pub fn line_ending(&self) -> LineEnding {
        lock(&self.resolve().shared.state).line_ending
    }

    /// Close the document right away; unsaved edits are discarded.
    pub fn close(&self) -> Task<()> {
        self.resolve().shared.lifecycle.close()
    }

    /// Close the document, saving unsaved edits first.
    ///
    /// A modified document asks [`QuestionKind::SaveBeforeClose`]. Confirming saves and
    /// closes; refusing keeps the document open and fails with [`SupportError::Refused`].
    /// Use [`close`](Self::close) to discard the edits instead.
    pub fn close_with_confirmation(&self) -> Result<Task<()>> {
        let target = self.resolve();
        let shared = &target.shared;
        if !lock(&shared.state).modified {
            return Ok(shared.lifecycle.close());
        }

        shared.ask(
            UserQuestion::new(
                QuestionKind::SaveBeforeClose,
                format!(
                    "{} has unsaved changes. Save them before closing?",
                    shared.config.document_id
                ),
            ),
            |shared: &SupportShared| {
                shared.save()?;
                shared.lifecycle.close().wait().map(|()| Resumed::Closed)
            },
        )?;
        shared.save()?;
        Ok(shared.lifecycle.close())
    }

    /// Refill the open document from the content source.
    ///
    /// Positions and view carets keep their line and column.
    pub fn reload(&self) -> Result<Task<()>> {
        self.resolve().shared.lifecycle.reload()
    }

    /// Reload if the content source changed since the last load or save.
    ///
    /// A modified document asks [`QuestionKind::ExternalModificationOnReload`] first. Returns
    /// the reload task, or `None` when nothing changed or nothing is open.
    pub fn check_external_modification(&self) -> Result<Option<Task<()>>> {
        let target = self.resolve();
        let shared = &target.shared;
        if !shared.lifecycle.is_loaded() {
            return Ok(None);
        }

        let changed = shared.env.content.last_modified()?;
        let (saved, modified) = {
            let state = lock(&shared.state);
            (state.last_save_time, state.modified)
        };
        if saved.is_some_and(|saved| changed <= saved) {
            return Ok(None);
        }

        log::debug!(
            "{}: content changed externally",
            shared.config.document_id
        );
        if modified {
            shared.ask(
                UserQuestion::new(
                    QuestionKind::ExternalModificationOnReload,
                    format!(
                        "{} was changed by another program. Discard your changes and reload?",
                        shared.config.document_id
                    ),
                ),
                |shared: &SupportShared| {
                    shared.lifecycle.reload()?.wait().map(|()| Resumed::Reloaded)
                },
            )?;
        }
        shared.lifecycle.reload().map(Some)
    }

    /// Write the document to the content source.
    ///
    /// Concurrent saves are serialized; a save finding the document unmodified does nothing.
    pub fn save_document(&self) -> Result<()> {
        self.resolve().shared.save()
    }

    /// Create a position at character `offset`. See [`PositionManager::create_position_ref`].
    pub fn create_position_ref(&self, offset: usize, bias: Bias) -> PositionRef {
        self.resolve()
            .shared
            .positions
            .create_position_ref(offset, bias)
    }

    /// Create a position at `line`/`column`.
    pub fn create_position_ref_at(&self, line: usize, column: usize, bias: Bias) -> PositionRef {
        self.resolve()
            .shared
            .positions
            .create_position_ref_at(line, column, bias)
    }

    /// The position manager.
    pub fn position_manager(&self) -> Arc<PositionManager> {
        self.resolve().shared.positions.clone()
    }

    /// The line numbering snapshot.
    ///
    /// While the document is open the snapshot dates from the last load, reload or save.
    /// While it is closed, original and current numbers agree.
    pub fn line_set(&self) -> Arc<dyn LineSet> {
        let target = self.resolve();
        let shared = &target.shared;
        let state = lock(&shared.state);
        match &state.line_set {
            Some(set) => set.clone() as Arc<dyn LineSet>,
            None => Arc::new(ClosedLineSet::new(
                shared.lines.clone(),
                shared.positions.clone(),
                state.last_line_count,
            )),
        }
    }

    /// Register `callback` for [`SupportEvent`]s.
    ///
    /// Callbacks run on the thread that caused the event, with no lock held; they may call
    /// back into the support, [`open_document`](Self::open_document) included.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SupportEvent) + Send + Sync + 'static,
    {
        let target = self.resolve();
        let shared = &target.shared;
        let id = SubscriptionId(shared.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&shared.listeners).push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback; returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let target = self.resolve();
        let mut listeners = lock(&target.shared.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}

impl SupportShared {
    fn fire(&self, event: SupportEvent) {
        let listeners: Vec<SupportListener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        log::debug!("{}: {:?}", self.config.document_id, event);
        for listener in listeners {
            listener(&event);
        }
    }

    /// Ask `question`. Without a handler the error carries `resume`, which reruns the
    /// suspended operation once the question is confirmed.
    fn ask<F>(&self, question: UserQuestion, resume: F) -> Result<()>
    where
        F: Fn(&SupportShared) -> Result<Resumed> + Send + Sync + 'static,
    {
        let Some(handler) = &self.env.confirmation else {
            let this = self.this.clone();
            let resume: Resume = Arc::new(move || {
                let shared = this.upgrade().ok_or(SupportError::Released)?;
                resume(&*shared)
            });
            return Err(SupportError::ConfirmationRequired(PendingConfirmation::new(
                question, resume,
            )));
        };
        if handler.confirm(&question) {
            Ok(())
        } else {
            log::debug!("{}: refused: {}", self.config.document_id, question);
            Err(SupportError::Refused(question))
        }
    }

    /// Run `operation` with the large-file question answered.
    fn confirming_size<T>(&self, operation: impl FnOnce() -> Result<T>) -> Result<T> {
        self.size_confirmed.store(true, Ordering::Release);
        let result = operation();
        self.size_confirmed.store(false, Ordering::Release);
        result
    }

    /// Read and decode the content, asking first when it is oversized.
    fn read_text(&self, reading: Reading) -> Result<(LineEnding, String)> {
        let threshold = self.config.large_file_threshold;
        if let (Some(threshold), Some(len)) = (threshold, self.env.content.len_hint()) {
            if len > threshold && !self.size_confirmed.load(Ordering::Acquire) {
                let resume: fn(&SupportShared) -> Result<Resumed> = match reading {
                    Reading::Load => |shared: &SupportShared| {
                        shared
                            .confirming_size(|| shared.lifecycle.open())
                            .map(Resumed::Opened)
                    },
                    Reading::Reload => |shared: &SupportShared| {
                        shared
                            .confirming_size(|| shared.lifecycle.reload()?.wait())
                            .map(|()| Resumed::Reloaded)
                    },
                };
                self.ask(
                    UserQuestion::new(
                        QuestionKind::LargeFile,
                        format!(
                            "{} is {} bytes, more than {} bytes. Open it anyway?",
                            self.config.document_id, len, threshold
                        ),
                    ),
                    resume,
                )?;
            }
        }

        let bytes = self.env.content.read_all()?;
        let text = String::from_utf8(bytes).map_err(|err| SupportError::InvalidEncoding {
            valid_up_to: err.utf8_error().valid_up_to(),
        })?;
        Ok(LineEnding::split_text(text))
    }

    /// Edit guard of the open document: the first edit after a load or save must be allowed by
    /// the content source.
    fn check_modification(&self) -> Result<()> {
        if self.reloading.load(Ordering::Acquire) || lock(&self.state).modified {
            return Ok(());
        }
        self.env.content.allow_modification().map_err(|err| {
            log::debug!(
                "{}: modification rejected: {}",
                self.config.document_id,
                err
            );
            SupportError::from(err)
        })
    }

    fn document_edited(&self) {
        if self.reloading.load(Ordering::Acquire) {
            return;
        }
        let first = {
            let mut state = lock(&self.state);
            !std::mem::replace(&mut state.modified, true)
        };
        if first {
            self.lifecycle.pin();
            self.fire(SupportEvent::Modified);
        }
    }

    fn new_line_set(&self, doc: &Arc<Document>) -> Arc<DocumentLineSet> {
        Arc::new(DocumentLineSet::new(
            doc,
            self.lines.clone(),
            self.positions.clone(),
        ))
    }

    fn acquire_save_slot(&self) -> SaveSlot<'_> {
        let mut busy = lock(&self.saving);
        while *busy {
            busy = wait(&self.save_done, busy);
        }
        *busy = true;
        SaveSlot { shared: self }
    }

    fn save(&self) -> Result<()> {
        let _slot = self.acquire_save_slot();
        let id = &self.config.document_id;

        let Some(doc) = self.lifecycle.document() else {
            return Ok(());
        };
        let (modified, last_save_time, line_ending) = {
            let state = lock(&self.state);
            (state.modified, state.last_save_time, state.line_ending)
        };
        if !modified {
            return Ok(());
        }

        if let (Some(saved), Ok(changed)) = (last_save_time, self.env.content.last_modified()) {
            if changed > saved {
                // Confirming adopts the external timestamp, so the retried save is not stale.
                self.ask(
                    UserQuestion::new(
                        QuestionKind::ExternalModificationOnSave,
                        format!("{} was changed by another program. Overwrite it?", id),
                    ),
                    move |shared: &SupportShared| {
                        lock(&shared.state).last_save_time = Some(changed);
                        shared.save().map(|()| Resumed::Saved)
                    },
                )?;
            }
        }

        let version = doc.version();
        let bytes = line_ending.encode(&doc.text());
        log::debug!("{}: saving {} bytes", id, bytes.len());
        if let Err(err) = self.env.content.write_all(&bytes) {
            log::warn!("{}: save failed: {}", id, err);
            return Err(err.into());
        }

        self.env.undo.mark_checkpoint();
        let saved_at = self.env.content.last_modified().ok();
        let line_set = self.new_line_set(&doc);
        let (unmodified, old_set) = {
            let mut state = lock(&self.state);
            if saved_at.is_some() {
                state.last_save_time = saved_at;
            }
            let unmodified = doc.version() == version;
            if unmodified {
                state.modified = false;
            }
            let old_set = state.line_set.replace(line_set);
            (unmodified, old_set)
        };
        drop(old_set);

        if unmodified {
            self.lifecycle.unpin();
        }
        self.fire(SupportEvent::Saved);
        if unmodified {
            self.fire(SupportEvent::Unmodified);
        }
        Ok(())
    }

    fn attach(&self, doc: &Arc<Document>) {
        self.positions.document_opened(doc);
        let line_set = self.new_line_set(doc);

        let this = self.this.clone();
        let listener = doc.add_listener(Arc::new(move |_doc: &Document, _event: &DocumentEvent| {
            if let Some(shared) = this.upgrade() {
                shared.document_edited();
            }
        }));
        let this = self.this.clone();
        doc.set_edit_guard(Some(Arc::new(move |_doc: &Document| match this.upgrade() {
            Some(shared) => shared.check_modification(),
            None => Ok(()),
        })));

        self.env.undo.attach(doc);
        self.env.undo.discard_all();

        let old_set = {
            let mut state = lock(&self.state);
            state.modified = false;
            state.document_id = Some(doc.id());
            state.edit_listener = Some(listener);
            state.line_set.replace(line_set)
        };
        drop(old_set);
    }
}

impl DocumentProvider for SupportShared {
    fn document(&self) -> Option<Arc<Document>> {
        self.lifecycle.document()
    }

    fn open_document(&self) -> Result<Arc<Document>> {
        self.lifecycle.open()
    }
}

impl LifecycleHooks for SupportShared {
    fn load(&self) -> Result<Arc<Document>> {
        let (line_ending, text) = self.read_text(Reading::Load)?;
        let doc = Arc::new(Document::new(&text));
        let loaded_at = self.env.content.last_modified().ok();

        let mut state = lock(&self.state);
        state.line_ending = line_ending;
        state.last_save_time = loaded_at;
        Ok(doc)
    }

    fn bind(&self, document: &Arc<Document>) {
        self.attach(document);
    }

    fn unbind(&self, document: Option<&Arc<Document>>, snapshot: Option<&TextSnapshot>) {
        let (document_id, line_set, listener) = {
            let mut state = lock(&self.state);
            state.modified = false;
            state.last_line_count = snapshot.map(TextSnapshot::line_count);
            (
                state.document_id.take(),
                state.line_set.take(),
                state.edit_listener.take(),
            )
        };

        if let Some(id) = document_id {
            self.env.undo.detach(id);
        }
        match snapshot {
            Some(snapshot) => self.positions.document_closed(snapshot),
            None => self.positions.document_lost(),
        }
        if let Some(doc) = document {
            doc.set_edit_guard(None);
            if let Some(listener) = listener {
                doc.remove_listener(listener);
            }
        }
        drop(line_set);
    }

    fn capture_views(&self, document: &Arc<Document>) -> Vec<CaretState> {
        self.env
            .views
            .open_views()
            .into_iter()
            .map(|view| {
                let offset = view.caret_offset().min(document.len());
                let (line, column) = document.char_offset_to_position(offset);
                CaretState {
                    view,
                    offset,
                    line,
                    column,
                }
            })
            .collect()
    }

    fn reload(&self, document: &Arc<Document>, carets: &[CaretState]) -> Result<()> {
        let (line_ending, normalized) = self.read_text(Reading::Reload)?;
        let loaded_at = self.env.content.last_modified().ok();

        self.env.undo.detach(document.id());
        self.positions.document_closed(&document.snapshot());
        let old_set = lock(&self.state).line_set.take();
        drop(old_set);

        self.reloading.store(true, Ordering::Release);
        let replaced = document.replace_all(&normalized);
        self.reloading.store(false, Ordering::Release);

        self.positions.document_opened(document);
        let line_set = self.new_line_set(document);

        let restored: Vec<(CaretState, usize)> = carets
            .iter()
            .map(|caret| {
                let offset = document.position_to_char_offset(caret.line, caret.column);
                (caret.clone(), offset)
            })
            .collect();
        let restore = move || {
            for (caret, offset) in restored {
                caret.view.set_caret_offset(offset);
            }
        };
        match &self.env.ui {
            Some(ui) => ui.invoke_later(restore),
            None => restore(),
        }

        self.env.undo.attach(document);
        self.env.undo.discard_all();
        self.env.undo.mark_checkpoint();

        let was_modified = {
            let mut state = lock(&self.state);
            state.line_set = Some(line_set);
            state.line_ending = line_ending;
            if loaded_at.is_some() {
                state.last_save_time = loaded_at;
            }
            std::mem::replace(&mut state.modified, false)
        };
        self.lifecycle.unpin();
        if was_modified {
            self.fire(SupportEvent::Unmodified);
        }
        replaced
    }

    fn notify(&self, event: LifecycleEvent) {
        let event = match event {
            LifecycleEvent::Opened => SupportEvent::Opened,
            LifecycleEvent::Closed => SupportEvent::Closed,
            LifecycleEvent::ReloadStarted => SupportEvent::ReloadStarted,
            LifecycleEvent::ReloadFinished => SupportEvent::ReloadFinished,
            LifecycleEvent::ReloadFailed(err) => SupportEvent::ReloadFailed(err),
        };
        self.fire(event);
    }
}

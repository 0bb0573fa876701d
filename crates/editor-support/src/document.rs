//! The live text buffer.
//!
//! A [`Document`] is the mutable text behind every open view of a logical document. Besides the
//! text it keeps a table of [`LivePosition`] marks that move with edits, and a list of
//! listeners that receive a [`DocumentEvent`] after each edit.
//!
//! Edits are totally ordered: a document-wide edit lock is held while the text changes *and*
//! while listeners run, so every listener observes edits one at a time and in order. The text
//! itself is only write-locked during the change, so listeners may freely read the document
//! (line numbers, text) but must not edit it.

use crate::error::{Result, SupportError};
use crate::sync::{lock, read, write};
use crate::text::TextSnapshot;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

static NEXT_DOCUMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Which side of an insertion a position sticks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Bias {
    /// Text inserted at the position's offset lands before it; the position moves forward.
    #[default]
    Forward,
    /// Text inserted at the position's offset lands after it; the position stays.
    Backward,
}

#[derive(Debug)]
struct Mark {
    offset: AtomicUsize,
    bias: Bias,
}

/// A position bound to a live [`Document`] that follows its edits.
#[derive(Debug, Clone)]
pub struct LivePosition {
    mark: Arc<Mark>,
}

impl LivePosition {
    /// Current character offset.
    pub fn offset(&self) -> usize {
        self.mark.offset.load(Ordering::Acquire)
    }

    /// The bias the position was created with.
    pub fn bias(&self) -> Bias {
        self.mark.bias
    }
}

impl PartialEq for LivePosition {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.mark, &other.mark)
    }
}

impl Eq for LivePosition {}

/// A single edit, reported to document listeners after it has been applied.
///
/// Offsets are character offsets in the document *before* the edit; line/column describe
/// `offset` in that same pre-edit text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEvent {
    /// Start character offset of the edit.
    pub offset: usize,
    /// Line containing `offset`.
    pub line: usize,
    /// Column of `offset` within `line`.
    pub column: usize,
    /// Exact removed text (may be empty).
    pub removed_text: String,
    /// Exact inserted text (may be empty).
    pub inserted_text: String,
    /// Document version after the edit.
    pub version: u64,
}

impl DocumentEvent {
    /// Length of `removed_text` in characters.
    pub fn removed_len(&self) -> usize {
        self.removed_text.chars().count()
    }

    /// Length of `inserted_text` in characters.
    pub fn inserted_len(&self) -> usize {
        self.inserted_text.chars().count()
    }

    /// Number of line breaks removed.
    pub fn lines_removed(&self) -> usize {
        self.removed_text.matches('\n').count()
    }

    /// Number of line breaks inserted.
    pub fn lines_inserted(&self) -> usize {
        self.inserted_text.matches('\n').count()
    }

    /// Exclusive end character offset in the pre-edit document.
    pub fn end(&self) -> usize {
        self.offset + self.removed_len()
    }
}

/// Callback receiving edits of a document.
pub type DocumentListener = Arc<dyn Fn(&Document, &DocumentEvent) + Send + Sync>;

/// Handle returned by [`Document::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub(crate) type ReleaseHook = Box<dyn FnOnce(u64, TextSnapshot) + Send>;

/// Runs before every edit with the edit lock held; an error rejects the edit.
pub(crate) type EditGuard = Arc<dyn Fn(&Document) -> Result<()> + Send + Sync>;

/// The mutable text buffer of an open logical document.
pub struct Document {
    id: u64,
    text: RwLock<TextSnapshot>,
    marks: Mutex<Vec<Weak<Mark>>>,
    edit_lock: Mutex<()>,
    listeners: Mutex<Vec<(ListenerId, DocumentListener)>>,
    next_listener: AtomicU64,
    version: AtomicU64,
    release_hook: Mutex<Option<ReleaseHook>>,
    edit_guard: Mutex<Option<EditGuard>>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("version", &self.version())
            .finish()
    }
}

impl Document {
    /// Create a document holding `text`.
    pub fn new(text: &str) -> Self {
        Self {
            id: NEXT_DOCUMENT_ID.fetch_add(1, Ordering::Relaxed),
            text: RwLock::new(TextSnapshot::from_text(text)),
            marks: Mutex::new(Vec::new()),
            edit_lock: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            version: AtomicU64::new(0),
            release_hook: Mutex::new(None),
            edit_guard: Mutex::new(None),
        }
    }

    /// Process-unique identity of this buffer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of edits applied so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        read(&self.text).char_count()
    }

    /// Whether the document holds no text.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of lines (an empty document has one).
    pub fn line_count(&self) -> usize {
        read(&self.text).line_count()
    }

    /// Whole text.
    pub fn text(&self) -> String {
        read(&self.text).text()
    }

    /// Text of one line without its newline.
    pub fn line_text(&self, line: usize) -> Option<String> {
        read(&self.text).line_text(line)
    }

    /// Text of a character range, clamped to the document.
    pub fn slice(&self, start: usize, end: usize) -> String {
        read(&self.text).slice(start, end)
    }

    /// Line containing `offset` (clamped to the end).
    pub fn char_to_line(&self, offset: usize) -> usize {
        read(&self.text).char_to_line(offset)
    }

    /// Line and column of `offset` (clamped to the end).
    pub fn char_offset_to_position(&self, offset: usize) -> (usize, usize) {
        read(&self.text).char_offset_to_position(offset)
    }

    /// Offset of `line`/`column`, clamped to the document.
    pub fn position_to_char_offset(&self, line: usize, column: usize) -> usize {
        read(&self.text).position_to_char_offset(line, column)
    }

    /// Start offset of `line`, or `None` past the last line.
    pub fn line_start(&self, line: usize) -> Option<usize> {
        read(&self.text).line_start(line)
    }

    /// A cheap frozen copy of the current text.
    pub fn snapshot(&self) -> TextSnapshot {
        read(&self.text).clone()
    }

    /// Create a position that follows edits.
    pub fn create_position(&self, offset: usize, bias: Bias) -> Result<LivePosition> {
        let storage = read(&self.text);
        let len = storage.char_count();
        if offset > len {
            return Err(SupportError::OffsetOutOfRange { offset, len });
        }
        let mark = Arc::new(Mark {
            offset: AtomicUsize::new(offset),
            bias,
        });
        lock(&self.marks).push(Arc::downgrade(&mark));
        Ok(LivePosition { mark })
    }

    /// Insert `text` at character `offset`.
    pub fn insert(&self, offset: usize, text: &str) -> Result<()> {
        self.replace(offset, 0, text)
    }

    /// Remove `len` characters starting at `offset`.
    pub fn remove(&self, offset: usize, len: usize) -> Result<()> {
        self.replace(offset, len, "")
    }

    /// Replace `len` characters at `offset` with `text`.
    ///
    /// Listeners see one event per call. Listeners must not edit the document.
    ///
    /// Fails without changing anything when the range is out of bounds or the owner of the
    /// document rejects the edit.
    pub fn replace(&self, offset: usize, len: usize, text: &str) -> Result<()> {
        if len == 0 && text.is_empty() {
            return Ok(());
        }

        let _edit = lock(&self.edit_lock);
        let guard = lock(&self.edit_guard).clone();
        if let Some(guard) = guard {
            guard(self)?;
        }
        let event = {
            let mut storage = write(&self.text);
            let doc_len = storage.char_count();
            let end = offset.saturating_add(len);
            if end > doc_len {
                return Err(SupportError::OffsetOutOfRange {
                    offset: end,
                    len: doc_len,
                });
            }

            let (line, column) = storage.char_offset_to_position(offset);
            let removed_text = storage.slice(offset, end);
            storage.remove(offset, end);
            storage.insert(offset, text);

            let inserted_len = text.chars().count();
            self.shift_marks(offset, len, inserted_len);
            let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;

            DocumentEvent {
                offset,
                line,
                column,
                removed_text,
                inserted_text: text.to_string(),
                version,
            }
        };

        self.fire(&event);
        Ok(())
    }

    /// Replace the whole text with `text`.
    pub fn replace_all(&self, text: &str) -> Result<()> {
        let len = self.len();
        self.replace(0, len, text)
    }

    /// Register an edit listener.
    pub fn add_listener(&self, listener: DocumentListener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, listener));
        id
    }

    /// Unregister an edit listener; returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of live marks (positions still referenced somewhere).
    pub fn live_position_count(&self) -> usize {
        lock(&self.marks)
            .iter()
            .filter(|mark| mark.strong_count() > 0)
            .count()
    }

    pub(crate) fn set_release_hook(&self, hook: ReleaseHook) {
        *lock(&self.release_hook) = Some(hook);
    }

    pub(crate) fn clear_release_hook(&self) {
        lock(&self.release_hook).take();
    }

    pub(crate) fn set_edit_guard(&self, guard: Option<EditGuard>) {
        *lock(&self.edit_guard) = guard;
    }

    fn shift_marks(&self, offset: usize, removed: usize, inserted: usize) {
        let mut marks = lock(&self.marks);
        marks.retain(|weak| {
            let Some(mark) = weak.upgrade() else {
                return false;
            };
            let mut pos = mark.offset.load(Ordering::Acquire);

            if removed > 0 {
                if pos >= offset + removed {
                    pos -= removed;
                } else if pos > offset {
                    pos = offset;
                }
            }
            if inserted > 0 && (pos > offset || (pos == offset && mark.bias == Bias::Forward)) {
                pos += inserted;
            }

            mark.offset.store(pos, Ordering::Release);
            true
        });
    }

    fn fire(&self, event: &DocumentEvent) {
        let listeners: Vec<DocumentListener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(self, event);
        }
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        let hook = self
            .release_hook
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            let snapshot = self
                .text
                .get_mut()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            hook(self.id, snapshot);
        }
    }
}

//! Collaborators supplied by the embedding application.
//!
//! The core never touches files, widgets or dialogs directly. It reads and writes through a
//! [`ContentSource`], looks at open views through a [`ViewRegistry`], keeps undo history
//! consistent through an [`UndoLog`] and asks questions through a [`ConfirmationHandler`].
//! Simple implementations are provided for tests and headless hosts.

use crate::document::Document;
use crate::error::Result;
use crate::sync::lock;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Backing storage of a document.
pub trait ContentSource: Send + Sync {
    /// Read the whole content.
    fn read_all(&self) -> io::Result<Vec<u8>>;

    /// Replace the whole content.
    fn write_all(&self, bytes: &[u8]) -> io::Result<()>;

    /// Time of the last modification of the stored content.
    fn last_modified(&self) -> io::Result<SystemTime>;

    /// MIME type of the content.
    fn mime_type(&self) -> String {
        "text/plain".to_string()
    }

    /// Size of the stored content, if it can be known without reading it.
    fn len_hint(&self) -> Option<u64> {
        None
    }

    /// Called before the first edit after a load or save; an error rejects the edit.
    fn allow_modification(&self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryState {
    bytes: Vec<u8>,
    modified: SystemTime,
    fail_reads: bool,
    fail_writes: bool,
    read_only: bool,
}

/// In-memory [`ContentSource`].
///
/// Every write bumps the modification time; [`MemoryContent::touch`] simulates an external
/// change. Reads and writes can be made to fail to exercise error paths.
#[derive(Debug)]
pub struct MemoryContent {
    state: Mutex<MemoryState>,
    mime_type: String,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryContent {
    /// Create a source holding `text`.
    pub fn new(text: &str) -> Self {
        Self::from_bytes(text.as_bytes().to_vec())
    }

    /// Create a source holding raw bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                bytes,
                modified: SystemTime::now(),
                fail_reads: false,
                fail_writes: false,
                read_only: false,
            }),
            mime_type: "text/plain".to_string(),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Current content as text (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&lock(&self.state).bytes).into_owned()
    }

    /// Replace the content as if another program wrote it.
    pub fn set_external(&self, text: &str) {
        let mut state = lock(&self.state);
        state.bytes = text.as_bytes().to_vec();
        state.modified = later_than(state.modified);
    }

    /// Bump the modification time without changing the content.
    pub fn touch(&self) {
        let mut state = lock(&self.state);
        state.modified = later_than(state.modified);
    }

    /// Make subsequent reads fail.
    pub fn set_fail_reads(&self, fail: bool) {
        lock(&self.state).fail_reads = fail;
    }

    /// Make subsequent writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    /// Reject edits of documents loaded from this source.
    pub fn set_read_only(&self, read_only: bool) {
        lock(&self.state).read_only = read_only;
    }

    /// Number of successful reads.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

fn later_than(previous: SystemTime) -> SystemTime {
    let now = SystemTime::now();
    if now > previous {
        now
    } else {
        previous + std::time::Duration::from_millis(1)
    }
}

impl ContentSource for MemoryContent {
    fn read_all(&self) -> io::Result<Vec<u8>> {
        let state = lock(&self.state);
        if state.fail_reads {
            return Err(io::Error::other("read failure requested"));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(state.bytes.clone())
    }

    fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.fail_writes {
            return Err(io::Error::other("write failure requested"));
        }
        state.bytes = bytes.to_vec();
        state.modified = later_than(state.modified);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn last_modified(&self) -> io::Result<SystemTime> {
        Ok(lock(&self.state).modified)
    }

    fn mime_type(&self) -> String {
        self.mime_type.clone()
    }

    fn len_hint(&self) -> Option<u64> {
        Some(lock(&self.state).bytes.len() as u64)
    }

    fn allow_modification(&self) -> io::Result<()> {
        if lock(&self.state).read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "content is read-only",
            ));
        }
        Ok(())
    }
}

/// [`ContentSource`] backed by a file on disk.
#[derive(Debug, Clone)]
pub struct FileContent {
    path: PathBuf,
    mime_type: String,
}

impl FileContent {
    /// Create a source for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mime_type: "text/plain".to_string(),
        }
    }

    /// Override the reported MIME type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// The backing path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ContentSource for FileContent {
    fn read_all(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }

    fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        fs::write(&self.path, bytes)
    }

    fn last_modified(&self) -> io::Result<SystemTime> {
        fs::metadata(&self.path)?.modified()
    }

    fn mime_type(&self) -> String {
        self.mime_type.clone()
    }

    fn len_hint(&self) -> Option<u64> {
        fs::metadata(&self.path).ok().map(|meta| meta.len())
    }

    fn allow_modification(&self) -> io::Result<()> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.permissions().readonly() => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is read-only", self.path.display()),
            )),
            // A file that does not exist yet is created by the first save.
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

/// An open view of the document (an editor pane, a split, a remote cursor...).
pub trait EditorView: Send + Sync {
    /// Current caret offset in characters.
    fn caret_offset(&self) -> usize;

    /// Move the caret.
    fn set_caret_offset(&self, offset: usize);
}

/// Enumerates the views currently showing the document.
pub trait ViewRegistry: Send + Sync {
    /// Views open right now.
    fn open_views(&self) -> Vec<Arc<dyn EditorView>>;
}

/// A mutable list of views, usable as a [`ViewRegistry`].
#[derive(Default)]
pub struct ViewList {
    views: Mutex<Vec<Arc<dyn EditorView>>>,
}

impl ViewList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a view.
    pub fn add(&self, view: Arc<dyn EditorView>) {
        lock(&self.views).push(view);
    }

    /// Remove a view (by identity).
    pub fn remove(&self, view: &Arc<dyn EditorView>) {
        lock(&self.views).retain(|existing| !Arc::ptr_eq(existing, view));
    }
}

impl ViewRegistry for ViewList {
    fn open_views(&self) -> Vec<Arc<dyn EditorView>> {
        lock(&self.views).clone()
    }
}

/// Undo history kept consistent with document identity.
pub trait UndoLog: Send + Sync {
    /// Forget all recorded edits.
    fn discard_all(&self);

    /// Remember the current state as the saved one.
    fn mark_checkpoint(&self);

    /// Start recording edits of `document`.
    fn attach(&self, document: &Arc<Document>);

    /// Stop recording edits of the document with id `document_id`.
    ///
    /// Takes the id because the document may already be released when it closes.
    fn detach(&self, document_id: u64);
}

/// An [`UndoLog`] that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUndoLog;

impl UndoLog for NoUndoLog {
    fn discard_all(&self) {}
    fn mark_checkpoint(&self) {}
    fn attach(&self, _document: &Arc<Document>) {}
    fn detach(&self, _document_id: u64) {}
}

/// What a [`UserQuestion`] is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuestionKind {
    /// The content is larger than the configured threshold.
    LargeFile,
    /// The content changed on disk since it was loaded or saved, and a save would overwrite it.
    ExternalModificationOnSave,
    /// The content changed on disk while the document holds unsaved changes.
    ExternalModificationOnReload,
    /// The document holds unsaved changes and is about to close.
    SaveBeforeClose,
}

/// A recoverable condition that needs an explicit answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserQuestion {
    /// Kind of condition.
    pub kind: QuestionKind,
    /// Human readable description.
    pub message: String,
}

impl UserQuestion {
    /// Create a question.
    pub fn new(kind: QuestionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for UserQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// What a confirmed operation produced.
#[derive(Debug)]
pub enum Resumed {
    /// The document was loaded.
    Opened(Arc<Document>),
    /// The document was refilled from its content source.
    Reloaded,
    /// The document was written to its content source.
    Saved,
    /// The document was saved, then closed.
    Closed,
}

pub(crate) type Resume = Arc<dyn Fn() -> Result<Resumed> + Send + Sync>;

/// A [`UserQuestion`] nobody answered yet, together with the operation it suspended.
///
/// Returned inside [`SupportError::ConfirmationRequired`](crate::SupportError) when no
/// [`ConfirmationHandler`] is installed. Dropping it abandons the operation; [`confirm`]
/// answers yes and runs the operation again past this question.
///
/// [`confirm`]: PendingConfirmation::confirm
#[derive(Clone)]
pub struct PendingConfirmation {
    question: UserQuestion,
    resume: Resume,
}

impl PendingConfirmation {
    pub(crate) fn new(question: UserQuestion, resume: Resume) -> Self {
        Self { question, resume }
    }

    /// The question.
    pub fn question(&self) -> &UserQuestion {
        &self.question
    }

    /// Kind of the question.
    pub fn kind(&self) -> QuestionKind {
        self.question.kind
    }

    /// Answer yes and resume.
    ///
    /// The resumed operation may still fail, including with another question.
    pub fn confirm(self) -> Result<Resumed> {
        (self.resume)()
    }
}

impl fmt::Debug for PendingConfirmation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConfirmation")
            .field("question", &self.question)
            .finish()
    }
}

impl fmt::Display for PendingConfirmation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.question, f)
    }
}

/// Answers [`UserQuestion`]s (usually with a modal prompt).
pub trait ConfirmationHandler: Send + Sync {
    /// Return `true` to continue the suspended operation.
    fn confirm(&self, question: &UserQuestion) -> bool;
}

/// Accepts every question.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysConfirm;

impl ConfirmationHandler for AlwaysConfirm {
    fn confirm(&self, _question: &UserQuestion) -> bool {
        true
    }
}

/// Refuses every question.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysRefuse;

impl ConfirmationHandler for AlwaysRefuse {
    fn confirm(&self, _question: &UserQuestion) -> bool {
        false
    }
}

impl<F> ConfirmationHandler for F
where
    F: Fn(&UserQuestion) -> bool + Send + Sync,
{
    fn confirm(&self, question: &UserQuestion) -> bool {
        self(question)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_content_write_bumps_time() {
        let content = MemoryContent::new("a");
        let before = content.last_modified().unwrap();
        content.write_all(b"b").unwrap();
        assert!(content.last_modified().unwrap() > before);
        assert_eq!(content.text(), "b");
        assert_eq!(content.write_count(), 1);
    }

    #[test]
    fn test_memory_content_failures() {
        let content = MemoryContent::new("a");
        content.set_fail_reads(true);
        assert!(content.read_all().is_err());
        content.set_fail_reads(false);
        assert_eq!(content.read_all().unwrap(), b"a");
        assert_eq!(content.read_count(), 1);
    }

    #[test]
    fn test_file_content_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        fs::write(&path, "on disk").unwrap();

        let content = FileContent::new(&path).with_mime_type("text/x-notes");
        assert_eq!(content.read_all().unwrap(), b"on disk");
        assert_eq!(content.len_hint(), Some(7));
        content.write_all(b"rewritten").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "rewritten");
        assert_eq!(content.mime_type(), "text/x-notes");
        assert!(content.last_modified().is_ok());
    }

    #[test]
    fn test_read_only_memory_content_rejects_modification() {
        let content = MemoryContent::new("a");
        assert!(content.allow_modification().is_ok());
        content.set_read_only(true);
        let err = content.allow_modification().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_pending_confirmation_resumes_once_confirmed() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let pending = PendingConfirmation::new(
            UserQuestion::new(QuestionKind::SaveBeforeClose, "save first?"),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Resumed::Saved)
            }),
        );
        assert_eq!(pending.to_string(), "save first?");
        assert_eq!(pending.kind(), QuestionKind::SaveBeforeClose);

        // Dropping an unanswered copy runs nothing.
        drop(pending.clone());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(matches!(pending.confirm(), Ok(Resumed::Saved)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closure_confirmation_handler() {
        let handler = |question: &UserQuestion| question.kind == QuestionKind::LargeFile;
        assert!(handler.confirm(&UserQuestion::new(QuestionKind::LargeFile, "big")));
        assert!(!handler.confirm(&UserQuestion::new(
            QuestionKind::ExternalModificationOnSave,
            "changed"
        )));
    }
}

//! Logical lines.
//!
//! A [`DocumentLine`] is the identity of one line of text: it is anchored by a
//! [`PositionRef`] at the line start, so it keeps designating the same text while lines are
//! inserted or removed around it, and it survives close and reopen. Lines are materialized on
//! demand and shared through the support's [`LineVector`], so asking for the same line twice
//! yields the same object for as long as somebody holds it.
//!
//! A [`LineSet`] is a numbering snapshot. [`LineSet::original`] answers "which line was number
//! `n` when this snapshot was taken", [`LineSet::current`] answers "which line is number `n`
//! now". [`DocumentLineSet`] tracks the difference with a [`LineStruct`] updated on every edit;
//! [`ClosedLineSet`] serves lines while the document is not loaded.
//!
//! Lines can be split into [`Part`]s for annotations finer than a line. A part follows edits of
//! its text and moves to the line object it ends up on.

use crate::document::{Bias, Document, DocumentEvent, ListenerId};
use crate::error::{Result, SupportError};
use crate::line_struct::LineStruct;
use crate::line_vector::{DisposeNotice, LineVector, LineVectorGuard, NumberedLine};
use crate::position::{PositionManager, PositionRef};
use crate::sync::lock;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Shared handle of a line.
pub type LineRef = Arc<DocumentLine>;

/// A message attached to a line or a part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Annotation {
    /// Category, e.g. `"breakpoint"` or `"error"`.
    pub kind: String,
    /// Human readable text.
    pub message: String,
}

impl Annotation {
    /// Create an annotation.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Change of a [`DocumentLine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEvent {
    /// Lines were inserted or removed above the line.
    NumberChanged {
        /// Previous line number.
        old: usize,
        /// New line number.
        new: usize,
    },
    /// An annotation was added or removed.
    AnnotationsChanged,
}

/// Change of a [`Part`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartEvent {
    /// An edit touched the text of the part.
    TextChanged,
    /// The part now lives on another line object.
    LineChanged {
        /// Number of the line the part left.
        old: usize,
        /// Number of the line the part joined.
        new: usize,
    },
    /// An annotation was added or removed.
    AnnotationsChanged,
}

/// Callback receiving [`LineEvent`]s.
pub type LineListener = Arc<dyn Fn(&DocumentLine, &LineEvent) + Send + Sync>;

/// Callback receiving [`PartEvent`]s.
pub type PartListener = Arc<dyn Fn(&Part, &PartEvent) + Send + Sync>;

/// The identity of one line of a document.
pub struct DocumentLine {
    start: PositionRef,
    number: AtomicUsize,
    parts: Mutex<Vec<Weak<Part>>>,
    listeners: Mutex<Vec<LineListener>>,
    annotations: Mutex<Vec<Annotation>>,
    _notice: DisposeNotice,
}

impl fmt::Debug for DocumentLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentLine")
            .field("number", &self.line_number())
            .field("start", &self.start)
            .finish()
    }
}

impl NumberedLine for DocumentLine {
    fn line_number(&self) -> usize {
        DocumentLine::line_number(self)
    }
}

impl DocumentLine {
    fn new(start: PositionRef, number: usize, notice: DisposeNotice) -> Self {
        Self {
            start,
            number: AtomicUsize::new(number),
            parts: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            annotations: Mutex::new(Vec::new()),
            _notice: notice,
        }
    }

    /// Current line number.
    ///
    /// Computed from the line start when it can be without loading the document; otherwise the
    /// last computed number.
    pub fn line_number(&self) -> usize {
        match self.start.try_line_column() {
            Some((line, _)) => line,
            None => self.number.load(Ordering::Acquire),
        }
    }

    /// Position of the line start.
    pub fn start(&self) -> &PositionRef {
        &self.start
    }

    /// Text of the line without its newline, loading the document if needed.
    pub fn text(&self) -> Result<String> {
        let doc = self.start.manager().open_document()?;
        let line = self.start.line()?;
        Ok(doc.line_text(line).unwrap_or_default())
    }

    /// Register a listener.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&DocumentLine, &LineEvent) + Send + Sync + 'static,
    {
        lock(&self.listeners).push(Arc::new(listener));
    }

    /// Attach an annotation.
    pub fn annotate(&self, annotation: Annotation) {
        lock(&self.annotations).push(annotation);
        self.fire(&LineEvent::AnnotationsChanged);
    }

    /// Remove all annotations of `kind`; returns how many were removed.
    pub fn remove_annotations(&self, kind: &str) -> usize {
        let removed = {
            let mut annotations = lock(&self.annotations);
            let before = annotations.len();
            annotations.retain(|annotation| annotation.kind != kind);
            before - annotations.len()
        };
        if removed > 0 {
            self.fire(&LineEvent::AnnotationsChanged);
        }
        removed
    }

    /// Attached annotations.
    pub fn annotations(&self) -> Vec<Annotation> {
        lock(&self.annotations).clone()
    }

    /// Live parts of this line.
    pub fn parts(&self) -> Vec<Arc<Part>> {
        let mut parts = lock(&self.parts);
        parts.retain(|part| part.strong_count() > 0);
        parts.iter().filter_map(Weak::upgrade).collect()
    }

    /// Create a part covering `length` characters from `column`.
    ///
    /// The length is clamped to the end of the line.
    pub fn create_part(self: &Arc<Self>, column: usize, length: usize) -> Result<Arc<Part>> {
        let doc = self.start.manager().open_document()?;
        let line = self.start.line()?;
        let line_len = doc
            .line_text(line)
            .map(|text| text.chars().count())
            .unwrap_or(0);
        if column > line_len {
            return Err(SupportError::OffsetOutOfRange {
                offset: column,
                len: line_len,
            });
        }

        let offset = doc.position_to_char_offset(line, column);
        let length = length.min(line_len - column);
        let manager = self.start.manager();
        let part = Arc::new(Part {
            start: manager.create_position_ref(offset, Bias::Backward),
            end: manager.create_position_ref(offset + length, Bias::Forward),
            line: Mutex::new(self.clone()),
            listeners: Mutex::new(Vec::new()),
            annotations: Mutex::new(Vec::new()),
        });
        lock(&self.parts).push(Arc::downgrade(&part));
        Ok(part)
    }

    fn refresh(&self) {
        let new = self.line_number();
        let old = self.number.swap(new, Ordering::AcqRel);
        if old != new {
            self.fire(&LineEvent::NumberChanged { old, new });
        }
    }

    fn fire(&self, event: &LineEvent) {
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener(self, event);
        }
    }
}

/// A sub-range of a line.
pub struct Part {
    start: PositionRef,
    end: PositionRef,
    line: Mutex<LineRef>,
    listeners: Mutex<Vec<PartListener>>,
    annotations: Mutex<Vec<Annotation>>,
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part")
            .field("start", &self.start.offset())
            .field("length", &self.length())
            .finish()
    }
}

impl Part {
    /// The line object currently owning the part.
    pub fn line(&self) -> LineRef {
        lock(&self.line).clone()
    }

    /// Start column within the owning line.
    pub fn column(&self) -> Result<usize> {
        self.start.column()
    }

    /// Length in characters.
    pub fn length(&self) -> usize {
        self.end.offset().saturating_sub(self.start.offset())
    }

    /// Text of the part, loading the document if needed.
    pub fn text(&self) -> Result<String> {
        let doc = self.start.manager().open_document()?;
        Ok(doc.slice(self.start.offset(), self.end.offset()))
    }

    /// Register a listener.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&Part, &PartEvent) + Send + Sync + 'static,
    {
        lock(&self.listeners).push(Arc::new(listener));
    }

    /// Attach an annotation.
    pub fn annotate(&self, annotation: Annotation) {
        lock(&self.annotations).push(annotation);
        self.fire(&PartEvent::AnnotationsChanged);
    }

    /// Attached annotations.
    pub fn annotations(&self) -> Vec<Annotation> {
        lock(&self.annotations).clone()
    }

    fn fire(&self, event: &PartEvent) {
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener(self, event);
        }
    }
}

/// A numbering snapshot of the lines of a document.
pub trait LineSet: Send + Sync {
    /// Every line object materialized so far, in line order.
    fn lines(&self) -> Result<Vec<LineRef>>;

    /// The line that had number `line` when the snapshot was taken.
    fn original(&self, line: usize) -> Result<LineRef>;

    /// The line that has number `line` now.
    fn current(&self, line: usize) -> Result<LineRef>;

    /// Number `line` had when the snapshot was taken, or `None` if it did not exist then.
    fn original_line_number(&self, line: &DocumentLine) -> Option<usize> {
        find_original_line_number(self, line)
    }
}

/// Recover the original number of `line` using only [`LineSet::original`] lookups.
///
/// Original lines keep their relative order, so their current numbers grow with their original
/// numbers. The search first tries the line's own number, then finds the last valid original
/// number by doubling, and finally binary searches the originals by current number.
pub fn find_original_line_number<S: LineSet + ?Sized>(set: &S, line: &DocumentLine) -> Option<usize> {
    let is_same = |candidate: &LineRef| std::ptr::eq(Arc::as_ptr(candidate), line);
    let number = line.line_number();
    if set.original(number).is_ok_and(|found| is_same(&found)) {
        return Some(number);
    }

    set.original(0).ok()?;
    let mut high = 1;
    while set.original(high).is_ok() {
        if high > usize::MAX / 4 {
            break;
        }
        high *= 2;
    }
    let mut low = high / 2;
    while high - low > 1 {
        let mid = low + (high - low) / 2;
        if set.original(mid).is_ok() {
            low = mid;
        } else {
            high = mid;
        }
    }
    let max = low;

    let (mut lo, mut hi) = (0, max + 1);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let found = set.original(mid).ok()?;
        if is_same(&found) {
            return Some(mid);
        }
        if found.line_number() < number {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }

    // Merged lines share a number; check every original that maps onto it.
    (lo..=max)
        .map_while(|n| set.original(n).ok().map(|found| (n, found)))
        .take_while(|(_, found)| found.line_number() == number)
        .find(|(_, found)| is_same(found))
        .map(|(n, _)| n)
}

/// Whether `line` is one of the objects `vector` tracks under its number; merged lines share one.
fn holds_line(vector: &LineVector<DocumentLine>, line: &DocumentLine) -> bool {
    let number = line.line_number();
    vector.lock().is_ok_and(|mut guard| {
        guard
            .lines_in_range(number, number)
            .iter()
            .any(|known| std::ptr::eq(Arc::as_ptr(known), line))
    })
}

fn create_line(
    manager: &Arc<PositionManager>,
    vector: &LineVector<DocumentLine>,
    doc: &Document,
    line: usize,
) -> Result<LineRef> {
    let offset = doc.line_start(line).ok_or(SupportError::LineOutOfRange {
        line,
        max: doc.line_count(),
    })?;
    let start = manager.create_position_ref(offset, Bias::Forward);
    Ok(Arc::new(DocumentLine::new(start, line, vector.dispose_notice())))
}

#[derive(Debug, Clone, Copy)]
struct EditSpan {
    line: usize,
    offset: usize,
    inserted_len: usize,
}

struct SetShared {
    vector: Arc<LineVector<DocumentLine>>,
    manager: Arc<PositionManager>,
    structure: Mutex<LineStruct>,
    original_count: usize,
    document: Weak<Document>,
    listener: Mutex<Option<ListenerId>>,
}

impl SetShared {
    fn document(&self) -> Result<Arc<Document>> {
        match self.document.upgrade() {
            Some(doc) => Ok(doc),
            None => self.manager.open_document(),
        }
    }

    fn document_changed(self: &Arc<Self>, event: &DocumentEvent) {
        {
            let mut structure = lock(&self.structure);
            let removed = event.lines_removed();
            if removed > 0 {
                let at = if event.column == 0 && event.removed_text.ends_with('\n') {
                    event.line
                } else {
                    event.line + 1
                };
                structure.delete_lines(at, removed);
            }
            let inserted = event.lines_inserted();
            if inserted > 0 {
                let at = if event.column == 0 {
                    event.line
                } else {
                    event.line + 1
                };
                structure.insert_lines(at, inserted);
            }
        }

        let span = EditSpan {
            line: event.line,
            offset: event.offset,
            inserted_len: event.inserted_len(),
        };
        let set = Arc::downgrade(self);
        self.vector
            .request_update(Box::new(move |guard: &mut LineVectorGuard<'_, DocumentLine>| {
                if let Some(set) = set.upgrade() {
                    set.refresh_lines(guard, span);
                }
            }));
    }

    /// Refresh numbers of the lines at or after the edit and revalidate their parts.
    fn refresh_lines(&self, guard: &mut LineVectorGuard<'_, DocumentLine>, span: EditSpan) {
        let doc = self.document.upgrade();
        for line in guard.lines_in_range(span.line, usize::MAX) {
            line.refresh();
            for part in line.parts() {
                let start = part.start.offset();
                let end = part.end.offset();
                if span.offset <= end && span.offset + span.inserted_len >= start {
                    part.fire(&PartEvent::TextChanged);
                }

                let Some(doc) = doc.as_ref() else {
                    continue;
                };
                let part_line = doc.char_to_line(start);
                let owner = line.line_number();
                if part_line == owner {
                    continue;
                }
                let mut creator = |n: usize| create_line(&self.manager, &self.vector, doc, n);
                match guard.find_or_create(part_line, Some(&mut creator)) {
                    Ok(Some(target)) if !Arc::ptr_eq(&target, &line) => {
                        lock(&line.parts).retain(|p| !std::ptr::eq(p.as_ptr(), Arc::as_ptr(&part)));
                        lock(&target.parts).push(Arc::downgrade(&part));
                        *lock(&part.line) = target.clone();
                        part.fire(&PartEvent::LineChanged {
                            old: owner,
                            new: part_line,
                        });
                    }
                    Ok(_) => {}
                    Err(err) => log::warn!("part could not follow its line: {}", err),
                }
            }
        }
    }
}

/// Line set of an open document, numbering relative to the text at creation.
pub struct DocumentLineSet {
    shared: Arc<SetShared>,
}

impl fmt::Debug for DocumentLineSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentLineSet")
            .field("original_count", &self.shared.original_count)
            .field("structure", &*lock(&self.shared.structure))
            .finish()
    }
}

impl DocumentLineSet {
    /// Snapshot the line numbering of `doc`.
    ///
    /// Lines are shared through `vector`, so they keep their identity across snapshots.
    pub fn new(
        doc: &Arc<Document>,
        vector: Arc<LineVector<DocumentLine>>,
        manager: Arc<PositionManager>,
    ) -> Self {
        let shared = Arc::new(SetShared {
            vector,
            manager,
            structure: Mutex::new(LineStruct::new()),
            original_count: doc.line_count(),
            document: Arc::downgrade(doc),
            listener: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        let id = doc.add_listener(Arc::new(move |_doc: &Document, event: &DocumentEvent| {
            if let Some(shared) = weak.upgrade() {
                shared.document_changed(event);
            }
        }));
        *lock(&shared.listener) = Some(id);

        Self { shared }
    }

    /// Number of lines when the snapshot was taken.
    pub fn original_line_count(&self) -> usize {
        self.shared.original_count
    }

    /// Whether no line was inserted or removed since the snapshot.
    pub fn is_unchanged(&self) -> bool {
        lock(&self.shared.structure).is_identity()
    }
}

impl LineSet for DocumentLineSet {
    fn lines(&self) -> Result<Vec<LineRef>> {
        Ok(self.shared.vector.lock()?.lines())
    }

    fn original(&self, line: usize) -> Result<LineRef> {
        if line >= self.shared.original_count {
            return Err(SupportError::LineOutOfRange {
                line,
                max: self.shared.original_count,
            });
        }
        let current = lock(&self.shared.structure).convert(line, false);
        let count = self.shared.document()?.line_count();
        self.current(current.min(count.saturating_sub(1)))
    }

    fn current(&self, line: usize) -> Result<LineRef> {
        let doc = self.shared.document()?;
        let count = doc.line_count();
        if line >= count {
            return Err(SupportError::LineOutOfRange { line, max: count });
        }

        let shared = &self.shared;
        let mut guard = shared.vector.lock()?;
        let mut creator = |n: usize| create_line(&shared.manager, &shared.vector, &doc, n);
        guard
            .find_or_create(line, Some(&mut creator))?
            .ok_or_else(|| SupportError::InvalidState("line was not created".to_string()))
    }

    fn original_line_number(&self, line: &DocumentLine) -> Option<usize> {
        let current = line.line_number();
        if !holds_line(&self.shared.vector, line) {
            return None;
        }

        let structure = lock(&self.shared.structure);
        let original = structure.convert(current, true);
        (original < self.shared.original_count && structure.convert(original, false) == current)
            .then_some(original)
    }
}

impl Drop for DocumentLineSet {
    fn drop(&mut self) {
        let id = lock(&self.shared.listener).take();
        if let (Some(id), Some(doc)) = (id, self.shared.document.upgrade()) {
            doc.remove_listener(id);
        }
    }
}

/// Line set used while the document is not loaded; original and current numbering agree.
pub struct ClosedLineSet {
    vector: Arc<LineVector<DocumentLine>>,
    manager: Arc<PositionManager>,
    line_count: Option<usize>,
}

impl fmt::Debug for ClosedLineSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosedLineSet")
            .field("line_count", &self.line_count)
            .finish()
    }
}

impl ClosedLineSet {
    /// Create a set; `line_count` bounds the valid numbers when the last text is known.
    pub fn new(
        vector: Arc<LineVector<DocumentLine>>,
        manager: Arc<PositionManager>,
        line_count: Option<usize>,
    ) -> Self {
        Self {
            vector,
            manager,
            line_count,
        }
    }
}

impl LineSet for ClosedLineSet {
    fn lines(&self) -> Result<Vec<LineRef>> {
        Ok(self.vector.lock()?.lines())
    }

    fn original(&self, line: usize) -> Result<LineRef> {
        self.current(line)
    }

    fn current(&self, line: usize) -> Result<LineRef> {
        if let Some(max) = self.line_count {
            if line >= max {
                return Err(SupportError::LineOutOfRange { line, max });
            }
        }

        let mut guard = self.vector.lock()?;
        let mut creator = |n: usize| -> Result<LineRef> {
            let start = self.manager.create_position_ref_at(n, 0, Bias::Forward);
            Ok(Arc::new(DocumentLine::new(start, n, self.vector.dispose_notice())))
        };
        guard
            .find_or_create(line, Some(&mut creator))?
            .ok_or_else(|| SupportError::InvalidState("line was not created".to_string()))
    }

    fn original_line_number(&self, line: &DocumentLine) -> Option<usize> {
        holds_line(&self.vector, line).then(|| line.line_number())
    }
}

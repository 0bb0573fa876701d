//! Positions that outlive the document they point into.
//!
//! A [`PositionRef`] is a logical location in a document that may or may not be loaded. While
//! the document is open the reference wraps a [`LivePosition`] that follows edits; while it is
//! closed the reference keeps a plain description (offset, line/column, or all three captured at
//! close time). The owning [`PositionManager`] flips every tracked reference between the two
//! forms when the document opens or closes.
//!
//! References are tracked weakly. Dropping the last clone of a reference counts it as
//! collected, and the manager sweeps its chain once enough references have gone.
//!
//! Lock order is manager state first, then the kind of a single position. The document
//! provider is never called while either lock is held.

use crate::document::{Bias, Document, LivePosition};
use crate::error::{Result, SupportError};
use crate::sync::lock;
use crate::text::TextSnapshot;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Gives positions access to their document.
pub trait DocumentProvider: Send + Sync {
    /// The document if it is open right now. Never loads.
    fn document(&self) -> Option<Arc<Document>>;

    /// The document, loading it first if needed.
    fn open_document(&self) -> Result<Arc<Document>>;
}

#[derive(Debug, Clone)]
enum Kind {
    /// Bound to the live document with the given id.
    Live {
        position: LivePosition,
        document: u64,
    },
    /// Created by offset while the document was closed.
    Offset { offset: usize },
    /// Created by line and column while the document was closed.
    Line { line: usize, column: usize },
    /// Captured when the document closed.
    Out {
        offset: usize,
        line: usize,
        column: usize,
    },
}

impl Kind {
    /// Offset this kind designates in `doc`.
    fn resolve(&self, doc: &Document) -> usize {
        match *self {
            Kind::Live { ref position, .. } => position.offset().min(doc.len()),
            Kind::Offset { offset } => offset.min(doc.len()),
            Kind::Line { line, column } => doc.position_to_char_offset(line, column),
            Kind::Out {
                offset,
                line,
                column,
            } => {
                if line < doc.line_count() {
                    doc.position_to_char_offset(line, column)
                } else {
                    offset.min(doc.len())
                }
            }
        }
    }

    fn is_live_in(&self, doc: &Document) -> bool {
        matches!(self, Kind::Live { document, .. } if *document == doc.id())
    }
}

struct PositionCell {
    kind: Mutex<Kind>,
    bias: Bias,
    collected: Arc<AtomicUsize>,
}

impl PositionCell {
    fn kind(&self) -> Kind {
        lock(&self.kind).clone()
    }

    /// Bind to `doc` unless already bound to it.
    fn bind(&self, doc: &Document) -> Result<LivePosition> {
        let mut kind = lock(&self.kind);
        if let Kind::Live { position, document } = &*kind {
            if *document == doc.id() {
                return Ok(position.clone());
            }
        }
        let position = doc.create_position(kind.resolve(doc), self.bias)?;
        *kind = Kind::Live {
            position: position.clone(),
            document: doc.id(),
        };
        Ok(position)
    }

    /// Leave the live document. Without its final text only the offset is kept.
    fn unbind(&self, snapshot: Option<&TextSnapshot>) {
        let mut kind = lock(&self.kind);
        let Kind::Live { position, .. } = &*kind else {
            return;
        };
        let offset = position.offset();
        *kind = match snapshot {
            Some(snapshot) => {
                let offset = offset.min(snapshot.char_count());
                let (line, column) = snapshot.char_offset_to_position(offset);
                Kind::Out {
                    offset,
                    line,
                    column,
                }
            }
            None => Kind::Offset { offset },
        };
    }
}

impl Drop for PositionCell {
    fn drop(&mut self) {
        self.collected.fetch_add(1, Ordering::AcqRel);
    }
}

struct ManagerState {
    chain: Vec<Weak<PositionCell>>,
    document: Weak<Document>,
}

/// Tracks every [`PositionRef`] of one logical document.
pub struct PositionManager {
    state: Mutex<ManagerState>,
    collected: Arc<AtomicUsize>,
    sweep_threshold: usize,
    provider: Weak<dyn DocumentProvider>,
}

impl fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("PositionManager")
            .field("chain", &state.chain.len())
            .field("open", &(state.document.strong_count() > 0))
            .finish()
    }
}

impl PositionManager {
    /// Create a manager resolving documents through `provider`, sweeping its chain after
    /// `sweep_threshold` positions were dropped.
    pub fn new(provider: Weak<dyn DocumentProvider>, sweep_threshold: usize) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                chain: Vec::new(),
                document: Weak::new(),
            }),
            collected: Arc::new(AtomicUsize::new(0)),
            sweep_threshold,
            provider,
        }
    }

    /// Create a position at character `offset`.
    ///
    /// Never fails: while the document is open the offset is clamped to its length and the
    /// position is bound immediately, otherwise it is kept as given until the next open.
    pub fn create_position_ref(self: &Arc<Self>, offset: usize, bias: Bias) -> PositionRef {
        self.track(Kind::Offset { offset }, bias)
    }

    /// Create a position at `line`/`column`.
    pub fn create_position_ref_at(
        self: &Arc<Self>,
        line: usize,
        column: usize,
        bias: Bias,
    ) -> PositionRef {
        self.track(Kind::Line { line, column }, bias)
    }

    /// The document the positions are currently bound to.
    pub fn document(&self) -> Option<Arc<Document>> {
        lock(&self.state).document.upgrade()
    }

    /// Open the document through the provider.
    pub fn open_document(&self) -> Result<Arc<Document>> {
        self.provider
            .upgrade()
            .ok_or(SupportError::Released)?
            .open_document()
    }

    /// Bind every tracked position to `doc`.
    pub fn document_opened(&self, doc: &Arc<Document>) {
        let mut state = lock(&self.state);
        state.document = Arc::downgrade(doc);
        self.sweep(&mut state);
        let mut bound = 0;
        for cell in state.chain.iter().filter_map(Weak::upgrade) {
            match cell.bind(doc) {
                Ok(_) => bound += 1,
                Err(err) => log::warn!("position could not be bound to document {}: {}", doc.id(), err),
            }
        }
        log::trace!("bound {} positions to document {}", bound, doc.id());
    }

    /// Convert every tracked position to its out-of-memory form, using the final text of the
    /// closed document.
    pub fn document_closed(&self, snapshot: &TextSnapshot) {
        self.unbind_all(Some(snapshot));
    }

    /// Convert every tracked position to a plain offset when the final text of the closed
    /// document is not available. Line and column are recomputed on the next open.
    pub fn document_lost(&self) {
        self.unbind_all(None);
    }

    fn unbind_all(&self, snapshot: Option<&TextSnapshot>) {
        let mut state = lock(&self.state);
        state.document = Weak::new();
        self.sweep(&mut state);
        for cell in state.chain.iter().filter_map(Weak::upgrade) {
            cell.unbind(snapshot);
        }
        log::trace!(
            "unbound {} positions{}",
            state.chain.len(),
            if snapshot.is_some() { "" } else { " without final text" }
        );
    }

    /// Number of positions still referenced.
    pub fn live_count(&self) -> usize {
        lock(&self.state)
            .chain
            .iter()
            .filter(|cell| cell.strong_count() > 0)
            .count()
    }

    /// Number of chain entries, swept or not.
    pub fn chain_len(&self) -> usize {
        lock(&self.state).chain.len()
    }

    fn track(self: &Arc<Self>, kind: Kind, bias: Bias) -> PositionRef {
        let cell = Arc::new(PositionCell {
            kind: Mutex::new(kind),
            bias,
            collected: self.collected.clone(),
        });

        let mut state = lock(&self.state);
        if let Some(doc) = state.document.upgrade() {
            if let Err(err) = cell.bind(&doc) {
                log::warn!("new position left unbound: {}", err);
            }
        }
        if self.collected.load(Ordering::Acquire) >= self.sweep_threshold {
            self.sweep(&mut state);
        }
        state.chain.push(Arc::downgrade(&cell));
        drop(state);

        PositionRef {
            cell,
            manager: self.clone(),
        }
    }

    /// A live position in `doc` for `cell`.
    ///
    /// The cell itself is bound only when `doc` is the current document; otherwise the
    /// returned position is detached and the cell keeps its out-of-memory form.
    fn bind_current(&self, cell: &PositionCell, doc: &Arc<Document>) -> Result<LivePosition> {
        let state = lock(&self.state);
        let current = state
            .document
            .upgrade()
            .is_some_and(|current| Arc::ptr_eq(&current, doc));
        if current {
            cell.bind(doc)
        } else {
            doc.create_position(cell.kind().resolve(doc), cell.bias)
        }
    }

    fn sweep(&self, state: &mut ManagerState) {
        let collected = self.collected.load(Ordering::Acquire);
        let before = state.chain.len();
        state.chain.retain(|cell| cell.strong_count() > 0);
        self.collected.fetch_sub(collected, Ordering::AcqRel);
        if before != state.chain.len() {
            log::trace!("position sweep: {} -> {}", before, state.chain.len());
        }
    }
}

/// A stable logical position in a document.
///
/// Clones share the same position.
#[derive(Clone)]
pub struct PositionRef {
    cell: Arc<PositionCell>,
    manager: Arc<PositionManager>,
}

impl fmt::Debug for PositionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PositionRef")
            .field("kind", &self.cell.kind())
            .field("bias", &self.cell.bias)
            .finish()
    }
}

impl PartialEq for PositionRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Eq for PositionRef {}

impl PositionRef {
    /// The manager tracking this position.
    pub fn manager(&self) -> &Arc<PositionManager> {
        &self.manager
    }

    /// Insertion bias.
    pub fn bias(&self) -> Bias {
        self.cell.bias
    }

    /// Whether the position is bound to the live document.
    pub fn is_in_memory(&self) -> bool {
        matches!(self.cell.kind(), Kind::Live { .. })
    }

    /// Character offset.
    ///
    /// Never fails. A position created by line and column opens the document to translate
    /// itself; if that fails the failure is logged and `0` is returned.
    pub fn offset(&self) -> usize {
        match self.cell.kind() {
            Kind::Live { position, .. } => position.offset(),
            Kind::Offset { offset } | Kind::Out { offset, .. } => offset,
            kind @ Kind::Line { .. } => match self.manager.open_document() {
                Ok(doc) => match self.cell.kind() {
                    Kind::Live { position, .. } => position.offset(),
                    _ => kind.resolve(&doc),
                },
                Err(err) => {
                    log::warn!("cannot open document to resolve position: {}", err);
                    0
                }
            },
        }
    }

    /// Line number, opening the document if needed.
    pub fn line(&self) -> Result<usize> {
        self.line_column().map(|(line, _)| line)
    }

    /// Column within the line, opening the document if needed.
    pub fn column(&self) -> Result<usize> {
        self.line_column().map(|(_, column)| column)
    }

    /// Line and column, opening the document if needed.
    pub fn line_column(&self) -> Result<(usize, usize)> {
        if let Some(resolved) = self.try_line_column() {
            return Ok(resolved);
        }
        let doc = self.manager.open_document()?;
        match self.try_line_column() {
            Some(resolved) => Ok(resolved),
            None => Ok(doc.char_offset_to_position(self.cell.kind().resolve(&doc))),
        }
    }

    /// Line and column if they are known without opening the document.
    pub fn try_line_column(&self) -> Option<(usize, usize)> {
        match self.cell.kind() {
            Kind::Line { line, column } | Kind::Out { line, column, .. } => Some((line, column)),
            Kind::Offset { .. } => None,
            kind @ Kind::Live { .. } => {
                let doc = self.manager.document()?;
                kind.is_live_in(&doc)
                    .then(|| doc.char_offset_to_position(kind.resolve(&doc)))
            }
        }
    }

    /// The live position, opening the document if needed.
    pub fn position(&self) -> Result<LivePosition> {
        if let Kind::Live { position, document } = self.cell.kind() {
            if self.manager.document().is_some_and(|doc| doc.id() == document) {
                return Ok(position);
            }
        }
        let doc = self.manager.open_document()?;
        self.manager.bind_current(&self.cell, &doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    struct TestProvider {
        text: Mutex<String>,
        doc: Mutex<Option<Arc<Document>>>,
        opens: AtomicUsize,
        manager: OnceLock<Arc<PositionManager>>,
    }

    impl TestProvider {
        fn setup(text: &str) -> (Arc<TestProvider>, Arc<PositionManager>) {
            let provider = Arc::new(TestProvider {
                text: Mutex::new(text.to_string()),
                doc: Mutex::new(None),
                opens: AtomicUsize::new(0),
                manager: OnceLock::new(),
            });
            let weak = Arc::downgrade(&provider);
            let weak: Weak<dyn DocumentProvider> = weak;
            let manager = Arc::new(PositionManager::new(weak, 8));
            let _ = provider.manager.set(manager.clone());
            (provider, manager)
        }

        fn close(&self) {
            let doc = self.doc.lock().unwrap().take();
            if let Some(doc) = doc {
                *self.text.lock().unwrap() = doc.text();
                self.manager.get().unwrap().document_closed(&doc.snapshot());
            }
        }
    }

    impl DocumentProvider for TestProvider {
        fn document(&self) -> Option<Arc<Document>> {
            self.doc.lock().unwrap().clone()
        }

        fn open_document(&self) -> Result<Arc<Document>> {
            let mut slot = self.doc.lock().unwrap();
            if let Some(doc) = slot.as_ref() {
                return Ok(doc.clone());
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            let doc = Arc::new(Document::new(&self.text.lock().unwrap()));
            self.manager.get().unwrap().document_opened(&doc);
            *slot = Some(doc.clone());
            Ok(doc)
        }
    }

    #[test]
    fn test_closed_position_keeps_offset_and_opens_for_line() {
        let (provider, manager) = TestProvider::setup("ab\ncd\nef");
        let pos = manager.create_position_ref(4, Bias::Forward);
        assert_eq!(pos.offset(), 4);
        assert!(!pos.is_in_memory());
        assert_eq!(provider.opens.load(Ordering::SeqCst), 0);

        assert_eq!(pos.line_column().unwrap(), (1, 1));
        assert_eq!(provider.opens.load(Ordering::SeqCst), 1);
        assert!(pos.is_in_memory());
    }

    #[test]
    fn test_position_follows_edits_and_survives_close() {
        let (provider, manager) = TestProvider::setup("hello\nworld\n");
        let doc = provider.open_document().unwrap();
        let pos = manager.create_position_ref(6, Bias::Forward);
        assert!(pos.is_in_memory());

        doc.insert(0, "> ").unwrap();
        assert_eq!(pos.offset(), 8);
        drop(doc);

        provider.close();
        assert!(!pos.is_in_memory());
        assert_eq!(pos.offset(), 8);
        assert_eq!(pos.try_line_column(), Some((1, 0)));

        let doc = provider.open_document().unwrap();
        assert_eq!(pos.offset(), 8);
        assert_eq!(doc.slice(pos.offset(), pos.offset() + 5), "world");
    }

    #[test]
    fn test_closed_position_reopens_by_line_and_column() {
        let (provider, manager) = TestProvider::setup("ab\ncd\n");
        provider.open_document().unwrap();
        let pos = manager.create_position_ref(4, Bias::Forward);
        provider.close();

        // The first line grows while the document is closed.
        *provider.text.lock().unwrap() = "abcdef\ncd\n".to_string();
        provider.open_document().unwrap();
        assert_eq!(pos.offset(), 8);
        assert_eq!(pos.line_column().unwrap(), (1, 1));
    }

    #[test]
    fn test_bias_is_honored_after_open() {
        let (provider, manager) = TestProvider::setup("abc");
        let forward = manager.create_position_ref(1, Bias::Forward);
        let backward = manager.create_position_ref(1, Bias::Backward);
        let doc = provider.open_document().unwrap();

        doc.insert(1, "xy").unwrap();
        assert_eq!(forward.offset(), 3);
        assert_eq!(backward.offset(), 1);
        assert_eq!(backward.bias(), Bias::Backward);
    }

    #[test]
    fn test_line_kind_resolves_on_open() {
        let (provider, manager) = TestProvider::setup("one\ntwo\nthree");
        let pos = manager.create_position_ref_at(2, 3, Bias::Forward);
        assert_eq!(pos.try_line_column(), Some((2, 3)));
        assert_eq!(pos.offset(), 11);
        assert_eq!(provider.opens.load(Ordering::SeqCst), 1);

        let live = pos.position().unwrap();
        assert_eq!(live.offset(), 11);
    }

    #[test]
    fn test_dropped_positions_are_swept() {
        let (_provider, manager) = TestProvider::setup("text");
        let kept = manager.create_position_ref(1, Bias::Forward);
        for i in 0..20 {
            drop(manager.create_position_ref(i % 4, Bias::Forward));
        }
        let _last = manager.create_position_ref(2, Bias::Backward);
        assert!(manager.chain_len() < 12);
        assert_eq!(manager.live_count(), 2);
        assert_eq!(kept.offset(), 1);
    }

    #[test]
    fn test_position_of_stale_document_leaves_cell_alone() {
        let (provider, manager) = TestProvider::setup("ab\ncd\n");
        let doc = provider.open_document().unwrap();
        let pos = manager.create_position_ref(4, Bias::Forward);

        // The manager has closed while the provider still hands out the old buffer.
        manager.document_closed(&doc.snapshot());
        let live = pos.position().unwrap();
        assert_eq!(live.offset(), 4);
        assert!(!pos.is_in_memory());
        assert_eq!(pos.try_line_column(), Some((1, 1)));

        doc.insert(0, "xx").unwrap();
        assert_eq!(live.offset(), 6);
        assert_eq!(pos.offset(), 4);
    }

    #[test]
    fn test_lost_document_keeps_offsets() {
        let (provider, manager) = TestProvider::setup("hello\nworld\n");
        let doc = provider.open_document().unwrap();
        let pos = manager.create_position_ref(6, Bias::Forward);
        doc.insert(0, "> ").unwrap();

        manager.document_lost();
        assert!(!pos.is_in_memory());
        assert_eq!(pos.offset(), 8);
        assert_eq!(pos.try_line_column(), None);
    }

    #[test]
    fn test_released_provider_reports_error() {
        let (provider, manager) = TestProvider::setup("text");
        let pos = manager.create_position_ref(2, Bias::Forward);
        drop(provider);
        assert!(matches!(pos.line(), Err(SupportError::Released)));
        assert_eq!(pos.offset(), 2);
    }
}

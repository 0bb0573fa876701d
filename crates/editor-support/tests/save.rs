use editor_support::{
    AlwaysConfirm, AlwaysRefuse, ContentSource, EditorSupport, FileContent, MemoryContent,
    QuestionKind, Resumed, SupportConfig, SupportEnv, SupportError,
};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, SystemTime};

/// Slow writer that records how many writes overlap.
struct SlowContent {
    inner: MemoryContent,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowContent {
    fn new(text: &str) -> Self {
        Self {
            inner: MemoryContent::new(text),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

impl ContentSource for SlowContent {
    fn read_all(&self) -> io::Result<Vec<u8>> {
        self.inner.read_all()
    }

    fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        let result = self.inner.write_all(bytes);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn last_modified(&self) -> io::Result<SystemTime> {
        self.inner.last_modified()
    }
}

#[test]
fn test_concurrent_saves_write_once() {
    let content = Arc::new(SlowContent::new("draft\n"));
    let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());
    let doc = support.open_document().unwrap();
    doc.insert(0, "final ").unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let support = support.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                support.save_document()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(content.inner.write_count(), 1);
    assert_eq!(content.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(content.inner.text(), "final draft\n");
    assert!(!support.is_modified());
}

#[test]
fn test_save_after_new_edit_writes_again() {
    let content = Arc::new(MemoryContent::new("a"));
    let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());
    let doc = support.open_document().unwrap();

    doc.insert(1, "b").unwrap();
    support.save_document().unwrap();
    doc.insert(2, "c").unwrap();
    assert!(support.is_modified());
    support.save_document().unwrap();

    assert_eq!(content.write_count(), 2);
    assert_eq!(content.text(), "abc");
}

#[test]
fn test_save_without_document_is_noop() {
    let content = Arc::new(MemoryContent::new("untouched"));
    let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());
    support.save_document().unwrap();
    assert_eq!(content.write_count(), 0);
    assert_eq!(content.read_count(), 0);
}

#[test]
fn test_stale_content_needs_confirmation() {
    let content = Arc::new(MemoryContent::new("base\n"));
    let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());
    let doc = support.open_document().unwrap();
    doc.insert(0, "local ").unwrap();
    content.set_external("remote\n");

    let err = support.save_document().unwrap_err();
    assert!(matches!(err, SupportError::ConfirmationRequired(_)));
    assert_eq!(
        err.question().map(|question| question.kind),
        Some(QuestionKind::ExternalModificationOnSave)
    );
    assert!(support.is_modified());
    assert_eq!(content.text(), "remote\n");
}

#[test]
fn test_confirmed_stale_save_overwrites() {
    let content = Arc::new(MemoryContent::new("base\n"));
    let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());
    let doc = support.open_document().unwrap();
    doc.insert(0, "local ").unwrap();
    content.set_external("remote\n");

    let pending = match support.save_document() {
        Err(SupportError::ConfirmationRequired(pending)) => pending,
        other => panic!("expected a question, got {:?}", other),
    };
    assert!(pending.question().message.contains("changed by another program"));
    assert!(matches!(pending.confirm(), Ok(Resumed::Saved)));
    assert_eq!(content.text(), "local base\n");
    assert!(!support.is_modified());

    // The external change was accepted, so the next save is not stale.
    doc.insert(0, "more ").unwrap();
    support.save_document().unwrap();
    assert_eq!(content.text(), "more local base\n");
}

#[test]
fn test_stale_content_refused_or_overwritten() {
    let content = Arc::new(MemoryContent::new("base\n"));
    let refusing = EditorSupport::new(
        SupportEnv::new(content.clone()).with_confirmation(Arc::new(AlwaysRefuse)),
        SupportConfig::default(),
    );
    let doc = refusing.open_document().unwrap();
    doc.insert(0, "local ").unwrap();
    content.touch();
    assert!(matches!(
        refusing.save_document(),
        Err(SupportError::Refused(_))
    ));
    assert_eq!(content.write_count(), 0);

    let content = Arc::new(MemoryContent::new("base\n"));
    let accepting = EditorSupport::new(
        SupportEnv::new(content.clone()).with_confirmation(Arc::new(AlwaysConfirm)),
        SupportConfig::default(),
    );
    let doc = accepting.open_document().unwrap();
    doc.insert(0, "local ").unwrap();
    content.touch();
    accepting.save_document().unwrap();
    assert_eq!(content.text(), "local base\n");

    // The new timestamp is ours: the next save is not stale.
    doc.insert(0, "x").unwrap();
    accepting.save_document().unwrap();
    assert_eq!(content.write_count(), 2);
}

#[test]
fn test_failed_write_keeps_modified() {
    let content = Arc::new(MemoryContent::new("data"));
    let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());
    let doc = support.open_document().unwrap();
    doc.insert(4, "!").unwrap();

    content.set_fail_writes(true);
    assert!(matches!(support.save_document(), Err(SupportError::Io(_))));
    assert!(support.is_modified());

    content.set_fail_writes(false);
    support.save_document().unwrap();
    assert!(!support.is_modified());
    assert_eq!(content.text(), "data!");
}

#[test]
fn test_file_content_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "first\r\nsecond\r\n").unwrap();

    let support = EditorSupport::new(
        SupportEnv::new(Arc::new(FileContent::new(&path))),
        SupportConfig::default().with_document_id("notes.txt"),
    );
    let doc = support.open_document().unwrap();
    assert_eq!(doc.line_text(1).unwrap(), "second");

    doc.insert(doc.len(), "third\n").unwrap();
    support.save_document().unwrap();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "first\r\nsecond\r\nthird\r\n"
    );
}

use editor_support::{
    AlwaysRefuse, ContentSource, Document, DocumentStatus, EditorSupport, EditorView,
    MemoryContent, QuestionKind, Resumed, SupportConfig, SupportEnv, SupportError, SupportEvent,
    UiThread, UndoLog, ViewList,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

#[derive(Default)]
struct RecordingUndo {
    log: Mutex<Vec<String>>,
}

impl RecordingUndo {
    fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl UndoLog for RecordingUndo {
    fn discard_all(&self) {
        self.log.lock().unwrap().push("discard".to_string());
    }

    fn mark_checkpoint(&self) {
        self.log.lock().unwrap().push("checkpoint".to_string());
    }

    fn attach(&self, document: &Arc<Document>) {
        self.log
            .lock()
            .unwrap()
            .push(format!("attach {}", document.id()));
    }

    fn detach(&self, document_id: u64) {
        self.log.lock().unwrap().push(format!("detach {}", document_id));
    }
}

struct Caret(AtomicUsize);

impl EditorView for Caret {
    fn caret_offset(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn set_caret_offset(&self, offset: usize) {
        self.0.store(offset, Ordering::SeqCst);
    }
}

/// Content whose reads take `read_delay_ms`.
struct SlowReads {
    inner: MemoryContent,
    read_delay_ms: AtomicU64,
}

impl SlowReads {
    fn new(text: &str, delay: Duration) -> Self {
        Self {
            inner: MemoryContent::new(text),
            read_delay_ms: AtomicU64::new(delay.as_millis() as u64),
        }
    }
}

impl ContentSource for SlowReads {
    fn read_all(&self) -> io::Result<Vec<u8>> {
        thread::sleep(Duration::from_millis(self.read_delay_ms.load(Ordering::SeqCst)));
        self.inner.read_all()
    }

    fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)
    }

    fn last_modified(&self) -> io::Result<SystemTime> {
        self.inner.last_modified()
    }
}

fn events_of(support: &EditorSupport) -> Arc<Mutex<Vec<String>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    support.subscribe(move |event| sink.lock().unwrap().push(format!("{:?}", event)));
    events
}

fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_concurrent_opens_load_once() {
    let content = Arc::new(MemoryContent::new("one load only\n"));
    let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let support = support.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                if i % 2 == 0 {
                    support.open_document().unwrap()
                } else {
                    support.prepare_document().wait().unwrap()
                }
            })
        })
        .collect();
    let docs: Vec<Arc<Document>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(content.read_count(), 1);
    assert!(docs.iter().all(|doc| doc.id() == docs[0].id()));
    assert!(support.is_document_ready());
}

#[test]
fn test_open_after_release_closes_first() {
    let content = Arc::new(MemoryContent::new("reopen me\n"));
    let undo = Arc::new(RecordingUndo::default());
    let support = EditorSupport::new(
        SupportEnv::new(content.clone()).with_undo_log(undo.clone()),
        SupportConfig::default().with_close_delay(Duration::from_millis(1000)),
    );

    let first = support.open_document().unwrap();
    let first_id = first.id();
    drop(first);

    let second = support.open_document().unwrap();
    assert_ne!(second.id(), first_id);
    assert_eq!(
        undo.entries(),
        vec![
            format!("attach {}", first_id),
            "discard".to_string(),
            format!("detach {}", first_id),
            format!("attach {}", second.id()),
            "discard".to_string(),
        ]
    );
    assert_eq!(content.read_count(), 2);
}

#[test]
fn test_released_document_closes_after_delay() {
    let content = Arc::new(MemoryContent::new("bye\n"));
    let support = EditorSupport::new(
        SupportEnv::new(content),
        SupportConfig::default().with_close_delay(Duration::from_millis(20)),
    );
    let events = events_of(&support);

    drop(support.open_document().unwrap());
    assert!(eventually(|| support.status() == DocumentStatus::Closed));
    assert_eq!(*events.lock().unwrap(), vec!["Opened", "Closed"]);
}

#[test]
fn test_listener_reopens_during_close() {
    let content = Arc::new(MemoryContent::new("again\n"));
    let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());
    let reopened = Arc::new(Mutex::new(None));

    let armed = Arc::new(AtomicBool::new(true));
    let handle = support.clone();
    let slot = reopened.clone();
    support.subscribe(move |event| {
        if matches!(event, SupportEvent::Closed) && armed.swap(false, Ordering::SeqCst) {
            *slot.lock().unwrap() = Some(handle.open_document().map(|doc| doc.id()));
        }
    });

    let doc = support.open_document().unwrap();
    support.close().wait().unwrap();

    let result = reopened.lock().unwrap().clone().unwrap();
    let new_id = result.unwrap();
    assert_ne!(new_id, doc.id());
    assert_eq!(content.read_count(), 2);
    assert!(eventually(|| support.status() == DocumentStatus::Opened));
}

#[test]
fn test_explicit_close_keeps_holder_copy() {
    let content = Arc::new(MemoryContent::new("held\n"));
    let support = EditorSupport::new(SupportEnv::new(content), SupportConfig::default());
    let doc = support.open_document().unwrap();

    support.close().wait().unwrap();
    assert!(!support.is_document_loaded());
    assert!(support.document().is_none());
    assert_eq!(doc.text(), "held\n");

    // Edits to the detached copy are not tracked any more.
    doc.insert(0, "x").unwrap();
    assert!(!support.is_modified());
}

#[test]
fn test_failed_load_reports_error_and_stays_closed() {
    let content = Arc::new(MemoryContent::new("text"));
    content.set_fail_reads(true);
    let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());

    assert!(matches!(support.open_document(), Err(SupportError::Io(_))));
    assert_eq!(support.status(), DocumentStatus::Closed);

    content.set_fail_reads(false);
    assert_eq!(support.open_document().unwrap().text(), "text");
}

#[test]
fn test_reload_keeps_positions_and_carets() {
    let content = Arc::new(MemoryContent::new("a\nbb\nccc\n"));
    let views = Arc::new(ViewList::new());
    let caret = Arc::new(Caret(AtomicUsize::new(5)));
    views.add(caret.clone());
    let undo = Arc::new(RecordingUndo::default());
    let support = EditorSupport::new(
        SupportEnv::new(content.clone())
            .with_views(views)
            .with_undo_log(undo.clone()),
        SupportConfig::default(),
    );
    let events = events_of(&support);

    let doc = support.open_document().unwrap();
    let pos = support.create_position_ref(6, Default::default());
    assert_eq!(pos.line_column().unwrap(), (2, 1));

    content.set_external("zzzz\nbb\nccc\n");
    support.reload().unwrap().wait().unwrap();

    assert_eq!(doc.text(), "zzzz\nbb\nccc\n");
    assert_eq!(support.document().unwrap().id(), doc.id());
    assert_eq!(pos.offset(), 9);
    assert_eq!(caret.caret_offset(), 8);
    assert!(!support.is_modified());
    assert_eq!(
        *events.lock().unwrap(),
        vec!["Opened", "ReloadStarted", "ReloadFinished"]
    );
    assert_eq!(
        undo.entries()[2..],
        [
            format!("detach {}", doc.id()),
            format!("attach {}", doc.id()),
            "discard".to_string(),
            "checkpoint".to_string(),
        ]
    );
}

#[test]
fn test_failed_reload_leaves_document_intact() {
    let content = Arc::new(MemoryContent::new("keep\n"));
    let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());
    let events = events_of(&support);
    let doc = support.open_document().unwrap();

    content.set_fail_reads(true);
    let err = support.reload().unwrap().wait().unwrap_err();
    assert!(matches!(err, SupportError::Io(_)));
    assert_eq!(doc.text(), "keep\n");
    assert_eq!(support.status(), DocumentStatus::Opened);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert!(events[2].starts_with("ReloadFailed"));
}

#[test]
fn test_reload_requires_open_document() {
    let content = Arc::new(MemoryContent::new("closed\n"));
    let support = EditorSupport::new(SupportEnv::new(content), SupportConfig::default());
    assert!(matches!(support.reload(), Err(SupportError::InvalidState(_))));
}

#[test]
fn test_external_modification_reloads_unmodified_document() {
    let content = Arc::new(MemoryContent::new("v1\n"));
    let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());
    let doc = support.open_document().unwrap();

    assert!(support.check_external_modification().unwrap().is_none());

    content.set_external("v2\n");
    let task = support.check_external_modification().unwrap().unwrap();
    task.wait().unwrap();
    assert_eq!(doc.text(), "v2\n");
    assert!(support.check_external_modification().unwrap().is_none());
}

#[test]
fn test_external_modification_of_modified_document_asks() {
    let content = Arc::new(MemoryContent::new("mine\n"));
    let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());
    let doc = support.open_document().unwrap();
    doc.insert(0, "edited ").unwrap();

    content.set_external("theirs\n");
    assert!(matches!(
        support.check_external_modification(),
        Err(SupportError::ConfirmationRequired(_))
    ));
    assert_eq!(doc.text(), "edited mine\n");
    assert!(support.is_modified());
}

#[test]
fn test_confirmed_reload_of_modified_document() {
    let content = Arc::new(MemoryContent::new("mine\n"));
    let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());
    let doc = support.open_document().unwrap();
    doc.insert(0, "edited ").unwrap();
    content.set_external("theirs\n");

    let pending = match support.check_external_modification() {
        Err(SupportError::ConfirmationRequired(pending)) => pending,
        other => panic!("expected a question, got {:?}", other),
    };
    assert_eq!(pending.kind(), QuestionKind::ExternalModificationOnReload);
    assert!(matches!(pending.confirm(), Ok(Resumed::Reloaded)));
    assert_eq!(doc.text(), "theirs\n");
    assert!(!support.is_modified());
}

#[test]
fn test_large_reload_is_confirmed_before_reading() {
    let content = Arc::new(MemoryContent::new("small\n"));
    let config = SupportConfig::default().with_large_file_threshold(Some(16));
    let support = EditorSupport::new(SupportEnv::new(content.clone()), config);
    let doc = support.open_document().unwrap();
    let reads = content.read_count();

    let large = "x".repeat(64);
    content.set_external(&large);
    let err = support.reload().unwrap().wait().unwrap_err();
    assert_eq!(
        err.question().map(|question| question.kind),
        Some(QuestionKind::LargeFile)
    );
    assert_eq!(content.read_count(), reads);
    assert_eq!(doc.text(), "small\n");

    let SupportError::ConfirmationRequired(pending) = err else {
        panic!("expected a pending question");
    };
    assert!(matches!(pending.confirm(), Ok(Resumed::Reloaded)));
    assert_eq!(doc.text(), large);
    assert_eq!(support.status(), DocumentStatus::Opened);
}

#[test]
fn test_refused_large_reload_keeps_document() {
    let content = Arc::new(MemoryContent::new("small\n"));
    let support = EditorSupport::new(
        SupportEnv::new(content.clone()).with_confirmation(Arc::new(AlwaysRefuse)),
        SupportConfig::default().with_large_file_threshold(Some(16)),
    );
    let events = events_of(&support);
    let doc = support.open_document().unwrap();

    content.set_external(&"y".repeat(32));
    let err = support.reload().unwrap().wait().unwrap_err();
    assert!(matches!(err, SupportError::Refused(_)));
    assert_eq!(doc.text(), "small\n");
    assert_eq!(support.status(), DocumentStatus::Opened);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert!(events[2].starts_with("ReloadFailed"));
}

#[test]
fn test_open_on_ui_thread_gives_up_after_timeout() {
    let content = Arc::new(SlowReads::new("slow\n", Duration::from_millis(500)));
    let ui = Arc::new(UiThread::spawn("ui"));
    let support = EditorSupport::new(
        SupportEnv::new(content.clone()).with_ui_thread(ui.clone()),
        SupportConfig::default().with_ui_wait_timeout(Duration::from_millis(50)),
    );

    let on_ui = support.clone();
    let result = ui
        .invoke_and_wait(Duration::from_secs(5), move || on_ui.open_document())
        .unwrap();
    assert!(matches!(result, Err(SupportError::Timeout(_))));

    // The load keeps running and later opens succeed.
    assert_eq!(support.open_document().unwrap().text(), "slow\n");
}

#[test]
fn test_document_counts_as_loaded_while_loading() {
    let content = Arc::new(SlowReads::new("loading\n", Duration::from_millis(300)));
    let support = EditorSupport::new(SupportEnv::new(content.clone()), SupportConfig::default());
    assert!(!support.is_document_loaded());

    let task = support.prepare_document();
    assert!(eventually(|| support.status() == DocumentStatus::Loading));
    assert!(support.is_document_loaded());
    assert!(!support.is_document_ready());

    task.wait().unwrap();
    assert!(support.is_document_loaded());
    assert!(support.is_document_ready());
}

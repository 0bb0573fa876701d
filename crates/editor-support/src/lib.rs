#![warn(missing_docs)]
//! Editor Support - Document Lifecycle and Stable Positions for Headless Editors
//!
//! # Overview
//!
//! `editor-support` manages one logical document on behalf of an editor: it loads the text
//! from a content source on demand, closes it again once nobody holds it, and keeps positions
//! and lines that stay meaningful while the text is edited, closed, reopened or reloaded.
//! It does not render anything and does not know about files or widgets; the embedding
//! application supplies those through the traits in [`env`].
//!
//! # Core Features
//!
//! - **Open/Close State Machine**: at most one load in flight, close and open totally ordered
//!   on a single worker, debounced close of released documents
//! - **Stable Positions**: [`PositionRef`] follows edits while the document is open and
//!   survives close/reopen by line and column
//! - **Line Identity**: [`DocumentLine`] objects shared through a weak ordered index, with
//!   original/current numbering snapshots ([`LineSet`])
//! - **Save Protocol**: serialized saves, stale-content detection, line ending preservation
//! - **Change Notifications**: [`SupportEvent`] for open, close, reload and modification
//!
//! # Architecture Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  EditorSupport (save, events, redirect)     │  ← Public API
//! ├─────────────────────────────────────────────┤
//! │  DocumentOpenClose (status, tasks)          │  ← Lifecycle
//! ├──────────────────────┬──────────────────────┤
//! │  PositionManager     │  LineSet/LineVector  │  ← Tracking
//! ├──────────────────────┴──────────────────────┤
//! │  Document (rope + live positions)           │  ← Text
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use editor_support::{
//!     Bias, EditorSupport, LineSet, MemoryContent, SupportConfig, SupportEnv, SupportEvent,
//! };
//! use std::sync::Arc;
//!
//! let content = Arc::new(MemoryContent::new("fn main() {\n}\n"));
//! let support = EditorSupport::new(
//!     SupportEnv::new(content.clone()),
//!     SupportConfig::default().with_document_id("main.rs"),
//! );
//! support.subscribe(|event| {
//!     if let SupportEvent::Modified = event {
//!         println!("main.rs has unsaved changes");
//!     }
//! });
//!
//! let doc = support.open_document().unwrap();
//! let lines = support.line_set();
//! let closing_brace = lines.original(1).unwrap();
//!
//! doc.insert(12, "    println!(\"hi\");\n").unwrap();
//! assert_eq!(closing_brace.line_number(), 2);
//! assert_eq!(lines.original_line_number(&closing_brace), Some(1));
//!
//! support.save_document().unwrap();
//! assert!(content.text().contains("println"));
//! ```
//!
//! # Module Description
//!
//! - [`support`] - The editor support facade
//! - [`open_close`] - Open/close/reload state machine
//! - [`position`] - Positions that survive close and reopen
//! - [`line`] - Line objects, parts and numbering snapshots
//! - [`line_vector`] - Weak ordered line index
//! - [`line_struct`] - Original/current line renumbering
//! - [`document`] - The live text buffer
//! - [`task`] - Single-worker background queue and waitable tasks
//! - [`env`] - Collaborators supplied by the embedding application

pub mod config;
pub mod document;
pub mod env;
pub mod error;
pub mod line;
pub mod line_ending;
pub mod line_struct;
pub mod line_vector;
pub mod open_close;
pub mod position;
pub mod support;
mod sync;
pub mod task;
pub mod text;
pub mod ui;

pub use config::SupportConfig;
pub use document::{Bias, Document, DocumentEvent, DocumentListener, ListenerId, LivePosition};
pub use env::{
    AlwaysConfirm, AlwaysRefuse, ConfirmationHandler, ContentSource, EditorView, FileContent,
    MemoryContent, NoUndoLog, PendingConfirmation, QuestionKind, Resumed, UndoLog, UserQuestion,
    ViewList, ViewRegistry,
};
pub use error::{Result, SupportError};
pub use line::{
    Annotation, ClosedLineSet, DocumentLine, DocumentLineSet, LineEvent, LineRef, LineSet, Part,
    PartEvent, find_original_line_number,
};
pub use line_ending::LineEnding;
pub use line_struct::LineStruct;
pub use line_vector::{LineVector, NumberedLine};
pub use open_close::{CaretState, DocumentOpenClose, DocumentStatus, LifecycleEvent, LifecycleHooks};
pub use position::{DocumentProvider, PositionManager, PositionRef};
pub use support::{EditorSupport, SubscriptionId, SupportEnv, SupportEvent, SupportListener};
pub use task::{ScheduledJob, Task, TaskQueue};
pub use text::TextSnapshot;
pub use ui::UiThread;

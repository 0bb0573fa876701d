//! Error types shared by the whole crate.

use crate::env::{PendingConfirmation, UserQuestion};
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by document lifecycle, position and line operations.
///
/// The type is `Clone` because a single background task result is handed to every thread
/// that waits on it; I/O errors are therefore kept behind an [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum SupportError {
    /// Reading or writing the content source failed.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The content source did not hold valid UTF-8.
    #[error("content is not valid UTF-8 (first invalid byte at {valid_up_to})")]
    InvalidEncoding {
        /// Length of the valid prefix, in bytes.
        valid_up_to: usize,
    },

    /// The operation needs an explicit answer before it can continue, and no handler gave one.
    ///
    /// [`PendingConfirmation::confirm`] resumes it.
    #[error("confirmation required: {0}")]
    ConfirmationRequired(PendingConfirmation),

    /// The confirmation handler refused to continue.
    #[error("refused: {0}")]
    Refused(UserQuestion),

    /// A line number beyond the known extent of the document.
    #[error("line {line} is out of range (line count {max})")]
    LineOutOfRange {
        /// Requested line.
        line: usize,
        /// Number of lines known at the time of the query.
        max: usize,
    },

    /// A character offset beyond the end of the document.
    #[error("offset {offset} is out of range (length {len})")]
    OffsetOutOfRange {
        /// Requested offset.
        offset: usize,
        /// Document length in characters.
        len: usize,
    },

    /// A lock was requested again by the thread that already holds it.
    #[error("recursive lock acquisition")]
    RecursiveLock,

    /// A bounded wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The task was cancelled before it ran.
    #[error("task cancelled")]
    Cancelled,

    /// The editor support owning this object has been dropped.
    #[error("editor support released")]
    Released,

    /// An operation was requested in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl SupportError {
    /// Returns `true` for the bounds violations raised by line queries.
    pub fn is_out_of_range(&self) -> bool {
        matches!(
            self,
            SupportError::LineOutOfRange { .. } | SupportError::OffsetOutOfRange { .. }
        )
    }

    /// The question behind a [`ConfirmationRequired`](Self::ConfirmationRequired) or
    /// [`Refused`](Self::Refused) error.
    pub fn question(&self) -> Option<&UserQuestion> {
        match self {
            SupportError::ConfirmationRequired(pending) => Some(pending.question()),
            SupportError::Refused(question) => Some(question),
            _ => None,
        }
    }
}

impl From<io::Error> for SupportError {
    fn from(err: io::Error) -> Self {
        SupportError::Io(Arc::new(err))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SupportError>;

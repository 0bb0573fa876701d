//! Tunable constants of the document lifecycle.

use std::time::Duration;

/// Default debounce before a released document is closed.
pub const DEFAULT_CLOSE_DELAY: Duration = Duration::from_millis(1000);

/// Default bound for waits that involve the UI thread.
pub const DEFAULT_UI_WAIT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default size above which loading asks for confirmation.
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 1024 * 1024;

/// Configuration of an [`EditorSupport`](crate::EditorSupport).
///
/// ```rust
/// use editor_support::SupportConfig;
/// use std::time::Duration;
///
/// let config = SupportConfig::default()
///     .with_document_id("notes.txt")
///     .with_close_delay(Duration::from_millis(50));
/// assert_eq!(config.close_delay, Duration::from_millis(50));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportConfig {
    /// Identifier used as prefix of every log message.
    pub document_id: String,
    /// Delay of a close triggered by the document being released by all holders.
    pub close_delay: Duration,
    /// Bound for waits on, or from, the UI thread.
    pub ui_wait_timeout: Duration,
    /// Content size (bytes) above which a load needs confirmation; `None` disables the check.
    pub large_file_threshold: Option<u64>,
    /// Number of dropped positions that triggers a sweep of the position chain.
    pub position_sweep_threshold: usize,
    /// Minimum number of dead line slots before the line vector compacts.
    pub line_vector_min_gc: usize,
}

impl Default for SupportConfig {
    fn default() -> Self {
        Self {
            document_id: "document".to_string(),
            close_delay: DEFAULT_CLOSE_DELAY,
            ui_wait_timeout: DEFAULT_UI_WAIT_TIMEOUT,
            large_file_threshold: Some(DEFAULT_LARGE_FILE_THRESHOLD),
            position_sweep_threshold: 100,
            line_vector_min_gc: 16,
        }
    }
}

impl SupportConfig {
    /// Set the log identifier.
    pub fn with_document_id(mut self, id: impl Into<String>) -> Self {
        self.document_id = id.into();
        self
    }

    /// Set the release-triggered close delay.
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// Set the UI wait bound.
    pub fn with_ui_wait_timeout(mut self, timeout: Duration) -> Self {
        self.ui_wait_timeout = timeout;
        self
    }

    /// Set (or disable) the large content threshold.
    pub fn with_large_file_threshold(mut self, threshold: Option<u64>) -> Self {
        self.large_file_threshold = threshold;
        self
    }

    /// Set the position sweep threshold.
    pub fn with_position_sweep_threshold(mut self, threshold: usize) -> Self {
        self.position_sweep_threshold = threshold.max(1);
        self
    }

    /// Set the line vector compaction minimum.
    pub fn with_line_vector_min_gc(mut self, min: usize) -> Self {
        self.line_vector_min_gc = min;
        self
    }
}

//! The UI-affinity thread.
//!
//! View state (caret offsets) may only be observed on one serialized thread. [`UiThread`]
//! runs closures there, either fire-and-forget or with a bounded synchronous wait. Waiting is
//! always bounded so a busy UI thread produces an error instead of a hang.

use crate::error::{Result, SupportError};
use crate::task::TaskQueue;
use std::sync::mpsc;
use std::time::Duration;

/// A single cooperative thread for work that touches views.
#[derive(Debug)]
pub struct UiThread {
    queue: TaskQueue,
}

impl UiThread {
    /// Start a UI thread named `name`.
    pub fn spawn(name: impl Into<String>) -> Self {
        Self {
            queue: TaskQueue::new(name),
        }
    }

    /// Whether the caller runs on this UI thread.
    pub fn is_current(&self) -> bool {
        self.queue.is_worker_thread()
    }

    /// Run `job` on the UI thread later.
    pub fn invoke_later(&self, job: impl FnOnce() + Send + 'static) {
        self.queue.post(Duration::ZERO, job);
    }

    /// Run `job` on the UI thread and wait at most `timeout` for its result.
    ///
    /// Called from the UI thread itself, the job runs inline.
    pub fn invoke_and_wait<R, F>(&self, timeout: Duration, job: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Ok(job());
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let scheduled = self.queue.post(Duration::ZERO, move || {
            let _ = tx.send(job());
        });
        match rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                scheduled.cancel();
                Err(SupportError::Timeout("UI thread"))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(SupportError::InvalidState("UI job dropped".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_invoke_and_wait_runs_on_ui_thread() {
        let ui = Arc::new(UiThread::spawn("test-ui"));
        let ui_handle = ui.clone();
        let on_ui = ui
            .invoke_and_wait(Duration::from_secs(5), move || ui_handle.is_current())
            .unwrap();
        assert!(on_ui);
        assert!(!ui.is_current());
    }

    #[test]
    fn test_nested_invoke_runs_inline() {
        let ui = Arc::new(UiThread::spawn("test-ui-nested"));
        let inner = ui.clone();
        let value = ui
            .invoke_and_wait(Duration::from_secs(5), move || {
                inner.invoke_and_wait(Duration::from_secs(5), || 41).map(|v| v + 1)
            })
            .unwrap()
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_busy_ui_thread_times_out() {
        let ui = UiThread::spawn("test-ui-busy");
        let (release_tx, release_rx) = mpsc::channel::<()>();
        ui.invoke_later(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });
        let err = ui
            .invoke_and_wait(Duration::from_millis(20), || ())
            .unwrap_err();
        assert!(matches!(err, SupportError::Timeout(_)));
        release_tx.send(()).unwrap();
    }
}

//! Registry of in-flight cancelable resources.

use std::sync::Mutex;

type CloseFn = Box<dyn FnOnce() + Send>;

/// A synchronized set of close actions, run once on cancellation or teardown.
///
/// Registering after the registry has closed runs the action immediately, so
/// late registrants cannot leak across shutdown.
#[derive(Default)]
pub struct CloseableRegistry {
    inner: Mutex<Option<Vec<CloseFn>>>,
}

impl CloseableRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Some(Vec::new())),
        }
    }

    /// Register a close action. Runs it immediately if already closed.
    pub fn register(&self, close: impl FnOnce() + Send + 'static) {
        let mut guard = self.inner.lock().expect("closeable registry poisoned");
        match guard.as_mut() {
            Some(entries) => entries.push(Box::new(close)),
            None => {
                drop(guard);
                close();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .expect("closeable registry poisoned")
            .is_none()
    }

    /// Close every registered resource. Idempotent.
    pub fn close(&self) {
        let entries = self
            .inner
            .lock()
            .expect("closeable registry poisoned")
            .take();
        if let Some(entries) = entries {
            for close in entries {
                close();
            }
        }
    }
}

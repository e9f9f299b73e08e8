//! Small blocking completion primitives.
//!
//! The control surface of a subtask hands out futures that other threads
//! block on (termination, checkpoint results, the pause gate, writer
//! shutdown). These are plain `Mutex` + `Condvar` cells; nothing here runs on
//! the task thread's hot path.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A one-shot completion signal.
///
/// Cloning shares the underlying cell. Completing twice is a no-op.
#[derive(Clone, Default)]
pub struct SignalFuture {
    shared: Arc<(Mutex<bool>, Condvar)>,
}

impl SignalFuture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        let (lock, cvar) = &*self.shared;
        let mut done = lock.lock().expect("signal future lock poisoned");
        *done = true;
        cvar.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *self.shared.0.lock().expect("signal future lock poisoned")
    }

    /// Block until completed.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.shared;
        let mut done = lock.lock().expect("signal future lock poisoned");
        while !*done {
            done = cvar.wait(done).expect("signal future lock poisoned");
        }
    }

    /// Block until completed or the timeout elapses. Returns completion state.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.shared;
        let deadline = std::time::Instant::now() + timeout;
        let mut done = lock.lock().expect("signal future lock poisoned");
        while !*done {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(done, deadline - now)
                .expect("signal future lock poisoned");
            done = guard;
        }
        true
    }
}

/// A resettable completion gate.
///
/// Like [`SignalFuture`] but with [`reset`](FutureGate::reset): completing
/// opens the gate for all current and future waiters until the next reset.
/// Used for the "pause reached" gate, which goes back to pending every time
/// the subtask resumes.
#[derive(Clone)]
pub struct FutureGate {
    shared: Arc<(Mutex<bool>, Condvar)>,
}

impl FutureGate {
    /// Create a gate in the pending state.
    pub fn new_pending() -> Self {
        Self {
            shared: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Create a gate that is already open.
    pub fn new_complete() -> Self {
        Self {
            shared: Arc::new((Mutex::new(true), Condvar::new())),
        }
    }

    pub fn complete(&self) {
        let (lock, cvar) = &*self.shared;
        *lock.lock().expect("future gate lock poisoned") = true;
        cvar.notify_all();
    }

    /// Return the gate to the pending state.
    pub fn reset(&self) {
        *self.shared.0.lock().expect("future gate lock poisoned") = false;
    }

    pub fn is_complete(&self) -> bool {
        *self.shared.0.lock().expect("future gate lock poisoned")
    }

    pub fn wait(&self) {
        let (lock, cvar) = &*self.shared;
        let mut open = lock.lock().expect("future gate lock poisoned");
        while !*open {
            open = cvar.wait(open).expect("future gate lock poisoned");
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.shared;
        let deadline = std::time::Instant::now() + timeout;
        let mut open = lock.lock().expect("future gate lock poisoned");
        while !*open {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(open, deadline - now)
                .expect("future gate lock poisoned");
            open = guard;
        }
        true
    }
}

/// A one-shot future carrying a value.
///
/// The producer calls [`complete`](ValueFuture::complete) once; consumers
/// block in [`wait`](ValueFuture::wait). Completing twice keeps the first
/// value.
pub struct ValueFuture<T> {
    shared: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> Clone for ValueFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for ValueFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ValueFuture<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    pub fn complete(&self, value: T) {
        let (lock, cvar) = &*self.shared;
        let mut slot = lock.lock().expect("value future lock poisoned");
        if slot.is_none() {
            *slot = Some(value);
            cvar.notify_all();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.shared
            .0
            .lock()
            .expect("value future lock poisoned")
            .is_some()
    }
}

impl<T: Clone> ValueFuture<T> {
    pub fn try_get(&self) -> Option<T> {
        self.shared
            .0
            .lock()
            .expect("value future lock poisoned")
            .clone()
    }

    /// Block until the value is available.
    pub fn wait(&self) -> T {
        let (lock, cvar) = &*self.shared;
        let mut slot = lock.lock().expect("value future lock poisoned");
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            slot = cvar.wait(slot).expect("value future lock poisoned");
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let (lock, cvar) = &*self.shared;
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = lock.lock().expect("value future lock poisoned");
        loop {
            if let Some(value) = slot.as_ref() {
                return Some(value.clone());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = cvar
                .wait_timeout(slot, deadline - now)
                .expect("value future lock poisoned");
            slot = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_signal_future_completes_across_threads() {
        let future = SignalFuture::new();
        let remote = future.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.complete();
        });
        future.wait();
        assert!(future.is_complete());
        handle.join().unwrap();
    }

    #[test]
    fn test_signal_future_wait_timeout() {
        let future = SignalFuture::new();
        assert!(!future.wait_timeout(Duration::from_millis(10)));
        future.complete();
        assert!(future.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_future_gate_reset_cycle() {
        let gate = FutureGate::new_pending();
        assert!(!gate.is_complete());
        gate.complete();
        assert!(gate.is_complete());
        gate.reset();
        assert!(!gate.is_complete());
        gate.complete();
        assert!(gate.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_value_future_keeps_first_value() {
        let future = ValueFuture::new();
        future.complete(1u64);
        future.complete(2u64);
        assert_eq!(future.wait(), 1);
    }
}

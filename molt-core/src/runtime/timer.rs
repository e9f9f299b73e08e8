//! Processing-time timers and their mailbox deferral.
//!
//! Timers fire on a helper thread and must never touch operator state;
//! the subtask wraps every callback so that firing enqueues a
//! `"Timer callback"` mail keyed by a stable integer id. The registry maps
//! the id back to the live callback object, both for live dispatch and for
//! replay resolution after a restart.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use anyhow::{bail, Result};

use crate::util::SignalFuture;

/// A timer callback invoked on the task thread with the firing timestamp.
pub type TimerCallback<C> = Arc<dyn Fn(&mut C, i64) -> Result<()> + Send + Sync>;

/// Id <-> callback mapping for timer replay.
///
/// Two plain maps, not a bi-map: timers register only on the task thread, so
/// the task-thread invariant is the guard. Ids are assigned on first
/// registration and are stable across re-registration, which is what makes a
/// logged `"Timer callback"` mail resolvable after a restart (operators
/// re-register in the same order during restore).
pub struct TimerCallbackRegistry<C> {
    callbacks: AHashMap<u32, TimerCallback<C>>,
    ids_by_identity: AHashMap<usize, u32>,
}

impl<C> Default for TimerCallbackRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> TimerCallbackRegistry<C> {
    pub fn new() -> Self {
        Self {
            callbacks: AHashMap::new(),
            ids_by_identity: AHashMap::new(),
        }
    }

    /// Return the stable id for `callback`, assigning one on first sight.
    pub fn register(&mut self, callback: &TimerCallback<C>) -> u32 {
        let identity = Arc::as_ptr(callback) as *const () as usize;
        if let Some(id) = self.ids_by_identity.get(&identity) {
            return *id;
        }
        let id = self.callbacks.len() as u32;
        self.ids_by_identity.insert(identity, id);
        self.callbacks.insert(id, Arc::clone(callback));
        id
    }

    pub fn get(&self, id: u32) -> Option<TimerCallback<C>> {
        self.callbacks.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

/// Current processing time, epoch milliseconds.
pub fn current_processing_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceStatus {
    Running,
    Quiesced,
    Shutdown,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    action: Box<dyn FnOnce(i64) + Send>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reverse ordering: BinaryHeap is a max-heap, we want earliest first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    queue: BinaryHeap<TimerEntry>,
    status: ServiceStatus,
    seq: u64,
    firing: bool,
    quiesce_waiters: Vec<SignalFuture>,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
    terminated: SignalFuture,
}

/// A wall-clock timer service backed by one helper thread.
///
/// Registered actions fire on that thread; the subtask only ever registers
/// mailbox-deferring wrappers, so the helper thread never touches operator
/// state.
pub struct SystemTimerService {
    shared: Arc<TimerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SystemTimerService {
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                status: ServiceStatus::Running,
                seq: 0,
                firing: false,
                quiesce_waiters: Vec::new(),
            }),
            wake: Condvar::new(),
            terminated: SignalFuture::new(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("timer-{name}"))
                .spawn(move || run_timer_loop(shared))
                .expect("failed to spawn timer thread")
        };
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Schedule `action` to fire after `delay` with the firing timestamp.
    pub fn register_timer(
        &self,
        delay: Duration,
        action: impl FnOnce(i64) + Send + 'static,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.status != ServiceStatus::Running {
            bail!("timer service is {:?}", state.status);
        }
        state.seq += 1;
        let seq = state.seq;
        state.queue.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            action: Box::new(action),
        });
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Stop accepting timers and drop pending ones. The returned future
    /// completes once no callback is in flight.
    pub fn quiesce(&self) -> SignalFuture {
        let signal = SignalFuture::new();
        let mut state = self.lock();
        if state.status == ServiceStatus::Running {
            state.status = ServiceStatus::Quiesced;
        }
        state.queue.clear();
        if state.firing {
            state.quiesce_waiters.push(signal.clone());
        } else {
            signal.complete();
        }
        self.shared.wake.notify_all();
        signal
    }

    /// Stop the helper thread, waiting up to `timeout`. Returns whether the
    /// service terminated in time; teardown proceeds either way.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        {
            let mut state = self.lock();
            state.status = ServiceStatus::Shutdown;
            state.queue.clear();
            self.shared.wake.notify_all();
        }
        let terminated = self.shared.terminated.wait_timeout(timeout);
        if terminated {
            if let Some(worker) = self.worker.lock().expect("timer worker poisoned").take() {
                let _ = worker.join();
            }
        }
        terminated
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.is_complete()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TimerState> {
        self.shared.state.lock().expect("timer state poisoned")
    }
}

fn run_timer_loop(shared: Arc<TimerShared>) {
    let mut state = shared.state.lock().expect("timer state poisoned");
    loop {
        match state.status {
            ServiceStatus::Shutdown => break,
            ServiceStatus::Quiesced => {
                // Nothing can fire anymore; wait for shutdown.
                state = shared.wake.wait(state).expect("timer state poisoned");
            }
            ServiceStatus::Running => match state.queue.peek() {
                None => {
                    state = shared.wake.wait(state).expect("timer state poisoned");
                }
                Some(entry) => {
                    let now = Instant::now();
                    if entry.deadline > now {
                        let wait = entry.deadline - now;
                        let (guard, _) = shared
                            .wake
                            .wait_timeout(state, wait)
                            .expect("timer state poisoned");
                        state = guard;
                    } else {
                        let entry = state.queue.pop().expect("peeked entry vanished");
                        state.firing = true;
                        drop(state);
                        (entry.action)(current_processing_time_ms());
                        state = shared.state.lock().expect("timer state poisoned");
                        state.firing = false;
                        for waiter in state.quiesce_waiters.drain(..) {
                            waiter.complete();
                        }
                    }
                }
            },
        }
    }
    for waiter in state.quiesce_waiters.drain(..) {
        waiter.complete();
    }
    drop(state);
    shared.terminated.complete();
}

#[cfg(test)]
#[path = "tests/timer_tests.rs"]
mod tests;

//! The task mailbox: a priority FIFO with lifecycle states.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use thiserror::Error;

use super::mail::{Mail, MailPriority};

/// Lifecycle state of a mailbox. Transitions are one-way:
/// `Open -> Quiesced -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MailboxState {
    /// Accepting mails.
    Open,
    /// No new mails; queued mails may still be drained.
    Quiesced,
    /// Rejecting everything; queued mails have been dropped.
    Closed,
}

impl MailboxState {
    pub fn is_accepting_mails(&self) -> bool {
        matches!(self, MailboxState::Open)
    }
}

/// Error returned when an enqueue is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MailboxError {
    #[error("mailbox is quiesced and rejects new mails")]
    Quiesced,
    #[error("mailbox is closed")]
    Closed,
}

struct Queues<C> {
    high: VecDeque<Mail<C>>,
    default: VecDeque<Mail<C>>,
    state: MailboxState,
}

/// Multi-producer, single-consumer mailbox owned by one subtask.
///
/// Producers [`put`](TaskMailbox::put) from any thread; only the task thread
/// takes. [`take`](TaskMailbox::take) blocks while the mailbox is empty and
/// not closed, and returns `None` as the shutdown sentinel once it is.
pub struct TaskMailbox<C> {
    queues: Mutex<Queues<C>>,
    available: Condvar,
}

impl<C> Default for TaskMailbox<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> TaskMailbox<C> {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues {
                high: VecDeque::new(),
                default: VecDeque::new(),
                state: MailboxState::Open,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue a mail. Rejected unless the mailbox is Open.
    pub fn put(&self, mail: Mail<C>) -> Result<(), MailboxError> {
        let mut queues = self.lock();
        match queues.state {
            MailboxState::Open => {
                match mail.priority {
                    MailPriority::High => queues.high.push_back(mail),
                    MailPriority::Default => queues.default.push_back(mail),
                }
                self.available.notify_one();
                Ok(())
            }
            MailboxState::Quiesced => Err(MailboxError::Quiesced),
            MailboxState::Closed => Err(MailboxError::Closed),
        }
    }

    /// Enqueue at the head of the high-priority queue.
    ///
    /// Accepted while Open *or* Quiesced; this is the path for
    /// processor-internal wake mails, which must still get through when the
    /// mailbox no longer accepts regular mails.
    pub fn put_head(&self, mail: Mail<C>) -> Result<(), MailboxError> {
        let mut queues = self.lock();
        match queues.state {
            MailboxState::Open | MailboxState::Quiesced => {
                queues.high.push_front(mail);
                self.available.notify_one();
                Ok(())
            }
            MailboxState::Closed => Err(MailboxError::Closed),
        }
    }

    /// Take the next mail at `min_priority` or above, blocking while the
    /// mailbox is empty. Returns `None` once the mailbox is closed.
    pub fn take(&self, min_priority: MailPriority) -> Option<Mail<C>> {
        let mut queues = self.lock();
        loop {
            if let Some(mail) = Self::pop(&mut queues, min_priority) {
                return Some(mail);
            }
            if queues.state == MailboxState::Closed {
                return None;
            }
            queues = self
                .available
                .wait(queues)
                .expect("mailbox lock poisoned");
        }
    }

    /// Non-blocking take at `min_priority` or above.
    pub fn try_take(&self, min_priority: MailPriority) -> Option<Mail<C>> {
        Self::pop(&mut self.lock(), min_priority)
    }

    /// Non-blocking take restricted to the high-priority queue.
    pub fn try_take_high_priority(&self) -> Option<Mail<C>> {
        self.try_take(MailPriority::High)
    }

    pub fn state(&self) -> MailboxState {
        self.lock().state
    }

    pub fn is_accepting_mails(&self) -> bool {
        self.state().is_accepting_mails()
    }

    pub fn has_mail(&self) -> bool {
        let queues = self.lock();
        !queues.high.is_empty() || !queues.default.is_empty()
    }

    /// Stop accepting new mails; queued mails remain drainable.
    pub fn quiesce(&self) {
        let mut queues = self.lock();
        if queues.state == MailboxState::Open {
            queues.state = MailboxState::Quiesced;
        }
    }

    /// Close the mailbox: drop any lingering mail and wake blocked takers.
    pub fn close(&self) {
        let mut queues = self.lock();
        queues.state = MailboxState::Closed;
        queues.high.clear();
        queues.default.clear();
        self.available.notify_all();
    }

    fn pop(queues: &mut Queues<C>, min_priority: MailPriority) -> Option<Mail<C>> {
        if let Some(mail) = queues.high.pop_front() {
            return Some(mail);
        }
        if min_priority == MailPriority::Default {
            return queues.default.pop_front();
        }
        None
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queues<C>> {
        self.queues.lock().expect("mailbox lock poisoned")
    }
}

#[cfg(test)]
#[path = "tests/task_mailbox_tests.rs"]
mod tests;

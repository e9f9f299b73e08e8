//! Priority-bound enqueue handle for other threads.

use std::sync::Arc;

use anyhow::Result;

use super::mail::{Mail, MailArg, MailPriority};
use super::task_mailbox::{MailboxError, TaskMailbox};

/// A cloneable handle that enqueues mails at a fixed priority.
///
/// Every thread other than the task thread interacts with the subtask
/// exclusively through one of these. Enqueueing on a non-Open mailbox
/// returns an error; callers that race with shutdown (late operator events)
/// may swallow it.
pub struct MailboxExecutor<C> {
    mailbox: Arc<TaskMailbox<C>>,
    priority: MailPriority,
}

impl<C> Clone for MailboxExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            mailbox: Arc::clone(&self.mailbox),
            priority: self.priority,
        }
    }
}

impl<C> MailboxExecutor<C> {
    pub(crate) fn new(mailbox: Arc<TaskMailbox<C>>, priority: MailPriority) -> Self {
        Self { mailbox, priority }
    }

    pub fn priority(&self) -> MailPriority {
        self.priority
    }

    /// Enqueue a mail with the given name, arguments and body.
    pub fn execute(
        &self,
        name: impl Into<String>,
        args: Vec<MailArg>,
        body: impl FnOnce(&mut C) -> Result<()> + Send + 'static,
    ) -> Result<(), MailboxError> {
        self.mailbox
            .put(Mail::new(name, args, self.priority, body))
    }

    /// Enqueue, swallowing the rejection that occurs during shutdown.
    pub fn try_execute(
        &self,
        name: impl Into<String>,
        args: Vec<MailArg>,
        body: impl FnOnce(&mut C) -> Result<()> + Send + 'static,
    ) {
        if let Err(err) = self.execute(name, args, body) {
            tracing::debug!("dropping mail enqueued during shutdown: {err}");
        }
    }

    pub fn is_accepting_mails(&self) -> bool {
        self.mailbox.is_accepting_mails()
    }
}

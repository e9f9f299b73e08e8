//! The mailbox: single-consumer task loop with prioritized mails.
//!
//! All mutations of operator and scheduler state happen on one task thread.
//! Other threads communicate with it exclusively by enqueueing [`Mail`]s
//! through a [`MailboxExecutor`]; the [`MailboxProcessor`] drains them and,
//! when nothing more urgent is pending, runs the *default action* (usually
//! "process one input record").

mod executor;
mod mail;
mod processor;
mod task_mailbox;

pub use executor::MailboxExecutor;
pub use mail::{Mail, MailArg, MailPriority};
pub use processor::{
    MailboxController, MailboxProcessor, ProcessorSignals, Suspension, MAIL_MAILBOX_POISON,
    MAIL_RESUME_DEFAULT_ACTION,
};
pub use task_mailbox::{MailboxError, MailboxState, TaskMailbox};

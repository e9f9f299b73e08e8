//! Mails: named callables executed on the task thread.

use anyhow::Result;

/// Priority class of a mail.
///
/// High-priority mails (checkpoint notifications, shutdown signals) are
/// executed strictly before any default-priority mail at each scheduling
/// decision. Within one class, order is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MailPriority {
    Default,
    High,
}

/// A serializable mail argument.
///
/// Arguments are part of the replay log format: a mail that reaches the
/// mailbox while logging is enabled is persisted as `(name, args)` and
/// re-dispatched from those values after a crash. Anything a handler needs
/// beyond these values must be reconstructible at replay time (timer
/// callbacks go through a stable integer id, control messages are opaque
/// payload bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailArg {
    U32(u32),
    U64(u64),
    I64(i64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

impl MailArg {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            MailArg::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            MailArg::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MailArg::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MailArg::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

type MailBody<C> = Box<dyn FnOnce(&mut C) -> Result<()> + Send>;

/// A named callable enqueued for execution on the task thread.
///
/// The name is a stable identifier, frozen as part of the replay log format;
/// the live body is bound at the enqueue site, while the replay path resolves
/// the same name through the mail resolver.
pub struct Mail<C> {
    pub name: String,
    pub args: Vec<MailArg>,
    pub priority: MailPriority,
    body: MailBody<C>,
}

impl<C> Mail<C> {
    pub fn new(
        name: impl Into<String>,
        args: Vec<MailArg>,
        priority: MailPriority,
        body: impl FnOnce(&mut C) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            args,
            priority,
            body: Box::new(body),
        }
    }

    /// A mail whose body does nothing. Used for wake-ups and the starvation
    /// ping; still named, logged and replayed like any other mail.
    pub fn no_op(name: impl Into<String>, priority: MailPriority) -> Self {
        Self::new(name, Vec::new(), priority, |_| Ok(()))
    }

    /// Consume the mail and run its body against the task context.
    pub fn run(self, ctx: &mut C) -> Result<()> {
        (self.body)(ctx)
    }
}

impl<C> std::fmt::Debug for Mail<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mail")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("priority", &self.priority)
            .finish()
    }
}

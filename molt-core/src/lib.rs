//! # Molt Core
//!
//! The per-subtask execution driver of the Molt stream processing engine.
//!
//! Each [`SubtaskDriver`](runtime::SubtaskDriver) owns one operator chain and
//! one task thread. Everything that mutates operator or scheduler state runs
//! on that thread; external signals (checkpoint triggers, operator events,
//! timer firings, control messages) are funneled through a [`mailbox`] as
//! named, serializable *mails*. Every scheduling decision and every outbound
//! record is appended to a durable replay log, so that after a crash the
//! subtask replays its logical history deterministically before live
//! execution resumes.
//!
//! The crate is organized as:
//!
//! - [`mailbox`] — the single-consumer task loop: [`TaskMailbox`](mailbox::TaskMailbox)
//!   (priority FIFO with lifecycle states), [`MailboxExecutor`](mailbox::MailboxExecutor)
//!   (multi-producer enqueue handle), and [`MailboxProcessor`](mailbox::MailboxProcessor)
//!   (interleaves the default action with queued mails, supports pause and
//!   suspension).
//! - [`recovery`] — the deterministic-replay log: pluggable
//!   [`LogStorage`](recovery::LogStorage) backends, the batching
//!   [`AsyncLogWriter`](recovery::AsyncLogWriter), the
//!   [`StepCursor`](recovery::StepCursor), and the
//!   [`DpLogManager`](recovery::DpLogManager) / [`DataLogManager`](recovery::DataLogManager)
//!   pair that records and replays mails and outputs.
//! - [`runtime`] — the subtask lifecycle state machine
//!   (restore / invoke / checkpoint / close / dispose), deferred timer
//!   callbacks, and the external-collaborator traits for gates, partitions,
//!   operator chains and checkpointing.
//! - [`config`] — the immutable per-subtask configuration record.
//! - [`util`] — cross-thread completion gates and the cancelables registry.

pub mod config;
pub mod error;
pub mod mailbox;
pub mod recovery;
pub mod runtime;
pub mod util;

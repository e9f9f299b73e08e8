//! The deterministic-replay (DP) log manager.
//!
//! Live path: assigns a step number to every mail execution and appends a
//! `MailEnqueued` record before the mail body runs. Recovery path: owns the
//! scheduler pacing, consuming log records in step order (mails re-dispatched
//! by name through the [`MailResolver`], outputs re-emitted through the
//! registered output replayer) until the replayed cursor meets the recovery
//! target and live execution takes over.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::mailbox::MailArg;

use super::cursor::StepCursor;
use super::record::LogRecord;
use super::resolver::MailResolver;
use super::writer::AsyncLogWriter;

/// Re-emits one logged output record to the live partition writer.
pub type OutputReplayer<C> = Arc<dyn Fn(&mut C, u16, &[u8]) -> Result<()> + Send + Sync>;

pub struct DpLogManager<C> {
    writer: Arc<AsyncLogWriter>,
    cursor: Arc<StepCursor>,
    enabled: AtomicBool,
    resolver: Mutex<MailResolver<C>>,
    replay_queue: Mutex<VecDeque<LogRecord>>,
    output_replayer: Mutex<Option<OutputReplayer<C>>>,
}

impl<C> DpLogManager<C> {
    pub fn new(
        writer: Arc<AsyncLogWriter>,
        cursor: Arc<StepCursor>,
        recovery_records: Vec<LogRecord>,
    ) -> Self {
        Self {
            writer,
            cursor,
            enabled: AtomicBool::new(false),
            resolver: Mutex::new(MailResolver::new()),
            replay_queue: Mutex::new(recovery_records.into()),
            output_replayer: Mutex::new(None),
        }
    }

    /// Bind a replay handler for a mail name. Startup only.
    pub fn bind(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&mut C, &[MailArg]) -> Result<()> + Send + Sync + 'static,
    ) {
        self.resolver
            .lock()
            .expect("mail resolver poisoned")
            .bind(name, handler);
    }

    /// Bind a mail name whose replayed effect is nothing.
    pub fn bind_no_op(&self, name: impl Into<String>) {
        self.resolver
            .lock()
            .expect("mail resolver poisoned")
            .bind_no_op(name);
    }

    /// Register the function that re-emits logged outputs.
    pub fn set_output_replayer(&self, replayer: OutputReplayer<C>) {
        *self
            .output_replayer
            .lock()
            .expect("output replayer poisoned") = Some(replayer);
    }

    /// Turn logging (and, if the log is nonempty, replay pacing) on. Called
    /// after gate recovery so pre-run initialization is never recorded.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        tracing::debug!(
            log = self.writer.log_name(),
            recovery = !self.cursor.is_recovery_completed(),
            "deterministic-replay logging enabled"
        );
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// True while the scheduler must be driven from the log.
    pub fn is_replaying(&self) -> bool {
        self.is_enabled() && !self.cursor.is_recovery_completed()
    }

    /// Delegates to the step cursor.
    pub fn is_recovery_completed(&self) -> bool {
        self.cursor.is_recovery_completed()
    }

    pub fn cursor(&self) -> Arc<StepCursor> {
        Arc::clone(&self.cursor)
    }

    /// Live path: record a mail execution decision under the next step
    /// number, immediately before the mail body runs.
    pub fn on_mail(&self, name: &str, args: &[MailArg]) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        debug_assert!(
            self.cursor.is_recovery_completed(),
            "live mail logged while replay owns the schedule"
        );
        let step = self.cursor.next_step();
        tracing::trace!(step, name, "logging mail");
        self.writer
            .append(LogRecord::MailEnqueued {
                step,
                name: name.to_string(),
                args: args.to_vec(),
            })
            .with_context(|| format!("logging mail {name:?} at step {step}"))
    }

    /// Recovery path: consume the next log record and re-apply it.
    ///
    /// Completes recovery when the queue runs dry; the caller (the mailbox
    /// processor) checks [`is_replaying`](Self::is_replaying) before and
    /// after.
    pub fn replay_next(&self, ctx: &mut C) -> Result<()> {
        let record = {
            let mut queue = self.replay_queue.lock().expect("replay queue poisoned");
            queue.pop_front()
        };
        let Some(record) = record else {
            self.cursor.mark_recovery_completed();
            return Ok(());
        };

        match &record {
            LogRecord::MailEnqueued { step, name, args } => {
                tracing::trace!(step = *step, name = %name, "replaying mail");
                let handler = self
                    .resolver
                    .lock()
                    .expect("mail resolver poisoned")
                    .resolve(name)?;
                handler(ctx, args)
                    .with_context(|| format!("replaying mail {name:?} at step {step}"))?;
                self.cursor.advance_replayed(*step);
            }
            LogRecord::OutputEmitted {
                step,
                partition,
                bytes,
            } => {
                tracing::trace!(
                    step = *step,
                    partition = *partition,
                    len = bytes.len(),
                    "replaying output"
                );
                let replayer = self
                    .output_replayer
                    .lock()
                    .expect("output replayer poisoned")
                    .clone();
                if let Some(replayer) = replayer {
                    replayer(ctx, *partition, bytes)
                        .with_context(|| format!("re-emitting logged output at step {step}"))?;
                }
                self.cursor.advance_replayed(*step);
            }
            LogRecord::CheckpointBoundary {
                step,
                checkpoint_id,
            } => {
                self.writer.note_boundary(*checkpoint_id, *step);
                self.cursor.advance_replayed(*step);
            }
            LogRecord::Clear { step } => {
                // References an earlier boundary step; does not advance.
                self.writer.apply_clear(*step);
            }
        }

        if self
            .replay_queue
            .lock()
            .expect("replay queue poisoned")
            .is_empty()
        {
            self.cursor.mark_recovery_completed();
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/dp_log_tests.rs"]
mod tests;

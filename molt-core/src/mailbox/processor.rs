//! The mailbox processor: interleaves the default action with queued mails.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::recovery::DpLogManager;
use crate::util::FutureGate;

use super::executor::MailboxExecutor;
use super::mail::{Mail, MailPriority};
use super::task_mailbox::TaskMailbox;

/// Name of the internal wake mail sent when a suspended default action is
/// resumed. Frozen as part of the replay log format.
pub const MAIL_RESUME_DEFAULT_ACTION: &str = "resume default action";

/// Name of the internal wake mail that unblocks the task thread for loop
/// control (suspension of the loop, all-actions-completed). Frozen as part of
/// the replay log format.
pub const MAIL_MAILBOX_POISON: &str = "mailbox poison";

/// Scheduling flags shared between the processor, its controller and the
/// mail handlers that flip them.
///
/// Everything here is a plain atomic: the flags are written by mail bodies on
/// the task thread or by lightweight control calls, and read at every
/// scheduling decision.
pub struct ProcessorSignals {
    loop_running: AtomicBool,
    loop_suspended: AtomicBool,
    paused: AtomicBool,
    pause_reached: FutureGate,
    live_suspension: AtomicU64,
    suspension_seq: AtomicU64,
}

impl Default for ProcessorSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorSignals {
    pub fn new() -> Self {
        Self {
            loop_running: AtomicBool::new(true),
            loop_suspended: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            pause_reached: FutureGate::new_pending(),
            live_suspension: AtomicU64::new(0),
            suspension_seq: AtomicU64::new(0),
        }
    }

    pub fn is_loop_running(&self) -> bool {
        self.loop_running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Set the pause flag and open the "pause reached" gate.
    pub fn mark_paused(&self) {
        self.paused.store(true, Ordering::Release);
        self.pause_reached.complete();
    }

    /// Clear the pause flag and reset the gate to pending for the next pause.
    pub fn mark_resumed(&self) {
        self.paused.store(false, Ordering::Release);
        self.pause_reached.reset();
    }

    /// The gate external observers wait on to see that the paused state has
    /// been reached. Pending again after every resume.
    pub fn pause_reached(&self) -> FutureGate {
        self.pause_reached.clone()
    }

    /// Mark the loop suspended; the current `run_loop` call returns after
    /// the iteration in progress.
    pub fn suspend_loop(&self) {
        self.loop_suspended.store(true, Ordering::Release);
    }

    pub fn is_loop_suspended(&self) -> bool {
        self.loop_suspended.load(Ordering::Acquire)
    }

    fn resume_loop(&self) {
        self.loop_suspended.store(false, Ordering::Release);
    }

    fn is_default_action_suspended(&self) -> bool {
        self.live_suspension.load(Ordering::Acquire) != 0
    }

    /// Flip the loop-running flag off. Returns whether this call was the one
    /// that ended the loop (for idempotent wake-up).
    pub(crate) fn complete_all_actions(&self) -> bool {
        self.loop_running.swap(false, Ordering::AcqRel)
    }
}

/// Handle given to the default action for collaborative scheduling.
pub struct MailboxController<C> {
    signals: Arc<ProcessorSignals>,
    mailbox: Arc<TaskMailbox<C>>,
}

impl<C> Clone for MailboxController<C> {
    fn clone(&self) -> Self {
        Self {
            signals: Arc::clone(&self.signals),
            mailbox: Arc::clone(&self.mailbox),
        }
    }
}

impl<C> MailboxController<C> {
    /// Disable the default action until the returned [`Suspension`] is
    /// resumed. At most one suspension is live at a time; the caller is the
    /// default action itself, which cannot run concurrently with itself.
    pub fn suspend_default_action(&self) -> Suspension<C> {
        let gen = self.signals.suspension_seq.fetch_add(1, Ordering::AcqRel) + 1;
        self.signals.live_suspension.store(gen, Ordering::Release);
        Suspension {
            gen,
            signals: Arc::clone(&self.signals),
            mailbox: Arc::clone(&self.mailbox),
        }
    }

    /// Signal that no further actions will run; ends the mailbox loop.
    /// Idempotent, callable from any thread, wakes a blocked task thread.
    pub fn all_actions_completed(&self) {
        if self.signals.complete_all_actions() {
            let _ = self
                .mailbox
                .put_head(Mail::no_op(MAIL_MAILBOX_POISON, MailPriority::High));
        }
    }
}

/// Token for a suspended default action.
///
/// `resume` may be called from any thread once input may be available again.
/// Resuming an expired suspension (one that was superseded or already
/// resumed) is a no-op.
pub struct Suspension<C> {
    gen: u64,
    signals: Arc<ProcessorSignals>,
    mailbox: Arc<TaskMailbox<C>>,
}

impl<C> Clone for Suspension<C> {
    fn clone(&self) -> Self {
        Self {
            gen: self.gen,
            signals: Arc::clone(&self.signals),
            mailbox: Arc::clone(&self.mailbox),
        }
    }
}

impl<C> Suspension<C> {
    /// Re-enable the default action if this suspension is still the live one.
    pub fn resume(&self) {
        let live = self.signals.live_suspension.compare_exchange(
            self.gen,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if live.is_ok() {
            let _ = self
                .mailbox
                .put_head(Mail::no_op(MAIL_RESUME_DEFAULT_ACTION, MailPriority::High));
        }
    }
}

type DefaultAction<C> = Box<dyn FnMut(&mut C, &MailboxController<C>) -> Result<()> + Send>;

/// The scheduler loop of one subtask.
///
/// Per iteration: execute every mail at the head of the high-priority queue,
/// then a pending default-priority mail if there is one, then the default
/// action if it is neither suspended nor paused. When nothing is runnable the
/// task thread blocks inside `mailbox.take` until the next mail (or a wake
/// mail) arrives.
pub struct MailboxProcessor<C> {
    mailbox: Arc<TaskMailbox<C>>,
    signals: Arc<ProcessorSignals>,
    controller: MailboxController<C>,
    default_action: DefaultAction<C>,
    dp_log: Option<Arc<DpLogManager<C>>>,
    /// A live mail pulled out of a blocked `take` in the instant replay
    /// pacing switched on; executed first once replay completes.
    held_mail: Option<Mail<C>>,
}

impl<C> MailboxProcessor<C> {
    pub fn new(
        default_action: impl FnMut(&mut C, &MailboxController<C>) -> Result<()> + Send + 'static,
    ) -> Self {
        let mailbox = Arc::new(TaskMailbox::new());
        let signals = Arc::new(ProcessorSignals::new());
        let controller = MailboxController {
            signals: Arc::clone(&signals),
            mailbox: Arc::clone(&mailbox),
        };
        Self {
            mailbox,
            signals,
            controller,
            default_action: Box::new(default_action),
            dp_log: None,
            held_mail: None,
        }
    }

    /// Register the deterministic-replay log manager. While it reports
    /// recovery in progress, the processor yields every scheduling decision
    /// to it and holds live mails in the queue.
    pub fn register_log_manager(&mut self, dp_log: Arc<DpLogManager<C>>) {
        self.dp_log = Some(dp_log);
    }

    pub fn mailbox(&self) -> Arc<TaskMailbox<C>> {
        Arc::clone(&self.mailbox)
    }

    pub fn signals(&self) -> Arc<ProcessorSignals> {
        Arc::clone(&self.signals)
    }

    pub fn controller(&self) -> MailboxController<C> {
        self.controller.clone()
    }

    /// An enqueue handle bound to the given priority.
    pub fn executor(&self, priority: MailPriority) -> MailboxExecutor<C> {
        MailboxExecutor::new(Arc::clone(&self.mailbox), priority)
    }

    pub fn is_mailbox_loop_running(&self) -> bool {
        self.signals.is_loop_running()
    }

    /// Run the loop until the mailbox closes, the loop is suspended, or all
    /// actions are reported complete.
    ///
    /// A previous [`suspend`](Self::suspend) is sticky: callers resume
    /// explicitly with [`resume_loop`](Self::resume_loop). This is what lets
    /// a recovery callback suspend the loop even before it was entered.
    pub fn run_loop(&mut self, ctx: &mut C) -> Result<()> {
        while self.is_next_loop_possible() {
            if self.run_step(ctx)? {
                continue;
            }
            // Nothing runnable: block until the next mail or a wake.
            match self.mailbox.take(MailPriority::Default) {
                Some(mail) => {
                    if self.is_replaying() {
                        // Replay pacing switched on while we were parked;
                        // hold the live mail until the log is caught up.
                        self.held_mail = Some(mail);
                    } else {
                        self.execute_mail(ctx, mail)?;
                    }
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Run one scheduling iteration without blocking. Returns whether any
    /// mail, replayed record or default action ran.
    pub fn run_step(&mut self, ctx: &mut C) -> Result<bool> {
        if let Some(dp_log) = &self.dp_log {
            if dp_log.is_replaying() {
                let dp_log = Arc::clone(dp_log);
                dp_log.replay_next(ctx)?;
                return Ok(true);
            }
        }

        if let Some(mail) = self.held_mail.take() {
            self.execute_mail(ctx, mail)?;
            return Ok(true);
        }

        let mut processed = false;
        while let Some(mail) = self.mailbox.try_take_high_priority() {
            self.execute_mail(ctx, mail)?;
            processed = true;
            if !self.is_next_loop_possible() {
                return Ok(true);
            }
        }

        if let Some(mail) = self.mailbox.try_take(MailPriority::Default) {
            self.execute_mail(ctx, mail)?;
            return Ok(true);
        }

        if self.is_default_action_available() {
            (self.default_action)(ctx, &self.controller)?;
            return Ok(true);
        }

        Ok(processed)
    }

    /// Suspend the loop: the current `run_loop` call returns after the
    /// iteration in progress; queued mails survive for the next run.
    pub fn suspend(&self) {
        self.signals.suspend_loop();
        let _ = self
            .mailbox
            .put_head(Mail::no_op(MAIL_MAILBOX_POISON, MailPriority::High));
    }

    /// Clear a loop suspension so the next `run_loop` call makes progress.
    pub fn resume_loop(&self) {
        self.signals.resume_loop();
    }

    /// Idempotent end-of-loop signal; see [`MailboxController::all_actions_completed`].
    pub fn all_actions_completed(&self) {
        self.controller.all_actions_completed();
    }

    /// Reject new mails; queued mails may still run.
    pub fn prepare_close(&self) {
        self.mailbox.quiesce();
    }

    /// Execute every remaining mail.
    pub fn drain(&mut self, ctx: &mut C) -> Result<()> {
        if let Some(mail) = self.held_mail.take() {
            self.execute_mail(ctx, mail)?;
        }
        while let Some(mail) = self.mailbox.try_take(MailPriority::Default) {
            self.execute_mail(ctx, mail)?;
        }
        Ok(())
    }

    /// Release the mailbox; any lingering mail is dropped.
    pub fn close(&self) {
        self.mailbox.close();
    }

    fn is_replaying(&self) -> bool {
        self.dp_log.as_ref().is_some_and(|dp| dp.is_replaying())
    }

    fn is_next_loop_possible(&self) -> bool {
        self.signals.loop_running.load(Ordering::Acquire)
            && !self.signals.loop_suspended.load(Ordering::Acquire)
    }

    fn is_default_action_available(&self) -> bool {
        !self.signals.is_default_action_suspended()
            && !self.signals.is_paused()
            && self.is_next_loop_possible()
    }

    fn execute_mail(&self, ctx: &mut C, mail: Mail<C>) -> Result<()> {
        if let Some(dp_log) = &self.dp_log {
            dp_log.on_mail(&mail.name, &mail.args)?;
        }
        tracing::trace!(name = %mail.name, "executing mail");
        mail.run(ctx)
    }
}

#[cfg(test)]
#[path = "tests/processor_tests.rs"]
mod tests;

//! The subtask lifecycle state machine.
//!
//! ```text
//! Created -> Restoring -> GatesRecovering -> Running -> Closing -> Disposed
//!               |              |                |
//!               +--------------+----------------+--> Canceling -> Disposed
//!                                               |
//!                                               +--> Failing -> Canceling -> Disposed
//! ```
//!
//! [`SubtaskDriver`] owns the task thread side (restore, invoke, teardown);
//! [`SubtaskHandle`] is the thread-safe control surface a coordinator talks
//! to (checkpoint triggers, pause/resume, operator events, cancel).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};

use crate::config::SubtaskConfig;
use crate::error::{first_or_suppressed, is_cancel_error, CancelTaskError, RecoveryError};
use crate::mailbox::{
    MailArg, MailPriority, MailboxController, MailboxExecutor, MailboxProcessor, ProcessorSignals,
    TaskMailbox, MAIL_MAILBOX_POISON, MAIL_RESUME_DEFAULT_ACTION,
};
use crate::recovery::{
    open_log_storage, read_recovery_log, recovery_target, AsyncErrorHandler, AsyncLogWriter,
    DataLogManager, DpLogManager, LogRecord, LogStorage, StepCursor,
};
use crate::util::{CloseableRegistry, FutureGate, SignalFuture, ValueFuture};

use super::checkpoint::{CheckpointMetadata, CheckpointOptions, ControlMessage};
use super::env::{
    CheckpointCoordinator, ControlHandler, InputGate, InputPoll, OperatorChain,
    SubtaskEnvironment, TaskInfo,
};
use super::record_writer::RecordWriter;
use super::timer::{SystemTimerService, TimerCallback, TimerCallbackRegistry};

/// Frozen mail names; part of the replay log format.
pub const MAIL_TIMER_CALLBACK: &str = "Timer callback";
pub const MAIL_DISPATCH_OPERATOR_EVENT: &str = "dispatch operator event";
pub const MAIL_PAUSE: &str = "pause";
pub const MAIL_RESUME: &str = "resume";
pub const MAIL_EXP: &str = "exp";
pub const MAIL_CONTROL: &str = "control";
pub const MAIL_CHECKPOINT: &str = "checkpoint";
pub const MAIL_CHECKPOINT_COMPLETE: &str = "checkpoint complete";
pub const MAIL_CHECKPOINT_ABORTED: &str = "checkpoint aborted";

fn gate_request_mail_name(gate_index: usize) -> String {
    format!("Input gate request partitions{gate_index}")
}

/// How long teardown waits for helper threads; the external cancellation
/// watchdog may hard-kill the host, so nothing here may block indefinitely.
const CLEANUP_WAIT: Duration = Duration::from_secs(10);

/// How the subtask's life ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    Finished,
    Canceled,
    Failed,
}

pub(crate) struct SubtaskFlags {
    running: AtomicBool,
    canceled: AtomicBool,
    failing: AtomicBool,
}

impl SubtaskFlags {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            failing: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub(crate) fn is_failing(&self) -> bool {
        self.failing.load(Ordering::Acquire)
    }

    fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::Release);
    }

    fn set_canceled(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    fn set_failing(&self, value: bool) {
        self.failing.store(value, Ordering::Release);
    }
}

/// The mutable task-thread state every mail body operates on.
pub struct SubtaskContext {
    pub task_info: TaskInfo,
    pub chain: Box<dyn OperatorChain>,
    pub writer: RecordWriter,
    pub coordinator: Box<dyn CheckpointCoordinator>,
    pub gates: Vec<Box<dyn InputGate>>,
    pub timers: TimerCallbackRegistry<SubtaskContext>,
    control_handler: Option<ControlHandler>,
    executor: MailboxExecutor<SubtaskContext>,
    sync_savepoint_id: Option<u64>,
    active_sync_savepoint_id: Option<u64>,
    ignore_end_of_input: bool,
    disposed_operators: bool,
    next_gate: usize,
    print_level: u8,
}

impl SubtaskContext {
    /// Poll the gates round-robin for one event.
    fn poll_input(&mut self) -> Result<InputPoll> {
        if self.gates.is_empty() {
            return Ok(InputPoll::EndOfInput);
        }
        let num_gates = self.gates.len();
        let mut ended = 0;
        for offset in 0..num_gates {
            let idx = (self.next_gate + offset) % num_gates;
            match self.gates[idx].poll_next()? {
                InputPoll::Record(record) => {
                    self.next_gate = (idx + 1) % num_gates;
                    return Ok(InputPoll::Record(record));
                }
                InputPoll::EndOfInput => ended += 1,
                InputPoll::Pending => {}
            }
        }
        if ended == num_gates && !self.ignore_end_of_input {
            Ok(InputPoll::EndOfInput)
        } else {
            // All pending, or ended but held open by an active savepoint.
            Ok(InputPoll::Pending)
        }
    }

    /// Wrap a timer callback for the external timer service.
    ///
    /// Registration assigns a stable integer id (task thread only); the
    /// returned trigger may fire from any helper thread and enqueues a
    /// `"Timer callback"` mail carrying `(id, timestamp)`.
    pub fn defer_timer(
        &mut self,
        callback: TimerCallback<SubtaskContext>,
    ) -> Box<dyn Fn(i64) + Send + Sync> {
        let id = self.timers.register(&callback);
        let executor = self.executor.clone();
        Box::new(move |timestamp| {
            let callback = Arc::clone(&callback);
            executor.try_execute(
                MAIL_TIMER_CALLBACK,
                vec![MailArg::U32(id), MailArg::I64(timestamp)],
                move |ctx: &mut SubtaskContext| callback(ctx, timestamp),
            );
        })
    }

    pub fn sync_savepoint_id(&self) -> Option<u64> {
        self.sync_savepoint_id
    }

    fn set_sync_savepoint(&mut self, checkpoint_id: u64, ignore_end_of_input: bool) -> Result<()> {
        ensure!(
            self.sync_savepoint_id.is_none(),
            "at most one stop-with-savepoint checkpoint at a time is allowed"
        );
        self.sync_savepoint_id = Some(checkpoint_id);
        self.active_sync_savepoint_id = Some(checkpoint_id);
        self.ignore_end_of_input = ignore_end_of_input;
        Ok(())
    }

    fn reset_sync_savepoint(&mut self, checkpoint_id: u64, succeeded: bool) {
        if !succeeded && self.active_sync_savepoint_id == Some(checkpoint_id) {
            // Allow further end-of-input handling again.
            self.active_sync_savepoint_id = None;
            self.ignore_end_of_input = false;
        }
        self.sync_savepoint_id = None;
    }

    fn is_sync_savepoint(&self, checkpoint_id: u64) -> bool {
        self.sync_savepoint_id == Some(checkpoint_id)
    }
}

/// Shared handles for mail handlers; `dp_log` is weak so the permanent
/// resolver bindings do not keep the manager alive in a reference cycle.
#[derive(Clone)]
struct MailDeps {
    task_info: TaskInfo,
    mailbox: Arc<TaskMailbox<SubtaskContext>>,
    signals: Arc<ProcessorSignals>,
    flags: Arc<SubtaskFlags>,
    cursor: Arc<StepCursor>,
    log_writer: Arc<AsyncLogWriter>,
    dp_log: Weak<DpLogManager<SubtaskContext>>,
}

impl MailDeps {
    /// End the mailbox loop (the normal-termination entry of `finish`).
    fn all_actions_completed(&self) {
        if self.signals.complete_all_actions() {
            let _ = self.mailbox.put_head(crate::mailbox::Mail::no_op(
                MAIL_MAILBOX_POISON,
                MailPriority::High,
            ));
        }
    }
}

/// Strongly-held service handles shared by the driver and its control
/// handles.
pub(crate) struct SubtaskServices {
    task_info: TaskInfo,
    mailbox: Arc<TaskMailbox<SubtaskContext>>,
    controller: MailboxController<SubtaskContext>,
    signals: Arc<ProcessorSignals>,
    flags: Arc<SubtaskFlags>,
    cursor: Arc<StepCursor>,
    log_writer: Arc<AsyncLogWriter>,
    dp_log: Arc<DpLogManager<SubtaskContext>>,
    executor: MailboxExecutor<SubtaskContext>,
    hi_executor: MailboxExecutor<SubtaskContext>,
    termination: ValueFuture<TerminationState>,
    timer_service: Arc<SystemTimerService>,
    cancelables: Arc<CloseableRegistry>,
    fail_external: AsyncErrorHandler,
    ping_stop: Arc<AtomicBool>,
}

impl Clone for SubtaskServices {
    fn clone(&self) -> Self {
        Self {
            task_info: self.task_info.clone(),
            mailbox: Arc::clone(&self.mailbox),
            controller: self.controller.clone(),
            signals: Arc::clone(&self.signals),
            flags: Arc::clone(&self.flags),
            cursor: Arc::clone(&self.cursor),
            log_writer: Arc::clone(&self.log_writer),
            dp_log: Arc::clone(&self.dp_log),
            executor: self.executor.clone(),
            hi_executor: self.hi_executor.clone(),
            termination: self.termination.clone(),
            timer_service: Arc::clone(&self.timer_service),
            cancelables: Arc::clone(&self.cancelables),
            fail_external: Arc::clone(&self.fail_external),
            ping_stop: Arc::clone(&self.ping_stop),
        }
    }
}

impl SubtaskServices {
    fn mail_deps(&self) -> MailDeps {
        MailDeps {
            task_info: self.task_info.clone(),
            mailbox: Arc::clone(&self.mailbox),
            signals: Arc::clone(&self.signals),
            flags: Arc::clone(&self.flags),
            cursor: Arc::clone(&self.cursor),
            log_writer: Arc::clone(&self.log_writer),
            dp_log: Arc::downgrade(&self.dp_log),
        }
    }
}

/// Drives one operator chain on the calling thread.
pub struct SubtaskDriver {
    ctx: SubtaskContext,
    processor: MailboxProcessor<SubtaskContext>,
    services: SubtaskServices,
    config: SubtaskConfig,
}

impl SubtaskDriver {
    /// Build a driver, opening the log storage selected by `config`.
    pub fn new(env: SubtaskEnvironment, config: SubtaskConfig) -> Result<Self> {
        let log_name = env.task_info.log_name();
        let storage = open_log_storage(&config, &log_name)
            .with_context(|| format!("opening log storage for {log_name:?}"))?;
        Self::with_storage(env, config, storage)
    }

    /// Build a driver on an explicit storage backend (tests and hosts that
    /// manage storage lifetimes themselves, e.g. shared in-memory logs
    /// across a simulated restart).
    pub fn with_storage(
        env: SubtaskEnvironment,
        config: SubtaskConfig,
        storage: Arc<dyn LogStorage>,
    ) -> Result<Self> {
        let task_info = env.task_info.clone();
        let log_name = task_info.log_name();

        if config.enable_logging && config.clear_old_log {
            storage
                .clear()
                .with_context(|| format!("clearing old replay log {log_name:?}"))?;
        }

        let recovery_records: Vec<LogRecord> = if config.enable_logging {
            read_recovery_log(&storage)?
        } else {
            Vec::new()
        };
        let cursor = Arc::new(StepCursor::new(recovery_target(&recovery_records)));

        let flags = Arc::new(SubtaskFlags::new());
        let fail_external: AsyncErrorHandler = match env.fail_external {
            Some(handler) => {
                // Only fail the task while it is still running; late async
                // errors are swallowed.
                let flags = Arc::clone(&flags);
                Arc::new(move |message, err| {
                    if flags.is_running() {
                        handler(message, err);
                    } else {
                        tracing::debug!("async failure after shutdown: {message}: {err:#}");
                    }
                })
            }
            None => Arc::new(|message, err| {
                tracing::error!("async failure: {message}: {err:#}");
            }),
        };

        let log_writer = Arc::new(AsyncLogWriter::new(storage, Arc::clone(&fail_external)));
        if config.enable_output_cache {
            log_writer.enable_output_cache();
        }

        let dp_log = Arc::new(DpLogManager::new(
            Arc::clone(&log_writer),
            Arc::clone(&cursor),
            recovery_records,
        ));
        let data_log = Arc::new(DataLogManager::new(
            Arc::clone(&log_writer),
            Arc::clone(&cursor),
        ));
        if config.enable_logging {
            data_log.enable();
        }

        let mut processor = MailboxProcessor::new(process_input);
        processor.register_log_manager(Arc::clone(&dp_log));

        let executor = processor.executor(MailPriority::Default);
        let hi_executor = processor.executor(MailPriority::High);
        let timer_service = Arc::new(SystemTimerService::new(&log_name));
        let cancelables = Arc::new(CloseableRegistry::new());
        let ping_stop = Arc::new(AtomicBool::new(false));
        {
            let ping_stop = Arc::clone(&ping_stop);
            cancelables.register(move || ping_stop.store(true, Ordering::Release));
        }

        let services = SubtaskServices {
            task_info: task_info.clone(),
            mailbox: processor.mailbox(),
            controller: processor.controller(),
            signals: processor.signals(),
            flags,
            cursor,
            log_writer,
            dp_log: Arc::clone(&dp_log),
            executor: executor.clone(),
            hi_executor,
            termination: ValueFuture::new(),
            timer_service,
            cancelables,
            fail_external,
            ping_stop,
        };

        let ctx = SubtaskContext {
            task_info,
            chain: env.operator_chain,
            writer: RecordWriter::new(env.partition_writer, data_log),
            coordinator: env.checkpoint_coordinator,
            gates: env.input_gates,
            timers: TimerCallbackRegistry::new(),
            control_handler: env.control_handler,
            executor,
            sync_savepoint_id: None,
            active_sync_savepoint_id: None,
            ignore_end_of_input: false,
            disposed_operators: false,
            next_gate: 0,
            print_level: config.print_level,
        };

        bind_mail_handlers(&dp_log, services.mail_deps(), ctx.gates.len());
        dp_log.set_output_replayer(Arc::new(|ctx: &mut SubtaskContext, partition, bytes| {
            ctx.writer.replay_emit(partition, bytes)
        }));

        let driver = Self {
            ctx,
            processor,
            services,
            config,
        };
        driver.start_control_ping();
        tracing::info!(
            log = %log_name,
            logging = driver.config.enable_logging,
            recovery = !driver.services.cursor.is_recovery_completed(),
            "subtask driver created"
        );
        Ok(driver)
    }

    /// The thread-safe control surface for this subtask.
    pub fn handle(&self) -> SubtaskHandle {
        SubtaskHandle {
            services: self.services.clone(),
        }
    }

    /// Task-thread access to the context, for wiring done before `invoke`
    /// (timer deferrals, test instrumentation).
    pub fn context_mut(&mut self) -> &mut SubtaskContext {
        &mut self.ctx
    }

    /// Restore the operator chain and recover gate state; on return the
    /// subtask is running and partition requests are queued.
    pub fn restore(&mut self) -> Result<()> {
        self.run_with_cleanup_on_fail(Self::execute_restore)
    }

    /// Run the subtask to completion: restore if needed, run the mailbox
    /// loop until all actions complete, then close and dispose.
    pub fn invoke(&mut self) -> Result<()> {
        self.run_with_cleanup_on_fail(Self::execute_invoke)?;
        self.clean_up_invoke()
    }

    /// Run one scheduling iteration; test instrumentation.
    pub fn run_mailbox_step(&mut self) -> Result<bool> {
        self.processor.run_step(&mut self.ctx)
    }

    pub fn is_mailbox_loop_running(&self) -> bool {
        self.processor.is_mailbox_loop_running()
    }

    fn execute_restore(&mut self) -> Result<()> {
        if self.services.flags.is_running() {
            tracing::debug!("re-restore attempt rejected for {}", self.ctx.task_info);
            return Ok(());
        }
        self.ctx.disposed_operators = false;
        tracing::debug!("initializing {}", self.ctx.task_info);

        self.ctx.chain.open().context("opening operator chain")?;
        self.ensure_not_canceled()?;

        self.processor.resume_loop();
        let all_gates_recovered = self.spawn_gate_recovery_watcher();

        // Run the mailbox loop until gate recovery suspends it.
        self.processor.run_loop(&mut self.ctx)?;
        self.ensure_not_canceled()?;
        ensure!(
            all_gates_recovered.is_complete(),
            "mailbox loop interrupted before gate recovery was finished"
        );

        for gate_index in 0..self.ctx.gates.len() {
            self.services
                .executor
                .execute(
                    gate_request_mail_name(gate_index),
                    Vec::new(),
                    move |ctx: &mut SubtaskContext| ctx.gates[gate_index].request_partitions(),
                )
                .map_err(|e| anyhow!("queueing partition request: {e}"))?;
        }

        self.services.flags.set_running(true);
        tracing::info!("restored {}", self.ctx.task_info);
        Ok(())
    }

    /// Background watcher for the per-gate state-consumed futures (the
    /// channel-state unspiller side of restore). When every gate reports
    /// consumed it enables replay logging and suspends the restore loop.
    fn spawn_gate_recovery_watcher(&self) -> SignalFuture {
        let gate_futures: Vec<SignalFuture> =
            self.ctx.gates.iter().map(|g| g.state_consumed()).collect();
        let all_recovered = SignalFuture::new();
        let done = all_recovered.clone();
        let flags = Arc::clone(&self.services.flags);
        let dp_log = Arc::clone(&self.services.dp_log);
        let signals = Arc::clone(&self.services.signals);
        let mailbox = Arc::clone(&self.services.mailbox);
        let enable_logging = self.config.enable_logging;

        let builder =
            std::thread::Builder::new().name(format!("gate-recovery-{}", self.ctx.task_info));
        builder
            .spawn(move || {
                for future in gate_futures {
                    loop {
                        if flags.is_canceled() {
                            return;
                        }
                        if future.wait_timeout(Duration::from_millis(50)) {
                            break;
                        }
                    }
                }
                if enable_logging {
                    dp_log.enable();
                }
                done.complete();
                signals.suspend_loop();
                let _ = mailbox.put_head(crate::mailbox::Mail::no_op(
                    MAIL_MAILBOX_POISON,
                    MailPriority::High,
                ));
            })
            .expect("failed to spawn gate recovery watcher");
        all_recovered
    }

    fn execute_invoke(&mut self) -> Result<()> {
        if !self.services.flags.is_running() {
            tracing::debug!("restoring during invoke");
            self.execute_restore()?;
        }
        self.ensure_not_canceled()?;

        self.processor.resume_loop();
        self.processor.run_loop(&mut self.ctx)?;

        self.ensure_not_canceled()?;
        self.after_invoke()
    }

    /// Clean-exit path: close head-to-tail, quiesce timers, drain the
    /// mailbox, flush outputs, dispose tail-to-head.
    fn after_invoke(&mut self) -> Result<()> {
        tracing::debug!("finished task {}", self.ctx.task_info);

        self.ctx.chain.close().context("closing operator chain")?;

        let timers_finished = self.services.timer_service.quiesce();
        self.processor.prepare_close();
        // Only stop reporting "running" after the operators are closed.
        self.services.flags.set_running(false);

        self.processor.drain(&mut self.ctx)?;
        timers_finished.wait();
        tracing::debug!("closed operators for task {}", self.ctx.task_info);

        self.ctx.writer.flush().context("flushing outputs")?;
        self.dispose_operators()?;
        Ok(())
    }

    /// Failure-safe teardown. Never blocks indefinitely: the external
    /// cancellation watchdog may hard-kill the host if we do.
    fn clean_up_invoke(&mut self) -> Result<()> {
        self.services.flags.set_running(false);
        let mut suppressed: Option<anyhow::Error> = None;

        let timer_service = Arc::clone(&self.services.timer_service);
        suppressed = run_and_suppress(suppressed, || {
            if !timer_service.shutdown(CLEANUP_WAIT) {
                tracing::warn!(
                    "timer service shutdown exceeded {CLEANUP_WAIT:?}, continuing teardown"
                );
            }
            Ok(())
        });

        let cancelables = Arc::clone(&self.services.cancelables);
        suppressed = run_and_suppress(suppressed, || {
            cancelables.close();
            Ok(())
        });

        suppressed = run_and_suppress(suppressed, || self.dispose_operators());
        suppressed = run_and_suppress(suppressed, || self.ctx.writer.flush());

        let writer_shutdown = self.services.log_writer.shutdown();
        suppressed = run_and_suppress(suppressed, || {
            if !writer_shutdown.wait_timeout(CLEANUP_WAIT) {
                tracing::warn!("log writer shutdown exceeded {CLEANUP_WAIT:?}");
            }
            Ok(())
        });

        self.processor.close();

        match suppressed {
            None => {
                let state = if self.services.flags.is_canceled() {
                    TerminationState::Canceled
                } else {
                    TerminationState::Finished
                };
                self.services.termination.complete(state);
                Ok(())
            }
            Some(err) => {
                self.services.termination.complete(TerminationState::Failed);
                Err(err)
            }
        }
    }

    fn run_with_cleanup_on_fail(
        &mut self,
        body: fn(&mut Self) -> Result<()>,
    ) -> Result<()> {
        match body(self) {
            Ok(()) => Ok(()),
            Err(invoke_err) => {
                let canceled = self.services.flags.is_canceled();
                self.services.flags.set_failing(!canceled);
                if !is_cancel_error(&invoke_err) {
                    tracing::error!("task {} failed: {invoke_err:#}", self.ctx.task_info);
                }

                let mut err = invoke_err;
                if !canceled {
                    if let Err(cancel_err) = self.ctx.chain.cancel() {
                        err = first_or_suppressed(cancel_err, Some(err));
                    }
                }
                if let Err(cleanup_err) = self.clean_up_invoke() {
                    err = first_or_suppressed(cleanup_err, Some(err));
                }
                Err(err)
            }
        }
    }

    fn dispose_operators(&mut self) -> Result<()> {
        if self.ctx.disposed_operators {
            return Ok(());
        }
        self.ctx.disposed_operators = true;
        self.ctx.chain.dispose().context("disposing operator chain")
    }

    fn ensure_not_canceled(&self) -> Result<()> {
        if self.services.flags.is_canceled() {
            return Err(anyhow::Error::new(CancelTaskError));
        }
        Ok(())
    }

    fn start_control_ping(&self) {
        let Some(delay) = self.config.control_delay else {
            return;
        };
        let stop = Arc::clone(&self.services.ping_stop);
        let executor = self.services.executor.clone();
        let builder =
            std::thread::Builder::new().name(format!("control-ping-{}", self.ctx.task_info));
        builder
            .spawn(move || {
                std::thread::sleep(Duration::from_secs(1));
                while !stop.load(Ordering::Acquire) {
                    if !executor.is_accepting_mails() {
                        break;
                    }
                    executor.try_execute(MAIL_EXP, Vec::new(), |_| Ok(()));
                    std::thread::sleep(delay);
                }
            })
            .expect("failed to spawn control ping thread");
    }
}

/// The default action: process one input event.
fn process_input(
    ctx: &mut SubtaskContext,
    controller: &MailboxController<SubtaskContext>,
) -> Result<()> {
    if !ctx.writer.is_available() {
        // Backpressured: yield until the writer frees up. There is no
        // writer-side listener seam, so park on input availability as well.
        let suspension = controller.suspend_default_action();
        for gate in &mut ctx.gates {
            let suspension = suspension.clone();
            gate.set_available_listener(Box::new(move || suspension.resume()));
        }
        return Ok(());
    }
    match ctx.poll_input()? {
        InputPoll::Record(record) => {
            if ctx.print_level >= 2 {
                tracing::trace!(len = record.len(), "processing input record");
            }
            let SubtaskContext {
                ref mut chain,
                ref mut writer,
                ..
            } = *ctx;
            chain.process_record(record, writer)
        }
        InputPoll::EndOfInput => {
            controller.all_actions_completed();
            Ok(())
        }
        InputPoll::Pending => {
            let suspension = controller.suspend_default_action();
            for gate in &mut ctx.gates {
                let suspension = suspension.clone();
                gate.set_available_listener(Box::new(move || suspension.resume()));
            }
            Ok(())
        }
    }
}

fn run_and_suppress(
    prior: Option<anyhow::Error>,
    body: impl FnOnce() -> Result<()>,
) -> Option<anyhow::Error> {
    match body() {
        Ok(()) => prior,
        Err(err) => Some(first_or_suppressed(err, prior)),
    }
}

/// Execute one mail outside the processor (the nested savepoint loop),
/// logging it exactly as the processor would.
fn execute_mail_with_log(
    ctx: &mut SubtaskContext,
    deps: &MailDeps,
    mail: crate::mailbox::Mail<SubtaskContext>,
) -> Result<()> {
    if let Some(dp_log) = deps.dp_log.upgrade() {
        dp_log.on_mail(&mail.name, &mail.args)?;
    }
    mail.run(ctx)
}

/// The nested mailbox loop of a synchronous savepoint: yield to
/// high-priority mails only, until the savepoint id is reset by completion
/// or abort, or the task is canceled.
///
/// While recovery is in progress the loop is paced from the log instead,
/// exactly like the outer loop; the original run logged the completion or
/// abort mail that freed it.
fn run_synchronous_savepoint_loop(ctx: &mut SubtaskContext, deps: &MailDeps) -> Result<()> {
    debug_assert!(ctx.sync_savepoint_id.is_some());
    while !deps.flags.is_canceled() && ctx.sync_savepoint_id.is_some() {
        if let Some(dp_log) = deps.dp_log.upgrade() {
            if dp_log.is_replaying() {
                dp_log.replay_next(ctx)?;
                continue;
            }
        }
        match deps.mailbox.take(MailPriority::High) {
            Some(mail) => execute_mail_with_log(ctx, deps, mail)?,
            None => break,
        }
    }
    Ok(())
}

/// Perform a checkpoint on the task thread.
///
/// Returns false (after broadcasting a cancel marker downstream) when the
/// subtask is not running.
fn trigger_checkpoint(
    ctx: &mut SubtaskContext,
    deps: &MailDeps,
    metadata: CheckpointMetadata,
    options: CheckpointOptions,
) -> Result<bool> {
    tracing::info!(
        checkpoint_id = metadata.checkpoint_id,
        synchronous = options.synchronous,
        "starting checkpoint on task {}",
        deps.task_info
    );

    if !deps.flags.is_running() {
        // Downstream must not wait for a barrier from this subtask.
        ctx.writer
            .broadcast_cancel_checkpoint_marker(metadata.checkpoint_id)?;
        return Ok(false);
    }

    if options.synchronous {
        ctx.set_sync_savepoint(metadata.checkpoint_id, options.ignore_end_of_input)?;
        if options.advance_to_end_of_time {
            let SubtaskContext {
                ref mut chain,
                ref mut writer,
                ..
            } = *ctx;
            chain.emit_max_watermark(writer)?;
        }
    } else if ctx
        .active_sync_savepoint_id
        .is_some_and(|active| active < metadata.checkpoint_id)
    {
        // A newer checkpoint supersedes the stale savepoint window.
        ctx.active_sync_savepoint_id = None;
        ctx.ignore_end_of_input = false;
    }

    if let Some(dp_log) = deps.dp_log.upgrade() {
        // Replayed checkpoints find their boundary in the log already.
        if dp_log.is_enabled() && !dp_log.is_replaying() {
            let step = deps.cursor.next_step();
            deps.log_writer.append(LogRecord::CheckpointBoundary {
                step,
                checkpoint_id: metadata.checkpoint_id,
            })?;
        }
    }

    {
        let SubtaskContext {
            ref mut chain,
            ref mut coordinator,
            ..
        } = *ctx;
        coordinator.checkpoint_state(&metadata, &options, chain.as_mut(), true)?;
    }

    if options.synchronous && ctx.is_sync_savepoint(metadata.checkpoint_id) {
        run_synchronous_savepoint_loop(ctx, deps)?;
    }
    Ok(true)
}

/// [`trigger_checkpoint`] with the error policy of the control surface:
/// failures while running fail the task; otherwise they are logged and the
/// checkpoint is declined.
fn trigger_checkpoint_guarded(
    ctx: &mut SubtaskContext,
    deps: &MailDeps,
    metadata: CheckpointMetadata,
    options: CheckpointOptions,
) -> Result<bool> {
    match trigger_checkpoint(ctx, deps, metadata, options) {
        Ok(true) => Ok(true),
        Ok(false) => {
            ctx.coordinator
                .decline_checkpoint(metadata.checkpoint_id, "task not ready");
            Ok(false)
        }
        Err(err) => {
            if deps.flags.is_running() {
                Err(err.context(format!(
                    "could not perform checkpoint {} for {}",
                    metadata.checkpoint_id, deps.task_info
                )))
            } else {
                tracing::debug!(
                    checkpoint_id = metadata.checkpoint_id,
                    "checkpoint failed while not running: {err:#}"
                );
                Ok(false)
            }
        }
    }
}

fn notify_checkpoint_complete(
    ctx: &mut SubtaskContext,
    deps: &MailDeps,
    checkpoint_id: u64,
) -> Result<()> {
    let replaying = deps
        .dp_log
        .upgrade()
        .is_some_and(|dp_log| dp_log.is_replaying());
    if !replaying {
        // Under replay the logged Clear record drives the cache instead.
        deps.log_writer.clear_cached_output(checkpoint_id)?;
    }
    {
        let SubtaskContext {
            ref mut chain,
            ref mut coordinator,
            ..
        } = *ctx;
        coordinator.notify_checkpoint_complete(
            checkpoint_id,
            chain.as_mut(),
            deps.flags.is_running(),
        )?;
    }
    if deps.flags.is_running() && ctx.is_sync_savepoint(checkpoint_id) {
        ctx.chain.finish()?;
        // Frees the synchronous savepoint mailbox loop and sends the task
        // through its normal termination routine.
        ctx.reset_sync_savepoint(checkpoint_id, true);
        deps.all_actions_completed();
    }
    Ok(())
}

fn notify_checkpoint_aborted(
    ctx: &mut SubtaskContext,
    deps: &MailDeps,
    checkpoint_id: u64,
) -> Result<()> {
    ctx.reset_sync_savepoint(checkpoint_id, false);
    let SubtaskContext {
        ref mut chain,
        ref mut coordinator,
        ..
    } = *ctx;
    coordinator.notify_checkpoint_aborted(checkpoint_id, chain.as_mut(), deps.flags.is_running())
}

fn handle_control(ctx: &mut SubtaskContext, message: &ControlMessage) -> Result<()> {
    if let Some(handler) = ctx.control_handler.clone() {
        handler(&ctx.task_info, message)?;
    }
    if let Some(epoch) = message.epoch {
        ctx.writer.broadcast_epoch_barrier(epoch, &message.payload)?;
    }
    Ok(())
}

fn arg_u32(args: &[MailArg], index: usize) -> Result<u32> {
    args.get(index)
        .and_then(MailArg::as_u32)
        .ok_or_else(|| missing_arg(args, index, "u32"))
}

fn arg_u64(args: &[MailArg], index: usize) -> Result<u64> {
    args.get(index)
        .and_then(MailArg::as_u64)
        .ok_or_else(|| missing_arg(args, index, "u64"))
}

fn arg_i64(args: &[MailArg], index: usize) -> Result<i64> {
    args.get(index)
        .and_then(MailArg::as_i64)
        .ok_or_else(|| missing_arg(args, index, "i64"))
}

fn arg_bytes<'a>(args: &'a [MailArg], index: usize) -> Result<&'a [u8]> {
    args.get(index)
        .and_then(MailArg::as_bytes)
        .ok_or_else(|| missing_arg(args, index, "bytes"))
}

fn missing_arg(args: &[MailArg], index: usize, expected: &str) -> anyhow::Error {
    anyhow::Error::new(RecoveryError::Malformed(format!(
        "expected {expected} mail argument at index {index}, got {args:?}"
    )))
}

/// Bind every recognized mail name. The name set is frozen: an unknown name
/// met during replay is a fatal recovery error.
fn bind_mail_handlers(
    dp_log: &Arc<DpLogManager<SubtaskContext>>,
    deps: MailDeps,
    num_gates: usize,
) {
    dp_log.bind(MAIL_TIMER_CALLBACK, |ctx: &mut SubtaskContext, args| {
        let id = arg_u32(args, 0)?;
        let timestamp = arg_i64(args, 1)?;
        let callback = ctx
            .timers
            .get(id)
            .ok_or(RecoveryError::UnknownTimerId(id))?;
        callback(ctx, timestamp)
    });

    for gate_index in 0..num_gates {
        dp_log.bind(
            gate_request_mail_name(gate_index),
            move |ctx: &mut SubtaskContext, _args| ctx.gates[gate_index].request_partitions(),
        );
    }

    dp_log.bind(
        MAIL_DISPATCH_OPERATOR_EVENT,
        |ctx: &mut SubtaskContext, args| {
            let operator_id = arg_u32(args, 0)?;
            let event = arg_bytes(args, 1)?.to_vec();
            ctx.chain.dispatch_operator_event(operator_id, &event)
        },
    );

    {
        let signals = Arc::clone(&deps.signals);
        dp_log.bind(MAIL_PAUSE, move |_ctx, _args| {
            signals.mark_paused();
            Ok(())
        });
    }
    {
        let signals = Arc::clone(&deps.signals);
        dp_log.bind(MAIL_RESUME, move |_ctx, _args| {
            signals.mark_resumed();
            Ok(())
        });
    }

    dp_log.bind_no_op(MAIL_EXP);
    dp_log.bind_no_op(MAIL_RESUME_DEFAULT_ACTION);
    dp_log.bind_no_op(MAIL_MAILBOX_POISON);

    dp_log.bind(MAIL_CONTROL, |ctx: &mut SubtaskContext, args| {
        let message: ControlMessage = bincode::deserialize(arg_bytes(args, 0)?)
            .map_err(|e| RecoveryError::Malformed(format!("control message: {e}")))?;
        handle_control(ctx, &message)
    });

    {
        let deps = deps.clone();
        dp_log.bind(MAIL_CHECKPOINT, move |ctx: &mut SubtaskContext, args| {
            let metadata: CheckpointMetadata = bincode::deserialize(arg_bytes(args, 0)?)
                .map_err(|e| RecoveryError::Malformed(format!("checkpoint metadata: {e}")))?;
            let options: CheckpointOptions = bincode::deserialize(arg_bytes(args, 1)?)
                .map_err(|e| RecoveryError::Malformed(format!("checkpoint options: {e}")))?;
            trigger_checkpoint_guarded(ctx, &deps, metadata, options).map(|_| ())
        });
    }
    {
        let deps = deps.clone();
        dp_log.bind(
            MAIL_CHECKPOINT_COMPLETE,
            move |ctx: &mut SubtaskContext, args| {
                let checkpoint_id = arg_u64(args, 0)?;
                notify_checkpoint_complete(ctx, &deps, checkpoint_id)
            },
        );
    }
    {
        let deps = deps.clone();
        dp_log.bind(
            MAIL_CHECKPOINT_ABORTED,
            move |ctx: &mut SubtaskContext, args| {
                let checkpoint_id = arg_u64(args, 0)?;
                notify_checkpoint_aborted(ctx, &deps, checkpoint_id)
            },
        );
    }
}

/// Thread-safe control surface of a subtask.
#[derive(Clone)]
pub struct SubtaskHandle {
    services: SubtaskServices,
}

impl SubtaskHandle {
    /// Enqueue a `"checkpoint"` mail; the future resolves with whether the
    /// checkpoint was performed.
    pub fn trigger_checkpoint_async(
        &self,
        metadata: CheckpointMetadata,
        options: CheckpointOptions,
    ) -> ValueFuture<Result<bool, String>> {
        let future: ValueFuture<Result<bool, String>> = ValueFuture::new();
        let (meta_bytes, options_bytes) =
            match (bincode::serialize(&metadata), bincode::serialize(&options)) {
                (Ok(m), Ok(o)) => (m, o),
                (m, o) => {
                    let err = m.err().or(o.err()).map(|e| e.to_string()).unwrap_or_default();
                    future.complete(Err(format!("serializing checkpoint mail: {err}")));
                    return future;
                }
            };

        let deps = self.services.mail_deps();
        let result = future.clone();
        let enqueue = self.services.executor.execute(
            MAIL_CHECKPOINT,
            vec![MailArg::Bytes(meta_bytes), MailArg::Bytes(options_bytes)],
            move |ctx: &mut SubtaskContext| {
                match trigger_checkpoint_guarded(ctx, &deps, metadata, options) {
                    Ok(performed) => {
                        result.complete(Ok(performed));
                        Ok(())
                    }
                    Err(err) => {
                        result.complete(Err(format!("{err:#}")));
                        Err(err)
                    }
                }
            },
        );
        if let Err(err) = enqueue {
            future.complete(Err(format!("checkpoint rejected: {err}")));
        }
        future
    }

    pub fn notify_checkpoint_complete_async(
        &self,
        checkpoint_id: u64,
    ) -> ValueFuture<Result<(), String>> {
        self.notify_checkpoint_operation(
            MAIL_CHECKPOINT_COMPLETE,
            checkpoint_id,
            notify_checkpoint_complete,
        )
    }

    pub fn notify_checkpoint_abort_async(
        &self,
        checkpoint_id: u64,
    ) -> ValueFuture<Result<(), String>> {
        self.notify_checkpoint_operation(
            MAIL_CHECKPOINT_ABORTED,
            checkpoint_id,
            notify_checkpoint_aborted,
        )
    }

    fn notify_checkpoint_operation(
        &self,
        name: &'static str,
        checkpoint_id: u64,
        operation: fn(&mut SubtaskContext, &MailDeps, u64) -> Result<()>,
    ) -> ValueFuture<Result<(), String>> {
        let future: ValueFuture<Result<(), String>> = ValueFuture::new();
        let deps = self.services.mail_deps();
        let result = future.clone();
        let enqueue = self.services.hi_executor.execute(
            name,
            vec![MailArg::U64(checkpoint_id)],
            move |ctx: &mut SubtaskContext| match operation(ctx, &deps, checkpoint_id) {
                Ok(()) => {
                    result.complete(Ok(()));
                    Ok(())
                }
                Err(err) => {
                    result.complete(Err(format!("{err:#}")));
                    Err(err)
                }
            },
        );
        if let Err(err) = enqueue {
            future.complete(Err(format!("{name} rejected: {err}")));
        }
        future
    }

    /// Deliver a coordinator event to an operator. A rejection during
    /// shutdown is swallowed.
    pub fn dispatch_operator_event(&self, operator_id: u32, event: Vec<u8>) {
        let event_for_body = event.clone();
        self.services.executor.try_execute(
            MAIL_DISPATCH_OPERATOR_EVENT,
            vec![MailArg::U32(operator_id), MailArg::Bytes(event)],
            move |ctx: &mut SubtaskContext| {
                ctx.chain.dispatch_operator_event(operator_id, &event_for_body)
            },
        );
    }

    /// Deliver a control message.
    pub fn send_control(&self, message: ControlMessage) {
        let payload = match bincode::serialize(&message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!("dropping unserializable control message: {err}");
                return;
            }
        };
        self.services.executor.try_execute(
            MAIL_CONTROL,
            vec![MailArg::Bytes(payload)],
            move |ctx: &mut SubtaskContext| handle_control(ctx, &message),
        );
    }

    /// Pause the default action; mails continue to run.
    pub fn pause(&self) {
        let signals = Arc::clone(&self.services.signals);
        self.services
            .executor
            .try_execute(MAIL_PAUSE, Vec::new(), move |_ctx| {
                signals.mark_paused();
                Ok(())
            });
    }

    /// Resume the default action.
    pub fn resume(&self) {
        let signals = Arc::clone(&self.services.signals);
        self.services
            .executor
            .try_execute(MAIL_RESUME, Vec::new(), move |_ctx| {
                signals.mark_resumed();
                Ok(())
            });
    }

    /// Completes when the paused state has been reached; pending again after
    /// every resume.
    pub fn pause_reached(&self) -> FutureGate {
        self.services.signals.pause_reached()
    }

    /// The wall-clock timer service owned by this subtask. Callbacks given
    /// to it fire on a helper thread; use
    /// [`SubtaskContext::defer_timer`] wrappers so firing only enqueues a
    /// `"Timer callback"` mail.
    pub fn timer_service(&self) -> Arc<SystemTimerService> {
        Arc::clone(&self.services.timer_service)
    }

    /// Stop background services; completes when all buffered log records are
    /// durable.
    pub fn shutdown(&self) -> SignalFuture {
        self.services.ping_stop.store(true, Ordering::Release);
        self.services.log_writer.shutdown()
    }

    /// Cancel the subtask. Returns the termination future.
    ///
    /// Cancellation is cooperative: the flag is observed by the task thread
    /// at its documented check points and the loop is woken via
    /// all-actions-completed; operator state is never touched from here.
    pub fn cancel(&self) -> ValueFuture<TerminationState> {
        self.services.flags.set_running(false);
        self.services.flags.set_canceled();
        self.services.controller.all_actions_completed();
        self.services.cancelables.close();
        self.services.termination.clone()
    }

    /// Route a helper-thread failure; only fails the task while running.
    pub fn handle_async_exception(&self, message: &str, err: &anyhow::Error) {
        (self.services.fail_external)(message, err);
    }

    pub fn termination_future(&self) -> ValueFuture<TerminationState> {
        self.services.termination.clone()
    }

    pub fn is_running(&self) -> bool {
        self.services.flags.is_running()
    }

    pub fn is_canceled(&self) -> bool {
        self.services.flags.is_canceled()
    }

    pub fn is_failing(&self) -> bool {
        self.services.flags.is_failing()
    }
}

#[cfg(test)]
#[path = "tests/subtask_tests.rs"]
mod tests;

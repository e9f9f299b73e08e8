//! External-collaborator traits.
//!
//! The driver specifies *when* these are called and in what order; their
//! internals (operator business logic, serializers, network buffers, the
//! checkpoint machinery above the subtask) live elsewhere.

use std::sync::Arc;

use anyhow::Result;

use crate::recovery::AsyncErrorHandler;
use crate::util::SignalFuture;

use super::checkpoint::{CheckpointMetadata, CheckpointOptions, ControlMessage};
use super::record_writer::RecordWriter;

/// Result of polling an input gate for one event.
#[derive(Debug, Clone, PartialEq)]
pub enum InputPoll {
    /// One serialized input record.
    Record(Vec<u8>),
    /// Nothing available right now; the gate will fire the availability
    /// listener when that may have changed.
    Pending,
    /// This input is exhausted.
    EndOfInput,
}

/// An upstream network gate.
///
/// Called only from the task thread, except that the availability listener
/// it invokes may run on network threads.
pub trait InputGate: Send {
    fn poll_next(&mut self) -> Result<InputPoll>;

    /// Ask upstream for its partitions. Re-requesting is a no-op; the call
    /// is replayed from the log after a restart.
    fn request_partitions(&mut self) -> Result<()>;

    /// Completes when recovered channel state has been fully consumed.
    fn state_consumed(&self) -> SignalFuture;

    /// Install the callback to invoke (from any thread) when input may be
    /// available again. Replaces any previous listener.
    fn set_available_listener(&mut self, listener: Box<dyn Fn() + Send + Sync>);
}

/// The downstream partition surface.
pub trait PartitionWriter: Send {
    fn write(&mut self, partition: u16, bytes: &[u8]) -> Result<()>;

    /// Tell downstream not to wait for a barrier from this subtask.
    fn broadcast_cancel_checkpoint_marker(&mut self, checkpoint_id: u64) -> Result<()>;

    /// Broadcast an epoch barrier carrying a control payload.
    fn broadcast_epoch_barrier(&mut self, epoch: u64, payload: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Backpressure probe; the default action yields while unavailable.
    fn is_available(&self) -> bool {
        true
    }
}

/// The operator chain owned by this subtask, executed head to tail.
pub trait OperatorChain: Send {
    /// Initialize state and open operators, head to tail.
    fn open(&mut self) -> Result<()>;

    /// Process one input record, emitting through `out`.
    fn process_record(&mut self, record: Vec<u8>, out: &mut RecordWriter) -> Result<()>;

    /// Deliver a coordinator event to the addressed operator.
    fn dispatch_operator_event(&mut self, operator_id: u32, event: &[u8]) -> Result<()>;

    /// Emit the maximum watermark so all event-time timers fire. Only
    /// meaningful for source-like chains; default is a no-op.
    fn emit_max_watermark(&mut self, out: &mut RecordWriter) -> Result<()> {
        let _ = out;
        Ok(())
    }

    /// Go through the normal termination routine after a synchronous
    /// savepoint completes. Default is a no-op.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    /// Abort in-flight work on the failure path. Default is a no-op.
    fn cancel(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close operators head to tail.
    fn close(&mut self) -> Result<()>;

    /// Dispose operators tail to head. Must be safe after a failed close.
    fn dispose(&mut self) -> Result<()>;
}

/// The subtask-level checkpoint machinery (snapshots run on its own worker
/// pool; it never mutates operator state from other threads).
pub trait CheckpointCoordinator: Send {
    fn checkpoint_state(
        &mut self,
        metadata: &CheckpointMetadata,
        options: &CheckpointOptions,
        chain: &mut dyn OperatorChain,
        is_running: bool,
    ) -> Result<()>;

    fn notify_checkpoint_complete(
        &mut self,
        checkpoint_id: u64,
        chain: &mut dyn OperatorChain,
        is_running: bool,
    ) -> Result<()>;

    fn notify_checkpoint_aborted(
        &mut self,
        checkpoint_id: u64,
        chain: &mut dyn OperatorChain,
        is_running: bool,
    ) -> Result<()>;

    /// Report that a triggered checkpoint could not be performed.
    fn decline_checkpoint(&mut self, checkpoint_id: u64, reason: &str);
}

/// Identity of this subtask within its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub task_name: String,
    pub subtask_index: usize,
}

impl TaskInfo {
    pub fn new(task_name: impl Into<String>, subtask_index: usize) -> Self {
        Self {
            task_name: task_name.into(),
            subtask_index,
        }
    }

    /// Stable name of this subtask's replay log.
    pub fn log_name(&self) -> String {
        format!("{}-{}", self.task_name, self.subtask_index)
    }
}

impl std::fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.task_name, self.subtask_index)
    }
}

/// Callback applied to control messages on the task thread.
pub type ControlHandler = Arc<dyn Fn(&TaskInfo, &ControlMessage) -> Result<()> + Send + Sync>;

/// Everything a subtask needs from the outside world.
pub struct SubtaskEnvironment {
    pub task_info: TaskInfo,
    pub input_gates: Vec<Box<dyn InputGate>>,
    pub partition_writer: Box<dyn PartitionWriter>,
    pub operator_chain: Box<dyn OperatorChain>,
    pub checkpoint_coordinator: Box<dyn CheckpointCoordinator>,
    /// Applied to control messages; `None` ignores their payloads.
    pub control_handler: Option<ControlHandler>,
    /// Receives async failures (helper threads) while the task is running.
    /// `None` logs them.
    pub fail_external: Option<AsyncErrorHandler>,
}

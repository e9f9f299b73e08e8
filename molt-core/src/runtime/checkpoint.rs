//! Checkpoint and control-message payloads.
//!
//! These travel as mail arguments and therefore must be serializable: the
//! replay log stores them as opaque bincode bytes inside the mail's
//! argument list.

use serde::{Deserialize, Serialize};

/// Identity of one triggered checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub checkpoint_id: u64,
    /// Trigger timestamp at the coordinator, epoch milliseconds.
    pub timestamp: i64,
}

impl CheckpointMetadata {
    pub fn new(checkpoint_id: u64, timestamp: i64) -> Self {
        Self {
            checkpoint_id,
            timestamp,
        }
    }
}

/// How a checkpoint is to be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointOptions {
    /// Stop-with-savepoint: after snapshotting, the task thread enters a
    /// mailbox-only loop until the savepoint completes or aborts.
    pub synchronous: bool,
    /// Emit the maximum watermark first so all event-time timers fire.
    pub advance_to_end_of_time: bool,
    /// Keep running past end-of-input while the savepoint is active.
    pub ignore_end_of_input: bool,
}

impl CheckpointOptions {
    pub fn checkpoint() -> Self {
        Self::default()
    }

    pub fn synchronous_savepoint(advance_to_end_of_time: bool) -> Self {
        Self {
            synchronous: true,
            advance_to_end_of_time,
            ignore_end_of_input: advance_to_end_of_time,
        }
    }
}

/// An opaque control message delivered to the subtask from a coordinator.
///
/// The payload is interpreted by the control handler registered in the
/// environment. In epoch mode, an epoch barrier carrying the payload is
/// broadcast on the outputs after the handler runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub payload: Vec<u8>,
    pub epoch: Option<u64>,
}

impl ControlMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            epoch: None,
        }
    }

    pub fn with_epoch(payload: Vec<u8>, epoch: u64) -> Self {
        Self {
            payload,
            epoch: Some(epoch),
        }
    }
}

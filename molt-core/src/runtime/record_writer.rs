//! The output path: every emission funnels through the data log.

use std::sync::Arc;

use anyhow::Result;

use crate::recovery::{DataLogManager, EmitDecision};

use super::env::PartitionWriter;

/// Wraps the partition writer with deterministic-replay interception.
///
/// Live emissions are logged under a step number before they reach the
/// network; while recovery is in progress they are suppressed entirely and
/// the logged bytes are re-emitted instead (see
/// [`replay_emit`](RecordWriter::replay_emit)).
pub struct RecordWriter {
    partition_writer: Box<dyn PartitionWriter>,
    data_log: Arc<DataLogManager>,
}

impl RecordWriter {
    pub fn new(partition_writer: Box<dyn PartitionWriter>, data_log: Arc<DataLogManager>) -> Self {
        Self {
            partition_writer,
            data_log,
        }
    }

    /// Emit one record to a partition, subject to logging and suppression.
    pub fn emit(&mut self, partition: u16, bytes: &[u8]) -> Result<()> {
        match self.data_log.on_emit(partition, bytes)? {
            EmitDecision::Forward => self.partition_writer.write(partition, bytes),
            EmitDecision::Suppress => Ok(()),
        }
    }

    /// Emit logged bytes directly, bypassing the data log. Replay only.
    pub fn replay_emit(&mut self, partition: u16, bytes: &[u8]) -> Result<()> {
        self.partition_writer.write(partition, bytes)
    }

    pub fn broadcast_cancel_checkpoint_marker(&mut self, checkpoint_id: u64) -> Result<()> {
        self.partition_writer
            .broadcast_cancel_checkpoint_marker(checkpoint_id)
    }

    pub fn broadcast_epoch_barrier(&mut self, epoch: u64, payload: &[u8]) -> Result<()> {
        self.partition_writer.broadcast_epoch_barrier(epoch, payload)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.partition_writer.flush()
    }

    pub fn is_available(&self) -> bool {
        self.partition_writer.is_available()
    }
}

//! The data (output) log manager.
//!
//! Sits between operator output and the partition writer. Live path: every
//! outbound record is appended to the log under the next step number and
//! forwarded. Recovery path: live emissions are suppressed — the logged
//! bytes are authoritative and re-emitted by the DP log manager in step
//! order, which makes downstream state bit-identical regardless of operator
//! determinism.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use super::cursor::StepCursor;
use super::record::LogRecord;
use super::writer::AsyncLogWriter;

/// What the caller must do with a live emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitDecision {
    /// Forward the bytes to the partition writer.
    Forward,
    /// Drop the bytes; the replayed log supplies this step's output.
    Suppress,
}

pub struct DataLogManager {
    writer: Arc<AsyncLogWriter>,
    cursor: Arc<StepCursor>,
    enabled: AtomicBool,
}

impl DataLogManager {
    pub fn new(writer: Arc<AsyncLogWriter>, cursor: Arc<StepCursor>) -> Self {
        Self {
            writer,
            cursor,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Decide the fate of one live emission, logging it if appropriate.
    pub fn on_emit(&self, partition: u16, bytes: &[u8]) -> Result<EmitDecision> {
        if !self.is_enabled() {
            return Ok(EmitDecision::Forward);
        }
        if !self.cursor.is_recovery_completed() {
            tracing::trace!(partition, "suppressing live emission during replay");
            return Ok(EmitDecision::Suppress);
        }
        let step = self.cursor.next_step();
        self.writer
            .append(LogRecord::OutputEmitted {
                step,
                partition,
                bytes: bytes.to_vec(),
            })
            .with_context(|| format!("logging output at step {step}"))?;
        Ok(EmitDecision::Forward)
    }
}

#[cfg(test)]
#[path = "tests/data_log_tests.rs"]
mod tests;

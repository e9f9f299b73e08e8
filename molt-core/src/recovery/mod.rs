//! The deterministic-replay log.
//!
//! Every scheduling decision (a mail execution) and every outbound record is
//! appended to an append-only log under a monotonically increasing step
//! number. On restart the log is read back and replayed in step order, mails
//! re-dispatched by name through the [`MailResolver`] and outputs re-emitted
//! byte-identically, before live scheduling resumes.

mod cursor;
mod data_log;
mod dp_log;
mod record;
mod resolver;
mod storage;
mod writer;

pub use cursor::StepCursor;
pub use data_log::{DataLogManager, EmitDecision};
pub use dp_log::{DpLogManager, OutputReplayer};
pub use record::{decode_log, recovery_target, LogRecord};
pub use resolver::{MailHandler, MailResolver};
pub use storage::{
    open_log_storage, LocalDiskLogStorage, LogStorage, MemoryLogStorage, RemoteFsLogStorage,
};
pub use writer::{AsyncErrorHandler, AsyncLogWriter, CachedOutput};

use anyhow::{Context, Result};
use std::sync::Arc;

/// Read and decode the entire recovery log from storage.
///
/// A missing log reads as empty: there is nothing to replay.
pub fn read_recovery_log(storage: &Arc<dyn LogStorage>) -> Result<Vec<LogRecord>> {
    let bytes = storage
        .read_all()
        .with_context(|| format!("reading recovery log {:?}", storage.log_name()))?;
    let records = decode_log(&bytes)
        .with_context(|| format!("decoding recovery log {:?}", storage.log_name()))?;
    Ok(records)
}

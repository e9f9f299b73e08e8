//! Asynchronous, batching log writer.
//!
//! Appends never perform I/O on the task thread: records go into a bounded
//! single-producer buffer and a dedicated worker thread batches them into the
//! storage backend. On the first storage failure the writer reports through
//! the async-exception channel and drops into a fail-fast state where
//! further appends return errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ahash::AHashMap;
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use crate::util::SignalFuture;

use super::record::LogRecord;
use super::storage::LogStorage;

/// Handler for failures raised on helper threads.
pub type AsyncErrorHandler = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;

/// Capacity of the append buffer between the task thread and the worker.
const WRITER_BUFFER_CAPACITY: usize = 4096;

enum Command {
    Append(LogRecord),
    Flush(SignalFuture),
    Shutdown(SignalFuture),
}

/// An output record retained in memory for replay of uncommitted windows.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedOutput {
    pub step: u64,
    pub partition: u16,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct OutputCache {
    enabled: bool,
    outputs: Vec<CachedOutput>,
    /// checkpoint id -> boundary step
    boundaries: AHashMap<u64, u64>,
}

/// Buffers, batches and durably appends log records.
pub struct AsyncLogWriter {
    tx: Sender<Command>,
    failed: Arc<AtomicBool>,
    shutting_down: AtomicBool,
    cache: Mutex<OutputCache>,
    worker: Mutex<Option<JoinHandle<()>>>,
    log_name: String,
}

impl AsyncLogWriter {
    pub fn new(storage: Arc<dyn LogStorage>, error_handler: AsyncErrorHandler) -> Self {
        let (tx, rx) = bounded(WRITER_BUFFER_CAPACITY);
        let failed = Arc::new(AtomicBool::new(false));
        let log_name = storage.log_name().to_string();

        let worker = {
            let failed = Arc::clone(&failed);
            let thread_name = format!("log-writer-{log_name}");
            std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || run_worker(storage, rx, failed, error_handler))
                .expect("failed to spawn log writer thread")
        };

        Self {
            tx,
            failed,
            shutting_down: AtomicBool::new(false),
            cache: Mutex::new(OutputCache::default()),
            worker: Mutex::new(Some(worker)),
            log_name,
        }
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    /// Enqueue one record for durable append. Ordering from the task thread
    /// is preserved. Errors once the writer has failed or shut down.
    pub fn append(&self, record: LogRecord) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(anyhow!("log writer for {:?} is in failed state", self.log_name));
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(anyhow!("log writer for {:?} is shut down", self.log_name));
        }

        self.cache_record(&record);
        self.tx
            .send(Command::Append(record))
            .map_err(|_| anyhow!("log writer for {:?} is no longer running", self.log_name))
    }

    /// Retain emitted output bytes in memory, keyed by checkpoint window.
    pub fn enable_output_cache(&self) {
        self.cache.lock().expect("output cache poisoned").enabled = true;
    }

    pub fn is_output_cache_enabled(&self) -> bool {
        self.cache.lock().expect("output cache poisoned").enabled
    }

    /// Record a checkpoint's output-window boundary without appending
    /// (replay path: the boundary is already in the log).
    pub fn note_boundary(&self, checkpoint_id: u64, step: u64) {
        let mut cache = self.cache.lock().expect("output cache poisoned");
        if cache.enabled {
            cache.boundaries.insert(checkpoint_id, step);
        }
    }

    /// Discard cached outputs whose steps precede the completed checkpoint's
    /// boundary, and log the clear. Unknown checkpoint ids are a no-op.
    pub fn clear_cached_output(&self, checkpoint_id: u64) -> Result<()> {
        let boundary = {
            let mut cache = self.cache.lock().expect("output cache poisoned");
            if !cache.enabled {
                return Ok(());
            }
            let Some(boundary) = cache.boundaries.remove(&checkpoint_id) else {
                tracing::debug!(checkpoint_id, "no cached boundary for completed checkpoint");
                return Ok(());
            };
            cache.outputs.retain(|o| o.step > boundary);
            cache.boundaries.retain(|_, step| *step > boundary);
            boundary
        };
        self.append(LogRecord::Clear { step: boundary })
    }

    /// Drop cached outputs at steps up to and including `step` without
    /// logging (replay path, applying a logged `Clear`).
    pub fn apply_clear(&self, step: u64) {
        let mut cache = self.cache.lock().expect("output cache poisoned");
        cache.outputs.retain(|o| o.step > step);
        cache.boundaries.retain(|_, boundary| *boundary > step);
    }

    pub fn cached_outputs(&self) -> Vec<CachedOutput> {
        self.cache
            .lock()
            .expect("output cache poisoned")
            .outputs
            .clone()
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Completes after everything appended so far is durably persisted.
    pub fn flush(&self) -> SignalFuture {
        let signal = SignalFuture::new();
        if self.tx.send(Command::Flush(signal.clone())).is_err() {
            signal.complete();
        }
        signal
    }

    /// Stop the worker after persisting all buffered records. Idempotent.
    pub fn shutdown(&self) -> SignalFuture {
        self.shutting_down.store(true, Ordering::Release);
        let signal = SignalFuture::new();
        if self.tx.send(Command::Shutdown(signal.clone())).is_err() {
            signal.complete();
        }
        if let Some(worker) = self.worker.lock().expect("writer worker poisoned").take() {
            let signal = signal.clone();
            std::thread::spawn(move || {
                let _ = worker.join();
                signal.complete();
            });
        }
        signal
    }

    fn cache_record(&self, record: &LogRecord) {
        let mut cache = self.cache.lock().expect("output cache poisoned");
        if !cache.enabled {
            return;
        }
        match record {
            LogRecord::OutputEmitted {
                step,
                partition,
                bytes,
            } => cache.outputs.push(CachedOutput {
                step: *step,
                partition: *partition,
                bytes: bytes.clone(),
            }),
            LogRecord::CheckpointBoundary {
                step,
                checkpoint_id,
            } => {
                cache.boundaries.insert(*checkpoint_id, *step);
            }
            _ => {}
        }
    }
}

fn run_worker(
    storage: Arc<dyn LogStorage>,
    rx: Receiver<Command>,
    failed: Arc<AtomicBool>,
    error_handler: AsyncErrorHandler,
) {
    let mut encode_buf: Vec<u8> = Vec::with_capacity(64 * 1024);
    let mut carried: Option<Command> = None;

    loop {
        let command = match carried.take() {
            Some(command) => command,
            None => match rx.recv() {
                Ok(command) => command,
                Err(_) => return,
            },
        };

        match command {
            Command::Append(record) => {
                encode_buf.clear();
                record.encode(&mut encode_buf);
                // Batch every append already waiting in the buffer.
                loop {
                    match rx.try_recv() {
                        Ok(Command::Append(next)) => next.encode(&mut encode_buf),
                        Ok(other) => {
                            carried = Some(other);
                            break;
                        }
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                }
                if failed.load(Ordering::Acquire) {
                    continue;
                }
                if let Err(e) = storage.append(&encode_buf) {
                    failed.store(true, Ordering::Release);
                    let err = anyhow::Error::new(e)
                        .context(format!("appending to replay log {:?}", storage.log_name()));
                    tracing::error!("log writer entering fail-fast state: {err:#}");
                    error_handler("replay log append failed", &err);
                }
            }
            Command::Flush(signal) => signal.complete(),
            Command::Shutdown(signal) => {
                signal.complete();
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/writer_tests.rs"]
mod tests;

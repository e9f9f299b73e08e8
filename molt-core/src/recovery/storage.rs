//! Log storage backends: named append-only byte streams.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::config::{StorageType, SubtaskConfig};
use crate::error::StorageError;

/// A named byte-stream store for one subtask's replay log.
///
/// The append stream is written by a single producer (the async log writer's
/// worker thread); concurrent appenders produce undefined results. Reads
/// return the full historical byte sequence; a log that was never written
/// reads as empty.
pub trait LogStorage: Send + Sync {
    fn log_name(&self) -> &str;
    fn exists(&self) -> Result<bool, StorageError>;
    fn read_all(&self) -> Result<Vec<u8>, StorageError>;
    fn append(&self, bytes: &[u8]) -> Result<(), StorageError>;
    /// Truncate the log. No-op if it does not exist.
    fn clear(&self) -> Result<(), StorageError>;
    /// Remove the log entirely. No-op if it does not exist.
    fn delete(&self) -> Result<(), StorageError>;
}

/// Volatile in-memory storage.
///
/// Survives a simulated restart only while the same `Arc` is handed to the
/// next incarnation; used by tests and local experiments.
pub struct MemoryLogStorage {
    name: String,
    buf: Mutex<Option<Vec<u8>>>,
}

impl MemoryLogStorage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buf: Mutex::new(None),
        }
    }
}

impl LogStorage for MemoryLogStorage {
    fn log_name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> Result<bool, StorageError> {
        Ok(self.buf.lock().expect("memory log poisoned").is_some())
    }

    fn read_all(&self) -> Result<Vec<u8>, StorageError> {
        Ok(self
            .buf
            .lock()
            .expect("memory log poisoned")
            .clone()
            .unwrap_or_default())
    }

    fn append(&self, bytes: &[u8]) -> Result<(), StorageError> {
        self.buf
            .lock()
            .expect("memory log poisoned")
            .get_or_insert_with(Vec::new)
            .extend_from_slice(bytes);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut buf = self.buf.lock().expect("memory log poisoned");
        if let Some(buf) = buf.as_mut() {
            buf.clear();
        }
        Ok(())
    }

    fn delete(&self) -> Result<(), StorageError> {
        *self.buf.lock().expect("memory log poisoned") = None;
        Ok(())
    }
}

/// One append-only file per log name on the local disk.
pub struct LocalDiskLogStorage {
    name: String,
    path: PathBuf,
}

impl LocalDiskLogStorage {
    pub fn new(name: impl Into<String>, base_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let name = name.into();
        fs::create_dir_all(base_dir.as_ref())?;
        let path = base_dir.as_ref().join(format!("{name}.rlog"));
        Ok(Self { name, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogStorage for LocalDiskLogStorage {
    fn log_name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> Result<bool, StorageError> {
        Ok(self.path.exists())
    }

    fn read_all(&self) -> Result<Vec<u8>, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn append(&self, bytes: &[u8]) -> Result<(), StorageError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(bytes)?;
        file.sync_data()?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        if self.path.exists() {
            fs::write(&self.path, [])?;
        }
        Ok(())
    }

    fn delete(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Storage on a distributed filesystem exposed as a mount point.
///
/// The driver for the filesystem itself is pluggable and external; this
/// backend only assumes POSIX-style append semantics under the configured
/// root (`hdfs-log-storage`).
pub struct RemoteFsLogStorage {
    inner: LocalDiskLogStorage,
}

impl RemoteFsLogStorage {
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            inner: LocalDiskLogStorage::new(name, root)?,
        })
    }
}

impl LogStorage for RemoteFsLogStorage {
    fn log_name(&self) -> &str {
        self.inner.log_name()
    }

    fn exists(&self) -> Result<bool, StorageError> {
        self.inner.exists()
    }

    fn read_all(&self) -> Result<Vec<u8>, StorageError> {
        self.inner.read_all()
    }

    fn append(&self, bytes: &[u8]) -> Result<(), StorageError> {
        self.inner.append(bytes)
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear()
    }

    fn delete(&self) -> Result<(), StorageError> {
        self.inner.delete()
    }
}

/// Open the storage backend selected by the configuration.
pub fn open_log_storage(
    config: &SubtaskConfig,
    log_name: &str,
) -> Result<Arc<dyn LogStorage>, StorageError> {
    match config.storage_type {
        StorageType::Memory => Ok(Arc::new(MemoryLogStorage::new(log_name))),
        StorageType::LocalDisk => Ok(Arc::new(LocalDiskLogStorage::new(
            log_name,
            &config.local_log_dir,
        )?)),
        StorageType::RemoteFs => {
            let root = config.remote_log_dir.as_ref().ok_or_else(|| {
                StorageError::Misconfigured(
                    "remote storage selected but hdfs-log-storage has no path".to_string(),
                )
            })?;
            Ok(Arc::new(RemoteFsLogStorage::new(log_name, root)?))
        }
    }
}

#[cfg(test)]
#[path = "tests/storage_tests.rs"]
mod tests;

use super::*;
use crate::config::{StorageType, SubtaskConfig};

#[test]
fn test_memory_storage_append_and_read() {
    let storage = MemoryLogStorage::new("job-0");
    assert!(!storage.exists().unwrap());
    assert!(storage.read_all().unwrap().is_empty());

    storage.append(b"abc").unwrap();
    storage.append(b"def").unwrap();
    assert!(storage.exists().unwrap());
    assert_eq!(storage.read_all().unwrap(), b"abcdef");

    storage.clear().unwrap();
    assert!(storage.read_all().unwrap().is_empty());

    storage.delete().unwrap();
    assert!(!storage.exists().unwrap());
}

#[test]
fn test_clear_on_nonexistent_log_is_a_no_op() {
    let storage = MemoryLogStorage::new("never-written");
    storage.clear().unwrap();
    assert!(!storage.exists().unwrap());

    let dir = tempfile::tempdir().unwrap();
    let storage = LocalDiskLogStorage::new("never-written", dir.path()).unwrap();
    storage.clear().unwrap();
    storage.delete().unwrap();
    assert!(!storage.exists().unwrap());
}

#[test]
fn test_local_disk_storage_persists_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    {
        let storage = LocalDiskLogStorage::new("job-1", dir.path()).unwrap();
        storage.append(b"hello ").unwrap();
        storage.append(b"world").unwrap();
    }
    // A fresh instance over the same directory sees the full history.
    let reopened = LocalDiskLogStorage::new("job-1", dir.path()).unwrap();
    assert!(reopened.exists().unwrap());
    assert_eq!(reopened.read_all().unwrap(), b"hello world");

    reopened.delete().unwrap();
    assert!(!reopened.exists().unwrap());
}

#[test]
fn test_remote_fs_storage_uses_configured_root() {
    let dir = tempfile::tempdir().unwrap();
    let storage = RemoteFsLogStorage::new("job-2", dir.path()).unwrap();
    storage.append(b"remote bytes").unwrap();
    assert_eq!(storage.read_all().unwrap(), b"remote bytes");
    assert_eq!(storage.log_name(), "job-2");
}

#[test]
fn test_open_log_storage_honors_config() {
    let dir = tempfile::tempdir().unwrap();

    let config = SubtaskConfig::default();
    let storage = open_log_storage(&config, "t-0").unwrap();
    assert_eq!(storage.log_name(), "t-0");

    let config = SubtaskConfig::default()
        .with_logging(StorageType::LocalDisk)
        .with_local_log_dir(dir.path());
    let storage = open_log_storage(&config, "t-1").unwrap();
    storage.append(b"x").unwrap();
    assert!(dir.path().join("t-1.rlog").exists());

    let mut config = SubtaskConfig::default();
    config.storage_type = StorageType::RemoteFs;
    let err = match open_log_storage(&config, "t-2") {
        Err(e) => e,
        Ok(_) => panic!("expected open_log_storage(t-2) to fail"),
    };
    assert!(err.to_string().contains("misconfigured"));
}

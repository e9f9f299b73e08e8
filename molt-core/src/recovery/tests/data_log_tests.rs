use super::*;
use crate::recovery::{decode_log, AsyncLogWriter, LogRecord, LogStorage, MemoryLogStorage};
use std::sync::Arc;

fn setup(
    recovery_target: u64,
) -> (
    Arc<MemoryLogStorage>,
    Arc<AsyncLogWriter>,
    Arc<StepCursor>,
    DataLogManager,
) {
    let storage = Arc::new(MemoryLogStorage::new("data-log"));
    let writer = Arc::new(AsyncLogWriter::new(
        Arc::clone(&storage) as Arc<dyn LogStorage>,
        Arc::new(|_msg, _err| {}),
    ));
    let cursor = Arc::new(StepCursor::new(recovery_target));
    let data_log = DataLogManager::new(Arc::clone(&writer), Arc::clone(&cursor));
    (storage, writer, cursor, data_log)
}

#[test]
fn test_disabled_manager_forwards_without_logging() {
    let (storage, writer, _cursor, data_log) = setup(0);
    assert_eq!(
        data_log.on_emit(0, b"record").unwrap(),
        EmitDecision::Forward
    );
    writer.flush().wait();
    assert!(storage.read_all().unwrap().is_empty());
    writer.shutdown().wait();
}

#[test]
fn test_live_emissions_are_logged_with_increasing_steps() {
    let (storage, writer, _cursor, data_log) = setup(0);
    data_log.enable();

    assert_eq!(data_log.on_emit(0, b"a").unwrap(), EmitDecision::Forward);
    assert_eq!(data_log.on_emit(2, b"b").unwrap(), EmitDecision::Forward);
    writer.flush().wait();

    let records = decode_log(&storage.read_all().unwrap()).unwrap();
    assert_eq!(
        records,
        vec![
            LogRecord::OutputEmitted {
                step: 1,
                partition: 0,
                bytes: b"a".to_vec(),
            },
            LogRecord::OutputEmitted {
                step: 2,
                partition: 2,
                bytes: b"b".to_vec(),
            },
        ]
    );
    writer.shutdown().wait();
}

#[test]
fn test_emissions_suppressed_until_recovery_completes() {
    let (storage, writer, cursor, data_log) = setup(3);
    data_log.enable();

    // Replay owns the schedule: live bytes must not reach the partition.
    assert_eq!(data_log.on_emit(0, b"live").unwrap(), EmitDecision::Suppress);
    assert_eq!(
        data_log.on_emit(1, b"also live").unwrap(),
        EmitDecision::Suppress
    );

    // Drive the cursor to the recovery target; emissions flow again and
    // pick up step numbers strictly after it.
    cursor.advance_replayed(3);
    assert_eq!(data_log.on_emit(0, b"fresh").unwrap(), EmitDecision::Forward);
    writer.flush().wait();

    let records = decode_log(&storage.read_all().unwrap()).unwrap();
    assert_eq!(
        records,
        vec![LogRecord::OutputEmitted {
            step: 4,
            partition: 0,
            bytes: b"fresh".to_vec(),
        }]
    );
    writer.shutdown().wait();
}

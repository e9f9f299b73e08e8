use super::*;
use crate::error::RecoveryError;
use crate::mailbox::MailArg;

fn sample_log() -> Vec<LogRecord> {
    vec![
        LogRecord::MailEnqueued {
            step: 1,
            name: "Input gate request partitions0".to_string(),
            args: vec![],
        },
        LogRecord::OutputEmitted {
            step: 2,
            partition: 0,
            bytes: b"first".to_vec(),
        },
        LogRecord::MailEnqueued {
            step: 3,
            name: "Timer callback".to_string(),
            args: vec![MailArg::U32(0), MailArg::I64(1_690_000_000_000)],
        },
        LogRecord::CheckpointBoundary {
            step: 4,
            checkpoint_id: 5,
        },
        LogRecord::OutputEmitted {
            step: 5,
            partition: 3,
            bytes: vec![0xde, 0xad, 0xbe, 0xef],
        },
        LogRecord::Clear { step: 4 },
    ]
}

fn encode_all(records: &[LogRecord]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for record in records {
        record.encode(&mut bytes);
    }
    bytes
}

#[test]
fn test_decode_log_reconstructs_sequence() {
    let records = sample_log();
    let decoded = decode_log(&encode_all(&records)).unwrap();
    assert_eq!(decoded, records);
    assert_eq!(recovery_target(&decoded), 5);
}

#[test]
fn test_mail_args_carry_every_tag() {
    let record = LogRecord::MailEnqueued {
        step: 1,
        name: "control".to_string(),
        args: vec![
            MailArg::U32(7),
            MailArg::U64(u64::MAX),
            MailArg::I64(-42),
            MailArg::Bool(true),
            MailArg::Str("savepoint".to_string()),
            MailArg::Bytes(vec![1, 2, 3]),
        ],
    };
    let mut bytes = Vec::new();
    record.encode(&mut bytes);
    assert_eq!(decode_log(&bytes).unwrap(), vec![record]);
}

#[test]
fn test_truncated_frame_is_fatal() {
    let mut bytes = encode_all(&sample_log());
    bytes.truncate(bytes.len() - 3);
    assert!(matches!(
        decode_log(&bytes),
        Err(RecoveryError::TruncatedRecord(_))
    ));

    // A frame header promising more bytes than exist is also truncation.
    let bytes = vec![0, 0, 0, 99, b'M'];
    assert!(matches!(
        decode_log(&bytes),
        Err(RecoveryError::TruncatedRecord(_))
    ));
}

#[test]
fn test_unknown_tag_is_fatal() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&9u32.to_be_bytes());
    bytes.push(b'Z');
    bytes.extend_from_slice(&1u64.to_be_bytes());
    assert!(matches!(
        decode_log(&bytes),
        Err(RecoveryError::UnknownTag { tag: b'Z', .. })
    ));
}

#[test]
fn test_steps_must_strictly_increase() {
    let records = vec![
        LogRecord::OutputEmitted {
            step: 2,
            partition: 0,
            bytes: vec![],
        },
        LogRecord::OutputEmitted {
            step: 2,
            partition: 0,
            bytes: vec![],
        },
    ];
    assert_eq!(
        decode_log(&encode_all(&records)),
        Err(RecoveryError::StepsOutOfOrder { prev: 2, next: 2 })
    );
}

#[test]
fn test_clear_may_reference_an_earlier_step() {
    let records = vec![
        LogRecord::OutputEmitted {
            step: 1,
            partition: 0,
            bytes: b"a".to_vec(),
        },
        LogRecord::CheckpointBoundary {
            step: 2,
            checkpoint_id: 1,
        },
        LogRecord::OutputEmitted {
            step: 3,
            partition: 0,
            bytes: b"b".to_vec(),
        },
        LogRecord::Clear { step: 2 },
        LogRecord::OutputEmitted {
            step: 4,
            partition: 0,
            bytes: b"c".to_vec(),
        },
    ];
    let decoded = decode_log(&encode_all(&records)).unwrap();
    assert_eq!(decoded, records);
    assert_eq!(recovery_target(&decoded), 4);
}

//! Wire format of the replay log.
//!
//! The log is a sequence of length-prefixed frames, each carrying a tag
//! byte, the step number and a tag-specific payload:
//!
//! ```text
//! frame   := [body_len: u32] [body]
//! body    := [tag: u8] [step: u64] [payload]
//! tag 'M' := [name_len: u32] [name: utf-8] [arg_count: u16] ([arg_tag: u8] [arg_bytes])*
//! tag 'O' := [partition: u16] [byte_len: u32] [bytes]
//! tag 'C' := [checkpoint_id: u64]
//! tag 'X' := (empty; the step is the boundary up to which the cache clears)
//! ```
//!
//! All integers are big-endian. Mail names and argument tags are frozen:
//! changing either is a forward-incompatible format change.

use crate::error::RecoveryError;
use crate::mailbox::MailArg;

const TAG_MAIL: u8 = b'M';
const TAG_OUTPUT: u8 = b'O';
const TAG_CHECKPOINT: u8 = b'C';
const TAG_CLEAR: u8 = b'X';

const ARG_U32: u8 = 1;
const ARG_U64: u8 = 2;
const ARG_I64: u8 = 3;
const ARG_BOOL: u8 = 4;
const ARG_STR: u8 = 5;
const ARG_BYTES: u8 = 6;

/// One record of the replay log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// A mail execution decision: `(step, name, args)`.
    MailEnqueued {
        step: u64,
        name: String,
        args: Vec<MailArg>,
    },
    /// One outbound record pushed to a network partition.
    OutputEmitted {
        step: u64,
        partition: u16,
        bytes: Vec<u8>,
    },
    /// Marks the output-window boundary of a checkpoint.
    CheckpointBoundary { step: u64, checkpoint_id: u64 },
    /// Cached outputs at steps up to and including `step` were committed.
    Clear { step: u64 },
}

impl LogRecord {
    pub fn step(&self) -> u64 {
        match self {
            LogRecord::MailEnqueued { step, .. }
            | LogRecord::OutputEmitted { step, .. }
            | LogRecord::CheckpointBoundary { step, .. }
            | LogRecord::Clear { step } => *step,
        }
    }

    /// True for records that consume a fresh step number when written.
    /// `Clear` references the boundary step of an earlier checkpoint instead.
    pub fn assigns_step(&self) -> bool {
        !matches!(self, LogRecord::Clear { .. })
    }

    /// Append the framed encoding of this record to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let frame_start = out.len();
        out.extend_from_slice(&0u32.to_be_bytes());

        match self {
            LogRecord::MailEnqueued { step, name, args } => {
                out.push(TAG_MAIL);
                out.extend_from_slice(&step.to_be_bytes());
                out.extend_from_slice(&(name.len() as u32).to_be_bytes());
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(&(args.len() as u16).to_be_bytes());
                for arg in args {
                    encode_arg(arg, out);
                }
            }
            LogRecord::OutputEmitted {
                step,
                partition,
                bytes,
            } => {
                out.push(TAG_OUTPUT);
                out.extend_from_slice(&step.to_be_bytes());
                out.extend_from_slice(&partition.to_be_bytes());
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(bytes);
            }
            LogRecord::CheckpointBoundary {
                step,
                checkpoint_id,
            } => {
                out.push(TAG_CHECKPOINT);
                out.extend_from_slice(&step.to_be_bytes());
                out.extend_from_slice(&checkpoint_id.to_be_bytes());
            }
            LogRecord::Clear { step } => {
                out.push(TAG_CLEAR);
                out.extend_from_slice(&step.to_be_bytes());
            }
        }

        let body_len = (out.len() - frame_start - 4) as u32;
        out[frame_start..frame_start + 4].copy_from_slice(&body_len.to_be_bytes());
    }
}

fn encode_arg(arg: &MailArg, out: &mut Vec<u8>) {
    match arg {
        MailArg::U32(v) => {
            out.push(ARG_U32);
            out.extend_from_slice(&v.to_be_bytes());
        }
        MailArg::U64(v) => {
            out.push(ARG_U64);
            out.extend_from_slice(&v.to_be_bytes());
        }
        MailArg::I64(v) => {
            out.push(ARG_I64);
            out.extend_from_slice(&v.to_be_bytes());
        }
        MailArg::Bool(v) => {
            out.push(ARG_BOOL);
            out.push(u8::from(*v));
        }
        MailArg::Str(v) => {
            out.push(ARG_STR);
            out.extend_from_slice(&(v.len() as u32).to_be_bytes());
            out.extend_from_slice(v.as_bytes());
        }
        MailArg::Bytes(v) => {
            out.push(ARG_BYTES);
            out.extend_from_slice(&(v.len() as u32).to_be_bytes());
            out.extend_from_slice(v);
        }
    }
}

/// Decode the whole log, validating framing and step monotonicity.
///
/// Step numbers of step-assigning records must be strictly increasing; a
/// violation, a truncated frame or an unknown tag is a fatal
/// [`RecoveryError`].
pub fn decode_log(bytes: &[u8]) -> Result<Vec<LogRecord>, RecoveryError> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut last_step = 0u64;

    while offset < bytes.len() {
        if bytes.len() - offset < 4 {
            return Err(RecoveryError::TruncatedRecord(offset));
        }
        let body_len = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        if bytes.len() - offset < body_len {
            return Err(RecoveryError::TruncatedRecord(offset));
        }
        let body = &bytes[offset..offset + body_len];
        let record = decode_body(body, offset)?;
        offset += body_len;

        if record.assigns_step() {
            if record.step() <= last_step {
                return Err(RecoveryError::StepsOutOfOrder {
                    prev: last_step,
                    next: record.step(),
                });
            }
            last_step = record.step();
        }
        records.push(record);
    }
    Ok(records)
}

/// Last step number assigned in the given log; the recovery target.
pub fn recovery_target(records: &[LogRecord]) -> u64 {
    records
        .iter()
        .filter(|r| r.assigns_step())
        .map(LogRecord::step)
        .last()
        .unwrap_or(0)
}

fn decode_body(body: &[u8], frame_offset: usize) -> Result<LogRecord, RecoveryError> {
    let mut cursor = Reader::new(body, frame_offset);
    let tag = cursor.u8()?;
    let step = cursor.u64()?;
    match tag {
        TAG_MAIL => {
            let name_len = cursor.u32()? as usize;
            let name = String::from_utf8(cursor.bytes(name_len)?.to_vec())
                .map_err(|e| RecoveryError::Malformed(format!("mail name not utf-8: {e}")))?;
            let arg_count = cursor.u16()?;
            let mut args = Vec::with_capacity(arg_count as usize);
            for _ in 0..arg_count {
                args.push(decode_arg(&mut cursor)?);
            }
            Ok(LogRecord::MailEnqueued { step, name, args })
        }
        TAG_OUTPUT => {
            let partition = cursor.u16()?;
            let len = cursor.u32()? as usize;
            let bytes = cursor.bytes(len)?.to_vec();
            Ok(LogRecord::OutputEmitted {
                step,
                partition,
                bytes,
            })
        }
        TAG_CHECKPOINT => Ok(LogRecord::CheckpointBoundary {
            step,
            checkpoint_id: cursor.u64()?,
        }),
        TAG_CLEAR => Ok(LogRecord::Clear { step }),
        other => Err(RecoveryError::UnknownTag {
            tag: other,
            offset: frame_offset,
        }),
    }
}

fn decode_arg(cursor: &mut Reader<'_>) -> Result<MailArg, RecoveryError> {
    let tag = cursor.u8()?;
    match tag {
        ARG_U32 => Ok(MailArg::U32(cursor.u32()?)),
        ARG_U64 => Ok(MailArg::U64(cursor.u64()?)),
        ARG_I64 => Ok(MailArg::I64(cursor.u64()? as i64)),
        ARG_BOOL => Ok(MailArg::Bool(cursor.u8()? != 0)),
        ARG_STR => {
            let len = cursor.u32()? as usize;
            let text = String::from_utf8(cursor.bytes(len)?.to_vec())
                .map_err(|e| RecoveryError::Malformed(format!("string arg not utf-8: {e}")))?;
            Ok(MailArg::Str(text))
        }
        ARG_BYTES => {
            let len = cursor.u32()? as usize;
            Ok(MailArg::Bytes(cursor.bytes(len)?.to_vec()))
        }
        other => Err(RecoveryError::UnknownArgTag(other)),
    }
}

struct Reader<'a> {
    body: &'a [u8],
    pos: usize,
    frame_offset: usize,
}

impl<'a> Reader<'a> {
    fn new(body: &'a [u8], frame_offset: usize) -> Self {
        Self {
            body,
            pos: 0,
            frame_offset,
        }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], RecoveryError> {
        if self.body.len() - self.pos < len {
            return Err(RecoveryError::TruncatedRecord(self.frame_offset + self.pos));
        }
        let slice = &self.body[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, RecoveryError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, RecoveryError> {
        Ok(u16::from_be_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, RecoveryError> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, RecoveryError> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
#[path = "tests/record_tests.rs"]
mod tests;

//! Distinguished error kinds and the suppression combinator.
//!
//! Most of the crate carries errors as `anyhow::Error`. The kinds below are
//! the ones callers need to recognize by downcast: cancellation (which is not
//! a failure), storage I/O faults, and fatal replay errors.

use thiserror::Error;

/// Raised when an operation observes that the subtask was canceled.
///
/// Cancellation is not a failure: the lifecycle checks for this kind with
/// [`is_cancel_error`] and skips the failure path when it is the cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("task was canceled")]
pub struct CancelTaskError;

/// I/O fault surfaced by a log storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("log storage i/o failure")]
    Io(#[from] std::io::Error),
    #[error("log storage misconfigured: {0}")]
    Misconfigured(String),
}

/// Fatal error encountered while replaying the recovery log.
///
/// Any of these surfaces as task failure before a single live mail runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("unknown mail name in replay log: {0:?}")]
    UnknownMailName(String),
    #[error("unknown timer callback id {0} in replay log")]
    UnknownTimerId(u32),
    #[error("truncated log record at byte offset {0}")]
    TruncatedRecord(usize),
    #[error("unknown log record tag {tag:#04x} at byte offset {offset}")]
    UnknownTag { tag: u8, offset: usize },
    #[error("unknown mail argument tag {0:#04x}")]
    UnknownArgTag(u8),
    #[error("malformed log record payload: {0}")]
    Malformed(String),
    #[error("log steps out of order: step {next} follows step {prev}")]
    StepsOutOfOrder { prev: u64, next: u64 },
}

/// True if `err` is (or wraps) a [`CancelTaskError`].
pub fn is_cancel_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<CancelTaskError>().is_some()
}

/// Keep the first error, attach later ones as suppressed context.
///
/// Cleanup code must never let a secondary failure mask the original one;
/// this is the combinator all teardown paths thread their errors through.
pub fn first_or_suppressed(
    new_err: anyhow::Error,
    prior: Option<anyhow::Error>,
) -> anyhow::Error {
    match prior {
        None => new_err,
        Some(prior) => prior.context(format!("suppressed follow-up failure: {new_err:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_cancel_error_recognized_through_context() {
        let err = anyhow::Error::new(CancelTaskError).context("while restoring");
        assert!(is_cancel_error(&err));

        let other = anyhow!("disk on fire");
        assert!(!is_cancel_error(&other));
    }

    #[test]
    fn test_first_or_suppressed_keeps_original() {
        let original = anyhow!("original failure");
        let secondary = anyhow!("secondary failure");

        let combined = first_or_suppressed(secondary, Some(original));
        let chain: Vec<String> = combined.chain().map(|e| e.to_string()).collect();
        assert!(chain.last().unwrap().contains("original failure"));
        assert!(chain.first().unwrap().contains("secondary failure"));
    }

    #[test]
    fn test_first_or_suppressed_without_prior() {
        let err = first_or_suppressed(anyhow!("only failure"), None);
        assert_eq!(err.to_string(), "only failure");
    }
}

use thiserror::Error;

use crate::block::BlockState;
use crate::region::FileHandle;

/// Errors raised by the lock manager core.
///
/// Protocol races are never errors: they are resolved by the matcher.
/// `ResourceExhausted` turns into a silent drop at the dispatcher, the
/// client retransmits. The last two variants are programming errors.
/// Bad regions and failed callbacks never get here: the former become an
/// NLM status in `wire`, the latter are retried by the granted scheduler.
#[derive(Debug, Error)]
pub enum LockdError {
    #[error("stale file handle {0}")]
    StaleHandle(FileHandle),

    #[error("too many blocked requests on file {file} (limit {limit})")]
    ResourceExhausted { file: FileHandle, limit: usize },

    #[error("invalid block state transition {from:?} -> {to:?}")]
    InvalidTransition { from: BlockState, to: BlockState },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, LockdError>;

use serde::{Deserialize, Serialize};

use crate::error::{LockdError, Result};
use crate::region::{LockMode, LockRegion, RequestId};

/// Lifecycle of an outstanding blocking lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockState {
    /// Registered, local acquisition not yet attempted or not yet asleep
    Pending,
    /// The local primitive reported it has to wait
    Blocked,
    /// Acquired locally, client not yet told
    Granted,
}

/// Stable reference to a `BlockEntry` inside one file's arena.
///
/// The serial makes a handle to a removed entry harmless: lookups through it
/// fail instead of aliasing a newer entry that reused the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    pub(crate) key: usize,
    pub(crate) serial: u64,
}

impl BlockHandle {
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

/// One outstanding blocking-lock attempt
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub state: BlockState,
    pub region: LockRegion,
    pub mode: LockMode,
    pub request_id: RequestId,
    /// Set by cancellation; checked before every granted callback.
    pub suppress_callback: bool,
    /// A granted callback is on the wire right now.
    pub in_flight: bool,
    /// The client answered a GRANTED_MSG.
    pub acknowledged: bool,
    pub(crate) serial: u64,
}

impl BlockEntry {
    pub(crate) fn new(region: LockRegion, mode: LockMode, request_id: RequestId, serial: u64) -> Self {
        BlockEntry {
            state: BlockState::Pending,
            region,
            mode,
            request_id,
            suppress_callback: false,
            in_flight: false,
            acknowledged: false,
            serial,
        }
    }

    pub fn mark_blocked(&mut self) -> Result<()> {
        self.transition(BlockState::Pending, BlockState::Blocked)
    }

    pub fn mark_granted(&mut self) -> Result<()> {
        self.transition(BlockState::Blocked, BlockState::Granted)
    }

    fn transition(&mut self, from: BlockState, to: BlockState) -> Result<()> {
        if self.state != from {
            return Err(LockdError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

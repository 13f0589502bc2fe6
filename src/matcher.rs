//! Classification of incoming requests against outstanding blocking
//! requests on the same file.
//!
//! Clients retransmit freely and may cancel a blocked request at any time,
//! including while the server is busy sending the granted callback for it.
//! The matcher decides, under the per-file lock, whether a request is new,
//! a retransmission, a resubmission of the same region or an overlap.

use serde::Serialize;

use crate::block::{BlockHandle, BlockState};
use crate::logging::{trace, LogLevel};
use crate::region::{LockRegion, Overlap, RequestId};
use crate::registry::BlockGuard;

pub use crate::registry::MatchResult;

/// The kind of request being classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IncomingOp {
    Unlock,
    Cancel,
    /// Non-blocking LOCK
    Lock,
    /// LOCK with the block flag set
    BlockingLock,
}

/// What the caller has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    /// Run the operation against the local primitive.
    Process { cancel_overlapping: bool },
    /// Register a new blocking entry and try to acquire.
    Register { cancel_overlapping: bool },
    /// The request is already blocked; repeat the interim reply.
    ReplyBlocked,
    /// The lock is already held for this request; reply granted again.
    GrantImmediately { cancel_matched: bool },
    /// An earlier copy is still being worked on; say nothing.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub result: MatchResult,
    #[serde(skip)]
    pub entry: Option<BlockHandle>,
    pub state: Option<BlockState>,
    pub action: Action,
}

pub struct RetransmitMatcher;

impl RetransmitMatcher {
    /// Classify `op` on `region` under the per-file lock held by `guard`.
    ///
    /// Never mutates the table. The action tells the caller which
    /// suppression and registration steps to run.
    pub fn classify(guard: &BlockGuard<'_>, op: IncomingOp, region: &LockRegion, request_id: &RequestId) -> Classification {
        let (raw, handle) = guard.find_match(region, request_id);
        let state = handle.and_then(|h| guard.get(h)).map(|e| e.state);

        let classification = match op {
            IncomingOp::Unlock | IncomingOp::Cancel => {
                // A granted entry anywhere in the range means the grant and
                // this request crossed on the wire.
                let granted_overlap = guard
                    .entries()
                    .any(|(_, e)| e.state == BlockState::Granted && e.region.compare(region) != Overlap::Disjoint);
                let result = if granted_overlap { MatchResult::Retransmit } else { raw };
                Classification {
                    result,
                    entry: handle,
                    state,
                    action: Action::Process { cancel_overlapping: true },
                }
            }
            IncomingOp::Lock => {
                let result = match (raw, state) {
                    (MatchResult::FullMatch | MatchResult::Retransmit, Some(BlockState::Granted)) => MatchResult::Retransmit,
                    (MatchResult::FullMatch | MatchResult::Retransmit, _) => MatchResult::FullMatch,
                    (other, _) => other,
                };
                Classification {
                    result,
                    entry: handle,
                    state,
                    action: Action::Process { cancel_overlapping: true },
                }
            }
            IncomingOp::BlockingLock => Self::classify_blocking(raw, handle, state),
        };

        if classification.result != MatchResult::None {
            trace(guard.hook(), "matcher", LogLevel::Debug, || {
                format!(
                    "{:?} {} on {}: {:?} ({:?}) -> {:?}",
                    op,
                    region,
                    guard.file(),
                    classification.result,
                    classification.state,
                    classification.action
                )
            });
        }
        classification
    }

    fn classify_blocking(raw: MatchResult, handle: Option<BlockHandle>, state: Option<BlockState>) -> Classification {
        let action = match (raw, state) {
            (MatchResult::None, _) => Action::Register { cancel_overlapping: false },
            (MatchResult::PartialOverlap, _) => Action::Register { cancel_overlapping: true },

            (MatchResult::FullMatch, Some(BlockState::Pending)) => Action::Drop,
            (MatchResult::FullMatch, Some(BlockState::Blocked)) => Action::ReplyBlocked,
            // Resubmission after the grant: drop the stale grant and start over
            (MatchResult::FullMatch, Some(BlockState::Granted)) => Action::Register { cancel_overlapping: true },

            (MatchResult::Retransmit, Some(BlockState::Granted)) => Action::GrantImmediately { cancel_matched: true },
            (MatchResult::Retransmit, _) => Action::Drop,

            (_, None) => Action::Register { cancel_overlapping: false },
        };

        Classification {
            result: raw,
            entry: handle,
            state,
            action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullDiagnostics;
    use crate::region::{FileHandle, LockMode, OwnerId};
    use crate::registry::FileLockRegistry;
    use std::sync::Arc;

    fn registry() -> FileLockRegistry {
        FileLockRegistry::new(FileHandle::new(vec![0x42]), 32, Arc::new(NullDiagnostics))
    }

    fn region(offset: u64, length: u64) -> LockRegion {
        LockRegion::new(OwnerId::new(3, 77), offset, length)
    }

    fn with_state(guard: &mut BlockGuard<'_>, r: LockRegion, xid: u32, state: BlockState) -> BlockHandle {
        let h = guard.add(r, LockMode::Exclusive, RequestId::from_xid(xid)).unwrap();
        let e = guard.get_mut(h).unwrap();
        if state != BlockState::Pending {
            e.mark_blocked().unwrap();
        }
        if state == BlockState::Granted {
            e.mark_granted().unwrap();
        }
        h
    }

    #[test]
    fn test_fresh_blocking_lock_registers() {
        let reg = registry();
        let g = reg.lock();
        let c = RetransmitMatcher::classify(&g, IncomingOp::BlockingLock, &region(0, 10), &RequestId::from_xid(1));
        assert_eq!(c.result, MatchResult::None);
        assert_eq!(c.action, Action::Register { cancel_overlapping: false });
    }

    #[test]
    fn test_blocking_retransmit_table() {
        for (state, expected) in [
            (BlockState::Pending, Action::Drop),
            (BlockState::Blocked, Action::Drop),
            (BlockState::Granted, Action::GrantImmediately { cancel_matched: true }),
        ] {
            let reg = registry();
            let mut g = reg.lock();
            with_state(&mut g, region(0, 100), 5, state);
            let c = RetransmitMatcher::classify(&g, IncomingOp::BlockingLock, &region(0, 100), &RequestId::from_xid(5));
            assert_eq!(c.result, MatchResult::Retransmit);
            assert_eq!(c.action, expected, "state {:?}", state);
        }
    }

    #[test]
    fn test_blocking_full_match_table() {
        for (state, expected) in [
            (BlockState::Pending, Action::Drop),
            (BlockState::Blocked, Action::ReplyBlocked),
            (BlockState::Granted, Action::Register { cancel_overlapping: true }),
        ] {
            let reg = registry();
            let mut g = reg.lock();
            with_state(&mut g, region(0, 100), 5, state);
            let c = RetransmitMatcher::classify(&g, IncomingOp::BlockingLock, &region(0, 100), &RequestId::from_xid(6));
            assert_eq!(c.result, MatchResult::FullMatch);
            assert_eq!(c.action, expected, "state {:?}", state);
        }
    }

    #[test]
    fn test_blocking_partial_overlap_cancels_then_registers() {
        let reg = registry();
        let mut g = reg.lock();
        with_state(&mut g, region(0, 100), 5, BlockState::Blocked);
        let c = RetransmitMatcher::classify(&g, IncomingOp::BlockingLock, &region(50, 100), &RequestId::from_xid(6));
        assert_eq!(c.result, MatchResult::PartialOverlap);
        assert_eq!(c.action, Action::Register { cancel_overlapping: true });
    }

    #[test]
    fn test_unlock_reports_granted_overlap_as_retransmit() {
        let reg = registry();
        let mut g = reg.lock();
        with_state(&mut g, region(0, 100), 5, BlockState::Granted);
        let c = RetransmitMatcher::classify(&g, IncomingOp::Unlock, &region(10, 5), &RequestId::from_xid(9));
        assert_eq!(c.result, MatchResult::Retransmit);
        assert_eq!(c.action, Action::Process { cancel_overlapping: true });
    }

    #[test]
    fn test_cancel_without_entries() {
        let reg = registry();
        let g = reg.lock();
        let c = RetransmitMatcher::classify(&g, IncomingOp::Cancel, &region(0, 100), &RequestId::from_xid(1));
        assert_eq!(c.result, MatchResult::None);
        assert!(c.entry.is_none());
        assert_eq!(c.action, Action::Process { cancel_overlapping: true });
    }

    #[test]
    fn test_non_blocking_lock_collapses_results() {
        let reg = registry();
        let mut g = reg.lock();
        with_state(&mut g, region(0, 100), 5, BlockState::Granted);
        let c = RetransmitMatcher::classify(&g, IncomingOp::Lock, &region(0, 100), &RequestId::from_xid(77));
        assert_eq!(c.result, MatchResult::Retransmit);

        let reg = registry();
        let mut g = reg.lock();
        with_state(&mut g, region(0, 100), 5, BlockState::Blocked);
        let c = RetransmitMatcher::classify(&g, IncomingOp::Lock, &region(0, 100), &RequestId::from_xid(5));
        assert_eq!(c.result, MatchResult::FullMatch);

        let c = RetransmitMatcher::classify(&g, IncomingOp::Lock, &region(90, 100), &RequestId::from_xid(5));
        assert_eq!(c.result, MatchResult::PartialOverlap);
    }

    #[test]
    fn test_classify_does_not_mutate() {
        let reg = registry();
        let mut g = reg.lock();
        let h = with_state(&mut g, region(0, 100), 5, BlockState::Granted);
        for op in [IncomingOp::Unlock, IncomingOp::Cancel, IncomingOp::Lock, IncomingOp::BlockingLock] {
            RetransmitMatcher::classify(&g, op, &region(0, 100), &RequestId::from_xid(5));
        }
        let e = g.get(h).unwrap();
        assert!(!e.suppress_callback);
        assert_eq!(g.len(), 1);
    }
}

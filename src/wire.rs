//! Decoded call arguments and version-tagged replies.
//!
//! XDR is handled elsewhere; this module only carries what the decoder
//! produced. V1 stands for the 32-bit protocol versions 1 to 3, V4 for the
//! 64-bit one. Everything past the dispatcher entry point is
//! version-agnostic: regions become `LockRegion`s and replies are tagged
//! once per call.

use serde::{Deserialize, Serialize};

use crate::dispatch::OperationKind;
use crate::primitive::Holder;
use crate::region::{ClientId, FileHandle, LockRegion, OwnerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V1,
    V4,
}

impl ProtocolVersion {
    /// Map an RPC program version number.
    pub fn from_rpc(version: u32) -> Option<Self> {
        match version {
            1..=3 => Some(ProtocolVersion::V1),
            4 => Some(ProtocolVersion::V4),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NlmStatus {
    Granted,
    Denied,
    DeniedNoLocks,
    Blocked,
    DeniedGracePeriod,
    Deadlock,
    // V4 only
    ReadOnlyFs,
    StaleFh,
    FileTooBig,
    Failed,
}

impl NlmStatus {
    pub fn code(self) -> u32 {
        match self {
            NlmStatus::Granted => 0,
            NlmStatus::Denied => 1,
            NlmStatus::DeniedNoLocks => 2,
            NlmStatus::Blocked => 3,
            NlmStatus::DeniedGracePeriod => 4,
            NlmStatus::Deadlock => 5,
            NlmStatus::ReadOnlyFs => 6,
            NlmStatus::StaleFh => 7,
            NlmStatus::FileTooBig => 8,
            NlmStatus::Failed => 9,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => NlmStatus::Granted,
            1 => NlmStatus::Denied,
            2 => NlmStatus::DeniedNoLocks,
            3 => NlmStatus::Blocked,
            4 => NlmStatus::DeniedGracePeriod,
            5 => NlmStatus::Deadlock,
            6 => NlmStatus::ReadOnlyFs,
            7 => NlmStatus::StaleFh,
            8 => NlmStatus::FileTooBig,
            9 => NlmStatus::Failed,
            _ => return None,
        })
    }

    /// The closest status the given protocol version can express.
    pub fn for_version(self, version: ProtocolVersion) -> NlmStatus {
        match (version, self) {
            (
                ProtocolVersion::V1,
                NlmStatus::ReadOnlyFs | NlmStatus::StaleFh | NlmStatus::FileTooBig | NlmStatus::Failed,
            ) => NlmStatus::Denied,
            (_, stat) => stat,
        }
    }
}

/// Byte range exactly as it came off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extent {
    V1 { offset: u32, len: u32 },
    V4 { offset: u64, len: u64 },
}

impl Extent {
    pub fn version(&self) -> ProtocolVersion {
        match self {
            Extent::V1 { .. } => ProtocolVersion::V1,
            Extent::V4 { .. } => ProtocolVersion::V4,
        }
    }

    /// Convert to `(offset, length)` with length 0 meaning to end of file.
    ///
    /// V1 treats an all-ones length as end of file and denies ranges that
    /// wrap past 32 bits; V4 reports 64-bit overflow as `FileTooBig`.
    pub fn to_range(&self) -> std::result::Result<(u64, u64), NlmStatus> {
        match *self {
            Extent::V1 { offset, len } => {
                if len == 0 || len == u32::MAX {
                    return Ok((offset as u64, 0));
                }
                if offset.checked_add(len - 1).is_none() {
                    return Err(NlmStatus::Denied);
                }
                Ok((offset as u64, len as u64))
            }
            Extent::V4 { offset, len } => {
                if len == 0 {
                    return Ok((offset, 0));
                }
                if offset.checked_add(len - 1).is_none() {
                    return Err(NlmStatus::FileTooBig);
                }
                Ok((offset, len))
            }
        }
    }
}

/// Lock description carried by TEST, LOCK, CANCEL, UNLOCK and GRANTED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alock {
    pub caller_name: String,
    pub fh: FileHandle,
    /// Opaque owner handle
    pub oh: Vec<u8>,
    /// Process id on the client
    pub svid: u32,
    pub extent: Extent,
}

impl Alock {
    pub fn owner(&self, client: ClientId) -> OwnerId {
        OwnerId { client, pid: self.svid }
    }

    pub fn region(&self, client: ClientId) -> std::result::Result<LockRegion, NlmStatus> {
        let (offset, length) = self.extent.to_range()?;
        Ok(LockRegion::new(self.owner(client), offset, length))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareArgs {
    pub caller_name: String,
    pub fh: FileHandle,
    pub oh: Vec<u8>,
    pub svid: u32,
    /// Deny mode bits (1 = read, 2 = write)
    pub mode: u32,
    /// Access bits (1 = read, 2 = write)
    pub access: u32,
}

/// Decoded procedure arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallArgs {
    Null,
    Test {
        cookie: Vec<u8>,
        exclusive: bool,
        alock: Alock,
    },
    Lock {
        cookie: Vec<u8>,
        block: bool,
        exclusive: bool,
        alock: Alock,
        reclaim: bool,
        state: u32,
    },
    Cancel {
        cookie: Vec<u8>,
        block: bool,
        exclusive: bool,
        alock: Alock,
    },
    Unlock {
        cookie: Vec<u8>,
        alock: Alock,
    },
    /// GRANTED / GRANTED_MSG sent to us; only meaningful to a client
    Granted {
        cookie: Vec<u8>,
        exclusive: bool,
        alock: Alock,
    },
    /// Any *_RES callback
    Res {
        cookie: Vec<u8>,
        stat: NlmStatus,
    },
    Share {
        cookie: Vec<u8>,
        share: ShareArgs,
        reclaim: bool,
    },
    FreeAll {
        name: String,
        state: u32,
    },
}

impl CallArgs {
    pub fn cookie(&self) -> &[u8] {
        match self {
            CallArgs::Test { cookie, .. }
            | CallArgs::Lock { cookie, .. }
            | CallArgs::Cancel { cookie, .. }
            | CallArgs::Unlock { cookie, .. }
            | CallArgs::Granted { cookie, .. }
            | CallArgs::Res { cookie, .. }
            | CallArgs::Share { cookie, .. } => cookie,
            CallArgs::Null | CallArgs::FreeAll { .. } => &[],
        }
    }
}

/// Per-call metadata supplied by the RPC layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHeader {
    pub version: ProtocolVersion,
    pub kind: OperationKind,
    pub xid: u32,
    /// Server-side identity of the calling host
    pub client: ClientId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub header: CallHeader,
    pub args: CallArgs,
}

/// Conflicting lock as reported by TEST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHolder<T> {
    pub exclusive: bool,
    pub svid: u32,
    pub oh: Vec<u8>,
    pub offset: T,
    pub len: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyOutcome<T> {
    Void,
    Status(NlmStatus),
    Test {
        stat: NlmStatus,
        holder: Option<WireHolder<T>>,
    },
    Share {
        stat: NlmStatus,
        sequence: i32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyBody<T> {
    pub cookie: Vec<u8>,
    pub outcome: ReplyOutcome<T>,
}

/// Reply tagged with the protocol version of the call it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    V1(ReplyBody<u32>),
    V4(ReplyBody<u64>),
}

impl Reply {
    pub fn void(version: ProtocolVersion) -> Reply {
        Self::build(version, Vec::new(), ReplyOutcome::Void, ReplyOutcome::Void)
    }

    pub fn status(version: ProtocolVersion, cookie: &[u8], stat: NlmStatus) -> Reply {
        let stat = stat.for_version(version);
        Self::build(version, cookie.to_vec(), ReplyOutcome::Status(stat), ReplyOutcome::Status(stat))
    }

    pub fn test(version: ProtocolVersion, cookie: &[u8], stat: NlmStatus, holder: Option<Holder>) -> Reply {
        let stat = stat.for_version(version);
        match version {
            ProtocolVersion::V1 => Reply::V1(ReplyBody {
                cookie: cookie.to_vec(),
                outcome: ReplyOutcome::Test {
                    stat,
                    holder: holder.map(|h| WireHolder {
                        exclusive: h.exclusive,
                        svid: h.owner.pid,
                        oh: Vec::new(),
                        offset: u32::try_from(h.offset).unwrap_or(u32::MAX),
                        // Lengths past 32 bits read as "to end of file"
                        len: u32::try_from(h.length).unwrap_or(0),
                    }),
                },
            }),
            ProtocolVersion::V4 => Reply::V4(ReplyBody {
                cookie: cookie.to_vec(),
                outcome: ReplyOutcome::Test {
                    stat,
                    holder: holder.map(|h| WireHolder {
                        exclusive: h.exclusive,
                        svid: h.owner.pid,
                        oh: Vec::new(),
                        offset: h.offset,
                        len: h.length,
                    }),
                },
            }),
        }
    }

    pub fn share(version: ProtocolVersion, cookie: &[u8], stat: NlmStatus, sequence: i32) -> Reply {
        let stat = stat.for_version(version);
        Self::build(
            version,
            cookie.to_vec(),
            ReplyOutcome::Share { stat, sequence },
            ReplyOutcome::Share { stat, sequence },
        )
    }

    fn build(version: ProtocolVersion, cookie: Vec<u8>, v1: ReplyOutcome<u32>, v4: ReplyOutcome<u64>) -> Reply {
        match version {
            ProtocolVersion::V1 => Reply::V1(ReplyBody { cookie, outcome: v1 }),
            ProtocolVersion::V4 => Reply::V4(ReplyBody { cookie, outcome: v4 }),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        match self {
            Reply::V1(_) => ProtocolVersion::V1,
            Reply::V4(_) => ProtocolVersion::V4,
        }
    }

    pub fn cookie(&self) -> &[u8] {
        match self {
            Reply::V1(body) => &body.cookie,
            Reply::V4(body) => &body.cookie,
        }
    }

    /// Status carried by the reply, if any.
    pub fn stat(&self) -> Option<NlmStatus> {
        fn of<T>(outcome: &ReplyOutcome<T>) -> Option<NlmStatus> {
            match outcome {
                ReplyOutcome::Void => None,
                ReplyOutcome::Status(stat) | ReplyOutcome::Test { stat, .. } | ReplyOutcome::Share { stat, .. } => {
                    Some(*stat)
                }
            }
        }
        match self {
            Reply::V1(body) => of(&body.outcome),
            Reply::V4(body) => of(&body.outcome),
        }
    }
}

/// Payload of an outbound GRANTED / GRANTED_MSG call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantedNotice {
    pub exclusive: bool,
    pub alock: Alock,
}

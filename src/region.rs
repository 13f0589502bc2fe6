use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque file handle as presented by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileHandle(pub Vec<u8>);

impl FileHandle {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        FileHandle(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Server-side identity of a remote host (the lock manager "sysid").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Lock owner: remote host plus the process id on that host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId {
    pub client: ClientId,
    pub pid: u32,
}

impl OwnerId {
    pub fn new(client: u32, pid: u32) -> Self {
        OwnerId {
            client: ClientId(client),
            pid,
        }
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Shared,    // Read lock
    Exclusive, // Write lock
}

impl LockMode {
    pub fn from_exclusive(exclusive: bool) -> Self {
        if exclusive {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        }
    }

    pub fn conflicts_with(self, other: LockMode) -> bool {
        self == LockMode::Exclusive || other == LockMode::Exclusive
    }
}

/// How two regions of the same owner relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    Disjoint,
    Partial,
    Exact,
}

/// Byte range held or requested by one owner.
///
/// `length == 0` means "to end of file"; the inclusive end then sits at
/// `u64::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRegion {
    pub owner: OwnerId,
    pub offset: u64,
    pub length: u64,
}

impl LockRegion {
    pub fn new(owner: OwnerId, offset: u64, length: u64) -> Self {
        LockRegion {
            owner,
            offset,
            length,
        }
    }

    /// Inclusive last byte covered by the region.
    pub fn end(&self) -> u64 {
        if self.length == 0 {
            u64::MAX
        } else {
            self.offset.saturating_add(self.length - 1)
        }
    }

    pub fn to_eof(&self) -> bool {
        self.length == 0
    }

    /// Byte-range overlap, ignoring ownership.
    pub fn overlaps(&self, other: &LockRegion) -> bool {
        ranges_overlap(self.offset, self.end(), other.offset, other.end())
    }

    pub fn same_extent(&self, other: &LockRegion) -> bool {
        self.offset == other.offset && self.end() == other.end()
    }

    /// Compare two regions for matching purposes. Regions of different
    /// owners never match.
    pub fn compare(&self, other: &LockRegion) -> Overlap {
        if self.owner != other.owner || !self.overlaps(other) {
            Overlap::Disjoint
        } else if self.same_extent(other) {
            Overlap::Exact
        } else {
            Overlap::Partial
        }
    }
}

impl fmt::Display for LockRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.to_eof() {
            write!(f, "{} [{}, EOF)", self.owner, self.offset)
        } else {
            write!(
                f,
                "{} [{}, {})",
                self.owner,
                self.offset,
                self.offset.saturating_add(self.length)
            )
        }
    }
}

/// Check if two inclusive byte ranges overlap
pub fn ranges_overlap(start1: u64, end1: u64, start2: u64, end2: u64) -> bool {
    !(end1 < start2 || end2 < start1)
}

/// Opaque per-call token: the RPC xid for synchronous calls, the client
/// cookie for `_MSG` calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RequestId(pub Vec<u8>);

impl RequestId {
    pub fn from_xid(xid: u32) -> Self {
        RequestId(xid.to_be_bytes().to_vec())
    }

    pub fn from_cookie(cookie: &[u8]) -> Self {
        RequestId(cookie.to_vec())
    }

    /// First four bytes as an integer, for dumps.
    pub fn short(&self) -> u32 {
        let mut buf = [0u8; 4];
        let n = self.0.len().min(4);
        buf[..n].copy_from_slice(&self.0[..n]);
        u32::from_be_bytes(buf)
    }
}

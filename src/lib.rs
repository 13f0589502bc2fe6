//! Server-side core of an NFS Network Lock Manager: tracking of blocked
//! lock requests per file, classification of retransmitted and racing
//! requests, and the granted callbacks that tell a client its blocked lock
//! is now held.

pub mod block;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod files;
pub mod granted;
pub mod logging;
pub mod matcher;
pub mod metrics;
pub mod primitive;
pub mod region;
pub mod registry;
pub mod sim;
pub mod store;
pub mod transport;
pub mod wire;

// test_utils lives under tests/unit; compiled into unit tests only
#[cfg(test)]
pub mod test_utils {
    include!("../tests/unit/test_utils.rs");
}

pub use config::{ConfigBuilder, LockdConfig};
pub use dispatch::{Dispatcher, Disposition, OperationKind};
pub use error::{LockdError, Result};
pub use files::{FileRef, FileRegistry};
pub use granted::{GrantOutcome, GrantedCallbackScheduler};
pub use matcher::{MatchResult, RetransmitMatcher};
pub use region::{ClientId, FileHandle, LockMode, LockRegion, OwnerId, RequestId};
pub use registry::FileLockRegistry;
pub use wire::{NlmStatus, ProtocolVersion, Reply};

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use nlm_lockd::dispatch::Dispatcher;
use nlm_lockd::logging::MemoryDiagnostics;
use nlm_lockd::primitive::MemoryLockTable;
use nlm_lockd::transport::{RecordingTransport, TransportEvent};
use nlm_lockd::wire::{Alock, Call, CallArgs, CallHeader, Extent};
use nlm_lockd::{ClientId, FileHandle, LockdConfig, NlmStatus, OperationKind, ProtocolVersion};

pub const WAIT: Duration = Duration::from_secs(10);

pub struct Server {
    pub dispatcher: Arc<Dispatcher>,
    pub locks: Arc<MemoryLockTable>,
    pub transport: Arc<RecordingTransport>,
    pub diagnostics: Arc<MemoryDiagnostics>,
}

pub fn file() -> FileHandle {
    FileHandle::new(b"vol0/inode/42".to_vec())
}

pub fn server() -> Server {
    server_with(LockdConfig::testing())
}

/// Granted callbacks retry until answered or cancelled.
pub fn patient() -> LockdConfig {
    let mut config = LockdConfig::testing();
    config.grant.max_attempts = None;
    config
}

pub fn server_with(config: LockdConfig) -> Server {
    let store = Arc::new(nlm_lockd::store::MemoryFileStore::new());
    store.export(file());
    let locks = Arc::new(MemoryLockTable::new());
    let transport = Arc::new(RecordingTransport::new());
    let diagnostics = MemoryDiagnostics::new(config.diagnostics.max_log_events);
    let dispatcher = Arc::new(Dispatcher::new(
        &config,
        store,
        locks.clone(),
        transport.clone(),
        diagnostics.clone(),
    ));
    Server {
        dispatcher,
        locks,
        transport,
        diagnostics,
    }
}

fn header(kind: OperationKind, xid: u32, client: u32) -> CallHeader {
    CallHeader {
        version: ProtocolVersion::V4,
        kind,
        xid,
        client: ClientId(client),
    }
}

pub fn alock(client: u32, pid: u32, offset: u64, len: u64) -> Alock {
    Alock {
        caller_name: format!("client{}", client),
        fh: file(),
        oh: vec![],
        svid: pid,
        extent: Extent::V4 { offset, len },
    }
}

pub fn lock(xid: u32, client: u32, pid: u32, offset: u64, len: u64, block: bool) -> Call {
    Call {
        header: header(OperationKind::Lock, xid, client),
        args: CallArgs::Lock {
            cookie: xid.to_be_bytes().to_vec(),
            block,
            exclusive: true,
            alock: alock(client, pid, offset, len),
            reclaim: false,
            state: 0,
        },
    }
}

pub fn unlock(xid: u32, client: u32, pid: u32, offset: u64, len: u64) -> Call {
    Call {
        header: header(OperationKind::Unlock, xid, client),
        args: CallArgs::Unlock {
            cookie: xid.to_be_bytes().to_vec(),
            alock: alock(client, pid, offset, len),
        },
    }
}

pub fn cancel(xid: u32, client: u32, pid: u32, offset: u64, len: u64) -> Call {
    Call {
        header: header(OperationKind::Cancel, xid, client),
        args: CallArgs::Cancel {
            cookie: xid.to_be_bytes().to_vec(),
            block: true,
            exclusive: true,
            alock: alock(client, pid, offset, len),
        },
    }
}

/// Wait for a reply with `stat` to `xid`, on the connection or as `*_RES`.
pub fn wait_for_reply(transport: &RecordingTransport, xid: u32, stat: NlmStatus) -> bool {
    transport.wait_for(WAIT, |events| {
        events.iter().any(|e| match e {
            TransportEvent::Response { xid: x, reply, .. } | TransportEvent::Result { xid: x, reply, .. } => {
                *x == xid && reply.stat() == Some(stat)
            }
            TransportEvent::Granted { .. } => false,
        })
    })
}

pub fn wait_for_granted(transport: &RecordingTransport, client: u32) -> bool {
    let client = ClientId(client);
    transport.wait_for(WAIT, |events| {
        events
            .iter()
            .any(|e| matches!(e, TransportEvent::Granted { client: c, .. } if *c == client))
    })
}

use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::LockdConfig;
use crate::dispatch::{Dispatcher, OperationKind};
use crate::logging::MemoryDiagnostics;
use crate::primitive::MemoryLockTable;
use crate::region::{ClientId, FileHandle};
use crate::store::MemoryFileStore;
use crate::transport::RecordingTransport;
use crate::wire::{Alock, Call, CallArgs, CallHeader, Extent, ProtocolVersion};

/// Run a closure and return Err if it doesn't complete within `secs` seconds.
/// Intended for use in tests to avoid hanging forever when something deadlocks.
pub fn run_with_timeout<F, T>(secs: u64, f: F) -> Result<T, &'static str>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = channel();
    thread::spawn(move || {
        let res = f();
        let _ = tx.send(res);
    });

    match rx.recv_timeout(Duration::from_secs(secs)) {
        Ok(v) => Ok(v),
        Err(_) => Err("timed out"),
    }
}

/// A dispatcher wired to in-memory collaborators, with tracing captured.
pub struct TestServer {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<MemoryFileStore>,
    pub locks: Arc<MemoryLockTable>,
    pub transport: Arc<RecordingTransport>,
    pub diagnostics: Arc<MemoryDiagnostics>,
}

/// Start a test server exporting `files`.
pub fn setup_test_server(config: &LockdConfig, files: &[FileHandle]) -> TestServer {
    let store = Arc::new(MemoryFileStore::new());
    for fh in files {
        store.export(fh.clone());
    }
    let locks = Arc::new(MemoryLockTable::new());
    let transport = Arc::new(RecordingTransport::new());
    let diagnostics = MemoryDiagnostics::new(config.diagnostics.max_log_events);
    let dispatcher = Arc::new(Dispatcher::new(
        config,
        store.clone(),
        locks.clone(),
        transport.clone(),
        diagnostics.clone(),
    ));

    TestServer {
        dispatcher,
        store,
        locks,
        transport,
        diagnostics,
    }
}

/// Exclusive V4 LOCK from `client` (pid 1) whose cookie mirrors the xid.
pub fn lock_call(fh: &FileHandle, xid: u32, client: u32, offset: u64, len: u64, block: bool) -> Call {
    Call {
        header: CallHeader {
            version: ProtocolVersion::V4,
            kind: OperationKind::Lock,
            xid,
            client: ClientId(client),
        },
        args: CallArgs::Lock {
            cookie: xid.to_be_bytes().to_vec(),
            block,
            exclusive: true,
            alock: Alock {
                caller_name: format!("client{}", client),
                fh: fh.clone(),
                oh: vec![],
                svid: 1,
                extent: Extent::V4 { offset, len },
            },
            reclaim: false,
            state: 0,
        },
    }
}

//! Benchmarks for the blocked-request registry and the dispatcher.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use nlm_lockd::dispatch::OperationKind;
use nlm_lockd::logging::NullDiagnostics;
use nlm_lockd::primitive::MemoryLockTable;
use nlm_lockd::store::MemoryFileStore;
use nlm_lockd::transport::RecordingTransport;
use nlm_lockd::wire::{Alock, Call, CallArgs, CallHeader, Extent};
use nlm_lockd::{
    ClientId, Dispatcher, FileHandle, FileLockRegistry, LockMode, LockRegion, LockdConfig, OwnerId, ProtocolVersion,
    RequestId,
};

fn populated(entries: u32) -> FileLockRegistry {
    let registry = FileLockRegistry::new(
        FileHandle::new(b"bench".to_vec()),
        entries as usize + 1,
        Arc::new(NullDiagnostics),
    );
    {
        let mut guard = registry.lock();
        for i in 0..entries {
            let region = LockRegion::new(OwnerId::new(i % 16, i), u64::from(i) * 100, 100);
            if let Err(e) = guard.add(region, LockMode::Exclusive, RequestId::from_xid(i)) {
                panic!("populating registry: {}", e);
            }
        }
    }
    registry
}

fn bench_find_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_find_match");

    for entries in [16u32, 256, 1024].iter() {
        group.throughput(Throughput::Elements(u64::from(*entries)));
        group.bench_with_input(BenchmarkId::from_parameter(entries), entries, |b, &entries| {
            let registry = populated(entries);
            let last = entries - 1;
            let region = LockRegion::new(OwnerId::new(last % 16, last), u64::from(last) * 100, 100);
            let request_id = RequestId::from_xid(last);
            b.iter(|| {
                let guard = registry.lock();
                black_box(guard.find_match(black_box(&region), black_box(&request_id)));
            });
        });
    }
    group.finish();
}

fn bench_add_remove(c: &mut Criterion) {
    c.bench_function("registry_add_remove", |b| {
        let registry = populated(64);
        let region = LockRegion::new(OwnerId::new(99, 1), 1_000_000, 10);
        b.iter(|| {
            let mut guard = registry.lock();
            if let Ok(handle) = guard.add(region, LockMode::Shared, RequestId::from_xid(7)) {
                black_box(guard.remove(handle));
            }
        });
    });
}

fn bench_dispatch_lock_unlock(c: &mut Criterion) {
    let config = LockdConfig::testing();
    let fh = FileHandle::new(b"bench".to_vec());
    let store = Arc::new(MemoryFileStore::new());
    store.export(fh.clone());
    let dispatcher = Dispatcher::new(
        &config,
        store,
        Arc::new(MemoryLockTable::new()),
        Arc::new(RecordingTransport::new()),
        Arc::new(NullDiagnostics),
    );

    let call = |kind: OperationKind, xid: u32| {
        let alock = Alock {
            caller_name: "bench".to_string(),
            fh: fh.clone(),
            oh: vec![],
            svid: 1,
            extent: Extent::V4 { offset: 0, len: 100 },
        };
        let cookie = xid.to_be_bytes().to_vec();
        let args = match kind {
            OperationKind::Unlock => CallArgs::Unlock { cookie, alock },
            _ => CallArgs::Lock {
                cookie,
                block: false,
                exclusive: true,
                alock,
                reclaim: false,
                state: 0,
            },
        };
        Call {
            header: CallHeader {
                version: ProtocolVersion::V4,
                kind,
                xid,
                client: ClientId(1),
            },
            args,
        }
    };
    let lock = call(OperationKind::Lock, 1);
    let unlock = call(OperationKind::Unlock, 2);

    c.bench_function("dispatch_lock_unlock", |b| {
        b.iter(|| {
            black_box(dispatcher.dispatch(&lock));
            black_box(dispatcher.dispatch(&unlock));
        });
    });
}

criterion_group!(benches, bench_find_match, bench_add_remove, bench_dispatch_lock_unlock);
criterion_main!(benches);

//! Granted callbacks for blocked requests that finally got their lock.
//!
//! The scheduler runs on the worker that waited for the lock. Before every
//! attempt it re-checks the entry under the per-file lock and marks it in
//! flight; cancellation that races with an attempt detaches the entry and
//! leaves its removal to the scheduler.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::block::BlockHandle;
use crate::config::GrantConfig;
use crate::dispatch::DeferredReplyMode;
use crate::files::FileRef;
use crate::metrics::LockdMetrics;
use crate::registry::{BlockGuard, FileLockRegistry};
use crate::transport::{GrantDelivery, Transport};
use crate::wire::{CallHeader, GrantedNotice, NlmStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GrantOutcome {
    /// The client confirmed the grant
    Acknowledged,
    /// Cancelled before the client confirmed; nothing more was sent
    Suppressed,
    /// Retry policy or shutdown gave up. The lock stays held.
    Abandoned,
}

struct PendingAck {
    entry: Arc<FileLockRegistry>,
    handle: BlockHandle,
}

pub struct GrantedCallbackScheduler {
    transport: Arc<dyn Transport>,
    config: GrantConfig,
    next_cookie: AtomicU32,
    pending: Mutex<HashMap<u32, PendingAck>>,
    /// Registries a callback is sleeping on, keyed by attempt cookie
    sleeping: Mutex<HashMap<u32, Arc<FileLockRegistry>>>,
    shutting_down: AtomicBool,
    metrics: LockdMetrics,
}

impl GrantedCallbackScheduler {
    pub fn new(transport: Arc<dyn Transport>, config: GrantConfig, metrics: LockdMetrics) -> Self {
        GrantedCallbackScheduler {
            transport,
            config,
            next_cookie: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            sleeping: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            metrics,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u32, PendingAck>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Callbacks still waiting for GRANTED_RES.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    fn sleeping(&self) -> MutexGuard<'_, HashMap<u32, Arc<FileLockRegistry>>> {
        self.sleeping.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// After this, every callback makes at most the attempt it is on.
    /// Callbacks waiting out a retry or ack timeout wake up and give up.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let sleepers: Vec<Arc<FileLockRegistry>> = self.sleeping().values().cloned().collect();
        for registry in sleepers {
            // Taking the per-file lock orders the flag before the sleeper's
            // next check.
            registry.lock().notify();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Notify the owner of `handle` that its lock was granted, retrying until
    /// the client confirms, the entry is cancelled or the retry policy gives
    /// up. The entry is removed in every case.
    pub fn run(
        &self,
        file: &FileRef,
        handle: BlockHandle,
        header: &CallHeader,
        notice: &GrantedNotice,
        mode: DeferredReplyMode,
    ) -> GrantOutcome {
        let mut attempt: u32 = 0;

        let outcome = loop {
            {
                let mut guard = file.blocks().lock();
                let Some(entry) = guard.get_mut(handle) else {
                    break GrantOutcome::Suppressed;
                };
                if entry.suppress_callback {
                    break GrantOutcome::Suppressed;
                }
                if entry.acknowledged {
                    break GrantOutcome::Acknowledged;
                }
                if attempt > 0 && self.is_shutting_down() {
                    break GrantOutcome::Abandoned;
                }
                if self.config.max_attempts.is_some_and(|max| attempt >= max) {
                    break GrantOutcome::Abandoned;
                }
                entry.in_flight = true;
            }

            let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
            if mode == DeferredReplyMode::Callback {
                self.pending().insert(
                    cookie,
                    PendingAck {
                        entry: Arc::clone(file.entry()),
                        handle,
                    },
                );
            }

            self.metrics.record_grant_sent(attempt);
            log::debug!(
                "granted callback #{} to client {} (xid {:#x}, cookie {})",
                attempt + 1,
                header.client,
                header.xid,
                cookie
            );
            let result = self
                .transport
                .send_granted(header, &cookie.to_be_bytes(), notice, mode);
            attempt += 1;

            let mut guard = file.blocks().lock();
            if let Some(entry) = guard.get_mut(handle) {
                entry.in_flight = false;
            }
            guard.notify();

            let retry_in = match result {
                Ok(GrantDelivery::Acknowledged(NlmStatus::DeniedGracePeriod)) => self.config.retry_interval(),
                Ok(GrantDelivery::Acknowledged(stat)) => {
                    if stat != NlmStatus::Granted {
                        log::warn!("client {} answered granted callback with {:?}", header.client, stat);
                    }
                    if let Some(entry) = guard.get_mut(handle) {
                        entry.acknowledged = true;
                    }
                    drop(guard);
                    self.forget_cookie(mode, cookie);
                    continue;
                }
                Ok(GrantDelivery::Sent) => self.config.ack_timeout(),
                Err(e) => {
                    log::debug!("granted callback to client {} failed: {}", header.client, e);
                    self.config.retry_interval()
                }
            };

            self.sleeping().insert(cookie, Arc::clone(file.entry()));
            let guard = self.wait_for_change(guard, handle, Instant::now() + retry_in);
            drop(guard);
            self.sleeping().remove(&cookie);
            self.forget_cookie(mode, cookie);
        };

        let mut guard = file.blocks().lock();
        guard.remove(handle);
        drop(guard);

        match outcome {
            GrantOutcome::Acknowledged => self.metrics.record_grant_acknowledged(),
            GrantOutcome::Suppressed => self.metrics.record_grant_suppressed(),
            GrantOutcome::Abandoned => {
                self.metrics.record_grant_abandoned();
                log::warn!(
                    "giving up granted callback to client {} after {} attempt(s); lock stays held",
                    header.client,
                    attempt
                );
            }
        }
        outcome
    }

    fn forget_cookie(&self, mode: DeferredReplyMode, cookie: u32) {
        if mode == DeferredReplyMode::Callback {
            self.pending().remove(&cookie);
        }
    }

    /// Sleep until the entry is gone, cancelled or acknowledged, shutdown
    /// starts, or `deadline` passes.
    fn wait_for_change<'a>(&self, mut guard: BlockGuard<'a>, handle: BlockHandle, deadline: Instant) -> BlockGuard<'a> {
        loop {
            if self.is_shutting_down() {
                return guard;
            }
            match guard.get(handle) {
                None => return guard,
                Some(e) if e.suppress_callback || e.acknowledged => return guard,
                Some(_) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return guard;
            }
            guard = guard.wait_timeout(deadline - now);
        }
    }

    /// Match a GRANTED_RES to the attempt that carried `cookie`.
    pub fn acknowledge(&self, cookie: &[u8]) -> bool {
        let Ok(bytes) = <[u8; 4]>::try_from(cookie) else {
            return false;
        };
        let Some(ack) = self.pending().remove(&u32::from_be_bytes(bytes)) else {
            return false;
        };

        let mut guard = ack.entry.lock();
        let Some(entry) = guard.get_mut(ack.handle) else {
            return false;
        };
        entry.acknowledged = true;
        guard.notify();
        true
    }

    pub fn retry_interval(&self) -> Duration {
        self.config.retry_interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockdConfig;
    use crate::dispatch::OperationKind;
    use crate::files::FileRegistry;
    use crate::logging::NullDiagnostics;
    use crate::primitive::MemoryLockTable;
    use crate::region::{ClientId, FileHandle, LockMode, LockRegion, OwnerId, RequestId};
    use crate::store::MemoryFileStore;
    use crate::transport::{RecordingTransport, TransportEvent};
    use crate::wire::{Alock, Extent, ProtocolVersion};
    use std::thread;

    struct Fixture {
        files: Arc<FileRegistry>,
        transport: Arc<RecordingTransport>,
        scheduler: Arc<GrantedCallbackScheduler>,
        metrics: LockdMetrics,
    }

    fn fixture(max_attempts: Option<u32>) -> Fixture {
        let mut config = LockdConfig::testing();
        config.grant.max_attempts = max_attempts;
        fixture_with(config)
    }

    fn fixture_with(config: LockdConfig) -> Fixture {
        let store = Arc::new(MemoryFileStore::new());
        store.export(fh());
        let metrics = LockdMetrics::new();
        let files = FileRegistry::new(
            store,
            Arc::new(MemoryLockTable::new()),
            &config.limits,
            Arc::new(NullDiagnostics),
            metrics.clone(),
        );
        let transport = Arc::new(RecordingTransport::new());
        let scheduler = Arc::new(GrantedCallbackScheduler::new(transport.clone(), config.grant, metrics.clone()));
        Fixture {
            files,
            transport,
            scheduler,
            metrics,
        }
    }

    fn fh() -> FileHandle {
        FileHandle::new(vec![7])
    }

    fn header() -> CallHeader {
        CallHeader {
            version: ProtocolVersion::V4,
            kind: OperationKind::Lock,
            xid: 11,
            client: ClientId(1),
        }
    }

    fn notice() -> GrantedNotice {
        GrantedNotice {
            exclusive: true,
            alock: Alock {
                caller_name: "c1".into(),
                fh: fh(),
                oh: vec![],
                svid: 1,
                extent: Extent::V4 { offset: 0, len: 100 },
            },
        }
    }

    fn granted_entry(file: &FileRef) -> BlockHandle {
        let mut g = file.blocks().lock();
        let h = g
            .add(LockRegion::new(OwnerId::new(1, 1), 0, 100), LockMode::Exclusive, RequestId::from_xid(11))
            .unwrap();
        let e = g.get_mut(h).unwrap();
        e.mark_blocked().unwrap();
        e.mark_granted().unwrap();
        h
    }

    #[test]
    fn test_sync_grant_acknowledged() {
        let f = fixture(None);
        let file = f.files.acquire(&fh()).unwrap();
        let h = granted_entry(&file);

        let outcome = f.scheduler.run(&file, h, &header(), &notice(), DeferredReplyMode::Response);
        assert_eq!(outcome, GrantOutcome::Acknowledged);
        assert!(file.blocks().lock().get(h).is_none());
        assert_eq!(f.transport.granted_count(), 1);
    }

    #[test]
    fn test_sync_grant_retried_after_loss() {
        let f = fixture(None);
        f.transport.lose_granted(2);
        let file = f.files.acquire(&fh()).unwrap();
        let h = granted_entry(&file);

        let outcome = f.scheduler.run(&file, h, &header(), &notice(), DeferredReplyMode::Response);
        assert_eq!(outcome, GrantOutcome::Acknowledged);
        assert_eq!(f.transport.granted_count(), 3);
        assert_eq!(f.metrics.snapshot().grants_retried, 2);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let f = fixture(Some(3));
        f.transport.lose_granted(usize::MAX);
        let file = f.files.acquire(&fh()).unwrap();
        let h = granted_entry(&file);

        let outcome = f.scheduler.run(&file, h, &header(), &notice(), DeferredReplyMode::Response);
        assert_eq!(outcome, GrantOutcome::Abandoned);
        assert_eq!(f.transport.granted_count(), 3);
        assert!(file.blocks().lock().is_empty());
    }

    #[test]
    fn test_async_grant_acknowledged_by_cookie() {
        let mut config = LockdConfig::testing();
        config.grant.ack_timeout_ms = 10_000;
        let f = fixture_with(config);
        let file = f.files.acquire(&fh()).unwrap();
        let h = granted_entry(&file);

        let transport = f.transport.clone();
        let scheduler = f.scheduler.clone();
        let acker = thread::spawn(move || {
            assert!(transport.wait_for(Duration::from_secs(5), |events| {
                events.iter().any(|e| matches!(e, TransportEvent::Granted { .. }))
            }));
            let (cookie, _) = transport.granted_to(ClientId(1)).remove(0);
            assert!(scheduler.acknowledge(&cookie));
            // Second acknowledgement for the same cookie is stale
            assert!(!scheduler.acknowledge(&cookie));
        });

        let outcome = f.scheduler.run(&file, h, &header(), &notice(), DeferredReplyMode::Callback);
        acker.join().unwrap();
        assert_eq!(outcome, GrantOutcome::Acknowledged);
        assert_eq!(f.scheduler.pending_count(), 0);
    }

    #[test]
    fn test_async_grant_resent_after_ack_timeout() {
        let f = fixture(Some(2));
        let file = f.files.acquire(&fh()).unwrap();
        let h = granted_entry(&file);

        let outcome = f.scheduler.run(&file, h, &header(), &notice(), DeferredReplyMode::Callback);
        assert_eq!(outcome, GrantOutcome::Abandoned);

        let cookies: Vec<Vec<u8>> = f.transport.granted_to(ClientId(1)).into_iter().map(|(c, _)| c).collect();
        assert_eq!(cookies.len(), 2);
        assert_ne!(cookies[0], cookies[1]);
        assert_eq!(f.scheduler.pending_count(), 0);
    }

    #[test]
    fn test_suppressed_entry_sends_nothing() {
        let f = fixture(None);
        let file = f.files.acquire(&fh()).unwrap();
        let h = granted_entry(&file);
        file.blocks().lock().get_mut(h).unwrap().suppress_callback = true;

        let outcome = f.scheduler.run(&file, h, &header(), &notice(), DeferredReplyMode::Response);
        assert_eq!(outcome, GrantOutcome::Suppressed);
        assert_eq!(f.transport.granted_count(), 0);
        assert!(file.blocks().lock().is_empty());
    }

    #[test]
    fn test_cancel_during_retry_stops_callbacks() {
        let f = fixture(None);
        f.transport.lose_granted(usize::MAX);
        let file = f.files.acquire(&fh()).unwrap();
        let h = granted_entry(&file);

        let canceller = file.clone();
        let transport = f.transport.clone();
        let t = thread::spawn(move || {
            assert!(transport.wait_for(Duration::from_secs(5), |events| events.len() >= 2));
            let n = canceller
                .blocks()
                .lock()
                .cancel_granted_overlapping(&LockRegion::new(OwnerId::new(1, 1), 0, 100));
            assert_eq!(n, 1);
        });

        let outcome = f.scheduler.run(&file, h, &header(), &notice(), DeferredReplyMode::Response);
        t.join().unwrap();
        assert_eq!(outcome, GrantOutcome::Suppressed);

        let sent = f.transport.granted_count();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(f.transport.granted_count(), sent);
    }

    #[test]
    fn test_shutdown_allows_one_attempt() {
        let f = fixture(None);
        f.transport.lose_granted(usize::MAX);
        f.scheduler.begin_shutdown();
        let file = f.files.acquire(&fh()).unwrap();
        let h = granted_entry(&file);

        let outcome = f.scheduler.run(&file, h, &header(), &notice(), DeferredReplyMode::Response);
        assert_eq!(outcome, GrantOutcome::Abandoned);
        assert_eq!(f.transport.granted_count(), 1);
    }

    #[test]
    fn test_shutdown_wakes_callback_waiting_for_ack() {
        let mut config = LockdConfig::testing();
        config.grant.ack_timeout_ms = 30_000;
        let f = fixture_with(config);
        let file = f.files.acquire(&fh()).unwrap();
        let h = granted_entry(&file);

        let scheduler = f.scheduler.clone();
        let runner_file = file.clone();
        let started = Instant::now();
        let runner = thread::spawn(move || {
            scheduler.run(&runner_file, h, &header(), &notice(), DeferredReplyMode::Callback)
        });

        assert!(f.transport.wait_for(Duration::from_secs(5), |events| !events.is_empty()));
        f.scheduler.begin_shutdown();

        assert_eq!(runner.join().unwrap(), GrantOutcome::Abandoned);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(f.transport.granted_count(), 1);
        assert_eq!(f.scheduler.pending_count(), 0);
        assert!(file.blocks().lock().is_empty());
    }

    /// Answers GRANTED_MSG on the spot, the way a loopback client might.
    struct EagerTransport;

    impl Transport for EagerTransport {
        fn respond(&self, _header: &CallHeader, _reply: &crate::wire::Reply) {}

        fn send_result(
            &self,
            _header: &CallHeader,
            _proc: OperationKind,
            _reply: &crate::wire::Reply,
        ) -> Result<(), crate::transport::TransportError> {
            Ok(())
        }

        fn send_granted(
            &self,
            _header: &CallHeader,
            _cookie: &[u8],
            _notice: &GrantedNotice,
            _mode: DeferredReplyMode,
        ) -> Result<GrantDelivery, crate::transport::TransportError> {
            Ok(GrantDelivery::Acknowledged(NlmStatus::Granted))
        }
    }

    #[test]
    fn test_immediate_callback_answer_clears_cookie() {
        let config = LockdConfig::testing();
        let metrics = LockdMetrics::new();
        let store = Arc::new(MemoryFileStore::new());
        store.export(fh());
        let files = FileRegistry::new(
            store,
            Arc::new(MemoryLockTable::new()),
            &config.limits,
            Arc::new(NullDiagnostics),
            metrics.clone(),
        );
        let scheduler = GrantedCallbackScheduler::new(Arc::new(EagerTransport), config.grant, metrics.clone());
        let file = files.acquire(&fh()).unwrap();
        let h = granted_entry(&file);

        let outcome = scheduler.run(&file, h, &header(), &notice(), DeferredReplyMode::Callback);
        assert_eq!(outcome, GrantOutcome::Acknowledged);
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(metrics.snapshot().grants_acknowledged, 1);
    }

    #[test]
    fn test_acknowledge_rejects_malformed_cookie() {
        let f = fixture(None);
        assert!(!f.scheduler.acknowledge(b"xyz"));
        assert!(!f.scheduler.acknowledge(&99u32.to_be_bytes()));
    }
}

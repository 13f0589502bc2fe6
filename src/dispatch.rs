//! Table-driven dispatch of decoded lock manager calls.
//!
//! Every procedure maps to a static `OperationPolicy`; blocking LOCK and
//! LOCK_MSG get their own policies because their reply is deferred. The
//! handlers are written once and serve both protocol versions: regions are
//! converted on entry and replies are tagged with the caller's version.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::block::BlockHandle;
use crate::config::LockdConfig;
use crate::error::LockdError;
use crate::files::{FileRef, FileRegistry};
use crate::granted::{GrantOutcome, GrantedCallbackScheduler};
use crate::logging::{trace_call, DiagnosticsHook, LogLevel};
use crate::matcher::{Action, Classification, IncomingOp, MatchResult, RetransmitMatcher};
use crate::metrics::LockdMetrics;
use crate::primitive::{AcquireOutcome, LocalLockPrimitive, LockRequest, ShareReservation};
use crate::region::{ClientId, LockMode, LockRegion, OwnerId, RequestId};
use crate::store::FileStore;
use crate::transport::Transport;
use crate::wire::{Alock, Call, CallArgs, CallHeader, GrantedNotice, NlmStatus, ProtocolVersion, Reply, ShareArgs};

/// Lock manager procedures, in procedure-number order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Null,
    Test,
    Lock,
    Cancel,
    Unlock,
    Granted,
    TestMsg,
    LockMsg,
    CancelMsg,
    UnlockMsg,
    GrantedMsg,
    TestRes,
    LockRes,
    CancelRes,
    UnlockRes,
    GrantedRes,
    Share,
    Unshare,
    NmLock,
    FreeAll,
}

impl OperationKind {
    pub const ALL: [OperationKind; 20] = [
        OperationKind::Null,
        OperationKind::Test,
        OperationKind::Lock,
        OperationKind::Cancel,
        OperationKind::Unlock,
        OperationKind::Granted,
        OperationKind::TestMsg,
        OperationKind::LockMsg,
        OperationKind::CancelMsg,
        OperationKind::UnlockMsg,
        OperationKind::GrantedMsg,
        OperationKind::TestRes,
        OperationKind::LockRes,
        OperationKind::CancelRes,
        OperationKind::UnlockRes,
        OperationKind::GrantedRes,
        OperationKind::Share,
        OperationKind::Unshare,
        OperationKind::NmLock,
        OperationKind::FreeAll,
    ];

    /// RPC procedure number. 16 to 19 are unassigned.
    pub fn proc_number(self) -> u32 {
        match self {
            OperationKind::Share => 20,
            OperationKind::Unshare => 21,
            OperationKind::NmLock => 22,
            OperationKind::FreeAll => 23,
            other => other as u32,
        }
    }

    pub fn from_proc(proc: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.proc_number() == proc)
    }

    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Null => "NULL",
            OperationKind::Test => "TEST",
            OperationKind::Lock => "LOCK",
            OperationKind::Cancel => "CANCEL",
            OperationKind::Unlock => "UNLOCK",
            OperationKind::Granted => "GRANTED",
            OperationKind::TestMsg => "TEST_MSG",
            OperationKind::LockMsg => "LOCK_MSG",
            OperationKind::CancelMsg => "CANCEL_MSG",
            OperationKind::UnlockMsg => "UNLOCK_MSG",
            OperationKind::GrantedMsg => "GRANTED_MSG",
            OperationKind::TestRes => "TEST_RES",
            OperationKind::LockRes => "LOCK_RES",
            OperationKind::CancelRes => "CANCEL_RES",
            OperationKind::UnlockRes => "UNLOCK_RES",
            OperationKind::GrantedRes => "GRANTED_RES",
            OperationKind::Share => "SHARE",
            OperationKind::Unshare => "UNSHARE",
            OperationKind::NmLock => "NM_LOCK",
            OperationKind::FreeAll => "FREE_ALL",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How a reply that is not a plain RPC response reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeferredReplyMode {
    /// On the connection the call came in on; granted notices go out as
    /// synchronous GRANTED calls.
    Response,
    /// As a new one-way `*_RES` call; granted notices go out as GRANTED_MSG.
    Callback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Handler {
    Null,
    Test,
    Lock,
    BlockLock,
    Cancel,
    Unlock,
    /// GRANTED sent to us
    Granted,
    /// GRANTED_RES answering one of our GRANTED_MSG calls
    GrantedRes,
    /// Other `*_RES` calls
    Result,
    Share,
    Unshare,
    FreeAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OperationPolicy {
    pub kind: OperationKind,
    pub handler: Handler,
    /// The reply is produced when the handler returns
    pub immediate_reply_required: bool,
    pub deferred_reply_mode: DeferredReplyMode,
    /// Procedure carrying the reply in `Callback` mode
    pub result_proc: Option<OperationKind>,
}

const fn respond(kind: OperationKind, handler: Handler) -> OperationPolicy {
    OperationPolicy {
        kind,
        handler,
        immediate_reply_required: true,
        deferred_reply_mode: DeferredReplyMode::Response,
        result_proc: None,
    }
}

const fn callback(kind: OperationKind, handler: Handler, result: OperationKind) -> OperationPolicy {
    OperationPolicy {
        kind,
        handler,
        immediate_reply_required: true,
        deferred_reply_mode: DeferredReplyMode::Callback,
        result_proc: Some(result),
    }
}

const fn silent(kind: OperationKind, handler: Handler) -> OperationPolicy {
    OperationPolicy {
        kind,
        handler,
        immediate_reply_required: false,
        deferred_reply_mode: DeferredReplyMode::Response,
        result_proc: None,
    }
}

/// Policy per procedure, indexed like `OperationKind::ALL`.
pub static DISPATCH_TABLE: [OperationPolicy; 20] = [
    respond(OperationKind::Null, Handler::Null),
    respond(OperationKind::Test, Handler::Test),
    respond(OperationKind::Lock, Handler::Lock),
    respond(OperationKind::Cancel, Handler::Cancel),
    respond(OperationKind::Unlock, Handler::Unlock),
    respond(OperationKind::Granted, Handler::Granted),
    callback(OperationKind::TestMsg, Handler::Test, OperationKind::TestRes),
    callback(OperationKind::LockMsg, Handler::Lock, OperationKind::LockRes),
    callback(OperationKind::CancelMsg, Handler::Cancel, OperationKind::CancelRes),
    callback(OperationKind::UnlockMsg, Handler::Unlock, OperationKind::UnlockRes),
    callback(OperationKind::GrantedMsg, Handler::Granted, OperationKind::GrantedRes),
    silent(OperationKind::TestRes, Handler::Result),
    silent(OperationKind::LockRes, Handler::Result),
    silent(OperationKind::CancelRes, Handler::Result),
    silent(OperationKind::UnlockRes, Handler::Result),
    silent(OperationKind::GrantedRes, Handler::GrantedRes),
    respond(OperationKind::Share, Handler::Share),
    respond(OperationKind::Unshare, Handler::Unshare),
    respond(OperationKind::NmLock, Handler::Lock),
    respond(OperationKind::FreeAll, Handler::FreeAll),
];

/// Blocking LOCK: interim BLOCKED reply, then a synchronous GRANTED call.
pub static BLOCK_LOCK_POLICY: OperationPolicy = OperationPolicy {
    kind: OperationKind::Lock,
    handler: Handler::BlockLock,
    immediate_reply_required: false,
    deferred_reply_mode: DeferredReplyMode::Response,
    result_proc: None,
};

/// Blocking LOCK_MSG: interim BLOCKED as LOCK_RES, then GRANTED_MSG.
pub static BLOCK_LOCK_MSG_POLICY: OperationPolicy = OperationPolicy {
    kind: OperationKind::LockMsg,
    handler: Handler::BlockLock,
    immediate_reply_required: false,
    deferred_reply_mode: DeferredReplyMode::Callback,
    result_proc: Some(OperationKind::LockRes),
};

/// Policy for one call. NM_LOCK never blocks, whatever its flag says.
pub fn policy_for(kind: OperationKind, args: &CallArgs) -> &'static OperationPolicy {
    match (kind, args) {
        (OperationKind::Lock, CallArgs::Lock { block: true, .. }) => &BLOCK_LOCK_POLICY,
        (OperationKind::LockMsg, CallArgs::Lock { block: true, .. }) => &BLOCK_LOCK_MSG_POLICY,
        _ => &DISPATCH_TABLE[kind.index()],
    }
}

/// What became of one dispatched call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Disposition {
    /// A reply was delivered per the call's policy
    Replied(Reply),
    /// The call blocked: `interim` went out when it went to sleep, `grant`
    /// is the fate of the granted notice (none if acquisition failed).
    Deferred { interim: Reply, grant: Option<GrantOutcome> },
    /// The procedure has no reply
    NoReply,
    /// Nothing was sent; the client is expected to retransmit
    Dropped,
}

impl Disposition {
    /// Status of the reply the handler produced, if any.
    pub fn stat(&self) -> Option<NlmStatus> {
        match self {
            Disposition::Replied(reply) => reply.stat(),
            Disposition::Deferred { interim, .. } => interim.stat(),
            Disposition::NoReply | Disposition::Dropped => None,
        }
    }
}

pub struct Dispatcher {
    files: Arc<FileRegistry>,
    transport: Arc<dyn Transport>,
    scheduler: GrantedCallbackScheduler,
    metrics: LockdMetrics,
    node_name: String,
    started: Instant,
    grace_period: Duration,
}

impl Dispatcher {
    pub fn new(
        config: &LockdConfig,
        store: Arc<dyn FileStore>,
        locks: Arc<dyn LocalLockPrimitive>,
        transport: Arc<dyn Transport>,
        hook: Arc<dyn DiagnosticsHook>,
    ) -> Self {
        let metrics = LockdMetrics::new();
        let files = FileRegistry::new(store, locks, &config.limits, hook, metrics.clone());
        let scheduler = GrantedCallbackScheduler::new(Arc::clone(&transport), config.grant.clone(), metrics.clone());

        log::info!(
            "lock manager {} ready (grace period {:?}, granted retry {:?})",
            config.node_name,
            config.recovery.grace_period(),
            config.grant.retry_interval()
        );

        Dispatcher {
            files,
            transport,
            scheduler,
            metrics,
            node_name: config.node_name.clone(),
            started: Instant::now(),
            grace_period: config.recovery.grace_period(),
        }
    }

    pub fn files(&self) -> &Arc<FileRegistry> {
        &self.files
    }

    pub fn scheduler(&self) -> &GrantedCallbackScheduler {
        &self.scheduler
    }

    pub fn metrics(&self) -> &LockdMetrics {
        &self.metrics
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// While in the grace period only reclaims are served.
    pub fn in_grace_period(&self) -> bool {
        self.started.elapsed() < self.grace_period
    }

    /// Stop accepting calls; callbacks in progress make one last attempt.
    pub fn begin_shutdown(&self) {
        log::info!("lock manager shutting down");
        self.scheduler.begin_shutdown();
    }

    fn locks(&self) -> &Arc<dyn LocalLockPrimitive> {
        self.files.locks()
    }

    /// Handle one call. Blocks for as long as a blocking lock waits and its
    /// granted notice is outstanding.
    pub fn dispatch(&self, call: &Call) -> Disposition {
        let header = &call.header;
        let trace_id = Uuid::new_v4().to_string();
        self.metrics.record_dispatch();

        if self.scheduler.is_shutting_down() {
            log::debug!("[{}] {} dropped during shutdown", trace_id, header.kind);
            self.metrics.record_drop();
            return Disposition::Dropped;
        }

        let policy = policy_for(header.kind, &call.args);
        log::debug!(
            "[{}] {} from client {} (xid {:#x}, {:?}, handler {:?})",
            trace_id,
            header.kind,
            header.client,
            header.xid,
            header.version,
            policy.handler
        );

        let disposition = match self.recovery_status(policy, &call.args) {
            Some(stat) => {
                trace_call(self.files.hook().as_ref(), "dispatch", LogLevel::Info, &trace_id, || {
                    format!("{} from client {} refused by recovery gate: {:?}", header.kind, header.client, stat)
                });
                Disposition::Replied(Self::status_reply(policy.handler, header.version, call.args.cookie(), stat))
            }
            None => self.run_handler(header, policy, &call.args),
        };

        if let Disposition::Replied(reply) = &disposition {
            self.deliver(header, policy, reply);
        }
        if disposition == Disposition::Dropped {
            self.metrics.record_drop();
        }

        trace_call(self.files.hook().as_ref(), "dispatch", LogLevel::Debug, &trace_id, || {
            format!("{} xid {:#x}: {:?}", header.kind, header.xid, disposition.stat())
        });
        disposition
    }

    /// Grace-period gate. GRANTED, FREE_ALL, NULL and `*_RES` always run.
    fn recovery_status(&self, policy: &OperationPolicy, args: &CallArgs) -> Option<NlmStatus> {
        let gated = matches!(
            policy.handler,
            Handler::Test
                | Handler::Lock
                | Handler::BlockLock
                | Handler::Cancel
                | Handler::Unlock
                | Handler::Share
                | Handler::Unshare
        );
        if !gated {
            return None;
        }

        let reclaim = match args {
            CallArgs::Lock { reclaim, .. } | CallArgs::Share { reclaim, .. } => *reclaim,
            _ => false,
        };
        match (self.in_grace_period(), reclaim) {
            (true, false) => Some(NlmStatus::DeniedGracePeriod),
            (false, true) => {
                log::debug!("tardy reclaim request rejected");
                Some(NlmStatus::Failed)
            }
            _ => None,
        }
    }

    fn run_handler(&self, header: &CallHeader, policy: &'static OperationPolicy, args: &CallArgs) -> Disposition {
        let version = header.version;
        match (policy.handler, args) {
            (Handler::Null, _) => Disposition::Replied(Reply::void(version)),
            (Handler::Test, CallArgs::Test { cookie, exclusive, alock }) => {
                Disposition::Replied(self.test(header, cookie, *exclusive, alock))
            }
            (Handler::Lock, CallArgs::Lock { cookie, exclusive, alock, .. }) => {
                Disposition::Replied(self.lock(header, policy, cookie, *exclusive, alock))
            }
            (Handler::BlockLock, CallArgs::Lock { cookie, exclusive, alock, .. }) => {
                self.block_lock(header, policy, cookie, *exclusive, alock)
            }
            (Handler::Cancel, CallArgs::Cancel { cookie, alock, .. }) => {
                Disposition::Replied(self.cancel(header, policy, cookie, alock))
            }
            (Handler::Unlock, CallArgs::Unlock { cookie, alock }) => {
                Disposition::Replied(self.unlock(header, policy, cookie, alock))
            }
            // GRANTED and GRANTED_MSG are calls a server makes to a client.
            // This daemon only serves locks and never waits on one, so there
            // is no blocked request to match and the call is refused.
            (Handler::Granted, CallArgs::Granted { cookie, .. }) => {
                log::debug!("GRANTED from client {} ignored: no client side here", header.client);
                Disposition::Replied(Reply::status(version, cookie, NlmStatus::Denied))
            }
            (Handler::GrantedRes, CallArgs::Res { cookie, stat }) => {
                if *stat != NlmStatus::Granted {
                    log::warn!("client {} answered GRANTED_MSG with {:?}", header.client, stat);
                }
                if !self.scheduler.acknowledge(cookie) {
                    log::debug!("GRANTED_RES from client {} matches no pending callback", header.client);
                }
                Disposition::NoReply
            }
            (Handler::Result, CallArgs::Res { .. }) => {
                log::debug!("{} from client {} ignored", header.kind, header.client);
                Disposition::NoReply
            }
            (Handler::Share, CallArgs::Share { cookie, share, .. }) => {
                Disposition::Replied(self.share(header, cookie, share))
            }
            (Handler::Unshare, CallArgs::Share { cookie, share, .. }) => {
                Disposition::Replied(self.unshare(header, cookie, share))
            }
            (Handler::FreeAll, CallArgs::FreeAll { name, state }) => {
                self.free_all(header.client, name, *state);
                Disposition::Replied(Reply::void(version))
            }
            (handler, args) => {
                log::warn!("{} call with mismatched arguments for {:?}: {:?}", header.kind, handler, args);
                Disposition::Dropped
            }
        }
    }

    fn deliver(&self, header: &CallHeader, policy: &OperationPolicy, reply: &Reply) {
        match (policy.deferred_reply_mode, policy.result_proc) {
            (DeferredReplyMode::Callback, Some(proc)) => {
                if let Err(e) = self.transport.send_result(header, proc, reply) {
                    log::debug!("{} to client {} failed: {}", proc, header.client, e);
                }
            }
            _ => self.transport.respond(header, reply),
        }
    }

    fn status_reply(handler: Handler, version: ProtocolVersion, cookie: &[u8], stat: NlmStatus) -> Reply {
        match handler {
            Handler::Test => Reply::test(version, cookie, stat, None),
            Handler::Share | Handler::Unshare => Reply::share(version, cookie, stat, 0),
            _ => Reply::status(version, cookie, stat),
        }
    }

    /// Synchronous calls are identified by xid, `_MSG` calls by cookie.
    fn request_id(header: &CallHeader, policy: &OperationPolicy, cookie: &[u8]) -> RequestId {
        match policy.deferred_reply_mode {
            DeferredReplyMode::Response => RequestId::from_xid(header.xid),
            DeferredReplyMode::Callback => RequestId::from_cookie(cookie),
        }
    }

    /// Convert the lock description and take a hold on its file.
    fn open(&self, alock: &Alock, client: ClientId) -> std::result::Result<(FileRef, LockRegion), NlmStatus> {
        let region = alock.region(client)?;
        let file = self.files.acquire(&alock.fh).map_err(|e| match e {
            LockdError::StaleHandle(_) => NlmStatus::StaleFh,
            other => {
                log::error!("cannot track {}: {}", alock.fh, other);
                NlmStatus::Failed
            }
        })?;
        Ok((file, region))
    }

    fn note(&self, classification: &Classification) {
        match classification.result {
            MatchResult::Retransmit => self.metrics.record_retransmit(),
            MatchResult::PartialOverlap => self.metrics.record_partial_overlap(),
            MatchResult::None | MatchResult::FullMatch => {}
        }
    }

    fn acquire_status(outcome: AcquireOutcome) -> NlmStatus {
        match outcome {
            AcquireOutcome::Granted => NlmStatus::Granted,
            AcquireOutcome::WouldBlock | AcquireOutcome::Interrupted => NlmStatus::Denied,
            AcquireOutcome::Deadlock => NlmStatus::Deadlock,
            AcquireOutcome::NoLocks => NlmStatus::DeniedNoLocks,
        }
    }

    /// Classify and suppress matching callbacks before the primitive is
    /// touched.
    fn settle(&self, file: &FileRef, op: IncomingOp, region: &LockRegion, request_id: &RequestId) {
        let mut guard = file.blocks().lock();
        let classification = RetransmitMatcher::classify(&guard, op, region, request_id);
        self.note(&classification);
        if let Action::Process { cancel_overlapping: true } = classification.action {
            guard.cancel_granted_overlapping(region);
        }
    }

    fn test(&self, header: &CallHeader, cookie: &[u8], exclusive: bool, alock: &Alock) -> Reply {
        let version = header.version;
        let (file, region) = match self.open(alock, header.client) {
            Ok(opened) => opened,
            Err(stat) => return Reply::test(version, cookie, stat, None),
        };

        let req = LockRequest::new(region, LockMode::from_exclusive(exclusive));
        match self.locks().test(file.handle(), &req) {
            Some(holder) => Reply::test(version, cookie, NlmStatus::Denied, Some(holder)),
            None => Reply::test(version, cookie, NlmStatus::Granted, None),
        }
    }

    fn lock(&self, header: &CallHeader, policy: &OperationPolicy, cookie: &[u8], exclusive: bool, alock: &Alock) -> Reply {
        let version = header.version;
        let (file, region) = match self.open(alock, header.client) {
            Ok(opened) => opened,
            Err(stat) => return Reply::status(version, cookie, stat),
        };

        let request_id = Self::request_id(header, policy, cookie);
        self.settle(&file, IncomingOp::Lock, &region, &request_id);

        let req = LockRequest::new(region, LockMode::from_exclusive(exclusive));
        let stat = Self::acquire_status(self.locks().try_acquire(file.handle(), &req));
        Reply::status(version, cookie, stat)
    }

    fn block_lock(
        &self,
        header: &CallHeader,
        policy: &OperationPolicy,
        cookie: &[u8],
        exclusive: bool,
        alock: &Alock,
    ) -> Disposition {
        let version = header.version;
        let (file, region) = match self.open(alock, header.client) {
            Ok(opened) => opened,
            Err(stat) => return Disposition::Replied(Reply::status(version, cookie, stat)),
        };
        let mode = LockMode::from_exclusive(exclusive);
        let request_id = Self::request_id(header, policy, cookie);

        let handle = {
            let mut guard = file.blocks().lock();
            let classification = RetransmitMatcher::classify(&guard, IncomingOp::BlockingLock, &region, &request_id);
            self.note(&classification);

            match classification.action {
                Action::Drop => return Disposition::Dropped,
                Action::ReplyBlocked => {
                    return Disposition::Replied(Reply::status(version, cookie, NlmStatus::Blocked));
                }
                Action::GrantImmediately { cancel_matched } => {
                    if cancel_matched {
                        guard.cancel_granted_overlapping(&region);
                    }
                    return Disposition::Replied(Reply::status(version, cookie, NlmStatus::Granted));
                }
                Action::Register { cancel_overlapping } | Action::Process { cancel_overlapping } => {
                    if cancel_overlapping {
                        guard.cancel_granted_overlapping(&region);
                    }
                    match guard.add(region, mode, request_id) {
                        Ok(handle) => handle,
                        Err(e) => {
                            log::warn!("dropping blocking lock from client {}: {}", header.client, e);
                            return Disposition::Dropped;
                        }
                    }
                }
            }
        };
        self.metrics.record_block_registered();

        let req = LockRequest::new(region, mode);
        let mut interim = None;
        let outcome = self.locks().acquire_blocking(file.handle(), &req, &mut || {
            {
                let mut guard = file.blocks().lock();
                if let Some(entry) = guard.get_mut(handle) {
                    let marked = entry.mark_blocked();
                    if let Err(e) = &marked {
                        log::error!("{}", e);
                    }
                    debug_assert!(marked.is_ok());
                }
            }
            let reply = Reply::status(version, cookie, NlmStatus::Blocked);
            self.deliver(header, policy, &reply);
            self.metrics.record_block_waited();
            interim = Some(reply);
        });

        let Some(interim) = interim else {
            // Answered without going to sleep
            file.blocks().lock().remove(handle);
            return Disposition::Replied(Reply::status(version, cookie, Self::acquire_status(outcome)));
        };

        if outcome != AcquireOutcome::Granted {
            file.blocks().lock().remove(handle);
            self.metrics.record_block_failed();
            log::info!("blocked lock {} on {} ended with {:?}", region, file.handle(), outcome);
            return Disposition::Deferred { interim, grant: None };
        }

        match self.mark_granted(&file, handle) {
            Ok(true) => {}
            Ok(false) => {
                // Torn down while the primitive was granting; nobody will
                // ever unlock this on the owner's behalf
                self.locks().unlock(file.handle(), &region);
                log::info!("blocked lock {} on {} released after teardown", region, file.handle());
                return Disposition::Deferred {
                    interim,
                    grant: Some(GrantOutcome::Suppressed),
                };
            }
            Err(e) => {
                log::error!("granted lock {} on {}: {}", region, file.handle(), e);
                file.blocks().lock().remove(handle);
                return Disposition::Deferred { interim, grant: None };
            }
        }

        let notice = GrantedNotice {
            exclusive,
            alock: Alock {
                caller_name: self.node_name.clone(),
                ..alock.clone()
            },
        };
        let grant = self
            .scheduler
            .run(&file, handle, header, &notice, policy.deferred_reply_mode);
        Disposition::Deferred {
            interim,
            grant: Some(grant),
        }
    }

    /// Re-validate after the wait. A cancelled entry is left for the
    /// scheduler, which sees the suppression and sends nothing. Returns
    /// false when the entry was torn down.
    fn mark_granted(&self, file: &FileRef, handle: BlockHandle) -> crate::Result<bool> {
        let mut guard = file.blocks().lock();
        match guard.get_mut(handle) {
            Some(entry) => {
                let marked = entry.mark_granted();
                debug_assert!(marked.is_ok(), "{:?}", marked);
                marked.map(|_| true)
            }
            None => Ok(false),
        }
    }

    fn cancel(&self, header: &CallHeader, policy: &OperationPolicy, cookie: &[u8], alock: &Alock) -> Reply {
        let version = header.version;
        // CANCEL is always granted, even when there is nothing to cancel
        if let Ok((file, region)) = self.open(alock, header.client) {
            let request_id = Self::request_id(header, policy, cookie);
            self.settle(&file, IncomingOp::Cancel, &region, &request_id);
            self.locks().cancel(file.handle(), &region);
        }
        Reply::status(version, cookie, NlmStatus::Granted)
    }

    fn unlock(&self, header: &CallHeader, policy: &OperationPolicy, cookie: &[u8], alock: &Alock) -> Reply {
        let version = header.version;
        let (file, region) = match self.open(alock, header.client) {
            Ok(opened) => opened,
            Err(stat) => return Reply::status(version, cookie, stat),
        };

        let request_id = Self::request_id(header, policy, cookie);
        self.settle(&file, IncomingOp::Unlock, &region, &request_id);
        self.locks().unlock(file.handle(), &region);
        Reply::status(version, cookie, NlmStatus::Granted)
    }

    fn share(&self, header: &CallHeader, cookie: &[u8], share: &ShareArgs) -> Reply {
        let version = header.version;
        let file = match self.files.acquire(&share.fh) {
            Ok(file) => file,
            Err(_) => return Reply::share(version, cookie, NlmStatus::StaleFh, 0),
        };

        let reservation = ShareReservation {
            owner: OwnerId {
                client: header.client,
                pid: share.svid,
            },
            access: share.access,
            deny: share.mode,
        };
        let stat = if self.locks().share(file.handle(), reservation) {
            NlmStatus::Granted
        } else {
            NlmStatus::Denied
        };
        Reply::share(version, cookie, stat, 0)
    }

    fn unshare(&self, header: &CallHeader, cookie: &[u8], share: &ShareArgs) -> Reply {
        let version = header.version;
        let file = match self.files.acquire(&share.fh) {
            Ok(file) => file,
            Err(_) => return Reply::share(version, cookie, NlmStatus::StaleFh, 0),
        };
        self.locks().unshare(
            file.handle(),
            OwnerId {
                client: header.client,
                pid: share.svid,
            },
        );
        Reply::share(version, cookie, NlmStatus::Granted, 0)
    }

    /// The client rebooted: forget its blocked requests, locks and shares.
    fn free_all(&self, client: ClientId, name: &str, state: u32) {
        let released = self.files.release_all_for_client(client);
        self.locks().release_client(client);
        let reclaimed = self.files.reclaim_idle();
        log::info!(
            "FREE_ALL for {} (client {}, state {}): {} blocked request(s), {} file(s) released",
            name,
            client,
            state,
            released,
            reclaimed
        );
    }
}

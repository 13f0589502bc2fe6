use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::dispatch::{DeferredReplyMode, OperationKind};
use crate::region::ClientId;
use crate::wire::{CallHeader, GrantedNotice, NlmStatus, Reply};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("call timed out")]
    Timeout,

    #[error("client unreachable: {0}")]
    Unreachable(String),

    #[error("call interrupted")]
    Interrupted,
}

/// What became of an outbound granted notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GrantDelivery {
    /// Synchronous GRANTED answered by the client
    Acknowledged(NlmStatus),
    /// GRANTED_MSG handed to the network; the answer comes as GRANTED_RES
    Sent,
}

/// The RPC layer as seen by the lock manager.
pub trait Transport: Send + Sync {
    /// Reply on the connection the call arrived on.
    fn respond(&self, header: &CallHeader, reply: &Reply);

    /// Deliver a reply as a new `*_RES` call back to the caller.
    fn send_result(&self, header: &CallHeader, proc: OperationKind, reply: &Reply) -> Result<(), TransportError>;

    /// Tell the caller its blocked lock was granted, as GRANTED when `mode`
    /// is `Response` or as GRANTED_MSG when it is `Callback`.
    fn send_granted(
        &self,
        header: &CallHeader,
        cookie: &[u8],
        notice: &GrantedNotice,
        mode: DeferredReplyMode,
    ) -> Result<GrantDelivery, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransportEvent {
    Response {
        client: ClientId,
        xid: u32,
        reply: Reply,
    },
    Result {
        client: ClientId,
        xid: u32,
        proc: OperationKind,
        reply: Reply,
    },
    Granted {
        client: ClientId,
        cookie: Vec<u8>,
        notice: GrantedNotice,
        mode: DeferredReplyMode,
        lost: bool,
    },
}

/// Loopback transport that records everything it is asked to send.
///
/// Granted calls can be made to fail: `lose_granted(n)` loses the next `n`
/// of them, timing out synchronous calls and silently dropping messages.
pub struct RecordingTransport {
    events: Mutex<Vec<TransportEvent>>,
    changed: Condvar,
    lose_granted: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        RecordingTransport {
            events: Mutex::new(Vec::new()),
            changed: Condvar::new(),
            lose_granted: AtomicUsize::new(0),
        }
    }

    pub fn lose_granted(&self, count: usize) {
        self.lose_granted.store(count, Ordering::SeqCst);
    }

    fn events_locked(&self) -> MutexGuard<'_, Vec<TransportEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: TransportEvent) {
        self.events_locked().push(event);
        self.changed.notify_all();
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events_locked().clone()
    }

    /// Direct responses and `*_RES` calls answering `xid`.
    pub fn replies_to(&self, xid: u32) -> Vec<Reply> {
        self.events_locked()
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Response { xid: x, reply, .. } | TransportEvent::Result { xid: x, reply, .. }
                    if *x == xid =>
                {
                    Some(reply.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Granted notifications sent to `client`, lost ones included.
    pub fn granted_to(&self, client: ClientId) -> Vec<(Vec<u8>, bool)> {
        self.events_locked()
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Granted { client: c, cookie, lost, .. } if *c == client => Some((cookie.clone(), *lost)),
                _ => None,
            })
            .collect()
    }

    pub fn granted_count(&self) -> usize {
        self.events_locked()
            .iter()
            .filter(|e| matches!(e, TransportEvent::Granted { .. }))
            .count()
    }

    /// Block until `pred` holds for the recorded events or `timeout` passes.
    pub fn wait_for<F>(&self, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&[TransportEvent]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut events = self.events_locked();
        loop {
            if pred(&events) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self
                .changed
                .wait_timeout(events, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn take_loss(&self) -> bool {
        self.lose_granted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for RecordingTransport {
    fn respond(&self, header: &CallHeader, reply: &Reply) {
        self.push(TransportEvent::Response {
            client: header.client,
            xid: header.xid,
            reply: reply.clone(),
        });
    }

    fn send_result(&self, header: &CallHeader, proc: OperationKind, reply: &Reply) -> Result<(), TransportError> {
        self.push(TransportEvent::Result {
            client: header.client,
            xid: header.xid,
            proc,
            reply: reply.clone(),
        });
        Ok(())
    }

    fn send_granted(
        &self,
        header: &CallHeader,
        cookie: &[u8],
        notice: &GrantedNotice,
        mode: DeferredReplyMode,
    ) -> Result<GrantDelivery, TransportError> {
        let lost = self.take_loss();
        self.push(TransportEvent::Granted {
            client: header.client,
            cookie: cookie.to_vec(),
            notice: notice.clone(),
            mode,
            lost,
        });

        match (mode, lost) {
            (DeferredReplyMode::Response, true) => Err(TransportError::Timeout),
            (DeferredReplyMode::Response, false) => Ok(GrantDelivery::Acknowledged(NlmStatus::Granted)),
            (DeferredReplyMode::Callback, _) => Ok(GrantDelivery::Sent),
        }
    }
}

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::region::{ranges_overlap, ClientId, FileHandle, LockMode, LockRegion, OwnerId};

/// A byte-range lock request against the local primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    pub region: LockRegion,
    pub mode: LockMode,
}

impl LockRequest {
    pub fn new(region: LockRegion, mode: LockMode) -> Self {
        LockRequest { region, mode }
    }
}

/// Lock that conflicts with a tested request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub owner: OwnerId,
    pub exclusive: bool,
    pub offset: u64,
    /// 0 means to end of file
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcquireOutcome {
    Granted,
    WouldBlock,
    Deadlock,
    /// A blocked waiter was cancelled
    Interrupted,
    /// Out of lock table space
    NoLocks,
}

/// DOS-style share reservation (access and deny bit masks: 1 = read, 2 = write).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareReservation {
    pub owner: OwnerId,
    pub access: u32,
    pub deny: u32,
}

impl ShareReservation {
    fn conflicts_with(&self, other: &ShareReservation) -> bool {
        self.owner != other.owner && ((self.deny & other.access) != 0 || (self.access & other.deny) != 0)
    }
}

/// The advisory byte-range locking service the lock manager fronts.
///
/// `acquire_blocking` invokes `on_block` exactly once, without any internal
/// lock held, right before the caller would go to sleep.
pub trait LocalLockPrimitive: Send + Sync {
    fn try_acquire(&self, file: &FileHandle, req: &LockRequest) -> AcquireOutcome;

    fn acquire_blocking(&self, file: &FileHandle, req: &LockRequest, on_block: &mut dyn FnMut()) -> AcquireOutcome;

    /// Interrupt waiters for exactly this region and drop any lock the
    /// owner holds in it.
    fn cancel(&self, file: &FileHandle, region: &LockRegion);

    /// Interrupt waiters for exactly this region, leaving held locks alone.
    fn interrupt(&self, file: &FileHandle, region: &LockRegion);

    fn unlock(&self, file: &FileHandle, region: &LockRegion);

    fn test(&self, file: &FileHandle, req: &LockRequest) -> Option<Holder>;

    fn share(&self, file: &FileHandle, reservation: ShareReservation) -> bool;

    fn unshare(&self, file: &FileHandle, owner: OwnerId);

    /// Drop every lock, share and waiter belonging to a remote host.
    fn release_client(&self, client: ClientId);

    fn has_remote_locks(&self, file: &FileHandle) -> bool;

    fn has_shares(&self, file: &FileHandle) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct HeldLock {
    owner: OwnerId,
    mode: LockMode,
    start: u64,
    end: u64, // inclusive, u64::MAX for EOF
}

impl HeldLock {
    fn from_request(req: &LockRequest) -> Self {
        HeldLock {
            owner: req.region.owner,
            mode: req.mode,
            start: req.region.offset,
            end: req.region.end(),
        }
    }

    fn conflicts_with(&self, other: &HeldLock) -> bool {
        self.owner != other.owner
            && self.mode.conflicts_with(other.mode)
            && ranges_overlap(self.start, self.end, other.start, other.end)
    }

    fn holder(&self) -> Holder {
        Holder {
            owner: self.owner,
            exclusive: self.mode == LockMode::Exclusive,
            offset: self.start,
            length: if self.end == u64::MAX { 0 } else { self.end - self.start + 1 },
        }
    }
}

struct Waiter {
    id: u64,
    file: FileHandle,
    lock: HeldLock,
    cancelled: bool,
}

#[derive(Default)]
struct TableState {
    locks: HashMap<FileHandle, Vec<HeldLock>>,
    shares: HashMap<FileHandle, Vec<ShareReservation>>,
    waiters: Vec<Waiter>,
    next_waiter: u64,
}

impl TableState {
    fn conflict(&self, file: &FileHandle, lock: &HeldLock) -> Option<HeldLock> {
        self.locks
            .get(file)?
            .iter()
            .find(|held| held.conflicts_with(lock))
            .copied()
    }

    fn lock_count(&self) -> usize {
        self.locks.values().map(Vec::len).sum()
    }

    /// Mark the owner's waiters for exactly `region` cancelled.
    fn interrupt(&mut self, file: &FileHandle, region: &LockRegion) -> usize {
        let mut hit = 0;
        for w in self.waiters.iter_mut() {
            if &w.file == file && w.lock.owner == region.owner && w.lock.start == region.offset && w.lock.end == region.end() {
                w.cancelled = true;
                hit += 1;
            }
        }
        hit
    }

    /// Remove `[start, end]` from the owner's locks on `file`, splitting
    /// locks that straddle the boundaries.
    fn carve(&mut self, file: &FileHandle, owner: OwnerId, start: u64, end: u64) {
        let Some(held) = self.locks.get_mut(file) else {
            return;
        };

        let mut kept = Vec::with_capacity(held.len());
        for l in held.drain(..) {
            if l.owner != owner || !ranges_overlap(l.start, l.end, start, end) {
                kept.push(l);
                continue;
            }
            if l.start < start {
                kept.push(HeldLock { end: start - 1, ..l });
            }
            if l.end > end {
                kept.push(HeldLock { start: end + 1, ..l });
            }
        }
        *held = kept;

        if held.is_empty() {
            self.locks.remove(file);
        }
    }

    fn insert(&mut self, file: &FileHandle, lock: HeldLock) {
        self.carve(file, lock.owner, lock.start, lock.end);
        self.locks.entry(file.clone()).or_default().push(lock);
    }

    /// Would `lock` waiting on `file` close a cycle in the wait-for graph?
    fn would_deadlock(&self, file: &FileHandle, lock: &HeldLock) -> bool {
        let mut seen = HashSet::new();
        let mut stack: Vec<OwnerId> = self.blockers(file, lock);

        while let Some(owner) = stack.pop() {
            if owner == lock.owner {
                return true;
            }
            if !seen.insert(owner) {
                continue;
            }
            for w in self.waiters.iter().filter(|w| w.lock.owner == owner && !w.cancelled) {
                stack.extend(self.blockers(&w.file, &w.lock));
            }
        }
        false
    }

    fn blockers(&self, file: &FileHandle, lock: &HeldLock) -> Vec<OwnerId> {
        self.locks
            .get(file)
            .map(|held| {
                held.iter()
                    .filter(|h| h.conflicts_with(lock))
                    .map(|h| h.owner)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-process advisory lock table.
///
/// Conflict checks are linear in the number of locks on a file, which is
/// fine for the handful of locks a file normally carries.
pub struct MemoryLockTable {
    state: Mutex<TableState>,
    released: Condvar,
    max_locks: usize,
}

impl MemoryLockTable {
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(max_locks: usize) -> Self {
        MemoryLockTable {
            state: Mutex::new(TableState::default()),
            released: Condvar::new(),
            max_locks,
        }
    }

    fn state(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks currently held on `file`.
    pub fn holders(&self, file: &FileHandle) -> Vec<Holder> {
        self.state()
            .locks
            .get(file)
            .map(|held| held.iter().map(HeldLock::holder).collect())
            .unwrap_or_default()
    }

    pub fn waiter_count(&self) -> usize {
        self.state().waiters.iter().filter(|w| !w.cancelled).count()
    }

    fn grant(&self, state: &mut TableState, file: &FileHandle, lock: HeldLock) -> AcquireOutcome {
        if state.lock_count() >= self.max_locks {
            return AcquireOutcome::NoLocks;
        }
        state.insert(file, lock);
        AcquireOutcome::Granted
    }
}

impl Default for MemoryLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalLockPrimitive for MemoryLockTable {
    fn try_acquire(&self, file: &FileHandle, req: &LockRequest) -> AcquireOutcome {
        let lock = HeldLock::from_request(req);
        let mut state = self.state();
        if state.conflict(file, &lock).is_some() {
            return AcquireOutcome::WouldBlock;
        }
        self.grant(&mut state, file, lock)
    }

    fn acquire_blocking(&self, file: &FileHandle, req: &LockRequest, on_block: &mut dyn FnMut()) -> AcquireOutcome {
        let lock = HeldLock::from_request(req);
        let mut state = self.state();

        if state.conflict(file, &lock).is_none() {
            return self.grant(&mut state, file, lock);
        }
        if state.would_deadlock(file, &lock) {
            log::debug!("deadlock: {} waiting on {}", req.region, file);
            return AcquireOutcome::Deadlock;
        }

        let id = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.push(Waiter {
            id,
            file: file.clone(),
            lock,
            cancelled: false,
        });
        drop(state);

        on_block();

        let mut state = self.state();
        loop {
            let Some(pos) = state.waiters.iter().position(|w| w.id == id) else {
                return AcquireOutcome::Interrupted;
            };
            if state.waiters[pos].cancelled {
                state.waiters.remove(pos);
                return AcquireOutcome::Interrupted;
            }
            if state.conflict(file, &lock).is_none() {
                state.waiters.remove(pos);
                return self.grant(&mut state, file, lock);
            }
            state = self.released.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn cancel(&self, file: &FileHandle, region: &LockRegion) {
        let mut state = self.state();
        state.interrupt(file, region);
        state.carve(file, region.owner, region.offset, region.end());
        self.released.notify_all();
    }

    fn interrupt(&self, file: &FileHandle, region: &LockRegion) {
        if self.state().interrupt(file, region) > 0 {
            self.released.notify_all();
        }
    }

    fn unlock(&self, file: &FileHandle, region: &LockRegion) {
        self.state().carve(file, region.owner, region.offset, region.end());
        self.released.notify_all();
    }

    fn test(&self, file: &FileHandle, req: &LockRequest) -> Option<Holder> {
        self.state()
            .conflict(file, &HeldLock::from_request(req))
            .map(|l| l.holder())
    }

    fn share(&self, file: &FileHandle, reservation: ShareReservation) -> bool {
        let mut state = self.state();
        let shares = state.shares.entry(file.clone()).or_default();
        if shares.iter().any(|s| s.conflicts_with(&reservation)) {
            return false;
        }
        shares.retain(|s| s.owner != reservation.owner);
        shares.push(reservation);
        true
    }

    fn unshare(&self, file: &FileHandle, owner: OwnerId) {
        let mut state = self.state();
        if let Some(shares) = state.shares.get_mut(file) {
            shares.retain(|s| s.owner != owner);
            if shares.is_empty() {
                state.shares.remove(file);
            }
        }
    }

    fn release_client(&self, client: ClientId) {
        let mut state = self.state();
        state.locks.retain(|_, held| {
            held.retain(|l| l.owner.client != client);
            !held.is_empty()
        });
        state.shares.retain(|_, shares| {
            shares.retain(|s| s.owner.client != client);
            !shares.is_empty()
        });
        for w in state.waiters.iter_mut().filter(|w| w.lock.owner.client == client) {
            w.cancelled = true;
        }
        self.released.notify_all();
    }

    fn has_remote_locks(&self, file: &FileHandle) -> bool {
        self.state().locks.contains_key(file)
    }

    fn has_shares(&self, file: &FileHandle) -> bool {
        self.state().shares.contains_key(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn file() -> FileHandle {
        FileHandle::new(vec![1])
    }

    fn req(client: u32, pid: u32, offset: u64, length: u64, mode: LockMode) -> LockRequest {
        LockRequest::new(LockRegion::new(OwnerId::new(client, pid), offset, length), mode)
    }

    #[test]
    fn test_lock_basic() {
        let table = MemoryLockTable::new();
        let lock = req(1, 100, 0, 100, LockMode::Exclusive);

        assert_eq!(table.try_acquire(&file(), &lock), AcquireOutcome::Granted);

        // Same owner can reacquire
        assert_eq!(table.try_acquire(&file(), &lock), AcquireOutcome::Granted);
        assert_eq!(table.holders(&file()).len(), 1);
    }

    #[test]
    fn test_lock_conflict() {
        let table = MemoryLockTable::new();
        assert_eq!(table.try_acquire(&file(), &req(1, 100, 0, 100, LockMode::Exclusive)), AcquireOutcome::Granted);
        assert_eq!(table.try_acquire(&file(), &req(2, 200, 50, 100, LockMode::Exclusive)), AcquireOutcome::WouldBlock);

        let holder = table.test(&file(), &req(2, 200, 50, 100, LockMode::Shared)).unwrap();
        assert_eq!(holder.owner, OwnerId::new(1, 100));
        assert!(holder.exclusive);
        assert_eq!((holder.offset, holder.length), (0, 100));
    }

    #[test]
    fn test_shared_locks() {
        let table = MemoryLockTable::new();
        assert_eq!(table.try_acquire(&file(), &req(1, 100, 0, 100, LockMode::Shared)), AcquireOutcome::Granted);
        assert_eq!(table.try_acquire(&file(), &req(2, 200, 50, 100, LockMode::Shared)), AcquireOutcome::Granted);
    }

    #[test]
    fn test_unlock() {
        let table = MemoryLockTable::new();
        let lock = req(1, 100, 0, 100, LockMode::Exclusive);
        assert_eq!(table.try_acquire(&file(), &lock), AcquireOutcome::Granted);
        table.unlock(&file(), &lock.region);
        assert!(!table.has_remote_locks(&file()));

        // Should be able to acquire now
        assert_eq!(table.try_acquire(&file(), &req(2, 200, 0, 100, LockMode::Exclusive)), AcquireOutcome::Granted);
    }

    #[test]
    fn test_unlock_splits_range() {
        let table = MemoryLockTable::new();
        table.try_acquire(&file(), &req(1, 1, 0, 100, LockMode::Exclusive));
        table.unlock(&file(), &LockRegion::new(OwnerId::new(1, 1), 40, 20));

        let mut held: Vec<(u64, u64)> = table.holders(&file()).iter().map(|h| (h.offset, h.length)).collect();
        held.sort();
        assert_eq!(held, vec![(0, 40), (60, 40)]);
    }

    #[test]
    fn test_blocking_acquire_wakes_on_unlock() {
        let table = Arc::new(MemoryLockTable::new());
        let holder = req(1, 1, 0, 100, LockMode::Exclusive);
        table.try_acquire(&file(), &holder);

        let (tx, rx) = mpsc::channel();
        let t = Arc::clone(&table);
        let worker = thread::spawn(move || {
            let mut on_block = || tx.send(()).unwrap();
            t.acquire_blocking(&file(), &req(2, 2, 0, 100, LockMode::Exclusive), &mut on_block)
        });

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        table.unlock(&file(), &holder.region);
        assert_eq!(worker.join().unwrap(), AcquireOutcome::Granted);
        assert_eq!(table.holders(&file())[0].owner, OwnerId::new(2, 2));
    }

    #[test]
    fn test_cancel_interrupts_waiter() {
        let table = Arc::new(MemoryLockTable::new());
        table.try_acquire(&file(), &req(1, 1, 0, 100, LockMode::Exclusive));

        let (tx, rx) = mpsc::channel();
        let t = Arc::clone(&table);
        let waiting = req(2, 2, 0, 100, LockMode::Exclusive);
        let worker = thread::spawn(move || {
            let mut on_block = || tx.send(()).unwrap();
            t.acquire_blocking(&file(), &waiting, &mut on_block)
        });

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        table.cancel(&file(), &waiting.region);
        assert_eq!(worker.join().unwrap(), AcquireOutcome::Interrupted);
        assert_eq!(table.waiter_count(), 0);
    }

    #[test]
    fn test_interrupt_keeps_held_locks() {
        let table = Arc::new(MemoryLockTable::new());
        table.try_acquire(&file(), &req(1, 1, 0, 100, LockMode::Exclusive));
        // Owner 2 already holds part of the range it waits for
        table.try_acquire(&file(), &req(2, 2, 200, 10, LockMode::Exclusive));

        let (tx, rx) = mpsc::channel();
        let t = Arc::clone(&table);
        let waiting = req(2, 2, 0, 0, LockMode::Exclusive);
        let worker = thread::spawn(move || {
            let mut on_block = || tx.send(()).unwrap();
            t.acquire_blocking(&file(), &waiting, &mut on_block)
        });

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        table.interrupt(&file(), &waiting.region);
        assert_eq!(worker.join().unwrap(), AcquireOutcome::Interrupted);
        assert_eq!(table.holders(&file()).len(), 2);
    }

    #[test]
    fn test_deadlock_detected() {
        let table = Arc::new(MemoryLockTable::new());
        let a = FileHandle::new(vec![0xa]);
        let b = FileHandle::new(vec![0xb]);
        table.try_acquire(&a, &req(1, 1, 0, 10, LockMode::Exclusive));
        table.try_acquire(&b, &req(2, 2, 0, 10, LockMode::Exclusive));

        // Owner 1 waits for b
        let (tx, rx) = mpsc::channel();
        let t = Arc::clone(&table);
        let b2 = b.clone();
        let worker = thread::spawn(move || {
            let mut on_block = || tx.send(()).unwrap();
            t.acquire_blocking(&b2, &req(1, 1, 0, 10, LockMode::Exclusive), &mut on_block)
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Owner 2 waiting for a would close the cycle
        let mut never = || panic!("must not block");
        assert_eq!(
            table.acquire_blocking(&a, &req(2, 2, 0, 10, LockMode::Exclusive), &mut never),
            AcquireOutcome::Deadlock
        );

        table.release_client(ClientId(2));
        assert_eq!(worker.join().unwrap(), AcquireOutcome::Granted);
    }

    #[test]
    fn test_share_reservations() {
        let table = MemoryLockTable::new();
        let deny_write = ShareReservation { owner: OwnerId::new(1, 1), access: 1, deny: 2 };
        let writer = ShareReservation { owner: OwnerId::new(2, 2), access: 2, deny: 0 };
        let reader = ShareReservation { owner: OwnerId::new(3, 3), access: 1, deny: 0 };

        assert!(table.share(&file(), deny_write));
        assert!(!table.share(&file(), writer.clone()));
        assert!(table.share(&file(), reader));
        assert!(table.has_shares(&file()));

        table.unshare(&file(), OwnerId::new(1, 1));
        assert!(table.share(&file(), writer));
    }

    #[test]
    fn test_capacity_limit() {
        let table = MemoryLockTable::with_capacity(1);
        assert_eq!(table.try_acquire(&file(), &req(1, 1, 0, 10, LockMode::Shared)), AcquireOutcome::Granted);
        assert_eq!(table.try_acquire(&file(), &req(2, 2, 0, 10, LockMode::Shared)), AcquireOutcome::NoLocks);
    }
}

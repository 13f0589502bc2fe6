//! The file table: one `FileLockRegistry` per file with outstanding state.
//!
//! Lock order is always file-table lock first, then a per-file lock. The
//! file-table lock is never held while waiting on anything.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::block::{BlockEntry, BlockState};
use crate::config::LimitsConfig;
use crate::error::Result;
use crate::logging::{trace, DiagnosticsHook, LogLevel};
use crate::metrics::LockdMetrics;
use crate::primitive::LocalLockPrimitive;
use crate::region::{ClientId, FileHandle, LockRegion, OwnerId};
use crate::registry::FileLockRegistry;
use crate::store::FileStore;

pub struct FileRegistry {
    files: Mutex<HashMap<FileHandle, Arc<FileLockRegistry>>>,
    store: Arc<dyn FileStore>,
    locks: Arc<dyn LocalLockPrimitive>,
    max_blocks_per_file: usize,
    hook: Arc<dyn DiagnosticsHook>,
    metrics: LockdMetrics,
}

impl FileRegistry {
    pub fn new(
        store: Arc<dyn FileStore>,
        locks: Arc<dyn LocalLockPrimitive>,
        limits: &LimitsConfig,
        hook: Arc<dyn DiagnosticsHook>,
        metrics: LockdMetrics,
    ) -> Arc<Self> {
        Arc::new(FileRegistry {
            files: Mutex::new(HashMap::new()),
            store,
            locks,
            max_blocks_per_file: limits.max_blocks_per_file,
            hook,
            metrics,
        })
    }

    fn files(&self) -> MutexGuard<'_, HashMap<FileHandle, Arc<FileLockRegistry>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn locks(&self) -> &Arc<dyn LocalLockPrimitive> {
        &self.locks
    }

    pub fn hook(&self) -> &Arc<dyn DiagnosticsHook> {
        &self.hook
    }

    /// Find or create the entry for `fh` and take a hold on it.
    ///
    /// A new entry pins the file in the store once for as long as the entry
    /// exists; a handle the store cannot resolve yields `StaleHandle`.
    pub fn acquire(self: &Arc<Self>, fh: &FileHandle) -> Result<FileRef> {
        let mut files = self.files();
        let entry = match files.get(fh) {
            Some(entry) => Arc::clone(entry),
            None => {
                self.store.hold(fh)?;
                let entry = Arc::new(FileLockRegistry::new(
                    fh.clone(),
                    self.max_blocks_per_file,
                    Arc::clone(&self.hook),
                ));
                files.insert(fh.clone(), Arc::clone(&entry));
                trace(self.hook.as_ref(), "files", LogLevel::Debug, || format!("new file entry {}", fh));
                entry
            }
        };
        entry.lock().hold();
        drop(files);

        Ok(FileRef {
            registry: Arc::clone(self),
            entry,
        })
    }

    /// Existing entry for `fh`, without taking a hold.
    pub fn lookup(&self, fh: &FileHandle) -> Option<Arc<FileLockRegistry>> {
        self.files().get(fh).cloned()
    }

    pub fn len(&self) -> usize {
        self.files().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files().is_empty()
    }

    fn release(&self, entry: &Arc<FileLockRegistry>) {
        let mut files = self.files();
        {
            let mut guard = entry.lock();
            if let Err(e) = guard.unhold() {
                log::error!("{}", e);
            }
        }
        self.reclaim_if_idle(&mut files, entry);
    }

    /// Drop `entry` from the table when nothing refers to it any more.
    /// Called with the file-table lock held.
    fn reclaim_if_idle(&self, files: &mut HashMap<FileHandle, Arc<FileLockRegistry>>, entry: &Arc<FileLockRegistry>) -> bool {
        let fh = entry.file();
        {
            let guard = entry.lock();
            if guard.refcount() > 0 || !guard.is_empty() {
                return false;
            }
        }
        if self.locks.has_remote_locks(fh) || self.locks.has_shares(fh) {
            return false;
        }
        if !files.get(fh).is_some_and(|e| Arc::ptr_eq(e, entry)) {
            return false;
        }

        files.remove(fh);
        self.store.release(fh);
        self.metrics.record_file_reclaimed();
        trace(self.hook.as_ref(), "files", LogLevel::Debug, || format!("reclaimed {}", fh));
        true
    }

    /// Free every entry with no holds, no blocked requests and no locks or
    /// share reservations left in the local primitive.
    pub fn reclaim_idle(&self) -> usize {
        let mut files = self.files();
        let candidates: Vec<Arc<FileLockRegistry>> = files.values().cloned().collect();
        candidates
            .iter()
            .filter(|entry| self.reclaim_if_idle(&mut files, entry))
            .count()
    }

    /// Tear down every blocked request of one owner. Requests still waiting
    /// in the local primitive are interrupted there as well.
    ///
    /// Returns once no granted callback for the owner can still go out.
    pub fn release_all_for_owner(&self, owner: OwnerId) -> usize {
        self.release_all_where(|e| e.region.owner == owner)
    }

    /// Tear down every blocked request of a remote host.
    pub fn release_all_for_client(&self, client: ClientId) -> usize {
        self.release_all_where(|e| e.region.owner.client == client)
    }

    fn release_all_where<F>(&self, pred: F) -> usize
    where
        F: Fn(&BlockEntry) -> bool,
    {
        let mut released = 0;
        let mut busy = Vec::new();
        {
            let mut files = self.files();
            let entries: Vec<Arc<FileLockRegistry>> = files.values().cloned().collect();
            for entry in &entries {
                let mut guard = entry.lock();
                let waiting: Vec<LockRegion> = guard
                    .entries()
                    .filter(|(_, e)| e.state != BlockState::Granted && pred(e))
                    .map(|(_, e)| e.region)
                    .collect();
                released += guard.release_matching(&pred);
                for region in &waiting {
                    self.locks.interrupt(entry.file(), region);
                }
                if guard.any_in_flight(&pred) {
                    busy.push(Arc::clone(entry));
                }
            }
            for entry in &entries {
                self.reclaim_if_idle(&mut files, entry);
            }
        }

        // Callbacks already on the wire finish and remove their entry.
        for entry in busy {
            let mut guard = entry.lock();
            while guard.any_in_flight(&pred) {
                guard = guard.wait();
            }
        }

        if released > 0 {
            log::info!("released {} blocked request(s)", released);
        }
        released
    }
}

/// A hold on one file's entry; released on drop.
pub struct FileRef {
    registry: Arc<FileRegistry>,
    entry: Arc<FileLockRegistry>,
}

impl FileRef {
    pub fn handle(&self) -> &FileHandle {
        self.entry.file()
    }

    pub fn blocks(&self) -> &FileLockRegistry {
        &self.entry
    }

    pub fn entry(&self) -> &Arc<FileLockRegistry> {
        &self.entry
    }
}

impl Clone for FileRef {
    fn clone(&self) -> Self {
        self.entry.lock().hold();
        FileRef {
            registry: Arc::clone(&self.registry),
            entry: Arc::clone(&self.entry),
        }
    }
}

impl Drop for FileRef {
    fn drop(&mut self) {
        self.registry.release(&self.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockdConfig;
    use crate::logging::NullDiagnostics;
    use crate::primitive::{AcquireOutcome, LockRequest, MemoryLockTable};
    use std::sync::mpsc;
    use std::thread;
    use crate::region::{LockMode, LockRegion, RequestId};
    use crate::store::MemoryFileStore;
    use crate::LockdError;

    struct Fixture {
        store: Arc<MemoryFileStore>,
        locks: Arc<MemoryLockTable>,
        files: Arc<FileRegistry>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryFileStore::new());
        store.export(fh(1));
        store.export(fh(2));
        let locks = Arc::new(MemoryLockTable::new());
        let files = FileRegistry::new(
            store.clone(),
            locks.clone(),
            &LockdConfig::testing().limits,
            Arc::new(NullDiagnostics),
            LockdMetrics::new(),
        );
        Fixture { store, locks, files }
    }

    fn fh(n: u8) -> FileHandle {
        FileHandle::new(vec![n])
    }

    fn region(client: u32, pid: u32) -> LockRegion {
        LockRegion::new(OwnerId::new(client, pid), 0, 100)
    }

    #[test]
    fn test_one_store_pin_per_file() {
        let f = fixture();
        let a = f.files.acquire(&fh(1)).unwrap();
        let b = f.files.acquire(&fh(1)).unwrap();
        assert_eq!(f.store.holds(&fh(1)), 1);
        assert_eq!(a.blocks().lock().refcount(), 2);

        drop(a);
        assert_eq!(f.files.len(), 1);
        drop(b);
        assert!(f.files.is_empty());
        assert_eq!(f.store.holds(&fh(1)), 0);
    }

    #[test]
    fn test_stale_handle() {
        let f = fixture();
        let err = f.files.acquire(&fh(9)).err().unwrap();
        assert!(matches!(err, LockdError::StaleHandle(_)));
        assert!(f.files.is_empty());
    }

    #[test]
    fn test_entries_keep_file_alive() {
        let f = fixture();
        let file = f.files.acquire(&fh(1)).unwrap();
        let h = file
            .blocks()
            .lock()
            .add(region(1, 1), LockMode::Exclusive, RequestId::from_xid(1))
            .unwrap();
        drop(file);
        assert_eq!(f.files.len(), 1);

        let file = f.files.acquire(&fh(1)).unwrap();
        file.blocks().lock().remove(h).unwrap();
        drop(file);
        assert!(f.files.is_empty());
    }

    #[test]
    fn test_remote_locks_keep_file_until_sweep() {
        let f = fixture();
        let file = f.files.acquire(&fh(2)).unwrap();
        let req = LockRequest::new(region(1, 1), LockMode::Shared);
        f.locks.try_acquire(&fh(2), &req);
        drop(file);
        assert_eq!(f.files.len(), 1);
        assert_eq!(f.files.reclaim_idle(), 0);

        f.locks.unlock(&fh(2), &req.region);
        assert_eq!(f.files.reclaim_idle(), 1);
        assert!(f.files.lookup(&fh(2)).is_none());
    }

    #[test]
    fn test_release_all_for_client() {
        let f = fixture();
        {
            let a = f.files.acquire(&fh(1)).unwrap();
            let b = f.files.acquire(&fh(2)).unwrap();
            let mut ga = a.blocks().lock();
            ga.add(region(1, 1), LockMode::Exclusive, RequestId::from_xid(1)).unwrap();
            ga.add(region(2, 1), LockMode::Exclusive, RequestId::from_xid(2)).unwrap();
            drop(ga);
            b.blocks().lock().add(region(1, 7), LockMode::Shared, RequestId::from_xid(3)).unwrap();
        }

        assert_eq!(f.files.release_all_for_client(ClientId(1)), 2);
        // fh(2) had only client 1's entry
        assert_eq!(f.files.len(), 1);
        assert_eq!(f.files.lookup(&fh(1)).unwrap().lock().len(), 1);

        assert_eq!(f.files.release_all_for_owner(OwnerId::new(2, 1)), 1);
        assert!(f.files.is_empty());
        assert_eq!(f.store.total_holds(), 0);
    }

    #[test]
    fn test_release_interrupts_waiting_request() {
        let f = fixture();
        let holder = LockRequest::new(region(3, 1), LockMode::Exclusive);
        assert_eq!(f.locks.try_acquire(&fh(1), &holder), AcquireOutcome::Granted);

        let file = f.files.acquire(&fh(1)).unwrap();
        let waiting = LockRequest::new(region(1, 1), LockMode::Exclusive);
        file.blocks()
            .lock()
            .add(waiting.region, waiting.mode, RequestId::from_xid(1))
            .unwrap();

        let locks = Arc::clone(&f.locks);
        let (tx, rx) = mpsc::channel();
        let worker = thread::spawn(move || {
            locks.acquire_blocking(&fh(1), &waiting, &mut || {
                let _ = tx.send(());
            })
        });
        rx.recv().unwrap();

        assert_eq!(f.files.release_all_for_owner(OwnerId::new(1, 1)), 1);
        assert_eq!(worker.join().unwrap(), AcquireOutcome::Interrupted);
        assert_eq!(f.locks.waiter_count(), 0);

        // The holder's lock is untouched; releasing it grants nothing
        assert_eq!(f.locks.holders(&fh(1)).len(), 1);
        f.locks.unlock(&fh(1), &holder.region);
        assert!(f.locks.holders(&fh(1)).is_empty());
        drop(file);
        assert!(f.files.is_empty());
    }

    #[test]
    fn test_release_waits_for_in_flight_callback() {
        let f = fixture();
        let file = f.files.acquire(&fh(1)).unwrap();
        let h = {
            let mut g = file.blocks().lock();
            let h = g.add(region(1, 1), LockMode::Exclusive, RequestId::from_xid(1)).unwrap();
            let e = g.get_mut(h).unwrap();
            e.mark_blocked().unwrap();
            e.mark_granted().unwrap();
            e.in_flight = true;
            h
        };

        let sender = file.clone();
        let worker = std::thread::spawn(move || {
            let mut g = sender.blocks().lock();
            while !g.get(h).unwrap().suppress_callback {
                g = g.wait();
            }
            g.get_mut(h).unwrap().in_flight = false;
            g.remove(h);
        });

        assert_eq!(f.files.release_all_for_client(ClientId(1)), 1);
        assert!(file.blocks().lock().get(h).is_none());
        worker.join().unwrap();
    }
}

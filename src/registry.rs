//! Per-file tracking of outstanding blocking lock requests.
//!
//! Every operation goes through a `BlockGuard`, which only exists while the
//! per-file mutex is held. Entries live in a slab arena and are referred to
//! by `BlockHandle`s; `order` keeps the handles of matchable entries in
//! insertion order.

use slab::Slab;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::block::{BlockEntry, BlockHandle, BlockState};
use crate::error::{LockdError, Result};
use crate::logging::{trace, DiagnosticsHook, LogLevel};
use crate::region::{FileHandle, LockMode, LockRegion, Overlap, RequestId};

/// How an incoming request relates to the entries already tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum MatchResult {
    None,
    /// Same owner, same region, same request id
    Retransmit,
    /// Same owner and region, different request id
    FullMatch,
    /// Same owner, regions intersect but differ
    PartialOverlap,
}

pub struct FileLockRegistry {
    file: FileHandle,
    table: Mutex<BlockTable>,
    changed: Condvar,
    hook: Arc<dyn DiagnosticsHook>,
}

struct BlockTable {
    entries: Slab<BlockEntry>,
    order: Vec<BlockHandle>,
    next_serial: u64,
    /// Holds on the owning `FileEntry`: one per live caller plus one per entry.
    refcount: usize,
    max_entries: usize,
}

impl FileLockRegistry {
    pub fn new(file: FileHandle, max_entries: usize, hook: Arc<dyn DiagnosticsHook>) -> Self {
        FileLockRegistry {
            file,
            table: Mutex::new(BlockTable {
                entries: Slab::new(),
                order: Vec::new(),
                next_serial: 1,
                refcount: 0,
                max_entries,
            }),
            changed: Condvar::new(),
            hook,
        }
    }

    pub fn file(&self) -> &FileHandle {
        &self.file
    }

    /// Take the per-file lock.
    pub fn lock(&self) -> BlockGuard<'_> {
        BlockGuard {
            registry: self,
            table: self.table.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Proof that the per-file lock is held.
pub struct BlockGuard<'a> {
    registry: &'a FileLockRegistry,
    table: MutexGuard<'a, BlockTable>,
}

impl<'a> BlockGuard<'a> {
    pub fn file(&self) -> &FileHandle {
        &self.registry.file
    }

    pub fn hook(&self) -> &dyn DiagnosticsHook {
        self.registry.hook.as_ref()
    }

    /// Number of entries still allocated, including detached ones.
    pub fn len(&self) -> usize {
        self.table.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.entries.is_empty()
    }

    pub fn refcount(&self) -> usize {
        self.table.refcount
    }

    pub(crate) fn hold(&mut self) {
        self.table.refcount += 1;
    }

    pub(crate) fn unhold(&mut self) -> Result<()> {
        if self.table.refcount == 0 {
            debug_assert!(false, "file reference count underflow");
            return Err(LockdError::InvariantViolation(format!(
                "reference count underflow on {}",
                self.registry.file
            )));
        }
        self.table.refcount -= 1;
        Ok(())
    }

    /// Register a new entry in `Pending` state. The entry pins the file
    /// until it is removed.
    pub fn add(&mut self, region: LockRegion, mode: LockMode, request_id: RequestId) -> Result<BlockHandle> {
        let table = &mut *self.table;
        if table.entries.len() >= table.max_entries {
            return Err(LockdError::ResourceExhausted {
                file: self.registry.file.clone(),
                limit: table.max_entries,
            });
        }

        let duplicate = table.order.iter().any(|h| {
            table.entries[h.key].region.compare(&region) == Overlap::Exact
        });
        if duplicate {
            debug_assert!(false, "duplicate block entry for {}", region);
            return Err(LockdError::InvariantViolation(format!(
                "block entry for {} already exists on {}",
                region, self.registry.file
            )));
        }

        let serial = table.next_serial;
        table.next_serial += 1;
        let key = table.entries.insert(BlockEntry::new(region, mode, request_id, serial));
        let handle = BlockHandle { key, serial };
        table.order.push(handle);
        table.refcount += 1;

        trace(self.registry.hook.as_ref(), "registry", LogLevel::Debug, || {
            format!("add {} on {} (serial {})", region, self.registry.file, serial)
        });
        Ok(handle)
    }

    /// Remove an entry and drop its pin on the file. Returns `None` for a
    /// handle whose entry is already gone.
    pub fn remove(&mut self, handle: BlockHandle) -> Option<BlockEntry> {
        if !self.contains(handle) {
            return None;
        }
        let table = &mut *self.table;
        let entry = table.entries.remove(handle.key);
        table.order.retain(|h| *h != handle);
        table.refcount = table.refcount.saturating_sub(1);
        self.registry.changed.notify_all();

        trace(self.registry.hook.as_ref(), "registry", LogLevel::Debug, || {
            format!("remove {} ({:?}) on {}", entry.region, entry.state, self.registry.file)
        });
        Some(entry)
    }

    pub fn contains(&self, handle: BlockHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: BlockHandle) -> Option<&BlockEntry> {
        self.table
            .entries
            .get(handle.key)
            .filter(|e| e.serial == handle.serial)
    }

    pub fn get_mut(&mut self, handle: BlockHandle) -> Option<&mut BlockEntry> {
        self.table
            .entries
            .get_mut(handle.key)
            .filter(|e| e.serial == handle.serial)
    }

    /// Matchable entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (BlockHandle, &BlockEntry)> + '_ {
        self.table
            .order
            .iter()
            .map(move |h| (*h, &self.table.entries[h.key]))
    }

    /// Look for an earlier request this one repeats or intersects.
    ///
    /// An exact region with the same request id wins immediately. Otherwise
    /// the last exact region is a full match, and failing that the last
    /// overlapping region is a partial match.
    pub fn find_match(&self, region: &LockRegion, request_id: &RequestId) -> (MatchResult, Option<BlockHandle>) {
        let mut full = None;
        let mut partial = None;

        for (handle, entry) in self.entries() {
            match entry.region.compare(region) {
                Overlap::Exact if entry.request_id == *request_id => {
                    return (MatchResult::Retransmit, Some(handle));
                }
                Overlap::Exact => full = Some(handle),
                Overlap::Partial => partial = Some(handle),
                Overlap::Disjoint => {}
            }
        }

        match (full, partial) {
            (Some(h), _) => (MatchResult::FullMatch, Some(h)),
            (None, Some(h)) => (MatchResult::PartialOverlap, Some(h)),
            (None, None) => (MatchResult::None, None),
        }
    }

    /// Suppress the granted callback of every entry of the same owner that
    /// overlaps `region`.
    ///
    /// Granted entries are removed on the spot, or detached from matching
    /// when a callback is on the wire; the sender removes those once its
    /// call returns. Pending and blocked entries stay with their worker.
    /// Returns the number of entries suppressed.
    pub fn cancel_granted_overlapping(&mut self, region: &LockRegion) -> usize {
        let targets: Vec<BlockHandle> = self
            .entries()
            .filter(|(_, e)| e.region.compare(region) != Overlap::Disjoint)
            .map(|(h, _)| h)
            .collect();

        for handle in &targets {
            self.suppress(*handle);
        }

        if !targets.is_empty() {
            self.registry.changed.notify_all();
            trace(self.registry.hook.as_ref(), "registry", LogLevel::Debug, || {
                format!("suppressed {} callback(s) overlapping {}", targets.len(), region)
            });
        }
        targets.len()
    }

    /// Suppress and release every entry, matchable or detached, accepted by
    /// `pred`. Returns how many were touched.
    pub fn release_matching<F>(&mut self, pred: F) -> usize
    where
        F: Fn(&BlockEntry) -> bool,
    {
        let targets: Vec<BlockHandle> = self
            .table
            .entries
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(key, e)| BlockHandle { key, serial: e.serial })
            .collect();

        for handle in &targets {
            if let Some(entry) = self.get_mut(*handle) {
                entry.suppress_callback = true;
            }
            if self.get(*handle).is_some_and(|e| e.in_flight) {
                self.detach(*handle);
            } else {
                self.remove(*handle);
            }
        }

        self.registry.changed.notify_all();
        targets.len()
    }

    /// True while any entry accepted by `pred` has a callback on the wire.
    pub fn any_in_flight<F>(&self, pred: F) -> bool
    where
        F: Fn(&BlockEntry) -> bool,
    {
        self.table.entries.iter().any(|(_, e)| e.in_flight && pred(e))
    }

    fn suppress(&mut self, handle: BlockHandle) {
        let Some(entry) = self.get_mut(handle) else {
            return;
        };
        entry.suppress_callback = true;
        if entry.state != BlockState::Granted {
            return;
        }
        if entry.in_flight {
            self.detach(handle);
        } else {
            self.remove(handle);
        }
    }

    /// Hide an entry from matching without freeing it.
    fn detach(&mut self, handle: BlockHandle) {
        self.table.order.retain(|h| *h != handle);
    }

    pub fn notify(&self) {
        self.registry.changed.notify_all();
    }

    /// Release the per-file lock until another thread changes the table.
    pub fn wait(self) -> Self {
        let BlockGuard { registry, table } = self;
        let table = registry.changed.wait(table).unwrap_or_else(PoisonError::into_inner);
        BlockGuard { registry, table }
    }

    /// Like `wait`, bounded by `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Self {
        let BlockGuard { registry, table } = self;
        let (table, _) = registry
            .changed
            .wait_timeout(table, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        BlockGuard { registry, table }
    }

    /// One line per entry: state, suppress flag, range, pid and request id.
    pub fn dump(&self) -> Vec<String> {
        self.table
            .entries
            .iter()
            .map(|(key, e)| {
                format!(
                    "{}: [{:?} {} [off={} len={} mode={:?} pid={}] {}]",
                    key,
                    e.state,
                    if e.suppress_callback { "X" } else { " " },
                    e.region.offset,
                    e.region.length,
                    e.mode,
                    e.region.owner.pid,
                    e.request_id.short()
                )
            })
            .collect()
    }
}

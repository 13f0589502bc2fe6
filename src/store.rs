use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use crate::error::{LockdError, Result};
use crate::region::FileHandle;

/// Reference counting on the underlying file objects.
///
/// `hold` resolves a client file handle and pins the object it names;
/// it fails with `StaleHandle` when the handle no longer resolves.
pub trait FileStore: Send + Sync {
    fn hold(&self, fh: &FileHandle) -> Result<()>;
    fn release(&self, fh: &FileHandle);
}

/// Exported handles kept in memory, with pin counts per handle.
#[derive(Default)]
pub struct MemoryFileStore {
    exported: Mutex<HashSet<FileHandle>>,
    holds: Mutex<HashMap<FileHandle, usize>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(&self, fh: FileHandle) {
        self.exported.lock().unwrap_or_else(PoisonError::into_inner).insert(fh);
    }

    /// Make a handle stale. Existing pins stay until released.
    pub fn unexport(&self, fh: &FileHandle) {
        self.exported.lock().unwrap_or_else(PoisonError::into_inner).remove(fh);
    }

    pub fn holds(&self, fh: &FileHandle) -> usize {
        self.holds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fh)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_holds(&self) -> usize {
        self.holds.lock().unwrap_or_else(PoisonError::into_inner).values().sum()
    }
}

impl FileStore for MemoryFileStore {
    fn hold(&self, fh: &FileHandle) -> Result<()> {
        if !self.exported.lock().unwrap_or_else(PoisonError::into_inner).contains(fh) {
            return Err(LockdError::StaleHandle(fh.clone()));
        }
        *self.holds.lock().unwrap_or_else(PoisonError::into_inner).entry(fh.clone()).or_insert(0) += 1;
        Ok(())
    }

    fn release(&self, fh: &FileHandle) {
        let mut holds = self.holds.lock().unwrap_or_else(PoisonError::into_inner);
        match holds.get_mut(fh) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                holds.remove(fh);
            }
            None => log::warn!("release of unheld file {}", fh),
        }
    }
}

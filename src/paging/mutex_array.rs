//! Per-index mutex array
//!
//! One lightweight lock per page of a handler's range, so that concurrent
//! fills of the same page serialize while fills of different pages never
//! contend on a shared lock.

use parking_lot::{Mutex, MutexGuard};

/// Fixed-size array of mutexes indexed by local page offset
#[derive(Debug)]
pub struct MutexArray {
    mutexes: Box<[Mutex<()>]>,
}

impl MutexArray {
    /// Create an array of `len` unlocked mutexes
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            mutexes: (0..len).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Lock the mutex at `index`, released when the guard drops
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`; indices are local offsets into the
    /// owning handler's range.
    pub fn lock(&self, index: usize) -> MutexGuard<'_, ()> {
        self.mutexes[index].lock()
    }

    /// Try to lock without blocking
    #[must_use]
    pub fn try_lock(&self, index: usize) -> Option<MutexGuard<'_, ()>> {
        self.mutexes.get(index).and_then(Mutex::try_lock)
    }

    /// Number of mutexes
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutexes.len()
    }

    /// True if the array holds no mutexes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutexes.is_empty()
    }
}

//! Claims on per-thread shard indexes.
//!
//! A sweep task needs a shard of bins nobody else is writing to. It claims an
//! index here for its whole run and gives it back when the returned guard
//! drops.

use std::thread;

use parking_lot::Mutex;

pub struct IdxClaims {
    flags: Mutex<Vec<bool>>,
}

impl IdxClaims {
    pub fn new(count: usize) -> Self {
        IdxClaims {
            flags: Mutex::new(vec![false; count]),
        }
    }

    pub fn len(&self) -> usize {
        self.flags.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim the lowest free index, if any.
    pub fn try_acquire(&self) -> Option<AcquireIdxScope<'_>> {
        let mut flags = self.flags.lock();
        let idx = flags.iter().position(|&claimed| !claimed)?;
        flags[idx] = true;
        Some(AcquireIdxScope { claims: self, idx })
    }

    /// Claim an index, yielding until one is free.
    pub fn acquire(&self) -> AcquireIdxScope<'_> {
        loop {
            if let Some(scope) = self.try_acquire() {
                return scope;
            }
            thread::yield_now();
        }
    }

    /// Number of indexes currently claimed.
    pub fn claimed(&self) -> usize {
        self.flags.lock().iter().filter(|&&claimed| claimed).count()
    }

    fn release(&self, idx: usize) {
        let mut flags = self.flags.lock();
        debug_assert!(flags[idx]);
        flags[idx] = false;
    }
}

/// A claimed shard index, released on drop.
pub struct AcquireIdxScope<'a> {
    claims: &'a IdxClaims,
    idx: usize,
}

impl AcquireIdxScope<'_> {
    pub fn idx(&self) -> usize {
        self.idx
    }
}

impl Drop for AcquireIdxScope<'_> {
    fn drop(&mut self) {
        self.claims.release(self.idx);
    }
}

//! The seam between the heap and the operating system's virtual memory.
//!
//! ## Types
//!
//! ### [`PageSource`](trait.PageSource.html)
//!
//! Everything the heap needs from the OS: fresh anonymous mappings, unmapping,
//! and resizing a mapping in place or by moving it.
//!
//! ### [`LibcPages`](struct.LibcPages.html)
//!
//! The production `PageSource`, calling `mmap`/`munmap`/`mremap` through libc.
//!
//! ### [`BudgetPages`](struct.BudgetPages.html)
//!
//! `LibcPages` with a byte budget and call counters. It fails mappings that
//! would exceed its budget, which makes out-of-memory paths testable.

use core::fmt;
use core::ptr::null_mut;

use errno::Errno;

use crate::params;

pub trait PageSource {
    type Err: fmt::Debug;

    /// Map `size` bytes of zeroed, read/write memory.
    ///
    /// # Safety
    ///
    /// `size` must be a non-zero multiple of the page size. The returned
    /// memory belongs to the caller until it is passed back to `unmap`.
    unsafe fn map(&mut self, size: usize) -> Result<*mut u8, Self::Err>;

    /// Return a mapping, or the tail of one, to the OS.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + size` must lie within a region returned by `map` or
    /// `remap`, and nothing may touch it afterwards.
    unsafe fn unmap(&mut self, ptr: *mut u8, size: usize) -> Result<(), Self::Err>;

    /// Resize a mapping. With `can_move` false the mapping must stay where it
    /// is or the call fails.
    ///
    /// # Safety
    ///
    /// `ptr` and `old_size` must describe a whole mapping returned by `map`.
    unsafe fn remap(
        &mut self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
        can_move: bool,
    ) -> Result<*mut u8, Self::Err>;
}

/// Uses virtual memory from libc.
#[derive(Default, Debug)]
pub struct LibcPages {
    // Just for tracking
    pub maps: usize,
    pub unmaps: usize,
    pub mapped: usize,
}

impl PageSource for LibcPages {
    type Err = Errno;

    unsafe fn map(&mut self, size: usize) -> Result<*mut u8, Errno> {
        let ptr = libc::mmap(
            null_mut(),
            size,
            libc::PROT_WRITE | libc::PROT_READ,
            // Anonymous and private: zero-filled memory nobody else sees.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }
        self.maps += 1;
        self.mapped += size;
        Ok(ptr as *mut u8)
    }

    unsafe fn unmap(&mut self, ptr: *mut u8, size: usize) -> Result<(), Errno> {
        if libc::munmap(ptr as *mut libc::c_void, size) != 0 {
            return Err(errno::errno());
        }
        self.unmaps += 1;
        self.mapped -= size;
        Ok(())
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe fn remap(
        &mut self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
        can_move: bool,
    ) -> Result<*mut u8, Errno> {
        let flags = if can_move { libc::MREMAP_MAYMOVE } else { 0 };
        let new = libc::mremap(ptr as *mut libc::c_void, old_size, new_size, flags);
        if new == libc::MAP_FAILED {
            return Err(errno::errno());
        }
        self.mapped = self.mapped + new_size - old_size;
        Ok(new as *mut u8)
    }

    // No mremap here; callers fall back to copying.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    unsafe fn remap(
        &mut self,
        _ptr: *mut u8,
        _old_size: usize,
        _new_size: usize,
        _can_move: bool,
    ) -> Result<*mut u8, Errno> {
        Err(Errno(libc::ENOMEM))
    }
}

/// Tell the OS the pages in `ptr..ptr + len` may be dropped.
///
/// # Safety
///
/// The range must be page aligned, mapped, and hold nothing worth keeping.
pub unsafe fn advise_free(ptr: *mut u8, len: usize) -> Result<(), Errno> {
    if libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_DONTNEED) != 0 {
        return Err(errno::errno());
    }
    Ok(())
}

/// Drop the whole pages strictly inside a free chunk at `chunk` of `size`
/// bytes, keeping `keep` bytes of header at its start. Returns the number of
/// bytes advised.
///
/// # Safety
///
/// `chunk..chunk + size` must be a free chunk no one reads past its header.
pub unsafe fn advise_chunk_interior(chunk: *mut u8, size: usize, keep: usize) -> usize {
    let start = params::page_align(chunk as usize + keep);
    let end = params::page_floor(chunk as usize + size);
    if end <= start {
        return 0;
    }
    match advise_free(start as *mut u8, end - start) {
        Ok(()) => end - start,
        Err(e) => {
            log::warn!("madvise({:#x}, {}) failed: {}", start, end - start, e);
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetError {
    Exhausted { requested: usize, available: usize },
    Os(Errno),
}

/// A `PageSource` that refuses to hold more than `budget` bytes at once.
#[derive(Debug)]
pub struct BudgetPages {
    inner: LibcPages,
    pub budget: usize,
    pub mapped: usize,
    pub maps: usize,
    pub unmaps: usize,
    pub remaps: usize,
}

impl BudgetPages {
    pub fn new(budget: usize) -> Self {
        BudgetPages {
            inner: LibcPages::default(),
            budget,
            mapped: 0,
            maps: 0,
            unmaps: 0,
            remaps: 0,
        }
    }

    fn check(&self, size: usize) -> Result<(), BudgetError> {
        let available = self.budget.saturating_sub(self.mapped);
        if size > available {
            return Err(BudgetError::Exhausted {
                requested: size,
                available,
            });
        }
        Ok(())
    }
}

impl PageSource for BudgetPages {
    type Err = BudgetError;

    unsafe fn map(&mut self, size: usize) -> Result<*mut u8, BudgetError> {
        self.check(size)?;
        let ptr = self.inner.map(size).map_err(BudgetError::Os)?;
        self.mapped += size;
        self.maps += 1;
        Ok(ptr)
    }

    unsafe fn unmap(&mut self, ptr: *mut u8, size: usize) -> Result<(), BudgetError> {
        self.inner.unmap(ptr, size).map_err(BudgetError::Os)?;
        self.mapped -= size;
        self.unmaps += 1;
        Ok(())
    }

    unsafe fn remap(
        &mut self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
        can_move: bool,
    ) -> Result<*mut u8, BudgetError> {
        if new_size > old_size {
            self.check(new_size - old_size)?;
        }
        let new = self
            .inner
            .remap(ptr, old_size, new_size, can_move)
            .map_err(BudgetError::Os)?;
        self.mapped = self.mapped + new_size - old_size;
        self.remaps += 1;
        Ok(new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn map_and_unmap() {
        let mut pages = LibcPages::default();
        let size = params::page_size() * 4;
        unsafe {
            let p = pages.map(size).unwrap();
            assert!(!p.is_null());
            assert_eq!(*p, 0);
            *p.add(size - 1) = 7;
            assert_eq!(pages.mapped, size);
            advise_free(p, size).unwrap();
            pages.unmap(p, size).unwrap();
        }
        assert_eq!(pages.maps, 1);
        assert_eq!(pages.unmaps, 1);
        assert_eq!(pages.mapped, 0);
    }

    #[test]
    fn budget_is_enforced() {
        let page = params::page_size();
        let mut pages = BudgetPages::new(page * 2);
        unsafe {
            let a = pages.map(page).unwrap();
            let b = pages.map(page).unwrap();
            match pages.map(page) {
                Err(BudgetError::Exhausted { available, .. }) => assert_eq!(available, 0),
                other => panic!("unexpected {:?}", other),
            }
            pages.unmap(a, page).unwrap();
            let c = pages.map(page).unwrap();
            pages.unmap(b, page).unwrap();
            pages.unmap(c, page).unwrap();
        }
        assert_eq!(pages.mapped, 0);
        assert_eq!(pages.maps, 3);
        assert_eq!(pages.unmaps, 3);
    }

    #[test]
    fn interior_advice_skips_partial_pages() {
        let page = params::page_size();
        let mut pages = LibcPages::default();
        unsafe {
            let p = pages.map(page * 4).unwrap();
            // Chunks start 8 bytes past an alignment boundary.
            let chunk = p.add(8);
            let advised = advise_chunk_interior(chunk, page * 3, 72);
            assert_eq!(advised, page * 2);
            assert_eq!(advise_chunk_interior(chunk, page, 72), 0);
            pages.unmap(p, page * 4).unwrap();
        }
    }
}

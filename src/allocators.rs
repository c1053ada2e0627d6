//! Thread-safe heap types.
//!
//! ## Basic Types
//!
//! ### [`RawHeap`](../heap/struct.RawHeap.html)
//!
//! A `RawHeap` is a single-threaded heap. It is `Send` but not `Sync`, so it
//! can be handed between threads but not shared.
//!
//! ### [`Heap`](struct.Heap.html)
//!
//! A `Heap` wraps `RawHeap` with a spin lock to make it thread-safe. It can be
//! built in a `static`: the `RawHeap` inside is only created, with its page
//! source's `Default`, on first use. Nothing on the allocation paths uses the
//! global allocator, so a `Heap` can serve as one:
//!
//! ```no_run
//! #[global_allocator]
//! static ALLOC: gc_heap::LibcHeap = gc_heap::LibcHeap::new();
//! ```
//!
//! ### [`LibcHeap`](type.LibcHeap.html)
//!
//! `Heap` over [`LibcPages`](../sys/struct.LibcPages.html), mapping memory
//! with `mmap`.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::MaybeUninit;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::{Mutex, MutexGuard};

use crate::check::{Stats, Validity};
use crate::chunk::MALLOC_ALIGNMENT;
use crate::config::{ConfigError, HeapConfig};
use crate::heap::RawHeap;
use crate::sys::{LibcPages, PageSource};

// Values of `Heap::init`.
const UNTOUCHED: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// A thread-safe heap, using a spin lock around a `RawHeap`.
///
/// The heap logs with its lock held. [`Heap::new`](#method.new) builds a
/// quiet heap; one built by `with_config` for use as the global allocator
/// needs [`HeapConfig::quiet`](../config/struct.HeapConfig.html#structfield.quiet)
/// unless the logger never allocates.
pub struct Heap<G: PageSource> {
    init: AtomicU8,
    config: HeapConfig,
    capacity: usize,
    raw: MaybeUninit<Mutex<RawHeap<G>>>,
}

/// The usual heap, backed by `mmap`.
pub type LibcHeap = Heap<LibcPages>;

impl<G: PageSource + Default> Default for Heap<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: PageSource> Heap<G> {
    /// A quiet heap with the default configuration that maps nothing until
    /// first used.
    pub const fn new() -> Self {
        Heap {
            init: AtomicU8::new(UNTOUCHED),
            config: HeapConfig {
                quiet: true,
                ..HeapConfig::new()
            },
            capacity: 0,
            raw: MaybeUninit::uninit(),
        }
    }

    /// A heap with `config` whose first use maps an initial segment of at
    /// least `capacity` bytes.
    pub fn with_config(config: HeapConfig, capacity: usize) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Heap {
            init: AtomicU8::new(UNTOUCHED),
            config,
            capacity,
            raw: MaybeUninit::uninit(),
        })
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }
}

impl<G: PageSource + Default> Heap<G> {
    /// Get a reference to the underlying RawHeap, creating it on first use.
    ///
    /// # Safety
    ///
    /// This is unsafe because it blocks allocation while the mutex guard is in
    /// place.
    pub unsafe fn get_raw(&self) -> MutexGuard<'_, RawHeap<G>> {
        let state = self.init.compare_exchange(
            UNTOUCHED,
            INITIALIZING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        match state {
            Err(READY) => {}
            Ok(UNTOUCHED) => {
                let raw = match RawHeap::with_capacity(self.config, G::default(), self.capacity) {
                    Ok(raw) => raw,
                    Err(e) => panic!("invalid heap configuration: {}", e),
                };
                let raw_mut = self.raw.as_ptr() as *mut Mutex<RawHeap<G>>;
                raw_mut.write(Mutex::new(raw));
                self.init.store(READY, Ordering::SeqCst);
                return (*raw_mut).lock();
            }
            Err(INITIALIZING) => loop {
                core::hint::spin_loop();
                match self.init.load(Ordering::SeqCst) {
                    INITIALIZING => continue,
                    READY => break,
                    state => panic!("Unexpected state {}", state),
                }
            },
            Ok(v) => panic!("Unexpected OK state loaded: {}", v),
            Err(v) => panic!("Unexpected Err state loaded: {}", v),
        }

        (*self.raw.as_ptr()).lock()
    }

    /// # Safety
    ///
    /// See [`RawHeap::allocate`](../heap/struct.RawHeap.html#method.allocate).
    pub unsafe fn allocate(&self, bytes: usize) -> *mut u8 {
        self.get_raw().allocate(bytes)
    }

    /// # Safety
    ///
    /// See [`RawHeap::free`](../heap/struct.RawHeap.html#method.free).
    pub unsafe fn free(&self, mem: *mut u8) {
        self.get_raw().free(mem)
    }

    /// # Safety
    ///
    /// See [`RawHeap::reallocate`](../heap/struct.RawHeap.html#method.reallocate).
    pub unsafe fn reallocate(&self, mem: *mut u8, bytes: usize) -> *mut u8 {
        self.get_raw().reallocate(mem, bytes)
    }

    /// # Safety
    ///
    /// `mem` must be null or a live payload of a heap in this crate.
    pub unsafe fn usable_size(mem: *mut u8) -> usize {
        RawHeap::<G>::usable_size(mem)
    }

    pub fn footprint(&self) -> usize {
        unsafe { self.get_raw().footprint() }
    }

    pub fn trim(&self, pad: usize) -> bool {
        unsafe { self.get_raw().trim(pad) }
    }

    /// Walk the whole heap. The walk collects into temporary `Vec`s, so
    /// this must not be called on the heap serving as the global allocator.
    pub fn stats(&self) -> (Validity, Stats) {
        unsafe { self.get_raw().stats() }
    }
}

impl<G: PageSource> Drop for Heap<G> {
    fn drop(&mut self) {
        if *self.init.get_mut() == READY {
            unsafe { core::ptr::drop_in_place(self.raw.as_mut_ptr()) };
        }
    }
}

unsafe impl<G: PageSource + Default + Send> GlobalAlloc for Heap<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MALLOC_ALIGNMENT {
            return null_mut();
        }
        self.allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > MALLOC_ALIGNMENT {
            return null_mut();
        }
        self.reallocate(ptr, new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    use test_env_log::test;

    #[test]
    fn created_on_first_use() {
        let heap = LibcHeap::with_config(HeapConfig::new(), 100 * 1024).unwrap();
        assert_eq!(heap.init.load(Ordering::SeqCst), UNTOUCHED);
        let fp = heap.footprint();
        assert_eq!(heap.init.load(Ordering::SeqCst), READY);
        // The initial segment is rounded up to the granularity.
        assert_eq!(fp, 112 * 1024);
        unsafe {
            let p = heap.allocate(1000);
            assert!(!p.is_null());
            assert_eq!(heap.footprint(), fp);
            heap.free(p);
        }
        assert!(heap.stats().0.is_valid());
    }

    #[test]
    fn static_heap_is_quiet() {
        static HEAP: LibcHeap = LibcHeap::new();
        assert!(HEAP.config().quiet);
        unsafe {
            let p = HEAP.allocate(100);
            assert!(!p.is_null());
            HEAP.free(p);
        }
        assert!(!LibcHeap::with_config(HeapConfig::new(), 0).unwrap().config().quiet);
    }

    #[test]
    fn bad_config_is_rejected_up_front() {
        let config = HeapConfig::new().with_granularity(5000);
        assert!(LibcHeap::with_config(config, 0).is_err());
    }

    #[test]
    fn global_alloc_layouts() {
        let heap = LibcHeap::new();
        unsafe {
            let layout = Layout::from_size_align(100, 8).unwrap();
            let p = heap.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % MALLOC_ALIGNMENT, 0);
            *p = 3;
            let q = heap.realloc(p, layout, 5000);
            assert_eq!(*q, 3);
            heap.dealloc(q, Layout::from_size_align(5000, 8).unwrap());

            let wide = Layout::from_size_align(64, 64).unwrap();
            assert!(heap.alloc(wide).is_null());
        }
        assert!(heap.stats().0.is_valid());
    }

    #[test]
    fn shared_between_threads() {
        let heap = Arc::new(LibcHeap::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let heap = heap.clone();
                thread::spawn(move || {
                    let mut ptrs = Vec::new();
                    for i in 0..500usize {
                        let size = (i * 37 + t * 11) % 3000;
                        let p = unsafe { heap.allocate(size) };
                        assert!(!p.is_null());
                        unsafe { core::ptr::write_bytes(p, t as u8, size) };
                        ptrs.push((p as usize, size));
                    }
                    for (p, size) in ptrs {
                        let p = p as *mut u8;
                        if size > 0 {
                            unsafe { assert_eq!(*p.add(size - 1), t as u8) };
                        }
                        unsafe { heap.free(p) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let (validity, stats) = heap.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.in_use_chunks, 0);
    }
}

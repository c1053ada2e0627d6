//! The collector: stop-the-world mark-sweep over one heap.
//!
//! A cycle moves through the [`GcPhase`](enum.GcPhase.html)s in order:
//! marking runs on the calling thread, starting from the runtime's roots, the
//! strong global handles and any objects registered while a cycle was
//! running; the sweep then fans out over the worker pool.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::HeapConfig;
use crate::handles::GlobalHandles;
use crate::heap::RawHeap;
use crate::meta;
use crate::pool::WorkerPool;
use crate::sweeper::{FinalizeStats, SweepStats, Sweeper};
use crate::sys::PageSource;
use crate::tag::{AllocTag, FinalizeMode, TagHandler, TagTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Idle,
    Marking,
    FinalizeSweep,
    FreeSweep,
    MmapReclaim,
    SegmentRelease,
}

/// Why a collection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcError {
    /// A `forbid_gc` section is open.
    Forbidden,
    /// A cycle is already running.
    Reentrant,
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcError::Forbidden => write!(f, "garbage collection is forbidden here"),
            GcError::Reentrant => write!(f, "a garbage collection is already running"),
        }
    }
}

impl Error for GcError {}

/// Grey objects waiting to have their references visited, one queue per
/// `local_idx`.
pub struct Visitor {
    queues: Vec<Vec<*mut u8>>,
    marked: usize,
}

impl Visitor {
    fn new(queues: usize) -> Self {
        Visitor {
            queues: (0..queues.max(1)).map(|_| Vec::new()).collect(),
            marked: 0,
        }
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Objects marked so far in this cycle.
    pub fn marked(&self) -> usize {
        self.marked
    }

    /// Mark `mem` and queue it on `local_idx`. Null and already marked
    /// pointers are ignored.
    ///
    /// # Safety
    ///
    /// `mem` must be null or a live payload of the heap being collected.
    pub unsafe fn push(&mut self, mem: *mut u8, local_idx: usize) {
        if mem.is_null() || meta::is_marked(mem) {
            return;
        }
        meta::set_mark(mem);
        self.marked += 1;
        let idx = local_idx % self.queues.len();
        self.queues[idx].push(mem);
    }

    /// # Safety
    ///
    /// As for [`push`](#method.push).
    pub unsafe fn visit_root(&mut self, mem: *mut u8) {
        self.push(mem, 0);
    }

    pub fn is_drained(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }

    fn pop(&mut self) -> Option<*mut u8> {
        self.queues.iter_mut().find_map(|q| q.pop())
    }

    unsafe fn drain(&mut self, tags: &TagTable) {
        while let Some(mem) = self.pop() {
            tags.visit(mem, self);
        }
    }

    fn reset(&mut self) {
        for q in self.queues.iter_mut() {
            q.clear();
        }
        self.marked = 0;
    }
}

/// The runtime's marking roots.
pub trait RootSet {
    fn visit_roots(&mut self, visitor: &mut Visitor);
}

impl<F: FnMut(&mut Visitor)> RootSet for F {
    fn visit_roots(&mut self, visitor: &mut Visitor) {
        self(visitor)
    }
}

/// Keeps collections refused while alive.
pub struct ForbidGcScope {
    counter: Arc<AtomicUsize>,
}

impl Drop for ForbidGcScope {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Collector {
    name: &'static str,
    config: HeapConfig,
    pool: WorkerPool,
    tags: TagTable,
    handles: GlobalHandles,
    visitor: Visitor,
    during_gc: Vec<*mut u8>,
    forbid: Arc<AtomicUsize>,
    phase: GcPhase,
    cycles: usize,
}

impl Collector {
    /// A collector whose pool has `config.worker_threads` workers.
    pub fn new(config: &HeapConfig) -> Self {
        Collector {
            name: config.name,
            config: *config,
            pool: WorkerPool::new(config.name, config.worker_threads),
            tags: TagTable::new(),
            handles: GlobalHandles::new(),
            visitor: Visitor::new(config.thread_num),
            during_gc: Vec::new(),
            forbid: Arc::new(AtomicUsize::new(0)),
            phase: GcPhase::Idle,
            cycles: 0,
        }
    }

    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    /// Completed collections.
    pub fn cycles(&self) -> usize {
        self.cycles
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn tags(&self) -> &TagTable {
        &self.tags
    }

    pub fn tags_mut(&mut self) -> &mut TagTable {
        &mut self.tags
    }

    pub fn register<H: TagHandler + 'static>(&mut self, tag: AllocTag, handler: H) {
        self.tags.register(tag, handler);
    }

    pub fn handles(&self) -> &GlobalHandles {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut GlobalHandles {
        &mut self.handles
    }

    /// Treat `mem` as a root in the next marking phase.
    pub fn add_object_during_gc(&mut self, mem: *mut u8) {
        self.during_gc.push(mem);
    }

    pub fn set_forbid_gc(&self) {
        self.forbid.fetch_add(1, Ordering::SeqCst);
    }

    pub fn reset_forbid_gc(&self) {
        let prev = self.forbid.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if prev.is_err() {
            log::warn!("{}: reset_forbid_gc without a matching set_forbid_gc", self.name);
        }
    }

    pub fn is_gc_forbidden(&self) -> bool {
        self.forbid.load(Ordering::SeqCst) > 0
    }

    pub fn forbid_gc_scope(&self) -> ForbidGcScope {
        self.set_forbid_gc();
        ForbidGcScope {
            counter: self.forbid.clone(),
        }
    }

    pub fn set_max_active_thread_num(&self, num: usize) {
        self.pool.set_max_active_thread_num(num);
    }

    /// Run one full collection of `heap`.
    ///
    /// # Safety
    ///
    /// Every pointer the roots, handles and tag handlers report must be null
    /// or a live payload of `heap`, and every in-use chunk must carry a tag
    /// whose handler understands it. No other thread may use `heap` until
    /// this returns.
    pub unsafe fn collect<G: PageSource, R: RootSet>(
        &mut self,
        heap: &mut RawHeap<G>,
        mut roots: R,
    ) -> Result<SweepStats, GcError> {
        if self.is_gc_forbidden() {
            log::debug!("{}: collection refused, gc is forbidden", self.name);
            return Err(GcError::Forbidden);
        }
        if self.phase != GcPhase::Idle {
            return Err(GcError::Reentrant);
        }

        let mut stats = SweepStats {
            footprint_before: heap.footprint(),
            ..SweepStats::default()
        };
        if !heap.is_initialized() {
            stats.footprint_after = stats.footprint_before;
            return Ok(stats);
        }

        self.phase = GcPhase::Marking;
        let start = Instant::now();
        self.mark(&mut roots);
        stats.marked = self.visitor.marked();
        stats.mark_time = start.elapsed();

        self.phase = GcPhase::FinalizeSweep;
        let start = Instant::now();
        let mut sweeper = Sweeper::new(heap, &self.pool, &self.tags);
        stats.finalize = sweeper.finalize(&mut self.handles, FinalizeMode::Collect, None);
        stats.cur_malloc_size = stats.finalize.live_bytes;
        stats.finalize_time = start.elapsed();

        self.phase = GcPhase::FreeSweep;
        sweeper.free_sweep(&mut stats);

        self.phase = GcPhase::MmapReclaim;
        let start = Instant::now();
        sweeper.reclaim_mmaps(&mut stats);

        self.phase = GcPhase::SegmentRelease;
        sweeper.release_segments(&mut stats);
        stats.reclaim_time = start.elapsed();

        stats.footprint_after = heap.footprint();
        self.phase = GcPhase::Idle;
        self.cycles += 1;
        log::info!(
            "{}: gc #{}: marked {}, finalized {}, freed {} chunks and {} mapped objects, \
             released {} segments, footprint {} -> {}",
            self.name,
            self.cycles,
            stats.marked,
            stats.finalize.finalized,
            stats.freed_chunks,
            stats.mmap_reclaimed,
            stats.released.segments,
            stats.footprint_before,
            stats.footprint_after
        );
        Ok(stats)
    }

    unsafe fn mark<R: RootSet>(&mut self, roots: &mut R) {
        self.visitor.reset();
        roots.visit_roots(&mut self.visitor);
        for mem in self.handles.strong_roots() {
            self.visitor.visit_root(mem);
        }
        for mem in self.during_gc.drain(..) {
            self.visitor.visit_root(mem);
        }
        self.visitor.drain(&self.tags);
        debug_assert!(self.visitor.is_drained());
    }

    /// Run the teardown finalizer of every live object, stopping early once
    /// the configured budget is spent. Memory is not reclaimed.
    ///
    /// # Safety
    ///
    /// Every in-use chunk must carry a tag whose handler understands it, and
    /// no object may be used afterwards.
    pub unsafe fn finalize_all<G: PageSource>(&mut self, heap: &mut RawHeap<G>) -> FinalizeStats {
        if self.phase != GcPhase::Idle {
            log::warn!("{}: finalizing everything during a collection", self.name);
        }
        let prev = self.phase;
        self.phase = GcPhase::FinalizeSweep;
        let start = Instant::now();
        let stats = Sweeper::new(heap, &self.pool, &self.tags).finalize(
            &mut self.handles,
            FinalizeMode::Teardown,
            Some(self.config.finalizer_budget),
        );
        self.phase = prev;
        log::info!(
            "{}: teardown finalized {} objects in {:?}{}",
            self.name,
            stats.finalized,
            start.elapsed(),
            if stats.completed { "" } else { " (budget exceeded)" }
        );
        stats
    }

    /// Finalize every live object of `heap`, then release all its memory.
    ///
    /// # Safety
    ///
    /// As for [`finalize_all`](#method.finalize_all).
    pub unsafe fn destroy<G: PageSource>(&mut self, mut heap: RawHeap<G>) -> FinalizeStats {
        let stats = self.finalize_all(&mut heap);
        drop(heap);
        stats
    }
}

//! Sweeping: turning unmarked objects back into free memory.
//!
//! A sweep runs after marking, in this order:
//!
//! 1. **Finalize.** Weak handles to unmarked targets are cleared. Then every
//!    unmarked in-use chunk, in the segments and in the mmap side-table, has
//!    its tag's finalizer run.
//! 2. **Merge.** Pool tasks walk batches of segments, each holding a shard
//!    claim. Marked chunks get their mark cleared; unmarked ones are turned
//!    into free chunks in place.
//! 3. **Reset.** The global bins and every shard are emptied.
//! 4. **Generate.** Pool tasks walk the batches again, each writing into a
//!    shard it has claimed. Every maximal run of free chunks becomes one free
//!    chunk. A run that reaches the end of the segment holding `top` is
//!    absorbed by `top`. A run covering a whole other segment marks that
//!    segment unused.
//! 5. **Reclaim.** `dv` is dropped, the shards are merged into the global
//!    bins, unmarked directly mapped chunks are unmapped and unused segments
//!    are released.

use core::mem::size_of;
use core::ptr::null_mut;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bins::Bins;
use crate::chunk::{Chunk, Segment, TreeChunk, IS_UNUSED_BIT, PINUSE};
use crate::handles::GlobalHandles;
use crate::heap::{RawHeap, SegmentRelease};
use crate::meta;
use crate::params;
use crate::pool::WorkerPool;
use crate::shard::IdxClaims;
use crate::sys::{self, PageSource};
use crate::tag::{FinalizeMode, TagTable};

/// What a finalize pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeStats {
    pub finalized: usize,
    pub weak_cleared: usize,
    /// Bytes of chunks that stay alive, directly mapped ones included.
    pub live_bytes: usize,
    /// False when a teardown ran out of time before visiting every segment.
    pub completed: bool,
}

/// What one collection did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    /// Objects reached while marking.
    pub marked: usize,
    /// Bytes held by marked objects once the cycle ends.
    pub cur_malloc_size: usize,
    pub finalize: FinalizeStats,
    /// Unmarked chunks turned free by the merge phase.
    pub freed_chunks: usize,
    pub freed_bytes: usize,
    /// Free chunks handed to the bins by the generate phase.
    pub binned_chunks: usize,
    /// Chunks freed under each shard claim during the merge phase.
    pub shard_frees: Vec<usize>,
    /// Chunks each shard received during the generate phase.
    pub shard_inserts: Vec<usize>,
    /// Bytes `top` grew by.
    pub top_growth: usize,
    pub mmap_reclaimed: usize,
    pub mmap_reclaimed_bytes: usize,
    pub released: SegmentRelease,
    /// Bytes advised away while binning free runs.
    pub advised: usize,
    pub footprint_before: usize,
    pub footprint_after: usize,
    pub mark_time: Duration,
    pub finalize_time: Duration,
    pub free_time: Duration,
    pub reclaim_time: Duration,
}

/// The walkable part of one segment, as plain addresses so tasks can carry
/// it to other threads.
#[derive(Debug, Clone, Copy)]
struct SegmentSpan {
    record: usize,
    first: usize,
    end: usize,
    holds_top: bool,
}

impl SegmentSpan {
    fn first(&self) -> *mut Chunk {
        self.first as *mut Chunk
    }

    fn end(&self) -> *mut Chunk {
        self.end as *mut Chunk
    }
}

/// Segments per task: the segment list is cut into about twice as many
/// batches as there are shards.
pub fn task_granularity(seg_count: usize, thread_num: usize) -> usize {
    let parts = thread_num.max(1) * 2;
    if seg_count % parts == 0 {
        (seg_count / parts).max(1)
    } else {
        (seg_count + parts) / parts
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct MergeOutcome {
    freed: usize,
    bytes: usize,
}

#[derive(Debug, Default)]
struct GenerateOutcome {
    binned: usize,
    advised: usize,
    unused: usize,
    /// Start and size of the run `top` absorbs.
    top_run: Option<(usize, usize)>,
}

/// Turn the unmarked in-use chunks of `span` into free chunks and clear the
/// marks of the others.
unsafe fn merge_span(span: &SegmentSpan) -> MergeOutcome {
    let mut out = MergeOutcome::default();
    let end = span.end();
    let mut p = span.first();
    while p < end {
        let size = Chunk::size(p);
        let next = Chunk::plus_offset(p, size);
        if Chunk::cinuse(p) {
            let mem = Chunk::to_mem(p);
            if meta::is_marked(mem) {
                meta::clear_mark(mem);
            } else {
                Chunk::set_free_with_pinuse(p, size, next);
                out.freed += 1;
                out.bytes += size;
            }
        }
        p = next;
    }
    out
}

/// Coalesce every run of free chunks in `span` and bin it in `shard`.
unsafe fn generate_span(span: &SegmentSpan, shard: &mut Bins, madvise: bool, out: &mut GenerateOutcome) {
    let end = span.end();
    let mut run: *mut Chunk = null_mut();
    let mut run_size = 0;
    let mut p = span.first();
    while p < end {
        let size = Chunk::size(p);
        if !Chunk::cinuse(p) {
            if run.is_null() {
                run = p;
                run_size = 0;
            }
            run_size += size;
        } else if !run.is_null() {
            Chunk::set_free_with_pinuse(run, run_size, p);
            bin_run(run, run_size, shard, madvise, out);
            run = null_mut();
        }
        p = Chunk::plus_offset(p, size);
    }

    if run.is_null() {
        return;
    }
    if span.holds_top {
        out.top_run = Some((run as usize, run_size));
    } else {
        Chunk::set_free_with_pinuse(run, run_size, end);
        if run == span.first() {
            (*(span.record as *mut Segment)).flags |= IS_UNUSED_BIT;
            out.unused += 1;
        } else {
            bin_run(run, run_size, shard, madvise, out);
        }
    }
}

unsafe fn bin_run(run: *mut Chunk, size: usize, shard: &mut Bins, madvise: bool, out: &mut GenerateOutcome) {
    shard.insert_chunk(run, size);
    out.binned += 1;
    if madvise && size > 2 * params::page_size() {
        out.advised += sys::advise_chunk_interior(run as *mut u8, size, size_of::<TreeChunk>());
    }
}

/// Runs the sweep phases over one heap.
pub struct Sweeper<'a, G: PageSource> {
    heap: &'a mut RawHeap<G>,
    pool: &'a WorkerPool,
    tags: &'a TagTable,
    claims: Arc<IdxClaims>,
}

impl<'a, G: PageSource> Sweeper<'a, G> {
    pub fn new(heap: &'a mut RawHeap<G>, pool: &'a WorkerPool, tags: &'a TagTable) -> Self {
        let claims = Arc::new(IdxClaims::new(heap.bins.shards().len()));
        Sweeper {
            heap,
            pool,
            tags,
            claims,
        }
    }

    fn thread_num(&self) -> usize {
        self.heap.bins.shards().len().max(1)
    }

    /// Whether the calling thread takes tasks too: it does unless the pool
    /// alone has one thread per shard.
    fn add_to_execute(&self) -> bool {
        self.pool.max_thread_num() != self.heap.bins.shards().len()
    }

    unsafe fn spans(&mut self) -> Vec<SegmentSpan> {
        let segments = self.heap.segments();
        segments
            .into_iter()
            .map(|sp| {
                let (first, end) = self.heap.segment_bounds(sp);
                SegmentSpan {
                    record: sp as usize,
                    first: first as usize,
                    end: end as usize,
                    holds_top: end == self.heap.top,
                }
            })
            .collect()
    }

    /// Run the finalizers of unmarked objects. With a `budget`, the segment
    /// walk stops once it is spent.
    ///
    /// # Safety
    ///
    /// Every in-use chunk must carry a tag whose handler accepts it.
    pub unsafe fn finalize(
        &mut self,
        handles: &mut GlobalHandles,
        mode: FinalizeMode,
        budget: Option<Duration>,
    ) -> FinalizeStats {
        let start = Instant::now();
        let mut stats = FinalizeStats {
            completed: true,
            ..FinalizeStats::default()
        };
        stats.weak_cleared = handles.finalize_weak(|mem| unsafe { meta::is_marked(mem) });

        for span in self.spans() {
            if let Some(budget) = budget {
                if start.elapsed() > budget {
                    log::warn!(
                        "{}: finalizers ran past {:?}, skipping the remaining segments",
                        self.heap.config.name,
                        budget
                    );
                    stats.completed = false;
                    break;
                }
            }
            let end = span.end();
            let mut p = span.first();
            while p < end {
                let size = Chunk::size(p);
                if Chunk::cinuse(p) {
                    self.finalize_chunk(p, size, mode, &mut stats);
                }
                p = Chunk::plus_offset(p, size);
            }
        }

        for mem in self.heap.mmaps.live() {
            let p = Chunk::from_mem(mem);
            self.finalize_chunk(p, Chunk::size(p), mode, &mut stats);
        }
        stats
    }

    unsafe fn finalize_chunk(&self, p: *mut Chunk, size: usize, mode: FinalizeMode, stats: &mut FinalizeStats) {
        let mem = Chunk::to_mem(p);
        if meta::is_marked(mem) {
            stats.live_bytes += size;
        } else {
            self.tags.finalize(mem, mode);
            stats.finalized += 1;
        }
    }

    /// Rebuild the free lists of every segment from the marks.
    ///
    /// # Safety
    ///
    /// Marking must be complete, and finalizers must have run.
    pub unsafe fn free_sweep(&mut self, stats: &mut SweepStats) {
        let start = Instant::now();
        let spans = self.spans();
        let batch = task_granularity(spans.len(), self.thread_num());
        let batches: Arc<Vec<Vec<SegmentSpan>>> =
            Arc::new(spans.chunks(batch).map(|b| b.to_vec()).collect());
        log::debug!(
            "{}: sweeping {} segments in {} batches",
            self.heap.config.name,
            spans.len(),
            batches.len()
        );

        let (merged, shard_frees) = self.merge(&batches);
        stats.freed_chunks = merged.freed;
        stats.freed_bytes = merged.bytes;
        stats.shard_frees = shard_frees;

        let (global, shards) = self.heap.bins.split_mut();
        global.reset();
        for shard in shards.iter_mut() {
            shard.reset();
        }

        let generated = self.generate(&batches);
        stats.binned_chunks = generated.binned;
        stats.advised = generated.advised;
        if let Some((run, size)) = generated.top_run {
            let run = run as *mut Chunk;
            self.heap.topsize += size;
            self.heap.top = run;
            (*run).head = self.heap.topsize | PINUSE;
            stats.top_growth = size;
        }
        self.heap.dv = null_mut();
        self.heap.dvsize = 0;

        stats.shard_inserts = self.heap.bins.shards().iter().map(|s| s.inserted).collect();
        let (global, shards) = self.heap.bins.split_mut();
        for shard in shards.iter_mut() {
            shard.drain_into(global);
        }
        if generated.unused > 0 {
            log::debug!(
                "{}: {} segments left wholly free",
                self.heap.config.name,
                generated.unused
            );
        }
        stats.free_time = start.elapsed();
    }

    /// Returns the totals and the chunks freed under each shard claim.
    fn merge(&self, batches: &Arc<Vec<Vec<SegmentSpan>>>) -> (MergeOutcome, Vec<usize>) {
        let total = Arc::new(Mutex::new((MergeOutcome::default(), vec![0; self.claims.len()])));
        for i in 0..batches.len() {
            let batches = batches.clone();
            let claims = self.claims.clone();
            let total = total.clone();
            self.pool.add_task(move |_thread_id: usize| {
                let scope = claims.acquire();
                let mut out = MergeOutcome::default();
                for span in batches[i].iter() {
                    let one = unsafe { merge_span(span) };
                    out.freed += one.freed;
                    out.bytes += one.bytes;
                }
                let idx = scope.idx();
                drop(scope);
                let mut total = total.lock();
                total.0.freed += out.freed;
                total.0.bytes += out.bytes;
                total.1[idx] += out.freed;
            });
        }
        self.pool.start();
        self.pool.wait_finish(self.add_to_execute());
        let out = core::mem::take(&mut *total.lock());
        out
    }

    fn generate(&mut self, batches: &Arc<Vec<Vec<SegmentSpan>>>) -> GenerateOutcome {
        let shards: Arc<Vec<usize>> = Arc::new(
            self.heap
                .bins
                .shards_mut()
                .iter_mut()
                .map(|s| s as *mut Bins as usize)
                .collect(),
        );
        let madvise = self.heap.config.madvise;
        let total = Arc::new(Mutex::new(GenerateOutcome::default()));

        for i in 0..batches.len() {
            let batches = batches.clone();
            let shards = shards.clone();
            let claims = self.claims.clone();
            let total = total.clone();
            self.pool.add_task(move |_thread_id: usize| {
                let scope = claims.acquire();
                // The claim makes this task the only writer of the shard.
                let shard = unsafe { &mut *(shards[scope.idx()] as *mut Bins) };
                let mut out = GenerateOutcome::default();
                for span in batches[i].iter() {
                    unsafe { generate_span(span, shard, madvise, &mut out) };
                }
                drop(scope);
                let mut total = total.lock();
                total.binned += out.binned;
                total.advised += out.advised;
                total.unused += out.unused;
                if out.top_run.is_some() {
                    total.top_run = out.top_run;
                }
            });
        }
        self.pool.start();
        self.pool.wait_finish(self.add_to_execute());
        let out = core::mem::take(&mut *total.lock());
        out
    }

    /// Unmap every directly mapped object left unmarked and clear the marks
    /// of the rest.
    ///
    /// # Safety
    ///
    /// Marking must be complete, and finalizers must have run.
    pub unsafe fn reclaim_mmaps(&mut self, stats: &mut SweepStats) {
        for mem in self.heap.mmaps.live() {
            if meta::is_marked(mem) {
                meta::clear_mark(mem);
                continue;
            }
            stats.mmap_reclaimed += 1;
            stats.mmap_reclaimed_bytes += Chunk::size(Chunk::from_mem(mem));
            self.heap.free(mem);
        }
    }

    /// Unmap the segments the free sweep found wholly free.
    pub fn release_segments(&mut self, stats: &mut SweepStats) {
        stats.released = unsafe { self.heap.release_unused_segments() };
    }

    /// The free sweep, mmap reclaim and segment release in order.
    ///
    /// # Safety
    ///
    /// Marking must be complete, and finalizers must have run.
    pub unsafe fn sweep(&mut self, stats: &mut SweepStats) {
        self.free_sweep(stats);
        let start = Instant::now();
        self.reclaim_mmaps(stats);
        self.release_segments(stats);
        stats.reclaim_time = start.elapsed();
    }
}

//! The unlocked heap.
//!
//! `RawHeap` owns the global bins, the `dv` and `top` chunks, the segment
//! list, the mmap cache and the mmap side-table. It is not thread-safe; wrap
//! it in [`Heap`](../allocators/struct.Heap.html) to share it.
//!
//! Allocation tries, in order: an exact or next-larger small bin, the tree
//! bins, `dv`, `top`, and finally the system. Requests at or above the mmap
//! threshold that reach the system get a mapping of their own.

use core::cmp;
use core::mem::size_of;
use core::ptr::{self, null_mut};

use crate::bins::{BinBlock, Corruption};
use crate::chunk::{
    align_as_chunk, align_offset, is_small, least_bit, left_bits, leftshift_for_tree_index,
    pad_request, request2size, small_index, small_index2size, compute_tree_index, Chunk, Segment,
    TreeChunk, CHUNK_ALIGN_MASK, FENCEPOST_HEAD, INUSE, IS_UNUSED_BIT, MALLOC_ALIGNMENT,
    MAX_REQUEST, MAX_SMALL_REQUEST, MEM_OFFSET, MIN_CHUNK_SIZE, MMAP_FOOT_PAD, PINUSE,
    TOP_FOOT_SIZE, USE_MMAP_BIT,
};
use crate::config::{ConfigError, HeapConfig};
use crate::meta;
use crate::mmap_table::MmapTable;
use crate::params;
use crate::sys::{self, PageSource};

// Logging from the heap paths, skipped when the heap is quiet: a logger that
// allocates would call back into a heap serving as the global allocator.
macro_rules! heap_log {
    ($heap:expr, $level:ident, $($arg:tt)+) => {
        if !$heap.config.quiet {
            log::$level!($($arg)+);
        }
    };
}

const WORD: usize = size_of::<usize>();

/// Size of the slab the mmap cache reserves at once.
pub const MMAP_GRANULARITY: usize = 1024 * 1024;

/// Segments at least this large are mapped directly, bypassing the cache.
const DIRECT_SEGMENT_SIZE: usize = 256 * 1024;

/// The segment holding `top` grows in place only while it is this small.
const MAX_EXTEND_SIZE: usize = 512 * 1024;

const SYS_ALLOC_PADDING: usize = TOP_FOOT_SIZE + MALLOC_ALIGNMENT;

// Physical memory release walks a window of tree bins that slides down by one
// on every call and wraps back once it reaches the floor.
const MAX_ADVISE_CHUNKS: usize = 48;
const ADVISE_HIGH_IDX: u32 = 31;
const ADVISE_LOW_IDX: u32 = 20;
const ADVISE_FLOOR_IDX: u32 = 14;

fn checked_align(n: usize, unit: usize) -> Option<usize> {
    n.checked_add(unit - 1).map(|n| n & !(unit - 1))
}

/// What one pass of `release_unused_segments` gave back.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRelease {
    pub segments: usize,
    pub bytes: usize,
    /// Bytes of free tree chunks returned with `madvise`.
    pub advised: usize,
}

pub struct RawHeap<G: PageSource> {
    /// The global bins, followed by one set per sweep shard.
    pub(crate) bins: BinBlock,
    pub(crate) dv: *mut Chunk,
    pub(crate) dvsize: usize,
    pub(crate) top: *mut Chunk,
    pub(crate) topsize: usize,
    pub(crate) least_addr: *mut u8,
    trim_check: usize,
    pub(crate) footprint: usize,
    pub(crate) max_footprint: usize,
    /// Head of the segment list. Every other record lives in the segment it
    /// describes, in a small in-use chunk just below its fenceposts.
    pub(crate) seg: Segment,
    pub(crate) seg_count: usize,
    mmap_cache: *mut u8,
    mmap_cache_size: usize,
    pub(crate) mmaps: MmapTable,
    pub(crate) config: HeapConfig,
    advise_low: u32,
    advise_high: u32,
    source: G,
}

unsafe impl<G: PageSource + Send> Send for RawHeap<G> {}

impl<G: PageSource> RawHeap<G> {
    /// A heap that maps nothing until its first allocation.
    pub fn new(config: HeapConfig, source: G) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(RawHeap {
            bins: BinBlock::new(config.thread_num),
            dv: null_mut(),
            dvsize: 0,
            top: null_mut(),
            topsize: 0,
            least_addr: null_mut(),
            trim_check: config.trim_threshold,
            footprint: 0,
            max_footprint: 0,
            seg: Segment::empty(),
            seg_count: 0,
            mmap_cache: null_mut(),
            mmap_cache_size: 0,
            mmaps: MmapTable::new(),
            config,
            advise_low: ADVISE_LOW_IDX,
            advise_high: ADVISE_HIGH_IDX,
            source,
        })
    }

    /// A heap whose first segment of `capacity` bytes (rounded up to the
    /// granularity) is mapped right away. If that mapping fails the heap
    /// starts empty instead.
    pub fn with_capacity(config: HeapConfig, source: G, capacity: usize) -> Result<Self, ConfigError> {
        let mut heap = RawHeap::new(config, source)?;
        if capacity == 0 {
            return Ok(heap);
        }
        let size = match checked_align(capacity, heap.config.granularity) {
            Some(size) if size < MAX_REQUEST => size,
            _ => {
                heap_log!(
                    heap,
                    warn,
                    "{}: capacity {} is too large, starting empty",
                    heap.config.name,
                    capacity
                );
                return Ok(heap);
            }
        };
        match unsafe { heap.source.map(size) } {
            Ok(base) => unsafe {
                heap.footprint = size;
                heap.max_footprint = size;
                heap.init(base, size, USE_MMAP_BIT);
                heap_log!(
                    heap,
                    debug,
                    "{}: initial segment {:p} ({} bytes)",
                    heap.config.name,
                    base,
                    size
                );
            },
            Err(e) => {
                heap_log!(
                    heap,
                    warn,
                    "{}: mapping the initial {} bytes failed ({:?}), starting empty",
                    heap.config.name,
                    size,
                    e
                );
            }
        }
        Ok(heap)
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn source(&self) -> &G {
        &self.source
    }

    pub fn is_initialized(&self) -> bool {
        !self.top.is_null()
    }

    pub fn footprint(&self) -> usize {
        self.footprint
    }

    pub fn max_footprint(&self) -> usize {
        self.max_footprint
    }

    pub fn seg_count(&self) -> usize {
        self.seg_count
    }

    pub fn topsize(&self) -> usize {
        self.topsize
    }

    pub fn dvsize(&self) -> usize {
        self.dvsize
    }

    /// Number of live directly mapped objects.
    pub fn mmap_count(&self) -> usize {
        self.mmaps.len()
    }

    /// Cap the footprint at `limit` bytes; 0 removes the cap.
    pub fn set_footprint_limit(&mut self, limit: usize) {
        self.config.footprint_limit = limit;
    }

    pub fn set_madvise(&mut self, enabled: bool) {
        self.config.madvise = enabled;
    }

    /// Whether `ptr` lies inside one of this heap's segments.
    pub fn in_segment(&self, ptr: *mut u8) -> bool {
        unsafe { !self.segment_holding(ptr).is_null() }
    }

    /// The payload capacity of an allocation.
    ///
    /// # Safety
    ///
    /// `mem` must be null or a live payload pointer from a `RawHeap`.
    pub unsafe fn usable_size(mem: *mut u8) -> usize {
        if mem.is_null() {
            return 0;
        }
        let p = Chunk::from_mem(mem);
        if Chunk::inuse(p) {
            Chunk::size(p) - Chunk::overhead_for(p)
        } else {
            0
        }
    }

    ////////////////////////////////////////////////////////////
    // Allocation

    /// Allocate at least `bytes` bytes. The mark word and tag word of the
    /// result are zero. Returns null when the request cannot be met.
    ///
    /// # Safety
    ///
    /// The heap metadata must be intact; the payload is uninitialized.
    pub unsafe fn allocate(&mut self, bytes: usize) -> *mut u8 {
        let mem = self.malloc(bytes);
        if mem.is_null() {
            heap_log!(self, debug, "{}: allocation of {} bytes failed", self.config.name, bytes);
            return mem;
        }
        meta::reset_mark_word(mem);
        meta::reset_tag_word(mem);
        mem
    }

    unsafe fn malloc(&mut self, bytes: usize) -> *mut u8 {
        let nb;
        if bytes <= MAX_SMALL_REQUEST {
            nb = request2size(bytes);
            let mut idx = small_index(nb);
            let smallbits = self.bins.smallmap >> idx;

            // The bin for `idx`, or the one just above it.
            if smallbits & 0b11 != 0 {
                idx += !smallbits & 1;
                let b = self.bins.smallbin_at(idx);
                let p = (*b).fd;
                self.unlink_first_small_chunk(b, p, idx);
                self.set_inuse_and_pinuse(p, small_index2size(idx));
                return Chunk::to_mem(p);
            }

            if nb > self.dvsize {
                if smallbits != 0 {
                    let leftbits = (smallbits << idx) & left_bits(1 << idx);
                    let i = least_bit(leftbits).trailing_zeros();
                    let b = self.bins.smallbin_at(i);
                    let p = (*b).fd;
                    debug_assert_eq!(Chunk::size(p), small_index2size(i));
                    self.unlink_first_small_chunk(b, p, i);
                    let rsize = small_index2size(i) - nb;
                    if rsize < MIN_CHUNK_SIZE {
                        self.set_inuse_and_pinuse(p, small_index2size(i));
                    } else {
                        self.set_size_and_pinuse_of_inuse_chunk(p, nb);
                        let r = Chunk::plus_offset(p, nb);
                        Chunk::set_size_and_pinuse_of_free_chunk(r, rsize);
                        self.replace_dv(r, rsize);
                    }
                    return Chunk::to_mem(p);
                } else if self.bins.treemap != 0 {
                    let mem = self.tmalloc_small(nb);
                    if !mem.is_null() {
                        return mem;
                    }
                }
            }
        } else if bytes >= MAX_REQUEST {
            return null_mut();
        } else {
            nb = pad_request(bytes);
            if self.bins.treemap != 0 {
                let mem = self.tmalloc_large(nb);
                if !mem.is_null() {
                    return mem;
                }
            }
        }

        if nb <= self.dvsize {
            let rsize = self.dvsize - nb;
            let p = self.dv;
            if rsize >= MIN_CHUNK_SIZE {
                let r = Chunk::plus_offset(p, nb);
                self.dv = r;
                self.dvsize = rsize;
                Chunk::set_size_and_pinuse_of_free_chunk(r, rsize);
                self.set_size_and_pinuse_of_inuse_chunk(p, nb);
            } else {
                let dvs = self.dvsize;
                self.dvsize = 0;
                self.dv = null_mut();
                self.set_inuse_and_pinuse(p, dvs);
            }
            return Chunk::to_mem(p);
        }

        if nb < self.topsize {
            return self.split_top(nb);
        }

        self.sys_alloc(nb)
    }

    unsafe fn split_top(&mut self, nb: usize) -> *mut u8 {
        self.topsize -= nb;
        let rsize = self.topsize;
        let p = self.top;
        let r = Chunk::plus_offset(p, nb);
        self.top = r;
        (*r).head = rsize | PINUSE;
        self.set_size_and_pinuse_of_inuse_chunk(p, nb);
        Chunk::to_mem(p)
    }

    /// Best fit among the smallest non-empty tree, for small requests.
    unsafe fn tmalloc_small(&mut self, nb: usize) -> *mut u8 {
        let i = least_bit(self.bins.treemap).trailing_zeros();
        let mut v = self.bins.treebin_root(i);
        let mut t = v;
        let mut rsize = Chunk::size(TreeChunk::chunk(t)) - nb;

        loop {
            t = TreeChunk::leftmost_child(t);
            if t.is_null() {
                break;
            }
            let trem = Chunk::size(TreeChunk::chunk(t)) - nb;
            if trem < rsize {
                rsize = trem;
                v = t;
            }
        }

        let vc = TreeChunk::chunk(v);
        if !self.ok_address(vc) {
            self.corruption_error(Corruption::BadAddress(vc as usize));
        }
        let r = Chunk::plus_offset(vc, nb);
        debug_assert_eq!(Chunk::size(vc), rsize + nb);
        self.unlink_large_chunk(v);
        if rsize < MIN_CHUNK_SIZE {
            self.set_inuse_and_pinuse(vc, rsize + nb);
        } else {
            self.set_size_and_pinuse_of_inuse_chunk(vc, nb);
            Chunk::set_size_and_pinuse_of_free_chunk(r, rsize);
            self.replace_dv(r, rsize);
        }
        Chunk::to_mem(vc)
    }

    /// Best fit from the tree bins for a large request. Returns null when
    /// `dv` fits at least as well. A split-off remainder becomes the new `dv`.
    unsafe fn tmalloc_large(&mut self, nb: usize) -> *mut u8 {
        let mut v: *mut TreeChunk = null_mut();
        let mut rsize = nb.wrapping_neg();
        let idx = compute_tree_index(nb);
        let mut t = self.bins.treebin_root(idx);
        if !t.is_null() {
            // Walk down the trie along the bits of `nb`, remembering the
            // deepest right subtree not taken.
            let mut sizebits = nb << leftshift_for_tree_index(idx);
            let mut rst: *mut TreeChunk = null_mut();
            loop {
                let trem = Chunk::size(TreeChunk::chunk(t)).wrapping_sub(nb);
                if trem < rsize {
                    v = t;
                    rsize = trem;
                    if rsize == 0 {
                        break;
                    }
                }
                let rt = (*t).child[1];
                t = (*t).child[(sizebits >> (WORD * 8 - 1)) & 1];
                if !rt.is_null() && rt != t {
                    rst = rt;
                }
                if t.is_null() {
                    t = rst;
                    break;
                }
                sizebits <<= 1;
            }
        }

        if t.is_null() && v.is_null() {
            let leftbits = left_bits(1 << idx) & self.bins.treemap;
            if leftbits != 0 {
                let i = least_bit(leftbits).trailing_zeros();
                t = self.bins.treebin_root(i);
            }
        }

        while !t.is_null() {
            let trem = Chunk::size(TreeChunk::chunk(t)).wrapping_sub(nb);
            if trem < rsize {
                rsize = trem;
                v = t;
            }
            t = TreeChunk::leftmost_child(t);
        }

        if v.is_null() || rsize >= self.dvsize.wrapping_sub(nb) {
            return null_mut();
        }

        let vc = TreeChunk::chunk(v);
        let r = Chunk::plus_offset(vc, nb);
        if !self.ok_address(vc) {
            self.corruption_error(Corruption::BadAddress(vc as usize));
        }
        if !self.ok_next(vc, r) {
            self.corruption_error(Corruption::BadNext(vc as usize));
        }
        debug_assert_eq!(Chunk::size(vc), rsize + nb);
        self.unlink_large_chunk(v);
        if rsize < MIN_CHUNK_SIZE {
            self.set_inuse_and_pinuse(vc, rsize + nb);
        } else {
            self.set_size_and_pinuse_of_inuse_chunk(vc, nb);
            Chunk::set_size_and_pinuse_of_free_chunk(r, rsize);
            self.replace_dv(r, rsize);
        }
        Chunk::to_mem(vc)
    }

    /// Make `p` the new `dv`, binning the old one.
    unsafe fn replace_dv(&mut self, p: *mut Chunk, size: usize) {
        if self.dvsize != 0 {
            let (dv, dvsize) = (self.dv, self.dvsize);
            self.bins.insert_chunk(dv, dvsize);
        }
        self.dv = p;
        self.dvsize = size;
    }

    ////////////////////////////////////////////////////////////
    // System allocation

    unsafe fn sys_alloc(&mut self, nb: usize) -> *mut u8 {
        if nb >= self.config.mmap_threshold && self.topsize != 0 {
            let mem = self.mmap_alloc(nb);
            if !mem.is_null() {
                return mem;
            }
            heap_log!(self, debug, "{}: direct mapping for {} bytes failed", self.config.name, nb);
        }

        let asize = match nb
            .checked_add(SYS_ALLOC_PADDING)
            .and_then(|n| checked_align(n, self.config.granularity))
        {
            Some(asize) => asize,
            None => return null_mut(),
        };
        if !self.within_footprint_limit(asize) {
            heap_log!(
                self,
                warn,
                "{}: {} more bytes would pass the footprint limit {}",
                self.config.name,
                asize,
                self.config.footprint_limit
            );
            return null_mut();
        }

        let tbase = match self.map_segment(asize) {
            Some(tbase) => tbase,
            None => {
                heap_log!(
                    self,
                    warn,
                    "{}: out of memory mapping {} bytes",
                    self.config.name,
                    asize
                );
                return null_mut();
            }
        };
        let tsize = asize;
        self.footprint += tsize;
        self.max_footprint = cmp::max(self.max_footprint, self.footprint);

        if !self.is_initialized() {
            self.init(tbase, tsize, USE_MMAP_BIT);
            heap_log!(
                self,
                debug,
                "{}: first segment {:p} ({} bytes)",
                self.config.name,
                tbase,
                tsize
            );
        } else {
            let sp = self.segment_ending_at(tbase);
            if !sp.is_null() && Segment::holds(sp, self.top as *mut u8) {
                if (*sp).size > MAX_EXTEND_SIZE {
                    self.add_segment(tbase, tsize, USE_MMAP_BIT);
                } else {
                    (*sp).size += tsize;
                    let (top, topsize) = (self.top, self.topsize + tsize);
                    self.init_top(top, topsize);
                }
            } else {
                if tbase < self.least_addr {
                    self.least_addr = tbase;
                }
                self.add_segment(tbase, tsize, USE_MMAP_BIT);
            }
        }

        if nb < self.topsize {
            return self.split_top(nb);
        }
        null_mut()
    }

    fn within_footprint_limit(&self, extra: usize) -> bool {
        let limit = self.config.footprint_limit;
        if limit == 0 {
            return true;
        }
        match self.footprint.checked_add(extra) {
            Some(fp) => fp <= limit,
            None => false,
        }
    }

    /// Map a new region for a segment, carving it from the mmap cache when
    /// it is small.
    unsafe fn map_segment(&mut self, size: usize) -> Option<*mut u8> {
        if !self.config.mmap_cache || size >= DIRECT_SEGMENT_SIZE {
            return self.map_with_retry(size);
        }
        if self.mmap_cache_size < size {
            self.drop_mmap_cache();
            let slab = self.map_with_retry(MMAP_GRANULARITY)?;
            self.mmap_cache = slab.add(size);
            self.mmap_cache_size = MMAP_GRANULARITY - size;
            return Some(slab);
        }
        let p = self.mmap_cache;
        self.mmap_cache = p.add(size);
        self.mmap_cache_size -= size;
        Some(p)
    }

    /// Map `size` bytes. If the first attempt fails, every wholly free
    /// segment is unmapped, the tail of `top` is trimmed, and the mapping is
    /// tried once more. Nothing else can be given back without a collection.
    unsafe fn map_with_retry(&mut self, size: usize) -> Option<*mut u8> {
        match self.source.map(size) {
            Ok(p) => Some(p),
            Err(e) => {
                heap_log!(
                    self,
                    debug,
                    "{}: mapping {} bytes failed ({:?}), releasing free segments",
                    self.config.name,
                    size,
                    e
                );
                self.flag_free_segments();
                self.release_unused_segments();
                self.sys_trim(0);
                match self.source.map(size) {
                    Ok(p) => Some(p),
                    Err(e) => {
                        heap_log!(self, debug, "{}: retry failed ({:?})", self.config.name, e);
                        None
                    }
                }
            }
        }
    }

    /// Flag every segment other than the one holding `top` whose chunks have
    /// all coalesced into one free chunk, and take that chunk out of the
    /// bins. Returns how many segments were flagged.
    pub(crate) unsafe fn flag_free_segments(&mut self) -> usize {
        if !self.is_initialized() {
            return 0;
        }
        let mut flagged = 0;
        let mut sp = self.seg.next;
        while !sp.is_null() {
            let (first, end) = self.segment_bounds(sp);
            let size = Chunk::size(first);
            if !Chunk::cinuse(first) && Chunk::plus_offset(first, size) == end {
                if first == self.dv {
                    self.dv = null_mut();
                    self.dvsize = 0;
                } else {
                    self.unlink_chunk(first, size);
                }
                (*sp).flags |= IS_UNUSED_BIT;
                flagged += 1;
            }
            sp = (*sp).next;
        }
        flagged
    }

    unsafe fn drop_mmap_cache(&mut self) {
        if !self.mmap_cache.is_null() && self.mmap_cache_size != 0 {
            if let Err(e) = self.source.unmap(self.mmap_cache, self.mmap_cache_size) {
                heap_log!(
                    self,
                    error,
                    "{}: unmapping the mmap cache at {:p} ({} bytes) failed: {:?}",
                    self.config.name,
                    self.mmap_cache,
                    self.mmap_cache_size,
                    e
                );
                panic!("unable to unmap the mmap cache");
            }
        }
        self.mmap_cache = null_mut();
        self.mmap_cache_size = 0;
    }

    unsafe fn init(&mut self, tbase: *mut u8, tsize: usize, flags: u32) {
        if self.least_addr.is_null() || tbase < self.least_addr {
            self.least_addr = tbase;
        }
        self.seg = Segment {
            base: tbase,
            size: tsize,
            next: null_mut(),
            flags,
        };
        self.seg_count = 1;
        self.init_top(tbase as *mut Chunk, tsize - TOP_FOOT_SIZE);
    }

    pub(crate) unsafe fn init_top(&mut self, p: *mut Chunk, psize: usize) {
        let offset = align_offset(p as usize + MEM_OFFSET);
        let p = Chunk::plus_offset(p, offset);
        let psize = psize - offset;
        self.top = p;
        self.topsize = psize;
        (*p).head = psize | PINUSE;
        (*Chunk::plus_offset(p, psize)).head = TOP_FOOT_SIZE;
        self.trim_check = self.config.trim_threshold;
    }

    /// Splice in a new, non-contiguous segment and move `top` there. The old
    /// top segment gets a record of itself and trailing fenceposts at its
    /// tail; what is left of the old top becomes an ordinary free chunk.
    unsafe fn add_segment(&mut self, tbase: *mut u8, tsize: usize, flags: u32) {
        let old_top = self.top as *mut u8;
        let oldsp = self.segment_holding(old_top);
        let old_end = Segment::top(oldsp);
        let ssize = pad_request(size_of::<Segment>());
        let rawsp = old_end.sub(ssize + 4 * WORD + CHUNK_ALIGN_MASK);
        let asp = rawsp.add(align_offset(rawsp as usize + MEM_OFFSET));
        let csp = if asp < old_top.add(MIN_CHUNK_SIZE) {
            old_top
        } else {
            asp
        };
        let sp = csp as *mut Chunk;
        let ss = Chunk::to_mem(sp) as *mut Segment;
        let tnext = Chunk::plus_offset(sp, ssize);
        let mut p = tnext;
        let mut nfences = 0;

        self.init_top(tbase as *mut Chunk, tsize - TOP_FOOT_SIZE);

        debug_assert_eq!(ss as usize & CHUNK_ALIGN_MASK, 0);
        self.set_size_and_pinuse_of_inuse_chunk(sp, ssize);
        ptr::write(ss, self.seg);
        self.seg = Segment {
            base: tbase,
            size: tsize,
            next: ss,
            flags,
        };
        self.seg_count += 1;

        loop {
            let nextp = Chunk::plus_offset(p, WORD);
            (*p).head = FENCEPOST_HEAD;
            nfences += 1;
            if (&(*nextp).head as *const usize as *mut u8) < old_end {
                p = nextp;
            } else {
                break;
            }
        }
        debug_assert!(nfences >= 2);

        if csp != old_top {
            let q = old_top as *mut Chunk;
            let psize = csp as usize - old_top as usize;
            let tn = Chunk::plus_offset(q, psize);
            Chunk::set_free_with_pinuse(q, psize, tn);
            self.bins.insert_chunk(q, psize);
        }

        heap_log!(
            self,
            debug,
            "{}: segment added at {:p} ({} bytes), {} segments",
            self.config.name,
            tbase,
            tsize,
            self.seg_count
        );
    }

    /// Give `nb` bytes a mapping of their own and record it in the side-table.
    unsafe fn mmap_alloc(&mut self, nb: usize) -> *mut u8 {
        let mmsize = match nb
            .checked_add(6 * WORD + CHUNK_ALIGN_MASK)
            .and_then(|n| checked_align(n, params::page_size()))
        {
            Some(mmsize) => mmsize,
            None => return null_mut(),
        };
        if !self.within_footprint_limit(mmsize) {
            return null_mut();
        }
        let mm = match self.source.map(mmsize) {
            Ok(mm) => mm,
            Err(e) => {
                heap_log!(
                    self,
                    debug,
                    "{}: mapping {} bytes failed: {:?}",
                    self.config.name,
                    mmsize,
                    e
                );
                return null_mut();
            }
        };
        let offset = align_offset(mm as usize + MEM_OFFSET);
        let psize = mmsize - offset - MMAP_FOOT_PAD;
        let p = mm.add(offset) as *mut Chunk;
        (*p).prev_foot = offset;
        (*p).head = psize;
        self.mark_inuse_foot(p, psize);
        (*Chunk::plus_offset(p, psize)).head = FENCEPOST_HEAD;
        (*Chunk::plus_offset(p, psize + WORD)).head = 0;

        if self.least_addr.is_null() || mm < self.least_addr {
            self.least_addr = mm;
        }
        self.footprint += mmsize;
        self.max_footprint = cmp::max(self.max_footprint, self.footprint);
        let mem = Chunk::to_mem(p);
        let slots = self.mmaps.capacity();
        self.mmaps.add(mem, &mut self.source);
        if self.mmaps.capacity() != slots {
            let slots = self.mmaps.capacity();
            heap_log!(self, debug, "{}: mmap table grown to {} slots", self.config.name, slots);
        }
        mem
    }

    /// Return a directly mapped chunk to the OS.
    unsafe fn munmap_chunk(&mut self, p: *mut Chunk) {
        let offset = (*p).prev_foot;
        let total = Chunk::size(p) + offset + MMAP_FOOT_PAD;
        let mem = Chunk::to_mem(p);
        if !self.mmaps.remove(mem) {
            heap_log!(
                self,
                warn,
                "{}: mapped chunk {:p} missing from the side-table",
                self.config.name,
                mem
            );
        }
        match self.source.unmap((p as *mut u8).sub(offset), total) {
            Ok(()) => self.footprint -= total,
            Err(e) => heap_log!(
                self,
                error,
                "{}: unmapping {} bytes at {:p} failed: {:?}",
                self.config.name,
                total,
                p,
                e
            ),
        }
    }

    ////////////////////////////////////////////////////////////
    // Free

    /// Free a payload returned by `allocate` or `reallocate`.
    ///
    /// # Safety
    ///
    /// `mem` must be null or a live payload of this heap.
    ///
    /// # Panics
    ///
    /// Panics, after logging the heap state, if the chunk headers around
    /// `mem` are inconsistent, which includes freeing the same pointer twice.
    pub unsafe fn free(&mut self, mem: *mut u8) {
        if mem.is_null() {
            return;
        }
        let mut p = Chunk::from_mem(mem);
        if !self.ok_address(p) {
            self.corruption_error(Corruption::BadAddress(p as usize));
        }
        if !Chunk::inuse(p) {
            self.corruption_error(Corruption::NotInUse(p as usize));
        }
        let mut psize = Chunk::size(p);
        self.check_footer(p, psize);
        let next = Chunk::plus_offset(p, psize);

        if !Chunk::pinuse(p) {
            if Chunk::mmapped(p) {
                self.munmap_chunk(p);
                return;
            }
            let prevsize = (*p).prev_foot;
            let prev = Chunk::minus_offset(p, prevsize);
            psize += prevsize;
            p = prev;
            if !self.ok_address(prev) {
                self.corruption_error(Corruption::BadAddress(prev as usize));
            }
            if p != self.dv {
                self.unlink_chunk(p, prevsize);
            } else if (*next).head & INUSE == INUSE {
                self.dvsize = psize;
                Chunk::set_free_with_pinuse(p, psize, next);
                return;
            }
        }

        if !self.ok_next(p, next) || !Chunk::pinuse(next) {
            self.corruption_error(Corruption::BadNext(p as usize));
        }

        if !Chunk::cinuse(next) {
            if next == self.top {
                self.topsize += psize;
                let tsize = self.topsize;
                self.top = p;
                (*p).head = tsize | PINUSE;
                if p == self.dv {
                    self.dv = null_mut();
                    self.dvsize = 0;
                }
                if tsize > self.trim_check {
                    self.sys_trim(0);
                }
                return;
            } else if next == self.dv {
                self.dvsize += psize;
                let dsize = self.dvsize;
                self.dv = p;
                Chunk::set_size_and_pinuse_of_free_chunk(p, dsize);
                return;
            } else {
                let nsize = Chunk::size(next);
                psize += nsize;
                self.unlink_chunk(next, nsize);
                Chunk::set_size_and_pinuse_of_free_chunk(p, psize);
                if p == self.dv {
                    self.dvsize = psize;
                    return;
                }
            }
        } else {
            Chunk::set_free_with_pinuse(p, psize, next);
        }
        self.bins.insert_chunk(p, psize);
    }

    /// Free the in-use chunk `p` of `psize` bytes, which is not mapped
    /// directly, coalescing with its neighbours.
    unsafe fn dispose_chunk(&mut self, mut p: *mut Chunk, mut psize: usize) {
        let next = Chunk::plus_offset(p, psize);
        if !Chunk::pinuse(p) {
            let prevsize = (*p).prev_foot;
            let prev = Chunk::minus_offset(p, prevsize);
            psize += prevsize;
            p = prev;
            if p != self.dv {
                self.unlink_chunk(p, prevsize);
            } else if (*next).head & INUSE == INUSE {
                self.dvsize = psize;
                Chunk::set_free_with_pinuse(p, psize, next);
                return;
            }
        }

        if !Chunk::cinuse(next) {
            if next == self.top {
                self.topsize += psize;
                let tsize = self.topsize;
                self.top = p;
                (*p).head = tsize | PINUSE;
                if p == self.dv {
                    self.dv = null_mut();
                    self.dvsize = 0;
                }
                return;
            } else if next == self.dv {
                self.dvsize += psize;
                let dsize = self.dvsize;
                self.dv = p;
                Chunk::set_size_and_pinuse_of_free_chunk(p, dsize);
                return;
            } else {
                let nsize = Chunk::size(next);
                psize += nsize;
                self.unlink_chunk(next, nsize);
                Chunk::set_size_and_pinuse_of_free_chunk(p, psize);
                if p == self.dv {
                    self.dvsize = psize;
                    return;
                }
            }
        } else {
            Chunk::set_free_with_pinuse(p, psize, next);
        }
        self.bins.insert_chunk(p, psize);
    }

    ////////////////////////////////////////////////////////////
    // Reallocation

    /// Resize an allocation, in place when the neighbouring chunks allow it
    /// and by allocate-copy-free otherwise. A null `mem` allocates. On
    /// failure the old allocation is left untouched and null is returned.
    ///
    /// # Safety
    ///
    /// `mem` must be null or a live payload of this heap.
    pub unsafe fn reallocate(&mut self, mem: *mut u8, bytes: usize) -> *mut u8 {
        if mem.is_null() {
            return self.allocate(bytes);
        }
        if bytes >= MAX_REQUEST {
            return null_mut();
        }
        let nb = request2size(bytes);
        let oldp = Chunk::from_mem(mem);
        if !self.ok_address(oldp) {
            self.corruption_error(Corruption::BadAddress(oldp as usize));
        }
        if !Chunk::inuse(oldp) {
            self.corruption_error(Corruption::NotInUse(oldp as usize));
        }
        self.check_footer(oldp, Chunk::size(oldp));

        let newp = self.try_realloc_chunk(oldp, nb, true);
        if !newp.is_null() {
            return Chunk::to_mem(newp);
        }

        let new = self.malloc(bytes);
        if new.is_null() {
            return new;
        }
        let oc = Chunk::size(oldp) - Chunk::overhead_for(oldp);
        ptr::copy_nonoverlapping(mem, new, cmp::min(oc, bytes));
        meta::reset_mark_word(new);
        meta::copy_tag_word(mem, new);
        self.free(mem);
        new
    }

    unsafe fn try_realloc_chunk(&mut self, p: *mut Chunk, nb: usize, can_move: bool) -> *mut Chunk {
        let oldsize = Chunk::size(p);
        let next = Chunk::plus_offset(p, oldsize);

        if Chunk::mmapped(p) {
            self.mmap_resize(p, nb, can_move)
        } else if oldsize >= nb {
            let rsize = oldsize - nb;
            if rsize >= MIN_CHUNK_SIZE {
                let r = Chunk::plus_offset(p, nb);
                self.set_inuse(p, nb);
                self.set_inuse(r, rsize);
                self.dispose_chunk(r, rsize);
            }
            p
        } else if next == self.top {
            if oldsize + self.topsize <= nb {
                return null_mut();
            }
            let newsize = oldsize + self.topsize;
            let newtopsize = newsize - nb;
            let newtop = Chunk::plus_offset(p, nb);
            self.set_inuse(p, nb);
            (*newtop).head = newtopsize | PINUSE;
            self.top = newtop;
            self.topsize = newtopsize;
            p
        } else if next == self.dv {
            let dvs = self.dvsize;
            if oldsize + dvs < nb {
                return null_mut();
            }
            let dsize = oldsize + dvs - nb;
            if dsize >= MIN_CHUNK_SIZE {
                let r = Chunk::plus_offset(p, nb);
                let n = Chunk::plus_offset(r, dsize);
                self.set_inuse(p, nb);
                Chunk::set_size_and_pinuse_of_free_chunk(r, dsize);
                Chunk::clear_pinuse(n);
                self.dvsize = dsize;
                self.dv = r;
            } else {
                let newsize = oldsize + dvs;
                self.set_inuse(p, newsize);
                self.dvsize = 0;
                self.dv = null_mut();
            }
            p
        } else if !Chunk::cinuse(next) {
            let nextsize = Chunk::size(next);
            if oldsize + nextsize < nb {
                return null_mut();
            }
            let rsize = oldsize + nextsize - nb;
            self.unlink_chunk(next, nextsize);
            if rsize < MIN_CHUNK_SIZE {
                self.set_inuse(p, oldsize + nextsize);
            } else {
                let r = Chunk::plus_offset(p, nb);
                self.set_inuse(p, nb);
                self.set_inuse(r, rsize);
                self.dispose_chunk(r, rsize);
            }
            p
        } else {
            null_mut()
        }
    }

    unsafe fn mmap_resize(&mut self, oldp: *mut Chunk, nb: usize, can_move: bool) -> *mut Chunk {
        let oldsize = Chunk::size(oldp);
        // Mapped chunks never shrink into small sizes.
        if is_small(nb) {
            return null_mut();
        }
        if oldsize >= nb + WORD && oldsize - nb <= self.config.granularity << 1 {
            return oldp;
        }

        let offset = (*oldp).prev_foot;
        let oldmmsize = oldsize + offset + MMAP_FOOT_PAD;
        let newmmsize = match nb
            .checked_add(6 * WORD + CHUNK_ALIGN_MASK)
            .and_then(|n| checked_align(n, params::page_size()))
        {
            Some(size) => size,
            None => return null_mut(),
        };
        let old_base = (oldp as *mut u8).sub(offset);
        let cp = match self.source.remap(old_base, oldmmsize, newmmsize, can_move) {
            Ok(cp) => cp,
            Err(e) => {
                heap_log!(
                    self,
                    debug,
                    "{}: remapping {:p} failed: {:?}",
                    self.config.name,
                    old_base,
                    e
                );
                return null_mut();
            }
        };
        let newp = cp.add(offset) as *mut Chunk;
        let psize = newmmsize - offset - MMAP_FOOT_PAD;
        (*newp).head = psize;
        self.mark_inuse_foot(newp, psize);
        (*Chunk::plus_offset(newp, psize)).head = FENCEPOST_HEAD;
        (*Chunk::plus_offset(newp, psize + WORD)).head = 0;

        if cp < self.least_addr {
            self.least_addr = cp;
        }
        self.footprint = self.footprint + newmmsize - oldmmsize;
        self.max_footprint = cmp::max(self.max_footprint, self.footprint);
        if cp != old_base {
            self.mmaps.remove(Chunk::to_mem(oldp));
            self.mmaps.add(Chunk::to_mem(newp), &mut self.source);
        }
        newp
    }

    ////////////////////////////////////////////////////////////
    // Returning memory

    /// Give whole granularity units at the tail of the top segment back to
    /// the OS, keeping `pad` bytes of `top`. Returns whether anything was
    /// released.
    pub fn trim(&mut self, pad: usize) -> bool {
        unsafe { self.sys_trim(pad) }
    }

    unsafe fn sys_trim(&mut self, pad: usize) -> bool {
        let mut released = 0;
        if pad >= MAX_REQUEST || !self.is_initialized() {
            return false;
        }
        let pad = pad + TOP_FOOT_SIZE;
        if self.topsize > pad {
            let unit = self.config.granularity;
            let extra = ((self.topsize - pad + (unit - 1)) / unit - 1) * unit;
            let sp = self.segment_holding(self.top as *mut u8);
            if !sp.is_null() && extra != 0 && (*sp).size >= extra && !self.has_segment_link(sp) {
                let newsize = (*sp).size - extra;
                if let Err(e) = self.source.unmap((*sp).base.add(newsize), extra) {
                    heap_log!(
                        self,
                        error,
                        "{}: trimming {} bytes failed: {:?}",
                        self.config.name,
                        extra,
                        e
                    );
                    panic!("unable to unmap the tail of a segment");
                }
                released = extra;
            }
            if released != 0 {
                (*sp).size -= released;
                self.footprint -= released;
                let (top, topsize) = (self.top, self.topsize - released);
                self.init_top(top, topsize);
                heap_log!(self, debug, "{}: trimmed {} bytes", self.config.name, released);
            }
        }
        if released == 0 && self.topsize > self.trim_check {
            self.trim_check = usize::max_value();
        }
        released != 0
    }

    /// Unmap every segment the sweeper flagged unused and unlink its record.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to unmap a segment.
    pub(crate) unsafe fn release_unused_segments(&mut self) -> SegmentRelease {
        let mut release = SegmentRelease::default();
        let mut pred: *mut Segment = &mut self.seg;
        let mut sp = (*pred).next;
        while !sp.is_null() {
            let base = (*sp).base;
            let size = (*sp).size;
            let next = (*sp).next;
            if Segment::is_unused(sp) {
                if let Err(e) = self.source.unmap(base, size) {
                    heap_log!(
                        self,
                        error,
                        "{}: unmapping segment {:p} ({} bytes) failed: {:?}",
                        self.config.name,
                        base,
                        size,
                        e
                    );
                    panic!("unable to release an unused segment");
                }
                release.segments += 1;
                release.bytes += size;
                self.footprint -= size;
                self.seg_count -= 1;
                (*pred).next = next;
                heap_log!(
                    self,
                    debug,
                    "{}: released segment {:p} ({} bytes)",
                    self.config.name,
                    base,
                    size
                );
            } else {
                pred = sp;
            }
            sp = next;
        }
        if self.config.madvise && self.footprint != self.max_footprint {
            release.advised = self.release_physical_mem();
        }
        release
    }

    /// Return the interior pages of up to `MAX_ADVISE_CHUNKS` large free
    /// chunks to the OS. Returns the number of bytes advised.
    unsafe fn release_physical_mem(&mut self) -> usize {
        self.advise_low -= 1;
        self.advise_high -= 1;
        if self.advise_low == ADVISE_FLOOR_IDX {
            self.advise_low = ADVISE_LOW_IDX;
            self.advise_high = ADVISE_HIGH_IDX;
        }

        // Breadth first over each tree in the window.
        let mut queue = [null_mut::<TreeChunk>(); MAX_ADVISE_CHUNKS];
        let mut len = 0;
        let mut front = 0;
        for idx in (self.advise_low..=self.advise_high).rev() {
            let t = self.bins.treebin_root(idx);
            if t.is_null() {
                continue;
            }
            queue[len] = t;
            len += 1;
            while front < len {
                let node = queue[front];
                front += 1;
                for &child in (*node).child.iter() {
                    if len < MAX_ADVISE_CHUNKS && !child.is_null() {
                        queue[len] = child;
                        len += 1;
                    }
                }
            }
            if len == MAX_ADVISE_CHUNKS {
                break;
            }
        }

        let advised = queue[..len]
            .iter()
            .map(|&t| {
                let c = TreeChunk::chunk(t);
                sys::advise_chunk_interior(c as *mut u8, Chunk::size(c), size_of::<TreeChunk>())
            })
            .sum();
        heap_log!(
            self,
            debug,
            "{}: advised {} bytes from {} free chunks",
            self.config.name,
            advised,
            len
        );
        advised
    }

    ////////////////////////////////////////////////////////////
    // Segments

    pub(crate) fn head_segment(&mut self) -> *mut Segment {
        &mut self.seg
    }

    /// Every segment, newest first.
    pub(crate) fn segments(&mut self) -> Vec<*mut Segment> {
        let mut out = Vec::with_capacity(self.seg_count);
        if !self.is_initialized() {
            return out;
        }
        let mut sp = self.head_segment();
        while !sp.is_null() {
            out.push(sp);
            sp = unsafe { (*sp).next };
        }
        out
    }

    /// The first chunk of `sp` and the address where its chunks stop: `top`
    /// for the segment holding it, the segment's own record otherwise.
    pub(crate) unsafe fn segment_bounds(&self, sp: *mut Segment) -> (*mut Chunk, *mut Chunk) {
        let first = align_as_chunk((*sp).base);
        let end = if Segment::holds(sp, self.top as *mut u8) {
            self.top
        } else {
            Segment::record_chunk(sp)
        };
        (first, end)
    }

    pub(crate) unsafe fn segment_holding(&self, ptr: *mut u8) -> *mut Segment {
        if !self.is_initialized() {
            return null_mut();
        }
        let mut sp = &self.seg as *const Segment as *mut Segment;
        while !sp.is_null() {
            if Segment::holds(sp, ptr) {
                return sp;
            }
            sp = (*sp).next;
        }
        null_mut()
    }

    unsafe fn segment_ending_at(&mut self, end: *mut u8) -> *mut Segment {
        let mut sp = self.head_segment();
        while !sp.is_null() && Segment::top(sp) != end {
            sp = (*sp).next;
        }
        sp
    }

    /// Whether some segment record lives inside `ss`.
    unsafe fn has_segment_link(&self, ss: *mut Segment) -> bool {
        let mut sp = &self.seg as *const Segment as *mut Segment;
        while !sp.is_null() {
            if Segment::holds(ss, sp as *mut u8) {
                return true;
            }
            sp = (*sp).next;
        }
        false
    }

    ////////////////////////////////////////////////////////////
    // Checks and header helpers

    fn ok_address<T>(&self, p: *mut T) -> bool {
        p as *mut u8 >= self.least_addr
    }

    fn ok_next(&self, p: *mut Chunk, n: *mut Chunk) -> bool {
        p < n
    }

    unsafe fn unlink_chunk(&mut self, p: *mut Chunk, size: usize) {
        let least = self.least_addr;
        if let Err(e) = self.bins.unlink_chunk(p, size, least) {
            self.corruption_error(e);
        }
    }

    unsafe fn unlink_large_chunk(&mut self, t: *mut TreeChunk) {
        let least = self.least_addr;
        if let Err(e) = self.bins.unlink_large_chunk(t, least) {
            self.corruption_error(e);
        }
    }

    unsafe fn unlink_first_small_chunk(&mut self, b: *mut Chunk, p: *mut Chunk, idx: u32) {
        let least = self.least_addr;
        if let Err(e) = self.bins.unlink_first_small_chunk(b, p, idx, least) {
            self.corruption_error(e);
        }
    }

    /// Log what the heap looked like and give up.
    #[cold]
    pub(crate) fn corruption_error(&self, c: Corruption) -> ! {
        heap_log!(
            self,
            error,
            "{}: heap corruption: {}; top {:p} ({} bytes), dv {:p} ({} bytes), footprint {}, max footprint {}",
            self.config.name,
            c,
            self.top,
            self.topsize,
            self.dv,
            self.dvsize,
            self.footprint,
            self.max_footprint
        );
        panic!("heap corruption: {}", c);
    }

    #[cfg(feature = "footers")]
    fn cookie(&self) -> usize {
        self.bins.addr() ^ params::params().magic
    }

    #[cfg(feature = "footers")]
    unsafe fn mark_inuse_foot(&self, p: *mut Chunk, size: usize) {
        (*Chunk::plus_offset(p, size)).prev_foot = self.cookie();
    }

    #[cfg(not(feature = "footers"))]
    unsafe fn mark_inuse_foot(&self, _p: *mut Chunk, _size: usize) {}

    #[cfg(feature = "footers")]
    unsafe fn check_footer(&self, p: *mut Chunk, size: usize) {
        if (*Chunk::plus_offset(p, size)).prev_foot != self.cookie() {
            self.corruption_error(Corruption::BadFooter(p as usize));
        }
    }

    #[cfg(not(feature = "footers"))]
    unsafe fn check_footer(&self, _p: *mut Chunk, _size: usize) {}

    unsafe fn set_inuse(&self, p: *mut Chunk, size: usize) {
        Chunk::set_inuse(p, size);
        self.mark_inuse_foot(p, size);
    }

    unsafe fn set_inuse_and_pinuse(&self, p: *mut Chunk, size: usize) {
        Chunk::set_inuse_and_pinuse(p, size);
        self.mark_inuse_foot(p, size);
    }

    unsafe fn set_size_and_pinuse_of_inuse_chunk(&self, p: *mut Chunk, size: usize) {
        Chunk::set_size_and_pinuse_of_inuse_chunk(p, size);
        self.mark_inuse_foot(p, size);
    }

    ////////////////////////////////////////////////////////////
    // Teardown

    unsafe fn destroy(&mut self) {
        for mem in self.mmaps.live() {
            let p = Chunk::from_mem(mem);
            let offset = (*p).prev_foot;
            let total = Chunk::size(p) + offset + MMAP_FOOT_PAD;
            if let Err(e) = self.source.unmap((p as *mut u8).sub(offset), total) {
                heap_log!(
                    self,
                    error,
                    "{}: unmapping object {:p} failed: {:?}",
                    self.config.name,
                    mem,
                    e
                );
            }
        }

        if self.is_initialized() {
            // Records live inside the segments they describe, so copy each
            // one out before unmapping its segment.
            let mut seg = self.seg;
            loop {
                let next = seg.next;
                if !seg.base.is_null() && seg.size != 0 {
                    if let Err(e) = self.source.unmap(seg.base, seg.size) {
                        heap_log!(
                            self,
                            error,
                            "{}: unmapping segment {:p} failed: {:?}",
                            self.config.name,
                            seg.base,
                            e
                        );
                    }
                }
                if next.is_null() {
                    break;
                }
                seg = ptr::read(next);
            }
        }

        if !self.mmap_cache.is_null() && self.mmap_cache_size != 0 {
            if let Err(e) = self.source.unmap(self.mmap_cache, self.mmap_cache_size) {
                heap_log!(
                    self,
                    error,
                    "{}: unmapping the mmap cache failed: {:?}",
                    self.config.name,
                    e
                );
            }
        }
        self.mmap_cache = null_mut();
        self.mmap_cache_size = 0;
        self.mmaps.release(&mut self.source);

        self.seg = Segment::empty();
        self.seg_count = 0;
        self.top = null_mut();
        self.topsize = 0;
        self.dv = null_mut();
        self.dvsize = 0;
        self.footprint = 0;
        heap_log!(self, debug, "{}: heap destroyed", self.config.name);
    }
}

impl<G: PageSource> Drop for RawHeap<G> {
    fn drop(&mut self) {
        unsafe { self.destroy() }
    }
}

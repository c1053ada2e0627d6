//! Whole-heap consistency checks.
//!
//! `RawHeap::stats` walks every segment chunk by chunk, then every bin and
//! the mmap side-table, counting each broken invariant it finds. Tests call it
//! after every step; it is far too slow for anything else.

use std::collections::HashSet;

use crate::bins::Bins;
use crate::chunk::{
    compute_tree_index, small_index, Chunk, TreeChunk, CHUNK_ALIGN_MASK, MIN_CHUNK_SIZE,
    NSMALLBINS, NTREEBINS,
};
use crate::heap::RawHeap;
use crate::sys::PageSource;

/// Validity contains a count of every invalid state found in a heap.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Chunks whose size is not aligned or is below the minimum chunk size.
    pub misaligned: usize,
    /// Adjacent chunks where `PINUSE` of the second disagrees with `CINUSE`
    /// of the first.
    pub inuse_mismatches: usize,
    /// Free chunks followed directly by another free chunk.
    pub adjacent_frees: usize,
    /// Binned chunks in the wrong bin, bins listed twice, bitmap bits that
    /// disagree with bin occupancy, or in-use chunks found in a bin.
    pub bin_mismatches: usize,
    /// Free chunks that are neither `dv` nor linked into a bin.
    pub unbinned: usize,
    /// Inconsistencies in the mmap side-table.
    pub table_mismatches: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        *self == Validity::default()
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub segments: usize,
    pub in_use_chunks: usize,
    /// Bytes in in-use segment chunks.
    pub in_use_bytes: usize,
    pub free_chunks: usize,
    /// Bytes in free chunks, `dv` included and `top` excluded.
    pub free_bytes: usize,
    pub mmapped_chunks: usize,
    pub mmapped_bytes: usize,
    pub topsize: usize,
    pub dvsize: usize,
    pub footprint: usize,
}

unsafe fn tree_chunks(root: *mut TreeChunk, out: &mut Vec<*mut Chunk>) {
    let mut stack = vec![root];
    while let Some(t) = stack.pop() {
        if t.is_null() {
            continue;
        }
        let mut u = t;
        loop {
            out.push(TreeChunk::chunk(u));
            u = TreeChunk::next(u);
            if u == t {
                break;
            }
        }
        stack.push((*t).child[0]);
        stack.push((*t).child[1]);
    }
}

/// Check bin indexes and bitmaps, recording every binned chunk in `seen`.
unsafe fn check_bins(bins: &Bins, seen: &mut HashSet<usize>, validity: &mut Validity) {
    for idx in 0..NSMALLBINS as u32 {
        // Unlinking the last chunk only clears the map bit and leaves the
        // sentinel's links stale, so the map alone says whether a bin is empty.
        if !bins.smallmap_is_marked(idx) {
            continue;
        }
        let b = bins.smallbin_ptr(idx);
        if (*b).fd == b {
            validity.bin_mismatches += 1;
            continue;
        }
        let mut p = (*b).fd;
        while p != b {
            if small_index(Chunk::size(p)) != idx || !seen.insert(p as usize) {
                validity.bin_mismatches += 1;
                break;
            }
            p = (*p).fd;
        }
    }
    for idx in 0..NTREEBINS as u32 {
        let root = bins.treebin_root(idx);
        if root.is_null() == bins.treemap_is_marked(idx) {
            validity.bin_mismatches += 1;
            continue;
        }
        let mut chunks = Vec::new();
        tree_chunks(root, &mut chunks);
        for p in chunks {
            if compute_tree_index(Chunk::size(p)) != idx || !seen.insert(p as usize) {
                validity.bin_mismatches += 1;
            }
        }
    }
}

impl<G: PageSource> RawHeap<G> {
    /// Walk the whole heap, checking its invariants.
    pub fn stats(&mut self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats {
            topsize: self.topsize,
            dvsize: self.dvsize,
            footprint: self.footprint,
            ..Default::default()
        };

        unsafe {
            let mut binned = HashSet::new();
            check_bins(&self.bins, &mut binned, &mut validity);
            for shard in self.bins.shards().iter() {
                check_bins(shard, &mut binned, &mut validity);
            }

            for sp in self.segments() {
                stats.segments += 1;
                let (mut p, end) = self.segment_bounds(sp);
                while p < end {
                    let size = Chunk::size(p);
                    if size & CHUNK_ALIGN_MASK != 0 || size < MIN_CHUNK_SIZE {
                        validity.misaligned += 1;
                        break;
                    }
                    let next = Chunk::plus_offset(p, size);
                    if Chunk::pinuse(next) != Chunk::cinuse(p) {
                        validity.inuse_mismatches += 1;
                    }
                    if Chunk::cinuse(p) {
                        stats.in_use_chunks += 1;
                        stats.in_use_bytes += size;
                        if binned.contains(&(p as usize)) {
                            validity.bin_mismatches += 1;
                        }
                    } else {
                        stats.free_chunks += 1;
                        stats.free_bytes += size;
                        if !Chunk::cinuse(next) {
                            validity.adjacent_frees += 1;
                        }
                        if p != self.dv && !binned.contains(&(p as usize)) {
                            validity.unbinned += 1;
                        }
                    }
                    p = next;
                }
                if p != end {
                    validity.misaligned += 1;
                }
            }

            if !self.dv.is_null() && binned.contains(&(self.dv as usize)) {
                validity.bin_mismatches += 1;
            }
            if !self.top.is_null() && binned.contains(&(self.top as usize)) {
                validity.bin_mismatches += 1;
            }

            validity.table_mismatches += self.mmaps.check();
            for mem in self.mmaps.live() {
                let p = Chunk::from_mem(mem);
                if !Chunk::mmapped(p) {
                    validity.table_mismatches += 1;
                }
                stats.mmapped_chunks += 1;
                stats.mmapped_bytes += Chunk::size(p);
            }
        }

        (validity, stats)
    }

    /// Bytes held by in-use chunks, directly mapped ones included.
    pub fn malloc_size(&mut self) -> usize {
        let (_, stats) = self.stats();
        stats.in_use_bytes + stats.mmapped_bytes
    }
}

#[cfg(test)]
mod tests {
    use crate::chunk::{pad_request, MMAP_CHUNK_OVERHEAD};
    use crate::config::HeapConfig;
    use crate::heap::RawHeap;
    use crate::sys::LibcPages;
    use test_env_log::test;

    #[test]
    fn fresh_heap_is_valid() {
        let mut h = RawHeap::new(HeapConfig::default(), LibcPages::default()).unwrap();
        let (validity, stats) = h.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.segments, 0);
        assert_eq!(h.malloc_size(), 0);
    }

    #[test]
    fn counts_live_and_free_chunks() {
        let mut h = RawHeap::new(HeapConfig::default(), LibcPages::default()).unwrap();
        let small = pad_request(64);
        let mid = pad_request(5000);
        unsafe {
            let a = h.allocate(64);
            let b = h.allocate(64);
            let c = h.allocate(5000);
            let _d = h.allocate(64);
            let big = h.allocate(400 * 1024);
            h.free(b);

            let (validity, stats) = h.stats();
            assert_eq!(validity, Default::default());
            assert_eq!(stats.segments, 1);
            assert_eq!(stats.in_use_chunks, 3);
            assert_eq!(stats.free_chunks, 1);
            assert_eq!(stats.free_bytes, small);
            assert_eq!(stats.mmapped_chunks, 1);
            assert_eq!(stats.in_use_bytes, 2 * small + mid);
            assert_eq!(
                h.malloc_size(),
                2 * small + mid + RawHeap::<LibcPages>::usable_size(big) + MMAP_CHUNK_OVERHEAD
            );

            // `c` merges with the free chunk before it.
            h.free(c);
            let (validity, stats) = h.stats();
            assert!(validity.is_valid());
            assert_eq!(stats.free_chunks, 1);
            assert_eq!(stats.free_bytes, small + mid);
            h.free(a);
            h.free(big);
            assert!(bool::from(h.stats().0));
        }
    }

    #[test]
    fn emptied_small_bin_is_valid() {
        let mut h = RawHeap::with_capacity(HeapConfig::default(), LibcPages::default(), 0).unwrap();
        unsafe {
            let a = h.allocate(64);
            let _guard = h.allocate(64);
            h.free(a);
            assert_eq!(h.stats().1.free_chunks, 1);
            // Taking the only chunk back out empties its bin.
            assert_eq!(h.allocate(64), a);
            let (validity, stats) = h.stats();
            assert!(validity.is_valid(), "{:?}", validity);
            assert_eq!(stats.free_chunks, 0);

            // The same through coalescing: `b` leaves its bin to merge with `c`.
            let b = h.allocate(100);
            let c = h.allocate(3000);
            let _guard = h.allocate(64);
            h.free(b);
            h.free(c);
            let (validity, stats) = h.stats();
            assert!(validity.is_valid(), "{:?}", validity);
            assert_eq!(stats.free_chunks, 1);
        }
    }

    #[test]
    fn clobbered_header_is_reported() {
        let mut h = RawHeap::new(HeapConfig::default(), LibcPages::default()).unwrap();
        unsafe {
            let a = h.allocate(64);
            let b = h.allocate(64);
            let _c = h.allocate(64);
            h.free(b);
            // Claim `b` is still in use without telling its neighbour.
            let p = crate::chunk::Chunk::from_mem(b);
            (*p).head |= crate::chunk::INUSE;
            let (validity, _) = h.stats();
            assert!(!validity.is_valid());
            assert!(validity.inuse_mismatches > 0 || validity.bin_mismatches > 0);
            (*p).head &= !crate::chunk::CINUSE;
            assert!(h.stats().0.is_valid());
            h.free(a);
        }
    }
}

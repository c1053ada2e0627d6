//! Small bins and tree bins.
//!
//! A `Bins` holds the 32 exact-size small bins with their `smallmap` and the
//! 32 bitwise tries of large chunks with their `treemap`. The heap owns one
//! global set and one more per shard, all in a single [`BinBlock`]. The
//! sweeper fills the shards and drains them into the global set once a sweep
//! is finished.
//!
//! Small bins are circular lists threaded through real sentinel chunks. A
//! tree root's `parent` points back at its bin slot.

use core::fmt;
use core::mem::size_of;
use core::ops::{Deref, DerefMut};
use core::ptr::{null_mut, NonNull};
use core::slice;
use std::alloc::{handle_alloc_error, GlobalAlloc, Layout, System};

use crate::chunk::{
    compute_tree_index, is_small, leftshift_for_tree_index, small_index, small_index2size, Chunk,
    TreeChunk, MIN_CHUNK_SIZE, NSMALLBINS, NTREEBINS,
};

/// A broken invariant found while walking heap metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// A pointer below the lowest address the heap ever mapped.
    BadAddress(usize),
    /// A chunk expected to be in use is not.
    NotInUse(usize),
    /// A chunk's successor does not lie after it, or disagrees on `PINUSE`.
    BadNext(usize),
    /// A free-list neighbour does not link back.
    BrokenLink(usize),
    /// A tree node's parent or child pointers are inconsistent.
    BrokenTree(usize),
    /// A chunk footer does not carry this heap's cookie.
    BadFooter(usize),
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Corruption::BadAddress(a) => write!(f, "address {:#x} outside the heap", a),
            Corruption::NotInUse(a) => write!(f, "chunk {:#x} is not in use", a),
            Corruption::BadNext(a) => write!(f, "chunk {:#x} has an invalid successor", a),
            Corruption::BrokenLink(a) => write!(f, "free list link broken at {:#x}", a),
            Corruption::BrokenTree(a) => write!(f, "tree bin node {:#x} is inconsistent", a),
            Corruption::BadFooter(a) => write!(f, "chunk {:#x} has a foreign footer", a),
        }
    }
}

fn ok_address<T>(p: *mut T, least: *mut u8) -> bool {
    p as *mut u8 >= least
}

const EMPTY_CHUNK: Chunk = Chunk {
    prev_foot: 0,
    head: 0,
    tag: 0,
    mark: 0,
    fd: null_mut(),
    bk: null_mut(),
};

pub struct Bins {
    pub smallmap: u32,
    pub treemap: u32,
    smallbins: [Chunk; NSMALLBINS],
    treebins: [*mut TreeChunk; NTREEBINS],
    /// Chunks inserted since the last reset.
    pub inserted: usize,
}

unsafe impl Send for Bins {}

impl Bins {
    const EMPTY: Bins = Bins {
        smallmap: 0,
        treemap: 0,
        smallbins: [EMPTY_CHUNK; NSMALLBINS],
        treebins: [null_mut(); NTREEBINS],
        inserted: 0,
    };

    /// Forget every chunk in these bins.
    pub fn reset(&mut self) {
        self.smallmap = 0;
        self.treemap = 0;
        self.inserted = 0;
        for i in 0..NSMALLBINS as u32 {
            let b = self.smallbin_at(i);
            unsafe {
                (*b).fd = b;
                (*b).bk = b;
            }
        }
        for t in self.treebins.iter_mut() {
            *t = null_mut();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.smallmap == 0 && self.treemap == 0
    }

    pub fn smallbin_at(&mut self, idx: u32) -> *mut Chunk {
        &mut self.smallbins[idx as usize]
    }

    pub fn treebin_at(&mut self, idx: u32) -> *mut *mut TreeChunk {
        &mut self.treebins[idx as usize]
    }

    // Read-only views of the bin heads, for walks that never write.
    pub(crate) fn smallbin_ptr(&self, idx: u32) -> *mut Chunk {
        &self.smallbins[idx as usize] as *const Chunk as *mut Chunk
    }

    pub fn treebin_root(&self, idx: u32) -> *mut TreeChunk {
        self.treebins[idx as usize]
    }

    pub fn smallmap_is_marked(&self, idx: u32) -> bool {
        self.smallmap & (1 << idx) != 0
    }

    fn mark_smallmap(&mut self, idx: u32) {
        self.smallmap |= 1 << idx;
    }

    fn clear_smallmap(&mut self, idx: u32) {
        self.smallmap &= !(1 << idx);
    }

    pub fn treemap_is_marked(&self, idx: u32) -> bool {
        self.treemap & (1 << idx) != 0
    }

    fn mark_treemap(&mut self, idx: u32) {
        self.treemap |= 1 << idx;
    }

    fn clear_treemap(&mut self, idx: u32) {
        self.treemap &= !(1 << idx);
    }

    /// Link a free chunk of `size` bytes into the bin for its size.
    ///
    /// # Safety
    ///
    /// `p` must be a free chunk of `size` bytes that is in no other bin.
    pub unsafe fn insert_chunk(&mut self, p: *mut Chunk, size: usize) {
        if is_small(size) {
            self.insert_small_chunk(p, size);
        } else {
            self.insert_large_chunk(p as *mut TreeChunk, size);
        }
    }

    pub unsafe fn insert_small_chunk(&mut self, p: *mut Chunk, size: usize) {
        let idx = small_index(size);
        let b = self.smallbin_at(idx);
        let mut f = b;
        debug_assert!(size >= MIN_CHUNK_SIZE);
        if !self.smallmap_is_marked(idx) {
            self.mark_smallmap(idx);
        } else {
            f = (*b).fd;
        }
        (*b).fd = p;
        (*f).bk = p;
        (*p).fd = f;
        (*p).bk = b;
        self.inserted += 1;
    }

    pub unsafe fn insert_large_chunk(&mut self, x: *mut TreeChunk, size: usize) {
        let idx = compute_tree_index(size);
        let h = self.treebin_at(idx);
        (*x).index = idx;
        (*x).child = [null_mut(); 2];
        let xc = TreeChunk::chunk(x);
        self.inserted += 1;
        if !self.treemap_is_marked(idx) {
            self.mark_treemap(idx);
            *h = x;
            (*x).parent = h as *mut TreeChunk;
            (*xc).fd = xc;
            (*xc).bk = xc;
            return;
        }

        let mut t = *h;
        let mut k = size << leftshift_for_tree_index(idx);
        loop {
            if Chunk::size(TreeChunk::chunk(t)) != size {
                let c = &mut (*t).child[(k >> (size_of::<usize>() * 8 - 1)) & 1];
                k <<= 1;
                if !c.is_null() {
                    t = *c;
                } else {
                    *c = x;
                    (*x).parent = t;
                    (*xc).fd = xc;
                    (*xc).bk = xc;
                    return;
                }
            } else {
                // Same size: chain behind the parented node.
                let tc = TreeChunk::chunk(t);
                let f = (*tc).fd;
                (*tc).fd = xc;
                (*f).bk = xc;
                (*xc).fd = f;
                (*xc).bk = tc;
                (*x).parent = null_mut();
                return;
            }
        }
    }

    /// Unlink a free chunk of `size` bytes from its bin.
    ///
    /// # Safety
    ///
    /// `p` must be a chunk of `size` bytes linked into these bins.
    pub unsafe fn unlink_chunk(
        &mut self,
        p: *mut Chunk,
        size: usize,
        least: *mut u8,
    ) -> Result<(), Corruption> {
        if is_small(size) {
            self.unlink_small_chunk(p, size, least)
        } else {
            self.unlink_large_chunk(p as *mut TreeChunk, least)
        }
    }

    pub unsafe fn unlink_small_chunk(
        &mut self,
        p: *mut Chunk,
        size: usize,
        least: *mut u8,
    ) -> Result<(), Corruption> {
        let f = (*p).fd;
        let b = (*p).bk;
        let idx = small_index(size);
        let bin = self.smallbin_at(idx);
        debug_assert!(p != b);
        debug_assert!(p != f);
        debug_assert_eq!(Chunk::size(p), small_index2size(idx));
        if !(f == bin || (ok_address(f, least) && (*f).bk == p)) {
            return Err(Corruption::BrokenLink(f as usize));
        }
        if b == f {
            self.clear_smallmap(idx);
        } else if b == bin || (ok_address(b, least) && (*b).fd == p) {
            (*f).bk = b;
            (*b).fd = f;
        } else {
            return Err(Corruption::BrokenLink(b as usize));
        }
        Ok(())
    }

    /// Unlink `p`, the first chunk of small bin `idx` headed by `b`.
    pub unsafe fn unlink_first_small_chunk(
        &mut self,
        b: *mut Chunk,
        p: *mut Chunk,
        idx: u32,
        least: *mut u8,
    ) -> Result<(), Corruption> {
        let f = (*p).fd;
        debug_assert!(p != b);
        debug_assert!(p != f);
        debug_assert_eq!(Chunk::size(p), small_index2size(idx));
        if b == f {
            self.clear_smallmap(idx);
        } else if ok_address(f, least) && (*f).bk == p {
            (*f).bk = b;
            (*b).fd = f;
        } else {
            return Err(Corruption::BrokenLink(f as usize));
        }
        Ok(())
    }

    pub unsafe fn unlink_large_chunk(
        &mut self,
        x: *mut TreeChunk,
        least: *mut u8,
    ) -> Result<(), Corruption> {
        let xp = (*x).parent;
        let mut r;
        if TreeChunk::prev(x) != x {
            let f = TreeChunk::next(x);
            r = TreeChunk::prev(x);
            if !(ok_address(f, least) && TreeChunk::prev(f) == x && TreeChunk::next(r) == x) {
                return Err(Corruption::BrokenLink(x as usize));
            }
            (*f).chunk.bk = TreeChunk::chunk(r);
            (*r).chunk.fd = TreeChunk::chunk(f);
        } else {
            let mut rp: *mut *mut TreeChunk = &mut (*x).child[1];
            r = *rp;
            if r.is_null() {
                rp = &mut (*x).child[0];
                r = *rp;
            }
            if !r.is_null() {
                loop {
                    let mut cp: *mut *mut TreeChunk = &mut (*r).child[1];
                    if (*cp).is_null() {
                        cp = &mut (*r).child[0];
                    }
                    if (*cp).is_null() {
                        break;
                    }
                    rp = cp;
                    r = *rp;
                }
                if !ok_address(rp, least) {
                    return Err(Corruption::BrokenTree(x as usize));
                }
                *rp = null_mut();
            }
        }

        if xp.is_null() {
            return Ok(());
        }

        let h = self.treebin_at((*x).index);
        if x == *h {
            *h = r;
            if r.is_null() {
                self.clear_treemap((*x).index);
            }
        } else if ok_address(xp, least) {
            if (*xp).child[0] == x {
                (*xp).child[0] = r;
            } else {
                (*xp).child[1] = r;
            }
        } else {
            return Err(Corruption::BrokenTree(x as usize));
        }

        if !r.is_null() {
            if !ok_address(r, least) {
                return Err(Corruption::BrokenTree(r as usize));
            }
            (*r).parent = xp;
            let c0 = (*x).child[0];
            if !c0.is_null() {
                if !ok_address(c0, least) {
                    return Err(Corruption::BrokenTree(c0 as usize));
                }
                (*r).child[0] = c0;
                (*c0).parent = r;
            }
            let c1 = (*x).child[1];
            if !c1.is_null() {
                if !ok_address(c1, least) {
                    return Err(Corruption::BrokenTree(c1 as usize));
                }
                (*r).child[1] = c1;
                (*c1).parent = r;
            }
        }
        Ok(())
    }

    /// Whether `chunk` is linked into these bins.
    pub unsafe fn bin_find(&self, chunk: *mut Chunk) -> bool {
        let size = Chunk::size(chunk);
        if is_small(size) {
            let idx = small_index(size);
            let b = self.smallbin_ptr(idx);
            if !self.smallmap_is_marked(idx) {
                return false;
            }
            let mut p = (*b).fd;
            while p != b {
                if p == chunk {
                    return true;
                }
                p = (*p).fd;
            }
            false
        } else {
            let idx = compute_tree_index(size);
            if !self.treemap_is_marked(idx) {
                return false;
            }
            let mut t = self.treebin_root(idx);
            let mut sizebits = size << leftshift_for_tree_index(idx);
            while !t.is_null() && Chunk::size(TreeChunk::chunk(t)) != size {
                t = (*t).child[(sizebits >> (size_of::<usize>() * 8 - 1)) & 1];
                sizebits <<= 1;
            }
            if t.is_null() {
                return false;
            }
            let target = chunk as *mut TreeChunk;
            let mut u = t;
            loop {
                if u == target {
                    return true;
                }
                u = TreeChunk::next(u);
                if u == t {
                    return false;
                }
            }
        }
    }

    /// Every chunk linked into these bins, small bins first.
    pub unsafe fn chunks(&self) -> Vec<*mut Chunk> {
        let mut out = Vec::new();
        for idx in 0..NSMALLBINS as u32 {
            if !self.smallmap_is_marked(idx) {
                continue;
            }
            let b = self.smallbin_ptr(idx);
            let mut p = (*b).fd;
            while p != b {
                out.push(p);
                p = (*p).fd;
            }
        }
        let mut stack: Vec<*mut TreeChunk> = Vec::new();
        for idx in 0..NTREEBINS as u32 {
            if !self.treemap_is_marked(idx) {
                continue;
            }
            stack.push(self.treebin_root(idx));
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
        out
    }

    /// Move every chunk of these bins into `dest`, leaving these bins empty.
    /// Returns how many chunks moved.
    pub unsafe fn drain_into(&mut self, dest: &mut Bins) -> usize {
        // Links are rewritten on insertion, so collect first.
        let chunks = self.chunks();
        let inserted = self.inserted;
        self.reset();
        self.inserted = inserted;
        for &p in chunks.iter() {
            dest.insert_chunk(p, Chunk::size(p));
        }
        chunks.len()
    }
}

/// The global bins followed by `shards` more sets, in one block from the
/// system allocator.
///
/// A heap serving as the global allocator builds its bins while holding its
/// own lock, so they cannot come from the global allocator. The sentinels
/// link to themselves, so the block never moves. It derefs to the global
/// set.
pub struct BinBlock {
    ptr: NonNull<Bins>,
    shards: usize,
}

unsafe impl Send for BinBlock {}

impl BinBlock {
    pub fn new(shards: usize) -> Self {
        let layout = Self::layout(shards);
        let raw = unsafe { System.alloc(layout) } as *mut Bins;
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => handle_alloc_error(layout),
        };
        for i in 0..=shards {
            unsafe {
                let bins = ptr.as_ptr().add(i);
                bins.write(Bins::EMPTY);
                (*bins).reset();
            }
        }
        BinBlock { ptr, shards }
    }

    fn layout(shards: usize) -> Layout {
        match Layout::array::<Bins>(shards + 1) {
            Ok(layout) => layout,
            Err(_) => panic!("{} bin shards do not fit in memory", shards),
        }
    }

    fn all(&self) -> &[Bins] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.shards + 1) }
    }

    fn all_mut(&mut self) -> &mut [Bins] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.shards + 1) }
    }

    /// Address of the block, stable for its whole life.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn shards(&self) -> &[Bins] {
        &self.all()[1..]
    }

    pub fn shards_mut(&mut self) -> &mut [Bins] {
        &mut self.all_mut()[1..]
    }

    /// The global set and the shards, borrowed together.
    pub fn split_mut(&mut self) -> (&mut Bins, &mut [Bins]) {
        let (global, shards) = self.all_mut().split_at_mut(1);
        (&mut global[0], shards)
    }
}

impl Deref for BinBlock {
    type Target = Bins;

    fn deref(&self) -> &Bins {
        unsafe { self.ptr.as_ref() }
    }
}

impl DerefMut for BinBlock {
    fn deref_mut(&mut self) -> &mut Bins {
        unsafe { self.ptr.as_mut() }
    }
}

impl Drop for BinBlock {
    fn drop(&mut self) {
        unsafe { System.dealloc(self.ptr.as_ptr() as *mut u8, Self::layout(self.shards)) };
    }
}

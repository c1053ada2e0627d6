//! Chunk, tree chunk and segment records, and the arithmetic on their headers.
//!
//! ## Layout
//!
//! Every chunk starts with two words, `prev_foot` and `head`, followed by two
//! 32-bit metadata words (the tag word and the mark word) that sit directly
//! before the payload:
//!
//! ```text
//!  chunk ->  +-----------+
//!            | prev_foot |  size of the previous chunk, if it is free
//!            +-----------+
//!            | head      |  size | FLAG4 | CINUSE | PINUSE
//!            +-----------+
//!            | tag | mark|  two u32 words
//!   mem ->   +-----------+
//!            | fd / bk   |  free-list links, only while free
//!            | ...       |
//! ```
//!
//! Payload pointers are 16-byte aligned, so chunk addresses are 8 mod 16.

use core::mem::size_of;
use core::ptr;

use static_assertions::const_assert;

pub const MALLOC_ALIGNMENT: usize = 16;
pub const CHUNK_ALIGN_MASK: usize = MALLOC_ALIGNMENT - 1;

const WORD: usize = size_of::<usize>();

/// Bytes of per-object metadata (tag word and mark word) ahead of the payload.
pub const META_SIZE: usize = 2 * size_of::<u32>();

/// Distance from the start of a chunk to its payload.
pub const MEM_OFFSET: usize = 2 * WORD + META_SIZE;

/// Bytes of an in-use chunk not available to the payload. The payload of an
/// in-use chunk runs over the `prev_foot` word of the chunk after it, unless
/// that word carries a footer cookie.
pub const CHUNK_OVERHEAD: usize = if cfg!(feature = "footers") {
    2 * WORD + META_SIZE
} else {
    WORD + META_SIZE
};

pub const MMAP_CHUNK_OVERHEAD: usize = 2 * WORD + META_SIZE;
pub const MMAP_FOOT_PAD: usize = 4 * WORD;

pub const NSMALLBINS: usize = 32;
pub const NTREEBINS: usize = 32;
pub const SMALLBIN_SHIFT: usize = 3;
pub const TREEBIN_SHIFT: usize = 8;
pub const MIN_LARGE_SIZE: usize = 1 << TREEBIN_SHIFT;
pub const MAX_SMALL_SIZE: usize = MIN_LARGE_SIZE - 1;
pub const MAX_SMALL_REQUEST: usize = MAX_SMALL_SIZE - CHUNK_ALIGN_MASK - CHUNK_OVERHEAD;

pub const MIN_CHUNK_SIZE: usize = align_up(size_of::<Chunk>(), MALLOC_ALIGNMENT);
pub const MAX_REQUEST: usize = MIN_CHUNK_SIZE.wrapping_neg() << 2;
pub const MIN_REQUEST: usize = MIN_CHUNK_SIZE - CHUNK_OVERHEAD - 1;

/// Space kept free at the end of the top segment so a segment record and its
/// fenceposts can always be written there.
pub const TOP_FOOT_SIZE: usize =
    align_offset(MEM_OFFSET) + pad_request(size_of::<Segment>()) + MIN_CHUNK_SIZE;

pub const PINUSE: usize = 1 << 0;
pub const CINUSE: usize = 1 << 1;
pub const FLAG4: usize = 1 << 2;
pub const INUSE: usize = PINUSE | CINUSE;
pub const FLAG_BITS: usize = PINUSE | CINUSE | FLAG4;
pub const FENCEPOST_HEAD: usize = INUSE | WORD;

// Segment flags
pub const USE_MMAP_BIT: u32 = 1;
pub const EXTERN_BIT: u32 = 8;
pub const IS_UNUSED_BIT: u32 = 16;

const_assert!(MALLOC_ALIGNMENT.is_power_of_two());
const_assert!(MALLOC_ALIGNMENT >= 2 * WORD);
const_assert!(MIN_CHUNK_SIZE >= size_of::<Chunk>());
const_assert!(MIN_LARGE_SIZE >= size_of::<TreeChunk>());
const_assert!(MEM_OFFSET % size_of::<u32>() == 0);

pub const fn align_up(a: usize, alignment: usize) -> usize {
    (a + (alignment - 1)) & !(alignment - 1)
}

/// Bytes needed to bring `addr` up to `MALLOC_ALIGNMENT`.
pub const fn align_offset(addr: usize) -> usize {
    align_up(addr, MALLOC_ALIGNMENT) - addr
}

pub const fn pad_request(req: usize) -> usize {
    align_up(req + CHUNK_OVERHEAD, MALLOC_ALIGNMENT)
}

pub const fn request2size(req: usize) -> usize {
    if req < MIN_REQUEST {
        MIN_CHUNK_SIZE
    } else {
        pad_request(req)
    }
}

pub fn is_aligned(a: usize) -> bool {
    a & CHUNK_ALIGN_MASK == 0
}

pub fn is_small(size: usize) -> bool {
    size >> SMALLBIN_SHIFT < NSMALLBINS
}

pub fn small_index(size: usize) -> u32 {
    (size >> SMALLBIN_SHIFT) as u32
}

pub fn small_index2size(idx: u32) -> usize {
    (idx as usize) << SMALLBIN_SHIFT
}

pub fn compute_tree_index(size: usize) -> u32 {
    let x = size >> TREEBIN_SHIFT;
    if x == 0 {
        0
    } else if x > 0xffff {
        NTREEBINS as u32 - 1
    } else {
        let k = size_of::<usize>() * 8 - 1 - (x.leading_zeros() as usize);
        ((k << 1) + ((size >> (k + TREEBIN_SHIFT - 1)) & 1)) as u32
    }
}

pub fn leftshift_for_tree_index(idx: u32) -> u32 {
    let idx = idx as usize;
    if idx == NTREEBINS - 1 {
        0
    } else {
        (size_of::<usize>() * 8 - 1 - ((idx >> 1) + TREEBIN_SHIFT - 2)) as u32
    }
}

pub fn min_size_for_tree_index(idx: u32) -> usize {
    let idx = idx as usize;
    (1 << ((idx >> 1) + TREEBIN_SHIFT)) | ((idx & 1) << ((idx >> 1) + TREEBIN_SHIFT - 1))
}

pub fn left_bits(x: u32) -> u32 {
    (x << 1) | (!(x << 1)).wrapping_add(1)
}

pub fn least_bit(x: u32) -> u32 {
    x & (!x).wrapping_add(1)
}

/// The first chunk of a region starting at `base`.
pub fn align_as_chunk(base: *mut u8) -> *mut Chunk {
    let offset = align_offset(base as usize + MEM_OFFSET);
    base.wrapping_add(offset) as *mut Chunk
}

#[repr(C)]
pub struct Chunk {
    pub prev_foot: usize,
    pub head: usize,
    pub tag: u32,
    pub mark: u32,
    pub fd: *mut Chunk,
    pub bk: *mut Chunk,
}

#[repr(C)]
pub struct TreeChunk {
    pub chunk: Chunk,
    pub child: [*mut TreeChunk; 2],
    pub parent: *mut TreeChunk,
    pub index: u32,
}

/// A contiguous region mapped from the OS. The head segment lives in the
/// heap state; every other record lives in a small in-use chunk at the tail
/// of the segment it describes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Segment {
    pub base: *mut u8,
    pub size: usize,
    pub next: *mut Segment,
    pub flags: u32,
}

impl Segment {
    pub const fn empty() -> Segment {
        Segment {
            base: ptr::null_mut(),
            size: 0,
            next: ptr::null_mut(),
            flags: 0,
        }
    }

    pub unsafe fn top(seg: *mut Segment) -> *mut u8 {
        (*seg).base.add((*seg).size)
    }

    pub unsafe fn holds(seg: *mut Segment, addr: *mut u8) -> bool {
        (*seg).base <= addr && addr < Segment::top(seg)
    }

    pub unsafe fn is_mmapped(seg: *mut Segment) -> bool {
        (*seg).flags & USE_MMAP_BIT != 0
    }

    pub unsafe fn is_extern(seg: *mut Segment) -> bool {
        (*seg).flags & EXTERN_BIT != 0
    }

    pub unsafe fn is_unused(seg: *mut Segment) -> bool {
        (*seg).flags & IS_UNUSED_BIT != 0
    }

    /// The chunk holding a segment record, for records stored in-heap.
    pub unsafe fn record_chunk(seg: *mut Segment) -> *mut Chunk {
        Chunk::from_mem(seg as *mut u8)
    }
}

impl Chunk {
    pub unsafe fn size(me: *mut Chunk) -> usize {
        (*me).head & !FLAG_BITS
    }

    pub unsafe fn next(me: *mut Chunk) -> *mut Chunk {
        (me as *mut u8).add(Chunk::size(me)) as *mut Chunk
    }

    pub unsafe fn prev(me: *mut Chunk) -> *mut Chunk {
        (me as *mut u8).sub((*me).prev_foot) as *mut Chunk
    }

    pub unsafe fn cinuse(me: *mut Chunk) -> bool {
        (*me).head & CINUSE != 0
    }

    pub unsafe fn pinuse(me: *mut Chunk) -> bool {
        (*me).head & PINUSE != 0
    }

    pub unsafe fn clear_pinuse(me: *mut Chunk) {
        (*me).head &= !PINUSE;
    }

    pub unsafe fn inuse(me: *mut Chunk) -> bool {
        (*me).head & INUSE != PINUSE
    }

    /// Directly mapped chunks carry neither in-use bit.
    pub unsafe fn mmapped(me: *mut Chunk) -> bool {
        (*me).head & INUSE == 0
    }

    pub unsafe fn set_inuse(me: *mut Chunk, size: usize) {
        (*me).head = ((*me).head & PINUSE) | size | CINUSE;
        let next = Chunk::plus_offset(me, size);
        (*next).head |= PINUSE;
    }

    pub unsafe fn set_inuse_and_pinuse(me: *mut Chunk, size: usize) {
        (*me).head = PINUSE | size | CINUSE;
        let next = Chunk::plus_offset(me, size);
        (*next).head |= PINUSE;
    }

    pub unsafe fn set_size_and_pinuse_of_inuse_chunk(me: *mut Chunk, size: usize) {
        (*me).head = size | PINUSE | CINUSE;
    }

    pub unsafe fn set_size_and_pinuse_of_free_chunk(me: *mut Chunk, size: usize) {
        (*me).head = size | PINUSE;
        Chunk::set_foot(me, size);
    }

    pub unsafe fn set_free_with_pinuse(p: *mut Chunk, size: usize, n: *mut Chunk) {
        Chunk::clear_pinuse(n);
        Chunk::set_size_and_pinuse_of_free_chunk(p, size);
    }

    pub unsafe fn set_foot(me: *mut Chunk, size: usize) {
        let next = Chunk::plus_offset(me, size);
        (*next).prev_foot = size;
    }

    pub unsafe fn plus_offset(me: *mut Chunk, offset: usize) -> *mut Chunk {
        (me as *mut u8).add(offset) as *mut Chunk
    }

    pub unsafe fn minus_offset(me: *mut Chunk, offset: usize) -> *mut Chunk {
        (me as *mut u8).sub(offset) as *mut Chunk
    }

    pub unsafe fn to_mem(me: *mut Chunk) -> *mut u8 {
        (me as *mut u8).add(MEM_OFFSET)
    }

    pub unsafe fn from_mem(mem: *mut u8) -> *mut Chunk {
        mem.sub(MEM_OFFSET) as *mut Chunk
    }

    pub unsafe fn overhead_for(me: *mut Chunk) -> usize {
        if Chunk::mmapped(me) {
            MMAP_CHUNK_OVERHEAD
        } else {
            CHUNK_OVERHEAD
        }
    }
}

impl TreeChunk {
    pub unsafe fn leftmost_child(me: *mut TreeChunk) -> *mut TreeChunk {
        let left = (*me).child[0];
        if left.is_null() {
            (*me).child[1]
        } else {
            left
        }
    }

    pub unsafe fn chunk(me: *mut TreeChunk) -> *mut Chunk {
        &mut (*me).chunk
    }

    pub unsafe fn next(me: *mut TreeChunk) -> *mut TreeChunk {
        (*TreeChunk::chunk(me)).fd as *mut TreeChunk
    }

    pub unsafe fn prev(me: *mut TreeChunk) -> *mut TreeChunk {
        (*TreeChunk::chunk(me)).bk as *mut TreeChunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn layout_constants() {
        assert_eq!(MEM_OFFSET, 24);
        assert_eq!(MIN_CHUNK_SIZE, 48);
        assert_eq!(size_of::<Segment>(), 32);
        assert_eq!(TOP_FOOT_SIZE, 104);
        assert_eq!(FENCEPOST_HEAD, 11);
        assert_eq!(request2size(0), MIN_CHUNK_SIZE);
        #[cfg(not(feature = "footers"))]
        {
            assert_eq!(CHUNK_OVERHEAD, 16);
            assert_eq!(MAX_SMALL_REQUEST, 224);
            assert_eq!(pad_request(64), 80);
            assert_eq!(pad_request(10000), 10016);
        }
    }

    #[test]
    fn metadata_precedes_payload() {
        let mut c = Chunk {
            prev_foot: 0,
            head: 0,
            tag: 0,
            mark: 0,
            fd: ptr::null_mut(),
            bk: ptr::null_mut(),
        };
        let p: *mut Chunk = &mut c;
        unsafe {
            let mem = Chunk::to_mem(p);
            assert_eq!(&mut (*p).tag as *mut u32 as *mut u8, mem.sub(8));
            assert_eq!(&mut (*p).mark as *mut u32 as *mut u8, mem.sub(4));
            assert_eq!(Chunk::from_mem(mem), p);
        }
    }

    #[test]
    fn tree_index_ranges() {
        assert_eq!(compute_tree_index(256), 0);
        assert_eq!(compute_tree_index(384), 1);
        assert_eq!(compute_tree_index(512), 2);
        assert_eq!(compute_tree_index(1 << 30), NTREEBINS as u32 - 1);
        for idx in 0..NTREEBINS as u32 - 1 {
            let lo = min_size_for_tree_index(idx);
            let hi = min_size_for_tree_index(idx + 1);
            assert_eq!(compute_tree_index(lo), idx);
            assert_eq!(compute_tree_index(hi - MALLOC_ALIGNMENT), idx);
        }
    }

    #[test]
    fn bitmap_helpers() {
        assert_eq!(least_bit(0b1011_0000), 0b1_0000);
        assert_eq!(left_bits(1 << 3) & 0xff, 0b1111_0000);
        assert_eq!(left_bits(1 << 31), 0);
    }

    #[test]
    fn aligned_first_chunk() {
        let base = 0x10000 as *mut u8;
        let p = align_as_chunk(base);
        assert_eq!(p as usize, 0x10008);
        assert!(is_aligned(p as usize + MEM_OFFSET));
    }
}

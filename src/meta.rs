//! Per-object metadata packed in front of every payload.
//!
//! The mark word sits 4 bytes before the payload and the tag word 8 bytes
//! before it. The tag word keeps the allocation tag in its low 6 bits and a
//! per-tag user field (a length or a hash) in the upper 26.

use core::sync::atomic::{AtomicU32, Ordering};

const MARK_OFFSET: usize = 4;
const TAG_OFFSET: usize = 8;

pub const TAG_BITS: u32 = 6;
pub const TAG_MASK: u32 = (1 << TAG_BITS) - 1;
/// Largest value the user field accepts.
pub const MAX_HEAP_OBJ_LEN: u32 = (1 << 25) - 1;

unsafe fn mark_word(mem: *mut u8) -> *mut u32 {
    mem.sub(MARK_OFFSET) as *mut u32
}

unsafe fn tag_word(mem: *mut u8) -> *mut u32 {
    mem.sub(TAG_OFFSET) as *mut u32
}

/// Set the mark bit of a payload.
///
/// # Safety
///
/// `mem` must be a payload pointer returned by a heap in this crate and not
/// yet freed. The same holds for every function in this module.
pub unsafe fn set_mark(mem: *mut u8) {
    *mark_word(mem) |= 1;
}

pub unsafe fn clear_mark(mem: *mut u8) {
    *mark_word(mem) &= !1;
}

pub unsafe fn is_marked(mem: *mut u8) -> bool {
    *mark_word(mem) & 1 != 0
}

pub(crate) unsafe fn reset_mark_word(mem: *mut u8) {
    *mark_word(mem) = 0;
}

/// Marks through an atomic store, for visitors that may touch the same
/// object from several threads.
pub unsafe fn set_mark_multi(mem: *mut u8) {
    (*(mark_word(mem) as *const AtomicU32)).store(1, Ordering::Relaxed);
}

pub unsafe fn is_marked_multi(mem: *mut u8) -> bool {
    (*(mark_word(mem) as *const AtomicU32)).load(Ordering::Relaxed) & 1 != 0
}

/// Store `tag` in the low bits of the tag word, keeping the user field.
pub unsafe fn set_alloc_tag(mem: *mut u8, tag: u8) {
    let word = tag_word(mem);
    *word = (*word & !TAG_MASK) | (u32::from(tag) & TAG_MASK);
}

pub unsafe fn get_alloc_tag(mem: *mut u8) -> u8 {
    (*tag_word(mem) & TAG_MASK) as u8
}

pub(crate) unsafe fn reset_tag_word(mem: *mut u8) {
    *tag_word(mem) = 0;
}

pub(crate) unsafe fn copy_tag_word(from: *mut u8, to: *mut u8) {
    *tag_word(to) = *tag_word(from);
}

/// Store a length in the upper bits of the tag word.
///
/// # Panics
///
/// Panics if `len` exceeds `MAX_HEAP_OBJ_LEN`.
pub unsafe fn set_heap_obj_len(mem: *mut u8, len: u32) {
    if len > MAX_HEAP_OBJ_LEN {
        log::error!("heap object length {} out of range at {:p}", len, mem);
        panic!("heap object length {} exceeds {}", len, MAX_HEAP_OBJ_LEN);
    }
    let word = tag_word(mem);
    *word = (len << TAG_BITS) | (*word & TAG_MASK);
}

pub unsafe fn get_heap_obj_len(mem: *mut u8) -> u32 {
    *tag_word(mem) >> TAG_BITS
}

pub unsafe fn set_hash_size(mem: *mut u8, size: u32) {
    set_heap_obj_len(mem, size)
}

pub unsafe fn get_hash_size(mem: *mut u8) -> u32 {
    get_heap_obj_len(mem)
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    // A fake object: 8 bytes of metadata followed by a payload.
    #[repr(C, align(16))]
    struct Fake([u32; 8]);

    fn payload(fake: &mut Fake) -> *mut u8 {
        unsafe { (fake.0.as_mut_ptr() as *mut u8).add(8) }
    }

    #[test]
    fn mark_roundtrip() {
        let mut fake = Fake([0; 8]);
        let mem = payload(&mut fake);
        unsafe {
            assert!(!is_marked(mem));
            set_mark(mem);
            assert!(is_marked(mem));
            assert!(is_marked_multi(mem));
            set_mark(mem);
            clear_mark(mem);
            assert!(!is_marked(mem));
            set_mark_multi(mem);
            assert!(is_marked(mem));
        }
        assert_eq!(fake.0[1], 1);
    }

    #[test]
    fn tag_and_len_share_a_word() {
        let mut fake = Fake([0; 8]);
        let mem = payload(&mut fake);
        unsafe {
            for tag in 0..64u8 {
                set_alloc_tag(mem, tag);
                assert_eq!(get_alloc_tag(mem), tag);
            }
            set_alloc_tag(mem, 17);
            set_heap_obj_len(mem, MAX_HEAP_OBJ_LEN);
            assert_eq!(get_heap_obj_len(mem), MAX_HEAP_OBJ_LEN);
            assert_eq!(get_alloc_tag(mem), 17);
            set_alloc_tag(mem, 3);
            assert_eq!(get_heap_obj_len(mem), MAX_HEAP_OBJ_LEN);
            set_hash_size(mem, 12345);
            assert_eq!(get_hash_size(mem), 12345);
            assert_eq!(get_alloc_tag(mem), 3);
            // The mark word is untouched.
            assert!(!is_marked(mem));
        }
    }

    #[test]
    #[should_panic]
    fn len_out_of_range() {
        let mut fake = Fake([0; 8]);
        let mem = payload(&mut fake);
        unsafe { set_heap_obj_len(mem, MAX_HEAP_OBJ_LEN + 1) };
    }
}

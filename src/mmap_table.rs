//! Registry of directly mapped large objects.
//!
//! Each slot is one word. An occupied slot holds the object's payload
//! pointer, whose low bit is always clear. A free slot holds
//! `(next_free << 1) | 1`, threading the free slots into a list headed by
//! `free_index`. The backing array is itself a mapping, doubled when full.

use core::mem::size_of;
use core::ptr::null_mut;

use crate::sys::PageSource;

const INITIAL_SLOTS: usize = 1024;

fn is_free(slot: usize) -> bool {
    slot & 1 == 1
}

fn encode_free(next: usize) -> usize {
    (next << 1) | 1
}

fn decode_free(slot: usize) -> usize {
    slot >> 1
}

pub struct MmapTable {
    slots: *mut usize,
    size: usize,
    free_index: usize,
    count: usize,
}

impl MmapTable {
    pub const fn new() -> Self {
        MmapTable {
            slots: null_mut(),
            size: 0,
            free_index: 0,
            count: 0,
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of slots, live or free.
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// The object in slot `index`, if that slot is occupied.
    pub fn get(&self, index: usize) -> Option<*mut u8> {
        if index >= self.size {
            return None;
        }
        let slot = unsafe { *self.slots.add(index) };
        if is_free(slot) {
            None
        } else {
            Some(slot as *mut u8)
        }
    }

    /// Every live object, in slot order.
    pub fn live(&self) -> Vec<*mut u8> {
        (0..self.size).filter_map(|i| self.get(i)).collect()
    }

    /// Record `mem`, growing the table if it is full.
    ///
    /// # Panics
    ///
    /// Panics if the table must grow and the mapping fails: an object the
    /// table cannot hold would never be swept.
    pub unsafe fn add<G: PageSource>(&mut self, mem: *mut u8, source: &mut G) {
        debug_assert!(!is_free(mem as usize));
        if self.count == self.size {
            self.grow(source);
        }
        let index = self.free_index;
        self.free_index = decode_free(*self.slots.add(index));
        *self.slots.add(index) = mem as usize;
        self.count += 1;
    }

    unsafe fn grow<G: PageSource>(&mut self, source: &mut G) {
        let new_size = if self.size == 0 {
            INITIAL_SLOTS
        } else {
            self.size * 2
        };
        let new_slots = match source.map(new_size * size_of::<usize>()) {
            Ok(p) => p as *mut usize,
            Err(e) => {
                log::error!("mmap table growth to {} slots failed: {:?}", new_size, e);
                panic!("unable to grow the mmap table");
            }
        };
        if self.size != 0 {
            core::ptr::copy_nonoverlapping(self.slots, new_slots, self.size);
        }
        for i in self.size..new_size {
            let next = if i == new_size - 1 { 0 } else { i + 1 };
            *new_slots.add(i) = encode_free(next);
        }
        let old = self.slots;
        let old_size = self.size;
        self.slots = new_slots;
        self.free_index = old_size;
        self.size = new_size;
        if !old.is_null() {
            if let Err(e) = source.unmap(old as *mut u8, old_size * size_of::<usize>()) {
                log::error!("unmapping the old mmap table failed: {:?}", e);
                panic!("unable to release the old mmap table");
            }
        }
    }

    /// Forget `mem`. Returns false if it was not recorded.
    pub fn remove(&mut self, mem: *mut u8) -> bool {
        let found = (0..self.size).find(|&i| self.get(i) == Some(mem));
        match found {
            Some(i) => {
                unsafe { *self.slots.add(i) = encode_free(self.free_index) };
                self.free_index = i;
                self.count -= 1;
                true
            }
            None => false,
        }
    }

    /// Number of inconsistencies between `count` and the free list.
    pub fn check(&self) -> usize {
        let mut problems = 0;
        let live = (0..self.size).filter(|&i| self.get(i).is_some()).count();
        if live != self.count {
            problems += 1;
        }
        let mut seen = vec![false; self.size];
        let mut index = self.free_index;
        for _ in 0..self.size.saturating_sub(self.count) {
            if index >= self.size || seen[index] {
                problems += 1;
                break;
            }
            let slot = unsafe { *self.slots.add(index) };
            if !is_free(slot) {
                problems += 1;
                break;
            }
            seen[index] = true;
            index = decode_free(slot);
        }
        problems
    }

    /// Give the backing array back to the OS.
    pub unsafe fn release<G: PageSource>(&mut self, source: &mut G) {
        if !self.slots.is_null() {
            if let Err(e) = source.unmap(self.slots as *mut u8, self.size * size_of::<usize>()) {
                log::error!("unmapping the mmap table failed: {:?}", e);
            }
        }
        *self = MmapTable::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::sys::LibcPages;
    use test_env_log::test;

    fn fake(i: usize) -> *mut u8 {
        (0x1000 + i * 16) as *mut u8
    }

    #[test]
    fn add_remove_reuses_slots() {
        let mut pages = LibcPages::default();
        let mut table = MmapTable::new();
        unsafe {
            table.add(fake(0), &mut pages);
            table.add(fake(1), &mut pages);
            table.add(fake(2), &mut pages);
        }
        assert_eq!(table.len(), 3);
        assert_eq!(table.capacity(), INITIAL_SLOTS);
        assert_eq!(table.check(), 0);

        assert!(table.remove(fake(1)));
        assert!(!table.remove(fake(1)));
        assert_eq!(table.get(1), None);
        assert_eq!(table.check(), 0);

        // The freed slot is handed out first.
        unsafe { table.add(fake(9), &mut pages) };
        assert_eq!(table.get(1), Some(fake(9)));
        assert_eq!(table.live(), vec![fake(0), fake(9), fake(2)]);
        unsafe { table.release(&mut pages) };
        assert_eq!(pages.mapped, 0);
    }

    #[test]
    fn grows_by_doubling() {
        let mut pages = LibcPages::default();
        let mut table = MmapTable::new();
        unsafe {
            for i in 0..INITIAL_SLOTS + 1 {
                table.add(fake(i), &mut pages);
            }
        }
        assert_eq!(table.capacity(), 2 * INITIAL_SLOTS);
        assert_eq!(table.len(), INITIAL_SLOTS + 1);
        assert_eq!(table.check(), 0);
        assert_eq!(pages.maps, 2);
        assert_eq!(pages.unmaps, 1);
        for i in 0..INITIAL_SLOTS + 1 {
            assert_eq!(table.get(i), Some(fake(i)));
        }
        unsafe { table.release(&mut pages) };
    }
}

use core::ptr::null_mut;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use gc_heap::chunk::{align_offset, pad_request, Chunk, MEM_OFFSET, TOP_FOOT_SIZE};
use gc_heap::meta;
use gc_heap::{
    AllocTag, Collector, FinalizeMode, HandleState, HeapConfig, LibcPages, RawHeap, TagHandler,
    Visitor,
};

use test_env_log::test;

fn chunk_size(mem: *mut u8) -> usize {
    unsafe { Chunk::size(Chunk::from_mem(mem)) }
}

fn no_roots(_: &mut Visitor) {}

/// Objects tagged `Object` hold two child pointers.
struct Pair {
    finalized: Rc<Cell<usize>>,
}

impl TagHandler for Pair {
    unsafe fn visit(&self, mem: *mut u8, visitor: &mut Visitor) {
        let slots = mem as *mut *mut u8;
        visitor.push(*slots, 1);
        visitor.push(*slots.add(1), 1);
    }

    unsafe fn finalize(&self, _mem: *mut u8, _mode: FinalizeMode) {
        self.finalized.set(self.finalized.get() + 1);
    }
}

unsafe fn new_pair(heap: &mut RawHeap<LibcPages>, left: *mut u8, right: *mut u8) -> *mut u8 {
    let mem = heap.allocate(2 * core::mem::size_of::<*mut u8>());
    assert!(!mem.is_null());
    AllocTag::Object.apply(mem);
    let slots = mem as *mut *mut u8;
    *slots = left;
    *slots.add(1) = right;
    mem
}

#[test]
fn small_bin_hit() {
    let config = HeapConfig::new();
    let mut heap = RawHeap::with_capacity(config, LibcPages::default(), 1024 * 1024).unwrap();
    assert_eq!(heap.footprint(), 1024 * 1024);
    let topsize = heap.topsize();
    let p = unsafe { heap.allocate(64) };
    assert!(!p.is_null());
    assert_eq!(p as usize % 16, 0);
    assert_eq!(chunk_size(p), pad_request(64));
    if cfg!(not(feature = "footers")) {
        assert_eq!(chunk_size(p), 80);
    }
    assert_eq!(heap.topsize(), topsize - chunk_size(p));
}

#[test]
fn tree_bin_split() {
    let mut heap =
        RawHeap::with_capacity(HeapConfig::new(), LibcPages::default(), 1024 * 1024).unwrap();
    unsafe {
        heap.allocate(64);
        // Put a large free chunk in the trees, away from top.
        let big = heap.allocate(20000);
        let _guard = heap.allocate(64);
        let big_size = chunk_size(big);
        heap.free(big);
        assert_eq!(heap.dvsize(), 0);

        let p = heap.allocate(10000);
        assert_eq!(p, big);
        assert_eq!(chunk_size(p), pad_request(10000));
        assert_eq!(heap.dvsize(), big_size - pad_request(10000));
        assert!(heap.stats().0.is_valid());
    }
}

#[test]
fn large_request_is_mapped() {
    let mut heap = RawHeap::new(HeapConfig::new(), LibcPages::default()).unwrap();
    unsafe {
        heap.allocate(64);
        let count = heap.mmap_count();
        let p = heap.allocate(512 * 1024);
        assert!(!p.is_null());
        assert_eq!(heap.mmap_count(), count + 1);
        assert!(!heap.in_segment(p));
        heap.free(p);
        assert_eq!(heap.mmap_count(), count);
    }
}

#[test]
fn gc_collects_unreferenced() {
    let config = HeapConfig::new();
    let mut heap = RawHeap::new(config, LibcPages::default()).unwrap();
    let mut collector = Collector::new(&config);
    unsafe {
        let objs: Vec<_> = (0..100).map(|_| heap.allocate(128)).collect();
        // Keeps the last dead object away from top.
        let guard = heap.allocate(128);
        let roots: Vec<_> = objs.iter().step_by(2).cloned().chain(Some(guard)).collect();
        for &r in roots.iter() {
            meta::set_heap_obj_len(r, 128);
        }
        let footprint = heap.footprint();

        let stats = collector
            .collect(&mut heap, |v: &mut Visitor| {
                for &r in roots.iter() {
                    v.visit_root(r);
                }
            })
            .unwrap();
        assert_eq!(stats.marked, 51);
        assert_eq!(stats.finalize.finalized, 50);
        assert_eq!(stats.freed_chunks, 50);
        assert_eq!(stats.binned_chunks, 50);
        assert_eq!(stats.shard_inserts.iter().sum::<usize>(), 50);
        assert_eq!(heap.footprint(), footprint);
        assert_eq!(stats.footprint_after, footprint);
        for &r in roots.iter() {
            assert!(!meta::is_marked(r));
            // The rest of the tag word survives.
            assert_eq!(meta::get_heap_obj_len(r), 128);
        }
        let (validity, after) = heap.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(after.in_use_chunks, 51);
        assert_eq!(after.free_chunks, 50);

        // Freed chunks are handed out again.
        let again = heap.allocate(128);
        assert!(objs.contains(&again));
    }
}

#[test]
fn parallel_sweep_over_many_segments() {
    let config = HeapConfig::new().with_thread_num(3);
    let mut heap = RawHeap::new(config, LibcPages::default()).unwrap();
    let mut collector = Collector::new(&config);
    let mut objs = Vec::new();
    unsafe {
        while heap.seg_count() < 2 * config.thread_num {
            let p = heap.allocate(1000 + objs.len() % 7 * 100);
            assert!(!p.is_null());
            objs.push(p);
            assert!(objs.len() < 1_000_000, "the heap never grew new segments");
        }
        let segments = heap.seg_count();
        let roots: Vec<_> = objs.iter().step_by(2).cloned().collect();

        let stats = collector
            .collect(&mut heap, |v: &mut Visitor| {
                for &r in roots.iter() {
                    v.visit_root(r);
                }
            })
            .unwrap();
        assert_eq!(stats.marked, roots.len());
        assert_eq!(stats.freed_chunks, objs.len() - roots.len());
        assert_eq!(stats.shard_inserts.len(), 3);
        assert_eq!(stats.shard_inserts.iter().sum::<usize>(), stats.binned_chunks);
        assert_eq!(stats.released.segments, 0);
        assert_eq!(heap.seg_count(), segments);

        let (validity, after) = heap.stats();
        assert_eq!(validity.adjacent_frees, 0);
        assert_eq!(validity.bin_mismatches, 0);
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(after.in_use_chunks, roots.len());
        for &r in roots.iter() {
            assert!(!meta::is_marked(r));
        }
    }
}

#[test]
fn wholly_free_segment_is_released() {
    let config = HeapConfig::new().with_mmap_threshold(usize::MAX);
    let mut heap = RawHeap::new(config, LibcPages::default()).unwrap();
    let mut collector = Collector::new(&config);
    unsafe {
        let dropped = heap.allocate(1024 * 1024);
        let kept = heap.allocate(1024 * 1024);
        assert!(!dropped.is_null() && !kept.is_null());
        assert_eq!(heap.seg_count(), 2);
        let footprint = heap.footprint();

        let stats = collector
            .collect(&mut heap, |v: &mut Visitor| v.visit_root(kept))
            .unwrap();
        assert_eq!(stats.released.segments, 1);
        assert_eq!(heap.seg_count(), 1);
        assert_eq!(heap.footprint(), footprint - stats.released.bytes);
        assert!(!heap.in_segment(dropped));
        assert!(heap.in_segment(kept));
        assert!(heap.stats().0.is_valid());
    }
}

#[test]
fn all_reachable_keeps_every_byte() {
    let config = HeapConfig::new();
    let mut heap = RawHeap::with_capacity(config, LibcPages::default(), 1024 * 1024).unwrap();
    let mut collector = Collector::new(&config);
    unsafe {
        let objs: Vec<_> = (1..200).map(|i| heap.allocate(i * 7)).collect();
        let stats = collector
            .collect(&mut heap, |v: &mut Visitor| {
                for &o in objs.iter() {
                    v.visit_root(o);
                }
            })
            .unwrap();
        assert_eq!(stats.finalize.finalized, 0);
        assert_eq!(heap.seg_count(), 1);
        assert_eq!(
            stats.cur_malloc_size + heap.topsize() + TOP_FOOT_SIZE + align_offset(MEM_OFFSET),
            heap.footprint()
        );
        assert_eq!(stats.cur_malloc_size, heap.malloc_size());
    }
}

#[test]
fn nothing_reachable_leaves_only_top() {
    let config = HeapConfig::new();
    let mut heap = RawHeap::with_capacity(config, LibcPages::default(), 1024 * 1024).unwrap();
    let mut collector = Collector::new(&config);
    unsafe {
        let objs: Vec<_> = (1..300).map(|i| heap.allocate(i * 13)).collect();
        for &o in objs.iter().step_by(3) {
            heap.free(o);
        }
        let stats = collector.collect(&mut heap, no_roots).unwrap();
        assert_eq!(stats.cur_malloc_size, 0);
        let (validity, after) = heap.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(after.in_use_chunks, 0);
        assert_eq!(after.free_chunks, 0);
        assert_eq!(heap.dvsize(), 0);
        assert_eq!(
            heap.topsize() + TOP_FOOT_SIZE + align_offset(MEM_OFFSET),
            heap.footprint()
        );
    }
}

#[test]
fn marking_follows_references() {
    let config = HeapConfig::new();
    let mut heap = RawHeap::new(config, LibcPages::default()).unwrap();
    let mut collector = Collector::new(&config);
    let finalized = Rc::new(Cell::new(0));
    collector.register(
        AllocTag::Object,
        Pair {
            finalized: finalized.clone(),
        },
    );
    unsafe {
        // root -> a -> b -> a, plus an unreachable cycle c <-> d.
        let b = new_pair(&mut heap, null_mut(), null_mut());
        let a = new_pair(&mut heap, b, null_mut());
        *(b as *mut *mut u8) = a;
        let root = new_pair(&mut heap, a, b);
        let c = new_pair(&mut heap, null_mut(), null_mut());
        let d = new_pair(&mut heap, c, c);
        *(c as *mut *mut u8) = d;
        let _guard = heap.allocate(16);

        let stats = collector
            .collect(&mut heap, |v: &mut Visitor| v.visit_root(root))
            .unwrap();
        // The guard is plain and unrooted.
        assert_eq!(stats.marked, 3);
        assert_eq!(stats.finalize.finalized, 3);
        assert_eq!(finalized.get(), 2);
        assert_eq!(*(root as *mut *mut u8), a);
        assert_eq!(*(a as *mut *mut u8), b);
        assert!(heap.stats().0.is_valid());
    }
}

#[test]
fn mapped_objects_are_reclaimed() {
    let config = HeapConfig::new();
    let mut heap = RawHeap::new(config, LibcPages::default()).unwrap();
    let mut collector = Collector::new(&config);
    unsafe {
        heap.allocate(64);
        let kept = heap.allocate(600 * 1024);
        let dropped = heap.allocate(700 * 1024);
        assert_eq!(heap.mmap_count(), 2);
        let dropped_size = chunk_size(dropped);
        let stats = collector
            .collect(&mut heap, |v: &mut Visitor| v.visit_root(kept))
            .unwrap();
        assert_eq!(stats.mmap_reclaimed, 1);
        assert_eq!(stats.mmap_reclaimed_bytes, dropped_size);
        assert_eq!(heap.mmap_count(), 1);
        assert!(!meta::is_marked(kept));
        assert!(stats.footprint_after < stats.footprint_before);
        assert!(heap.stats().0.is_valid());
    }
}

#[test]
fn handles_are_roots_and_weak_handles_clear() {
    let config = HeapConfig::new();
    let mut heap = RawHeap::new(config, LibcPages::default()).unwrap();
    let mut collector = Collector::new(&config);
    let dead = Rc::new(RefCell::new(Vec::new()));
    unsafe {
        let strong_target = heap.allocate(40);
        let weak_target = heap.allocate(40);
        let both_target = heap.allocate(40);
        heap.allocate(40);

        let handles = collector.handles_mut();
        let strong = handles.create(strong_target);
        let weak = handles.create(weak_target);
        let d = dead.clone();
        handles.set_weak(weak, Some(Box::new(move |p| d.borrow_mut().push(p))));
        let weak_but_rooted = handles.create_weak(both_target);

        let stats = collector
            .collect(&mut heap, |v: &mut Visitor| v.visit_root(both_target))
            .unwrap();
        assert_eq!(stats.marked, 2);
        assert_eq!(stats.finalize.weak_cleared, 1);
        assert_eq!(*dead.borrow(), vec![weak_target]);

        let handles = collector.handles();
        assert_eq!(handles.get(strong), strong_target);
        assert_eq!(handles.state(weak), HandleState::Deleting);
        assert!(handles.get(weak).is_null());
        assert_eq!(handles.get(weak_but_rooted), both_target);

        collector.handles_mut().destroy(weak);
        assert_eq!(collector.handles().len(), 2);
    }
}

#[test]
fn fewer_active_workers_still_sweep() {
    let config = HeapConfig::new().with_thread_num(4);
    let mut heap = RawHeap::new(config, LibcPages::default()).unwrap();
    let mut collector = Collector::new(&config);
    collector.set_max_active_thread_num(1);
    assert_eq!(collector.pool().max_active_thread_num(), 1);
    unsafe {
        let objs: Vec<_> = (0..1000).map(|i| heap.allocate(i % 300)).collect();
        let stats = collector
            .collect(&mut heap, |v: &mut Visitor| v.visit_root(objs[0]))
            .unwrap();
        assert_eq!(stats.marked, 1);
        assert!(heap.stats().0.is_valid());
    }
}

struct Teardown {
    seen: Rc<RefCell<Vec<FinalizeMode>>>,
    delay: Duration,
}

impl TagHandler for Teardown {
    unsafe fn finalize(&self, _mem: *mut u8, mode: FinalizeMode) {
        self.seen.borrow_mut().push(mode);
        thread::sleep(self.delay);
    }
}

#[test]
fn destroy_finalizes_everything() {
    let config = HeapConfig::new();
    let mut heap = RawHeap::new(config, LibcPages::default()).unwrap();
    let mut collector = Collector::new(&config);
    let seen = Rc::new(RefCell::new(Vec::new()));
    collector.register(
        AllocTag::ScriptSource,
        Teardown {
            seen: seen.clone(),
            delay: Duration::from_millis(0),
        },
    );
    unsafe {
        for i in 0..20 {
            let p = heap.allocate(100 + i);
            AllocTag::ScriptSource.apply(p);
        }
        let big = heap.allocate(400 * 1024);
        AllocTag::ScriptSource.apply(big);
        heap.allocate(30);

        let stats = collector.destroy(heap);
        assert!(stats.completed);
        assert_eq!(stats.finalized, 22);
    }
    assert_eq!(seen.borrow().len(), 21);
    assert!(seen.borrow().iter().all(|&m| m == FinalizeMode::Teardown));
}

#[test]
fn teardown_stops_when_over_budget() {
    let config = HeapConfig::new()
        .with_mmap_threshold(usize::MAX)
        .with_finalizer_budget(Duration::from_millis(5));
    let mut heap = RawHeap::new(config, LibcPages::default()).unwrap();
    let mut collector = Collector::new(&config);
    let seen = Rc::new(RefCell::new(Vec::new()));
    collector.register(
        AllocTag::ModuleDef,
        Teardown {
            seen: seen.clone(),
            delay: Duration::from_millis(30),
        },
    );
    unsafe {
        for _ in 0..2 {
            let p = heap.allocate(1024 * 1024);
            AllocTag::ModuleDef.apply(p);
        }
        assert_eq!(heap.seg_count(), 2);
        let stats = collector.finalize_all(&mut heap);
        assert!(!stats.completed);
        assert_eq!(stats.finalized, 1);
    }
    assert_eq!(seen.borrow().len(), 1);
}

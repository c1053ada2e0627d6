use std::collections::HashMap;
use std::thread;

use gc_heap::LibcHeap;

use test_env_log::test;

#[global_allocator]
static ALLOC: LibcHeap = LibcHeap::new();

#[test]
fn collections_allocate_through_the_heap() {
    let mut v = Vec::new();
    for i in 0..10_000usize {
        v.push(i);
    }
    assert_eq!(v.iter().sum::<usize>(), 10_000 * 9_999 / 2);

    let words: HashMap<String, usize> = (0..500).map(|i| (format!("key-{}", i), i)).collect();
    assert_eq!(words["key-250"], 250);

    // Past the mmap threshold, and grown in place by remapping.
    let mut big = vec![7u8; 4 * 1024 * 1024];
    big.resize(6 * 1024 * 1024, 9);
    assert!(big[..4 * 1024 * 1024].iter().all(|&b| b == 7));
    assert_eq!(big[6 * 1024 * 1024 - 1], 9);
    log::info!("footprint {}", ALLOC.footprint());
    assert!(ALLOC.footprint() >= big.len());
}

#[test]
fn threads_share_the_global_heap() {
    let handles: Vec<_> = (0..4)
        .map(|t| {
            thread::spawn(move || {
                let mut strings = Vec::new();
                for i in 0..2000 {
                    strings.push(format!("{}-{}", t, i));
                }
                strings.retain(|s| s.len() % 2 == 0);
                strings.len()
            })
        })
        .collect();
    for h in handles {
        assert!(h.join().unwrap() > 0);
    }
}

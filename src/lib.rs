//! A dlmalloc-style chunk heap with a parallel mark-sweep garbage collector.
//!
//! ## Heap
//!
//! [`RawHeap`](heap/struct.RawHeap.html) carves chunks out of segments mapped
//! from a [`PageSource`](sys/trait.PageSource.html). Small free chunks live in
//! size-exact bins, larger ones in bitwise tries, and requests above the mmap
//! threshold get a mapping of their own, tracked in a side-table. Every
//! payload is preceded by a mark word and a tag word (see [`meta`](meta/)).
//! [`Heap`](allocators/struct.Heap.html) wraps it in a lock and implements
//! `GlobalAlloc`.
//!
//! ## Collector
//!
//! [`Collector`](collector/struct.Collector.html) marks from the runtime's
//! roots and its [global handles](handles/), runs per-tag finalizers on what
//! it did not reach, then rebuilds the free lists in parallel on a
//! [`WorkerPool`](pool/struct.WorkerPool.html), with one bin shard per sweep
//! task.
//!
//! ```no_run
//! use gc_heap::{AllocTag, Collector, HeapConfig, LibcPages, RawHeap, Visitor};
//!
//! let config = HeapConfig::new();
//! let mut heap = RawHeap::new(config, LibcPages::default()).unwrap();
//! let mut collector = Collector::new(&config);
//! unsafe {
//!     let root = heap.allocate(64);
//!     AllocTag::WithoutPtr.apply(root);
//!     heap.allocate(64);
//!     let stats = collector
//!         .collect(&mut heap, |v: &mut Visitor| v.visit_root(root))
//!         .unwrap();
//!     assert_eq!(stats.finalize.finalized, 1);
//! }
//! ```

pub mod allocators;
pub mod bins;
pub mod check;
pub mod chunk;
pub mod collector;
pub mod config;
pub mod handles;
pub mod heap;
pub mod meta;
pub mod mmap_table;
pub mod params;
pub mod pool;
pub mod shard;
pub mod sweeper;
pub mod sys;
pub mod tag;

pub use allocators::{Heap, LibcHeap};
pub use check::{Stats, Validity};
pub use collector::{Collector, ForbidGcScope, GcError, GcPhase, RootSet, Visitor};
pub use config::{ConfigError, HeapConfig};
pub use handles::{GlobalHandles, Handle, HandleState};
pub use heap::{RawHeap, SegmentRelease};
pub use pool::{Task, WorkerPool};
pub use sweeper::{FinalizeStats, SweepStats};
pub use sys::{BudgetPages, LibcPages, PageSource};
pub use tag::{AllocTag, FinalizeMode, TagHandler, TagTable};

//! Global handles: references to heap objects held from outside the heap.
//!
//! A strong handle keeps its target alive as a marking root. A weak handle
//! does not; when a collection finds its target unmarked, the handle's
//! callback runs with the target, the handle is cleared, and it stays
//! allocated until destroyed.

use core::ptr::null_mut;

/// Handles are allocated in blocks of this many.
pub const BLOCK_SIZE: usize = 256;

/// Callback for a weak handle whose target died.
pub type WeakCallback = Box<dyn FnOnce(*mut u8)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Free,
    Normal,
    Weak,
    /// Weak, and its target was found dead.
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

struct Node {
    target: *mut u8,
    state: HandleState,
    callback: Option<WeakCallback>,
    next_free: Option<usize>,
}

#[derive(Default)]
pub struct GlobalHandles {
    nodes: Vec<Node>,
    first_free: Option<usize>,
    count: usize,
}

impl GlobalHandles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live handles.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Slots allocated, live or free.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    fn allocate(&mut self) -> usize {
        if self.first_free.is_none() {
            let start = self.nodes.len();
            // Free list runs in index order.
            for i in start..start + BLOCK_SIZE {
                let next = if i + 1 < start + BLOCK_SIZE {
                    Some(i + 1)
                } else {
                    None
                };
                self.nodes.push(Node {
                    target: null_mut(),
                    state: HandleState::Free,
                    callback: None,
                    next_free: next,
                });
            }
            self.first_free = Some(start);
        }
        let idx = match self.first_free {
            Some(idx) => idx,
            None => unreachable!("a fresh block always has free nodes"),
        };
        self.first_free = self.nodes[idx].next_free.take();
        self.count += 1;
        idx
    }

    fn publish(&mut self, target: *mut u8, state: HandleState) -> Handle {
        let idx = self.allocate();
        let node = &mut self.nodes[idx];
        node.target = target;
        node.state = state;
        Handle(idx)
    }

    /// A strong handle to `target`.
    pub fn create(&mut self, target: *mut u8) -> Handle {
        self.publish(target, HandleState::Normal)
    }

    /// A weak handle to `target`, with no callback.
    pub fn create_weak(&mut self, target: *mut u8) -> Handle {
        self.publish(target, HandleState::Weak)
    }

    fn node_mut(&mut self, handle: Handle) -> Option<&mut Node> {
        match self.nodes.get_mut(handle.0) {
            Some(node) if node.state != HandleState::Free => Some(node),
            _ => {
                log::warn!("use of a released global handle {}", handle.0);
                None
            }
        }
    }

    pub fn state(&self, handle: Handle) -> HandleState {
        self.nodes
            .get(handle.0)
            .map_or(HandleState::Free, |node| node.state)
    }

    /// The target, or null for a released or cleared handle.
    pub fn get(&self, handle: Handle) -> *mut u8 {
        match self.nodes.get(handle.0) {
            Some(node) if node.state != HandleState::Free => node.target,
            _ => null_mut(),
        }
    }

    pub fn set(&mut self, handle: Handle, target: *mut u8) {
        if let Some(node) = self.node_mut(handle) {
            node.target = target;
        }
    }

    /// Make the handle weak. `callback` runs once if the target dies.
    pub fn set_weak(&mut self, handle: Handle, callback: Option<WeakCallback>) {
        if let Some(node) = self.node_mut(handle) {
            node.state = HandleState::Weak;
            node.callback = callback;
        }
    }

    /// Make the handle strong again, dropping its callback.
    pub fn clear_weak(&mut self, handle: Handle) {
        if let Some(node) = self.node_mut(handle) {
            node.state = HandleState::Normal;
            node.callback = None;
        }
    }

    pub fn destroy(&mut self, handle: Handle) {
        let first_free = self.first_free;
        if let Some(node) = self.node_mut(handle) {
            node.target = null_mut();
            node.state = HandleState::Free;
            node.callback = None;
            node.next_free = first_free;
            self.first_free = Some(handle.0);
            self.count -= 1;
        }
    }

    /// Targets of every strong handle.
    pub fn strong_roots(&self) -> impl Iterator<Item = *mut u8> + '_ {
        self.nodes
            .iter()
            .filter(|n| n.state == HandleState::Normal && !n.target.is_null())
            .map(|n| n.target)
    }

    /// Clear every weak handle whose target `is_live` rejects, running its
    /// callback. Returns how many handles were cleared.
    pub fn finalize_weak<F: Fn(*mut u8) -> bool>(&mut self, is_live: F) -> usize {
        let mut cleared = 0;
        for node in self.nodes.iter_mut() {
            if node.state != HandleState::Weak || node.target.is_null() || is_live(node.target) {
                continue;
            }
            let target = node.target;
            node.state = HandleState::Deleting;
            node.target = null_mut();
            cleared += 1;
            if let Some(callback) = node.callback.take() {
                callback(target);
            }
        }
        if cleared > 0 {
            log::debug!("cleared {} weak handles", cleared);
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;

    use test_env_log::test;

    fn fake(i: usize) -> *mut u8 {
        (0x1000 + i * 16) as *mut u8
    }

    #[test]
    fn slots_are_reused() {
        let mut handles = GlobalHandles::new();
        let a = handles.create(fake(1));
        let b = handles.create(fake(2));
        assert_eq!(handles.len(), 2);
        assert_eq!(handles.capacity(), BLOCK_SIZE);
        assert_eq!(handles.get(a), fake(1));
        handles.destroy(a);
        assert!(handles.get(a).is_null());
        assert_eq!(handles.state(a), HandleState::Free);
        let c = handles.create(fake(3));
        assert_eq!(c, a);
        assert_eq!(handles.get(b), fake(2));
        // Destroying twice is ignored.
        handles.destroy(b);
        handles.destroy(b);
        assert_eq!(handles.len(), 1);
    }

    #[test]
    fn grows_by_blocks() {
        let mut handles = GlobalHandles::new();
        let all: Vec<_> = (0..BLOCK_SIZE + 1).map(|i| handles.create(fake(i))).collect();
        assert_eq!(handles.capacity(), 2 * BLOCK_SIZE);
        assert_eq!(handles.strong_roots().count(), BLOCK_SIZE + 1);
        for h in all {
            handles.destroy(h);
        }
        assert!(handles.is_empty());
    }

    #[test]
    fn weak_handles_are_cleared() {
        let mut handles = GlobalHandles::new();
        let dead = Rc::new(RefCell::new(Vec::new()));
        let strong = handles.create(fake(1));
        let weak_live = handles.create_weak(fake(2));
        let weak_dead = handles.create(fake(3));
        let d = dead.clone();
        handles.set_weak(weak_dead, Some(Box::new(move |p| d.borrow_mut().push(p))));
        assert_eq!(handles.strong_roots().collect::<Vec<_>>(), vec![fake(1)]);

        let cleared = handles.finalize_weak(|p| p != fake(3));
        assert_eq!(cleared, 1);
        assert_eq!(*dead.borrow(), vec![fake(3)]);
        assert_eq!(handles.state(weak_dead), HandleState::Deleting);
        assert!(handles.get(weak_dead).is_null());
        assert_eq!(handles.get(weak_live), fake(2));
        assert_eq!(handles.get(strong), fake(1));

        // Strong again: a root once more, and never cleared.
        handles.clear_weak(weak_live);
        assert_eq!(handles.strong_roots().count(), 2);
        assert_eq!(handles.finalize_weak(|_| false), 0);
    }
}

//! IBM-style tagged free-list recirculation.
//!
//! A generic Treiber-stack-shaped pool for recycling boxed values without
//! routing them through a hazard-pointer or pass-the-buck scheme: the ABA
//! hazard that SMR exists to solve is instead closed by the stack's own
//! `{ptr, tag}` CAS, since every pop increments the tag and a stale
//! popped pointer can never compare equal to a fresh push of the same
//! address. [`crate::queue::tagged`] uses this same technique internally
//! (specialized to its own node layout rather than through this generic
//! wrapper, so a node's link field can double as both its in-queue next
//! pointer and its free-list link).
//!
//! Requires the `tagged-128` feature (128-bit CAS via `portable_atomic`).

use std::boxed::Box;
use std::ptr;
use std::sync::atomic::Ordering;

use crate::backoff::Backoff;
use crate::pr::tagged::TaggedAtomic;

/// A free-list node wrapping a recycled `T`.
pub struct FreeListNode<T> {
    next: TaggedAtomic<FreeListNode<T>>,
    /// `None` only momentarily between `pop` returning the box and the
    /// caller reinitializing it; always `Some` while linked into a list.
    pub data: Option<T>,
}

impl<T> FreeListNode<T> {
    /// Wraps `data` in a fresh, unlinked node.
    pub fn new(data: T) -> Self {
        Self {
            next: TaggedAtomic::new(ptr::null_mut()),
            data: Some(data),
        }
    }
}

/// A lock-free Treiber-style free-list using tagged-pointer CAS instead
/// of a reclamation scheme.
pub struct FreeList<T> {
    head: TaggedAtomic<FreeListNode<T>>,
}

impl<T> Default for FreeList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FreeList<T> {
    /// Creates an empty free-list.
    pub fn new() -> Self {
        Self {
            head: TaggedAtomic::new(ptr::null_mut()),
        }
    }

    /// Returns `node` to the free-list for later reuse.
    pub fn push(&self, node: Box<FreeListNode<T>>) {
        let raw = Box::into_raw(node);
        let mut backoff = Backoff::exponential();
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe { (*raw).next = TaggedAtomic::new(head.ptr) };
            if self.head.cas(head, raw, Ordering::AcqRel, Ordering::Acquire) {
                return;
            }
            backoff.spin();
        }
    }

    /// Takes a node from the free-list, or `None` if it is empty.
    pub fn pop(&self) -> Option<Box<FreeListNode<T>>> {
        let mut backoff = Backoff::exponential();
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.ptr.is_null() {
                return None;
            }
            let next = unsafe { (*head.ptr).next.load(Ordering::Acquire) };
            if self.head.cas(head, next.ptr, Ordering::AcqRel, Ordering::Acquire) {
                return Some(unsafe { Box::from_raw(head.ptr) });
            }
            backoff.spin();
        }
    }

    /// Returns whether the free-list currently holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).ptr.is_null()
    }
}

unsafe impl<T: Send> Send for FreeList<T> {}
unsafe impl<T: Send> Sync for FreeList<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_list_is_empty() {
        let list: FreeList<u32> = FreeList::new();
        assert!(list.is_empty());
        assert!(list.pop().is_none());
    }

    #[test]
    fn push_then_pop_round_trips_the_value() {
        let list = FreeList::new();
        list.push(Box::new(FreeListNode::new(42)));
        assert!(!list.is_empty());

        let node = list.pop().unwrap();
        assert_eq!(node.data, Some(42));
        assert!(list.is_empty());
    }

    #[test]
    fn recirculation_is_lifo() {
        let list = FreeList::new();
        list.push(Box::new(FreeListNode::new(1)));
        list.push(Box::new(FreeListNode::new(2)));
        list.push(Box::new(FreeListNode::new(3)));

        assert_eq!(list.pop().unwrap().data, Some(3));
        assert_eq!(list.pop().unwrap().data, Some(2));
        assert_eq!(list.pop().unwrap().data, Some(1));
        assert!(list.pop().is_none());
    }

    #[test]
    fn nodes_survive_a_push_pop_push_cycle_with_data_replaced() {
        let list = FreeList::new();
        let mut node = Box::new(FreeListNode::new(10));
        list.push(node);

        let mut popped = list.pop().unwrap();
        popped.data = Some(20);
        list.push(popped);

        node = list.pop().unwrap();
        assert_eq!(node.data, Some(20));
    }
}

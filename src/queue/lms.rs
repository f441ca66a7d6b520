//! Ladan-Mozes–Shavit optimistic doubly-linked FIFO queue.
//!
//! Structurally an MS-style singly-linked queue with one addition: every
//! node also carries a `prev` pointer, set optimistically (a plain
//! store, not a CAS) at enqueue time and left to drift stale under
//! concurrent updates. Nothing on the fast path — `enqueue`/`dequeue` —
//! ever waits on `prev` being correct; a helper (`fix_prev`) repairs a
//! stale link only when something actually needs to walk backwards from
//! a node (this implementation exposes that as [`Queue::iter_from_tail`]
//! for diagnostics/tests). This is the optimistic part of the name: the
//! common path pays nothing for bidirectional traversal, and the rare
//! backward walk pays a bounded fix-up instead of the double-CAS every
//! enqueue would otherwise need to keep `prev` always correct.

use std::boxed::Box;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::backoff::Backoff;
use crate::hp::{HazardPointerGc, HpConfig};
use crate::pr::Counter;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    prev: AtomicPtr<Node<T>>,
    value: UnsafeCell<Option<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            prev: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(None),
        }
    }

    fn new(value: T) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            prev: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(Some(value)),
        }
    }
}

/// An optimistic doubly-linked FIFO queue.
pub struct Queue<T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    gc: Arc<HazardPointerGc>,
    len: Counter,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let sentinel = Box::into_raw(Box::new(Node::sentinel()));
        Self {
            head: AtomicPtr::new(sentinel),
            tail: AtomicPtr::new(sentinel),
            gc: Arc::new(HazardPointerGc::new(HpConfig {
                hazard_pointers_per_thread: 2,
                ..HpConfig::default()
            })),
            len: Counter::new(Ordering::Relaxed),
        }
    }

    /// Appends `value` to the tail of the queue.
    ///
    /// Links the new node onto the next-chain exactly as the
    /// Michael–Scott algorithm does, then optimistically stamps the new
    /// node's `prev` to the node it was linked after. That stamp is not
    /// re-validated here; a concurrent `fix_prev` walk is what keeps it
    /// eventually correct.
    pub fn enqueue(&self, value: T) {
        let node = Box::into_raw(Box::new(Node::new(value)));
        let handle = HazardPointerGc::thread_handle(&self.gc);
        let tail_guard = handle.acquire_guard(0).expect("queue needs >=1 hazard slot");
        let mut backoff = Backoff::exponential();

        loop {
            let tail = tail_guard.protect_link(&self.tail);
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if tail != self.tail.load(Ordering::Acquire) {
                backoff.spin();
                continue;
            }
            if next.is_null() {
                unsafe { (*node).prev.store(tail, Ordering::Relaxed) };
                let tail_ref = unsafe { &*tail };
                if tail_ref
                    .next
                    .compare_exchange(ptr::null_mut(), node, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    let _ =
                        self.tail
                            .compare_exchange(tail, node, Ordering::Release, Ordering::Relaxed);
                    break;
                }
            } else {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            }
            backoff.spin();
        }

        drop(tail_guard);
        self.len.inc();
    }

    /// Removes and returns the value at the head of the queue, or `None`
    /// if it is empty. Identical in structure to the MS-queue dequeue;
    /// `prev` is untouched on this path.
    pub fn dequeue(&self) -> Option<T> {
        let handle = HazardPointerGc::thread_handle(&self.gc);
        let head_guard = handle.acquire_guard(0).expect("queue needs >=2 hazard slots");
        let next_guard = handle.acquire_guard(1).expect("queue needs >=2 hazard slots");
        let mut backoff = Backoff::exponential();

        let reclaim = loop {
            let head = head_guard.protect_link(&self.head);
            let tail = self.tail.load(Ordering::Acquire);
            let next = next_guard.protect_link(unsafe { &(*head).next });

            if head != self.head.load(Ordering::Acquire) {
                backoff.spin();
                continue;
            }
            if head == tail {
                if next.is_null() {
                    break None;
                }
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
                backoff.spin();
                continue;
            }

            let value = unsafe { (*(*next).value.get()).take() };
            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break Some((head, value));
            }
            backoff.spin();
        };

        drop(head_guard);
        drop(next_guard);

        match reclaim {
            Some((old_head, value)) => {
                unsafe { handle.retire(old_head) };
                self.len.dec();
                value
            }
            None => None,
        }
    }

    /// Returns whether the queue currently has no elements.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        unsafe { (*head).next.load(Ordering::Acquire).is_null() }
    }

    /// An approximate count of items currently enqueued.
    pub fn len(&self) -> usize {
        self.len.load()
    }

    /// Walks the queue from the current tail back towards the head,
    /// repairing any stale `prev` pointer it finds along the way, and
    /// collects a clone of every value visited.
    ///
    /// This is the operation that actually depends on `prev` being (or
    /// becoming) correct; `enqueue`/`dequeue` never call it.
    pub fn iter_from_tail(&self) -> Vec<T>
    where
        T: Clone,
    {
        let mut out = Vec::new();
        let mut cur = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        while cur != head && !cur.is_null() {
            if let Some(v) = unsafe { (*(*cur).value.get()).clone() } {
                out.push(v);
            }
            cur = self.fix_prev(cur, head);
        }
        out
    }

    /// Returns a corrected `prev` pointer for `node`, re-deriving it by
    /// walking forward from `from` along the (always-correct) next-chain
    /// if the stored `prev` looks stale, and writing the repaired value
    /// back.
    fn fix_prev(&self, node: *mut Node<T>, from: *mut Node<T>) -> *mut Node<T> {
        let stored = unsafe { (*node).prev.load(Ordering::Acquire) };
        let mut candidate = from;
        let mut last_before_node = from;
        loop {
            let next = unsafe { (*candidate).next.load(Ordering::Acquire) };
            if next == node {
                last_before_node = candidate;
                break;
            }
            if next.is_null() {
                break;
            }
            candidate = next;
        }
        if stored != last_before_node {
            unsafe { (*node).prev.store(last_before_node, Ordering::Relaxed) };
        }
        last_before_node
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_is_preserved() {
        let q = Queue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn empty_queue_dequeues_none() {
        let q: Queue<i32> = Queue::new();
        assert!(q.is_empty());
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn backward_walk_recovers_insertion_order_in_reverse() {
        let q = Queue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.iter_from_tail(), vec![3, 2, 1]);
    }

    #[test]
    fn concurrent_producers_and_consumers_preserve_total_count() {
        let q = Arc::new(Queue::new());
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..250 {
                        q.enqueue(t * 250 + i);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let mut drained = 0;
        while q.dequeue().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 1000);
    }
}

//! Tagged-pointer Michael–Scott queue.
//!
//! Structurally the same algorithm as [`crate::queue::ms`], but closed
//! against the A-B-A hazard with a 128-bit `{ptr, tag}` CAS
//! ([`crate::pr::tagged`]) instead of hazard-pointer protection: every
//! mutation of `head`, `tail`, or a node's `next` increments that node's
//! tag, so a thread that read a pointer, got descheduled, and woke up
//! after the same address was freed and reused can no longer CAS
//! successfully against it — the tag will have moved on. That closure is
//! what lets dequeued nodes recirculate through an internal free-list
//! instead of going through SMR: nothing ever frees a node's memory, so
//! there is nothing for a hazard pointer to protect. The pool reuses
//! `Node<T>`'s own `next` field as its link rather than going through
//! [`crate::freelist`]'s generic wrapper, since the node layout here is
//! already fixed by the queue.
//!
//! Requires the `tagged-128` feature (128-bit CAS via `portable_atomic`).

use std::boxed::Box;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::Ordering;

use crate::backoff::Backoff;
use crate::pr::tagged::TaggedAtomic;
use crate::pr::Counter;

struct Node<T> {
    next: TaggedAtomic<Node<T>>,
    value: UnsafeCell<Option<T>>,
}

impl<T> Node<T> {
    fn boxed(value: Option<T>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: TaggedAtomic::new(ptr::null_mut()),
            value: UnsafeCell::new(value),
        }))
    }
}

/// A tagged-pointer Michael–Scott FIFO queue.
///
/// Unlike [`crate::queue::ms::Queue`], this variant owns no SMR
/// collector: dequeued nodes go straight back into an internal
/// recirculation pool rather than a retired-pointer list.
pub struct Queue<T> {
    head: TaggedAtomic<Node<T>>,
    tail: TaggedAtomic<Node<T>>,
    pool: TaggedAtomic<Node<T>>,
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
        let sentinel = Node::boxed(None);
        Self {
            head: TaggedAtomic::new(sentinel),
            tail: TaggedAtomic::new(sentinel),
            pool: TaggedAtomic::new(ptr::null_mut()),
            len: Counter::new(Ordering::Relaxed),
        }
    }

    /// Takes a node from the recirculation pool and initializes it with
    /// `value`, or allocates a fresh one if the pool is empty.
    fn alloc(&self, value: T) -> *mut Node<T> {
        let mut backoff = Backoff::exponential();
        loop {
            let top = self.pool.load(Ordering::Acquire);
            if top.ptr.is_null() {
                return Node::boxed(Some(value));
            }
            let next = unsafe { (*top.ptr).next.load(Ordering::Acquire) };
            if self.pool.cas(top, next.ptr, Ordering::AcqRel, Ordering::Acquire) {
                unsafe { *(*top.ptr).value.get() = Some(value) };
                return top.ptr;
            }
            backoff.spin();
        }
    }

    /// Returns a node that has just been unlinked from the queue to the
    /// recirculation pool for future [`Self::alloc`] calls.
    fn recycle(&self, node: *mut Node<T>) {
        let mut backoff = Backoff::exponential();
        loop {
            let top = self.pool.load(Ordering::Acquire);
            unsafe { (*node).next = TaggedAtomic::new(top.ptr) };
            if self.pool.cas(top, node, Ordering::AcqRel, Ordering::Acquire) {
                return;
            }
            backoff.spin();
        }
    }

    /// Appends `value` to the tail of the queue.
    pub fn enqueue(&self, value: T) {
        let node = self.alloc(value);
        let mut backoff = Backoff::exponential();

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*tail.ptr).next.load(Ordering::Acquire) };
            if tail != self.tail.load(Ordering::Acquire) {
                backoff.spin();
                continue;
            }
            if next.ptr.is_null() {
                let linked = unsafe {
                    (*tail.ptr)
                        .next
                        .cas(next, node, Ordering::Release, Ordering::Relaxed)
                };
                if linked {
                    let _ = self.tail.cas(tail, node, Ordering::Release, Ordering::Relaxed);
                    break;
                }
            } else {
                let _ = self.tail.cas(tail, next.ptr, Ordering::Release, Ordering::Relaxed);
            }
            backoff.spin();
        }

        self.len.inc();
    }

    /// Removes and returns the value at the head of the queue, or `None`
    /// if it is empty.
    pub fn dequeue(&self) -> Option<T> {
        let mut backoff = Backoff::exponential();

        let result = loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*head.ptr).next.load(Ordering::Acquire) };

            if head != self.head.load(Ordering::Acquire) {
                backoff.spin();
                continue;
            }

            if head.ptr == tail.ptr {
                if next.ptr.is_null() {
                    break None;
                }
                let _ = self.tail.cas(tail, next.ptr, Ordering::Release, Ordering::Relaxed);
                backoff.spin();
                continue;
            }

            let value = unsafe { (*(*next.ptr).value.get()).take() };
            if self.head.cas(head, next.ptr, Ordering::Release, Ordering::Relaxed) {
                break Some((head.ptr, value));
            }
            backoff.spin();
        };

        match result {
            Some((old_head, value)) => {
                self.recycle(old_head);
                self.len.dec();
                value
            }
            None => None,
        }
    }

    /// Returns whether the queue currently has no elements.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        unsafe { (*head.ptr).next.load(Ordering::Acquire).ptr.is_null() }
    }

    /// An approximate count of items currently enqueued.
    pub fn len(&self) -> usize {
        self.len.load()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        let mut cur = self.head.load(Ordering::Relaxed).ptr;
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load(Ordering::Relaxed).ptr };
            unsafe { drop(Box::from_raw(cur)) };
            cur = next;
        }

        let mut pooled = self.pool.load(Ordering::Relaxed).ptr;
        while !pooled.is_null() {
            let next = unsafe { (*pooled).next.load(Ordering::Relaxed).ptr };
            unsafe { drop(Box::from_raw(pooled)) };
            pooled = next;
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
    fn nodes_recirculate_through_the_pool() {
        let q = Queue::new();
        for i in 0..100 {
            q.enqueue(i);
            assert_eq!(q.dequeue(), Some(i));
        }
        assert!(q.is_empty());
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
        assert!(q.is_empty());
    }
}

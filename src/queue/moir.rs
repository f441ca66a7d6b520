//! Moir's queue: a Michael–Scott variant that tolerates extra slack
//! between `head` and `tail`.
//!
//! Structurally identical to [`crate::queue::ms`] — the same sentinel
//! node, the same hazard-pointer protected dequeue — but its dequeue
//! path drops the mandatory helping CAS that swings `tail` forward when
//! `head == tail` and a successor already exists. Rather than fixing
//! `tail` before it is allowed to proceed, a thread dequeuing what looks
//! like the last node goes straight to unlinking it; some other
//! enqueuer or dequeuer will swing `tail` the next time it notices the
//! lag. This removes one CAS from the path a consumer takes through the
//! very last element, at the cost of `tail` trailing `head` by more than
//! one node for longer under contention.

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
    value: UnsafeCell<Option<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(None),
        }
    }

    fn new(value: T) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(Some(value)),
        }
    }
}

/// A Moir-variant FIFO queue: a drop-in replacement for
/// [`crate::queue::ms::Queue`] with the same public surface.
pub struct MoirQueue<T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    gc: Arc<HazardPointerGc>,
    len: Counter,
}

impl<T> Default for MoirQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MoirQueue<T> {
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
    /// Identical to [`crate::queue::ms::Queue::enqueue`] — the slack
    /// this variant tolerates is entirely a dequeue-side matter.
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
    /// if it is empty.
    ///
    /// When `head == tail` but a successor already exists — the state
    /// [`crate::queue::ms::Queue::dequeue`] resolves by helping swing
    /// `tail` and retrying — this variant instead dequeues the successor
    /// immediately, leaving `tail` to be swung forward by whichever
    /// operation notices the lag next.
    pub fn dequeue(&self) -> Option<T> {
        let handle = HazardPointerGc::thread_handle(&self.gc);
        let head_guard = handle.acquire_guard(0).expect("queue needs >=2 hazard slots");
        let next_guard = handle.acquire_guard(1).expect("queue needs >=2 hazard slots");
        let mut backoff = Backoff::exponential();

        let reclaim = loop {
            let head = head_guard.protect_link(&self.head);
            let next = next_guard.protect_link(unsafe { &(*head).next });

            if head != self.head.load(Ordering::Acquire) {
                backoff.spin();
                continue;
            }

            if next.is_null() {
                break None;
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
    ///
    /// Momentary: another thread may enqueue or dequeue immediately
    /// after this returns.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let head_next = unsafe { (*head).next.load(Ordering::Acquire) };
        head_next.is_null()
    }

    /// An approximate count of items currently enqueued, tracked
    /// alongside `enqueue`/`dequeue` rather than by traversal.
    pub fn len(&self) -> usize {
        self.len.load()
    }
}

impl<T> Drop for MoirQueue<T> {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

unsafe impl<T: Send> Send for MoirQueue<T> {}
unsafe impl<T: Send> Sync for MoirQueue<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_is_preserved() {
        let q = MoirQueue::new();
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
        let q: MoirQueue<i32> = MoirQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn dequeuing_the_last_node_skips_the_tail_helping_cas() {
        let q = MoirQueue::new();
        q.enqueue("only");
        // tail already points at the one real node here, so this
        // dequeue hits the head == tail-ish last-node path directly.
        assert_eq!(q.dequeue(), Some("only"));
        assert!(q.is_empty());
    }

    #[test]
    fn len_tracks_enqueue_and_dequeue() {
        let q = MoirQueue::new();
        q.enqueue("a");
        q.enqueue("b");
        assert_eq!(q.len(), 2);
        q.dequeue();
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn concurrent_producers_and_consumers_preserve_total_count() {
        let q = Arc::new(MoirQueue::new());
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

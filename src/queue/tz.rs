//! Tsigas–Zhang bounded cyclic-array FIFO queue.
//!
//! A fixed-size power-of-two array backs the queue; each slot holds a
//! node pointer with its low bit doubling as a free-slot parity marker.
//! Two distinct "free" values alternate by wrap: `free0` (a null
//! pointer) and `free1` (a pointer tagged with the low bit but
//! otherwise null) — a producer marks the pointer it stores whenever it
//! is replacing a `free1` slot, and a consumer hands back whichever
//! parity the slot it vacates didn't have, so two adjacent free slots of
//! the same parity can never be mistaken for "queue empty" after a
//! single wrap. `head`/`tail` only swing forward on an even index,
//! leaving the odd step to be completed by whichever thread next
//! notices the inconsistency — the same helping discipline Moir's
//! queue uses for its tail.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::backoff::Backoff;

/// Forces every heap-allocated node onto at least a two-byte boundary so
/// the low bit is always free for the free-slot parity tag.
#[repr(align(2))]
struct Node<T> {
    value: T,
}

#[inline]
fn free0<T>() -> *mut Node<T> {
    std::ptr::null_mut()
}

#[inline]
fn free1<T>() -> *mut Node<T> {
    1usize as *mut Node<T>
}

#[inline]
fn is_free<T>(p: *mut Node<T>) -> bool {
    p.is_null() || p as usize == 1
}

#[inline]
fn is_marked<T>(p: *mut Node<T>) -> bool {
    (p as usize) & 1 != 0
}

#[inline]
fn mark<T>(p: *mut Node<T>) -> *mut Node<T> {
    ((p as usize) | 1) as *mut Node<T>
}

#[inline]
fn unmark<T>(p: *mut Node<T>) -> *mut Node<T> {
    ((p as usize) & !1usize) as *mut Node<T>
}

/// A fixed-capacity lock-free FIFO queue backed by a cyclic array.
///
/// `enqueue` fails with the value it was given once the queue is full;
/// there is no blocking variant, matching the rest of this crate's
/// no-blocking-beyond-the-spin-lock scope.
pub struct Queue<T> {
    array: Box<[AtomicPtr<Node<T>>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    item_counter: AtomicUsize,
}

impl<T> Queue<T> {
    /// Creates a queue able to hold at least `capacity` elements
    /// simultaneously.
    ///
    /// The backing array's length is always a power of two and two of
    /// its slots are permanently unusable sentinels, so the array is
    /// sized to `(capacity + 2).next_power_of_two()`; the queue's actual
    /// usable capacity (see [`Queue::capacity`]) can therefore exceed
    /// the value requested here, never fall short of it.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded queue capacity must be nonzero");
        let len = (capacity + 2).next_power_of_two();
        let array: Box<[AtomicPtr<Node<T>>]> = (0..len)
            .map(|i| AtomicPtr::new(if i == 0 { free1() } else { free0() }))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            array,
            mask: len - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(1),
            item_counter: AtomicUsize::new(0),
        }
    }

    /// The number of elements that can be held simultaneously.
    ///
    /// Two slots of the backing array are permanently reserved by the
    /// algorithm as free-slot sentinels, so this is the array length
    /// minus two, not the length itself.
    pub fn capacity(&self) -> usize {
        self.array.len() - 2
    }

    /// Attempts to append `value`. Returns `Err(value)` if the queue is
    /// currently full.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        let new_node = Box::into_raw(Box::new(Node { value }));
        let mut backoff = Backoff::exponential();

        'retry: loop {
            let te = self.tail.load(Ordering::Acquire);
            let mut ate = te;
            let mut tt = self.array[ate].load(Ordering::Acquire);
            let mut temp = (ate + 1) & self.mask;

            while !is_free(tt) {
                if te != self.tail.load(Ordering::Acquire) {
                    backoff.spin();
                    continue 'retry;
                }
                if temp == self.head.load(Ordering::Acquire) {
                    break;
                }
                tt = self.array[temp].load(Ordering::Acquire);
                ate = temp;
                temp = (ate + 1) & self.mask;
            }

            if te != self.tail.load(Ordering::Acquire) {
                backoff.spin();
                continue 'retry;
            }

            if temp == self.head.load(Ordering::Acquire) {
                let full_check_idx = (temp + 1) & self.mask;
                let beyond = self.array[full_check_idx].load(Ordering::Acquire);
                if !is_free(beyond) {
                    let value = unsafe { Box::from_raw(new_node) }.value;
                    return Err(value);
                }
                let _ = self.head.compare_exchange(
                    temp,
                    full_check_idx,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                backoff.spin();
                continue 'retry;
            }

            let to_store = if tt == free1() { mark(new_node) } else { new_node };
            if te != self.tail.load(Ordering::Acquire) {
                backoff.spin();
                continue 'retry;
            }

            if self.array[ate]
                .compare_exchange(tt, to_store, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                if temp % 2 == 0 {
                    let _ = self
                        .tail
                        .compare_exchange(te, temp, Ordering::Release, Ordering::Relaxed);
                }
                self.item_counter.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            backoff.spin();
        }
    }

    /// Attempts to remove and return the oldest element. Returns `None`
    /// if the queue is currently empty.
    pub fn dequeue(&self) -> Option<T> {
        let mut backoff = Backoff::exponential();

        'retry: loop {
            let th = self.head.load(Ordering::Acquire);
            let mut temp = (th + 1) & self.mask;
            let mut tt = self.array[temp].load(Ordering::Acquire);

            while is_free(tt) {
                if th != self.head.load(Ordering::Acquire) {
                    backoff.spin();
                    continue 'retry;
                }
                if temp == self.tail.load(Ordering::Acquire) {
                    return None;
                }
                temp = (temp + 1) & self.mask;
                tt = self.array[temp].load(Ordering::Acquire);
            }

            if th != self.head.load(Ordering::Acquire) {
                backoff.spin();
                continue 'retry;
            }

            if temp == self.tail.load(Ordering::Acquire) {
                let _ = self.tail.compare_exchange(
                    temp,
                    (temp + 1) & self.mask,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                backoff.spin();
                continue 'retry;
            }

            let replacement = if is_marked(tt) { free0() } else { free1() };
            if th != self.head.load(Ordering::Acquire) {
                backoff.spin();
                continue 'retry;
            }

            if self.array[temp]
                .compare_exchange(tt, replacement, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                if temp % 2 == 0 {
                    let _ = self
                        .head
                        .compare_exchange(th, temp, Ordering::Release, Ordering::Relaxed);
                }
                let node = unmark(tt);
                let value = unsafe { Box::from_raw(node) }.value;
                self.item_counter.fetch_sub(1, Ordering::Relaxed);
                return Some(value);
            }
            backoff.spin();
        }
    }

    /// Returns whether the queue currently holds no elements.
    ///
    /// Momentary, like all lock-free emptiness checks.
    pub fn is_empty(&self) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail == (head + 1) & self.mask
    }

    /// The number of elements currently enqueued, tracked by an
    /// auxiliary relaxed counter rather than derived from head/tail.
    pub fn len(&self) -> usize {
        self.item_counter.load(Ordering::Relaxed)
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
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
        let q = Queue::new(4);
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        q.enqueue(3).unwrap();
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn capacity_is_enforced() {
        let q = Queue::new(4);
        let cap = q.capacity();
        assert!(cap >= 4);
        for i in 0..cap {
            assert!(q.enqueue(i).is_ok());
        }
        assert_eq!(q.enqueue(9999), Err(9999));
        assert_eq!(q.dequeue(), Some(0));
        assert!(q.enqueue(9999).is_ok());
    }

    #[test]
    fn empty_queue_reports_empty() {
        let q: Queue<i32> = Queue::new(2);
        assert!(q.is_empty());
        q.enqueue(1).unwrap();
        assert!(!q.is_empty());
    }

    #[test]
    fn wraps_around_indefinitely() {
        let q = Queue::new(2);
        for i in 0..1000 {
            q.enqueue(i).unwrap();
            assert_eq!(q.dequeue(), Some(i));
        }
    }

    #[test]
    fn len_tracks_pending_items() {
        let q = Queue::new(4);
        assert_eq!(q.len(), 0);
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        assert_eq!(q.len(), 2);
        q.dequeue();
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn concurrent_producers_and_consumers_preserve_total_count() {
        let q = Arc::new(Queue::new(64));
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut pushed = 0;
                    for i in 0..250 {
                        while q.enqueue(t * 250 + i).is_err() {
                            thread::yield_now();
                        }
                        pushed += 1;
                    }
                    pushed
                })
            })
            .collect();

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut drained = 0;
                while drained < 1000 {
                    if q.dequeue().is_some() {
                        drained += 1;
                    } else {
                        thread::yield_now();
                    }
                }
                drained
            })
        };

        let total_pushed: i32 = producers.into_iter().map(|p| p.join().unwrap()).sum();
        assert_eq!(total_pushed, 1000);
        assert_eq!(consumer.join().unwrap(), 1000);
    }
}

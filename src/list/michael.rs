//! Michael ordered singly-linked list.
//!
//! A sorted set keyed by `K: Ord`. Logical deletion is encoded in the
//! pointer itself: erasing a node sets the low bit of its own `next`
//! field before anyone attempts to unlink it physically, so any thread
//! that later walks past a marked node can recognise the situation and
//! help finish the unlink rather than corrupt the list. This is Maged
//! Michael's lock-free list from "High Performance Dynamic Lock-Free
//! Hash Tables and List-Based Sets", adapted here to hazard-pointer
//! reclamation instead of the paper's original reference counting.
//!
//! Three hazard slots are needed per traversal: the node being examined
//! (`cur`), its successor (`next`), and the node the walk is about to
//! leave behind (`prev_node`) — kept alive only so the `AtomicPtr` inside
//! it (the `prev_link` the walk is currently threading through) stays
//! valid memory to read and CAS.

use std::boxed::Box;
use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::backoff::Backoff;
use crate::hp::{HazardPointerGc, HpConfig, ThreadHandle};
use crate::pr::Counter;

const MARK_BIT: usize = 1;

#[inline]
fn is_marked<T>(p: *mut T) -> bool {
    (p as usize) & MARK_BIT != 0
}

#[inline]
fn mark<T>(p: *mut T) -> *mut T {
    ((p as usize) | MARK_BIT) as *mut T
}

#[inline]
fn unmark<T>(p: *mut T) -> *mut T {
    ((p as usize) & !MARK_BIT) as *mut T
}

const SLOT_NEXT: usize = 0;
const SLOT_CUR: usize = 1;
const SLOT_PREV_NODE: usize = 2;

struct Node<K, V> {
    key: K,
    value: UnsafeCell<V>,
    next: AtomicPtr<Node<K, V>>,
}

impl<K, V> Node<K, V> {
    fn new(key: K, value: V) -> Self {
        Self {
            key,
            value: UnsafeCell::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Outcome of a [`MichaelList::search`]: the link the walk would CAS
/// through to change what follows `prev_node` (either `head` itself or
/// some node's `next`), the node last examined, its (unmarked) successor,
/// and whether `cur` carries the searched-for key.
struct SearchResult<K, V> {
    prev_link: *const AtomicPtr<Node<K, V>>,
    cur: *mut Node<K, V>,
    next: *mut Node<K, V>,
    found: bool,
}

/// A lock-free sorted set, ordered by `K`.
///
/// Insert, erase, and find are all lock-free: a thread can stall
/// arbitrarily without preventing others from progressing, though a
/// stalled eraser does leave its node logically (but not yet physically)
/// deleted for others to clean up.
pub struct MichaelList<K, V> {
    head: AtomicPtr<Node<K, V>>,
    gc: Arc<HazardPointerGc>,
    len: Counter,
}

impl<K: Ord, V> Default for MichaelList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> MichaelList<K, V> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            gc: Arc::new(HazardPointerGc::new(HpConfig {
                hazard_pointers_per_thread: 3,
                ..HpConfig::default()
            })),
            len: Counter::new(Ordering::Relaxed),
        }
    }

    /// `protect_link`, but masking the delete-bit before publishing the
    /// hazard: the scan's membership test compares against the raw
    /// allocation address a node was `retire`d at, which never has the
    /// mark bit set, so a guard that published a marked address would
    /// never match and the node could be freed out from under it.
    fn protect_masked<T>(handle: &ThreadHandle<'_>, slot: usize, source: &AtomicPtr<T>) -> *mut T {
        loop {
            let p = source.load(Ordering::Acquire);
            handle.set_guard(slot, unmark(p));
            if source.load(Ordering::Acquire) == p {
                return p;
            }
        }
    }

    fn search(&self, handle: &ThreadHandle<'_>, key: &K) -> SearchResult<K, V> {
        let mut backoff = Backoff::exponential();

        'retry: loop {
            let mut prev_link: *const AtomicPtr<Node<K, V>> = &self.head;
            let mut cur = Self::protect_masked(handle, SLOT_CUR, unsafe { &*prev_link });

            loop {
                if cur.is_null() {
                    return SearchResult {
                        prev_link,
                        cur: ptr::null_mut(),
                        next: ptr::null_mut(),
                        found: false,
                    };
                }

                let raw_next = Self::protect_masked(handle, SLOT_NEXT, unsafe { &(*cur).next });

                if unsafe { (*prev_link).load(Ordering::Acquire) } != cur {
                    backoff.spin();
                    continue 'retry;
                }

                if is_marked(raw_next) {
                    let next = unmark(raw_next);
                    let unlinked = unsafe {
                        (*prev_link)
                            .compare_exchange(cur, next, Ordering::Release, Ordering::Relaxed)
                            .is_ok()
                    };
                    if unlinked {
                        unsafe { handle.retire(cur) };
                        cur = next;
                        handle.set_guard(SLOT_CUR, cur);
                        continue;
                    }
                    backoff.spin();
                    continue 'retry;
                }

                match unsafe { (*cur).key.cmp(key) } {
                    CmpOrdering::Equal => {
                        return SearchResult {
                            prev_link,
                            cur,
                            next: raw_next,
                            found: true,
                        }
                    }
                    CmpOrdering::Greater => {
                        return SearchResult {
                            prev_link,
                            cur,
                            next: raw_next,
                            found: false,
                        }
                    }
                    CmpOrdering::Less => {
                        handle.set_guard(SLOT_PREV_NODE, cur);
                        prev_link = unsafe { &(*cur).next };
                        cur = raw_next;
                        handle.set_guard(SLOT_CUR, cur);
                    }
                }
            }
        }
    }

    /// Inserts `key` with `value` if absent. Returns `false` (without
    /// touching `value`'s storage further than dropping it) if `key` is
    /// already present.
    pub fn insert(&self, key: K, value: V) -> bool {
        let handle = HazardPointerGc::thread_handle(&self.gc);
        let _g0 = handle
            .acquire_guard(SLOT_NEXT)
            .expect("Michael list needs >=3 hazard slots");
        let _g1 = handle
            .acquire_guard(SLOT_CUR)
            .expect("Michael list needs >=3 hazard slots");
        let _g2 = handle
            .acquire_guard(SLOT_PREV_NODE)
            .expect("Michael list needs >=3 hazard slots");
        let mut backoff = Backoff::exponential();

        let node = Box::into_raw(Box::new(Node::new(key, value)));
        let inserted = loop {
            let key_ref = unsafe { &(*node).key };
            let res = self.search(handle, key_ref);
            if res.found {
                break false;
            }
            unsafe { (*node).next.store(res.cur, Ordering::Relaxed) };
            let linked = unsafe {
                (*res.prev_link)
                    .compare_exchange(res.cur, node, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            };
            if linked {
                break true;
            }
            backoff.spin();
        };

        if inserted {
            self.len.inc();
        } else {
            unsafe { drop(Box::from_raw(node)) };
        }
        inserted
    }

    /// Removes `key` if present.
    pub fn erase(&self, key: &K) -> bool {
        let handle = HazardPointerGc::thread_handle(&self.gc);
        let _g0 = handle
            .acquire_guard(SLOT_NEXT)
            .expect("Michael list needs >=3 hazard slots");
        let _g1 = handle
            .acquire_guard(SLOT_CUR)
            .expect("Michael list needs >=3 hazard slots");
        let _g2 = handle
            .acquire_guard(SLOT_PREV_NODE)
            .expect("Michael list needs >=3 hazard slots");
        let mut backoff = Backoff::exponential();

        let removed = 'retry: loop {
            let res = self.search(handle, key);
            if !res.found {
                break false;
            }
            let marked_next = mark(res.next);
            let logically_deleted = unsafe {
                (*res.cur)
                    .next
                    .compare_exchange(res.next, marked_next, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            };
            if !logically_deleted {
                backoff.spin();
                continue 'retry;
            }
            // Best-effort physical unlink; if it loses the race, the next
            // search to pass this way finishes the job (§4.9).
            let physically_unlinked = unsafe {
                (*res.prev_link)
                    .compare_exchange(res.cur, res.next, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            };
            if physically_unlinked {
                unsafe { handle.retire(res.cur) };
            }
            break true;
        };

        if removed {
            self.len.dec();
        }
        removed
    }

    /// Returns whether `key` is present.
    pub fn find(&self, key: &K) -> bool {
        let handle = HazardPointerGc::thread_handle(&self.gc);
        let _g0 = handle
            .acquire_guard(SLOT_NEXT)
            .expect("Michael list needs >=3 hazard slots");
        let _g1 = handle
            .acquire_guard(SLOT_CUR)
            .expect("Michael list needs >=3 hazard slots");
        let _g2 = handle
            .acquire_guard(SLOT_PREV_NODE)
            .expect("Michael list needs >=3 hazard slots");
        let res = self.search(handle, key);
        res.found
    }

    /// If `key` is present, copies its value into `out` via `copier` and
    /// returns `true`; otherwise leaves `out` untouched and returns
    /// `false`.
    pub fn find_with<F>(&self, key: &K, out: &mut V, copier: F) -> bool
    where
        F: FnOnce(&V, &mut V),
    {
        let handle = HazardPointerGc::thread_handle(&self.gc);
        let _g0 = handle
            .acquire_guard(SLOT_NEXT)
            .expect("Michael list needs >=3 hazard slots");
        let _g1 = handle
            .acquire_guard(SLOT_CUR)
            .expect("Michael list needs >=3 hazard slots");
        let _g2 = handle
            .acquire_guard(SLOT_PREV_NODE)
            .expect("Michael list needs >=3 hazard slots");
        let res = self.search(handle, key);
        if res.found {
            copier(unsafe { &*(*res.cur).value.get() }, out);
        }
        res.found
    }

    /// Insert-or-update: if `key` is already present, calls `updater`
    /// with the existing value and `false`, and returns `(true, false)`;
    /// otherwise links a new node holding `value`, calls `updater` with
    /// it and `true`, and returns `(true, true)`. `value` is dropped
    /// unused in the former case.
    pub fn ensure<F>(&self, key: K, value: V, updater: F) -> (bool, bool)
    where
        F: FnOnce(&mut V, bool),
    {
        let handle = HazardPointerGc::thread_handle(&self.gc);
        let _g0 = handle
            .acquire_guard(SLOT_NEXT)
            .expect("Michael list needs >=3 hazard slots");
        let _g1 = handle
            .acquire_guard(SLOT_CUR)
            .expect("Michael list needs >=3 hazard slots");
        let _g2 = handle
            .acquire_guard(SLOT_PREV_NODE)
            .expect("Michael list needs >=3 hazard slots");
        let mut backoff = Backoff::exponential();

        let node = Box::into_raw(Box::new(Node::new(key, value)));
        let mut updater = Some(updater);

        let is_new = loop {
            let key_ref = unsafe { &(*node).key };
            let res = self.search(handle, key_ref);
            if res.found {
                let f = updater.take().expect("ensure updater invoked more than once");
                f(unsafe { &mut *(*res.cur).value.get() }, false);
                break false;
            }
            unsafe { (*node).next.store(res.cur, Ordering::Relaxed) };
            let linked = unsafe {
                (*res.prev_link)
                    .compare_exchange(res.cur, node, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            };
            if linked {
                let f = updater.take().expect("ensure updater invoked more than once");
                f(unsafe { &mut *(*node).value.get() }, true);
                break true;
            }
            backoff.spin();
        };

        if is_new {
            self.len.inc();
        } else {
            // The candidate node never got linked; the existing node was
            // updated in place instead, so this one (and the value the
            // caller supplied) is simply dropped.
            unsafe { drop(Box::from_raw(node)) };
        }
        (true, is_new)
    }

    /// Update-only: if `key` is present, calls `updater` with its value
    /// and returns `true`; otherwise returns `false` without calling it.
    pub fn emplace<F>(&self, key: &K, updater: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        let handle = HazardPointerGc::thread_handle(&self.gc);
        let _g0 = handle
            .acquire_guard(SLOT_NEXT)
            .expect("Michael list needs >=3 hazard slots");
        let _g1 = handle
            .acquire_guard(SLOT_CUR)
            .expect("Michael list needs >=3 hazard slots");
        let _g2 = handle
            .acquire_guard(SLOT_PREV_NODE)
            .expect("Michael list needs >=3 hazard slots");
        let res = self.search(handle, key);
        if res.found {
            updater(unsafe { &mut *(*res.cur).value.get() });
        }
        res.found
    }

    /// Removes the first live node, if any. Used by [`Self::clear`].
    fn pop_front(&self) -> bool {
        let handle = HazardPointerGc::thread_handle(&self.gc);
        let g_cur = handle
            .acquire_guard(SLOT_CUR)
            .expect("Michael list needs >=3 hazard slots");
        let g_next = handle
            .acquire_guard(SLOT_NEXT)
            .expect("Michael list needs >=3 hazard slots");
        let mut backoff = Backoff::exponential();

        let removed = 'retry: loop {
            let cur = Self::protect_masked(handle, SLOT_CUR, &self.head);
            if cur.is_null() {
                break false;
            }
            let raw_next = Self::protect_masked(handle, SLOT_NEXT, unsafe { &(*cur).next });
            if self.head.load(Ordering::Acquire) != cur {
                backoff.spin();
                continue 'retry;
            }
            let next = unmark(raw_next);
            let unlinked = self
                .head
                .compare_exchange(cur, next, Ordering::Release, Ordering::Relaxed)
                .is_ok();
            if unlinked {
                unsafe { handle.retire(cur) };
                if is_marked(raw_next) {
                    // `cur` was already logically deleted by a concurrent
                    // erase; we only helped finish the unlink.
                    continue 'retry;
                }
                break true;
            }
            backoff.spin();
        };

        drop(g_cur);
        drop(g_next);
        if removed {
            self.len.dec();
        }
        removed
    }

    /// Removes every node, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut n = 0;
        while self.pop_front() {
            n += 1;
        }
        n
    }

    /// Returns whether the set currently holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len.load() == 0
    }

    /// An exact count of keys currently in the set.
    pub fn len(&self) -> usize {
        self.len.load()
    }

    /// A non-concurrent forward iterator over live (non-marked) entries,
    /// for debugging/testing. The caller must not mutate the list while
    /// iterating.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            cur: self.head.load(Ordering::Acquire),
            _marker: PhantomData,
        }
    }
}

/// See [`MichaelList::iter`].
pub struct Iter<'a, K, V> {
    cur: *mut Node<K, V>,
    _marker: PhantomData<&'a MichaelList<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while !self.cur.is_null() {
            let node = unsafe { &*self.cur };
            let raw_next = node.next.load(Ordering::Relaxed);
            let deleted = is_marked(raw_next);
            self.cur = unmark(raw_next);
            if !deleted {
                return Some((&node.key, unsafe { &*node.value.get() }));
            }
        }
        None
    }
}

impl<K, V> Drop for MichaelList<K, V> {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            unsafe { drop(Box::from_raw(cur)) };
            cur = unmark(next);
        }
    }
}

unsafe impl<K: Send, V: Send> Send for MichaelList<K, V> {}
unsafe impl<K: Send, V: Send> Sync for MichaelList<K, V> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_find_erase_roundtrip() {
        let list = MichaelList::new();
        assert!(list.insert(1, "a"));
        assert!(list.insert(2, "b"));
        assert!(!list.insert(1, "a-dup"));
        assert!(list.find(&1));
        assert!(list.find(&2));
        assert!(!list.find(&3));
        assert!(list.erase(&2));
        assert!(!list.find(&2));
        assert!(!list.erase(&2));
    }

    #[test]
    fn scenario_insert_three_erase_middle() {
        let list = MichaelList::new();
        list.insert(1, "a");
        list.insert(2, "b");
        list.insert(3, "c");
        assert!(list.erase(&2));
        assert!(!list.find(&2));
        assert!(list.find(&1));
        assert!(list.find(&3));
    }

    #[test]
    fn iteration_is_key_increasing_and_skips_deleted() {
        let list = MichaelList::new();
        for k in [5, 1, 3, 2, 4] {
            list.insert(k, k * 10);
        }
        list.erase(&3);
        let keys: Vec<_> = list.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![1, 2, 4, 5]);
    }

    #[test]
    fn ensure_inserts_then_updates() {
        let list = MichaelList::new();
        let (ok, is_new) = list.ensure(1, 10, |v, is_new| {
            if is_new {
                *v += 1;
            }
        });
        assert!(ok && is_new);
        let mut out = 0;
        list.find_with(&1, &mut out, |v, out| *out = *v);
        assert_eq!(out, 11);

        let (ok, is_new) = list.ensure(1, 999, |v, is_new| {
            if !is_new {
                *v += 100;
            }
        });
        assert!(ok && !is_new);
        list.find_with(&1, &mut out, |v, out| *out = *v);
        assert_eq!(out, 111);
    }

    #[test]
    fn emplace_only_updates_existing() {
        let list = MichaelList::new();
        assert!(!list.emplace(&1, |v: &mut i32| *v += 1));
        list.insert(1, 5);
        assert!(list.emplace(&1, |v: &mut i32| *v += 1));
        let mut out = 0;
        list.find_with(&1, &mut out, |v, out| *out = *v);
        assert_eq!(out, 6);
    }

    #[test]
    fn clear_removes_everything() {
        let list = MichaelList::new();
        for k in 0..50 {
            list.insert(k, k);
        }
        assert_eq!(list.len(), 50);
        assert_eq!(list.clear(), 50);
        assert!(list.is_empty());
        assert_eq!(list.clear(), 0);
    }

    #[test]
    fn concurrent_inserts_are_all_present() {
        let list = Arc::new(MichaelList::new());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for i in 0..200 {
                        list.insert(t * 200 + i, ());
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(list.len(), 800);
        for k in 0..800 {
            assert!(list.find(&k));
        }
    }

    #[test]
    fn concurrent_insert_and_erase_leave_consistent_state() {
        let list = Arc::new(MichaelList::new());
        for k in 0..100 {
            list.insert(k, k);
        }
        let erasers: Vec<_> = (0..50)
            .map(|k| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    list.erase(&k);
                })
            })
            .collect();
        for e in erasers {
            e.join().unwrap();
        }
        assert_eq!(list.len(), 50);
        for k in 0..50 {
            assert!(!list.find(&k));
        }
        for k in 50..100 {
            assert!(list.find(&k));
        }
    }
}

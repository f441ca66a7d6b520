//! Lazy ordered singly-linked list.
//!
//! Same sorted-set shape as [`crate::list::michael`], but reconciles
//! logical deletion with concurrent traversal differently: search walks
//! optimistically, without taking any lock, and a mutator (`insert` or
//! `erase`) takes the per-node [`SpinLock`] on both the predecessor and
//! the node itself before committing, re-validating that neither is
//! marked and that they are still adjacent. This is the lazy list of
//! Heller et al. ("A Lazy Concurrent List-Based Set Algorithm"); a
//! permanent head/tail sentinel pair means a walk never has to special-
//! case the ends of the list.
//!
//! Protected by pass-the-buck SMR rather than hazard pointers, so the
//! crate's two interchangeable reclamation schemes each back at least one
//! container.

use std::boxed::Box;
use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use crate::backoff::Backoff;
use crate::pr::Counter;
use crate::ptb::{PassTheBuckGc, PtbConfig, PtbHandle};
use crate::spinlock::SpinLock;

const SLOT_PRED: usize = 0;
const SLOT_CUR: usize = 1;

/// A node's key, extended with the two sentinel positions so a search
/// never needs a null check mid-list.
enum Bound<K> {
    Head,
    Key(K),
    Tail,
}

impl<K: Ord> Bound<K> {
    fn cmp_key(&self, other: &K) -> CmpOrdering {
        match self {
            Bound::Head => CmpOrdering::Less,
            Bound::Tail => CmpOrdering::Greater,
            Bound::Key(k) => k.cmp(other),
        }
    }
}

struct Node<K, V> {
    key: Bound<K>,
    value: UnsafeCell<Option<V>>,
    next: AtomicPtr<Node<K, V>>,
    marked: AtomicBool,
    lock: SpinLock<()>,
}

impl<K, V> Node<K, V> {
    fn sentinel(key: Bound<K>, next: *mut Node<K, V>) -> Self {
        Self {
            key,
            value: UnsafeCell::new(None),
            next: AtomicPtr::new(next),
            marked: AtomicBool::new(false),
            lock: SpinLock::new(()),
        }
    }

    fn new(key: K, value: V, next: *mut Node<K, V>) -> Self {
        Self {
            key: Bound::Key(key),
            value: UnsafeCell::new(Some(value)),
            next: AtomicPtr::new(next),
            marked: AtomicBool::new(false),
            lock: SpinLock::new(()),
        }
    }
}

/// A sorted set, ordered by `K`, whose mutators briefly lock the two
/// nodes they touch.
pub struct LazyList<K, V> {
    head: *mut Node<K, V>,
    gc: Arc<PassTheBuckGc>,
    len: Counter,
}

impl<K: Ord, V> Default for LazyList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> LazyList<K, V> {
    /// Creates an empty set.
    pub fn new() -> Self {
        let tail = Box::into_raw(Box::new(Node::sentinel(Bound::Tail, ptr::null_mut())));
        let head = Box::into_raw(Box::new(Node::sentinel(Bound::Head, tail)));
        Self {
            head,
            gc: Arc::new(PassTheBuckGc::new(PtbConfig {
                guards_per_thread: 2,
                ..PtbConfig::default()
            })),
            len: Counter::new(Ordering::Relaxed),
        }
    }

    fn validate(pred: *mut Node<K, V>, cur: *mut Node<K, V>) -> bool {
        unsafe {
            !(*pred).marked.load(Ordering::Acquire)
                && !(*cur).marked.load(Ordering::Acquire)
                && (*pred).next.load(Ordering::Acquire) == cur
        }
    }

    /// Optimistic, lock-free walk: returns the last node whose key is
    /// `< key` (`pred`) and the first node whose key is `>= key` (`cur`),
    /// both published as hazardous in the calling thread's guard slots.
    fn search(&self, handle: &PtbHandle<'_>, key: &K) -> (*mut Node<K, V>, *mut Node<K, V>) {
        loop {
            let mut pred = self.head;
            handle.set_guard(SLOT_PRED, pred);
            let mut cur = handle.protect_link(SLOT_CUR, unsafe { &(*pred).next });

            loop {
                match unsafe { (*cur).key.cmp_key(key) } {
                    CmpOrdering::Less => {
                        handle.set_guard(SLOT_PRED, cur);
                        pred = cur;
                        cur = handle.protect_link(SLOT_CUR, unsafe { &(*pred).next });
                    }
                    _ => return (pred, cur),
                }
            }
        }
    }

    /// Inserts `key` with `value` if absent.
    pub fn insert(&self, key: K, value: V) -> bool {
        let handle = PassTheBuckGc::thread_handle(&self.gc);
        let _g0 = handle
            .acquire_guard(SLOT_PRED)
            .expect("lazy list needs >=2 guards");
        let _g1 = handle
            .acquire_guard(SLOT_CUR)
            .expect("lazy list needs >=2 guards");
        let mut backoff = Backoff::lock_default();

        let inserted = 'retry: loop {
            let (pred, cur) = self.search(handle, &key);
            let _pred_lock = unsafe { (*pred).lock.lock() };
            let _cur_lock = unsafe { (*cur).lock.lock() };
            if !Self::validate(pred, cur) {
                drop(_cur_lock);
                drop(_pred_lock);
                backoff.spin();
                continue 'retry;
            }
            if unsafe { (*cur).key.cmp_key(&key) } == CmpOrdering::Equal {
                break false;
            }
            let node = Box::into_raw(Box::new(Node::new(key, value, cur)));
            unsafe { (*pred).next.store(node, Ordering::Release) };
            break true;
        };

        if inserted {
            self.len.inc();
        }
        inserted
    }

    /// Removes `key` if present.
    pub fn erase(&self, key: &K) -> bool {
        let handle = PassTheBuckGc::thread_handle(&self.gc);
        let _g0 = handle
            .acquire_guard(SLOT_PRED)
            .expect("lazy list needs >=2 guards");
        let _g1 = handle
            .acquire_guard(SLOT_CUR)
            .expect("lazy list needs >=2 guards");
        let mut backoff = Backoff::lock_default();

        let removed = 'retry: loop {
            let (pred, cur) = self.search(handle, key);
            if unsafe { (*cur).key.cmp_key(key) } != CmpOrdering::Equal {
                break false;
            }
            let _pred_lock = unsafe { (*pred).lock.lock() };
            let _cur_lock = unsafe { (*cur).lock.lock() };
            if !Self::validate(pred, cur) {
                drop(_cur_lock);
                drop(_pred_lock);
                backoff.spin();
                continue 'retry;
            }
            unsafe { (*cur).marked.store(true, Ordering::Release) };
            let next = unsafe { (*cur).next.load(Ordering::Acquire) };
            unsafe { (*pred).next.store(next, Ordering::Release) };
            drop(_cur_lock);
            drop(_pred_lock);
            unsafe { handle.retire(cur) };
            break true;
        };

        if removed {
            self.len.dec();
        }
        removed
    }

    /// Returns whether `key` is present.
    pub fn find(&self, key: &K) -> bool {
        let handle = PassTheBuckGc::thread_handle(&self.gc);
        let _g0 = handle
            .acquire_guard(SLOT_PRED)
            .expect("lazy list needs >=2 guards");
        let _g1 = handle
            .acquire_guard(SLOT_CUR)
            .expect("lazy list needs >=2 guards");
        let (_, cur) = self.search(handle, key);
        let found = unsafe {
            (*cur).key.cmp_key(key) == CmpOrdering::Equal && !(*cur).marked.load(Ordering::Acquire)
        };
        found
    }

    /// If `key` is present, copies its value into `out` via `copier` and
    /// returns `true`; otherwise leaves `out` untouched and returns
    /// `false`.
    pub fn find_with<F>(&self, key: &K, out: &mut V, copier: F) -> bool
    where
        F: Fn(&V, &mut V),
    {
        let handle = PassTheBuckGc::thread_handle(&self.gc);
        let _g0 = handle
            .acquire_guard(SLOT_PRED)
            .expect("lazy list needs >=2 guards");
        let _g1 = handle
            .acquire_guard(SLOT_CUR)
            .expect("lazy list needs >=2 guards");
        let (_, cur) = self.search(handle, key);
        let found = unsafe {
            (*cur).key.cmp_key(key) == CmpOrdering::Equal && !(*cur).marked.load(Ordering::Acquire)
        };
        if found {
            let value_ref = unsafe { (*(*cur).value.get()).as_ref().expect("live node has a value") };
            copier(value_ref, out);
        }
        found
    }

    /// Insert-or-update: if `key` is already present, calls `updater`
    /// with the existing value and `false`, and returns `(true, false)`;
    /// otherwise links a new node holding `value`, calls `updater` with
    /// it and `true`, and returns `(true, true)`.
    pub fn ensure<F>(&self, key: K, value: V, updater: F) -> (bool, bool)
    where
        F: FnOnce(&mut V, bool),
    {
        let handle = PassTheBuckGc::thread_handle(&self.gc);
        let _g0 = handle
            .acquire_guard(SLOT_PRED)
            .expect("lazy list needs >=2 guards");
        let _g1 = handle
            .acquire_guard(SLOT_CUR)
            .expect("lazy list needs >=2 guards");
        let mut backoff = Backoff::lock_default();
        let mut pending = Some((key, value));
        let mut updater = Some(updater);

        let is_new = 'retry: loop {
            let search_key = &pending.as_ref().expect("pending taken more than once").0;
            let (pred, cur) = self.search(handle, search_key);
            let _pred_lock = unsafe { (*pred).lock.lock() };
            let _cur_lock = unsafe { (*cur).lock.lock() };
            if !Self::validate(pred, cur) {
                drop(_cur_lock);
                drop(_pred_lock);
                backoff.spin();
                continue 'retry;
            }
            let search_key = &pending.as_ref().expect("pending taken more than once").0;
            if unsafe { (*cur).key.cmp_key(search_key) } == CmpOrdering::Equal {
                let f = updater.take().expect("ensure updater invoked more than once");
                f(
                    unsafe { (*(*cur).value.get()).as_mut().expect("live node has a value") },
                    false,
                );
                break false;
            }
            let (key, value) = pending.take().expect("pending taken more than once");
            let node = Box::into_raw(Box::new(Node::new(key, value, cur)));
            unsafe { (*pred).next.store(node, Ordering::Release) };
            let f = updater.take().expect("ensure updater invoked more than once");
            f(
                unsafe { (*(*node).value.get()).as_mut().expect("just initialised") },
                true,
            );
            break true;
        };

        if is_new {
            self.len.inc();
        }
        (true, is_new)
    }

    /// Update-only: if `key` is present and not concurrently being
    /// erased, calls `updater` with its value and returns `true`;
    /// otherwise returns `false` without calling it.
    pub fn emplace<F>(&self, key: &K, updater: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        let handle = PassTheBuckGc::thread_handle(&self.gc);
        let _g0 = handle
            .acquire_guard(SLOT_PRED)
            .expect("lazy list needs >=2 guards");
        let _g1 = handle
            .acquire_guard(SLOT_CUR)
            .expect("lazy list needs >=2 guards");
        let (_, cur) = self.search(handle, key);
        let result = if unsafe { (*cur).key.cmp_key(key) } == CmpOrdering::Equal {
            let _lock = unsafe { (*cur).lock.lock() };
            if unsafe { (*cur).marked.load(Ordering::Acquire) } {
                false
            } else {
                updater(unsafe { (*(*cur).value.get()).as_mut().expect("live node has a value") });
                true
            }
        } else {
            false
        };
        result
    }

    /// Removes the first live node, if any. Used by [`Self::clear`].
    fn pop_front(&self) -> bool {
        let handle = PassTheBuckGc::thread_handle(&self.gc);
        let _g0 = handle
            .acquire_guard(SLOT_PRED)
            .expect("lazy list needs >=2 guards");
        let _g1 = handle
            .acquire_guard(SLOT_CUR)
            .expect("lazy list needs >=2 guards");
        let mut backoff = Backoff::lock_default();

        let removed = 'retry: loop {
            let pred = self.head;
            handle.set_guard(SLOT_PRED, pred);
            let cur = handle.protect_link(SLOT_CUR, unsafe { &(*pred).next });
            if matches!(unsafe { &(*cur).key }, Bound::Tail) {
                break false;
            }
            let _pred_lock = unsafe { (*pred).lock.lock() };
            let _cur_lock = unsafe { (*cur).lock.lock() };
            if !Self::validate(pred, cur) {
                drop(_cur_lock);
                drop(_pred_lock);
                backoff.spin();
                continue 'retry;
            }
            unsafe { (*cur).marked.store(true, Ordering::Release) };
            let next = unsafe { (*cur).next.load(Ordering::Acquire) };
            unsafe { (*pred).next.store(next, Ordering::Release) };
            drop(_cur_lock);
            drop(_pred_lock);
            unsafe { handle.retire(cur) };
            break true;
        };

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
            cur: unsafe { (*self.head).next.load(Ordering::Acquire) },
            _marker: std::marker::PhantomData,
        }
    }
}

/// See [`LazyList::iter`].
pub struct Iter<'a, K, V> {
    cur: *mut Node<K, V>,
    _marker: std::marker::PhantomData<&'a LazyList<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = unsafe { &*self.cur };
            match &node.key {
                Bound::Tail => return None,
                Bound::Head => unreachable!("iteration never revisits the head sentinel"),
                Bound::Key(k) => {
                    let marked = node.marked.load(Ordering::Relaxed);
                    self.cur = node.next.load(Ordering::Relaxed);
                    if !marked {
                        let value = unsafe { (*node.value.get()).as_ref().expect("live node has a value") };
                        return Some((k, value));
                    }
                }
            }
        }
    }
}

impl<K, V> Drop for LazyList<K, V> {
    fn drop(&mut self) {
        let mut cur = self.head;
        loop {
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            unsafe { drop(Box::from_raw(cur)) };
            if next.is_null() {
                break;
            }
            cur = next;
        }
    }
}

unsafe impl<K: Send, V: Send> Send for LazyList<K, V> {}
unsafe impl<K: Send, V: Send> Sync for LazyList<K, V> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_find_erase_roundtrip() {
        let list = LazyList::new();
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
        let list = LazyList::new();
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
        let list = LazyList::new();
        for k in [5, 1, 3, 2, 4] {
            list.insert(k, k * 10);
        }
        list.erase(&3);
        let keys: Vec<_> = list.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![1, 2, 4, 5]);
    }

    #[test]
    fn ensure_inserts_then_updates() {
        let list = LazyList::new();
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
        let list = LazyList::new();
        assert!(!list.emplace(&1, |v: &mut i32| *v += 1));
        list.insert(1, 5);
        assert!(list.emplace(&1, |v: &mut i32| *v += 1));
        let mut out = 0;
        list.find_with(&1, &mut out, |v, out| *out = *v);
        assert_eq!(out, 6);
    }

    #[test]
    fn clear_removes_everything() {
        let list = LazyList::new();
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
        let list = Arc::new(LazyList::new());
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
        let list = Arc::new(LazyList::new());
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

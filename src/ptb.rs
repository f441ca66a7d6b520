//! Pass-the-buck safe memory reclamation.
//!
//! Unlike [`crate::hp`], protection here is not "a per-thread slot that
//! stays put until cleared" — it is a **guard** drawn from one global
//! pool, carrying two fields: `post` (the pointer currently protected)
//! and `hand_off` (a retired node this guard has personally *trapped*,
//! kept alive only as long as this guard holds it). [`PassTheBuckGc`]'s
//! `liberate` pass steals the entire global retired buffer in a single
//! swap of its head, then walks every guard in the pool: a guard whose
//! `post` names a stolen node traps that node into its own `hand_off`,
//! bumping whatever it had previously trapped back into play; a guard
//! whose `post` names nothing of interest releases its `hand_off` for
//! reconsideration by later guards in the same pass. Whatever nothing
//! still names once the walk completes is freed. The guard pool is a
//! global, append-only list; [`crate::stack::Stack`] backs the global
//! retired buffer, giving that earlier building block a real consumer.

use std::boxed::Box;
use std::cell::{RefCell, UnsafeCell};
use std::collections::{HashMap, HashSet};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::vec::Vec;

use crate::error::SmrError;
use crate::stack::{Stack, StackEntry};
use crate::thread_id;

/// Construction parameters for [`PassTheBuckGc`].
#[derive(Debug, Clone, Copy)]
pub struct PtbConfig {
    /// Guards drawn from the global pool per attached thread.
    pub guards_per_thread: usize,
    /// Expected upper bound on concurrently attached threads; used only
    /// to size the initial pool, not enforced as a cap.
    pub max_threads: usize,
    /// A thread's local retired list is flushed into the global retired
    /// buffer, and a `liberate` pass runs, once the local list reaches
    /// this many entries.
    pub liberate_threshold: usize,
}

impl Default for PtbConfig {
    fn default() -> Self {
        Self {
            guards_per_thread: 8,
            max_threads: 100,
            liberate_threshold: 256,
        }
    }
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct InternalState {
    /// Total guards ever allocated into the global pool.
    pub guard_count: usize,
    /// Guards currently drawn by some attached thread.
    pub guard_in_use_count: usize,
    /// Guards allocated from the heap rather than recycled.
    pub guard_allocated_count: usize,
    /// Pointers retired but not yet freed.
    pub total_retired_count: usize,
    /// Number of `liberate` passes run so far.
    pub liberate_call_count: u64,
    /// Number of times a retired node was trapped into a guard's hand-off.
    pub handed_off_count: u64,
}

/// A pointer awaiting reclamation, paired with the function that frees
/// its concrete type.
#[derive(Clone, Copy)]
struct Retired {
    ptr: *mut (),
    free_fn: unsafe fn(*mut ()),
}

unsafe impl Send for Retired {}

/// The global retired buffer and every guard's `hand_off` slot both hold
/// nodes of this shape.
type RetiredNode = StackEntry<Retired>;

struct GuardData {
    /// The pointer this guard currently protects.
    post: AtomicPtr<()>,
    /// A retired node this guard has trapped, or null.
    hand_off: AtomicPtr<RetiredNode>,
    /// Whether some thread currently holds this guard.
    in_use: AtomicBool,
    next: AtomicPtr<GuardData>,
}

impl GuardData {
    fn new() -> Self {
        Self {
            post: AtomicPtr::new(ptr::null_mut()),
            hand_off: AtomicPtr::new(ptr::null_mut()),
            in_use: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

unsafe impl Sync for GuardData {}

/// A pass-the-buck based safe memory reclamation scheme.
pub struct PassTheBuckGc {
    config: PtbConfig,
    /// Global, append-only list of every guard ever allocated — walked
    /// in full by every `liberate` pass, not just the currently drawn
    /// ones, since an idle guard's `hand_off` may still trap a node.
    guards: AtomicPtr<GuardData>,
    retired_buffer: Stack<Retired>,
    allocated_guards: AtomicUsize,
    retired_count: AtomicUsize,
    liberate_calls: AtomicU64,
    handed_off: AtomicU64,
}

unsafe impl Send for PassTheBuckGc {}
unsafe impl Sync for PassTheBuckGc {}

impl PassTheBuckGc {
    /// Creates a standalone collector with the given configuration.
    pub fn new(config: PtbConfig) -> Self {
        Self {
            config,
            guards: AtomicPtr::new(ptr::null_mut()),
            retired_buffer: Stack::new(),
            allocated_guards: AtomicUsize::new(0),
            retired_count: AtomicUsize::new(0),
            liberate_calls: AtomicU64::new(0),
            handed_off: AtomicU64::new(0),
        }
    }

    /// Draws `n` guards from the pool, reusing idle ones before
    /// allocating new ones and prepending them to the global list.
    fn draw_guards(&self, n: usize) -> Vec<*mut GuardData> {
        let mut drawn = Vec::with_capacity(n);
        let mut cur = self.guards.load(Ordering::Acquire);
        while !cur.is_null() && drawn.len() < n {
            let g = unsafe { &*cur };
            if g.in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                drawn.push(cur);
            }
            cur = g.next.load(Ordering::Acquire);
        }

        while drawn.len() < n {
            let g = Box::into_raw(Box::new(GuardData::new()));
            self.allocated_guards.fetch_add(1, Ordering::Relaxed);
            loop {
                let head = self.guards.load(Ordering::Relaxed);
                unsafe { (*g).next.store(head, Ordering::Relaxed) };
                if self
                    .guards
                    .compare_exchange_weak(head, g, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
            drawn.push(g);
        }

        log::debug!(
            "ptb: thread {} drew {} guards ({} allocated overall)",
            thread_id::current(),
            drawn.len(),
            self.allocated_guards.load(Ordering::Relaxed)
        );
        drawn
    }

    /// Attaches the calling thread, drawing [`PtbConfig::guards_per_thread`]
    /// guards from the pool.
    pub fn attach(&self) -> PtbHandle<'_> {
        let guards = self.draw_guards(self.config.guards_per_thread);
        PtbHandle {
            gc: self,
            guards,
            retired: UnsafeCell::new(Vec::new()),
        }
    }

    /// The pass-the-buck reclamation pass.
    ///
    /// Steals the global retired buffer in one swap of its head, then
    /// walks every guard: a guard whose `post` names a stolen node traps
    /// it into that guard's own `hand_off`. Whatever is left unclaimed
    /// once the walk completes is freed.
    fn liberate(&self) {
        self.liberate_calls.fetch_add(1, Ordering::Relaxed);

        let mut set: HashMap<*mut (), *mut RetiredNode> = HashMap::new();
        if let Some(mut node) = unsafe { self.retired_buffer.pop_all() } {
            loop {
                let next = unsafe { (*node).next.load(Ordering::Relaxed) };
                let ptr = unsafe { (*node).data().ptr };
                set.insert(ptr, node);
                if next.is_null() {
                    break;
                }
                node = next;
            }
        }

        let mut done: HashSet<*mut ()> = HashSet::new();
        let mut freed = 0usize;
        let mut trapped = 0usize;

        let mut cur = self.guards.load(Ordering::Acquire);
        while !cur.is_null() {
            let guard = unsafe { &*cur };
            let post = guard.post.load(Ordering::Acquire);
            let found = if post.is_null() { None } else { set.remove(&post) };

            if let Some(node) = found {
                let prev = guard.hand_off.load(Ordering::Acquire);
                if !prev.is_null() {
                    let prev_ptr = unsafe { (*prev).data().ptr };
                    if prev_ptr != post {
                        if done.contains(&prev_ptr) {
                            unsafe { self.retired_buffer.push(prev) };
                        } else {
                            set.insert(prev_ptr, prev);
                        }
                    }
                }
                guard.hand_off.store(node, Ordering::Release);
                trapped += 1;
            } else {
                let prev = guard.hand_off.load(Ordering::Acquire);
                if !prev.is_null() {
                    let prev_ptr = unsafe { (*prev).data().ptr };
                    set.insert(prev_ptr, prev);
                }
                guard.hand_off.store(ptr::null_mut(), Ordering::Release);
            }

            if !post.is_null() {
                done.insert(post);
            }
            cur = guard.next.load(Ordering::Acquire);
        }

        for (_, node) in set {
            let retired = unsafe { *(*node).data() };
            unsafe { (retired.free_fn)(retired.ptr) };
            unsafe { drop(Box::from_raw(node)) };
            freed += 1;
        }

        self.retired_count.fetch_sub(freed, Ordering::Relaxed);
        self.handed_off.fetch_add(trapped as u64, Ordering::Relaxed);
        log::trace!("ptb: liberate freed {} trapped {}", freed, trapped);
    }

    /// Returns the calling thread's cached attachment to `gc`, attaching
    /// once on first use and reusing the same drawn guards for every
    /// later call instead of drawing and returning them on every
    /// operation. Released automatically when the thread exits, via
    /// [`PtbHandle`]'s own `Drop`.
    pub fn thread_handle(gc: &Arc<PassTheBuckGc>) -> &'static PtbHandle<'static> {
        THREAD_HANDLES.with(|cache| {
            let mut cache = cache.borrow_mut();
            if let Some((handle, _)) = cache.iter().find(|(_, owner)| Arc::ptr_eq(owner, gc)) {
                let ptr: *const PtbHandle<'static> = handle.as_ref();
                return unsafe { &*ptr };
            }
            let owner = Arc::clone(gc);
            // SAFETY: see the identical reasoning in
            // `HazardPointerGc::thread_handle` — `handle` borrows
            // `*owner`, and `owner` lives in this same thread-local cache
            // slot for as long as `handle` does.
            let handle: PtbHandle<'static> = unsafe { std::mem::transmute(owner.attach()) };
            cache.push((Box::new(handle), owner));
            let ptr: *const PtbHandle<'static> = cache.last().unwrap().0.as_ref();
            unsafe { &*ptr }
        })
    }

    /// A snapshot of guard/retired-list statistics for diagnostics.
    pub fn internal_state(&self) -> InternalState {
        let mut total = 0usize;
        let mut used = 0usize;
        let mut cur = self.guards.load(Ordering::Acquire);
        while !cur.is_null() {
            let g = unsafe { &*cur };
            total += 1;
            if g.in_use.load(Ordering::Acquire) {
                used += 1;
            }
            cur = g.next.load(Ordering::Acquire);
        }
        InternalState {
            guard_count: total,
            guard_in_use_count: used,
            guard_allocated_count: self.allocated_guards.load(Ordering::Relaxed),
            total_retired_count: self.retired_count.load(Ordering::Relaxed),
            liberate_call_count: self.liberate_calls.load(Ordering::Relaxed),
            handed_off_count: self.handed_off.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PassTheBuckGc {
    fn drop(&mut self) {
        if let Some(mut node) = unsafe { self.retired_buffer.pop_all() } {
            loop {
                let next = unsafe { (*node).next.load(Ordering::Relaxed) };
                let retired = unsafe { *(*node).data() };
                unsafe { (retired.free_fn)(retired.ptr) };
                unsafe { drop(Box::from_raw(node)) };
                if next.is_null() {
                    break;
                }
                node = next;
            }
        }

        let mut cur = *self.guards.get_mut();
        while !cur.is_null() {
            let guard = unsafe { Box::from_raw(cur) };
            let next = guard.next.load(Ordering::Relaxed);
            let handoff = guard.hand_off.load(Ordering::Relaxed);
            if !handoff.is_null() {
                let retired = unsafe { *(*handoff).data() };
                unsafe { (retired.free_fn)(retired.ptr) };
                unsafe { drop(Box::from_raw(handoff)) };
            }
            cur = next;
        }
    }
}

/// A thread's attachment to a [`PassTheBuckGc`]: the guards it drew,
/// plus its own local retired list (flushed into the global buffer once
/// it reaches [`PtbConfig::liberate_threshold`]).
pub struct PtbHandle<'a> {
    gc: &'a PassTheBuckGc,
    guards: Vec<*mut GuardData>,
    retired: UnsafeCell<Vec<Retired>>,
}

thread_local! {
    static THREAD_HANDLES: RefCell<Vec<(Box<PtbHandle<'static>>, Arc<PassTheBuckGc>)>> =
        RefCell::new(Vec::new());
}

impl<'a> PtbHandle<'a> {
    /// Reserves `slot` for this thread's use as a guard.
    pub fn acquire_guard(&self, slot: usize) -> Result<Guard<'a, '_>, SmrError> {
        if slot >= self.guards.len() {
            return Err(SmrError::TooManyGuards);
        }
        Ok(Guard { handle: self, slot })
    }

    /// Publishes `ptr` as this guard's `post`.
    pub fn set_guard<T>(&self, slot: usize, ptr: *mut T) {
        let g = unsafe { &*self.guards[slot] };
        g.post.store(ptr as *mut (), Ordering::Release);
    }

    /// Clears guard slot `slot`'s `post`.
    pub fn release_guard(&self, slot: usize) {
        let g = unsafe { &*self.guards[slot] };
        g.post.store(ptr::null_mut(), Ordering::Release);
    }

    /// Reads `source`, publishes the observed pointer as this guard's
    /// `post`, and retries if `source` changed before the publish was
    /// visible.
    pub fn protect_link<T>(&self, slot: usize, source: &AtomicPtr<T>) -> *mut T {
        loop {
            let p = source.load(Ordering::Acquire);
            self.set_guard(slot, p);
            if source.load(Ordering::Acquire) == p {
                return p;
            }
        }
    }

    /// Schedules `ptr` for reclamation. Once this thread's local retired
    /// list passes its configured threshold, the list is flushed into
    /// the global retired buffer and a `liberate` pass runs.
    ///
    /// # Safety
    ///
    /// `ptr` must have been obtained from `Box::into_raw::<T>` and must
    /// not be accessed by the caller again after this call returns.
    pub unsafe fn retire<T>(&self, ptr: *mut T) {
        let local = &mut *self.retired.get();
        local.push(Retired {
            ptr: ptr as *mut (),
            free_fn: |p| drop(Box::from_raw(p as *mut T)),
        });
        self.gc.retired_count.fetch_add(1, Ordering::Relaxed);
        if local.len() >= self.gc.config.liberate_threshold {
            self.liberate();
        }
    }

    /// Flushes this thread's local retired list into the global buffer
    /// (if non-empty) and forces a `liberate` pass over every guard.
    pub fn liberate(&self) {
        let local = unsafe { &mut *self.retired.get() };
        if !local.is_empty() {
            let drained = std::mem::take(local);
            for r in drained {
                let node = Box::into_raw(Box::new(StackEntry::new(r)));
                unsafe { self.gc.retired_buffer.push(node) };
            }
        }
        self.gc.liberate();
    }

    /// Detaches the thread: flushes and liberates any pending retired
    /// entries, clears each drawn guard's `post`, and returns the guards
    /// to the pool for another thread to draw.
    pub fn detach(self) {}
}

impl Drop for PtbHandle<'_> {
    fn drop(&mut self) {
        self.liberate();
        for &g in &self.guards {
            let g = unsafe { &*g };
            g.post.store(ptr::null_mut(), Ordering::Release);
            g.in_use.store(false, Ordering::Release);
        }
    }
}

/// An acquired guard slot. Automatically cleared on drop.
pub struct Guard<'gc, 'h> {
    handle: &'h PtbHandle<'gc>,
    slot: usize,
}

impl<'gc, 'h> Guard<'gc, 'h> {
    /// Publishes `ptr` as this guard's `post`.
    pub fn protect<T>(&self, ptr: *mut T) {
        self.handle.set_guard(self.slot, ptr);
    }

    /// See [`PtbHandle::protect_link`].
    pub fn protect_link<T>(&self, source: &AtomicPtr<T>) -> *mut T {
        self.handle.protect_link(self.slot, source)
    }
}

impl Drop for Guard<'_, '_> {
    fn drop(&mut self) {
        self.handle.release_guard(self.slot);
    }
}

static GC_CELL: OnceLock<PassTheBuckGc> = OnceLock::new();
static GC_TORN_DOWN: AtomicBool = AtomicBool::new(false);

/// Constructs the process-wide pass-the-buck singleton.
pub fn construct(config: PtbConfig) {
    let _ = GC_CELL.set(PassTheBuckGc::new(config));
    GC_TORN_DOWN.store(false, Ordering::Release);
}

/// Marks the process-wide singleton unusable until [`construct`] runs
/// again.
pub fn destruct() {
    GC_TORN_DOWN.store(true, Ordering::Release);
}

/// Borrows the process-wide singleton.
///
/// Fails with [`SmrError::GCNotConstructed`] if [`construct`] was never
/// called, or if [`destruct`] has run since.
pub fn global() -> Result<&'static PassTheBuckGc, SmrError> {
    if GC_TORN_DOWN.load(Ordering::Acquire) {
        return Err(SmrError::GCNotConstructed);
    }
    GC_CELL.get().ok_or(SmrError::GCNotConstructed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Mutex;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    struct DropCounter<'a>(&'a StdAtomicUsize);

    impl Drop for DropCounter<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn attach_detach_round_trips() {
        init_logger();
        let gc = PassTheBuckGc::new(PtbConfig {
            guards_per_thread: 2,
            ..PtbConfig::default()
        });
        let handle = gc.attach();
        assert_eq!(gc.internal_state().guard_in_use_count, 2);
        handle.detach();
        assert_eq!(gc.internal_state().guard_in_use_count, 0);
        assert_eq!(
            gc.internal_state().guard_count,
            2,
            "guards are recycled, not freed"
        );
    }

    #[test]
    fn acquire_guard_beyond_capacity_errors() {
        let gc = PassTheBuckGc::new(PtbConfig {
            guards_per_thread: 1,
            ..PtbConfig::default()
        });
        let handle = gc.attach();
        assert!(handle.acquire_guard(0).is_ok());
        assert_eq!(handle.acquire_guard(3).unwrap_err(), SmrError::TooManyGuards);
    }

    #[test]
    fn unguarded_retired_pointer_is_freed_on_liberate() {
        init_logger();
        static DROPPED: StdAtomicUsize = StdAtomicUsize::new(0);
        let gc = PassTheBuckGc::new(PtbConfig::default());
        let handle = gc.attach();
        let boxed = Box::into_raw(Box::new(DropCounter(&DROPPED)));
        unsafe { handle.retire(boxed) };
        handle.liberate();
        assert_eq!(DROPPED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guarded_pointer_is_trapped_in_hand_off_not_freed() {
        init_logger();
        static DROPPED: StdAtomicUsize = StdAtomicUsize::new(0);
        let gc = PassTheBuckGc::new(PtbConfig::default());

        let owner = gc.attach();
        let boxed = Box::into_raw(Box::new(DropCounter(&DROPPED)));
        let cell = AtomicPtr::new(boxed);
        let guard = owner.acquire_guard(0).unwrap();
        guard.protect_link(&cell);

        let retirer = gc.attach();
        unsafe { retirer.retire(boxed) };
        retirer.liberate();
        assert_eq!(
            DROPPED.load(Ordering::SeqCst),
            0,
            "still guarded, trapped not freed"
        );
        assert_eq!(gc.internal_state().handed_off_count, 1);

        drop(guard);
        retirer.liberate();
        assert_eq!(DROPPED.load(Ordering::SeqCst), 1);
    }

    static GLOBAL_TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn global_is_unusable_before_construct_or_after_destruct() {
        let _guard = GLOBAL_TEST_LOCK.lock().unwrap();
        destruct();
        assert_eq!(global().unwrap_err(), SmrError::GCNotConstructed);
        construct(PtbConfig::default());
        assert!(global().is_ok());
        destruct();
        assert_eq!(global().unwrap_err(), SmrError::GCNotConstructed);
        construct(PtbConfig::default());
    }
}

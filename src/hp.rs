//! Hazard-pointer safe memory reclamation.
//!
//! Each attached thread owns an [`HpRec`] carrying a fixed number of
//! hazard slots (set at [`HazardPointerGc::new`] time) and a bounded
//! retired-pointer list. A thread publishes a pointer it is about to
//! dereference into one of its slots (`set_guard`/`protect_link`) before
//! any other thread is allowed to free it; `retire` hands a pointer over
//! for eventual reclamation once no slot anywhere still names it
//! (`scan`). Threads that vanish without detaching leave their retired
//! pointers behind for [`HazardPointerGc::help_scan`] to fold into a
//! live thread's list.

use std::boxed::Box;
use std::cell::{RefCell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::vec::Vec;

use crate::error::SmrError;
use crate::pr;
use crate::thread_id::{self, NULL_THREAD_ID};

/// Construction parameters for [`HazardPointerGc`].
#[derive(Debug, Clone, Copy)]
pub struct HpConfig {
    /// Hazard slots reserved per attached thread. Fixed for the scheme's
    /// lifetime: containers index into slots by a compile-time-known
    /// role, so this cannot grow after construction.
    pub hazard_pointers_per_thread: usize,
    /// Expected upper bound on concurrently attached threads; used only
    /// to size the default retired-list capacity, not enforced as a hard
    /// cap on the record list itself.
    pub max_threads: usize,
    /// A thread's retire list triggers a scan once it reaches this many
    /// entries. The classic bound is `2 * N * T` (two retired pointers
    /// per hazard slot per thread) so a scan always has room to make
    /// progress.
    pub max_retired_per_thread: usize,
}

impl Default for HpConfig {
    fn default() -> Self {
        let hazard_pointers_per_thread = 8;
        let max_threads = 100;
        Self {
            hazard_pointers_per_thread,
            max_threads,
            max_retired_per_thread: 2 * hazard_pointers_per_thread * max_threads,
        }
    }
}

/// Point-in-time counters mirroring the original collector's
/// introspection state.
#[derive(Debug, Clone, Copy, Default)]
pub struct InternalState {
    pub hp_record_count: usize,
    pub hp_record_used_count: usize,
    pub hp_record_allocated_count: usize,
    pub hp_record_free_count: usize,
    pub total_retired_count: usize,
    pub scan_call_count: u64,
    pub help_scan_call_count: u64,
}

struct Retired {
    ptr: *mut (),
    free_fn: unsafe fn(*mut ()),
}

// The pointer is only ever passed to `free_fn`, which reconstructs the
// original `Box<T>`; `T: Send` is enforced at `retire`'s call site via the
// `HpRec`/`ThreadHandle` not being `Sync`-shared across the free, only the
// retire-list bookkeeping moves between threads during `help_scan`.
unsafe impl Send for Retired {}

struct HpRec {
    hazards: Box<[AtomicPtr<()>]>,
    next: AtomicPtr<HpRec>,
    /// `true` while a thread owns this record (either actively attached,
    /// or momentarily claimed by `help_scan`/`attach` during hand-off).
    active: AtomicBool,
    owner: AtomicU64,
    retired: UnsafeCell<Vec<Retired>>,
}

impl HpRec {
    fn new(n: usize) -> Self {
        Self {
            hazards: (0..n).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            next: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(true),
            owner: AtomicU64::new(thread_id::current()),
            retired: UnsafeCell::new(Vec::new()),
        }
    }
}

unsafe impl Sync for HpRec {}

/// A hazard-pointer based safe memory reclamation scheme.
///
/// Usually accessed through the process-wide singleton ([`construct`],
/// [`global`], [`destruct`]), but can be instantiated directly for
/// isolated use (tests, or an application running more than one
/// independent collector).
pub struct HazardPointerGc {
    config: HpConfig,
    head: AtomicPtr<HpRec>,
    allocated: AtomicUsize,
    retired_count: AtomicUsize,
    scan_calls: AtomicU64,
    help_scan_calls: AtomicU64,
}

unsafe impl Send for HazardPointerGc {}
unsafe impl Sync for HazardPointerGc {}

impl HazardPointerGc {
    /// Creates a standalone collector with the given configuration.
    pub fn new(config: HpConfig) -> Self {
        Self {
            config,
            head: AtomicPtr::new(ptr::null_mut()),
            allocated: AtomicUsize::new(0),
            retired_count: AtomicUsize::new(0),
            scan_calls: AtomicU64::new(0),
            help_scan_calls: AtomicU64::new(0),
        }
    }

    /// Attaches the calling thread, reusing an abandoned record if one is
    /// available, else allocating a new one.
    pub fn attach(&self) -> ThreadHandle<'_> {
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let rec = unsafe { &*cur };
            if rec
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                rec.owner.store(thread_id::current(), Ordering::Release);
                log::trace!("hp: thread {} reused an abandoned record", thread_id::current());
                return ThreadHandle { gc: self, rec: cur };
            }
            cur = rec.next.load(Ordering::Acquire);
        }

        let rec = Box::into_raw(Box::new(HpRec::new(self.config.hazard_pointers_per_thread)));
        self.allocated.fetch_add(1, Ordering::Relaxed);
        loop {
            let head = self.head.load(Ordering::Relaxed);
            unsafe { (*rec).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, rec, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        log::debug!("hp: thread {} allocated a new record", thread_id::current());
        ThreadHandle { gc: self, rec }
    }

    fn collect_hazards(&self, skip: *mut HpRec) -> Vec<*mut ()> {
        let mut out = Vec::new();
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            if cur != skip {
                let rec = unsafe { &*cur };
                for hp in rec.hazards.iter() {
                    let p = hp.load(Ordering::Acquire);
                    if !p.is_null() {
                        out.push(p);
                    }
                }
            }
            cur = unsafe { (*cur).next.load(Ordering::Acquire) };
        }
        out
    }

    fn scan(&self, rec: &HpRec) {
        self.scan_calls.fetch_add(1, Ordering::Relaxed);
        let plist = self.collect_hazards(rec as *const HpRec as *mut HpRec);
        let retired = unsafe { &mut *rec.retired.get() };
        let before = retired.len();
        retired.retain(|r| {
            if plist.contains(&r.ptr) {
                true
            } else {
                unsafe { (r.free_fn)(r.ptr) };
                false
            }
        });
        let reclaimed = before - retired.len();
        self.retired_count.fetch_sub(reclaimed, Ordering::Relaxed);
        log::trace!("hp: scan reclaimed {} of {}", reclaimed, before);
    }

    /// Folds the retired lists of abandoned records into the caller's own
    /// list, then scans. A record is abandoned either because its owner
    /// cleanly detached (`active == false`), or because its owner id
    /// names a thread that is no longer alive — a thread that panicked or
    /// was killed mid-operation without ever detaching, leaving `active`
    /// stuck `true` forever otherwise.
    ///
    /// This is how memory retired by a thread that detached (or died)
    /// mid-flight still gets reclaimed instead of leaking forever.
    pub fn help_scan(&self, rec: &HpRec) {
        self.help_scan_calls.fetch_add(1, Ordering::Relaxed);
        let self_ptr = rec as *const HpRec as *mut HpRec;
        let my_id = thread_id::current();
        let mut cur = self.head.load(Ordering::Acquire);
        let mut helped = 0usize;
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load(Ordering::Acquire) };
            if cur != self_ptr {
                let other = unsafe { &*cur };
                let claimed = if other
                    .active
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    true
                } else {
                    let owner = other.owner.load(Ordering::Acquire);
                    owner != NULL_THREAD_ID
                        && !thread_id::is_live(owner)
                        && other
                            .owner
                            .compare_exchange(owner, my_id, Ordering::AcqRel, Ordering::Relaxed)
                            .is_ok()
                };
                if claimed {
                    for hp in other.hazards.iter() {
                        hp.store(ptr::null_mut(), Ordering::Release);
                    }
                    let mut orphaned = std::mem::take(unsafe { &mut *other.retired.get() });
                    helped += orphaned.len();
                    let mine = unsafe { &mut *rec.retired.get() };
                    mine.append(&mut orphaned);
                    other.owner.store(NULL_THREAD_ID, Ordering::Relaxed);
                    other.active.store(false, Ordering::Release);
                }
            }
            cur = next;
        }
        if helped > 0 {
            log::trace!(
                "hp: help_scan folded {} retired entries from abandoned records",
                helped
            );
            self.scan(rec);
        }
    }

    /// Returns the calling thread's cached attachment to `gc`, attaching
    /// once on first use and reusing the same record for every later
    /// call instead of paying a fresh `attach` (and, before detach, a
    /// fresh scan) on every operation. The attachment is released
    /// automatically when the thread exits, via [`ThreadHandle`]'s own
    /// `Drop`.
    pub fn thread_handle(gc: &Arc<HazardPointerGc>) -> &'static ThreadHandle<'static> {
        THREAD_HANDLES.with(|cache| {
            let mut cache = cache.borrow_mut();
            if let Some((handle, _)) = cache.iter().find(|(_, owner)| Arc::ptr_eq(owner, gc)) {
                let ptr: *const ThreadHandle<'static> = handle.as_ref();
                return unsafe { &*ptr };
            }
            let owner = Arc::clone(gc);
            // SAFETY: `handle` borrows `*owner`. `owner` is kept alive in
            // this same cache slot for exactly as long as `handle` is
            // (both are dropped together, `handle` first, when this
            // thread's cache is torn down), and neither ever crosses a
            // thread boundary, so extending the borrow to `'static` here
            // does not outlive what it points at.
            let handle: ThreadHandle<'static> = unsafe { std::mem::transmute(owner.attach()) };
            cache.push((Box::new(handle), owner));
            let ptr: *const ThreadHandle<'static> = cache.last().unwrap().0.as_ref();
            unsafe { &*ptr }
        })
    }

    /// A snapshot of record/retired-list statistics for diagnostics.
    pub fn internal_state(&self) -> InternalState {
        let mut total = 0usize;
        let mut used = 0usize;
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let rec = unsafe { &*cur };
            total += 1;
            if rec.active.load(Ordering::Acquire) {
                used += 1;
            }
            cur = rec.next.load(Ordering::Acquire);
        }
        InternalState {
            hp_record_count: total,
            hp_record_used_count: used,
            hp_record_allocated_count: self.allocated.load(Ordering::Relaxed),
            hp_record_free_count: total - used,
            total_retired_count: self.retired_count.load(Ordering::Relaxed),
            scan_call_count: self.scan_calls.load(Ordering::Relaxed),
            help_scan_call_count: self.help_scan_calls.load(Ordering::Relaxed),
        }
    }
}

impl Drop for HazardPointerGc {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let rec = unsafe { Box::from_raw(cur) };
            let next = rec.next.load(Ordering::Relaxed);
            let retired = unsafe { &mut *rec.retired.get() };
            for r in retired.drain(..) {
                unsafe { (r.free_fn)(r.ptr) };
            }
            cur = next;
        }
    }
}

/// A thread's attachment to a [`HazardPointerGc`]. Dropping or calling
/// [`ThreadHandle::detach`] releases the underlying record for reuse.
pub struct ThreadHandle<'a> {
    gc: &'a HazardPointerGc,
    rec: *mut HpRec,
}

thread_local! {
    static THREAD_HANDLES: RefCell<Vec<(Box<ThreadHandle<'static>>, Arc<HazardPointerGc>)>> =
        RefCell::new(Vec::new());
}

impl<'a> ThreadHandle<'a> {
    fn rec(&self) -> &HpRec {
        unsafe { &*self.rec }
    }

    /// Reserves `slot` for this thread's use as a hazard pointer.
    ///
    /// Fails with [`SmrError::TooManyGuards`] if `slot` exceeds the
    /// number of hazard pointers this collector was configured with.
    pub fn acquire_guard(&self, slot: usize) -> Result<Guard<'a, '_>, SmrError> {
        if slot >= self.rec().hazards.len() {
            return Err(SmrError::TooManyGuards);
        }
        Ok(Guard { handle: self, slot })
    }

    /// Publishes `ptr` as hazardous in `slot`, with the release-then-fence
    /// sequencing required for other threads' `scan` to observe it before
    /// they free anything.
    pub fn set_guard<T>(&self, slot: usize, ptr: *mut T) {
        self.rec().hazards[slot].store(ptr as *mut (), Ordering::Release);
        pr::fence_acquire();
    }

    /// Clears hazard slot `slot`.
    pub fn release_guard(&self, slot: usize) {
        self.rec().hazards[slot].store(ptr::null_mut(), Ordering::Release);
    }

    /// Reads `source`, publishes the observed pointer into `slot`, then
    /// rereads `source`: if it changed, the first read may have been
    /// stale relative to a concurrent retire, so the publish is retried.
    /// Returns only once a value has been safely published.
    pub fn protect_link<T>(&self, slot: usize, source: &AtomicPtr<T>) -> *mut T {
        loop {
            let p = source.load(Ordering::Acquire);
            self.set_guard(slot, p);
            if source.load(Ordering::Acquire) == p {
                return p;
            }
        }
    }

    /// Schedules `ptr` for reclamation once no hazard slot anywhere names
    /// it. May trigger a `scan` (and an opportunistic `help_scan`) if this
    /// thread's retire list has grown past its configured bound.
    ///
    /// # Safety
    ///
    /// `ptr` must have been obtained from `Box::into_raw::<T>` and must
    /// not be accessed by the caller again after this call returns.
    pub unsafe fn retire<T>(&self, ptr: *mut T) {
        let rec = self.rec();
        let threshold = self.gc.config.max_retired_per_thread;
        let len = {
            let retired = &mut *rec.retired.get();
            retired.push(Retired {
                ptr: ptr as *mut (),
                free_fn: |p| drop(Box::from_raw(p as *mut T)),
            });
            retired.len()
        };
        self.gc.retired_count.fetch_add(1, Ordering::Relaxed);
        if len >= threshold {
            self.gc.scan(rec);
            self.gc.help_scan(rec);
        }
    }

    /// Forces a scan of this thread's retire list.
    pub fn scan(&self) {
        self.gc.scan(self.rec());
    }

    /// Detaches the thread: clears its hazard slots, leaves its retired
    /// entries in place, and marks the record free for reuse. Retired
    /// memory left behind this way is folded into a live thread's list by
    /// a later [`HazardPointerGc::help_scan`], not scanned here.
    pub fn detach(self) {}
}

impl Drop for ThreadHandle<'_> {
    fn drop(&mut self) {
        let rec = self.rec();
        for hp in rec.hazards.iter() {
            hp.store(ptr::null_mut(), Ordering::Release);
        }
        rec.owner.store(NULL_THREAD_ID, Ordering::Release);
        rec.active.store(false, Ordering::Release);
    }
}

/// An acquired hazard slot. Automatically cleared on drop.
pub struct Guard<'gc, 'h> {
    handle: &'h ThreadHandle<'gc>,
    slot: usize,
}

impl<'gc, 'h> Guard<'gc, 'h> {
    /// Publishes `ptr` as hazardous in this guard's slot.
    pub fn protect<T>(&self, ptr: *mut T) {
        self.handle.set_guard(self.slot, ptr);
    }

    /// See [`ThreadHandle::protect_link`].
    pub fn protect_link<T>(&self, source: &AtomicPtr<T>) -> *mut T {
        self.handle.protect_link(self.slot, source)
    }
}

impl Drop for Guard<'_, '_> {
    fn drop(&mut self) {
        self.handle.release_guard(self.slot);
    }
}

static GC_CELL: OnceLock<HazardPointerGc> = OnceLock::new();
static GC_TORN_DOWN: AtomicBool = AtomicBool::new(false);

/// Constructs the process-wide hazard-pointer singleton. The first call
/// wins; later calls only clear the torn-down flag set by [`destruct`]
/// (the config from the first `construct` stands).
pub fn construct(config: HpConfig) {
    let _ = GC_CELL.set(HazardPointerGc::new(config));
    GC_TORN_DOWN.store(false, Ordering::Release);
}

/// Marks the process-wide singleton unusable. [`global`] returns
/// [`SmrError::GCNotConstructed`] until [`construct`] runs again.
pub fn destruct() {
    GC_TORN_DOWN.store(true, Ordering::Release);
}

/// Borrows the process-wide singleton.
///
/// Fails with [`SmrError::GCNotConstructed`] if [`construct`] was never
/// called, or if [`destruct`] has run since.
pub fn global() -> Result<&'static HazardPointerGc, SmrError> {
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
        let gc = HazardPointerGc::new(HpConfig::default());
        let handle = gc.attach();
        let state = gc.internal_state();
        assert_eq!(state.hp_record_used_count, 1);
        handle.detach();
        let state = gc.internal_state();
        assert_eq!(state.hp_record_used_count, 0);
        assert_eq!(state.hp_record_count, 1, "record is reused, not freed");
    }

    #[test]
    fn acquire_guard_beyond_capacity_errors() {
        let gc = HazardPointerGc::new(HpConfig {
            hazard_pointers_per_thread: 2,
            ..HpConfig::default()
        });
        let handle = gc.attach();
        assert!(handle.acquire_guard(0).is_ok());
        assert_eq!(handle.acquire_guard(5).unwrap_err(), SmrError::TooManyGuards);
    }

    #[test]
    fn retire_without_protection_is_eventually_reclaimed() {
        static DROPPED: StdAtomicUsize = StdAtomicUsize::new(0);
        let gc = HazardPointerGc::new(HpConfig {
            max_retired_per_thread: 4,
            ..HpConfig::default()
        });
        let handle = gc.attach();
        for _ in 0..4 {
            let boxed = Box::into_raw(Box::new(DropCounter(&DROPPED)));
            unsafe { handle.retire(boxed) };
        }
        assert_eq!(DROPPED.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn protected_pointer_survives_a_scan() {
        static DROPPED: StdAtomicUsize = StdAtomicUsize::new(0);
        let gc = HazardPointerGc::new(HpConfig::default());
        let handle = gc.attach();

        let boxed = Box::into_raw(Box::new(DropCounter(&DROPPED)));
        let cell = AtomicPtr::new(boxed);
        let guard = handle.acquire_guard(0).unwrap();
        let observed = guard.protect_link(&cell);
        assert_eq!(observed, boxed);

        unsafe { handle.retire(boxed) };
        handle.scan();
        assert_eq!(DROPPED.load(Ordering::SeqCst), 0, "still hazardous, must not be freed");

        drop(guard);
        handle.scan();
        assert_eq!(DROPPED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn help_scan_reclaims_memory_abandoned_by_another_thread() {
        static DROPPED: StdAtomicUsize = StdAtomicUsize::new(0);
        let gc = HazardPointerGc::new(HpConfig::default());

        let abandoned = gc.attach();
        let boxed = Box::into_raw(Box::new(DropCounter(&DROPPED)));
        unsafe { abandoned.retire(boxed) };
        // Simulate a thread that died without detaching: its record is
        // still marked active with retired memory pending.
        std::mem::forget(abandoned);

        // Force the record back to "abandoned" so help_scan can claim it,
        // mirroring what a liveness monitor would otherwise do.
        let rec_ptr = gc.head.load(Ordering::Acquire);
        unsafe { (*rec_ptr).active.store(false, Ordering::Release) };

        let helper = gc.attach();
        gc.help_scan(helper.rec());
        assert_eq!(DROPPED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn help_scan_reclaims_memory_from_a_thread_that_died_without_detaching() {
        static DROPPED: StdAtomicUsize = StdAtomicUsize::new(0);
        let gc = HazardPointerGc::new(HpConfig::default());

        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let handle = gc.attach();
                    let boxed = Box::into_raw(Box::new(DropCounter(&DROPPED)));
                    unsafe { handle.retire(boxed) };
                    // Die without detaching: forget the handle so its
                    // `Drop` never runs, simulating a panic mid-operation.
                    // The thread still genuinely exits at the end of this
                    // closure, so its id is deregistered from the
                    // liveness set for real.
                    std::mem::forget(handle);
                })
                .join()
                .unwrap();
        });

        let helper = gc.attach();
        gc.help_scan(helper.rec());
        assert_eq!(DROPPED.load(Ordering::SeqCst), 1);
    }

    static GLOBAL_TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn global_is_unusable_before_construct_or_after_destruct() {
        let _guard = GLOBAL_TEST_LOCK.lock().unwrap();
        destruct();
        assert_eq!(global().unwrap_err(), SmrError::GCNotConstructed);
        construct(HpConfig::default());
        assert!(global().is_ok());
        destruct();
        assert_eq!(global().unwrap_err(), SmrError::GCNotConstructed);
        construct(HpConfig::default());
    }
}

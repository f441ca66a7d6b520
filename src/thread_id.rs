//! Numeric per-thread identity for SMR record ownership.
//!
//! The hazard-pointer and pass-the-buck schemes need a cheap, comparable,
//! "is this thread still alive" style identity to decide whether an
//! abandoned record can be reclaimed by [`crate::hp::HazardPointerGc::help_scan`].
//! Rust has no portable way to ask an OS "is this thread still running" from
//! another thread, so records are owned by a small non-zero integer assigned
//! the first time a thread touches the registry; 0 is reserved as the "no
//! owner" sentinel, mirroring libcds's `cds::OS::nullThreadId()`. Liveness
//! itself is tracked the same way: a thread registers its id in a shared set
//! on first use and a thread-local destructor removes it when the thread
//! exits, giving [`is_live`] a real (not heuristic, not time-based) answer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn live_set() -> &'static Mutex<HashSet<u64>> {
    static LIVE: OnceLock<Mutex<HashSet<u64>>> = OnceLock::new();
    LIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Deregisters an id from the liveness set when the owning thread's
/// thread-local storage is torn down, i.e. when the thread actually exits.
struct LiveGuard(u64);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        live_set().lock().unwrap().remove(&self.0);
    }
}

thread_local! {
    static THIS_THREAD_ID: LiveGuard = {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        live_set().lock().unwrap().insert(id);
        LiveGuard(id)
    };
}

/// Sentinel meaning "no owner" — never assigned to a real thread.
pub const NULL_THREAD_ID: u64 = 0;

/// Returns the calling thread's numeric id, assigning one (and
/// registering it as live) on first use.
#[inline]
pub fn current() -> u64 {
    THIS_THREAD_ID.with(|guard| guard.0)
}

/// Returns whether `id` names a thread that is still running.
///
/// `id` must be a value previously returned by [`current`] (or
/// [`NULL_THREAD_ID`], which is always reported dead). Ids are never
/// reused, so once a thread exits and is deregistered this stays `false`
/// forever for that id.
pub fn is_live(id: u64) -> bool {
    id != NULL_THREAD_ID && live_set().lock().unwrap().contains(&id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn ids_are_stable_within_a_thread() {
        assert_eq!(current(), current());
    }

    #[test]
    fn ids_are_never_the_null_sentinel() {
        assert_ne!(current(), NULL_THREAD_ID);
    }

    #[test]
    fn distinct_threads_get_distinct_ids() {
        let ids: Vec<u64> = (0..8)
            .map(|_| thread::spawn(current).join().unwrap())
            .collect();
        let unique: HashSet<u64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn current_thread_is_reported_live() {
        assert!(is_live(current()));
    }

    #[test]
    fn null_id_is_never_live() {
        assert!(!is_live(NULL_THREAD_ID));
    }

    #[test]
    fn a_joined_threads_id_is_no_longer_live() {
        let id = thread::spawn(current).join().unwrap();
        assert!(!is_live(id));
    }
}

//! Backoff strategies for contention management.
//!
//! Container retry loops take a [`Backoff`] and call [`Backoff::spin`] on
//! every failed CAS attempt. A fresh instance is constructed at each retry
//! loop entry, so `Backoff` is cheap, `Copy`, and carries no heap state.
//!
//! # Example
//!
//! ```
//! use lockfree_smr::backoff::Backoff;
//!
//! let mut backoff = Backoff::exponential();
//! loop {
//!     if try_acquire_lock() {
//!         break;
//!     }
//!     backoff.spin();
//! }
//! # fn try_acquire_lock() -> bool { true }
//! ```

use crate::pr;

/// Default initial backoff ceiling for the exponential strategy.
const DEFAULT_CEILING: u32 = 128;

/// Maximum backoff ceiling.
const MAX_CEILING: u32 = 65536;

/// Fixed small spin bound used by [`Backoff::lock_default`] before yielding.
const LOCK_DEFAULT_SPINS: u32 = 64;

/// A family of callables invoked on a contended CAS retry.
///
/// - [`Backoff::empty`]: no-op, for algorithms that rely entirely on
///   hardware contention management.
/// - [`Backoff::yield_now`]: cedes the calling thread to the scheduler.
/// - [`Backoff::exponential`]: doubles a local spin bound up to a cap.
/// - [`Backoff::lock_default`]: spins a small bounded number of times then
///   falls back to yielding — the composite used by the spin-lock.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// Does nothing on `spin()`.
    Empty,
    /// Calls `std::thread::yield_now()` on every `spin()`.
    Yield,
    /// Doubles an internal spin count, up to `ceiling`, then holds steady.
    Exponential { current: u32, ceiling: u32 },
    /// Spins up to `LOCK_DEFAULT_SPINS` times, then yields thereafter.
    LockDefault { spins: u32 },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential()
    }
}

impl Backoff {
    /// A backoff that performs no work at all.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self::Empty
    }

    /// A backoff that only yields the thread to the scheduler.
    #[inline]
    #[must_use]
    pub const fn yield_now() -> Self {
        Self::Yield
    }

    /// An exponential backoff with the default ceiling (128 spins).
    #[inline]
    #[must_use]
    pub const fn exponential() -> Self {
        Self::Exponential {
            current: 1,
            ceiling: DEFAULT_CEILING,
        }
    }

    /// An exponential backoff with a custom ceiling.
    #[inline]
    #[must_use]
    pub const fn exponential_with_ceiling(ceiling: u32) -> Self {
        Self::Exponential {
            current: 1,
            ceiling: if ceiling > MAX_CEILING { MAX_CEILING } else { ceiling },
        }
    }

    /// The spin-then-yield composite appropriate for spin-locks.
    #[inline]
    #[must_use]
    pub const fn lock_default() -> Self {
        Self::LockDefault { spins: 0 }
    }

    /// Resets exponential/lock-default progression back to its start.
    #[inline]
    pub fn reset(&mut self) {
        match self {
            Backoff::Exponential { current, .. } => *current = 1,
            Backoff::LockDefault { spins } => *spins = 0,
            Backoff::Empty | Backoff::Yield => {}
        }
    }

    /// Performs one backoff step, advancing any internal progression.
    #[inline]
    pub fn spin(&mut self) {
        match self {
            Backoff::Empty => {}
            Backoff::Yield => std::thread::yield_now(),
            Backoff::Exponential { current, ceiling } => {
                for _ in 0..*current {
                    pr::stall();
                }
                if *current < *ceiling {
                    *current = current.saturating_mul(2);
                }
            }
            Backoff::LockDefault { spins } => {
                if *spins < LOCK_DEFAULT_SPINS {
                    *spins += 1;
                    pr::stall();
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_does_nothing_observable() {
        let mut b = Backoff::empty();
        b.spin();
        b.spin();
    }

    #[test]
    fn exponential_doubles_up_to_ceiling() {
        let mut b = Backoff::exponential_with_ceiling(4);
        for expected in [2, 4, 4, 4] {
            b.spin();
            match b {
                Backoff::Exponential { current, .. } => assert_eq!(current, expected),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn exponential_reset_returns_to_one() {
        let mut b = Backoff::exponential();
        b.spin();
        b.spin();
        b.reset();
        match b {
            Backoff::Exponential { current, .. } => assert_eq!(current, 1),
            _ => unreachable!(),
        }
    }

    #[test]
    fn lock_default_eventually_yields() {
        let mut b = Backoff::lock_default();
        for _ in 0..=LOCK_DEFAULT_SPINS {
            b.spin();
        }
        match b {
            Backoff::LockDefault { spins } => assert_eq!(spins, LOCK_DEFAULT_SPINS),
            _ => unreachable!(),
        }
    }

    #[test]
    fn yield_variant_does_not_panic() {
        let mut b = Backoff::yield_now();
        b.spin();
    }
}

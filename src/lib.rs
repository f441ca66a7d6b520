//! # lockfree-smr
//!
//! Safe memory reclamation schemes and the lock-free containers built on
//! top of them.
//!
//! ## Module organization
//!
//! ### Foundation
//! - [`error`] - the crate-wide fatal error type
//! - [`thread_id`] - numeric per-thread identity used by both SMR schemes
//!
//! ### Core primitives
//! - [`pr`] - atomic primitives, memory barriers, counters, tagged pointers
//! - [`mod@backoff`] - contention-management strategies for retry loops
//! - [`spinlock`] - test-and-test-and-set spin-lock
//! - [`stack`] - lock-free Treiber stack, a general-purpose building block
//!
//! ### Memory reclamation
//! - [`hp`] - hazard-pointer safe memory reclamation
//! - [`ptb`] - pass-the-buck safe memory reclamation
//! - [`freelist`] - IBM-style tagged free-list recirculation (`tagged-128` only)
//!
//! ### Containers
//! - [`queue`] - lock-free FIFO queues (Michael–Scott/Moir, tagged, LMS, Tsigas–Zhang)
//! - [`list`] - lock-free ordered lists (Michael, Lazy)

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_inception)]

// =============================================================================
// Tier 0: Foundation (No Internal Dependencies)
// =============================================================================

/// Crate-wide error type for SMR precondition violations.
pub mod error;

/// Numeric per-thread identity for SMR record ownership.
pub mod thread_id;

// =============================================================================
// Tier 1: Core Primitives (Depends on Tier 0)
// =============================================================================

/// Atomic primitives, memory barriers, counters, and tagged pointers.
pub mod pr;

// =============================================================================
// Tier 2: Basic Building Blocks (Depends on Tiers 0-1)
// =============================================================================

/// Contention-management strategies for retry loops.
pub mod backoff;

/// Test-and-test-and-set spin-lock.
pub mod spinlock;

/// Lock-free Treiber stack, a general-purpose LIFO building block.
pub mod stack;

// =============================================================================
// Tier 3: Safe Memory Reclamation (Depends on Tiers 0-2)
// =============================================================================

/// Hazard-pointer safe memory reclamation.
pub mod hp;

/// Pass-the-buck safe memory reclamation.
pub mod ptb;

/// IBM-style tagged free-list recirculation.
#[cfg(feature = "tagged-128")]
pub mod freelist;

// =============================================================================
// Tier 4: Containers (Depends on Tiers 0-3)
// =============================================================================

/// Lock-free FIFO queues.
pub mod queue;

/// Lock-free ordered lists.
pub mod list;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use error::SmrError;

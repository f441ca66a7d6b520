//! Lock-free ordered sets.
//!
//! Both lists are sorted singly-linked sets keyed by `K: Ord`; they differ
//! only in how they reconcile logical deletion with concurrent traversal:
//!
//! - [`michael`] marks a node deleted by setting the low bit of its own
//!   `next` pointer and lets any thread that stumbles on a marked node
//!   help finish the physical unlink. Protected by hazard-pointer SMR.
//! - [`lazy`] marks a node deleted with a side boolean and takes a
//!   per-node [`crate::spinlock::SpinLock`] before mutating, trading a
//!   short, bounded lock for a simpler proof of correctness. Protected by
//!   pass-the-buck SMR, to exercise the crate's other reclamation scheme.

pub mod lazy;
pub mod michael;

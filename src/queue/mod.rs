//! Lock-free FIFO queues.
//!
//! - [`ms`] - the Michael–Scott queue with Moir's tail-helping discipline,
//!   protected by hazard-pointer SMR.
//! - [`moir`] - a drop-in variant of [`ms`] that tolerates extra slack
//!   between head and tail, skipping a helping CAS on the last dequeue.
//! - [`tagged`] - the same linked-list algorithm closed against ABA with a
//!   128-bit tagged pointer and free-list recirculation instead of SMR
//!   (`tagged-128` feature only).
//! - [`lms`] - the Ladan-Mozes–Shavit optimistic doubly-linked queue.
//! - [`tz`] - the Tsigas–Zhang bounded cyclic-array queue.

pub mod lms;
pub mod moir;
pub mod ms;
#[cfg(feature = "tagged-128")]
pub mod tagged;
pub mod tz;

//! Crate-wide error type for SMR precondition violations.
//!
//! Every recoverable condition in this crate (a full bounded queue, a
//! missing key) is a plain `bool`/`Option` return, never an `Err`. The only
//! failures that surface through [`SmrError`] are the ones the design
//! classifies as fatal to the calling thread: calling into an SMR that was
//! never constructed, or asking for more hazard slots than a thread was
//! configured with.

use std::fmt;

/// Fatal precondition violations raised by the SMR schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmrError {
    /// The calling thread has exhausted its quota of hazard/guard slots.
    TooManyGuards,
    /// A container operation ran before the relevant SMR singleton was
    /// constructed (or after it was torn down).
    GCNotConstructed,
}

impl fmt::Display for SmrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmrError::TooManyGuards => {
                write!(f, "thread exceeded its hazard/guard slot quota")
            }
            SmrError::GCNotConstructed => {
                write!(f, "SMR singleton used before construction or after teardown")
            }
        }
    }
}

impl std::error::Error for SmrError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        assert!(SmrError::TooManyGuards.to_string().contains("quota"));
        assert!(SmrError::GCNotConstructed.to_string().contains("construction"));
    }
}

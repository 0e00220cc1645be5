//! Error types
//!
//! POSIX-style error codes returned by every fallible kernel operation.
//! Success is `Ok(())`, distinct from every error value.

/// Kernel error code; discriminants follow `<errno.h>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(i32)]
pub enum Error {
    /// Called from an ISR where forbidden, or unlock by a non-owner (EPERM).
    NotPermitted = 1,
    /// A parked thread was woken at external request (EINTR).
    Interrupted = 4,
    /// A `try_*` call found the resource busy or empty (EAGAIN).
    Again = 11,
    /// Storage could not be acquired (ENOMEM).
    NoMemory = 12,
    /// `try_lock` found the mutex held (EBUSY).
    Busy = 16,
    /// Bad argument, mask out of range or ceiling violation (EINVAL).
    Invalid = 22,
    /// Errorcheck self-relock, or a detected deadlock (EDEADLK).
    Deadlock = 35,
    /// Corruption detected in a received message (EBADMSG).
    BadMsg = 74,
    /// Semaphore post past its maximum count (EOVERFLOW).
    Overflow = 75,
    /// Message length mismatch (EMSGSIZE).
    MsgSize = 90,
    /// The deadline elapsed before the operation completed (ETIMEDOUT).
    TimedOut = 110,
    /// A robust mutex was inherited from a dead owner (EOWNERDEAD).
    OwnerDead = 130,
    /// The primitive is permanently unusable (ENOTRECOVERABLE).
    NotRecoverable = 131,
}

/// Result type alias for kernel operations.
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// The raw errno-style value.
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_errno() {
        assert_eq!(Error::NotPermitted.code(), 1);
        assert_eq!(Error::Interrupted.code(), 4);
        assert_eq!(Error::Again.code(), 11);
        assert_eq!(Error::Busy.code(), 16);
        assert_eq!(Error::Invalid.code(), 22);
        assert_eq!(Error::Deadlock.code(), 35);
        assert_eq!(Error::TimedOut.code(), 110);
        assert_eq!(Error::OwnerDead.code(), 130);
        assert_eq!(Error::NotRecoverable.code(), 131);
    }

    #[test]
    fn distinct_from_success() {
        let ok: Result<()> = Ok(());
        assert_ne!(ok, Err(Error::TimedOut));
    }
}

//! Kernel error types.
//!
//! [`KernelError`] is returned by every fallible service call and never
//! disturbs kernel state. [`FatalError`] describes conditions the kernel
//! cannot recover from; they halt the kernel (see [`crate::Kernel::is_halted`]).

use thiserror::Error;

use crate::thread::ThreadId;

/// Recoverable errors reported by kernel services.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KernelError {
    /// The resource is not available and the caller asked not to wait.
    #[error("resource not available")]
    Resource,
    /// The wait timed out.
    #[error("wait timed out")]
    Timeout,
    /// An argument is out of range.
    #[error("invalid parameter")]
    Parameter,
    /// The handle does not refer to a live object.
    #[error("invalid or stale handle")]
    InvalidHandle,
    /// The service cannot be called from interrupt context.
    #[error("not allowed from interrupt context")]
    Isr,
    /// The kernel or the object is in a state that forbids the call.
    #[error("invalid state for this call")]
    InvalidState,
    /// The caller does not own the mutex.
    #[error("caller does not own the mutex")]
    NotOwner,
    /// The caller already owns the non-recursive mutex, or joins itself.
    #[error("call would deadlock")]
    Deadlock,
    /// A counter would exceed its maximum.
    #[error("counter overflow")]
    Overflow,
    /// The block was already free.
    #[error("block freed twice")]
    DoubleFree,
    /// The block does not belong to the pool.
    #[error("block does not belong to this pool")]
    InvalidBlock,
    /// Object or stack storage is exhausted.
    #[error("out of memory")]
    NoMemory,
    /// The object was deleted while the caller waited on it.
    #[error("object deleted")]
    Deleted,
}

impl KernelError {
    /// Returns `true` for errors caused by misuse of an object rather than by
    /// its momentary state.
    pub fn is_usage_violation(&self) -> bool {
        matches!(
            self,
            Self::NotOwner | Self::Deadlock | Self::Overflow | Self::DoubleFree | Self::InvalidBlock
        )
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Unrecoverable kernel faults.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FatalError {
    #[error("stack overflow detected in thread {0}")]
    StackOverflow(ThreadId),
    #[error("interrupt post-processing queue overflow")]
    IsrQueueOverflow,
    #[error("critical section nesting limit exceeded")]
    CriticalNesting,
    #[error("interrupt nesting out of balance")]
    InterruptNesting,
    #[error("kernel invariant broken: {0}")]
    Invariant(&'static str),
}

impl FatalError {
    /// Compact code used in trace records.
    pub fn code(&self) -> u8 {
        match self {
            Self::StackOverflow(_) => 1,
            Self::IsrQueueOverflow => 2,
            Self::CriticalNesting => 3,
            Self::InterruptNesting => 4,
            Self::Invariant(_) => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_violations_are_grouped() {
        assert!(KernelError::NotOwner.is_usage_violation());
        assert!(KernelError::DoubleFree.is_usage_violation());
        assert!(!KernelError::Timeout.is_usage_violation());
        assert!(!KernelError::Resource.is_usage_violation());
    }
}

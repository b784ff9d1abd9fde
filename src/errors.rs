use thiserror::Error;

/// Errors reported by [`MultiLock`](crate::MultiLock) operations.
///
/// Every variant indicates a caller bug; contention is never an error
/// (acquisition blocks instead).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum LockError {
    /// A mode was released by a thread that does not hold it.
    #[error("lock mode released by a thread that does not hold it")]
    NotHeld,
    /// A hold counter is saturated; each mode supports at most 65535
    /// reentrant holds.
    #[error("more than 65535 reentrant holds of one lock mode")]
    TooManyHolds,
    /// The invoked operation is outside this lock's supported surface.
    #[error("operation not supported by this lock")]
    Unsupported,
}

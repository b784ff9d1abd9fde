//! Reentrant multi-granularity locking
//!
//! A [`MultiLock`] can be held by many threads at once in different *modes*,
//! as long as the modes held by distinct threads are pairwise compatible:
//!
//! ```text
//!        | IS | IX | S  | SIX | X
//!   -----+----+----+----+-----+---
//!   IS   | ok | ok | ok | ok  |
//!   IX   | ok | ok |    |     |
//!   S    | ok |    | ok |     |
//!   SIX  | ok |    |    |     |
//!   X    |    |    |    |     |
//! ```
//!
//! IS/IX declare the *intent* to take S/X further down a lock tree; SIX is
//! not its own mode but the combination of S and IX held by one thread.
//! Every mode is reentrant per thread, and a thread's own holds never count
//! against it, so a lone S holder may still take X (an upgrade), an IX
//! holder may add S, and the X owner may take anything.
//!
//! Locks optionally nest: a lock constructed with a parent takes the
//! matching intention mode on the parent (recursively) before its own mode,
//! and releases in the reverse order.
//!
//! Contention never fails, it blocks: waiters park on a FIFO queue and are
//! woken as releases make them admissible. Admission is deliberately
//! non-strict; a new arrival compatible with the current holders gets in
//! ahead of parked waiters.

mod errors;
mod loom_testing;
mod multilock;
mod raw;

pub use errors::LockError;
pub use multilock::{Mode, MultiLock, ReadLock, WriteLock};

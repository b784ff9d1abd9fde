//! The lock facade: per-mode entry points, intention cascading, the
//! read/write views, and the monitoring accessors
//!
//! A [`MultiLock`] is a thin shell over the admission engine in
//! [`crate::raw`]. Its one real job is the tree discipline: when a lock has
//! a parent, every acquisition first takes the matching intention mode on
//! the parent (IS below a read-side mode, IX below a write-side mode),
//! recursively up to the root, and every release undoes the pair in the
//! opposite order. A child therefore never holds a mode without its whole
//! ancestor chain advertising the intent.

use std::sync::Arc;
use std::time::Duration;

use crate::errors::LockError;
use crate::raw::{
    is_count, ix_count, s_count, x_count, RawMultiLock, IS_UNIT, IX_UNIT, S_UNIT,
};

/// One of the five Gray lock modes
///
/// [`Mode::SharedIntentionExclusive`] is a composite: it is taken as
/// [`Mode::Shared`] plus [`Mode::IntentionExclusive`] by the same thread
/// and has no counter of its own.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Intent to take [`Mode::Shared`] on a descendant
    IntentionShared,
    /// Intent to take [`Mode::Exclusive`] (or SIX) on a descendant
    IntentionExclusive,
    /// Read lock
    Shared,
    /// Read lock here plus intent to write below
    SharedIntentionExclusive,
    /// Write lock
    Exclusive,
}

/// A reentrant multi-granularity lock
///
/// Many threads may hold the lock at once in compatible modes; one thread
/// may hold any combination of modes, including nominally incompatible
/// ones (that is how upgrades and SIX work). See the crate docs for the
/// compatibility matrix.
#[derive(Debug)]
pub struct MultiLock {
    raw: RawMultiLock,
    parent: Option<Arc<MultiLock>>,
}

impl Default for MultiLock {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiLock {
    /// A root lock with no parent
    pub fn new() -> Self {
        Self {
            raw: RawMultiLock::new(),
            parent: None,
        }
    }

    /// A lock nested under `parent`
    ///
    /// The parent link is immutable; build trees, not cycles. Acquisitions
    /// on this lock cascade the matching intention mode to `parent` and
    /// its ancestors.
    pub fn with_parent(parent: Arc<MultiLock>) -> Self {
        Self {
            raw: RawMultiLock::new(),
            parent: Some(parent),
        }
    }

    /// The parent this lock was nested under, if any
    pub fn parent(&self) -> Option<&Arc<MultiLock>> {
        self.parent.as_ref()
    }

    /// Acquire the S (read) mode, blocking while another thread's IX, SIX,
    /// or X excludes it
    pub fn lock_read(&self) -> Result<(), LockError> {
        if let Some(parent) = &self.parent {
            parent.lock_intention_read()?;
        }
        match self.raw.acquire_shared(S_UNIT) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(parent) = &self.parent {
                    // cannot fail; the cascade just took it
                    let _ = parent.unlock_intention_read();
                }
                Err(e)
            }
        }
    }

    /// Acquire the X (write) mode, blocking while any other thread holds
    /// anything
    pub fn lock_write(&self) -> Result<(), LockError> {
        if let Some(parent) = &self.parent {
            parent.lock_intention_write()?;
        }
        match self.raw.acquire_exclusive() {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(parent) = &self.parent {
                    // cannot fail; the cascade just took it
                    let _ = parent.unlock_intention_write();
                }
                Err(e)
            }
        }
    }

    /// Acquire the IS mode, blocking only while another thread holds X
    pub fn lock_intention_read(&self) -> Result<(), LockError> {
        if let Some(parent) = &self.parent {
            parent.lock_intention_read()?;
        }
        match self.raw.acquire_shared(IS_UNIT) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(parent) = &self.parent {
                    // cannot fail; the cascade just took it
                    let _ = parent.unlock_intention_read();
                }
                Err(e)
            }
        }
    }

    /// Acquire the IX mode, blocking while another thread's S, SIX, or X
    /// excludes it
    pub fn lock_intention_write(&self) -> Result<(), LockError> {
        if let Some(parent) = &self.parent {
            parent.lock_intention_write()?;
        }
        match self.raw.acquire_shared(IX_UNIT) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(parent) = &self.parent {
                    // cannot fail; the cascade just took it
                    let _ = parent.unlock_intention_write();
                }
                Err(e)
            }
        }
    }

    /// Release one S hold, then the parent intention it was nested under
    pub fn unlock_read(&self) -> Result<(), LockError> {
        self.raw.release_shared(S_UNIT)?;
        if let Some(parent) = &self.parent {
            parent.unlock_intention_read()?;
        }
        Ok(())
    }

    /// Release one X hold, then the parent intention it was nested under
    pub fn unlock_write(&self) -> Result<(), LockError> {
        self.raw.release_exclusive()?;
        if let Some(parent) = &self.parent {
            parent.unlock_intention_write()?;
        }
        Ok(())
    }

    /// Release one IS hold, then the parent's
    pub fn unlock_intention_read(&self) -> Result<(), LockError> {
        self.raw.release_shared(IS_UNIT)?;
        if let Some(parent) = &self.parent {
            parent.unlock_intention_read()?;
        }
        Ok(())
    }

    /// Release one IX hold, then the parent's
    pub fn unlock_intention_write(&self) -> Result<(), LockError> {
        self.raw.release_shared(IX_UNIT)?;
        if let Some(parent) = &self.parent {
            parent.unlock_intention_write()?;
        }
        Ok(())
    }

    /// Acquire an arbitrary mode
    ///
    /// SIX is taken as S then IX; if the IX half fails (its counter, or an
    /// ancestor's, is saturated) the S half is rolled back before the
    /// error surfaces.
    pub fn lock(&self, mode: Mode) -> Result<(), LockError> {
        match mode {
            Mode::IntentionShared => self.lock_intention_read(),
            Mode::IntentionExclusive => self.lock_intention_write(),
            Mode::Shared => self.lock_read(),
            Mode::Exclusive => self.lock_write(),
            Mode::SharedIntentionExclusive => {
                self.lock_read()?;
                match self.lock_intention_write() {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        // we hold the S we just took, so this cannot fail
                        let _ = self.unlock_read();
                        Err(e)
                    }
                }
            }
        }
    }

    /// Release an arbitrary mode (SIX in reverse order of [`Self::lock`])
    pub fn unlock(&self, mode: Mode) -> Result<(), LockError> {
        match mode {
            Mode::IntentionShared => self.unlock_intention_read(),
            Mode::IntentionExclusive => self.unlock_intention_write(),
            Mode::Shared => self.unlock_read(),
            Mode::Exclusive => self.unlock_write(),
            Mode::SharedIntentionExclusive => {
                self.unlock_intention_write()?;
                self.unlock_read()
            }
        }
    }

    /// View of this lock's S mode under a plain lock/unlock surface
    pub fn read_lock(&self) -> ReadLock<'_> {
        ReadLock { lock: self }
    }

    /// View of this lock's X mode under a plain lock/unlock surface
    pub fn write_lock(&self) -> WriteLock<'_> {
        WriteLock { lock: self }
    }

    // Monitoring accessors. The global counts read one field of the shared
    // word; the per-thread hold counts short-circuit to 0 when the global
    // count already is, skipping the thread-local lookup.

    /// Number of IS holds across all threads
    pub fn intention_read_lock_count(&self) -> u16 {
        is_count(self.raw.state_word()) as u16
    }

    /// Number of S holds across all threads
    pub fn read_lock_count(&self) -> u16 {
        s_count(self.raw.state_word()) as u16
    }

    /// Number of IX holds across all threads
    pub fn intention_write_lock_count(&self) -> u16 {
        ix_count(self.raw.state_word()) as u16
    }

    /// Number of X holds (all by the one owner thread)
    pub fn write_lock_count(&self) -> u16 {
        x_count(self.raw.state_word()) as u16
    }

    /// The calling thread's reentrant IS holds
    pub fn intention_read_hold_count(&self) -> u16 {
        if self.intention_read_lock_count() == 0 {
            return 0;
        }
        is_count(self.raw.hold_word()) as u16
    }

    /// The calling thread's reentrant S holds
    pub fn read_hold_count(&self) -> u16 {
        if self.read_lock_count() == 0 {
            return 0;
        }
        s_count(self.raw.hold_word()) as u16
    }

    /// The calling thread's reentrant IX holds
    pub fn intention_write_hold_count(&self) -> u16 {
        if self.intention_write_lock_count() == 0 {
            return 0;
        }
        ix_count(self.raw.hold_word()) as u16
    }

    /// The calling thread's reentrant X holds
    pub fn write_hold_count(&self) -> u16 {
        if self.write_lock_count() == 0 {
            return 0;
        }
        x_count(self.raw.hold_word()) as u16
    }
}

/// S mode of a [`MultiLock`] as a plain read lock
///
/// Only `lock`/`unlock` are supported; the try and timed variants exist
/// for interface parity and always report [`LockError::Unsupported`].
#[derive(Clone, Copy, Debug)]
pub struct ReadLock<'a> {
    lock: &'a MultiLock,
}

impl ReadLock<'_> {
    pub fn lock(&self) -> Result<(), LockError> {
        self.lock.lock_read()
    }

    pub fn unlock(&self) -> Result<(), LockError> {
        self.lock.unlock_read()
    }

    pub fn try_lock(&self) -> Result<bool, LockError> {
        Err(LockError::Unsupported)
    }

    pub fn try_lock_for(&self, _timeout: Duration) -> Result<bool, LockError> {
        Err(LockError::Unsupported)
    }
}

/// X mode of a [`MultiLock`] as a plain write lock
#[derive(Clone, Copy, Debug)]
pub struct WriteLock<'a> {
    lock: &'a MultiLock,
}

impl WriteLock<'_> {
    pub fn lock(&self) -> Result<(), LockError> {
        self.lock.lock_write()
    }

    pub fn unlock(&self) -> Result<(), LockError> {
        self.lock.unlock_write()
    }

    pub fn try_lock(&self) -> Result<bool, LockError> {
        Err(LockError::Unsupported)
    }

    pub fn try_lock_for(&self, _timeout: Duration) -> Result<bool, LockError> {
        Err(LockError::Unsupported)
    }
}

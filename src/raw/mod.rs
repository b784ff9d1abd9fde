//! Core admission engine for the multi-granularity lock
//!
//! All shared lock state lives in one AtomicU64, bit packed as follows:
//! - `bits[15:0]` = IS holds
//! - `bits[31:16]` = IX holds
//! - `bits[47:32]` = S holds
//! - `bits[63:48]` = X holds
//!
//! Packing the four counters into a single word is what makes the scheme
//! work: one compare-and-swap validates an admission decision against a
//! consistent snapshot of every mode at once. SIX never gets a counter of
//! its own; an SIX holder is simply a thread that has incremented both S
//! and IX.
//!
//! Each thread additionally keeps a private word with the exact same field
//! layout, recording that thread's own contribution to each counter.
//! `state - hold` therefore yields what *other* threads hold, and every
//! "would this block?" question is asked of that difference. This is what
//! makes reentry, SIX, and upgrades work: a thread's own holds can never
//! block it.
//!
//! Blocked acquirers park on a FIFO queue keyed by the address of the
//! [`RawMultiLock`]; the queue itself is parking_lot_core's. Admission is
//! non-strict: a compatible new arrival never consults the queue, so a
//! stream of shared acquirers can starve a parked X waiter. That trade is
//! intentional.

use std::cell::RefCell;
use std::fmt::Debug;
use std::sync::atomic::Ordering;

use parking_lot_core::{FilterOp, ParkToken, DEFAULT_UNPARK_TOKEN};
use rustc_hash::FxHashMap;
use tracing::Level;

use crate::errors::LockError;
use crate::loom_testing::*;

// individual field masks
pub(crate) const X_FIELD: u64 = 0xFFFF_0000_0000_0000;
pub(crate) const S_FIELD: u64 = 0x0000_FFFF_0000_0000;
pub(crate) const IX_FIELD: u64 = 0x0000_0000_FFFF_0000;
pub(crate) const IS_FIELD: u64 = 0x0000_0000_0000_FFFF;
pub(crate) const NON_X_FIELDS: u64 = !X_FIELD;

// increments for one hold of each mode
pub(crate) const X_UNIT: u64 = 0x0001_0000_0000_0000;
pub(crate) const S_UNIT: u64 = 0x0000_0001_0000_0000;
pub(crate) const IX_UNIT: u64 = 0x0000_0000_0001_0000;
pub(crate) const IS_UNIT: u64 = 0x0000_0000_0000_0001;

/// Extract the X hold count
pub(crate) const fn x_count(c: u64) -> u64 {
    (c & X_FIELD) >> 48
}
/// Extract the S hold count
pub(crate) const fn s_count(c: u64) -> u64 {
    (c & S_FIELD) >> 32
}
/// Extract the IX hold count
pub(crate) const fn ix_count(c: u64) -> u64 {
    (c & IX_FIELD) >> 16
}
/// Extract the IS hold count
pub(crate) const fn is_count(c: u64) -> u64 {
    c & IS_FIELD
}
/// The full 16-bit mask of the field a unit increments
pub(crate) const fn field_mask(unit: u64) -> u64 {
    unit * 0xFFFF
}

// Park tokens tag each waiter with what it was trying to add, so a wake
// can be passed down the queue exactly as far as compatibility reaches.
const TOKEN_IS: ParkToken = ParkToken(1);
const TOKEN_IX: ParkToken = ParkToken(2);
const TOKEN_S: ParkToken = ParkToken(3);
const TOKEN_X: ParkToken = ParkToken(4);

const fn park_token_for(unit: u64) -> ParkToken {
    if unit == IS_UNIT {
        TOKEN_IS
    } else if unit == IX_UNIT {
        TOKEN_IX
    } else {
        TOKEN_S
    }
}

/// Crate-assigned thread ids: dense, never reused within a run, and
/// never 0 (0 means "no thread" in the exclusive owner slot). Plain std
/// atomics on purpose; these are id generators, not modeled lock state.
static NEXT_THREAD_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
/// Same, for lock ids (the key of the per-thread hold counter maps).
static NEXT_LOCK_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}
thread_local! {
    /// lock id -> this thread's hold counter for that lock
    static HOLD_COUNTERS: RefCell<FxHashMap<u64, &'static HoldCounter>> =
        RefCell::new(FxHashMap::default());
}

fn current_thread_id() -> u64 {
    THREAD_ID.with(|t| *t)
}

/// Per-thread mirror of the shared state word
///
/// `state` has the same field layout as [`RawMultiLock::state`] and always
/// equals the owning thread's contribution to each field. Only the owning
/// thread writes it, so Relaxed is enough; other threads only ever look at
/// `tid` (immutable after construction) to reject a stale cache hit.
///
/// Counters are created lazily on a thread's first acquisition and leaked:
/// they are sparse, never collected mid-run, and the leak is what keeps the
/// racy [`RawMultiLock::cached_hold`] pointer valid forever.
#[derive(Debug)]
pub(crate) struct HoldCounter {
    tid: u64,
    state: AtomicU64,
}

/// Outcome of one lock-free admission attempt
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Admission {
    /// In. `wake_next` is set when a caller that was parked should pass the
    /// wakeup on down the queue after admitting.
    Admitted { wake_next: bool },
    /// Not compatible with what other threads hold; park and retry.
    Blocked,
}

/// The synchronizer: admission, blocking, and wakeup for one lock
///
/// All four lock modes of one [`MultiLock`](crate::MultiLock) funnel into
/// this struct. IS/IX/S go through the shared-admission paths (many
/// concurrent holders, pairwise mode checks); X goes through exclusive
/// admission (one distinguished owner thread, reentrantly).
pub(crate) struct RawMultiLock {
    /// The packed IS/IX/S/X hold counts
    state: AtomicU64,
    /// Thread id of the X owner, 0 when X is not held.
    ///
    /// Only trusted after observing a nonzero X count in `state`: the slot
    /// is written after the CAS that raises X from zero and cleared before
    /// the CAS that returns it to zero.
    excl_owner: AtomicU64,
    /// Hold counter of the last thread to touch this lock (racy fast path;
    /// a hit still has to pass the tid check)
    cached_hold: AtomicPtr<HoldCounter>,
    /// Key into the per-thread hold counter maps
    id: u64,
}

impl Debug for RawMultiLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = self.state.load(Ordering::Relaxed);
        f.debug_struct("RawMultiLock")
            .field("id", &self.id)
            .field("is", &is_count(c))
            .field("ix", &ix_count(c))
            .field("s", &s_count(c))
            .field("x", &x_count(c))
            .field("excl_owner", &self.excl_owner.load(Ordering::Relaxed))
            .finish()
    }
}

impl RawMultiLock {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            excl_owner: AtomicU64::new(0),
            cached_hold: AtomicPtr::new(std::ptr::null_mut()),
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// This thread's hold counter for this lock, creating it on first use
    fn hold_counter(&self) -> &'static HoldCounter {
        let tid = current_thread_id();
        let cached = self.cached_hold.load(Ordering::Relaxed);
        if !cached.is_null() {
            // safety: hold counters are leaked, so any pointer that was
            // ever stored here is still valid
            let h = unsafe { &*cached };
            if h.tid == tid {
                return h;
            }
        }
        let h = HOLD_COUNTERS.with(|m| {
            *m.borrow_mut().entry(self.id).or_insert_with(|| {
                Box::leak(Box::new(HoldCounter {
                    tid,
                    state: AtomicU64::new(0),
                }))
            })
        });
        self.cached_hold
            .store(h as *const HoldCounter as *mut HoldCounter, Ordering::Relaxed);
        h
    }

    /// Current packed state word
    pub(crate) fn state_word(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }

    /// Current thread's packed hold word
    pub(crate) fn hold_word(&self) -> u64 {
        self.hold_counter().state.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn owner_tid(&self) -> u64 {
        self.excl_owner.load(Ordering::Relaxed)
    }

    /// One admission attempt for IS, IX, or S. Never parks; retries
    /// internally on CAS contention only.
    pub(crate) fn try_acquire_shared(&self, unit: u64) -> Result<Admission, LockError> {
        debug_assert!(unit == IS_UNIT || unit == IX_UNIT || unit == S_UNIT);
        let hold = self.hold_counter();
        loop {
            let c = self.state.load(Ordering::Relaxed);
            let wake_next;
            if x_count(c) != 0 {
                if self.excl_owner.load(Ordering::Relaxed) != hold.tid {
                    return Ok(Admission::Blocked);
                }
                // the X owner may nest any weaker mode under its X, and
                // nothing else can be admissible until it lets go
                wake_next = false;
            } else if unit == IS_UNIT {
                // IS is compatible with everything except another
                // thread's X, which was ruled out above
                wake_next = true;
            } else {
                // IX and S exclude each other *across* threads only; the
                // caller's own holds must not count (SIX, upgrades)
                let rival_field = if unit == IX_UNIT { S_FIELD } else { IX_FIELD };
                let others = c - hold.state.load(Ordering::Relaxed);
                if others & rival_field != 0 {
                    return Ok(Admission::Blocked);
                }
                wake_next = true;
            }
            if c & field_mask(unit) == field_mask(unit) {
                return Err(LockError::TooManyHolds);
            }
            match self
                .state
                .compare_exchange_weak(c, c + unit, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => {
                    hold.state.fetch_add(unit, Ordering::Relaxed);
                    self.touch_cache(hold);
                    return Ok(Admission::Admitted { wake_next });
                }
                Err(_) => spin_hint(),
            }
        }
    }

    /// One admission attempt for X. Never parks.
    pub(crate) fn try_acquire_exclusive(&self) -> Result<Admission, LockError> {
        let hold = self.hold_counter();
        loop {
            let c = self.state.load(Ordering::Relaxed);
            if c != 0 {
                if x_count(c) == 0 {
                    // no X holder yet; this is an upgrade, admissible only
                    // if every hold on the lock is our own
                    let others = c - hold.state.load(Ordering::Relaxed);
                    if others & NON_X_FIELDS != 0 {
                        return Ok(Admission::Blocked);
                    }
                } else if self.excl_owner.load(Ordering::Relaxed) != hold.tid {
                    return Ok(Admission::Blocked);
                }
            }
            if c & X_FIELD == X_FIELD {
                return Err(LockError::TooManyHolds);
            }
            match self
                .state
                .compare_exchange_weak(c, c + X_UNIT, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => {
                    // owner published after the CAS: under contention a
                    // pre-CAS store could let a losing thread's tid land
                    // last. A reader catching the window sees a stale owner
                    // and conservatively blocks; release wakes it.
                    self.excl_owner.store(hold.tid, Ordering::Relaxed);
                    hold.state.fetch_add(X_UNIT, Ordering::Relaxed);
                    self.touch_cache(hold);
                    return Ok(Admission::Admitted { wake_next: false });
                }
                Err(_) => spin_hint(),
            }
        }
    }

    /// Acquire IS, IX, or S, parking until admitted
    pub(crate) fn acquire_shared(&self, unit: u64) -> Result<(), LockError> {
        let tracing_span =
            tracing::span!(Level::TRACE, "RawMultiLock::acquire_shared", lock = self.id, unit);
        let _span_enter = tracing_span.enter();

        let hold = self.hold_counter();
        let mut parked = false;
        loop {
            match self.try_acquire_shared(unit)? {
                Admission::Admitted { wake_next } => {
                    if parked && wake_next {
                        self.wake_next_compatible();
                    }
                    return Ok(());
                }
                Admission::Blocked => {
                    self.park(park_token_for(unit), || self.shared_blocked(unit, hold));
                    parked = true;
                }
            }
        }
    }

    /// Acquire X, parking until admitted
    pub(crate) fn acquire_exclusive(&self) -> Result<(), LockError> {
        let tracing_span =
            tracing::span!(Level::TRACE, "RawMultiLock::acquire_exclusive", lock = self.id);
        let _span_enter = tracing_span.enter();

        let hold = self.hold_counter();
        loop {
            match self.try_acquire_exclusive()? {
                Admission::Admitted { .. } => return Ok(()),
                Admission::Blocked => self.park(TOKEN_X, || self.exclusive_blocked(hold)),
            }
        }
    }

    /// Release one IS, IX, or S hold of the calling thread
    pub(crate) fn release_shared(&self, unit: u64) -> Result<(), LockError> {
        debug_assert!(unit == IS_UNIT || unit == IX_UNIT || unit == S_UNIT);
        let tracing_span =
            tracing::span!(Level::TRACE, "RawMultiLock::release_shared", lock = self.id, unit);
        let _span_enter = tracing_span.enter();

        let hold = self.hold_counter();
        if hold.state.load(Ordering::Relaxed) & field_mask(unit) == 0 {
            return Err(LockError::NotHeld);
        }
        hold.state.fetch_sub(unit, Ordering::Relaxed);
        self.touch_cache(hold);

        let mut c = self.state.load(Ordering::Relaxed);
        loop {
            match self
                .state
                .compare_exchange_weak(c, c - unit, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => {
                    if x_count(c - unit) == 0 {
                        // anything parked is blocked on what remains; let
                        // the head re-check against the new word. Waking
                        // only when this mode's count hits zero would
                        // strand an upgrader whose last rival just left.
                        self.wake_head();
                    }
                    return Ok(());
                }
                Err(actual) => {
                    c = actual;
                    spin_hint();
                }
            }
        }
    }

    /// Release one X hold; only the exclusive owner may call this
    pub(crate) fn release_exclusive(&self) -> Result<(), LockError> {
        let tracing_span =
            tracing::span!(Level::TRACE, "RawMultiLock::release_exclusive", lock = self.id);
        let _span_enter = tracing_span.enter();

        let hold = self.hold_counter();
        if self.excl_owner.load(Ordering::Relaxed) != hold.tid {
            return Err(LockError::NotHeld);
        }
        hold.state.fetch_sub(X_UNIT, Ordering::Relaxed);

        let mut c = self.state.load(Ordering::Relaxed);
        loop {
            let next = c - X_UNIT;
            if x_count(next) == 0 {
                // the owner slot must read empty by the time the zero X
                // count is visible
                self.excl_owner.store(0, Ordering::Relaxed);
            }
            match self
                .state
                .compare_exchange_weak(c, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => {
                    if x_count(next) == 0 {
                        self.wake_head();
                    }
                    return Ok(());
                }
                Err(actual) => {
                    c = actual;
                    spin_hint();
                }
            }
        }
    }

    /// Admission predicate for IS/IX/S without the CAS: would this request
    /// block right now?
    fn shared_blocked(&self, unit: u64, hold: &HoldCounter) -> bool {
        let c = self.state.load(Ordering::Relaxed);
        if x_count(c) != 0 {
            return self.excl_owner.load(Ordering::Relaxed) != hold.tid;
        }
        if unit == IS_UNIT {
            return false;
        }
        let rival_field = if unit == IX_UNIT { S_FIELD } else { IX_FIELD };
        (c - hold.state.load(Ordering::Relaxed)) & rival_field != 0
    }

    /// Admission predicate for X without the CAS
    fn exclusive_blocked(&self, hold: &HoldCounter) -> bool {
        let c = self.state.load(Ordering::Relaxed);
        if c == 0 {
            return false;
        }
        if x_count(c) == 0 {
            (c - hold.state.load(Ordering::Relaxed)) & NON_X_FIELDS != 0
        } else {
            self.excl_owner.load(Ordering::Relaxed) != hold.tid
        }
    }

    fn touch_cache(&self, hold: &'static HoldCounter) {
        self.cached_hold
            .store(hold as *const HoldCounter as *mut HoldCounter, Ordering::Relaxed);
    }

    /// Park until a release wakes us. `still_blocked` is re-evaluated under
    /// the queue lock, so a release racing with the park is never lost: if
    /// it already made us admissible, we don't go to sleep at all.
    fn park(&self, token: ParkToken, still_blocked: impl FnOnce() -> bool) {
        tracing::event!(name: "multilock::park", Level::TRACE, "park");
        // safety: the key is our own address, and neither closure panics
        // or calls back into parking_lot
        let _ = unsafe {
            parking_lot_core::park(
                self as *const Self as usize,
                still_blocked,
                || {},
                |_, _| {},
                token,
                None,
            )
        };
    }

    /// Wake the queue head so it can re-evaluate its admission predicate
    fn wake_head(&self) {
        tracing::event!(name: "multilock::wake", Level::TRACE, "wake head");
        // safety: key is our own address; the callback does not panic or
        // re-enter parking_lot
        unsafe {
            parking_lot_core::unpark_one(self as *const Self as usize, |_| DEFAULT_UNPARK_TOKEN);
        }
    }

    /// Pass an inherited wakeup down the queue
    ///
    /// Called by a formerly parked shared acquirer right after it admits:
    /// if the new queue head could also be admitted against the fresh
    /// state, wake it too, giving compatible waiters a transitive wake.
    /// The head is judged with an empty hold word; its own holds could
    /// only help it, so this may under-wake, and the per-release wake
    /// still covers every transition to admissibility.
    fn wake_next_compatible(&self) {
        let c = self.state.load(Ordering::Relaxed);
        let mut head_checked = false;
        tracing::event!(name: "multilock::wake", Level::TRACE, "wake next compatible");
        // safety: see wake_head
        unsafe {
            parking_lot_core::unpark_filter(
                self as *const Self as usize,
                |token| {
                    if head_checked || !queued_admissible(c, token) {
                        FilterOp::Stop
                    } else {
                        head_checked = true;
                        FilterOp::Unpark
                    }
                },
                |_| DEFAULT_UNPARK_TOKEN,
            );
        }
    }
}

/// Whether a waiter parked with `token` could be admitted against state
/// `c`, assuming the waiter holds nothing itself
fn queued_admissible(c: u64, token: ParkToken) -> bool {
    match token {
        TOKEN_IS => x_count(c) == 0,
        TOKEN_IX => x_count(c) == 0 && s_count(c) == 0,
        TOKEN_S => x_count(c) == 0 && ix_count(c) == 0,
        TOKEN_X => c == 0,
        _ => false,
    }
}

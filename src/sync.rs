//! Recursive monitors.
//!
//! [`Monitor`] backs both VMKit's internal worker locks and, via [`crate::thread`],
//! the per-object `wait`/`notify` monitors a managed language exposes to user code
//! (§5: "classical per-object monitors backed by a per-object lazily-allocated
//! `LockObj`"). It is a `parking_lot` mutex + condvar pair with a recursion counter,
//! so the same thread may lock it repeatedly without deadlocking and `wait` releases
//! every recursion level before blocking and reacquires them all on wake.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Thread-id of whoever currently holds a [`Monitor`], or [`NO_HOLDER`] when free.
pub type HolderId = u64;
pub const NO_HOLDER: HolderId = u64::MAX;

pub struct Monitor<T> {
    lock: Mutex<T>,
    cvar: Condvar,
    holder: AtomicU64,
    rec_count: AtomicUsize,
}

impl<T> Monitor<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: Mutex::new(value),
            cvar: Condvar::new(),
            holder: AtomicU64::new(NO_HOLDER),
            rec_count: AtomicUsize::new(0),
        }
    }

    /// Lock the monitor, recursively if the current thread already holds it.
    ///
    /// Recursive entry does not take the underlying `parking_lot::Mutex` again (it
    /// is not itself recursive); instead it hands out a second guard over the same,
    /// already-locked, raw mutex. Only the guard that brings `rec_count` back to
    /// zero is allowed to actually unlock (see `Drop for MonitorGuard`).
    pub fn lock(&self, holder: HolderId) -> MonitorGuard<'_, T> {
        if self.holder.load(Ordering::Acquire) == holder {
            self.rec_count.fetch_add(1, Ordering::Relaxed);
            // SAFETY: `holder` is recorded as already owning `self.lock`, so handing
            // out another guard over the same raw mutex without re-locking is sound
            // as long as at most one of the outstanding guards is ever allowed to
            // run its real `Drop` (the rest are leaked) — enforced below.
            let guard = unsafe { self.lock.make_guard_unchecked() };
            return MonitorGuard {
                guard: Some(guard),
                monitor: self,
            };
        }

        let guard = self.lock.lock();
        self.holder.store(holder, Ordering::Release);
        self.rec_count.store(1, Ordering::Relaxed);
        MonitorGuard {
            guard: Some(guard),
            monitor: self,
        }
    }

    /// `true` if `holder` currently owns this monitor (any recursion depth).
    pub fn is_held_by(&self, holder: HolderId) -> bool {
        self.holder.load(Ordering::Acquire) == holder
    }

    pub fn recursion_depth(&self) -> usize {
        self.rec_count.load(Ordering::Relaxed)
    }

    pub fn notify_one(&self) {
        self.cvar.notify_one();
    }

    pub fn notify_all(&self) {
        self.cvar.notify_all();
    }

    /// Lock the monitor without handing back a guard, for call sites where the
    /// critical section spans more than one function call (classical
    /// `monitor_enter`/`monitor_exit` rather than a single scoped block).
    /// Recursion rules are identical to [`Monitor::lock`]; the underlying
    /// `parking_lot::Mutex` is left locked (via [`MutexGuard::leak`]) until a
    /// matching [`Monitor::raw_unlock`].
    pub fn raw_lock(&self, holder: HolderId) {
        if self.holder.load(Ordering::Acquire) == holder {
            self.rec_count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let guard = self.lock.lock();
        MutexGuard::leak(guard);
        self.holder.store(holder, Ordering::Release);
        self.rec_count.store(1, Ordering::Relaxed);
    }

    /// Release one recursion level previously acquired with [`Monitor::raw_lock`].
    /// Only actually unlocks the underlying mutex once the recursion count
    /// returns to zero.
    ///
    /// # Safety
    /// The caller must currently hold this monitor as `holder` via a `raw_lock`
    /// call that has not yet been matched by this many `raw_unlock` calls.
    pub unsafe fn raw_unlock(&self, holder: HolderId) {
        debug_assert_eq!(self.holder.load(Ordering::Acquire), holder);
        if self.rec_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.holder.store(NO_HOLDER, Ordering::Release);
            self.lock.force_unlock();
        }
    }

    /// Wait on the monitor's condvar from a thread that entered via `raw_lock`.
    /// Releases every recursion level, blocks, then reacquires them all and
    /// leaves the mutex locked again (as `raw_lock` left it) so the caller's
    /// outstanding `raw_lock` remains valid.
    ///
    /// # Safety
    /// The caller must currently hold this monitor as `holder` via `raw_lock`.
    pub unsafe fn raw_wait(&self, holder: HolderId) {
        let rec_count = self.rec_count.swap(0, Ordering::AcqRel);
        self.holder.store(NO_HOLDER, Ordering::Release);
        let mut guard = self.lock.make_guard_unchecked();
        self.cvar.wait(&mut guard);
        MutexGuard::leak(guard);
        self.rec_count.store(rec_count, Ordering::Relaxed);
        self.holder.store(holder, Ordering::Release);
    }

    /// As [`Monitor::raw_wait`] but returns `false` on timeout.
    ///
    /// # Safety
    /// Same precondition as [`Monitor::raw_wait`].
    pub unsafe fn raw_wait_timeout(&self, holder: HolderId, timeout: Duration) -> bool {
        let rec_count = self.rec_count.swap(0, Ordering::AcqRel);
        self.holder.store(NO_HOLDER, Ordering::Release);
        let mut guard = self.lock.make_guard_unchecked();
        let result = self.cvar.wait_for(&mut guard, timeout);
        MutexGuard::leak(guard);
        self.rec_count.store(rec_count, Ordering::Relaxed);
        self.holder.store(holder, Ordering::Release);
        !result.timed_out()
    }
}

/// RAII guard returned by [`Monitor::lock`].
pub struct MonitorGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    monitor: &'a Monitor<T>,
}

impl<'a, T> MonitorGuard<'a, T> {
    /// Wait on the monitor's condvar, releasing every recursion level and
    /// reacquiring them all before returning. `holder` is re-stamped as the owner
    /// once the wait returns (waking from a condvar re-locks the raw mutex but does
    /// not by itself know who "logically" owns the recursive monitor again).
    pub fn wait(&mut self, holder: HolderId) {
        let rec_count = self.monitor.rec_count.swap(0, Ordering::AcqRel);
        self.monitor.holder.store(NO_HOLDER, Ordering::Release);

        self.monitor.cvar.wait(self.guard.as_mut().expect("guard"));

        self.monitor.rec_count.store(rec_count, Ordering::Relaxed);
        self.monitor.holder.store(holder, Ordering::Release);
    }

    /// As [`Self::wait`] but returns `false` on timeout.
    pub fn wait_timeout(&mut self, timeout: Duration, holder: HolderId) -> bool {
        let rec_count = self.monitor.rec_count.swap(0, Ordering::AcqRel);
        self.monitor.holder.store(NO_HOLDER, Ordering::Release);

        let result = self
            .monitor
            .cvar
            .wait_for(self.guard.as_mut().expect("guard"), timeout);

        self.monitor.rec_count.store(rec_count, Ordering::Relaxed);
        self.monitor.holder.store(holder, Ordering::Release);

        !result.timed_out()
    }
}

impl<'a, T> Drop for MonitorGuard<'a, T> {
    fn drop(&mut self) {
        let guard = self.guard.take().expect("guard taken twice");
        if self.monitor.rec_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last recursion level: really unlock.
            drop(guard);
        } else {
            // A shallower recursion level is still logically holding the lock;
            // don't let this guard's drop impl unlock the raw mutex under it.
            MutexGuard::leak(guard);
        }
    }
}

impl<'a, T> Deref for MonitorGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard")
    }
}

impl<'a, T> DerefMut for MonitorGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard")
    }
}

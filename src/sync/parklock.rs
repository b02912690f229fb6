//! Blocking ("parking") lock.
//!
//! Unlike `Spinlock`, a `ParkLock` may be held across a yield: a contending
//! process parks itself in `BLOCKED(ON_LOCK)` instead of spinning. Release
//! wakes *every* waiter; whichever one the scheduler happens to run next
//! wins the race to re-acquire (§4.7, §5 "ordering guarantees").
//!
//! The acquire-side lock order is always `internal spinlock -> ptable lock`,
//! matching the rest of the kernel's blocking operations (§5 "lock
//! discipline"): take the internal lock, discover we must block, release
//! the internal lock, take the ptable lock, record the wait reason, block.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::proc::{self, BlockReason, Pid};
use crate::sync::spinlock::Spinlock;

pub struct ParkLock<T> {
    inner: Spinlock<ParkLockState>,
    data: UnsafeCell<T>,
}

struct ParkLockState {
    locked: bool,
    holder: Option<Pid>,
}

unsafe impl<T: Send> Sync for ParkLock<T> {}

pub struct ParkLockGuard<'a, T> {
    lock: &'a ParkLock<T>,
}

impl<T> ParkLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            inner: Spinlock::new(name, ParkLockState {
                locked: false,
                holder: None,
            }),
            data: UnsafeCell::new(data),
        }
    }

    /// Identity used to match waiters to this specific lock instance in the
    /// ptable's `block_on` field; two distinct `ParkLock`s never compare
    /// equal, even if constructed with the same diagnostic name.
    fn id(&self) -> usize {
        self.inner.get_id()
    }

    /// Blocks the calling process until the lock is free, then takes it.
    pub fn acquire(&self) -> ParkLockGuard<'_, T> {
        loop {
            let mut guard = self.inner.acquire();
            if !guard.locked {
                guard.locked = true;
                guard.holder = Some(proc::current_pid());
                drop(guard);
                return ParkLockGuard { lock: self };
            }
            // Must block: hand off from the internal lock to the ptable
            // lock without a gap a wakeup could slip through.
            drop(guard);
            proc::block_on(BlockReason::OnLock(self.id()));
        }
    }

    /// Releases the lock and wakes every process parked on it.
    fn release(&self) {
        {
            let mut guard = self.inner.acquire();
            assert_eq!(
                guard.holder,
                Some(proc::current_pid()),
                "ParkLock::release: not held by caller"
            );
            guard.locked = false;
            guard.holder = None;
        }
        proc::wake_all(BlockReason::OnLock(self.id()));
    }

    /// True if the currently running process holds this lock.
    pub fn holding(&self) -> bool {
        let guard = self.inner.acquire();
        guard.locked && guard.holder == Some(proc::current_pid())
    }
}

impl<T> Deref for ParkLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for ParkLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for ParkLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}


#[cfg(test)]
impl<T> ParkLock<T> {
    fn release_for_test(&self) {
        self.release();
    }
}

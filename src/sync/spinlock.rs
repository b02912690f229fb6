//! Spinlocks built on top of `IntState`.
//!
//! `acquire` disables interrupts (`cli_push`, via the `IntGuard` RAII
//! wrapper) before spinning on an atomic test-and-set; dropping the guard
//! clears the word and re-enables interrupts (`cli_pop`). On a single CPU
//! the loop in `acquire` never actually spins more than once — the atomic
//! exchange is kept anyway so the exact same code stays correct if the
//! kernel ever grows a second CPU.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use super::intstate::{HwInterrupts, IntGuard};
use super::cpu::current_int_state;

/// A process holding a spinlock must never yield: the scheduler asserts
/// `cli_depth == 1` at the moment it parks a process, which is mechanically
/// enforced because `acquire` bumps the depth and a correctly written
/// critical section never calls into the scheduler while it holds the lock.
pub struct Spinlock<T> {
    name: &'static str,
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Spinlock<T> {}

pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    // Dropped after `release()` runs in `Drop::drop` below (fields drop in
    // declaration order once the explicit `drop` body returns), so
    // interrupts come back only after the atomic word is cleared.
    _int_guard: IntGuard<'static>,
}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stable identity for this lock instance, usable as a map/match key.
    pub fn get_id(&self) -> usize {
        self as *const Self as usize
    }

    pub fn acquire(&self) -> SpinlockGuard<'_, T> {
        let int_guard = current_int_state().push_guard::<HwInterrupts>();
        assert!(!self.holding_unlocked(), "acquire: already holding {}", self.name);
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        SpinlockGuard { lock: self, _int_guard: int_guard }
    }

    fn holding_unlocked(&self) -> bool {
        // Single-CPU degenerate form of `holding`: a lock already held by
        // anyone is necessarily held by us, because nothing else can run
        // concurrently with interrupts off.
        self.locked.load(Ordering::Relaxed)
    }

    /// True if the current (and only) CPU holds this lock.
    pub fn holding(&self) -> bool {
        self.holding_unlocked()
    }

    /// Clears the locked word. Interrupts come back separately, when the
    /// guard's own `IntGuard` field drops right after this returns.
    fn release(&self) {
        assert!(self.holding_unlocked(), "release: not holding {}", self.name);
        self.locked.store(false, Ordering::Release);
    }

    /// Returns a raw pointer to the protected data, bypassing the lock.
    /// Used only by `ParkLock`'s atomic "release internal lock, then take
    /// the ptable lock" dance, where the normal guard's lifetime can't
    /// express the handoff.
    ///
    /// # Safety
    /// Caller must already hold the lock.
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_roundtrip() {
        let lk = Spinlock::new("test", 0u32);
        {
            let mut g = lk.acquire();
            *g += 1;
        }
        assert_eq!(*lk.acquire(), 1);
    }

    #[test]
    #[should_panic(expected = "already holding")]
    fn reentrant_acquire_panics() {
        let lk = Spinlock::new("test", 0u32);
        let _g1 = lk.acquire();
        let _g2 = lk.acquire();
    }
}

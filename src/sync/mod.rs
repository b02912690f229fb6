//! Synchronization primitives: nestable interrupt-disable stack,
//! spinlocks built on it, and blocking park locks that integrate with the
//! scheduler and process table.

pub mod cpu;
pub mod intstate;
pub mod parklock;
pub mod spinlock;

pub use intstate::{HwInterrupts, IntState, InterruptControl};
pub use parklock::{ParkLock, ParkLockGuard};
pub use spinlock::{Spinlock, SpinlockGuard};

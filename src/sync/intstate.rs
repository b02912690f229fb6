//! Nestable interrupt-disable stack.
//!
//! Single CPU, so this is a plain counter rather than a per-CPU array.
//! `cli_push`/`cli_pop` are matched like `push_off`/`pop_off` in a
//! conventional teaching kernel: it takes as many `cli_pop`s as `cli_push`es
//! to actually re-enable interrupts, and if interrupts were already off when
//! the first `cli_push` ran, the balancing `cli_pop` leaves them off.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

/// Architecture hook: read/write the CPU's interrupt-enable flag.
///
/// On real x86 hardware this is `pushfl`+test of `EFLAGS.IF`, and `cli`/`sti`.
/// Implemented in `crate::arch` for the `kernel` binary; the host test
/// profile swaps in a software flag so the nesting logic can be exercised
/// without real interrupts.
pub trait InterruptControl {
    fn is_enabled() -> bool;
    fn disable();
    fn enable();
}

#[cfg(not(test))]
pub use crate::arch::x86::X86Interrupts as HwInterrupts;

#[cfg(test)]
pub use fake::FakeInterrupts as HwInterrupts;

#[cfg(test)]
mod fake {
    use super::*;

    static ENABLED: AtomicBool = AtomicBool::new(true);

    pub struct FakeInterrupts;

    impl InterruptControl for FakeInterrupts {
        fn is_enabled() -> bool {
            ENABLED.load(Ordering::SeqCst)
        }
        fn disable() {
            ENABLED.store(false, Ordering::SeqCst);
        }
        fn enable() {
            ENABLED.store(true, Ordering::SeqCst);
        }
    }
}

/// Per-process view of the nesting depth and the remembered
/// interrupt-enable flag. On yield, the scheduler copies this out of the
/// running process and restores it when the process runs again, since
/// `cli_depth` is logically attached to whichever kernel thread is
/// executing, not to the CPU.
pub struct IntState {
    cli_depth: Cell<u32>,
    int_enabled: Cell<bool>,
}

impl IntState {
    pub const fn new() -> Self {
        Self {
            cli_depth: Cell::new(0),
            int_enabled: Cell::new(true),
        }
    }

    pub fn depth(&self) -> u32 {
        self.cli_depth.get()
    }

    /// Disables interrupts, remembering the prior enable state the first
    /// time the depth transitions from 0 to 1.
    pub fn cli_push<I: InterruptControl>(&self) {
        let was_enabled = I::is_enabled();
        I::disable();
        if self.cli_depth.get() == 0 {
            self.int_enabled.set(was_enabled);
        }
        self.cli_depth.set(self.cli_depth.get() + 1);
    }

    /// Decrements the depth; re-enables interrupts only once the depth
    /// returns to 0 and the remembered flag says they were on.
    pub fn cli_pop<I: InterruptControl>(&self) {
        assert!(self.cli_depth.get() > 0, "cli_pop: stack underflow");
        let depth = self.cli_depth.get() - 1;
        self.cli_depth.set(depth);
        if depth == 0 && self.int_enabled.get() {
            I::enable();
        }
    }

    /// Saves the per-process view when this process is scheduled out, so a
    /// second process manipulating the hardware flag independently can't
    /// clobber this one's bookkeeping.
    pub fn save(&self) -> (u32, bool) {
        (self.cli_depth.get(), self.int_enabled.get())
    }

    pub fn restore(&self, saved: (u32, bool)) {
        self.cli_depth.set(saved.0);
        self.int_enabled.set(saved.1);
    }
}

impl Default for IntState {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by `cli_push`; dropping it calls `cli_pop`.
pub struct IntGuard<'a> {
    state: &'a IntState,
}

impl IntState {
    pub fn push_guard<I: InterruptControl>(&self) -> IntGuard<'_> {
        self.cli_push::<I>();
        IntGuard { state: self }
    }
}

impl Drop for IntGuard<'_> {
    fn drop(&mut self) {
        self.state.cli_pop::<HwInterrupts>();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_push_pop_restores_prior_state() {
        let s = IntState::new();
        HwInterrupts::enable();
        assert!(HwInterrupts::is_enabled());
        s.cli_push::<HwInterrupts>();
        assert!(!HwInterrupts::is_enabled());
        s.cli_push::<HwInterrupts>();
        assert_eq!(s.depth(), 2);
        s.cli_pop::<HwInterrupts>();
        // still disabled: depth is 1
        assert!(!HwInterrupts::is_enabled());
        s.cli_pop::<HwInterrupts>();
        assert!(HwInterrupts::is_enabled());
        assert_eq!(s.depth(), 0);
    }

    #[test]
    fn already_disabled_stays_disabled_after_balanced_pop() {
        let s = IntState::new();
        HwInterrupts::disable();
        s.cli_push::<HwInterrupts>();
        s.cli_pop::<HwInterrupts>();
        assert!(!HwInterrupts::is_enabled());
        HwInterrupts::enable();
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn unbalanced_pop_panics() {
        let s = IntState::new();
        s.cli_pop::<HwInterrupts>();
    }
}

//! Single-CPU state: the nesting counter spinlocks synchronize on, and a
//! slot for the currently running process's saved `int_enabled` flag.
//!
//! A real multi-CPU kernel would index this by APIC id; this kernel only
//! ever runs on one CPU; the table is still a table of size 1 so the
//! scheduler loop's code reads the same as it would on SMP.

use core::cell::Cell;

use super::intstate::IntState;

pub struct Cpu {
    pub int_state: IntState,
    /// Ptable slot index of the process this CPU is currently running, if
    /// any. `None` while idling in the scheduler loop itself.
    running: Cell<Option<usize>>,
    /// Saved stack pointer of the scheduler loop itself, so a process's
    /// `yield_to_scheduler` knows where to switch back to.
    scheduler_esp: Cell<u32>,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            int_state: IntState::new(),
            running: Cell::new(None),
            scheduler_esp: Cell::new(0),
        }
    }

    pub fn scheduler_esp(&self) -> u32 {
        self.scheduler_esp.get()
    }

    pub fn scheduler_esp_ptr(&self) -> *mut u32 {
        self.scheduler_esp.as_ptr()
    }
}

// Single CPU only (see module docs): never accessed concurrently from two
// hardware threads, so the `Cell`-based interior mutability above is sound
// to share as a `static`.
unsafe impl Sync for Cpu {}

static CPU0: Cpu = Cpu::new();

/// Returns the single CPU's `IntState`. Spinlock acquire/release and the
/// scheduler's yield path both go through this handle.
pub fn current_int_state() -> &'static IntState {
    &CPU0.int_state
}

pub fn current_cpu() -> &'static Cpu {
    &CPU0
}

pub fn current_running_slot() -> Option<usize> {
    CPU0.running.get()
}

pub fn set_running_slot(slot: Option<usize>) {
    CPU0.running.set(slot);
}

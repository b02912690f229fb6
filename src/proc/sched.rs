//! The scheduler loop and the voluntary yield that feeds it (§4.6).
//!
//! `yield_to_scheduler` only does the bookkeeping that doesn't involve
//! actually changing which stack the CPU is executing on — saving/restoring
//! the per-process `int_enabled` flag and handing off through
//! `arch::x86::switch` belongs to the real (`not(test)`) kernel binary,
//! since a host test thread has no second kernel-thread stack to switch to.
//!
//! Simplification from the exact idiom: the reference kernel holds the
//! ptable spinlock across the switch itself and has `new_process_entry`
//! release it on the other side, so a process can never observe the table
//! mid-update. This kernel instead takes and drops the lock around each
//! individual field read/write, which is equivalent on a single CPU with
//! interrupts disabled for the whole scheduling decision: nothing else can
//! run between this loop's acquire/release pairs.

use crate::param::MAX_PROCS;
use crate::sync::cpu::{current_running_slot, set_running_slot};

use super::{ProcState, PTABLE};

/// Called with the running process's state already set to something other
/// than `Running` (§4.6: the scheduler asserts `cli_depth == 1` and
/// interrupts disabled at the moment it parks a process).
#[cfg(not(test))]
pub fn yield_to_scheduler() {
    let slot = current_running_slot().expect("yield_to_scheduler: no running process");
    let saved = crate::sync::cpu::current_int_state().save();
    {
        let mut t = PTABLE.acquire();
        t.get_mut(slot).saved_int = saved;
    }
    let esp_ptr = {
        let mut t = PTABLE.acquire();
        &mut t.get_mut(slot).context_esp as *mut u32
    };
    let target = crate::sync::cpu::current_cpu().scheduler_esp();
    // SAFETY: `esp_ptr` points at this process's own ptable slot, stable
    // for the kernel's lifetime; `target` was set by `scheduler_loop`
    // immediately before switching into this process.
    unsafe { crate::arch::x86::switch(esp_ptr, target) };
    let restored = PTABLE.acquire().get(slot).saved_int;
    crate::sync::cpu::current_int_state().restore(restored);
}

/// Host test builds have no second kernel-thread stack to hand off to, so
/// state transitions performed by the caller before this call (the only
/// thing a unit test can observe) are the whole of this function's effect.
#[cfg(test)]
pub fn yield_to_scheduler() {}

/// Runs forever, picking `Ready` processes in round-robin order and context
/// switching into each for up to its timeslice worth of timer ticks. Not
/// exercised by host tests (there is no second stack to switch to without
/// real hardware); `proc`'s other unit tests cover the ptable bookkeeping
/// this loop depends on.
#[cfg(not(test))]
pub fn scheduler_loop(tss: &mut crate::arch::x86::gdt::Tss) -> ! {
    use crate::sync::intstate::{HwInterrupts, InterruptControl};

    loop {
        HwInterrupts::enable();
        for slot in 0..MAX_PROCS {
            if PTABLE.acquire().get(slot).state != ProcState::Ready {
                continue;
            }

            let kstack_top = PTABLE
                .acquire()
                .get(slot)
                .kstack
                .map(|f| unsafe { crate::mm::frame_ptr(f) } as u32 + crate::param::PAGE_SIZE as u32)
                .unwrap_or(0);
            crate::arch::x86::gdt::set_kernel_stack(tss, kstack_top);

            if let Some(dir) = PTABLE.acquire().get(slot).pgdir.as_ref() {
                // SAFETY: `dir` belongs to the process about to run.
                unsafe { crate::arch::x86::switch_pagedir(dir.directory().frame()) };
            }

            // A process's timer tick demotes it back to `Ready` (§4.6); this
            // loop is what turns that into a weighted timeslice by simply
            // re-entering the same slot until it stops coming back `Ready`
            // or its budget of ticks runs out, rather than moving on to the
            // next slot after a single tick.
            let budget = PTABLE.acquire().get(slot).timeslice.max(1);
            for _ in 0..budget {
                set_running_slot(Some(slot));
                let target_esp = {
                    let mut t = PTABLE.acquire();
                    t.get_mut(slot).state = ProcState::Running;
                    t.get(slot).context_esp
                };
                // SAFETY: entering a process previously parked by `switch`
                // from this very loop, or freshly built by `spawn_initial`.
                unsafe {
                    crate::arch::x86::switch(
                        crate::sync::cpu::current_cpu().scheduler_esp_ptr(),
                        target_esp,
                    )
                };
                set_running_slot(None);

                if PTABLE.acquire().get(slot).state != ProcState::Ready {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{FrameAlloc, PageSlab};
    use crate::proc::{self, BlockReason};

    #[test]
    fn yield_after_block_leaves_state_blocked() {
        let _g = proc::test_guard();
        proc::reset_ptable_for_test();
        let frames = FrameAlloc::new();
        frames.init();
        let slab = PageSlab::new();
        slab.init(&frames, 8).unwrap();

        let slot = super::super::alloc_slot(&slab, "t", 1).unwrap();
        set_running_slot(Some(slot));
        proc::block_on(BlockReason::OnSleep);
        assert_eq!(PTABLE.acquire().get(slot).state, ProcState::Blocked);
        set_running_slot(None);
    }
}

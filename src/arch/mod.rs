//! Architecture-specific glue: everything that must be expressed as raw
//! port I/O, privileged instructions, or inline assembly.
//!
//! Compiled only into the real `kernel` binary (§9 "asm interop"); host unit
//! tests substitute software fakes for every trait this module implements,
//! so none of it needs to build under `cfg(test)`.

#[cfg(not(test))]
pub mod x86;

/// Timer ticks per second the boot handoff code programs the PIT to
/// deliver (§4.6 "timer tick"). Programming the PIT itself is out of this
/// crate's scope; `sys_sleep` only needs the ratio to turn a millisecond
/// count into a tick count.
pub const TICK_HZ: u32 = 100;

pub fn ms_to_ticks(millis: u32) -> u64 {
    (millis as u64 * TICK_HZ as u64).div_ceil(1000)
}

/// `sys_shutdown`'s backing call (§6). There is no universal x86
/// instruction for "power off"; ACPI/APM negotiation is out of scope here,
/// so this halts the CPU with interrupts disabled, which is observably
/// indistinguishable from a shutdown on the single-core target this kernel
/// runs on.
#[cfg(not(test))]
pub fn power_off() -> ! {
    x86::halt_forever()
}

#[cfg(test)]
pub fn power_off() -> ! {
    panic!("power_off: not reachable under host tests")
}

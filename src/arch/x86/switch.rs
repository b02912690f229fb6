//! Voluntary kernel-to-kernel context switch (§4.6, §9 "asm interop").
//!
//! Saves the callee-saved integer registers and the frame pointer into a
//! `Context` record at the current stack pointer, swaps `esp`, then pops the
//! new context. The instruction pointer travels implicitly via the
//! `call`/`ret` pair: `switch` is entered with `call` and returns with
//! `ret`, so whatever address sits where `eip` would be on the new stack is
//! where execution resumes — `scheduler_loop` the first time a process
//! runs, back into `switch` itself on every subsequent hand-off.

use core::arch::global_asm;

#[repr(C)]
pub struct Context {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub eip: u32,
}

extern "C" {
    /// `switch(&mut *old_esp, new_esp)`: saves the current context onto the
    /// current stack and writes the resulting stack pointer through
    /// `old_esp`, then switches to `new_esp` and pops the context found
    /// there.
    pub fn switch(old_esp: *mut u32, new_esp: u32);
}

global_asm!(
    ".global switch",
    "switch:",
    "mov eax, [esp+4]", // old_esp
    "mov edx, [esp+8]", // new_esp
    "push ebp",
    "push ebx",
    "push esi",
    "push edi",
    "mov [eax], esp",
    "mov esp, edx",
    "pop edi",
    "pop esi",
    "pop ebx",
    "pop ebp",
    "ret",
);

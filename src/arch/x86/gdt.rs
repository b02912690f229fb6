//! Global descriptor table and task-state segment installation.
//!
//! Five flat descriptors: null, kernel code, kernel data, user code, user
//! data, installed at indices 0..4, with the TSS at index 5 (§9 open
//! question — the source this kernel is patterned after aliased user code
//! and data onto the same index; that bug is not reproduced here).

use core::arch::asm;
use core::mem::size_of;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct SegDesc {
    limit_lo: u16,
    base_lo: u16,
    base_mid: u8,
    access: u8,
    limit_hi_flags: u8,
    base_hi: u8,
}

impl SegDesc {
    const fn null() -> Self {
        Self { limit_lo: 0, base_lo: 0, base_mid: 0, access: 0, limit_hi_flags: 0, base_hi: 0 }
    }

    const fn flat(access: u8, flags: u8) -> Self {
        Self {
            limit_lo: 0xFFFF,
            base_lo: 0,
            base_mid: 0,
            access,
            limit_hi_flags: 0xF | (flags << 4),
            base_hi: 0,
        }
    }

    fn system(base: u32, limit: u32, access: u8) -> Self {
        Self {
            limit_lo: (limit & 0xFFFF) as u16,
            base_lo: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access,
            limit_hi_flags: ((limit >> 16) & 0xF) as u8,
            base_hi: ((base >> 24) & 0xFF) as u8,
        }
    }
}

const ACCESS_KCODE: u8 = 0x9A;
const ACCESS_KDATA: u8 = 0x92;
const ACCESS_UCODE: u8 = 0xFA;
const ACCESS_UDATA: u8 = 0xF2;
const ACCESS_TSS: u8 = 0x89;
const FLAGS_32BIT_4K: u8 = 0xC;

static mut GDT: [SegDesc; 6] = [SegDesc::null(); 6];

#[repr(C, packed)]
struct Dtr {
    limit: u16,
    base: u32,
}

/// A minimal 32-bit TSS: only `ss0`/`esp0` matter here, since this kernel
/// never hardware-task-switches, only uses the TSS to load the ring-0 stack
/// pointer on a privilege-level-changing interrupt.
#[repr(C, packed)]
pub struct Tss {
    pub prev_task: u32,
    pub esp0: u32,
    pub ss0: u32,
    _rest: [u32; 23],
}

impl Tss {
    pub const fn new() -> Self {
        Self { prev_task: 0, esp0: 0, ss0: 0, _rest: [0; 23] }
    }
}

/// Installs the flat GDT and the TSS descriptor, then loads `GDTR` and the
/// task register. Must run once at boot, before any user process exists.
///
/// # Safety
/// Must be called exactly once, with `tss` valid for the kernel's lifetime.
pub unsafe fn install(tss: &'static Tss) {
    unsafe {
        GDT[0] = SegDesc::null();
        GDT[1] = SegDesc::flat(ACCESS_KCODE, FLAGS_32BIT_4K);
        GDT[2] = SegDesc::flat(ACCESS_KDATA, FLAGS_32BIT_4K);
        GDT[3] = SegDesc::flat(ACCESS_UCODE, FLAGS_32BIT_4K);
        GDT[4] = SegDesc::flat(ACCESS_UDATA, FLAGS_32BIT_4K);
        GDT[5] = SegDesc::system(
            tss as *const Tss as u32,
            size_of::<Tss>() as u32 - 1,
            ACCESS_TSS,
        );

        let dtr = Dtr {
            limit: (size_of::<[SegDesc; 6]>() - 1) as u16,
            base: GDT.as_ptr() as u32,
        };
        asm!("lgdt [{0}]", in(reg) &dtr, options(readonly, nostack, preserves_flags));
        asm!("ltr {0:x}", in(reg) 5u16 << 3, options(nostack, preserves_flags));
    }
}

/// Updates the TSS's ring-0 stack pointer; called on every context switch
/// into a process so a subsequent trap lands on that process's kernel stack.
pub fn set_kernel_stack(tss: &mut Tss, esp0: u32) {
    tss.ss0 = crate::trapstate::SEG_KDATA as u32;
    tss.esp0 = esp0;
}

//! Kernel entry point: the part of the system that only makes sense linked
//! as a freestanding binary, never under `cargo test` (§1, §9).
//!
//! Everything reachable from here assumes a 32-bit x86 CPU already in
//! protected mode with a stack, handed off by an external bootloader and
//! linker script (out of this crate's scope, the same boundary drawn around
//! the IDT/PIC wiring and the VGA/keyboard/disk drivers — see `console` and
//! `block`'s module docs). This file does the one-time bring-up those
//! drivers still need before the scheduler can take over: the GDT/TSS, the
//! kernel's own page tables, and the very first process.

#![no_std]
#![no_main]

use corekernel::arch::x86::{self, gdt};
use corekernel::mm::phys::TOTAL_FRAMES;
use corekernel::mm::{self, AddressSpace, Frame, PageDirectory, FRAMES, PAGE_SLAB};
use corekernel::param::{PAGE_SIZE, USER_BASE};
use corekernel::proc;
use corekernel::println;

/// Number of whole pages drawn into the page slab at boot. Sized well
/// beyond what the process/page-table bookkeeping for `MAX_PROCS` resident
/// processes can ever need, with plenty of physical memory left over for
/// `sbrk` growth (§4.4).
const PAGE_SLAB_CAPACITY: usize = 4096;

/// Two-instruction placeholder init program: `jmp $`, i.e. spin in place
/// forever. There is no toolchain in this workspace to produce a real
/// syscall-issuing init binary, and no block device is wired up at boot to
/// load one from disk even if there were (`fs::mount` is left for whoever
/// assembles a real disk image and calls it after boot, per `block`'s
/// module doc). A platform integrator who wants a shell running replaces
/// this with a real ELF loaded through `exec` once both of those exist.
const INITCODE: [u8; 2] = [0xEB, 0xFE];

#[no_mangle]
pub extern "C" fn _start() -> ! {
    kernel_main()
}

fn kernel_main() -> ! {
    println!("booting");

    // SAFETY: called exactly once, before any interrupt or process exists,
    // with a `'static` TSS.
    let tss = unsafe {
        static mut TSS: gdt::Tss = gdt::Tss::new();
        let tss_ptr = core::ptr::addr_of_mut!(TSS);
        gdt::install(&*core::ptr::addr_of!(TSS));
        &mut *tss_ptr
    };

    FRAMES.init();

    // Every physical frame gets an identity mapping here, not just the
    // reserved low ones: `frame_ptr` casts any frame's address straight to a
    // pointer and is used on frames drawn from anywhere in the allocator's
    // range (page-table leaves, page-slab pages, user pages), so all of
    // them must stay dereferenceable once paging is live (§3 "identity
    // map"). `TOTAL_FRAMES * PAGE_SIZE` comfortably fits under
    // `KERNEL_WINDOW_END`, which only bounds how far the window is allowed
    // to reach, not how much of it this boot loop has to fill.
    let kernel_dir = PageDirectory::new_boot(&FRAMES).expect("boot: no frames for kernel directory");
    for i in 0..TOTAL_FRAMES {
        let vaddr = (i * PAGE_SIZE) as u32;
        kernel_dir
            .map_kernel_boot(&FRAMES, vaddr, Frame(i as u32))
            .expect("boot: failed to identity-map frame");
    }
    let kernel_frame = kernel_dir.frame();
    mm::KERNEL_DIR.call_once(|| kernel_dir);

    // SAFETY: the directory just built identity maps every physical frame,
    // which covers this function, `_start`, and everything between here and
    // the instruction after `mov cr0` (§3).
    unsafe { x86::enable_paging(kernel_frame) };

    PAGE_SLAB
        .init(&FRAMES, PAGE_SLAB_CAPACITY)
        .expect("boot: not enough frames for the page slab");

    let init_slot = spawn_init();
    proc::set_initproc_slot(init_slot);

    println!("init process ready, entering scheduler");
    proc::sched::scheduler_loop(tss)
}

/// Builds the first process directly, bypassing `exec`/the file system:
/// neither exists yet this early in boot (§4.10 "bootstrap process"
/// mirrors the teacher's `userinit`, which embeds a machine-code blob for
/// the same reason rather than reading an ELF off disk).
fn spawn_init() -> usize {
    let image_end = USER_BASE + PAGE_SIZE as u32;
    let space = AddressSpace::new(&PAGE_SLAB, image_end).expect("boot: could not build init address space");

    let frame = space
        .directory()
        .map_user(&PAGE_SLAB, &FRAMES, USER_BASE, true)
        .expect("boot: could not map init's code page");
    // SAFETY: `frame` was just mapped exclusively for this page and is
    // identity-mapped by the kernel window, so the kernel can write its
    // contents directly.
    unsafe {
        let dst = mm::frame_ptr(frame);
        core::ptr::copy_nonoverlapping(INITCODE.as_ptr(), dst, INITCODE.len());
    }

    let esp = image_end;
    proc::spawn_initial(&PAGE_SLAB, "init", 4, space, USER_BASE, esp)
        .expect("boot: process table has no free slot for init")
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("panic: {}", info);
    corekernel::arch::power_off()
}

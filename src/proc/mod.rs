//! Process table, fork/exit/wait/sleep/kill, and the cooperative scheduler
//! (§4.6).
//!
//! Every kernel "thread" is a process; there is no separate kernel-thread
//! concept. The table is a fixed-size array, matching the no-heap-growth
//! discipline of the rest of the kernel (§9 "globally reachable tables").
//! A process's `parent` is stored as a weak slot index rather than any
//! owning pointer (§9): ownership of every `Pcb` belongs to the table.

pub mod sched;

use crate::error::{KernelError, KResult};
use crate::mm::{AddressSpace, Frame, FrameAlloc, PageSlab};
use crate::param::{MAX_FILES_PER_PROC, MAX_PROCS, PAGE_SIZE, PROC_NAME_LEN, STACK_FLOOR, USER_BASE, USER_MAX};
use crate::sync::cpu::{current_running_slot, set_running_slot};
use crate::sync::Spinlock;
use crate::trapstate::TrapState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Initial,
    Ready,
    Running,
    Blocked,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Nothing,
    OnSleep,
    OnWait,
    OnKbdIn,
    OnIdeDisk,
    OnLock(usize),
}

pub struct Pcb {
    pub name: [u8; PROC_NAME_LEN],
    pub pid: Pid,
    pub state: ProcState,
    pub block_on: BlockReason,
    pub pgdir: Option<AddressSpace>,
    pub kstack: Option<Frame>,
    pub trap_state: TrapState,
    /// Saved stack pointer at which `arch::x86::switch` resumes this
    /// process; meaningless while `state != Ready/Running`.
    pub context_esp: u32,
    pub stack_low: u32,
    pub parent: Option<usize>,
    pub killed: bool,
    pub timeslice: u32,
    pub target_tick: u64,
    pub wait_req: Option<usize>,
    pub wait_lock: Option<usize>,
    pub files: [Option<usize>; MAX_FILES_PER_PROC],
    /// An `ICache` slot kept open for as long as this process's current
    /// working directory, mirroring an open file descriptor's lifetime
    /// (§4.9/§6 `chdir`). `None` only before boot finishes setting up
    /// `initproc`.
    pub cwd: Option<u32>,
    /// One past the last byte of this process's ELF image, i.e. the lowest
    /// legal `setheap` target (§4.11, §6). Set by `exec`; inherited as-is
    /// by `fork`.
    pub image_end: u32,
    saved_int: (u32, bool),
}

impl Pcb {
    const fn blank() -> Self {
        Self {
            name: [0; PROC_NAME_LEN],
            pid: Pid(0),
            state: ProcState::Unused,
            block_on: BlockReason::Nothing,
            pgdir: None,
            kstack: None,
            trap_state: TrapState {
                edi: 0, esi: 0, ebp: 0, oesp: 0, ebx: 0, edx: 0, ecx: 0, eax: 0,
                gs: 0, fs: 0, es: 0, ds: 0, trapno: 0, err: 0, eip: 0, cs: 0,
                eflags: 0, esp: 0, ss: 0,
            },
            context_esp: 0,
            stack_low: STACK_FLOOR,
            parent: None,
            killed: false,
            timeslice: 1,
            target_tick: 0,
            wait_req: None,
            wait_lock: None,
            files: [None; MAX_FILES_PER_PROC],
            cwd: None,
            image_end: USER_BASE,
            saved_int: (0, true),
        }
    }

    pub fn heap_high(&self) -> u32 {
        self.pgdir.as_ref().map(|s| s.brk()).unwrap_or(USER_BASE)
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }
}

fn copy_name(dst: &mut [u8; PROC_NAME_LEN], src: &str) {
    *dst = [0; PROC_NAME_LEN];
    let n = src.len().min(PROC_NAME_LEN - 1);
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

pub struct ProcTable {
    procs: [Pcb; MAX_PROCS],
    next_pid: u32,
}

impl ProcTable {
    const fn new() -> Self {
        const BLANK: Pcb = Pcb::blank();
        Self {
            procs: [BLANK; MAX_PROCS],
            next_pid: 1,
        }
    }

    pub fn get(&self, slot: usize) -> &Pcb {
        &self.procs[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut Pcb {
        &mut self.procs[slot]
    }

    pub fn find_by_pid(&self, pid: Pid) -> Option<usize> {
        self.procs.iter().position(|p| p.state != ProcState::Unused && p.pid == pid)
    }

    fn two_mut(&mut self, a: usize, b: usize) -> (&mut Pcb, &mut Pcb) {
        assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.procs.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.procs.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }
}

pub static PTABLE: Spinlock<ProcTable> = Spinlock::new("ptable", ProcTable::new());
static TICKS: Spinlock<u64> = Spinlock::new("ticks", 0);
static INITPROC_SLOT: Spinlock<Option<usize>> = Spinlock::new("initproc_slot", None);

/// Records which ptable slot is `initproc`, the reparenting target every
/// orphaned child is handed to by `exit`. Set once by the boot sequence
/// right after `spawn_initial` builds the first process.
pub fn set_initproc_slot(slot: usize) {
    *INITPROC_SLOT.acquire() = Some(slot);
}

pub fn initproc_slot() -> usize {
    INITPROC_SLOT.acquire().expect("initproc_slot: boot never called set_initproc_slot")
}

pub fn ticks() -> u64 {
    *TICKS.acquire()
}

/// Slot index of the currently running process. Panics outside process
/// context (e.g. called from the scheduler loop itself between runs).
fn current_slot() -> usize {
    current_running_slot().expect("current_slot: no process is running")
}

pub fn current_pid() -> Pid {
    PTABLE.acquire().get(current_slot()).pid
}

/// Marks the running process `Blocked` with `reason` and hands control back
/// to the scheduler. Returns once some other code has transitioned this
/// slot back to `Ready` and the scheduler has chosen it again.
pub fn block_on(reason: BlockReason) {
    let slot = current_slot();
    {
        let mut t = PTABLE.acquire();
        let p = t.get_mut(slot);
        p.state = ProcState::Blocked;
        p.block_on = reason;
    }
    sched::yield_to_scheduler();
}

/// Moves every process blocked on exactly `reason` to `Ready`. Wakeups are
/// not FIFO (§5): all matching waiters become runnable together and the
/// scheduler's own selection decides who actually runs first.
pub fn wake_all(reason: BlockReason) {
    let mut t = PTABLE.acquire();
    for slot in 0..MAX_PROCS {
        let p = t.get_mut(slot);
        if p.state == ProcState::Blocked && p.block_on == reason {
            p.state = ProcState::Ready;
            p.block_on = BlockReason::Nothing;
        }
    }
}

/// Wakes every `OnSleep` waiter whose deadline has passed.
pub fn wake_sleepers(now: u64) {
    let mut t = PTABLE.acquire();
    for slot in 0..MAX_PROCS {
        let p = t.get_mut(slot);
        if p.state == ProcState::Blocked && p.block_on == BlockReason::OnSleep && p.target_tick <= now {
            p.state = ProcState::Ready;
            p.block_on = BlockReason::Nothing;
        }
    }
}

/// Wakes exactly the process waiting on disk request `req_id` (§4.5: disk
/// completion wakes the requester, not every `OnIdeDisk` waiter).
pub fn wake_request(req_id: usize) {
    let mut t = PTABLE.acquire();
    for slot in 0..MAX_PROCS {
        let p = t.get_mut(slot);
        if p.state == ProcState::Blocked
            && p.block_on == BlockReason::OnIdeDisk
            && p.wait_req == Some(req_id)
        {
            p.state = ProcState::Ready;
            p.block_on = BlockReason::Nothing;
            p.wait_req = None;
        }
    }
}

/// Allocates a process slot, a kernel stack, and a pid, leaving the new
/// process in `Initial` state with an empty address space. Callers (boot's
/// `initproc` loader, `fork`, `exec`'s error paths never call this — only
/// process creation does) fill in `pgdir`/`trap_state` afterward.
fn alloc_slot(slab: &PageSlab, name: &str, timeslice: u32) -> KResult<usize> {
    let kstack = slab.alloc()?;
    let mut t = PTABLE.acquire();
    let slot = match t.procs.iter().position(|p| p.state == ProcState::Unused) {
        Some(s) => s,
        None => {
            drop(t);
            slab.free(kstack);
            return Err(KernelError::TooManyProcs);
        }
    };
    let pid = Pid(t.next_pid);
    t.next_pid += 1;
    let p = t.get_mut(slot);
    *p = Pcb::blank();
    p.pid = pid;
    p.state = ProcState::Initial;
    p.kstack = Some(kstack);
    p.timeslice = timeslice.clamp(1, 16);
    copy_name(&mut p.name, name);
    Ok(slot)
}

/// Writes a fresh `Context` at the top of `slot`'s kernel stack pointing at
/// `arch::x86::trapret`, so the scheduler's first `switch` into a process
/// that has never run lands there instead of into garbage (§4.6). Host
/// tests never run the scheduler and have no real kernel stack to write
/// into, so this is a no-op under `cfg(test)`.
#[cfg(not(test))]
fn init_context(slot: usize) {
    let kstack = PTABLE.acquire().get(slot).kstack.expect("init_context: no kernel stack");
    let top = unsafe { crate::mm::frame_ptr(kstack) } as u32 + PAGE_SIZE as u32;
    let esp = unsafe { crate::arch::x86::prepare_initial_context(top) };
    PTABLE.acquire().get_mut(slot).context_esp = esp;
}

#[cfg(test)]
fn init_context(_slot: usize) {}

/// Builds the very first process from an already-populated address space
/// (the boot loader maps its ELF image before calling this). Returns the
/// new process's ptable slot.
pub fn spawn_initial(
    slab: &PageSlab,
    name: &str,
    timeslice: u32,
    space: AddressSpace,
    entry: u32,
    esp: u32,
) -> KResult<usize> {
    let slot = alloc_slot(slab, name, timeslice)?;
    {
        let mut t = PTABLE.acquire();
        let p = t.get_mut(slot);
        p.image_end = space.brk();
        p.pgdir = Some(space);
        p.trap_state = TrapState::for_user_entry(entry, esp);
        p.state = ProcState::Ready;
    }
    init_context(slot);
    Ok(slot)
}

/// `fork` (§4.6): duplicates `parent_slot`'s address space and trap state
/// into a new `Ready` child, returning the child's pid. `0` for
/// `requested_timeslice` means "inherit the parent's". File descriptor and
/// `cwd` reference-count bumping is the caller's responsibility (typically
/// the syscall-layer wrapper, which already depends on both `proc` and
/// `fs`) — this function only duplicates the raw index array.
pub fn fork(
    parent_slot: usize,
    requested_timeslice: u32,
    slab: &PageSlab,
    frames: &FrameAlloc,
) -> KResult<Pid> {
    let (name, timeslice, heap_high, stack_low, trap_state, files, cwd, image_end) = {
        let t = PTABLE.acquire();
        let parent = t.get(parent_slot);
        let timeslice = if requested_timeslice == 0 {
            parent.timeslice
        } else {
            requested_timeslice.clamp(1, 16)
        };
        (
            parent.name,
            timeslice,
            parent.heap_high(),
            parent.stack_low,
            parent.trap_state,
            parent.files,
            parent.cwd,
            parent.image_end,
        )
    };

    let name_len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    let name_str = core::str::from_utf8(&name[..name_len]).unwrap_or("?");
    let child_slot = alloc_slot(slab, name_str, timeslice)?;
    let rollback = |slot: usize| {
        let mut t = PTABLE.acquire();
        let kstack = t.get_mut(slot).kstack.take();
        *t.get_mut(slot) = Pcb::blank();
        if let Some(k) = kstack {
            drop(t);
            slab.free(k);
        }
    };

    let child_space = match AddressSpace::new(slab, heap_high) {
        Ok(s) => s,
        Err(e) => {
            rollback(child_slot);
            return Err(e);
        }
    };

    let child_pid = {
        let mut t = PTABLE.acquire();
        let (parent, child) = t.two_mut(parent_slot, child_slot);
        let parent_dir = parent.pgdir.as_ref().expect("fork: parent has no address space").directory();
        let child_dir = child_space.directory();
        let heap_high = parent.heap_high();
        if let Err(e) = child_dir.copy_range(slab, frames, parent_dir, USER_BASE, heap_high) {
            Err(e)
        } else if let Err(e) = child_dir.copy_range(slab, frames, parent_dir, stack_low, USER_MAX) {
            Err(e)
        } else {
            child.pgdir = Some(child_space);
            child.trap_state = trap_state;
            child.trap_state.eax = 0; // child sees fork() return 0
            child.stack_low = stack_low;
            child.parent = Some(parent_slot);
            child.files = files;
            child.cwd = cwd;
            child.image_end = image_end;
            child.state = ProcState::Ready;
            Ok(child.pid)
        }
    };

    match child_pid {
        Ok(pid) => {
            init_context(child_slot);
            Ok(pid)
        }
        Err(e) => {
            rollback(child_slot);
            Err(e)
        }
    }
}

/// `exit` (§4.6): reparents every living child to `initproc`, wakes a
/// waiting parent, and marks the caller `Terminated`. Never returns. File
/// and `cwd` reference release is the caller's responsibility for the same
/// layering reason as `fork`.
pub fn exit(slot: usize, initproc_slot: usize) -> ! {
    {
        let mut t = PTABLE.acquire();
        for other in 0..MAX_PROCS {
            if other != slot && t.get(other).parent == Some(slot) && t.get(other).state != ProcState::Unused {
                let was_terminated = t.get(other).state == ProcState::Terminated;
                t.get_mut(other).parent = Some(initproc_slot);
                if was_terminated {
                    wake_parent_waiting(&mut t, initproc_slot);
                }
            }
        }
        if let Some(parent) = t.get(slot).parent {
            wake_parent_waiting(&mut t, parent);
        }
        t.get_mut(slot).state = ProcState::Terminated;
    }
    sched::yield_to_scheduler();
    unreachable!("exit: terminated process resumed");
}

fn wake_parent_waiting(t: &mut ProcTable, parent_slot: usize) {
    let p = t.get_mut(parent_slot);
    if p.state == ProcState::Blocked && p.block_on == BlockReason::OnWait {
        p.state = ProcState::Ready;
        p.block_on = BlockReason::Nothing;
    }
}

/// `wait` (§4.6): reaps the first terminated child it finds, returning its
/// pid, or `-1`/`None` if there are no children left or the caller was
/// killed. Blocks `OnWait` otherwise. The child's kernel stack and address
/// space are released here; file/cwd release already happened at that
/// child's own `exit` (again, the syscall layer's job, mirroring `fork`).
pub fn wait(slot: usize, slab: &PageSlab, frames: &FrameAlloc) -> Option<Pid> {
    loop {
        let (child_slot, has_any_child) = {
            let t = PTABLE.acquire();
            let mut any = false;
            let mut terminated = None;
            for other in 0..MAX_PROCS {
                if t.get(other).parent == Some(slot) && t.get(other).state != ProcState::Unused {
                    any = true;
                    if t.get(other).state == ProcState::Terminated {
                        terminated = Some(other);
                        break;
                    }
                }
            }
            (terminated, any)
        };

        if let Some(child) = child_slot {
            let mut t = PTABLE.acquire();
            let pid = t.get(child).pid;
            let kstack = t.get_mut(child).kstack.take();
            let pgdir = t.get_mut(child).pgdir.take();
            *t.get_mut(child) = Pcb::blank();
            drop(t);
            if let Some(k) = kstack {
                slab.free(k);
            }
            if let Some(space) = pgdir {
                space.destroy(slab, frames, USER_BASE);
            }
            return Some(pid);
        }

        if !has_any_child || PTABLE.acquire().get(slot).killed {
            return None;
        }

        block_on(BlockReason::OnWait);
    }
}

/// Marks the caller `Blocked` on disk request `req_id`, to be woken by
/// `block::BlockQ::on_interrupt` (§4.5). Deliberately does not call
/// `block_on`/`yield_to_scheduler` itself: `BlockQ::submit` calls this
/// while still holding the queue's own lock (interrupts disabled), so the
/// completion interrupt -- which also needs that lock before it can reach
/// the ptable -- can never land in the gap between enqueueing a request
/// and the requester actually blocking on it. The caller drops that lock
/// and yields afterward.
pub fn prepare_disk_wait(req_id: usize) {
    let slot = current_slot();
    let mut t = PTABLE.acquire();
    let p = t.get_mut(slot);
    p.wait_req = Some(req_id);
    p.state = ProcState::Blocked;
    p.block_on = BlockReason::OnIdeDisk;
}

/// `sleep` (§4.6): blocks the caller until `ticks()` reaches `wake_at`.
pub fn sleep(until_tick: u64) {
    let slot = current_slot();
    {
        let mut t = PTABLE.acquire();
        t.get_mut(slot).target_tick = until_tick;
    }
    block_on(BlockReason::OnSleep);
}

/// Page-fault-driven stack growth for the running process (§7 `PageFault`).
/// `fault_addr` is the faulting linear address; a new page is mapped to
/// cover it and `stack_low` lowered to match if doing so stays inside the
/// 4 MiB stack cap and doesn't reach down into the heap, matching the error
/// kind `StackOverflow` already models ("stack growth would meet heap").
/// Any other failure (out of frames, out of page-table slab) propagates as
/// its own kind; the caller terminates the process on any `Err` regardless
/// of which one it is.
pub fn grow_stack(fault_addr: u32, slab: &PageSlab, frames: &FrameAlloc) -> KResult<()> {
    let slot = current_slot();
    let page = fault_addr & !(PAGE_SIZE as u32 - 1);

    let mut t = PTABLE.acquire();
    let p = t.get(slot);
    let old_low = p.stack_low;
    let heap_high = p.heap_high();
    if page < STACK_FLOOR || page >= old_low || page < heap_high {
        return Err(KernelError::StackOverflow);
    }
    let dir = p
        .pgdir
        .as_ref()
        .expect("grow_stack: running process has no address space")
        .directory();
    crate::mm::grow_stack_down(dir, slab, frames, page, old_low)?;
    t.get_mut(slot).stack_low = page;
    Ok(())
}

/// `kill` (§4.6): flags the target; if it is currently blocked, unblocks it
/// immediately so the flag is observed at the next scheduling opportunity
/// rather than only the next voluntary wait. Returns `false` if no such pid
/// exists.
pub fn kill(pid: Pid) -> bool {
    let mut t = PTABLE.acquire();
    let Some(slot) = t.find_by_pid(pid) else {
        return false;
    };
    let p = t.get_mut(slot);
    p.killed = true;
    if p.state == ProcState::Blocked {
        p.state = ProcState::Ready;
        p.block_on = BlockReason::Nothing;
    }
    true
}

/// Advances the global tick counter, wakes due sleepers, and forces the
/// currently running process (if any) back onto the ready queue; called from
/// the timer interrupt handler (§4.6 "timer tick"). This is the only place a
/// process that never voluntarily blocks gets preempted, and the only place
/// `kill` against a *running* process actually takes effect: a process
/// flagged `killed` here exits instead of being demoted back to `Ready`.
pub fn timer_tick() -> u64 {
    let now = {
        let mut t = TICKS.acquire();
        *t += 1;
        *t
    };
    wake_sleepers(now);

    if let Some(slot) = current_running_slot() {
        let killed = PTABLE.acquire().get(slot).killed;
        if killed {
            exit(slot, initproc_slot());
        }

        let demoted = {
            let mut t = PTABLE.acquire();
            let p = t.get_mut(slot);
            if p.state == ProcState::Running {
                p.state = ProcState::Ready;
                true
            } else {
                false
            }
        };
        if demoted {
            sched::yield_to_scheduler();
        }
    }

    now
}

/// `PTABLE`/`TICKS` are true process-wide singletons (§9), unlike the frame
/// and page allocators, which tests construct fresh per-case. Host tests
/// therefore serialize on this guard and reset the shared table before each
/// case, rather than each getting an isolated instance.
#[cfg(test)]
pub fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
pub fn reset_ptable_for_test() {
    *PTABLE.acquire() = ProcTable::new();
    *TICKS.acquire() = 0;
    *INITPROC_SLOT.acquire() = None;
}

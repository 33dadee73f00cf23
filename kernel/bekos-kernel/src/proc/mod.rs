//! Processes and the process manager.
//!
//! The manager owns every [`Process`] in a pid-indexed slot table; pid 0
//! is the adopted boot thread. State machine:
//! `Unready → Stopped → Running → AwaitingDeath`; only `Running`
//! processes are dispatched, and an `AwaitingDeath` slot is reclaimed on
//! the next scheduling pass.
//!
//! All manager state is touched inside interrupt-masked critical
//! sections; a per-process critical-section counter keeps the scheduler
//! from switching away under a kernel critical section. The periodic tick
//! posts a deferred call, so the actual switch always happens at the
//! exception-return safe point, never in interrupt context.

pub mod exec;
pub mod handles;
pub mod sched;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bekos_core::addr::PhysRegion;
use bekos_core::sync::{InterruptGuard, SpinLock};
use bekos_core::{SysError, SysResult};
use bekos_mm::address_space::{MemoryOperation, SpaceManager};
use bekos_mm::{ident, pmm};

use crate::arch::{self, SavedRegs, TRAP_FRAME_SIZE, TrapFrame};
use crate::fs::EntryRef;
use handles::EntityHandle;

/// Pages per kernel stack.
pub const KERNEL_STACK_PAGES: usize = 2;

/// Scheduler tick period: 100 ms.
const SCHEDULER_TICK_NS: u64 = 100_000_000;

/// A process's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created but not yet registered.
    Unready,
    /// Registered; not eligible to run.
    Stopped,
    /// Eligible for dispatch.
    Running,
    /// Exited; the slot is reclaimed on the next scheduling pass.
    AwaitingDeath,
}

/// The userspace half of a process.
pub struct UserspaceState {
    /// Top of the user stack mapping.
    pub user_stack_top: u64,
    /// Current working directory.
    pub cwd: EntryRef,
    /// The process's address space.
    pub space: SpaceManager,
    /// Open entities; closed slots become `None` and ids are
    /// append-mostly.
    pub open_entities: Vec<Option<Arc<dyn EntityHandle>>>,
}

impl UserspaceState {
    /// Installs a handle, returning its id.
    pub fn install_handle(&mut self, handle: Arc<dyn EntityHandle>) -> i64 {
        self.open_entities.push(Some(handle));
        (self.open_entities.len() - 1) as i64
    }

    /// Fetches an open handle.
    ///
    /// # Errors
    ///
    /// `EBADF` for a negative, out-of-range, or closed id.
    pub fn get_handle(&self, id: i64) -> SysResult<Arc<dyn EntityHandle>> {
        if id < 0 {
            return Err(SysError::BadHandle);
        }
        self.open_entities
            .get(id as usize)
            .and_then(Clone::clone)
            .ok_or(SysError::BadHandle)
    }

    /// Closes an open handle.
    ///
    /// # Errors
    ///
    /// `EBADF` as for [`get_handle`](Self::get_handle).
    pub fn close_handle(&mut self, id: i64) -> SysResult<()> {
        if id < 0 {
            return Err(SysError::BadHandle);
        }
        let slot = self
            .open_entities
            .get_mut(id as usize)
            .ok_or(SysError::BadHandle)?;
        if slot.is_none() {
            return Err(SysError::BadHandle);
        }
        *slot = None;
        Ok(())
    }
}

/// One process.
pub struct Process {
    pid: i64,
    name: String,
    parent: Option<i64>,
    kernel_stack: PhysRegion,
    owns_stack: bool,
    /// The suspended context; only meaningful while not running.
    pub saved_regs: SavedRegs,
    preempt_counter: i64,
    time_counter: i64,
    /// Lifecycle state.
    pub state: ProcessState,
    /// Userspace half; `None` for kernel threads.
    pub userspace: Option<UserspaceState>,
}

impl Process {
    /// The process id.
    #[must_use]
    pub fn pid(&self) -> i64 {
        self.pid
    }

    /// The process name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parent's pid, if any.
    #[must_use]
    pub fn parent(&self) -> Option<i64> {
        self.parent
    }

    /// Kernel-virtual top of the kernel stack.
    #[must_use]
    pub fn kernel_stack_top(&self) -> u64 {
        ident::phys_to_virt(self.kernel_stack.end()).as_u64()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // Kernel stacks are freed only here, with the owning process.
        if self.owns_stack {
            pmm::with(|pa| pa.free_region(self.kernel_stack.start));
        }
    }
}

fn allocate_kernel_stack() -> SysResult<PhysRegion> {
    pmm::with(|pa| pa.allocate_region(KERNEL_STACK_PAGES)).ok_or(SysError::NoMemory)
}

// ---------------------------------------------------------------------------
// The manager
// ---------------------------------------------------------------------------

/// The process table and the identity of the running process.
pub struct ProcessManager {
    processes: Vec<Option<Box<Process>>>,
    current: usize,
}

static PROCESS_MANAGER: SpinLock<Option<ProcessManager>> = SpinLock::new(None);

/// Runs `f` on the manager inside an interrupt-masked critical section.
///
/// Masking first means no interrupt can take the core while the lock is
/// held, so on this single-core kernel the lock is always immediately
/// available.
fn with_manager<R>(f: impl FnOnce(&mut ProcessManager) -> R) -> R {
    let _irq = InterruptGuard::new();
    let mut guard = PROCESS_MANAGER.lock();
    f(guard.as_mut().expect("process manager not initialised"))
}

/// Creates the manager and adopts the calling boot thread as pid 0, in
/// `Running` state, on the given stack.
pub fn initialise_and_adopt(name: &str, boot_stack: PhysRegion) {
    let _irq = InterruptGuard::new();
    let mut guard = PROCESS_MANAGER.lock();
    assert!(guard.is_none(), "process manager already initialised");
    let mut processes = Vec::new();
    processes.push(Some(Box::new(Process {
        pid: 0,
        name: String::from(name),
        parent: None,
        kernel_stack: boot_stack,
        owns_stack: false,
        saved_regs: SavedRegs::zeroed(),
        preempt_counter: 0,
        time_counter: 0,
        state: ProcessState::Running,
        userspace: None,
    })));
    *guard = Some(ProcessManager {
        processes,
        current: 0,
    });
}

/// Starts the periodic scheduler tick. The tick posts a deferred call so
/// the switch happens at the exception-return safe point.
pub fn start_scheduler_tick() {
    crate::drivers::timer::schedule_callback(
        |_now| {
            if crate::drivers::irq::deferred::queue_call(|| {
                schedule();
            })
            .is_err()
            {
                bekos_core::kwarn!("sched", "deferred queue full; tick dropped");
            }
            crate::drivers::timer::CallbackAction::Reschedule(SCHEDULER_TICK_NS)
        },
        SCHEDULER_TICK_NS,
    );
}

/// Registers `process`, assigning the first free pid slot. `Unready`
/// processes come out `Stopped`.
fn register_process(mut process: Box<Process>) -> SysResult<i64> {
    with_manager(|manager| {
        let slot = manager
            .processes
            .iter()
            .position(Option::is_none)
            .unwrap_or(manager.processes.len());
        process.pid = slot as i64;
        if process.state == ProcessState::Unready {
            process.state = ProcessState::Stopped;
        }
        if slot == manager.processes.len() {
            manager.processes.push(Some(process));
        } else {
            manager.processes[slot] = Some(process);
        }
        Ok(slot as i64)
    })
}

/// Marks a `Stopped` process `Running`.
///
/// # Errors
///
/// `EINVAL` for an unknown pid or a non-`Stopped` state.
pub fn set_running(pid: i64) -> SysResult<()> {
    with_manager(|manager| {
        let process = manager
            .processes
            .get_mut(pid as usize)
            .and_then(Option::as_mut)
            .ok_or(SysError::InvalidArgument)?;
        if process.state != ProcessState::Stopped {
            return Err(SysError::InvalidArgument);
        }
        process.state = ProcessState::Running;
        Ok(())
    })
}

/// The running process's pid.
#[must_use]
pub fn current_pid() -> i64 {
    with_manager(|manager| manager.current as i64)
}

/// Runs `f` on the current process.
pub fn with_current<R>(f: impl FnOnce(&mut Process) -> R) -> R {
    with_manager(|manager| {
        let current = manager.current;
        let process = manager.processes[current]
            .as_mut()
            .expect("current process slot empty");
        f(process)
    })
}

/// Runs `f` on the current process's userspace state.
///
/// # Errors
///
/// `ENOTSUP` for kernel threads.
pub fn with_current_userspace<R>(
    f: impl FnOnce(&mut UserspaceState) -> SysResult<R>,
) -> SysResult<R> {
    with_current(|process| {
        let userspace = process.userspace.as_mut().ok_or(SysError::NotSupported)?;
        f(userspace)
    })
}

// ---------------------------------------------------------------------------
// Critical sections
// ---------------------------------------------------------------------------

/// Enters a scheduler critical section for the current process.
pub fn enter_critical() {
    with_current(|process| process.preempt_counter += 1);
}

/// Leaves a scheduler critical section.
pub fn exit_critical() {
    with_current(|process| {
        debug_assert!(process.preempt_counter > 0);
        process.preempt_counter -= 1;
    });
}

fn critical_count() -> i64 {
    with_current(|process| process.preempt_counter)
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Runs one scheduling pass, possibly switching away. Returns `false`
/// when a surrounding critical section suppressed the switch.
pub fn schedule() -> bool {
    enter_critical();
    if critical_count() != 1 {
        // Re-entered from inside a kernel critical section.
        exit_critical();
        return false;
    }

    let decision = with_manager(|manager| {
        // Reap exited processes (never the current slot).
        for index in 0..manager.processes.len() {
            if index != manager.current
                && manager.processes[index]
                    .as_ref()
                    .is_some_and(|p| p.state == ProcessState::AwaitingDeath)
            {
                manager.processes[index] = None;
            }
        }

        let current = manager.current;
        if let Some(process) = manager.processes[current].as_mut() {
            process.time_counter = 0;
        }

        let mut entries: Vec<sched::SchedEntry> = manager
            .processes
            .iter()
            .map(|slot| match slot {
                Some(p) => sched::SchedEntry {
                    runnable: p.state == ProcessState::Running,
                    counter: p.time_counter,
                },
                None => sched::SchedEntry {
                    runnable: false,
                    counter: 0,
                },
            })
            .collect();
        let chosen = sched::pick_next(&mut entries)?;
        for (slot, entry) in manager.processes.iter_mut().zip(entries.iter()) {
            if let Some(process) = slot {
                process.time_counter = entry.counter;
            }
        }

        if chosen == current {
            return None;
        }

        let from: *mut SavedRegs = &mut manager.processes[current].as_mut()?.saved_regs;
        let chosen_process = manager.processes[chosen].as_mut()?;
        let to: *const SavedRegs = &chosen_process.saved_regs;
        let user_root = chosen_process
            .userspace
            .as_ref()
            .map(|u| u.space.raw_root_ptr());
        manager.current = chosen;
        Some((from, to, user_root))
    });

    if let Some((from, to, user_root)) = decision {
        if let Some(root) = user_root {
            arch::install_user_table(root);
        }
        // SAFETY: Both contexts live in the pid table, which only the
        // scheduler mutates, and the critical counter is exactly 1.
        unsafe { arch::switch_context(from, to) };
    }
    exit_critical();
    true
}

/// Terminates the current process.
pub fn exit_current(code: i32) -> ! {
    bekos_core::kinfo!("proc", "pid {} exited with code {}", current_pid(), code);
    with_current(|process| process.state = ProcessState::AwaitingDeath);
    loop {
        schedule();
        // Nothing else runnable wanted the CPU; idle until the tick.
        arch::wait_for_interrupt();
    }
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Spawns a kernel thread running `entry(arg)`. The new process is
/// `Stopped` until [`set_running`].
///
/// # Errors
///
/// `ENOMEM` if the kernel stack cannot be allocated.
pub fn spawn_kernel_process(name: &str, entry: fn(usize), arg: usize) -> SysResult<i64> {
    let stack = allocate_kernel_stack()?;
    let stack_top = ident::phys_to_virt(stack.end()).as_u64();

    let mut process = Box::new(Process {
        pid: -1,
        name: String::from(name),
        parent: None,
        kernel_stack: stack,
        owns_stack: true,
        saved_regs: SavedRegs::zeroed(),
        preempt_counter: 0,
        time_counter: 0,
        state: ProcessState::Unready,
        userspace: None,
    });
    arch::prepare_kernel_entry(&mut process.saved_regs, entry as usize, arg, stack_top);
    register_process(process)
}

/// Spawns a user process from an executable entry. The new process is
/// `Stopped` until [`set_running`].
///
/// # Errors
///
/// `ENOEXEC`/`ENOTSUP` for a bad image, `ENOMEM` for allocation failures.
pub fn spawn_user_process(
    name: &str,
    executable: &EntryRef,
    cwd: EntryRef,
    handles: Vec<Option<Arc<dyn EntityHandle>>>,
) -> SysResult<i64> {
    // Pull the whole image into kernel memory for parsing.
    let size = executable.size() as usize;
    let mut image = alloc::vec![0u8; size];
    let read = executable.read(0, &mut image)?;
    if read < size {
        return Err(SysError::NotExecutable);
    }
    let elf = bekos_elf::ElfFile::parse(&image).map_err(|_| SysError::NotExecutable)?;

    let mut space = SpaceManager::create()?;
    let loaded = exec::load_into(&elf, name, &mut space)?;

    let stack_region = exec::suggested_stack(&loaded);
    space.allocate_placed_region(
        stack_region,
        MemoryOperation::READ | MemoryOperation::WRITE,
        String::from("stack"),
    )?;

    let stack = allocate_kernel_stack()?;
    let kernel_stack_top = ident::phys_to_virt(stack.end()).as_u64();

    let mut process = Box::new(Process {
        pid: -1,
        name: String::from(name),
        parent: None,
        kernel_stack: stack,
        owns_stack: true,
        saved_regs: SavedRegs::zeroed(),
        preempt_counter: 0,
        time_counter: 0,
        state: ProcessState::Unready,
        userspace: Some(UserspaceState {
            user_stack_top: stack_region.end(),
            cwd,
            space,
            open_entities: handles,
        }),
    });
    arch::prepare_user_first_entry(
        &mut process.saved_regs,
        loaded.entry_point,
        stack_region.end(),
        kernel_stack_top,
    );
    register_process(process)
}

/// Forks the current process.
///
/// The tail of the parent's kernel stack holding the EL0 trap frame is
/// copied byte-for-byte to the child's stack, the child's saved `x0`
/// becomes 0, and the child's context resumes at the return-from-fork
/// trampoline. The parent receives the child's pid.
///
/// # Errors
///
/// `ENOTSUP` from a kernel thread, `ENOMEM` on allocation failure.
pub fn sys_fork() -> SysResult<i64> {
    let child_stack = allocate_kernel_stack()?;
    let child_stack_top = ident::phys_to_virt(child_stack.end()).as_u64();

    let mut child = with_current(|parent| -> SysResult<Box<Process>> {
        let userspace = parent.userspace.as_ref().ok_or(SysError::NotSupported)?;

        let child_userspace = UserspaceState {
            user_stack_top: userspace.user_stack_top,
            cwd: userspace.cwd.clone(),
            space: userspace.space.clone_for_fork()?,
            open_entities: userspace.open_entities.clone(),
        };

        // Copy the trap frame the syscall entry pushed at the top of the
        // parent's kernel stack.
        let parent_frame = parent.kernel_stack_top() - TRAP_FRAME_SIZE as u64;
        let child_frame = child_stack_top - TRAP_FRAME_SIZE as u64;
        // SAFETY: Both stacks are live identity-window allocations and
        // the frame is within each by construction.
        unsafe {
            core::ptr::copy_nonoverlapping(
                parent_frame as *const u8,
                child_frame as *mut u8,
                TRAP_FRAME_SIZE,
            );
            // The child observes fork() == 0.
            (*(child_frame as *mut TrapFrame)).x[0] = 0;
        }

        Ok(Box::new(Process {
            pid: -1,
            name: parent.name.clone(),
            parent: Some(parent.pid),
            kernel_stack: child_stack,
            owns_stack: true,
            saved_regs: SavedRegs::zeroed(),
            preempt_counter: 0,
            time_counter: 0,
            state: ProcessState::Unready,
            userspace: Some(child_userspace),
        }))
    })?;

    let child_frame = child_stack_top - TRAP_FRAME_SIZE as u64;
    arch::prepare_fork_child(&mut child.saved_regs, child_frame);

    let pid = register_process(child)?;
    set_running(pid)?;
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn init() {
        INIT.call_once(|| {
            crate::test_support::init_test_pmm();
            let stack = pmm::with(|pa| pa.allocate_region(KERNEL_STACK_PAGES)).unwrap();
            initialise_and_adopt("boot", stack);
        });
    }

    fn noop_entry(_arg: usize) {}

    #[test]
    fn adopted_thread_is_pid_zero_and_running() {
        init();
        assert_eq!(current_pid(), 0);
        with_current(|p| {
            assert_eq!(p.pid(), 0);
            assert_eq!(p.state, ProcessState::Running);
            assert!(p.userspace.is_none());
        });
    }

    #[test]
    fn kernel_spawn_assigns_pids_and_stops() {
        init();
        let pid = spawn_kernel_process("worker", noop_entry, 7).unwrap();
        assert!(pid >= 1);
        with_manager(|m| {
            let p = m.processes[pid as usize].as_ref().unwrap();
            assert_eq!(p.state, ProcessState::Stopped);
            assert_eq!(p.name(), "worker");
            // The prepared context targets the fresh stack.
            assert_eq!(p.saved_regs.sp, p.kernel_stack_top());
        });
        set_running(pid).unwrap();
        with_manager(|m| {
            assert_eq!(
                m.processes[pid as usize].as_ref().unwrap().state,
                ProcessState::Running
            );
        });
        // Mark it dead again so other tests see a quiet table.
        with_manager(|m| {
            m.processes[pid as usize].as_mut().unwrap().state = ProcessState::AwaitingDeath;
        });
    }

    #[test]
    fn set_running_rejects_bad_states() {
        init();
        assert_eq!(set_running(9999), Err(SysError::InvalidArgument));
        // pid 0 is already Running.
        assert_eq!(set_running(0), Err(SysError::InvalidArgument));
    }

    #[test]
    fn critical_sections_nest() {
        init();
        enter_critical();
        enter_critical();
        assert_eq!(critical_count(), 2);
        exit_critical();
        assert_eq!(critical_count(), 1);
        exit_critical();
        assert_eq!(critical_count(), 0);
    }

    #[test]
    fn schedule_suppressed_inside_critical_section() {
        init();
        enter_critical();
        assert!(!schedule());
        exit_critical();
    }

    #[test]
    fn handle_table_append_and_close() {
        let file = crate::fs::MemEntry::file("f", Vec::new());
        let mut state = UserspaceState {
            user_stack_top: 0,
            cwd: crate::fs::MemEntry::dir(""),
            space: {
                init();
                SpaceManager::create().unwrap()
            },
            open_entities: Vec::new(),
        };
        let a = state.install_handle(handles::FileHandle::new(file.clone()));
        let b = state.install_handle(handles::FileHandle::new(file));
        assert_eq!((a, b), (0, 1));
        assert!(state.get_handle(0).is_ok());

        state.close_handle(0).unwrap();
        assert_eq!(state.get_handle(0).err(), Some(SysError::BadHandle));
        assert_eq!(state.close_handle(0).err(), Some(SysError::BadHandle));
        // Closed ids are not reused: the table is append-mostly.
        let c = state.install_handle(state.get_handle(1).unwrap());
        assert_eq!(c, 2);
        assert_eq!(state.get_handle(-1).err(), Some(SysError::BadHandle));
    }
}

//! Process syscalls: pid, fork, sleep, exit.

use bekos_core::SysResult;

use crate::proc;

pub fn sys_get_pid() -> SysResult<i64> {
    Ok(proc::current_pid())
}

pub fn sys_fork() -> SysResult<i64> {
    proc::sys_fork()
}

/// Blocks the calling process until the requested number of nanoseconds
/// elapse. Implemented as a spin against the timer device.
pub fn sys_sleep(nanoseconds: u64) -> SysResult<i64> {
    crate::drivers::timer::spindelay_us(nanoseconds.div_ceil(1_000));
    Ok(0)
}

pub fn sys_exit(code: u64) -> SysResult<i64> {
    proc::exit_current(code as i32);
}

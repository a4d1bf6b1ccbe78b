//! C7 — Thread discovery and status.
//!
//! Walks the interpreter's thread-state linked list and classifies each
//! thread's run state (holds the GIL, wants the GIL, is running on a CPU).
//!
//! Grounded on
//! `examples/original_source/Modules/_remote_debugging/threads.c`
//! (`iterate_threads`, `unwind_stack_for_thread`'s status-flag computation)
//! for the offset layout and the HAS_GIL/GIL_REQUESTED mutual-exclusion
//! invariant, and on
//! `examples/benfred-py-spy/remoteprocess/src/linux/mod.rs::Thread::active`
//! for the `/proc/<pid>/task/<tid>/stat` state-character parsing idiom
//! (CPython's own `get_thread_status` does the identical parse against the
//! same file, just inline in C).

use crate::error::Result;
use crate::memory::Target;
use crate::types::{DebugOffsets, Mode, Pid, StatusFlags};

pub struct ThreadState {
    pub address: u64,
    pub native_thread_id: u64,
    pub pthread_id: u64,
    pub current_frame: u64,
    pub status_flags: StatusFlags,
}

/// Walks the thread-state linked list starting at the interpreter's main
/// thread pointer, following `thread_state.next` until null, matching
/// `iterate_threads`. The OS run-state probe only runs when `mode` requires
/// it, and a thread `mode` says to skip is omitted from the result entirely,
/// per spec §4.6's Mode table.
pub fn iterate_threads(
    target: &Target,
    offsets: &DebugOffsets,
    pid: Pid,
    interpreter_addr: u64,
    mode: Mode,
) -> Result<Vec<ThreadState>> {
    let mut out = Vec::new();
    let mut addr = target.read_u64(interpreter_addr + offsets.interpreter_state.threads_head)?;

    const MAX_THREADS: usize = 4096;
    let mut count = 0;
    while addr != 0 && count < MAX_THREADS {
        count += 1;
        let this_addr = addr;
        let ts = &offsets.thread_state;

        let native_thread_id = target.read_u64(this_addr + ts.native_thread_id)?;
        let pthread_id = target.read_u64(this_addr + ts.thread_id)?;
        let current_frame = target.read_u64(this_addr + ts.current_frame)?;

        let has_gil = target.read_struct::<i32>(this_addr + ts.holds_gil)? != 0;
        let gil_requested = if ts.gil_requested != 0 {
            target.read_struct::<i32>(this_addr + ts.gil_requested)? != 0
        } else {
            false
        };

        let mut flags = StatusFlags::empty();
        if has_gil {
            flags.insert(StatusFlags::HAS_GIL);
        } else if gil_requested {
            flags.insert(StatusFlags::GIL_REQUESTED);
        }

        if mode.probes_os() {
            match native_cpu_state(pid, native_thread_id) {
                CpuState::Running => flags.insert(StatusFlags::ON_CPU),
                CpuState::Idle => {}
                CpuState::Unknown => flags.insert(StatusFlags::UNKNOWN),
            }
        }

        addr = target.read_u64(this_addr + ts.next)?;

        if mode.skip(flags) {
            continue;
        }

        out.push(ThreadState {
            address: this_addr,
            native_thread_id,
            pthread_id,
            current_frame,
            status_flags: flags,
        });
    }

    Ok(out)
}

enum CpuState {
    Running,
    Idle,
    Unknown,
}

#[cfg(target_os = "linux")]
fn native_cpu_state(pid: Pid, tid: u64) -> CpuState {
    let path = format!("/proc/{}/task/{}/stat", pid, tid);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return CpuState::Unknown,
    };
    // The comm field is parenthesized and may itself contain spaces or
    // parens, so the state char is the first field after the *last* ')'.
    let after_comm = match contents.rfind(')') {
        Some(idx) => &contents[idx + 1..],
        None => return CpuState::Unknown,
    };
    match after_comm.trim_start().chars().next() {
        Some('R') => CpuState::Running,
        Some('S') | Some('D') | Some('T') | Some('Z') | Some('I') => CpuState::Idle,
        _ => CpuState::Unknown,
    }
}

#[cfg(not(target_os = "linux"))]
fn native_cpu_state(_pid: Pid, _tid: u64) -> CpuState {
    CpuState::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn current_process_main_thread_is_known() {
        let pid = std::process::id() as Pid;
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u64;
        match native_cpu_state(pid, tid) {
            CpuState::Running | CpuState::Idle => {}
            CpuState::Unknown => panic!("expected a known state for our own thread"),
        }
    }
}

//! Collector orchestration: drives C1->C10 for one target process, one
//! sample at a time, and runs the background sampling loop used by
//! `record`/`top`-style commands.
//!
//! Grounded on `examples/benfred-py-spy/src/sampler.rs::Sampler` (a
//! dedicated OS thread driven by `Timer`, communicating results back over
//! `std::sync::mpsc`) and `examples/benfred-py-spy/src/python_spy.rs`
//! (`PythonSpy::new`/`get_stack_traces`: locate the target's debug metadata
//! once at attach time, then re-walk its threads on every sample).

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use crate::asyncio_walker;
use crate::code_cache::TlbcCache;
use crate::error::{CoreError, Kind, Result};
use crate::frame_cache::FrameCache;
use crate::frame_walker::{self, CodeObjectCache};
use crate::memory::Target;
use crate::subprocess;
use crate::threads;
use crate::timer::Timer;
use crate::types::{AsyncioOffsets, DebugOffsets, InterpreterInfo, Mode, Pid, TaskInfo, ThreadInfo};

/// Reads a sequence of native-endian `u64` fields out of a byte buffer,
/// advancing a cursor. Used to deserialize the `DebugOffsets`/
/// `AsyncioOffsets` blob the target publishes at a well-known address
/// (spec §3: "read once per attach from a well-known address in the
/// target"); the exact C struct layout behind that address is module/
/// section-lookup detail spec §1 scopes out, so this crate defines its own
/// flat, versioned field order (matching the declaration order of the
/// `offsets_struct!` groups in `src/types.rs`) as the contract between
/// whatever publishes the section and this reader.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Cursor<'a> {
        Cursor { data, pos: 0 }
    }

    fn next_u64(&mut self) -> Result<u64> {
        let end = self.pos + 8;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| CoreError::new(Kind::OffsetValidationFailed, "debug offsets blob truncated"))?;
        self.pos = end;
        Ok(u64::from_ne_bytes(bytes.try_into().unwrap()))
    }
}

/// One flat blob size for the whole `DebugOffsets` record (spec §3's
/// fourteen offset groups, the version triple, and the three standalone
/// TLBC offsets), in u64 units.
pub const DEBUG_OFFSETS_BLOB_LEN_U64: usize = 68;
pub const ASYNCIO_OFFSETS_BLOB_LEN_U64: usize = 13;

/// Parses the raw bytes at the target's `PyRuntime`-equivalent section into
/// a `DebugOffsets`, following the field order declared in `src/types.rs`.
pub fn parse_debug_offsets(data: &[u8]) -> Result<DebugOffsets> {
    let mut c = Cursor::new(data);
    let major = c.next_u64()? as u8;
    let minor = c.next_u64()? as u8;
    let micro = c.next_u64()? as u8;

    let mut offsets = DebugOffsets {
        version: crate::version::TargetVersion::from_bytes(major, minor, micro),
        ..Default::default()
    };

    offsets.runtime_state.size = c.next_u64()?;
    offsets.runtime_state.finalizing = c.next_u64()?;
    offsets.runtime_state.interpreters_head = c.next_u64()?;
    offsets.runtime_state.gc = c.next_u64()?;

    offsets.interpreter_state.size = c.next_u64()?;
    offsets.interpreter_state.threads_head = c.next_u64()?;
    offsets.interpreter_state.threads_main = c.next_u64()?;
    offsets.interpreter_state.gc = c.next_u64()?;
    offsets.interpreter_state.modules = c.next_u64()?;
    offsets.interpreter_state.id = c.next_u64()?;

    offsets.thread_state.size = c.next_u64()?;
    offsets.thread_state.prev = c.next_u64()?;
    offsets.thread_state.next = c.next_u64()?;
    offsets.thread_state.interp = c.next_u64()?;
    offsets.thread_state.native_thread_id = c.next_u64()?;
    offsets.thread_state.thread_id = c.next_u64()?;
    offsets.thread_state.datastack_chunk = c.next_u64()?;
    offsets.thread_state.current_frame = c.next_u64()?;
    offsets.thread_state.status = c.next_u64()?;
    offsets.thread_state.holds_gil = c.next_u64()?;
    offsets.thread_state.gil_requested = c.next_u64()?;

    offsets.interpreter_frame.size = c.next_u64()?;
    offsets.interpreter_frame.previous = c.next_u64()?;
    offsets.interpreter_frame.executable = c.next_u64()?;
    offsets.interpreter_frame.instr_ptr = c.next_u64()?;
    offsets.interpreter_frame.localsplus = c.next_u64()?;
    offsets.interpreter_frame.owner = c.next_u64()?;

    offsets.code_object.size = c.next_u64()?;
    offsets.code_object.filename = c.next_u64()?;
    offsets.code_object.qualname = c.next_u64()?;
    offsets.code_object.linetable = c.next_u64()?;
    offsets.code_object.firstlineno = c.next_u64()?;
    offsets.code_object.argcount = c.next_u64()?;
    offsets.code_object.co_code_adaptive = c.next_u64()?;

    offsets.gen_object.size = c.next_u64()?;
    offsets.gen_object.gi_iframe = c.next_u64()?;
    offsets.gen_object.gi_frame_state = c.next_u64()?;
    offsets.gen_object.gi_task = c.next_u64()?;

    offsets.pyobject.size = c.next_u64()?;
    offsets.pyobject.ob_type = c.next_u64()?;

    offsets.type_object.size = c.next_u64()?;
    offsets.type_object.tp_name = c.next_u64()?;
    offsets.type_object.tp_flags = c.next_u64()?;

    offsets.long_object.size = c.next_u64()?;
    offsets.long_object.ob_digit = c.next_u64()?;
    offsets.long_object.lv_tag = c.next_u64()?;

    offsets.unicode_object.size = c.next_u64()?;
    offsets.unicode_object.state = c.next_u64()?;
    offsets.unicode_object.length = c.next_u64()?;
    offsets.unicode_object.asciiobject_size = c.next_u64()?;

    offsets.bytes_object.size = c.next_u64()?;
    offsets.bytes_object.ob_size = c.next_u64()?;
    offsets.bytes_object.ob_sval = c.next_u64()?;

    offsets.set_object.size = c.next_u64()?;
    offsets.set_object.used = c.next_u64()?;
    offsets.set_object.mask = c.next_u64()?;
    offsets.set_object.table = c.next_u64()?;

    offsets.llist_node.size = c.next_u64()?;
    offsets.llist_node.next = c.next_u64()?;
    offsets.llist_node.prev = c.next_u64()?;

    offsets.gc_runtime_state.size = c.next_u64()?;
    offsets.gc_runtime_state.collecting = c.next_u64()?;

    offsets.interpreter_frame_tlbc_index = c.next_u64()?;
    offsets.code_object_co_tlbc = c.next_u64()?;
    offsets.interpreter_state_tlbc_generation = c.next_u64()?;

    offsets.validate()?;
    Ok(offsets)
}

pub fn parse_asyncio_offsets(data: &[u8]) -> Result<AsyncioOffsets> {
    let mut c = Cursor::new(data);
    let mut offsets = AsyncioOffsets::default();

    offsets.task_object.size = c.next_u64()?;
    offsets.task_object.task_name = c.next_u64()?;
    offsets.task_object.task_awaited_by = c.next_u64()?;
    offsets.task_object.task_is_task = c.next_u64()?;
    offsets.task_object.task_awaited_by_is_set = c.next_u64()?;
    offsets.task_object.task_coro = c.next_u64()?;
    offsets.task_object.task_node = c.next_u64()?;

    offsets.interpreter_state.size = c.next_u64()?;
    offsets.interpreter_state.asyncio_tasks_head = c.next_u64()?;

    offsets.thread_state.size = c.next_u64()?;
    offsets.thread_state.asyncio_running_loop = c.next_u64()?;
    offsets.thread_state.asyncio_running_task = c.next_u64()?;
    offsets.thread_state.asyncio_tasks_head = c.next_u64()?;

    Ok(offsets)
}

/// Binary hints tried in order by `find_section`, mirroring how
/// `benfred-py-spy`'s `PythonSpy::new` first checks the interpreter's own
/// executable and then its loaded `libpython` shared object.
fn binary_hints(target_exe: &str) -> Vec<String> {
    vec![target_exe.to_string()]
}

/// Everything needed to keep sampling one target process: its debug
/// offsets, memory gateway, and the per-thread caches that make repeated
/// samples cheap.
pub struct Attached {
    pub pid: Pid,
    pub target: Target,
    pub offsets: DebugOffsets,
    pub asyncio_offsets: Option<AsyncioOffsets>,
    mode: Mode,
    code_cache: CodeObjectCache,
    tlbc_cache: TlbcCache,
    frame_cache: FrameCache,
}

impl Attached {
    /// Attaches to `pid`: locates and parses its `DebugOffsets` blob and
    /// (best-effort) its `AsyncioOffsets` blob, following
    /// `PythonSpy::new`'s "locate metadata once, reuse it for every sample"
    /// shape. `mode` controls C7's per-sample OS-probe-and-skip policy
    /// (spec §4.6).
    pub fn new(pid: Pid, target_exe: &str, mode: Mode) -> Result<Attached> {
        let target = Target::new(pid);
        let hints = binary_hints(target_exe);

        let debug_addr = target.find_section("PyRuntime", &hints)?;
        let raw = target.read(debug_addr, DEBUG_OFFSETS_BLOB_LEN_U64 * 8)?;
        let offsets = parse_debug_offsets(&raw)?;

        let asyncio_offsets = target
            .find_section("AsyncioDebug", &hints)
            .ok()
            .and_then(|addr| target.read(addr, ASYNCIO_OFFSETS_BLOB_LEN_U64 * 8).ok())
            .and_then(|raw| parse_asyncio_offsets(&raw).ok());

        Ok(Attached {
            pid,
            target,
            offsets,
            asyncio_offsets,
            mode,
            code_cache: CodeObjectCache::new(),
            tlbc_cache: TlbcCache::new(),
            frame_cache: FrameCache::new(),
        })
    }

    /// Walks every thread of the target's single interpreter and resolves
    /// each thread's current call stack, matching
    /// `PythonSpy::get_stack_traces`'s per-sample flow: invalidate the page
    /// cache (spec §4.1: coherency only guaranteed within one sample), find
    /// live threads, walk each one, and drop any frame-cache entries for
    /// threads that no longer exist.
    pub fn sample(&mut self) -> Result<Vec<InterpreterInfo>> {
        self.target.invalidate();

        let interp_addr = self
            .target
            .read_u64(self.offsets.runtime_state.interpreters_head)?;
        let interpreter_id = self
            .target
            .read_struct::<u32>(interp_addr + self.offsets.interpreter_state.id)
            .unwrap_or(0);

        let tlbc_generation = self.read_tlbc_generation(interp_addr);
        let thread_states = threads::iterate_threads(&self.target, &self.offsets, self.pid, interp_addr, self.mode)?;

        let mut live_ids = Vec::with_capacity(thread_states.len());
        let mut out_threads = Vec::with_capacity(thread_states.len());

        for ts in &thread_states {
            live_ids.push(ts.native_thread_id);

            let frames = if let Some(cached) = self.frame_cache.full_hit(ts.native_thread_id, ts.current_frame) {
                cached.to_vec()
            } else {
                let (addrs, walked) = frame_walker::walk_frame_chain_with_addrs(
                    &self.target,
                    &self.offsets,
                    &mut self.code_cache,
                    &mut self.tlbc_cache,
                    tlbc_generation,
                    ts.current_frame,
                    None,
                )?;
                self.frame_cache.store(ts.native_thread_id, addrs, walked.clone());
                walked
            };

            out_threads.push(ThreadInfo {
                thread_id: ts.native_thread_id,
                status_flags: ThreadInfo::normalize_status(ts.status_flags),
                frames,
            });
        }

        self.frame_cache.invalidate_stale(&live_ids);

        Ok(vec![InterpreterInfo {
            interpreter_id,
            threads: out_threads,
        }])
    }

    /// Builds the asyncio task graph rooted at every task registered on the
    /// interpreter, per spec §4.8; returns an empty list when the target
    /// doesn't publish `AsyncioOffsets` (older/stripped builds).
    pub fn sample_asyncio_tasks(&mut self) -> Result<Vec<TaskInfo>> {
        let Some(async_offsets) = self.asyncio_offsets.clone() else {
            return Ok(Vec::new());
        };

        let interp_addr = self
            .target
            .read_u64(self.offsets.runtime_state.interpreters_head)?;
        let tasks_head = self
            .target
            .read_u64(interp_addr + async_offsets.interpreter_state.asyncio_tasks_head)?;

        if tasks_head == 0 {
            return Ok(Vec::new());
        }

        let tlbc_generation = self.read_tlbc_generation(interp_addr);

        Ok(vec![asyncio_walker::walk_task_tree(
            &self.target,
            &self.offsets,
            &async_offsets,
            &mut self.code_cache,
            &mut self.tlbc_cache,
            tlbc_generation,
            tasks_head,
        )?])
    }

    /// Re-read every sample (spec §3's TLBC entry: "a generation mismatch
    /// invalidates the entry on next lookup"). Zero on a GIL-enabled target,
    /// where `tlbc_index` is always 0 too, so the cache is never consulted
    /// there regardless of this value.
    fn read_tlbc_generation(&self, interp_addr: u64) -> u32 {
        if self.offsets.interpreter_state_tlbc_generation == 0 {
            return 0;
        }
        self.target
            .read_struct::<u32>(interp_addr + self.offsets.interpreter_state_tlbc_generation)
            .unwrap_or(0)
    }
}

/// One tick of the background sampling loop.
pub struct Sample {
    pub interpreters: Vec<InterpreterInfo>,
    pub timestamp_us: u64,
    pub error: Option<CoreError>,
    pub late: Option<Duration>,
}

/// Runs `Attached::sample` on a dedicated OS thread at `sampling_rate`
/// samples/sec, delivering results over a channel, matching
/// `Sampler::new_sampler`'s shape (a thread that owns the target handle
/// plus an mpsc channel back to the caller).
pub struct Collector {
    rx: Option<Receiver<Sample>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Collector {
    pub fn spawn(pid: Pid, target_exe: String, sampling_rate: u64, start_time_us: u64, mode: Mode) -> Result<Collector> {
        let mut attached = Attached::new(pid, &target_exe, mode)?;
        let (tx, rx): (Sender<Sample>, Receiver<Sample>) = mpsc::channel();

        let handle = thread::spawn(move || {
            for sleep in Timer::new(sampling_rate as f64) {
                let timestamp_us = start_time_us + sleep.as_ref().map(|d| d.as_micros() as u64).unwrap_or(0);
                let late = sleep.err();

                let (interpreters, error) = match attached.sample() {
                    Ok(interpreters) => (interpreters, None),
                    Err(e) => (Vec::new(), Some(e)),
                };

                if tx.send(Sample { interpreters, timestamp_us, error, late }).is_err() {
                    break;
                }
            }
        });

        Ok(Collector { rx: Some(rx), handle: Some(handle) })
    }
}

impl Iterator for Collector {
    type Item = Sample;
    fn next(&mut self) -> Option<Sample> {
        self.rx.as_ref().unwrap().recv().ok()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.rx = None;
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Finds subprocesses of `pid` per spec §4.7, honoring `--subprocesses`/
/// `--recursive`.
pub fn discover_subprocess_pids(pid: Pid, recursive: bool) -> Vec<Pid> {
    subprocess::find_children(pid, recursive)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_ne_bytes());
    }

    #[test]
    fn parse_debug_offsets_rejects_truncated_blob() {
        let buf = vec![0u8; 8];
        assert!(parse_debug_offsets(&buf).is_err());
    }

    #[test]
    fn parse_debug_offsets_round_trips_a_well_formed_blob() {
        let mut buf = Vec::new();
        push_u64(&mut buf, 3);
        push_u64(&mut buf, 13);
        push_u64(&mut buf, 1);

        // runtime_state
        push_u64(&mut buf, 64);
        push_u64(&mut buf, 8);
        push_u64(&mut buf, 16);
        push_u64(&mut buf, 24);
        // interpreter_state
        push_u64(&mut buf, 64);
        push_u64(&mut buf, 8);
        push_u64(&mut buf, 16);
        push_u64(&mut buf, 24);
        push_u64(&mut buf, 32);
        push_u64(&mut buf, 40);
        // thread_state
        push_u64(&mut buf, 128);
        for v in [8u64, 16, 24, 32, 40, 48, 56, 64, 72, 80] {
            push_u64(&mut buf, v);
        }
        // interpreter_frame
        push_u64(&mut buf, 64);
        for v in [8u64, 16, 24, 32, 40] {
            push_u64(&mut buf, v);
        }
        // code_object
        push_u64(&mut buf, 128);
        for v in [8u64, 16, 24, 32, 40, 48] {
            push_u64(&mut buf, v);
        }
        // gen_object
        push_u64(&mut buf, 64);
        for v in [8u64, 16, 24] {
            push_u64(&mut buf, v);
        }
        // pyobject
        push_u64(&mut buf, 16);
        push_u64(&mut buf, 8);
        // type_object
        push_u64(&mut buf, 64);
        push_u64(&mut buf, 8);
        push_u64(&mut buf, 16);
        // long_object
        push_u64(&mut buf, 32);
        push_u64(&mut buf, 8);
        push_u64(&mut buf, 16);
        // unicode_object
        push_u64(&mut buf, 64);
        push_u64(&mut buf, 8);
        push_u64(&mut buf, 16);
        push_u64(&mut buf, 24);
        // bytes_object
        push_u64(&mut buf, 32);
        push_u64(&mut buf, 8);
        push_u64(&mut buf, 16);
        // set_object
        push_u64(&mut buf, 32);
        push_u64(&mut buf, 8);
        push_u64(&mut buf, 16);
        push_u64(&mut buf, 24);
        // llist_node
        push_u64(&mut buf, 16);
        push_u64(&mut buf, 8);
        push_u64(&mut buf, 0);
        // gc_runtime_state
        push_u64(&mut buf, 16);
        push_u64(&mut buf, 8);
        // standalone TLBC offsets
        push_u64(&mut buf, 96);
        push_u64(&mut buf, 104);
        push_u64(&mut buf, 48);

        let offsets = parse_debug_offsets(&buf).unwrap();
        assert_eq!(offsets.version.major, 3);
        assert_eq!(offsets.version.minor, 13);
        assert_eq!(offsets.thread_state.native_thread_id, 32);
        assert_eq!(offsets.interpreter_frame_tlbc_index, 96);
        assert_eq!(offsets.code_object_co_tlbc, 104);
        assert_eq!(offsets.interpreter_state_tlbc_generation, 48);
    }
}

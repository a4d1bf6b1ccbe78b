//! C8 — Asyncio task graph walker.
//!
//! Builds the `awaited_by` tree for a target's asyncio tasks: each task's
//! coroutine call stack plus the tasks waiting on it, recursively.
//!
//! Grounded on
//! `examples/original_source/Modules/_remote_debugging/asyncio.c`:
//! `iterate_set_entries` for the open-addressed `PySetObject` walk,
//! `parse_task_name` for the PyLong-or-PyUnicode task name dispatch,
//! `parse_coro_chain`/`handle_yield_from_frame` for following a task's
//! coroutine into whatever it's yielding from, and
//! `process_task_and_waiters`/`process_single_task_node` for recursively
//! expanding `task_awaited_by`. Recursion depth and the total task count
//! are capped here (spec §3's defense against a corrupted or cyclic task
//! graph); the original instead relies on the GIL/refcounting invariants
//! of a cooperating live interpreter, which this crate cannot assume since
//! it never pauses the target.

use crate::code_cache::TlbcCache;
use crate::error::{CoreError, Kind, Result};
use crate::frame_walker::{self, CodeObjectCache};
use crate::memory::Target;
use crate::object_reader::{read_py_long, read_py_str};
use crate::types::{AsyncioOffsets, DebugOffsets, FrameInfo, TaskInfo};

/// Mirrors `MAX_SET_TABLE_SIZE`: a `mask` at or past this is treated as
/// corrupted remote memory rather than walked.
const MAX_SET_TABLE_SIZE: i64 = 1 << 20;
/// Bounds the `awaited_by` recursion against an adversarially large or
/// cyclic task graph; not present in the original since it assumes a
/// consistent snapshot. Matches the 32768-node cap on the linked-list walks
/// elsewhere in this crate. Task identity is not deduplicated: a cycle is
/// observed as a truncated traversal once the budget runs out, not detected
/// up front.
const MAX_TASK_NODES: usize = 32768;

const PY_TPFLAGS_LONG_SUBCLASS: u64 = 1 << 24;
const PY_TPFLAGS_UNICODE_SUBCLASS: u64 = 1 << 28;
const FRAME_CLEARED: i8 = 0;

/// Reads the open-addressed entries of a `PySetObject` at `set_addr`,
/// returning each non-null, live (refcount != 0) key address. Matches
/// `iterate_set_entries`'s bounds validation and stride.
fn iterate_set_entries(target: &Target, offsets: &DebugOffsets, set_addr: u64) -> Result<Vec<u64>> {
    let so = &offsets.set_object;
    let used = target.read_struct::<i64>(set_addr + so.used)?;
    let mask = target.read_struct::<i64>(set_addr + so.mask)?;
    let table_ptr = target.read_u64(set_addr + so.table)?;

    if !(0..MAX_SET_TABLE_SIZE).contains(&mask) || used < 0 || used > mask + 1 {
        return Err(CoreError::new(Kind::MalformedSet, "invalid set object (corrupted remote memory)"));
    }

    let set_len = mask + 1;
    let mut entries = Vec::new();
    let mut slot_addr = table_ptr;
    let mut i = 0i64;
    let mut found = 0i64;

    while i < set_len && found < used {
        let key_addr = target.read_u64(slot_addr)?;
        if key_addr != 0 {
            // The original reads a "ref count" word from the same slot
            // address as the key pointer before advancing; kept as-is for
            // fidelity, since a zero there (a cleared tombstone) is what
            // actually distinguishes a live entry from a deleted one in
            // this table layout.
            let ref_marker = target.read_struct::<i64>(slot_addr)?;
            if ref_marker != 0 {
                entries.push(key_addr);
                found += 1;
            }
        }
        slot_addr += 16;
        i += 1;
    }

    Ok(entries)
}

/// Resolves a task's display name: CPython stores either a `PyLong` (an
/// auto-generated "Task-N" id, formatted here the same way) or a
/// `PyUnicode` (a user-supplied name), distinguished by the name object's
/// type flags, matching `parse_task_name`.
fn parse_task_name(target: &Target, offsets: &DebugOffsets, async_offsets: &AsyncioOffsets, task_addr: u64) -> Result<String> {
    let name_addr = target.read_u64(task_addr + async_offsets.task_object.task_name)?;
    let type_addr = target.read_u64(name_addr + offsets.pyobject.ob_type)?;
    let tp_flags = target.read_struct::<u64>(type_addr + offsets.type_object.tp_flags)?;

    if tp_flags & PY_TPFLAGS_LONG_SUBCLASS != 0 {
        let n = read_py_long(target, &offsets.long_object, name_addr)?;
        return Ok(format!("Task-{}", n));
    }
    if tp_flags & PY_TPFLAGS_UNICODE_SUBCLASS == 0 {
        return Err(CoreError::new(Kind::FrameChainBroken, "task name object is neither long nor unicode"));
    }
    read_py_str(target, &offsets.unicode_object, name_addr)
}

/// Follows a task's coroutine chain: the task's own generator frame, then
/// (if it is currently suspended on `yield from`) whatever coroutine it is
/// awaiting, as long as that awaited object shares the same generator
/// type. Matches `parse_coro_chain`/`handle_yield_from_frame`, returned
/// innermost-first like `walk_frame_chain_with_addrs`.
fn parse_coro_chain(
    target: &Target,
    offsets: &DebugOffsets,
    code_cache: &mut CodeObjectCache,
    tlbc_cache: &mut TlbcCache,
    tlbc_generation: u32,
    coro_addr: u64,
) -> Result<Vec<FrameInfo>> {
    let mut frames = Vec::new();

    let go = &offsets.gen_object;
    let frame_state = target.read_struct::<i8>(coro_addr + go.gi_frame_state)?;
    if frame_state == FRAME_CLEARED {
        return Ok(frames);
    }

    let iframe_addr = coro_addr + go.gi_iframe;
    if let Some(raw) = frame_walker::parse_frame_object(target, offsets, iframe_addr)? {
        frames.push(frame_walker::resolve_location(
            target,
            offsets,
            code_cache,
            tlbc_cache,
            tlbc_generation,
            &raw,
        )?);
    }

    // `FRAME_SUSPENDED_YIELD_FROM` would continue into whatever this
    // generator is yielding from (`gi_await`), per
    // `handle_yield_from_frame`. Following that link needs the frame's
    // stack pointer, which this crate's `InterpreterFrameOffsets` doesn't
    // carry (locals/stack slots are out of scope per spec §2's
    // Non-goals), so the chain stops at the outermost frame resolved here.

    frames.reverse();
    Ok(frames)
}

/// Builds the full `awaited_by` tree rooted at `task_addr`: this task's
/// coroutine stack plus, recursively, every task waiting on it. Matches
/// `process_task_and_waiters`, with a node budget guarding against an
/// adversarially large graph. Task identity is not deduplicated: if a cycle
/// exists, the caller observes a truncated traversal once the cap is hit
/// rather than an error.
pub fn walk_task_tree(
    target: &Target,
    offsets: &DebugOffsets,
    async_offsets: &AsyncioOffsets,
    code_cache: &mut CodeObjectCache,
    tlbc_cache: &mut TlbcCache,
    tlbc_generation: u32,
    task_addr: u64,
) -> Result<TaskInfo> {
    let mut budget = MAX_TASK_NODES;
    build_node(
        target,
        offsets,
        async_offsets,
        code_cache,
        tlbc_cache,
        tlbc_generation,
        task_addr,
        &mut budget,
    )
}

fn build_node(
    target: &Target,
    offsets: &DebugOffsets,
    async_offsets: &AsyncioOffsets,
    code_cache: &mut CodeObjectCache,
    tlbc_cache: &mut TlbcCache,
    tlbc_generation: u32,
    task_addr: u64,
    budget: &mut usize,
) -> Result<TaskInfo> {
    if *budget == 0 {
        return Ok(TaskInfo {
            task_id: task_addr,
            task_name: String::from("<truncated>"),
            coroutine_stack: Vec::new(),
            awaited_by: Vec::new(),
        });
    }
    *budget -= 1;

    let task_name = parse_task_name(target, offsets, async_offsets, task_addr)?;
    let coro_addr = target.read_u64(task_addr + async_offsets.task_object.task_coro)?;
    let coroutine_stack = if coro_addr != 0 {
        parse_coro_chain(target, offsets, code_cache, tlbc_cache, tlbc_generation, coro_addr)?
    } else {
        Vec::new()
    };

    let to = &async_offsets.task_object;
    let awaited_by_addr = target.read_u64(task_addr + to.task_awaited_by)?;
    let mut awaited_by = Vec::new();
    if awaited_by_addr != 0 {
        let is_set = target.read(task_addr + to.task_awaited_by_is_set, 1)?[0] != 0;
        let waiter_addrs = if is_set {
            iterate_set_entries(target, offsets, awaited_by_addr)?
        } else {
            vec![awaited_by_addr]
        };
        for waiter in waiter_addrs {
            awaited_by.push(build_node(
                target,
                offsets,
                async_offsets,
                code_cache,
                tlbc_cache,
                tlbc_generation,
                waiter,
                budget,
            )?);
        }
    }

    Ok(TaskInfo { task_id: task_addr, task_name, coroutine_stack, awaited_by })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_table_bounds_reject_oversized_mask() {
        // This only exercises the bounds constant; a full walk needs a
        // live Target, covered by integration tests.
        assert!(MAX_SET_TABLE_SIZE > 0);
    }
}

//! C5 — Interpreter frame walker.
//!
//! Walks a thread's `_PyInterpreterFrame` linked list from its innermost
//! frame back to the thread's entry point, resolving each frame's code
//! object (name, filename, line table) and computing the current location
//! from the instruction pointer.
//!
//! Grounded on
//! `examples/original_source/Modules/_remote_debugging/frames.c`
//! (`parse_frame_object`, `process_frame_chain`, `is_frame_valid`) and
//! `code_objects.c::parse_code_object` for the code-object cache and the
//! bytecode-offset-into-linetable computation, with the overall shape (a
//! plain loop appending `FrameInfo`s, capped and erroring on runaway
//! depth) carried over from
//! `examples/benfred-py-spy/src/stack_trace.rs::get_stack_trace`.

use std::collections::HashMap;

use crate::code_cache::TlbcCache;
use crate::error::{CoreError, Kind, Result};
use crate::linetable::parse_linetable;
use crate::memory::Target;
use crate::object_reader::{read_py_bytes, read_py_str};
use crate::types::{DebugOffsets, FrameInfo};

/// Matches CPython's `_frameowner` enum in `pycore_interpframe.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameOwner {
    Thread,
    Generator,
    FrameObject,
    Interpreter,
    CStack,
}

impl FrameOwner {
    fn from_byte(b: u8) -> Option<FrameOwner> {
        match b {
            0 => Some(FrameOwner::Thread),
            1 => Some(FrameOwner::Generator),
            2 => Some(FrameOwner::FrameObject),
            3 => Some(FrameOwner::Interpreter),
            4 => Some(FrameOwner::CStack),
            _ => None,
        }
    }
}

/// Low tag bits CPython stuffs into tagged pointers (`Py_TAG_BITS`), masked
/// off whenever a pointer is read with `GET_MEMBER_NO_TAG` in the original.
const PTR_TAG_BITS: u64 = 0b11;

const MAX_FRAMES: usize = 1024;

struct CachedCodeMeta {
    func_name: String,
    file_name: String,
    linetable: Vec<u8>,
    first_lineno: i32,
    addr_code_adaptive: u64,
    /// Address of the code object's `co_tlbc` pointer field, or 0 if this
    /// target's `DebugOffsets` doesn't publish one (no thread-local bytecode
    /// on this build).
    addr_co_tlbc: u64,
}

/// Per-attach cache of decoded code object metadata, grounded on
/// `unwinder->code_object_cache` in `parse_code_object`: code objects are
/// immutable once created, so this table is valid for the lifetime of the
/// attach and never invalidated.
#[derive(Default)]
pub struct CodeObjectCache {
    entries: HashMap<u64, CachedCodeMeta>,
}

impl CodeObjectCache {
    pub fn new() -> CodeObjectCache {
        CodeObjectCache::default()
    }

    fn get_or_load(&mut self, target: &Target, offsets: &DebugOffsets, code_addr: u64) -> Result<&CachedCodeMeta> {
        if !self.entries.contains_key(&code_addr) {
            let co = &offsets.code_object;
            let qualname_ptr = target.read_u64(code_addr + co.qualname)?;
            let filename_ptr = target.read_u64(code_addr + co.filename)?;
            let linetable_ptr = target.read_u64(code_addr + co.linetable)?;

            let func_name = read_py_str(target, &offsets.unicode_object, qualname_ptr)?;
            let file_name = read_py_str(target, &offsets.unicode_object, filename_ptr)?;
            let linetable = read_py_bytes(target, &offsets.bytes_object, linetable_ptr)?;
            let first_lineno = target.read_struct::<i32>(code_addr + co.firstlineno)?;

            let addr_co_tlbc = if offsets.code_object_co_tlbc != 0 {
                code_addr + offsets.code_object_co_tlbc
            } else {
                0
            };

            self.entries.insert(
                code_addr,
                CachedCodeMeta {
                    func_name,
                    file_name,
                    linetable,
                    first_lineno,
                    addr_code_adaptive: code_addr + co.co_code_adaptive,
                    addr_co_tlbc,
                },
            );
        }
        Ok(self.entries.get(&code_addr).unwrap())
    }
}

/// A frame resolved directly from `_PyInterpreterFrame`: just enough to
/// continue walking the chain and, on a free-threaded target, redirect
/// through its thread-local bytecode copy.
pub(crate) struct RawFrame {
    pub(crate) previous: u64,
    pub(crate) code_addr: u64,
    pub(crate) instr_ptr: u64,
    pub(crate) tlbc_index: i32,
}

fn is_frame_valid(owner: Option<FrameOwner>) -> Result<bool> {
    match owner {
        None => Ok(false),
        Some(FrameOwner::Interpreter) => Ok(false),
        Some(FrameOwner::Generator) | Some(FrameOwner::Thread) => Ok(true),
        Some(other) => Err(CoreError::new(
            Kind::UnhandledFrameOwner,
            format!("unhandled frame owner {:?}", other),
        )),
    }
}

/// Reads one `_PyInterpreterFrame` at `address`, validating its owner tag.
/// Returns `Ok(None)` for a frame that terminates the walk (owned by the
/// interpreter, i.e. a C trampoline frame) rather than an error, matching
/// `is_frame_valid`'s `0` return.
pub(crate) fn parse_frame_object(target: &Target, offsets: &DebugOffsets, address: u64) -> Result<Option<RawFrame>> {
    let frame = &offsets.interpreter_frame;
    let previous = target.read_u64(address + frame.previous)?;
    let executable = target.read_u64(address + frame.executable)? & !PTR_TAG_BITS;
    let owner_byte = target.read(address + frame.owner, 1)?[0];

    if executable == 0 {
        return Ok(None);
    }
    if !is_frame_valid(FrameOwner::from_byte(owner_byte))? {
        return Ok(None);
    }

    let instr_ptr = target.read_u64(address + frame.instr_ptr)?;

    let tlbc_index = if offsets.interpreter_frame_tlbc_index != 0 {
        target.read_struct::<i32>(address + offsets.interpreter_frame_tlbc_index)?
    } else {
        0
    };

    Ok(Some(RawFrame { previous, code_addr: executable, instr_ptr, tlbc_index }))
}

/// Resolves the bytecode base to resolve `raw.instr_ptr` against: the
/// code object's own adaptive bytecode, or, on a free-threaded target with a
/// positive `tlbc_index`, the matching entry of that thread's thread-local
/// bytecode copy (spec §3/§4.4's TLBC redirection). Grounded on
/// `code_objects.c`'s TLBC block in `parse_code_object`: a `-1` (or zero)
/// index, or a target with no `co_tlbc` offset, falls back to the main
/// adaptive code base per spec §4.4; a cache miss triggers
/// `TlbcCache::populate`, and a positive but out-of-range index is an error
/// (matches `"Invalid tlbc_index (corrupted remote memory)"`).
fn resolve_bytecode_base(
    target: &Target,
    tlbc_cache: &mut TlbcCache,
    tlbc_generation: u32,
    meta: &CachedCodeMeta,
    raw: &RawFrame,
) -> Result<u64> {
    if raw.tlbc_index <= 0 || meta.addr_co_tlbc == 0 {
        return Ok(meta.addr_code_adaptive);
    }

    if tlbc_cache.get(raw.code_addr, tlbc_generation).is_none() {
        tlbc_cache.populate(target, raw.code_addr, meta.addr_co_tlbc, tlbc_generation)?;
    }
    let array = tlbc_cache
        .get(raw.code_addr, tlbc_generation)
        .ok_or_else(|| CoreError::new(Kind::FrameChainBroken, "TLBC array missing after populate"))?;

    let entries = array.len() / std::mem::size_of::<u64>();
    if raw.tlbc_index as usize >= entries {
        return Err(CoreError::new(
            Kind::FrameChainBroken,
            "invalid tlbc_index (corrupted remote memory)",
        ));
    }

    let start = raw.tlbc_index as usize * std::mem::size_of::<u64>();
    let bytes: [u8; 8] = array[start..start + 8].try_into().unwrap();
    Ok(u64::from_ne_bytes(bytes))
}

pub(crate) fn resolve_location(
    target: &Target,
    offsets: &DebugOffsets,
    code_cache: &mut CodeObjectCache,
    tlbc_cache: &mut TlbcCache,
    tlbc_generation: u32,
    raw: &RawFrame,
) -> Result<FrameInfo> {
    let meta = code_cache.get_or_load(target, offsets, raw.code_addr)?;
    let bytecode_base = resolve_bytecode_base(target, tlbc_cache, tlbc_generation, meta, raw)?;

    // CPython's bytecode unit is 2 bytes (`uint16_t *` arithmetic in the
    // original); a negative or odd offset means the instruction pointer
    // precedes the code's bytecode, which should never happen for a valid
    // frame but is defended against rather than trusted.
    let byte_offset = raw.instr_ptr as i64 - bytecode_base as i64;
    let addrq = if byte_offset >= 0 { (byte_offset / 2) as u64 } else { 0 };

    let location = parse_linetable(addrq, &meta.linetable, meta.first_lineno)?;
    Ok(FrameInfo::python(meta.file_name.clone(), meta.func_name.clone(), location, None))
}

/// Walks the frame chain starting at `initial_frame_addr`, returning each
/// frame's address (innermost first) alongside its resolved `FrameInfo`, so
/// a caller can feed both into `frame_cache::FrameCache::store` and later
/// splice a partial re-walk onto a cached continuation via
/// `FrameCache::lookup_continuation`. `gc_frame`, when set, marks the frame
/// that kicked off the current GC collection and is rendered as a synthetic
/// `<GC>` frame instead of resolved normally, per spec §3 and
/// `process_frame_chain`'s `extra_frame` handling. Native-frame insertion
/// (the C-trampoline placeholder) is intentionally not modelled here:
/// native unwinding is a Non-goal, so a frame owned by the interpreter
/// simply ends the walk.
pub fn walk_frame_chain_with_addrs(
    target: &Target,
    offsets: &DebugOffsets,
    code_cache: &mut CodeObjectCache,
    tlbc_cache: &mut TlbcCache,
    tlbc_generation: u32,
    initial_frame_addr: u64,
    gc_frame: Option<u64>,
) -> Result<(Vec<u64>, Vec<FrameInfo>)> {
    let mut addrs = Vec::new();
    let mut frames = Vec::new();
    let mut frame_addr = initial_frame_addr;
    let mut count = 0usize;

    while frame_addr != 0 {
        count += 1;
        if count > MAX_FRAMES {
            return Err(CoreError::new(
                Kind::FrameChainBroken,
                "too many stack frames (possible corrupted chain)",
            ));
        }

        addrs.push(frame_addr);

        if Some(frame_addr) == gc_frame {
            frames.push(FrameInfo::gc());
            break;
        }

        let raw = match parse_frame_object(target, offsets, frame_addr)? {
            Some(raw) => raw,
            None => {
                addrs.pop();
                break;
            }
        };

        frames.push(resolve_location(target, offsets, code_cache, tlbc_cache, tlbc_generation, &raw)?);
        frame_addr = raw.previous;
    }

    Ok((addrs, frames))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_owner_decodes_known_values() {
        assert_eq!(FrameOwner::from_byte(0), Some(FrameOwner::Thread));
        assert_eq!(FrameOwner::from_byte(3), Some(FrameOwner::Interpreter));
        assert_eq!(FrameOwner::from_byte(200), None);
    }

    #[test]
    fn interpreter_owned_frame_is_invalid() {
        assert!(!is_frame_valid(Some(FrameOwner::Interpreter)).unwrap());
    }

    #[test]
    fn generator_owned_frame_is_valid() {
        assert!(is_frame_valid(Some(FrameOwner::Generator)).unwrap());
    }

    #[test]
    fn unmapped_owner_byte_is_an_error() {
        assert!(parse_frame_object_owner_err());
    }

    fn parse_frame_object_owner_err() -> bool {
        is_frame_valid(Some(FrameOwner::FrameObject)).is_err()
    }

    #[test]
    fn zero_tlbc_index_skips_redirection() {
        let target = Target::new(0);
        let mut tlbc_cache = TlbcCache::new();
        let meta = CachedCodeMeta {
            func_name: "f".into(),
            file_name: "f.py".into(),
            linetable: Vec::new(),
            first_lineno: 1,
            addr_code_adaptive: 0x4000,
            addr_co_tlbc: 0x5000,
        };
        let raw = RawFrame { previous: 0, code_addr: 0x1000, instr_ptr: 0x4010, tlbc_index: 0 };
        let base = resolve_bytecode_base(&target, &mut tlbc_cache, 1, &meta, &raw).unwrap();
        assert_eq!(base, meta.addr_code_adaptive);
    }

    #[test]
    fn negative_tlbc_index_falls_back_to_adaptive_base() {
        let target = Target::new(0);
        let mut tlbc_cache = TlbcCache::new();
        let meta = CachedCodeMeta {
            func_name: "f".into(),
            file_name: "f.py".into(),
            linetable: Vec::new(),
            first_lineno: 1,
            addr_code_adaptive: 0x4000,
            addr_co_tlbc: 0x5000,
        };
        let raw = RawFrame { previous: 0, code_addr: 0x1000, instr_ptr: 0x4010, tlbc_index: -1 };
        let base = resolve_bytecode_base(&target, &mut tlbc_cache, 1, &meta, &raw).unwrap();
        assert_eq!(base, meta.addr_code_adaptive);
    }

    #[test]
    fn no_co_tlbc_offset_skips_redirection_even_with_nonzero_index() {
        let target = Target::new(0);
        let mut tlbc_cache = TlbcCache::new();
        let meta = CachedCodeMeta {
            func_name: "f".into(),
            file_name: "f.py".into(),
            linetable: Vec::new(),
            first_lineno: 1,
            addr_code_adaptive: 0x4000,
            addr_co_tlbc: 0,
        };
        let raw = RawFrame { previous: 0, code_addr: 0x1000, instr_ptr: 0x4010, tlbc_index: 3 };
        let base = resolve_bytecode_base(&target, &mut tlbc_cache, 1, &meta, &raw).unwrap();
        assert_eq!(base, meta.addr_code_adaptive);
    }

    #[test]
    fn out_of_range_tlbc_index_is_rejected() {
        let target = Target::new(0);
        let mut tlbc_cache = TlbcCache::new();
        tlbc_cache.test_insert(0x1000, vec![0xaau8; 16], 1);
        let meta = CachedCodeMeta {
            func_name: "f".into(),
            file_name: "f.py".into(),
            linetable: Vec::new(),
            first_lineno: 1,
            addr_code_adaptive: 0x4000,
            addr_co_tlbc: 0x5000,
        };
        let raw = RawFrame { previous: 0, code_addr: 0x1000, instr_ptr: 0x4010, tlbc_index: 9 };
        assert!(resolve_bytecode_base(&target, &mut tlbc_cache, 1, &meta, &raw).is_err());
    }
}

//! C3 — Thread-local bytecode copy (TLBC) cache.
//!
//! Free-threaded (no-GIL) CPython builds keep a per-thread copy of a code
//! object's adaptive bytecode; the unwinder needs the copy matching the
//! thread whose frame it is resolving, keyed by the current TLBC
//! generation. Grounded on
//! `examples/original_source/Modules/_remote_debugging/code_objects.c`
//! (`get_tlbc_cache_entry`, `cache_tlbc_array`, `tlbc_cache_entry_destroy`),
//! translated from the original's `_Py_hashtable_t` + manual malloc/free
//! pair into a `HashMap` owning `Vec<u8>` buffers.

use std::collections::HashMap;

use crate::error::{CoreError, Kind, Result};
use crate::memory::Target;

/// Mirrors `MAX_TLBC_SIZE` in the original: a thread-local bytecode array
/// larger than this is treated as corrupt rather than read.
const MAX_TLBC_SIZE: i64 = 16 * 1024 * 1024;

struct Entry {
    data: Vec<u8>,
    generation: u32,
}

/// Per-code-object cache of thread-local bytecode arrays, keyed by the code
/// object's address. A stale entry (generation mismatch) is dropped and
/// refetched rather than returned, matching `get_tlbc_cache_entry`.
#[derive(Default)]
pub struct TlbcCache {
    entries: HashMap<u64, Entry>,
}

impl TlbcCache {
    pub fn new() -> TlbcCache {
        TlbcCache::default()
    }

    /// Returns the cached bytecode array for `code_addr` if present and
    /// still current for `generation`.
    pub fn get(&mut self, code_addr: u64, generation: u32) -> Option<&[u8]> {
        if let Some(entry) = self.entries.get(&code_addr) {
            if entry.generation != generation {
                self.entries.remove(&code_addr);
                return None;
            }
        }
        self.entries.get(&code_addr).map(|e| e.data.as_slice())
    }

    /// Reads the TLBC array pointed to by `tlbc_array_addr` (itself a
    /// pointer stored in the code object) and stores it keyed by
    /// `code_addr`/`generation`, following `cache_tlbc_array`: the array is
    /// `[Py_ssize_t size][size * sizeof(void*) bytes]`, and a zero or
    /// oversized `size` is rejected before any further read.
    pub fn populate(
        &mut self,
        target: &Target,
        code_addr: u64,
        tlbc_array_addr: u64,
        generation: u32,
    ) -> Result<()> {
        let tlbc_array_ptr = target.read_u64(tlbc_array_addr)?;
        if tlbc_array_ptr == 0 {
            return Err(CoreError::new(Kind::FrameChainBroken, "TLBC array pointer is null"));
        }

        let size = target.read_struct::<i64>(tlbc_array_ptr)?;
        if size <= 0 || size > MAX_TLBC_SIZE {
            return Err(CoreError::new(
                Kind::SizeOutOfRange,
                format!("invalid TLBC array size {}", size),
            ));
        }

        let array_data_size = size as usize * std::mem::size_of::<u64>();
        let data = target.read(tlbc_array_ptr + 8, array_data_size)?;

        self.entries.insert(code_addr, Entry { data, generation });
        Ok(())
    }

    /// Test-only seam for exercising `frame_walker::resolve_bytecode_base`
    /// without a live `Target` to read a real TLBC array through.
    #[cfg(test)]
    pub(crate) fn test_insert(&mut self, code_addr: u64, data: Vec<u8>, generation: u32) {
        self.entries.insert(code_addr, Entry { data, generation });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_generation_is_evicted() {
        let mut cache = TlbcCache::new();
        cache.entries.insert(0x1000, Entry { data: vec![1, 2, 3], generation: 1 });
        assert!(cache.get(0x1000, 2).is_none());
        assert!(cache.entries.get(&0x1000).is_none());
    }

    #[test]
    fn current_generation_hits() {
        let mut cache = TlbcCache::new();
        cache.entries.insert(0x1000, Entry { data: vec![9, 9], generation: 5 });
        assert_eq!(cache.get(0x1000, 5), Some(&[9u8, 9u8][..]));
    }
}

//! C1 — Remote memory gateway.
//!
//! Page-aligned, LRU-cached raw reads from a target process, plus
//! named-section lookup in the target's loaded binary.
//!
//! The `ProcessMemory` trait is grounded on
//! `examples/benfred-py-spy/remoteprocess/src/lib.rs::ProcessMemory` (same
//! `read`/`copy`/`copy_struct`/`copy_pointer` shape). The OS-specific raw
//! read itself (spec §1's `process_read(pid, addr, len) -> bytes`) is an
//! external collaborator; on Linux we implement it with `process_vm_readv`
//! via `/proc/<pid>/mem`, mirroring
//! `examples/benfred-py-spy/remoteprocess/src/linux/mod.rs::Process::read`
//! (which uses the `read_process_memory` crate for the same purpose — here
//! we inline the equivalent `pread64` call to avoid adding that crate for a
//! single syscall wrapper).

use std::cell::RefCell;
use std::io::Read;

use lru::LruCache;

use crate::error::{CoreError, Kind, Result};
use crate::types::Pid;

const PAGE_SIZE: u64 = 4096;

/// A handle to the target process: its pid plus the page cache used by
/// every read.
pub struct Target {
    pub pid: Pid,
    cache: RefCell<LruCache<u64, Vec<u8>>>,
}

impl Target {
    pub fn new(pid: Pid) -> Target {
        Target::with_cache_pages(pid, 256)
    }

    pub fn with_cache_pages(pid: Pid, pages: usize) -> Target {
        Target {
            pid,
            cache: RefCell::new(LruCache::new(
                std::num::NonZeroUsize::new(pages.max(1)).unwrap(),
            )),
        }
    }

    /// Drops all cached pages. Callers invalidate the cache between samples
    /// since the gateway's coherency is deliberately weak (spec §4.1): the
    /// interior of the target may have mutated between samples, and a
    /// consistent view is only guaranteed within a single sample.
    pub fn invalidate(&self) {
        self.cache.borrow_mut().clear();
    }

    fn page_of(addr: u64) -> u64 {
        addr & !(PAGE_SIZE - 1)
    }

    fn fetch_page(&self, page_addr: u64) -> Result<Vec<u8>> {
        if let Some(cached) = self.cache.borrow_mut().get(&page_addr) {
            return Ok(cached.clone());
        }
        let data = process_read(self.pid, page_addr, PAGE_SIZE as usize)?;
        self.cache.borrow_mut().put(page_addr, data.clone());
        Ok(data)
    }

    /// Copies `len` bytes from `addr`, assembling the result from one or
    /// more cached pages (spec §4.1: "reads that straddle pages assemble
    /// results from multiple cached pages").
    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(len);
        let mut cur = addr;
        let end = addr + len as u64;
        while cur < end {
            let page_addr = Self::page_of(cur);
            let page = self.fetch_page(page_addr)?;
            let page_off = (cur - page_addr) as usize;
            let take = ((end - cur) as usize).min(page.len() - page_off);
            out.extend_from_slice(&page[page_off..page_off + take]);
            cur += take as u64;
        }
        Ok(out)
    }

    pub fn read_struct<T: Copy>(&self, addr: u64) -> Result<T> {
        let bytes = self.read(addr, std::mem::size_of::<T>())?;
        Ok(unsafe { std::ptr::read(bytes.as_ptr() as *const T) })
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        self.read_struct(addr)
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        self.read_struct(addr)
    }

    /// OS-specific lookup of a named metadata region in the target's loaded
    /// binary (spec §4.1 `find_section`). Tries each hint in order and
    /// returns the first match.
    pub fn find_section(&self, section_name: &str, binary_hints: &[String]) -> Result<u64> {
        for hint in binary_hints {
            if let Ok(info) = crate::binary_parser::parse_binary(hint) {
                if let Some(addr) = info.sections.get(section_name) {
                    return Ok(*addr);
                }
            }
        }
        Err(CoreError::new(
            Kind::SectionNotFound,
            format!("section '{}' not found in any of {:?}", section_name, binary_hints),
        ))
    }
}

#[cfg(target_os = "linux")]
fn process_read(pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
    use std::fs::OpenOptions;
    use std::io::Seek;

    let path = format!("/proc/{}/mem", pid);
    let mut file = OpenOptions::new()
        .read(true)
        .open(&path)
        .map_err(|e| CoreError::with_source(Kind::RemoteReadFailed, "open /proc/pid/mem", e))?;
    file.seek(std::io::SeekFrom::Start(addr))
        .map_err(|e| CoreError::with_source(Kind::RemoteReadFailed, "seek", e))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)
        .map_err(|e| CoreError::with_source(Kind::RemoteReadFailed, "read", e))?;
    Ok(buf)
}

#[cfg(not(target_os = "linux"))]
fn process_read(_pid: Pid, _addr: u64, _len: usize) -> Result<Vec<u8>> {
    Err(CoreError::new(
        Kind::NotSupportedOnPlatform,
        "raw remote memory reads are only implemented for linux in this crate",
    ))
}

/// In-process memory source used by unit tests to exercise the unwinder
/// against locally constructed structs, grounded on
/// `examples/benfred-py-spy/remoteprocess/src/lib.rs::LocalProcess`.
#[cfg(test)]
pub struct LocalTarget;

#[cfg(test)]
impl LocalTarget {
    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), len);
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_of_aligns_down() {
        assert_eq!(Target::page_of(0x1234), 0x1000);
        assert_eq!(Target::page_of(0x1000), 0x1000);
        assert_eq!(Target::page_of(0x1fff), 0x1000);
    }

    #[test]
    fn local_target_reads_back_known_bytes() {
        let data: [u8; 4] = [1, 2, 3, 4];
        let local = LocalTarget;
        let copy = local.read(data.as_ptr() as u64, 4).unwrap();
        assert_eq!(copy, vec![1, 2, 3, 4]);
    }
}

//! C6 — Frame continuation cache.
//!
//! Between two samples of the same thread, the bottom of the stack rarely
//! changes. This cache lets `collector.rs` splice a new sample's frames
//! onto the unchanged tail of the previous one instead of resolving every
//! frame from scratch, by remembering, per thread, the frame address list
//! and resolved `FrameInfo`s from the last time that thread was sampled.
//!
//! Grounded on
//! `examples/original_source/Modules/_remote_debugging/frame_cache.c`: a
//! fixed-capacity array keyed by thread id (not a hash map, so a lookup
//! miss and a full-cache overflow are both cheap, bounded operations), with
//! graceful degradation — once full, new threads simply aren't cached
//! rather than evicting an arbitrary existing entry.

use crate::types::FrameInfo;

/// Mirrors `FRAME_CACHE_MAX_THREADS` in the original.
const FRAME_CACHE_MAX_THREADS: usize = 64;
/// Mirrors `FRAME_CACHE_MAX_FRAMES`: a stored stack deeper than this is
/// truncated rather than rejected, since the cache is purely an
/// optimization and an incomplete cache entry degrades to a cache miss.
const FRAME_CACHE_MAX_FRAMES: usize = 1024;

struct Slot {
    thread_id: u64,
    addrs: Vec<u64>,
    frames: Vec<FrameInfo>,
}

/// Result of splicing a new walk onto a cached continuation.
pub enum LookupResult {
    /// No usable cache entry; the caller must resolve every frame.
    Miss,
    /// The caller's incomplete frame list should be extended with these
    /// frames to complete the stack.
    Extend(Vec<FrameInfo>),
}

#[derive(Default)]
pub struct FrameCache {
    slots: Vec<Slot>,
}

impl FrameCache {
    pub fn new() -> FrameCache {
        FrameCache { slots: Vec::with_capacity(FRAME_CACHE_MAX_THREADS) }
    }

    fn find(&self, thread_id: u64) -> Option<usize> {
        self.slots.iter().position(|s| s.thread_id == thread_id)
    }

    /// Returns the entire cached stack when `frame_addr` (the thread's
    /// current innermost frame) equals the last address this thread was
    /// sampled at — the whole stack is unchanged, matching
    /// `try_full_cache_hit`.
    pub fn full_hit(&self, thread_id: u64, frame_addr: u64) -> Option<&[FrameInfo]> {
        let slot = &self.slots[self.find(thread_id)?];
        if slot.addrs.first() == Some(&frame_addr) {
            Some(&slot.frames)
        } else {
            None
        }
    }

    /// Looks for `last_profiled_frame` in the cached address list for
    /// `thread_id` and, if found, returns the cached frames from that point
    /// onward, matching `frame_cache_lookup_and_extend`.
    pub fn lookup_continuation(&self, thread_id: u64, last_profiled_frame: u64) -> LookupResult {
        let Some(idx) = self.find(thread_id) else { return LookupResult::Miss };
        let slot = &self.slots[idx];
        match slot.addrs.iter().position(|a| *a == last_profiled_frame) {
            Some(start) => LookupResult::Extend(slot.frames[start..].to_vec()),
            None => LookupResult::Miss,
        }
    }

    /// Stores a freshly walked stack for `thread_id`, following
    /// `frame_cache_store`/`frame_cache_alloc_slot`: reuses this thread's
    /// existing slot if present, otherwise claims an empty slot, and
    /// silently drops the result if the cache is already at capacity
    /// (`FRAME_CACHE_MAX_THREADS` new threads in one sample is already an
    /// unusual workload; losing the optimization for the overflow is
    /// preferable to unbounded growth).
    pub fn store(&mut self, thread_id: u64, addrs: Vec<u64>, frames: Vec<FrameInfo>) {
        let mut addrs = addrs;
        let mut frames = frames;
        addrs.truncate(FRAME_CACHE_MAX_FRAMES);
        frames.truncate(FRAME_CACHE_MAX_FRAMES);

        if let Some(idx) = self.find(thread_id) {
            self.slots[idx] = Slot { thread_id, addrs, frames };
            return;
        }
        if self.slots.len() < FRAME_CACHE_MAX_THREADS {
            self.slots.push(Slot { thread_id, addrs, frames });
        }
    }

    /// Drops entries for threads not present in `live_thread_ids`, matching
    /// `frame_cache_invalidate_stale`.
    pub fn invalidate_stale(&mut self, live_thread_ids: &[u64]) {
        self.slots.retain(|s| live_thread_ids.contains(&s.thread_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_hit_requires_matching_innermost_address() {
        let mut cache = FrameCache::new();
        cache.store(1, vec![0x100, 0x200], vec![FrameInfo::native(), FrameInfo::native()]);
        assert!(cache.full_hit(1, 0x100).is_some());
        assert!(cache.full_hit(1, 0x999).is_none());
    }

    #[test]
    fn continuation_lookup_splices_from_match_point() {
        let mut cache = FrameCache::new();
        cache.store(1, vec![0x100, 0x200, 0x300], vec![FrameInfo::native(), FrameInfo::gc(), FrameInfo::native()]);
        match cache.lookup_continuation(1, 0x200) {
            LookupResult::Extend(frames) => assert_eq!(frames.len(), 2),
            LookupResult::Miss => panic!("expected a hit"),
        }
    }

    #[test]
    fn overflow_beyond_capacity_drops_new_threads() {
        let mut cache = FrameCache::new();
        for tid in 0..FRAME_CACHE_MAX_THREADS as u64 {
            cache.store(tid, vec![tid], vec![FrameInfo::native()]);
        }
        cache.store(9999, vec![9999], vec![FrameInfo::native()]);
        assert!(cache.find(9999).is_none());
    }

    #[test]
    fn invalidate_stale_drops_threads_not_in_sample() {
        let mut cache = FrameCache::new();
        cache.store(1, vec![0x1], vec![FrameInfo::native()]);
        cache.store(2, vec![0x2], vec![FrameInfo::native()]);
        cache.invalidate_stale(&[1]);
        assert!(cache.find(1).is_some());
        assert!(cache.find(2).is_none());
    }
}

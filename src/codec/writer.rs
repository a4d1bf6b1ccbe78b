//! C9 — binary sample writer (the "TACH" format).
//!
//! Grounded on
//! `examples/original_source/Modules/_remote_debugging/binary_io_writer.c`:
//! string/frame interning tables, per-thread delta timestamps, run-length
//! encoding of unchanged stacks (`STACK_REPEAT`), and suffix/pop-push delta
//! encoding of changed stacks (`compare_stacks`), followed by string table,
//! frame table, footer, and a header rewritten at offset 0 once the sample
//! count and table offsets are known (`binary_writer_finalize`). zstd
//! streaming compression is part of the original format (`compression_type`)
//! but is not implemented here — `Writer::new` rejects `COMPRESSION_ZSTD`
//! the same way the original rejects it when built without zstd, since this
//! crate doesn't carry that dependency.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use crate::codec::varint;
use crate::error::{CoreError, Kind, Result};
use crate::types::{FrameInfo, InterpreterInfo};

pub const MAGIC: u32 = 0x5441_4348;
pub const FORMAT_VERSION: u32 = 2;

pub const COMPRESSION_NONE: u32 = 0;
pub const COMPRESSION_ZSTD: u32 = 1;

const STACK_REPEAT: u8 = 0x00;
const STACK_FULL: u8 = 0x01;
const STACK_SUFFIX: u8 = 0x02;
const STACK_POP_PUSH: u8 = 0x03;

const MAX_STACK_DEPTH: usize = 256;
pub(crate) const FILE_HEADER_PLACEHOLDER_SIZE: u64 = 64;
const FILE_HEADER_SIZE: usize = 52;
const FILE_FOOTER_SIZE: usize = 32;

#[derive(Debug, Default, Clone, Copy)]
pub struct WriterStats {
    pub repeat_records: u64,
    pub repeat_samples: u64,
    pub full_records: u64,
    pub suffix_records: u64,
    pub pop_push_records: u64,
    pub total_frames_written: u64,
    pub frames_saved: u64,
}

struct ThreadEntry {
    thread_id: u64,
    interpreter_id: u32,
    prev_timestamp: u64,
    prev_stack: Vec<u32>,
    pending_rle: Vec<(u64, u8)>,
}

/// Streaming encoder for one profiling session. Samples must be written in
/// non-decreasing timestamp order per spec §6; `finalize` consumes the
/// writer and must be called exactly once to produce a valid file.
pub struct Writer {
    file: BufWriter<File>,
    start_time_us: u64,
    sample_interval_us: u64,
    compression_type: u32,
    total_samples: u32,

    strings: Vec<String>,
    string_index: HashMap<String, u32>,
    frames: Vec<(u32, u32, i32)>,
    frame_index: HashMap<(u32, u32, i32), u32>,
    threads: Vec<ThreadEntry>,
    thread_index: HashMap<(u64, u32), usize>,

    stats: WriterStats,
}

impl Writer {
    pub fn new(
        path: impl AsRef<Path>,
        sample_interval_us: u64,
        compression_type: u32,
        start_time_us: u64,
    ) -> Result<Writer> {
        if compression_type == COMPRESSION_ZSTD {
            return Err(CoreError::new(
                Kind::UnsupportedCompression,
                "zstd compression requested but not available in this build",
            ));
        }
        if compression_type != COMPRESSION_NONE {
            return Err(CoreError::new(
                Kind::UnsupportedCompression,
                format!("unknown compression type {}", compression_type),
            ));
        }

        let file = File::create(path.as_ref())?;
        let mut file = BufWriter::new(file);
        file.write_all(&[0u8; FILE_HEADER_PLACEHOLDER_SIZE as usize])?;

        Ok(Writer {
            file,
            start_time_us,
            sample_interval_us,
            compression_type,
            total_samples: 0,
            strings: Vec::new(),
            string_index: HashMap::new(),
            frames: Vec::new(),
            frame_index: HashMap::new(),
            threads: Vec::new(),
            thread_index: HashMap::new(),
            stats: WriterStats::default(),
        })
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    fn intern_string(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.string_index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), idx);
        idx
    }

    fn intern_frame(&mut self, filename_idx: u32, funcname_idx: u32, lineno: i32) -> u32 {
        let key = (filename_idx, funcname_idx, lineno);
        if let Some(&idx) = self.frame_index.get(&key) {
            return idx;
        }
        let idx = self.frames.len() as u32;
        self.frames.push(key);
        self.frame_index.insert(key, idx);
        idx
    }

    fn frame_indices(&mut self, frames: &[FrameInfo]) -> Vec<u32> {
        frames
            .iter()
            .take(MAX_STACK_DEPTH)
            .map(|f| {
                let filename_idx = self.intern_string(f.file());
                let funcname_idx = self.intern_string(f.qualname());
                let lineno = match &f.kind {
                    crate::types::FrameKind::Python { location: Some(loc), .. } => loc.line,
                    _ => 0,
                };
                self.intern_frame(filename_idx, funcname_idx, lineno)
            })
            .collect()
    }

    fn thread_slot(&mut self, thread_id: u64, interpreter_id: u32) -> (usize, bool) {
        if let Some(&idx) = self.thread_index.get(&(thread_id, interpreter_id)) {
            return (idx, false);
        }
        let idx = self.threads.len();
        self.threads.push(ThreadEntry {
            thread_id,
            interpreter_id,
            prev_timestamp: self.start_time_us,
            prev_stack: Vec::new(),
            pending_rle: Vec::new(),
        });
        self.thread_index.insert((thread_id, interpreter_id), idx);
        (idx, true)
    }

    fn write_sample_header(&mut self, thread_id: u64, interpreter_id: u32, encoding: u8) -> Result<()> {
        self.file.write_all(&thread_id.to_le_bytes())?;
        self.file.write_all(&interpreter_id.to_le_bytes())?;
        self.file.write_all(&[encoding])?;
        Ok(())
    }

    fn flush_pending_rle(&mut self, idx: usize) -> Result<()> {
        if self.threads[idx].pending_rle.is_empty() {
            return Ok(());
        }
        let thread_id = self.threads[idx].thread_id;
        let interpreter_id = self.threads[idx].interpreter_id;
        let prev_depth = self.threads[idx].prev_stack.len() as u64;
        let pending = std::mem::take(&mut self.threads[idx].pending_rle);

        self.write_sample_header(thread_id, interpreter_id, STACK_REPEAT)?;
        let mut buf = Vec::new();
        varint::encode_u32(&mut buf, pending.len() as u32);
        self.file.write_all(&buf)?;

        for &(delta, status) in &pending {
            let mut buf = Vec::new();
            varint::encode_u64(&mut buf, delta);
            self.file.write_all(&buf)?;
            self.file.write_all(&[status])?;
        }

        self.total_samples += pending.len() as u32;
        self.stats.repeat_records += 1;
        self.stats.repeat_samples += pending.len() as u64;
        self.stats.frames_saved += pending.len() as u64 * prev_depth;
        Ok(())
    }

    /// Records one interpreter/thread snapshot. `timestamp_us` should come
    /// from the same monotonic clock as `start_time_us` passed to `new`.
    pub fn write_sample(&mut self, interpreters: &[InterpreterInfo], timestamp_us: u64) -> Result<()> {
        for interp in interpreters {
            for thread in &interp.threads {
                self.write_thread_sample(interp.interpreter_id, thread, timestamp_us)?;
            }
        }
        Ok(())
    }

    fn write_thread_sample(
        &mut self,
        interpreter_id: u32,
        thread: &crate::types::ThreadInfo,
        timestamp_us: u64,
    ) -> Result<()> {
        let (idx, is_new) = self.thread_slot(thread.thread_id, interpreter_id);
        let delta = timestamp_us.saturating_sub(self.threads[idx].prev_timestamp);
        self.threads[idx].prev_timestamp = timestamp_us;

        let curr_stack = self.frame_indices(&thread.frames);
        let (encoding, shared, pop, push) = compare_stacks(&self.threads[idx].prev_stack, &curr_stack);
        let status = thread.status_flags.0;

        if encoding == STACK_REPEAT && !is_new {
            self.threads[idx].pending_rle.push((delta, status));
            return Ok(());
        }

        if !self.threads[idx].pending_rle.is_empty() {
            self.flush_pending_rle(idx)?;
        }

        self.write_sample_with_encoding(idx, delta, status, encoding, &curr_stack, shared, pop, push)?;
        self.threads[idx].prev_stack = curr_stack;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_sample_with_encoding(
        &mut self,
        idx: usize,
        delta: u64,
        status: u8,
        encoding: u8,
        curr_stack: &[u32],
        shared: usize,
        pop: usize,
        push: usize,
    ) -> Result<()> {
        let thread_id = self.threads[idx].thread_id;
        let interpreter_id = self.threads[idx].interpreter_id;

        self.write_sample_header(thread_id, interpreter_id, encoding)?;
        let mut buf = Vec::new();
        varint::encode_u64(&mut buf, delta);
        buf.push(status);

        let mut frames_written = 0u64;
        match encoding {
            STACK_FULL => {
                varint::encode_u32(&mut buf, curr_stack.len() as u32);
                for &frame_idx in curr_stack {
                    varint::encode_u32(&mut buf, frame_idx);
                }
                frames_written = curr_stack.len() as u64;
                self.stats.full_records += 1;
            }
            STACK_SUFFIX => {
                varint::encode_u32(&mut buf, shared as u32);
                varint::encode_u32(&mut buf, push as u32);
                for &frame_idx in &curr_stack[..push] {
                    varint::encode_u32(&mut buf, frame_idx);
                }
                frames_written = push as u64;
                self.stats.suffix_records += 1;
                self.stats.frames_saved += shared as u64;
            }
            STACK_POP_PUSH => {
                varint::encode_u32(&mut buf, pop as u32);
                varint::encode_u32(&mut buf, push as u32);
                for &frame_idx in &curr_stack[..push] {
                    varint::encode_u32(&mut buf, frame_idx);
                }
                frames_written = push as u64;
                self.stats.pop_push_records += 1;
                self.stats.frames_saved += shared as u64;
            }
            _ => unreachable!("compare_stacks only returns the four known encodings"),
        }

        self.file.write_all(&buf)?;
        self.stats.total_frames_written += frames_written;
        self.total_samples += 1;
        Ok(())
    }

    /// Writes the string table, frame table, footer, and rewrites the file
    /// header, matching `binary_writer_finalize`. Consumes the writer since
    /// no further samples can follow a finalized file.
    pub fn finalize(mut self) -> Result<WriterStats> {
        let pending: Vec<usize> = (0..self.threads.len())
            .filter(|&i| !self.threads[i].pending_rle.is_empty())
            .collect();
        for idx in pending {
            self.flush_pending_rle(idx)?;
        }
        self.file.flush()?;

        let string_table_offset = self.file.stream_position()?;
        for s in &self.strings {
            let bytes = s.as_bytes();
            let mut buf = Vec::new();
            varint::encode_u32(&mut buf, bytes.len() as u32);
            self.file.write_all(&buf)?;
            self.file.write_all(bytes)?;
        }

        let frame_table_offset = self.file.stream_position()?;
        for &(filename_idx, funcname_idx, lineno) in &self.frames {
            let mut buf = Vec::new();
            varint::encode_u32(&mut buf, filename_idx);
            varint::encode_u32(&mut buf, funcname_idx);
            varint::encode_i32(&mut buf, lineno);
            self.file.write_all(&buf)?;
        }

        let footer_offset = self.file.stream_position()?;
        let file_size = footer_offset + FILE_FOOTER_SIZE as u64;
        let mut footer = [0u8; FILE_FOOTER_SIZE];
        footer[0..4].copy_from_slice(&(self.strings.len() as u32).to_le_bytes());
        footer[4..8].copy_from_slice(&(self.frames.len() as u32).to_le_bytes());
        footer[8..16].copy_from_slice(&file_size.to_le_bytes());
        self.file.write_all(&footer)?;

        self.file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; FILE_HEADER_SIZE];
        header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[8..16].copy_from_slice(&self.start_time_us.to_le_bytes());
        header[16..24].copy_from_slice(&self.sample_interval_us.to_le_bytes());
        header[24..28].copy_from_slice(&self.total_samples.to_le_bytes());
        header[28..32].copy_from_slice(&(self.threads.len() as u32).to_le_bytes());
        header[32..40].copy_from_slice(&string_table_offset.to_le_bytes());
        header[40..48].copy_from_slice(&frame_table_offset.to_le_bytes());
        header[48..52].copy_from_slice(&self.compression_type.to_le_bytes());
        self.file.write_all(&header)?;
        self.file.flush()?;

        Ok(self.stats)
    }
}

/// Picks the cheapest delta encoding for a stack transition, matching
/// `compare_stacks`. Stacks are innermost-first, so the "suffix" shared
/// between two stacks is their common tail (the bottom of the call stack,
/// which changes least often).
fn compare_stacks(prev: &[u32], curr: &[u32]) -> (u8, usize, usize, usize) {
    if prev == curr {
        return (STACK_REPEAT, prev.len(), 0, 0);
    }

    let min_depth = prev.len().min(curr.len());
    let mut suffix_len = 0;
    while suffix_len < min_depth
        && prev[prev.len() - 1 - suffix_len] == curr[curr.len() - 1 - suffix_len]
    {
        suffix_len += 1;
    }

    let pop_count = prev.len() - suffix_len;
    let push_count = curr.len() - suffix_len;

    if suffix_len == 0 {
        return (STACK_FULL, 0, pop_count, push_count);
    }
    if pop_count == 0 && push_count > 0 {
        return (STACK_SUFFIX, suffix_len, 0, push_count);
    }
    if pop_count > 0 || push_count > 0 {
        if suffix_len < curr.len() / 2 {
            return (STACK_FULL, suffix_len, pop_count, push_count);
        }
        return (STACK_POP_PUSH, suffix_len, pop_count, push_count);
    }
    (STACK_FULL, suffix_len, pop_count, push_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_stacks_are_repeat_encoded() {
        let (encoding, shared, pop, push) = compare_stacks(&[1, 2, 3], &[1, 2, 3]);
        assert_eq!(encoding, STACK_REPEAT);
        assert_eq!(shared, 3);
        assert_eq!((pop, push), (0, 0));
    }

    #[test]
    fn pure_push_is_suffix_encoded() {
        let (encoding, shared, pop, push) = compare_stacks(&[2, 3], &[9, 2, 3]);
        assert_eq!(encoding, STACK_SUFFIX);
        assert_eq!(shared, 2);
        assert_eq!((pop, push), (0, 1));
    }

    #[test]
    fn disjoint_stacks_use_full_encoding() {
        let (encoding, ..) = compare_stacks(&[1, 2], &[9, 8]);
        assert_eq!(encoding, STACK_FULL);
    }

    #[test]
    fn top_frame_swap_uses_pop_push_when_suffix_is_large() {
        let prev = vec![10, 20, 1, 2, 3, 4, 5, 6];
        let curr = vec![11, 20, 1, 2, 3, 4, 5, 6];
        let (encoding, shared, pop, push) = compare_stacks(&prev, &curr);
        assert_eq!(encoding, STACK_POP_PUSH);
        assert_eq!(shared, 7);
        assert_eq!((pop, push), (1, 1));
    }

    #[test]
    fn rejects_zstd_compression_as_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tach");
        let err = Writer::new(&path, 1000, COMPRESSION_ZSTD, 0).unwrap_err();
        assert_eq!(*err.kind(), Kind::UnsupportedCompression);
    }

    #[test]
    fn round_trips_a_single_sample_through_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tach");
        let mut writer = Writer::new(&path, 1000, COMPRESSION_NONE, 0).unwrap();

        let interpreters = vec![InterpreterInfo {
            interpreter_id: 0,
            threads: vec![crate::types::ThreadInfo {
                thread_id: 42,
                status_flags: crate::types::StatusFlags::empty(),
                frames: vec![FrameInfo::native()],
            }],
        }];
        writer.write_sample(&interpreters, 1000).unwrap();
        let stats = writer.finalize().unwrap();
        assert_eq!(stats.full_records, 1);

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.len() > FILE_HEADER_PLACEHOLDER_SIZE as usize);
        assert_eq!(&bytes[0..4], &MAGIC.to_le_bytes());
    }
}

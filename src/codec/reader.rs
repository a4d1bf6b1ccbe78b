//! C10 — binary sample reader / replay (the "TACH" format).
//!
//! Grounded on
//! `examples/original_source/Modules/_remote_debugging/binary_io_reader.c`:
//! header/footer parsing, string/frame table decoding, and per-thread stack
//! reconstruction from the three delta encodings plus RLE replay
//! (`decode_stack_full`/`decode_stack_suffix`/`decode_stack_pop_push`,
//! `binary_reader_replay`'s main dispatch loop). Loads the whole file into
//! memory rather than `mmap`-ing it (`USE_MMAP` in the original): this
//! crate's files are profiler sessions meant to be fully replayed, not
//! queried in place, so the extra complexity of a platform-specific mapping
//! layer isn't earning its keep here.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde_derive::Serialize;

use crate::codec::varint;
use crate::codec::writer::{COMPRESSION_NONE, FORMAT_VERSION, MAGIC};
use crate::error::{CoreError, Kind, Result};

const FILE_HEADER_PLACEHOLDER_SIZE: usize = 64;
const FILE_HEADER_SIZE: usize = 52;
const FILE_FOOTER_SIZE: usize = 32;

const STACK_REPEAT: u8 = 0x00;
const STACK_FULL: u8 = 0x01;
const STACK_SUFFIX: u8 = 0x02;
const STACK_POP_PUSH: u8 = 0x03;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReaderStats {
    pub repeat_records: u64,
    pub repeat_samples: u64,
    pub full_records: u64,
    pub suffix_records: u64,
    pub pop_push_records: u64,
    pub total_samples: u64,
    pub stack_reconstructions: u64,
}

/// File-level metadata, parsed up front from the header/footer.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub start_time_us: u64,
    pub sample_interval_us: u64,
    pub sample_count: u32,
    pub thread_count: u32,
    pub compression_type: u32,
}

/// One reconstructed sample: the thread/interpreter it belongs to, its
/// status byte, the full stack at that point (frame indices resolved to
/// `(filename, funcname, lineno)`), and the timestamp it was recorded at.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayedSample {
    pub thread_id: u64,
    pub interpreter_id: u32,
    pub status: u8,
    pub timestamp_us: u64,
    pub stack: Vec<(String, String, i32)>,
}

struct ThreadState {
    prev_timestamp: u64,
    current_stack: Vec<u32>,
}

/// Parses a TACH file and reconstructs every sample in record order.
/// Matches `binary_reader_open` + `binary_reader_replay` but returns the
/// fully replayed sample list instead of invoking a callback, since this
/// crate has no embedded interpreter collector to call back into.
pub struct Reader {
    info: FileInfo,
    strings: Vec<String>,
    frames: Vec<(u32, u32, i32)>,
    sample_data: Vec<u8>,
}

impl Reader {
    pub fn open(path: impl AsRef<Path>) -> Result<Reader> {
        let data = fs::read(path.as_ref())?;
        if data.len() < FILE_HEADER_PLACEHOLDER_SIZE {
            return Err(CoreError::new(Kind::UnsupportedFormatVersion, "file too small for header"));
        }

        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if magic != MAGIC {
            return Err(CoreError::new(
                Kind::UnsupportedFormatVersion,
                format!("invalid magic number 0x{:08x}", magic),
            ));
        }
        if version != FORMAT_VERSION {
            return Err(CoreError::new(
                Kind::UnsupportedFormatVersion,
                format!("unsupported format version {} (this reader supports {})", version, FORMAT_VERSION),
            ));
        }

        let start_time_us = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let sample_interval_us = u64::from_le_bytes(data[16..24].try_into().unwrap());
        let sample_count = u32::from_le_bytes(data[24..28].try_into().unwrap());
        let thread_count = u32::from_le_bytes(data[28..32].try_into().unwrap());
        let string_table_offset = u64::from_le_bytes(data[32..40].try_into().unwrap()) as usize;
        let frame_table_offset = u64::from_le_bytes(data[40..48].try_into().unwrap()) as usize;
        let compression_type = u32::from_le_bytes(data[48..52].try_into().unwrap());

        if compression_type != COMPRESSION_NONE {
            return Err(CoreError::new(
                Kind::UnsupportedCompression,
                "file uses zstd compression but zstd support is not compiled in",
            ));
        }

        if data.len() < FILE_FOOTER_SIZE {
            return Err(CoreError::new(Kind::UnsupportedFormatVersion, "file too small for footer"));
        }
        let footer = &data[data.len() - FILE_FOOTER_SIZE..];
        let strings_count = u32::from_le_bytes(footer[0..4].try_into().unwrap());
        let frames_count = u32::from_le_bytes(footer[4..8].try_into().unwrap());

        if string_table_offset > data.len()
            || frame_table_offset > data.len()
            || string_table_offset < FILE_HEADER_PLACEHOLDER_SIZE
            || frame_table_offset < FILE_HEADER_PLACEHOLDER_SIZE
            || string_table_offset > frame_table_offset
        {
            return Err(CoreError::new(Kind::MalformedVarint, "table offsets out of bounds"));
        }

        let sample_data = data[FILE_HEADER_PLACEHOLDER_SIZE..string_table_offset].to_vec();

        let mut offset = string_table_offset;
        let mut strings = Vec::with_capacity(strings_count as usize);
        for _ in 0..strings_count {
            let prev = offset;
            let len = varint::decode_u32(&data, &mut offset)?;
            if offset == prev {
                return Err(CoreError::new(Kind::MalformedVarint, "malformed varint in string table"));
            }
            let len = len as usize;
            if offset + len > data.len() {
                return Err(CoreError::new(Kind::MalformedVarint, "string table overflow"));
            }
            strings.push(String::from_utf8_lossy(&data[offset..offset + len]).into_owned());
            offset += len;
        }

        let mut offset = frame_table_offset;
        let mut frames = Vec::with_capacity(frames_count as usize);
        for _ in 0..frames_count {
            let prev = offset;
            let filename_idx = varint::decode_u32(&data, &mut offset)?;
            let funcname_idx = varint::decode_u32(&data, &mut offset)?;
            let lineno = varint::decode_i32(&data, &mut offset)?;
            if offset == prev {
                return Err(CoreError::new(Kind::MalformedVarint, "malformed varint in frame table"));
            }
            frames.push((filename_idx, funcname_idx, lineno));
        }

        Ok(Reader {
            info: FileInfo {
                start_time_us,
                sample_interval_us,
                sample_count,
                thread_count,
                compression_type,
            },
            strings,
            frames,
            sample_data,
        })
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    fn resolve_frame(&self, frame_idx: u32) -> Result<(String, String, i32)> {
        let &(filename_idx, funcname_idx, lineno) = self
            .frames
            .get(frame_idx as usize)
            .ok_or_else(|| CoreError::new(Kind::MalformedVarint, "invalid frame index"))?;
        let filename = self
            .strings
            .get(filename_idx as usize)
            .ok_or_else(|| CoreError::new(Kind::MalformedVarint, "invalid string index"))?
            .clone();
        let funcname = self
            .strings
            .get(funcname_idx as usize)
            .ok_or_else(|| CoreError::new(Kind::MalformedVarint, "invalid string index"))?
            .clone();
        Ok((filename, funcname, lineno))
    }

    /// Reconstructs every sample in the file, in record order, matching
    /// `binary_reader_replay`'s dispatch over `STACK_REPEAT`/`STACK_FULL`/
    /// `STACK_SUFFIX`/`STACK_POP_PUSH`.
    pub fn replay(&self) -> Result<(Vec<ReplayedSample>, ReaderStats)> {
        let mut samples = Vec::new();
        let mut stats = ReaderStats::default();
        let mut thread_states: HashMap<(u64, u32), ThreadState> = HashMap::new();
        let data = &self.sample_data;
        let mut offset = 0usize;

        while offset < data.len() {
            if offset + 13 > data.len() {
                break;
            }
            let thread_id = u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap());
            offset += 8;
            let interpreter_id = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
            offset += 4;
            let encoding = data[offset];
            offset += 1;

            let ts = thread_states.entry((thread_id, interpreter_id)).or_insert_with(|| ThreadState {
                prev_timestamp: self.info.start_time_us,
                current_stack: Vec::new(),
            });

            match encoding {
                STACK_REPEAT => {
                    let prev = offset;
                    let count = varint::decode_u32(data, &mut offset)?;
                    if offset == prev {
                        return Err(CoreError::new(Kind::MalformedVarint, "malformed varint for RLE count"));
                    }

                    let remaining = data.len() - offset;
                    if count as usize > remaining / 2 {
                        return Err(CoreError::new(Kind::MalformedVarint, "RLE count exceeds remaining data"));
                    }

                    stats.repeat_records += 1;
                    stats.repeat_samples += count as u64;

                    for _ in 0..count {
                        let delta = varint::decode_u64(data, &mut offset)?;
                        if offset >= data.len() {
                            return Err(CoreError::new(Kind::MalformedVarint, "unexpected end of sample data in RLE"));
                        }
                        let status = data[offset];
                        offset += 1;
                        ts.prev_timestamp += delta;

                        let stack = ts
                            .current_stack
                            .iter()
                            .map(|&idx| self.resolve_frame(idx))
                            .collect::<Result<Vec<_>>>()?;
                        samples.push(ReplayedSample {
                            thread_id,
                            interpreter_id,
                            status,
                            timestamp_us: ts.prev_timestamp,
                            stack,
                        });
                    }
                    stats.total_samples += count as u64;
                }
                STACK_FULL | STACK_SUFFIX | STACK_POP_PUSH => {
                    let prev = offset;
                    let delta = varint::decode_u64(data, &mut offset)?;
                    if offset == prev || offset >= data.len() {
                        return Err(CoreError::new(Kind::MalformedVarint, "malformed varint in sample data"));
                    }
                    let status = data[offset];
                    offset += 1;
                    ts.prev_timestamp += delta;

                    match encoding {
                        STACK_FULL => {
                            decode_stack_full(ts, data, &mut offset)?;
                            stats.full_records += 1;
                        }
                        STACK_SUFFIX => {
                            decode_stack_suffix(ts, data, &mut offset)?;
                            stats.suffix_records += 1;
                        }
                        _ => {
                            decode_stack_pop_push(ts, data, &mut offset)?;
                            stats.pop_push_records += 1;
                        }
                    }
                    stats.stack_reconstructions += 1;

                    let stack = ts
                        .current_stack
                        .iter()
                        .map(|&idx| self.resolve_frame(idx))
                        .collect::<Result<Vec<_>>>()?;
                    samples.push(ReplayedSample {
                        thread_id,
                        interpreter_id,
                        status,
                        timestamp_us: ts.prev_timestamp,
                        stack,
                    });
                    stats.total_samples += 1;
                }
                other => {
                    return Err(CoreError::new(Kind::MalformedVarint, format!("unknown stack encoding {}", other)));
                }
            }
        }

        Ok((samples, stats))
    }
}

fn decode_stack_full(ts: &mut ThreadState, data: &[u8], offset: &mut usize) -> Result<()> {
    let depth = varint::decode_u32(data, offset)? as usize;
    ts.current_stack.clear();
    for _ in 0..depth {
        ts.current_stack.push(varint::decode_u32(data, offset)?);
    }
    Ok(())
}

fn decode_stack_suffix(ts: &mut ThreadState, data: &[u8], offset: &mut usize) -> Result<()> {
    let shared = varint::decode_u32(data, offset)? as usize;
    let new_count = varint::decode_u32(data, offset)? as usize;

    if shared > ts.current_stack.len() {
        return Err(CoreError::new(Kind::MalformedVarint, "shared count exceeds current stack depth"));
    }

    let tail: Vec<u32> = ts.current_stack[ts.current_stack.len() - shared..].to_vec();
    let mut new_frames = Vec::with_capacity(new_count);
    for _ in 0..new_count {
        new_frames.push(varint::decode_u32(data, offset)?);
    }

    ts.current_stack = new_frames;
    ts.current_stack.extend(tail);
    Ok(())
}

fn decode_stack_pop_push(ts: &mut ThreadState, data: &[u8], offset: &mut usize) -> Result<()> {
    let pop = varint::decode_u32(data, offset)? as usize;
    let push = varint::decode_u32(data, offset)? as usize;

    let keep_start = pop.min(ts.current_stack.len());
    let kept: Vec<u32> = ts.current_stack[keep_start..].to_vec();

    let mut new_frames = Vec::with_capacity(push);
    for _ in 0..push {
        new_frames.push(varint::decode_u32(data, offset)?);
    }

    ts.current_stack = new_frames;
    ts.current_stack.extend(kept);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::writer::{Writer, COMPRESSION_NONE};
    use crate::types::{FrameInfo, InterpreterInfo, StatusFlags, ThreadInfo};

    fn sample_with(frames: Vec<FrameInfo>) -> Vec<InterpreterInfo> {
        vec![InterpreterInfo {
            interpreter_id: 0,
            threads: vec![ThreadInfo {
                thread_id: 7,
                status_flags: StatusFlags::empty(),
                frames,
            }],
        }]
    }

    #[test]
    fn replays_a_growing_then_shrinking_stack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tach");
        let mut writer = Writer::new(&path, 1000, COMPRESSION_NONE, 0).unwrap();

        writer.write_sample(&sample_with(vec![FrameInfo::native()]), 0).unwrap();
        writer
            .write_sample(&sample_with(vec![FrameInfo::native(), FrameInfo::gc()]), 1000)
            .unwrap();
        writer
            .write_sample(&sample_with(vec![FrameInfo::native(), FrameInfo::gc()]), 2000)
            .unwrap();
        writer.write_sample(&sample_with(vec![FrameInfo::native()]), 3000).unwrap();
        writer.finalize().unwrap();

        let reader = Reader::open(&path).unwrap();
        let (samples, stats) = reader.replay().unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0].stack.len(), 1);
        assert_eq!(samples[1].stack.len(), 2);
        assert_eq!(samples[2].stack.len(), 2);
        assert_eq!(samples[3].stack.len(), 1);
        assert_eq!(samples.last().unwrap().timestamp_us, 3000);
        assert!(stats.total_samples >= 4);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tach");
        std::fs::write(&path, [0u8; 128]).unwrap();
        assert!(Reader::open(&path).is_err());
    }

    #[test]
    fn rle_run_replays_identical_stack_for_every_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rle.tach");
        let mut writer = Writer::new(&path, 1000, COMPRESSION_NONE, 0).unwrap();
        for t in 0..5u64 {
            writer
                .write_sample(&sample_with(vec![FrameInfo::native()]), t * 1000)
                .unwrap();
        }
        let stats = writer.finalize().unwrap();
        assert!(stats.repeat_records >= 1);

        let reader = Reader::open(&path).unwrap();
        let (samples, _) = reader.replay().unwrap();
        assert_eq!(samples.len(), 5);
        assert!(samples.iter().all(|s| s.stack.len() == 1));
    }
}

//! Binary sample codec (C9/C10): the "TACH" format used by `record`/`dump`
//! to persist and replay profiling sessions.
//!
//! `Sample`, the per-tick value the collector's `Collect` loop produces and
//! `Writer::write_sample` consumes, is defined in `crate::collector` (it
//! carries collector-only fields like `error`/`late` alongside the
//! interpreters a `Writer` actually encodes) and is re-exported here so
//! callers can reach the whole record/replay surface through `tachyon::codec`.

pub mod reader;
pub mod varint;
pub mod writer;

pub use reader::{FileInfo, Reader, ReaderStats, ReplayedSample};
pub use writer::{Writer, WriterStats, COMPRESSION_NONE, COMPRESSION_ZSTD};

pub use crate::collector::Sample;

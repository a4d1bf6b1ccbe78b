//! Remote sampling profiler and asyncio task inspector for CPython
//! processes: reads threads, frames, and (optionally) asyncio tasks
//! directly out of a running interpreter's memory, without attaching a
//! debugger or pausing the target.
//!
//! Module layout follows `examples/benfred-py-spy/src/lib.rs`: one module
//! per concern, re-exported flatly from the crate root so `main.rs` and the
//! integration tests can reach everything through `tachyon::*`.

pub mod asyncio_walker;
pub mod binary_parser;
pub mod code_cache;
pub mod codec;
pub mod collector;
pub mod config;
pub mod dump;
pub mod error;
pub mod frame_cache;
pub mod frame_walker;
pub mod linetable;
pub mod memory;
pub mod object_reader;
pub mod subprocess;
pub mod threads;
pub mod timer;
pub mod types;
pub mod version;

pub use collector::{Attached, Collector, Sample};
pub use config::Config;
pub use error::{CoreError, Kind};

//! Shared data model (spec §3): debug offsets, resolved frames, threads,
//! interpreters and asyncio tasks.
//!
//! Grounded on `StackTrace`/`Frame` in
//! `examples/benfred-py-spy/src/stack_trace.rs` — same derive set
//! (`Debug, Clone, Serialize`) and the same preference for plain structs
//! over enums where the teacher does the same.

use serde_derive::Serialize;

use crate::version::TargetVersion;

pub type Pid = i32;

/// Offsets within the target's internal structs, published once per attach
/// (spec §3 "DebugOffsets"). All offsets are byte offsets from the start of
/// the named struct.
#[derive(Debug, Clone, Default)]
pub struct DebugOffsets {
    pub version: TargetVersion,

    pub runtime_state: RuntimeStateOffsets,
    pub interpreter_state: InterpreterStateOffsets,
    pub thread_state: ThreadStateOffsets,
    pub interpreter_frame: InterpreterFrameOffsets,
    pub code_object: CodeObjectOffsets,
    pub gen_object: GenObjectOffsets,
    pub pyobject: PyObjectOffsets,
    pub type_object: TypeObjectOffsets,
    pub long_object: LongObjectOffsets,
    pub unicode_object: UnicodeObjectOffsets,
    pub bytes_object: BytesObjectOffsets,
    pub set_object: SetObjectOffsets,
    pub llist_node: LlistNodeOffsets,
    pub gc_runtime_state: GcRuntimeStateOffsets,

    /// Offset of `tlbc_index` within `_PyInterpreterFrame`. Zero on a
    /// GIL-enabled target (the field doesn't exist there), matching the
    /// original's own "offset of zero means absent" convention for this
    /// field rather than the `all_nonzero` invariant the required groups use.
    pub interpreter_frame_tlbc_index: u64,
    /// Offset of `co_tlbc` within the code object. Zero means this target
    /// has no thread-local bytecode copies to redirect through.
    pub code_object_co_tlbc: u64,
    /// Offset of the interpreter's `tlbc_generation` counter. Read fresh
    /// every sample (spec §3's TLBC entry: "a generation mismatch
    /// invalidates the entry on next lookup").
    pub interpreter_state_tlbc_generation: u64,
}

macro_rules! offsets_struct {
    ($name:ident { $($field:ident),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name {
            pub size: u64,
            $(pub $field: u64,)+
        }

        impl $name {
            /// Every field in this group must be non-zero, per the
            /// DebugOffsets invariant in spec §3: "before use, each required
            /// offset must be non-zero".
            pub fn all_nonzero(&self) -> bool {
                $(self.$field != 0 &&)+ true
            }

            pub fn max_offset(&self) -> u64 {
                [$(self.$field),+].into_iter().max().unwrap_or(0)
            }
        }
    };
}

offsets_struct!(RuntimeStateOffsets {
    finalizing,
    interpreters_head,
    gc,
});
offsets_struct!(InterpreterStateOffsets {
    threads_head,
    threads_main,
    gc,
    modules,
    id,
});
offsets_struct!(ThreadStateOffsets {
    prev,
    next,
    interp,
    native_thread_id,
    thread_id,
    datastack_chunk,
    current_frame,
    status,
    holds_gil,
    gil_requested,
});
offsets_struct!(InterpreterFrameOffsets {
    previous,
    executable,
    instr_ptr,
    localsplus,
    owner,
});
offsets_struct!(CodeObjectOffsets {
    filename,
    qualname,
    linetable,
    firstlineno,
    argcount,
    co_code_adaptive,
});
offsets_struct!(GenObjectOffsets {
    gi_iframe,
    gi_frame_state,
    gi_task,
});
offsets_struct!(PyObjectOffsets { ob_type, });
offsets_struct!(TypeObjectOffsets { tp_name, tp_flags, });
offsets_struct!(LongObjectOffsets { ob_digit, lv_tag, });
offsets_struct!(UnicodeObjectOffsets { state, length, asciiobject_size, });
offsets_struct!(BytesObjectOffsets { ob_size, ob_sval, });
offsets_struct!(SetObjectOffsets { used, mask, table, });
offsets_struct!(LlistNodeOffsets { next, prev, });
offsets_struct!(GcRuntimeStateOffsets { collecting, });

impl DebugOffsets {
    /// Groups that must pass validation before this unwinder can be used,
    /// per spec §3's DebugOffsets invariant. A group's `size` must be at
    /// least as large as its largest referenced offset.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::{CoreError, Kind};

        macro_rules! check {
            ($group:expr, $name:literal) => {
                if !$group.all_nonzero() {
                    return Err(CoreError::new(
                        Kind::OffsetValidationFailed,
                        format!("{} has a zero offset", $name),
                    ));
                }
                if $group.size != 0 && $group.size < $group.max_offset() {
                    return Err(CoreError::new(
                        Kind::OffsetValidationFailed,
                        format!(
                            "{} size {} smaller than max referenced offset {}",
                            $name, $group.size, $group.max_offset()
                        ),
                    ));
                }
            };
        }

        check!(self.thread_state, "thread_state");
        check!(self.interpreter_frame, "interpreter_frame");
        check!(self.code_object, "code_object");
        check!(self.pyobject, "pyobject");
        check!(self.type_object, "type_object");
        Ok(())
    }
}

/// Optional, separately located offsets for asyncio task introspection
/// (spec §3 "AsyncioOffsets"). Presence is only required when an async
/// operation is requested.
#[derive(Debug, Clone, Default)]
pub struct AsyncioOffsets {
    pub task_object: AsyncioTaskOffsets,
    pub interpreter_state: AsyncioInterpStateOffsets,
    pub thread_state: AsyncioThreadStateOffsets,
}

offsets_struct!(AsyncioTaskOffsets {
    task_name,
    task_awaited_by,
    task_is_task,
    task_awaited_by_is_set,
    task_coro,
    task_node,
});
offsets_struct!(AsyncioInterpStateOffsets { asyncio_tasks_head, });
offsets_struct!(AsyncioThreadStateOffsets {
    asyncio_running_loop,
    asyncio_running_task,
    asyncio_tasks_head,
});

/// Minimal bitflags-style macro: the crate deliberately avoids adding the
/// `bitflags` dependency for a four-bit set, since nothing else in the
/// teacher stack pulls it in.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $flag:ident = $value:expr;)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct $name(pub $ty);

        impl $name {
            $(pub const $flag: $name = $name($value);)+

            pub fn empty() -> $name { $name(0) }
            pub fn contains(&self, other: $name) -> bool { self.0 & other.0 == other.0 }
            pub fn insert(&mut self, other: $name) { self.0 |= other.0; }
            pub fn remove(&mut self, other: $name) { self.0 &= !other.0; }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name { $name(self.0 | rhs.0) }
        }
    };
}

bitflags_like! {
    /// Status bits for a `ThreadInfo` (spec §6 "Status byte semantics").
    pub struct StatusFlags: u8 {
        const HAS_GIL = 1 << 0;
        const ON_CPU = 1 << 1;
        const UNKNOWN = 1 << 2;
        const GIL_REQUESTED = 1 << 3;
    }
}

/// Profiling mode (spec §4.6's Mode table): controls whether C7 probes the
/// OS for each thread's run state and which threads get skipped entirely
/// from a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No OS probe, never skip a thread.
    Wall,
    /// OS probe, skip threads not currently scheduled on a CPU.
    Cpu,
    /// No OS probe, skip threads that don't hold the GIL.
    Gil,
    /// OS probe, never skip a thread.
    All,
}

impl Default for Mode {
    fn default() -> Mode {
        Mode::Wall
    }
}

impl Mode {
    /// Whether C7 should query the OS for this thread's run state at all.
    pub fn probes_os(self) -> bool {
        matches!(self, Mode::Cpu | Mode::All)
    }

    /// Whether a thread already classified with `flags` should be omitted
    /// from this sample entirely.
    pub fn skip(self, flags: StatusFlags) -> bool {
        match self {
            Mode::Wall | Mode::All => false,
            Mode::Cpu => !flags.contains(StatusFlags::ON_CPU),
            Mode::Gil => !flags.contains(StatusFlags::HAS_GIL),
        }
    }
}

/// Per-frame resolved call site (spec §3 "FrameInfo"). Synthetic `<GC>`/
/// `<native>` frames are represented as a tagged variant rather than
/// sentinel strings per the "Design Notes" guidance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameInfo {
    pub kind: FrameKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum FrameKind {
    Python {
        file: String,
        qualname: String,
        location: Option<Location>,
        opcode: Option<u8>,
    },
    Gc,
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Location {
    pub line: i32,
    pub end_line: i32,
    pub col: i32,
    pub end_col: i32,
}

impl FrameInfo {
    pub fn gc() -> FrameInfo {
        FrameInfo { kind: FrameKind::Gc }
    }

    pub fn native() -> FrameInfo {
        FrameInfo { kind: FrameKind::Native }
    }

    pub fn python(
        file: String,
        qualname: String,
        location: Option<Location>,
        opcode: Option<u8>,
    ) -> FrameInfo {
        FrameInfo {
            kind: FrameKind::Python {
                file,
                qualname,
                location,
                opcode,
            },
        }
    }

    /// Well-known filename for synthetic frames per spec §3.
    pub fn file(&self) -> &str {
        match &self.kind {
            FrameKind::Python { file, .. } => file,
            FrameKind::Gc | FrameKind::Native => "~",
        }
    }

    pub fn qualname(&self) -> &str {
        match &self.kind {
            FrameKind::Python { qualname, .. } => qualname,
            FrameKind::Gc => "<GC>",
            FrameKind::Native => "<native>",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub thread_id: u64,
    pub status_flags: StatusFlags,
    pub frames: Vec<FrameInfo>,
}

impl ThreadInfo {
    /// Enforces the HAS_GIL/GIL_REQUESTED mutual exclusion invariant from
    /// spec §3: "if both would be set, a race was observed and only
    /// HAS_GIL is reported".
    pub fn normalize_status(mut flags: StatusFlags) -> StatusFlags {
        if flags.contains(StatusFlags::HAS_GIL) && flags.contains(StatusFlags::GIL_REQUESTED) {
            flags.remove(StatusFlags::GIL_REQUESTED);
        }
        flags
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InterpreterInfo {
    pub interpreter_id: u32,
    pub threads: Vec<ThreadInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub task_id: u64,
    pub task_name: String,
    pub coroutine_stack: Vec<FrameInfo>,
    pub awaited_by: Vec<TaskInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gil_exclusion_drops_requested() {
        let flags = StatusFlags::HAS_GIL | StatusFlags::GIL_REQUESTED;
        let normalized = ThreadInfo::normalize_status(flags);
        assert!(normalized.contains(StatusFlags::HAS_GIL));
        assert!(!normalized.contains(StatusFlags::GIL_REQUESTED));
    }

    #[test]
    fn synthetic_frames_use_tilde_filename() {
        assert_eq!(FrameInfo::gc().file(), "~");
        assert_eq!(FrameInfo::native().file(), "~");
        assert_eq!(FrameInfo::gc().qualname(), "<GC>");
    }

    #[test]
    fn offsets_validate_rejects_zero() {
        let offsets = DebugOffsets::default();
        assert!(offsets.validate().is_err());
    }

    #[test]
    fn mode_skip_policy_matches_spec_table() {
        let on_cpu = StatusFlags::ON_CPU;
        let has_gil = StatusFlags::HAS_GIL;
        let idle = StatusFlags::empty();

        assert!(!Mode::Wall.probes_os());
        assert!(!Mode::Wall.skip(idle));

        assert!(Mode::Cpu.probes_os());
        assert!(Mode::Cpu.skip(idle));
        assert!(!Mode::Cpu.skip(on_cpu));

        assert!(!Mode::Gil.probes_os());
        assert!(Mode::Gil.skip(idle));
        assert!(!Mode::Gil.skip(has_gil));

        assert!(Mode::All.probes_os());
        assert!(!Mode::All.skip(idle));
        assert!(!Mode::All.skip(on_cpu));
    }
}

//! Typed error kinds for the unwinder/codec core.
//!
//! The CLI and collector layers use `anyhow::Error` everywhere else (see
//! `src/collector.rs`, `src/config.rs`, `src/main.rs`), matching the teacher
//! crate. The core modules that need to distinguish *why* something failed
//! (so callers can decide whether to keep going, e.g. §7 of the spec) use
//! this hand-rolled enum instead, following the same manual `Display`/
//! `std::error::Error` pattern as `remoteprocess::Error`.

use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum Kind {
    RemoteReadFailed,
    OffsetValidationFailed,
    SectionNotFound,
    MalformedLineTable,
    MalformedVarint,
    MalformedSet,
    FrameChainBroken,
    UnhandledFrameOwner,
    SizeOutOfRange,
    IncompleteCompression,
    UnsupportedFormatVersion,
    AllocationFailed,
    NotSupportedOnPlatform,
    IoFailed,
    UnsupportedCompression,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Kind::RemoteReadFailed => "remote read failed",
            Kind::OffsetValidationFailed => "debug offsets failed validation",
            Kind::SectionNotFound => "metadata section not found in target binary",
            Kind::MalformedLineTable => "malformed line table",
            Kind::MalformedVarint => "malformed varint",
            Kind::MalformedSet => "malformed set object",
            Kind::FrameChainBroken => "frame chain is broken",
            Kind::UnhandledFrameOwner => "unhandled frame owner",
            Kind::SizeOutOfRange => "size exceeds hard cap",
            Kind::IncompleteCompression => "compressed stream did not end on a frame boundary",
            Kind::UnsupportedFormatVersion => "unsupported binary format version",
            Kind::AllocationFailed => "allocation failed",
            Kind::NotSupportedOnPlatform => "not supported on this platform",
            Kind::IoFailed => "I/O error",
            Kind::UnsupportedCompression => "compression type not compiled into this build",
        };
        write!(f, "{}", s)
    }
}

/// A core error: a `Kind` plus a human-readable message and optional source.
#[derive(Debug)]
pub struct CoreError {
    pub kind: Kind,
    pub message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CoreError {
    pub fn new(kind: Kind, message: impl Into<String>) -> CoreError {
        CoreError {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: Kind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> CoreError {
        CoreError {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> CoreError {
        CoreError::with_source(Kind::IoFailed, "I/O error", err)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[macro_export]
macro_rules! bail {
    ($kind:expr, $($arg:tt)*) => {
        return Err($crate::error::CoreError::new($kind, format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let e = CoreError::new(Kind::SectionNotFound, "AsyncioDebug");
        assert_eq!(format!("{}", e), "metadata section not found in target binary: AsyncioDebug");
    }

    #[test]
    fn source_roundtrips() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let e = CoreError::with_source(Kind::RemoteReadFailed, "read", io_err);
        assert!(std::error::Error::source(&e).is_some());
    }
}

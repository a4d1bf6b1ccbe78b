//! Target version triple, published as part of `DebugOffsets`.
//!
//! Grounded on `examples/benfred-py-spy/src/version.rs::Version`, but
//! simplified: the teacher scans a banner string out of process memory with
//! a regex because older CPython builds don't publish offsets at all. Here
//! the version triple is read directly out of the `DebugOffsets` blob (spec
//! §3), so no scanning is needed — we keep the `Display` impl and the
//! "targets must be from the same source tree family" framing from spec §1.

use serde_derive::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TargetVersion {
    pub major: u8,
    pub minor: u8,
    pub micro: u8,
}

impl TargetVersion {
    pub fn from_bytes(major: u8, minor: u8, micro: u8) -> TargetVersion {
        TargetVersion { major, minor, micro }
    }

    /// Whether this unwinder (built against a known family of offset
    /// layouts) can be expected to understand a target of this version.
    /// Per spec §1, cross-family offset guessing is a non-goal: we only
    /// assert the major version is one we know about.
    pub fn is_supported_family(&self) -> bool {
        self.major == 3 && self.minor >= 9
    }
}

impl std::fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_dotted_triple() {
        let v = TargetVersion::from_bytes(3, 13, 1);
        assert_eq!(format!("{}", v), "3.13.1");
    }

    #[test]
    fn unsupported_family_is_flagged() {
        let v = TargetVersion::from_bytes(2, 7, 18);
        assert!(!v.is_supported_family());
    }
}

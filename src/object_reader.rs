//! C2 — Typed object decoders.
//!
//! Turns raw bytes read through `Target` (C1) into Rust values for the
//! handful of CPython object layouts the unwinder and asyncio walker care
//! about: unicode strings, bytes, and small `PyLong`s.
//!
//! Grounded on `examples/original_source/Modules/_remote_debugging/object_reading.c`
//! (`read_py_str`, `read_py_bytes`, `read_py_long`) for exact layout and
//! bounds-checking semantics, and on
//! `examples/benfred-py-spy/src/python_data_access.rs` (`copy_string`,
//! `copy_bytes`, `copy_long`) for the Rust-idiomatic shape: plain functions
//! taking a memory gateway and an offsets table, returning `Result<T>`
//! instead of raising a Python exception.

use crate::error::{CoreError, Kind, Result};
use crate::memory::Target;
use crate::types::{BytesObjectOffsets, LongObjectOffsets, UnicodeObjectOffsets};

/// Hard ceiling on string/bytes length we'll ever allocate for, mirroring
/// `read_py_str`/`read_py_bytes`'s `max_len` bounds check — a corrupted or
/// racing target must never make us allocate an unbounded buffer.
pub const MAX_OBJECT_LEN: i64 = 4 * 1024 * 1024;

/// Digit width for `PyLongObject`, matching CPython's default build
/// (`PYLONG_BITS_IN_DIGIT` = 30 on 64-bit platforms).
const PYLONG_BITS_IN_DIGIT: u32 = 30;

/// Reads a `PyUnicodeObject` at `address`, following
/// `object_reading.c::read_py_str`: read the fixed-size header first to get
/// `length`, validate it against `max_len`, then read `length` bytes
/// starting at `asciiobject_size` and decode as UTF-8.
///
/// This only handles the compact-ASCII representation (`asciiobject_size`
/// bytes of header followed by inline 1-byte-per-char data), which is the
/// layout every string this crate reads (names, filenames) uses in
/// practice; PEP 393 non-ASCII kinds are out of scope per spec §2.
pub fn read_py_str(target: &Target, offsets: &UnicodeObjectOffsets, address: u64) -> Result<String> {
    let len = target.read_struct::<i64>(address + offsets.length)?;
    if len < 0 || len > MAX_OBJECT_LEN {
        return Err(CoreError::new(
            Kind::SizeOutOfRange,
            format!("invalid unicode length {} at 0x{:x}", len, address),
        ));
    }
    let data = target.read(address + offsets.asciiobject_size, len as usize)?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Reads a `PyBytesObject` at `address`, following
/// `object_reading.c::read_py_bytes`.
pub fn read_py_bytes(target: &Target, offsets: &BytesObjectOffsets, address: u64) -> Result<Vec<u8>> {
    let len = target.read_struct::<i64>(address + offsets.ob_size)?;
    if len < 0 || len > MAX_OBJECT_LEN {
        return Err(CoreError::new(
            Kind::SizeOutOfRange,
            format!("invalid bytes length {} at 0x{:x}", len, address),
        ));
    }
    target.read(address + offsets.ob_sval, len as usize)
}

/// Reads a `PyLongObject` at `address` and returns its value as an `i64`,
/// following `object_reading.c::read_py_long`. As in the original, this is
/// only ever used for small integers (task ids, reference counts) where
/// overflow past `i64` cannot occur in practice; values whose digit count
/// would overflow return `SizeOutOfRange` rather than silently wrapping.
pub fn read_py_long(target: &Target, offsets: &LongObjectOffsets, address: u64) -> Result<i64> {
    let lv_tag = target.read_struct::<u64>(address + offsets.lv_tag)?;
    let negative = (lv_tag & 3) == 2;
    let size = (lv_tag >> 3) as i64;

    if size == 0 {
        return Ok(0);
    }
    if size > 4 {
        return Err(CoreError::new(
            Kind::SizeOutOfRange,
            format!("PyLong at 0x{:x} has {} digits, too large for this unwinder", address, size),
        ));
    }

    let digit_bytes = target.read(address + offsets.ob_digit, size as usize * 4)?;
    let mut value: i64 = 0;
    for i in 0..size as usize {
        let digit = u32::from_ne_bytes(digit_bytes[i * 4..i * 4 + 4].try_into().unwrap()) as i64;
        value += digit << (PYLONG_BITS_IN_DIGIT as i64 * i as i64);
    }
    if negative {
        value = -value;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LocalTarget;

    #[test]
    fn local_target_roundtrips_bytes() {
        let data = [0xde, 0xad, 0xbe, 0xef];
        let local = LocalTarget;
        let copy = local.read(data.as_ptr() as u64, 4).unwrap();
        assert_eq!(copy, vec![0xde, 0xad, 0xbe, 0xef]);
    }
}

//! Tagged big-endian variable-length integers.
//!
//! The tag lives in the top bits of the first byte:
//!
//! ```text
//!  7 bits   0xxx xxxx
//! 14 bits   10xx xxxx  xxxx xxxx
//! 29 bits   110x xxxx  xxxx xxxx  xxxx xxxx  xxxx xxxx
//! 61 bits   111x xxxx  (7 more bytes)
//! ```
//!
//! Signed integers use the same tiers on ranges halved to fit the sign bit,
//! stored two's-complement in the available low bits. Magnitudes are limited
//! to 2^53 - 1 so every value survives a round-trip through an IEEE double.

use crate::buffer::{Reader, Writer};
use crate::error::CodecError;
use crate::MAX_SAFE_INTEGER;

const TAG_2: u8 = 0x80;
const TAG_4: u8 = 0xc0;
const TAG_8: u8 = 0xe0;

const MASK_8: u64 = 0x1fff_ffff_ffff_ffff;
const MAX_SAFE_SIGNED: i64 = MAX_SAFE_INTEGER as i64;

/// Writes an unsigned integer using the smallest tier.
pub fn write_uint(w: &mut Writer, u: u64, path: &str) -> Result<(), CodecError> {
    if u > MAX_SAFE_INTEGER {
        return Err(CodecError::malformed("unsigned integer", path));
    }
    put_uint(w, u);
    Ok(())
}

/// Writes the length of an in-memory collection.
pub(crate) fn write_len(w: &mut Writer, len: usize) {
    debug_assert!(len as u64 <= MAX_SAFE_INTEGER);
    put_uint(w, len as u64);
}

fn put_uint(w: &mut Writer, u: u64) {
    if u < 1 << 7 {
        w.put_u8(u as u8);
    } else if u < 1 << 14 {
        w.put_u16(u as u16 | 0x8000);
    } else if u < 1 << 29 {
        w.put_u32(u as u32 | 0xc000_0000);
    } else {
        w.put_u64(u | 0xe000_0000_0000_0000);
    }
}

/// Reads an unsigned integer.
pub fn read_uint(r: &mut Reader<'_>) -> Result<u64, CodecError> {
    let first = r.peek_u8()?;
    let u = if first & 0x80 == 0 {
        r.read_u8()? as u64
    } else if first & TAG_4 == TAG_2 {
        (r.read_u16()? & 0x3fff) as u64
    } else if first & TAG_8 == TAG_4 {
        (r.read_u32()? & 0x1fff_ffff) as u64
    } else {
        let u = r.read_u64()? & MASK_8;
        if u > MAX_SAFE_INTEGER {
            return Err(CodecError::malformed("unsigned integer", ""));
        }
        u
    };
    Ok(u)
}

/// Writes a signed integer using the smallest tier.
pub fn write_int(w: &mut Writer, i: i64, path: &str) -> Result<(), CodecError> {
    if !(-MAX_SAFE_SIGNED..=MAX_SAFE_SIGNED).contains(&i) {
        return Err(CodecError::malformed("signed integer", path));
    }

    if (-(1 << 6)..1 << 6).contains(&i) {
        w.put_u8((i & 0x7f) as u8);
    } else if (-(1 << 13)..1 << 13).contains(&i) {
        w.put_u16((i & 0x3fff) as u16 | 0x8000);
    } else if (-(1 << 28)..1 << 28).contains(&i) {
        w.put_u32((i & 0x1fff_ffff) as u32 | 0xc000_0000);
    } else {
        w.put_u64((i as u64 & MASK_8) | 0xe000_0000_0000_0000);
    }
    Ok(())
}

/// Reads a signed integer.
pub fn read_int(r: &mut Reader<'_>) -> Result<i64, CodecError> {
    let first = r.peek_u8()?;
    let i = if first & 0x80 == 0 {
        sign_extend(r.read_u8()? as u64, 7)
    } else if first & TAG_4 == TAG_2 {
        sign_extend((r.read_u16()? & 0x3fff) as u64, 14)
    } else if first & TAG_8 == TAG_4 {
        sign_extend((r.read_u32()? & 0x1fff_ffff) as u64, 29)
    } else {
        let i = sign_extend(r.read_u64()? & MASK_8, 61);
        if !(-MAX_SAFE_SIGNED..=MAX_SAFE_SIGNED).contains(&i) {
            return Err(CodecError::malformed("signed integer", ""));
        }
        i
    };
    Ok(i)
}

fn sign_extend(v: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((v << shift) as i64) >> shift
}

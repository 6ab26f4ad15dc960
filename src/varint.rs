// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Zero-copy varint/fixed-width decoding primitives.
//!
//! Every function here takes the *remaining, already-bounded* byte slice
//! (the caller's "cursor up to limit") and returns the decoded value plus
//! the number of bytes it consumed. None of these functions allocate, and
//! all of them fail with [`DecodeError::Truncated`] rather than reading
//! past the end of `buf`, matching the 10-byte (resp. 5-byte) varint
//! termination rules of the protobuf wire format.

use crate::error::DecodeError;

/// Reads a LEB128-style unsigned varint of at most 5 bytes (32-bit range).
///
/// Mirrors the reference decoder's behavior of only inspecting the low 4
/// bits of the 5th byte; any high bits set there are silently ignored,
/// matching decoders that read a negative 64-bit varint (10 bytes) by
/// truncating to the low 32 bits.
pub fn read_varuint32(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut val: u32 = 0;
    for i in 0..5 {
        let byte = *buf.get(i).ok_or(DecodeError::Truncated)?;
        if i == 4 {
            val |= u32::from(byte & 0x0f) << (7 * i);
            return Ok((val, i + 1));
        }
        val |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((val, i + 1));
        }
    }
    unreachable!()
}

/// Reads a LEB128-style unsigned varint of at most 10 bytes (64-bit range).
///
/// The 10th byte contributes only its lowest bit, as in the 32-bit case.
pub fn read_varuint64(buf: &[u8]) -> Result<(u64, usize), DecodeError> {
    let mut val: u64 = 0;
    for i in 0..10 {
        let byte = *buf.get(i).ok_or(DecodeError::Truncated)?;
        if i == 9 {
            val |= u64::from(byte & 0x01) << (7 * i);
            return Ok((val, i + 1));
        }
        val |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((val, i + 1));
        }
    }
    unreachable!()
}

/// Zig-zag decodes a 32-bit unsigned varint into its signed value.
#[inline]
pub fn zigzag_decode32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

/// Zig-zag decodes a 64-bit unsigned varint into its signed value.
#[inline]
pub fn zigzag_decode64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// Reads a zig-zag encoded signed 32-bit varint.
pub fn read_varsint32(buf: &[u8]) -> Result<(i32, usize), DecodeError> {
    let (raw, n) = read_varuint32(buf)?;
    Ok((zigzag_decode32(raw), n))
}

/// Reads a zig-zag encoded signed 64-bit varint.
pub fn read_varsint64(buf: &[u8]) -> Result<(i64, usize), DecodeError> {
    let (raw, n) = read_varuint64(buf)?;
    Ok((zigzag_decode64(raw), n))
}

/// Reads a plain (non-zig-zag) signed 64-bit varint, as used for protobuf
/// `int64`/`sint64`-as-int64 fields that rely on two's-complement
/// wraparound rather than zig-zag mapping.
pub fn read_varint64(buf: &[u8]) -> Result<(i64, usize), DecodeError> {
    let (raw, n) = read_varuint64(buf)?;
    Ok((raw as i64, n))
}

/// Reads a little-endian IEEE-754 `f32` / fixed32.
pub fn read_fixed32_le(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let bytes: [u8; 4] = buf
        .get(..4)
        .ok_or(DecodeError::Truncated)?
        .try_into()
        .unwrap();
    Ok((u32::from_le_bytes(bytes), 4))
}

/// Reads a little-endian IEEE-754 `f64` / fixed64.
pub fn read_fixed64_le(buf: &[u8]) -> Result<(u64, usize), DecodeError> {
    let bytes: [u8; 8] = buf
        .get(..8)
        .ok_or(DecodeError::Truncated)?
        .try_into()
        .unwrap();
    Ok((u64::from_le_bytes(bytes), 8))
}

/// Advances past a varint without decoding its numeric value, returning the
/// number of bytes it occupied.
pub fn skip_varint(buf: &[u8]) -> Result<usize, DecodeError> {
    for i in 0..10 {
        let byte = *buf.get(i).ok_or(DecodeError::Truncated)?;
        if byte & 0x80 == 0 {
            return Ok(i + 1);
        }
    }
    Err(DecodeError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varuint32_single_byte() {
        assert_eq!(read_varuint32(&[0x01]).unwrap(), (1, 1));
        assert_eq!(read_varuint32(&[0x7f]).unwrap(), (127, 1));
    }

    #[test]
    fn varuint32_multi_byte() {
        // 300 = 0b1_0010_1100 -> low7=0x2c|0x80, next=0x02
        assert_eq!(read_varuint32(&[0xac, 0x02]).unwrap(), (300, 2));
    }

    #[test]
    fn varuint32_truncated() {
        assert_eq!(read_varuint32(&[0x80]), Err(DecodeError::Truncated));
        assert_eq!(read_varuint32(&[]), Err(DecodeError::Truncated));
    }

    #[test]
    fn varuint32_ignores_high_bits_of_fifth_byte() {
        // A 10-byte encoding of a negative i64, truncated the way a producer
        // emitting sint64-as-varint for small negative int32 values would.
        let buf = [0xff, 0xff, 0xff, 0xff, 0x0f];
        assert_eq!(read_varuint32(&buf).unwrap(), (u32::MAX, 5));
    }

    #[test]
    fn zigzag_roundtrip() {
        assert_eq!(zigzag_decode64(0), 0);
        assert_eq!(zigzag_decode64(1), -1);
        assert_eq!(zigzag_decode64(2), 1);
        assert_eq!(zigzag_decode64(3), -2);
    }

    #[test]
    fn skip_varint_multi_byte() {
        assert_eq!(skip_varint(&[0xac, 0x02, 0xff]).unwrap(), 2);
    }

    #[test]
    fn fixed_width_reads() {
        assert_eq!(read_fixed32_le(&[1, 0, 0, 0]).unwrap(), (1, 4));
        assert_eq!(read_fixed64_le(&[1, 0, 0, 0, 0, 0, 0, 0]).unwrap(), (1, 8));
        assert_eq!(read_fixed32_le(&[1, 0, 0]), Err(DecodeError::Truncated));
    }
}

// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! A minimal protobuf wire-format scanner layered on [`crate::varint`].
//!
//! [`ByteReader`] holds the remaining, already-bounded slice for the
//! current message; every read advances it and nothing here ever looks
//! past its end. Sub-messages are scanned by handing a fresh `ByteReader`
//! over the slice returned from [`ByteReader::read_length_delimited`] -
//! there is no separate "limit" parameter to thread through by hand.

use crate::error::DecodeError;
use crate::varint;

/// Protobuf wire types this crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    I64,
    Len,
    I32,
}

impl WireType {
    fn from_raw(raw: u32) -> Result<Self, DecodeError> {
        match raw {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::I64),
            2 => Ok(WireType::Len),
            5 => Ok(WireType::I32),
            other => Err(DecodeError::BadWireType(other)),
        }
    }
}

/// Zero-copy cursor over a byte slice, bounds-checked on every read.
#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// The unconsumed slice, still bounded by the message's own limit.
    pub fn remaining_slice(&self) -> &'a [u8] {
        self.buf
    }

    fn advance(&mut self, n: usize) -> &'a [u8] {
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        head
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.buf.len() {
            return Err(DecodeError::Truncated);
        }
        Ok(self.advance(n))
    }

    pub fn read_varuint32(&mut self) -> Result<u32, DecodeError> {
        let (val, n) = varint::read_varuint32(self.buf)?;
        self.advance(n);
        Ok(val)
    }

    pub fn read_varuint64(&mut self) -> Result<u64, DecodeError> {
        let (val, n) = varint::read_varuint64(self.buf)?;
        self.advance(n);
        Ok(val)
    }

    pub fn read_varsint32(&mut self) -> Result<i32, DecodeError> {
        let (val, n) = varint::read_varsint32(self.buf)?;
        self.advance(n);
        Ok(val)
    }

    pub fn read_varsint64(&mut self) -> Result<i64, DecodeError> {
        let (val, n) = varint::read_varsint64(self.buf)?;
        self.advance(n);
        Ok(val)
    }

    pub fn read_varint64(&mut self) -> Result<i64, DecodeError> {
        let (val, n) = varint::read_varint64(self.buf)?;
        self.advance(n);
        Ok(val)
    }

    pub fn read_fixed32_le(&mut self) -> Result<u32, DecodeError> {
        let (val, n) = varint::read_fixed32_le(self.buf)?;
        self.advance(n);
        Ok(val)
    }

    pub fn read_fixed64_le(&mut self) -> Result<u64, DecodeError> {
        let (val, n) = varint::read_fixed64_le(self.buf)?;
        self.advance(n);
        Ok(val)
    }

    pub fn skip_varint(&mut self) -> Result<(), DecodeError> {
        let n = varint::skip_varint(self.buf)?;
        self.advance(n);
        Ok(())
    }

    /// Reads a varuint length prefix, then returns exactly that many bytes
    /// as a fresh sub-slice, zero-copy, failing `Truncated` if the length
    /// exceeds what remains.
    pub fn read_length_delimited(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_varuint32()? as usize;
        self.read_bytes(len)
    }

    /// Reads a `(field_number, wire_type)` tag key.
    pub fn read_field_key(&mut self) -> Result<(u32, WireType), DecodeError> {
        let key = self.read_varuint32()?;
        let wire_type = WireType::from_raw(key & 0x7)?;
        Ok((key >> 3, wire_type))
    }

    /// Consumes exactly one field's value of the given wire type, without
    /// interpreting it.
    pub fn skip_unknown(&mut self, wire_type: WireType) -> Result<(), DecodeError> {
        match wire_type {
            WireType::Varint => self.skip_varint(),
            WireType::I64 => self.read_bytes(8).map(|_| ()),
            WireType::I32 => self.read_bytes(4).map(|_| ()),
            WireType::Len => self.read_length_delimited().map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(field: u32, wt: u32) -> u8 {
        ((field << 3) | wt) as u8
    }

    #[test]
    fn reads_field_key() {
        let buf = [key(1, 0)];
        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_field_key().unwrap(), (1, WireType::Varint));
    }

    #[test]
    fn bad_wire_type_is_fatal() {
        let buf = [key(1, 6)];
        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_field_key(), Err(DecodeError::BadWireType(6)));
    }

    #[test]
    fn skip_unknown_len_field() {
        // field 2, LEN, length 3, payload "abc", then one more byte.
        let buf = [key(2, 2), 3, b'a', b'b', b'c', 0xff];
        let mut r = ByteReader::new(&buf);
        let (field, wt) = r.read_field_key().unwrap();
        assert_eq!(field, 2);
        r.skip_unknown(wt).unwrap();
        assert_eq!(r.remaining_slice(), &[0xff]);
    }

    #[test]
    fn length_delimited_truncated() {
        let buf = [5u8, b'a', b'b']; // claims 5 bytes, only 2 remain
        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_length_delimited(), Err(DecodeError::Truncated));
    }
}

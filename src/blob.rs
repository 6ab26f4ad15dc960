// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The blob framing layer: `4-byte header length | header message | payload
//! message`, repeated until EOF. This module only frames and classifies
//! blobs - actual DEFLATE decompression happens in [`crate::pool`], which is
//! where the parallel work lives.

use std::io::Read;

use byteorder::ByteOrder;

use crate::error::{Error, FramingError};
use crate::wire::{ByteReader, WireType};

/// Header length must fit in this many bytes (64 KiB).
pub const MAX_HEADER_LEN: u64 = 64 * 1024;
/// Payload size must fit in this many bytes (64 MiB).
pub const MAX_PAYLOAD_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Header,
    Data,
}

/// The payload half of a blob, still in whatever form the wire carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobPayload {
    Raw(Vec<u8>),
    Zlib { data: Vec<u8>, raw_size: usize },
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlob {
    pub kind: BlobKind,
    pub payload: BlobPayload,
}

/// Scans a byte stream for successive framed blobs.
pub struct BlobFramer<R> {
    reader: R,
    header_scratch: Vec<u8>,
    payload_scratch: Vec<u8>,
}

impl<R: Read> BlobFramer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            header_scratch: Vec::new(),
            payload_scratch: Vec::new(),
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Reads and classifies the next blob, or `Ok(None)` at a clean EOF
    /// (zero bytes read where a header-length prefix was expected).
    pub fn read_next(&mut self) -> Result<Option<RawBlob>, Error> {
        let header_len = match self.read_header_length()? {
            Some(len) => len,
            None => return Ok(None),
        };
        if header_len as u64 > MAX_HEADER_LEN {
            return Err(FramingError::HeaderTooLarge.into());
        }

        self.header_scratch.resize(header_len, 0);
        self.reader
            .read_exact(&mut self.header_scratch)
            .map_err(|_| Error::from(FramingError::ShortHeader))?;
        let (kind, datasize) = parse_blob_header(&self.header_scratch)?;

        if datasize as u64 > MAX_PAYLOAD_LEN {
            return Err(FramingError::PayloadTooLarge.into());
        }

        self.payload_scratch.resize(datasize, 0);
        self.reader
            .read_exact(&mut self.payload_scratch)
            .map_err(|_| Error::from(FramingError::ShortHeader))?;
        let payload = parse_blob_payload(&self.payload_scratch)?;

        Ok(Some(RawBlob { kind, payload }))
    }

    /// Reads the 4-byte big-endian length prefix. Returns `None` only when
    /// the stream ended exactly on a blob boundary.
    fn read_header_length(&mut self) -> Result<Option<usize>, Error> {
        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < 4 {
            let n = self
                .reader
                .read(&mut buf[read..])
                .map_err(Error::from)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        if read == 0 {
            return Ok(None);
        }
        if read < 4 {
            return Err(FramingError::ShortHeader.into());
        }
        Ok(Some(byteorder::BigEndian::read_u32(&buf) as usize))
    }
}

/// Parses a `BlobHeader { type: string = 1, indexdata: bytes = 2 (ignored),
/// datasize: varint = 3 }` message.
fn parse_blob_header(buf: &[u8]) -> Result<(BlobKind, usize), Error> {
    let mut r = ByteReader::new(buf);
    let mut kind: Option<BlobKind> = None;
    let mut datasize: Option<usize> = None;

    while !r.is_empty() {
        let (field, wire_type) = r.read_field_key()?;
        match (field, wire_type) {
            (1, WireType::Len) => {
                let raw = r.read_length_delimited()?;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| FramingError::UnknownBlobType(String::from_utf8_lossy(raw).into_owned()))?;
                kind = Some(match s {
                    "OSMHeader" => BlobKind::Header,
                    "OSMData" => BlobKind::Data,
                    other => return Err(FramingError::UnknownBlobType(other.to_string()).into()),
                });
            }
            (3, WireType::Varint) => {
                datasize = Some(r.read_varuint64()? as usize);
            }
            (_, wt) => r.skip_unknown(wt)?,
        }
    }

    let kind = kind.ok_or_else(|| FramingError::UnknownBlobType(String::new()))?;
    let datasize = datasize.unwrap_or(0);
    Ok((kind, datasize))
}

/// Parses a `Blob { raw: bytes = 1, raw_size: varint = 2, zlib_data: bytes =
/// 3 }` message. Exactly one of `raw`/`zlib_data` is expected to carry
/// content; both absent is a valid empty blob.
fn parse_blob_payload(buf: &[u8]) -> Result<BlobPayload, Error> {
    let mut r = ByteReader::new(buf);
    let mut raw: Option<Vec<u8>> = None;
    let mut raw_size: Option<usize> = None;
    let mut zlib_data: Option<Vec<u8>> = None;

    while !r.is_empty() {
        let (field, wire_type) = r.read_field_key()?;
        match (field, wire_type) {
            (1, WireType::Len) => raw = Some(r.read_length_delimited()?.to_vec()),
            (2, WireType::Varint) => raw_size = Some(r.read_varuint64()? as usize),
            (3, WireType::Len) => zlib_data = Some(r.read_length_delimited()?.to_vec()),
            (_, wt) => r.skip_unknown(wt)?,
        }
    }

    match (raw, zlib_data) {
        (Some(data), _) => Ok(BlobPayload::Raw(data)),
        (None, Some(data)) => Ok(BlobPayload::Zlib {
            data,
            raw_size: raw_size.unwrap_or(0),
        }),
        (None, None) => Ok(BlobPayload::Empty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_bytes(mut v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if v == 0 {
                break;
            }
        }
        out
    }

    fn len_field(field: u32, bytes: &[u8]) -> Vec<u8> {
        let mut out = varint_bytes(u64::from((field << 3) | 2));
        out.extend(varint_bytes(bytes.len() as u64));
        out.extend_from_slice(bytes);
        out
    }

    fn varint_field(field: u32, value: u64) -> Vec<u8> {
        let mut out = varint_bytes(u64::from(field << 3));
        out.extend(varint_bytes(value));
        out
    }

    fn encode_blob(kind_str: &str, payload: &[u8]) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend(len_field(1, kind_str.as_bytes()));
        header.extend(varint_field(3, payload.len() as u64));

        let mut out = Vec::new();
        out.extend((header.len() as u32).to_be_bytes());
        out.extend(header);
        out.extend(payload);
        out
    }

    #[test]
    fn reads_raw_data_blob() {
        let mut payload = Vec::new();
        payload.extend(len_field(1, b"hello"));
        let stream = encode_blob("OSMData", &payload);

        let mut framer = BlobFramer::new(std::io::Cursor::new(stream));
        let blob = framer.read_next().unwrap().unwrap();
        assert_eq!(blob.kind, BlobKind::Data);
        assert_eq!(blob.payload, BlobPayload::Raw(b"hello".to_vec()));
        assert!(framer.read_next().unwrap().is_none());
    }

    #[test]
    fn reads_zlib_blob_with_raw_size() {
        let mut payload = Vec::new();
        payload.extend(varint_field(2, 123));
        payload.extend(len_field(3, b"zz"));
        let stream = encode_blob("OSMData", &payload);

        let mut framer = BlobFramer::new(std::io::Cursor::new(stream));
        let blob = framer.read_next().unwrap().unwrap();
        assert_eq!(
            blob.payload,
            BlobPayload::Zlib {
                data: b"zz".to_vec(),
                raw_size: 123,
            }
        );
    }

    #[test]
    fn unknown_blob_type_is_fatal() {
        let stream = encode_blob("OSMWeird", b"");
        let mut framer = BlobFramer::new(std::io::Cursor::new(stream));
        assert!(framer.read_next().is_err());
    }

    #[test]
    fn clean_eof_at_blob_boundary() {
        let mut framer = BlobFramer::new(std::io::Cursor::new(Vec::<u8>::new()));
        assert!(framer.read_next().unwrap().is_none());
    }

    #[test]
    fn short_header_is_fatal() {
        let stream = vec![0u8, 0, 0, 10]; // claims 10 header bytes, none follow
        let mut framer = BlobFramer::new(std::io::Cursor::new(stream));
        assert!(framer.read_next().is_err());
    }
}

// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The stable error taxonomy for the reader: format probing, blob framing,
//! and in-block decoding are independent failure axes.

use thiserror::Error;

/// Top-level error returned by any reader operation.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

/// Errors raised while probing or validating the overall file format.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("input matches neither the PBF nor the textual OSM framing")]
    Unknown,
    #[error("unsupported required feature: {0}")]
    UnsupportedFeature(String),
}

/// Errors raised while reading the blob-framing layer (binary path only).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("blob header was shorter than its declared length")]
    ShortHeader,
    #[error("blob header length exceeds 64 KiB")]
    HeaderTooLarge,
    #[error("blob payload size exceeds 64 MiB")]
    PayloadTooLarge,
    #[error("unknown blob type {0:?}")]
    UnknownBlobType(String),
}

/// Errors raised while decoding the contents of a block (either path).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("a field claims more bytes than remain in its enclosing message")]
    Truncated,
    #[error("unsupported protobuf wire type {0}")]
    BadWireType(u32),
    #[error("relation member arrays (roles/memids/types) have mismatched lengths")]
    MalformedRelation,
    #[error("coordinate out of range after reconstruction: lat={lat}, lon={lon}")]
    OutOfRangeCoordinate { lat: f64, lon: f64 },
    #[error("string table index {0} is out of range")]
    StringIndexOutOfRange(u32),
    #[error("blob decompression failed or produced the wrong number of bytes")]
    DecompressFailed,
    #[error("declared uncompressed size exceeds 100x the compressed size")]
    CompressedRatioTooHigh,
    #[error("textual intern arena overflowed its bound")]
    InternOverflow,
    #[error("textual decoder detected a nested-entity style attack")]
    NestedEntityAttack,
    #[error("malformed XML: {0}")]
    Xml(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! A streaming, single-pass reader for OpenStreetMap data in both its
//! compact binary (`.osm.pbf`) and textual (`.osm` XML) serializations.
//!
//! Callers drive the reader through [`Reader::open`] /
//! [`Reader::process_next_block`] / [`Reader::reset`], implementing
//! [`Callbacks`] to receive primitives as they are decoded. Every string
//! surfaced to a callback borrows from a buffer the reader owns; none of it
//! may be retained past the callback's return (see [`model`] for the exact
//! ownership contract).
//!
//! This crate only reads. It does not write either format, does not support
//! random access, does not assemble geometry, and does not transform
//! coordinates - all of that is left to downstream consumers.

#![forbid(unsafe_code)]

pub mod binary;
pub mod blob;
pub mod config;
pub mod error;
pub mod model;
pub mod pool;
mod reader;
pub mod varint;
pub mod wire;
pub mod xml;

pub use config::{NumThreads, ReaderConfig};
pub use error::{DecodeError, Error, FormatError, FramingError, Result};
pub use model::{Bounds, Info, Member, MemberType, Node, Relation, Tag, Timestamp, Way};
pub use reader::{Advance, Callbacks, NoopCallbacks, Reader};

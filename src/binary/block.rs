// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! PrimitiveBlock and HeaderBlock decoding.
//!
//! Block-level scaling parameters (`granularity`, `lat_offset`,
//! `lon_offset`, `date_granularity`) may appear after the string table in
//! the wire encoding, so the block is scanned twice: once to discover the
//! parameters, once to decode the string table and primitive groups with
//! those parameters already in hand.

use crate::binary::dense::{self, decode_dense_nodes};
use crate::binary::strtable::StringTable;
use crate::error::{DecodeError, Error, FormatError};
use crate::model::{Bounds, Info, Member, MemberType, Node, Relation, Tag, Timestamp, Way};
use crate::wire::{ByteReader, WireType};

#[derive(Debug, Clone, Copy)]
pub struct BlockParams {
    pub granularity: i32,
    pub date_granularity: i32,
    pub lat_offset: i64,
    pub lon_offset: i64,
}

impl Default for BlockParams {
    fn default() -> Self {
        Self {
            granularity: 100,
            date_granularity: 1000,
            lat_offset: 0,
            lon_offset: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct DecodedBlock<'a> {
    pub nodes: Vec<Node<'a>>,
    pub ways: Vec<Way<'a>>,
    pub relations: Vec<Relation<'a>>,
}

/// Recognized `required_features` values; anything else is rejected.
const KNOWN_REQUIRED_FEATURES: [&str; 2] = ["OsmSchema-V0.6", "DenseNodes"];

pub struct DecodedHeader {
    pub bounds: Option<Bounds>,
}

/// Decodes a `HeaderBlock` payload (the `OSMHeader` blob kind).
pub fn decode_header_block(buf: &[u8]) -> Result<DecodedHeader, Error> {
    let mut bbox_buf: Option<&[u8]> = None;
    let mut required_features: Vec<String> = Vec::new();

    let mut r = ByteReader::new(buf);
    while !r.is_empty() {
        let (field, wire_type) = r.read_field_key()?;
        match (field, wire_type) {
            (1, WireType::Len) => bbox_buf = Some(r.read_length_delimited()?),
            (4, WireType::Len) => {
                let raw = r.read_length_delimited()?;
                let s = std::str::from_utf8(raw).map_err(|_| DecodeError::Truncated)?;
                required_features.push(s.to_string());
            }
            (_, wt) => r.skip_unknown(wt)?,
        }
    }

    for feature in &required_features {
        if !KNOWN_REQUIRED_FEATURES.contains(&feature.as_str()) {
            return Err(FormatError::UnsupportedFeature(feature.clone()).into());
        }
    }

    let bounds = bbox_buf.map(decode_bbox).transpose()?;
    Ok(DecodedHeader { bounds })
}

fn decode_bbox(buf: &[u8]) -> Result<Bounds, DecodeError> {
    let mut left = 0i64;
    let mut right = 0i64;
    let mut top = 0i64;
    let mut bottom = 0i64;

    let mut r = ByteReader::new(buf);
    while !r.is_empty() {
        let (field, wire_type) = r.read_field_key()?;
        match (field, wire_type) {
            (1, WireType::Varint) => left = r.read_varsint64()?,
            (2, WireType::Varint) => right = r.read_varsint64()?,
            (3, WireType::Varint) => top = r.read_varsint64()?,
            (4, WireType::Varint) => bottom = r.read_varsint64()?,
            (_, wt) => r.skip_unknown(wt)?,
        }
    }

    Ok(Bounds {
        min_lon: left as f64 * 1e-9,
        min_lat: bottom as f64 * 1e-9,
        max_lon: right as f64 * 1e-9,
        max_lat: top as f64 * 1e-9,
    })
}

/// Decodes a `PrimitiveBlock` payload (the `OSMData` blob kind).
pub fn decode_primitive_block(buf: &[u8]) -> Result<DecodedBlock<'_>, DecodeError> {
    let params = scan_block_params(buf)?;

    let mut strings: Option<StringTable<'_>> = None;
    let mut group_bufs: Vec<&[u8]> = Vec::new();

    let mut r = ByteReader::new(buf);
    while !r.is_empty() {
        let (field, wire_type) = r.read_field_key()?;
        match (field, wire_type) {
            (1, WireType::Len) => strings = Some(StringTable::parse(r.read_length_delimited()?)?),
            (2, WireType::Len) => group_bufs.push(r.read_length_delimited()?),
            (_, wt) => r.skip_unknown(wt)?,
        }
    }
    let strings = match strings {
        Some(s) => s,
        None => StringTable::parse(&[])?,
    };

    let mut block = DecodedBlock::default();
    for group_buf in group_bufs {
        decode_primitive_group(group_buf, &strings, &params, &mut block)?;
    }
    Ok(block)
}

fn scan_block_params(buf: &[u8]) -> Result<BlockParams, DecodeError> {
    let mut params = BlockParams::default();
    let mut r = ByteReader::new(buf);
    while !r.is_empty() {
        let (field, wire_type) = r.read_field_key()?;
        match (field, wire_type) {
            (17, WireType::Varint) => params.granularity = r.read_varint64()? as i32,
            (18, WireType::Varint) => params.date_granularity = r.read_varint64()? as i32,
            (19, WireType::Varint) => params.lat_offset = r.read_varint64()?,
            (20, WireType::Varint) => params.lon_offset = r.read_varint64()?,
            (_, wt) => r.skip_unknown(wt)?,
        }
    }
    if params.granularity <= 0 {
        return Err(DecodeError::Truncated);
    }
    Ok(params)
}

fn decode_primitive_group<'a>(
    buf: &'a [u8],
    strings: &StringTable<'a>,
    params: &BlockParams,
    block: &mut DecodedBlock<'a>,
) -> Result<(), DecodeError> {
    let mut r = ByteReader::new(buf);
    while !r.is_empty() {
        let (field, wire_type) = r.read_field_key()?;
        match (field, wire_type) {
            (1, WireType::Len) => block
                .nodes
                .push(decode_node(r.read_length_delimited()?, strings, params)?),
            (2, WireType::Len) => decode_dense_nodes(
                r.read_length_delimited()?,
                strings,
                i64::from(params.granularity),
                params.lat_offset,
                params.lon_offset,
                i64::from(params.date_granularity),
                &mut block.nodes,
            )?,
            (3, WireType::Len) => block
                .ways
                .push(decode_way(r.read_length_delimited()?, strings, params)?),
            (4, WireType::Len) => block
                .relations
                .push(decode_relation(r.read_length_delimited()?, strings, params)?),
            (_, wt) => r.skip_unknown(wt)?,
        }
    }
    Ok(())
}

fn build_tags<'a>(
    keys: &[u32],
    vals: &[u32],
    strings: &StringTable<'a>,
) -> Result<Vec<Tag<'a>>, DecodeError> {
    if keys.len() != vals.len() {
        return Err(DecodeError::Truncated);
    }
    keys.iter()
        .zip(vals.iter())
        .map(|(&k, &v)| {
            Ok(Tag {
                key: strings.get(k)?,
                value: strings.get(v)?,
            })
        })
        .collect()
}

fn decode_info<'a>(
    buf: &'a [u8],
    strings: &StringTable<'a>,
    date_granularity: i32,
) -> Result<Info<'a>, DecodeError> {
    let mut version = None;
    let mut timestamp_raw = None;
    let mut changeset = None;
    let mut uid = None;
    let mut user_sid = None;

    let mut r = ByteReader::new(buf);
    while !r.is_empty() {
        let (field, wire_type) = r.read_field_key()?;
        match (field, wire_type) {
            (1, WireType::Varint) => version = Some(r.read_varint64()? as i32),
            (2, WireType::Varint) => timestamp_raw = Some(r.read_varint64()?),
            (3, WireType::Varint) => changeset = Some(r.read_varint64()?),
            (4, WireType::Varint) => uid = Some(r.read_varint64()? as i32),
            (5, WireType::Varint) => user_sid = Some(r.read_varuint32()?),
            (_, wt) => r.skip_unknown(wt)?,
        }
    }

    let user = match user_sid {
        Some(sid) => Some(strings.get(sid)?),
        None => None,
    };
    let timestamp = timestamp_raw
        .map(|t| Timestamp::UnixSeconds(t.wrapping_mul(i64::from(date_granularity)) / 1000));

    Ok(Info {
        version,
        changeset,
        uid,
        user,
        timestamp,
    })
}

fn decode_node<'a>(
    buf: &'a [u8],
    strings: &StringTable<'a>,
    params: &BlockParams,
) -> Result<Node<'a>, DecodeError> {
    let mut id = 0i64;
    let mut keys: Vec<u32> = Vec::new();
    let mut vals: Vec<u32> = Vec::new();
    let mut info_buf: Option<&[u8]> = None;
    let mut lat_raw = 0i64;
    let mut lon_raw = 0i64;

    let mut r = ByteReader::new(buf);
    while !r.is_empty() {
        let (field, wire_type) = r.read_field_key()?;
        match (field, wire_type) {
            // `Node.id`/`lat`/`lon` are `sint64` on the wire (zig-zag), unlike
            // `Way`/`Relation`'s plain `int64` ids - easy to miss since both
            // share the VARINT wire type.
            (1, WireType::Varint) => id = r.read_varsint64()?,
            (2, WireType::Len) => keys = dense::read_packed_varuint32(r.read_length_delimited()?)?,
            (3, WireType::Len) => vals = dense::read_packed_varuint32(r.read_length_delimited()?)?,
            (4, WireType::Len) => info_buf = Some(r.read_length_delimited()?),
            (8, WireType::Varint) => lat_raw = r.read_varsint64()?,
            (9, WireType::Varint) => lon_raw = r.read_varsint64()?,
            (_, wt) => r.skip_unknown(wt)?,
        }
    }

    let tags = build_tags(&keys, &vals, strings)?;
    let lat = 1e-9 * (params.lat_offset as f64 + f64::from(params.granularity) * lat_raw as f64);
    let lon = 1e-9 * (params.lon_offset as f64 + f64::from(params.granularity) * lon_raw as f64);
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(DecodeError::OutOfRangeCoordinate { lat, lon });
    }

    let info = match info_buf {
        Some(b) => decode_info(b, strings, params.date_granularity)?,
        None => Info::default(),
    };

    Ok(Node {
        id,
        lat,
        lon,
        info,
        tags,
    })
}

fn decode_way<'a>(
    buf: &'a [u8],
    strings: &StringTable<'a>,
    params: &BlockParams,
) -> Result<Way<'a>, DecodeError> {
    let mut id = 0i64;
    let mut keys: Vec<u32> = Vec::new();
    let mut vals: Vec<u32> = Vec::new();
    let mut info_buf: Option<&[u8]> = None;
    let mut refs_delta: Vec<i64> = Vec::new();

    let mut r = ByteReader::new(buf);
    while !r.is_empty() {
        let (field, wire_type) = r.read_field_key()?;
        match (field, wire_type) {
            (1, WireType::Varint) => id = r.read_varint64()?,
            (2, WireType::Len) => keys = dense::read_packed_varuint32(r.read_length_delimited()?)?,
            (3, WireType::Len) => vals = dense::read_packed_varuint32(r.read_length_delimited()?)?,
            (4, WireType::Len) => info_buf = Some(r.read_length_delimited()?),
            (8, WireType::Len) => refs_delta = dense::read_packed_sint64(r.read_length_delimited()?)?,
            (_, wt) => r.skip_unknown(wt)?,
        }
    }

    let tags = build_tags(&keys, &vals, strings)?;
    let info = match info_buf {
        Some(b) => decode_info(b, strings, params.date_granularity)?,
        None => Info::default(),
    };

    let mut acc = 0i64;
    let node_refs = refs_delta
        .into_iter()
        .map(|d| {
            acc = acc.wrapping_add(d);
            acc
        })
        .collect();

    Ok(Way {
        id,
        info,
        tags,
        node_refs,
    })
}

fn decode_relation<'a>(
    buf: &'a [u8],
    strings: &StringTable<'a>,
    params: &BlockParams,
) -> Result<Relation<'a>, DecodeError> {
    let mut id = 0i64;
    let mut keys: Vec<u32> = Vec::new();
    let mut vals: Vec<u32> = Vec::new();
    let mut info_buf: Option<&[u8]> = None;
    let mut roles_sid: Vec<u32> = Vec::new();
    let mut memids_delta: Vec<i64> = Vec::new();
    let mut types: Vec<u32> = Vec::new();

    let mut r = ByteReader::new(buf);
    while !r.is_empty() {
        let (field, wire_type) = r.read_field_key()?;
        match (field, wire_type) {
            (1, WireType::Varint) => id = r.read_varint64()?,
            (2, WireType::Len) => keys = dense::read_packed_varuint32(r.read_length_delimited()?)?,
            (3, WireType::Len) => vals = dense::read_packed_varuint32(r.read_length_delimited()?)?,
            (4, WireType::Len) => info_buf = Some(r.read_length_delimited()?),
            (8, WireType::Len) => roles_sid = dense::read_packed_varuint32(r.read_length_delimited()?)?,
            (9, WireType::Len) => memids_delta = dense::read_packed_sint64(r.read_length_delimited()?)?,
            (10, WireType::Len) => types = dense::read_packed_varuint32(r.read_length_delimited()?)?,
            (_, wt) => r.skip_unknown(wt)?,
        }
    }

    if roles_sid.len() != memids_delta.len() || memids_delta.len() != types.len() {
        return Err(DecodeError::MalformedRelation);
    }

    let tags = build_tags(&keys, &vals, strings)?;
    let info = match info_buf {
        Some(b) => decode_info(b, strings, params.date_granularity)?,
        None => Info::default(),
    };

    let mut acc = 0i64;
    let mut members = Vec::with_capacity(roles_sid.len());
    for ((role_sid, delta), ty) in roles_sid.iter().zip(memids_delta.iter()).zip(types.iter()) {
        acc = acc.wrapping_add(*delta);
        let member_type = match ty {
            0 => MemberType::Node,
            1 => MemberType::Way,
            2 => MemberType::Relation,
            _ => return Err(DecodeError::MalformedRelation),
        };
        members.push(Member {
            ref_id: acc,
            role: strings.get(*role_sid)?,
            member_type,
        });
    }

    Ok(Relation {
        id,
        info,
        tags,
        members,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

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

    fn zigzag(v: i64) -> u64 {
        ((v << 1) ^ (v >> 63)) as u64
    }

    fn len_prefixed(field: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = varint_bytes(u64::from((field << 3) | 2));
        out.extend(varint_bytes(payload.len() as u64));
        out.extend_from_slice(payload);
        out
    }

    fn string_entry(s: &str) -> Vec<u8> {
        len_prefixed(1, s.as_bytes())
    }

    fn packed_sint64(field: u32, values: &[i64]) -> Vec<u8> {
        let mut payload = Vec::new();
        for &v in values {
            payload.extend(varint_bytes(zigzag(v)));
        }
        len_prefixed(field, &payload)
    }

    fn packed_varuint32(field: u32, values: &[u32]) -> Vec<u8> {
        let mut payload = Vec::new();
        for &v in values {
            payload.extend(varint_bytes(u64::from(v)));
        }
        len_prefixed(field, &payload)
    }

    #[test]
    fn decodes_way_with_tags_and_refs() {
        let mut strtab = Vec::new();
        strtab.extend(string_entry("")); // reserved index 0
        strtab.extend(string_entry("highway"));
        strtab.extend(string_entry("primary"));
        strtab.extend(string_entry("name"));
        strtab.extend(string_entry("Main"));

        let mut way = Vec::new();
        way.extend(varint_bytes((1 << 3) | 0));
        way.extend(varint_bytes(42));
        way.extend(packed_varuint32(2, &[1, 3]));
        way.extend(packed_varuint32(3, &[2, 4]));
        way.extend(packed_sint64(8, &[1, 1, 1, -3]));

        let mut group = Vec::new();
        group.extend(len_prefixed(3, &way));

        let mut block_buf = Vec::new();
        block_buf.extend(len_prefixed(1, &strtab));
        block_buf.extend(len_prefixed(2, &group));

        let decoded = decode_primitive_block(&block_buf).unwrap();
        assert_eq!(decoded.ways.len(), 1);
        let w = &decoded.ways[0];
        assert_eq!(w.id, 42);
        assert_eq!(w.node_refs, vec![1, 2, 3, 0]);
        assert_eq!(w.tags.len(), 2);
        assert_eq!(w.tags[0].key, "highway");
        assert_eq!(w.tags[0].value, "primary");
    }

    #[test]
    fn decodes_relation_with_members() {
        let mut strtab = Vec::new();
        strtab.extend(string_entry("")); // reserved index 0
        strtab.extend(string_entry("outer"));
        strtab.extend(string_entry("inner"));

        let mut relation = Vec::new();
        relation.extend(varint_bytes((1 << 3) | 0));
        relation.extend(varint_bytes(7));
        relation.extend(packed_varuint32(8, &[1, 2]));
        relation.extend(packed_sint64(9, &[10, 5]));
        relation.extend(packed_varuint32(10, &[1, 1]));

        let mut group = Vec::new();
        group.extend(len_prefixed(4, &relation));

        let mut block_buf = Vec::new();
        block_buf.extend(len_prefixed(1, &strtab));
        block_buf.extend(len_prefixed(2, &group));

        let decoded = decode_primitive_block(&block_buf).unwrap();
        assert_eq!(decoded.relations.len(), 1);
        let rel = &decoded.relations[0];
        assert_eq!(rel.id, 7);
        assert_eq!(rel.members.len(), 2);
        assert_eq!(rel.members[0].ref_id, 10);
        assert_eq!(rel.members[0].role, "outer");
        assert_eq!(rel.members[1].ref_id, 15);
        assert_eq!(rel.members[1].role, "inner");
    }

    #[test]
    fn mismatched_relation_arrays_is_fatal() {
        let mut relation = Vec::new();
        relation.extend(packed_varuint32(8, &[1]));
        relation.extend(packed_sint64(9, &[10, 5]));
        relation.extend(packed_varuint32(10, &[1, 1]));

        let mut group = Vec::new();
        group.extend(len_prefixed(4, &relation));
        let mut block_buf = Vec::new();
        block_buf.extend(len_prefixed(2, &group));

        assert_eq!(
            decode_primitive_block(&block_buf).unwrap_err(),
            DecodeError::MalformedRelation
        );
    }

    #[test]
    fn header_block_rejects_unknown_required_feature() {
        let mut header = Vec::new();
        header.extend(len_prefixed(4, b"FutureFeature"));
        assert!(decode_header_block(&header).is_err());
    }

    #[test]
    fn header_block_decodes_bbox() {
        let mut bbox = Vec::new();
        bbox.extend(varint_bytes((1 << 3) | 0));
        bbox.extend(varint_bytes(zigzag(-1_800_000_000)));
        bbox.extend(varint_bytes((2 << 3) | 0));
        bbox.extend(varint_bytes(zigzag(1_800_000_000)));
        bbox.extend(varint_bytes((3 << 3) | 0));
        bbox.extend(varint_bytes(zigzag(900_000_000)));
        bbox.extend(varint_bytes((4 << 3) | 0));
        bbox.extend(varint_bytes(zigzag(-900_000_000)));

        let mut header = Vec::new();
        header.extend(len_prefixed(1, &bbox));

        let decoded = decode_header_block(&header).unwrap();
        let bounds = decoded.bounds.unwrap();
        assert!((bounds.min_lon - (-1.8)).abs() < 1e-9);
        assert!((bounds.min_lat - (-0.9)).abs() < 1e-9);
        assert!((bounds.max_lon - 1.8).abs() < 1e-9);
        assert!((bounds.max_lat - 0.9).abs() < 1e-9);
    }
}

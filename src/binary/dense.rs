// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! DenseNodes / DenseInfo columnar decoding.
//!
//! Every column is a packed varint array read in one pass, then walked in
//! lockstep with `wrapping_add` delta accumulation, per the design note
//! that signed overflow in delta accumulation is deliberate and must be
//! re-expressed as explicit wrapping arithmetic rather than relied upon as
//! language-level UB.

use crate::binary::strtable::StringTable;
use crate::error::DecodeError;
use crate::model::{Info, Node, Tag, Timestamp};
use crate::wire::{ByteReader, WireType};

#[derive(Debug, Default)]
struct DenseInfoColumns {
    version: Option<Vec<i32>>,
    timestamp: Option<Vec<i64>>,
    changeset: Option<Vec<i64>>,
    uid: Option<Vec<i32>>,
    user_sid: Option<Vec<i32>>,
}

pub(crate) fn read_packed_sint64(buf: &[u8]) -> Result<Vec<i64>, DecodeError> {
    let mut r = ByteReader::new(buf);
    let mut out = Vec::new();
    while !r.is_empty() {
        out.push(r.read_varsint64()?);
    }
    Ok(out)
}

fn read_packed_sint32(buf: &[u8]) -> Result<Vec<i32>, DecodeError> {
    let mut r = ByteReader::new(buf);
    let mut out = Vec::new();
    while !r.is_empty() {
        out.push(r.read_varsint32()?);
    }
    Ok(out)
}

pub(crate) fn read_packed_varuint32(buf: &[u8]) -> Result<Vec<u32>, DecodeError> {
    let mut r = ByteReader::new(buf);
    let mut out = Vec::new();
    while !r.is_empty() {
        out.push(r.read_varuint32()?);
    }
    Ok(out)
}

fn parse_dense_info(buf: &[u8]) -> Result<DenseInfoColumns, DecodeError> {
    let mut cols = DenseInfoColumns::default();
    let mut r = ByteReader::new(buf);
    while !r.is_empty() {
        let (field, wire_type) = r.read_field_key()?;
        match (field, wire_type) {
            (1, WireType::Len) => cols.version = Some(read_packed_sint32(r.read_length_delimited()?)?),
            (2, WireType::Len) => cols.timestamp = Some(read_packed_sint64(r.read_length_delimited()?)?),
            (3, WireType::Len) => cols.changeset = Some(read_packed_sint64(r.read_length_delimited()?)?),
            (4, WireType::Len) => cols.uid = Some(read_packed_sint32(r.read_length_delimited()?)?),
            (5, WireType::Len) => cols.user_sid = Some(read_packed_sint32(r.read_length_delimited()?)?),
            (_, wt) => r.skip_unknown(wt)?,
        }
    }
    Ok(cols)
}

/// Walks the flat `(key_sid, val_sid)` stream, terminated per node by a `0`
/// separator, and returns one tag vector per node (index-aligned with the
/// id column). A dangling key with no matching value - the stream ending
/// mid-pair - is `DecodeError::Truncated`.
fn split_keys_vals<'a>(
    keys_vals: &[u32],
    strings: &StringTable<'a>,
    node_count: usize,
) -> Result<Vec<Vec<Tag<'a>>>, DecodeError> {
    let mut per_node = vec![Vec::new(); node_count];
    let mut idx = 0usize;
    let mut node_i = 0usize;
    while idx < keys_vals.len() {
        let k = keys_vals[idx];
        if k == 0 {
            node_i += 1;
            idx += 1;
            continue;
        }
        let v = *keys_vals.get(idx + 1).ok_or(DecodeError::Truncated)?;
        if node_i < node_count {
            per_node[node_i].push(Tag {
                key: strings.get(k)?,
                value: strings.get(v)?,
            });
        }
        idx += 2;
    }
    Ok(per_node)
}

/// Decodes a `DenseNodes` submessage, appending reconstructed nodes to
/// `out` in encounter order.
#[allow(clippy::too_many_arguments)]
pub fn decode_dense_nodes<'a>(
    buf: &'a [u8],
    strings: &StringTable<'a>,
    granularity: i64,
    lat_offset: i64,
    lon_offset: i64,
    date_granularity: i64,
    out: &mut Vec<Node<'a>>,
) -> Result<(), DecodeError> {
    let mut ids: Vec<i64> = Vec::new();
    let mut lats: Vec<i64> = Vec::new();
    let mut lons: Vec<i64> = Vec::new();
    let mut keys_vals: Vec<u32> = Vec::new();
    let mut info_cols: Option<DenseInfoColumns> = None;

    let mut r = ByteReader::new(buf);
    while !r.is_empty() {
        let (field, wire_type) = r.read_field_key()?;
        match (field, wire_type) {
            (1, WireType::Len) => ids = read_packed_sint64(r.read_length_delimited()?)?,
            (5, WireType::Len) => info_cols = Some(parse_dense_info(r.read_length_delimited()?)?),
            (8, WireType::Len) => lats = read_packed_sint64(r.read_length_delimited()?)?,
            (9, WireType::Len) => lons = read_packed_sint64(r.read_length_delimited()?)?,
            (10, WireType::Len) => keys_vals = read_packed_varuint32(r.read_length_delimited()?)?,
            (_, wt) => r.skip_unknown(wt)?,
        }
    }

    let n = ids.len();
    if lats.len() != n || lons.len() != n {
        return Err(DecodeError::Truncated);
    }
    if let Some(cols) = &info_cols {
        for column in [
            cols.version.as_ref().map(Vec::len),
            cols.timestamp.as_ref().map(Vec::len),
            cols.changeset.as_ref().map(Vec::len),
            cols.uid.as_ref().map(Vec::len),
            cols.user_sid.as_ref().map(Vec::len),
        ]
        .into_iter()
        .flatten()
        {
            if column != n {
                return Err(DecodeError::Truncated);
            }
        }
    }

    let mut tags_per_node = split_keys_vals(&keys_vals, strings, n)?;

    let mut id_acc: i64 = 0;
    let mut lat_acc: i64 = 0;
    let mut lon_acc: i64 = 0;
    let mut version_acc: i64 = 0;
    let mut timestamp_acc: i64 = 0;
    let mut changeset_acc: i64 = 0;
    let mut uid_acc: i64 = 0;
    let mut user_sid_acc: i64 = 0;

    for i in 0..n {
        id_acc = id_acc.wrapping_add(ids[i]);
        lat_acc = lat_acc.wrapping_add(lats[i]);
        lon_acc = lon_acc.wrapping_add(lons[i]);

        let lat = 1e-9 * (lat_offset as f64 + granularity as f64 * lat_acc as f64);
        let lon = 1e-9 * (lon_offset as f64 + granularity as f64 * lon_acc as f64);
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(DecodeError::OutOfRangeCoordinate { lat, lon });
        }

        let info = match &info_cols {
            Some(cols) => {
                let version = cols.version.as_ref().map(|v| {
                    version_acc = version_acc.wrapping_add(i64::from(v[i]));
                    version_acc as i32
                });
                let timestamp = cols.timestamp.as_ref().map(|v| {
                    timestamp_acc = timestamp_acc.wrapping_add(v[i]);
                    Timestamp::UnixSeconds(
                        timestamp_acc.wrapping_mul(date_granularity) / 1000,
                    )
                });
                let changeset = cols.changeset.as_ref().map(|v| {
                    changeset_acc = changeset_acc.wrapping_add(v[i]);
                    changeset_acc
                });
                let uid = cols.uid.as_ref().map(|v| {
                    uid_acc = uid_acc.wrapping_add(i64::from(v[i]));
                    uid_acc as i32
                });
                let user = match &cols.user_sid {
                    Some(v) => {
                        user_sid_acc = user_sid_acc.wrapping_add(i64::from(v[i]));
                        Some(strings.get(user_sid_acc as u32)?)
                    }
                    None => None,
                };
                Info {
                    version,
                    changeset,
                    uid,
                    user,
                    timestamp,
                }
            }
            None => Info::default(),
        };

        out.push(Node {
            id: id_acc,
            lat,
            lon,
            info,
            tags: std::mem::take(&mut tags_per_node[i]),
        });
    }

    Ok(())
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

    fn packed_sint64_field(field: u32, values: &[i64]) -> Vec<u8> {
        let mut payload = Vec::new();
        for &v in values {
            payload.extend(varint_bytes(zigzag(v)));
        }
        let mut out = varint_bytes(u64::from((field << 3) | 2));
        out.extend(varint_bytes(payload.len() as u64));
        out.extend(payload);
        out
    }

    fn packed_varuint32_field(field: u32, values: &[u32]) -> Vec<u8> {
        let mut payload = Vec::new();
        for &v in values {
            payload.extend(varint_bytes(u64::from(v)));
        }
        let mut out = varint_bytes(u64::from((field << 3) | 2));
        out.extend(varint_bytes(payload.len() as u64));
        out.extend(payload);
        out
    }

    #[test]
    fn reconstructs_ids_and_coordinates() {
        let mut buf = Vec::new();
        buf.extend(packed_sint64_field(1, &[1, 1, 1]));
        buf.extend(packed_sint64_field(8, &[100_000_000, 0, 0]));
        buf.extend(packed_sint64_field(9, &[100_000_000, 0, 0]));

        let strings = StringTable::parse(&[]).unwrap();
        let mut out = Vec::new();
        decode_dense_nodes(&buf, &strings, 100, 0, 0, 1000, &mut out).unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].id, 1);
        assert_eq!(out[1].id, 2);
        assert_eq!(out[2].id, 3);
        assert!((out[0].lat - 10.0).abs() < 1e-9);
        assert!((out[0].lon - 10.0).abs() < 1e-9);
        assert!(out[0].tags.is_empty());
    }

    #[test]
    fn resolves_tags_from_keys_vals() {
        let mut buf = Vec::new();
        buf.extend(packed_sint64_field(1, &[1]));
        buf.extend(packed_sint64_field(8, &[0]));
        buf.extend(packed_sint64_field(9, &[0]));
        buf.extend(packed_varuint32_field(10, &[1, 2]));

        let mut strtab_buf = Vec::new();
        for s in ["", "amenity", "cafe"] {
            let mut f = varint_bytes((1 << 3) | 2);
            f.extend(varint_bytes(s.len() as u64));
            f.extend_from_slice(s.as_bytes());
            strtab_buf.extend(f);
        }
        let strings = StringTable::parse(&strtab_buf).unwrap();

        let mut out = Vec::new();
        decode_dense_nodes(&buf, &strings, 100, 0, 0, 1000, &mut out).unwrap();
        assert_eq!(out[0].tags, vec![Tag { key: "amenity", value: "cafe" }]);
    }

    #[test]
    fn keys_vals_ending_mid_pair_is_truncated() {
        let mut buf = Vec::new();
        buf.extend(packed_sint64_field(1, &[1]));
        buf.extend(packed_sint64_field(8, &[0]));
        buf.extend(packed_sint64_field(9, &[0]));
        buf.extend(packed_varuint32_field(10, &[1])); // dangling key, no value

        let strings = StringTable::parse(&[]).unwrap();
        let mut out = Vec::new();
        let err = decode_dense_nodes(&buf, &strings, 100, 0, 0, 1000, &mut out).unwrap_err();
        assert_eq!(err, DecodeError::Truncated);
    }

    #[test]
    fn out_of_range_coordinate_is_rejected() {
        let mut buf = Vec::new();
        buf.extend(packed_sint64_field(1, &[1]));
        buf.extend(packed_sint64_field(8, &[1_000_000_000])); // lat = 100 deg
        buf.extend(packed_sint64_field(9, &[0]));

        let strings = StringTable::parse(&[]).unwrap();
        let mut out = Vec::new();
        assert!(decode_dense_nodes(&buf, &strings, 100, 0, 0, 1000, &mut out).is_err());
    }
}

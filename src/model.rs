// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Borrowed OSM primitive types shared by both the binary and textual
//! decoders. Every string here borrows from whichever buffer the active
//! decoder owns for the current block (binary) or element (textual); none
//! of these types allocate on their own.

/// A single key/value tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag<'a> {
    pub key: &'a str,
    pub value: &'a str,
}

/// A primitive's timestamp, either already resolved to Unix seconds (binary
/// path, after applying `date_granularity`) or left as the raw textual
/// string (textual path, which does not parse ISO-8601 itself).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timestamp<'a> {
    UnixSeconds(i64),
    Text(&'a str),
}

/// Optional per-primitive metadata. Every field is independently optional
/// because DenseInfo columns may each be present or absent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Info<'a> {
    pub version: Option<i32>,
    pub changeset: Option<i64>,
    pub uid: Option<i32>,
    pub user: Option<&'a str>,
    pub timestamp: Option<Timestamp<'a>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node<'a> {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
    pub info: Info<'a>,
    pub tags: Vec<Tag<'a>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Way<'a> {
    pub id: i64,
    pub info: Info<'a>,
    pub tags: Vec<Tag<'a>>,
    pub node_refs: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberType {
    Node,
    Way,
    Relation,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Member<'a> {
    pub ref_id: i64,
    pub role: &'a str,
    pub member_type: MemberType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relation<'a> {
    pub id: i64,
    pub info: Info<'a>,
    pub tags: Vec<Tag<'a>>,
    pub members: Vec<Member<'a>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

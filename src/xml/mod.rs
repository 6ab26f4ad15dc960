// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The textual OSM decoder: a pull-based event scan over `quick_xml`,
//! maintaining a small bounded intern arena for attribute strings that must
//! outlive quick_xml's own reused read buffer across the several events
//! that make up one element (its nested `tag`/`nd`/`member` children).

use std::borrow::Cow;
use std::io::BufRead;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{DecodeError, Error};
use crate::model::{Bounds, Info, Member, MemberType, Node, Relation, Tag, Timestamp, Way};
use crate::reader::{Advance, Callbacks};

/// Upper bound on the textual intern arena. Exceeding it (within a single
/// in-progress element) is a hard error, not silent truncation.
const INTERN_CAPACITY: usize = 1024 * 1024;
/// Self-defense against entity-expansion-style attacks: this many
/// non-element events in a row aborts the parse.
const MAX_EVENTS_WITHOUT_ELEMENT: usize = 64 * 1024;
/// Read buffer reused by `quick_xml` across `read_event_into` calls.
const CHUNK_SIZE: usize = 64 * 1024;

type Range = (usize, usize);

struct InternArena {
    buf: Vec<u8>,
}

impl InternArena {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(INTERN_CAPACITY),
        }
    }

    fn clear(&mut self) {
        self.buf.clear();
    }

    fn intern(&mut self, bytes: &[u8]) -> Result<Range, DecodeError> {
        if self.buf.len() + bytes.len() > INTERN_CAPACITY {
            return Err(DecodeError::InternOverflow);
        }
        let start = self.buf.len();
        self.buf.extend_from_slice(bytes);
        Ok((start, bytes.len()))
    }

    fn get(&self, range: Range) -> Result<&str, DecodeError> {
        std::str::from_utf8(&self.buf[range.0..range.0 + range.1])
            .map_err(|_| DecodeError::Xml("attribute value was not valid UTF-8".into()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RawInfo {
    version: Option<i32>,
    changeset: Option<i64>,
    uid: Option<i32>,
    user: Option<Range>,
    timestamp: Option<Range>,
}

struct RawTag {
    key: Range,
    value: Range,
}

struct RawMember {
    ref_id: i64,
    role: Range,
    member_type: MemberType,
}

enum Builder {
    Node {
        id: i64,
        lat: f64,
        lon: f64,
        info: RawInfo,
        tags: Vec<RawTag>,
    },
    Way {
        id: i64,
        info: RawInfo,
        tags: Vec<RawTag>,
        node_refs: Vec<i64>,
    },
    Relation {
        id: i64,
        info: RawInfo,
        tags: Vec<RawTag>,
        members: Vec<RawMember>,
    },
}

pub struct XmlReader<R> {
    reader: Reader<R>,
    scratch: Vec<u8>,
    intern: InternArena,
    bounds_emitted: bool,
}

impl<R: BufRead> XmlReader<R> {
    pub fn new(inner: R) -> Self {
        let mut reader = Reader::from_reader(inner);
        reader.config_mut().trim_text(true);
        Self {
            reader,
            scratch: Vec::with_capacity(CHUNK_SIZE),
            intern: InternArena::new(),
            bounds_emitted: false,
        }
    }

    pub fn reset(&mut self, inner: R) {
        self.reader = Reader::from_reader(inner);
        self.reader.config_mut().trim_text(true);
        self.scratch.clear();
        self.intern.clear();
        self.bounds_emitted = false;
    }

    /// Gives back the underlying reader, discarding any buffered-but-not-yet
    /// -consumed bytes. Used by the orchestrator's `reset()` to rewind the
    /// file and start over.
    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }

    /// Advances until one primitive-emitting element closes (invoking the
    /// matching callback) or the stream ends.
    pub fn process_next(&mut self, callbacks: &mut dyn Callbacks) -> Result<Advance, Error> {
        self.intern.clear();
        let mut builder: Option<Builder> = None;
        let mut events_without_element = 0usize;

        loop {
            self.scratch.clear();
            let event = self
                .reader
                .read_event_into(&mut self.scratch)
                .map_err(|e| DecodeError::Xml(e.to_string()))?;

            match &event {
                Event::Eof => return Ok(Advance::Eof),
                Event::Start(e) | Event::Empty(e) => {
                    events_without_element = 0;
                    let is_empty = matches!(event, Event::Empty(_));
                    if self.handle_open(e, &mut builder, callbacks)? && is_empty {
                        if let Some(b) = builder.take() {
                            emit(b, &self.intern, callbacks)?;
                            return Ok(Advance::Continue);
                        }
                    }
                }
                Event::End(e) => {
                    events_without_element = 0;
                    if matches!(e.name().as_ref(), b"node" | b"way" | b"relation") {
                        if let Some(b) = builder.take() {
                            emit(b, &self.intern, callbacks)?;
                            return Ok(Advance::Continue);
                        }
                    }
                }
                _ => {
                    events_without_element += 1;
                    if events_without_element > MAX_EVENTS_WITHOUT_ELEMENT {
                        return Err(DecodeError::NestedEntityAttack.into());
                    }
                }
            }
        }
    }

    /// Handles a `Start`/`Empty` element, returning `true` when the element
    /// just opened was itself a primitive root (node/way/relation) - the
    /// caller uses that to finish immediately for self-closing elements.
    fn handle_open(
        &mut self,
        e: &BytesStart,
        builder: &mut Option<Builder>,
        callbacks: &mut dyn Callbacks,
    ) -> Result<bool, Error> {
        match e.name().as_ref() {
            b"bounds" => {
                if !self.bounds_emitted {
                    let bounds = parse_bounds(e)?;
                    callbacks.on_bounds(bounds);
                    self.bounds_emitted = true;
                }
                Ok(false)
            }
            b"node" => {
                *builder = Some(start_node(e, &mut self.intern)?);
                Ok(true)
            }
            b"way" => {
                *builder = Some(start_way(e, &mut self.intern)?);
                Ok(true)
            }
            b"relation" => {
                *builder = Some(start_relation(e, &mut self.intern)?);
                Ok(true)
            }
            b"tag" => {
                if let Some(b) = builder.as_mut() {
                    let key = required_attr(e, "k")?;
                    let value = optional_attr(e, "v")?.unwrap_or(Cow::Borrowed(""));
                    let key_range = self.intern.intern(key.as_bytes())?;
                    let value_range = self.intern.intern(value.as_bytes())?;
                    let tags = match b {
                        Builder::Node { tags, .. } => tags,
                        Builder::Way { tags, .. } => tags,
                        Builder::Relation { tags, .. } => tags,
                    };
                    tags.push(RawTag {
                        key: key_range,
                        value: value_range,
                    });
                }
                Ok(false)
            }
            b"nd" => {
                if let Some(Builder::Way { node_refs, .. }) = builder.as_mut() {
                    let r = required_attr(e, "ref")?;
                    let id = r
                        .parse::<i64>()
                        .map_err(|_| DecodeError::Xml("nd ref was not an integer".into()))?;
                    node_refs.push(id);
                }
                Ok(false)
            }
            b"member" => {
                if let Some(Builder::Relation { members, .. }) = builder.as_mut() {
                    let ty = required_attr(e, "type")?;
                    let member_type = match ty.as_ref() {
                        "node" => MemberType::Node,
                        "way" => MemberType::Way,
                        "relation" => MemberType::Relation,
                        other => {
                            return Err(DecodeError::Xml(format!("unknown member type {other:?}")).into())
                        }
                    };
                    let ref_id = required_attr(e, "ref")?
                        .parse::<i64>()
                        .map_err(|_| DecodeError::Xml("member ref was not an integer".into()))?;
                    let role = optional_attr(e, "role")?.unwrap_or(Cow::Borrowed(""));
                    let role_range = self.intern.intern(role.as_bytes())?;
                    members.push(RawMember {
                        ref_id,
                        role: role_range,
                        member_type,
                    });
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

fn required_attr<'b>(e: &'b BytesStart, key: &str) -> Result<Cow<'b, str>, DecodeError> {
    optional_attr(e, key)?.ok_or_else(|| DecodeError::Xml(format!("missing required attribute {key:?}")))
}

fn optional_attr<'b>(e: &'b BytesStart, key: &str) -> Result<Option<Cow<'b, str>>, DecodeError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| DecodeError::Xml(err.to_string()))?;
        if attr.key.as_ref() == key.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|err| DecodeError::Xml(err.to_string()))?;
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn parse_f64(value: &str, what: &str) -> Result<f64, DecodeError> {
    value
        .parse::<f64>()
        .map_err(|_| DecodeError::Xml(format!("{what} was not a number: {value:?}")))
}

fn parse_bounds(e: &BytesStart) -> Result<Bounds, DecodeError> {
    if let Some(list) = optional_attr(e, "box")? {
        let parts: Vec<&str> = list.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(DecodeError::Xml("bounds box attribute needs four values".into()));
        }
        return Ok(Bounds {
            min_lat: parse_f64(parts[0], "min_lat")?,
            min_lon: parse_f64(parts[1], "min_lon")?,
            max_lat: parse_f64(parts[2], "max_lat")?,
            max_lon: parse_f64(parts[3], "max_lon")?,
        });
    }
    Ok(Bounds {
        min_lon: parse_f64(&required_attr(e, "minlon")?, "minlon")?,
        min_lat: parse_f64(&required_attr(e, "minlat")?, "minlat")?,
        max_lon: parse_f64(&required_attr(e, "maxlon")?, "maxlon")?,
        max_lat: parse_f64(&required_attr(e, "maxlat")?, "maxlat")?,
    })
}

fn parse_info_attrs(e: &BytesStart, intern: &mut InternArena) -> Result<RawInfo, DecodeError> {
    let version = optional_attr(e, "version")?
        .map(|v| v.parse::<i32>())
        .transpose()
        .map_err(|_| DecodeError::Xml("bad version attribute".into()))?;
    let changeset = optional_attr(e, "changeset")?
        .map(|v| v.parse::<i64>())
        .transpose()
        .map_err(|_| DecodeError::Xml("bad changeset attribute".into()))?;
    let uid = optional_attr(e, "uid")?
        .map(|v| v.parse::<i32>())
        .transpose()
        .map_err(|_| DecodeError::Xml("bad uid attribute".into()))?;
    let user = optional_attr(e, "user")?
        .map(|v| intern.intern(v.as_bytes()))
        .transpose()?;
    let timestamp = optional_attr(e, "timestamp")?
        .map(|v| intern.intern(v.as_bytes()))
        .transpose()?;
    Ok(RawInfo {
        version,
        changeset,
        uid,
        user,
        timestamp,
    })
}

fn start_node(e: &BytesStart, intern: &mut InternArena) -> Result<Builder, DecodeError> {
    let id = required_attr(e, "id")?
        .parse::<i64>()
        .map_err(|_| DecodeError::Xml("bad node id".into()))?;
    let lat = parse_f64(&required_attr(e, "lat")?, "lat")?;
    let lon = parse_f64(&required_attr(e, "lon")?, "lon")?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(DecodeError::OutOfRangeCoordinate { lat, lon });
    }
    let info = parse_info_attrs(e, intern)?;
    Ok(Builder::Node {
        id,
        lat,
        lon,
        info,
        tags: Vec::new(),
    })
}

fn start_way(e: &BytesStart, intern: &mut InternArena) -> Result<Builder, DecodeError> {
    let id = required_attr(e, "id")?
        .parse::<i64>()
        .map_err(|_| DecodeError::Xml("bad way id".into()))?;
    let info = parse_info_attrs(e, intern)?;
    Ok(Builder::Way {
        id,
        info,
        tags: Vec::new(),
        node_refs: Vec::new(),
    })
}

fn start_relation(e: &BytesStart, intern: &mut InternArena) -> Result<Builder, DecodeError> {
    let id = required_attr(e, "id")?
        .parse::<i64>()
        .map_err(|_| DecodeError::Xml("bad relation id".into()))?;
    let info = parse_info_attrs(e, intern)?;
    Ok(Builder::Relation {
        id,
        info,
        tags: Vec::new(),
        members: Vec::new(),
    })
}

fn resolve_info<'i>(raw: RawInfo, intern: &'i InternArena) -> Result<Info<'i>, DecodeError> {
    Ok(Info {
        version: raw.version,
        changeset: raw.changeset,
        uid: raw.uid,
        user: raw.user.map(|r| intern.get(r)).transpose()?,
        timestamp: raw
            .timestamp
            .map(|r| intern.get(r).map(Timestamp::Text))
            .transpose()?,
    })
}

fn resolve_tags<'i>(raw: Vec<RawTag>, intern: &'i InternArena) -> Result<Vec<Tag<'i>>, DecodeError> {
    raw.into_iter()
        .map(|t| {
            Ok(Tag {
                key: intern.get(t.key)?,
                value: intern.get(t.value)?,
            })
        })
        .collect()
}

fn emit(builder: Builder, intern: &InternArena, callbacks: &mut dyn Callbacks) -> Result<(), Error> {
    match builder {
        Builder::Node { id, lat, lon, info, tags } => {
            let node = Node {
                id,
                lat,
                lon,
                info: resolve_info(info, intern)?,
                tags: resolve_tags(tags, intern)?,
            };
            callbacks.on_nodes(std::slice::from_ref(&node));
        }
        Builder::Way { id, info, tags, node_refs } => {
            let way = Way {
                id,
                info: resolve_info(info, intern)?,
                tags: resolve_tags(tags, intern)?,
                node_refs,
            };
            callbacks.on_way(&way);
        }
        Builder::Relation { id, info, tags, members } => {
            let mut resolved_members = Vec::with_capacity(members.len());
            for m in members {
                resolved_members.push(Member {
                    ref_id: m.ref_id,
                    role: intern.get(m.role)?,
                    member_type: m.member_type,
                });
            }
            let relation = Relation {
                id,
                info: resolve_info(info, intern)?,
                tags: resolve_tags(tags, intern)?,
                members: resolved_members,
            };
            callbacks.on_relation(&relation);
        }
    }
    Ok(())
}

// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The public orchestrator: `open` / `reset` / `process_next_block` /
//! `close`. Owns the blob framer, the decompression pool, the uncompressed
//! arena, and (on the textual path) the `quick_xml`-backed decoder. Picks
//! between the two drivers once, at `open`, from a cheap format probe.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::binary::block::{decode_header_block, decode_primitive_block};
use crate::blob::{BlobFramer, BlobKind, BlobPayload, RawBlob};
use crate::config::ReaderConfig;
use crate::error::{DecodeError, Error, FormatError};
use crate::model::{Bounds, Node, Relation, Way};
use crate::pool::{self, DecompressedBlock, JobCompression, PendingJob};
use crate::xml::XmlReader;

/// How many bytes of the stream's start are inspected to pick a driver.
const PROBE_BYTES: usize = 1024;

/// Callbacks invoked synchronously on the orchestrator's thread as each
/// primitive is decoded. All four have no-op defaults, so a caller only
/// needs to implement the ones it cares about.
pub trait Callbacks {
    fn on_nodes(&mut self, _nodes: &[Node<'_>]) {}
    fn on_way(&mut self, _way: &Way<'_>) {}
    fn on_relation(&mut self, _relation: &Relation<'_>) {}
    fn on_bounds(&mut self, _bounds: Bounds) {}
}

/// A no-op implementation, for callers who only want some of the callbacks.
#[derive(Debug, Default)]
pub struct NoopCallbacks;
impl Callbacks for NoopCallbacks {}

/// The result of one `process_next_block` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// One blob (binary) or one primitive-closing element (textual) was
    /// processed; callbacks for it have already returned.
    Continue,
    /// The stream is exhausted.
    Eof,
}

struct BinaryState<R> {
    framer: BlobFramer<R>,
    /// A blob read ahead of the current accumulation batch (because it
    /// turned out to be a `Header` blob, or arrived after the batch's caps
    /// were reached) and must be served to the *next* call instead.
    lookahead: Option<RawBlob>,
    /// Metadata for blocks already decompressed into `arena` but not yet
    /// decoded/emitted.
    pending: VecDeque<DecompressedBlock>,
    arena: Vec<u8>,
}

enum Driver<R> {
    Binary(BinaryState<BufReader<R>>),
    Xml(XmlReader<BufReader<R>>),
}

/// Streaming OSM reader over PBF or textual input.
pub struct Reader<R> {
    config: ReaderConfig,
    pool: rayon::ThreadPool,
    // `Option` only so `reset()` can take ownership of the old driver to
    // recover its underlying reader before installing a fresh one; always
    // `Some` between calls.
    driver: Option<Driver<R>>,
    failed: Option<Error>,
}

impl<R: Read> Reader<R> {
    /// Probes `source` for its framing, then opens the matching driver.
    #[tracing::instrument(skip(source, config))]
    pub fn open(source: R, config: ReaderConfig) -> Result<Self, Error> {
        let mut buffered = BufReader::new(source);
        let probe = {
            let buf = buffered.fill_buf()?;
            buf[..buf.len().min(PROBE_BYTES)].to_vec()
        };

        let pool = pool::build_pool(config.num_threads.resolve())?;
        let driver = match detect_format(&probe)? {
            Format::Binary => {
                tracing::debug!("detected PBF framing");
                Driver::Binary(BinaryState {
                    framer: BlobFramer::new(buffered),
                    lookahead: None,
                    pending: VecDeque::new(),
                    arena: Vec::new(),
                })
            }
            Format::Xml => {
                tracing::debug!("detected textual OSM framing");
                Driver::Xml(XmlReader::new(buffered))
            }
        };

        Ok(Self {
            config,
            pool,
            driver: Some(driver),
            failed: None,
        })
    }

    /// Advances the stream by one logical unit: one fully-decoded blob on
    /// the binary path, or one primitive-closing element on the textual
    /// path. Once this returns `Err`, every subsequent call returns a clone
    /// of that same error until `reset()` is called.
    #[tracing::instrument(skip(self, callbacks))]
    pub fn process_next_block(&mut self, callbacks: &mut dyn Callbacks) -> Result<Advance, Error> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        let driver = self.driver.as_mut().expect("driver present outside of reset()");
        let result = match driver {
            Driver::Binary(state) => process_next_binary(state, &self.config, &self.pool, callbacks),
            Driver::Xml(xml) => xml.process_next(callbacks),
        };
        if let Err(e) = &result {
            tracing::warn!(error = %e, "read failed, reader is now in a terminal failed state");
            self.failed = Some(e.clone());
        }
        result
    }

    /// Releases the pool's worker threads and this reader's buffers.
    pub fn close(self) {
        drop(self);
    }
}

impl<R: Read + Seek> Reader<R> {
    /// Rewinds the underlying stream to byte 0 and clears all accumulators,
    /// queued jobs, and scanner state, including any terminal error.
    #[tracing::instrument(skip(self))]
    pub fn reset(&mut self) -> Result<(), Error> {
        let driver = self.driver.take().expect("driver present outside of reset()");
        let mut inner: BufReader<R> = match driver {
            Driver::Binary(state) => state.framer.into_inner(),
            Driver::Xml(xml) => xml.into_inner(),
        };
        inner.get_mut().seek(SeekFrom::Start(0))?;

        let mut buffered = BufReader::new(inner.into_inner());
        let probe = {
            let buf = buffered.fill_buf()?;
            buf[..buf.len().min(PROBE_BYTES)].to_vec()
        };
        self.driver = Some(match detect_format(&probe)? {
            Format::Binary => Driver::Binary(BinaryState {
                framer: BlobFramer::new(buffered),
                lookahead: None,
                pending: VecDeque::new(),
                arena: Vec::new(),
            }),
            Format::Xml => Driver::Xml(XmlReader::new(buffered)),
        });
        self.failed = None;
        Ok(())
    }
}

impl Reader<File> {
    /// Convenience constructor over a plain file path.
    pub fn open_path<P: AsRef<Path>>(path: P, config: ReaderConfig) -> Result<Self, Error> {
        Self::open(File::open(path)?, config)
    }
}

enum Format {
    Binary,
    Xml,
}

/// Detects binary framing by the `OSMHeader` magic anywhere in the first
/// `PROBE_BYTES`, or textual framing by a `<osm` tag.
fn detect_format(probe: &[u8]) -> Result<Format, Error> {
    if contains(probe, b"OSMHeader") {
        return Ok(Format::Binary);
    }
    if contains(probe, b"<osm") {
        return Ok(Format::Xml);
    }
    Err(FormatError::Unknown.into())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn blob_compressed_len(blob: &RawBlob) -> usize {
    match &blob.payload {
        BlobPayload::Raw(data) => data.len(),
        BlobPayload::Zlib { data, .. } => data.len(),
        BlobPayload::Empty => 0,
    }
}

fn blob_uncompressed_len(blob: &RawBlob) -> usize {
    match &blob.payload {
        BlobPayload::Raw(data) => data.len(),
        BlobPayload::Zlib { raw_size, .. } => *raw_size,
        BlobPayload::Empty => 0,
    }
}

fn to_pending_job(blob: RawBlob) -> PendingJob {
    match blob.payload {
        BlobPayload::Raw(data) => PendingJob {
            uncompressed_len: data.len(),
            compressed: data,
            compression: JobCompression::Stored,
        },
        BlobPayload::Zlib { data, raw_size } => PendingJob {
            compressed: data,
            uncompressed_len: raw_size,
            compression: JobCompression::Zlib,
        },
        BlobPayload::Empty => PendingJob {
            compressed: Vec::new(),
            uncompressed_len: 0,
            compression: JobCompression::Stored,
        },
    }
}

/// Decodes an `OSMHeader` payload in isolation (never coalesced with data
/// blobs), decompressing inline if needed since a single header is never
/// worth a pool round trip.
fn decode_header_payload(payload: &BlobPayload) -> Result<Vec<u8>, Error> {
    match payload {
        BlobPayload::Raw(data) => Ok(data.clone()),
        BlobPayload::Zlib { data, raw_size } => {
            if !data.is_empty() && *raw_size > data.len() * 100 {
                return Err(DecodeError::CompressedRatioTooHigh.into());
            }
            let mut out = vec![0u8; *raw_size];
            let mut decoder = flate2::read::ZlibDecoder::new(data.as_slice());
            decoder
                .read_exact(&mut out)
                .map_err(|_| DecodeError::DecompressFailed)?;
            Ok(out)
        }
        BlobPayload::Empty => Ok(Vec::new()),
    }
}

fn process_next_binary<R: Read>(
    state: &mut BinaryState<R>,
    config: &ReaderConfig,
    pool: &rayon::ThreadPool,
    callbacks: &mut dyn Callbacks,
) -> Result<Advance, Error> {
    if let Some(block) = state.pending.pop_front() {
        let bytes = &state.arena[block.offset..block.offset + block.len];
        let decoded = decode_primitive_block(bytes)?;
        if !decoded.nodes.is_empty() {
            callbacks.on_nodes(&decoded.nodes);
        }
        for way in &decoded.ways {
            callbacks.on_way(way);
        }
        for relation in &decoded.relations {
            callbacks.on_relation(relation);
        }
        return Ok(Advance::Continue);
    }

    let first = match state.lookahead.take() {
        Some(b) => b,
        None => match state.framer.read_next()? {
            Some(b) => b,
            None => return Ok(Advance::Eof),
        },
    };

    if first.kind == BlobKind::Header {
        let payload = decode_header_payload(&first.payload)?;
        let decoded = decode_header_block(&payload)?;
        if let Some(bounds) = decoded.bounds {
            callbacks.on_bounds(bounds);
        }
        return Ok(Advance::Continue);
    }

    // Coalesce consecutive OSMData blobs until a cap is hit or the framer
    // hands back a Header blob or EOF.
    let mut compressed_total = blob_compressed_len(&first);
    let mut uncompressed_total = blob_uncompressed_len(&first);
    let mut blobs = vec![first];

    while blobs.len() < config.max_pool_jobs_per_batch
        && compressed_total < config.max_accumulated_compressed_bytes
        && uncompressed_total < config.max_accumulated_uncompressed_bytes
    {
        match state.framer.read_next()? {
            None => break,
            Some(b) if b.kind == BlobKind::Header => {
                state.lookahead = Some(b);
                break;
            }
            Some(b) => {
                compressed_total += blob_compressed_len(&b);
                uncompressed_total += blob_uncompressed_len(&b);
                blobs.push(b);
            }
        }
    }

    let jobs: Vec<PendingJob> = blobs.into_iter().map(to_pending_job).collect();
    let output = pool::run_batch(jobs, pool)?;
    state.arena = output.arena;
    state.pending = output.blocks.into_iter().collect();

    // The batch always contains at least one blob, so there is always at
    // least one queued block to serve now.
    process_next_binary(state, config, pool, callbacks)
}

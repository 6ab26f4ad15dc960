// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Parallel DEFLATE decompression of a batch of blobs into one shared
//! arena. Workers only ever see a compressed source slice and a disjoint
//! destination window obtained by repeated `split_at_mut` - nothing
//! shared-mutable survives across the barrier, per the re-architecture
//! directive against the reference implementation's shared-record worker
//! state.

use std::io::Read;

use rayon::prelude::*;

use crate::error::DecodeError;

/// A handful of zero bytes appended past the last block, mirroring the
/// guard region the binary format's string-table trick relies on; this
/// crate does not perform that trick (see `binary::strtable`), but keeping
/// the guard costs nothing and matches the corpus's own arena sizing habit.
const ARENA_GUARD_BYTES: usize = 8;

/// Anti-"zip-bomb" ratio: declared uncompressed size may not exceed this
/// multiple of the compressed size.
const MAX_COMPRESSION_RATIO: usize = 100;

/// Whether a job's `compressed` bytes need DEFLATE decoding or are already
/// the final bytes (an uncompressed `raw` blob payload, copied through so
/// every blob - compressed or not - ends up in the same arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCompression {
    Zlib,
    Stored,
}

pub struct PendingJob {
    pub compressed: Vec<u8>,
    pub uncompressed_len: usize,
    pub compression: JobCompression,
}

#[derive(Debug, Clone, Copy)]
pub struct DecompressedBlock {
    pub offset: usize,
    pub len: usize,
}

pub struct DecompressionOutput {
    pub arena: Vec<u8>,
    pub blocks: Vec<DecompressedBlock>,
}

/// Builds the fixed-size rayon pool this reader's decompression batches run
/// on. Built once at `open()` and reused for every batch, matching the
/// teacher's pattern of resolving worker counts once at startup rather than
/// per call.
pub fn build_pool(num_threads: usize) -> Result<rayon::ThreadPool, DecodeError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads.max(1))
        .build()
        .map_err(|_| DecodeError::DecompressFailed)
}

/// Decompresses every job in `jobs`, in submission order in the returned
/// `blocks` list, using the given pool.
pub fn run_batch(jobs: Vec<PendingJob>, pool: &rayon::ThreadPool) -> Result<DecompressionOutput, DecodeError> {
    for job in &jobs {
        match job.compression {
            JobCompression::Stored => {
                if job.compressed.len() != job.uncompressed_len {
                    return Err(DecodeError::DecompressFailed);
                }
            }
            JobCompression::Zlib => {
                if job.compressed.is_empty() {
                    if job.uncompressed_len != 0 {
                        return Err(DecodeError::DecompressFailed);
                    }
                } else if job.uncompressed_len > job.compressed.len() * MAX_COMPRESSION_RATIO {
                    return Err(DecodeError::CompressedRatioTooHigh);
                }
            }
        }
    }

    let total: usize = jobs.iter().map(|j| j.uncompressed_len).sum();
    let mut arena = vec![0u8; total + ARENA_GUARD_BYTES];

    let mut blocks = Vec::with_capacity(jobs.len());
    let mut job_windows: Vec<&mut [u8]> = Vec::with_capacity(jobs.len());
    {
        let mut remaining = arena.as_mut_slice();
        let mut offset = 0;
        for job in &jobs {
            let (window, rest) = remaining.split_at_mut(job.uncompressed_len);
            job_windows.push(window);
            remaining = rest;
            blocks.push(DecompressedBlock {
                offset,
                len: job.uncompressed_len,
            });
            offset += job.uncompressed_len;
        }
    }

    let all_ok = pool.install(|| {
        jobs.par_iter()
            .zip(job_windows.into_par_iter())
            .map(|(job, window)| decompress_one(job, window))
            .collect::<Vec<bool>>()
    });

    if all_ok.iter().any(|ok| !ok) {
        return Err(DecodeError::DecompressFailed);
    }

    Ok(DecompressionOutput { arena, blocks })
}

/// Writes `job`'s final bytes into `dst` - either a straight copy (`Stored`,
/// for already-uncompressed blob payloads) or a DEFLATE decode (`Zlib`).
/// Returns `false` on any short read, decode error, length mismatch, or
/// trailing garbage.
fn decompress_one(job: &PendingJob, dst: &mut [u8]) -> bool {
    match job.compression {
        JobCompression::Stored => {
            if job.compressed.len() != dst.len() {
                return false;
            }
            dst.copy_from_slice(&job.compressed);
            true
        }
        JobCompression::Zlib => {
            if dst.is_empty() {
                return true;
            }
            let mut decoder = flate2::read::ZlibDecoder::new(job.compressed.as_slice());
            if decoder.read_exact(dst).is_err() {
                return false;
            }
            let mut probe = [0u8; 1];
            matches!(decoder.read(&mut probe), Ok(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zlib_compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn pool(n: usize) -> rayon::ThreadPool {
        build_pool(n).unwrap()
    }

    #[test]
    fn decompresses_single_job() {
        let payload = b"hello world, this is a block".to_vec();
        let compressed = zlib_compress(&payload);
        let jobs = vec![PendingJob {
            compressed,
            uncompressed_len: payload.len(),
            compression: JobCompression::Zlib,
        }];
        let out = run_batch(jobs, &pool(1)).unwrap();
        assert_eq!(
            &out.arena[out.blocks[0].offset..out.blocks[0].offset + out.blocks[0].len],
            &payload[..]
        );
    }

    #[test]
    fn decompresses_multiple_jobs_in_order() {
        let a = b"first block payload".to_vec();
        let b = b"second, a little longer block".to_vec();
        let jobs = vec![
            PendingJob {
                compressed: zlib_compress(&a),
                uncompressed_len: a.len(),
                compression: JobCompression::Zlib,
            },
            PendingJob {
                compressed: zlib_compress(&b),
                uncompressed_len: b.len(),
                compression: JobCompression::Zlib,
            },
        ];
        let out = run_batch(jobs, &pool(2)).unwrap();
        assert_eq!(out.blocks.len(), 2);
        assert_eq!(
            &out.arena[out.blocks[0].offset..out.blocks[0].offset + out.blocks[0].len],
            &a[..]
        );
        assert_eq!(
            &out.arena[out.blocks[1].offset..out.blocks[1].offset + out.blocks[1].len],
            &b[..]
        );
    }

    #[test]
    fn copies_stored_jobs_through_untouched() {
        let payload = b"already uncompressed raw blob".to_vec();
        let jobs = vec![PendingJob {
            compressed: payload.clone(),
            uncompressed_len: payload.len(),
            compression: JobCompression::Stored,
        }];
        let out = run_batch(jobs, &pool(1)).unwrap();
        assert_eq!(
            &out.arena[out.blocks[0].offset..out.blocks[0].offset + out.blocks[0].len],
            &payload[..]
        );
    }

    #[test]
    fn rejects_excessive_compression_ratio() {
        let jobs = vec![PendingJob {
            compressed: vec![1, 2, 3],
            uncompressed_len: 1000,
            compression: JobCompression::Zlib,
        }];
        assert_eq!(run_batch(jobs, &pool(1)), Err(DecodeError::CompressedRatioTooHigh));
    }

    #[test]
    fn detects_size_mismatch() {
        let payload = b"short".to_vec();
        let compressed = zlib_compress(&payload);
        let jobs = vec![PendingJob {
            compressed,
            uncompressed_len: payload.len() + 10,
            compression: JobCompression::Zlib,
        }];
        assert_eq!(run_batch(jobs, &pool(1)), Err(DecodeError::DecompressFailed));
    }

    #[test]
    fn stored_job_length_mismatch_is_fatal() {
        let jobs = vec![PendingJob {
            compressed: vec![1, 2, 3],
            uncompressed_len: 4,
            compression: JobCompression::Stored,
        }];
        assert_eq!(run_batch(jobs, &pool(1)), Err(DecodeError::DecompressFailed));
    }
}

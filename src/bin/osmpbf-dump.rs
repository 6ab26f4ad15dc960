// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Drives [`osmpbf_reader::Reader`] over a `.osm.pbf` or `.osm` file and
//! prints primitive counts plus the declared bounds, if any.

use std::path::PathBuf;

use clap::Parser;
use osmpbf_reader::{
    Advance, Bounds, Callbacks, Node, NumThreads, Reader, ReaderConfig, Relation, Way,
};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

#[derive(Parser)]
struct Args {
    /// Path to a `.osm.pbf` or textual `.osm` file.
    path: PathBuf,

    /// Decompression worker count, or "auto" to use the detected CPU count.
    #[arg(long, default_value = "auto")]
    threads: ThreadsArg,

    /// Bytes of consecutive OSMData blobs to accumulate before flushing to
    /// the decompression pool.
    #[arg(long, default_value_t = ReaderConfig::default().max_accumulated_compressed_bytes)]
    max_accum_compressed: usize,

    /// Hard cap, in bytes, on the uncompressed arena.
    #[arg(long, default_value_t = ReaderConfig::default().max_accumulated_uncompressed_bytes)]
    max_accum_uncompressed: usize,

    /// Maximum number of blobs pipelined into one decompression batch.
    #[arg(long, default_value_t = ReaderConfig::default().max_pool_jobs_per_batch)]
    max_jobs: usize,
}

#[derive(Clone)]
struct ThreadsArg(NumThreads);

impl std::str::FromStr for ThreadsArg {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self(NumThreads::Auto));
        }
        s.parse::<usize>()
            .map(|n| Self(NumThreads::Fixed(n)))
            .map_err(|_| format!("expected \"auto\" or a positive integer, got {s:?}"))
    }
}

#[derive(Default)]
struct Counters {
    bounds: Option<Bounds>,
    nodes: u64,
    ways: u64,
    relations: u64,
}

impl Callbacks for Counters {
    fn on_bounds(&mut self, bounds: Bounds) {
        self.bounds = Some(bounds);
    }
    fn on_nodes(&mut self, nodes: &[Node<'_>]) {
        self.nodes += nodes.len() as u64;
    }
    fn on_way(&mut self, _way: &Way<'_>) {
        self.ways += 1;
    }
    fn on_relation(&mut self, _relation: &Relation<'_>) {
        self.relations += 1;
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ReaderConfig {
        num_threads: args.threads.0,
        max_accumulated_compressed_bytes: args.max_accum_compressed,
        max_accumulated_uncompressed_bytes: args.max_accum_uncompressed,
        max_pool_jobs_per_batch: args.max_jobs,
    };

    let mut reader = Reader::open_path(&args.path, config)?;
    let mut counters = Counters::default();
    loop {
        match reader.process_next_block(&mut counters)? {
            Advance::Continue => continue,
            Advance::Eof => break,
        }
    }

    if let Some(b) = counters.bounds {
        info!(
            min_lon = b.min_lon,
            min_lat = b.min_lat,
            max_lon = b.max_lon,
            max_lat = b.max_lat,
            "bounds"
        );
    }
    info!(
        nodes = counters.nodes,
        ways = counters.ways,
        relations = counters.relations,
        "done"
    );
    println!(
        "nodes={} ways={} relations={}",
        counters.nodes, counters.ways, counters.relations
    );

    Ok(())
}

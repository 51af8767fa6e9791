//! Tiered dictionary over per-generation shards
//!
//! Postings never move once a shard is saved; the dictionary tracks,
//! for every word key, which generations hold its lists and where.
//! Shard ingests land as tier-0 files and merge upward binary-counter
//! style, so lookups scan a handful of files instead of every shard.
//!
//! # Architecture
//!
//! - `IndexDictionary`: the on-disk tier tree, ingest, merge, lookup
//! - `DictEntry` / `GenTriple`: base-row and auxiliary-slot codec
//! - `GenerationWindow`: bounded newest-first accumulation per lookup

mod merge;
mod record;
mod tiers;
mod window;

pub use record::*;
pub use tiers::*;
pub use window::*;

//! Per-generation inverted-index shards
//!
//! A shard holds the postings and document records for one generation
//! of a crawl. Recent writes accumulate in a mutable shard; saving
//! produces an immutable file that a reader serves lookups from.
//!
//! # Architecture
//!
//! - `IndexShard`: mutable accumulator that serializes one generation
//! - `ShardReader`: read-only view, memory- or disk-backed
//! - `WordKey` / `MetaValue`: 20-byte keys with materialized metadata
//! - posting / doc_map: the wire formats both sides share

mod doc_map;
mod key;
mod posting;
mod reader;
mod scoring;
mod types;
mod writer;

pub use doc_map::*;
pub use key::*;
pub use posting::*;
pub use reader::*;
pub use scoring::*;
pub use types::*;
pub use writer::*;

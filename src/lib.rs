pub mod codec;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod shard;

pub use config::{DictionaryConfig, ScoringConfig, ShardConfig};
pub use dictionary::{DictLookup, DictOptions, IndexDictionary, WordDictEntry};
pub use error::{IndexError, Result};
pub use shard::{IndexShard, LookupOptions, ShardReader, WordKey};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use serde::{Deserialize, Serialize};

/// Shard construction and read settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Capacity hint written into the shard header
    pub docs_per_generation: u32,
    /// Sanity bound on doc-key chunks per document-info record; records
    /// claiming more are treated as corrupt
    pub max_doc_keys: u8,
    /// Read granularity of the disk-backed reader
    pub block_size: usize,
    /// Block-cache purge threshold for the disk-backed reader
    pub max_cached_blocks: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            docs_per_generation: 50_000,
            max_doc_keys: 24,
            block_size: 4096,
            max_cached_blocks: 1024,
        }
    }
}

/// Dictionary merge and lookup settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DictionaryConfig {
    /// Non-matching or damaged rows tolerated while fanning out around a
    /// binary-search hit before the scan gives up
    pub break_count: u32,
    /// Default cap on distinct generations accumulated per lookup
    pub generation_window: usize,
    /// Cap on auxiliary slots chained behind one row; combining beyond it
    /// drops the oldest generations
    pub max_aux_slots: u8,
    /// Read-buffer budget for streaming tier merges
    pub merge_segment_bytes: usize,
}

impl Default for DictionaryConfig {
    fn default() -> Self {
        Self {
            break_count: 1,
            generation_window: 20,
            max_aux_slots: 255,
            merge_segment_bytes: 4 * 1024 * 1024,
        }
    }
}

impl DictionaryConfig {
    pub fn with_break_count(mut self, break_count: u32) -> Self {
        self.break_count = break_count;
        self
    }

    pub fn with_generation_window(mut self, window: usize) -> Self {
        self.generation_window = window;
        self
    }

    pub fn with_merge_segment_bytes(mut self, bytes: usize) -> Self {
        self.merge_segment_bytes = bytes;
        self
    }
}

/// Scoring constants consumed by the BM25F-style item builder
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub title_weight: f32,
    pub description_weight: f32,
    pub link_weight: f32,
    /// Word positions below this value count as title hits
    pub title_length_threshold: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            title_weight: 4.0,
            description_weight: 1.0,
            link_weight: 2.0,
            title_length_threshold: 20,
        }
    }
}

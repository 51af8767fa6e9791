//! Shared shard types: the fixed header, row payloads, prefix-index
//! entries, and the structs returned by lookups.

use std::fmt;

use crate::error::{IndexError, Result};
use crate::shard::key::{MetaMask, WordKey, WORD_KEY_LEN};

/// Highest generation id representable across all row formats.
pub const MAX_GENERATION: u32 = u16::MAX as u32;

/// Fixed shard-file header length: ten big-endian u32 fields.
pub const SHARD_HEADER_LEN: usize = 40;

/// A stored row or auxiliary slot is always this long.
pub const WORD_ROW_LEN: usize = WORD_KEY_LEN + WORD_DATA_LEN;

/// Data portion of a stored row.
pub const WORD_DATA_LEN: usize = 12;

/// Offset-field sentinel marking a compact (inlined) row.
pub const COMPACT_MARKER: u32 = u32::MAX;

/// Entries in a prefix index (one per byte value).
pub const PREFIX_ENTRIES: usize = 256;

/// Serialized prefix-index length.
pub const PREFIX_INDEX_LEN: usize = PREFIX_ENTRIES * 8;

/// Offset-field sentinel for an absent prefix-index entry.
pub const ABSENT_PREFIX: u32 = u32::MAX;

/// Inline postings pack `(doc_index + 1) << COMPACT_POSITION_BITS | position`.
pub const COMPACT_POSITION_BITS: u32 = 12;

/// An 8-byte document key chunk (the first chunk is the URL hash).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey(pub [u8; 8]);

impl DocKey {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        DocKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Debug for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocKey({})", self)
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// The ten-field fixed header of a serialized shard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShardHeader {
    pub prefix_len: u32,
    pub words_len: u32,
    pub postings_len: u32,
    pub doc_infos_len: u32,
    pub generation: u32,
    pub docs_per_generation: u32,
    pub num_docs: u32,
    pub num_link_docs: u32,
    pub len_all_docs: u32,
    pub len_all_link_docs: u32,
}

impl ShardHeader {
    pub fn to_bytes(&self) -> [u8; SHARD_HEADER_LEN] {
        let fields = [
            self.prefix_len,
            self.words_len,
            self.postings_len,
            self.doc_infos_len,
            self.generation,
            self.docs_per_generation,
            self.num_docs,
            self.num_link_docs,
            self.len_all_docs,
            self.len_all_link_docs,
        ];
        let mut buf = [0u8; SHARD_HEADER_LEN];
        for (i, f) in fields.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&f.to_be_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SHARD_HEADER_LEN {
            return Err(IndexError::ShardHeader(format!(
                "header needs {} bytes, got {}",
                SHARD_HEADER_LEN,
                data.len()
            )));
        }
        let field = |i: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&data[i * 4..i * 4 + 4]);
            u32::from_be_bytes(buf)
        };
        let header = ShardHeader {
            prefix_len: field(0),
            words_len: field(1),
            postings_len: field(2),
            doc_infos_len: field(3),
            generation: field(4),
            docs_per_generation: field(5),
            num_docs: field(6),
            num_link_docs: field(7),
            len_all_docs: field(8),
            len_all_link_docs: field(9),
        };
        if header.words_len as usize % WORD_ROW_LEN != 0 {
            return Err(IndexError::ShardHeader(format!(
                "word array length {} is not a whole number of rows",
                header.words_len
            )));
        }
        if header.generation > MAX_GENERATION {
            return Err(IndexError::ShardHeader(format!(
                "generation {} out of range",
                header.generation
            )));
        }
        Ok(header)
    }

    /// Total serialized shard size.
    pub fn total_len(&self) -> u64 {
        SHARD_HEADER_LEN as u64
            + self.prefix_len as u64
            + self.words_len as u64
            + self.postings_len as u64
            + self.doc_infos_len as u64
    }

    pub fn doc_total(&self) -> u32 {
        self.num_docs + self.num_link_docs
    }
}

/// One prefix-index entry: where a byte value's rows begin and how many
/// there are. Shard files index the key's first byte in row units;
/// dictionary files index the second byte in slot units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrefixEntry {
    pub first: u32,
    pub count: u32,
}

impl PrefixEntry {
    pub fn absent() -> Self {
        PrefixEntry {
            first: ABSENT_PREFIX,
            count: 0,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.first == ABSENT_PREFIX
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.first.to_be_bytes());
        out.extend_from_slice(&self.count.to_be_bytes());
    }

    pub fn read_from(data: &[u8]) -> Self {
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        a.copy_from_slice(&data[..4]);
        b.copy_from_slice(&data[4..8]);
        PrefixEntry {
            first: u32::from_be_bytes(a),
            count: u32::from_be_bytes(b),
        }
    }
}

/// Where a word's postings live, surfaced as an explicit encoding enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostingsRef {
    /// A contiguous extent of the postings blob (blob-relative offsets,
    /// `last_offset` exclusive).
    Extent {
        first_offset: u32,
        last_offset: u32,
        count: u32,
    },
    /// A single-document, single-occurrence posting inlined in the row.
    Inline { doc_index: u32, position: u32 },
}

impl PostingsRef {
    pub fn count(&self) -> u32 {
        match *self {
            PostingsRef::Extent { count, .. } => count,
            PostingsRef::Inline { .. } => 1,
        }
    }

    /// Pack an inline posting into its stored 4-byte form.
    pub fn pack_inline(doc_index: u32, position: u32) -> u32 {
        ((doc_index + 1) << COMPACT_POSITION_BITS) | position
    }

    /// Unpack a stored inline posting.
    pub fn unpack_inline(packed: u32) -> PostingsRef {
        let (doc_index, position) = Self::inline_parts(packed);
        PostingsRef::Inline { doc_index, position }
    }

    /// Split a stored inline posting into document index and position.
    /// A zeroed word decodes to document zero rather than wrapping.
    pub fn inline_parts(packed: u32) -> (u32, u32) {
        (
            (packed >> COMPACT_POSITION_BITS).saturating_sub(1),
            packed & ((1 << COMPACT_POSITION_BITS) - 1),
        )
    }

    /// Whether a posting qualifies for the inline encoding.
    pub fn inline_eligible(doc_index: u32, positions: &[u32]) -> bool {
        positions.len() == 1
            && doc_index + 1 < (1 << 20)
            && positions[0] < (1 << COMPACT_POSITION_BITS)
    }
}

/// Successful shard lookup: the postings location plus the stored key
/// actually matched (relevant under shifted or masked comparison).
#[derive(Clone, Copy, Debug)]
pub struct WordInfo {
    pub postings: PostingsRef,
    pub matched_key: WordKey,
}

/// Lookup comparison options shared by shard and dictionary searches.
#[derive(Clone, Copy, Debug, Default)]
pub struct LookupOptions {
    /// Ignore this many low-order bits of the 8-byte hash prefix.
    pub shift: u32,
    /// Compare the full 20 key bytes instead of the hash prefix.
    pub exact: bool,
    /// Filter candidates by their materialized meta bytes.
    pub mask: Option<MetaMask>,
}

impl LookupOptions {
    pub fn exact_match() -> Self {
        LookupOptions {
            exact: true,
            ..Default::default()
        }
    }

    pub fn with_shift(mut self, shift: u32) -> Self {
        self.shift = shift;
        self
    }

    pub fn with_mask(mut self, mask: MetaMask) -> Self {
        self.mask = Some(mask);
        self
    }
}

/// One scored posting decoded by the item builder.
#[derive(Clone, Debug)]
pub struct PostingItem {
    pub doc_key: DocKey,
    pub key_count: u8,
    pub doc_index: u32,
    pub positions: Vec<u32>,
    pub doc_len: u32,
    pub rank: u8,
    pub is_doc: bool,
    pub relevance: f32,
    pub score: f32,
}

/// Outcome of serializing a shard.
#[derive(Clone, Copy, Debug)]
pub struct ShardSaveInfo {
    pub bytes_written: u64,
    pub checksum: u32,
}

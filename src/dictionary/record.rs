//! Dictionary entry codec
//!
//! A word's entry in a tier file is one 32-byte base row optionally
//! followed by auxiliary 32-byte slots. The base row carries the key,
//! the chained-slot count, and the first generation triple; each aux
//! slot carries up to three more `(generation, offset, packed)` triples
//! in encounter order, oldest first. Aux slots set the reserved high
//! bit of byte 1, which real keys never carry.

use tracing::warn;

use crate::error::{IndexError, Result};
use crate::shard::{
    PostingsRef, WordKey, AUX_FLAG, COMPACT_MARKER, WORD_KEY_LEN, WORD_ROW_LEN,
};

/// Tier files are addressed in 32-byte slots.
pub const SLOT_LEN: usize = WORD_ROW_LEN;

/// Generation triples chained per auxiliary slot.
pub const TRIPLES_PER_SLOT: usize = 3;

const TRIPLE_LEN: usize = 10;

/// Low bits of the packed word hold the (saturating) document count.
pub const COUNT_BITS: u32 = 10;

/// Stored document counts saturate here.
pub const MAX_STORED_COUNT: u32 = (1 << COUNT_BITS) - 1;

/// Extent lengths are stored in codec words, 22 bits.
pub const MAX_LEN_WORDS: u32 = (1 << 22) - 1;

/// One generation's postings location within its shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenTriple {
    pub generation: u32,
    first_offset: u32,
    packed: u32,
}

impl GenTriple {
    /// Rewrite a shard row's postings reference for dictionary storage.
    pub fn from_postings(generation: u32, postings: &PostingsRef) -> GenTriple {
        match *postings {
            PostingsRef::Inline { doc_index, position } => GenTriple {
                generation,
                first_offset: COMPACT_MARKER,
                packed: PostingsRef::pack_inline(doc_index, position),
            },
            PostingsRef::Extent { first_offset, last_offset, count } => {
                let len_bytes = last_offset.saturating_sub(first_offset);
                debug_assert_eq!(len_bytes % 4, 0);
                let mut len_words = len_bytes / 4;
                if len_words > MAX_LEN_WORDS {
                    warn!(len_words, "posting extent too long for a dictionary row, truncating");
                    len_words = MAX_LEN_WORDS;
                }
                GenTriple {
                    generation,
                    first_offset,
                    packed: (len_words << COUNT_BITS) | count.min(MAX_STORED_COUNT),
                }
            }
        }
    }

    pub(crate) fn from_raw(generation: u32, first_offset: u32, packed: u32) -> GenTriple {
        GenTriple { generation, first_offset, packed }
    }

    /// The postings location this triple points at, offsets relative to
    /// generation `generation`'s shard blob.
    pub fn postings(&self) -> PostingsRef {
        if self.first_offset == COMPACT_MARKER {
            PostingsRef::unpack_inline(self.packed)
        } else {
            PostingsRef::Extent {
                first_offset: self.first_offset,
                // Saturate: a corrupt slot may hold a wild offset, and
                // the extent bounds check rejects it downstream.
                last_offset: self
                    .first_offset
                    .saturating_add((self.packed >> COUNT_BITS) * 4),
                count: self.packed & MAX_STORED_COUNT,
            }
        }
    }

    /// Stored (saturating) document count.
    pub fn count(&self) -> u32 {
        if self.first_offset == COMPACT_MARKER {
            1
        } else {
            self.packed & MAX_STORED_COUNT
        }
    }
}

/// One word's aggregated dictionary entry: key plus generation triples
/// in encounter order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DictEntry {
    pub key: WordKey,
    pub triples: Vec<GenTriple>,
}

impl DictEntry {
    pub fn new(key: WordKey, generation: u32, postings: &PostingsRef) -> Self {
        DictEntry {
            key,
            triples: vec![GenTriple::from_postings(generation, postings)],
        }
    }

    /// Slots this entry serializes to: the base row plus aux slots.
    pub fn slot_len(&self) -> u64 {
        1 + aux_slots_for(self.triples.len()) as u64
    }

    /// Merge two entries for the same key, the older file's first.
    /// A generation present in both keeps the later occurrence.
    pub fn combine(older: DictEntry, newer: DictEntry) -> DictEntry {
        debug_assert_eq!(older.key, newer.key);
        let mut triples = older.triples;
        triples.extend(newer.triples);
        // Drop every triple shadowed by a later one for the same
        // generation.
        let mut kept = Vec::with_capacity(triples.len());
        for (i, triple) in triples.iter().enumerate() {
            let shadowed = triples[i + 1..]
                .iter()
                .any(|t| t.generation == triple.generation);
            if !shadowed {
                kept.push(*triple);
            }
        }
        DictEntry {
            key: newer.key,
            triples: kept,
        }
    }

    /// Enforce the auxiliary-chain cap by dropping oldest generations.
    pub fn apply_aux_cap(&mut self, max_aux_slots: u8) {
        let keep = 1 + TRIPLES_PER_SLOT * max_aux_slots as usize;
        if self.triples.len() > keep {
            self.triples.drain(..self.triples.len() - keep);
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        debug_assert!(!self.triples.is_empty());
        let base = &self.triples[0];
        let aux_count = aux_slots_for(self.triples.len());
        out.extend_from_slice(self.key.as_bytes());
        out.extend_from_slice(
            &((u32::from(aux_count) << 24) | (base.generation & 0x00FF_FFFF)).to_be_bytes(),
        );
        out.extend_from_slice(&base.first_offset.to_be_bytes());
        out.extend_from_slice(&base.packed.to_be_bytes());

        for chunk in self.triples[1..].chunks(TRIPLES_PER_SLOT) {
            out.push(chunk.len() as u8);
            out.push(AUX_FLAG);
            for triple in chunk {
                out.extend_from_slice(&(triple.generation as u16).to_be_bytes());
                out.extend_from_slice(&triple.first_offset.to_be_bytes());
                out.extend_from_slice(&triple.packed.to_be_bytes());
            }
            for _ in chunk.len()..TRIPLES_PER_SLOT {
                out.extend_from_slice(&[0u8; TRIPLE_LEN]);
            }
        }
    }
}

fn aux_slots_for(triples: usize) -> u8 {
    ((triples.saturating_sub(1)).div_ceil(TRIPLES_PER_SLOT)) as u8
}

/// Whether a stored slot is an auxiliary slot rather than a base row.
pub fn is_aux_slot(slot: &[u8; SLOT_LEN]) -> bool {
    slot[1] & AUX_FLAG != 0
}

/// Split a base row into its raw key bytes, chained-slot count, and
/// first triple.
pub fn decode_base(slot: &[u8; SLOT_LEN]) -> ([u8; WORD_KEY_LEN], u8, GenTriple) {
    let mut key = [0u8; WORD_KEY_LEN];
    key.copy_from_slice(&slot[..WORD_KEY_LEN]);
    let field = |i: usize| {
        let at = WORD_KEY_LEN + i * 4;
        u32::from_be_bytes([slot[at], slot[at + 1], slot[at + 2], slot[at + 3]])
    };
    let gen_word = field(0);
    (
        key,
        (gen_word >> 24) as u8,
        GenTriple {
            generation: gen_word & 0x00FF_FFFF,
            first_offset: field(1),
            packed: field(2),
        },
    )
}

/// Decode an auxiliary slot's triples.
pub fn decode_aux(slot: &[u8; SLOT_LEN], at_slot: u64) -> Result<Vec<GenTriple>> {
    let used = slot[0] as usize;
    if !is_aux_slot(slot) || used == 0 || used > TRIPLES_PER_SLOT {
        return Err(IndexError::CorruptRecord {
            context: "auxiliary dictionary slot",
            offset: at_slot * SLOT_LEN as u64,
        });
    }
    let mut triples = Vec::with_capacity(used);
    for i in 0..used {
        let at = 2 + i * TRIPLE_LEN;
        triples.push(GenTriple {
            generation: u32::from(u16::from_be_bytes([slot[at], slot[at + 1]])),
            first_offset: u32::from_be_bytes([
                slot[at + 2],
                slot[at + 3],
                slot[at + 4],
                slot[at + 5],
            ]),
            packed: u32::from_be_bytes([
                slot[at + 6],
                slot[at + 7],
                slot[at + 8],
                slot[at + 9],
            ]),
        });
    }
    Ok(triples)
}

//! Wire form of a single posting: document index plus delta-coded
//! positions, packed with the word-aligned codec.
//!
//! Short postings fold the first position into the lead element so a
//! one-position posting often fits a single codec word. The low bit of
//! the lead element distinguishes the two layouts.

use crate::codec;
use crate::error::{IndexError, Result};

/// Largest document index the unfolded lead element can carry.
pub const MAX_DOC_INDEX: u32 = (1 << 27) - 2;

/// Largest position value; deltas are stored plus one.
pub const MAX_POSITION: u32 = codec::MAX_ELEMENT - 1;

/// Bits of the first position folded into the lead element.
const FOLD_POSITION_BITS: u32 = 12;

/// Folding requires `doc_index + 1` below this bound.
const FOLD_DOC_LIMIT: u32 = 1 << 15;

/// Below this byte span the offset search walks postings linearly.
const LINEAR_SPAN: usize = 16 * codec::WORD_BYTES;

/// How far past a corrupt posting's start a resynchronizing walk skips
/// before scanning for the next boundary.
pub const RESYNC_STEP: usize = codec::WORD_BYTES;

/// Append the encoded posting for one document to `output`.
///
/// `positions` must be strictly increasing. The first delta is the first
/// position itself; each wire element is the delta plus one so that zero
/// stays reserved for codec padding.
pub fn pack_posting(doc_index: u32, positions: &[u32], output: &mut Vec<u8>) {
    debug_assert!(doc_index <= MAX_DOC_INDEX);
    debug_assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    debug_assert!(positions.iter().all(|&p| p <= MAX_POSITION));

    let doc_plus = doc_index + 1;
    let mut elements = Vec::with_capacity(positions.len() + 1);
    match positions.first() {
        Some(&first) if doc_plus < FOLD_DOC_LIMIT && first < (1 << FOLD_POSITION_BITS) => {
            elements.push((doc_plus << (FOLD_POSITION_BITS + 1)) | (first << 1) | 1);
        }
        Some(&first) => {
            elements.push(doc_plus << 1);
            elements.push(first + 1);
        }
        None => elements.push(doc_plus << 1),
    }
    for pair in positions.windows(2) {
        elements.push(pair[1] - pair[0] + 1);
    }
    codec::encode_into(&elements, output);
}

/// Decode the posting starting at `*pos`, advancing the cursor past it.
pub fn unpack_posting(data: &[u8], pos: &mut usize) -> Result<(u32, Vec<u32>)> {
    let start = *pos;
    let mut elements = Vec::new();
    codec::decode_into(data, pos, &mut elements)?;
    let Some((&lead, rest)) = elements.split_first() else {
        return Err(IndexError::CorruptRecord {
            context: "empty posting",
            offset: start as u64,
        });
    };

    let mut positions = Vec::with_capacity(rest.len() + 1);
    let doc_plus = if lead & 1 == 1 {
        positions.push((lead >> 1) & ((1 << FOLD_POSITION_BITS) - 1));
        lead >> (FOLD_POSITION_BITS + 1)
    } else {
        lead >> 1
    };
    if doc_plus == 0 {
        return Err(IndexError::CorruptRecord {
            context: "posting doc index",
            offset: start as u64,
        });
    }

    // Decoded elements are never zero, so the minus one cannot wrap.
    for &element in rest {
        let delta = element - 1;
        match positions.last() {
            Some(&prev) => positions.push(prev + delta),
            None => positions.push(delta),
        }
    }
    Ok((doc_plus - 1, positions))
}

/// Read just the document index of the posting starting at `offset`.
pub fn posting_doc_index(data: &[u8], offset: usize) -> Result<u32> {
    let lead = codec::first_element(data, offset)?;
    let doc_plus = if lead & 1 == 1 {
        lead >> (FOLD_POSITION_BITS + 1)
    } else {
        lead >> 1
    };
    if doc_plus == 0 {
        return Err(IndexError::CorruptRecord {
            context: "posting doc index",
            offset: offset as u64,
        });
    }
    Ok(doc_plus - 1)
}

/// Byte offset just past the posting starting at `offset`.
pub fn posting_end(data: &[u8], offset: usize) -> Result<usize> {
    Ok(codec::list_end(data, offset)?)
}

/// Next posting boundary at or after `from`, for resynchronizing a walk
/// after a corrupt stretch.
pub fn next_posting_offset(data: &[u8], from: usize) -> Option<usize> {
    codec::next_list_offset(data, from)
}

/// Find the first posting at or after `from` whose document index is at
/// least `target`. Returns the posting's byte offset and document index.
///
/// Gallops forward with doubling byte strides, then bisects the bracketed
/// byte range, realigning every probe to the next posting boundary. Small
/// ranges fall back to a plain walk.
pub fn seek_doc_index(data: &[u8], from: usize, target: u32) -> Result<Option<(usize, u32)>> {
    if from >= data.len() {
        return Ok(None);
    }
    let doc = posting_doc_index(data, from)?;
    if doc >= target {
        return Ok(Some((from, doc)));
    }

    // Gallop until a probe lands at or past the target document.
    let mut low = from;
    let mut high = data.len();
    let mut high_hit: Option<(usize, u32)> = None;
    let mut stride = codec::WORD_BYTES;
    loop {
        let probe_raw = low.saturating_add(stride);
        if probe_raw >= data.len() {
            break;
        }
        let Some(probe) = codec::next_list_offset(data, align_word(probe_raw)) else {
            break;
        };
        if probe <= low {
            break;
        }
        let doc = posting_doc_index(data, probe)?;
        if doc < target {
            low = probe;
            stride <<= 1;
        } else {
            high = probe;
            high_hit = Some((probe, doc));
            break;
        }
    }

    // Bisect the byte range; every probe realigns to a posting start.
    while high - low > LINEAR_SPAN {
        let mid_raw = align_word(low + (high - low) / 2);
        let Some(mid) = codec::next_list_offset(&data[..high], mid_raw) else {
            break;
        };
        if mid <= low {
            break;
        }
        let doc = posting_doc_index(data, mid)?;
        if doc < target {
            low = mid;
        } else {
            high = mid;
            high_hit = Some((mid, doc));
        }
    }

    // `low` still points at a posting below the target; walk the gap.
    let limit = high_hit.map_or(data.len(), |(offset, _)| offset);
    let mut cursor = posting_end(data, low)?;
    while cursor < limit {
        let doc = posting_doc_index(data, cursor)?;
        if doc >= target {
            return Ok(Some((cursor, doc)));
        }
        cursor = posting_end(data, cursor)?;
    }
    Ok(high_hit)
}

fn align_word(pos: usize) -> usize {
    pos & !(codec::WORD_BYTES - 1)
}

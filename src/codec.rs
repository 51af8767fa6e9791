//! Word-aligned variable-width integer list codec ("Mod9")
//!
//! Posting lists and delta-coded position lists are packed into 32-bit
//! big-endian words. The top two bits of every word flag list boundaries
//! (bit 31: first word of a list, bit 30: last word), so a list can be
//! decoded, measured, or resynced from any word boundary without an
//! external length. Below the flags a short selector picks one of nine
//! element widths; the encoder greedily takes the narrowest width that
//! still fills the word. Zero is the blank sentinel padding a partly
//! filled final word, so encodable values are `1..=MAX_ELEMENT`.

use thiserror::Error;

/// Largest value a single element can carry (28 bits).
pub const MAX_ELEMENT: u32 = (1 << 28) - 1;

/// Bytes per codec word.
pub const WORD_BYTES: usize = 4;

/// Set on the first word of an encoded list.
pub const FIRST_BIT: u32 = 1 << 31;

/// Set on the last word of an encoded list.
pub const LAST_BIT: u32 = 1 << 30;

const FLAG_MASK: u32 = FIRST_BIT | LAST_BIT;

/// Damage detected while reading encoded words.
///
/// All variants are recoverable: callers skip forward to the next list
/// start (`next_list_offset`) and log, rather than abort.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated codec word at byte {offset}")]
    Truncated { offset: usize },

    #[error("word at byte {offset} does not start a list")]
    MissingListStart { offset: usize },

    #[error("unexpected list start inside a list at byte {offset}")]
    UnexpectedListStart { offset: usize },

    #[error("invalid width selector {selector:#04x} at byte {offset}")]
    BadSelector { offset: usize, selector: u8 },
}

#[derive(Clone, Copy)]
struct Packing {
    bits: u32,
    capacity: usize,
    /// Selector bits already positioned below the flag bits.
    selector: u32,
}

/// The nine packings, narrowest width first. Widths of 9/14/28 bits use a
/// two-bit selector over a 28-bit payload; the rest extend the selector to
/// six bits over a 24-bit payload.
const PACKINGS: [Packing; 9] = [
    Packing { bits: 1, capacity: 24, selector: 0x3F00_0000 },
    Packing { bits: 2, capacity: 12, selector: 0x3E00_0000 },
    Packing { bits: 3, capacity: 8, selector: 0x3C00_0000 },
    Packing { bits: 4, capacity: 6, selector: 0x3800_0000 },
    Packing { bits: 5, capacity: 4, selector: 0x3400_0000 },
    Packing { bits: 6, capacity: 4, selector: 0x3000_0000 },
    Packing { bits: 9, capacity: 3, selector: 0x2000_0000 },
    Packing { bits: 14, capacity: 2, selector: 0x1000_0000 },
    Packing { bits: 28, capacity: 1, selector: 0x0000_0000 },
];

#[inline]
fn width_max(bits: u32) -> u32 {
    (1u32 << bits) - 1
}

fn packing_for(word: u32, offset: usize) -> Result<Packing, CodecError> {
    match (word >> 28) & 0b11 {
        0b00 => Ok(PACKINGS[8]),
        0b01 => Ok(PACKINGS[7]),
        0b10 => Ok(PACKINGS[6]),
        _ => match (word >> 24) & 0x3F {
            0x30 => Ok(PACKINGS[5]),
            0x34 => Ok(PACKINGS[4]),
            0x38 => Ok(PACKINGS[3]),
            0x3C => Ok(PACKINGS[2]),
            0x3E => Ok(PACKINGS[1]),
            0x3F => Ok(PACKINGS[0]),
            sel => Err(CodecError::BadSelector {
                offset,
                selector: sel as u8,
            }),
        },
    }
}

/// Pack as many leading values as one word holds, narrowest width first.
/// Returns the payload+selector word and the number of values consumed.
fn pack_one_word(values: &[u32]) -> (u32, usize) {
    for p in PACKINGS {
        let take = p.capacity.min(values.len());
        // A width is usable only if it fills the word or exhausts the input
        if take != p.capacity && take != values.len() {
            continue;
        }
        let limit = width_max(p.bits);
        if values[..take].iter().any(|&v| v > limit) {
            continue;
        }
        let mut word = p.selector;
        for (i, &v) in values[..take].iter().enumerate() {
            word |= v << ((p.capacity - 1 - i) as u32 * p.bits);
        }
        return (word, take);
    }
    // 28-bit packing accepts any validated element
    unreachable!("no packing matched a valid element")
}

/// Read one big-endian codec word at `offset`.
#[inline]
pub fn read_word(data: &[u8], offset: usize) -> Result<u32, CodecError> {
    if offset + WORD_BYTES > data.len() {
        return Err(CodecError::Truncated { offset });
    }
    let mut buf = [0u8; WORD_BYTES];
    buf.copy_from_slice(&data[offset..offset + WORD_BYTES]);
    Ok(u32::from_be_bytes(buf))
}

/// True if the word at `offset` carries the list-start flag.
#[inline]
pub fn is_list_start(data: &[u8], offset: usize) -> bool {
    matches!(read_word(data, offset), Ok(w) if w & FIRST_BIT != 0)
}

/// Encode a list of values in `1..=MAX_ELEMENT` onto `output`.
///
/// An empty list still emits one all-blank word so that every encoded
/// list occupies at least one self-delimiting word.
pub fn encode_into(values: &[u32], output: &mut Vec<u8>) {
    debug_assert!(
        values.iter().all(|&v| v >= 1 && v <= MAX_ELEMENT),
        "codec elements must be in 1..=MAX_ELEMENT"
    );
    let first_word = output.len();
    let mut rest = values;
    loop {
        let (mut word, took) = pack_one_word(rest);
        rest = &rest[took..];
        if output.len() == first_word {
            word |= FIRST_BIT;
        }
        if rest.is_empty() {
            word |= LAST_BIT;
        }
        output.extend_from_slice(&word.to_be_bytes());
        if rest.is_empty() {
            return;
        }
    }
}

/// Encode a list of values in `1..=MAX_ELEMENT`.
pub fn encode(values: &[u32]) -> Vec<u8> {
    let mut output = Vec::with_capacity(WORD_BYTES * (values.len() / 2 + 1));
    encode_into(values, &mut output);
    output
}

fn unpack_elements(word: u32, p: Packing, out: &mut Vec<u32>) {
    let mask = width_max(p.bits);
    for i in 0..p.capacity {
        let v = (word >> ((p.capacity - 1 - i) as u32 * p.bits)) & mask;
        if v == 0 {
            break;
        }
        out.push(v);
    }
}

/// Decode the list starting at `*pos`, appending to `out` and advancing
/// `*pos` past the list's final word.
pub fn decode_into(data: &[u8], pos: &mut usize, out: &mut Vec<u32>) -> Result<(), CodecError> {
    let mut first = true;
    loop {
        let offset = *pos;
        let word = read_word(data, offset)?;
        let flags = word & FLAG_MASK;
        if first && flags & FIRST_BIT == 0 {
            return Err(CodecError::MissingListStart { offset });
        }
        if !first && flags & FIRST_BIT != 0 {
            return Err(CodecError::UnexpectedListStart { offset });
        }
        let p = packing_for(word, offset)?;
        unpack_elements(word, p, out);
        *pos += WORD_BYTES;
        if flags & LAST_BIT != 0 {
            return Ok(());
        }
        first = false;
    }
}

/// Decode the list starting at `*pos`, advancing `*pos` past it.
pub fn decode(data: &[u8], pos: &mut usize) -> Result<Vec<u32>, CodecError> {
    let mut out = Vec::new();
    decode_into(data, pos, &mut out)?;
    Ok(out)
}

/// Offset just past the list starting at `start`, walking flag bits only.
pub fn list_end(data: &[u8], start: usize) -> Result<usize, CodecError> {
    let mut pos = start;
    let mut first = true;
    loop {
        let word = read_word(data, pos)?;
        if first && word & FIRST_BIT == 0 {
            return Err(CodecError::MissingListStart { offset: pos });
        }
        if !first && word & FIRST_BIT != 0 {
            return Err(CodecError::UnexpectedListStart { offset: pos });
        }
        pos += WORD_BYTES;
        if word & LAST_BIT != 0 {
            return Ok(pos);
        }
        first = false;
    }
}

/// First element of the list starting at `pos` without decoding the rest.
/// Returns 0 only for an all-blank (empty) list.
pub fn first_element(data: &[u8], pos: usize) -> Result<u32, CodecError> {
    let word = read_word(data, pos)?;
    if word & FIRST_BIT == 0 {
        return Err(CodecError::MissingListStart { offset: pos });
    }
    let p = packing_for(word, pos)?;
    Ok((word >> ((p.capacity - 1) as u32 * p.bits)) & width_max(p.bits))
}

/// Scan forward from `from` (word-aligned) for the next word carrying the
/// list-start flag. Used to resync after damage and to realign galloping
/// probes onto a posting boundary.
pub fn next_list_offset(data: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;
    while pos + WORD_BYTES <= data.len() {
        // Unwrap is fine: bounds were just checked
        let word = read_word(data, pos).ok()?;
        if word & FIRST_BIT != 0 {
            return Some(pos);
        }
        pos += WORD_BYTES;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(values: &[u32]) {
        let encoded = encode(values);
        assert_eq!(encoded.len() % WORD_BYTES, 0);
        let mut pos = 0;
        let decoded = decode(&encoded, &mut pos).unwrap();
        assert_eq!(decoded, values);
        assert_eq!(pos, encoded.len());
    }

    #[test]
    fn test_single_values_all_widths() {
        for v in [1, 2, 3, 7, 31, 63, 511, 16383, 16384, MAX_ELEMENT] {
            round_trip(&[v]);
        }
    }

    #[test]
    fn test_empty_list() {
        let encoded = encode(&[]);
        assert_eq!(encoded.len(), WORD_BYTES);
        let mut pos = 0;
        assert_eq!(decode(&encoded, &mut pos).unwrap(), Vec::<u32>::new());
        assert_eq!(pos, WORD_BYTES);
    }

    #[test]
    fn test_small_run_packs_one_word() {
        // 24 one-bit elements fit a single word
        let values = vec![1u32; 24];
        let encoded = encode(&values);
        assert_eq!(encoded.len(), WORD_BYTES);
        round_trip(&values);
    }

    #[test]
    fn test_width_reselection_mid_list() {
        round_trip(&[1, 1, 600]);
        round_trip(&[600, 1, 1]);
        round_trip(&[1, MAX_ELEMENT, 1]);
    }

    #[test]
    fn test_long_mixed_list() {
        let mut values = Vec::new();
        for i in 1..200u32 {
            values.push(i);
            values.push(i * 131 % 9000 + 1);
        }
        round_trip(&values);
    }

    #[test]
    fn test_decode_resumes_at_second_list() {
        let mut buf = encode(&[5, 6, 7]);
        let second_start = buf.len();
        buf.extend_from_slice(&encode(&[40_000, 2]));
        let mut pos = second_start;
        assert_eq!(decode(&buf, &mut pos).unwrap(), vec![40_000, 2]);
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn test_list_end_matches_decode() {
        let mut values = Vec::new();
        for i in 1..50u32 {
            values.push(i * 777 + 1);
        }
        let encoded = encode(&values);
        assert_eq!(list_end(&encoded, 0).unwrap(), encoded.len());
    }

    #[test]
    fn test_first_element_peek() {
        let encoded = encode(&[12_345, 1, 2, 3]);
        assert_eq!(first_element(&encoded, 0).unwrap(), 12_345);
    }

    #[test]
    fn test_missing_list_start_detected() {
        let values: Vec<u32> = (1..40).collect();
        let encoded = encode(&values);
        assert!(encoded.len() > WORD_BYTES);
        // Second word of a multi-word list is not a valid start
        let mut pos = WORD_BYTES;
        assert!(matches!(
            decode(&encoded, &mut pos),
            Err(CodecError::MissingListStart { .. })
        ));
    }

    #[test]
    fn test_unexpected_start_detected() {
        // Two single-word lists back to back: decoding them as one list
        // fails on the second start flag
        let mut buf = encode(&[MAX_ELEMENT]);
        buf.extend_from_slice(&encode(&[MAX_ELEMENT]));
        // Clear the last-bit of word 0 to fake an unterminated list
        buf[0] &= !(LAST_BIT >> 24) as u8;
        let mut pos = 0;
        assert!(matches!(
            decode(&buf, &mut pos),
            Err(CodecError::UnexpectedListStart { .. })
        ));
    }

    #[test]
    fn test_bad_selector_detected() {
        // Flags valid, selector 0b110001 is not a defined packing
        let word: u32 = FIRST_BIT | LAST_BIT | 0x3100_0000;
        let buf = word.to_be_bytes().to_vec();
        let mut pos = 0;
        assert!(matches!(
            decode(&buf, &mut pos),
            Err(CodecError::BadSelector { .. })
        ));
    }

    #[test]
    fn test_truncated_detected() {
        let encoded = encode(&[1, 2, 3]);
        let mut pos = 0;
        assert!(matches!(
            decode(&encoded[..2], &mut pos),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_next_list_offset_resync() {
        let first = encode(&(1..40u32).collect::<Vec<_>>());
        assert!(first.len() > 2 * WORD_BYTES);
        let mut buf = first.clone();
        let second_start = buf.len();
        buf.extend_from_slice(&encode(&[9, 9, 9]));
        // Skipping the damaged head finds the second list
        assert_eq!(next_list_offset(&buf, WORD_BYTES), Some(second_start));
        assert_eq!(next_list_offset(&buf, second_start), Some(second_start));
        assert_eq!(next_list_offset(&buf, second_start + WORD_BYTES), None);
    }

    proptest! {
        #[test]
        fn prop_round_trip(values in proptest::collection::vec(1u32..=MAX_ELEMENT, 0..300)) {
            let encoded = encode(&values);
            let mut pos = 0;
            let decoded = decode(&encoded, &mut pos).unwrap();
            prop_assert_eq!(decoded, values);
            prop_assert_eq!(pos, encoded.len());
        }

        #[test]
        fn prop_small_values_round_trip(values in proptest::collection::vec(1u32..64, 0..200)) {
            let encoded = encode(&values);
            let mut pos = 0;
            prop_assert_eq!(decode(&encoded, &mut pos).unwrap(), values);
        }
    }
}

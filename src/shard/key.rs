//! 20-byte word keys
//!
//! A key identifies either a single term (bytes 0-7 term hash, byte 8
//! zero, bytes 9-19 materialized meta bytes) or a phrase (byte 8 carries
//! a path mode plus remaining-word count, bytes 9-19 pack the remaining
//! word hashes at mode-dependent widths). Keys sort bytewise. The high
//! bit of byte 1 is reserved: it is cleared at construction and marks
//! auxiliary slots in dictionary files.

use std::fmt;

/// Length of a word key in bytes.
pub const WORD_KEY_LEN: usize = 20;

/// Reserved marker bit in byte 1 of every stored 32-byte slot.
pub const AUX_FLAG: u8 = 0x80;

/// Number of materialized meta bytes trailing a single-term key.
pub const META_SUFFIX_LEN: usize = 11;

/// Classifier slots available in a single-term key.
pub const CLASSIFIER_SLOTS: usize = 9;

/// Phrase path modes: (remaining-word capacity, bits per packed hash).
const PATH_MODES: [(usize, u32); 6] = [(1, 64), (2, 44), (3, 29), (4, 22), (6, 14), (12, 7)];

/// A document attribute materialized into a word key's trailing bytes,
/// avoiding a separate meta-word lookup at query time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaValue {
    /// Media-type hash byte (key byte 9)
    Media(u8),
    /// Safety flag (key byte 10)
    Safe(bool),
    /// Classifier class hash byte in one of the slots (key bytes 11-19)
    Classifier { slot: u8, value: u8 },
}

impl MetaValue {
    /// Position of this value within the 11-byte meta suffix.
    fn suffix_index(&self) -> usize {
        match *self {
            MetaValue::Media(_) => 0,
            MetaValue::Safe(_) => 1,
            MetaValue::Classifier { slot, .. } => 2 + (slot as usize).min(CLASSIFIER_SLOTS - 1),
        }
    }

    fn byte(&self) -> u8 {
        match *self {
            MetaValue::Media(b) => b,
            MetaValue::Safe(true) => 1,
            MetaValue::Safe(false) => 2,
            MetaValue::Classifier { value, .. } => value,
        }
    }
}

/// Bitmask over the 11 meta bytes for filtering lookups.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetaMask([u8; META_SUFFIX_LEN]);

impl MetaMask {
    /// Matches every key.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_media(mut self) -> Self {
        self.0[0] = 0xFF;
        self
    }

    pub fn with_safety(mut self) -> Self {
        self.0[1] = 0xFF;
        self
    }

    pub fn with_classifier(mut self, slot: u8) -> Self {
        self.0[2 + (slot as usize).min(CLASSIFIER_SLOTS - 1)] = 0xFF;
        self
    }

    /// Compare two raw key byte arrays under this mask.
    pub fn matches(&self, probe: &[u8; WORD_KEY_LEN], candidate: &[u8; WORD_KEY_LEN]) -> bool {
        let base = WORD_KEY_LEN - META_SUFFIX_LEN;
        self.0.iter().enumerate().all(|(i, &m)| {
            (probe[base + i] & m) == (candidate[base + i] & m)
        })
    }
}

/// A 20-byte word key. Ordering is bytewise, matching on-disk row order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WordKey([u8; WORD_KEY_LEN]);

impl WordKey {
    /// Key for a single term with optional materialized meta values.
    pub fn single(term_hash: u64, metas: &[MetaValue]) -> Self {
        let mut bytes = [0u8; WORD_KEY_LEN];
        bytes[..8].copy_from_slice(&term_hash.to_be_bytes());
        for meta in metas {
            bytes[WORD_KEY_LEN - META_SUFFIX_LEN + meta.suffix_index()] = meta.byte();
        }
        Self::canonical(bytes)
    }

    /// Key for a phrase: `head_hash` covers the leading segment, `rest`
    /// the remaining word hashes. Returns `None` for phrases longer than
    /// the widest path mode supports.
    pub fn phrase(head_hash: u64, rest: &[u64]) -> Option<Self> {
        if rest.is_empty() {
            return Some(Self::single(head_hash, &[]));
        }
        let (mode, bits) = PATH_MODES
            .iter()
            .enumerate()
            .find(|(_, (capacity, _))| rest.len() <= *capacity)
            .map(|(i, &(_, bits))| (i as u8 + 1, bits))?;

        let mut bytes = [0u8; WORD_KEY_LEN];
        bytes[..8].copy_from_slice(&head_hash.to_be_bytes());
        bytes[8] = (mode << 5) | rest.len() as u8;

        // Remaining hashes keep their high `bits` bits, packed MSB-first
        // into the 88-bit suffix.
        let mut acc: u128 = 0;
        let mut used: u32 = 0;
        for &hash in rest {
            let truncated = (hash >> (64 - bits)) as u128;
            used += bits;
            acc |= truncated << (8 * META_SUFFIX_LEN as u32 - used);
        }
        let suffix = acc.to_be_bytes();
        bytes[9..].copy_from_slice(&suffix[16 - META_SUFFIX_LEN..]);
        Some(Self::canonical(bytes))
    }

    /// Rebuild a key from raw bytes (clearing the reserved marker bit).
    pub fn from_bytes(bytes: [u8; WORD_KEY_LEN]) -> Self {
        Self::canonical(bytes)
    }

    /// Copy of this key with meta values folded into the trailing bytes.
    /// Phrase keys use those bytes for packed hashes and pass through
    /// unchanged.
    pub fn with_metas(&self, metas: &[MetaValue]) -> Self {
        if self.is_phrase() || metas.is_empty() {
            return *self;
        }
        let mut bytes = self.0;
        for meta in metas {
            bytes[WORD_KEY_LEN - META_SUFFIX_LEN + meta.suffix_index()] = meta.byte();
        }
        WordKey(bytes)
    }

    fn canonical(mut bytes: [u8; WORD_KEY_LEN]) -> Self {
        bytes[1] &= !AUX_FLAG;
        WordKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; WORD_KEY_LEN] {
        &self.0
    }

    /// Prefix-folder byte of the dictionary layout.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }

    pub fn second_byte(&self) -> u8 {
        self.0[1]
    }

    /// Bytes 0-7 as a big-endian integer; its order equals bytewise order
    /// of the hash prefix.
    pub fn hash_prefix(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(buf)
    }

    pub fn is_phrase(&self) -> bool {
        self.0[8] >> 5 != 0
    }

    /// Phrase path mode (1-6), or 0 for a single term.
    pub fn path_mode(&self) -> u8 {
        self.0[8] >> 5
    }

    /// Total words in the phrase this key denotes (1 for a single term).
    pub fn word_count(&self) -> usize {
        if self.is_phrase() {
            1 + (self.0[8] & 0x1F) as usize
        } else {
            1
        }
    }

    /// Whether `candidate` (a raw stored key) matches this probe under
    /// the lookup comparison rules.
    pub(crate) fn matches_stored(
        &self,
        candidate: &[u8; WORD_KEY_LEN],
        shift: u32,
        exact: bool,
        mask: Option<&MetaMask>,
    ) -> bool {
        if exact {
            return self.0 == *candidate;
        }
        let mut cand_prefix = [0u8; 8];
        cand_prefix.copy_from_slice(&candidate[..8]);
        let cand = u64::from_be_bytes(cand_prefix);
        if self.hash_prefix() >> shift != cand >> shift {
            return false;
        }
        match mask {
            Some(m) => m.matches(&self.0, candidate),
            None => true,
        }
    }

    /// Ordering used by binary search: shifted hash prefix only, unless
    /// `exact` demands full bytewise order.
    pub(crate) fn cmp_stored(
        &self,
        candidate: &[u8; WORD_KEY_LEN],
        shift: u32,
        exact: bool,
    ) -> std::cmp::Ordering {
        if exact && shift == 0 {
            return self.0.as_slice().cmp(candidate.as_slice());
        }
        let mut cand_prefix = [0u8; 8];
        cand_prefix.copy_from_slice(&candidate[..8]);
        let cand = u64::from_be_bytes(cand_prefix);
        (self.hash_prefix() >> shift).cmp(&(cand >> shift))
    }
}

impl fmt::Debug for WordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WordKey(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for WordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_key_layout() {
        let key = WordKey::single(
            0x1122_3344_5566_7788,
            &[
                MetaValue::Media(0xAB),
                MetaValue::Safe(true),
                MetaValue::Classifier { slot: 2, value: 0x7C },
            ],
        );
        let b = key.as_bytes();
        assert_eq!(&b[..8], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(b[8], 0);
        assert_eq!(b[9], 0xAB);
        assert_eq!(b[10], 1);
        assert_eq!(b[13], 0x7C);
        assert!(!key.is_phrase());
        assert_eq!(key.word_count(), 1);
    }

    #[test]
    fn test_reserved_bit_cleared() {
        let key = WordKey::single(0x00FF_0000_0000_0000, &[]);
        assert_eq!(key.second_byte() & AUX_FLAG, 0);
        assert_eq!(key.second_byte(), 0x7F);
    }

    #[test]
    fn test_phrase_modes() {
        let rest: Vec<u64> = (1..=12).map(|i| (i as u64) << 56).collect();
        for n in 1..=12usize {
            let key = WordKey::phrase(42, &rest[..n]).unwrap();
            assert!(key.is_phrase());
            assert_eq!(key.word_count(), n + 1);
            let expected_mode = match n {
                1 => 1,
                2 => 2,
                3 => 3,
                4 => 4,
                5 | 6 => 5,
                _ => 6,
            };
            assert_eq!(key.path_mode(), expected_mode);
        }
        assert!(WordKey::phrase(42, &vec![7u64; 13]).is_none());
    }

    #[test]
    fn test_phrase_distinguishes_words() {
        let a = WordKey::phrase(9, &[0xAAAA_0000_0000_0000, 0xBBBB_0000_0000_0000]).unwrap();
        let b = WordKey::phrase(9, &[0xAAAA_0000_0000_0000, 0xCCCC_0000_0000_0000]).unwrap();
        assert_ne!(a, b);
        // Same head hash and mode, different packed suffix
        assert_eq!(a.as_bytes()[..9], b.as_bytes()[..9]);
    }

    #[test]
    fn test_phrase_of_one_is_single() {
        let key = WordKey::phrase(77, &[]).unwrap();
        assert!(!key.is_phrase());
    }

    #[test]
    fn test_bytewise_order_follows_prefix() {
        let a = WordKey::single(100, &[]);
        let b = WordKey::single(200, &[]);
        assert!(a < b);
        assert!(a.hash_prefix() < b.hash_prefix());
    }

    #[test]
    fn test_shifted_match() {
        let a = WordKey::single(0xABCD_0010, &[]);
        let b = WordKey::single(0xABCD_001F, &[]);
        assert!(!a.matches_stored(b.as_bytes(), 0, false, None));
        assert!(a.matches_stored(b.as_bytes(), 5, false, None));
        assert_eq!(
            a.cmp_stored(b.as_bytes(), 5, false),
            std::cmp::Ordering::Equal
        );
    }

    #[test]
    fn test_mask_filtering() {
        let plain = WordKey::single(55, &[MetaValue::Media(0x10)]);
        let image = WordKey::single(55, &[MetaValue::Media(0x22)]);
        let mask = MetaMask::any().with_media();
        assert!(!plain.matches_stored(image.as_bytes(), 0, false, Some(&mask)));
        assert!(plain.matches_stored(image.as_bytes(), 0, false, None));
        let probe = WordKey::single(55, &[MetaValue::Media(0x22)]);
        assert!(probe.matches_stored(image.as_bytes(), 0, false, Some(&mask)));
    }

    #[test]
    fn test_exact_match_includes_meta() {
        let plain = WordKey::single(55, &[]);
        let tagged = WordKey::single(55, &[MetaValue::Safe(false)]);
        assert!(!plain.matches_stored(tagged.as_bytes(), 0, true, None));
        assert!(plain.matches_stored(plain.as_bytes(), 0, true, None));
    }

    #[test]
    fn test_from_bytes_round_trip() {
        let key = WordKey::single(0xDEAD_BEEF, &[MetaValue::Media(3)]);
        let rebuilt = WordKey::from_bytes(*key.as_bytes());
        assert_eq!(key, rebuilt);
    }
}

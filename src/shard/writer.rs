//! Mutable per-generation shard
//!
//! Documents accumulate into a hash map of per-word posting runs. A
//! periodic fold merges those runs into a single flat array kept sorted
//! by key, which serializing turns directly into the on-disk row and
//! blob sections. Saving resets the shard for the next generation.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::ShardConfig;
use crate::error::{IndexError, Result};

use super::doc_map::{DocInfo, DocMap};
use super::key::{MetaValue, WordKey, WORD_KEY_LEN};
use super::posting;
use super::reader::ShardReader;
use super::types::{
    DocKey, PostingsRef, PrefixEntry, ShardHeader, ShardSaveInfo, COMPACT_MARKER, MAX_GENERATION,
    PREFIX_ENTRIES, PREFIX_INDEX_LEN,
};

/// Bytes before a flat entry's postings: key, posting count, byte length.
const FLAT_HEAD_LEN: usize = WORD_KEY_LEN + 8;

#[derive(Default)]
struct PendingPostings {
    count: u32,
    bytes: Vec<u8>,
}

/// Accumulates one generation of documents and serializes them.
pub struct IndexShard {
    config: ShardConfig,
    generation: u32,
    docs_per_generation: u32,
    /// Recently added postings, unsorted.
    pending: HashMap<WordKey, PendingPostings>,
    pending_bytes: usize,
    /// Sorted runs from previous folds: repeated flat entries.
    flat: Vec<u8>,
    doc_map: DocMap,
    /// Document hash to document index, for offset rewrites.
    url_index: HashMap<DocKey, u32>,
    num_docs: u32,
    num_link_docs: u32,
    len_all_docs: u32,
    len_all_link_docs: u32,
}

impl IndexShard {
    pub fn new(generation: u32, config: ShardConfig) -> Result<Self> {
        if generation > MAX_GENERATION {
            return Err(IndexError::GenerationOverflow(generation));
        }
        Ok(IndexShard {
            docs_per_generation: config.docs_per_generation,
            doc_map: DocMap::new(config.max_doc_keys),
            config,
            generation,
            pending: HashMap::new(),
            pending_bytes: 0,
            flat: Vec::new(),
            url_index: HashMap::new(),
            num_docs: 0,
            num_link_docs: 0,
            len_all_docs: 0,
            len_all_link_docs: 0,
        })
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u32) -> Result<()> {
        if generation > MAX_GENERATION {
            return Err(IndexError::GenerationOverflow(generation));
        }
        self.generation = generation;
        Ok(())
    }

    pub fn doc_count(&self) -> u32 {
        self.num_docs
    }

    pub fn link_doc_count(&self) -> u32 {
        self.num_link_docs
    }

    /// Documents plus link records held so far.
    pub fn total_doc_count(&self) -> u32 {
        self.doc_map.len()
    }

    /// Whether the shard has reached its per-generation capacity hint.
    pub fn is_full(&self) -> bool {
        self.doc_map.len() >= self.docs_per_generation
    }

    /// Record one document or link record.
    ///
    /// `doc_keys` is the document's key block: 8-byte chunks with the
    /// URL hash first. `words` maps each distinct word key to its sorted
    /// position list. `meta_keys` get a presence posting at position
    /// zero that does not count toward document length. `meta_values`
    /// are folded into every non-phrase word key. A `rank` of zero means
    /// unranked.
    ///
    /// Returns false, recording nothing, if the key block is malformed
    /// or the shard is out of document indices.
    pub fn add_document_words(
        &mut self,
        doc_keys: &[u8],
        summary_offset: u32,
        words: &[(WordKey, Vec<u32>)],
        meta_keys: &[WordKey],
        meta_values: &[MetaValue],
        is_doc: bool,
        rank: u8,
    ) -> bool {
        if doc_keys.is_empty() || doc_keys.len() % 8 != 0 {
            warn!(len = doc_keys.len(), "rejected document: key block is not 8-byte chunks");
            return false;
        }
        let key_count = doc_keys.len() / 8;
        if key_count > self.config.max_doc_keys as usize {
            warn!(
                chunks = key_count,
                limit = self.config.max_doc_keys,
                "rejected document: too many key chunks"
            );
            return false;
        }
        if self.doc_map.len() > posting::MAX_DOC_INDEX {
            warn!(generation = self.generation, "rejected document: shard is out of indices");
            return false;
        }

        let mut doc_len = 0u32;
        let mut posting_lists: Vec<(WordKey, Cow<'_, [u32]>)> = Vec::with_capacity(words.len());
        for (key, positions) in words {
            let list: Cow<'_, [u32]> = if positions_usable(positions) {
                Cow::Borrowed(positions.as_slice())
            } else {
                let mut cleaned = Vec::with_capacity(positions.len());
                sanitize_positions(positions, &mut cleaned);
                debug!(dropped = positions.len() - cleaned.len(), "dropped unusable positions");
                Cow::Owned(cleaned)
            };
            if list.is_empty() {
                continue;
            }
            doc_len = doc_len.saturating_add(list.len() as u32);
            posting_lists.push((key.with_metas(meta_values), list));
        }

        let keys = doc_keys
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                DocKey(raw)
            })
            .collect::<Vec<_>>();
        let info = DocInfo {
            summary_offset,
            doc_len,
            rank: rank.min(15),
            is_doc,
            keys,
        };
        let doc_index = self.doc_map.push(&info);
        self.url_index.insert(info.doc_key(), doc_index);
        if is_doc {
            self.num_docs += 1;
            self.len_all_docs = self.len_all_docs.saturating_add(doc_len);
        } else {
            self.num_link_docs += 1;
            self.len_all_link_docs = self.len_all_link_docs.saturating_add(doc_len);
        }

        for (key, positions) in &posting_lists {
            self.push_posting(*key, doc_index, positions);
        }
        for key in meta_keys {
            self.push_posting(*key, doc_index, &[0]);
        }
        true
    }

    fn push_posting(&mut self, key: WordKey, doc_index: u32, positions: &[u32]) {
        let entry = self.pending.entry(key).or_default();
        entry.count += 1;
        let before = entry.bytes.len();
        posting::pack_posting(doc_index, positions, &mut entry.bytes);
        self.pending_bytes += entry.bytes.len() - before;
    }

    /// Fold pending postings into the sorted flat array once they exceed
    /// `min_pending_bytes`. Passing zero forces a fold.
    pub fn merge_word_postings(&mut self, min_pending_bytes: usize) {
        if self.pending.is_empty() || self.pending_bytes < min_pending_bytes {
            return;
        }
        let mut fresh: Vec<(WordKey, PendingPostings)> = self.pending.drain().collect();
        fresh.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        self.pending_bytes = 0;

        let old = std::mem::take(&mut self.flat);
        let mut merged = Vec::with_capacity(old.len() + fresh.len() * FLAT_HEAD_LEN);
        let mut fresh_iter = fresh.into_iter().peekable();
        let mut old_pos = 0;
        while old_pos < old.len() {
            let (old_key, old_count, old_bytes, next_pos) = read_flat_entry(&old, old_pos);
            while let Some((key, pending)) = fresh_iter.next_if(|(k, _)| *k < old_key) {
                write_flat_entry(&mut merged, key, pending.count, &[&pending.bytes]);
            }
            if let Some((key, pending)) = fresh_iter.next_if(|(k, _)| *k == old_key) {
                // Old postings first: their document indices are lower.
                write_flat_entry(
                    &mut merged,
                    key,
                    old_count + pending.count,
                    &[old_bytes, &pending.bytes],
                );
            } else {
                merged.extend_from_slice(&old[old_pos..next_pos]);
            }
            old_pos = next_pos;
        }
        for (key, pending) in fresh_iter {
            write_flat_entry(&mut merged, key, pending.count, &[&pending.bytes]);
        }
        self.flat = merged;
    }

    /// Append every document and posting of a serialized shard, shifting
    /// its document indices past the ones already here.
    pub fn append_index_shard(&mut self, other: &ShardReader) -> Result<()> {
        let base = self.doc_map.len();
        let incoming = other.header().doc_total();
        if u64::from(base) + u64::from(incoming) > u64::from(posting::MAX_DOC_INDEX) + 1 {
            return Err(IndexError::Internal(format!(
                "appending {incoming} documents would overflow the index space"
            )));
        }
        for doc_index in 0..incoming {
            let info = other.doc_info(doc_index)?.ok_or(IndexError::CorruptRecord {
                context: "appended doc record",
                offset: u64::from(doc_index),
            })?;
            self.url_index.insert(info.doc_key(), base + doc_index);
            self.doc_map.push(&info);
        }
        let header = other.header();
        self.num_docs += header.num_docs;
        self.num_link_docs += header.num_link_docs;
        self.len_all_docs = self.len_all_docs.saturating_add(header.len_all_docs);
        self.len_all_link_docs = self.len_all_link_docs.saturating_add(header.len_all_link_docs);

        for entry in other.row_entries() {
            let (key, postings) = entry?;
            match postings {
                PostingsRef::Inline { doc_index, position } => {
                    self.push_posting(key, doc_index + base, &[position]);
                }
                PostingsRef::Extent { first_offset, last_offset, .. } => {
                    let bytes = other.extent_bytes(first_offset, last_offset)?;
                    let mut pos = 0;
                    while pos < bytes.len() {
                        let (doc_index, positions) = posting::unpack_posting(&bytes, &mut pos)?;
                        self.push_posting(key, doc_index + base, &positions);
                    }
                }
            }
        }
        Ok(())
    }

    /// Point documents at new summary offsets after their archive is
    /// repacked. Returns how many records changed.
    pub fn change_document_offsets(&mut self, offsets: &HashMap<DocKey, u32>) -> usize {
        let mut changed = 0;
        for (key, &summary_offset) in offsets {
            if let Some(&doc_index) = self.url_index.get(key) {
                if self.doc_map.set_summary_offset(doc_index, summary_offset) {
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Serialize to a file, fsync, then reset for the next generation.
    pub fn save(&mut self, path: &Path) -> Result<ShardSaveInfo> {
        let image = self.build_image()?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&image);
        let checksum = hasher.finalize();
        let mut file = File::create(path)?;
        file.write_all(&image)?;
        file.sync_all()?;
        info!(
            path = %path.display(),
            bytes = image.len(),
            checksum,
            generation = self.generation,
            docs = self.num_docs,
            links = self.num_link_docs,
            "saved shard"
        );
        self.reset();
        Ok(ShardSaveInfo {
            bytes_written: image.len() as u64,
            checksum,
        })
    }

    /// Serialize to memory and reset, for callers managing their own IO.
    pub fn save_to_bytes(&mut self) -> Result<Vec<u8>> {
        let image = self.build_image()?;
        self.reset();
        Ok(image)
    }

    /// Snapshot the current contents as a memory-backed reader without
    /// resetting.
    pub fn to_reader(&mut self) -> Result<ShardReader> {
        let image = self.build_image()?;
        ShardReader::from_bytes(image, self.config.clone())
    }

    /// Rebuild an appendable shard from a serialized one.
    pub fn load(path: &Path, config: ShardConfig) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_image(&data, config)
    }

    fn from_image(data: &[u8], mut config: ShardConfig) -> Result<Self> {
        let header = ShardHeader::from_bytes(data)?;
        if header.total_len() != data.len() as u64 {
            return Err(IndexError::ShardHeader(format!(
                "section lengths sum to {} but the image is {} bytes",
                header.total_len(),
                data.len()
            )));
        }
        let rows_start = super::types::SHARD_HEADER_LEN + header.prefix_len as usize;
        let blob_start = rows_start + header.words_len as usize;
        let docs_start = blob_start + header.postings_len as usize;
        let rows = &data[rows_start..blob_start];
        let blob = &data[blob_start..docs_start];

        config.docs_per_generation = header.docs_per_generation;
        let doc_map = DocMap::decode(&data[docs_start..], header.doc_total(), config.max_doc_keys)?;
        let mut url_index = HashMap::with_capacity(header.doc_total() as usize);
        for doc_index in 0..header.doc_total() {
            let info = doc_map.get(doc_index)?.ok_or(IndexError::CorruptRecord {
                context: "doc record",
                offset: u64::from(doc_index),
            })?;
            url_index.insert(info.doc_key(), doc_index);
        }

        let mut flat = Vec::with_capacity(rows.len() + blob.len());
        let mut scratch = Vec::new();
        for row in rows.chunks_exact(super::types::WORD_ROW_LEN) {
            let mut key_bytes = [0u8; WORD_KEY_LEN];
            key_bytes.copy_from_slice(&row[..WORD_KEY_LEN]);
            let key = WordKey::from_bytes(key_bytes);
            let first = read_row_u32(row, 0);
            let second = read_row_u32(row, 1);
            let third = read_row_u32(row, 2);
            if first == COMPACT_MARKER {
                let (doc_index, position) = PostingsRef::inline_parts(second);
                scratch.clear();
                posting::pack_posting(doc_index, &[position], &mut scratch);
                write_flat_entry(&mut flat, key, 1, &[&scratch]);
            } else {
                let start = first as usize;
                let end = start + second as usize;
                let bytes = blob.get(start..end).ok_or(IndexError::CorruptRecord {
                    context: "posting extent",
                    offset: u64::from(first),
                })?;
                write_flat_entry(&mut flat, key, third, &[bytes]);
            }
        }

        Ok(IndexShard {
            docs_per_generation: header.docs_per_generation,
            doc_map,
            config,
            generation: header.generation,
            pending: HashMap::new(),
            pending_bytes: 0,
            flat,
            url_index,
            num_docs: header.num_docs,
            num_link_docs: header.num_link_docs,
            len_all_docs: header.len_all_docs,
            len_all_link_docs: header.len_all_link_docs,
        })
    }

    fn build_image(&mut self) -> Result<Vec<u8>> {
        self.merge_word_postings(0);

        let mut rows = Vec::new();
        let mut blob = Vec::new();
        let mut prefix = [PrefixEntry::absent(); PREFIX_ENTRIES];
        let mut row_index = 0u32;
        let mut pos = 0;
        while pos < self.flat.len() {
            let (key, count, bytes, next_pos) = read_flat_entry(&self.flat, pos);
            pos = next_pos;

            rows.extend_from_slice(key.as_bytes());
            let mut compact = None;
            if count == 1 {
                let mut cursor = 0;
                let (doc_index, positions) = posting::unpack_posting(bytes, &mut cursor)?;
                if cursor == bytes.len() && PostingsRef::inline_eligible(doc_index, &positions) {
                    compact = Some(PostingsRef::pack_inline(doc_index, positions[0]));
                }
            }
            match compact {
                Some(packed) => {
                    rows.extend_from_slice(&COMPACT_MARKER.to_be_bytes());
                    rows.extend_from_slice(&packed.to_be_bytes());
                    rows.extend_from_slice(&1u32.to_be_bytes());
                }
                None => {
                    let first_offset = checked_u32(blob.len(), "postings blob")?;
                    rows.extend_from_slice(&first_offset.to_be_bytes());
                    rows.extend_from_slice(&checked_u32(bytes.len(), "posting run")?.to_be_bytes());
                    rows.extend_from_slice(&count.to_be_bytes());
                    blob.extend_from_slice(bytes);
                }
            }

            let slot = &mut prefix[key.first_byte() as usize];
            if slot.is_absent() {
                slot.first = row_index;
            }
            slot.count += 1;
            row_index += 1;
        }

        let header = ShardHeader {
            prefix_len: PREFIX_INDEX_LEN as u32,
            words_len: checked_u32(rows.len(), "word rows")?,
            postings_len: checked_u32(blob.len(), "postings blob")?,
            doc_infos_len: checked_u32(self.doc_map.encoded_len(), "doc records")?,
            generation: self.generation,
            docs_per_generation: self.docs_per_generation,
            num_docs: self.num_docs,
            num_link_docs: self.num_link_docs,
            len_all_docs: self.len_all_docs,
            len_all_link_docs: self.len_all_link_docs,
        };

        let mut image = Vec::with_capacity(header.total_len() as usize);
        image.extend_from_slice(&header.to_bytes());
        for entry in &prefix {
            entry.write_to(&mut image);
        }
        image.extend_from_slice(&rows);
        image.extend_from_slice(&blob);
        self.doc_map.encode_into(&mut image);
        Ok(image)
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
        self.flat.clear();
        self.doc_map = DocMap::new(self.config.max_doc_keys);
        self.url_index.clear();
        self.num_docs = 0;
        self.num_link_docs = 0;
        self.len_all_docs = 0;
        self.len_all_link_docs = 0;
    }
}

fn positions_usable(positions: &[u32]) -> bool {
    positions.iter().all(|&p| p <= posting::MAX_POSITION)
        && positions.windows(2).all(|pair| pair[0] < pair[1])
}

fn sanitize_positions(positions: &[u32], out: &mut Vec<u32>) {
    for &p in positions {
        if p <= posting::MAX_POSITION && out.last().map_or(true, |&last| p > last) {
            out.push(p);
        }
    }
}

fn checked_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| IndexError::Internal(format!("{what} exceeds u32 range")))
}

fn read_row_u32(row: &[u8], field: usize) -> u32 {
    let at = WORD_KEY_LEN + field * 4;
    u32::from_be_bytes([row[at], row[at + 1], row[at + 2], row[at + 3]])
}

fn read_flat_entry(flat: &[u8], pos: usize) -> (WordKey, u32, &[u8], usize) {
    let mut key_bytes = [0u8; WORD_KEY_LEN];
    key_bytes.copy_from_slice(&flat[pos..pos + WORD_KEY_LEN]);
    let count = u32::from_be_bytes([
        flat[pos + WORD_KEY_LEN],
        flat[pos + WORD_KEY_LEN + 1],
        flat[pos + WORD_KEY_LEN + 2],
        flat[pos + WORD_KEY_LEN + 3],
    ]);
    let len = u32::from_be_bytes([
        flat[pos + WORD_KEY_LEN + 4],
        flat[pos + WORD_KEY_LEN + 5],
        flat[pos + WORD_KEY_LEN + 6],
        flat[pos + WORD_KEY_LEN + 7],
    ]) as usize;
    let bytes_at = pos + FLAT_HEAD_LEN;
    (
        WordKey::from_bytes(key_bytes),
        count,
        &flat[bytes_at..bytes_at + len],
        bytes_at + len,
    )
}

fn write_flat_entry(out: &mut Vec<u8>, key: WordKey, count: u32, chunks: &[&[u8]]) {
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(&count.to_be_bytes());
    let len: usize = chunks.iter().map(|c| c.len()).sum();
    // The row format stores lengths in u32; one word's postings cannot
    // legally reach 4 GiB.
    debug_assert!(u32::try_from(len).is_ok(), "flat postings exceed u32 range");
    out.extend_from_slice(&(len as u32).to_be_bytes());
    for chunk in chunks {
        out.extend_from_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::types::{SHARD_HEADER_LEN, WORD_ROW_LEN};

    fn shard() -> IndexShard {
        IndexShard::new(0, ShardConfig::default()).unwrap()
    }

    fn key(term: u64) -> WordKey {
        WordKey::single(term, &[])
    }

    fn doc_keys(hash: u64) -> Vec<u8> {
        hash.to_be_bytes().to_vec()
    }

    fn add_simple(shard: &mut IndexShard, hash: u64, words: &[(u64, Vec<u32>)]) -> bool {
        let words: Vec<(WordKey, Vec<u32>)> =
            words.iter().map(|(t, p)| (key(*t), p.clone())).collect();
        shard.add_document_words(&doc_keys(hash), 100 + hash as u32, &words, &[], &[], true, 0)
    }

    #[test]
    fn test_rejects_malformed_key_blocks() {
        let mut shard = shard();
        assert!(!shard.add_document_words(&[], 0, &[], &[], &[], true, 0));
        assert!(!shard.add_document_words(&[1, 2, 3], 0, &[], &[], &[], true, 0));
        let too_many = vec![0u8; 8 * 25];
        assert!(!shard.add_document_words(&too_many, 0, &[], &[], &[], true, 0));
        assert_eq!(shard.total_doc_count(), 0);
    }

    #[test]
    fn test_counts_split_docs_and_links() {
        let mut shard = shard();
        assert!(add_simple(&mut shard, 1, &[(10, vec![0, 1, 2])]));
        assert!(shard.add_document_words(
            &doc_keys(2),
            0,
            &[(key(10), vec![4, 5])],
            &[],
            &[],
            false,
            0
        ));
        assert_eq!(shard.doc_count(), 1);
        assert_eq!(shard.link_doc_count(), 1);
        assert_eq!(shard.total_doc_count(), 2);
    }

    #[test]
    fn test_meta_presence_postings_do_not_count_toward_doc_len() {
        let mut shard = shard();
        let meta = key(999);
        assert!(shard.add_document_words(
            &doc_keys(1),
            500,
            &[(key(10), vec![0, 1, 2])],
            &[meta],
            &[],
            true,
            0
        ));
        let image = shard.save_to_bytes().unwrap();
        let header = ShardHeader::from_bytes(&image).unwrap();
        assert_eq!(header.len_all_docs, 3);
        assert_eq!(header.words_len as usize / WORD_ROW_LEN, 2);
    }

    #[test]
    fn test_image_rows_are_sorted_and_prefix_indexed() {
        let mut shard = shard();
        for hash in 0..40u64 {
            assert!(add_simple(&mut shard, hash, &[(hash * 7919, vec![1, 2]), (42, vec![3])]));
        }
        shard.merge_word_postings(0);
        let image = shard.save_to_bytes().unwrap();
        let header = ShardHeader::from_bytes(&image).unwrap();
        let rows_start = SHARD_HEADER_LEN + header.prefix_len as usize;
        let rows = &image[rows_start..rows_start + header.words_len as usize];

        let mut prev: Option<WordKey> = None;
        let mut first_bytes = Vec::new();
        for row in rows.chunks_exact(WORD_ROW_LEN) {
            let mut raw = [0u8; WORD_KEY_LEN];
            raw.copy_from_slice(&row[..WORD_KEY_LEN]);
            let key = WordKey::from_bytes(raw);
            if let Some(prev) = prev {
                assert!(prev < key);
            }
            first_bytes.push(key.first_byte());
            prev = Some(key);
        }

        let prefix = &image[SHARD_HEADER_LEN..rows_start];
        for (byte, entry_bytes) in prefix.chunks_exact(8).enumerate() {
            let entry = PrefixEntry::read_from(entry_bytes);
            let expected: Vec<usize> = first_bytes
                .iter()
                .enumerate()
                .filter(|(_, b)| **b == byte as u8)
                .map(|(i, _)| i)
                .collect();
            if expected.is_empty() {
                assert!(entry.is_absent());
            } else {
                assert_eq!(entry.first as usize, expected[0]);
                assert_eq!(entry.count as usize, expected.len());
            }
        }
    }

    #[test]
    fn test_single_occurrence_small_words_inline_into_rows() {
        let mut shard = shard();
        assert!(add_simple(&mut shard, 3, &[(77, vec![9])]));
        let image = shard.save_to_bytes().unwrap();
        let header = ShardHeader::from_bytes(&image).unwrap();
        assert_eq!(header.postings_len, 0);
        let rows_start = SHARD_HEADER_LEN + header.prefix_len as usize;
        let row = &image[rows_start..rows_start + WORD_ROW_LEN];
        assert_eq!(read_row_u32(row, 0), COMPACT_MARKER);
        assert_eq!(
            PostingsRef::unpack_inline(read_row_u32(row, 1)),
            PostingsRef::Inline { doc_index: 0, position: 9 }
        );
        assert_eq!(read_row_u32(row, 2), 1);
    }

    #[test]
    fn test_folds_keep_postings_in_document_order() {
        let mut shard = shard();
        assert!(add_simple(&mut shard, 1, &[(50, vec![0, 4])]));
        shard.merge_word_postings(0);
        assert!(add_simple(&mut shard, 2, &[(50, vec![7])]));
        shard.merge_word_postings(0);
        assert!(add_simple(&mut shard, 3, &[(50, vec![1])]));

        let image = shard.save_to_bytes().unwrap();
        let header = ShardHeader::from_bytes(&image).unwrap();
        let blob_start =
            SHARD_HEADER_LEN + (header.prefix_len + header.words_len) as usize;
        let blob = &image[blob_start..blob_start + header.postings_len as usize];
        let mut pos = 0;
        let mut seen = Vec::new();
        while pos < blob.len() {
            let (doc_index, positions) = posting::unpack_posting(blob, &mut pos).unwrap();
            seen.push((doc_index, positions));
        }
        assert_eq!(
            seen,
            vec![(0, vec![0, 4]), (1, vec![7]), (2, vec![1])]
        );
    }

    #[test]
    fn test_save_resets_for_the_next_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.shard");
        let mut shard = shard();
        assert!(add_simple(&mut shard, 9, &[(5, vec![1])]));
        let info = shard.save(&path).unwrap();
        assert!(info.bytes_written > 0);
        assert_eq!(shard.total_doc_count(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), info.bytes_written);
    }

    #[test]
    fn test_load_restores_an_appendable_shard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.shard");
        let mut shard = shard();
        assert!(add_simple(&mut shard, 1, &[(50, vec![0, 3]), (60, vec![2])]));
        assert!(add_simple(&mut shard, 2, &[(50, vec![8])]));
        shard.save(&path).unwrap();

        let mut reloaded = IndexShard::load(&path, ShardConfig::default()).unwrap();
        assert_eq!(reloaded.total_doc_count(), 2);
        assert!(add_simple(&mut reloaded, 3, &[(50, vec![2])]));
        let image = reloaded.save_to_bytes().unwrap();
        let header = ShardHeader::from_bytes(&image).unwrap();
        assert_eq!(header.num_docs, 3);

        let reparsed = IndexShard::from_image(&image, ShardConfig::default()).unwrap();
        assert_eq!(reparsed.url_index.len(), 3);
    }

    #[test]
    fn test_change_document_offsets_rewrites_records() {
        let mut shard = shard();
        assert!(add_simple(&mut shard, 7, &[(5, vec![1])]));
        assert!(add_simple(&mut shard, 8, &[(5, vec![2])]));
        let mut offsets = HashMap::new();
        offsets.insert(DocKey(7u64.to_be_bytes()), 4242);
        offsets.insert(DocKey(99u64.to_be_bytes()), 1);
        assert_eq!(shard.change_document_offsets(&offsets), 1);
        assert_eq!(shard.doc_map.get(0).unwrap().unwrap().summary_offset, 4242);
    }

    #[test]
    fn test_generation_bounds_are_enforced() {
        assert!(matches!(
            IndexShard::new(MAX_GENERATION + 1, ShardConfig::default()),
            Err(IndexError::GenerationOverflow(_))
        ));
        let mut shard = shard();
        assert!(shard.set_generation(MAX_GENERATION).is_ok());
        assert!(shard.set_generation(MAX_GENERATION + 1).is_err());
    }

    #[test]
    fn test_unsorted_positions_are_sanitized() {
        let mut shard = shard();
        assert!(shard.add_document_words(
            &doc_keys(1),
            0,
            &[(key(5), vec![4, 2, 4, 9])],
            &[],
            &[],
            true,
            0
        ));
        let image = shard.save_to_bytes().unwrap();
        let header = ShardHeader::from_bytes(&image).unwrap();
        // Kept positions: 4 and 9.
        assert_eq!(header.len_all_docs, 2);
    }
}

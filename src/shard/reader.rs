//! Read-only shard access
//!
//! A reader serves lookups from a serialized shard, either fully in
//! memory or straight off disk through a small block cache. Lookups
//! narrow candidates with the first-byte prefix index, binary search
//! the sorted rows, then fan out across equal-comparing neighbors for
//! masked and shifted matches.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ShardConfig;
use crate::error::{IndexError, Result};

use super::doc_map::DocInfo;
use super::key::{WordKey, WORD_KEY_LEN};
use super::posting;
use super::scoring::{score_item, ScoreContext, ShardStats};
use super::types::{
    LookupOptions, PostingItem, PostingsRef, PrefixEntry, ShardHeader, WordInfo, COMPACT_MARKER,
    PREFIX_ENTRIES, PREFIX_INDEX_LEN, SHARD_HEADER_LEN, WORD_ROW_LEN,
};

enum Backing {
    Memory(Vec<u8>),
    Disk {
        file: Mutex<File>,
        cache: Mutex<HashMap<u64, Arc<Vec<u8>>>>,
    },
}

/// Read-only view of one serialized shard.
pub struct ShardReader {
    header: ShardHeader,
    prefix: Vec<PrefixEntry>,
    backing: Backing,
    config: ShardConfig,
    rows_start: u64,
    blob_start: u64,
    docs_start: u64,
    total_len: u64,
}

impl ShardReader {
    /// Open a shard file for cached, block-at-a-time reads.
    pub fn open(path: &Path, config: ShardConfig) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut head = [0u8; SHARD_HEADER_LEN];
        file.read_exact(&mut head)?;
        let header = ShardHeader::from_bytes(&head)?;
        let file_len = file.metadata()?.len();
        if file_len != header.total_len() {
            return Err(IndexError::ShardHeader(format!(
                "sections sum to {} bytes but the file is {}",
                header.total_len(),
                file_len
            )));
        }
        let mut prefix_bytes = vec![0u8; header.prefix_len as usize];
        file.read_exact(&mut prefix_bytes)?;
        Self::assemble(
            header,
            &prefix_bytes,
            Backing::Disk {
                file: Mutex::new(file),
                cache: Mutex::new(HashMap::new()),
            },
            config,
        )
    }

    /// Wrap an in-memory shard image.
    pub fn from_bytes(data: Vec<u8>, config: ShardConfig) -> Result<Self> {
        let header = ShardHeader::from_bytes(&data)?;
        if header.total_len() != data.len() as u64 {
            return Err(IndexError::ShardHeader(format!(
                "sections sum to {} bytes but the image is {}",
                header.total_len(),
                data.len()
            )));
        }
        let prefix_bytes =
            data[SHARD_HEADER_LEN..SHARD_HEADER_LEN + header.prefix_len as usize].to_vec();
        Self::assemble(header, &prefix_bytes, Backing::Memory(data), config)
    }

    fn assemble(
        header: ShardHeader,
        prefix_bytes: &[u8],
        backing: Backing,
        config: ShardConfig,
    ) -> Result<Self> {
        if header.prefix_len as usize != PREFIX_INDEX_LEN {
            return Err(IndexError::ShardHeader(format!(
                "prefix index is {} bytes, expected {}",
                header.prefix_len, PREFIX_INDEX_LEN
            )));
        }
        let prefix = prefix_bytes
            .chunks_exact(8)
            .map(PrefixEntry::read_from)
            .collect::<Vec<_>>();
        debug_assert_eq!(prefix.len(), PREFIX_ENTRIES);
        let rows_start = (SHARD_HEADER_LEN + PREFIX_INDEX_LEN) as u64;
        let blob_start = rows_start + u64::from(header.words_len);
        let docs_start = blob_start + u64::from(header.postings_len);
        Ok(ShardReader {
            total_len: header.total_len(),
            header,
            prefix,
            backing,
            config,
            rows_start,
            blob_start,
            docs_start,
        })
    }

    pub fn header(&self) -> &ShardHeader {
        &self.header
    }

    pub fn generation(&self) -> u32 {
        self.header.generation
    }

    pub fn row_count(&self) -> u32 {
        (self.header.words_len as usize / WORD_ROW_LEN) as u32
    }

    /// Corpus counts used by the scorer.
    pub fn stats(&self) -> ShardStats {
        ShardStats {
            num_docs: self.header.num_docs,
            num_link_docs: self.header.num_link_docs,
            len_all_docs: self.header.len_all_docs,
            len_all_link_docs: self.header.len_all_link_docs,
        }
    }

    /// Locate a word's postings. IO and parse failures degrade to a miss
    /// with a logged warning.
    pub fn get_word_info(&self, key: &WordKey, options: &LookupOptions) -> Option<WordInfo> {
        match self.find_word(key, options) {
            Ok(found) => found,
            Err(err) => {
                warn!(error = %err, key = %key, "word lookup failed");
                None
            }
        }
    }

    fn find_word(&self, key: &WordKey, options: &LookupOptions) -> Result<Option<WordInfo>> {
        let row_count = self.row_count();
        if row_count == 0 {
            return Ok(None);
        }
        // The prefix index narrows by first byte, which a shift of 56 or
        // more would blur away.
        let (mut lo, mut hi) = if options.shift < 56 {
            let entry = self.prefix[key.first_byte() as usize];
            if entry.is_absent() {
                return Ok(None);
            }
            (entry.first, entry.first.saturating_add(entry.count))
        } else {
            (0, row_count)
        };
        hi = hi.min(row_count);
        lo = lo.min(hi);

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let row = self.row_bytes(mid)?;
            match key.cmp_stored(&row_key(&row), options.shift, options.exact) {
                std::cmp::Ordering::Greater => lo = mid + 1,
                std::cmp::Ordering::Less => hi = mid,
                std::cmp::Ordering::Equal => return self.fan_out(key, options, mid),
            }
        }
        Ok(None)
    }

    /// Scan the run of equal-comparing rows around `mid` for the first
    /// candidate the options accept.
    fn fan_out(
        &self,
        key: &WordKey,
        options: &LookupOptions,
        mid: u32,
    ) -> Result<Option<WordInfo>> {
        let row_count = self.row_count();
        let mut start = mid;
        while start > 0 {
            let row = self.row_bytes(start - 1)?;
            if key.cmp_stored(&row_key(&row), options.shift, options.exact)
                != std::cmp::Ordering::Equal
            {
                break;
            }
            start -= 1;
        }
        let mut idx = start;
        while idx < row_count {
            let row = self.row_bytes(idx)?;
            let candidate = row_key(&row);
            if key.cmp_stored(&candidate, options.shift, options.exact)
                != std::cmp::Ordering::Equal
            {
                break;
            }
            if key.matches_stored(&candidate, options.shift, options.exact, options.mask.as_ref())
            {
                return Ok(Some(WordInfo {
                    postings: row_postings(&row),
                    matched_key: WordKey::from_bytes(candidate),
                }));
            }
            idx += 1;
        }
        Ok(None)
    }

    /// Decode up to `want` scored items, resuming at `*cursor` (a
    /// blob-relative offset, zero to start) and leaving it at the next
    /// unread posting. Corrupt stretches are skipped with a warning.
    pub fn get_postings_slice(
        &self,
        postings: &PostingsRef,
        cursor: &mut u32,
        want: usize,
        ctx: &ScoreContext,
    ) -> Vec<PostingItem> {
        match self.postings_slice_inner(postings, cursor, want, ctx) {
            Ok(items) => items,
            Err(err) => {
                warn!(error = %err, "posting slice failed");
                Vec::new()
            }
        }
    }

    fn postings_slice_inner(
        &self,
        postings: &PostingsRef,
        cursor: &mut u32,
        want: usize,
        ctx: &ScoreContext,
    ) -> Result<Vec<PostingItem>> {
        let docs_with_word = postings.count();
        match *postings {
            PostingsRef::Inline { doc_index, position } => {
                if *cursor != 0 || want == 0 {
                    return Ok(Vec::new());
                }
                *cursor = 1;
                Ok(self
                    .make_item(doc_index, vec![position], docs_with_word, ctx)?
                    .into_iter()
                    .collect())
            }
            PostingsRef::Extent { first_offset, last_offset, .. } => {
                let bytes = self.extent_bytes(first_offset, last_offset)?;
                let mut rel = (*cursor).saturating_sub(first_offset) as usize;
                let mut items = Vec::new();
                while rel < bytes.len() && items.len() < want {
                    let start = rel;
                    match posting::unpack_posting(&bytes, &mut rel) {
                        Ok((doc_index, positions)) => {
                            if let Some(item) =
                                self.make_item(doc_index, positions, docs_with_word, ctx)?
                            {
                                items.push(item);
                            }
                        }
                        Err(err) => {
                            warn!(
                                error = %err,
                                offset = first_offset + start as u32,
                                "skipping corrupt posting"
                            );
                            match posting::next_posting_offset(&bytes, start + posting::RESYNC_STEP)
                            {
                                Some(next) => rel = next,
                                None => {
                                    rel = bytes.len();
                                    break;
                                }
                            }
                        }
                    }
                }
                *cursor = first_offset + rel as u32;
                Ok(items)
            }
        }
    }

    /// Galloping advance: the first posting at or past `cursor` whose
    /// document index is at least `target_doc`. Returns its blob offset
    /// and document index.
    pub fn next_posting_offset_doc_offset(
        &self,
        postings: &PostingsRef,
        cursor: u32,
        target_doc: u32,
    ) -> Option<(u32, u32)> {
        match *postings {
            PostingsRef::Inline { doc_index, .. } => {
                if cursor == 0 && doc_index >= target_doc {
                    Some((0, doc_index))
                } else {
                    None
                }
            }
            PostingsRef::Extent { first_offset, last_offset, .. } => {
                let bytes = match self.extent_bytes(first_offset, last_offset) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(error = %err, "posting seek failed");
                        return None;
                    }
                };
                let rel = cursor.saturating_sub(first_offset) as usize;
                match posting::seek_doc_index(&bytes, rel, target_doc) {
                    Ok(hit) => hit.map(|(offset, doc)| (first_offset + offset as u32, doc)),
                    Err(err) => {
                        warn!(error = %err, "posting seek failed");
                        None
                    }
                }
            }
        }
    }

    /// The raw bytes of a postings extent.
    pub fn extent_bytes(&self, first_offset: u32, last_offset: u32) -> Result<Cow<'_, [u8]>> {
        if last_offset < first_offset || last_offset > self.header.postings_len {
            return Err(IndexError::CorruptRecord {
                context: "posting extent bounds",
                offset: u64::from(first_offset),
            });
        }
        self.read_bytes(
            self.blob_start + u64::from(first_offset),
            (last_offset - first_offset) as usize,
        )
    }

    /// Stored record for a document index, if the index is in range.
    pub fn doc_info(&self, doc_index: u32) -> Result<Option<DocInfo>> {
        if doc_index >= self.header.doc_total() {
            return Ok(None);
        }
        let entry = self.read_bytes(self.docs_start + u64::from(doc_index) * 4, 4)?;
        let rel = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
        let table_len = u64::from(self.header.doc_total()) * 4;
        let record_at = self.docs_start + table_len + u64::from(rel);

        let head = self.read_bytes(record_at, 9)?;
        let key_count = head[8] as usize;
        let record = self.read_bytes(record_at, 9 + key_count * 8)?;
        let (info, _) = DocInfo::parse(&record, 0, self.config.max_doc_keys)?;
        Ok(Some(info))
    }

    fn make_item(
        &self,
        doc_index: u32,
        positions: Vec<u32>,
        docs_with_word: u32,
        ctx: &ScoreContext,
    ) -> Result<Option<PostingItem>> {
        let Some(info) = self.doc_info(doc_index)? else {
            warn!(doc_index, "posting points at a missing doc record");
            return Ok(None);
        };
        let mut item = PostingItem {
            doc_key: info.doc_key(),
            key_count: info.keys.len() as u8,
            doc_index,
            positions,
            doc_len: info.doc_len,
            rank: info.rank,
            is_doc: info.is_doc,
            relevance: 0.0,
            score: 0.0,
        };
        score_item(&mut item, docs_with_word, &self.stats(), ctx);
        Ok(Some(item))
    }

    /// Iterate every stored row in key order.
    pub fn row_entries(&self) -> RowEntries<'_> {
        RowEntries {
            reader: self,
            next_row: 0,
            row_count: self.row_count(),
        }
    }

    fn row_bytes(&self, row_index: u32) -> Result<[u8; WORD_ROW_LEN]> {
        let at = self.rows_start + u64::from(row_index) * WORD_ROW_LEN as u64;
        let bytes = self.read_bytes(at, WORD_ROW_LEN)?;
        let mut row = [0u8; WORD_ROW_LEN];
        row.copy_from_slice(&bytes);
        Ok(row)
    }

    fn read_bytes(&self, offset: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        if len == 0 {
            return Ok(Cow::Borrowed(&[]));
        }
        if offset + len as u64 > self.total_len {
            return Err(IndexError::CorruptRecord {
                context: "shard read out of bounds",
                offset,
            });
        }
        match &self.backing {
            Backing::Memory(data) => {
                Ok(Cow::Borrowed(&data[offset as usize..offset as usize + len]))
            }
            Backing::Disk { file, cache } => {
                let block_size = self.config.block_size as u64;
                let first_block = offset / block_size;
                let last_block = (offset + len as u64 - 1) / block_size;
                let mut out = Vec::with_capacity(len);
                for block_index in first_block..=last_block {
                    let block = self.cached_block(file, cache, block_index)?;
                    let block_start = block_index * block_size;
                    let from = offset.max(block_start) - block_start;
                    let to = (offset + len as u64).min(block_start + block.len() as u64);
                    if to <= block_start + from {
                        break;
                    }
                    out.extend_from_slice(&block[from as usize..(to - block_start) as usize]);
                }
                if out.len() != len {
                    return Err(IndexError::CorruptRecord {
                        context: "short shard read",
                        offset,
                    });
                }
                Ok(Cow::Owned(out))
            }
        }
    }

    fn cached_block(
        &self,
        file: &Mutex<File>,
        cache: &Mutex<HashMap<u64, Arc<Vec<u8>>>>,
        block_index: u64,
    ) -> Result<Arc<Vec<u8>>> {
        if let Some(block) = cache.lock().get(&block_index) {
            return Ok(Arc::clone(block));
        }
        let block_size = self.config.block_size;
        let mut buf = vec![0u8; block_size];
        {
            let mut file = file.lock();
            file.seek(SeekFrom::Start(block_index * block_size as u64))?;
            let mut filled = 0;
            while filled < block_size {
                let n = file.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
        }
        let block = Arc::new(buf);
        let mut cache = cache.lock();
        if cache.len() >= self.config.max_cached_blocks {
            debug!(blocks = cache.len(), "purged shard block cache");
            cache.clear();
        }
        cache.insert(block_index, Arc::clone(&block));
        Ok(block)
    }
}

/// Iterator over `(key, postings)` pairs of every stored row.
pub struct RowEntries<'a> {
    reader: &'a ShardReader,
    next_row: u32,
    row_count: u32,
}

impl Iterator for RowEntries<'_> {
    type Item = Result<(WordKey, PostingsRef)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_row >= self.row_count {
            return None;
        }
        let row = match self.reader.row_bytes(self.next_row) {
            Ok(row) => row,
            Err(err) => {
                self.next_row = self.row_count;
                return Some(Err(err));
            }
        };
        self.next_row += 1;
        Some(Ok((WordKey::from_bytes(row_key(&row)), row_postings(&row))))
    }
}

fn row_key(row: &[u8; WORD_ROW_LEN]) -> [u8; WORD_KEY_LEN] {
    let mut key = [0u8; WORD_KEY_LEN];
    key.copy_from_slice(&row[..WORD_KEY_LEN]);
    key
}

fn row_postings(row: &[u8; WORD_ROW_LEN]) -> PostingsRef {
    let field = |i: usize| {
        let at = WORD_KEY_LEN + i * 4;
        u32::from_be_bytes([row[at], row[at + 1], row[at + 2], row[at + 3]])
    };
    let first = field(0);
    if first == COMPACT_MARKER {
        PostingsRef::unpack_inline(field(1))
    } else {
        PostingsRef::Extent {
            first_offset: first,
            last_offset: first.saturating_add(field(1)),
            count: field(2),
        }
    }
}
